//! Common types for the SharePoint site client

mod error;
mod lenient;
mod secret;

pub use error::{Error, Result};
pub use lenient::lenient_u64;
pub use secret::Secret;
