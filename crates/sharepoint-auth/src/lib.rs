//! SharePoint app-only authentication
//!
//! Acquires access tokens for SharePoint sites with the OAuth2
//! client-credentials grant against Azure ACS. This crate knows nothing about
//! config files or site registries; it turns one set of client credentials
//! into a bearer token with an expiry.
//!
//! Token flow:
//! 1. Caller resolves the site's tenant and domain (internal default or external)
//! 2. `token::request_app_token()` POSTs the credentials to `{authority}/{tenant}/tokens/OAuth/2`
//! 3. The response is kept as a `token::CachedToken` until it goes stale

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{CachedToken, ClientCredentials, TokenResponse, request_app_token};
