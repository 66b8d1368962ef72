//! SharePoint site registry and REST client
//!
//! Keeps per-site app credentials in a TOML config file and turns them into
//! authenticated connections for folder and file operations.
//!
//! Site lifecycle:
//! 1. `SiteRegistry::builder().build()` loads the config store
//! 2. `register_site()` validates and persists a new site, or `get()` looks up an existing one
//! 3. The first operation on a `SiteConnection` requests an app-only token from ACS
//! 4. The token is reused until it is about to expire, then requested again
//! 5. Tokens live only in memory and die with the process
//!
//! ```no_run
//! # async fn demo() -> sharepoint_sites::Result<()> {
//! use sharepoint_sites::SiteRegistry;
//!
//! let registry = SiteRegistry::builder().config_path("sharepoint.toml").build().await?;
//! let site = registry.get("site_1").await?;
//! assert_eq!(site.connection_status().await?, 200);
//! site.create_folder("Shared Documents/folder1", "new_folder").await?;
//! # Ok(())
//! # }
//! ```

pub mod config_store;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use config_store::{ConfigStore, InternalTenant, SiteConfig, SiteStore, TenantDefaults};
pub use connection::{Endpoints, RemoteFile, SiteConnection};
pub use error::{Error, Result};
pub use registry::{SiteRegistry, SiteRegistryBuilder};

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;

/// Boxed future returned by `SiteOperations` methods.
pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Folder and file operations against one site.
///
/// `SiteConnection` is the production implementation; callers that only
/// need the operations can hold an `Arc<dyn SiteOperations>`.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility.
pub trait SiteOperations: Send + Sync {
    /// Site name, for logging.
    fn site_name(&self) -> &str;

    /// HTTP status of an authenticated probe of the site.
    fn connection_status(&self) -> OpFuture<'_, u16>;

    /// Create `name` under `parent_path`.
    fn create_folder<'a>(&'a self, parent_path: &'a str, name: &'a str) -> OpFuture<'a, u16>;

    /// Delete the folder at `path`.
    fn delete_folder<'a>(&'a self, path: &'a str) -> OpFuture<'a, u16>;

    /// Upload a local file into `folder_path`.
    fn upload_file<'a>(&'a self, folder_path: &'a str, local_file: &'a Path) -> OpFuture<'a, u16>;

    /// Contents of the file at server-relative `path`.
    fn download_file<'a>(&'a self, path: &'a str) -> OpFuture<'a, Bytes>;

    /// Files directly inside `folder_path`.
    fn list_files<'a>(&'a self, folder_path: &'a str) -> OpFuture<'a, Vec<RemoteFile>>;
}

impl SiteOperations for SiteConnection {
    fn site_name(&self) -> &str {
        SiteConnection::site_name(self)
    }

    fn connection_status(&self) -> OpFuture<'_, u16> {
        Box::pin(SiteConnection::connection_status(self))
    }

    fn create_folder<'a>(&'a self, parent_path: &'a str, name: &'a str) -> OpFuture<'a, u16> {
        Box::pin(SiteConnection::create_folder(self, parent_path, name))
    }

    fn delete_folder<'a>(&'a self, path: &'a str) -> OpFuture<'a, u16> {
        Box::pin(SiteConnection::delete_folder(self, path))
    }

    fn upload_file<'a>(&'a self, folder_path: &'a str, local_file: &'a Path) -> OpFuture<'a, u16> {
        Box::pin(SiteConnection::upload_file(self, folder_path, local_file))
    }

    fn download_file<'a>(&'a self, path: &'a str) -> OpFuture<'a, Bytes> {
        Box::pin(SiteConnection::download_file(self, path))
    }

    fn list_files<'a>(&'a self, folder_path: &'a str) -> OpFuture<'a, Vec<RemoteFile>> {
        Box::pin(SiteConnection::list_files(self, folder_path))
    }
}
