//! Site registry and builder
//!
//! The registry is the entry point: it loads the config store, hands out
//! shared `SiteConnection`s by site name, and registers new sites. One
//! connection per site name is kept, so its token is reused by every caller
//! that looks the site up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config_store::{ConfigStore, SiteConfig, SiteStore};
use crate::connection::{Endpoints, SiteConnection};
use crate::error::{Error, Result};

/// Builder for `SiteRegistry`.
#[derive(Default)]
pub struct SiteRegistryBuilder {
    config_path: Option<PathBuf>,
    store: Option<Arc<dyn SiteStore>>,
    http_client: Option<reqwest::Client>,
    endpoints: Endpoints,
}

impl SiteRegistryBuilder {
    /// Config file to load. Defaults to `SHAREPOINT_CONFIG`, then `sharepoint.toml`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Use an already-loaded store instead of reading a config file.
    pub fn store(mut self, store: Arc<dyn SiteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// HTTP client shared by every connection. Timeouts configured on it apply to all calls.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Token authority base URL.
    pub fn authority(mut self, url: impl Into<String>) -> Self {
        self.endpoints.authority = url.into();
        self
    }

    /// REST root replacing `https://{domain}`.
    pub fn site_root(mut self, url: impl Into<String>) -> Self {
        self.endpoints.site_root = Some(url.into());
        self
    }

    pub async fn build(self) -> Result<SiteRegistry> {
        let store: Arc<dyn SiteStore> = match self.store {
            Some(store) => store,
            None => {
                let path = ConfigStore::resolve_path(self.config_path.as_deref());
                Arc::new(ConfigStore::load(path).await?)
            }
        };

        let sites = store.sites().await.len();
        info!(sites, authority = %self.endpoints.authority, "site registry ready");

        Ok(SiteRegistry {
            store,
            http: self.http_client.unwrap_or_default(),
            endpoints: self.endpoints,
            connections: RwLock::new(HashMap::new()),
        })
    }
}

/// Registry of configured SharePoint sites.
pub struct SiteRegistry {
    store: Arc<dyn SiteStore>,
    http: reqwest::Client,
    endpoints: Endpoints,
    connections: RwLock<HashMap<String, Arc<SiteConnection>>>,
}

impl SiteRegistry {
    pub fn builder() -> SiteRegistryBuilder {
        SiteRegistryBuilder::default()
    }

    /// Connection for a configured site. Fails with `NotFound` if the site
    /// has no configuration. No network traffic; the token is fetched on
    /// first use.
    pub async fn get(&self, site: &str) -> Result<Arc<SiteConnection>> {
        if let Some(connection) = self.connections.read().await.get(site) {
            return Ok(connection.clone());
        }

        let config = self.store.site(site).await?;
        let connection = Arc::new(self.open(config).await?);

        let mut connections = self.connections.write().await;
        let connection = connections
            .entry(site.to_owned())
            .or_insert(connection)
            .clone();
        debug!(site, "opened site connection");
        Ok(connection)
    }

    /// `get` followed by an eager probe. Anything but 200 fails with `ConnectionRefused`.
    pub async fn connect(&self, site: &str) -> Result<Arc<SiteConnection>> {
        let connection = self.get(site).await?;
        let status = connection.connection_status().await?;
        if status != 200 {
            warn!(site, status, "connection probe failed");
            return Err(Error::ConnectionRefused(status));
        }
        Ok(connection)
    }

    /// Register (or re-register) a site and return a live connection.
    ///
    /// `domain` and `tenant_id` must both be given for an external site, or
    /// both omitted for an internal one.
    pub async fn register_site(
        &self,
        site: &str,
        client_id: &str,
        client_secret: &str,
        domain: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Arc<SiteConnection>> {
        self.register(SiteConfig {
            site_name: site.to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.into(),
            domain: domain.map(str::to_owned),
            tenant_id: tenant_id.map(str::to_owned),
        })
        .await
    }

    /// Validate, persist and open a connection for `config`.
    ///
    /// The connection is resolved before anything is written, so a site
    /// that can't be connected (e.g. internal with no default tenant) is
    /// never persisted. Replaces any cached connection for the same name.
    pub async fn register(&self, config: SiteConfig) -> Result<Arc<SiteConnection>> {
        config.validate().map_err(Error::Validation)?;

        let site = config.site_name.clone();
        let external = config.is_external();
        let connection = Arc::new(self.open(config.clone()).await?);
        self.store.save(config).await?;

        self.connections
            .write()
            .await
            .insert(site.clone(), connection.clone());
        info!(site, external, "registered site");
        Ok(connection)
    }

    /// Names of all configured sites.
    pub async fn site_names(&self) -> Vec<String> {
        self.store.sites().await.into_keys().collect()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn open(&self, config: SiteConfig) -> Result<SiteConnection> {
        let internal = self.store.internal_tenant().await;
        SiteConnection::new(config, internal.as_ref(), &self.endpoints, self.http.clone())
    }
}
