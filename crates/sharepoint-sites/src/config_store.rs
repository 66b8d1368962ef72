//! Site configuration storage
//!
//! Manages a TOML file with one table per SharePoint site, keyed by site
//! name. The reserved `[DEFAULT]` table holds the internal tenant that sites
//! without their own `domain`/`tenant_id` fall back to:
//!
//! ```toml
//! [DEFAULT]
//! domain = "contoso.sharepoint.com"
//! tenant_id = "0f6c..."
//!
//! [site_1]
//! client_id = "1234..."
//! client_secret = "fylth..."
//!
//! [ext_site]
//! client_id = "456..."
//! client_secret = "xyz..."
//! domain = "partner.sharepoint.com"
//! tenant_id = "9730..."
//! ```
//!
//! All writes use atomic temp-file + rename, and the file is kept at 0600
//! since it holds client secrets. A tokio Mutex serializes writers, and the
//! in-memory state only changes once the new file is in place.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::{Error, Result, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Reserved table name for the internal tenant.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Env var naming the config file when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "SHAREPOINT_CONFIG";

/// Env var overriding the internal tenant's domain.
pub const DOMAIN_ENV: &str = "SHAREPOINT_DOMAIN";

/// Env var overriding the internal tenant's ID.
pub const TENANT_ID_ENV: &str = "SHAREPOINT_TENANT_ID";

/// Config file used when neither a path nor `SHAREPOINT_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "sharepoint.toml";

/// Credentials and tenant placement for one SharePoint site.
///
/// A site with both `domain` and `tenant_id` is external; a site with
/// neither is internal and uses the `[DEFAULT]` tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub site_name: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub domain: Option<String>,
    pub tenant_id: Option<String>,
}

impl SiteConfig {
    /// A site on the internal (default) tenant.
    pub fn internal(
        site_name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            domain: None,
            tenant_id: None,
        }
    }

    /// A site on another tenant, with its own domain and tenant ID.
    pub fn external(
        site_name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<Secret<String>>,
        domain: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: Some(domain.into()),
            tenant_id: Some(tenant_id.into()),
            ..Self::internal(site_name, client_id, client_secret)
        }
    }

    pub fn is_external(&self) -> bool {
        self.domain.is_some() && self.tenant_id.is_some()
    }

    /// Check the registration invariants, returning the reason on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.site_name.trim().is_empty() {
            return Err("site name must not be empty".into());
        }
        if self.site_name == DEFAULT_SECTION {
            return Err(format!("{DEFAULT_SECTION} is reserved for the internal tenant"));
        }
        if self.site_name.contains('/') {
            return Err(format!("site name {:?} must not contain '/'", self.site_name));
        }
        if self.client_id.trim().is_empty() {
            return Err("client_id must not be empty".into());
        }
        if self.client_secret.expose().is_empty() {
            return Err("client_secret must not be empty".into());
        }
        match (&self.domain, &self.tenant_id) {
            (Some(_), None) => Err("domain is set but tenant_id is missing".into()),
            (None, Some(_)) => Err("tenant_id is set but domain is missing".into()),
            (Some(d), Some(t)) if d.trim().is_empty() || t.trim().is_empty() => {
                Err("domain and tenant_id must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// The tenant internal sites resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTenant {
    pub domain: String,
    pub tenant_id: String,
}

/// Partially specified internal tenant, as found in `[DEFAULT]` or the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl TenantDefaults {
    /// Read `SHAREPOINT_DOMAIN` / `SHAREPOINT_TENANT_ID`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        Self {
            domain: read(DOMAIN_ENV),
            tenant_id: read(TENANT_ID_ENV),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_none() && self.tenant_id.is_none()
    }

    /// Field-wise overlay: values in `over` win.
    pub fn overlay(&self, over: &TenantDefaults) -> TenantDefaults {
        TenantDefaults {
            domain: over.domain.clone().or_else(|| self.domain.clone()),
            tenant_id: over.tenant_id.clone().or_else(|| self.tenant_id.clone()),
        }
    }

    /// Both halves present, or nothing.
    pub fn resolve(&self) -> Option<InternalTenant> {
        Some(InternalTenant {
            domain: self.domain.clone()?,
            tenant_id: self.tenant_id.clone()?,
        })
    }
}

/// On-disk shape of a site table.
#[derive(Deserialize)]
struct SiteSection {
    client_id: String,
    client_secret: Secret<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

#[derive(Serialize)]
struct SiteSectionRef<'a> {
    client_id: &'a str,
    client_secret: &'a Secret<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

impl<'a> From<&'a SiteConfig> for SiteSectionRef<'a> {
    fn from(config: &'a SiteConfig) -> Self {
        Self {
            client_id: &config.client_id,
            client_secret: &config.client_secret,
            domain: config.domain.as_deref(),
            tenant_id: config.tenant_id.as_deref(),
        }
    }
}

#[derive(Clone, Default)]
struct State {
    defaults: TenantDefaults,
    sites: BTreeMap<String, SiteConfig>,
}

/// Boxed future returned by `SiteStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key-value persistence for site configurations.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn SiteStore>`).
pub trait SiteStore: Send + Sync {
    /// Look up one site. Absent sites fail with `Error::MissingSite`.
    fn site<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Result<SiteConfig>>;

    /// All configured sites, keyed by name.
    fn sites(&self) -> StoreFuture<'_, BTreeMap<String, SiteConfig>>;

    /// Insert or overwrite a site and persist.
    fn save(&self, config: SiteConfig) -> StoreFuture<'_, Result<()>>;

    /// The effective internal tenant, if fully configured.
    fn internal_tenant(&self) -> StoreFuture<'_, Option<InternalTenant>>;
}

/// File-backed site configuration store.
pub struct ConfigStore {
    path: PathBuf,
    overrides: TenantDefaults,
    state: Mutex<State>,
}

impl ConfigStore {
    /// Load site configurations from `path`, overlaying the internal tenant
    /// from `SHAREPOINT_DOMAIN` / `SHAREPOINT_TENANT_ID`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        Self::load_with_overrides(path, TenantDefaults::from_env()).await
    }

    /// Load with explicit internal-tenant overrides instead of the environment.
    ///
    /// If the file doesn't exist, creates it empty (cold start with zero sites).
    pub async fn load_with_overrides(path: PathBuf, overrides: TenantDefaults) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path).await?;
            let state = parse(&contents)?;
            info!(path = %path.display(), sites = state.sites.len(), "loaded site configuration");
            state
        } else {
            info!(path = %path.display(), "site configuration not found, starting with empty store");
            let state = State::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            overrides,
            state: Mutex::new(state),
        })
    }

    /// Resolve the config file path from an explicit argument or `SHAREPOINT_CONFIG`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Get a clone of one site's configuration.
    pub async fn site(&self, name: &str) -> Result<SiteConfig> {
        let state = self.state.lock().await;
        state
            .sites
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingSite(name.to_owned()))
    }

    /// Clone of the full site mapping.
    pub async fn sites(&self) -> BTreeMap<String, SiteConfig> {
        self.state.lock().await.sites.clone()
    }

    /// Sorted site names.
    pub async fn site_names(&self) -> Vec<String> {
        self.state.lock().await.sites.keys().cloned().collect()
    }

    /// Add or replace a site and persist to disk.
    pub async fn save(&self, config: SiteConfig) -> Result<()> {
        config
            .validate()
            .map_err(|reason| Error::Config(format!("site {}: {reason}", config.site_name)))?;

        let mut state = self.state.lock().await;
        let site = config.site_name.clone();
        let mut next = state.clone();
        let replaced = next.sites.insert(site.clone(), config).is_some();
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(site, replaced, "saved site configuration");
        Ok(())
    }

    /// Remove a site and persist. Returns the removed entry if it existed.
    pub async fn remove(&self, name: &str) -> Result<Option<SiteConfig>> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let removed = next.sites.remove(name);
        if removed.is_some() {
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(site = name, "removed site configuration");
        }
        Ok(removed)
    }

    /// Effective internal tenant: `[DEFAULT]` overlaid with the overrides.
    pub async fn internal_tenant(&self) -> Option<InternalTenant> {
        let state = self.state.lock().await;
        state.defaults.overlay(&self.overrides).resolve()
    }

    /// Replace the `[DEFAULT]` section and persist.
    pub async fn set_internal_tenant(&self, tenant: InternalTenant) -> Result<()> {
        let mut state = self.state.lock().await;
        let next = State {
            defaults: TenantDefaults {
                domain: Some(tenant.domain),
                tenant_id: Some(tenant.tenant_id),
            },
            sites: state.sites.clone(),
        };
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!("saved internal tenant");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sites.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SiteStore for ConfigStore {
    fn site<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Result<SiteConfig>> {
        Box::pin(ConfigStore::site(self, name))
    }

    fn sites(&self) -> StoreFuture<'_, BTreeMap<String, SiteConfig>> {
        Box::pin(ConfigStore::sites(self))
    }

    fn save(&self, config: SiteConfig) -> StoreFuture<'_, Result<()>> {
        Box::pin(ConfigStore::save(self, config))
    }

    fn internal_tenant(&self) -> StoreFuture<'_, Option<InternalTenant>> {
        Box::pin(ConfigStore::internal_tenant(self))
    }
}

fn parse(contents: &str) -> Result<State> {
    let table: toml::Table = toml::from_str(contents)?;
    let mut state = State::default();

    for (name, value) in table {
        if !value.is_table() {
            return Err(Error::Config(format!(
                "top-level key {name:?} must be a site table"
            )));
        }

        if name == DEFAULT_SECTION {
            state.defaults = value
                .try_into()
                .map_err(|e| Error::Config(format!("[{DEFAULT_SECTION}]: {e}")))?;
            continue;
        }

        let section: SiteSection = value
            .try_into()
            .map_err(|e| Error::Config(format!("site {name}: {e}")))?;
        let config = SiteConfig {
            site_name: name.clone(),
            client_id: section.client_id,
            client_secret: section.client_secret,
            domain: section.domain,
            tenant_id: section.tenant_id,
        };
        config
            .validate()
            .map_err(|reason| Error::Config(format!("site {name}: {reason}")))?;
        state.sites.insert(name, config);
    }

    Ok(state)
}

fn render(state: &State) -> Result<String> {
    let mut table = toml::Table::new();
    if !state.defaults.is_empty() {
        table.insert(
            DEFAULT_SECTION.to_owned(),
            toml::Value::try_from(&state.defaults)?,
        );
    }
    for (name, config) in &state.sites {
        table.insert(name.clone(), toml::Value::try_from(SiteSectionRef::from(config))?);
    }
    Ok(toml::to_string(&table)?)
}

/// Write the store to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file contains client
/// secrets. The temporary file is removed if any step fails.
async fn write_atomic(path: &Path, state: &State) -> Result<()> {
    let contents = render(state)?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Config("config path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_CONFIG_FILE);
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    if let Err(e) = replace_with(&tmp_path, path, contents.as_bytes()).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), "persisted site configuration");
    Ok(())
}

async fn replace_with(tmp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms).await?;
    }

    tokio::fs::rename(tmp_path, path).await
}
