//! Authenticated connection to one SharePoint site
//!
//! A `SiteConnection` owns one site's credentials and its in-memory token.
//! Every operation goes through the same authentication step: reuse the
//! cached token while it is fresh, otherwise request a new one from ACS
//! using the site's tenant (its own when external, the internal default
//! otherwise). Tokens are never written to disk.
//!
//! REST calls use SharePoint's verbose OData dialect. Server-relative paths
//! such as `Shared Documents/folder1` are embedded as OData string literals.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use sharepoint_auth::{ACS_AUTHORITY, CachedToken, ClientCredentials};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config_store::{InternalTenant, SiteConfig};
use crate::error::{Error, Result};
use crate::metrics;

/// `Accept` / `Content-Type` for SharePoint's verbose OData responses.
pub const ODATA_VERBOSE: &str = "application/json;odata=verbose";

/// Characters that would end an OData literal's path segment early.
const ODATA_LITERAL: &AsciiSet = &CONTROLS.add(b'%').add(b'#').add(b'?');

/// Characters escaped in the `/sites/{name}` segment.
const SITE_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Where tokens and REST calls are sent.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Token authority, `https://accounts.accesscontrol.windows.net` by default.
    pub authority: String,
    /// Replaces `https://{domain}` as the REST root when set.
    pub site_root: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            authority: ACS_AUTHORITY.to_string(),
            site_root: None,
        }
    }
}

/// A file entry from a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ServerRelativeUrl", default)]
    pub server_relative_url: String,
    #[serde(rename = "Length", default, deserialize_with = "common::lenient_u64")]
    pub length: u64,
}

/// `{"d": {"results": [...]}}`
#[derive(Deserialize)]
struct VerboseCollection<T> {
    d: VerboseResults<T>,
}

#[derive(Deserialize)]
struct VerboseResults<T> {
    results: Vec<T>,
}

/// Authenticated handle for one site.
pub struct SiteConnection {
    config: SiteConfig,
    domain: String,
    tenant_id: String,
    base_url: String,
    authority: String,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl SiteConnection {
    /// Resolve the site's tenant and REST base URL.
    ///
    /// Internal sites need `internal`; without it this fails with a config
    /// error. No network traffic happens here.
    pub fn new(
        config: SiteConfig,
        internal: Option<&InternalTenant>,
        endpoints: &Endpoints,
        http: reqwest::Client,
    ) -> Result<Self> {
        let (domain, tenant_id) = match (&config.domain, &config.tenant_id) {
            (Some(domain), Some(tenant_id)) => (domain.clone(), tenant_id.clone()),
            (None, None) => {
                let tenant = internal.ok_or_else(|| {
                    Error::Config(common::Error::Config(format!(
                        "site {} is internal but no internal tenant is configured \
                         (set [DEFAULT] domain/tenant_id or SHAREPOINT_DOMAIN/SHAREPOINT_TENANT_ID)",
                        config.site_name
                    )))
                })?;
                (tenant.domain.clone(), tenant.tenant_id.clone())
            }
            _ => {
                return Err(Error::Validation(format!(
                    "site {}: domain and tenant_id must be set together",
                    config.site_name
                )));
            }
        };

        let root = match &endpoints.site_root {
            Some(root) => root.trim_end_matches('/').to_string(),
            None => format!("https://{domain}"),
        };
        let base_url = format!(
            "{root}/sites/{}",
            utf8_percent_encode(&config.site_name, SITE_SEGMENT)
        );

        Ok(Self {
            config,
            domain,
            tenant_id,
            base_url,
            authority: endpoints.authority.clone(),
            http,
            token: Mutex::new(None),
        })
    }

    pub fn site_name(&self) -> &str {
        &self.config.site_name
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Resolved SharePoint host (the internal default for internal sites).
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn is_external(&self) -> bool {
        self.config.is_external()
    }

    /// `{root}/sites/{site_name}`, with the site name percent-encoded.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Return a fresh token, requesting one if the cache is empty or stale.
    ///
    /// The lock is held across the token request so concurrent callers
    /// sharing this connection trigger at most one request.
    async fn token(&self) -> Result<CachedToken> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.clone());
        }

        let credentials = ClientCredentials {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            tenant_id: &self.tenant_id,
            domain: &self.domain,
        };

        match sharepoint_auth::request_app_token(&self.http, &self.authority, credentials).await {
            Ok(response) => {
                metrics::record_token_request("ok");
                info!(
                    site = %self.config.site_name,
                    expires_in = response.expires_in,
                    "acquired access token"
                );
                let token = CachedToken::from(response);
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(e) => {
                let outcome = match e {
                    sharepoint_auth::Error::InvalidCredentials(_) => "rejected",
                    _ => "failed",
                };
                metrics::record_token_request(outcome);
                warn!(site = %self.config.site_name, error = %e, "token request failed");
                *cached = None;
                Err(e.into())
            }
        }
    }

    /// Attach the bearer token and OData `Accept` header.
    async fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token().await?;
        Ok(request
            .bearer_auth(token.bearer())
            .header(ACCEPT, ODATA_VERBOSE))
    }

    /// Send an authenticated request; non-2xx becomes `Error::Http`.
    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let request = self.authorized(request).await?;
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_request(operation, None);
                return Err(Error::Transport(format!("{operation}: {e}")));
            }
        };

        let status = response.status().as_u16();
        metrics::record_request(operation, Some(status));
        debug!(site = %self.config.site_name, operation, status, "SharePoint responded");

        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Http { status, body });
        }
        Ok(response)
    }

    fn folder_url(&self, folder_path: &str) -> String {
        format!(
            "{}/_api/web/GetFolderByServerRelativeUrl('{}')",
            self.base_url,
            odata_literal(folder_path)
        )
    }

    /// HTTP status of an authenticated `GET {base}/_api/web`.
    ///
    /// Any status the server answers with is returned as-is; only token
    /// and transport failures are errors.
    pub async fn connection_status(&self) -> Result<u16> {
        let url = format!("{}/_api/web", self.base_url);
        let request = self.authorized(self.http.get(url)).await?;
        let response = request.send().await.map_err(|e| {
            metrics::record_request("connection_status", None);
            Error::Transport(format!("connection_status: {e}"))
        })?;
        let status = response.status().as_u16();
        metrics::record_request("connection_status", Some(status));
        debug!(site = %self.config.site_name, status, "connection probe");
        Ok(status)
    }

    /// Create `name` under `parent_path`. Returns the response status.
    pub async fn create_folder(&self, parent_path: &str, name: &str) -> Result<u16> {
        let url = format!("{}/_api/web/folders", self.base_url);
        let payload = serde_json::json!({
            "__metadata": { "type": "SP.Folder" },
            "ServerRelativeUrl": format!("{}/{}", parent_path.trim_end_matches('/'), name),
        });
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, ODATA_VERBOSE)
            .body(payload.to_string());

        let status = self.send("create_folder", request).await?.status().as_u16();
        info!(site = %self.config.site_name, parent = parent_path, name, status, "folder created");
        Ok(status)
    }

    /// Delete the folder at `path`. Returns the response status.
    pub async fn delete_folder(&self, path: &str) -> Result<u16> {
        let request = self
            .http
            .post(self.folder_url(path))
            .header("X-HTTP-Method", "DELETE")
            .header("IF-MATCH", "*");

        let status = self.send("delete_folder", request).await?.status().as_u16();
        info!(site = %self.config.site_name, path, status, "folder deleted");
        Ok(status)
    }

    /// Upload `local_file` into `folder_path`, overwriting any file of the same name.
    ///
    /// Fails with `LocalFileNotFound` before any request if the file is missing.
    pub async fn upload_file(&self, folder_path: &str, local_file: &Path) -> Result<u16> {
        let is_file = tokio::fs::metadata(local_file)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        let file_name = local_file.file_name().and_then(|n| n.to_str());
        let (true, Some(file_name)) = (is_file, file_name) else {
            return Err(Error::LocalFileNotFound(local_file.to_path_buf()));
        };

        let contents = tokio::fs::read(local_file)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", local_file.display())))?;
        let size = contents.len();

        let url = format!(
            "{}/Files/add(url='{}',overwrite=true)",
            self.folder_url(folder_path),
            odata_literal(file_name)
        );
        let status = self
            .send("upload_file", self.http.post(url).body(contents))
            .await?
            .status()
            .as_u16();
        info!(site = %self.config.site_name, folder = folder_path, file = file_name, size, status, "file uploaded");
        Ok(status)
    }

    /// Fetch the contents of the file at server-relative `path`.
    pub async fn download_file(&self, path: &str) -> Result<Bytes> {
        let url = format!(
            "{}/_api/web/GetFileByServerRelativeUrl('{}')/$value",
            self.base_url,
            odata_literal(path)
        );
        let response = self.send("download_file", self.http.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("download_file: {e}")))?;
        debug!(site = %self.config.site_name, path, size = bytes.len(), "file downloaded");
        Ok(bytes)
    }

    /// List the files directly inside `folder_path`.
    pub async fn list_files(&self, folder_path: &str) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/Files", self.folder_url(folder_path));
        let response = self.send("list_files", self.http.get(url)).await?;
        let listing = response
            .json::<VerboseCollection<RemoteFile>>()
            .await
            .map_err(|e| Error::Transport(format!("list_files: invalid listing: {e}")))?;
        Ok(listing.d.results)
    }

    /// Download `file_name` from `folder_path` into `dest_dir/file_name`.
    ///
    /// The folder is listed first; a name not in the listing fails with
    /// `RemoteFileNotFound`. The body is streamed into a partial file that is
    /// renamed to `file_name` only once the whole body has arrived.
    pub async fn download_to(
        &self,
        folder_path: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let listing = self.list_files(folder_path).await?;
        if !listing.iter().any(|f| f.name == file_name) {
            return Err(Error::RemoteFileNotFound {
                folder: folder_path.to_string(),
                name: file_name.to_string(),
            });
        }

        let url = format!(
            "{}/Files('{}')/$value",
            self.folder_url(folder_path),
            odata_literal(file_name)
        );
        let response = self.send("download_file", self.http.get(url)).await?;

        let target = dest_dir.join(file_name);
        let partial = dest_dir.join(format!(".{file_name}.part"));
        if let Err(e) = stream_to_file(response, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &target).await.map_err(|e| {
            Error::Io(format!("moving download into {}: {e}", target.display()))
        })?;

        info!(site = %self.config.site_name, folder = folder_path, file = file_name, target = %target.display(), "file downloaded");
        Ok(target)
    }

    /// Download several files from one folder. Stops at the first failure.
    pub async fn bulk_download<I, S>(
        &self,
        folder_path: &str,
        file_names: I,
        dest_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut paths = BTreeMap::new();
        for name in file_names {
            let name = name.as_ref();
            let path = self.download_to(folder_path, name, dest_dir).await?;
            paths.insert(name.to_string(), path);
        }
        Ok(paths)
    }

    /// Upload several local files into one folder. Stops at the first failure.
    pub async fn bulk_upload<I, P>(&self, folder_path: &str, local_files: I) -> Result<Vec<u16>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut statuses = Vec::new();
        for file in local_files {
            statuses.push(self.upload_file(folder_path, file.as_ref()).await?);
        }
        Ok(statuses)
    }
}

/// Write a response body to `path` chunk by chunk.
async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<()> {
    let io_err = |e: std::io::Error| Error::Io(format!("writing {}: {e}", path.display()));
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Transport(format!("download_file: {e}")))?;
        file.write_all(&chunk).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    Ok(())
}

impl fmt::Debug for SiteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteConnection")
            .field("site", &self.config.site_name)
            .field("domain", &self.domain)
            .field("external", &self.is_external())
            .finish_non_exhaustive()
    }
}

/// Render `value` as the body of an OData string literal inside a URL path.
///
/// Single quotes are doubled; `%`, `#` and `?` are percent-encoded so they
/// can't end the path early. Spaces are left to the URL parser.
pub(crate) fn odata_literal(value: &str) -> String {
    utf8_percent_encode(&value.replace('\'', "''"), ODATA_LITERAL).to_string()
}
