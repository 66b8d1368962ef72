//! In-process mock of ACS and the SharePoint REST endpoints used by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;

use crate::config_store::{ConfigStore, InternalTenant, TenantDefaults};
use crate::connection::Endpoints;
use crate::registry::SiteRegistry;

/// Serializes tests that read or mutate process environment variables.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// SAFETY: callers must hold `ENV_LOCK`.
pub unsafe fn set_env(key: &str, val: &str) {
    unsafe { std::env::set_var(key, val) };
}

/// SAFETY: callers must hold `ENV_LOCK`.
pub unsafe fn remove_env(key: &str) {
    unsafe { std::env::remove_var(key) };
}

pub fn internal_tenant() -> InternalTenant {
    InternalTenant {
        domain: "contoso.sharepoint.com".into(),
        tenant_id: "internal-tenant".into(),
    }
}

/// One request as the mock saw it. `path` is still percent-encoded.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn is_token_request(&self) -> bool {
        self.path.ends_with("/tokens/OAuth/2")
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn authorization(&self) -> Option<String> {
        self.header("authorization")
    }

    /// Decode a form-encoded body.
    pub fn form(&self) -> HashMap<String, String> {
        serde_urlencoded::from_bytes(&self.body).unwrap()
    }
}

struct MockState {
    requests: Mutex<Vec<Recorded>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    issued: AtomicUsize,
    token_status: AtomicU16,
    token_lifetime: AtomicU64,
    probe_status: AtomicU16,
    folder_status: AtomicU16,
    interrupt_downloads: AtomicBool,
}

pub struct MockSharePoint {
    pub url: String,
    state: Arc<MockState>,
}

impl MockSharePoint {
    /// Start the mock on an ephemeral port. Tokens are "token-1", "token-2", ...
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            requests: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            issued: AtomicUsize::new(0),
            token_status: AtomicU16::new(200),
            token_lifetime: AtomicU64::new(3600),
            probe_status: AtomicU16::new(200),
            folder_status: AtomicU16::new(201),
            interrupt_downloads: AtomicBool::new(false),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new().fallback(handle).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    /// Token authority and REST root both point at the mock.
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            authority: self.url.clone(),
            site_root: Some(self.url.clone()),
        }
    }

    /// Registry over a fresh config file in `dir`, with the internal tenant supplied as overrides.
    pub async fn registry(&self, dir: &tempfile::TempDir) -> SiteRegistry {
        let tenant = internal_tenant();
        let store = ConfigStore::load_with_overrides(
            dir.path().join("sharepoint.toml"),
            TenantDefaults {
                domain: Some(tenant.domain),
                tenant_id: Some(tenant.tenant_id),
            },
        )
        .await
        .unwrap();
        SiteRegistry::builder()
            .store(Arc::new(store))
            .authority(&self.url)
            .site_root(&self.url)
            .build()
            .await
            .unwrap()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn token_requests(&self) -> usize {
        self.requests().iter().filter(|r| r.is_token_request()).count()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.files.lock().unwrap().clone()
    }

    pub fn put_file(&self, name: &str, contents: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_owned(), contents.to_vec());
    }

    pub fn set_token_status(&self, status: u16) {
        self.state.token_status.store(status, Ordering::SeqCst);
    }

    pub fn set_token_lifetime(&self, secs: u64) {
        self.state.token_lifetime.store(secs, Ordering::SeqCst);
    }

    pub fn set_probe_status(&self, status: u16) {
        self.state.probe_status.store(status, Ordering::SeqCst);
    }

    pub fn set_folder_status(&self, status: u16) {
        self.state.folder_status.store(status, Ordering::SeqCst);
    }

    /// Make file downloads send part of the body and then drop the connection.
    pub fn set_interrupt_downloads(&self, interrupt: bool) {
        self.state.interrupt_downloads.store(interrupt, Ordering::SeqCst);
    }
}

async fn handle(State(state): State<Arc<MockState>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec();
    state.requests.lock().unwrap().push(Recorded {
        method: method.to_string(),
        path: path.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });

    if method == Method::POST && path.ends_with("/tokens/OAuth/2") {
        return issue_token(&state);
    }

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer token-"));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    }

    let Some(rest) = path.strip_prefix("/sites/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (site, api) = rest.split_once('/').unwrap_or((rest, ""));

    match (method, api) {
        (Method::GET, "_api/web") => status(state.probe_status.load(Ordering::SeqCst)).into_response(),
        (Method::POST, "_api/web/folders") => {
            let code = status(state.folder_status.load(Ordering::SeqCst));
            (code, axum::Json(serde_json::json!({"d": {"__metadata": {"type": "SP.Folder"}}})))
                .into_response()
        }
        (Method::POST, _) if headers.get("x-http-method").is_some_and(|v| v == "DELETE") => {
            StatusCode::OK.into_response()
        }
        (Method::POST, api) if api.contains("/Files/add(url='") => {
            let name = between(api, "add(url='", "',").unwrap_or_default();
            state.files.lock().unwrap().insert(decode(&name), body);
            axum::Json(serde_json::json!({"d": {"Name": decode(&name)}})).into_response()
        }
        (Method::GET, api) if api.ends_with("')/Files") => {
            let folder = decode(&between(api, "Url('", "')").unwrap_or_default());
            let results: Vec<_> = state
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(name, contents)| {
                    serde_json::json!({
                        "Name": name,
                        "ServerRelativeUrl": format!("/sites/{site}/{folder}/{name}"),
                        "Length": contents.len().to_string(),
                    })
                })
                .collect();
            axum::Json(serde_json::json!({"d": {"results": results}})).into_response()
        }
        (Method::GET, api) if api.ends_with("/$value") => {
            // Files('name')/$value or GetFileByServerRelativeUrl('folder/name')/$value
            let literal = between(api, "Files('", "')")
                .or_else(|| between(api, "Url('", "')"))
                .unwrap_or_default();
            let decoded = decode(&literal);
            let name = decoded.rsplit('/').next().unwrap_or_default();
            let contents = state.files.lock().unwrap().get(name).cloned();
            match contents {
                Some(_) if state.interrupt_downloads.load(Ordering::SeqCst) => {
                    let chunks: Vec<std::io::Result<Bytes>> = vec![
                        Ok(Bytes::from_static(b"partial")),
                        Err(std::io::Error::other("connection dropped")),
                    ];
                    Body::from_stream(futures_util::stream::iter(chunks)).into_response()
                }
                Some(contents) => contents.into_response(),
                None => (StatusCode::NOT_FOUND, "File Not Found.").into_response(),
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn issue_token(state: &MockState) -> Response {
    let code = state.token_status.load(Ordering::SeqCst);
    if code != 200 {
        return (status(code), axum::Json(serde_json::json!({"error": "invalid_client"})))
            .into_response();
    }
    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    axum::Json(serde_json::json!({
        "token_type": "Bearer",
        "expires_in": state.token_lifetime.load(Ordering::SeqCst).to_string(),
        "access_token": format!("token-{n}"),
    }))
    .into_response()
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

fn between(haystack: &str, start: &str, end: &str) -> Option<String> {
    let from = haystack.find(start)? + start.len();
    let to = haystack[from..].find(end)? + from;
    Some(haystack[from..to].to_owned())
}

/// Percent-decode a path component.
fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
