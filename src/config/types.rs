use serde::Deserialize;
use std::collections::HashMap;

// --- Constants (stock Varnish-ish defaults) ---
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "_";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576; // 1MB
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_TTL_SECS: u64 = 120;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_500;
pub const DEFAULT_FIRST_BYTE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_BETWEEN_BYTES_TIMEOUT_MS: u64 = 60_000;

fn default_true() -> bool {
    true
}

/// One upstream origin a route can be dispatched to. Stands in for a VCL
/// `backend` declaration: name plus connect/fetch timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub first_byte_timeout_ms: u64,
    pub between_bytes_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            first_byte_timeout_ms: DEFAULT_FIRST_BYTE_TIMEOUT_MS,
            between_bytes_timeout_ms: DEFAULT_BETWEEN_BYTES_TIMEOUT_MS,
        }
    }
}

/// A path-prefix rule dispatching requests to a named backend, with an
/// optional per-route cache TTL override and pass-through flag. The
/// equivalent, in this proxy, of the VCL `recv`/`hash` hook's routing
/// decision for requests that don't need custom policy code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    pub methods: Vec<String>,
    pub backend: String,
    pub ttl_secs: Option<u64>,
    /// Force every request under this prefix through `pass` instead of
    /// `lookup` (e.g. for known-uncacheable paths like `/admin`).
    pub force_pass: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ROUTE_PATH.to_string(),
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            backend: "default".to_string(),
            ttl_secs: None,
            force_pass: false,
        }
    }
}

/// Engine-tunable parameters with no direct VCL-hook equivalent — the
/// workspace sizes, timeouts and diagnostics a real deployment adjusts
/// per-box rather than per-route. Named after their `param.set` counterparts
/// in the system this crate is modeled on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    pub session_linger_ms: u64,
    pub max_restarts: u32,
    pub http_gzip_support: bool,
    pub http_req_size: usize,
    pub http_req_hdr_len: usize,
    pub http_resp_size: usize,
    pub http_max_hdr: usize,
    pub lru_timeout_secs: u64,
    pub shortlived_secs: u64,
    pub gzip_stack_buffer: usize,
    pub wthread_stats_rate: u32,
    pub diag_bitmap: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            session_linger_ms: 50,
            max_restarts: 4,
            http_gzip_support: true,
            http_req_size: 8 * 1024,
            http_req_hdr_len: 8 * 1024,
            http_resp_size: 32 * 1024,
            http_max_hdr: 64,
            lru_timeout_secs: 1,
            shortlived_secs: 10,
            gzip_stack_buffer: 8192,
            wthread_stats_rate: 10,
            diag_bitmap: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub server_name: String,
    pub default_server: bool,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: usize,
    pub backends: Vec<BackendConfig>,
    pub routes: Vec<RouteConfig>,
    pub engine: EngineParams,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            server_name: DEFAULT_SERVER_NAME.to_string(),
            default_server: false,
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            backends: vec![BackendConfig::default()],
            routes: vec![RouteConfig::default()],
            engine: EngineParams::default(),
            cache_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn find_backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}
