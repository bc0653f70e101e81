use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_RPC_PORT: u16 = 4360;
const DEFAULT_EVENTS_PORT: u16 = 4361;
const DEFAULT_MAX_ENGINES: usize = 5;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
const DEFAULT_PAGE_LOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
const DEFAULT_CLIENT_GRACE_SECS: u64 = 60;
const DEFAULT_DRAIN_GRACE_SECS: u64 = 10;
const DEFAULT_VIEWPORT_WIDTH: u32 = 1920;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 1080;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `roostd.toml` — all fields are optional overrides.
/// Priority: CLI flag / env var  >  TOML  >  built-in default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    /// JSON-RPC WebSocket port (default: 4360).
    rpc_port: Option<u16>,
    /// Event-stream WebSocket port (default: 4361).
    events_port: Option<u16>,
    /// Bind address for both listeners (default: 127.0.0.1).
    bind_address: Option<String>,
    /// Pool capacity: engines launched at startup and the hard bound on
    /// concurrent sessions (default: 5).
    max_engines: Option<usize>,
    /// Idle seconds before a session is reaped (default: 300).
    session_timeout_secs: Option<u64>,
    /// Reaper sweep cadence in seconds (default: 60).
    reap_interval_secs: Option<u64>,
    /// Which engine backend to drive: "chromium" or "mock" (default: chromium).
    engine_type: Option<String>,
    /// Run engines without a visible window (default: true).
    headless: Option<bool>,
    /// Default page viewport (default: 1920x1080).
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
    /// Navigation bound in seconds (default: 30).
    page_load_timeout_secs: Option<u64>,
    /// Engine OS sandbox. Disable only inside containers that lack the
    /// required privileges (default: true).
    sandbox_enabled: Option<bool>,
    /// User agent applied to new contexts.
    user_agent: Option<String>,
    /// Navigation allowlist. Empty means all domains are allowed.
    allowed_domains: Option<Vec<String>>,
    /// Event-plane server heartbeat cadence (default: 15).
    heartbeat_interval_secs: Option<u64>,
    /// Seconds an event-plane client may stay silent before it is dropped
    /// (default: 60).
    client_grace_secs: Option<u64>,
    /// Seconds the drain waits for sessions to close on shutdown (default: 10).
    drain_grace_secs: Option<u64>,
    /// Log level filter string, e.g. "debug", "info,roost=trace" (default: "info").
    log: Option<String>,
}

// ─── Resolved config ──────────────────────────────────────────────────────────

/// Immutable daemon configuration, resolved once at startup and passed
/// explicitly to every component.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rpc_port: u16,
    pub events_port: u16,
    pub bind_address: String,
    pub max_engines: usize,
    pub session_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub engine_type: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_load_timeout_secs: u64,
    pub sandbox_enabled: bool,
    pub user_agent: String,
    pub allowed_domains: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub client_grace_secs: u64,
    pub drain_grace_secs: u64,
    pub log: String,
}

/// CLI-level overrides collected by `main` — each beats the TOML file.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub rpc_port: Option<u16>,
    pub events_port: Option<u16>,
    pub bind_address: Option<String>,
    pub max_engines: Option<usize>,
    pub engine_type: Option<String>,
    pub log: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rpc_port: DEFAULT_RPC_PORT,
            events_port: DEFAULT_EVENTS_PORT,
            bind_address: default_bind_address(),
            max_engines: DEFAULT_MAX_ENGINES,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
            engine_type: "chromium".to_string(),
            headless: true,
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            page_load_timeout_secs: DEFAULT_PAGE_LOAD_TIMEOUT_SECS,
            sandbox_enabled: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allowed_domains: Vec::new(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            client_grace_secs: DEFAULT_CLIENT_GRACE_SECS,
            drain_grace_secs: DEFAULT_DRAIN_GRACE_SECS,
            log: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Resolve the effective configuration from an optional TOML file plus
    /// CLI overrides. A missing file is fine; a malformed file is logged and
    /// ignored rather than aborting startup.
    pub fn load(file: Option<&Path>, overrides: ConfigOverrides) -> Self {
        let toml_cfg = file.map(read_toml).unwrap_or_default();
        let defaults = Self::default();

        Self {
            rpc_port: overrides
                .rpc_port
                .or(toml_cfg.rpc_port)
                .unwrap_or(defaults.rpc_port),
            events_port: overrides
                .events_port
                .or(toml_cfg.events_port)
                .unwrap_or(defaults.events_port),
            bind_address: overrides
                .bind_address
                .or(toml_cfg.bind_address)
                .unwrap_or(defaults.bind_address),
            max_engines: overrides
                .max_engines
                .or(toml_cfg.max_engines)
                .unwrap_or(defaults.max_engines)
                .max(1),
            session_timeout_secs: toml_cfg
                .session_timeout_secs
                .unwrap_or(defaults.session_timeout_secs),
            reap_interval_secs: toml_cfg
                .reap_interval_secs
                .unwrap_or(defaults.reap_interval_secs)
                .max(1),
            engine_type: overrides
                .engine_type
                .or(toml_cfg.engine_type)
                .unwrap_or(defaults.engine_type),
            headless: toml_cfg.headless.unwrap_or(defaults.headless),
            viewport_width: toml_cfg.viewport_width.unwrap_or(defaults.viewport_width),
            viewport_height: toml_cfg
                .viewport_height
                .unwrap_or(defaults.viewport_height),
            page_load_timeout_secs: toml_cfg
                .page_load_timeout_secs
                .unwrap_or(defaults.page_load_timeout_secs),
            sandbox_enabled: toml_cfg.sandbox_enabled.unwrap_or(defaults.sandbox_enabled),
            user_agent: toml_cfg.user_agent.unwrap_or(defaults.user_agent),
            allowed_domains: toml_cfg.allowed_domains.unwrap_or_default(),
            heartbeat_interval_secs: toml_cfg
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            client_grace_secs: toml_cfg
                .client_grace_secs
                .unwrap_or(defaults.client_grace_secs),
            drain_grace_secs: toml_cfg
                .drain_grace_secs
                .unwrap_or(defaults.drain_grace_secs),
            log: overrides.log.or(toml_cfg.log).unwrap_or(defaults.log),
        }
    }

    /// Check a URL's host against the configured allowlist.
    /// An empty allowlist admits everything.
    pub fn domain_allowed(&self, url: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = match host_of(url) {
            Some(h) => h,
            None => return false,
        };
        self.allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}

fn read_toml(path: &Path) -> TomlConfig {
    match std::fs::read_to_string(path) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "malformed config file — using defaults");
                TomlConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => TomlConfig::default(),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "could not read config file — using defaults");
            TomlConfig::default()
        }
    }
}

/// Extract the host portion of an http(s) URL without a URL-parsing
/// dependency: scheme, then authority up to the first `/`, `?` or `#`,
/// with any userinfo/port stripped.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority
        .rsplit('@')
        .next()?
        .split(':')
        .next()?
        .to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Default config file location: `$ROOSTD_CONFIG` or `./roostd.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("ROOSTD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("roostd.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.max_engines, 5);
        assert_eq!(cfg.session_timeout_secs, 300);
        assert!(cfg.headless);
        assert!(cfg.sandbox_enabled);
    }

    #[test]
    fn toml_then_override_precedence() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "max_engines = 3\nrpc_port = 9000\nheadless = false").unwrap();

        let cfg = DaemonConfig::load(
            Some(f.path()),
            ConfigOverrides {
                rpc_port: Some(9100),
                ..Default::default()
            },
        );
        assert_eq!(cfg.rpc_port, 9100); // CLI beats TOML
        assert_eq!(cfg.max_engines, 3); // TOML beats default
        assert!(!cfg.headless);
        assert_eq!(cfg.events_port, 4361); // untouched default
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = DaemonConfig::load(
            Some(Path::new("/nonexistent/roostd.toml")),
            ConfigOverrides::default(),
        );
        assert_eq!(cfg.max_engines, 5);
    }

    #[test]
    fn zero_max_engines_is_clamped() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "max_engines = 0").unwrap();
        let cfg = DaemonConfig::load(Some(f.path()), ConfigOverrides::default());
        assert_eq!(cfg.max_engines, 1);
    }

    #[test]
    fn domain_allowlist() {
        let mut cfg = DaemonConfig::default();
        assert!(cfg.domain_allowed("https://anything.example"));

        cfg.allowed_domains = vec!["example.com".to_string()];
        assert!(cfg.domain_allowed("https://example.com/path"));
        assert!(cfg.domain_allowed("https://sub.example.com"));
        assert!(cfg.domain_allowed("http://user@example.com:8080/x"));
        assert!(!cfg.domain_allowed("https://evil.com"));
        assert!(!cfg.domain_allowed("https://notexample.com"));
        assert!(!cfg.domain_allowed("ftp://example.com"));
    }
}
