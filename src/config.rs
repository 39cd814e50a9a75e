//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNCTL_BINARY`, `TUNCTL_SERVICE_SOCKET`,
//!    `TUNCTL_LOG_DIR`
//! 2. **Config file** — path via `--config <path>`, or `tunctl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [registry]
//! max_connections = 8
//!
//! [manage]
//! open_timeout_secs = 10        # accept wait before ChannelUnavailable
//! inactivity_timeout_secs = 30  # mid-transition silence before timedout
//! stop_grace_secs = 5           # SIGTERM → SIGKILL escalation window
//! max_auth_retries = 3
//! max_line_bytes = 4096
//!
//! [launcher]
//! binary = "/usr/sbin/openvpn"
//! log_dir = "/var/log/tunctl"
//!
//! # Optional — omit entirely when no privileged helper is installed
//! [service]
//! socket = "/run/tunctl-helper.sock"
//!
//! [proxy]
//! source = "config"             # "config" | "system" | "manual"
//! kind = "http"                 # "http" | "socks"
//! http_address = "proxy.example.com"
//! http_port = 3128
//!
//! [logging]
//! level = "info"
//!
//! [[connection]]
//! name = "office"
//! config_file = "/etc/tunctl/office.ovpn"
//! auto_connect = true
//! launch = "direct"             # "direct" | "service"
//! username = "alice"            # optional, with `password`
//! ```

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub manage: ManageConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Optional privileged-helper settings. `None` disables service launches.
    pub service: Option<ServiceConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Configured tunnel connections.
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionConfig>,
}

/// Registry capacity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Fixed registry capacity, set once at startup (default 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Management-channel timing and framing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ManageConfig {
    /// Seconds to wait for the managed process to connect back (default 10).
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Seconds of channel silence mid-transition before `timedout` (default 30).
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Seconds after a stop request before the process is hard-killed (default 5).
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Consecutive failed password attempts before `AuthRejected` (default 3).
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    /// Maximum management line length in bytes (default 4096).
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// Direct-launch settings for the tunnel binary.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    /// Tunnel process binary (default `/usr/sbin/openvpn`).
    /// Override with `TUNCTL_BINARY`.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Directory for per-connection log files (default `/var/log/tunctl`).
    /// Override with `TUNCTL_LOG_DIR`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

/// Privileged-helper settings, present only when service launches are enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Path to the helper's listening socket.
    /// Override with `TUNCTL_SERVICE_SOCKET`.
    pub socket: String,
}

/// Where proxy settings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxySource {
    /// Use the `[proxy]` address/port fields as-is.
    Config,
    /// Read `http_proxy` / `socks_proxy` from the process environment.
    System,
    /// Entered by the presentation layer; same fields as Config.
    Manual,
}

/// Proxy protocol in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks,
}

/// Global proxy configuration applied to every launched tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_source")]
    pub source: ProxySource,
    #[serde(default = "default_proxy_kind")]
    pub kind: ProxyKind,
    #[serde(default)]
    pub http_address: String,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub socks_address: String,
    #[serde(default)]
    pub socks_port: u16,
}

/// A resolved proxy endpoint, ready for launcher arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProxy {
    pub kind: ProxyKind,
    pub address: String,
    pub port: u16,
}

/// How a connection's tunnel process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Spawned directly by tunctl.
    Direct,
    /// Started by the privileged helper over the service pipe.
    Service,
}

/// One configured tunnel connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Display name, unique among connections.
    pub name: String,
    /// Path to the tunnel config file handed to the process.
    pub config_file: String,
    /// Log file path. Defaults to `<log_dir>/<name>.log`.
    pub log_path: Option<String>,
    /// Start this connection when tunctl starts (default false).
    #[serde(default)]
    pub auto_connect: bool,
    /// Launch mode (default direct).
    #[serde(default = "default_launch_mode")]
    pub launch: LaunchMode,
    /// Optional credentials submitted on `>PASSWORD:` requests.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_connections() -> usize {
    8
}
fn default_open_timeout_secs() -> u64 {
    10
}
fn default_inactivity_timeout_secs() -> u64 {
    30
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_max_auth_retries() -> u32 {
    3
}
fn default_max_line_bytes() -> usize {
    4096
}
fn default_binary() -> String {
    "/usr/sbin/openvpn".to_string()
}
fn default_log_dir() -> String {
    "/var/log/tunctl".to_string()
}
fn default_proxy_source() -> ProxySource {
    ProxySource::Config
}
fn default_proxy_kind() -> ProxyKind {
    ProxyKind::Http
}
fn default_launch_mode() -> LaunchMode {
    LaunchMode::Direct
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            max_auth_retries: default_max_auth_retries(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            source: default_proxy_source(),
            kind: default_proxy_kind(),
            http_address: String::new(),
            http_port: 0,
            socks_address: String::new(),
            socks_port: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ProxyConfig {
    /// Resolve the effective proxy endpoint, or `None` when no proxy applies.
    ///
    /// For `source = "system"` the endpoint is read from `http_proxy` /
    /// `socks_proxy` environment variables (`host:port`, optional scheme
    /// prefix). Config and manual sources use the address/port fields.
    pub fn resolve(&self) -> Option<ResolvedProxy> {
        match self.source {
            ProxySource::System => {
                let var = match self.kind {
                    ProxyKind::Http => "http_proxy",
                    ProxyKind::Socks => "socks_proxy",
                };
                let raw = std::env::var(var).ok()?;
                parse_proxy_env(&raw).map(|(address, port)| ResolvedProxy {
                    kind: self.kind,
                    address,
                    port,
                })
            }
            ProxySource::Config | ProxySource::Manual => {
                let (address, port) = match self.kind {
                    ProxyKind::Http => (self.http_address.clone(), self.http_port),
                    ProxyKind::Socks => (self.socks_address.clone(), self.socks_port),
                };
                if address.is_empty() || port == 0 {
                    None
                } else {
                    Some(ResolvedProxy {
                        kind: self.kind,
                        address,
                        port,
                    })
                }
            }
        }
    }
}

/// Parse a proxy environment value like `http://host:3128/` or `host:1080`.
fn parse_proxy_env(raw: &str) -> Option<(String, u16)> {
    let stripped = raw
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("socks5://")
        .trim_start_matches("socks://")
        .trim_end_matches('/');
    let (host, port) = stripped.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

impl ConnectionConfig {
    /// Effective log path: explicit `log_path` or `<log_dir>/<name>.log`.
    pub fn log_path(&self, log_dir: &str) -> String {
        self.log_path
            .clone()
            .unwrap_or_else(|| format!("{log_dir}/{}.log", self.name))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tunctl.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunctl.toml").exists() {
            let content =
                std::fs::read_to_string("tunctl.toml").expect("Failed to read tunctl.toml");
            toml::from_str(&content).expect("Failed to parse tunctl.toml")
        } else {
            Config {
                registry: RegistryConfig::default(),
                manage: ManageConfig::default(),
                launcher: LauncherConfig::default(),
                service: None,
                proxy: ProxyConfig::default(),
                logging: LoggingConfig::default(),
                connections: Vec::new(),
            }
        };

        // Env var overrides
        if let Ok(binary) = std::env::var("TUNCTL_BINARY") {
            config.launcher.binary = binary;
        }
        if let Ok(log_dir) = std::env::var("TUNCTL_LOG_DIR") {
            config.launcher.log_dir = log_dir;
        }
        if let Ok(socket) = std::env::var("TUNCTL_SERVICE_SOCKET") {
            config.service = Some(ServiceConfig { socket });
        }

        config
    }

    /// Compiled defaults with no file or env lookup, for unit tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut config: Config = toml::from_str("").unwrap_or_else(|e| panic!("defaults: {e}"));
        config.manage.open_timeout_secs = 1;
        config.manage.inactivity_timeout_secs = 2;
        config.manage.stop_grace_secs = 1;
        config
    }

    /// Validate cross-field constraints that serde can't express.
    pub fn validate(&self) -> Result<(), String> {
        if self.connections.len() > self.registry.max_connections {
            return Err(format!(
                "{} connections configured but registry capacity is {}",
                self.connections.len(),
                self.registry.max_connections
            ));
        }
        let mut names: Vec<&str> = self.connections.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.connections.len() {
            return Err("duplicate connection names in config".to_string());
        }
        for conn in &self.connections {
            if conn.launch == LaunchMode::Service && self.service.is_none() {
                return Err(format!(
                    "connection {} uses service launch but [service] is not configured",
                    conn.name
                ));
            }
            if conn.password.is_some() && conn.username.is_none() {
                return Err(format!(
                    "connection {} has a password but no username",
                    conn.name
                ));
            }
        }
        Ok(())
    }
}
