//! Configuration Management
//!
//! Typed configuration for the tunnel fleet: JSON loading, `~`/`$VAR` path
//! expansion, and validation of the port plan.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors (all fatal at start-up)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// DNSTT client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsttConfig {
    /// Path to the dnstt-client binary
    pub path: String,
    /// Resolver or server the tunnel dials (required)
    pub remote_ip: String,
    pub port: u16,
    /// Tunnel domain (required)
    pub domain: String,
    pub pubkey: String,
}

impl Default for DnsttConfig {
    fn default() -> Self {
        Self {
            path: "/usr/local/bin/dnstt-client".into(),
            remote_ip: String::new(),
            port: 53,
            domain: String::new(),
            pubkey: String::new(),
        }
    }
}

/// SSH session settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub key_path: String,
    /// Host the SSH client dials; it is reached through the DNSTT endpoint,
    /// so the loopback default is almost always right.
    pub server: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "tunnel".into(),
            key_path: "~/.ssh/dnstt_key".into(),
            server: "127.0.0.1".into(),
        }
    }
}

/// Fleet shape and port plan
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelsConfig {
    pub dnstt_count: u32,
    pub ssh_per_dnstt: u32,
    pub dnstt_start_port: u16,
    pub socks_start_port: u16,
    /// Stride between the SOCKS5 port blocks of adjacent DNSTT parents
    pub socks_ports_per_tunnel: u16,
}

impl Default for TunnelsConfig {
    fn default() -> Self {
        Self {
            dnstt_count: 3,
            ssh_per_dnstt: 10,
            dnstt_start_port: 1080,
            socks_start_port: 9090,
            socks_ports_per_tunnel: 100,
        }
    }
}

impl TunnelsConfig {
    /// Local TCP port of a DNSTT parent.
    pub fn local_port(&self, tunnel_id: u32) -> u16 {
        (self.dnstt_start_port as u32 + tunnel_id) as u16
    }

    /// SOCKS5 port of an SSH child.
    pub fn socks5_port(&self, tunnel_id: u32, ssh_id: u32) -> u16 {
        (self.socks_start_port as u32 + tunnel_id * self.socks_ports_per_tunnel as u32 + ssh_id)
            as u16
    }
}

/// Health probe settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Seconds between monitor passes
    pub interval: u64,
    /// Per-probe timeout in seconds
    pub timeout: u64,
    /// Attempts per registry operation
    pub retry_count: u32,
    /// URL fetched through each SOCKS5 listener; any HTTP response counts
    pub test_url: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            timeout: 5,
            retry_count: 3,
            test_url: "http://www.google.com".into(),
        }
    }
}

/// Restart policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_retries: u32,
    /// Linear backoff unit: attempt N sleeps N * backoff_seconds
    pub backoff_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_seconds: 10,
        }
    }
}

/// Outbound registry (3x-ui style panel) settings
///
/// The endpoint lists are ordered URL templates; the client walks them until
/// one answers at the HTTP level. `{id}` expands to the outbound id.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XuiConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub add_endpoints: Vec<String>,
    pub remove_endpoints: Vec<String>,
    pub reload_endpoints: Vec<String>,
    pub list_endpoints: Vec<String>,
}

impl Default for XuiConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:2053".into(),
            username: "admin".into(),
            password: String::new(),
            add_endpoints: vec![
                "/xui/API/outbounds/add".into(),
                "/xui/API/inbounds/add".into(),
                "/API/outbounds/add".into(),
            ],
            remove_endpoints: vec![
                "/xui/API/outbounds/{id}".into(),
                "/xui/API/inbounds/{id}".into(),
                "/API/outbounds/{id}".into(),
            ],
            reload_endpoints: vec![
                "/xui/API/setting/updateXrayConfig".into(),
                "/xui/API/setting/reload".into(),
                "/API/reload".into(),
            ],
            list_endpoints: vec![
                "/xui/API/outbounds".into(),
                "/xui/API/inbounds".into(),
                "/API/outbounds".into(),
            ],
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file path; empty disables the file layer
    pub file: String,
    /// Rotate the file at start-up once it exceeds this size
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: "logs/dnstt-fleet.log".into(),
            max_bytes: 10 * 1024 * 1024,
            backup_count: 5,
        }
    }
}

/// Top-level configuration document
///
/// Unknown keys are ignored; absent sections take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dnstt: DnsttConfig,
    pub ssh: SshConfig,
    pub tunnels: TunnelsConfig,
    pub health_check: HealthCheckConfig,
    pub restart: RestartConfig,
    pub xui: XuiConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;
        config.dnstt.path = expand_path(&config.dnstt.path);
        config.ssh.key_path = expand_path(&config.ssh.key_path);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dnstt.remote_ip.is_empty() {
            return Err(ConfigError::Invalid("dnstt.remote_ip is required".into()));
        }
        if self.dnstt.domain.is_empty() {
            return Err(ConfigError::Invalid("dnstt.domain is required".into()));
        }
        let t = &self.tunnels;
        if (t.ssh_per_dnstt as u64) > (t.socks_ports_per_tunnel as u64) {
            return Err(ConfigError::Invalid(format!(
                "tunnels.socks_ports_per_tunnel ({}) must be >= ssh_per_dnstt ({})",
                t.socks_ports_per_tunnel, t.ssh_per_dnstt
            )));
        }
        if t.dnstt_count > 0 {
            let last_local = t.dnstt_start_port as u64 + t.dnstt_count as u64 - 1;
            if last_local > u16::MAX as u64 {
                return Err(ConfigError::Invalid(
                    "tunnels.dnstt_start_port + dnstt_count exceeds the port range".into(),
                ));
            }
            if t.ssh_per_dnstt > 0 {
                let last_socks = t.socks_start_port as u64
                    + (t.dnstt_count as u64 - 1) * t.socks_ports_per_tunnel as u64
                    + t.ssh_per_dnstt as u64
                    - 1;
                if last_socks > u16::MAX as u64 {
                    return Err(ConfigError::Invalid(
                        "tunnels SOCKS5 port plan exceeds the port range".into(),
                    ));
                }
                // The two port blocks must never collide.
                let local = t.dnstt_start_port as u64..=last_local;
                let socks = t.socks_start_port as u64..=last_socks;
                if local.start() <= socks.end() && socks.start() <= local.end() {
                    return Err(ConfigError::Invalid(
                        "DNSTT local port range overlaps the SOCKS5 port range".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Argument vector for a DNSTT child.
    pub fn dnstt_argv(&self, local_port: u16) -> Vec<String> {
        vec![
            self.dnstt.path.clone(),
            "-udp".into(),
            format!("{}:{}", self.dnstt.remote_ip, self.dnstt.port),
            "-pubkey".into(),
            self.dnstt.pubkey.clone(),
            self.dnstt.domain.clone(),
            format!("127.0.0.1:{}", local_port),
        ]
    }

    /// Argument vector for an SSH child in dynamic-forward mode.
    pub fn ssh_argv(&self, dnstt_port: u16, socks5_port: u16) -> Vec<String> {
        vec![
            "ssh".into(),
            "-i".into(),
            self.ssh.key_path.clone(),
            "-N".into(),
            format!("{}@{}", self.ssh.user, self.ssh.server),
            "-p".into(),
            dnstt_port.to_string(),
            "-D".into(),
            socks5_port.to_string(),
            "-o".into(),
            "ServerAliveInterval=60".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
        ]
    }
}

/// Expand a leading `~` and any `$VAR` / `${VAR}` references in a path.
/// Unset variables are left as written.
pub fn expand_path(raw: &str) -> String {
    let mut path = raw.to_string();
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            path = home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            path = home.to_string_lossy().into_owned();
        }
    }
    expand_env_vars(&path)
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal() {
        let file = write_config(r#"{"dnstt": {"remote_ip": "1.2.3.4", "domain": "t.example.com"}}"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.dnstt.remote_ip, "1.2.3.4");
        assert_eq!(config.dnstt.port, 53);
        assert_eq!(config.ssh.user, "tunnel");
        assert_eq!(config.tunnels.dnstt_count, 3);
        assert_eq!(config.health_check.interval, 60);
        assert_eq!(config.restart.max_retries, 5);
    }

    #[test]
    fn test_missing_required_keys() {
        let file = write_config(r#"{"dnstt": {"remote_ip": "1.2.3.4"}}"#);
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let file = write_config(
            r#"{"dnstt": {"remote_ip": "1.2.3.4", "domain": "t.example.com", "frobnicate": 1},
                "experimental": {"x": true}}"#,
        );
        assert!(Config::load(file.path()).is_ok());
    }

    #[test]
    fn test_stride_must_cover_children() {
        let file = write_config(
            r#"{"dnstt": {"remote_ip": "1.2.3.4", "domain": "t.example.com"},
                "tunnels": {"ssh_per_dnstt": 10, "socks_ports_per_tunnel": 5}}"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_port_ranges_must_not_overlap() {
        let file = write_config(
            r#"{"dnstt": {"remote_ip": "1.2.3.4", "domain": "t.example.com"},
                "tunnels": {"dnstt_start_port": 9090, "socks_start_port": 9091,
                            "dnstt_count": 2, "ssh_per_dnstt": 2}}"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_port_plan() {
        let tunnels = TunnelsConfig::default();
        assert_eq!(tunnels.local_port(0), 1080);
        assert_eq!(tunnels.local_port(2), 1082);
        assert_eq!(tunnels.socks5_port(0, 0), 9090);
        assert_eq!(tunnels.socks5_port(0, 9), 9099);
        assert_eq!(tunnels.socks5_port(1, 0), 9190);
        assert_eq!(tunnels.socks5_port(2, 3), 9293);
    }

    #[test]
    fn test_dnstt_argv_shape() {
        let mut config = Config::default();
        config.dnstt.remote_ip = "9.9.9.9".into();
        config.dnstt.domain = "t.example.com".into();
        config.dnstt.pubkey = "abcdef".into();
        let argv = config.dnstt_argv(1080);
        assert_eq!(
            argv,
            vec![
                "/usr/local/bin/dnstt-client",
                "-udp",
                "9.9.9.9:53",
                "-pubkey",
                "abcdef",
                "t.example.com",
                "127.0.0.1:1080",
            ]
        );
    }

    #[test]
    fn test_ssh_argv_shape() {
        let config = Config::default();
        let argv = config.ssh_argv(1080, 9090);
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-N".to_string()));
        assert!(argv.contains(&"tunnel@127.0.0.1".to_string()));
        let p = argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(argv[p + 1], "1080");
        let d = argv.iter().position(|a| a == "-D").unwrap();
        assert_eq!(argv[d + 1], "9090");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("DNSTT_FLEET_TEST_DIR", "/opt/keys");
        assert_eq!(
            expand_path("$DNSTT_FLEET_TEST_DIR/id_ed25519"),
            "/opt/keys/id_ed25519"
        );
        assert_eq!(
            expand_path("${DNSTT_FLEET_TEST_DIR}/id_ed25519"),
            "/opt/keys/id_ed25519"
        );
        // unset variables stay literal
        assert_eq!(
            expand_path("$DNSTT_FLEET_UNSET_VAR/x"),
            "$DNSTT_FLEET_UNSET_VAR/x"
        );
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_path("~/.ssh/dnstt_key");
            assert!(expanded.starts_with(home.to_string_lossy().as_ref()));
            assert!(expanded.ends_with(".ssh/dnstt_key"));
        }
    }
}
