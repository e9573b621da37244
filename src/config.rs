use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::iprange::IpRangeFilter;

/// Where the effective config file came from, for the startup log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    CliFlag,
    EnvVar,
    WorkingDir,
    SystemDefault,
}

impl ConfigOrigin {
    pub fn describe(self) -> &'static str {
        match self {
            ConfigOrigin::CliFlag => "--config flag",
            ConfigOrigin::EnvVar => "SHROUD_CONFIG",
            ConfigOrigin::WorkingDir => "working directory",
            ConfigOrigin::SystemDefault => "user config dir",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPath {
    pub path: PathBuf,
    pub origin: ConfigOrigin,
}

/// Picks the config file: explicit flag, then `SHROUD_CONFIG`, then a
/// `shroud.*` in the working directory, then the per-user config dir.
pub fn locate_config(explicit: Option<PathBuf>) -> anyhow::Result<ConfigPath> {
    let (path, origin) = if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        (p, ConfigOrigin::CliFlag)
    } else if let Some(p) = std::env::var_os("SHROUD_CONFIG").filter(|v| !v.is_empty()) {
        (PathBuf::from(p), ConfigOrigin::EnvVar)
    } else if let Some(p) = ["shroud.toml", "shroud.yaml", "shroud.yml"]
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
    {
        (p.to_path_buf(), ConfigOrigin::WorkingDir)
    } else {
        let proj = ProjectDirs::from("dev", "shroud", "shroud")
            .context("config: resolve user config dir")?;
        (
            proj.config_dir().join("shroud.toml"),
            ConfigOrigin::SystemDefault,
        )
    };

    Ok(ConfigPath { path, origin })
}

/// Writes the default template when no config exists yet; returns whether a
/// file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }
    fs::write(path, DEFAULT_CONFIG_TEMPLATE_TOML)
        .with_context(|| format!("config: create {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };

    Config::from_file_config(fc)
}

/// Reads a boolean runtime flag from the environment (`1/true/yes/on`).
pub fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
}

/// Runtime logging knobs, distilled from the file's `[logging]` table
/// (`format = "json"` becomes the `json` flag, `add_source` becomes
/// `include_location`).
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
    pub json: bool,
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            output: "stderr".into(),
            json: false,
            include_location: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub enable_udp_channel: bool,
    pub udp_listen_addr: String,
    pub storage_dir: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub host_name: String,
    pub gateway_ip_v4: Ipv4Addr,
    pub gateway_ip_v6: Ipv6Addr,
    pub mtu: u16,
    pub is_ipv6_supported: bool,
    pub dns_servers: Vec<IpAddr>,
    pub redirect_to: Vec<SocketAddr>,
    pub max_packet_channel_count: usize,
    pub max_tcp_channel_count: usize,
    pub max_tcp_connect_wait_count: usize,
    pub net_scan_limit: Option<usize>,
    pub net_scan_window: Duration,
    pub blocked_ip_ranges: IpRangeFilter,
    pub blocked_domains: Vec<String>,
    pub cleanup_interval: Duration,
    pub usage_sync_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    logging: Option<FileLogging>,
    server: Option<FileServer>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    listen_addr: Option<String>,
    enable_udp_channel: Option<bool>,
    udp_listen_addr: Option<String>,
    storage_dir: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    host_name: Option<String>,
    gateway_ip_v4: Option<Ipv4Addr>,
    gateway_ip_v6: Option<Ipv6Addr>,
    mtu: Option<u16>,
    #[serde(default)]
    is_ipv6_supported: bool,
    dns_servers: Option<Vec<IpAddr>>,
    #[serde(default)]
    redirect_to: Vec<SocketAddr>,
    max_packet_channel_count: Option<usize>,
    max_tcp_channel_count: Option<usize>,
    max_tcp_connect_wait_count: Option<usize>,
    net_scan_limit: Option<usize>,
    net_scan_window_ms: Option<i64>,
    #[serde(default)]
    blocked_ip_ranges: Vec<ipnet::IpNet>,
    #[serde(default)]
    blocked_domains: Vec<String>,
    cleanup_interval_ms: Option<i64>,
    usage_sync_interval_ms: Option<i64>,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(level) = l.level {
                logging.level = level;
            }
            if let Some(output) = l.output {
                logging.output = output;
            }
            if let Some(format) = l.format {
                logging.json = format.trim().eq_ignore_ascii_case("json");
            }
            logging.include_location = l.add_source;
        }

        let server = match fc.server {
            None => None,
            Some(s) => {
                let storage_dir = std::env::var_os("SHROUD_STORAGE_DIR")
                    .map(PathBuf::from)
                    .or(s.storage_dir)
                    .unwrap_or_else(|| PathBuf::from("tokens"));
                let enable_udp_channel = env_flag("SHROUD_ENABLE_UDP_CHANNEL")
                    .or(s.enable_udp_channel)
                    .unwrap_or(true);

                Some(ServerConfig {
                    listen_addr: s.listen_addr.unwrap_or_else(|| ":443".into()),
                    enable_udp_channel,
                    udp_listen_addr: s.udp_listen_addr.unwrap_or_else(|| ":0".into()),
                    storage_dir,
                    cert_file: s.cert_file.unwrap_or_else(|| "shroud-cert.pem".into()),
                    key_file: s.key_file.unwrap_or_else(|| "shroud-key.pem".into()),
                    host_name: s.host_name.unwrap_or_else(|| "shroud".into()),
                    gateway_ip_v4: s.gateway_ip_v4.unwrap_or(Ipv4Addr::new(10, 255, 0, 1)),
                    gateway_ip_v6: s
                        .gateway_ip_v6
                        .unwrap_or_else(|| "fd12::1".parse().expect("valid addr")),
                    mtu: s.mtu.unwrap_or(1500),
                    is_ipv6_supported: s.is_ipv6_supported,
                    dns_servers: s.dns_servers.unwrap_or_else(|| {
                        vec![
                            "8.8.8.8".parse().expect("valid addr"),
                            "1.1.1.1".parse().expect("valid addr"),
                        ]
                    }),
                    redirect_to: s.redirect_to,
                    max_packet_channel_count: s.max_packet_channel_count.unwrap_or(4).max(1),
                    max_tcp_channel_count: s.max_tcp_channel_count.unwrap_or(8).max(1),
                    max_tcp_connect_wait_count: s.max_tcp_connect_wait_count.unwrap_or(500).max(1),
                    net_scan_limit: s.net_scan_limit,
                    net_scan_window: millis(s.net_scan_window_ms, 10_000),
                    blocked_ip_ranges: IpRangeFilter::new(s.blocked_ip_ranges),
                    blocked_domains: s.blocked_domains,
                    cleanup_interval: millis(s.cleanup_interval_ms, 30_000),
                    usage_sync_interval: millis(s.usage_sync_interval_ms, 3_000),
                })
            }
        };

        Ok(Config { logging, server })
    }
}

fn millis(v: Option<i64>, default: i64) -> Duration {
    Duration::from_millis(v.unwrap_or(default).max(0) as u64)
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Shroud server configuration.

[logging]
level = "info"      # debug | info | warn | error
format = "text"     # text | json
output = "stderr"   # stderr | stdout | discard | <file path>

[server]
listen_addr = ":443"
enable_udp_channel = true
udp_listen_addr = ":0"
storage_dir = "tokens"
cert_file = "shroud-cert.pem"
key_file = "shroud-key.pem"
host_name = "shroud"
# redirect_to = ["203.0.113.7:443"]
# net_scan_limit = 100
# blocked_ip_ranges = ["198.18.0.0/15"]
# blocked_domains = ["ads.example.com"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_template_parses_with_defaults() {
        let fc: FileConfig = toml::from_str(DEFAULT_CONFIG_TEMPLATE_TOML).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        let server = cfg.server.expect("template has a server");
        assert_eq!(server.listen_addr, ":443");
        assert!(server.enable_udp_channel);
        assert_eq!(server.mtu, 1500);
        assert_eq!(server.cleanup_interval, Duration::from_secs(30));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(!cfg.logging.include_location);
    }

    #[test]
    fn json_format_maps_to_the_flag() {
        let fc: FileConfig = toml::from_str("[logging]\nformat = \"JSON\"\nadd_source = true\n")
            .unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        assert!(cfg.logging.json);
        assert!(cfg.logging.include_location);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn yaml_config_parses() {
        let yaml = r#"
logging:
  level: debug
server:
  listen_addr: ":5000"
  net_scan_limit: 64
  blocked_domains: ["ads.example.com"]
"#;
        let fc: FileConfig = serde_yaml::from_str(yaml).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        let server = cfg.server.unwrap();
        assert_eq!(server.listen_addr, ":5000");
        assert_eq!(server.net_scan_limit, Some(64));
        assert_eq!(server.blocked_domains, vec!["ads.example.com".to_string()]);
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn env_flag_parses_common_forms() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("banana"), None);
    }

    fn parse_flag(v: &str) -> Option<bool> {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}
