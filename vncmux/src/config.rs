//! Configuration for the vncmux relay.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vncmux_core::{DownstreamOptions, RelayConfig, UpstreamOptions};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncmuxConfig {
    /// The VNC server being relayed.
    pub upstream: UpstreamConfig,
    /// The framebuffer served to viewers.
    pub downstream: DownstreamConfig,
    /// Relay loop tuning.
    pub relay: RelayTuning,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Upstream server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    /// Connect plus handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Largest framebuffer the upstream may announce, in pixels.
    /// 0 means no limit.
    pub max_pixels: u64,
}

/// Downstream server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub width: u16,
    pub height: u16,
    pub listen_address: String,
    pub listen_port: u16,
    /// Name shown by viewers.
    pub desktop_name: String,
    /// Upper bound for shutdown in milliseconds.
    pub shutdown_timeout_ms: u64,
}

/// Relay loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTuning {
    /// Target frames per second (1..=1000).
    pub fps: u32,
    /// Seconds between statistics log lines; 0 disables them.
    pub stats_interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for VncmuxConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            downstream: DownstreamConfig::default(),
            relay: RelayTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5900,
            connect_timeout_ms: 10_000,
            max_pixels: 0,
        }
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            listen_address: "0.0.0.0".into(),
            listen_port: 5901,
            desktop_name: "vncmux".into(),
            shutdown_timeout_ms: 3_000,
        }
    }
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            fps: 60,
            stats_interval_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl VncmuxConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults. A file that exists but cannot
    /// be read or parsed is an error; its settings are never silently
    /// replaced.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("cannot read config {}: {e}", path.display()),
                ));
            }
        };
        toml::from_str(&contents).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid config {}: {e}", path.display()),
            )
        })
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into the core's `RelayConfig`, clamping out-of-range
    /// values.
    pub fn to_relay_config(&self) -> RelayConfig {
        let listen_address = self
            .downstream
            .listen_address
            .parse()
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "invalid listen_address {:?}; listening on all interfaces",
                    self.downstream.listen_address
                );
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });

        RelayConfig {
            upstream: UpstreamOptions {
                host: self.upstream.host.clone(),
                port: self.upstream.port,
                connect_timeout: Duration::from_millis(self.upstream.connect_timeout_ms.max(1)),
                max_pixels: match self.upstream.max_pixels {
                    0 => None,
                    max => Some(usize::try_from(max).unwrap_or(usize::MAX)),
                },
            },
            downstream: DownstreamOptions {
                width: self.downstream.width.max(1),
                height: self.downstream.height.max(1),
                listen_address,
                listen_port: self.downstream.listen_port,
                desktop_name: self.downstream.desktop_name.clone(),
                shutdown_timeout: Duration::from_millis(self.downstream.shutdown_timeout_ms),
            },
            target_fps: self.relay.fps.clamp(1, 1000),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = VncmuxConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("[upstream]"));
        assert!(text.contains("listen_port"));
        assert!(text.contains("fps"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = VncmuxConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: VncmuxConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.upstream.port, 5900);
        assert_eq!(parsed.downstream.listen_port, 5901);
        assert_eq!((parsed.downstream.width, parsed.downstream.height), (1920, 1080));
        assert_eq!(parsed.relay.fps, 60);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: VncmuxConfig = toml::from_str("[relay]\nfps = 25\n").unwrap();
        assert_eq!(parsed.relay.fps, 25);
        assert_eq!(parsed.upstream.host, "127.0.0.1");
        assert_eq!(parsed.downstream.desktop_name, "vncmux");
    }

    #[test]
    fn to_relay_config_clamps() {
        let mut cfg = VncmuxConfig::default();
        cfg.relay.fps = 0;
        cfg.downstream.width = 0;
        cfg.downstream.listen_address = "not an address".into();
        cfg.upstream.max_pixels = 4096;

        let relay = cfg.to_relay_config();

        assert_eq!(relay.target_fps, 1);
        assert_eq!(relay.downstream.width, 1);
        assert_eq!(relay.downstream.listen_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(relay.upstream.max_pixels, Some(4096));
        assert_eq!(relay.downstream.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = VncmuxConfig::load(Path::new("/nonexistent/vncmux.toml")).unwrap();
        assert_eq!(cfg.relay.fps, 60);
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("vncmux-{}.toml", std::process::id()));
        VncmuxConfig::write_default(&path).unwrap();
        let cfg = VncmuxConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.unwrap().downstream.listen_port, 5901);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("vncmux-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[downstream]\nlisten_port = 6100\nwidth = \"wide\"\n").unwrap();
        let result = VncmuxConfig::load(&path);
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("invalid config"), "{err}");
    }
}
