//! vncmux: entry point.
//!
//! ```text
//! vncmux [-w width] [-h height] [-r rate] [-l listen-port] [host[:port]] [port]
//! vncmux --config <path>   Load a custom config TOML
//! vncmux --gen-config      Write default config to stdout
//! ```
//!
//! `-h` sets the height, so help is `--help` only.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vncmux::config::VncmuxConfig;
use vncmux::service::RelayService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "vncmux",
    version,
    about = "Relay one VNC server to many VNC viewers at a fixed frame rate",
    disable_help_flag = true
)]
struct Cli {
    /// Width of the framebuffer served to viewers. 0 is raised to 1.
    #[arg(short = 'w', long, value_name = "PIXELS")]
    width: Option<u16>,

    /// Height of the framebuffer served to viewers. 0 is raised to 1.
    #[arg(short = 'h', long, value_name = "PIXELS")]
    height: Option<u16>,

    /// Frames per second published to viewers.
    #[arg(
        short = 'r',
        long = "rate",
        value_name = "FPS",
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    rate: Option<u32>,

    /// Port viewers connect to.
    #[arg(short = 'l', long = "listen", value_name = "PORT")]
    listen_port: Option<u16>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vncmux.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Upstream VNC server, `host`, `host:port` or `[v6-address]:port`.
    #[arg(value_name = "HOST[:PORT]", value_parser = parse_upstream)]
    upstream: Option<UpstreamArg>,

    /// Upstream port; overrides a port given with the host.
    #[arg(value_name = "PORT")]
    port: Option<u16>,
}

/// The positional upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UpstreamArg {
    host: String,
    port: Option<u16>,
}

fn parse_upstream(text: &str) -> Result<UpstreamArg, String> {
    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("missing ']' in {text:?}"))?;
        match tail {
            "" => (host, None),
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| format!("expected ':port' after ']' in {text:?}"))?;
                (host, Some(port))
            }
        }
    } else {
        match text.split_once(':') {
            // A bare IPv6 address has more than one colon.
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            _ => (text, None),
        }
    };

    if host.is_empty() {
        return Err(format!("empty host in {text:?}"));
    }
    let port = port
        .map(|p| p.parse::<u16>().map_err(|e| format!("invalid port {p:?}: {e}")))
        .transpose()?;
    Ok(UpstreamArg {
        host: host.to_string(),
        port,
    })
}

impl Cli {
    /// Command-line values take precedence over the config file.
    fn apply(&self, config: &mut VncmuxConfig) {
        if let Some(width) = self.width {
            config.downstream.width = width;
        }
        if let Some(height) = self.height {
            config.downstream.height = height;
        }
        if let Some(rate) = self.rate {
            config.relay.fps = rate;
        }
        if let Some(port) = self.listen_port {
            config.downstream.listen_port = port;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.host = upstream.host.clone();
            if let Some(port) = upstream.port {
                config.upstream.port = port;
            }
        }
        if let Some(port) = self.port {
            config.upstream.port = port;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&VncmuxConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Tracing is not up yet, so a bad config file is reported on stderr.
    let mut config = match VncmuxConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vncmux: {e}");
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vncmux v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "upstream: {}:{}",
        config.upstream.host, config.upstream.port
    );
    info!(
        "downstream: {}x{} on port {}",
        config.downstream.width, config.downstream.height, config.downstream.listen_port
    );
    info!("target FPS: {}", config.relay.fps);

    match RelayService::new(config).run().await {
        Ok(stats) => {
            info!(ticks = stats.ticks, overruns = stats.overruns, "vncmux exiting");
            Ok(())
        }
        Err(e) => {
            error!("{e}");
            Err(e.into())
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(host: &str, port: Option<u16>) -> UpstreamArg {
        UpstreamArg {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn parse_upstream_forms() {
        assert_eq!(parse_upstream("example.org"), Ok(upstream("example.org", None)));
        assert_eq!(parse_upstream("10.0.0.5:5902"), Ok(upstream("10.0.0.5", Some(5902))));
        assert_eq!(parse_upstream("[::1]:5900"), Ok(upstream("::1", Some(5900))));
        assert_eq!(parse_upstream("[fe80::1]"), Ok(upstream("fe80::1", None)));
        assert_eq!(parse_upstream("fe80::1"), Ok(upstream("fe80::1", None)));
    }

    #[test]
    fn parse_upstream_rejects_garbage() {
        assert!(parse_upstream("").is_err());
        assert!(parse_upstream(":5900").is_err());
        assert!(parse_upstream("host:99999").is_err());
        assert!(parse_upstream("host:-1").is_err());
        assert!(parse_upstream("[::1").is_err());
    }

    #[test]
    fn cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "vncmux", "-w", "1280", "-h", "720", "-r", "30", "-l", "5999", "vnc.local:5905",
        ])
        .unwrap();
        let mut config = VncmuxConfig::default();
        cli.apply(&mut config);

        assert_eq!((config.downstream.width, config.downstream.height), (1280, 720));
        assert_eq!(config.relay.fps, 30);
        assert_eq!(config.downstream.listen_port, 5999);
        assert_eq!(config.upstream.host, "vnc.local");
        assert_eq!(config.upstream.port, 5905);
    }

    #[test]
    fn separate_port_argument_wins() {
        let cli = Cli::try_parse_from(["vncmux", "vnc.local:5905", "5907"]).unwrap();
        let mut config = VncmuxConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.upstream.port, 5907);
    }

    #[test]
    fn defaults_without_arguments() {
        let cli = Cli::try_parse_from(["vncmux"]).unwrap();
        let mut config = VncmuxConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.upstream.host, "127.0.0.1");
        assert_eq!(config.upstream.port, 5900);
        assert_eq!(config.relay.fps, 60);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(Cli::try_parse_from(["vncmux", "-r", "0"]).is_err());
        assert!(Cli::try_parse_from(["vncmux", "-w", "-5"]).is_err());
        assert!(Cli::try_parse_from(["vncmux", "-l", "70000"]).is_err());
        assert!(Cli::try_parse_from(["vncmux", "-h", "tall"]).is_err());
    }

    #[test]
    fn zero_size_is_accepted_and_clamped() {
        let cli = Cli::try_parse_from(["vncmux", "-w", "0", "-h", "0"]).unwrap();
        let mut config = VncmuxConfig::default();
        cli.apply(&mut config);
        assert_eq!((config.downstream.width, config.downstream.height), (0, 0));

        let relay = config.to_relay_config();
        assert_eq!((relay.downstream.width, relay.downstream.height), (1, 1));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
