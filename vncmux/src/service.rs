//! Relay service: runs one relay until a signal or a fatal error.
//!
//! Connecting can be interrupted by Ctrl-C (or SIGTERM on Unix);
//! once relaying, the same signals request a drain so both
//! framebuffers and the listen port are released before exit.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use vncmux_core::{RelayError, RelayLoop, RelayStats};

use crate::config::VncmuxConfig;

// ── RelayService ─────────────────────────────────────────────────

/// The top-level vncmux service.
pub struct RelayService {
    config: VncmuxConfig,
}

impl RelayService {
    pub fn new(config: VncmuxConfig) -> Self {
        Self { config }
    }

    /// Connect, relay until stopped, and return the final statistics.
    pub async fn run(&self) -> Result<RelayStats, RelayError> {
        let relay_config = self.config.to_relay_config();

        let mut relay = tokio::select! {
            relay = RelayLoop::connect(&relay_config) => relay?,
            _ = shutdown_signal() => {
                info!("shutdown requested while connecting");
                return Ok(RelayStats::default());
            }
        };
        info!("viewers can connect on {}", relay.downstream().local_addr());

        let stop = relay.stop_handle();
        let signals = tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown requested, draining");
            stop.request_stop();
        });

        let reporter = (self.config.relay.stats_interval_secs > 0).then(|| {
            let interval = Duration::from_secs(self.config.relay.stats_interval_secs);
            tokio::spawn(report_stats(relay.stats_receiver(), interval))
        });

        let result = relay.run().await;

        signals.abort();
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        result?;
        Ok(relay.stats().clone())
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Log relay statistics every `interval` until the relay goes away.
async fn report_stats(mut stats: watch::Receiver<RelayStats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut last_ticks = 0u64;
    loop {
        ticker.tick().await;
        if stats.has_changed().is_err() {
            break;
        }
        let snapshot = stats.borrow_and_update().clone();
        let fps = (snapshot.ticks - last_ticks) as f64 / interval.as_secs_f64();
        last_ticks = snapshot.ticks;
        info!(
            fps = format_args!("{fps:.1}"),
            overruns = snapshot.overruns,
            upstream_events = snapshot.upstream_events,
            upstream = format_args!("{}x{}", snapshot.upstream_width, snapshot.upstream_height),
            resizes_declined = snapshot.resizes_declined,
            last_tick = ?snapshot.last_tick,
            "relay stats"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
