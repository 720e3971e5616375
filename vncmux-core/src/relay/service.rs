//! The relay loop.
//!
//! Every tick copies the upstream framebuffer into the downstream one,
//! publishes the copied region, then spends the rest of the tick
//! servicing the upstream connection:
//!
//! ```text
//!  ┌───────────── tick (1 / fps) ──────────────┐
//!  │ copy (both locks) │ publish │ poll … poll │
//!  └───────────────────────────────────────────┘
//! ```
//!
//! The loop runs until a fatal error or a stop request, then drains:
//! the publisher is stopped and the upstream session closed on every
//! exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::RelayError;
use crate::relay::downstream::{DownstreamOptions, DownstreamPublisher};
use crate::relay::pacing::{FramePacer, PaceOutcome};
use crate::relay::state::RelayPhase;
use crate::relay::types::Region;
use crate::relay::upstream::{UpstreamOptions, UpstreamSession};
use crate::rfb::client::{RfbClient, TcpRfbClient};
use crate::rfb::server::{RfbServer, TcpRfbServer};

// ── RelayConfig ──────────────────────────────────────────────────

/// Everything needed to start a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: UpstreamOptions,
    pub downstream: DownstreamOptions,
    /// Ticks per second.
    pub target_fps: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamOptions::default(),
            downstream: DownstreamOptions::default(),
            target_fps: 60,
        }
    }
}

// ── RelayStats ───────────────────────────────────────────────────

/// Running totals, published after every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub ticks: u64,
    /// Ticks whose copy step used up the whole budget.
    pub overruns: u64,
    pub upstream_events: u64,
    pub regions_published: u64,
    pub resizes_applied: u64,
    pub resizes_declined: u64,
    pub upstream_width: u16,
    pub upstream_height: u16,
    /// Wall time of the most recent tick.
    pub last_tick: Duration,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Region copied and published.
    pub copied: Region,
    pub pacing: PaceOutcome,
    pub elapsed: Duration,
}

// ── StopHandle ───────────────────────────────────────────────────

/// Asks a running relay to drain and stop after the current tick.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── RelayLoop ────────────────────────────────────────────────────

/// Ties an upstream session to a downstream publisher at a fixed rate.
///
/// # Lifetime
///
/// Call [`run`](Self::run) to relay until a fatal error or until
/// [`StopHandle::request_stop`] is called. Both sides are released
/// before `run` returns.
pub struct RelayLoop<C, S> {
    upstream: UpstreamSession<C>,
    downstream: DownstreamPublisher<S>,
    pacer: FramePacer,
    phase: RelayPhase,
    stop: StopHandle,
    stats: RelayStats,
    stats_tx: watch::Sender<RelayStats>,
    stats_rx: watch::Receiver<RelayStats>,
}

impl RelayLoop<TcpRfbClient, TcpRfbServer> {
    /// Connect the upstream, then start the downstream.
    ///
    /// If the downstream cannot start, the already connected upstream
    /// is closed before the error is returned.
    pub async fn connect(config: &RelayConfig) -> Result<Self, RelayError> {
        let mut upstream = UpstreamSession::connect(&config.upstream).await?;
        let downstream = match DownstreamPublisher::start(&config.downstream).await {
            Ok(publisher) => publisher,
            Err(e) => {
                upstream.close();
                return Err(e);
            }
        };
        Ok(Self::new(upstream, downstream, config.target_fps))
    }
}

impl<C: RfbClient, S: RfbServer> RelayLoop<C, S> {
    pub fn new(
        upstream: UpstreamSession<C>,
        downstream: DownstreamPublisher<S>,
        target_fps: u32,
    ) -> Self {
        let (stats_tx, stats_rx) = watch::channel(RelayStats::default());
        Self {
            upstream,
            downstream,
            pacer: FramePacer::from_fps(target_fps),
            phase: RelayPhase::Connecting,
            stop: StopHandle::default(),
            stats: RelayStats::default(),
            stats_tx,
            stats_rx,
        }
    }

    pub fn phase(&self) -> &RelayPhase {
        &self.phase
    }

    /// A cloneable handle that can stop the relay from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Obtain a `watch::Receiver` for relay statistics.
    pub fn stats_receiver(&self) -> watch::Receiver<RelayStats> {
        self.stats_rx.clone()
    }

    pub fn upstream(&self) -> &UpstreamSession<C> {
        &self.upstream
    }

    pub fn downstream(&self) -> &DownstreamPublisher<S> {
        &self.downstream
    }

    /// Run one copy-publish-pace cycle.
    pub async fn tick(&mut self) -> Result<TickReport, RelayError> {
        let budget = self.pacer.begin_tick();

        let copied = {
            let mut target = self.downstream.write();
            self.upstream.snapshot_into(&mut target)
        };
        self.downstream.publish(copied)?;

        let pacing = budget.service(&mut self.upstream).await?;
        if pacing.overrun {
            warn!(elapsed = ?budget.elapsed(), "tick overran its budget");
        }

        let report = TickReport {
            copied,
            pacing,
            elapsed: budget.elapsed(),
        };
        self.record(&report);
        Ok(report)
    }

    /// Relay until a fatal error or a stop request, then drain.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        self.phase.begin_relaying()?;
        info!(
            interval = ?self.pacer.interval(),
            upstream = self.upstream.desktop_name(),
            "relay running"
        );

        let result = loop {
            if self.stop.is_stop_requested() {
                info!("stop requested");
                break Ok(());
            }
            if let Err(e) = self.tick().await {
                error!("relay failed: {e}");
                break Err(e);
            }
        };

        let drained = self.drain().await;
        result.and(drained)
    }

    async fn drain(&mut self) -> Result<(), RelayError> {
        self.phase.begin_draining()?;
        self.downstream.stop().await;
        self.upstream.close();
        self.phase.finish()?;
        info!(
            ticks = self.stats.ticks,
            overruns = self.stats.overruns,
            "relay stopped"
        );
        Ok(())
    }

    fn record(&mut self, report: &TickReport) {
        let framebuffer = self.upstream.framebuffer();
        let (width, height) = framebuffer.dimensions();

        self.stats.ticks += 1;
        self.stats.overruns += u64::from(report.pacing.overrun);
        self.stats.upstream_events += report.pacing.events as u64;
        self.stats.regions_published = self.downstream.regions_published();
        self.stats.resizes_applied = framebuffer.resizes_applied();
        self.stats.resizes_declined = framebuffer.resizes_declined();
        self.stats.upstream_width = width;
        self.stats.upstream_height = height;
        self.stats.last_tick = report.elapsed;
        self.stats_tx.send_replace(self.stats.clone());
    }
}

// ── Tests ────────────────────────────────────────────────────────
