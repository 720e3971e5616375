//! # vncmux-core
//!
//! Core library for vncmux, a relay that mirrors one VNC (RFB) server
//! to any number of VNC viewers at a fixed frame rate.
//!
//! This crate contains:
//! - **Relay**: `PixelBuffer`, `UpstreamSession`, `DownstreamPublisher`,
//!   frame pacing and the `RelayLoop` orchestrator
//! - **RFB**: protocol types, `tokio_util` codecs, handshakes, and the
//!   TCP client/server used by the relay
//! - **Error**: `RelayError`, a `thiserror`-based error type

pub mod error;
pub mod relay;
pub mod rfb;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::RelayError;
pub use relay::{
    BufferAllocator, DownstreamOptions, DownstreamPublisher, FramePacer, Pixel, PixelBuffer,
    Region, RelayConfig, RelayLoop, RelayPhase, RelayStats, StopHandle, UpstreamOptions,
    UpstreamSession,
};
pub use rfb::{RfbClient, RfbServer, TcpRfbClient, TcpRfbServer};
