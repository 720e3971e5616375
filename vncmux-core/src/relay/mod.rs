//! # relay: the framebuffer relay core
//!
//! ```text
//!            ┌──────────── RelayLoop (one task) ────────────┐
//!            │                                              │
//!  UpstreamSession ──snapshot_into──► DownstreamPublisher ──publish──► RfbServer
//!   (Mutex slot, resized                (fixed-size RwLock buffer)
//!    by the RFB client)
//!            ▲                                              │
//!            └────────── poll(remaining budget) ◄───────────┘
//! ```
//!
//! ## Sub-modules
//!
//! | Module       | Purpose                                             |
//! |--------------|-----------------------------------------------------|
//! | `types`      | `Pixel`, `Region`, `PixelBuffer`, `BufferAllocator` |
//! | `upstream`   | Upstream session and its resizable framebuffer slot |
//! | `downstream` | Fixed-size published framebuffer                    |
//! | `pacing`     | Per-tick time budget and bounded waiting            |
//! | `state`      | `RelayPhase` lifecycle state machine                |
//! | `service`    | `RelayLoop` orchestrator, stats and stop handle     |

pub mod downstream;
pub mod pacing;
pub mod service;
pub mod state;
pub mod types;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use downstream::{DownstreamOptions, DownstreamPublisher};
pub use pacing::{EventSource, FramePacer, PaceOutcome, TickBudget};
pub use service::{RelayConfig, RelayLoop, RelayStats, StopHandle, TickReport};
pub use state::RelayPhase;
pub use types::{BufferAllocator, Pixel, PixelBuffer, Region, SharedPixels};
pub use upstream::{UpstreamFramebuffer, UpstreamOptions, UpstreamSession};
