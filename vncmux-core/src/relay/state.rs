//! Relay lifecycle state machine.
//!
//! Transitions are validated and return `Result` instead of
//! panicking, like the rest of the crate.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::RelayError;

// ── RelayPhase ───────────────────────────────────────────────────

/// The current phase of a relay.
///
/// ```text
///  Connecting ──► Relaying ──► Draining ──► Stopped
///       │                          ▲
///       └──────────────────────────┘
/// ```
///
/// A relay that fails while connecting is never constructed, so it
/// has no phase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RelayPhase {
    /// Upstream session and downstream publisher are being set up.
    #[default]
    Connecting,

    /// Steady-state copy-and-pace cycle.
    Relaying {
        /// When the relay entered the `Relaying` state.
        since: Instant,
    },

    /// Releasing both framebuffers and the listen endpoint.
    Draining,

    /// Terminal.
    Stopped,
}

impl std::fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Relaying { .. } => write!(f, "Relaying"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl RelayPhase {
    pub fn is_relaying(&self) -> bool {
        matches!(self, Self::Relaying { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// How long the relay has been relaying; `None` in other phases.
    pub fn relaying_duration(&self) -> Option<Duration> {
        match self {
            Self::Relaying { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn begin_relaying(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting => {
                *self = Self::Relaying {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot relay: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Relaying`.
    pub fn begin_draining(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting | Self::Relaying { .. } => {
                *self = Self::Draining;
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot drain: not in Connecting or Relaying state",
            )),
        }
    }

    /// Valid from: `Draining`.
    pub fn finish(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Draining => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot stop: not in Draining state",
            )),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
