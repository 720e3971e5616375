//! In-memory stand-ins for the RFB capabilities, used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::relay::types::{Pixel, Region};
use crate::relay::upstream::UpstreamFramebuffer;
use crate::rfb::client::RfbClient;
use crate::rfb::server::RfbServer;

/// One scripted upstream event.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Fill `region` with one colour.
    Update { region: Region, fill: Pixel },
    /// Announce a new framebuffer size.
    Resize(u16, u16),
    /// Fail the poll with a protocol error.
    Fail(String),
}

/// An upstream that replays one step per poll, then goes quiet.
///
/// A quiet client sleeps for the whole timeout, like a real client
/// with nothing on the wire.
#[derive(Debug)]
pub struct ScriptedClient {
    width: u16,
    height: u16,
    steps: VecDeque<ScriptStep>,
}

impl ScriptedClient {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            steps: VecDeque::new(),
        }
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.steps.extend(steps);
        self
    }
}

#[async_trait]
impl RfbClient for ScriptedClient {
    async fn poll_messages(
        &mut self,
        timeout: Duration,
        framebuffer: &UpstreamFramebuffer,
    ) -> Result<usize, RelayError> {
        match self.steps.pop_front() {
            None => {
                tokio::time::sleep(timeout).await;
                Ok(0)
            }
            Some(ScriptStep::Update { region, fill }) => {
                let data: Vec<u8> = (0..region.area()).flat_map(|_| fill.to_wire()).collect();
                framebuffer.write_rect(region, &data);
                framebuffer.on_update_received(region);
                Ok(1)
            }
            Some(ScriptStep::Resize(width, height)) => {
                if framebuffer.on_resize_requested(width, height) {
                    self.width = width;
                    self.height = height;
                }
                Ok(1)
            }
            Some(ScriptStep::Fail(reason)) => Err(RelayError::Protocol(reason)),
        }
    }

    fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    fn desktop_name(&self) -> &str {
        "scripted"
    }
}

/// A server that records every published region.
///
/// Clones share state, so a test can keep one while the relay owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct RecordingServer {
    regions: Arc<Mutex<Vec<Region>>>,
    fail_next: Arc<AtomicBool>,
    cleanups: Arc<AtomicUsize>,
    hang_cleanup: bool,
}

impl RecordingServer {
    /// A server whose `cleanup` never completes.
    pub fn hanging() -> Self {
        Self {
            hang_cleanup: true,
            ..Self::default()
        }
    }

    pub fn regions(&self) -> Vec<Region> {
        self.regions.lock().unwrap().clone()
    }

    /// Make the next `mark_region_modified` fail.
    pub fn fail_next_publish(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RfbServer for RecordingServer {
    fn mark_region_modified(&self, region: Region) -> Result<(), RelayError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Publish("scripted failure".into()));
        }
        self.regions.lock().unwrap().push(region);
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.hang_cleanup {
            std::future::pending::<()>().await;
        }
    }
}
