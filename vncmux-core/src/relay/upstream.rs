//! Upstream side of the relay: one RFB client and the framebuffer it
//! mirrors.
//!
//! The framebuffer lives in an [`UpstreamFramebuffer`] slot guarded by
//! a single mutex. Resize swaps a freshly allocated buffer into the
//! slot; the relay's copy step reads the slot under the same mutex, so
//! a reader sees either the old buffer or the new one, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, trace, warn};

use crate::error::RelayError;
use crate::relay::pacing::EventSource;
use crate::relay::types::{BufferAllocator, PixelBuffer, Region};
use crate::rfb::client::{RfbClient, TcpRfbClient};

// ── UpstreamOptions ──────────────────────────────────────────────

/// How to reach the upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub host: String,
    pub port: u16,
    /// Upper bound for TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Largest framebuffer the upstream may announce, in pixels.
    pub max_pixels: Option<usize>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5900,
            connect_timeout: Duration::from_secs(10),
            max_pixels: None,
        }
    }
}

impl UpstreamOptions {
    pub fn allocator(&self) -> BufferAllocator {
        match self.max_pixels {
            Some(max) => BufferAllocator::with_limit(max),
            None => BufferAllocator::unbounded(),
        }
    }
}

// ── UpstreamFramebuffer ──────────────────────────────────────────

/// The mutex-guarded slot holding the upstream framebuffer.
///
/// The RFB client writes into it while handling messages; the relay
/// copies out of it once per tick.
#[derive(Debug)]
pub struct UpstreamFramebuffer {
    slot: Mutex<PixelBuffer>,
    allocator: BufferAllocator,
    updates_received: AtomicU64,
    resizes_applied: AtomicU64,
    resizes_declined: AtomicU64,
}

impl UpstreamFramebuffer {
    /// An empty (0×0) slot.
    pub fn new(allocator: BufferAllocator) -> Self {
        Self {
            slot: Mutex::new(PixelBuffer::empty()),
            allocator,
            updates_received: AtomicU64::new(0),
            resizes_applied: AtomicU64::new(0),
            resizes_declined: AtomicU64::new(0),
        }
    }

    /// Replace the buffer with a zeroed `width × height` one.
    ///
    /// The new buffer is allocated before the lock is taken and the
    /// old one is freed after it is released; only the swap happens
    /// under the lock. Returns `false` and keeps the current buffer
    /// when the allocation fails.
    pub fn on_resize_requested(&self, width: u16, height: u16) -> bool {
        let fresh = match self.allocator.allocate(width, height) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.resizes_declined.fetch_add(1, Ordering::Relaxed);
                warn!("declining upstream resize: {e}");
                return false;
            }
        };

        let old = std::mem::replace(&mut *self.lock(), fresh);
        drop(old);

        self.resizes_applied.fetch_add(1, Ordering::Relaxed);
        info!(width, height, "upstream framebuffer resized");
        true
    }

    /// Acknowledge that the client finished writing `region`.
    pub fn on_update_received(&self, region: Region) {
        self.updates_received.fetch_add(1, Ordering::Relaxed);
        trace!(%region, "upstream update");
    }

    /// Store raw pixel bytes for `region`, clipped to the buffer.
    pub fn write_rect(&self, region: Region, data: &[u8]) -> usize {
        self.lock().write_rect(region, data)
    }

    /// Apply a CopyRect inside the buffer.
    pub fn copy_rect(&self, src_x: u16, src_y: u16, region: Region) {
        self.lock().copy_rect(src_x, src_y, region);
    }

    /// Copy the current buffer into `target`, clipped to the smaller
    /// extent. Returns the copied region.
    pub fn snapshot_into(&self, target: &mut PixelBuffer) -> Region {
        target.copy_clipped_from(&self.lock())
    }

    /// Run `f` with shared access to the current buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&PixelBuffer) -> R) -> R {
        f(&self.lock())
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.lock().dimensions()
    }

    /// Free the buffer, leaving a 0×0 slot. Idempotent.
    pub fn release(&self) {
        let old = std::mem::take(&mut *self.lock());
        drop(old);
    }

    pub fn updates_received(&self) -> u64 {
        self.updates_received.load(Ordering::Relaxed)
    }

    pub fn resizes_applied(&self) -> u64 {
        self.resizes_applied.load(Ordering::Relaxed)
    }

    pub fn resizes_declined(&self) -> u64 {
        self.resizes_declined.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, PixelBuffer> {
        // A panic while holding the lock cannot leave a torn buffer:
        // every mutation either swaps whole buffers or writes pixels
        // within fixed bounds.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── UpstreamSession ──────────────────────────────────────────────

/// A connected upstream: the RFB client plus the framebuffer slot it
/// feeds.
pub struct UpstreamSession<C> {
    client: C,
    framebuffer: Arc<UpstreamFramebuffer>,
}

impl UpstreamSession<TcpRfbClient> {
    /// Connect over TCP and allocate the initial framebuffer.
    ///
    /// Any failure here is fatal; there is no retry.
    pub async fn connect(options: &UpstreamOptions) -> Result<Self, RelayError> {
        info!("connecting to {}:{}", options.host, options.port);
        let client =
            TcpRfbClient::connect(&options.host, options.port, options.connect_timeout).await?;
        Self::new(client, options.allocator())
    }
}

impl<C: RfbClient> UpstreamSession<C> {
    /// Wrap an already handshaken client.
    ///
    /// The initial buffer is allocated through the resize path; if that
    /// fails the session cannot start and `OutOfMemory` is returned.
    pub fn new(client: C, allocator: BufferAllocator) -> Result<Self, RelayError> {
        let framebuffer = Arc::new(UpstreamFramebuffer::new(allocator));
        let (width, height) = client.dimensions();
        if !framebuffer.on_resize_requested(width, height) {
            return Err(RelayError::OutOfMemory { width, height });
        }
        info!(
            width,
            height,
            name = client.desktop_name(),
            "upstream session established"
        );
        Ok(Self {
            client,
            framebuffer,
        })
    }

    /// See [`UpstreamFramebuffer::on_resize_requested`].
    pub fn on_resize_requested(&self, width: u16, height: u16) -> bool {
        self.framebuffer.on_resize_requested(width, height)
    }

    /// See [`UpstreamFramebuffer::on_update_received`].
    pub fn on_update_received(&self, region: Region) {
        self.framebuffer.on_update_received(region);
    }

    /// Service upstream messages for at most `timeout`.
    ///
    /// Returns the number of messages handled. Errors are fatal.
    pub async fn poll(&mut self, timeout: Duration) -> Result<usize, RelayError> {
        self.client.poll_messages(timeout, &self.framebuffer).await
    }

    /// See [`UpstreamFramebuffer::snapshot_into`].
    pub fn snapshot_into(&self, target: &mut PixelBuffer) -> Region {
        self.framebuffer.snapshot_into(target)
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.framebuffer.dimensions()
    }

    pub fn desktop_name(&self) -> &str {
        self.client.desktop_name()
    }

    /// Shared handle to the framebuffer slot.
    pub fn framebuffer(&self) -> &Arc<UpstreamFramebuffer> {
        &self.framebuffer
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Release the framebuffer. The client connection closes on drop.
    pub fn close(&mut self) {
        self.framebuffer.release();
    }
}

#[async_trait]
impl<C: RfbClient> EventSource for UpstreamSession<C> {
    async fn wait_for_events(&mut self, timeout: Duration) -> Result<usize, RelayError> {
        self.poll(timeout).await
    }
}

// ── Tests ────────────────────────────────────────────────────────
