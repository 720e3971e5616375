//! Downstream RFB server.
//!
//! [`TcpRfbServer`] accepts any number of viewers on one listen
//! endpoint and serves them all from a single shared framebuffer.
//! The relay writes that framebuffer and then announces the changed
//! region with [`RfbServer::mark_region_modified`]; each viewer task
//! folds announcements into its own dirty region and answers its
//! pending update request from it.
//!
//! ```text
//!   relay ──mark_region_modified──► broadcast<Region>
//!                                     │      │      │
//!                                  viewer viewer viewer   (one task each)
//!                                     │
//!                          read lock on SharedPixels, encode Raw, send
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLockReadGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::RelayError;
use crate::relay::types::{PixelBuffer, Region, SharedPixels};
use crate::rfb::codec::RfbServerCodec;
use crate::rfb::handshake::server_handshake;
use crate::rfb::protocol::{
    ClientMessage, PixelFormat, RectBody, Rectangle, ServerInit, ServerMessage,
};

/// Region announcements buffered per viewer before it is considered
/// lagged and resynchronised with a full frame.
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Time a new viewer gets to complete the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The serving half of the relay, as seen by the publisher.
#[async_trait]
pub trait RfbServer: Send {
    /// Tell connected viewers that `region` of the shared framebuffer
    /// changed.
    fn mark_region_modified(&self, region: Region) -> Result<(), RelayError>;

    /// Stop accepting, disconnect every viewer and close the listen
    /// endpoint.
    async fn cleanup(&mut self);
}

// ── ServerOptions ────────────────────────────────────────────────

/// Where and under what name the server listens.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub desktop_name: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 5901,
            desktop_name: "vncmux".into(),
        }
    }
}

// ── TcpRfbServer ─────────────────────────────────────────────────

/// State every viewer task needs.
#[derive(Clone)]
struct ViewerContext {
    framebuffer: SharedPixels,
    updates: broadcast::Sender<Region>,
    desktop_name: Arc<str>,
    viewers: Arc<AtomicUsize>,
}

/// A TCP RFB server publishing one shared framebuffer.
pub struct TcpRfbServer {
    local_addr: SocketAddr,
    context: ViewerContext,
    cancel: CancellationToken,
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpRfbServer {
    /// Bind the listen endpoint. Viewers are not accepted until
    /// [`run_event_loop`](Self::run_event_loop) is called.
    pub async fn bind(
        options: &ServerOptions,
        framebuffer: SharedPixels,
    ) -> Result<Self, RelayError> {
        let addr = SocketAddr::new(options.listen_address, options.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind {
                port: options.listen_port,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        info!(%local_addr, "downstream listening");
        Ok(Self {
            local_addr,
            context: ViewerContext {
                framebuffer,
                updates,
                desktop_name: Arc::from(options.desktop_name.as_str()),
                viewers: Arc::new(AtomicUsize::new(0)),
            },
            cancel: CancellationToken::new(),
            listener: Some(listener),
            accept_task: None,
        })
    }

    /// Start accepting viewers on a background task. Calling it again
    /// has no effect.
    pub fn run_event_loop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let context = self.context.clone();
        let cancel = self.cancel.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, context, cancel)));
    }

    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Viewers that completed the handshake and are still connected.
    pub fn viewer_count(&self) -> usize {
        self.context.viewers.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RfbServer for TcpRfbServer {
    fn mark_region_modified(&self, region: Region) -> Result<(), RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Publish("server has been shut down".into()));
        }
        if self
            .accept_task
            .as_ref()
            .is_some_and(|task| task.is_finished())
        {
            return Err(RelayError::Publish("viewer listener stopped unexpectedly".into()));
        }
        if region.is_empty() {
            return Ok(());
        }
        // No receivers just means no viewers are connected.
        let _ = self.context.updates.send(region);
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.cancel.cancel();
        self.listener = None;
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("viewer listener panicked: {e}");
                }
            }
        }
        info!(addr = %self.local_addr, "downstream closed");
    }
}

impl Drop for TcpRfbServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, context: ViewerContext, cancel: CancellationToken) {
    let mut viewers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "viewer connecting");
                    let context = context.clone();
                    let cancel = cancel.child_token();
                    viewers.spawn(async move {
                        match serve_viewer(stream, context, cancel).await {
                            Ok(()) => info!(%peer, "viewer disconnected"),
                            Err(e) => info!(%peer, "viewer dropped: {e}"),
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = viewers.join_next(), if !viewers.is_empty() => {}
        }
    }
    drop(listener);
    viewers.shutdown().await;
}

// ── Viewer task ──────────────────────────────────────────────────

/// Decrements the viewer count when a viewer task ends, however it ends.
struct ViewerGuard(Arc<AtomicUsize>);

impl ViewerGuard {
    fn register(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(count))
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn read_pixels(framebuffer: &SharedPixels) -> RwLockReadGuard<'_, PixelBuffer> {
    framebuffer.read().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_viewer(
    mut stream: TcpStream,
    context: ViewerContext,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let (width, height) = read_pixels(&context.framebuffer).dimensions();
    let init = ServerInit {
        width,
        height,
        pixel_format: PixelFormat::RELAY,
        name: context.desktop_name.to_string(),
    };
    let version = timeout(HANDSHAKE_TIMEOUT, server_handshake(&mut stream, &init))
        .await
        .map_err(|_| RelayError::Timeout(HANDSHAKE_TIMEOUT))??;

    let _guard = ViewerGuard::register(&context.viewers);
    let mut updates = context.updates.subscribe();
    let mut framed = Framed::new(stream, RfbServerCodec);
    info!(%version, "viewer connected");

    let mut format = PixelFormat::RELAY;
    let mut requested: Option<Region> = None;
    let mut dirty = Region::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = framed.next() => {
                let Some(message) = message else {
                    return Ok(());
                };
                match message? {
                    ClientMessage::SetPixelFormat(wanted) => {
                        if !wanted.is_servable() {
                            return Err(RelayError::protocol(format!(
                                "viewer requested unsupported pixel format {wanted:?}"
                            )));
                        }
                        format = wanted;
                    }
                    ClientMessage::SetEncodings(encodings) => {
                        trace!(?encodings, "viewer encodings; serving Raw");
                    }
                    ClientMessage::FramebufferUpdateRequest { incremental: false, region } => {
                        let update = encode_update(&context.framebuffer, &format, region);
                        framed.send(update).await?;
                    }
                    ClientMessage::FramebufferUpdateRequest { incremental: true, region } => {
                        requested = Some(requested.map_or(region, |r| r.union(&region)));
                    }
                    // Viewers are read-only.
                    ClientMessage::KeyEvent { .. }
                    | ClientMessage::PointerEvent { .. }
                    | ClientMessage::ClientCutText(_) => {}
                }
            }
            update = updates.recv() => match update {
                Ok(region) => dirty = dirty.union(&region),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "viewer lagged, resending full frame");
                    dirty = Region::full(width, height);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }

        if let Some(wanted) = requested {
            if let Some(region) = dirty.intersect(&wanted) {
                let update = encode_update(&context.framebuffer, &format, region);
                framed.send(update).await?;
                requested = None;
                dirty = Region::default();
            }
        }
    }
}

/// Encode `region` of the shared framebuffer as one Raw rectangle in
/// the viewer's pixel format. The read lock is released before return.
fn encode_update(
    framebuffer: &SharedPixels,
    format: &PixelFormat,
    region: Region,
) -> ServerMessage {
    let pixels = read_pixels(framebuffer);
    let region = region.clip_to(pixels.width(), pixels.height());
    if region.is_empty() {
        return ServerMessage::FramebufferUpdate(Vec::new());
    }

    let mut data = BytesMut::with_capacity(region.area() * 4);
    let (left, right) = (region.x as usize, region.right() as usize);
    for y in region.y..region.y + region.height {
        for pixel in &pixels.row(y)[left..right] {
            data.put_slice(&format.encode(*pixel));
        }
    }
    ServerMessage::FramebufferUpdate(vec![Rectangle {
        region,
        body: RectBody::Raw(data.freeze()),
    }])
}

// ── Tests ────────────────────────────────────────────────────────
