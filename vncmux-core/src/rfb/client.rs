//! Upstream RFB client.
//!
//! [`RfbUpstream`] negotiates the relay pixel format with the upstream
//! server, then applies every framebuffer update it receives to an
//! [`UpstreamFramebuffer`]. Each update is answered with the next
//! update request, so the server always has exactly one outstanding
//! request.

use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

use crate::error::RelayError;
use crate::relay::types::Region;
use crate::relay::upstream::UpstreamFramebuffer;
use crate::rfb::codec::RfbClientCodec;
use crate::rfb::handshake::client_handshake;
use crate::rfb::protocol::{
    ClientMessage, PixelFormat, ProtocolVersion, RectBody, ServerMessage, encoding,
};

/// Messages handled per poll once the first one has arrived, as long
/// as more are already buffered and the poll deadline has not passed.
pub const MAX_BURST: usize = 64;

/// The client half of an upstream connection, as seen by the relay.
#[async_trait]
pub trait RfbClient: Send {
    /// Wait up to `timeout` for server messages and apply them to
    /// `framebuffer`. Returns the number of messages handled; zero
    /// means the timeout expired first.
    async fn poll_messages(
        &mut self,
        timeout: Duration,
        framebuffer: &UpstreamFramebuffer,
    ) -> Result<usize, RelayError>;

    /// Framebuffer size last accepted from the server.
    fn dimensions(&self) -> (u16, u16);

    fn desktop_name(&self) -> &str;
}

// ── RfbUpstream ──────────────────────────────────────────────────

/// An RFB client over any byte stream.
pub struct RfbUpstream<S> {
    framed: Framed<S, RfbClientCodec>,
    width: u16,
    height: u16,
    name: String,
    version: ProtocolVersion,
}

/// The client used in production.
pub type TcpRfbClient = RfbUpstream<TcpStream>;

impl TcpRfbClient {
    /// Connect and handshake, both within `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let deadline = Instant::now() + connect_timeout;
        let timed_out = || {
            RelayError::Connection(format!(
                "{host}:{port}: timed out after {connect_timeout:?}"
            ))
        };

        let stream = timeout_at(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| RelayError::Connection(format!("{host}:{port}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }

        let client = timeout_at(deadline, Self::handshake(stream))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| match e {
                RelayError::Connection(_) => e,
                other => RelayError::Connection(format!("{host}:{port}: {other}")),
            })?;
        info!(
            version = %client.version,
            "connected to {host}:{port} ({}x{})",
            client.width,
            client.height
        );
        Ok(client)
    }
}

impl<S> RfbUpstream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake on an open stream, set the relay pixel format
    /// and encodings, and request the first full frame.
    pub async fn handshake(mut stream: S) -> Result<Self, RelayError> {
        let (version, init) = client_handshake(&mut stream).await?;
        if init.pixel_format != PixelFormat::RELAY {
            debug!(
                format = ?init.pixel_format,
                "upstream native format differs, requesting relay format"
            );
        }

        let mut framed = Framed::new(stream, RfbClientCodec);
        framed
            .feed(ClientMessage::SetPixelFormat(PixelFormat::RELAY))
            .await?;
        framed
            .feed(ClientMessage::SetEncodings(vec![
                encoding::RAW,
                encoding::COPY_RECT,
                encoding::DESKTOP_SIZE,
            ]))
            .await?;
        framed
            .send(ClientMessage::FramebufferUpdateRequest {
                incremental: false,
                region: Region::full(init.width, init.height),
            })
            .await?;

        Ok(Self {
            framed,
            width: init.width,
            height: init.height,
            name: init.name,
            version,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn handle(
        &mut self,
        message: ServerMessage,
        framebuffer: &UpstreamFramebuffer,
    ) -> Result<(), RelayError> {
        match message {
            ServerMessage::FramebufferUpdate(rects) => {
                let mut resized = false;
                for rect in rects {
                    match rect.body {
                        RectBody::Raw(data) => {
                            framebuffer.write_rect(rect.region, &data);
                            framebuffer.on_update_received(rect.region);
                        }
                        RectBody::CopyRect { src_x, src_y } => {
                            framebuffer.copy_rect(src_x, src_y, rect.region);
                            framebuffer.on_update_received(rect.region);
                        }
                        RectBody::DesktopSize => {
                            let (width, height) = (rect.region.width, rect.region.height);
                            if framebuffer.on_resize_requested(width, height) {
                                self.width = width;
                                self.height = height;
                                resized = true;
                            }
                        }
                    }
                }
                // A new size invalidates everything, so ask for it all.
                self.framed
                    .send(ClientMessage::FramebufferUpdateRequest {
                        incremental: !resized,
                        region: Region::full(self.width, self.height),
                    })
                    .await?;
            }
            ServerMessage::SetColourMapEntries { colours, .. } => {
                debug!(colours, "ignoring colour map from true-colour upstream");
            }
            ServerMessage::Bell => trace!("upstream bell"),
            ServerMessage::ServerCutText(text) => {
                debug!(len = text.len(), "ignoring upstream clipboard");
            }
        }
        Ok(())
    }
}

/// Read failures mean the upstream is gone; report them as such.
fn upstream_lost(err: RelayError) -> RelayError {
    match err {
        RelayError::Io(e) => RelayError::Protocol(format!("upstream read failed: {e}")),
        other => other,
    }
}

#[async_trait]
impl<S> RfbClient for RfbUpstream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn poll_messages(
        &mut self,
        wait: Duration,
        framebuffer: &UpstreamFramebuffer,
    ) -> Result<usize, RelayError> {
        let deadline = Instant::now() + wait;
        let first = match timeout_at(deadline, self.framed.next()).await {
            Err(_) => return Ok(0),
            Ok(None) => return Err(RelayError::protocol("upstream closed the connection")),
            Ok(Some(message)) => message.map_err(upstream_lost)?,
        };
        self.handle(first, framebuffer).await?;

        let mut handled = 1;
        while handled < MAX_BURST && Instant::now() < deadline {
            match self.framed.next().now_or_never() {
                Some(Some(message)) => {
                    let message = message.map_err(upstream_lost)?;
                    self.handle(message, framebuffer).await?;
                    handled += 1;
                }
                Some(None) => {
                    return Err(RelayError::protocol("upstream closed the connection"));
                }
                None => break,
            }
        }
        Ok(handled)
    }

    fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    fn desktop_name(&self) -> &str {
        &self.name
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::{BufferAllocator, Pixel};
    use crate::rfb::protocol::{Rectangle, ServerInit, security, server_msg};
    use bytes::{Bytes, BytesMut};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_test::io::Builder;

    fn client_bytes(messages: &[ClientMessage]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn server_bytes(message: &ServerMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        buf.to_vec()
    }

    /// A 3.8 handshake for a `width × height` server, followed by the
    /// client's setup messages.
    fn handshake_script(builder: &mut Builder, width: u16, height: u16) {
        let mut init = BytesMut::new();
        ServerInit {
            width,
            height,
            pixel_format: PixelFormat::RELAY,
            name: "upstream".into(),
        }
        .encode(&mut init);

        builder
            .read(b"RFB 003.008\n")
            .write(b"RFB 003.008\n")
            .read(&[1, security::NONE])
            .write(&[security::NONE])
            .read(&[0, 0, 0, 0])
            .write(&[1])
            .read(&init)
            .write(&client_bytes(&[
                ClientMessage::SetPixelFormat(PixelFormat::RELAY),
                ClientMessage::SetEncodings(vec![
                    encoding::RAW,
                    encoding::COPY_RECT,
                    encoding::DESKTOP_SIZE,
                ]),
                ClientMessage::FramebufferUpdateRequest {
                    incremental: false,
                    region: Region::full(width, height),
                },
            ]));
    }

    fn raw_update(region: Region, fill: Pixel) -> ServerMessage {
        let data: Vec<u8> = (0..region.area()).flat_map(|_| fill.to_wire()).collect();
        ServerMessage::FramebufferUpdate(vec![Rectangle {
            region,
            body: RectBody::Raw(Bytes::from(data)),
        }])
    }

    async fn connected<S>(stream: S) -> (RfbUpstream<S>, UpstreamFramebuffer)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let client = RfbUpstream::handshake(stream).await.unwrap();
        let framebuffer = UpstreamFramebuffer::new(BufferAllocator::unbounded());
        let (width, height) = client.dimensions();
        assert!(framebuffer.on_resize_requested(width, height));
        (client, framebuffer)
    }

    /// Serves a 3.8 handshake, then one Bell per read, each read
    /// blocking for `delay` of wall time. Writes are discarded.
    struct SlowBells {
        preamble: Vec<u8>,
        sent: usize,
        delay: Duration,
    }

    impl SlowBells {
        fn new(width: u16, height: u16, delay: Duration) -> Self {
            let mut preamble = b"RFB 003.008\n".to_vec();
            preamble.extend_from_slice(&[1, security::NONE, 0, 0, 0, 0]);
            let mut init = BytesMut::new();
            ServerInit {
                width,
                height,
                pixel_format: PixelFormat::RELAY,
                name: "slow".into(),
            }
            .encode(&mut init);
            preamble.extend_from_slice(&init);
            Self {
                preamble,
                sent: 0,
                delay,
            }
        }
    }

    impl AsyncRead for SlowBells {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            if this.sent < this.preamble.len() {
                let n = buf.remaining().min(this.preamble.len() - this.sent);
                buf.put_slice(&this.preamble[this.sent..this.sent + n]);
                this.sent += n;
            } else {
                std::thread::sleep(this.delay);
                buf.put_slice(&[server_msg::BELL]);
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for SlowBells {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn handshake_requests_full_frame() {
        let mut builder = Builder::new();
        handshake_script(&mut builder, 4, 2);
        let client = RfbUpstream::handshake(builder.build()).await.unwrap();

        assert_eq!(client.dimensions(), (4, 2));
        assert_eq!(client.desktop_name(), "upstream");
        assert_eq!(client.version(), ProtocolVersion::V3_8);
    }

    #[tokio::test]
    async fn raw_update_is_applied_and_followed_by_incremental_request() {
        let fill = Pixel::from_rgb(10, 20, 30);
        let mut builder = Builder::new();
        handshake_script(&mut builder, 4, 2);
        builder
            .read(&server_bytes(&raw_update(Region::full(4, 2), fill)))
            .write(&client_bytes(&[ClientMessage::FramebufferUpdateRequest {
                incremental: true,
                region: Region::full(4, 2),
            }]))
            .wait(Duration::from_secs(3600));
        let (mut client, framebuffer) = connected(builder.build()).await;

        let handled = client
            .poll_messages(Duration::from_millis(50), &framebuffer)
            .await
            .unwrap();

        assert_eq!(handled, 1);
        assert_eq!(framebuffer.updates_received(), 1);
        framebuffer.with_buffer(|b| assert!(b.pixels().iter().all(|p| *p == fill)));
    }

    #[tokio::test]
    async fn desktop_size_resizes_and_requests_full_frame() {
        let mut builder = Builder::new();
        handshake_script(&mut builder, 4, 2);
        builder
            .read(&server_bytes(&ServerMessage::FramebufferUpdate(vec![
                Rectangle {
                    region: Region::full(8, 6),
                    body: RectBody::DesktopSize,
                },
            ])))
            .write(&client_bytes(&[ClientMessage::FramebufferUpdateRequest {
                incremental: false,
                region: Region::full(8, 6),
            }]))
            .wait(Duration::from_secs(3600));
        let (mut client, framebuffer) = connected(builder.build()).await;

        client
            .poll_messages(Duration::from_millis(50), &framebuffer)
            .await
            .unwrap();

        assert_eq!(client.dimensions(), (8, 6));
        assert_eq!(framebuffer.dimensions(), (8, 6));
    }

    #[tokio::test]
    async fn buffered_messages_are_handled_in_one_poll() {
        let mut builder = Builder::new();
        handshake_script(&mut builder, 2, 2);
        let mut burst = server_bytes(&ServerMessage::Bell);
        burst.extend(server_bytes(&ServerMessage::Bell));
        burst.extend(server_bytes(&ServerMessage::ServerCutText(Bytes::from_static(
            b"clip",
        ))));
        builder.read(&burst).wait(Duration::from_secs(3600));
        let (mut client, framebuffer) = connected(builder.build()).await;

        let handled = client
            .poll_messages(Duration::from_millis(50), &framebuffer)
            .await
            .unwrap();
        assert_eq!(handled, 3);
    }

    #[tokio::test]
    async fn slow_burst_stops_at_the_poll_deadline() {
        let stream = SlowBells::new(2, 2, Duration::from_millis(5));
        let (mut client, framebuffer) = connected(stream).await;

        let started = std::time::Instant::now();
        let handled = client
            .poll_messages(Duration::from_millis(10), &framebuffer)
            .await
            .unwrap();
        let took = started.elapsed();

        assert!(handled >= 1);
        assert!(handled < MAX_BURST, "handled {handled}");
        assert!(took < Duration::from_millis(100), "took {took:?}");
    }

    #[tokio::test]
    async fn quiet_upstream_times_out_with_zero() {
        let mut builder = Builder::new();
        handshake_script(&mut builder, 2, 2);
        builder.wait(Duration::from_secs(3600));
        let (mut client, framebuffer) = connected(builder.build()).await;

        let handled = client
            .poll_messages(Duration::from_millis(10), &framebuffer)
            .await
            .unwrap();
        assert_eq!(handled, 0);
    }

    #[tokio::test]
    async fn closed_upstream_is_a_protocol_error() {
        let mut builder = Builder::new();
        handshake_script(&mut builder, 2, 2);
        let (mut client, framebuffer) = connected(builder.build()).await;

        let err = client
            .poll_messages(Duration::from_millis(10), &framebuffer)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_connection_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpRfbClient::connect("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RelayError::Connection(_))));
    }
}
