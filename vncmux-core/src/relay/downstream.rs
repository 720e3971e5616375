//! Downstream side of the relay: the fixed-size framebuffer viewers
//! see, and the server that publishes it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::relay::types::{PixelBuffer, Region, SharedPixels};
use crate::rfb::server::{RfbServer, ServerOptions, TcpRfbServer};

// ── DownstreamOptions ────────────────────────────────────────────

/// Size and listen endpoint of the published framebuffer.
#[derive(Debug, Clone)]
pub struct DownstreamOptions {
    pub width: u16,
    pub height: u16,
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub desktop_name: String,
    /// Upper bound for [`DownstreamPublisher::stop`].
    pub shutdown_timeout: Duration,
}

impl Default for DownstreamOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 5901,
            desktop_name: "vncmux".into(),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl DownstreamOptions {
    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            desktop_name: self.desktop_name.clone(),
        }
    }
}

// ── DownstreamPublisher ──────────────────────────────────────────

/// Owns the downstream framebuffer and the server publishing it.
///
/// The buffer is allocated once and never resized. Only the relay's
/// copy step writes it (through [`write`](Self::write)); viewer tasks
/// hold read locks while encoding.
pub struct DownstreamPublisher<S> {
    server: S,
    framebuffer: SharedPixels,
    width: u16,
    height: u16,
    published: u64,
    shutdown_timeout: Duration,
    stopped: bool,
}

impl DownstreamPublisher<TcpRfbServer> {
    /// Allocate the framebuffer, bind the listener and start serving.
    pub async fn start(options: &DownstreamOptions) -> Result<Self, RelayError> {
        let buffer = PixelBuffer::allocate(options.width, options.height)?;
        let framebuffer = Arc::new(RwLock::new(buffer));
        let mut server =
            TcpRfbServer::bind(&options.server_options(), Arc::clone(&framebuffer)).await?;
        server.run_event_loop();
        info!(
            width = options.width,
            height = options.height,
            "publishing on {}",
            server.local_addr()
        );
        Ok(Self::with_server(server, framebuffer, options.shutdown_timeout))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }
}

impl<S: RfbServer> DownstreamPublisher<S> {
    /// Wrap a server that already serves `framebuffer`.
    pub fn with_server(server: S, framebuffer: SharedPixels, shutdown_timeout: Duration) -> Self {
        let (width, height) = framebuffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dimensions();
        Self {
            server,
            framebuffer,
            width,
            height,
            published: 0,
            shutdown_timeout,
            stopped: false,
        }
    }

    /// Size fixed at start.
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn framebuffer(&self) -> &SharedPixels {
        &self.framebuffer
    }

    /// Exclusive access to the framebuffer for the copy step.
    pub fn write(&self) -> RwLockWriteGuard<'_, PixelBuffer> {
        self.framebuffer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tell the server that `region` changed. Empty regions are dropped.
    pub fn publish(&mut self, region: Region) -> Result<(), RelayError> {
        if self.stopped {
            return Err(RelayError::Publish("publisher is stopped".into()));
        }
        if region.is_empty() {
            return Ok(());
        }
        self.server.mark_region_modified(region)?;
        self.published += 1;
        Ok(())
    }

    /// Shut the server down and free the framebuffer.
    ///
    /// Safe to call more than once. Server cleanup that overruns the
    /// shutdown timeout is abandoned with a warning.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if timeout(self.shutdown_timeout, self.server.cleanup())
            .await
            .is_err()
        {
            warn!(
                "downstream cleanup did not finish within {:?}",
                self.shutdown_timeout
            );
        }
        self.write().release();
        debug!("downstream framebuffer released");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn regions_published(&self) -> u64 {
        self.published
    }

    pub fn server(&self) -> &S {
        &self.server
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::RecordingServer;

    fn publisher(width: u16, height: u16) -> DownstreamPublisher<RecordingServer> {
        let framebuffer = Arc::new(RwLock::new(PixelBuffer::allocate(width, height).unwrap()));
        DownstreamPublisher::with_server(
            RecordingServer::default(),
            framebuffer,
            Duration::from_secs(3),
        )
    }

    #[test]
    fn publish_forwards_regions() {
        let mut publisher = publisher(8, 8);
        publisher.publish(Region::full(8, 8)).unwrap();
        publisher.publish(Region::new(1, 1, 2, 2)).unwrap();

        assert_eq!(publisher.regions_published(), 2);
        assert_eq!(
            publisher.server().regions(),
            vec![Region::full(8, 8), Region::new(1, 1, 2, 2)]
        );
    }

    #[test]
    fn empty_regions_are_not_forwarded() {
        let mut publisher = publisher(8, 8);
        publisher.publish(Region::new(3, 3, 0, 5)).unwrap();
        assert_eq!(publisher.regions_published(), 0);
        assert!(publisher.server().regions().is_empty());
    }

    #[test]
    fn server_refusal_is_a_publish_error() {
        let mut publisher = publisher(8, 8);
        publisher.server().fail_next_publish();
        assert!(matches!(
            publisher.publish(Region::full(8, 8)),
            Err(RelayError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_everything() {
        let mut publisher = publisher(8, 8);
        publisher.stop().await;
        publisher.stop().await;

        assert!(publisher.is_stopped());
        assert_eq!(publisher.server().cleanups(), 1);
        assert!(publisher.framebuffer().read().unwrap().is_empty());
        assert!(publisher.publish(Region::full(8, 8)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_bounded_by_the_shutdown_timeout() {
        let framebuffer = Arc::new(RwLock::new(PixelBuffer::allocate(8, 8).unwrap()));
        let mut publisher = DownstreamPublisher::with_server(
            RecordingServer::hanging(),
            framebuffer,
            Duration::from_secs(3),
        );

        let started = tokio::time::Instant::now();
        publisher.stop().await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(publisher.is_stopped());
        assert_eq!(publisher.server().cleanups(), 1);
        assert!(publisher.framebuffer().read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tcp_publisher_binds_and_stops() {
        let options = DownstreamOptions {
            width: 32,
            height: 16,
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            ..DownstreamOptions::default()
        };
        let mut publisher = DownstreamPublisher::start(&options).await.unwrap();
        let addr = publisher.local_addr();
        assert_ne!(addr.port(), 0);
        assert_eq!(publisher.dimensions(), (32, 16));

        publisher.publish(Region::full(32, 16)).unwrap();
        publisher.stop().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
