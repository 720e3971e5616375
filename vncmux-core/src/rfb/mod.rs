//! # rfb: the RFB protocol on both sides of the relay
//!
//! ```text
//! upstream server ──► RfbUpstream ──► UpstreamFramebuffer
//!                                            │ (relay copy step)
//!                                            ▼
//!            viewers ◄── TcpRfbServer ◄── SharedPixels
//! ```
//!
//! ## Sub-modules
//!
//! | Module      | Purpose                                              |
//! |-------------|------------------------------------------------------|
//! | `protocol`  | Constants, pixel format and message types            |
//! | `codec`     | `tokio_util` codecs for post-handshake traffic       |
//! | `handshake` | Version, security and init exchange for both roles   |
//! | `client`    | Upstream client applying updates to a framebuffer    |
//! | `server`    | Multi-viewer server publishing a shared framebuffer  |

pub mod client;
pub mod codec;
pub mod handshake;
pub mod protocol;
pub mod server;

pub use client::{RfbClient, RfbUpstream, TcpRfbClient};
pub use codec::{RfbClientCodec, RfbServerCodec};
pub use handshake::{client_handshake, server_handshake};
pub use protocol::{ClientMessage, PixelFormat, ProtocolVersion, ServerInit, ServerMessage};
pub use server::{RfbServer, ServerOptions, TcpRfbServer};
