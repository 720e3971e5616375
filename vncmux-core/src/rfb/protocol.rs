//! RFB (RFC 6143) constants and message types.
//!
//! Only the subset the relay speaks is modelled: protocol versions
//! 3.3/3.7/3.8, security type None, the fixed relay pixel format, and
//! the Raw, CopyRect and DesktopSize encodings.
//!
//! All multi-byte wire fields are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RelayError;
use crate::relay::types::{Pixel, Region};

// ── Constants ────────────────────────────────────────────────────

/// Length of the `RFB xxx.yyy\n` version banner.
pub const VERSION_LEN: usize = 12;

/// Length of an encoded [`PixelFormat`].
pub const PIXEL_FORMAT_LEN: usize = 16;

/// Largest cut-text or failure-reason payload accepted from a peer.
pub const MAX_TEXT_LEN: usize = 1024 * 1024;

/// Largest FramebufferUpdate accepted from the upstream, in bytes.
pub const MAX_UPDATE_LEN: usize = 256 * 1024 * 1024;

/// Security types.
pub mod security {
    pub const INVALID: u8 = 0;
    pub const NONE: u8 = 1;
    pub const VNC_AUTH: u8 = 2;
}

/// Encoding numbers used by the relay.
pub mod encoding {
    pub const RAW: i32 = 0;
    pub const COPY_RECT: i32 = 1;
    /// Pseudo-encoding: the server announces a new framebuffer size.
    pub const DESKTOP_SIZE: i32 = -223;
}

/// Server → client message types.
pub mod server_msg {
    pub const FRAMEBUFFER_UPDATE: u8 = 0;
    pub const SET_COLOUR_MAP_ENTRIES: u8 = 1;
    pub const BELL: u8 = 2;
    pub const SERVER_CUT_TEXT: u8 = 3;
}

/// Client → server message types.
pub mod client_msg {
    pub const SET_PIXEL_FORMAT: u8 = 0;
    pub const SET_ENCODINGS: u8 = 2;
    pub const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
    pub const KEY_EVENT: u8 = 4;
    pub const POINTER_EVENT: u8 = 5;
    pub const CLIENT_CUT_TEXT: u8 = 6;
}

// ── ProtocolVersion ──────────────────────────────────────────────

/// Protocol versions the relay can speak, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    /// The version banner as sent on the wire.
    pub const fn banner(self) -> &'static [u8; VERSION_LEN] {
        match self {
            ProtocolVersion::V3_3 => b"RFB 003.003\n",
            ProtocolVersion::V3_7 => b"RFB 003.007\n",
            ProtocolVersion::V3_8 => b"RFB 003.008\n",
        }
    }

    /// Parse a peer's banner, mapping it onto the closest version we
    /// support. Unknown 3.x minors below 7 fall back to 3.3 and
    /// anything newer than 3.8 is treated as 3.8.
    pub fn parse(banner: &[u8; VERSION_LEN]) -> Result<Self, RelayError> {
        let text = std::str::from_utf8(banner)
            .map_err(|_| RelayError::protocol("version banner is not ASCII"))?;
        let digits = text
            .strip_prefix("RFB ")
            .and_then(|rest| rest.strip_suffix('\n'))
            .ok_or_else(|| RelayError::protocol(format!("malformed version banner {text:?}")))?;
        let (major, minor) = digits
            .split_once('.')
            .ok_or_else(|| RelayError::protocol(format!("malformed version banner {text:?}")))?;
        let major: u32 = major
            .parse()
            .map_err(|_| RelayError::protocol(format!("malformed version banner {text:?}")))?;
        let minor: u32 = minor
            .parse()
            .map_err(|_| RelayError::protocol(format!("malformed version banner {text:?}")))?;

        match (major, minor) {
            (3, m) if m >= 8 => Ok(ProtocolVersion::V3_8),
            (3, 7) => Ok(ProtocolVersion::V3_7),
            (3, _) => Ok(ProtocolVersion::V3_3),
            (m, _) if m > 3 => Ok(ProtocolVersion::V3_8),
            _ => Err(RelayError::protocol(format!(
                "unsupported protocol version {major}.{minor}"
            ))),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V3_3 => write!(f, "3.3"),
            ProtocolVersion::V3_7 => write!(f, "3.7"),
            ProtocolVersion::V3_8 => write!(f, "3.8"),
        }
    }
}

// ── PixelFormat ──────────────────────────────────────────────────

/// The RFB PIXEL_FORMAT structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The one format used by every buffer in the relay: 32 bpp,
    /// depth 24, little-endian, 8 bits per channel, red in the low byte.
    pub const RELAY: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 0,
        green_shift: 8,
        blue_shift: 16,
    };

    pub fn to_bytes(&self) -> [u8; PIXEL_FORMAT_LEN] {
        let mut buf = [0u8; PIXEL_FORMAT_LEN];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = self.big_endian as u8;
        buf[3] = self.true_colour as u8;
        buf[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        buf[10] = self.red_shift;
        buf[11] = self.green_shift;
        buf[12] = self.blue_shift;
        buf
    }

    pub fn from_bytes(buf: &[u8; PIXEL_FORMAT_LEN]) -> Self {
        Self {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian: buf[2] != 0,
            true_colour: buf[3] != 0,
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
        }
    }

    /// Whether relay pixels can be translated into this format.
    ///
    /// Only 32-bpp true-colour layouts are served; palette and
    /// 8/16-bpp viewers are refused.
    pub fn is_servable(&self) -> bool {
        self.bits_per_pixel == 32
            && self.true_colour
            && self.red_shift < 32
            && self.green_shift < 32
            && self.blue_shift < 32
    }

    /// Translate one relay pixel into this format's 4 wire bytes.
    pub fn encode(&self, pixel: Pixel) -> [u8; 4] {
        if *self == PixelFormat::RELAY {
            return pixel.to_wire();
        }
        let scale = |channel: u8, max: u16| (channel as u32 * max as u32 + 127) / 255;
        let word = scale(pixel.red(), self.red_max) << self.red_shift
            | scale(pixel.green(), self.green_max) << self.green_shift
            | scale(pixel.blue(), self.blue_max) << self.blue_shift;
        if self.big_endian {
            word.to_be_bytes()
        } else {
            word.to_le_bytes()
        }
    }
}

// ── ServerInit ───────────────────────────────────────────────────

/// The ServerInit message that ends the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    /// Length of the fixed part preceding the name bytes.
    pub const FIXED_LEN: usize = 24;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::FIXED_LEN + self.name.len());
        dst.put_u16(self.width);
        dst.put_u16(self.height);
        dst.put_slice(&self.pixel_format.to_bytes());
        dst.put_u32(self.name.len() as u32);
        dst.put_slice(self.name.as_bytes());
    }
}

// ── Client → server messages ─────────────────────────────────────

/// Messages sent by a viewer (or by the relay to its upstream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, region: Region },
    KeyEvent { down: bool, key: u32 },
    PointerEvent { buttons: u8, x: u16, y: u16 },
    ClientCutText(Bytes),
}

impl ClientMessage {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            ClientMessage::SetPixelFormat(format) => {
                dst.put_u8(client_msg::SET_PIXEL_FORMAT);
                dst.put_bytes(0, 3);
                dst.put_slice(&format.to_bytes());
            }
            ClientMessage::SetEncodings(encodings) => {
                dst.put_u8(client_msg::SET_ENCODINGS);
                dst.put_u8(0);
                dst.put_u16(encodings.len() as u16);
                for encoding in encodings {
                    dst.put_i32(*encoding);
                }
            }
            ClientMessage::FramebufferUpdateRequest {
                incremental,
                region,
            } => {
                dst.put_u8(client_msg::FRAMEBUFFER_UPDATE_REQUEST);
                dst.put_u8(*incremental as u8);
                put_region(dst, region);
            }
            ClientMessage::KeyEvent { down, key } => {
                dst.put_u8(client_msg::KEY_EVENT);
                dst.put_u8(*down as u8);
                dst.put_bytes(0, 2);
                dst.put_u32(*key);
            }
            ClientMessage::PointerEvent { buttons, x, y } => {
                dst.put_u8(client_msg::POINTER_EVENT);
                dst.put_u8(*buttons);
                dst.put_u16(*x);
                dst.put_u16(*y);
            }
            ClientMessage::ClientCutText(text) => {
                dst.put_u8(client_msg::CLIENT_CUT_TEXT);
                dst.put_bytes(0, 3);
                dst.put_u32(text.len() as u32);
                dst.put_slice(text);
            }
        }
    }
}

// ── Server → client messages ─────────────────────────────────────

/// Payload of one FramebufferUpdate rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RectBody {
    /// `width * height` pixels in the client's pixel format.
    Raw(Bytes),
    /// Copy the same-sized block from `(src_x, src_y)`.
    CopyRect { src_x: u16, src_y: u16 },
    /// The framebuffer now has the rectangle's width and height.
    DesktopSize,
}

impl RectBody {
    pub fn encoding(&self) -> i32 {
        match self {
            RectBody::Raw(_) => encoding::RAW,
            RectBody::CopyRect { .. } => encoding::COPY_RECT,
            RectBody::DesktopSize => encoding::DESKTOP_SIZE,
        }
    }
}

/// One rectangle of a FramebufferUpdate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    pub region: Region,
    pub body: RectBody,
}

/// Messages sent by a server (the upstream, or the relay to viewers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    FramebufferUpdate(Vec<Rectangle>),
    SetColourMapEntries { first_colour: u16, colours: u16 },
    Bell,
    ServerCutText(Bytes),
}

impl ServerMessage {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            ServerMessage::FramebufferUpdate(rects) => {
                dst.put_u8(server_msg::FRAMEBUFFER_UPDATE);
                dst.put_u8(0);
                dst.put_u16(rects.len() as u16);
                for rect in rects {
                    put_region(dst, &rect.region);
                    dst.put_i32(rect.body.encoding());
                    match &rect.body {
                        RectBody::Raw(data) => dst.put_slice(data),
                        RectBody::CopyRect { src_x, src_y } => {
                            dst.put_u16(*src_x);
                            dst.put_u16(*src_y);
                        }
                        RectBody::DesktopSize => {}
                    }
                }
            }
            ServerMessage::SetColourMapEntries {
                first_colour,
                colours,
            } => {
                dst.put_u8(server_msg::SET_COLOUR_MAP_ENTRIES);
                dst.put_u8(0);
                dst.put_u16(*first_colour);
                dst.put_u16(*colours);
                dst.put_bytes(0, *colours as usize * 6);
            }
            ServerMessage::Bell => dst.put_u8(server_msg::BELL),
            ServerMessage::ServerCutText(text) => {
                dst.put_u8(server_msg::SERVER_CUT_TEXT);
                dst.put_bytes(0, 3);
                dst.put_u32(text.len() as u32);
                dst.put_slice(text);
            }
        }
    }
}

fn put_region(dst: &mut BytesMut, region: &Region) {
    dst.put_u16(region.x);
    dst.put_u16(region.y);
    dst.put_u16(region.width);
    dst.put_u16(region.height);
}

// ── Tests ────────────────────────────────────────────────────────
