//! `tokio_util` codecs for post-handshake RFB traffic.
//!
//! [`RfbClientCodec`] is used on the relay's upstream connection: it
//! decodes [`ServerMessage`]s and encodes [`ClientMessage`]s.
//! [`RfbServerCodec`] is the mirror image used for each downstream
//! viewer.
//!
//! Decoders never consume bytes until a whole message is buffered, so
//! `Framed::next()` can be raced against a timeout without losing data.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RelayError;
use crate::relay::types::Region;
use crate::rfb::protocol::{
    ClientMessage, MAX_TEXT_LEN, MAX_UPDATE_LEN, PIXEL_FORMAT_LEN, PixelFormat, RectBody,
    Rectangle, ServerMessage, client_msg, encoding, server_msg,
};

/// Bytes per pixel on every connection the relay decodes.
const BYTES_PER_PIXEL: usize = 4;

fn be_u16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn be_u32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn region_at(src: &[u8], at: usize) -> Region {
    Region::new(
        be_u16(src, at),
        be_u16(src, at + 2),
        be_u16(src, at + 4),
        be_u16(src, at + 6),
    )
}

/// Ask for room for the rest of a message and report "not yet".
fn incomplete<T>(src: &mut BytesMut, needed: usize) -> Result<Option<T>, RelayError> {
    src.reserve(needed.saturating_sub(src.len()));
    Ok(None)
}

// ── RfbClientCodec ───────────────────────────────────────────────

/// Upstream side: server messages in, client messages out.
#[derive(Debug, Default)]
pub struct RfbClientCodec;

impl RfbClientCodec {
    fn decode_update(src: &mut BytesMut) -> Result<Option<ServerMessage>, RelayError> {
        const HEADER: usize = 4;
        const RECT_HEADER: usize = 12;

        if src.len() < HEADER {
            return incomplete(src, HEADER);
        }
        let count = be_u16(src, 2) as usize;

        // Walk the rectangle headers without consuming anything.
        let mut offset = HEADER;
        let mut layout = Vec::with_capacity(count);
        for _ in 0..count {
            if src.len() < offset + RECT_HEADER {
                return incomplete(src, offset + RECT_HEADER);
            }
            let region = region_at(src, offset);
            let kind = be_u32(src, offset + 8) as i32;
            offset += RECT_HEADER;

            let body_len = match kind {
                encoding::RAW => region.area() * BYTES_PER_PIXEL,
                encoding::COPY_RECT => 4,
                encoding::DESKTOP_SIZE => 0,
                other => {
                    return Err(RelayError::protocol(format!(
                        "upstream used unrequested encoding {other}"
                    )));
                }
            };
            if offset + body_len > MAX_UPDATE_LEN {
                return Err(RelayError::protocol(format!(
                    "framebuffer update exceeds {MAX_UPDATE_LEN} bytes"
                )));
            }
            if src.len() < offset + body_len {
                return incomplete(src, offset + body_len);
            }
            layout.push((region, kind, offset, body_len));
            offset += body_len;
        }

        let frame = src.split_to(offset).freeze();
        let rects = layout
            .into_iter()
            .map(|(region, kind, start, len)| {
                let body = match kind {
                    encoding::RAW => RectBody::Raw(frame.slice(start..start + len)),
                    encoding::COPY_RECT => RectBody::CopyRect {
                        src_x: be_u16(&frame, start),
                        src_y: be_u16(&frame, start + 2),
                    },
                    _ => RectBody::DesktopSize,
                };
                Rectangle { region, body }
            })
            .collect();
        Ok(Some(ServerMessage::FramebufferUpdate(rects)))
    }
}

impl Decoder for RfbClientCodec {
    type Item = ServerMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };

        match kind {
            server_msg::FRAMEBUFFER_UPDATE => Self::decode_update(src),
            server_msg::SET_COLOUR_MAP_ENTRIES => {
                if src.len() < 6 {
                    return incomplete(src, 6);
                }
                let first_colour = be_u16(src, 2);
                let colours = be_u16(src, 4);
                let total = 6 + colours as usize * 6;
                if src.len() < total {
                    return incomplete(src, total);
                }
                src.advance(total);
                Ok(Some(ServerMessage::SetColourMapEntries {
                    first_colour,
                    colours,
                }))
            }
            server_msg::BELL => {
                src.advance(1);
                Ok(Some(ServerMessage::Bell))
            }
            server_msg::SERVER_CUT_TEXT => {
                let text = decode_cut_text(src)?;
                Ok(text.map(ServerMessage::ServerCutText))
            }
            other => Err(RelayError::protocol(format!(
                "unknown server message type {other}"
            ))),
        }
    }
}

impl Encoder<ClientMessage> for RfbClientCodec {
    type Error = RelayError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

// ── RfbServerCodec ───────────────────────────────────────────────

/// Viewer side: client messages in, server messages out.
#[derive(Debug, Default)]
pub struct RfbServerCodec;

impl Decoder for RfbServerCodec {
    type Item = ClientMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };

        match kind {
            client_msg::SET_PIXEL_FORMAT => {
                const LEN: usize = 4 + PIXEL_FORMAT_LEN;
                if src.len() < LEN {
                    return incomplete(src, LEN);
                }
                let mut raw = [0u8; PIXEL_FORMAT_LEN];
                raw.copy_from_slice(&src[4..LEN]);
                src.advance(LEN);
                Ok(Some(ClientMessage::SetPixelFormat(PixelFormat::from_bytes(
                    &raw,
                ))))
            }
            client_msg::SET_ENCODINGS => {
                if src.len() < 4 {
                    return incomplete(src, 4);
                }
                let count = be_u16(src, 2) as usize;
                let total = 4 + count * 4;
                if src.len() < total {
                    return incomplete(src, total);
                }
                let encodings = src[4..total]
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                src.advance(total);
                Ok(Some(ClientMessage::SetEncodings(encodings)))
            }
            client_msg::FRAMEBUFFER_UPDATE_REQUEST => {
                const LEN: usize = 10;
                if src.len() < LEN {
                    return incomplete(src, LEN);
                }
                let incremental = src[1] != 0;
                let region = region_at(src, 2);
                src.advance(LEN);
                Ok(Some(ClientMessage::FramebufferUpdateRequest {
                    incremental,
                    region,
                }))
            }
            client_msg::KEY_EVENT => {
                const LEN: usize = 8;
                if src.len() < LEN {
                    return incomplete(src, LEN);
                }
                let down = src[1] != 0;
                let key = be_u32(src, 4);
                src.advance(LEN);
                Ok(Some(ClientMessage::KeyEvent { down, key }))
            }
            client_msg::POINTER_EVENT => {
                const LEN: usize = 6;
                if src.len() < LEN {
                    return incomplete(src, LEN);
                }
                let buttons = src[1];
                let x = be_u16(src, 2);
                let y = be_u16(src, 4);
                src.advance(LEN);
                Ok(Some(ClientMessage::PointerEvent { buttons, x, y }))
            }
            client_msg::CLIENT_CUT_TEXT => {
                let text = decode_cut_text(src)?;
                Ok(text.map(ClientMessage::ClientCutText))
            }
            other => Err(RelayError::protocol(format!(
                "unknown client message type {other}"
            ))),
        }
    }
}

impl Encoder<ServerMessage> for RfbServerCodec {
    type Error = RelayError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Cut-text messages share one layout in both directions:
/// type, 3 padding bytes, u32 length, text.
fn decode_cut_text(src: &mut BytesMut) -> Result<Option<bytes::Bytes>, RelayError> {
    const HEADER: usize = 8;
    if src.len() < HEADER {
        return incomplete(src, HEADER);
    }
    let len = be_u32(src, 4) as usize;
    if len > MAX_TEXT_LEN {
        return Err(RelayError::protocol(format!(
            "cut text of {len} bytes exceeds {MAX_TEXT_LEN}"
        )));
    }
    if src.len() < HEADER + len {
        return incomplete(src, HEADER + len);
    }
    src.advance(HEADER);
    Ok(Some(src.split_to(len).freeze()))
}

// ── Tests ────────────────────────────────────────────────────────
