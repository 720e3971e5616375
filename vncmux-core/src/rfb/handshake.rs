//! RFB handshake for both connection roles.
//!
//! ```text
//! server → client   "RFB 003.008\n"
//! client → server   chosen version banner
//! security          3.3: server picks a u32 type
//!                   3.7+: server lists types, client picks one byte
//!                   3.8: server sends a u32 SecurityResult
//! client → server   ClientInit (shared flag)
//! server → client   ServerInit
//! ```
//!
//! Only security type None is supported in either direction.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::RelayError;
use crate::rfb::protocol::{
    MAX_TEXT_LEN, PIXEL_FORMAT_LEN, PixelFormat, ProtocolVersion, ServerInit, VERSION_LEN,
    security,
};

/// Read a u32-length-prefixed failure reason.
async fn read_reason<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, RelayError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_TEXT_LEN {
        return Err(RelayError::protocol(format!(
            "failure reason of {len} bytes exceeds {MAX_TEXT_LEN}"
        )));
    }
    let mut text = vec![0u8; len];
    reader.read_exact(&mut text).await?;
    Ok(String::from_utf8_lossy(&text).into_owned())
}

async fn read_version<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ProtocolVersion, RelayError> {
    let mut banner = [0u8; VERSION_LEN];
    reader.read_exact(&mut banner).await?;
    ProtocolVersion::parse(&banner)
}

// ── Client role ──────────────────────────────────────────────────

/// Run the client side of the handshake and return the negotiated
/// version and the server's ServerInit.
///
/// Requests shared access so other viewers of the upstream server
/// are not disconnected.
pub async fn client_handshake<S>(
    stream: &mut S,
) -> Result<(ProtocolVersion, ServerInit), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = read_version(stream).await?;
    stream.write_all(version.banner()).await?;
    debug!(%version, "negotiated upstream protocol version");

    match version {
        ProtocolVersion::V3_3 => match stream.read_u32().await? {
            0 => {
                let reason = read_reason(stream).await?;
                return Err(RelayError::Connection(format!(
                    "upstream refused connection: {reason}"
                )));
            }
            t if t == security::NONE as u32 => {}
            other => {
                return Err(RelayError::Connection(format!(
                    "upstream requires security type {other}, only None is supported"
                )));
            }
        },
        ProtocolVersion::V3_7 | ProtocolVersion::V3_8 => {
            let count = stream.read_u8().await?;
            if count == 0 {
                let reason = read_reason(stream).await?;
                return Err(RelayError::Connection(format!(
                    "upstream refused connection: {reason}"
                )));
            }
            let mut offered = vec![0u8; count as usize];
            stream.read_exact(&mut offered).await?;
            if !offered.contains(&security::NONE) {
                return Err(RelayError::Connection(format!(
                    "upstream offers security types {offered:?}, only None is supported"
                )));
            }
            stream.write_all(&[security::NONE]).await?;

            if version == ProtocolVersion::V3_8 {
                let result = stream.read_u32().await?;
                if result != 0 {
                    let reason = read_reason(stream).await?;
                    return Err(RelayError::Connection(format!(
                        "upstream security handshake failed: {reason}"
                    )));
                }
            }
        }
    }

    // ClientInit: shared.
    stream.write_all(&[1]).await?;
    stream.flush().await?;

    let width = stream.read_u16().await?;
    let height = stream.read_u16().await?;
    let mut format = [0u8; PIXEL_FORMAT_LEN];
    stream.read_exact(&mut format).await?;
    let name = read_reason(stream).await?;

    Ok((
        version,
        ServerInit {
            width,
            height,
            pixel_format: PixelFormat::from_bytes(&format),
            name,
        },
    ))
}

// ── Server role ──────────────────────────────────────────────────

/// Run the server side of the handshake for one viewer.
///
/// Offers version 3.8 and security type None, then sends `init`.
pub async fn server_handshake<S>(
    stream: &mut S,
    init: &ServerInit,
) -> Result<ProtocolVersion, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(ProtocolVersion::V3_8.banner()).await?;
    stream.flush().await?;
    let version = read_version(stream).await?;

    match version {
        ProtocolVersion::V3_3 => {
            stream.write_u32(security::NONE as u32).await?;
        }
        ProtocolVersion::V3_7 | ProtocolVersion::V3_8 => {
            stream.write_all(&[1, security::NONE]).await?;
            stream.flush().await?;
            let chosen = stream.read_u8().await?;
            if chosen != security::NONE {
                if version == ProtocolVersion::V3_8 {
                    let reason = b"only security type None is offered";
                    stream.write_u32(1).await?;
                    stream.write_u32(reason.len() as u32).await?;
                    stream.write_all(reason).await?;
                    stream.flush().await?;
                }
                return Err(RelayError::protocol(format!(
                    "viewer chose security type {chosen}"
                )));
            }
            if version == ProtocolVersion::V3_8 {
                stream.write_u32(0).await?;
            }
        }
    }
    stream.flush().await?;

    // ClientInit: every viewer shares the relay framebuffer, so the
    // shared flag does not change anything.
    let _shared = stream.read_u8().await?;

    let mut buf = BytesMut::new();
    init.encode(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(version)
}

// ── Tests ────────────────────────────────────────────────────────
