//! Tunnel wire codec.
//!
//! Every message on a tunnel socket is `ff ff | len (u16, big-endian) | payload`.
//! A payload is either a raw Ethernet frame or an instruction: six zero
//! bytes (the null destination MAC), a four letter action, `=` for a request
//! or `:` for a response, one space and the body.
//!
//! ```
//! use openlan_network::wire::{self, InstructionKind};
//!
//! let msg = wire::encode_response("logi", b"okay");
//! assert!(wire::is_instruction(&msg));
//! assert_eq!(wire::decode_action(&msg), Some("logi:"));
//! assert_eq!(wire::decode_body(&msg), b"okay");
//!
//! let parsed = wire::Instruction::parse(&msg).unwrap();
//! assert_eq!(parsed.kind, InstructionKind::Response);
//! ```

use crate::error::{NetworkError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Leading bytes of every wire message.
pub const MAGIC: [u8; 2] = [0xff, 0xff];

/// Magic plus length.
pub const HEADER_LEN: usize = 4;

/// Largest payload the length field can carry.
pub const MAX_PAYLOAD: usize = 0xffff;

/// Default payload limit: a full Ethernet frame plus headroom for
/// instruction bodies.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1518 + 82;

/// Login instruction.
pub const ACTION_LOGIN: &str = "logi";

/// Lease notification instruction.
pub const ACTION_LEASE: &str = "ipad";

const ACTION_LEN: usize = 4;
const MAC_LEN: usize = 6;
const BODY_OFFSET: usize = MAC_LEN + ACTION_LEN + 2;

/// Body of a `logi=` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub name: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Login acknowledgement body.
pub const LOGIN_OKAY: &str = "okay";

/// Login rejection body.
pub const LOGIN_FAILED: &str = "failed";

/// Request or response marker of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// `action=`
    Request,
    /// `action:`
    Response,
}

impl InstructionKind {
    fn marker(self) -> u8 {
        match self {
            InstructionKind::Request => b'=',
            InstructionKind::Response => b':',
        }
    }
}

/// A decoded instruction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub action: String,
    pub kind: InstructionKind,
    pub body: Bytes,
}

impl Instruction {
    /// Decodes an instruction payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if !is_instruction(payload) {
            return Err(NetworkError::malformed("not an instruction"));
        }
        if payload.len() < BODY_OFFSET - 1 {
            return Err(NetworkError::malformed(format!(
                "instruction of {} bytes is truncated",
                payload.len()
            )));
        }

        let action = std::str::from_utf8(&payload[MAC_LEN..MAC_LEN + ACTION_LEN])
            .map_err(|_| NetworkError::malformed("instruction action is not text"))?;
        let kind = match payload[MAC_LEN + ACTION_LEN] {
            b'=' => InstructionKind::Request,
            b':' => InstructionKind::Response,
            other => {
                return Err(NetworkError::malformed(format!(
                    "unknown instruction marker 0x{other:02x}"
                )))
            }
        };

        Ok(Self {
            action: action.to_string(),
            kind,
            body: Bytes::copy_from_slice(decode_body(payload)),
        })
    }

    /// Body as UTF-8 text, trimmed.
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default().trim()
    }
}

/// Returns true if `payload` carries an instruction rather than a frame.
pub fn is_instruction(payload: &[u8]) -> bool {
    payload.len() > MAC_LEN && payload[..MAC_LEN].iter().all(|b| *b == 0)
}

fn encode(action: &str, kind: InstructionKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BODY_OFFSET + body.len());
    buf.put_bytes(0, MAC_LEN);
    buf.put_slice(action.as_bytes());
    buf.put_u8(kind.marker());
    buf.put_u8(b' ');
    buf.put_slice(body);
    buf.freeze()
}

/// Builds an `action=` request payload.
pub fn encode_request(action: &str, body: &[u8]) -> Bytes {
    encode(action, InstructionKind::Request, body)
}

/// Builds an `action:` response payload.
pub fn encode_response(action: &str, body: &[u8]) -> Bytes {
    encode(action, InstructionKind::Response, body)
}

/// Action with its marker, e.g. `"logi:"`, or None for data frames.
pub fn decode_action(payload: &[u8]) -> Option<&str> {
    if !is_instruction(payload) {
        return None;
    }
    payload
        .get(MAC_LEN..MAC_LEN + ACTION_LEN + 1)
        .and_then(|action| std::str::from_utf8(action).ok())
}

/// Instruction body, empty if there is none.
pub fn decode_body(payload: &[u8]) -> &[u8] {
    payload.get(BODY_OFFSET..).unwrap_or_default()
}

/// Reads one message and returns its payload.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[..2] != MAGIC {
        return Err(NetworkError::malformed(format!(
            "bad magic {:02x}{:02x}",
            header[0], header[1]
        )));
    }

    let size = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if size > max_size {
        return Err(NetworkError::Oversized {
            size,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Writes one message.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let limit = max_size.min(MAX_PAYLOAD);
    if payload.len() > limit {
        return Err(NetworkError::Oversized {
            size: payload.len(),
            max: limit,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
