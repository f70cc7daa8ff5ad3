//! RPC packet codec: `[flags:u8][length:u32be][request:i32be]` + body.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::boxstream::{BoxStreamReader, BoxStreamWriter};
use crate::error::{BoxStreamError, RpcError};

pub const HEADER_LEN: usize = 9;
/// Upper bound on a single packet body.
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

const FLAG_STREAM: u8 = 0b1000;
const FLAG_END_OR_ERROR: u8 = 0b0100;
const BODY_TYPE_MASK: u8 = 0b0011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    Binary,
    Utf8,
    Json,
}

impl BodyType {
    fn bits(self) -> u8 {
        match self {
            BodyType::Binary => 0,
            BodyType::Utf8 => 1,
            BodyType::Json => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, RpcError> {
        match bits & BODY_TYPE_MASK {
            0 => Ok(BodyType::Binary),
            1 => Ok(BodyType::Utf8),
            2 => Ok(BodyType::Json),
            other => Err(RpcError::Protocol(format!("unknown body type {other}"))),
        }
    }
}

/// A packet body together with its declared encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub body_type: BodyType,
    pub bytes: Vec<u8>,
}

impl Body {
    pub fn json(value: &impl Serialize) -> Result<Self, RpcError> {
        Ok(Self {
            body_type: BodyType::Json,
            bytes: serde_json::to_vec(value)?,
        })
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            body_type: BodyType::Binary,
            bytes,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body_type: BodyType::Utf8,
            bytes: text.into().into_bytes(),
        }
    }

    /// Decode a JSON body; other body types are a protocol violation.
    pub fn to_value(&self) -> Result<Value, RpcError> {
        if self.body_type != BodyType::Json {
            return Err(RpcError::Protocol(format!(
                "expected a JSON body, got {:?}",
                self.body_type
            )));
        }
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream: bool,
    pub end_or_error: bool,
    pub request_number: i32,
    pub body: Body,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = self.body.body_type.bits();
        if self.stream {
            flags |= FLAG_STREAM;
        }
        if self.end_or_error {
            flags |= FLAG_END_OR_ERROR;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.bytes.len());
        out.push(flags);
        out.extend_from_slice(&(self.body.bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.request_number.to_be_bytes());
        out.extend_from_slice(&self.body.bytes);
        out
    }
}

/// Read the next packet; `None` on the all-zero goodbye header or once the
/// box stream has ended.
pub async fn read_frame<R>(reader: &mut BoxStreamReader<R>) -> Result<Option<Frame>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(()) => {}
        Err(BoxStreamError::Closed) => return Ok(None),
        Err(e) => return Err(RpcError::Protocol(e.to_string())),
    }
    if header.iter().all(|b| *b == 0) {
        return Ok(None);
    }

    let flags = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let request_number = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if len > MAX_BODY_LEN {
        return Err(RpcError::Protocol(format!("packet body of {len} bytes")));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| RpcError::Protocol(e.to_string()))?;

    Ok(Some(Frame {
        stream: flags & FLAG_STREAM != 0,
        end_or_error: flags & FLAG_END_OR_ERROR != 0,
        request_number,
        body: Body {
            body_type: BodyType::from_bits(flags)?,
            bytes,
        },
    }))
}

pub async fn write_frame<W>(writer: &mut BoxStreamWriter<W>, frame: &Frame) -> Result<(), BoxStreamError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await
}

pub async fn write_goodbye<W>(writer: &mut BoxStreamWriter<W>) -> Result<(), BoxStreamError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[0u8; HEADER_LEN]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxstream::BoxKeys;

    fn keys() -> BoxKeys {
        BoxKeys {
            key: [5u8; 32],
            nonce: [0u8; 24],
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame {
            stream: true,
            end_or_error: true,
            request_number: -3,
            body: Body::json(&true).unwrap(),
        };
        let bytes = frame.encode();
        assert_eq!(bytes[0], 0b1110);
        assert_eq!(&bytes[1..5], &4u32.to_be_bytes());
        assert_eq!(&bytes[5..9], &(-3i32).to_be_bytes());
        assert_eq!(&bytes[9..], b"true");
    }

    #[tokio::test]
    async fn test_frames_through_box_stream() {
        let frames = vec![
            Frame {
                stream: false,
                end_or_error: false,
                request_number: 1,
                body: Body::text("hi"),
            },
            Frame {
                stream: true,
                end_or_error: false,
                request_number: -1,
                body: Body::binary(vec![0u8; 10_000]),
            },
        ];

        let mut writer = BoxStreamWriter::new(Vec::new(), keys());
        for frame in &frames {
            write_frame(&mut writer, frame).await.unwrap();
        }
        write_goodbye(&mut writer).await.unwrap();
        let wire = writer.into_inner();

        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        for frame in &frames {
            assert_eq!(read_frame(&mut reader).await.unwrap().as_ref(), Some(frame));
        }
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_non_json_body_is_protocol_violation() {
        assert!(matches!(
            Body::text("x").to_value(),
            Err(RpcError::Protocol(_))
        ));
    }
}
