//! Box Stream: authenticated, encrypted framing over an established session.
//!
//! Every frame is a 34-byte boxed header (`body_len: u16be || body_tag`)
//! followed by the detached-boxed body. The header uses nonce `n` and the
//! body `n + 1`. A header whose plaintext is all zeros says goodbye.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::crypto::{increment_nonce, open, open_detached, seal, seal_detached, TAG_LEN};
use crate::error::BoxStreamError;

pub const MAX_BODY_LEN: usize = 4096;
pub const HEADER_LEN: usize = 34;
const HEADER_PLAIN_LEN: usize = 2 + TAG_LEN;

/// Key and starting nonce for one direction of a session.
#[derive(Clone, PartialEq, Eq)]
pub struct BoxKeys {
    pub key: [u8; 32],
    pub nonce: [u8; 24],
}

impl std::fmt::Debug for BoxKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxKeys(..)")
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct BoxStreamWriter<W> {
    inner: W,
    keys: BoxKeys,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> BoxStreamWriter<W> {
    pub fn new(inner: W, keys: BoxKeys) -> Self {
        Self {
            inner,
            keys,
            closed: false,
        }
    }

    /// Encrypt and send `data`, split into frames of at most
    /// [`MAX_BODY_LEN`] bytes.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), BoxStreamError> {
        if self.closed {
            return Err(BoxStreamError::Closed);
        }
        for chunk in data.chunks(MAX_BODY_LEN) {
            let frame = self.seal_frame(chunk);
            self.inner.write_all(&frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    fn seal_frame(&mut self, chunk: &[u8]) -> Vec<u8> {
        let header_nonce = self.keys.nonce;
        increment_nonce(&mut self.keys.nonce);

        let mut body = chunk.to_vec();
        let body_tag = seal_detached(&self.keys.key, &self.keys.nonce, &mut body);
        increment_nonce(&mut self.keys.nonce);

        let mut header = [0u8; HEADER_PLAIN_LEN];
        header[..2].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        header[2..].copy_from_slice(&body_tag);

        let mut frame = seal(&self.keys.key, &header_nonce, &header);
        frame.extend_from_slice(&body);
        frame
    }

    /// Send the goodbye header and shut the underlying writer down.
    pub async fn close(&mut self) -> Result<(), BoxStreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let goodbye = seal(&self.keys.key, &self.keys.nonce, &[0u8; HEADER_PLAIN_LEN]);
        self.inner.write_all(&goodbye).await?;
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct BoxStreamReader<R> {
    inner: R,
    keys: BoxKeys,
    buffer: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> BoxStreamReader<R> {
    pub fn new(inner: R, keys: BoxKeys) -> Self {
        Self {
            inner,
            keys,
            buffer: Vec::new(),
            position: 0,
            finished: false,
        }
    }

    /// Next decrypted frame body, `None` once the remote said goodbye.
    ///
    /// Authentication failures are fatal: the stream must be discarded.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, BoxStreamError> {
        if self.finished {
            return Ok(None);
        }

        let mut boxed_header = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut boxed_header).await?;
        let header = open(&self.keys.key, &self.keys.nonce, &boxed_header)
            .ok_or(BoxStreamError::Authentication)?;
        if header.iter().all(|b| *b == 0) {
            self.finished = true;
            return Ok(None);
        }
        increment_nonce(&mut self.keys.nonce);

        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        if len > MAX_BODY_LEN {
            return Err(BoxStreamError::Authentication);
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        if !open_detached(&self.keys.key, &self.keys.nonce, &mut body, &header[2..]) {
            return Err(BoxStreamError::Authentication);
        }
        increment_nonce(&mut self.keys.nonce);
        Ok(Some(body))
    }

    /// Fill `buf` completely, reading as many frames as needed.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BoxStreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.position == self.buffer.len() {
                match self.read_frame().await? {
                    Some(frame) => {
                        self.buffer = frame;
                        self.position = 0;
                    }
                    None => return Err(BoxStreamError::Closed),
                }
            }
            let available = &self.buffer[self.position..];
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            self.position += n;
        }
        Ok(())
    }

    /// True when no buffered bytes remain and the remote said goodbye.
    pub fn is_finished(&self) -> bool {
        self.finished && self.position == self.buffer.len()
    }
}

/// Split `io` into a box stream reader/writer pair.
pub fn box_stream<S>(
    io: S,
    read: BoxKeys,
    write: BoxKeys,
) -> (BoxStreamReader<ReadHalf<S>>, BoxStreamWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(io);
    (
        BoxStreamReader::new(reader, read),
        BoxStreamWriter::new(writer, write),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> BoxKeys {
        BoxKeys {
            key: [9u8; 32],
            nonce: [1u8; 24],
        }
    }

    async fn sealed(chunks: &[&[u8]]) -> Vec<u8> {
        let mut writer = BoxStreamWriter::new(Vec::new(), keys());
        for chunk in chunks {
            writer.write_all(chunk).await.unwrap();
        }
        writer.close().await.unwrap();
        writer.into_inner()
    }

    #[tokio::test]
    async fn test_roundtrip_any_chunking() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let wire = sealed(&[&data[..1], &data[1..5000], &data[5000..]]).await;

        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        let mut out = vec![0u8; data.len()];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(reader.read_frame().await.unwrap().is_none());
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn test_frames_are_capped() {
        let data = vec![7u8; MAX_BODY_LEN + 1];
        let wire = sealed(&[&data]).await;

        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        assert_eq!(reader.read_frame().await.unwrap().unwrap().len(), MAX_BODY_LEN);
        assert_eq!(reader.read_frame().await.unwrap().unwrap().len(), 1);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bit_flip_in_header_fails() {
        let mut wire = sealed(&[b"hello"]).await;
        wire[5] ^= 0x01;
        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        assert!(matches!(
            reader.read_frame().await,
            Err(BoxStreamError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_bit_flip_in_body_fails() {
        let mut wire = sealed(&[b"hello"]).await;
        wire[HEADER_LEN + 2] ^= 0x80;
        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        assert!(matches!(
            reader.read_frame().await,
            Err(BoxStreamError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_read_past_goodbye_is_closed() {
        let wire = sealed(&[b"abc"]).await;
        let mut reader = BoxStreamReader::new(wire.as_slice(), keys());
        let mut out = [0u8; 4];
        assert!(matches!(
            reader.read_exact(&mut out).await,
            Err(BoxStreamError::Closed)
        ));
    }
}
