//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! encoded document. Frames longer than the configured maximum are refused
//! on both the read and the write side.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use kvtree_core_store::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{Document, WireCodec};

/// Default upper bound on a frame's length.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Read one frame. Returns `None` on a clean end of stream at a frame
/// boundary.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame {
        return Err(Error::protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, max_frame
        )));
    }

    let mut frame = BytesMut::zeroed(len);
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Read and decode one document.
pub async fn read_document<R>(
    reader: &mut R,
    codec: &dyn WireCodec,
    max_frame: usize,
) -> Result<Option<Document>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_frame).await? {
        Some(frame) => codec.decode(&frame).map(Some),
        None => Ok(None),
    }
}

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The single writer of a connection.
///
/// Every task that writes to the connection goes through the same
/// `FrameWriter`; the mutex keeps frames from interleaving. A write returns
/// once the frame is flushed, so a full socket suspends the writer rather
/// than buffering without bound.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<BoxedWrite>>,
    codec: Arc<dyn WireCodec>,
    max_frame: usize,
}

impl FrameWriter {
    pub fn new<W>(writer: W, codec: Arc<dyn WireCodec>, max_frame: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            codec,
            max_frame,
        }
    }

    pub fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    /// Encode and write one document.
    pub async fn write(&self, document: &Document) -> Result<()> {
        let payload = self.codec.encode(document)?;
        if payload.len() > self.max_frame {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_frame
            )));
        }

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("codec", &self.codec.name())
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Body, Header, TextWire};
    use kvtree_core_store::Value;

    #[tokio::test]
    async fn frames_cross_a_duplex() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = FrameWriter::new(client, Arc::new(TextWire), DEFAULT_MAX_FRAME);

        let doc = Document::new(Header::new(1), Body::Reply(Value::from("hello")));
        writer.write(&doc).await.unwrap();
        writer.write(&doc).await.unwrap();
        writer.shutdown().await.unwrap();

        for _ in 0..2 {
            let read = read_document(&mut server, &TextWire, DEFAULT_MAX_FRAME)
                .await
                .unwrap();
            assert_eq!(read, Some(doc.clone()));
        }
        let end = read_document(&mut server, &TextWire, DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(1024u32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn writer_refuses_oversized_document() {
        let (client, _server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(client, Arc::new(TextWire), 8);
        let doc = Document::new(Header::new(1), Body::Reply(Value::from("far too long")));
        assert!(writer.write(&doc).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(10u32).to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_frame(&mut server, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
