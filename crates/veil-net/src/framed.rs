//! Length-prefixed, optionally compressed frames over any duplex stream.
//!
//! Wire format of one frame:
//!
//! ```text
//! [u32 LE encoded length][u8 flag: 0 = raw, 1 = deflate][payload]
//! ```
//!
//! Writes are staged in an in-memory buffer and only reach the stream on
//! [`FramedConnection::flush`]. A [`CloseHandle`] lets another task abort a
//! pending read or flush, which then fails with [`NetError::Closed`].

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use veil_shared::constants::{COMPRESSION_THRESHOLD, MAX_FRAME_SIZE};
use veil_shared::StatusCode;

use crate::error::{NetError, Result};

pub const FLAG_RAW: u8 = 0;
pub const FLAG_DEFLATE: u8 = 1;

/// Length prefix plus compression flag.
pub const HEADER_SIZE: usize = 5;

/// Encode one frame, compressing when the payload is above the threshold and
/// DEFLATE actually makes it smaller.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut flag = FLAG_RAW;
    let mut compressed = None;
    if payload.len() > COMPRESSION_THRESHOLD {
        let deflated = deflate(payload)?;
        if deflated.len() < payload.len() {
            flag = FLAG_DEFLATE;
            compressed = Some(deflated);
        }
    }
    let body = compressed.as_deref().unwrap_or(payload);

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.put_u8(flag);
    frame.put_slice(body);
    Ok(frame.to_vec())
}

/// Decode one complete frame from the front of `data`.
///
/// Returns the payload and the number of bytes consumed.
pub fn decode_frame(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(NetError::BadFrameLength {
            expected: HEADER_SIZE,
            found: data.len(),
        });
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    check_frame_len(len)?;
    let flag = data[4];

    let end = HEADER_SIZE + len;
    if data.len() < end {
        return Err(NetError::BadFrameLength {
            expected: end,
            found: data.len(),
        });
    }
    let payload = decode_payload(flag, &data[HEADER_SIZE..end])?;
    Ok((payload, end))
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

fn decode_payload(flag: u8, body: &[u8]) -> Result<Vec<u8>> {
    match flag {
        FLAG_RAW => Ok(body.to_vec()),
        FLAG_DEFLATE => inflate(body),
        other => Err(NetError::BadCompressionFlag(other)),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

// Bounded so a small frame cannot expand past the frame limit
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data).take(MAX_FRAME_SIZE as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| NetError::Decompression(e.to_string()))?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: out.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(out)
}

/// Aborts pending operations on a [`FramedConnection`] from another task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Typed frame reader/writer over one duplex stream.
pub struct FramedConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    write_buf: BytesMut,
    closed: CancellationToken,
    label: String,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_label(stream, "unknown")
    }

    /// `label` identifies the remote side in logs.
    pub fn with_label(stream: S, label: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            write_buf: BytesMut::new(),
            closed: CancellationToken::new(),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            token: self.closed.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        Ok(())
    }

    /// Stage one frame; nothing is sent until [`flush`](Self::flush).
    pub fn write_bytes(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_frame(payload)?;
        trace!(
            peer = %self.label,
            payload_len = payload.len(),
            frame_len = frame.len(),
            "Staged frame"
        );
        self.write_buf.extend_from_slice(&frame);
        Ok(())
    }

    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(NetError::Closed),
            frame = read_frame(&mut self.reader) => frame,
        }
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())
    }

    pub async fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_bytes().await?)?)
    }

    pub fn write_int(&mut self, value: i64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub async fn read_int(&mut self) -> Result<i64> {
        let bytes = self.read_bytes().await?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetError::BadFrameLength {
                expected: 8,
                found: bytes.len(),
            })?;
        Ok(i64::from_le_bytes(arr))
    }

    pub fn write_status(&mut self, status: StatusCode) -> Result<()> {
        self.write_bytes(&[status as u8])
    }

    pub async fn read_status(&mut self) -> Result<StatusCode> {
        let bytes = self.read_bytes().await?;
        if bytes.len() != 1 {
            return Err(NetError::BadFrameLength {
                expected: 1,
                found: bytes.len(),
            });
        }
        StatusCode::from_byte(bytes[0]).ok_or(NetError::UnknownStatus(bytes[0]))
    }

    /// Read a status and fail unless it is `expected`.
    pub async fn expect_status(&mut self, expected: StatusCode) -> Result<()> {
        let found = self.read_status().await?;
        if found != expected {
            return Err(NetError::UnexpectedStatus { expected, found });
        }
        Ok(())
    }

    /// Write a status and flush it immediately.
    pub async fn send_status(&mut self, status: StatusCode) -> Result<()> {
        self.write_status(status)?;
        self.flush().await
    }

    pub fn write_struct<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write_bytes(&bytes)
    }

    pub async fn read_struct<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_bytes().await?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Push every staged frame to the stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let closed = self.closed.clone();
        let buf = self.write_buf.split().freeze();
        let writer = &mut self.writer;
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(NetError::Closed),
            res = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => res.map_err(NetError::from),
        }
    }

    /// Flush what is staged, shut the stream down and mark the connection
    /// closed. Staged data is dropped if the handle was already closed.
    pub async fn close(mut self) -> Result<()> {
        let flushed = if self.closed.is_cancelled() {
            Ok(())
        } else {
            self.flush().await
        };
        self.closed.cancel();
        let shutdown = self.writer.shutdown().await.map_err(NetError::from);
        flushed.and(shutdown)
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    check_frame_len(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_payload(header[4], &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    fn pair() -> (
        FramedConnection<tokio::io::DuplexStream>,
        FramedConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4 * MAX_FRAME_SIZE);
        (
            FramedConnection::with_label(a, "a"),
            FramedConnection::with_label(b, "b"),
        )
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let frame = encode_frame(b"short").unwrap();
        assert_eq!(frame[4], FLAG_RAW);
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
    }

    #[test]
    fn test_repetitive_payload_compressed() {
        let payload = vec![b'a'; 4096];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame[4], FLAG_DEFLATE);
        assert!(frame.len() < payload.len());
        let (decoded, used) = decode_frame(&frame).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_incompressible_payload_sent_raw() {
        let payload: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let frame = encode_frame(&payload).unwrap();
        let (decoded, _) = decode_frame(&frame).unwrap();
        assert_eq!(decoded, payload);
        if frame[4] == FLAG_RAW {
            assert_eq!(frame.len(), HEADER_SIZE + payload.len());
        }
    }

    #[test]
    fn test_oversize_rejected_on_write() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(NetError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversize_rejected_on_read() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes());
        frame.push(FLAG_RAW);
        assert!(matches!(
            decode_frame(&frame),
            Err(NetError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut frame = encode_frame(b"abc").unwrap();
        frame[4] = 7;
        assert!(matches!(
            decode_frame(&frame),
            Err(NetError::BadCompressionFlag(7))
        ));
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Record {
            name: String,
            values: Vec<u32>,
        }

        let (mut a, mut b) = pair();
        let record = Record {
            name: "room".to_string(),
            values: (0..200).collect(),
        };

        a.write_string("hello").unwrap();
        a.write_int(-42).unwrap();
        a.write_status(StatusCode::AuthOk).unwrap();
        a.write_struct(&record).unwrap();
        a.flush().await.unwrap();

        assert_eq!(b.read_string().await.unwrap(), "hello");
        assert_eq!(b.read_int().await.unwrap(), -42);
        b.expect_status(StatusCode::AuthOk).await.unwrap();
        assert_eq!(b.read_struct::<Record>().await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_writes_invisible_until_flush() {
        let (mut a, mut b) = pair();
        a.write_string("buffered").unwrap();

        let early = tokio::time::timeout(std::time::Duration::from_millis(50), b.read_bytes()).await;
        assert!(early.is_err(), "frame must not arrive before flush");

        a.flush().await.unwrap();
        assert_eq!(b.read_string().await.unwrap(), "buffered");
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let (mut a, mut b) = pair();
        a.send_status(StatusCode::AuthFailed).await.unwrap();
        assert!(matches!(
            b.expect_status(StatusCode::AuthOk).await,
            Err(NetError::UnexpectedStatus { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_handle_unblocks_read() {
        let (_a, mut b) = pair();
        let handle = b.close_handle();

        let reader = tokio::spawn(async move { b.read_bytes().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.close();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(NetError::Closed)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_io_error() {
        let (a, mut b) = pair();
        a.close().await.unwrap();
        assert!(matches!(b.read_bytes().await, Err(NetError::Io(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_frame_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            repeat in 1usize..8,
        ) {
            // Repeating the payload makes most cases above the threshold compressible
            let payload: Vec<u8> = payload.iter().cycle().take(payload.len() * repeat).copied().collect();
            let frame = encode_frame(&payload).unwrap();
            let (decoded, used) = decode_frame(&frame).unwrap();
            prop_assert_eq!(decoded, payload);
            prop_assert_eq!(used, frame.len());
        }
    }
}
