// Copyright 2026 Joyent, Inc.

//! Frame assembly and serialization over a duplex byte stream.
//!
//! Two length conventions coexist on the wire and conflating them is a
//! recurring bug source, so the reader exposes one method per convention
//! instead of a flag:
//!
//! * [`FrameReader::read_metadata_frame`] reads a frame whose length word is
//!   self-inclusive and returns the whole frame, length word included.
//! * [`FrameReader::read_payload_frame`] reads a frame whose length word
//!   counts only the bytes after it and returns just those bytes.
//!
//! The slice a read returns stays valid until the next read call on the
//! same reader; consumed bytes are released lazily at the start of that next
//! call. Back-to-back frames already sitting in the buffer are served
//! without copying.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::errors::{ReplicaError, Result};
use crate::protocol::{RP_LEN_PREFIX_SZ, RP_METADATA_HEADER_SZ};

/// Sanity cap on a single frame. Anything larger is treated as a framing
/// error rather than an allocation request.
pub const RP_MAX_FRAME_SZ: usize = 16 * 1024 * 1024;

const INITIAL_BUF_SZ: usize = 8 * 1024;

/// Reads complete length-prefixed frames, hiding partial reads from the
/// caller. Dropping an in-flight read future is safe: partially buffered
/// bytes are kept and the next call resumes assembling the same frame.
pub struct FrameReader<R> {
    stream: R,
    buf: BytesMut,
    pending_release: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R) -> FrameReader<R> {
        FrameReader {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUF_SZ),
            pending_release: 0,
        }
    }

    /// Reads one metadata frame (self-inclusive length). Returns `None` on
    /// a clean end-of-stream at a frame boundary; end-of-stream anywhere
    /// inside a frame is [`ReplicaError::TruncatedFrame`].
    pub async fn read_metadata_frame(&mut self) -> Result<Option<&[u8]>> {
        self.release_consumed();
        if !self.fill_at_least(RP_LEN_PREFIX_SZ, true).await? {
            return Ok(None);
        }
        let declared = LittleEndian::read_u32(&self.buf[..RP_LEN_PREFIX_SZ]) as usize;
        if declared < RP_METADATA_HEADER_SZ || declared > RP_MAX_FRAME_SZ {
            return Err(ReplicaError::MalformedToken(format!(
                "metadata frame length {} outside [{}, {}]",
                declared, RP_METADATA_HEADER_SZ, RP_MAX_FRAME_SZ
            )));
        }
        self.fill_at_least(declared, false).await?;
        self.pending_release = declared;
        Ok(Some(&self.buf[..declared]))
    }

    /// Reads one payload frame (self-exclusive length) and returns the
    /// payload bytes with the length prefix stripped. A payload frame is
    /// only ever expected mid-operation, so end-of-stream here is always
    /// [`ReplicaError::TruncatedFrame`].
    pub async fn read_payload_frame(&mut self) -> Result<&[u8]> {
        self.release_consumed();
        self.fill_at_least(RP_LEN_PREFIX_SZ, false).await?;
        let declared = LittleEndian::read_u32(&self.buf[..RP_LEN_PREFIX_SZ]) as usize;
        if declared > RP_MAX_FRAME_SZ {
            return Err(ReplicaError::MalformedToken(format!(
                "payload frame length {} exceeds maximum {}",
                declared, RP_MAX_FRAME_SZ
            )));
        }
        let effective = RP_LEN_PREFIX_SZ + declared;
        self.fill_at_least(effective, false).await?;
        self.pending_release = effective;
        Ok(&self.buf[RP_LEN_PREFIX_SZ..effective])
    }

    /// Releases the frame returned by the previous read. Deferred to here
    /// so that returned slices stay valid while the caller processes them.
    fn release_consumed(&mut self) {
        if self.pending_release > 0 {
            self.buf.advance(self.pending_release);
            self.pending_release = 0;
        }
    }

    /// Grows the buffer until it holds at least `want` bytes. Returns
    /// `false` only when `eof_ok_at_start` is set and the stream finished
    /// cleanly with nothing buffered.
    async fn fill_at_least(&mut self, want: usize, eof_ok_at_start: bool) -> Result<bool> {
        while self.buf.len() < want {
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                if eof_ok_at_start && self.buf.is_empty() {
                    return Ok(false);
                }
                return Err(ReplicaError::TruncatedFrame {
                    expected: want,
                    actual: self.buf.len(),
                });
            }
        }
        Ok(true)
    }
}

/// Writes frames to a shared write half, one message at a time.
///
/// The mutex is the write-serialization gate: it is taken for exactly the
/// fill-plus-flush of one message and released on every exit path, so two
/// logical messages are never interleaved byte-for-byte on the wire. A
/// caller that must emit a metadata frame and its payload frame atomically
/// fills both in a single `write_frame` call.
pub struct FrameWriter<W> {
    inner: Mutex<WriterState<W>>,
}

struct WriterState<W> {
    stream: W,
    buf: BytesMut,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W) -> FrameWriter<W> {
        FrameWriter {
            inner: Mutex::new(WriterState {
                stream,
                buf: BytesMut::with_capacity(INITIAL_BUF_SZ),
            }),
        }
    }

    /// Acquires the gate, hands `fill` a buffer reserved to `size_hint`
    /// so headers and token stream land directly in the output buffer,
    /// then writes and flushes the result.
    pub async fn write_frame<F>(&self, size_hint: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut state = self.inner.lock().await;
        let WriterState { stream, buf } = &mut *state;
        buf.clear();
        buf.reserve(size_hint);
        fill(buf);
        stream.write_all(&buf[..]).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::BufMut;
    use tokio::io::{duplex, AsyncWriteExt};

    fn metadata_frame(fill: u8, total: usize) -> Vec<u8> {
        assert!(total >= RP_METADATA_HEADER_SZ);
        let mut frame = vec![fill; total];
        LittleEndian::write_u32(&mut frame[..4], total as u32);
        frame
    }

    #[tokio::test]
    async fn one_byte_chunks_parse_like_one_chunk() {
        let frame = metadata_frame(0x61, 48);

        let mut whole = tokio_test::io::Builder::new();
        whole.read(&frame);
        let mut reader = FrameReader::new(whole.build());
        let got_whole = reader
            .read_metadata_frame()
            .await
            .expect("read failed")
            .expect("unexpected eof")
            .to_vec();

        let mut chunked = tokio_test::io::Builder::new();
        for byte in &frame {
            chunked.read(std::slice::from_ref(byte));
        }
        let mut reader = FrameReader::new(chunked.build());
        let got_chunked = reader
            .read_metadata_frame()
            .await
            .expect("read failed")
            .expect("unexpected eof")
            .to_vec();

        assert_eq!(got_whole, frame);
        assert_eq!(got_chunked, got_whole);
    }

    #[tokio::test]
    async fn back_to_back_frames_are_served_from_the_buffer() {
        let mut bytes = metadata_frame(0x01, 30);
        bytes.extend_from_slice(&metadata_frame(0x02, 40));
        let mut mock = tokio_test::io::Builder::new();
        mock.read(&bytes);

        let mut reader = FrameReader::new(mock.build());
        let first = reader
            .read_metadata_frame()
            .await
            .expect("read failed")
            .expect("unexpected eof")
            .to_vec();
        assert_eq!(first.len(), 30);
        assert_eq!(first[5], 0x01);

        let second = reader
            .read_metadata_frame()
            .await
            .expect("read failed")
            .expect("unexpected eof")
            .to_vec();
        assert_eq!(second.len(), 40);
        assert_eq!(second[5], 0x02);

        let end = reader.read_metadata_frame().await.expect("read failed");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn truncated_metadata_frame_reports_expected_and_actual() {
        let frame = metadata_frame(0x61, 48);
        let mut mock = tokio_test::io::Builder::new();
        mock.read(&frame[..9]);

        let mut reader = FrameReader::new(mock.build());
        match reader.read_metadata_frame().await {
            Err(ReplicaError::TruncatedFrame { expected, actual }) => {
                assert_eq!(expected, 48);
                assert_eq!(actual, 9);
            }
            other => panic!("expected TruncatedFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn payload_frame_length_is_self_exclusive() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(b"payload");
        let mut mock = tokio_test::io::Builder::new();
        mock.read(&bytes);

        let mut reader = FrameReader::new(mock.build());
        let payload = reader.read_payload_frame().await.expect("read failed");
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn eof_before_payload_frame_is_truncation() {
        let mock = tokio_test::io::Builder::new().build();
        let mut reader = FrameReader::new(mock);
        match reader.read_payload_frame().await {
            Err(ReplicaError::TruncatedFrame { actual: 0, .. }) => (),
            other => panic!("expected TruncatedFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_read_resumes_cleanly() {
        let (mut client, server) = duplex(1024);
        let mut reader = FrameReader::new(server);
        let frame = metadata_frame(0x33, 32);

        client.write_all(&frame[..10]).await.expect("write failed");
        // The read future is dropped at the timeout with the frame still
        // incomplete.
        let partial =
            tokio::time::timeout(Duration::from_millis(50), reader.read_metadata_frame()).await;
        assert!(partial.is_err());

        client.write_all(&frame[10..]).await.expect("write failed");
        let got = reader
            .read_metadata_frame()
            .await
            .expect("read failed")
            .expect("unexpected eof");
        assert_eq!(got, &frame[..]);
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (client, server) = duplex(64 * 1024);
        let writer = Arc::new(FrameWriter::new(client));

        let mut tasks = Vec::new();
        for i in 0u8..8 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                for _ in 0..16 {
                    let total = RP_METADATA_HEADER_SZ + 40;
                    writer
                        .write_frame(total, |buf| {
                            buf.put_u32_le(total as u32);
                            for _ in 0..total - RP_LEN_PREFIX_SZ {
                                buf.put_u8(i);
                            }
                        })
                        .await
                        .expect("write failed");
                }
            }));
        }
        for task in tasks {
            task.await.expect("writer task panicked");
        }
        drop(writer);

        let mut reader = FrameReader::new(server);
        let mut seen = 0;
        while let Some(frame) = reader.read_metadata_frame().await.expect("read failed") {
            let body = &frame[RP_LEN_PREFIX_SZ..];
            assert!(
                body.iter().all(|b| *b == body[0]),
                "interleaved frame bodies"
            );
            seen += 1;
        }
        assert_eq!(seen, 8 * 16);
    }
}
