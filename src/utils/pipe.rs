// pgbackup/src/utils/pipe.rs
//! Bounded in-process byte pipe connecting two streaming stages.
//!
//! The writer side can close the pipe with an error, which the reader observes
//! as an I/O error once the chunks written before it are drained. Dropping the
//! reader makes every subsequent write fail with `BrokenPipe`, so a stalled or
//! failed consumer stops its producer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Number of in-flight chunks a pipe buffers before the writer blocks.
pub const DEFAULT_PIPE_DEPTH: usize = 8;

pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Bytes::new(),
            done: false,
        },
    )
}

pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Sends a chunk, waiting while the pipe is full.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }

    /// Ends the stream with `error`; the reader sees it after draining earlier chunks.
    pub async fn close_with_error(self, error: io::Error) {
        // A dropped reader already stopped caring about the outcome.
        let _ = self.tx.send(Err(error)).await;
    }

    /// Ends the stream cleanly.
    pub fn close(self) {}
}

pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    chunk: Bytes,
    done: bool,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                buf.put_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(error)) => {
                    self.done = true;
                    return Poll::Ready(Err(error));
                }
                None => {
                    self.done = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
