// pgbackup/src/backup/archive.rs
use std::future::Future;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::errors::DumpError;
use crate::utils::pipe::PipeWriter;

/// Read size for the dump output; also the rough size of each compressed chunk.
const CHUNK_SIZE: usize = 64 * 1024;
const TAR_BLOCK: usize = 512;

/// Gzip-compresses `source` into `sink` chunk by chunk, so memory stays bounded
/// and a slow consumer stalls the producer. Returns the uncompressed byte count.
pub async fn compress_into<R>(
    mut source: R,
    sink: &PipeWriter,
    cancel: &CancellationToken,
) -> Result<u64, DumpError>
where
    R: AsyncRead + Unpin,
{
    let mut encoder = GzEncoder::new(Vec::with_capacity(CHUNK_SIZE), Compression::default());
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(DumpError::Cancelled),
            read = source.read(&mut buf) => read.map_err(DumpError::Compression)?,
        };
        if n == 0 {
            break;
        }
        total += n as u64;
        encoder.write_all(&buf[..n]).map_err(DumpError::Compression)?;
        let compressed = std::mem::take(encoder.get_mut());
        forward(sink, compressed, cancel).await?;
    }

    let tail = encoder.finish().map_err(DumpError::Compression)?;
    forward(sink, tail, cancel).await?;
    Ok(total)
}

async fn forward(
    sink: &PipeWriter,
    data: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<(), DumpError> {
    if data.is_empty() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(DumpError::Cancelled),
        sent = sink.write(Bytes::from(data)) => sent.map_err(DumpError::Compression),
    }
}

/// Checks that `reader` holds a gzip stream wrapping a tar archive with at least
/// one entry.
///
/// Produces `EmptyBackup` when there is nothing to inspect (no bytes, or an
/// archive without entries), `InvalidGzip` when decompression fails and
/// `InvalidTar` when the decompressed bytes are not a tar archive.
pub fn validate_archive<R: Read>(reader: R) -> Result<(), DumpError> {
    let mut raw = BufReader::new(reader);
    if raw.fill_buf().map_err(DumpError::InvalidGzip)?.is_empty() {
        return Err(DumpError::EmptyBackup);
    }

    let mut decoder = GzDecoder::new(raw);
    let mut head = Vec::with_capacity(TAR_BLOCK);
    (&mut decoder)
        .take(TAR_BLOCK as u64)
        .read_to_end(&mut head)
        .map_err(DumpError::InvalidGzip)?;
    if head.is_empty() {
        return Err(DumpError::EmptyBackup);
    }

    let mut archive = tar::Archive::new(Read::chain(Cursor::new(head), decoder));
    let mut entries = archive.entries().map_err(DumpError::InvalidTar)?;
    match entries.next() {
        None => Err(DumpError::EmptyBackup),
        Some(Err(e)) => Err(DumpError::InvalidTar(e)),
        Some(Ok(_)) => Ok(()),
    }
}

/// Async front for [`validate_archive`]; the blocking inspection runs off the runtime threads.
/// Cancelling `cancel` fails the next read, so the inspection stops instead of
/// draining the rest of the stream.
pub async fn validate_stream<R>(stream: R, cancel: &CancellationToken) -> Result<(), DumpError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let stream = Cancellable {
        inner: stream,
        token: cancel.clone(),
        cancelled: Box::pin(cancel.clone().cancelled_owned()),
    };
    let checked = tokio::task::spawn_blocking(move || validate_archive(SyncIoBridge::new(stream)))
        .await
        .map_err(|e| DumpError::Compression(io::Error::other(e)))?;
    match checked {
        Err(_) if cancel.is_cancelled() => Err(DumpError::Cancelled),
        other => other,
    }
}

/// Reader that fails once its token is cancelled, even while the inner read is pending.
struct Cancellable<R> {
    inner: R,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for Cancellable<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Not `Interrupted`: std readers retry those forever.
        if self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::other("archive validation cancelled")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::pipe::pipe;

    /// A gzip-compressed tar holding the given `(path, contents)` entries.
    pub(crate) fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_valid_archive() {
        let archive = tar_gz(&[("toc.dat", b"PGDMP"), ("3001.dat", b"1\talice\n")]);
        assert!(validate_archive(archive.as_slice()).is_ok());
    }

    #[test]
    fn test_archive_without_entries_is_empty_backup() {
        let archive = tar_gz(&[]);
        assert!(matches!(
            validate_archive(archive.as_slice()),
            Err(DumpError::EmptyBackup)
        ));
        assert!(matches!(validate_archive(&b""[..]), Err(DumpError::EmptyBackup)));
        assert!(matches!(
            validate_archive(gzip(b"").as_slice()),
            Err(DumpError::EmptyBackup)
        ));
    }

    #[test]
    fn test_garbage_is_classified() {
        assert!(matches!(
            validate_archive(&b"pg_dump: error: connection failed"[..]),
            Err(DumpError::InvalidGzip(_))
        ));
        assert!(matches!(
            validate_archive(gzip(b"this is plain text, not a tar archive").as_slice()),
            Err(DumpError::InvalidTar(_))
        ));
    }

    #[tokio::test]
    async fn test_compress_into_pipe_round_trips() -> anyhow::Result<()> {
        let input: Vec<u8> = (0..300_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let (writer, mut reader) = pipe(2);
        let cancel = CancellationToken::new();

        let source = input.clone();
        let producer = tokio::spawn(async move {
            let total = compress_into(source.as_slice(), &writer, &cancel).await;
            writer.close();
            total
        });

        let mut compressed = Vec::new();
        reader.read_to_end(&mut compressed).await?;
        assert_eq!(producer.await??, input.len() as u64);

        let mut decompressed = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut decompressed)?;
        assert_eq!(decompressed, input);
        Ok(())
    }

    #[tokio::test]
    async fn test_validate_stream() {
        let cancel = CancellationToken::new();
        let archive = tar_gz(&[("toc.dat", b"PGDMP")]);
        assert!(validate_stream(Cursor::new(archive), &cancel).await.is_ok());
        assert!(matches!(
            validate_stream(Cursor::new(Vec::new()), &cancel).await,
            Err(DumpError::EmptyBackup)
        ));
    }

    #[tokio::test]
    async fn test_validate_stream_stops_when_cancelled() {
        // The writer stays open, so without cancellation the inspection would block forever.
        let (writer, reader) = pipe(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let checked =
            tokio::time::timeout(std::time::Duration::from_secs(5), validate_stream(reader, &cancel)).await;
        assert!(matches!(checked, Ok(Err(DumpError::Cancelled))));
        drop(writer);
    }
}
