//! Per-file copy paths used by target workers.
//!
//! - `copy_buffered`: reader and writer futures joined through a bounded
//!   chunk queue; a full queue holds the reader back, an empty one puts the
//!   target in `BufferWait`
//! - `copy_direct`: one 1 MiB buffer alternating read and write
//! - `copy_encrypted`: streams the source through the `Encryptor`
//!
//! Every path checks the pause gate and cancellation before each read and
//! each write, and returns `EngineError::Canceled` when the token fires.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::encryptor::{read_full, Encryptor, SEGMENT_LEN};
use crate::error::{EngineError, EngineResult};
use crate::fs_ops::{ensure_parent_dir_exists, preserve_modified_time};
use crate::model::{TargetFile, TransferState};
use crate::pause::PauseGate;
use crate::settings::BufferSettings;
use crate::target::TargetContext;

/// Buffer size of the unbuffered path.
pub const DIRECT_BUFFER: usize = 1024 * 1024;

/// One chunk travelling from reader to writer.
#[derive(Debug)]
pub struct BufferChunk {
    pub data: Vec<u8>,
    /// Source offset just past this chunk
    pub offset: u64,
}

/// Shared per-call context for the copy paths.
#[derive(Clone, Copy)]
pub struct CopyScope<'a> {
    pub target: &'a TargetContext,
    pub file: &'a TargetFile,
    pub gate: &'a PauseGate,
    pub cancel: &'a CancellationToken,
}

impl CopyScope<'_> {
    async fn checkpoint(&self) -> EngineResult<()> {
        self.gate.wait(self.cancel).await
    }
}

async fn prepare_destination(path: &Path) -> EngineResult<()> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || ensure_parent_dir_exists(&path)).await?
}

async fn open_pair(file: &TargetFile) -> EngineResult<(File, File)> {
    prepare_destination(&file.destination_path).await?;
    let source = File::open(&file.source_path)
        .await
        .map_err(|e| EngineError::read(&file.source_path, e))?;
    let destination = File::create(&file.destination_path)
        .await
        .map_err(|e| EngineError::write(&file.destination_path, e))?;
    Ok((source, destination))
}

async fn finish_destination(file: &TargetFile, mut destination: File) -> EngineResult<()> {
    destination
        .flush()
        .await
        .map_err(|e| EngineError::write(&file.destination_path, e))?;
    drop(destination);

    let src = file.source_path.clone();
    let dst = file.destination_path.clone();
    tokio::task::spawn_blocking(move || preserve_modified_time(&src, &dst)).await?;
    Ok(())
}

/// Copy through a bounded chunk queue.
pub async fn copy_buffered(scope: CopyScope<'_>, buffer: &BufferSettings) -> EngineResult<()> {
    let (source, destination) = open_pair(scope.file).await?;
    let (tx, rx) = mpsc::channel(buffer.queue_capacity());

    let backlog_bytes = AtomicI64::new(0);
    let backlog_chunks = AtomicI64::new(0);
    let backlog = (&backlog_bytes, &backlog_chunks);

    let result = tokio::try_join!(
        read_chunks(scope, source, buffer.chunk_size_bytes(), tx, backlog),
        write_chunks(scope, destination, rx, backlog),
    );

    // chunks still queued when a side failed never reach the writer
    let stranded_bytes = backlog_bytes.load(Ordering::Acquire);
    let stranded_chunks = backlog_chunks.load(Ordering::Acquire);
    if stranded_bytes != 0 || stranded_chunks != 0 {
        scope.target.buffer_reported(-stranded_bytes, -stranded_chunks);
    }

    let ((), destination) = result?;
    finish_destination(scope.file, destination).await
}

async fn read_chunks(
    scope: CopyScope<'_>,
    mut source: File,
    chunk_size: usize,
    tx: mpsc::Sender<BufferChunk>,
    (backlog_bytes, backlog_chunks): (&AtomicI64, &AtomicI64),
) -> EngineResult<()> {
    scope.target.set_state(TransferState::Reading);
    let mut offset = 0u64;

    loop {
        scope.checkpoint().await?;
        let mut data = vec![0u8; chunk_size];
        let read = read_full(&mut source, &mut data)
            .await
            .map_err(|e| EngineError::read(&scope.file.source_path, e))?;
        if read == 0 {
            break;
        }
        data.truncate(read);
        offset += read as u64;

        scope.target.buffer_reported(read as i64, 1);
        backlog_bytes.fetch_add(read as i64, Ordering::AcqRel);
        backlog_chunks.fetch_add(1, Ordering::AcqRel);

        tokio::select! {
            sent = tx.send(BufferChunk { data, offset }) => {
                sent.map_err(|_| EngineError::Task {
                    message: "chunk queue closed by writer".to_string(),
                })?;
            }
            _ = scope.cancel.cancelled() => return Err(EngineError::Canceled),
        }
    }

    Ok(())
}

async fn write_chunks(
    scope: CopyScope<'_>,
    mut destination: File,
    mut rx: mpsc::Receiver<BufferChunk>,
    (backlog_bytes, backlog_chunks): (&AtomicI64, &AtomicI64),
) -> EngineResult<File> {
    let mut position = 0u64;

    loop {
        let chunk = match rx.try_recv() {
            Ok(chunk) => chunk,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                scope.target.set_state(TransferState::BufferWait);
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(chunk) => chunk,
                        None => break,
                    },
                    _ = scope.cancel.cancelled() => return Err(EngineError::Canceled),
                }
            }
        };

        scope.checkpoint().await?;
        scope.target.set_state(TransferState::Writing);
        destination
            .write_all(&chunk.data)
            .await
            .map_err(|e| EngineError::write(&scope.file.destination_path, e))?;
        position += chunk.data.len() as u64;
        debug_assert_eq!(position, chunk.offset, "chunks written out of order");

        let written = chunk.data.len() as i64;
        backlog_bytes.fetch_sub(written, Ordering::AcqRel);
        backlog_chunks.fetch_sub(1, Ordering::AcqRel);
        scope.target.buffer_reported(-written, -1);
        scope.target.record_written(written as u64);
    }

    Ok(destination)
}

/// Copy with a single fixed buffer; no backlog counters.
pub async fn copy_direct(scope: CopyScope<'_>) -> EngineResult<()> {
    let (mut source, mut destination) = open_pair(scope.file).await?;
    let mut buffer = vec![0u8; DIRECT_BUFFER];

    loop {
        scope.checkpoint().await?;
        scope.target.set_state(TransferState::Reading);
        let read = source
            .read(&mut buffer)
            .await
            .map_err(|e| EngineError::read(&scope.file.source_path, e))?;
        if read == 0 {
            break;
        }

        scope.checkpoint().await?;
        scope.target.set_state(TransferState::Writing);
        destination
            .write_all(&buffer[..read])
            .await
            .map_err(|e| EngineError::write(&scope.file.destination_path, e))?;
        scope.target.record_written(read as u64);
    }

    finish_destination(scope.file, destination).await
}

/// Encrypt the source into the destination with the unlocked passphrase.
pub async fn copy_encrypted(scope: CopyScope<'_>, passphrase: &str) -> EngineResult<()> {
    let mut encryptor = Encryptor::new(passphrase)?;
    let (mut source, mut destination) = open_pair(scope.file).await?;
    let dst = &scope.file.destination_path;
    scope.target.set_state(TransferState::Encrypting);

    destination
        .write_all(encryptor.header())
        .await
        .map_err(|e| EngineError::write(dst, e))?;

    let src = &scope.file.source_path;

    scope.checkpoint().await?;
    let mut current = vec![0u8; SEGMENT_LEN];
    let mut current_len = read_full(&mut source, &mut current)
        .await
        .map_err(|e| EngineError::read(src, e))?;

    loop {
        scope.checkpoint().await?;
        let mut next = vec![0u8; SEGMENT_LEN];
        let next_len = read_full(&mut source, &mut next)
            .await
            .map_err(|e| EngineError::read(src, e))?;

        let sealed = if next_len == 0 {
            encryptor.seal_last(&current[..current_len])?
        } else {
            encryptor.seal_next(&current[..current_len])?
        };

        scope.checkpoint().await?;
        destination
            .write_all(&sealed)
            .await
            .map_err(|e| EngineError::write(dst, e))?;
        scope.target.record_written(current_len as u64);

        if next_len == 0 {
            break;
        }
        current = next;
        current_len = next_len;
    }

    finish_destination(scope.file, destination).await
}
