//! Zip writer actor.
//!
//! The zip writer lives on one blocking thread and is only reachable through
//! a command channel, so entries are appended strictly in sequence. Its
//! compressed output goes into a conduit drained by the upload.
//!
//! An asset body is read to the end before its entry is opened, so a source
//! that fails part way leaves nothing behind in the archive.

use bytes::Bytes;
use futures_util::StreamExt;
use std::io::{self, Write};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::transfer::{ByteStream, ConduitWriter};
use crate::utils::errors::{ExportError, Result};

enum Command {
    StartEntry(String),
    Chunk(Bytes),
    Finish,
}

/// Result of appending one asset.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended { bytes: u64 },
    /// The source stream failed before it ended. No entry was written.
    SourceFailed(io::Error),
}

/// A fully read asset body. Kept in memory up to a limit, then spilled to an
/// anonymous temp file that disappears when dropped.
#[derive(Default)]
struct Spool {
    chunks: Vec<Bytes>,
    file: Option<tokio::fs::File>,
    len: u64,
}

impl Spool {
    async fn read(mut body: ByteStream, memory_limit: usize) -> io::Result<Self> {
        let mut spool = Spool::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            spool.len += chunk.len() as u64;
            match spool.file.as_mut() {
                Some(file) => file.write_all(&chunk).await?,
                None if spool.len > memory_limit as u64 => {
                    let file = tokio::task::spawn_blocking(tempfile::tempfile)
                        .await
                        .map_err(io::Error::other)??;
                    let mut file = tokio::fs::File::from_std(file);
                    for held in spool.chunks.drain(..) {
                        file.write_all(&held).await?;
                    }
                    file.write_all(&chunk).await?;
                    spool.file = Some(file);
                }
                None => spool.chunks.push(chunk),
            }
        }
        if let Some(file) = spool.file.as_mut() {
            file.flush().await?;
            file.seek(io::SeekFrom::Start(0)).await?;
        }
        Ok(spool)
    }
}

pub struct ArchiveWriter {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<Result<u64>>,
    memory_limit: usize,
}

impl ArchiveWriter {
    /// Start the actor. `channel_capacity` bounds the commands in flight and
    /// `memory_limit` the bytes of one asset held in memory before spilling.
    pub fn spawn(
        sink: ConduitWriter,
        compression_level: i64,
        channel_capacity: usize,
        memory_limit: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || run(rx, sink, compression_level));
        Self {
            tx,
            handle,
            memory_limit,
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ExportError::Archive("archive writer stopped".into()))
    }

    /// Append `body` as entry `name`. `Err` means the archive itself is
    /// broken; a failing body is reported through [`AppendOutcome`].
    pub async fn append(&mut self, name: &str, body: ByteStream) -> Result<AppendOutcome> {
        let spool = match Spool::read(body, self.memory_limit).await {
            Ok(spool) => spool,
            Err(e) => return Ok(AppendOutcome::SourceFailed(e)),
        };

        self.send(Command::StartEntry(name.to_string())).await?;
        for chunk in spool.chunks {
            self.send(Command::Chunk(chunk)).await?;
        }
        if let Some(file) = spool.file {
            let mut spilled = ReaderStream::new(file);
            while let Some(chunk) = spilled.next().await {
                self.send(Command::Chunk(chunk?)).await?;
            }
        }
        Ok(AppendOutcome::Appended { bytes: spool.len })
    }

    /// Finalize the archive and wait for the actor. Returns the number of
    /// entries written.
    pub async fn finish(self) -> Result<u64> {
        // A closed channel means the actor already stopped; its result says why.
        let _ = self.tx.send(Command::Finish).await;
        drop(self.tx);
        self.handle.await?
    }
}

fn run(mut rx: mpsc::Receiver<Command>, sink: ConduitWriter, level: i64) -> Result<u64> {
    let completion = sink.completion();
    let mut zip = ZipWriter::new_stream(sink);
    // Drops before `zip`: leaving early aborts the conduit first.
    let _abort = completion.abort_on_drop();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    let mut entries = 0u64;
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::StartEntry(name) => {
                zip.start_file(name, options)?;
                entries += 1;
            }
            Command::Chunk(chunk) => zip.write_all(&chunk)?,
            Command::Finish => {
                let mut tail = zip.finish()?;
                tail.flush()?;
                completion.commit();
                drop(tail);
                return Ok(entries);
            }
        }
    }
    Err(ExportError::Archive(
        "archive writer dropped before finishing".into(),
    ))
}
