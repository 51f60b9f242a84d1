//! Stdio Stream Adapters
//!
//! Descriptors 0, 1 and 2 are backed by host byte streams. Which adapter is
//! used depends on whether the guest can suspend (asyncify streaming):
//!
//! - without streaming, stdin is drained completely before the guest runs and
//!   stdout/stderr are buffered until it finishes;
//! - with streaming, every read and write goes straight to the stream and
//!   completes asynchronously.
//!
//! Adapters never see guest memory. Writes receive borrowed byte views that
//! are only valid for the duration of the call; reads receive the iovec
//! lengths and hand back the bytes to place.

use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A host stream the guest reads from.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// A host stream the guest writes to.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Size of each pull from a streaming source.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Attempting to call {op} on a {kind} stream")]
    WrongDirection { op: &'static str, kind: &'static str },

    #[error("Stream already closed")]
    Closed,

    #[error("Stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of a vectored operation: either available now, or after the
/// returned future resolves.
pub enum Transfer<T> {
    Ready(T),
    Pending(BoxFuture<'static, Result<T, StreamError>>),
}

impl<T> Transfer<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Transfer::Pending(_))
    }
}

/// Capability behind one of the three stdio descriptors.
pub enum FileDescriptor {
    DevNull,
    SyncReadable(SyncReadable),
    SyncWritable(SyncWritable),
    AsyncReadable(AsyncReadable),
    AsyncWritable(AsyncWritable),
}

impl FileDescriptor {
    /// Adapter for stdin.
    pub fn from_source(source: Option<ByteSource>, streaming: bool) -> Self {
        match source {
            None => FileDescriptor::DevNull,
            Some(source) if streaming => FileDescriptor::AsyncReadable(AsyncReadable::new(source)),
            Some(source) => FileDescriptor::SyncReadable(SyncReadable::new(source)),
        }
    }

    /// Adapter for stdout / stderr.
    pub fn from_sink(sink: Option<ByteSink>, streaming: bool) -> Self {
        match sink {
            None => FileDescriptor::DevNull,
            Some(sink) if streaming => FileDescriptor::AsyncWritable(AsyncWritable::new(sink)),
            Some(sink) => FileDescriptor::SyncWritable(SyncWritable::new(sink)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileDescriptor::DevNull => "null",
            FileDescriptor::SyncReadable(_) | FileDescriptor::AsyncReadable(_) => "readable",
            FileDescriptor::SyncWritable(_) | FileDescriptor::AsyncWritable(_) => "writable",
        }
    }

    /// Write the views in order. The count excludes nothing but empty views.
    pub fn writev(&mut self, iovs: &[&[u8]]) -> Result<Transfer<u32>, StreamError> {
        match self {
            FileDescriptor::DevNull => Ok(Transfer::Ready(total_len(iovs))),
            FileDescriptor::SyncWritable(w) => Ok(Transfer::Ready(w.writev(iovs))),
            FileDescriptor::AsyncWritable(w) => Ok(w.writev(iovs)),
            FileDescriptor::SyncReadable(_) | FileDescriptor::AsyncReadable(_) => {
                Err(StreamError::WrongDirection {
                    op: "write",
                    kind: "readable",
                })
            }
        }
    }

    /// Read up to the sum of `lens` bytes; the result is placed across the
    /// iovecs left to right by the caller.
    pub fn readv(&mut self, lens: &[u32]) -> Result<Transfer<Vec<u8>>, StreamError> {
        match self {
            FileDescriptor::DevNull => Ok(Transfer::Ready(Vec::new())),
            FileDescriptor::SyncReadable(r) => Ok(Transfer::Ready(r.readv(lens))),
            FileDescriptor::AsyncReadable(r) => Ok(r.readv(lens)),
            FileDescriptor::SyncWritable(_) | FileDescriptor::AsyncWritable(_) => {
                Err(StreamError::WrongDirection {
                    op: "read",
                    kind: "writable",
                })
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), StreamError> {
        match self {
            FileDescriptor::DevNull | FileDescriptor::SyncWritable(_) => Ok(()),
            FileDescriptor::SyncReadable(r) => {
                r.source.take();
                Ok(())
            }
            FileDescriptor::AsyncReadable(r) => {
                r.inner.lock().await.source.take();
                Ok(())
            }
            FileDescriptor::AsyncWritable(w) => w.close().await,
        }
    }

    pub async fn pre_run(&mut self) -> Result<(), StreamError> {
        match self {
            FileDescriptor::SyncReadable(r) => r.drain().await,
            _ => Ok(()),
        }
    }

    pub async fn post_run(&mut self) -> Result<(), StreamError> {
        match self {
            FileDescriptor::SyncWritable(w) => w.flush().await,
            _ => Ok(()),
        }
    }

    /// Bytes accepted from the guest but not yet handed to the sink.
    pub fn buffered(&self) -> &[u8] {
        match self {
            FileDescriptor::SyncWritable(w) if !w.flushed => w.buffer.as_slice(),
            _ => &[],
        }
    }
}

fn total_len(iovs: &[&[u8]]) -> u32 {
    iovs.iter().fold(0, |total, iov| add_len(total, iov.len()))
}

/// Byte counts saturate at `u32::MAX`; overlapping iovecs can exceed it.
fn add_len(total: u32, len: usize) -> u32 {
    total.saturating_add(u32::try_from(len).unwrap_or(u32::MAX))
}

// ============================================================================
// Synchronous adapters
// ============================================================================

/// Stdin for guests that cannot suspend: the whole source is read during
/// `pre_run` and reads are served from memory.
pub struct SyncReadable {
    source: Option<ByteSource>,
    buffer: Vec<u8>,
    offset: usize,
}

impl SyncReadable {
    pub fn new(source: ByteSource) -> Self {
        Self {
            source: Some(source),
            buffer: Vec::new(),
            offset: 0,
        }
    }

    async fn drain(&mut self) -> Result<(), StreamError> {
        let Some(source) = self.source.as_mut() else {
            return Err(StreamError::Closed);
        };
        let mut buffer = Vec::new();
        source.read_to_end(&mut buffer).await?;
        self.buffer = buffer;
        self.offset = 0;
        Ok(())
    }

    fn readv(&mut self, lens: &[u32]) -> Vec<u8> {
        let wanted: usize = lens.iter().map(|len| *len as usize).sum();
        let remaining = &self.buffer[self.offset..];
        let n = wanted.min(remaining.len());
        let out = remaining[..n].to_vec();
        self.offset += n;
        out
    }
}

/// Stdout/stderr for guests that cannot suspend: writes accumulate and are
/// delivered to the sink in one piece during `post_run`.
pub struct SyncWritable {
    sink: Option<ByteSink>,
    buffer: Vec<u8>,
    flushed: bool,
}

impl SyncWritable {
    pub fn new(sink: ByteSink) -> Self {
        Self {
            sink: Some(sink),
            buffer: Vec::with_capacity(4096),
            flushed: false,
        }
    }

    fn writev(&mut self, iovs: &[&[u8]]) -> u32 {
        let mut written = 0;
        for iov in iovs.iter().filter(|iov| !iov.is_empty()) {
            self.buffer.extend_from_slice(iov);
            written = add_len(written, iov.len());
        }
        written
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        self.flushed = true;
        sink.write_all(&self.buffer).await?;
        sink.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Streaming adapters
// ============================================================================

struct ReadState {
    source: Option<ByteSource>,
    pending: Vec<u8>,
}

impl ReadState {
    /// Move up to `len` pending bytes into `out`.
    fn consume_into(&mut self, out: &mut Vec<u8>, len: usize) -> usize {
        let n = len.min(self.pending.len());
        out.extend(self.pending.drain(..n));
        n
    }

    /// Replace the pending chunk with the next one from the source.
    /// Returns false at end of stream.
    async fn pull(&mut self) -> Result<bool, StreamError> {
        let source = self.source.as_mut().ok_or(StreamError::Closed)?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = source.read(&mut chunk).await?;
        chunk.truncate(n);
        self.pending = chunk;
        Ok(n > 0)
    }
}

/// Stdin for asyncify guests: each read awaits the source incrementally.
pub struct AsyncReadable {
    inner: Arc<Mutex<ReadState>>,
}

impl AsyncReadable {
    pub fn new(source: ByteSource) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReadState {
                source: Some(source),
                pending: Vec::new(),
            })),
        }
    }

    fn readv(&mut self, lens: &[u32]) -> Transfer<Vec<u8>> {
        if lens.iter().all(|len| *len == 0) {
            return Transfer::Ready(Vec::new());
        }

        let inner = self.inner.clone();
        let lens = lens.to_vec();
        Transfer::Pending(Box::pin(async move {
            let mut state = inner.lock().await;
            let mut out = Vec::new();
            for len in lens {
                let len = len as usize;
                let mut filled = state.consume_into(&mut out, len);
                if filled < len {
                    if !state.pull().await? {
                        return Ok(out);
                    }
                    filled += state.consume_into(&mut out, len - filled);
                }
                // A short iovec ends the read so later ones never skip ahead.
                if filled < len {
                    break;
                }
            }
            Ok(out)
        }))
    }
}

/// Stdout/stderr for asyncify guests: each write awaits the sink.
pub struct AsyncWritable {
    sink: Arc<Mutex<Option<ByteSink>>>,
}

impl AsyncWritable {
    pub fn new(sink: ByteSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Some(sink))),
        }
    }

    fn writev(&mut self, iovs: &[&[u8]]) -> Transfer<u32> {
        let chunks: Vec<Vec<u8>> = iovs
            .iter()
            .filter(|iov| !iov.is_empty())
            .map(|iov| iov.to_vec())
            .collect();
        if chunks.is_empty() {
            return Transfer::Ready(0);
        }

        let sink = self.sink.clone();
        Transfer::Pending(Box::pin(async move {
            let mut guard = sink.lock().await;
            let sink = guard.as_mut().ok_or(StreamError::Closed)?;
            let mut written = 0;
            for chunk in &chunks {
                sink.write_all(chunk).await?;
                written = add_len(written, chunk.len());
            }
            sink.flush().await?;
            Ok(written)
        }))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            sink.shutdown().await?;
        }
        Ok(())
    }
}
