//! Parallel chunk writer: one upload worker per configured channel.
//!
//! Workers pull full chunks from a shared source; the chunk's sequence
//! number is assigned while the source lock is still held, so sequence
//! order is byte order even though uploads complete in arbitrary order.
//! Memory floor is `chunk_size × workers` plus a little channel slack.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use disc_client::{Node, Rest};
use reqwest::Body;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::writer::OnChunk;
use crate::ChunkWrite;

/// Frames buffered between the caller and the worker fleet.
const FRAME_BUFFER: usize = 4;

pub struct ParallelChunkWriter {
    frames: Option<mpsc::Sender<Bytes>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<WriterState>,
    on_chunk: OnChunk,
    closed: bool,
}

struct WriterState {
    rest: Arc<Rest>,
    chunk_size: usize,
    collected: StdMutex<Vec<(u64, Node)>>,
    failure: StdMutex<Option<StreamError>>,
}

/// Shared chunk source. A worker holds the lock while it accumulates a
/// full `chunk_size` buffer (less only at end of stream), so chunks never
/// interleave.
struct ChunkSource {
    frames: mpsc::Receiver<Bytes>,
    pending: Option<Bytes>,
    next_seq: u64,
}

impl ChunkSource {
    async fn next_chunk(&mut self, chunk_size: usize) -> Option<(u64, Bytes)> {
        let mut buf = BytesMut::with_capacity(chunk_size);
        while buf.len() < chunk_size {
            if let Some(mut pending) = self.pending.take() {
                let take = pending.len().min(chunk_size - buf.len());
                buf.extend_from_slice(&pending.split_to(take));
                if !pending.is_empty() {
                    self.pending = Some(pending);
                }
                continue;
            }
            match self.frames.recv().await {
                Some(frame) => self.pending = Some(frame),
                None => break,
            }
        }
        if buf.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, buf.freeze()))
    }
}

impl ParallelChunkWriter {
    pub fn new(rest: Arc<Rest>, chunk_size: usize, on_chunk: OnChunk) -> Self {
        let worker_count = rest.channel_count();
        let (frames, rx) = mpsc::channel(FRAME_BUFFER);
        let source = Arc::new(Mutex::new(ChunkSource {
            frames: rx,
            pending: None,
            next_seq: 0,
        }));
        let state = Arc::new(WriterState {
            rest,
            chunk_size,
            collected: StdMutex::new(Vec::new()),
            failure: StdMutex::new(None),
        });

        let workers = (0..worker_count)
            .map(|_| {
                let source = source.clone();
                let state = state.clone();
                tokio::spawn(run_worker(source, state))
            })
            .collect();

        Self {
            frames: Some(frames),
            workers,
            state,
            on_chunk,
            closed: false,
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        let failure = self.state.failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        let Some(frames) = &self.frames else {
            return Err(StreamError::Closed);
        };
        if frames.send(Bytes::copy_from_slice(buf)).await.is_err() {
            // Every worker has exited; the recorded failure says why.
            let failure = self.state.failure.lock().unwrap().clone();
            return Err(failure.unwrap_or(StreamError::Closed));
        }
        Ok(buf.len())
    }

    /// Signals end of stream, waits for the worker fleet, then replays the
    /// collected chunks to the callback in sequence order. The first
    /// recorded worker error is returned after the callbacks run.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::AlreadyClosed);
        }
        self.closed = true;
        self.frames.take();

        for worker in self.workers.drain(..) {
            if let Err(join) = worker.await {
                record_failure(&self.state, join.into());
            }
        }

        let mut collected = std::mem::take(&mut *self.state.collected.lock().unwrap());
        collected.sort_by_key(|(seq, _)| *seq);
        for (_, node) in collected {
            (self.on_chunk)(node);
        }

        let failure = self.state.failure.lock().unwrap().clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChunkWrite for ParallelChunkWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        ParallelChunkWriter::write(self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        ParallelChunkWriter::close(self).await
    }
}

async fn run_worker(source: Arc<Mutex<ChunkSource>>, state: Arc<WriterState>) {
    loop {
        if state.failure.lock().unwrap().is_some() {
            return;
        }
        let chunk = {
            let mut source = source.lock().await;
            source.next_chunk(state.chunk_size).await
        };
        let Some((seq, data)) = chunk else {
            return;
        };
        debug!(seq, size = data.len(), "uploading chunk");
        match state.rest.create_attachment(Body::from(data)).await {
            Ok(node) => state.collected.lock().unwrap().push((seq, node)),
            Err(err) => {
                record_failure(&state, err.into());
                return;
            }
        }
    }
}

fn record_failure(state: &WriterState, err: StreamError) {
    let mut failure = state.failure.lock().unwrap();
    if failure.is_none() {
        *failure = Some(err);
    }
}
