//! Clustering ingestion: failed results are batched into chunks whose ids are
//! derived from the session key, so re-running a task rewrites the same chunks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ingest_core::{Error, PresubmitRunId, Result, TestStatus, TestVariant, TestVariantStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Default number of failures per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub project: String,
    pub invocation: String,
    pub partition_time: DateTime<Utc>,
    pub realm: String,
    pub presubmit_run_id: Option<PresubmitRunId>,
    /// Exonerate failures of variants that look blocking, i.e. have no
    /// expected or passing result.
    pub implicitly_exonerate: bool,
}

pub trait ClusteringIngestor: Send + Sync {
    fn open(&self, opts: SessionOptions) -> Result<Box<dyn ClusteringSession + '_>>;
}

pub trait ClusteringSession {
    fn put(&mut self, variants: &[TestVariant]) -> Result<()>;
    /// Makes everything put so far durable. Retrying after a failure is safe.
    fn flush(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub test_id: String,
    pub variant_hash: String,
    pub result_id: String,
    pub status: TestStatus,
    /// No result of the variant was expected or passed.
    #[serde(default)]
    pub blocking: bool,
    pub exonerated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project: String,
    pub realm: String,
    pub invocation: String,
    pub partition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run_id: Option<PresubmitRunId>,
    pub failures: Vec<Failure>,
}

pub trait ChunkSink: Send + Sync {
    /// Writes a chunk, replacing any chunk with the same id.
    fn put_chunk(&self, chunk: &Chunk) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryChunkSink {
    chunks: Mutex<BTreeMap<String, Chunk>>,
    writes: Mutex<usize>,
}

impl InMemoryChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total `put_chunk` calls, including rewrites.
    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl ChunkSink for InMemoryChunkSink {
    fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut chunks = self.chunks.lock().map_err(|_| Error::storage("chunk sink poisoned"))?;
        chunks.insert(chunk.id.clone(), chunk.clone());
        if let Ok(mut w) = self.writes.lock() {
            *w += 1;
        }
        Ok(())
    }
}

/// Deterministic id of the `seq`-th chunk of an invocation.
pub fn chunk_id(project: &str, invocation: &str, seq: usize) -> String {
    let mut h = Sha256::new();
    h.update(project.as_bytes());
    h.update([0u8]);
    h.update(invocation.as_bytes());
    h.update([0u8]);
    h.update((seq as u64).to_be_bytes());
    hex::encode(&h.finalize()[..16])
}

/// A variant blocks when none of its results was expected or passed.
pub fn is_blocking(tv: &TestVariant) -> bool {
    !tv.results.iter().any(|r| r.expected || r.status == TestStatus::Pass)
}

pub struct ChunkingIngestor {
    sink: Arc<dyn ChunkSink>,
    chunk_size: usize,
}

impl ChunkingIngestor {
    pub fn new(sink: Arc<dyn ChunkSink>) -> Self {
        Self::with_chunk_size(sink, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(sink: Arc<dyn ChunkSink>, chunk_size: usize) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ClusteringIngestor for ChunkingIngestor {
    fn open(&self, opts: SessionOptions) -> Result<Box<dyn ClusteringSession + '_>> {
        if opts.project.is_empty() || opts.invocation.is_empty() {
            return Err(Error::InvalidArgument("clustering session needs project and invocation".into()));
        }
        Ok(Box::new(ChunkingSession {
            sink: self.sink.as_ref(),
            chunk_size: self.chunk_size,
            opts,
            buffer: Vec::new(),
            sealed: Vec::new(),
            written: 0,
        }))
    }
}

struct ChunkingSession<'a> {
    sink: &'a dyn ChunkSink,
    chunk_size: usize,
    opts: SessionOptions,
    buffer: Vec<Failure>,
    sealed: Vec<Chunk>,
    /// Sealed chunks already handed to the sink.
    written: usize,
}

impl ChunkingSession<'_> {
    fn seal(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let seq = self.sealed.len();
        self.sealed.push(Chunk {
            id: chunk_id(&self.opts.project, &self.opts.invocation, seq),
            project: self.opts.project.clone(),
            realm: self.opts.realm.clone(),
            invocation: self.opts.invocation.clone(),
            partition_time: self.opts.partition_time,
            presubmit_run_id: self.opts.presubmit_run_id.clone(),
            failures: std::mem::take(&mut self.buffer),
        });
    }
}

impl ClusteringSession for ChunkingSession<'_> {
    fn put(&mut self, variants: &[TestVariant]) -> Result<()> {
        for tv in variants {
            let blocking = is_blocking(tv);
            let exonerated = (self.opts.implicitly_exonerate && blocking)
                || !tv.exonerations.is_empty()
                || tv.status == TestVariantStatus::Exonerated;
            for r in tv.results.iter().filter(|r| r.is_unexpected_failure()) {
                self.buffer.push(Failure {
                    test_id: tv.test_id.clone(),
                    variant_hash: tv.variant_hash.clone(),
                    result_id: r.result_id.clone(),
                    status: r.status,
                    blocking,
                    exonerated,
                    failure_reason: r.failure_reason.clone(),
                });
                if self.buffer.len() >= self.chunk_size {
                    self.seal();
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.seal();
        while self.written < self.sealed.len() {
            self.sink.put_chunk(&self.sealed[self.written])?;
            self.written += 1;
        }
        debug!(invocation = %self.opts.invocation, chunks = self.written, "clustering session flushed");
        Ok(())
    }
}
