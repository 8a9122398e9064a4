//! Silo - Multi-tenant RAG indexing and search service
//!
//! Storage architecture:
//! - SQLite: documents, chunks, index metadata, job queue (soft deletion)
//! - Flat inner-product index files: one per (tenant, namespace, version)
//! - Tantivy: BM25 keyword sidecar (hybrid retrieval)
//!
//! The ingest pipeline selects a content-aware chunking strategy, optionally
//! enriches chunks with LLM context, embeds across the available devices and
//! persists with crash-safe atomic index saves. Search filters soft-deleted
//! chunks at query time and can fuse sparse hits and rerank candidates.

pub mod analyzer;
pub mod bm25;
pub mod chunking;
pub mod config;
pub mod embed;
pub mod enrich;
pub mod error;
pub mod gpu;
pub mod index;
pub mod lock;
pub mod parallel;
pub mod pipeline;
pub mod queue;
pub mod search;
pub mod server;
pub mod status;
pub mod store;
pub mod text;
pub mod types;

pub use analyzer::jobs::AnalyzerJobService;
pub use analyzer::DocumentAnalyzer;
pub use bm25::{Bm25Hit, Bm25Index};
pub use chunking::{ChunkConfig, ChunkStrategy, StrategyMetadata, StrategyRegistry};
pub use config::Settings;
pub use embed::{BertEncoder, Encoder};
pub use enrich::{ContextEnricher, DocContext};
pub use error::ServiceError;
pub use gpu::{GpuTaskManager, TaskKind};
pub use index::{FlatIndex, IndexManager};
pub use lock::PhaseLock;
pub use parallel::ParallelEmbedder;
pub use pipeline::UpsertCoordinator;
pub use queue::{JobQueue, JobWorker};
pub use search::{RerankClient, SearchEngine};
pub use status::{Stage, StatusReporter, StatusUpdate};
pub use store::Store;
pub use types::*;
