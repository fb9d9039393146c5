//! Vector-backed semantic retrieval and the embedding gateway (§4.F, §4.G).

pub mod embedding_service;
pub mod index;

pub use embedding_service::{EmbeddingService, PerformanceReport, TaskTypeReport};
pub use index::{IndexEntry, IndexFilters, IndexKind, QueryMatch, SemanticIndex};
