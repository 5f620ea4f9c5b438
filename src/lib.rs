#![warn(missing_docs)]
//! Core library for the stylesearch fashion image-search pipeline: scraping,
//! captioning, indexing, retrieval evaluation and the serving tier.

pub mod apify;
pub mod captioner;
pub mod controls;
pub mod embedder;
pub mod embeddings;
pub mod fetcher;
pub mod indexer;
pub mod logging;
pub mod matcher;
pub mod proxy;
pub mod records;
pub mod secrets;
pub mod service;
pub mod table;
pub mod vector_store;

pub use controls::{FetchArgs, FetchControls, ProxyArgs, ProxyMode};
pub use embeddings::{ImageEncoder, TextEncoder};
pub use fetcher::{FetchFailure, FetchReport, ImageFetcher};
pub use matcher::{rank_candidates, BatchScorer, EmbeddingScorer, EvalReport, RankedMatches};
pub use proxy::{ApifyProxy, ProxyConfig, ProxySession};
pub use records::{
    BadUrlRecord, CaptionEntry, CaptionRecord, FailedCaption, ItemMetadata, VectorRecord,
};
pub use secrets::SecretSource;
pub use table::{ImageRow, MetadataTable};
