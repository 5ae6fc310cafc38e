//! colbertdb - document identity and index lifecycle management for
//! late-interaction (ColBERT) retrieval.
//!
//! The crate keeps caller-facing document ids, passage contents and
//! per-document metadata consistent with a vector index across builds,
//! incremental adds, deletions and process restarts. Search parameters are
//! tuned from the corpus size and the requested result count.
//!
//! # Quick start
//!
//! ```no_run
//! use colbertdb::{
//!     ColbertEngine, DataDir, Document, IndexConfig, IndexController,
//!     ModelManager, OverwritePolicy, SearchOptions,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let model = ModelManager::new();
//! let checkpoint = model.model_id().to_string();
//! let controller = IndexController::new(
//!     ColbertEngine::new(model),
//!     data_dir,
//!     checkpoint,
//!     IndexConfig::default(),
//! );
//!
//! let docs = vec![Document {
//!     id: None,
//!     content: "Rust is a systems programming language".into(),
//!     metadata: None,
//! }];
//! controller
//!     .create_from_documents("notes", docs, OverwritePolicy::Overwrite)
//!     .unwrap();
//!
//! let options = SearchOptions {
//!     index_name: Some("notes".into()),
//!     ..SearchOptions::default()
//! };
//! if let Some(report) = controller.search("systems language", &options).unwrap() {
//!     for hit in &report.hits {
//!         println!("{} {} (score: {:.3})", hit.rank, hit.document_id, hit.score);
//!     }
//! }
//! ```

pub mod cli;
pub mod colbert_engine;
pub mod collection;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod embedding_db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metadata;
pub mod model_manager;
pub mod persistence;
pub mod reranker;
pub mod searcher;
pub mod tuning;

pub use colbert_engine::ColbertEngine;
pub use collection::{CollectionStore, Document, Passage, PassageBatch};
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use embedding_db::EmbeddingDb;
pub use engine::{MemoryEngine, OverwritePolicy, VectorEngine};
pub use error::{Error, Result};
pub use identity::{IdentityMap, PassageId};
pub use lifecycle::{IndexConfig, IndexController, SearchOptions};
pub use model_manager::ModelManager;
