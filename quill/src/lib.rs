// quill/src/lib.rs
//!
//! Streaming job engine.
//!
//! A job streams prose from a text-generation backend, shows the display-only
//! prefix while it arrives, then extracts the tagged JSON payload at the end of
//! the stream and normalizes it into a fully-shaped record for its job type.
//! Usage is metered separately through the [`ledger`].

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

// The shared database pool type
pub type DbPool = Pool<SqliteConnectionManager>;

// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Store Error: {0}")]
    Store(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub mod backend;
pub mod config;
pub mod extraction;
pub mod job;
pub mod ledger;
pub mod normalize;
pub mod pricing;
pub mod settings;
pub mod store;
pub mod stream_tags;

pub use backend::{
    BackendError, CancellationToken, Generation, GenerationBackend, GenerationRequest,
    TokenUsage,
};
pub use extraction::Extraction;
pub use job::{
    EngineSnapshot, ErrorKind, ErrorRecord, JobCallbacks, JobController, JobDescriptor,
    JobFailure, JobOutcome, JobPhase, JobRejection, JobSuccess, JobType, StreamingState,
};
pub use ledger::{LimitCheck, LimitConfig, UsageEntry, UsageLedger};
pub use normalize::NormalizeError;
pub use pricing::PriceTable;
pub use store::KeyValueStore;
