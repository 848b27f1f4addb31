//! Error type shared by the store, its write units, and the collaborators
//! built on top of it.
//!
//! Errors fall into a few groups:
//!
//! | Group | Variants | Who sees it |
//! |-------|----------|-------------|
//! | Construction | `Config`, `Open`, `Pragma`, `Pool`, `Spawn` | caller of `Db::open` |
//! | Begin | `Begin` | only the unit that tried to open a batch |
//! | Unit | `Sqlite`, `Rejected`, `Unhandled`, `TransactionEnded`, `UnitPanicked`, collaborator variants | the failing unit, verbatim |
//! | Batch | `BatchAborted`, `Commit` | every other unit of the batch |
//! | Sticky | `TxAborted` | any call on an already-aborted handle or cursor |
//! | Lifecycle | `Closed`, `WriterPanic` | callers after shutdown |

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors produced by the store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to open store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to apply pragma {pragma}: {source}")]
    Pragma {
        pragma: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create read pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to spawn writer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    /// The batch could not be persisted. Every unit of the batch receives
    /// the same underlying error.
    #[error("batch commit failed: {0}")]
    Commit(#[source] Arc<rusqlite::Error>),

    /// Another unit in the same batch failed and the batch was rolled back.
    #[error("transaction aborted")]
    BatchAborted,

    /// An operation was attempted on a handle (or a cursor derived from it)
    /// after the handle recorded an error.
    #[error("this transaction is already aborted")]
    TxAborted,

    /// The unit left the connection outside of the batch transaction.
    #[error("write unit ended the enclosing transaction")]
    TransactionEnded,

    /// The unit returned success although its handle had recorded an error.
    #[error("write unit ignored a failed operation: {0}")]
    Unhandled(String),

    /// The unit panicked. The batch is rolled back and the writer keeps
    /// running.
    #[error("write unit panicked: {0}")]
    UnitPanicked(String),

    /// The unit reported a failure of its own.
    #[error("{0}")]
    Rejected(String),

    #[error("store is closed")]
    Closed,

    #[error("writer thread panicked")]
    WriterPanic,

    #[error("no matching row found for pk {pk:?} and sk {sk:?}")]
    KeyNotFound { pk: String, sk: String },

    #[error("row with pk {pk:?} and sk {sk:?} already exists")]
    AlreadyExists { pk: String, sk: String },

    #[error("field {field:?} holds a non-finite number")]
    NonFiniteNumber { field: String },

    #[error("document {0:?} not found")]
    DocumentNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a unit-level failure from any message.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True for the errors a unit receives because a sibling failed or the
    /// batch could not be committed, rather than because of its own work.
    pub fn is_batch_failure(&self) -> bool {
        matches!(self, Self::BatchAborted | Self::Commit(_))
    }
}
