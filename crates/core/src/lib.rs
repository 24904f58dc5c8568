//! # askdb Core
//!
//! Domain types, traits, and error definitions for the askdb
//! question-answering service. This crate has **no runtime dependencies**:
//! it defines the model that the reasoner, store, pipeline and gateway
//! crates implement against.
//!
//! ## Seams
//!
//! Every external collaborator is a trait here:
//! - [`ReasoningBackend`]: the raw upstream reasoning engine
//! - [`ExternalContextStore`]: out-of-band storage for oversized prompt fragments
//! - [`SchemaProvider`] / [`QueryExecutor`]: the relational domain store
//!
//! Implementations live in their own crates, and each has an in-memory
//! counterpart for tests.

pub mod context;
pub mod error;
pub mod message;
pub mod reasoning;
pub mod rows;
pub mod store;
pub mod verdict;

// Re-export key types at crate root for ergonomics
pub use context::{ExternalContextStore, ExternalFragment, FragmentId};
pub use error::{Error, FragmentError, ReasonerError, Result, StoreError};
pub use message::{ChatMessage, History, Inquiry, Role, Turn};
pub use reasoning::{ReasoningBackend, RemoteFile, SessionId};
pub use rows::{Row, RowSet, StaticTable, StaticTables};
pub use store::{QueryExecutor, SchemaProvider};
pub use verdict::{Decision, ParsedVerdict, Verdict};
