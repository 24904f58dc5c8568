//! Reasoning engine adapter for askdb.
//!
//! [`Reasoner`] is what the pipeline talks to. It layers retries, a shared
//! concurrency limit and per-call timeouts over a raw
//! [`ReasoningBackend`](askdb_core::ReasoningBackend), and decides per step
//! whether the prompt fits inline or must go through a session with
//! externalized fragments.

pub mod fragments;
pub mod openai;
pub mod partition;
pub mod reasoner;
pub mod registry;
pub mod retry;
pub mod scripted;
pub mod session;

pub use fragments::RemoteContextStore;
pub use openai::OpenAiBackend;
pub use partition::{Fragment, FragmentScope, Partition, PayloadPartitioner, Placement, reference_marker};
pub use reasoner::{Reasoner, ReasonerSettings, ReasoningStep};
pub use retry::{RetryPolicy, with_retry};
pub use scripted::{BackendCall, ScriptedBackend};
pub use session::Session;
