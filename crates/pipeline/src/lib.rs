//! Answer resolution for askdb.
//!
//! [`ResolutionPipeline`] turns one question into zero, one or two database
//! round-trips and a final answer, using the [`Reasoner`](askdb_reasoner::Reasoner)
//! for every decision and composition step.

pub mod pipeline;
pub mod prompts;

pub use pipeline::{
    PREVIOUS_RESULT_FRAGMENT, RESULT_FRAGMENT, ResolutionPipeline, SCHEMA_FRAGMENT,
    SCHEMA_UNAVAILABLE,
};
pub use prompts::{PromptKind, Prompts};
