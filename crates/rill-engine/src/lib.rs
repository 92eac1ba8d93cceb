//! Rill Engine
//!
//! The workflow orchestration core: the per-workflow and per-call state
//! machines, scatter expansion, call caching, retry and preemption policy,
//! restart recovery, and the supervisor that admits submissions and
//! enforces global concurrency.
//!
//! Collaborators arrive through trait seams: persistence via
//! [`rill_store::Store`], result reuse via [`rill_cache::CacheIndex`],
//! execution via [`rill_backend::Backend`], observation via
//! [`rill_metadata::MetadataPublisher`], and all path IO via
//! [`rill_io::PathIo`].

mod call;
mod config;
mod context;
mod error;
mod expression;
mod scatter;
mod supervisor;
mod workflow;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use error::EngineError;
pub use supervisor::Supervisor;
pub use workflow::{WorkflowExecution, WorkflowOutcome};
