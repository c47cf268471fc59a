//! Admission control and continuous-batching scheduling for the inference
//! gateway: token estimation, context-window compaction, KV-cache capacity
//! accounting, per-tenant rate limiting, request-id deduplication, the
//! decode loop, and the orchestrator that ties them together.

pub mod capacity;
pub mod context_window;
pub mod gateway;
pub mod identity;
pub mod rate_limit;
pub mod scheduler;
pub mod tokenization;

pub use gateway::{GenerateRequest, GenerateResponse, Gateway};
pub use scheduler::{GenerationResult, InferenceJob, Scheduler};
