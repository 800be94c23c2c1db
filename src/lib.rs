pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod job;
pub mod media;
pub mod observability;
pub mod overlay;
pub mod plan;
pub mod request;
pub mod validation;
pub mod workspace;

pub use config::ServiceConfig;
pub use error::{PipelineError, PipelineResult};
pub use job::{JobOutcome, JobRunner};
pub use request::{JobRequest, JobResponse};
