//! Opinion-map pipeline stages and their orchestration.

pub mod clusterer;
pub mod labeler;
pub mod params;
pub mod progress;
pub mod reducer;
pub mod retention;
pub mod sampler;
pub mod service;
pub mod session;
pub mod vectorizer;
pub mod worker;

pub use params::PipelineParams;
pub use service::{CancelResponse, MapService, StartRequest, StartResponse};
pub use worker::{SessionWorker, WorkerOutcome};
