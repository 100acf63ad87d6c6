pub mod drive;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod store;

pub use drive::{DiscType, Drive, DriveClass, DriveRegistry};
pub use events::{EventHub, JobEvent};
pub use job::{Job, JobStatus};
pub use orchestrator::Orchestrator;
pub use output::{OutputProposal, OutputResolver};
pub use pipeline::PipelineExecutor;
pub use store::JobStore;
