pub mod id;
pub mod model;
pub mod registry;
pub mod worker;

pub use model::{Job, JobStatus};
pub use registry::JobRegistry;
