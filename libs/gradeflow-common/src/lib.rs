pub mod config;
pub mod grade;
pub mod locks;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use grade::{ExecutionState, GradeRecord};
pub use paths::{CollectionKey, FileStore, StoredFile};
pub use queue::{Delivery, JobConsumer, JobPublisher, QueueError, QueueTopology, Redelivery};
pub use types::{JobMessage, ResultPayload, SubmissionTarget, TestStatus, Visibility};
