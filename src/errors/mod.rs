pub mod types;

pub use types::{AppError, CheckpointError, FetchError, SupervisorError};
