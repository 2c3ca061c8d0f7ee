//! Error type definitions for crawlherd
//!
//! A hierarchical error system: one top-level application error plus
//! layer-specific enums for the supervisor, the fetch strategies and the
//! checkpoint store.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Process supervision errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Fetch strategy errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Checkpoint persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Run supervision specific errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The worker process could not be spawned
    #[error("Failed to spawn worker for run {run_id}: {message}")]
    SpawnFailed { run_id: String, message: String },

    /// A run is not in a state that allows the requested transition
    #[error("Invalid run state: run {run_id} is {status}, cannot {action}")]
    InvalidState {
        run_id: String,
        status: String,
        action: String,
    },

    /// No process handle and no usable persisted pid
    #[error("Run {run_id} is orphaned: no process handle or persisted pid")]
    Orphaned { run_id: String },

    /// Signal delivery failed
    #[error("Failed to signal pid {pid}: {message}")]
    SignalFailed { pid: u32, message: String },
}

/// Fetch strategy specific errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport-level failure after all retries
    #[error("Request failed for {url}: {message}")]
    RequestFailed { url: String, message: String },

    /// The rendering fallback could not be launched or driven
    #[error("Rendering fetch failed for {url}: {message}")]
    RenderFailed { url: String, message: String },

    /// Invalid URL
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// Checkpoint store specific errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(db) => Self::Database(db),
            Err(e) => Self::Internal {
                message: e.to_string(),
            },
        }
    }
}

impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl SupervisorError {
    pub fn spawn_failed<R: Into<String>, M: Into<String>>(run_id: R, message: M) -> Self {
        Self::SpawnFailed {
            run_id: run_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state<R: Into<String>, S: Into<String>, A: Into<String>>(
        run_id: R,
        status: S,
        action: A,
    ) -> Self {
        Self::InvalidState {
            run_id: run_id.into(),
            status: status.into(),
            action: action.into(),
        }
    }
}

impl FetchError {
    pub fn request_failed<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::RequestFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn render_failed<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::RenderFailed {
            url: url.into(),
            message: message.into(),
        }
    }
}
