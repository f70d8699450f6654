use thiserror::Error;

/// Why a dotted task path failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// The path has no `.` separating module from function.
    MissingSeparator,
    /// Nothing is registered under the module portion.
    UnknownModule,
    /// The module exists but has no function of that name.
    UnknownFunction,
}

impl std::fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolveFailure::MissingSeparator => "expected <module>.<function>",
            ResolveFailure::UnknownModule => "no such module",
            ResolveFailure::UnknownFunction => "no such function in module",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule descriptor is malformed or incomplete.
    #[error("Invalid schedule: {0}")]
    Configuration(String),

    /// The dotted function path does not name a registered task.
    #[error("Cannot resolve task {path} (module {module}): {reason}")]
    Resolution {
        path: String,
        module: String,
        reason: ResolveFailure,
    },

    /// `func_args` / `func_kwargs` is not the expected JSON shape.
    #[error("Invalid task arguments: {0}")]
    InvalidArguments(String),

    /// No job with the given identifier exists in the store or registry.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// A job with this `job_id` already exists.
    #[error("Job already exists: {job_id}")]
    Conflict { job_id: String },

    /// The request itself is out of bounds (pagination, retention window).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl SchedulerError {
    /// Short error code string sent to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::Resolution { .. } => "RESOLUTION_ERROR",
            SchedulerError::InvalidArguments(_) => "INVALID_ARGUMENTS",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::InvalidRequest(_) => "INVALID_REQUEST",
            SchedulerError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        SchedulerError::NotFound { id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
