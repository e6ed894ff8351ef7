use thiserror::Error;

/// Malformed or out-of-policy request. Raised before anything is mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid end date {0:?}, expected YYYY-MM-DD")]
    InvalidEndDate(String),
    #[error("end date must be in the future")]
    EndDateInPast,
    #[error("unknown operating system template {0:?}")]
    UnknownTemplate(String),
    #[error("requested {requested} GiB of storage, at most {max} GiB allowed")]
    StorageTooLarge { requested: u32, max: u32 },
    #[error("requested {requested} GiB of memory, at most {max} GiB allowed")]
    MemoryTooLarge { requested: u32, max: u32 },
    #[error("server name must not be empty")]
    EmptyName,
    #[error("invalid home ip {0:?}")]
    InvalidHomeIp(String),
    #[error("invalid subdomain {0:?}")]
    InvalidSubdomain(String),
    #[error("invalid record value: {0}")]
    InvalidRecord(String),
}

/// Request collides with existing state or exhausts a limit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("you already have a server named {0:?}")]
    NameConflict(String),
    #[error("server limit of {limit} reached")]
    QuotaExceeded { limit: usize },
    #[error("no ip addresses available")]
    NoCapacity,
    #[error("you must own {top_level:?} to create records below it")]
    OwnershipRequired { top_level: String },
    #[error("record already exists")]
    AlreadyExists,
    #[error("at most {max} sub-subdomains are allowed below {top_level:?}")]
    TooManySubSubdomains { top_level: String, max: usize },
    #[error("server is still being provisioned")]
    NotProvisioned,
}

/// Everything a synchronous request can be rejected with.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RequestResult<T> = std::result::Result<T, RequestError>;
