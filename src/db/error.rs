use std::{error, fmt};

use sled::transaction::TransactionError;

/// What went wrong, for callers to branch on. The description is for humans only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A bucket the schema expects at this version is missing
    BucketNotFound,
    /// A stored value could not be decoded into its entity
    CorruptRecord,
    /// A stored key doesn't match its record, or a mandatory field is missing
    InvariantViolation,
    /// The database was written by a newer version than we know of
    UnsupportedVersion,
    /// An error originating from the storage engine
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::BucketNotFound => "bucket not found",
            Self::CorruptRecord => "corrupt record",
            Self::InvariantViolation => "invariant violation",
            Self::UnsupportedVersion => "unsupported version",
            Self::Storage => "storage error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub struct DbError {
    kind: ErrorKind,
    desc: String,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

impl DbError {
    pub fn new(kind: ErrorKind, desc: impl Into<String>) -> DbError {
        DbError {
            kind,
            desc: desc.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        desc: impl Into<String>,
        cause: impl error::Error + Send + Sync + 'static,
    ) -> DbError {
        DbError {
            kind,
            desc: desc.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn bucket_not_found(name: &str) -> DbError {
        DbError::new(
            ErrorKind::BucketNotFound,
            format!("bucket {} not found", name),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.desc
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.cause {
            Some(ref e) => write!(f, "{}: {} ({})", self.kind, self.desc, e),
            None => write!(f, "{}: {}", self.kind, self.desc),
        }
    }
}

impl error::Error for DbError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<sled::Error> for DbError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => {
                DbError::with_cause(ErrorKind::CorruptRecord, "storage engine corruption", e)
            }
            e => DbError::with_cause(ErrorKind::Storage, "storage engine failure", e),
        }
    }
}

impl From<TransactionError<DbError>> for DbError {
    fn from(e: TransactionError<DbError>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        }
    }
}
