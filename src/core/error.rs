use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    BadRequest,
    LockFailure,
    TransactionFailure,
    CompileFailure,
    EvaluationFailure,
    Io,
    Internal,
}

impl ErrorKind {
    /// Default HTTP status for this kind of failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::BadRequest
            | ErrorKind::CompileFailure
            | ErrorKind::EvaluationFailure => 400,
            ErrorKind::LockFailure => 503,
            ErrorKind::TransactionFailure | ErrorKind::Io | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
    /// Query text that produced the failure, echoed in the error envelope.
    pub query: Option<String>,
    status: Option<u16>,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context, query: None, status: None }
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context.into())
    }

    pub fn permission_denied(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::PermissionDenied, context.into())
    }

    pub fn bad_request(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::BadRequest, context.into())
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Overrides the status derived from the kind.
    pub fn at_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or_else(|| self.kind.status_code())
    }

    pub fn is_query_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::CompileFailure | ErrorKind::EvaluationFailure)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Internal, format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(Error::not_found("x").status_code(), 404);
        assert_eq!(Error::permission_denied("x").status_code(), 403);
        assert_eq!(Error::bad_request("x").status_code(), 400);
        assert_eq!(Error::new(ErrorKind::LockFailure, "x".into()).status_code(), 503);
        assert_eq!(Error::new(ErrorKind::TransactionFailure, "x".into()).status_code(), 500);
    }

    #[test]
    fn override_wins_over_kind() {
        let err = Error::new(ErrorKind::EvaluationFailure, "boom".into()).at_status(500);
        assert_eq!(err.status_code(), 500);
        assert!(err.is_query_failure());
    }
}
