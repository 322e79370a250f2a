//! Error handling tools

use hyper::StatusCode;
use std::{
    convert::Infallible,
    error::Error as StdError,
    fmt,
    io::{Error as IoError, ErrorKind},
};

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// Generic HTTP-layer error
///
/// Protocol failures on the bridge side never surface through this type;
/// they travel to the browser as `close` control frames carrying a
/// [`crate::Problem`] reason.
#[derive(Debug)]
pub struct Error {
    /// HTTP status code
    pub status: StatusCode,

    /// Inner error object
    pub(crate) inner: BoxError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl From<Infallible> for Error {
    fn from(infallible: Infallible) -> Error {
        match infallible {}
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Self {
            status: StatusCode::BAD_REQUEST,
            inner: err.into(),
        }
    }
}

impl From<IoError> for Error {
    #[inline]
    fn from(err: IoError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::InvalidData => StatusCode::BAD_REQUEST,
            ErrorKind::TimedOut => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self { inner: err.into(), status }
    }
}

impl From<hyper::http::Error> for Error {
    #[inline]
    fn from(err: hyper::http::Error) -> Self {
        Self {
            inner: err.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for IoError {
    #[inline]
    fn from(err: Error) -> Self {
        Self::other(err)
    }
}

impl Error {
    /// Creates an internal server error
    #[inline]
    pub fn server_error(err: impl Into<BoxError>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            inner: err.into(),
        }
    }

    /// Creates a client error
    #[inline]
    pub fn client_error(err: impl Into<BoxError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            inner: err.into(),
        }
    }

    /// Creates an error carrying a specific status code
    #[inline]
    pub fn from_status(status: StatusCode, err: impl Into<BoxError>) -> Self {
        Self { status, inner: err.into() }
    }

    /// Unwraps the inner error
    pub fn into_inner(self) -> BoxError {
        self.inner
    }

    /// Check if the status is within 500-599.
    #[inline]
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Check if the status is within 400-499.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, StatusCode};
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn it_creates_server_error() {
        let err = Error::server_error("some error");

        assert!(err.is_server_error());
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn it_converts_from_not_found_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "not found");
        let err = Error::from(io_error);

        assert!(err.is_client_error());
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn it_converts_from_permission_denied_io_error() {
        let io_error = IoError::new(ErrorKind::PermissionDenied, "forbidden");
        let err = Error::from(io_error);

        assert!(err.is_client_error());
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn it_converts_from_io_error() {
        let io_error = IoError::other("some error");
        let err = Error::from(io_error);

        assert!(err.is_server_error());
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn it_converts_error_to_io_error() {
        let error = Error::client_error("some error");
        let io_error = IoError::from(error);

        assert_eq!(io_error.kind(), ErrorKind::Other);
    }

    #[test]
    fn it_unwraps_into_inner() {
        let error = Error::server_error("some error");

        let inner = error.into_inner();

        assert_eq!(format!("{inner}"), "some error");
    }
}
