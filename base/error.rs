// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The error type used throughout the program.
//!
//! Each error carries an [`ErrorKind`] (the gRPC status code classification,
//! which is a nice general-purpose taxonomy), an optional human-readable
//! message, and an optional source error. Construct errors with the [`err!`]
//! and [`bail!`] macros:
//!
//! ```
//! use watchpost_base::{bail, err, Error, ErrorKind};
//! fn check(user: &str) -> Result<(), Error> {
//!     if user.is_empty() {
//!         bail!(Unauthenticated, msg("empty user name"));
//!     }
//!     Ok(())
//! }
//! let e = check("").unwrap_err();
//! assert_eq!(e.kind(), ErrorKind::Unauthenticated);
//! assert_eq!(e.to_string(), "Unauthenticated: empty user name");
//! let _ = err!(Unknown, msg("user {}", "jo"), source(std::fmt::Error));
//! ```

use std::fmt;

/// Error kind, patterned after
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// The program-wide error type; see the module doc.
///
/// Boxed so that `Result<T, Error>` stays a couple words wide.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Wraps another error, preserving it as the source.
    pub fn wrap<E: Into<BoxedError>>(kind: ErrorKind, e: E) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: Some(e.into()),
        }))
    }

    /// Returns a value which displays the full source chain on one line,
    /// for logging.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }

    #[doc(hidden)]
    pub fn build(kind: ErrorKind, msg: Option<String>) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg,
            source: None,
        }))
    }

    #[doc(hidden)]
    pub fn build_with_source<E: Into<BoxedError>>(
        kind: ErrorKind,
        msg: Option<String>,
        source: E,
    ) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg,
            source: Some(source.into()),
        }))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg {
            Some(ref m) => write!(f, "{}: {}", self.0.kind, m),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// Maps I/O errors without further context; callers wanting a better message
/// or kind use `err!(..., source(e))` instead.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        let kind = match e.kind() {
            K::TimedOut | K::WouldBlock => ErrorKind::DeadlineExceeded,
            K::NotFound => ErrorKind::NotFound,
            K::PermissionDenied => ErrorKind::PermissionDenied,
            K::AlreadyExists => ErrorKind::AlreadyExists,
            K::InvalidInput | K::InvalidData => ErrorKind::InvalidArgument,
            K::ConnectionRefused
            | K::ConnectionReset
            | K::ConnectionAborted
            | K::NotConnected
            | K::BrokenPipe
            | K::UnexpectedEof => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

/// Displays an [`Error`] together with its whole source chain.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from an `ErrorKind` identifier and optional
/// `msg(...)` (format string + args) and `source(...)` clauses.
#[macro_export]
macro_rules! err {
    ($kind:ident $(,)?) => {
        $crate::Error::build($crate::ErrorKind::$kind, None)
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::Error::build($crate::ErrorKind::$kind, Some(format!($($msg)*)))
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::build_with_source($crate::ErrorKind::$kind, None, $source)
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::build_with_source(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            $source,
        )
    };
    ($kind:ident, source($source:expr), msg($($msg:tt)*) $(,)?) => {
        $crate::Error::build_with_source(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            $source,
        )
    };
}

/// Like [`err!`], but returns the error from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_kind() {
        let e = crate::err!(Unauthenticated, msg("unknown user: {}", "jo"));
        assert_eq!(e.kind(), ErrorKind::Unauthenticated);
        assert_eq!(e.to_string(), "Unauthenticated: unknown user: jo");
    }

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow read");
        let e = crate::err!(Unavailable, msg("camera fell over"), source(io));
        let chained = e.chain().to_string();
        assert!(chained.contains("camera fell over"));
        assert!(chained.contains("slow read"));
    }

    #[test]
    fn io_error_kinds() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(e.kind(), ErrorKind::DeadlineExceeded);
        let e: Error = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert_eq!(e.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn err_kind_annotates() {
        let r: Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let e = r.err_kind(ErrorKind::Internal).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }
}
