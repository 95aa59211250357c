use std::io;

/// Machine-readable error code, stable across the SDK surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    InitializationFailed,
    ResourceUnavailable,
    PermissionDenied,
    Timeout,
    NetworkError,
    PluginLoadFailed,
    PluginExecutionFailed,
    BackendError,
    InternalError,
    NotImplemented,
    CleanupFailed,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(#[source] io::Error),

    #[error("plugin load failed: {0}")]
    PluginLoad(String),

    #[error("plugin execution failed: {0}")]
    PluginExecution(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::InitializationFailed(_) => ErrorCode::InitializationFailed,
            Error::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Network(_) => ErrorCode::NetworkError,
            Error::PluginLoad(_) => ErrorCode::PluginLoadFailed,
            Error::PluginExecution(_) => ErrorCode::PluginExecutionFailed,
            Error::Backend(_) => ErrorCode::BackendError,
            Error::Internal(_) => ErrorCode::InternalError,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
            Error::Cleanup(_) => ErrorCode::CleanupFailed,
            Error::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Maps an OS error raised on a capture path to the matching code.
    pub fn from_os(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{context}: {err}"))
            }
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => {
                Error::ResourceUnavailable(format!("{context}: {err}"))
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Error::Timeout(format!("{context}: {err}"))
            }
            _ => Error::Network(err),
        }
    }

    /// The last OS error, wrapped with context.
    pub fn last_os(context: &str) -> Self {
        Self::from_os(context, io::Error::last_os_error())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_os("io", err)
    }
}

impl From<wireparse::Error> for Error {
    fn from(err: wireparse::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::InvalidArgument("x".into()).code(), ErrorCode::InvalidArgument);
        assert_eq!(Error::Cleanup("x".into()).code(), ErrorCode::CleanupFailed);
        assert_eq!(
            Error::Network(io::Error::other("x")).code(),
            ErrorCode::NetworkError
        );
    }

    #[test]
    fn test_os_error_mapping() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert_eq!(Error::from_os("bind", denied).code(), ErrorCode::PermissionDenied);

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from_os("open", missing).code(), ErrorCode::ResourceUnavailable);
    }
}
