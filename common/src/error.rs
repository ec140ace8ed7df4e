use std::io;

/// Coarse classification shared by every component's error type.
///
/// Transient and crash classes are recovered locally (retry with backoff,
/// supervised restart). `PermissionDenied` and `Fatal` are surfaced to the
/// operator; ownership and permissions are a precondition and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientExternalFailure,
    CorruptGeneration,
    ProcessCrash,
    ConfigFormatUnrecognized,
    PermissionDenied,
    Fatal,
}

impl ErrorClass {
    /// Classify an io error raised while talking to an external service.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorClass::PermissionDenied,
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof => ErrorClass::TransientExternalFailure,
            _ => ErrorClass::Fatal,
        }
    }
}
