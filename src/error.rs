//! Error types for the branch engine

use std::io::{self, ErrorKind};

/// Everything the branch engine can fail with.
///
/// Failures that come from a host branch are carried untouched in
/// [`UnionError::Host`]; callers see exactly what the branch reported.
#[derive(thiserror::Error, Debug)]
pub enum UnionError {
    /// No branch accepts the requested kind of write.
    #[error("no writable branch")]
    NoWritableBranch,
    /// A cached object changed underneath us. Retry the whole operation from
    /// revalidation, not just the step that failed.
    #[error("busy or stale")]
    Busy,
    /// The caller asked not to block and the operation would have to.
    #[error("operation would block")]
    WouldBlock,
    /// A write was requested and no branch at or above the node's top is
    /// writable.
    #[error("read-only file system")]
    ReadOnlyFilesystem,
    /// Mode bits, the branch's own check, or a policy hook said no.
    #[error("permission denied")]
    PermissionDenied,
    /// Write to an immutable object.
    #[error("operation not permitted")]
    NotPermitted,
    #[error("no branch with index {0}")]
    NoSuchBranch(usize),
    #[error(transparent)]
    Host(#[from] io::Error),
}

impl UnionError {
    /// Shorthand for a host-style error of the given kind.
    pub fn kind(kind: ErrorKind) -> UnionError {
        UnionError::Host(io::Error::from(kind))
    }
    /// The `io::ErrorKind` this error reports as.
    pub fn io_kind(&self) -> ErrorKind {
        match self {
            UnionError::NoWritableBranch
            | UnionError::ReadOnlyFilesystem => ErrorKind::ReadOnlyFilesystem,
            UnionError::Busy => ErrorKind::ResourceBusy,
            UnionError::WouldBlock => ErrorKind::WouldBlock,
            UnionError::PermissionDenied
            | UnionError::NotPermitted => ErrorKind::PermissionDenied,
            UnionError::NoSuchBranch(_) => ErrorKind::InvalidInput,
            UnionError::Host(e) => e.kind(),
        }
    }
}

impl From<UnionError> for io::Error {
    fn from(err: UnionError) -> io::Error {
        match err {
            UnionError::Host(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

pub type UnionResult<T> = Result<T, UnionError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_errors_pass_through_verbatim() {
        let host = io::Error::new(ErrorKind::StorageFull, "branch 2 is full");
        let err: io::Error = UnionError::from(host).into();
        assert_eq!(err.kind(), ErrorKind::StorageFull);
        assert_eq!(err.to_string(), "branch 2 is full");
    }

    #[test]
    fn engine_errors_map_to_io_kinds() {
        let cases = [
            (UnionError::NoWritableBranch, ErrorKind::ReadOnlyFilesystem),
            (UnionError::ReadOnlyFilesystem, ErrorKind::ReadOnlyFilesystem),
            (UnionError::Busy, ErrorKind::ResourceBusy),
            (UnionError::WouldBlock, ErrorKind::WouldBlock),
            (UnionError::NotPermitted, ErrorKind::PermissionDenied),
            (UnionError::NoSuchBranch(7), ErrorKind::InvalidInput),
        ];
        for (err, kind) in cases {
            let io: io::Error = err.into();
            assert_eq!(io.kind(), kind);
        }
    }
}
