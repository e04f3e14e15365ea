//! Kernel error codes.

use core::fmt;

/// Errors returned by kernel capability primitives.
///
/// These are passed through to callers verbatim; the userland layers never
/// reinterpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// A capability lookup failed to resolve.
    FailedLookup,
    /// An argument was outside the range the primitive accepts.
    InvalidArgument,
    /// A capability argument named the wrong kind of object.
    InvalidCapability,
    /// The operation is not permitted on this object.
    IllegalOperation,
    /// An index or depth argument was out of range.
    RangeError,
    /// An address argument was misaligned.
    AlignmentError,
    /// A transferred message was truncated.
    TruncatedMessage,
    /// The destination slot is already occupied.
    DeleteFirst,
    /// The object still has derived capabilities.
    RevokeFirst,
    /// The untyped has insufficient free memory for the requested object.
    NotEnoughMemory,
}

/// Result alias for kernel primitives.
pub type SysResult<T = ()> = Result<T, SysError>;

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::FailedLookup => "failed lookup",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidCapability => "invalid capability",
            Self::IllegalOperation => "illegal operation",
            Self::RangeError => "range error",
            Self::AlignmentError => "alignment error",
            Self::TruncatedMessage => "truncated message",
            Self::DeleteFirst => "delete first",
            Self::RevokeFirst => "revoke first",
            Self::NotEnoughMemory => "not enough memory",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(SysError::NotEnoughMemory.to_string(), "not enough memory");
        assert_eq!(SysError::DeleteFirst.to_string(), "delete first");
    }
}
