//! Codec error types.

/// A buffer could not be decoded against the expected schema.
///
/// Every variant is a format mismatch: the caller gets "cannot load",
/// never a partially decoded value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer does not start with the expected magic bytes.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Magic this decoder accepts.
        expected: [u8; 4],
        /// Magic found in the buffer.
        found: [u8; 4],
    },

    /// The buffer was written by an incompatible format version.
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build reads.
        expected: u16,
        /// Version found in the header.
        found: u16,
    },

    /// A read or declared length runs past the end of the buffer.
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A record carried a different tag than the schema expects.
    #[error("unexpected record tag {found} (expected {expected})")]
    UnexpectedTag {
        /// Tag required at this position.
        expected: u16,
        /// Tag found in the buffer.
        found: u16,
    },

    /// A discriminant did not match any known variant.
    #[error("unknown {context} tag {tag}")]
    UnknownTag {
        /// What was being decoded.
        context: &'static str,
        /// The unrecognized value.
        tag: u16,
    },

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),

    /// Length-prefixed text was not UTF-8.
    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,

    /// A record body or a whole buffer had bytes left over after decoding.
    #[error("{count} trailing bytes after {context}")]
    TrailingBytes {
        /// What was being decoded.
        context: &'static str,
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// Well-formed bytes describing an impossible value.
    #[error("invalid {context}: {detail}")]
    Invalid {
        /// What was being decoded.
        context: &'static str,
        /// Human-readable description.
        detail: String,
    },
}

impl CodecError {
    /// Shorthand for [`CodecError::Invalid`].
    pub fn invalid(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid {
            context,
            detail: detail.into(),
        }
    }
}
