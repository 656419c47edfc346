use thiserror::Error;

/// Failure modes of a dump parse.
///
/// `UnexpectedEof` is fatal only when it occurs mid-record; at a record
/// boundary the reader treats it as the normal stream terminator and never
/// surfaces it to the caller.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEof { offset: u64 },

    #[error("dump declares version {major}.{minor}, supported maximum is {max_major}.{max_minor}")]
    VersionMismatch {
        major: u8,
        minor: u8,
        max_major: u8,
        max_minor: u8,
    },

    #[error("protocol error at offset {offset}: {message}")]
    Protocol { offset: u64, message: String },

    #[error("constant pool index {index} unresolved at offset {offset}")]
    PoolIndexOutOfRange { index: u16, offset: u64 },

    #[error("group close without matching open at offset {offset}")]
    UnbalancedGroups { offset: u64 },

    #[error("read cancelled")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadError {
    pub(crate) fn protocol(offset: u64, message: impl Into<String>) -> Self {
        ReadError::Protocol {
            offset,
            message: message.into(),
        }
    }

    /// True for the cancellation signal, which is reported to the user as a
    /// cancelled load rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ReadError::Interrupted)
    }
}
