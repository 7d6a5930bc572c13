/// Errors surfaced by the engine and its storages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("storage not bound")]
    StorageNotBound,

    #[error("already initiated")]
    AlreadyInitiated,

    #[error("initiator must collect have/need ids")]
    InitiatorRoleViolation,

    #[error("only the initiator collects have/need ids")]
    ResponderRoleViolation,

    #[error("frame size limit too small")]
    FrameSizeLimitTooSmall,

    #[error("already sealed")]
    AlreadySealed,

    #[error("not sealed")]
    NotSealed,

    #[error("duplicate item")]
    DuplicateItem,

    #[error("bad range")]
    BadRange,

    #[error("index out of range")]
    OutOfRange,

    #[error("bad id size")]
    BadIdSize,

    #[error("hex decoding failed")]
    HexDecodeFailed,

    #[error("parse ends prematurely")]
    ParseEndsPrematurely,

    #[error("premature end of varint")]
    PrematureEndOfVarint,

    #[error("invalid protocol version {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("unexpected mode {0}")]
    UnexpectedMode(u64),

    #[error("missing tree node {0}")]
    MissingNode(u64),

    #[error("tree invariant broken: {0}")]
    TreeCorrupt(&'static str),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<hex::FromHexError> for Error {
    fn from(_e: hex::FromHexError) -> Self {
        Error::HexDecodeFailed
    }
}
