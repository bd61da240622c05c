//! Errors surfaced by the transaction manager.

use error::Error;

/// Manager-level errors; every description carries the transaction audit
/// data (the hex dump of each `[request -> response]` pair so far)
pub type TransactionError = Error<TransactionErrorKind>;

/// Manager-level error kinds
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum TransactionErrorKind {
    /// Reader/driver failure below the card channel
    #[fail(display = "reader communication failure")]
    ReaderIo,

    /// Card channel failure
    #[fail(display = "card communication failure")]
    CardIo,

    /// The card returned a status word the command does not accept here
    #[fail(display = "unexpected command status")]
    UnexpectedCommandStatus,

    /// Response count does not match request count
    #[fail(display = "inconsistent request/response data")]
    InconsistentData,

    /// The session key pair is not in the authorized set
    #[fail(display = "unauthorized key")]
    UnauthorizedKey,

    /// The prepared modifications overflow the session buffer and
    /// multi-session is not enabled
    #[fail(display = "session buffer overflow")]
    SessionBufferOverflow,

    /// File not found during selection
    #[fail(display = "file selection failed")]
    SelectFile,

    /// The card signature could not be checked because of a crypto-side
    /// failure; the session is not authenticated
    #[fail(display = "card signature not verifiable")]
    CardSignatureNotVerifiable,

    /// Unexpected status word on a generic command
    #[fail(display = "unexpected status word")]
    UnexpectedStatusWord,

    /// Invalid argument passed to the API
    #[fail(display = "illegal argument")]
    IllegalArgument,

    /// API call incompatible with the current transaction state
    #[fail(display = "illegal state")]
    IllegalState,

    /// Command not available on this product type
    #[fail(display = "unsupported operation")]
    UnsupportedOperation,
}
