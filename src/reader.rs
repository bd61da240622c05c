//! Contract of the reader that carries APDUs to and from the card.
//!
//! The engine never talks to PC/SC or NFC directly: an implementation of
//! [CardReader] is handed to the transaction manager and owns the
//! physical/logical channel for the transaction's lifetime.
//!
//! [CardReader]: trait.CardReader.html

use std::error::Error as StdError;
use std::fmt::{self, Display};

use apdu::{CardRequest, CardResponse, ChannelControl};

/// Reader-level errors
///
/// Unlike the other error types of this crate this is not an
/// `Error<Kind>`: the `CardIo` and `UnexpectedStatusWord` kinds carry the
/// partial [CardResponse] collected before the failure, which the manager
/// needs to parse the exchanges that did succeed.
///
/// [CardResponse]: ../apdu/struct.CardResponse.html
#[derive(Debug)]
pub struct ReaderError {
    kind: ReaderErrorKind,
    description: Option<String>,
    response: Option<CardResponse>,
}

/// Reader error kinds
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum ReaderErrorKind {
    /// The communication with the reader itself failed
    #[fail(display = "reader communication failure")]
    ReaderIo,

    /// The communication with the card failed (card pulled out, RF lost)
    #[fail(display = "card communication failure")]
    CardIo,

    /// A command returned a status word outside its successful set while
    /// `stop_on_unsuccessful` was requested
    #[fail(display = "unexpected status word")]
    UnexpectedStatusWord,
}

impl ReaderError {
    /// Create a new reader error
    pub fn new(kind: ReaderErrorKind, description: Option<String>) -> Self {
        Self {
            kind,
            description,
            response: None,
        }
    }

    /// Attach the responses collected before the failure
    pub fn with_response(mut self, response: CardResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// Obtain the error's kind
    pub fn kind(&self) -> ReaderErrorKind {
        self.kind
    }

    /// Responses collected before the failure, if any
    pub fn response(&self) -> Option<&CardResponse> {
        self.response.as_ref()
    }

    /// Take ownership of the partial responses
    pub fn into_response(self) -> Option<CardResponse> {
        self.response
    }
}

impl Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.description {
            None => Display::fmt(&self.kind, f),
            Some(ref desc) => write!(f, "{}: {}", self.kind, desc),
        }
    }
}

impl StdError for ReaderError {}

/// Transport abstraction over the card channel
///
/// Implementations transmit each APDU of the request in order, collect
/// the responses, and honour `stop_on_unsuccessful` by cutting the
/// exchange short (raising `UnexpectedStatusWord` with the partial
/// response attached) when a status word falls outside the request's
/// successful set.
pub trait CardReader {
    /// Transmit a grouped card request and collect the responses
    fn transmit_card_request(
        &mut self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ReaderError>;

    /// Is the card reached over a contactless interface?
    ///
    /// Selects the ratification strategy at session close.
    fn is_contactless(&self) -> bool;
}
