//! **calypso**: pure Rust terminal-side transaction engine for Calypso
//! smart cards
//!
//! This crate drives a contactless or contact Calypso card through the
//! Calypso application protocol, optionally inside a mutually
//! authenticated Secure Session brokered by a SAM. It composes the
//! high-level functional operations (read/write records and binary
//! files, counters, Stored Value, PIN and key management,
//! invalidation) into ISO/IEC 7816-4 APDU exchanges, enforces the
//! session-buffer and ordering rules, and verifies the cryptographic
//! authenticity of the transaction.
//!
//! # Getting Started
//!
//! The important entry points:
//!
//! * [CardTransactionManager]: prepares and processes card commands.
//! * [CardReader]: the transport your integration implements.
//! * [CryptoDriver]: the contract of the SAM-backed crypto service.
//! * [CalypsoCard]: the card image accumulated by the transaction.
//!
//! # Example
//!
//! Reading a record outside any session:
//!
//! ```no_build
//! extern crate calypso;
//! use calypso::{CardTransactionManager, SecuritySetting};
//!
//! // `reader` implements calypso::CardReader, `card` comes from your
//! // selection stage
//! let mut transaction = CardTransactionManager::new(reader, card, SecuritySetting::new());
//! transaction
//!     .prepare_read_record(0x07, 1).unwrap()
//!     .process_commands().unwrap();
//! let record = transaction
//!     .calypso_card()
//!     .get_file_by_sfi(0x07).unwrap()
//!     .data()
//!     .content(1).unwrap();
//! println!("record: {:?}", record);
//! ```
//!
//! [CardTransactionManager]: transaction/struct.CardTransactionManager.html
//! [CardReader]: reader/trait.CardReader.html
//! [CryptoDriver]: crypto/trait.CryptoDriver.html
//! [CalypsoCard]: card/struct.CalypsoCard.html

#![crate_name = "calypso"]
#![crate_type = "rlib"]
#![deny(unsafe_code, trivial_casts, trivial_numeric_casts)]
#![doc(html_root_url = "https://docs.rs/calypso/0.1.0")]

#[cfg(feature = "mocksam")]
extern crate aes;
#[macro_use]
extern crate bitflags;
#[cfg(feature = "mocksam")]
extern crate block_modes;
extern crate byteorder;
#[cfg(feature = "mocksam")]
extern crate cmac;
extern crate failure;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[cfg(feature = "mocksam")]
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[cfg(feature = "mocksam")]
extern crate subtle;
extern crate uuid;
extern crate zeroize;

/// Error types
#[macro_use]
pub mod error;

/// APDU request/response primitives and grouped card requests
pub mod apdu;

/// The in-memory projection of the selected application
pub mod card;

/// Calypso card commands (builders and parsers)
mod command;

/// The symmetric crypto session driver contract (typically a SAM)
pub mod crypto;

/// The card reader transport contract
pub mod reader;

/// The transaction manager and its settings
pub mod transaction;

pub use apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, ChannelControl};
pub use card::{
    CalypsoCard, DirectoryHeader, ElementaryFile, FileData, FileHeader, FileType, ProductType,
    StartupInfo, SvDebitLogRecord, SvLoadLogRecord,
};
pub use command::{CardCommandError, CardCommandErrorKind, SearchCommandData};
pub use crypto::{CryptoDriver, CryptoError, CryptoErrorKind, SvCommandSecurityData};
#[cfg(feature = "mocksam")]
pub use crypto::mocksam::SoftwareSam;
pub use error::Error;
pub use reader::{CardReader, ReaderError, ReaderErrorKind};
pub use transaction::{
    AccessLevel, CardTransactionManager, GetDataTag, PinTransmissionMode, RatificationMode,
    SecuritySetting, SelectFileControl, SessionModificationMode, SvAction, SvOperation,
    TransactionError, TransactionErrorKind,
};
