//! ISO/IEC 7816-4 Application Protocol Data Units exchanged with the card,
//! and the grouped request/response lists handed to a [CardReader].
//!
//! [CardReader]: ../reader/trait.CardReader.html

use byteorder::{BigEndian, ByteOrder};
use std::fmt::Write as FmtWrite;
use uuid::Uuid;

/// Status word returned by every command on success
pub const SW_OK: u16 = 0x9000;

/// Length of the CLA/INS/P1/P2/Lc header
pub const APDU_HEADER_LENGTH: usize = 5;

/// A single command APDU, ready to be transmitted
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApduRequest {
    /// Raw APDU bytes (CLA INS P1 P2 [Lc data] [Le])
    apdu: Vec<u8>,

    /// Status words accepted as successful in addition to `9000`
    successful_status_words: Vec<u16>,

    /// Short label used in logs and audit data
    info: &'static str,
}

impl ApduRequest {
    /// Wrap raw APDU bytes
    pub fn new(apdu: Vec<u8>) -> Self {
        Self {
            apdu,
            successful_status_words: Vec::new(),
            info: "",
        }
    }

    /// Accept an additional status word as successful (e.g. `6200` for
    /// postponed data, `6B00` for the ratification probe)
    pub fn with_successful_status_word(mut self, sw: u16) -> Self {
        self.successful_status_words.push(sw);
        self
    }

    /// Attach a log label
    pub fn with_info(mut self, info: &'static str) -> Self {
        self.info = info;
        self
    }

    /// Raw APDU bytes
    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    /// Log label
    pub fn info(&self) -> &'static str {
        self.info
    }

    /// Is the given status word successful for this request?
    pub fn is_status_successful(&self, sw: u16) -> bool {
        sw == SW_OK || self.successful_status_words.contains(&sw)
    }
}

/// A response APDU: data field followed by SW1/SW2
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApduResponse {
    bytes: Vec<u8>,
}

impl ApduResponse {
    /// Wrap raw response bytes (must include the trailing status word)
    pub fn new<T: Into<Vec<u8>>>(bytes: T) -> Self {
        let bytes = bytes.into();
        debug_assert!(bytes.len() >= 2, "response shorter than a status word");
        Self { bytes }
    }

    /// Build a response from a data field and a status word (used for
    /// anticipated responses)
    pub fn from_data_and_status(data: &[u8], sw: u16) -> Self {
        let mut bytes = Vec::with_capacity(data.len() + 2);
        bytes.extend_from_slice(data);
        bytes.push((sw >> 8) as u8);
        bytes.push((sw & 0xFF) as u8);
        Self { bytes }
    }

    /// Full response bytes, status word included
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Response data field, status word stripped
    pub fn data_out(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 2]
    }

    /// SW1/SW2 as a big-endian u16
    pub fn status_word(&self) -> u16 {
        BigEndian::read_u16(&self.bytes[self.bytes.len() - 2..])
    }
}

/// Policy applied to the physical channel after a card request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelControl {
    /// Keep the channel open for further exchanges
    KeepOpen,

    /// Release the channel once the last response is received
    CloseAfter,
}

/// An ordered list of APDUs transmitted as one unit
#[derive(Clone, Debug)]
pub struct CardRequest {
    /// UUID which uniquely identifies this request in logs
    pub uuid: Uuid,

    /// APDUs to transmit, in order
    pub apdu_requests: Vec<ApduRequest>,

    /// Stop transmitting at the first APDU whose status word is not in
    /// its successful set
    pub stop_on_unsuccessful: bool,
}

impl CardRequest {
    /// Group APDUs into a single card request
    pub fn new(apdu_requests: Vec<ApduRequest>, stop_on_unsuccessful: bool) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            apdu_requests,
            stop_on_unsuccessful,
        }
    }
}

/// Responses collected for a [CardRequest], in transmission order
///
/// [CardRequest]: struct.CardRequest.html
#[derive(Clone, Debug)]
pub struct CardResponse {
    /// One response per transmitted APDU (possibly fewer than requested
    /// when the exchange stopped early)
    pub apdu_responses: Vec<ApduResponse>,

    /// Is the logical channel still open?
    pub is_logical_channel_open: bool,
}

impl CardResponse {
    /// Group response APDUs
    pub fn new(apdu_responses: Vec<ApduResponse>, is_logical_channel_open: bool) -> Self {
        Self {
            apdu_responses,
            is_logical_channel_open,
        }
    }
}

/// Render bytes as uppercase hex
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{:02X}", byte).expect("infallible write");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_split() {
        let response = ApduResponse::new(vec![0x11, 0x22, 0x90, 0x00]);
        assert_eq!(response.data_out(), &[0x11, 0x22]);
        assert_eq!(response.status_word(), 0x9000);
    }

    #[test]
    fn anticipated_response_round_trip() {
        let response = ApduResponse::from_data_and_status(&[0xAA], 0x6200);
        assert_eq!(response.bytes(), &[0xAA, 0x62, 0x00]);
        assert_eq!(response.status_word(), 0x6200);
    }

    #[test]
    fn extra_successful_status_words() {
        let request = ApduRequest::new(vec![0x00, 0xB2, 0x00, 0x00, 0x00])
            .with_successful_status_word(0x6B00);
        assert!(request.is_status_successful(0x9000));
        assert!(request.is_status_successful(0x6B00));
        assert!(!request.is_status_successful(0x6A82));
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(to_hex(&[0x00, 0xB2, 0x01, 0x3C]), "00B2013C");
    }
}
