//! Calypso card commands: one submodule per command pair (request builder
//! and response parser).
//!
//! Commands prepared by the application are carried as a [CardCommand]
//! tagged sum so the transaction manager can batch them, account for
//! their session-buffer cost, anticipate their responses and route each
//! response back to the right parser. The session-control commands (Open
//! Session, Close Session, Get Challenge, ratification, PIN and key
//! management) are driven directly by the manager and keep their typed
//! structs.
//!
//! [CardCommand]: enum.CardCommand.html

pub(crate) mod change_key;
pub(crate) mod change_pin;
pub(crate) mod close_session;
pub(crate) mod counter;
pub(crate) mod get_challenge;
pub(crate) mod get_data;
pub(crate) mod invalidate;
pub(crate) mod open_session;
pub(crate) mod ratification;
pub(crate) mod read_binary;
pub(crate) mod read_record_multiple;
pub(crate) mod read_records;
pub(crate) mod search_record_multiple;
pub(crate) mod select_file;
pub(crate) mod sv_debit;
pub(crate) mod sv_get;
pub(crate) mod sv_reload;
pub(crate) mod verify_pin;
pub(crate) mod write_binary;
pub(crate) mod write_records;

pub use self::search_record_multiple::SearchCommandData;

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use error::Error;

/// Errors raised by the response parsers
pub type CardCommandError = Error<CardCommandErrorKind>;

/// Parser-level error kinds, mapped from status words
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum CardCommandErrorKind {
    /// File or record not found (`6A82`, `6A83`)
    #[fail(display = "data access error")]
    DataAccess,

    /// Security status not satisfied, wrong cryptogram, blocked PIN
    #[fail(display = "security error")]
    Security,

    /// Conditions of use not satisfied (`6985`)
    #[fail(display = "access forbidden")]
    AccessForbidden,

    /// Incorrect P1/P2/Lc or data field (`6700`, `6B00`, `6A86`)
    #[fail(display = "illegal parameter")]
    IllegalParameter,

    /// Function not supported by this product (`6A81`)
    #[fail(display = "unsupported function")]
    Unsupported,

    /// An anticipated response cannot be computed from the card image
    #[fail(display = "anticipation failed")]
    Anticipation,

    /// The response payload does not match the command's layout
    #[fail(display = "malformed response")]
    Parsing,

    /// Status word not in this command's table
    #[fail(display = "unexpected status word 0x{:04x}", sw)]
    Unknown {
        /// The offending status word
        sw: u16,
    },
}

/// Status word reported when a modifying command postpones its output to
/// the Close Session postponed data list
pub(crate) const SW_POSTPONED: u16 = 0x6200;

/// Assemble a command APDU from its fields
pub(crate) fn build_apdu(
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<&[u8]>,
    le: Option<u8>,
) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(5 + data.map(|d| d.len()).unwrap_or(0) + 1);
    apdu.push(cla);
    apdu.push(ins);
    apdu.push(p1);
    apdu.push(p2);
    if let Some(data) = data {
        debug_assert!(data.len() <= 255, "data field too long for a short APDU");
        apdu.push(data.len() as u8);
        apdu.extend_from_slice(data);
    }
    if let Some(le) = le {
        apdu.push(le);
    }
    apdu
}

/// Map the status words shared by most commands
pub(crate) fn common_status(name: &'static str, sw: u16) -> CardCommandError {
    use self::CardCommandErrorKind::*;
    match sw {
        0x6A82 => err!(DataAccess, "{}: file not found", name),
        0x6A83 => err!(DataAccess, "{}: record not found", name),
        0x6982 => err!(Security, "{}: security status not satisfied", name),
        0x6988 => err!(Security, "{}: incorrect signature", name),
        0x6985 => err!(AccessForbidden, "{}: conditions of use not satisfied", name),
        0x6981 => err!(AccessForbidden, "{}: incorrect file type", name),
        0x6700 => err!(IllegalParameter, "{}: wrong length", name),
        0x6B00 => err!(IllegalParameter, "{}: incorrect P1 or P2", name),
        0x6A86 => err!(IllegalParameter, "{}: incorrect P1 or P2", name),
        0x6A80 => err!(IllegalParameter, "{}: incorrect data field", name),
        0x6A81 => err!(Unsupported, "{}: function not supported", name),
        0x6400 => err!(AccessForbidden, "{}: no session or command refused", name),
        sw => Error::new(
            CardCommandErrorKind::Unknown { sw },
            Some(format!("{}: unexpected status word", name)),
        ),
    }
}

/// Scan one level of a BER-TLV payload (single-byte tags and lengths)
/// for `tag` and return its value
pub(crate) fn find_tlv(data: &[u8], tag: u8) -> Option<&[u8]> {
    let mut index = 0;
    while index + 2 <= data.len() {
        let current = data[index];
        let length = data[index + 1] as usize;
        index += 2;
        if index + length > data.len() {
            return None;
        }
        if current == tag {
            return Some(&data[index..index + length]);
        }
        index += length;
    }
    None
}

/// Check a plain success-only status word
pub(crate) fn expect_success(name: &'static str, response: &ApduResponse) -> Result<(), CardCommandError> {
    let sw = response.status_word();
    if sw == SW_OK {
        Ok(())
    } else {
        Err(common_status(name, sw))
    }
}

/// Data attached to a postponed item of the Close Session response
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PostponedData {
    /// A counter command whose new value arrives at close
    Counter {
        /// SFI of the counters file
        sfi: u8,
        /// Counter number (1-based)
        number: u8,
    },

    /// A Stored Value operation whose SV MAC arrives at close
    Sv,
}

/// A prepared card command awaiting transmission
#[derive(Clone, Debug)]
pub(crate) enum CardCommand {
    SelectFile(select_file::SelectFileCmd),
    GetData(get_data::GetDataCmd),
    ReadRecords(read_records::ReadRecordsCmd),
    ReadRecordMultiple(read_record_multiple::ReadRecordMultipleCmd),
    SearchRecordMultiple(search_record_multiple::SearchRecordMultipleCmd),
    ReadBinary(read_binary::ReadBinaryCmd),
    WriteBinary(write_binary::WriteBinaryCmd),
    AppendRecord(write_records::AppendRecordCmd),
    WriteRecord(write_records::WriteRecordCmd),
    Counter(counter::CounterCmd),
    CounterMultiple(counter::CounterMultipleCmd),
    SvGet(sv_get::SvGetCmd),
    SvReload(sv_reload::SvReloadCmd),
    SvDebit(sv_debit::SvDebitCmd),
    Invalidate(invalidate::InvalidateCmd),
}

impl CardCommand {
    /// The APDU request to transmit
    pub fn request(&self) -> &ApduRequest {
        match *self {
            CardCommand::SelectFile(ref cmd) => cmd.request(),
            CardCommand::GetData(ref cmd) => cmd.request(),
            CardCommand::ReadRecords(ref cmd) => cmd.request(),
            CardCommand::ReadRecordMultiple(ref cmd) => cmd.request(),
            CardCommand::SearchRecordMultiple(ref cmd) => cmd.request(),
            CardCommand::ReadBinary(ref cmd) => cmd.request(),
            CardCommand::WriteBinary(ref cmd) => cmd.request(),
            CardCommand::AppendRecord(ref cmd) => cmd.request(),
            CardCommand::WriteRecord(ref cmd) => cmd.request(),
            CardCommand::Counter(ref cmd) => cmd.request(),
            CardCommand::CounterMultiple(ref cmd) => cmd.request(),
            CardCommand::SvGet(ref cmd) => cmd.request(),
            CardCommand::SvReload(ref cmd) => cmd.request(),
            CardCommand::SvDebit(ref cmd) => cmd.request(),
            CardCommand::Invalidate(ref cmd) => cmd.request(),
        }
    }

    /// Command name for logs and error context
    pub fn name(&self) -> &'static str {
        match *self {
            CardCommand::SelectFile(_) => "Select File",
            CardCommand::GetData(_) => "Get Data",
            CardCommand::ReadRecords(_) => "Read Records",
            CardCommand::ReadRecordMultiple(_) => "Read Record Multiple",
            CardCommand::SearchRecordMultiple(_) => "Search Record Multiple",
            CardCommand::ReadBinary(_) => "Read Binary",
            CardCommand::WriteBinary(ref cmd) => cmd.name(),
            CardCommand::AppendRecord(_) => "Append Record",
            CardCommand::WriteRecord(ref cmd) => cmd.name(),
            CardCommand::Counter(ref cmd) => cmd.name(),
            CardCommand::CounterMultiple(ref cmd) => cmd.name(),
            CardCommand::SvGet(_) => "SV Get",
            CardCommand::SvReload(_) => "SV Reload",
            CardCommand::SvDebit(ref cmd) => cmd.name(),
            CardCommand::Invalidate(ref cmd) => cmd.name(),
        }
    }

    /// Does this command consume session-buffer budget?
    pub fn is_session_buffer_used(&self) -> bool {
        match *self {
            CardCommand::WriteBinary(_)
            | CardCommand::AppendRecord(_)
            | CardCommand::WriteRecord(_)
            | CardCommand::Counter(_)
            | CardCommand::CounterMultiple(_)
            | CardCommand::SvReload(_)
            | CardCommand::SvDebit(_)
            | CardCommand::Invalidate(_) => true,
            _ => false,
        }
    }

    /// Session-buffer cost: APDU length + 1 when the card counts bytes,
    /// 1 when it counts commands
    pub fn session_buffer_cost(&self, in_bytes: bool) -> i32 {
        if !self.is_session_buffer_used() {
            return 0;
        }
        if in_bytes {
            self.request().apdu().len() as i32 + 1
        } else {
            1
        }
    }

    /// Is this a one-record Read Records, eligible for folding into the
    /// Open Session APDU?
    pub fn as_single_record_read(&self) -> Option<(u8, u8)> {
        match *self {
            CardCommand::ReadRecords(ref cmd) => cmd.single_record(),
            _ => None,
        }
    }

    /// Parse the card's response and update the card image
    pub fn parse(
        &mut self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        match *self {
            CardCommand::SelectFile(ref cmd) => cmd.parse(card, response),
            CardCommand::GetData(ref cmd) => cmd.parse(card, response),
            CardCommand::ReadRecords(ref cmd) => cmd.parse(card, response),
            CardCommand::ReadRecordMultiple(ref cmd) => cmd.parse(card, response),
            CardCommand::SearchRecordMultiple(ref mut cmd) => cmd.parse(card, response),
            CardCommand::ReadBinary(ref cmd) => cmd.parse(card, response),
            CardCommand::WriteBinary(ref cmd) => cmd.parse(card, response),
            CardCommand::AppendRecord(ref cmd) => cmd.parse(card, response),
            CardCommand::WriteRecord(ref cmd) => cmd.parse(card, response),
            CardCommand::Counter(ref cmd) => cmd.parse(card, response),
            CardCommand::CounterMultiple(ref cmd) => cmd.parse(card, response),
            CardCommand::SvGet(ref cmd) => cmd.parse(card, response),
            CardCommand::SvReload(ref cmd) => cmd.parse(card, response),
            CardCommand::SvDebit(ref cmd) => cmd.parse(card, response),
            CardCommand::Invalidate(ref cmd) => cmd.parse(card, response),
        }
    }

    /// The response the card is expected to produce, fed to the SAM when
    /// this command is part of the closing batch
    pub fn anticipated_response(
        &self,
        card: &CalypsoCard,
    ) -> Result<ApduResponse, CardCommandError> {
        match *self {
            CardCommand::WriteBinary(_)
            | CardCommand::AppendRecord(_)
            | CardCommand::WriteRecord(_)
            | CardCommand::Invalidate(_) => Ok(ApduResponse::from_data_and_status(&[], SW_OK)),
            CardCommand::Counter(ref cmd) => cmd.anticipated_response(card),
            CardCommand::CounterMultiple(ref cmd) => cmd.anticipated_response(card),
            CardCommand::SvReload(_) | CardCommand::SvDebit(_) => {
                Ok(ApduResponse::from_data_and_status(&[], SW_POSTPONED))
            }
            ref other => Err(err!(
                CardCommandErrorKind::Anticipation,
                "{} has no anticipated response",
                other.name()
            )),
        }
    }

    /// If this command defers output to the Close Session response,
    /// describe the postponed item it will produce
    pub fn postponed_data(&self, card: &CalypsoCard) -> Option<PostponedData> {
        match *self {
            CardCommand::Counter(ref cmd) if card.is_counter_value_postponed() => {
                Some(PostponedData::Counter {
                    sfi: cmd.sfi(),
                    number: cmd.counter_number(),
                })
            }
            CardCommand::SvReload(_) | CardCommand::SvDebit(_) => Some(PostponedData::Sv),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apdu_assembly() {
        assert_eq!(
            build_apdu(0x00, 0xB2, 0x01, 0x3C, None, Some(0x00)),
            vec![0x00, 0xB2, 0x01, 0x3C, 0x00]
        );
        assert_eq!(
            build_apdu(0x00, 0xDC, 0x01, 0x44, Some(&[0x11, 0x22]), None),
            vec![0x00, 0xDC, 0x01, 0x44, 0x02, 0x11, 0x22]
        );
    }

    #[test]
    fn common_status_mapping() {
        assert_eq!(
            common_status("Read Records", 0x6A83).kind(),
            CardCommandErrorKind::DataAccess
        );
        assert_eq!(
            common_status("Read Records", 0x6982).kind(),
            CardCommandErrorKind::Security
        );
        assert_eq!(
            common_status("Read Records", 0x1234).kind(),
            CardCommandErrorKind::Unknown { sw: 0x1234 }
        );
    }
}
