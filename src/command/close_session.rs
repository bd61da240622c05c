//! Close Secure Session.
//!
//! The regular form carries the terminal session MAC (4 bytes, 8 in
//! extended mode) and P1 selects "close and ratify" (`80`) or "close not
//! ratified" (`00`). The abort form carries no MAC at all and tears the
//! session down without authentication.
//!
//! Response: zero or more length-prefixed postponed items (counter values
//! and SV MACs produced by in-session commands), then the card session
//! MAC.

use apdu::{ApduRequest, ApduResponse, SW_OK};
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};

const INS: u8 = 0x8E;
const NAME: &str = "Close Secure Session";

/// Fields extracted from the Close Session response
#[derive(Clone, Debug)]
pub(crate) struct CloseSessionOutput {
    /// Card session MAC
    pub card_mac: Vec<u8>,

    /// Postponed data items, in session order
    pub postponed_data: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub(crate) struct CloseSessionCmd {
    request: ApduRequest,
    extended: bool,
}

impl CloseSessionCmd {
    /// Regular close carrying the terminal MAC
    pub fn new(card_class: u8, ratify: bool, terminal_mac: &[u8], extended: bool) -> Self {
        let p1 = if ratify { 0x80 } else { 0x00 };
        let apdu = build_apdu(card_class, INS, p1, 0x00, Some(terminal_mac), None);
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            extended,
        }
    }

    /// Abort form: no MAC, used to leave a broken session in a defined
    /// state
    pub fn abort(card_class: u8) -> Self {
        let apdu = build_apdu(card_class, INS, 0x00, 0x00, None, Some(0));
        Self {
            // 6985 = no session open, which an abort treats as done
            request: ApduRequest::new(apdu)
                .with_info("Close Secure Session (abort)")
                .with_successful_status_word(0x6985),
            extended: false,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&self, response: &ApduResponse) -> Result<CloseSessionOutput, CardCommandError> {
        let sw = response.status_word();
        if sw != SW_OK {
            return Err(common_status(NAME, sw));
        }
        let data = response.data_out();
        let mac_length = if self.extended { 8 } else { 4 };
        ensure!(
            data.len() >= mac_length,
            CardCommandErrorKind::Parsing,
            "{}: response shorter than the card MAC",
            NAME
        );
        let items_end = data.len() - mac_length;
        let mut postponed_data = Vec::new();
        let mut index = 0;
        while index < items_end {
            let length = data[index] as usize;
            index += 1;
            ensure!(
                index + length <= items_end,
                CardCommandErrorKind::Parsing,
                "{}: truncated postponed item",
                NAME
            );
            postponed_data.push(data[index..index + length].to_vec());
            index += length;
        }
        Ok(CloseSessionOutput {
            card_mac: data[items_end..].to_vec(),
            postponed_data,
        })
    }
}
