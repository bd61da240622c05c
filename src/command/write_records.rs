//! Record-modifying commands: Append Record, Update Record, Write Record.
//!
//! Update replaces the whole record; Write overlays its bytes and leaves
//! anything beyond the written length untouched; Append pushes the new
//! most-recent record of a cyclic file.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::{build_apdu, expect_success, CardCommandError};

const INS_APPEND: u8 = 0xE2;
const INS_UPDATE: u8 = 0xDC;
const INS_WRITE: u8 = 0xD2;

#[derive(Clone, Debug)]
pub(crate) struct AppendRecordCmd {
    request: ApduRequest,
    sfi: u8,
    content: Vec<u8>,
}

impl AppendRecordCmd {
    pub fn new(card: &CalypsoCard, sfi: u8, content: &[u8]) -> Self {
        let apdu = build_apdu(card.card_class(), INS_APPEND, 0, sfi << 3, Some(content), None);
        Self {
            request: ApduRequest::new(apdu).with_info("Append Record"),
            sfi,
            content: content.to_vec(),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        expect_success("Append Record", response)?;
        card.add_cyclic_content(self.sfi, &self.content);
        Ok(())
    }
}

/// Update (replace) or Write (overlay) semantics
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WriteRecordMode {
    Update,
    Write,
}

#[derive(Clone, Debug)]
pub(crate) struct WriteRecordCmd {
    request: ApduRequest,
    mode: WriteRecordMode,
    sfi: u8,
    record_number: u8,
    content: Vec<u8>,
}

impl WriteRecordCmd {
    pub fn new(
        card: &CalypsoCard,
        mode: WriteRecordMode,
        sfi: u8,
        record_number: u8,
        content: &[u8],
    ) -> Self {
        let ins = match mode {
            WriteRecordMode::Update => INS_UPDATE,
            WriteRecordMode::Write => INS_WRITE,
        };
        let apdu = build_apdu(
            card.card_class(),
            ins,
            record_number,
            sfi << 3 | 0x04,
            Some(content),
            None,
        );
        Self {
            request: ApduRequest::new(apdu).with_info(match mode {
                WriteRecordMode::Update => "Update Record",
                WriteRecordMode::Write => "Write Record",
            }),
            mode,
            sfi,
            record_number,
            content: content.to_vec(),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn name(&self) -> &'static str {
        self.request.info()
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        expect_success(self.name(), response)?;
        match self.mode {
            WriteRecordMode::Update => {
                card.set_record_content(self.sfi, self.record_number, &self.content)
            }
            WriteRecordMode::Write => {
                card.fill_record_content(self.sfi, self.record_number, &self.content, 0)
            }
        }
        Ok(())
    }
}
