//! Update Binary and Write Binary: modify part of a transparent file.
//!
//! Addressing follows the Read Binary rule: P1 carries `sfi << 3` or the
//! offset MSB, never both.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::{build_apdu, expect_success, CardCommandError};

const INS_UPDATE: u8 = 0xD6;
const INS_WRITE: u8 = 0xD0;

/// Update (replace) or Write (overlay) semantics
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WriteBinaryMode {
    Update,
    Write,
}

#[derive(Clone, Debug)]
pub(crate) struct WriteBinaryCmd {
    request: ApduRequest,
    sfi: u8,
    offset: u16,
    content: Vec<u8>,
}

impl WriteBinaryCmd {
    pub fn new(
        card: &CalypsoCard,
        mode: WriteBinaryMode,
        sfi: u8,
        offset: u16,
        content: &[u8],
    ) -> Self {
        let ins = match mode {
            WriteBinaryMode::Update => INS_UPDATE,
            WriteBinaryMode::Write => INS_WRITE,
        };
        let p1 = if sfi > 0 {
            debug_assert!(offset <= 0xFF, "offset beyond 255 requires a prior selection");
            sfi << 3
        } else {
            (offset >> 8) as u8
        };
        let apdu = build_apdu(
            card.card_class(),
            ins,
            p1,
            (offset & 0xFF) as u8,
            Some(content),
            None,
        );
        Self {
            request: ApduRequest::new(apdu).with_info(match mode {
                WriteBinaryMode::Update => "Update Binary",
                WriteBinaryMode::Write => "Write Binary",
            }),
            sfi,
            offset,
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
        card.fill_binary_content(self.sfi, &self.content, self.offset as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};

    fn card() -> CalypsoCard {
        CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn update_binary_apdu() {
        let cmd = WriteBinaryCmd::new(&card(), WriteBinaryMode::Update, 0x05, 4, &[0xAA]);
        assert_eq!(cmd.request().apdu(), &[0x00, 0xD6, 0x28, 0x04, 0x01, 0xAA]);
    }

    #[test]
    fn image_updated_on_success() {
        let mut card = card();
        let cmd = WriteBinaryCmd::new(&card, WriteBinaryMode::Write, 0x05, 1, &[0xAA, 0xBB]);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x90, 0x00]))
            .unwrap();
        assert_eq!(
            card.get_file_by_sfi(0x05).unwrap().data().binary_content().unwrap(),
            &[0x00, 0xAA, 0xBB]
        );
    }
}
