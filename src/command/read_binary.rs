//! Read Binary: fetch part of a transparent file.
//!
//! P1 carries `sfi << 3` or the offset MSB, never both: once the offset
//! exceeds 255 the file must already be the current one, which is why the
//! manager prepends a one-byte read at offset 0 in that case.

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError};

const INS: u8 = 0xB0;
const NAME: &str = "Read Binary";

#[derive(Clone, Debug)]
pub(crate) struct ReadBinaryCmd {
    request: ApduRequest,
    sfi: u8,
    offset: u16,
}

impl ReadBinaryCmd {
    /// Read `length` bytes at `offset`; pass `sfi` 0 when the file is
    /// already current
    pub fn new(card: &CalypsoCard, sfi: u8, offset: u16, length: u8) -> Self {
        let p1 = if sfi > 0 {
            debug_assert!(offset <= 0xFF, "offset beyond 255 requires a prior selection");
            sfi << 3
        } else {
            (offset >> 8) as u8
        };
        let apdu = build_apdu(
            card.card_class(),
            INS,
            p1,
            (offset & 0xFF) as u8,
            None,
            Some(length),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            sfi,
            offset,
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
        let sw = response.status_word();
        if sw != SW_OK {
            return Err(common_status(NAME, sw));
        }
        card.fill_binary_content(self.sfi, response.data_out(), self.offset as usize);
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
    fn sfi_addressing() {
        let cmd = ReadBinaryCmd::new(&card(), 0x05, 0x10, 0x20);
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB0, 0x28, 0x10, 0x20]);
    }

    #[test]
    fn offset_addressing_without_sfi() {
        let cmd = ReadBinaryCmd::new(&card(), 0, 0x0123, 0x40);
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB0, 0x01, 0x23, 0x40]);
    }

    #[test]
    fn content_lands_at_offset() {
        let mut card = card();
        let cmd = ReadBinaryCmd::new(&card, 0x05, 2, 2);
        cmd.parse(&mut card, &ApduResponse::new(vec![0xAA, 0xBB, 0x90, 0x00]))
            .unwrap();
        assert_eq!(
            card.get_file_by_sfi(0x05).unwrap().data().binary_content().unwrap(),
            &[0x00, 0x00, 0xAA, 0xBB]
        );
    }
}
