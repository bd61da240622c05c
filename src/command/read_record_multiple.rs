//! Read Record Multiple: fetch the same byte range out of several
//! consecutive records in one exchange (revision 3 and Light only).

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError};

const INS: u8 = 0xB3;
const NAME: &str = "Read Record Multiple";

#[derive(Clone, Debug)]
pub(crate) struct ReadRecordMultipleCmd {
    request: ApduRequest,
    sfi: u8,
    first_record: u8,
    offset: u8,
    length: u8,
}

impl ReadRecordMultipleCmd {
    /// Read `length` bytes at `offset` from every record starting at
    /// `first_record`, as many as fit the response payload
    pub fn new(card: &CalypsoCard, sfi: u8, first_record: u8, offset: u8, length: u8) -> Self {
        let apdu = build_apdu(
            card.card_class(),
            INS,
            first_record,
            sfi << 3 | 0x05,
            Some(&[offset, length]),
            Some(0),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            sfi,
            first_record,
            offset,
            length,
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
        let data = response.data_out();
        let length = self.length as usize;
        let mut record = self.first_record;
        let mut index = 0;
        while index + length <= data.len() && length > 0 {
            card.fill_record_content(
                self.sfi,
                record,
                &data[index..index + length],
                self.offset as usize,
            );
            record += 1;
            index += length;
        }
        Ok(())
    }
}
