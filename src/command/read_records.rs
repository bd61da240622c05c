//! Read Records: fetch one record, or a run of records as
//! `(number, length, data)` triplets.

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};

const INS: u8 = 0xB2;
const NAME: &str = "Read Records";

/// One-record or multiple-record variant
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReadMode {
    /// Read exactly the record addressed by P1
    OneRecord,

    /// Read from the record addressed by P1 upward; the response is a
    /// concatenation of `(number, length, data)` triplets
    MultipleRecords,
}

#[derive(Clone, Debug)]
pub(crate) struct ReadRecordsCmd {
    request: ApduRequest,
    sfi: u8,
    first_record: u8,
    mode: ReadMode,
}

impl ReadRecordsCmd {
    /// Read a single record; `record_size` 0 lets the card pick the length
    pub fn one_record(card: &CalypsoCard, sfi: u8, record_number: u8, record_size: u8) -> Self {
        let apdu = build_apdu(
            card.card_class(),
            INS,
            record_number,
            sfi << 3 | 0x04,
            None,
            Some(record_size),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            sfi,
            first_record: record_number,
            mode: ReadMode::OneRecord,
        }
    }

    /// Read several records starting at `first_record`; `expected_length`
    /// bounds the response (`n * (record_size + 2)`)
    pub fn multiple_records(
        card: &CalypsoCard,
        sfi: u8,
        first_record: u8,
        expected_length: u8,
    ) -> Self {
        let apdu = build_apdu(
            card.card_class(),
            INS,
            first_record,
            sfi << 3 | 0x05,
            None,
            Some(expected_length),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            sfi,
            first_record,
            mode: ReadMode::MultipleRecords,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// `(sfi, record)` when this is a one-record read, for the Open
    /// Session fold
    pub fn single_record(&self) -> Option<(u8, u8)> {
        match self.mode {
            ReadMode::OneRecord => Some((self.sfi, self.first_record)),
            ReadMode::MultipleRecords => None,
        }
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
        match self.mode {
            ReadMode::OneRecord => {
                card.set_record_content(self.sfi, self.first_record, data);
            }
            ReadMode::MultipleRecords => {
                let mut index = 0;
                while index < data.len() {
                    ensure!(
                        index + 2 <= data.len(),
                        CardCommandErrorKind::Parsing,
                        "{}: truncated record triplet",
                        NAME
                    );
                    let record_number = data[index];
                    let length = data[index + 1] as usize;
                    index += 2;
                    ensure!(
                        index + length <= data.len(),
                        CardCommandErrorKind::Parsing,
                        "{}: record {} truncated",
                        NAME,
                        record_number
                    );
                    card.set_record_content(self.sfi, record_number, &data[index..index + length]);
                    index += length;
                }
            }
        }
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
            vec![0xA0, 0x00, 0x00, 0x04, 0x04],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn one_record_apdu() {
        let cmd = ReadRecordsCmd::one_record(&card(), 0x07, 1, 0x00);
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB2, 0x01, 0x3C, 0x00]);
        assert_eq!(cmd.single_record(), Some((0x07, 1)));
    }

    #[test]
    fn one_record_updates_image() {
        let mut card = card();
        let cmd = ReadRecordsCmd::one_record(&card, 0x07, 1, 0x04);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x11, 0x22, 0x33, 0x44, 0x90, 0x00]))
            .unwrap();
        assert_eq!(
            card.get_file_by_sfi(0x07).unwrap().data().content(1).unwrap(),
            &[0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn multiple_records_triplets() {
        let mut card = card();
        let cmd = ReadRecordsCmd::multiple_records(&card, 0x07, 1, 0x00);
        assert!(cmd.single_record().is_none());
        cmd.parse(
            &mut card,
            &ApduResponse::new(vec![0x01, 0x02, 0xAA, 0xBB, 0x02, 0x02, 0xCC, 0xDD, 0x90, 0x00]),
        ).unwrap();
        let file = card.get_file_by_sfi(0x07).unwrap();
        assert_eq!(file.data().content(1).unwrap(), &[0xAA, 0xBB]);
        assert_eq!(file.data().content(2).unwrap(), &[0xCC, 0xDD]);
    }

    #[test]
    fn record_not_found_maps_to_data_access() {
        let mut card = card();
        let cmd = ReadRecordsCmd::one_record(&card, 0x07, 9, 0x00);
        let err = cmd
            .parse(&mut card, &ApduResponse::new(vec![0x6A, 0x83]))
            .unwrap_err();
        assert_eq!(err.kind(), CardCommandErrorKind::DataAccess);
        assert!(card.get_file_by_sfi(0x07).is_none());
    }
}
