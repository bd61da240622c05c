//! Select File: walk the application structure and collect file
//! descriptors.
//!
//! The response carries a proprietary descriptor under TLV tag `85`:
//!
//! ```text
//! [0]      file category (02 = DF, 04 = EF)
//! [1]      EF type (0 for a DF)
//! [2]      record size
//! [3]      number of records
//! [4..6]   LID
//! [6]      SFI (0 when none)
//! [7..11]  access conditions
//! [11..15] key indexes
//! [15]     DF/EF status
//! [16..19] KIF per session level (DF) / shared reference (sim. counters)
//! [19..22] KVC per session level (DF)
//! [22]     reserved
//! ```

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::{CalypsoCard, DirectoryHeader, FileHeader, FileType};
use command::{build_apdu, common_status, find_tlv, CardCommandError, CardCommandErrorKind};
use transaction::{AccessLevel, SelectFileControl};

const INS: u8 = 0xA4;
const NAME: &str = "Select File";

/// Tag of the proprietary descriptor in the response
const TAG_PROPRIETARY: u8 = 0x85;

const CATEGORY_DF: u8 = 0x02;
const CATEGORY_EF: u8 = 0x04;

#[derive(Clone, Debug)]
pub(crate) struct SelectFileCmd {
    request: ApduRequest,
}

impl SelectFileCmd {
    /// Select relative to the current DF (first EF, next EF, the DF
    /// itself)
    pub fn with_control(card: &CalypsoCard, control: SelectFileControl) -> Self {
        let (p1, p2) = match control {
            SelectFileControl::First => (0x02, 0x00),
            SelectFileControl::Next => (0x02, 0x02),
            SelectFileControl::CurrentDf => (0x09, 0x00),
        };
        let apdu = build_apdu(card.card_class(), INS, p1, p2, None, Some(0));
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
        }
    }

    /// Select by long file identifier
    pub fn with_lid(card: &CalypsoCard, lid: u16) -> Self {
        let mut lid_bytes = [0u8; 2];
        BigEndian::write_u16(&mut lid_bytes, lid);
        let apdu = build_apdu(card.card_class(), INS, 0x09, 0x00, Some(&lid_bytes), Some(0));
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
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
        let descriptor = find_tlv(response.data_out(), TAG_PROPRIETARY).ok_or_else(|| {
            err!(
                CardCommandErrorKind::Parsing,
                "{}: missing proprietary descriptor",
                NAME
            )
        })?;
        parse_proprietary_descriptor(card, descriptor)
    }
}

/// Rebuild the directory header or a file header from the 23-byte
/// proprietary descriptor (shared with Get Data FCP)
pub(crate) fn parse_proprietary_descriptor(
    card: &mut CalypsoCard,
    descriptor: &[u8],
) -> Result<(), CardCommandError> {
    ensure!(
        descriptor.len() >= 23,
        CardCommandErrorKind::Parsing,
        "{}: descriptor too short ({} bytes)",
        NAME,
        descriptor.len()
    );
    let mut access_conditions = [0u8; 4];
    access_conditions.copy_from_slice(&descriptor[7..11]);
    let mut key_indexes = [0u8; 4];
    key_indexes.copy_from_slice(&descriptor[11..15]);
    let lid = BigEndian::read_u16(&descriptor[4..6]);
    let status = descriptor[15];

    match descriptor[0] {
        CATEGORY_DF => {
            let mut header = DirectoryHeader::new(lid, access_conditions, key_indexes, status);
            for level in &[AccessLevel::Perso, AccessLevel::Load, AccessLevel::Debit] {
                header.set_kif(*level, descriptor[16 + *level as usize]);
                header.set_kvc(*level, descriptor[19 + *level as usize]);
            }
            card.set_directory_header(header);
            Ok(())
        }
        CATEGORY_EF => {
            let file_type = FileType::from_u8(descriptor[1]).ok_or_else(|| {
                err!(
                    CardCommandErrorKind::Parsing,
                    "{}: unknown EF type 0x{:02x}",
                    NAME,
                    descriptor[1]
                )
            })?;
            let shared_reference = if file_type == FileType::SimulatedCounters {
                Some(BigEndian::read_u16(&descriptor[16..18]))
            } else {
                None
            };
            let header = FileHeader {
                lid,
                records_number: descriptor[3],
                record_size: descriptor[2],
                file_type,
                access_conditions,
                key_indexes,
                df_status: status,
                shared_reference,
            };
            let sfi = descriptor[6];
            if sfi > 0 {
                card.set_file_header(sfi, header);
            }
            Ok(())
        }
        category => fail!(
            CardCommandErrorKind::Parsing,
            "{}: unknown file category 0x{:02x}",
            NAME,
            category
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};
    use transaction::AccessLevel;

    fn card() -> CalypsoCard {
        CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    fn wrap_descriptor(descriptor: &[u8]) -> Vec<u8> {
        let mut response = vec![TAG_PROPRIETARY, descriptor.len() as u8];
        response.extend_from_slice(descriptor);
        response.extend_from_slice(&[0x90, 0x00]);
        response
    }

    #[test]
    fn select_by_lid_apdu() {
        let cmd = SelectFileCmd::with_lid(&card(), 0x2010);
        assert_eq!(cmd.request().apdu(), &[0x00, 0xA4, 0x09, 0x00, 0x02, 0x20, 0x10, 0x00]);
    }

    #[test]
    fn ef_descriptor_builds_file_header() {
        let mut card = card();
        let mut descriptor = vec![0u8; 23];
        descriptor[0] = CATEGORY_EF;
        descriptor[1] = FileType::Cyclic.to_u8();
        descriptor[2] = 29;
        descriptor[3] = 3;
        descriptor[4..6].copy_from_slice(&[0x20, 0x10]);
        descriptor[6] = 0x07;
        let cmd = SelectFileCmd::with_lid(&card, 0x2010);
        cmd.parse(&mut card, &ApduResponse::new(wrap_descriptor(&descriptor)))
            .unwrap();
        let header = card.get_file_by_sfi(0x07).unwrap().header().unwrap().clone();
        assert_eq!(header.lid, 0x2010);
        assert_eq!(header.file_type, FileType::Cyclic);
        assert_eq!(header.records_number, 3);
        assert_eq!(header.record_size, 29);
        assert!(card.get_file_by_lid(0x2010).is_some());
    }

    #[test]
    fn df_descriptor_builds_directory_header() {
        let mut card = card();
        let mut descriptor = vec![0u8; 23];
        descriptor[0] = CATEGORY_DF;
        descriptor[4..6].copy_from_slice(&[0x3F, 0x00]);
        descriptor[16..19].copy_from_slice(&[0x21, 0x27, 0x30]);
        descriptor[19..22].copy_from_slice(&[0x79, 0x79, 0x79]);
        let cmd = SelectFileCmd::with_control(&card, SelectFileControl::CurrentDf);
        cmd.parse(&mut card, &ApduResponse::new(wrap_descriptor(&descriptor)))
            .unwrap();
        let header = card.directory_header().unwrap();
        assert_eq!(header.lid, 0x3F00);
        assert_eq!(header.kif(AccessLevel::Load), Some(0x27));
        assert_eq!(header.kvc(AccessLevel::Debit), Some(0x79));
    }

    #[test]
    fn file_not_found() {
        let mut card = card();
        let cmd = SelectFileCmd::with_lid(&card, 0x2010);
        let err = cmd
            .parse(&mut card, &ApduResponse::new(vec![0x6A, 0x82]))
            .unwrap_err();
        assert_eq!(err.kind(), CardCommandErrorKind::DataAccess);
    }
}
