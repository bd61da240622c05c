//! Get Data: read FCI, FCP, the EF list or the traceability information
//! of the current DF.

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::{CalypsoCard, FileHeader, FileType, StartupInfo};
use command::select_file::parse_proprietary_descriptor;
use command::{build_apdu, common_status, find_tlv, CardCommandError, CardCommandErrorKind};
use transaction::GetDataTag;

const INS: u8 = 0xCA;
const NAME: &str = "Get Data";

const TAG_FCI: u8 = 0x6F;
const TAG_DF_NAME: u8 = 0x84;
const TAG_FCI_PROPRIETARY: u8 = 0xA5;
const TAG_DISCRETIONARY: u8 = 0x53;
const TAG_PROPRIETARY: u8 = 0x85;
const TAG_EF_LIST: u8 = 0xC0;

/// Length of one EF descriptor in the EF list: LID (2), SFI, type,
/// record size, records number
const EF_LIST_ENTRY_LENGTH: usize = 6;

#[derive(Clone, Debug)]
pub(crate) struct GetDataCmd {
    request: ApduRequest,
    tag: GetDataTag,
}

impl GetDataCmd {
    pub fn new(card: &CalypsoCard, tag: GetDataTag) -> Self {
        let value = tag.tag();
        let apdu = build_apdu(
            card.card_class(),
            INS,
            (value >> 8) as u8,
            (value & 0xFF) as u8,
            None,
            Some(0),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            tag,
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
        match self.tag {
            GetDataTag::FciForCurrentDf => parse_fci(card, data),
            GetDataTag::FcpForCurrentFile => {
                let descriptor = find_tlv(data, TAG_PROPRIETARY).ok_or_else(|| {
                    err!(
                        CardCommandErrorKind::Parsing,
                        "{}: missing FCP descriptor",
                        NAME
                    )
                })?;
                parse_proprietary_descriptor(card, descriptor)
            }
            GetDataTag::EfList => parse_ef_list(card, data),
            GetDataTag::TraceabilityInformation => {
                card.set_traceability_information(data);
                Ok(())
            }
        }
    }
}

/// FCI: `6F { 84 df-name, A5 { 53 serial(8) || startup(7) } }`
fn parse_fci(card: &mut CalypsoCard, data: &[u8]) -> Result<(), CardCommandError> {
    let fci = find_tlv(data, TAG_FCI).ok_or_else(|| {
        err!(CardCommandErrorKind::Parsing, "{}: missing FCI template", NAME)
    })?;
    let df_name = find_tlv(fci, TAG_DF_NAME);
    let discretionary = find_tlv(fci, TAG_FCI_PROPRIETARY)
        .and_then(|proprietary| find_tlv(proprietary, TAG_DISCRETIONARY));
    let (serial, startup) = match discretionary {
        Some(value) => {
            ensure!(
                value.len() >= 15,
                CardCommandErrorKind::Parsing,
                "{}: discretionary data too short",
                NAME
            );
            (
                Some(value[0..8].to_vec()),
                StartupInfo::from_bytes(&value[8..15]),
            )
        }
        None => (None, None),
    };
    card.update_identification(df_name.map(|n| n.to_vec()), serial, startup);
    Ok(())
}

/// EF list: `C0` containing 6-byte entries
fn parse_ef_list(card: &mut CalypsoCard, data: &[u8]) -> Result<(), CardCommandError> {
    let list = find_tlv(data, TAG_EF_LIST).ok_or_else(|| {
        err!(CardCommandErrorKind::Parsing, "{}: missing EF list", NAME)
    })?;
    ensure!(
        list.len() % EF_LIST_ENTRY_LENGTH == 0,
        CardCommandErrorKind::Parsing,
        "{}: malformed EF list",
        NAME
    );
    for entry in list.chunks(EF_LIST_ENTRY_LENGTH) {
        let file_type = FileType::from_u8(entry[3]).ok_or_else(|| {
            err!(
                CardCommandErrorKind::Parsing,
                "{}: unknown EF type 0x{:02x}",
                NAME,
                entry[3]
            )
        })?;
        let header = FileHeader {
            lid: BigEndian::read_u16(&entry[0..2]),
            records_number: entry[5],
            record_size: entry[4],
            file_type,
            access_conditions: [0; 4],
            key_indexes: [0; 4],
            df_status: 0,
            shared_reference: None,
        };
        if entry[2] > 0 {
            card.set_file_header(entry[2], header);
        }
    }
    Ok(())
}
