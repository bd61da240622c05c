//! Open Secure Session.
//!
//! The request carries the 8-byte terminal challenge obtained from the
//! crypto driver; P1/P2 encode the access level, and optionally the SFI
//! and record number of a one-record read folded into the opening.
//!
//! Response layout on revision 3: card challenge (4 bytes, 8 in extended
//! mode), one flag byte (bit 0 = previous session ratified), KIF (`FF`
//! when undefined), KVC, then the folded record bytes. Legacy revisions
//! return the 4-byte challenge and the flag byte, followed on revision 2
//! by the KVC; the KIF is never present there.

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::{CalypsoCard, ProductType};
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};
use transaction::AccessLevel;

const INS: u8 = 0x8A;
const NAME: &str = "Open Secure Session";

/// KIF value meaning "undefined" in the response
const KIF_UNDEFINED: u8 = 0xFF;

/// Fields extracted from the Open Session response
#[derive(Clone, Debug)]
pub(crate) struct OpenSessionOutput {
    /// Card challenge, input of the session MAC
    pub card_challenge: Vec<u8>,

    /// Has the previous session been ratified?
    pub previous_session_ratified: bool,

    /// KIF of the selected session key (`None` when absent or `FF`)
    pub kif: Option<u8>,

    /// KVC of the selected session key (`None` on revision 1)
    pub kvc: Option<u8>,

    /// Content of the folded one-record read, possibly empty
    pub record_data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) struct OpenSessionCmd {
    request: ApduRequest,
    product_type: ProductType,
    extended: bool,
}

impl OpenSessionCmd {
    /// `sfi`/`record_number` are 0 when no read is folded in
    pub fn new(
        card: &CalypsoCard,
        level: AccessLevel,
        terminal_challenge: &[u8],
        sfi: u8,
        record_number: u8,
        extended: bool,
    ) -> Self {
        let p1 = (level as u8 + 1) << 3 | sfi;
        let p2 = record_number << 3 | if extended { 0x02 } else { 0x00 };
        let apdu = build_apdu(card.card_class(), INS, p1, p2, Some(terminal_challenge), None);
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            product_type: card.product_type(),
            extended,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&self, response: &ApduResponse) -> Result<OpenSessionOutput, CardCommandError> {
        let sw = response.status_word();
        if sw != SW_OK {
            return Err(common_status(NAME, sw));
        }
        let data = response.data_out();
        let challenge_length = if self.extended { 8 } else { 4 };
        let key_bytes = match self.product_type {
            ProductType::PrimeRevision1 => 0,
            ProductType::PrimeRevision2 => 1,
            _ => 2,
        };
        ensure!(
            data.len() >= challenge_length + 1 + key_bytes,
            CardCommandErrorKind::Parsing,
            "{}: response too short ({} bytes)",
            NAME,
            data.len()
        );
        let card_challenge = data[..challenge_length].to_vec();
        let previous_session_ratified = data[challenge_length] & 0x01 != 0;
        let mut index = challenge_length + 1;
        let (kif, kvc) = match self.product_type {
            ProductType::PrimeRevision1 => (None, None),
            ProductType::PrimeRevision2 => {
                let kvc = data[index];
                index += 1;
                (None, Some(kvc))
            }
            _ => {
                let kif = data[index];
                let kvc = data[index + 1];
                index += 2;
                (
                    if kif == KIF_UNDEFINED { None } else { Some(kif) },
                    Some(kvc),
                )
            }
        };
        Ok(OpenSessionOutput {
            card_challenge,
            previous_session_ratified,
            kif,
            kvc,
            record_data: data[index..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};

    fn card(product_type: ProductType) -> CalypsoCard {
        CalypsoCard::new(
            product_type,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn p1_p2_encoding() {
        let cmd = OpenSessionCmd::new(
            &card(ProductType::PrimeRevision3),
            AccessLevel::Debit,
            &[0x55; 8],
            0x07,
            1,
            false,
        );
        let apdu = cmd.request().apdu();
        assert_eq!(apdu[2], 0x1F); // (2 + 1) << 3 | 7
        assert_eq!(apdu[3], 0x08); // record 1 << 3
        assert_eq!(apdu[4], 0x08); // challenge length
    }

    #[test]
    fn rev3_response() {
        let cmd = OpenSessionCmd::new(
            &card(ProductType::PrimeRevision3),
            AccessLevel::Debit,
            &[0x55; 8],
            0,
            0,
            false,
        );
        let output = cmd
            .parse(&ApduResponse::new(vec![
                0x01, 0x02, 0x03, 0x04, // challenge
                0x01, // ratified
                0x30, 0x79, // kif, kvc
                0xAA, 0xBB, // record data
                0x90, 0x00,
            ]))
            .unwrap();
        assert_eq!(output.card_challenge, vec![0x01, 0x02, 0x03, 0x04]);
        assert!(output.previous_session_ratified);
        assert_eq!(output.kif, Some(0x30));
        assert_eq!(output.kvc, Some(0x79));
        assert_eq!(output.record_data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn undefined_kif_maps_to_none() {
        let cmd = OpenSessionCmd::new(
            &card(ProductType::PrimeRevision3),
            AccessLevel::Load,
            &[0x55; 8],
            0,
            0,
            false,
        );
        let output = cmd
            .parse(&ApduResponse::new(vec![
                0x01, 0x02, 0x03, 0x04, 0x00, 0xFF, 0x79, 0x90, 0x00,
            ]))
            .unwrap();
        assert!(!output.previous_session_ratified);
        assert_eq!(output.kif, None);
        assert_eq!(output.kvc, Some(0x79));
    }

    #[test]
    fn legacy_revision_two_returns_kvc_only() {
        let cmd = OpenSessionCmd::new(
            &card(ProductType::PrimeRevision2),
            AccessLevel::Debit,
            &[0x55; 8],
            0,
            0,
            false,
        );
        let output = cmd
            .parse(&ApduResponse::new(vec![
                0x01, 0x02, 0x03, 0x04, 0x01, 0x79, 0x90, 0x00,
            ]))
            .unwrap();
        assert_eq!(output.kif, None);
        assert_eq!(output.kvc, Some(0x79));
        assert!(output.record_data.is_empty());
    }
}
