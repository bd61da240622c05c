//! Change Key: replace one of the three session keys with a cryptogram
//! generated by the SAM from the card challenge.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::{build_apdu, expect_success, CardCommandError};

const INS: u8 = 0xD8;
const NAME: &str = "Change Key";

#[derive(Clone, Debug)]
pub(crate) struct ChangeKeyCmd {
    request: ApduRequest,
}

impl ChangeKeyCmd {
    /// `key_index` is 1 to 3; `cryptogram` is the 24-byte ciphered key
    pub fn new(card: &CalypsoCard, key_index: u8, cryptogram: &[u8]) -> Self {
        let apdu = build_apdu(card.card_class(), INS, 0x00, key_index, Some(cryptogram), None);
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&self, response: &ApduResponse) -> Result<(), CardCommandError> {
        expect_success(NAME, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};

    #[test]
    fn key_index_in_p2() {
        let card = CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        );
        let cmd = ChangeKeyCmd::new(&card, 3, &[0xEE; 24]);
        let apdu = cmd.request().apdu();
        assert_eq!(&apdu[..5], &[0x00, 0xD8, 0x00, 0x03, 0x18]);
        assert_eq!(apdu.len(), 5 + 24);
    }
}
