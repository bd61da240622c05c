//! Change PIN: P2 selects plain (`FF`, 4-byte new PIN) or encrypted
//! (`04`, ciphered block) transmission.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::verify_pin::DEFAULT_PIN_ATTEMPTS;
use command::{build_apdu, expect_success, CardCommandError};

const INS: u8 = 0xD8;
const NAME: &str = "Change PIN";

const P2_PLAIN: u8 = 0xFF;
const P2_ENCRYPTED: u8 = 0x04;

#[derive(Clone, Debug)]
pub(crate) struct ChangePinCmd {
    request: ApduRequest,
}

impl ChangePinCmd {
    /// Plain transmission of the new PIN
    pub fn plain(card: &CalypsoCard, new_pin: &[u8; 4]) -> Self {
        let apdu = build_apdu(card.card_class(), INS, 0x00, P2_PLAIN, Some(new_pin), None);
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
        }
    }

    /// Encrypted transmission of the PIN block ciphered by the SAM
    pub fn encrypted(card: &CalypsoCard, cipher_block: &[u8]) -> Self {
        let apdu = build_apdu(
            card.card_class(),
            INS,
            0x00,
            P2_ENCRYPTED,
            Some(cipher_block),
            None,
        );
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
        expect_success(NAME, response)?;
        card.set_pin_attempts(Some(DEFAULT_PIN_ATTEMPTS));
        Ok(())
    }
}
