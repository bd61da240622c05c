//! Verify PIN, in plain (4-byte PIN) or encrypted (8-byte cipher block)
//! transmission.
//!
//! The remaining-attempts counter of the card image tracks the outcome:
//! reset on success, set to `x` on `63Cx`, zeroed (blocked) on `6983`.

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};

const INS: u8 = 0x20;
const NAME: &str = "Verify PIN";

/// Attempts granted by the card after a successful presentation
pub(crate) const DEFAULT_PIN_ATTEMPTS: u8 = 3;

#[derive(Clone, Debug)]
pub(crate) struct VerifyPinCmd {
    request: ApduRequest,
}

impl VerifyPinCmd {
    /// Plain transmission of the 4-digit PIN
    pub fn plain(card: &CalypsoCard, pin: &[u8; 4]) -> Self {
        let apdu = build_apdu(card.card_class(), INS, 0x00, 0x00, Some(pin), None);
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
        }
    }

    /// Encrypted transmission of the PIN block ciphered by the SAM
    pub fn encrypted(card: &CalypsoCard, cipher_block: &[u8]) -> Self {
        let apdu = build_apdu(card.card_class(), INS, 0x00, 0x00, Some(cipher_block), None);
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
        match response.status_word() {
            SW_OK => {
                card.set_pin_attempts(Some(DEFAULT_PIN_ATTEMPTS));
                Ok(())
            }
            sw if sw & 0xFFF0 == 0x63C0 => {
                let remaining = (sw & 0x000F) as u8;
                card.set_pin_attempts(Some(remaining));
                fail!(
                    CardCommandErrorKind::Security,
                    "{}: wrong PIN, {} attempt(s) remaining",
                    NAME,
                    remaining
                )
            }
            0x6983 => {
                card.set_pin_attempts(Some(0));
                fail!(CardCommandErrorKind::Security, "{}: PIN blocked", NAME)
            }
            sw => Err(common_status(NAME, sw)),
        }
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
            StartupInfo::from_bytes(&[0x06, 0x25, 0x09, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn plain_and_encrypted_lengths() {
        let plain = VerifyPinCmd::plain(&card(), &[1, 2, 3, 4]);
        assert_eq!(plain.request().apdu(), &[0x00, 0x20, 0x00, 0x00, 0x04, 1, 2, 3, 4]);
        let encrypted = VerifyPinCmd::encrypted(&card(), &[0xEE; 8]);
        assert_eq!(encrypted.request().apdu()[4], 0x08);
    }

    #[test]
    fn success_resets_attempts() {
        let mut card = card();
        card.set_pin_attempts(Some(1));
        let cmd = VerifyPinCmd::plain(&card, &[1, 2, 3, 4]);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x90, 0x00])).unwrap();
        assert_eq!(card.pin_attempt_remaining(), Some(DEFAULT_PIN_ATTEMPTS));
    }

    #[test]
    fn wrong_pin_records_remaining_attempts() {
        let mut card = card();
        let cmd = VerifyPinCmd::plain(&card, &[1, 2, 3, 4]);
        let err = cmd
            .parse(&mut card, &ApduResponse::new(vec![0x63, 0xC2]))
            .unwrap_err();
        assert_eq!(err.kind(), CardCommandErrorKind::Security);
        assert_eq!(card.pin_attempt_remaining(), Some(2));
        assert!(!card.is_pin_blocked());
    }

    #[test]
    fn blocked_pin() {
        let mut card = card();
        let cmd = VerifyPinCmd::plain(&card, &[1, 2, 3, 4]);
        assert!(cmd.parse(&mut card, &ApduResponse::new(vec![0x69, 0x83])).is_err());
        assert!(card.is_pin_blocked());
    }
}
