//! SV Reload: credit the Stored Value purse.
//!
//! The command is built in two steps: the functional part (amount, date,
//! time, free bytes) at prepare time, then the 12-byte security block
//! (SAM serial, SAM transaction number, MAC) obtained from the crypto
//! driver right before transmission.

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError, SW_POSTPONED};

const INS: u8 = 0xB8;
const NAME: &str = "SV Reload";

#[derive(Clone, Debug)]
pub(crate) struct SvReloadCmd {
    request: ApduRequest,
    card_class: u8,
    amount: i32,
    base_data: Vec<u8>,
}

impl SvReloadCmd {
    /// `amount` is a signed 24-bit value; `date`, `time` and `free` are
    /// application-defined
    pub fn new(card: &CalypsoCard, amount: i32, date: [u8; 2], time: [u8; 2], free: [u8; 2]) -> Self {
        let mut base_data = Vec::with_capacity(9);
        let mut amount_bytes = [0u8; 3];
        BigEndian::write_i24(&mut amount_bytes, amount);
        base_data.extend_from_slice(&amount_bytes);
        base_data.extend_from_slice(&date);
        base_data.extend_from_slice(&time);
        base_data.extend_from_slice(&free);

        let apdu = build_apdu(card.card_class(), INS, 0, 0, Some(&base_data), None);
        Self {
            request: ApduRequest::new(apdu)
                .with_info(NAME)
                .with_successful_status_word(SW_POSTPONED),
            card_class: card.card_class(),
            amount,
            base_data,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// Reloaded amount, applied to the image once the operation is
    /// certified
    pub fn amount(&self) -> i32 {
        self.amount
    }

    /// The APDU as built so far, handed to the crypto driver for MAC
    /// computation
    pub fn partial_request(&self) -> &[u8] {
        self.request.apdu()
    }

    /// Append the security block produced by the crypto driver
    pub fn finalize(&mut self, security_data: &[u8]) {
        let mut data = self.base_data.clone();
        data.extend_from_slice(security_data);
        let apdu = build_apdu(self.card_class, INS, 0, 0, Some(&data), None);
        self.request = ApduRequest::new(apdu)
            .with_info(NAME)
            .with_successful_status_word(SW_POSTPONED);
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        match response.status_word() {
            // immediate certification, out of session
            SW_OK => {
                card.update_sv_balance(self.amount);
                Ok(())
            }
            // in session: the SV MAC arrives with the Close Session
            SW_POSTPONED => Ok(()),
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
            StartupInfo::from_bytes(&[0x06, 0x25, 0x0A, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn two_step_build() {
        let mut cmd = SvReloadCmd::new(&card(), 2, [0x01, 0x02], [0x03, 0x04], [0x00, 0x00]);
        assert_eq!(
            cmd.partial_request(),
            &[0x00, 0xB8, 0x00, 0x00, 0x09, 0x00, 0x00, 0x02, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00]
        );
        cmd.finalize(&[0xEE; 12]);
        assert_eq!(cmd.request().apdu().len(), 5 + 9 + 12);
        assert_eq!(cmd.request().apdu()[4], 21);
        assert!(cmd.request().is_status_successful(SW_POSTPONED));
    }

    #[test]
    fn immediate_success_updates_balance() {
        let mut card = card();
        card.set_sv_data(0xAA, 1, 100, None, None);
        let cmd = SvReloadCmd::new(&card, 50, [0; 2], [0; 2], [0; 2]);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x01, 0x02, 0x03, 0x90, 0x00]))
            .unwrap();
        assert_eq!(card.sv_balance(), Some(150));
    }

    #[test]
    fn postponed_status_leaves_balance() {
        let mut card = card();
        card.set_sv_data(0xAA, 1, 100, None, None);
        let cmd = SvReloadCmd::new(&card, 50, [0; 2], [0; 2], [0; 2]);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x62, 0x00])).unwrap();
        assert_eq!(card.sv_balance(), Some(100));
    }
}
