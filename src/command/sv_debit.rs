//! SV Debit and SV Undebit: charge the Stored Value purse, or revert a
//! previous debit.
//!
//! The amount travels as a signed 16-bit value: negative for a debit,
//! positive for an undebit. Like SV Reload the command is finalized with
//! the security block right before transmission.

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError, SW_POSTPONED};

const INS: u8 = 0xBA;

/// Charge or revert
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SvDebitMode {
    Debit,
    Undebit,
}

#[derive(Clone, Debug)]
pub(crate) struct SvDebitCmd {
    request: ApduRequest,
    card_class: u8,
    mode: SvDebitMode,
    amount: i32,
    base_data: Vec<u8>,
}

impl SvDebitCmd {
    /// `amount` is the positive amount to charge (or restore)
    pub fn new(card: &CalypsoCard, mode: SvDebitMode, amount: i32, date: [u8; 2], time: [u8; 2]) -> Self {
        let wire_amount = match mode {
            SvDebitMode::Debit => -amount,
            SvDebitMode::Undebit => amount,
        };
        let mut base_data = Vec::with_capacity(6);
        let mut amount_bytes = [0u8; 2];
        BigEndian::write_i16(&mut amount_bytes, wire_amount as i16);
        base_data.extend_from_slice(&amount_bytes);
        base_data.extend_from_slice(&date);
        base_data.extend_from_slice(&time);

        let apdu = build_apdu(card.card_class(), INS, 0, 0, Some(&base_data), None);
        Self {
            request: ApduRequest::new(apdu)
                .with_info(match mode {
                    SvDebitMode::Debit => "SV Debit",
                    SvDebitMode::Undebit => "SV Undebit",
                })
                .with_successful_status_word(SW_POSTPONED),
            card_class: card.card_class(),
            mode,
            amount,
            base_data,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn name(&self) -> &'static str {
        self.request.info()
    }

    /// Balance change once the operation is certified
    pub fn balance_delta(&self) -> i32 {
        match self.mode {
            SvDebitMode::Debit => -self.amount,
            SvDebitMode::Undebit => self.amount,
        }
    }

    /// The APDU as built so far, handed to the crypto driver for MAC
    /// computation
    pub fn partial_request(&self) -> &[u8] {
        self.request.apdu()
    }

    /// Append the security block produced by the crypto driver
    pub fn finalize(&mut self, security_data: &[u8]) {
        let info = self.name();
        let mut data = self.base_data.clone();
        data.extend_from_slice(security_data);
        let apdu = build_apdu(self.card_class, INS, 0, 0, Some(&data), None);
        self.request = ApduRequest::new(apdu)
            .with_info(info)
            .with_successful_status_word(SW_POSTPONED);
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        match response.status_word() {
            SW_OK => {
                card.update_sv_balance(self.balance_delta());
                Ok(())
            }
            SW_POSTPONED => Ok(()),
            sw => Err(common_status(self.name(), sw)),
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
    fn debit_amount_is_negative_on_the_wire() {
        let cmd = SvDebitCmd::new(&card(), SvDebitMode::Debit, 2, [0, 0], [0, 0]);
        assert_eq!(
            cmd.partial_request(),
            &[0x00, 0xBA, 0x00, 0x00, 0x06, 0xFF, 0xFE, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(cmd.balance_delta(), -2);
    }

    #[test]
    fn undebit_amount_is_positive() {
        let cmd = SvDebitCmd::new(&card(), SvDebitMode::Undebit, 2, [0, 0], [0, 0]);
        assert_eq!(cmd.partial_request()[5..7], [0x00, 0x02]);
        assert_eq!(cmd.balance_delta(), 2);
    }

    #[test]
    fn immediate_debit_updates_balance() {
        let mut card = card();
        card.set_sv_data(0xAA, 1, 100, None, None);
        let cmd = SvDebitCmd::new(&card, SvDebitMode::Debit, 2, [0, 0], [0, 0]);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x01, 0x02, 0x03, 0x90, 0x00]))
            .unwrap();
        assert_eq!(card.sv_balance(), Some(98));
        assert_eq!(card.sv_last_transaction_number(), Some(2));
    }
}
