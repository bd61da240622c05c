//! SV Get: read the Stored Value balance, transaction number and the
//! requested operation log.
//!
//! The raw request and response are retained on the card image: the
//! crypto driver needs both to certify the SV operation that follows.

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::{CalypsoCard, SvDebitLogRecord, SvLoadLogRecord};
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};
use transaction::SvOperation;

const INS: u8 = 0x7C;
const NAME: &str = "SV Get";

const P2_RELOAD: u8 = 0x07;
const P2_DEBIT: u8 = 0x09;

const LOAD_LOG_LENGTH: usize = 22;
const DEBIT_LOG_LENGTH: usize = 19;

#[derive(Clone, Debug)]
pub(crate) struct SvGetCmd {
    request: ApduRequest,
    operation: SvOperation,
    extended: bool,
}

impl SvGetCmd {
    /// Read the SV data for `operation`; in extended mode the card
    /// returns both logs at once
    pub fn new(card: &CalypsoCard, operation: SvOperation, extended: bool) -> Self {
        let p2 = match operation {
            SvOperation::Reload => P2_RELOAD,
            SvOperation::Debit => P2_DEBIT,
        };
        let apdu = build_apdu(
            card.card_class(),
            INS,
            if extended { 0x01 } else { 0x00 },
            p2,
            None,
            Some(0),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            operation,
            extended,
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
        ensure!(
            data.len() >= 6,
            CardCommandErrorKind::Parsing,
            "{}: response too short ({} bytes)",
            NAME,
            data.len()
        );
        let kvc = data[0];
        let transaction_number = BigEndian::read_u16(&data[1..3]);
        let balance = BigEndian::read_i24(&data[3..6]);
        let logs = &data[6..];

        let (load_log, debit_log) = if self.extended {
            ensure!(
                logs.len() >= LOAD_LOG_LENGTH + DEBIT_LOG_LENGTH,
                CardCommandErrorKind::Parsing,
                "{}: truncated log records",
                NAME
            );
            (
                SvLoadLogRecord::from_bytes(&logs[..LOAD_LOG_LENGTH]),
                SvDebitLogRecord::from_bytes(&logs[LOAD_LOG_LENGTH..]),
            )
        } else {
            match self.operation {
                SvOperation::Reload => {
                    let record = SvLoadLogRecord::from_bytes(logs);
                    ensure!(
                        record.is_some(),
                        CardCommandErrorKind::Parsing,
                        "{}: truncated load log",
                        NAME
                    );
                    (record, None)
                }
                SvOperation::Debit => {
                    let record = SvDebitLogRecord::from_bytes(logs);
                    ensure!(
                        record.is_some(),
                        CardCommandErrorKind::Parsing,
                        "{}: truncated debit log",
                        NAME
                    );
                    (None, record)
                }
            }
        };

        card.set_sv_data(kvc, transaction_number, balance, load_log, debit_log);
        card.set_sv_get_exchange(self.request.apdu().to_vec(), data.to_vec());
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
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x0A, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn apdu_variants() {
        let cmd = SvGetCmd::new(&card(), SvOperation::Debit, false);
        assert_eq!(cmd.request().apdu(), &[0x00, 0x7C, 0x00, 0x09, 0x00]);
        let cmd = SvGetCmd::new(&card(), SvOperation::Reload, true);
        assert_eq!(cmd.request().apdu(), &[0x00, 0x7C, 0x01, 0x07, 0x00]);
    }

    #[test]
    fn debit_variant_updates_sv_state() {
        let mut card = card();
        let cmd = SvGetCmd::new(&card, SvOperation::Debit, false);
        let mut data = vec![0xAA, 0x00, 0x2A]; // kvc, tnum 42
        data.extend_from_slice(&[0x00, 0x01, 0xF4]); // balance 500
        data.extend_from_slice(&[0u8; DEBIT_LOG_LENGTH]);
        data.extend_from_slice(&[0x90, 0x00]);
        cmd.parse(&mut card, &ApduResponse::new(data)).unwrap();
        assert_eq!(card.sv_balance(), Some(500));
        assert_eq!(card.sv_last_transaction_number(), Some(42));
        assert_eq!(card.sv_kvc(), Some(0xAA));
        assert_eq!(card.sv_debit_log_records().len(), 1);
        assert!(card.sv_load_log_record().is_none());
        assert!(card.sv_get_header().is_some());
        assert!(card.sv_get_data().is_some());
    }

    #[test]
    fn extended_variant_returns_both_logs() {
        let mut card = card();
        let cmd = SvGetCmd::new(&card, SvOperation::Reload, true);
        let mut data = vec![0xAA, 0x00, 0x01, 0x00, 0x00, 0x64];
        data.extend_from_slice(&[0u8; LOAD_LOG_LENGTH + DEBIT_LOG_LENGTH]);
        data.extend_from_slice(&[0x90, 0x00]);
        cmd.parse(&mut card, &ApduResponse::new(data)).unwrap();
        assert!(card.sv_load_log_record().is_some());
        assert_eq!(card.sv_debit_log_records().len(), 1);
    }
}
