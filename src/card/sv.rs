//! Stored Value log records returned by SV Get.

use byteorder::{BigEndian, ByteOrder};

/// Wire length of a load log record
pub(crate) const LOAD_LOG_LENGTH: usize = 22;

/// Wire length of a debit log record
pub(crate) const DEBIT_LOG_LENGTH: usize = 19;

/// Last reload operation recorded by the card
///
/// Wire layout: date (2), free1 (1), KVC (1), free2 (1), balance (3),
/// amount (3), time (2), SAM id (4), SAM T-num (3), SV T-num (2).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SvLoadLogRecord {
    /// Reloaded amount (signed)
    pub amount: i32,

    /// Balance after the reload (signed)
    pub balance: i32,

    /// Application-defined date
    pub load_date: u16,

    /// Application-defined time
    pub load_time: u16,

    /// Two free bytes
    pub free_bytes: [u8; 2],

    /// KVC of the load key
    pub kvc: u8,

    /// Serial number of the SAM which certified the reload
    pub sam_id: [u8; 4],

    /// SV transaction number
    pub sv_transaction_number: u16,

    /// SAM transaction number (24-bit)
    pub sam_transaction_number: u32,
}

impl SvLoadLogRecord {
    /// Parse a load log record; `None` if the slice is too short
    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LOAD_LOG_LENGTH {
            return None;
        }
        let mut sam_id = [0u8; 4];
        sam_id.copy_from_slice(&bytes[13..17]);
        Some(Self {
            load_date: BigEndian::read_u16(&bytes[0..2]),
            free_bytes: [bytes[2], bytes[4]],
            kvc: bytes[3],
            balance: BigEndian::read_i24(&bytes[5..8]),
            amount: BigEndian::read_i24(&bytes[8..11]),
            load_time: BigEndian::read_u16(&bytes[11..13]),
            sam_id,
            sam_transaction_number: BigEndian::read_u24(&bytes[17..20]),
            sv_transaction_number: BigEndian::read_u16(&bytes[20..22]),
        })
    }
}

/// Last debit operation recorded by the card
///
/// Wire layout: amount (2), date (2), time (2), KVC (1), SAM id (4),
/// SAM T-num (3), balance (3), SV T-num (2).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SvDebitLogRecord {
    /// Debited amount (signed, as stored by the card)
    pub amount: i32,

    /// Balance after the debit (signed)
    pub balance: i32,

    /// Application-defined date
    pub debit_date: u16,

    /// Application-defined time
    pub debit_time: u16,

    /// KVC of the debit key
    pub kvc: u8,

    /// Serial number of the SAM which certified the debit
    pub sam_id: [u8; 4],

    /// SV transaction number
    pub sv_transaction_number: u16,

    /// SAM transaction number (24-bit)
    pub sam_transaction_number: u32,
}

impl SvDebitLogRecord {
    /// Parse a debit log record; `None` if the slice is too short
    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEBIT_LOG_LENGTH {
            return None;
        }
        let mut sam_id = [0u8; 4];
        sam_id.copy_from_slice(&bytes[7..11]);
        Some(Self {
            amount: i32::from(BigEndian::read_i16(&bytes[0..2])),
            debit_date: BigEndian::read_u16(&bytes[2..4]),
            debit_time: BigEndian::read_u16(&bytes[4..6]),
            kvc: bytes[6],
            sam_id,
            sam_transaction_number: BigEndian::read_u24(&bytes[11..14]),
            balance: BigEndian::read_i24(&bytes[14..17]),
            sv_transaction_number: BigEndian::read_u16(&bytes[17..19]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_log_parses() {
        let mut bytes = vec![0u8; LOAD_LOG_LENGTH];
        bytes[0..2].copy_from_slice(&[0x12, 0x34]); // date
        bytes[3] = 0xAA; // kvc
        bytes[5..8].copy_from_slice(&[0x00, 0x01, 0x00]); // balance 256
        bytes[8..11].copy_from_slice(&[0xFF, 0xFF, 0xFE]); // amount -2
        bytes[20..22].copy_from_slice(&[0x00, 0x2A]); // sv tnum
        let record = SvLoadLogRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.load_date, 0x1234);
        assert_eq!(record.kvc, 0xAA);
        assert_eq!(record.balance, 256);
        assert_eq!(record.amount, -2);
        assert_eq!(record.sv_transaction_number, 42);
        assert!(SvLoadLogRecord::from_bytes(&bytes[..10]).is_none());
    }

    #[test]
    fn debit_log_parses() {
        let mut bytes = vec![0u8; DEBIT_LOG_LENGTH];
        bytes[0..2].copy_from_slice(&[0xFF, 0xFE]); // amount -2
        bytes[14..17].copy_from_slice(&[0x00, 0x00, 0x64]); // balance 100
        let record = SvDebitLogRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.amount, -2);
        assert_eq!(record.balance, 100);
    }
}
