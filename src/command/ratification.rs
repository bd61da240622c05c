//! Explicit ratification.
//!
//! A deliberately out-of-range Read Records whose only purpose is to make
//! the card commit the session just closed; `6B00` and `6700` are the
//! expected outcomes and count as success.

use apdu::ApduRequest;
use command::build_apdu;

const INS: u8 = 0xB2;

/// Build the ratification probe for the given card class
pub(crate) fn request(card_class: u8) -> ApduRequest {
    let apdu = build_apdu(card_class, INS, 0x00, 0x00, None, Some(0));
    ApduRequest::new(apdu)
        .with_info("Ratification")
        .with_successful_status_word(0x6B00)
        .with_successful_status_word(0x6700)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_accepts_error_statuses() {
        let request = request(0x00);
        assert_eq!(request.apdu(), &[0x00, 0xB2, 0x00, 0x00, 0x00]);
        assert!(request.is_status_successful(0x6B00));
        assert!(request.is_status_successful(0x6700));
        assert!(request.is_status_successful(0x9000));
        assert!(!request.is_status_successful(0x6985));
    }
}
