//! Shared fixtures: a scripted reader replaying canned exchanges and a
//! scripted crypto driver recording every call.
//!
//! Each integration test crate includes this module; not every fixture
//! is used by every crate.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use calypso::{
    ApduResponse, CalypsoCard, CardReader, CardRequest, CardResponse, ChannelControl,
    CryptoDriver, CryptoError, CryptoErrorKind, Error, ProductType, ReaderError, ReaderErrorKind,
    StartupInfo, SvCommandSecurityData,
};

/// Challenge returned by the scripted crypto driver
pub const TERMINAL_CHALLENGE: [u8; 8] = [0x55; 8];

/// Terminal session MAC returned by the scripted crypto driver
pub const TERMINAL_MAC: [u8; 4] = [0xA1, 0xA2, 0xA3, 0xA4];

/// Card session MAC the scripted crypto driver accepts
pub const CARD_MAC: [u8; 4] = [0xB1, 0xB2, 0xB3, 0xB4];

/// Ciphered PIN block returned by the scripted crypto driver
pub const PIN_BLOCK: [u8; 8] = [0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8];

/// Key cryptogram returned by the scripted crypto driver
pub const KEY_CRYPTOGRAM: [u8; 24] = [0xE0; 24];

/// SV security block filled in by the scripted crypto driver:
/// SAM serial (4), SAM transaction number (3), MAC (5)
pub const SV_SECURITY_BLOCK: [u8; 12] = [
    0xA0, 0xA1, 0xA2, 0xA3, 0x00, 0x00, 0x01, 0x5A, 0x5A, 0x5A, 0x5A, 0x5A,
];

/// Card serial used by the fixtures
pub const CARD_SERIAL: [u8; 8] = [0x11; 8];

/// A revision 3 card; `application_type` carries the feature bits
/// (0x01 PIN, 0x02 SV, 0x04 postponed counters, 0x08 extended mode)
pub fn rev3_card(application_type: u8) -> CalypsoCard {
    CalypsoCard::new(
        ProductType::PrimeRevision3,
        vec![0xA0, 0x00, 0x00, 0x04, 0x04, 0x01, 0x25],
        CARD_SERIAL.to_vec(),
        StartupInfo::from_bytes(&[0x06, 0x25, application_type, 0x02, 0x00, 0x03, 0x01]).unwrap(),
    )
}

/// A reader replaying a scripted list of `(expected APDU, response)`
/// pairs, failing the test on any deviation
pub struct MockReader {
    expectations: VecDeque<(Vec<u8>, Vec<u8>)>,
    contactless: bool,
}

impl MockReader {
    pub fn new() -> Self {
        Self {
            expectations: VecDeque::new(),
            contactless: false,
        }
    }

    pub fn contactless() -> Self {
        Self {
            expectations: VecDeque::new(),
            contactless: true,
        }
    }

    /// Script the next exchange
    pub fn expect(mut self, request: &[u8], response: &[u8]) -> Self {
        self.expectations.push_back((request.to_vec(), response.to_vec()));
        self
    }

    /// Number of exchanges not yet replayed
    pub fn remaining(&self) -> usize {
        self.expectations.len()
    }
}

impl CardReader for MockReader {
    fn transmit_card_request(
        &mut self,
        request: &CardRequest,
        _channel_control: ChannelControl,
    ) -> Result<CardResponse, ReaderError> {
        let mut responses = Vec::new();
        for apdu_request in &request.apdu_requests {
            let (expected, scripted) = self
                .expectations
                .pop_front()
                .unwrap_or_else(|| panic!("unscripted APDU: {:02X?}", apdu_request.apdu()));
            assert_eq!(
                apdu_request.apdu(),
                &expected[..],
                "unexpected APDU (scripted {:02X?})",
                expected
            );
            let response = ApduResponse::new(scripted);
            let sw = response.status_word();
            let successful = apdu_request.is_status_successful(sw);
            responses.push(response);
            if request.stop_on_unsuccessful && !successful {
                return Err(ReaderError::new(
                    ReaderErrorKind::UnexpectedStatusWord,
                    Some(format!("status word 0x{:04X}", sw)),
                ).with_response(CardResponse::new(responses, true)));
            }
        }
        Ok(CardResponse::new(responses, true))
    }

    fn is_contactless(&self) -> bool {
        self.contactless
    }
}

/// Everything the scripted crypto driver observed
#[derive(Default)]
pub struct CryptoLog {
    pub diversifier: Option<Vec<u8>>,
    pub mac_init: Option<(Vec<u8>, u8, u8)>,
    pub mac_updates: Vec<Vec<u8>>,
    pub finalize_count: usize,
    pub verified_session_macs: Vec<Vec<u8>>,
    pub verified_sv_macs: Vec<Vec<u8>>,
    pub pin_cipher_calls: Vec<(Vec<u8>, u8, u8)>,
    pub audit_records: Vec<String>,
}

/// A crypto driver answering with canned values and recording its inputs
pub struct ScriptedCrypto {
    log: Rc<RefCell<CryptoLog>>,
}

impl ScriptedCrypto {
    /// Returns the driver and a shared handle on its log
    pub fn new() -> (Self, Rc<RefCell<CryptoLog>>) {
        let log = Rc::new(RefCell::new(CryptoLog::default()));
        (Self { log: Rc::clone(&log) }, log)
    }
}

impl CryptoDriver for ScriptedCrypto {
    fn init_terminal_secure_session_context(&mut self) -> Result<[u8; 8], CryptoError> {
        Ok(TERMINAL_CHALLENGE)
    }

    fn init_terminal_session_mac(
        &mut self,
        open_response_data: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError> {
        let mut log = self.log.borrow_mut();
        log.mac_init = Some((open_response_data.to_vec(), kif, kvc));
        log.mac_updates.clear();
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, bytes: &[u8]) -> Result<(), CryptoError> {
        self.log.borrow_mut().mac_updates.push(bytes.to_vec());
        Ok(())
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.log.borrow_mut().finalize_count += 1;
        Ok(TERMINAL_MAC.to_vec())
    }

    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<(), CryptoError> {
        self.log
            .borrow_mut()
            .verified_session_macs
            .push(card_mac.to_vec());
        if card_mac == CARD_MAC {
            Ok(())
        } else {
            Err(Error::new(
                CryptoErrorKind::InvalidSignature,
                Some("card session MAC mismatch".to_string()),
            ))
        }
    }

    fn verify_card_sv_mac(&mut self, sv_mac: &[u8]) -> Result<(), CryptoError> {
        self.log.borrow_mut().verified_sv_macs.push(sv_mac.to_vec());
        Ok(())
    }

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        _pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        self.log
            .borrow_mut()
            .pin_cipher_calls
            .push((card_challenge.to_vec(), kif, kvc));
        Ok(PIN_BLOCK.to_vec())
    }

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        _current_pin: &[u8; 4],
        _new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        self.log
            .borrow_mut()
            .pin_cipher_calls
            .push((card_challenge.to_vec(), kif, kvc));
        Ok(PIN_BLOCK.to_vec())
    }

    fn generate_ciphered_card_key(
        &mut self,
        _card_challenge: &[u8],
        _issuer_kif: u8,
        _issuer_kvc: u8,
        _new_kif: u8,
        _new_kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(KEY_CRYPTOGRAM.to_vec())
    }

    fn generate_sv_command_security_data(
        &mut self,
        data: &mut SvCommandSecurityData,
    ) -> Result<(), CryptoError> {
        data.set_serial_number(&SV_SECURITY_BLOCK[0..4]);
        data.set_transaction_number(&SV_SECURITY_BLOCK[4..7]);
        data.set_terminal_sv_mac(&SV_SECURITY_BLOCK[7..12]);
        Ok(())
    }

    fn set_default_key_diversifier(&mut self, serial_number: &[u8]) -> Result<(), CryptoError> {
        self.log.borrow_mut().diversifier = Some(serial_number.to_vec());
        Ok(())
    }

    fn set_transaction_audit_data(&mut self, record: &str) {
        self.log.borrow_mut().audit_records.push(record.to_string());
    }

    fn enable_card_extended_mode(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn is_extended_mode_supported(&self) -> bool {
        false
    }

    fn process_commands(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn prepare_compute_signature(&mut self, _data: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn prepare_verify_signature(&mut self, _data: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// The Open Secure Session APDU for a DEBIT session with a folded read
pub fn open_session_request(sfi: u8, record_number: u8) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x8A, 0x18 | sfi, record_number << 3, 0x08];
    apdu.extend_from_slice(&TERMINAL_CHALLENGE);
    apdu
}

/// An Open Secure Session response: 4-byte challenge, flags, KIF 0x30,
/// KVC 0x79, then `record_data`
pub fn open_session_response(previous_ratified: bool, record_data: &[u8]) -> Vec<u8> {
    let mut response = vec![0x01, 0x02, 0x03, 0x04];
    response.push(if previous_ratified { 0x01 } else { 0x00 });
    response.push(0x30);
    response.push(0x79);
    response.extend_from_slice(record_data);
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

/// A Close Secure Session request carrying the canned terminal MAC
pub fn close_session_request(ratify: bool) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x8E, if ratify { 0x80 } else { 0x00 }, 0x00, 0x04];
    apdu.extend_from_slice(&TERMINAL_MAC);
    apdu
}

/// A Close Secure Session response: postponed items then the card MAC
pub fn close_session_response(postponed_items: &[&[u8]]) -> Vec<u8> {
    let mut response = Vec::new();
    for item in postponed_items {
        response.push(item.len() as u8);
        response.extend_from_slice(item);
    }
    response.extend_from_slice(&CARD_MAC);
    response.extend_from_slice(&[0x90, 0x00]);
    response
}
