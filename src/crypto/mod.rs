//! Contract between the transaction manager and the symmetric crypto
//! service, typically backed by a SAM.
//!
//! The manager never touches key material: it feeds the driver the wire
//! bytes of every in-session exchange (request, then response, in
//! transmission order) and asks it for challenges, MACs, ciphered PIN
//! blocks, key cryptograms and Stored Value security data.

#[cfg(feature = "mocksam")]
pub mod mocksam;

use error::Error;

/// Errors raised by a crypto driver
pub type CryptoError = Error<CryptoErrorKind>;

/// Crypto driver error kinds
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum CryptoErrorKind {
    /// Communication with the SAM or its reader failed
    #[fail(display = "crypto service I/O failure")]
    Io,

    /// A signature presented for verification does not match
    #[fail(display = "invalid signature")]
    InvalidSignature,

    /// The driver was used out of sequence (e.g. MAC update before init)
    #[fail(display = "illegal driver state")]
    IllegalState,

    /// The driver does not implement the requested operation
    #[fail(display = "unsupported operation")]
    Unsupported,
}

/// Input/output container for the certification of an SV Reload, SV Debit
/// or SV Undebit command
///
/// The manager fills the inputs (the retained SV Get exchange and the
/// partial SV command request); the driver fills the security block that
/// completes the command's data field: SAM serial (4), SAM transaction
/// number (3), MAC (5).
#[derive(Clone, Debug, Default)]
pub struct SvCommandSecurityData {
    sv_get_request: Vec<u8>,
    sv_get_response: Vec<u8>,
    sv_command_partial_request: Vec<u8>,
    serial_number: Vec<u8>,
    transaction_number: Vec<u8>,
    terminal_sv_mac: Vec<u8>,
}

impl SvCommandSecurityData {
    /// Assemble the inputs for the driver
    pub fn new(
        sv_get_request: &[u8],
        sv_get_response: &[u8],
        sv_command_partial_request: &[u8],
    ) -> Self {
        Self {
            sv_get_request: sv_get_request.to_vec(),
            sv_get_response: sv_get_response.to_vec(),
            sv_command_partial_request: sv_command_partial_request.to_vec(),
            serial_number: Vec::new(),
            transaction_number: Vec::new(),
            terminal_sv_mac: Vec::new(),
        }
    }

    /// The SV Get request the card answered
    pub fn sv_get_request(&self) -> &[u8] {
        &self.sv_get_request
    }

    /// The SV Get response data
    pub fn sv_get_response(&self) -> &[u8] {
        &self.sv_get_response
    }

    /// The SV command as built so far, without its security block
    pub fn sv_command_partial_request(&self) -> &[u8] {
        &self.sv_command_partial_request
    }

    /// Driver output: SAM serial number (4 bytes)
    pub fn set_serial_number(&mut self, serial_number: &[u8]) {
        self.serial_number = serial_number.to_vec();
    }

    /// Driver output: SAM transaction number (3 bytes)
    pub fn set_transaction_number(&mut self, transaction_number: &[u8]) {
        self.transaction_number = transaction_number.to_vec();
    }

    /// Driver output: terminal SV MAC (5 bytes)
    pub fn set_terminal_sv_mac(&mut self, mac: &[u8]) {
        self.terminal_sv_mac = mac.to_vec();
    }

    /// The 12-byte block appended to the SV command data field
    pub fn security_block(&self) -> Vec<u8> {
        let mut block =
            Vec::with_capacity(self.serial_number.len() + self.transaction_number.len() + self.terminal_sv_mac.len());
        block.extend_from_slice(&self.serial_number);
        block.extend_from_slice(&self.transaction_number);
        block.extend_from_slice(&self.terminal_sv_mac);
        block
    }
}

/// Symmetric crypto session driver
///
/// One instance serves one card transaction; implementations may queue
/// SAM-side commands internally and flush them in `process_commands`.
pub trait CryptoDriver {
    /// Start a secure-session context and return the 8-byte terminal
    /// challenge
    fn init_terminal_secure_session_context(&mut self) -> Result<[u8; 8], CryptoError>;

    /// Initialize the running session MAC from the Open Session response
    /// data and the selected session key
    fn init_terminal_session_mac(
        &mut self,
        open_response_data: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError>;

    /// Feed wire bytes into the running session MAC; called twice per
    /// in-session exchange, request first
    fn update_terminal_session_mac(&mut self, bytes: &[u8]) -> Result<(), CryptoError>;

    /// Produce the terminal session MAC (4 bytes, 8 in extended mode)
    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Verify the card's session MAC from the Close Session response
    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<(), CryptoError>;

    /// Verify the card's SV MAC delivered through the postponed data
    fn verify_card_sv_mac(&mut self, sv_mac: &[u8]) -> Result<(), CryptoError>;

    /// Cipher a PIN block for presentation
    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Cipher a PIN block for modification
    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: &[u8; 4],
        new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generate the cryptogram installing a new card key
    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer_kif: u8,
        issuer_kvc: u8,
        new_kif: u8,
        new_kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Fill the security block of an SV Reload/Debit/Undebit command
    fn generate_sv_command_security_data(
        &mut self,
        data: &mut SvCommandSecurityData,
    ) -> Result<(), CryptoError>;

    /// Set the key diversifier (the card's full serial number)
    fn set_default_key_diversifier(&mut self, serial_number: &[u8]) -> Result<(), CryptoError>;

    /// Retain a transaction audit record alongside the session context
    fn set_transaction_audit_data(&mut self, record: &str);

    /// Switch the driver to extended-mode (8-byte) session MACs
    fn enable_card_extended_mode(&mut self) -> Result<(), CryptoError>;

    /// Does the driver support extended-mode sessions?
    fn is_extended_mode_supported(&self) -> bool;

    /// Flush any queued driver-side commands
    fn process_commands(&mut self) -> Result<(), CryptoError>;

    /// Queue a generic signature computation piggybacked on the
    /// transaction
    fn prepare_compute_signature(&mut self, data: &[u8]) -> Result<(), CryptoError>;

    /// Queue a generic signature verification piggybacked on the
    /// transaction
    fn prepare_verify_signature(&mut self, data: &[u8]) -> Result<(), CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_block_assembly() {
        let mut data = SvCommandSecurityData::new(&[0x00], &[0x01], &[0x02]);
        data.set_serial_number(&[0xA0, 0xA1, 0xA2, 0xA3]);
        data.set_transaction_number(&[0x00, 0x00, 0x2A]);
        data.set_terminal_sv_mac(&[0x51, 0x52, 0x53, 0x54, 0x55]);
        assert_eq!(
            data.security_block(),
            vec![0xA0, 0xA1, 0xA2, 0xA3, 0x00, 0x00, 0x2A, 0x51, 0x52, 0x53, 0x54, 0x55]
        );
    }
}
