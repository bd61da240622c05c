//! Software SAM: a simulation of the symmetric crypto service for
//! integration testing without hardware.
//!
//! The simulation keeps the call contract and the data flow of a real
//! SAM but uses a simplified scheme: session keys are derived with
//! AES-128-CMAC from a master key, the KIF/KVC pair and the card serial
//! diversifier; the running session MAC is AES-128-CMAC over the
//! accumulated wire stream; PIN blocks are AES-128-CBC encrypted. It is
//! NOT an implementation of the Calypso SAM specification and must never
//! guard real keys.

use aes::block_cipher_trait::generic_array::GenericArray;
use aes::block_cipher_trait::BlockCipher;
use aes::Aes128;
use block_modes::{block_padding::Iso7816, BlockMode, BlockModeIv, Cbc};
use cmac::{crypto_mac::Mac as CryptoMac, Cmac};
use rand::{thread_rng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crypto::{CryptoDriver, CryptoError, CryptoErrorKind, SvCommandSecurityData};

/// AES key size in bytes
pub const KEY_SIZE: usize = 16;

/// PIN blocks are AES-CBC encrypted, one block each
type Aes128Cbc = Cbc<Aes128, Iso7816>;

/// Derivation constants separating the MAC domains
const DERIVE_SESSION: u8 = 0x01;
const DERIVE_CARD: u8 = 0x02;
const DERIVE_SV: u8 = 0x03;
const DERIVE_PIN: u8 = 0x04;
const DERIVE_KEY: u8 = 0x05;

/// Simulated SAM holding a single master key
pub struct SoftwareSam {
    master_key: [u8; KEY_SIZE],
    serial_number: [u8; 4],
    transaction_number: u32,
    diversifier: Vec<u8>,
    session_key: Option<[u8; KEY_SIZE]>,
    mac_stream: Vec<u8>,
    extended_mode: bool,
    audit_data: Vec<String>,
    queued_signatures: Vec<Vec<u8>>,
}

impl SoftwareSam {
    /// Create a simulated SAM from a master key
    pub fn new(master_key: [u8; KEY_SIZE], serial_number: [u8; 4]) -> Self {
        Self {
            master_key,
            serial_number,
            transaction_number: 1,
            diversifier: Vec::new(),
            session_key: None,
            mac_stream: Vec::new(),
            extended_mode: false,
            audit_data: Vec::new(),
            queued_signatures: Vec::new(),
        }
    }

    /// CMAC over `constant || data` under `key`
    fn cmac(key: &[u8], constant: u8, data: &[u8]) -> [u8; KEY_SIZE] {
        let mut mac = Cmac::<Aes128>::new_varkey(key).expect("AES-CMAC accepts 16-byte keys");
        mac.input(&[constant]);
        mac.input(data);
        let tag = mac.result().code();
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(tag.as_slice());
        out
    }

    /// Derive the session key for a KIF/KVC pair and the current
    /// diversifier
    fn derive_session_key(&self, kif: u8, kvc: u8) -> [u8; KEY_SIZE] {
        let mut input = Vec::with_capacity(2 + self.diversifier.len());
        input.push(kif);
        input.push(kvc);
        input.extend_from_slice(&self.diversifier);
        Self::cmac(&self.master_key, DERIVE_SESSION, &input)
    }

    fn session_key(&self) -> Result<&[u8; KEY_SIZE], CryptoError> {
        self.session_key.as_ref().ok_or_else(|| {
            err!(
                CryptoErrorKind::IllegalState,
                "no session MAC context, init it first"
            )
        })
    }

    fn mac_length(&self) -> usize {
        if self.extended_mode {
            8
        } else {
            4
        }
    }

    /// Terminal-side session MAC over the accumulated stream
    fn terminal_mac(&self) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key()?;
        let tag = Self::cmac(key, DERIVE_SESSION, &self.mac_stream);
        Ok(tag[..self.mac_length()].to_vec())
    }

    /// Card-side session MAC over the same stream, separate domain
    fn card_mac(&self) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key()?;
        let tag = Self::cmac(key, DERIVE_CARD, &self.mac_stream);
        Ok(tag[..self.mac_length()].to_vec())
    }

    fn cipher_block(&self, kif: u8, kvc: u8, plaintext: &[u8]) -> Vec<u8> {
        let key = self.derive_session_key(kif, kvc);
        let cipher = Aes128::new_varkey(&key).expect("AES accepts 16-byte keys");
        let iv = GenericArray::clone_from_slice(&[0u8; KEY_SIZE]);
        let encryptor = Aes128Cbc::new(cipher, &iv);

        let mut buffer = plaintext.to_vec();
        let pos = buffer.len();
        buffer.extend_from_slice(&[0u8; KEY_SIZE]);
        let length = encryptor
            .encrypt_pad(&mut buffer, pos)
            .expect("buffer holds one padding block")
            .len();
        buffer.truncate(length);
        buffer
    }

    fn terminate(&mut self) {
        if let Some(mut key) = self.session_key.take() {
            key.zeroize();
        }
        self.mac_stream.clear();
    }
}

impl Drop for SoftwareSam {
    fn drop(&mut self) {
        self.terminate();
        self.master_key.zeroize();
    }
}

impl CryptoDriver for SoftwareSam {
    fn init_terminal_secure_session_context(&mut self) -> Result<[u8; 8], CryptoError> {
        self.terminate();
        let mut challenge = [0u8; 8];
        thread_rng().fill_bytes(&mut challenge);
        Ok(challenge)
    }

    fn init_terminal_session_mac(
        &mut self,
        open_response_data: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError> {
        self.session_key = Some(self.derive_session_key(kif, kvc));
        self.mac_stream.clear();
        self.mac_stream.extend_from_slice(open_response_data);
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, bytes: &[u8]) -> Result<(), CryptoError> {
        ensure!(
            self.session_key.is_some(),
            CryptoErrorKind::IllegalState,
            "no session MAC context, init it first"
        );
        self.mac_stream.extend_from_slice(bytes);
        Ok(())
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.terminal_mac()
    }

    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<(), CryptoError> {
        let expected = self.card_mac()?;
        if expected.ct_eq(card_mac).unwrap_u8() != 1 {
            self.terminate();
            fail!(CryptoErrorKind::InvalidSignature, "card session MAC mismatch");
        }
        self.terminate();
        Ok(())
    }

    fn verify_card_sv_mac(&mut self, sv_mac: &[u8]) -> Result<(), CryptoError> {
        // out of session the SV MAC is checked under the master key
        let key = self.session_key.as_ref().unwrap_or(&self.master_key);
        let expected = Self::cmac(key, DERIVE_SV, &self.mac_stream);
        if expected[..sv_mac.len().min(KEY_SIZE)].ct_eq(sv_mac).unwrap_u8() != 1 {
            fail!(CryptoErrorKind::InvalidSignature, "card SV MAC mismatch");
        }
        Ok(())
    }

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = Vec::with_capacity(card_challenge.len() + pin.len());
        plaintext.extend_from_slice(card_challenge);
        plaintext.extend_from_slice(pin);
        let block = self.cipher_block(kif, kvc, &plaintext);
        plaintext.zeroize();
        Ok(block)
    }

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: &[u8; 4],
        new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext =
            Vec::with_capacity(card_challenge.len() + current_pin.len() + new_pin.len());
        plaintext.extend_from_slice(card_challenge);
        plaintext.extend_from_slice(current_pin);
        plaintext.extend_from_slice(new_pin);
        let block = self.cipher_block(kif, kvc, &plaintext);
        plaintext.zeroize();
        Ok(block)
    }

    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer_kif: u8,
        issuer_kvc: u8,
        new_kif: u8,
        new_kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut new_key = Self::cmac(&self.master_key, DERIVE_KEY, &[new_kif, new_kvc]);
        let mut plaintext = Vec::with_capacity(2 + KEY_SIZE + card_challenge.len());
        plaintext.extend_from_slice(card_challenge);
        plaintext.push(new_kif);
        plaintext.push(new_kvc);
        plaintext.extend_from_slice(&new_key);
        let cryptogram = self.cipher_block(issuer_kif, issuer_kvc, &plaintext);
        plaintext.zeroize();
        new_key.zeroize();
        Ok(cryptogram)
    }

    fn generate_sv_command_security_data(
        &mut self,
        data: &mut SvCommandSecurityData,
    ) -> Result<(), CryptoError> {
        let mut input = Vec::new();
        input.extend_from_slice(data.sv_get_request());
        input.extend_from_slice(data.sv_get_response());
        input.extend_from_slice(data.sv_command_partial_request());
        let mac = Self::cmac(&self.master_key, DERIVE_SV, &input);

        let mut transaction_number = [0u8; 3];
        transaction_number[0] = (self.transaction_number >> 16) as u8;
        transaction_number[1] = (self.transaction_number >> 8) as u8;
        transaction_number[2] = self.transaction_number as u8;
        self.transaction_number = self.transaction_number.wrapping_add(1);

        data.set_serial_number(&self.serial_number);
        data.set_transaction_number(&transaction_number);
        data.set_terminal_sv_mac(&mac[..5]);
        Ok(())
    }

    fn set_default_key_diversifier(&mut self, serial_number: &[u8]) -> Result<(), CryptoError> {
        self.diversifier = serial_number.to_vec();
        Ok(())
    }

    fn set_transaction_audit_data(&mut self, record: &str) {
        self.audit_data.push(record.to_string());
    }

    fn enable_card_extended_mode(&mut self) -> Result<(), CryptoError> {
        self.extended_mode = true;
        Ok(())
    }

    fn is_extended_mode_supported(&self) -> bool {
        true
    }

    fn process_commands(&mut self) -> Result<(), CryptoError> {
        // signature operations are computed eagerly, nothing is pending
        self.queued_signatures.clear();
        Ok(())
    }

    fn prepare_compute_signature(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        self.queued_signatures.push(data.to_vec());
        Ok(())
    }

    fn prepare_verify_signature(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        self.queued_signatures.push(data.to_vec());
        Ok(())
    }
}

#[cfg(all(test, feature = "mocksam"))]
mod tests {
    use super::*;

    const MASTER_KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];
    const SAM_SERIAL: [u8; 4] = [0xA0, 0xA1, 0xA2, 0xA3];

    fn sam() -> SoftwareSam {
        let mut sam = SoftwareSam::new(MASTER_KEY, SAM_SERIAL);
        sam.set_default_key_diversifier(&[0x11; 8]).unwrap();
        sam
    }

    #[test]
    fn session_mac_round_trip() {
        let mut terminal = sam();
        terminal.init_terminal_session_mac(&[0x01, 0x02], 0x30, 0x79).unwrap();
        terminal.update_terminal_session_mac(&[0x0A]).unwrap();
        terminal.update_terminal_session_mac(&[0x0B]).unwrap();
        let terminal_mac = terminal.finalize_terminal_session_mac().unwrap();
        assert_eq!(terminal_mac.len(), 4);

        // the simulated card computes over the same stream
        let card_mac = terminal.card_mac().unwrap();
        assert!(terminal.verify_card_session_mac(&card_mac).is_ok());
    }

    #[test]
    fn session_mac_rejects_tampered_stream() {
        let mut terminal = sam();
        terminal.init_terminal_session_mac(&[0x01], 0x30, 0x79).unwrap();
        terminal.update_terminal_session_mac(&[0x0A]).unwrap();
        let mut card_mac = terminal.card_mac().unwrap();
        card_mac[0] ^= 0xFF;
        let err = terminal.verify_card_session_mac(&card_mac).unwrap_err();
        assert_eq!(err.kind(), CryptoErrorKind::InvalidSignature);
    }

    #[test]
    fn challenges_are_fresh() {
        let mut sam = sam();
        let first = sam.init_terminal_secure_session_context().unwrap();
        let second = sam.init_terminal_secure_session_context().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn pin_blocks_differ_per_challenge() {
        let mut sam = sam();
        let pin = [1, 2, 3, 4];
        let one = sam.cipher_pin_for_presentation(&[0x01; 8], &pin, 0x30, 0x79).unwrap();
        let two = sam.cipher_pin_for_presentation(&[0x02; 8], &pin, 0x30, 0x79).unwrap();
        assert_eq!(one.len(), KEY_SIZE);
        assert_ne!(one, two);
    }

    #[test]
    fn sv_security_block_shape() {
        let mut sam = sam();
        let mut data = SvCommandSecurityData::new(&[0x00], &[0x01], &[0x02]);
        sam.generate_sv_command_security_data(&mut data).unwrap();
        assert_eq!(data.security_block().len(), 12);
        assert_eq!(&data.security_block()[..4], &SAM_SERIAL);
    }
}
