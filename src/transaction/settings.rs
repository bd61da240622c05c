//! Security settings and the enums of the library surface.

use std::collections::BTreeMap;

/// Session key level of a Secure Session
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Personalization key (issuer)
    Perso = 0,

    /// Load key (reload agent)
    Load = 1,

    /// Debit key (validator)
    Debit = 2,
}

/// Stored Value operation type
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SvOperation {
    /// Credit the purse
    Reload,

    /// Charge the purse
    Debit,
}

impl SvOperation {
    /// The complementary operation
    pub(crate) fn other(self) -> Self {
        match self {
            SvOperation::Reload => SvOperation::Debit,
            SvOperation::Debit => SvOperation::Reload,
        }
    }
}

/// Perform the operation, or revert a previous one
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SvAction {
    /// Perform
    Do,

    /// Revert
    Undo,
}

/// Behavior when the prepared commands overflow the session buffer
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionModificationMode {
    /// Refuse: everything must fit one session
    Atomic,

    /// Split the work across several consecutive sessions
    Multiple,
}

/// Ratification strategy at session close
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RatificationMode {
    /// Close with the ratify bit set
    CloseRatified,

    /// Close not ratified and, on contactless readers, send an explicit
    /// ratification probe
    CloseNotRatified,
}

/// How the PIN travels to the card
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PinTransmissionMode {
    /// In the clear (must be explicitly chosen)
    Plain,

    /// Ciphered by the SAM against the card challenge
    Encrypted,
}

/// Target of a Select File command
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SelectFileControl {
    /// First EF of the current DF
    First,

    /// Next EF of the current DF
    Next,

    /// The current DF itself
    CurrentDf,
}

/// Data object tags accepted by Get Data
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GetDataTag {
    /// File Control Information of the current DF
    FciForCurrentDf,

    /// File Control Parameters of the current file
    FcpForCurrentFile,

    /// List of the EFs of the current DF
    EfList,

    /// Traceability information
    TraceabilityInformation,
}

impl GetDataTag {
    /// Tag value carried by P1/P2
    pub fn tag(self) -> u16 {
        match self {
            GetDataTag::FciForCurrentDf => 0x006F,
            GetDataTag::FcpForCurrentFile => 0x0062,
            GetDataTag::EfList => 0x00C0,
            GetDataTag::TraceabilityInformation => 0x0185,
        }
    }
}

/// Immutable description of the security context of a transaction
///
/// Built fluently, then handed to the transaction manager:
///
/// ```
/// use calypso::{AccessLevel, SecuritySetting};
///
/// let setting = SecuritySetting::new()
///     .enable_multiple_session()
///     .assign_default_kif(AccessLevel::Debit, 0x30)
///     .assign_default_kvc(AccessLevel::Debit, 0x79)
///     .add_authorized_session_key(0x30, 0x79);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecuritySetting {
    sam_profile_name: Option<String>,
    session_modification_mode: SessionModificationMode,
    ratification_mode: RatificationMode,
    pin_transmission_mode: PinTransmissionMode,
    default_kif: [Option<u8>; 3],
    default_kvc: [Option<u8>; 3],
    default_key_record_number: [Option<u8>; 3],
    kif_by_level_and_kvc: BTreeMap<(u8, u8), u8>,
    authorized_kvc_list: Vec<u8>,
    authorized_session_keys: Vec<(u8, u8)>,
    authorized_sv_keys: Vec<(u8, u8)>,
    pin_verification_cipher_key: Option<(u8, u8)>,
    pin_modification_cipher_key: Option<(u8, u8)>,
    is_load_and_debit_sv_log_enabled: bool,
    is_sv_negative_balance_authorized: bool,
}

impl Default for SecuritySetting {
    fn default() -> Self {
        Self::new()
    }
}

impl SecuritySetting {
    /// Start from the restrictive defaults: atomic sessions, ratified
    /// close, encrypted PIN, no keys authorized explicitly
    pub fn new() -> Self {
        Self {
            sam_profile_name: None,
            session_modification_mode: SessionModificationMode::Atomic,
            ratification_mode: RatificationMode::CloseRatified,
            pin_transmission_mode: PinTransmissionMode::Encrypted,
            default_kif: [None; 3],
            default_kvc: [None; 3],
            default_key_record_number: [None; 3],
            kif_by_level_and_kvc: BTreeMap::new(),
            authorized_kvc_list: Vec::new(),
            authorized_session_keys: Vec::new(),
            authorized_sv_keys: Vec::new(),
            pin_verification_cipher_key: None,
            pin_modification_cipher_key: None,
            is_load_and_debit_sv_log_enabled: false,
            is_sv_negative_balance_authorized: false,
        }
    }

    /// Name of the SAM resource profile backing the crypto driver
    pub fn with_sam_profile_name(mut self, name: &str) -> Self {
        self.sam_profile_name = Some(name.to_string());
        self
    }

    /// Allow splitting the work across several consecutive sessions
    pub fn enable_multiple_session(mut self) -> Self {
        self.session_modification_mode = SessionModificationMode::Multiple;
        self
    }

    /// Close sessions not ratified and ratify explicitly on contactless
    /// readers
    pub fn enable_ratification_mechanism(mut self) -> Self {
        self.ratification_mode = RatificationMode::CloseNotRatified;
        self
    }

    /// Allow transmitting PINs in the clear
    pub fn enable_plain_pin_transmission(mut self) -> Self {
        self.pin_transmission_mode = PinTransmissionMode::Plain;
        self
    }

    /// Request both SV logs on every SV Get
    pub fn enable_sv_load_and_debit_log(mut self) -> Self {
        self.is_load_and_debit_sv_log_enabled = true;
        self
    }

    /// Accept SV debits driving the balance below zero
    pub fn authorize_sv_negative_balance(mut self) -> Self {
        self.is_sv_negative_balance_authorized = true;
        self
    }

    /// Default KIF for an access level
    pub fn assign_default_kif(mut self, level: AccessLevel, kif: u8) -> Self {
        self.default_kif[level as usize] = Some(kif);
        self
    }

    /// Default KVC for an access level
    pub fn assign_default_kvc(mut self, level: AccessLevel, kvc: u8) -> Self {
        self.default_kvc[level as usize] = Some(kvc);
        self
    }

    /// Default key record number for an access level
    pub fn assign_default_key_record_number(mut self, level: AccessLevel, number: u8) -> Self {
        self.default_key_record_number[level as usize] = Some(number);
        self
    }

    /// KIF to use when the card reports a KVC but no KIF
    pub fn assign_kif_for_kvc(mut self, level: AccessLevel, kvc: u8, kif: u8) -> Self {
        self.kif_by_level_and_kvc.insert((level as u8, kvc), kif);
        self
    }

    /// Add a KVC to the authorized list (empty list = all allowed)
    pub fn add_authorized_kvc(mut self, kvc: u8) -> Self {
        self.authorized_kvc_list.push(kvc);
        self
    }

    /// Add a session key to the authorized set (empty set = fall back to
    /// the KVC list)
    pub fn add_authorized_session_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_session_keys.push((kif, kvc));
        self
    }

    /// Add an SV key to the authorized set
    pub fn add_authorized_sv_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_sv_keys.push((kif, kvc));
        self
    }

    /// Key ciphering PIN blocks for verification
    pub fn set_pin_verification_cipher_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_verification_cipher_key = Some((kif, kvc));
        self
    }

    /// Key ciphering PIN blocks for modification
    pub fn set_pin_modification_cipher_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_modification_cipher_key = Some((kif, kvc));
        self
    }

    // -- accessors ----------------------------------------------------------

    /// SAM resource profile name, if configured
    pub fn sam_profile_name(&self) -> Option<&str> {
        self.sam_profile_name.as_ref().map(|s| s.as_str())
    }

    /// Session buffer overflow behavior
    pub fn session_modification_mode(&self) -> SessionModificationMode {
        self.session_modification_mode
    }

    /// Ratification strategy
    pub fn ratification_mode(&self) -> RatificationMode {
        self.ratification_mode
    }

    /// PIN transmission mode
    pub fn pin_transmission_mode(&self) -> PinTransmissionMode {
        self.pin_transmission_mode
    }

    /// Default KIF for a level, if configured
    pub fn default_kif(&self, level: AccessLevel) -> Option<u8> {
        self.default_kif[level as usize]
    }

    /// Default KVC for a level, if configured
    pub fn default_kvc(&self, level: AccessLevel) -> Option<u8> {
        self.default_kvc[level as usize]
    }

    /// Default key record number for a level, if configured
    pub fn default_key_record_number(&self, level: AccessLevel) -> Option<u8> {
        self.default_key_record_number[level as usize]
    }

    /// Resolve a KIF from the level and the card's KVC
    pub fn kif_for(&self, level: AccessLevel, kvc: u8) -> Option<u8> {
        self.kif_by_level_and_kvc
            .get(&(level as u8, kvc))
            .cloned()
            .or_else(|| self.default_kif(level))
    }

    /// Is this session key pair acceptable?
    pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        if !self.authorized_session_keys.is_empty() {
            return self.authorized_session_keys.contains(&(kif, kvc));
        }
        if !self.authorized_kvc_list.is_empty() {
            return self.authorized_kvc_list.contains(&kvc);
        }
        true
    }

    /// Is this SV key pair acceptable?
    pub fn is_sv_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.authorized_sv_keys.is_empty() || self.authorized_sv_keys.contains(&(kif, kvc))
    }

    /// PIN verification ciphering key, if configured
    pub fn pin_verification_cipher_key(&self) -> Option<(u8, u8)> {
        self.pin_verification_cipher_key
    }

    /// PIN modification ciphering key, if configured
    pub fn pin_modification_cipher_key(&self) -> Option<(u8, u8)> {
        self.pin_modification_cipher_key
    }

    /// Are both SV logs requested on SV Get?
    pub fn is_load_and_debit_sv_log_enabled(&self) -> bool {
        self.is_load_and_debit_sv_log_enabled
    }

    /// May SV debits drive the balance below zero?
    pub fn is_sv_negative_balance_authorized(&self) -> bool {
        self.is_sv_negative_balance_authorized
    }
}
