//! In-memory projection of the selected Calypso application.
//!
//! The card image accumulates everything the commands observe: DF
//! metadata, elementary files by SFI and by LID, record/binary/counter
//! content, Stored Value state, PIN attempts and the session flags. It is
//! owned by the transaction for its whole lifetime and never persisted by
//! this crate.

mod directory;
mod file;
mod sv;

pub use self::directory::DirectoryHeader;
pub use self::file::{ElementaryFile, FileData, FileHeader, FileType, COUNTER_SIZE};
pub use self::sv::{SvDebitLogRecord, SvLoadLogRecord};

use std::collections::BTreeMap;

/// Card product families supported by the engine
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProductType {
    /// Legacy revision 1 cards (class byte `94`)
    PrimeRevision1,

    /// Legacy revision 2 cards (class byte `94`)
    PrimeRevision2,

    /// Revision 3 cards (ISO class byte `00`)
    PrimeRevision3,

    /// Calypso Light
    Light,

    /// Calypso Basic
    Basic,
}

impl ProductType {
    /// Class byte used by every command sent to this product
    pub fn card_class(self) -> u8 {
        match self {
            ProductType::PrimeRevision1 | ProductType::PrimeRevision2 => 0x94,
            ProductType::PrimeRevision3 | ProductType::Light | ProductType::Basic => 0x00,
        }
    }
}

bitflags! {
    /// Feature bits carried by the application type byte of the startup
    /// information
    pub struct AppFeatures: u8 {
        /// The application has a PIN
        const PIN = 0x01;

        /// The application has a Stored Value purse
        const STORED_VALUE = 0x02;

        /// Counter commands answer `6200` in session, the new value is
        /// delivered through the Close Session postponed data list
        const POSTPONED_COUNTER = 0x04;

        /// The application supports extended-mode sessions (8-byte MACs)
        const EXTENDED_MODE = 0x08;
    }
}

/// Session buffer sizes in bytes, indexed by the buffer size indicator of
/// the startup information (products counting bytes only)
const BUFFER_SIZE_BY_INDICATOR: [i32; 32] = [
    0, 0, 0, 0, 0, 0, 215, 256, 304, 362, 430, 512, 608, 724, 861, 1024, 1217, 1448, 1722, 2048,
    2435, 2896, 3444, 4096, 4870, 5792, 6888, 8192, 9741, 11585, 13777, 16384,
];

/// The 7-byte startup information returned at selection time
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartupInfo {
    /// Session modifications buffer size indicator
    pub buffer_size_indicator: u8,

    /// Platform byte
    pub platform: u8,

    /// Application type (carries the feature bits)
    pub application_type: u8,

    /// Application subtype
    pub application_subtype: u8,

    /// Software issuer
    pub software_issuer: u8,

    /// Software version
    pub software_version: u8,

    /// Software revision
    pub software_revision: u8,
}

impl StartupInfo {
    /// Parse the 7-byte startup information; `None` if too short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 {
            return None;
        }
        Some(Self {
            buffer_size_indicator: bytes[0],
            platform: bytes[1],
            application_type: bytes[2],
            application_subtype: bytes[3],
            software_issuer: bytes[4],
            software_version: bytes[5],
            software_revision: bytes[6],
        })
    }

    /// Serialize back to the 7-byte wire form
    pub fn to_bytes(&self) -> [u8; 7] {
        [
            self.buffer_size_indicator,
            self.platform,
            self.application_type,
            self.application_subtype,
            self.software_issuer,
            self.software_version,
            self.software_revision,
        ]
    }
}

/// Deep snapshot taken at session open, swapped back on rollback
#[derive(Clone, Debug)]
struct CardSnapshot {
    files: BTreeMap<u8, ElementaryFile>,
    lid_index: BTreeMap<u16, u8>,
    sv_kvc: Option<u8>,
    sv_balance: Option<i32>,
    sv_last_tnum: Option<u16>,
    sv_load_log: Option<SvLoadLogRecord>,
    sv_debit_log: Vec<SvDebitLogRecord>,
    pin_attempts_remaining: Option<u8>,
    is_df_invalidated: bool,
}

/// The card image
#[derive(Clone, Debug)]
pub struct CalypsoCard {
    product_type: ProductType,
    card_class: u8,
    df_name: Vec<u8>,
    serial_number: Vec<u8>,
    startup_info: StartupInfo,
    features: AppFeatures,
    traceability_information: Vec<u8>,

    directory_header: Option<DirectoryHeader>,
    files: BTreeMap<u8, ElementaryFile>,
    lid_index: BTreeMap<u16, u8>,

    is_df_invalidated: bool,
    is_df_ratified: bool,

    sv_kvc: Option<u8>,
    sv_balance: Option<i32>,
    sv_last_tnum: Option<u16>,
    sv_load_log: Option<SvLoadLogRecord>,
    sv_debit_log: Vec<SvDebitLogRecord>,
    sv_get_header: Option<Vec<u8>>,
    sv_get_data: Option<Vec<u8>>,

    pin_attempts_remaining: Option<u8>,
    card_challenge: Option<Vec<u8>>,

    snapshot: Option<Box<CardSnapshot>>,
}

impl CalypsoCard {
    /// Build the image of a freshly selected application
    ///
    /// The selection stage (outside this crate) provides the product
    /// type, the DF name, the full serial number and the startup
    /// information it extracted from the selection response.
    pub fn new(
        product_type: ProductType,
        df_name: Vec<u8>,
        serial_number: Vec<u8>,
        startup_info: StartupInfo,
    ) -> Self {
        let features = AppFeatures::from_bits_truncate(startup_info.application_type);
        Self {
            product_type,
            card_class: product_type.card_class(),
            df_name,
            serial_number,
            startup_info,
            features,
            traceability_information: Vec::new(),
            directory_header: None,
            files: BTreeMap::new(),
            lid_index: BTreeMap::new(),
            is_df_invalidated: false,
            is_df_ratified: false,
            sv_kvc: None,
            sv_balance: None,
            sv_last_tnum: None,
            sv_load_log: None,
            sv_debit_log: Vec::new(),
            sv_get_header: None,
            sv_get_data: None,
            pin_attempts_remaining: None,
            card_challenge: None,
            snapshot: None,
        }
    }

    /// Product family
    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    /// Class byte for this product
    pub fn card_class(&self) -> u8 {
        self.card_class
    }

    /// DF name (AID) of the selected application
    pub fn df_name(&self) -> &[u8] {
        &self.df_name
    }

    /// Full serial number, used as key diversifier
    pub fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    /// Startup information from selection
    pub fn startup_info(&self) -> &StartupInfo {
        &self.startup_info
    }

    /// Traceability information retained from Get Data
    pub fn traceability_information(&self) -> &[u8] {
        &self.traceability_information
    }

    /// Does the product support extended-mode sessions?
    pub fn is_extended_mode_supported(&self) -> bool {
        self.product_type == ProductType::PrimeRevision3
            && self.features.contains(AppFeatures::EXTENDED_MODE)
    }

    /// Does the application carry a PIN?
    pub fn is_pin_feature_available(&self) -> bool {
        self.features.contains(AppFeatures::PIN)
    }

    /// Does the application carry a Stored Value purse?
    pub fn is_sv_feature_available(&self) -> bool {
        self.features.contains(AppFeatures::STORED_VALUE)
    }

    /// Do in-session counter commands postpone their new value to the
    /// Close Session postponed data list?
    pub fn is_counter_value_postponed(&self) -> bool {
        self.features.contains(AppFeatures::POSTPONED_COUNTER)
    }

    /// Is the DF invalidated?
    pub fn is_df_invalidated(&self) -> bool {
        self.is_df_invalidated
    }

    /// Has the previous secure session been ratified?
    pub fn is_df_ratified(&self) -> bool {
        self.is_df_ratified
    }

    /// Maximum session modifications budget of this product
    pub fn modifications_counter(&self) -> i32 {
        if self.is_modifications_counter_in_bytes() {
            let indicator = self.startup_info.buffer_size_indicator as usize;
            if indicator < BUFFER_SIZE_BY_INDICATOR.len() {
                BUFFER_SIZE_BY_INDICATOR[indicator]
            } else {
                BUFFER_SIZE_BY_INDICATOR[BUFFER_SIZE_BY_INDICATOR.len() - 1]
            }
        } else {
            i32::from(self.startup_info.buffer_size_indicator)
        }
    }

    /// Is the modifications budget counted in bytes (revision 3 and
    /// Light) rather than in commands?
    pub fn is_modifications_counter_in_bytes(&self) -> bool {
        match self.product_type {
            ProductType::PrimeRevision3 | ProductType::Light => true,
            _ => false,
        }
    }

    /// Largest data field this product accepts in one APDU
    pub fn payload_capacity(&self) -> usize {
        match self.product_type {
            ProductType::PrimeRevision3 | ProductType::Light => 250,
            _ => 128,
        }
    }

    /// DF metadata, if observed
    pub fn directory_header(&self) -> Option<&DirectoryHeader> {
        self.directory_header.as_ref()
    }

    /// Elementary file addressed by SFI, if observed
    pub fn get_file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.files.get(&sfi)
    }

    /// Elementary file addressed by LID, if its LID was ever observed
    pub fn get_file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.lid_index.get(&lid).and_then(|sfi| self.files.get(sfi))
    }

    /// All observed elementary files, keyed by SFI
    pub fn files(&self) -> &BTreeMap<u8, ElementaryFile> {
        &self.files
    }

    /// SV balance (signed 24-bit), defined after a successful SV Get
    pub fn sv_balance(&self) -> Option<i32> {
        self.sv_balance
    }

    /// Last SV transaction number, defined after a successful SV Get
    pub fn sv_last_transaction_number(&self) -> Option<u16> {
        self.sv_last_tnum
    }

    /// KVC of the SV key, defined after a successful SV Get
    pub fn sv_kvc(&self) -> Option<u8> {
        self.sv_kvc
    }

    /// Last load log record, if requested and observed
    pub fn sv_load_log_record(&self) -> Option<&SvLoadLogRecord> {
        self.sv_load_log.as_ref()
    }

    /// Debit log records, newest first, if requested and observed
    pub fn sv_debit_log_records(&self) -> &[SvDebitLogRecord] {
        &self.sv_debit_log
    }

    /// PIN presentation attempts remaining, if observed
    pub fn pin_attempt_remaining(&self) -> Option<u8> {
        self.pin_attempts_remaining
    }

    /// Is the PIN blocked (no attempts remaining)?
    pub fn is_pin_blocked(&self) -> bool {
        self.pin_attempts_remaining == Some(0)
    }

    /// Challenge obtained from the last Get Challenge
    pub(crate) fn card_challenge(&self) -> Option<&[u8]> {
        self.card_challenge.as_ref().map(|c| c.as_slice())
    }

    /// Raw SV Get request header retained for the crypto driver
    pub(crate) fn sv_get_header(&self) -> Option<&[u8]> {
        self.sv_get_header.as_ref().map(|h| h.as_slice())
    }

    /// Raw SV Get response data retained for the crypto driver
    pub(crate) fn sv_get_data(&self) -> Option<&[u8]> {
        self.sv_get_data.as_ref().map(|d| d.as_slice())
    }

    // -- mutators used by the response parsers ------------------------------

    fn ensure_file(&mut self, sfi: u8) -> &mut ElementaryFile {
        self.files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(sfi))
    }

    pub(crate) fn set_directory_header(&mut self, header: DirectoryHeader) {
        self.directory_header = Some(header);
    }

    /// Install or refresh a file header; registers the LID index when the
    /// header carries one
    pub(crate) fn set_file_header(&mut self, sfi: u8, header: FileHeader) {
        let lid = header.lid;
        self.ensure_file(sfi).set_header(header);
        if lid != 0 {
            self.lid_index.insert(lid, sfi);
        }
    }

    /// Merge one full record into the file content
    pub(crate) fn set_record_content(&mut self, sfi: u8, record_number: u8, content: &[u8]) {
        let file = self.ensure_file(sfi);
        file.header_or_synthesize(content.len() as u8);
        file.data_mut().set_content(record_number, content.to_vec());
    }

    /// Overlay part of a record at an offset
    pub(crate) fn fill_record_content(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
        offset: usize,
    ) {
        let file = self.ensure_file(sfi);
        file.header_or_synthesize(0);
        file.data_mut().fill_content(record_number, content, offset);
    }

    /// Record an Append Record on a cyclic file
    pub(crate) fn add_cyclic_content(&mut self, sfi: u8, content: &[u8]) {
        let records_number = self
            .files
            .get(&sfi)
            .and_then(|f| f.header())
            .map(|h| h.records_number)
            .unwrap_or(1);
        let file = self.ensure_file(sfi);
        file.header_or_synthesize(content.len() as u8);
        file.data_mut()
            .add_cyclic_content(records_number, content.to_vec());
    }

    /// Overlay binary content at an offset
    pub(crate) fn fill_binary_content(&mut self, sfi: u8, content: &[u8], offset: usize) {
        let file = self.ensure_file(sfi);
        if file.header().is_none() {
            let mut header = FileHeader::synthesize(0);
            header.file_type = FileType::Binary;
            file.set_header(header);
        }
        file.data_mut().fill_content(1, content, offset);
    }

    /// Set a counter value
    pub(crate) fn set_counter(&mut self, sfi: u8, counter_number: u8, value: u32) {
        let file = self.ensure_file(sfi);
        if file.header().is_none() {
            let mut header = FileHeader::synthesize(0);
            header.file_type = FileType::Counters;
            file.set_header(header);
        }
        file.data_mut().set_counter(counter_number, value);
    }

    /// Current value of a counter, if observed
    pub(crate) fn get_counter(&self, sfi: u8, counter_number: u8) -> Option<u32> {
        self.files
            .get(&sfi)
            .and_then(|f| f.data().counter(counter_number))
    }

    /// Refresh the identification data observed through Get Data (FCI)
    pub(crate) fn update_identification(
        &mut self,
        df_name: Option<Vec<u8>>,
        serial_number: Option<Vec<u8>>,
        startup_info: Option<StartupInfo>,
    ) {
        if let Some(name) = df_name {
            self.df_name = name;
        }
        if let Some(serial) = serial_number {
            self.serial_number = serial;
        }
        if let Some(info) = startup_info {
            self.startup_info = info;
            self.features = AppFeatures::from_bits_truncate(info.application_type);
        }
    }

    pub(crate) fn set_traceability_information(&mut self, info: &[u8]) {
        self.traceability_information = info.to_vec();
    }

    pub(crate) fn set_df_invalidated(&mut self, invalidated: bool) {
        self.is_df_invalidated = invalidated;
    }

    pub(crate) fn set_df_ratified(&mut self, ratified: bool) {
        self.is_df_ratified = ratified;
    }

    pub(crate) fn set_challenge(&mut self, challenge: &[u8]) {
        self.card_challenge = Some(challenge.to_vec());
    }

    pub(crate) fn set_pin_attempts(&mut self, attempts: Option<u8>) {
        self.pin_attempts_remaining = attempts;
    }

    /// Record the outcome of an SV Get
    pub(crate) fn set_sv_data(
        &mut self,
        kvc: u8,
        transaction_number: u16,
        balance: i32,
        load_log: Option<SvLoadLogRecord>,
        debit_log: Option<SvDebitLogRecord>,
    ) {
        self.sv_kvc = Some(kvc);
        self.sv_last_tnum = Some(transaction_number);
        self.sv_balance = Some(balance);
        if load_log.is_some() {
            self.sv_load_log = load_log;
        }
        if let Some(record) = debit_log {
            self.sv_debit_log.insert(0, record);
        }
    }

    /// Apply the balance change of a completed SV operation
    pub(crate) fn update_sv_balance(&mut self, delta: i32) {
        if let Some(balance) = self.sv_balance {
            self.sv_balance = Some(balance + delta);
        }
        if let Some(tnum) = self.sv_last_tnum {
            self.sv_last_tnum = Some(tnum.wrapping_add(1));
        }
    }

    /// Retain the SV Get exchange for the crypto driver
    pub(crate) fn set_sv_get_exchange(&mut self, header: Vec<u8>, data: Vec<u8>) {
        self.sv_get_header = Some(header);
        self.sv_get_data = Some(data);
    }

    // -- session rollback ---------------------------------------------------

    /// Deep snapshot of files, SV state and PIN state, taken at session
    /// open
    pub(crate) fn backup_files(&mut self) {
        self.snapshot = Some(Box::new(CardSnapshot {
            files: self.files.clone(),
            lid_index: self.lid_index.clone(),
            sv_kvc: self.sv_kvc,
            sv_balance: self.sv_balance,
            sv_last_tnum: self.sv_last_tnum,
            sv_load_log: self.sv_load_log.clone(),
            sv_debit_log: self.sv_debit_log.clone(),
            pin_attempts_remaining: self.pin_attempts_remaining,
            is_df_invalidated: self.is_df_invalidated,
        }));
    }

    /// Swap the snapshot back in after a cancelled or failed session
    pub(crate) fn restore_files(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            let snapshot = *snapshot;
            self.files = snapshot.files;
            self.lid_index = snapshot.lid_index;
            self.sv_kvc = snapshot.sv_kvc;
            self.sv_balance = snapshot.sv_balance;
            self.sv_last_tnum = snapshot.sv_last_tnum;
            self.sv_load_log = snapshot.sv_load_log;
            self.sv_debit_log = snapshot.sv_debit_log;
            self.pin_attempts_remaining = snapshot.pin_attempts_remaining;
            self.is_df_invalidated = snapshot.is_df_invalidated;
        }
    }

    /// Drop the snapshot once the session outcome is final
    pub(crate) fn discard_backup(&mut self) {
        self.snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup(buffer_size_indicator: u8, application_type: u8) -> StartupInfo {
        StartupInfo {
            buffer_size_indicator,
            platform: 0x25,
            application_type,
            application_subtype: 0x02,
            software_issuer: 0x00,
            software_version: 0x03,
            software_revision: 0x01,
        }
    }

    fn rev3_card() -> CalypsoCard {
        CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![0xA0, 0x00, 0x00, 0x04, 0x04],
            vec![0u8; 8],
            startup(6, 0x0B),
        )
    }

    #[test]
    fn feature_flags_from_application_type() {
        let card = rev3_card();
        assert!(card.is_pin_feature_available());
        assert!(card.is_sv_feature_available());
        assert!(card.is_extended_mode_supported());
        assert!(!card.is_counter_value_postponed());
    }

    #[test]
    fn buffer_size_from_indicator() {
        let card = rev3_card();
        assert!(card.is_modifications_counter_in_bytes());
        assert_eq!(card.modifications_counter(), 215);

        let legacy = CalypsoCard::new(
            ProductType::PrimeRevision2,
            vec![],
            vec![0u8; 8],
            startup(3, 0x00),
        );
        assert!(!legacy.is_modifications_counter_in_bytes());
        assert_eq!(legacy.modifications_counter(), 3);
        assert_eq!(legacy.card_class(), 0x94);
    }

    #[test]
    fn lid_index_follows_headers() {
        let mut card = rev3_card();
        let mut header = FileHeader::synthesize(29);
        header.lid = 0x2010;
        card.set_file_header(0x07, header);
        assert_eq!(card.get_file_by_lid(0x2010).unwrap().sfi(), 0x07);
    }

    #[test]
    fn backup_restore_is_deep() {
        let mut card = rev3_card();
        card.set_record_content(0x07, 1, &[1, 2, 3]);
        card.set_counter(0x19, 1, 100);
        card.set_sv_data(0xAA, 1, 500, None, None);
        card.set_pin_attempts(Some(3));

        card.backup_files();
        card.set_record_content(0x07, 1, &[9, 9, 9]);
        card.set_counter(0x19, 1, 42);
        card.update_sv_balance(-100);
        card.set_pin_attempts(Some(1));
        card.set_df_invalidated(true);

        card.restore_files();
        assert_eq!(
            card.get_file_by_sfi(0x07).unwrap().data().content(1).unwrap(),
            &[1, 2, 3]
        );
        assert_eq!(card.get_counter(0x19, 1), Some(100));
        assert_eq!(card.sv_balance(), Some(500));
        assert_eq!(card.pin_attempt_remaining(), Some(3));
        assert!(!card.is_df_invalidated());
    }
}
