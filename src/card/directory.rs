//! Metadata of the selected dedicated file (the application directory).

use transaction::AccessLevel;

/// DF metadata observed via Select File or Get Data
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectoryHeader {
    /// Long file identifier of the DF
    pub lid: u16,

    /// Access conditions, one byte per group
    pub access_conditions: [u8; 4],

    /// Key indexes, one byte per group
    pub key_indexes: [u8; 4],

    /// DF status byte
    pub df_status: u8,

    kif: [Option<u8>; 3],
    kvc: [Option<u8>; 3],
}

impl DirectoryHeader {
    pub(crate) fn new(
        lid: u16,
        access_conditions: [u8; 4],
        key_indexes: [u8; 4],
        df_status: u8,
    ) -> Self {
        Self {
            lid,
            access_conditions,
            key_indexes,
            df_status,
            kif: [None; 3],
            kvc: [None; 3],
        }
    }

    /// KIF of the session key for the given access level, if observed
    pub fn kif(&self, level: AccessLevel) -> Option<u8> {
        self.kif[level as usize]
    }

    /// KVC of the session key for the given access level, if observed
    pub fn kvc(&self, level: AccessLevel) -> Option<u8> {
        self.kvc[level as usize]
    }

    pub(crate) fn set_kif(&mut self, level: AccessLevel, kif: u8) {
        self.kif[level as usize] = Some(kif);
    }

    pub(crate) fn set_kvc(&mut self, level: AccessLevel, kvc: u8) {
        self.kvc[level as usize] = Some(kvc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transaction::AccessLevel;

    #[test]
    fn per_level_keys() {
        let mut header = DirectoryHeader::new(0x3F00, [0x10; 4], [1, 2, 3, 0], 0x00);
        header.set_kif(AccessLevel::Load, 0x27);
        header.set_kvc(AccessLevel::Load, 0x79);
        assert_eq!(header.kif(AccessLevel::Load), Some(0x27));
        assert_eq!(header.kvc(AccessLevel::Load), Some(0x79));
        assert_eq!(header.kif(AccessLevel::Debit), None);
    }
}
