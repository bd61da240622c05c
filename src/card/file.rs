//! Elementary files: headers and accumulated content.
//!
//! Content is filled in lazily as commands observe it; a record written at
//! an offset extends the stored record with zero padding and preserves the
//! bytes around the written range.

use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;

/// Length in bytes of a counter stored in a COUNTERS file
pub const COUNTER_SIZE: usize = 3;

/// Structural type of an elementary file
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FileType {
    /// Fixed-size records, read/written by number
    Linear,

    /// A single transparent byte string
    Binary,

    /// Records shifted on append, record 1 is the most recent
    Cyclic,

    /// 3-byte counters updated by Increase/Decrease
    Counters,

    /// Counters simulated over a shared cyclic file
    SimulatedCounters,
}

impl FileType {
    /// Decode the EF type byte of a file descriptor
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => FileType::Linear,
            0x02 => FileType::Binary,
            0x04 => FileType::Cyclic,
            0x08 => FileType::SimulatedCounters,
            0x09 => FileType::Counters,
            _ => return None,
        })
    }

    /// Encode as the EF type byte of a file descriptor
    pub fn to_u8(self) -> u8 {
        match self {
            FileType::Linear => 0x01,
            FileType::Binary => 0x02,
            FileType::Cyclic => 0x04,
            FileType::SimulatedCounters => 0x08,
            FileType::Counters => 0x09,
        }
    }
}

/// Metadata of an elementary file
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Long file identifier (0 when only the SFI was ever observed)
    pub lid: u16,

    /// Number of records (1 for binary files)
    pub records_number: u8,

    /// Record size in bytes (0 when unknown)
    pub record_size: u8,

    /// Structural type
    pub file_type: FileType,

    /// Access conditions, one byte per group
    pub access_conditions: [u8; 4],

    /// Key indexes, one byte per group
    pub key_indexes: [u8; 4],

    /// DF status byte
    pub df_status: u8,

    /// LID of the sharing file for simulated counters
    pub shared_reference: Option<u16>,
}

impl FileHeader {
    /// Minimal header synthesized when a record is observed before the
    /// file structure was ever selected
    pub(crate) fn synthesize(record_size: u8) -> Self {
        Self {
            lid: 0,
            records_number: 1,
            record_size,
            file_type: FileType::Linear,
            access_conditions: [0; 4],
            key_indexes: [0; 4],
            df_status: 0,
            shared_reference: None,
        }
    }
}

/// Observed content of an elementary file
///
/// Binary content and counters are both carried by record 1, matching the
/// card's own storage model.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    records: BTreeMap<u8, Vec<u8>>,
}

impl FileData {
    /// Content of a record, if observed
    pub fn content(&self, record_number: u8) -> Option<&[u8]> {
        self.records.get(&record_number).map(|r| r.as_slice())
    }

    /// All observed records, keyed by record number
    pub fn all_records(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    /// Binary file content (record 1)
    pub fn binary_content(&self) -> Option<&[u8]> {
        self.content(1)
    }

    /// Value of counter `number` (1-based), if its 3 bytes were observed
    pub fn counter(&self, number: u8) -> Option<u32> {
        if number == 0 {
            return None;
        }
        let record = self.records.get(&1)?;
        let offset = (number as usize - 1) * COUNTER_SIZE;
        if record.len() < offset + COUNTER_SIZE {
            return None;
        }
        Some(BigEndian::read_u24(&record[offset..offset + COUNTER_SIZE]))
    }

    /// All complete counters of record 1, keyed by counter number
    pub fn all_counters(&self) -> BTreeMap<u8, u32> {
        let mut counters = BTreeMap::new();
        if let Some(record) = self.records.get(&1) {
            let mut number = 1u8;
            let mut offset = 0;
            while record.len() >= offset + COUNTER_SIZE {
                counters.insert(number, BigEndian::read_u24(&record[offset..offset + 3]));
                number += 1;
                offset += COUNTER_SIZE;
            }
        }
        counters
    }

    /// Replace the content of a record
    pub(crate) fn set_content(&mut self, record_number: u8, content: Vec<u8>) {
        self.records.insert(record_number, content);
    }

    /// Overlay `content` at `offset`, extending the record with zero
    /// padding when needed and preserving surrounding bytes
    pub(crate) fn fill_content(&mut self, record_number: u8, content: &[u8], offset: usize) {
        let record = self.records.entry(record_number).or_insert_with(Vec::new);
        if record.len() < offset + content.len() {
            record.resize(offset + content.len(), 0);
        }
        record[offset..offset + content.len()].copy_from_slice(content);
    }

    /// Insert the new most-recent record of a cyclic file, shifting the
    /// existing records towards higher numbers
    pub(crate) fn add_cyclic_content(&mut self, records_number: u8, content: Vec<u8>) {
        let mut shifted = BTreeMap::new();
        for (number, record) in self.records.iter() {
            if *number < records_number {
                shifted.insert(number + 1, record.clone());
            }
        }
        shifted.insert(1, content);
        self.records = shifted;
    }

    /// Set the value of counter `number` (1-based)
    pub(crate) fn set_counter(&mut self, number: u8, value: u32) {
        debug_assert!(number > 0);
        let mut bytes = [0u8; COUNTER_SIZE];
        BigEndian::write_u24(&mut bytes, value);
        self.fill_content(1, &bytes, (number as usize - 1) * COUNTER_SIZE);
    }
}

/// An elementary file: SFI, header, content
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ElementaryFile {
    sfi: u8,
    header: Option<FileHeader>,
    data: FileData,
}

impl ElementaryFile {
    pub(crate) fn new(sfi: u8) -> Self {
        Self {
            sfi,
            header: None,
            data: FileData::default(),
        }
    }

    /// Short file identifier (0 when the file is only known by LID)
    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    /// File metadata, if observed
    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// Observed content
    pub fn data(&self) -> &FileData {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut FileData {
        &mut self.data
    }

    pub(crate) fn set_header(&mut self, header: FileHeader) {
        self.header = Some(header);
    }

    /// Synthesize a minimal header on first content observation
    pub(crate) fn header_or_synthesize(&mut self, record_size: u8) -> &FileHeader {
        if self.header.is_none() {
            self.header = Some(FileHeader::synthesize(record_size));
        }
        self.header.as_ref().expect("header just synthesized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_content_extends_and_preserves() {
        let mut data = FileData::default();
        data.set_content(1, vec![0x11, 0x22, 0x33]);
        data.fill_content(1, &[0xAA, 0xBB], 4);
        assert_eq!(data.content(1).unwrap(), &[0x11, 0x22, 0x33, 0x00, 0xAA, 0xBB]);
        data.fill_content(1, &[0x99], 1);
        assert_eq!(data.content(1).unwrap(), &[0x11, 0x99, 0x33, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn counters_live_in_record_one() {
        let mut data = FileData::default();
        data.set_counter(2, 0x0101);
        assert_eq!(data.counter(1), Some(0));
        assert_eq!(data.counter(2), Some(0x0101));
        assert_eq!(data.counter(3), None);
        assert_eq!(data.all_counters().len(), 2);
    }

    #[test]
    fn cyclic_append_shifts_records() {
        let mut data = FileData::default();
        data.add_cyclic_content(3, vec![1]);
        data.add_cyclic_content(3, vec![2]);
        data.add_cyclic_content(3, vec![3]);
        data.add_cyclic_content(3, vec![4]);
        assert_eq!(data.content(1).unwrap(), &[4]);
        assert_eq!(data.content(2).unwrap(), &[3]);
        assert_eq!(data.content(3).unwrap(), &[2]);
        assert_eq!(data.content(4), None);
    }

    #[test]
    fn file_type_bytes_round_trip() {
        for ty in &[
            FileType::Linear,
            FileType::Binary,
            FileType::Cyclic,
            FileType::Counters,
            FileType::SimulatedCounters,
        ] {
            assert_eq!(FileType::from_u8(ty.to_u8()), Some(*ty));
        }
        assert_eq!(FileType::from_u8(0x55), None);
    }
}
