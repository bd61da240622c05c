//! Search Record Multiple: find records matching a masked pattern
//! (revision 3 only).

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::CalypsoCard;
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind};

const INS: u8 = 0xA2;
const NAME: &str = "Search Record Multiple";

/// Input and output of a record search
///
/// Build the criteria, hand the struct to
/// `prepare_search_records`, then collect the matching record numbers
/// from the transaction manager once the search has been processed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchCommandData {
    /// SFI of the file to search
    pub sfi: u8,

    /// First record to inspect (1-based)
    pub start_record: u8,

    /// Offset of the compared range inside each record
    pub offset: u8,

    /// Pattern compared against the record bytes at `offset`
    pub search_data: Vec<u8>,

    /// Bit mask applied before comparison; empty means all bits
    pub mask: Vec<u8>,

    /// Also fetch the content of the first matching record
    pub fetch_first_matching_result: bool,

    /// Record numbers reported by the card, filled at parse time
    pub matching_record_numbers: Vec<u8>,
}

impl SearchCommandData {
    /// Start building search criteria for a file
    pub fn new(sfi: u8) -> Self {
        Self {
            sfi,
            start_record: 1,
            ..Default::default()
        }
    }

    /// First record to inspect
    pub fn start_at_record(mut self, record_number: u8) -> Self {
        self.start_record = record_number;
        self
    }

    /// Offset of the compared range
    pub fn at_offset(mut self, offset: u8) -> Self {
        self.offset = offset;
        self
    }

    /// Pattern to search for
    pub fn matching(mut self, search_data: &[u8]) -> Self {
        self.search_data = search_data.to_vec();
        self
    }

    /// Bit mask applied before comparison
    pub fn with_mask(mut self, mask: &[u8]) -> Self {
        self.mask = mask.to_vec();
        self
    }

    /// Also fetch the first matching record's content
    pub fn fetching_first_matching_result(mut self) -> Self {
        self.fetch_first_matching_result = true;
        self
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SearchRecordMultipleCmd {
    request: ApduRequest,
    data: SearchCommandData,
}

impl SearchRecordMultipleCmd {
    pub fn new(card: &CalypsoCard, data: SearchCommandData) -> Self {
        let mut data_in = Vec::with_capacity(2 + 2 * data.search_data.len());
        data_in.push(data.offset);
        data_in.push(data.search_data.len() as u8);
        data_in.extend_from_slice(&data.search_data);
        if data.mask.is_empty() {
            data_in.extend(::std::iter::repeat(0xFF).take(data.search_data.len()));
        } else {
            data_in.extend_from_slice(&data.mask);
        }
        let apdu = build_apdu(
            card.card_class(),
            INS,
            data.start_record,
            data.sfi << 3 | 0x07,
            Some(&data_in),
            Some(0),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
            data,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// Criteria plus the record numbers collected at parse time
    pub fn search_data(&self) -> &SearchCommandData {
        &self.data
    }

    pub fn parse(
        &mut self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        let sw = response.status_word();
        if sw != SW_OK {
            return Err(common_status(NAME, sw));
        }
        let data = response.data_out();
        ensure!(
            !data.is_empty(),
            CardCommandErrorKind::Parsing,
            "{}: empty response",
            NAME
        );
        let count = data[0] as usize;
        ensure!(
            data.len() >= 1 + count,
            CardCommandErrorKind::Parsing,
            "{}: match list truncated",
            NAME
        );
        self.data.matching_record_numbers = data[1..1 + count].to_vec();
        if self.data.fetch_first_matching_result && data.len() > 1 + count {
            if let Some(first) = self.data.matching_record_numbers.first() {
                card.set_record_content(self.data.sfi, *first, &data[1 + count..]);
            }
        }
        Ok(())
    }
}
