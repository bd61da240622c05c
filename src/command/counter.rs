//! Increase/Decrease and their multi-counter variants.
//!
//! The card answers with the new counter value, except on products where
//! the value is postponed: there the in-session status is `6200` and the
//! value arrives through the Close Session postponed data list.

use byteorder::{BigEndian, ByteOrder};

use apdu::{ApduRequest, ApduResponse, SW_OK};
use card::{CalypsoCard, COUNTER_SIZE};
use command::{build_apdu, common_status, CardCommandError, CardCommandErrorKind, SW_POSTPONED};

const INS_INCREASE: u8 = 0x32;
const INS_DECREASE: u8 = 0x30;
const INS_INCREASE_MULTIPLE: u8 = 0x3A;
const INS_DECREASE_MULTIPLE: u8 = 0x38;

/// Direction of the counter change
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CounterOperation {
    Increase,
    Decrease,
}

impl CounterOperation {
    fn apply(self, current: u32, delta: u32) -> u32 {
        match self {
            CounterOperation::Increase => current.wrapping_add(delta) & 0x00FF_FFFF,
            CounterOperation::Decrease => current.wrapping_sub(delta) & 0x00FF_FFFF,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CounterCmd {
    request: ApduRequest,
    operation: CounterOperation,
    sfi: u8,
    counter_number: u8,
    delta: u32,
}

impl CounterCmd {
    pub fn new(
        card: &CalypsoCard,
        operation: CounterOperation,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Self {
        let ins = match operation {
            CounterOperation::Increase => INS_INCREASE,
            CounterOperation::Decrease => INS_DECREASE,
        };
        let mut value = [0u8; COUNTER_SIZE];
        BigEndian::write_u24(&mut value, delta);
        let apdu = build_apdu(card.card_class(), ins, counter_number, sfi << 3, Some(&value), Some(0));
        let mut request = ApduRequest::new(apdu).with_info(match operation {
            CounterOperation::Increase => "Increase",
            CounterOperation::Decrease => "Decrease",
        });
        if card.is_counter_value_postponed() {
            request = request.with_successful_status_word(SW_POSTPONED);
        }
        Self {
            request,
            operation,
            sfi,
            counter_number,
            delta,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn name(&self) -> &'static str {
        self.request.info()
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn counter_number(&self) -> u8 {
        self.counter_number
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        match response.status_word() {
            SW_OK => {
                let data = response.data_out();
                ensure!(
                    data.len() == COUNTER_SIZE,
                    CardCommandErrorKind::Parsing,
                    "{}: expected a 3-byte counter value, got {} bytes",
                    self.name(),
                    data.len()
                );
                card.set_counter(self.sfi, self.counter_number, BigEndian::read_u24(data));
                Ok(())
            }
            // value postponed to the Close Session response
            SW_POSTPONED => Ok(()),
            sw => Err(common_status(self.name(), sw)),
        }
    }

    /// Expected response, computed from the current image value
    pub fn anticipated_response(&self, card: &CalypsoCard) -> Result<ApduResponse, CardCommandError> {
        if card.is_counter_value_postponed() {
            return Ok(ApduResponse::from_data_and_status(&[], SW_POSTPONED));
        }
        let new_value = self.anticipated_value(card)?;
        let mut bytes = [0u8; COUNTER_SIZE];
        BigEndian::write_u24(&mut bytes, new_value);
        Ok(ApduResponse::from_data_and_status(&bytes, SW_OK))
    }

    fn anticipated_value(&self, card: &CalypsoCard) -> Result<u32, CardCommandError> {
        let current = card.get_counter(self.sfi, self.counter_number).ok_or_else(|| {
            err!(
                CardCommandErrorKind::Anticipation,
                "unknown value for counter {} of SFI {:02X}h, read it before {}",
                self.counter_number,
                self.sfi,
                self.name()
            )
        })?;
        Ok(self.operation.apply(current, self.delta))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CounterMultipleCmd {
    request: ApduRequest,
    operation: CounterOperation,
    sfi: u8,
    deltas: Vec<(u8, u32)>,
}

impl CounterMultipleCmd {
    /// Change several counters of the same file in one command;
    /// `deltas` holds `(counter number, delta)` pairs
    pub fn new(
        card: &CalypsoCard,
        operation: CounterOperation,
        sfi: u8,
        deltas: Vec<(u8, u32)>,
    ) -> Self {
        let ins = match operation {
            CounterOperation::Increase => INS_INCREASE_MULTIPLE,
            CounterOperation::Decrease => INS_DECREASE_MULTIPLE,
        };
        let mut data = Vec::with_capacity(deltas.len() * 4);
        for &(number, delta) in &deltas {
            data.push(number);
            let mut value = [0u8; COUNTER_SIZE];
            BigEndian::write_u24(&mut value, delta);
            data.extend_from_slice(&value);
        }
        let apdu = build_apdu(card.card_class(), ins, 0, sfi << 3, Some(&data), Some(0));
        Self {
            request: ApduRequest::new(apdu).with_info(match operation {
                CounterOperation::Increase => "Increase Multiple",
                CounterOperation::Decrease => "Decrease Multiple",
            }),
            operation,
            sfi,
            deltas,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn name(&self) -> &'static str {
        self.request.info()
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        let sw = response.status_word();
        if sw != SW_OK {
            return Err(common_status(self.name(), sw));
        }
        let data = response.data_out();
        ensure!(
            data.len() % 4 == 0,
            CardCommandErrorKind::Parsing,
            "{}: malformed counter list",
            self.name()
        );
        for chunk in data.chunks(4) {
            card.set_counter(self.sfi, chunk[0], BigEndian::read_u24(&chunk[1..4]));
        }
        Ok(())
    }

    /// Expected response: one `(number, new value)` entry per counter
    pub fn anticipated_response(&self, card: &CalypsoCard) -> Result<ApduResponse, CardCommandError> {
        let mut data = Vec::with_capacity(self.deltas.len() * 4);
        for &(number, delta) in &self.deltas {
            let current = card.get_counter(self.sfi, number).ok_or_else(|| {
                err!(
                    CardCommandErrorKind::Anticipation,
                    "unknown value for counter {} of SFI {:02X}h, read it before {}",
                    number,
                    self.sfi,
                    self.name()
                )
            })?;
            data.push(number);
            let mut value = [0u8; COUNTER_SIZE];
            BigEndian::write_u24(&mut value, self.operation.apply(current, delta));
            data.extend_from_slice(&value);
        }
        Ok(ApduResponse::from_data_and_status(&data, SW_OK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};

    fn card(application_type: u8) -> CalypsoCard {
        CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, application_type, 0x02, 0x00, 0x03, 0x01])
                .unwrap(),
        )
    }

    #[test]
    fn increase_apdu() {
        let cmd = CounterCmd::new(&card(0x08), CounterOperation::Increase, 0x19, 1, 0x0102);
        assert_eq!(
            cmd.request().apdu(),
            &[0x00, 0x32, 0x01, 0xC8, 0x03, 0x00, 0x01, 0x02, 0x00]
        );
    }

    #[test]
    fn immediate_value_updates_image() {
        let mut card = card(0x08);
        let cmd = CounterCmd::new(&card, CounterOperation::Decrease, 0x19, 2, 1);
        cmd.parse(&mut card, &ApduResponse::new(vec![0x00, 0x00, 0x09, 0x90, 0x00]))
            .unwrap();
        assert_eq!(card.get_counter(0x19, 2), Some(9));
    }

    #[test]
    fn anticipation_needs_a_known_value() {
        let mut card = card(0x08);
        let cmd = CounterCmd::new(&card, CounterOperation::Increase, 0x19, 1, 5);
        assert_eq!(
            cmd.anticipated_response(&card).unwrap_err().kind(),
            CardCommandErrorKind::Anticipation
        );
        card.set_counter(0x19, 1, 10);
        let response = cmd.anticipated_response(&card).unwrap();
        assert_eq!(response.bytes(), &[0x00, 0x00, 0x0F, 0x90, 0x00]);
    }

    #[test]
    fn postponed_product_expects_6200() {
        let mut card = card(0x08 | 0x04);
        card.set_counter(0x19, 1, 10);
        let cmd = CounterCmd::new(&card, CounterOperation::Increase, 0x19, 1, 5);
        assert!(cmd.request().is_status_successful(0x6200));
        let response = cmd.anticipated_response(&card).unwrap();
        assert_eq!(response.bytes(), &[0x62, 0x00]);
        // a 6200 leaves the image untouched until close
        cmd.parse(&mut card, &ApduResponse::new(vec![0x62, 0x00])).unwrap();
        assert_eq!(card.get_counter(0x19, 1), Some(10));
    }

    #[test]
    fn multiple_counters_round_trip() {
        let mut card = card(0x08);
        card.set_counter(0x19, 1, 10);
        card.set_counter(0x19, 2, 20);
        let cmd = CounterMultipleCmd::new(
            &card,
            CounterOperation::Increase,
            0x19,
            vec![(1, 1), (2, 2)],
        );
        let anticipated = cmd.anticipated_response(&card).unwrap();
        assert_eq!(
            anticipated.bytes(),
            &[0x01, 0x00, 0x00, 0x0B, 0x02, 0x00, 0x00, 0x16, 0x90, 0x00]
        );
        cmd.parse(&mut card, &anticipated).unwrap();
        assert_eq!(card.get_counter(0x19, 1), Some(11));
        assert_eq!(card.get_counter(0x19, 2), Some(22));
    }
}
