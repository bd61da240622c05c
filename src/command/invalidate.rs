//! Invalidate and Rehabilitate: toggle the DF life-cycle status.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::{build_apdu, expect_success, CardCommandError};

const INS_INVALIDATE: u8 = 0x04;
const INS_REHABILITATE: u8 = 0x44;

#[derive(Clone, Debug)]
pub(crate) struct InvalidateCmd {
    request: ApduRequest,
    rehabilitate: bool,
}

impl InvalidateCmd {
    pub fn invalidate(card: &CalypsoCard) -> Self {
        Self::build(card, false)
    }

    pub fn rehabilitate(card: &CalypsoCard) -> Self {
        Self::build(card, true)
    }

    fn build(card: &CalypsoCard, rehabilitate: bool) -> Self {
        let ins = if rehabilitate {
            INS_REHABILITATE
        } else {
            INS_INVALIDATE
        };
        let apdu = build_apdu(card.card_class(), ins, 0, 0, None, None);
        Self {
            request: ApduRequest::new(apdu).with_info(if rehabilitate {
                "Rehabilitate"
            } else {
                "Invalidate"
            }),
            rehabilitate,
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
        expect_success(self.name(), response)?;
        card.set_df_invalidated(!self.rehabilitate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card::{CalypsoCard, ProductType, StartupInfo};

    fn card() -> CalypsoCard {
        CalypsoCard::new(
            ProductType::PrimeRevision3,
            vec![],
            vec![0u8; 8],
            StartupInfo::from_bytes(&[0x06, 0x25, 0x08, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn life_cycle_round_trip() {
        let mut card = card();
        let invalidate = InvalidateCmd::invalidate(&card);
        assert_eq!(invalidate.request().apdu(), &[0x00, 0x04, 0x00, 0x00]);
        invalidate
            .parse(&mut card, &ApduResponse::new(vec![0x90, 0x00]))
            .unwrap();
        assert!(card.is_df_invalidated());

        let rehabilitate = InvalidateCmd::rehabilitate(&card);
        assert_eq!(rehabilitate.request().apdu(), &[0x00, 0x44, 0x00, 0x00]);
        rehabilitate
            .parse(&mut card, &ApduResponse::new(vec![0x90, 0x00]))
            .unwrap();
        assert!(!card.is_df_invalidated());
    }
}
