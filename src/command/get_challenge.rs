//! Get Challenge: fetch the 8-byte card challenge used to cipher PIN
//! blocks and key cryptograms.

use apdu::{ApduRequest, ApduResponse};
use card::CalypsoCard;
use command::{build_apdu, expect_success, CardCommandError, CardCommandErrorKind};

const INS: u8 = 0x84;
const NAME: &str = "Get Challenge";

/// Length of the card challenge
pub(crate) const CHALLENGE_LENGTH: usize = 8;

#[derive(Clone, Debug)]
pub(crate) struct GetChallengeCmd {
    request: ApduRequest,
}

impl GetChallengeCmd {
    pub fn new(card: &CalypsoCard) -> Self {
        let apdu = build_apdu(
            card.card_class(),
            INS,
            0x00,
            0x00,
            None,
            Some(CHALLENGE_LENGTH as u8),
        );
        Self {
            request: ApduRequest::new(apdu).with_info(NAME),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(
        &self,
        card: &mut CalypsoCard,
        response: &ApduResponse,
    ) -> Result<(), CardCommandError> {
        expect_success(NAME, response)?;
        let data = response.data_out();
        ensure!(
            data.len() == CHALLENGE_LENGTH,
            CardCommandErrorKind::Parsing,
            "{}: expected an {}-byte challenge, got {} bytes",
            NAME,
            CHALLENGE_LENGTH,
            data.len()
        );
        card.set_challenge(data);
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
            StartupInfo::from_bytes(&[0x06, 0x25, 0x09, 0x02, 0x00, 0x03, 0x01]).unwrap(),
        )
    }

    #[test]
    fn challenge_is_retained() {
        let mut card = card();
        let cmd = GetChallengeCmd::new(&card);
        assert_eq!(cmd.request().apdu(), &[0x00, 0x84, 0x00, 0x00, 0x08]);
        cmd.parse(
            &mut card,
            &ApduResponse::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 0x90, 0x00]),
        ).unwrap();
        assert_eq!(card.card_challenge().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn short_challenge_is_rejected() {
        let mut card = card();
        let cmd = GetChallengeCmd::new(&card);
        let err = cmd
            .parse(&mut card, &ApduResponse::new(vec![1, 2, 3, 0x90, 0x00]))
            .unwrap_err();
        assert_eq!(err.kind(), CardCommandErrorKind::Parsing);
    }
}
