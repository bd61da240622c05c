//! The transaction manager: batches prepared commands and drives the
//! card through them, in or out of a Secure Session.
//!
//! The manager owns the card image for the duration of the transaction.
//! Commands are queued by the `prepare_*` methods and flushed by the
//! `process_*` methods; a Secure Session adds the running MAC fed with
//! every exchanged APDU (request then response, in wire order, the Open
//! Session pair excluded) and the buffer accounting that splits the work
//! across consecutive sessions when the card's modifications buffer
//! would overflow.

mod error;
mod settings;

pub use self::error::{TransactionError, TransactionErrorKind};
pub use self::settings::{
    AccessLevel, GetDataTag, PinTransmissionMode, RatificationMode, SecuritySetting,
    SelectFileControl, SessionModificationMode, SvAction, SvOperation,
};

use zeroize::Zeroize;

use apdu::{to_hex, ApduRequest, ApduResponse, CardRequest, ChannelControl};
use card::{CalypsoCard, ProductType};
use command::change_key::ChangeKeyCmd;
use command::change_pin::ChangePinCmd;
use command::close_session::CloseSessionCmd;
use command::counter::{CounterCmd, CounterMultipleCmd, CounterOperation};
use command::get_challenge::GetChallengeCmd;
use command::get_data::GetDataCmd;
use command::invalidate::InvalidateCmd;
use command::open_session::OpenSessionCmd;
use command::ratification;
use command::read_binary::ReadBinaryCmd;
use command::read_record_multiple::ReadRecordMultipleCmd;
use command::read_records::ReadRecordsCmd;
use command::search_record_multiple::{SearchCommandData, SearchRecordMultipleCmd};
use command::select_file::SelectFileCmd;
use command::sv_debit::{SvDebitCmd, SvDebitMode};
use command::sv_get::SvGetCmd;
use command::sv_reload::SvReloadCmd;
use command::verify_pin::VerifyPinCmd;
use command::write_binary::{WriteBinaryCmd, WriteBinaryMode};
use command::write_records::{AppendRecordCmd, WriteRecordCmd, WriteRecordMode};
use command::{CardCommand, CardCommandError, CardCommandErrorKind, PostponedData};
use crypto::{CryptoDriver, CryptoError, CryptoErrorKind, SvCommandSecurityData};
use error::Error;
use reader::{CardReader, ReaderErrorKind};

use byteorder::{BigEndian, ByteOrder};

/// Highest SFI addressable in P1/P2 encodings
const SFI_MAX: u8 = 30;

/// Highest record number accepted by the record commands
const RECORD_NUMBER_MAX: u8 = 250;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SessionState {
    Idle,
    SessionOpen,
}

/// The transaction handle
///
/// All methods are fluent (`-> Result<&mut Self, _>`); the card reader is
/// owned exclusively for the transaction's lifetime and every call is
/// synchronous.
pub struct CardTransactionManager<R: CardReader> {
    reader: R,
    card: CalypsoCard,
    setting: SecuritySetting,
    crypto: Option<Box<dyn CryptoDriver>>,

    commands: Vec<CardCommand>,
    state: SessionState,
    write_access_level: Option<AccessLevel>,
    session_extended: bool,

    /// Remaining budget of the session being planned by `prepare_*`
    planning_counter: i32,

    /// Remaining budget of the session currently open on the card
    session_budget: i32,

    sv_operation: Option<SvOperation>,
    sv_action: SvAction,
    sv_command_prepared: bool,

    channel_release_requested: bool,
    search_results: Vec<SearchCommandData>,
    audit_data: Vec<String>,
}

impl<R: CardReader> CardTransactionManager<R> {
    /// Start a transaction without cryptographic services: out-of-session
    /// commands only
    pub fn new(reader: R, card: CalypsoCard, setting: SecuritySetting) -> Self {
        let budget = card.modifications_counter();
        Self {
            reader,
            card,
            setting,
            crypto: None,
            commands: Vec::new(),
            state: SessionState::Idle,
            write_access_level: None,
            session_extended: false,
            planning_counter: budget,
            session_budget: budget,
            sv_operation: None,
            sv_action: SvAction::Do,
            sv_command_prepared: false,
            channel_release_requested: false,
            search_results: Vec::new(),
            audit_data: Vec::new(),
        }
    }

    /// Start a transaction backed by a crypto driver (Secure Sessions,
    /// encrypted PIN, SV certification, key management)
    pub fn with_crypto(
        reader: R,
        card: CalypsoCard,
        setting: SecuritySetting,
        crypto: Box<dyn CryptoDriver>,
    ) -> Self {
        let mut manager = Self::new(reader, card, setting);
        manager.crypto = Some(crypto);
        manager
    }

    /// The reader carrying this transaction
    pub fn card_reader(&self) -> &R {
        &self.reader
    }

    /// The card image accumulated so far
    pub fn calypso_card(&self) -> &CalypsoCard {
        &self.card
    }

    /// The security settings of this transaction
    pub fn security_setting(&self) -> &SecuritySetting {
        &self.setting
    }

    /// Results of the processed Search Record Multiple commands, in
    /// preparation order
    pub fn search_results(&self) -> &[SearchCommandData] {
        &self.search_results
    }

    /// Release the transaction and keep the final card image
    pub fn into_calypso_card(self) -> CalypsoCard {
        self.card
    }

    // -- error helpers ------------------------------------------------------

    fn audit_string(&self) -> String {
        self.audit_data.join(", ")
    }

    fn error(&self, kind: TransactionErrorKind, message: &str) -> TransactionError {
        if self.audit_data.is_empty() {
            Error::new(kind, Some(message.to_string()))
        } else {
            Error::new(
                kind,
                Some(format!("{}; audit: [{}]", message, self.audit_string())),
            )
        }
    }

    fn command_status_error(&self, name: &str, err: &CardCommandError) -> TransactionError {
        self.error(
            TransactionErrorKind::UnexpectedCommandStatus,
            &format!("{}: {}", name, err),
        )
    }

    // -- low-level transmission ---------------------------------------------

    fn record_audit(&mut self, requests: &[ApduRequest], responses: &[ApduResponse]) {
        for (index, request) in requests.iter().enumerate() {
            let entry = match responses.get(index) {
                Some(response) => {
                    format!("[{} -> {}]", to_hex(request.apdu()), to_hex(response.bytes()))
                }
                None => format!("[{} -> (no response)]", to_hex(request.apdu())),
            };
            trace!("exchange {}", entry);
            self.audit_data.push(entry);
        }
    }

    /// Transmit and return the collected responses; an unexpected status
    /// word is returned as a normal (partial) response list so the
    /// parsers produce the typed error
    fn transmit(
        &mut self,
        requests: Vec<ApduRequest>,
        stop_on_unsuccessful: bool,
        channel_control: ChannelControl,
    ) -> Result<Vec<ApduResponse>, TransactionError> {
        let expected = requests.len();
        let card_request = CardRequest::new(requests, stop_on_unsuccessful);
        debug!(
            "card request {}: {} APDU(s), channel {:?}",
            card_request.uuid,
            card_request.apdu_requests.len(),
            channel_control
        );
        let result = self
            .reader
            .transmit_card_request(&card_request, channel_control);
        let responses = match result {
            Ok(response) => {
                let responses = response.apdu_responses;
                self.record_audit(&card_request.apdu_requests, &responses);
                responses
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                let partial = err
                    .into_response()
                    .map(|r| r.apdu_responses)
                    .unwrap_or_else(Vec::new);
                self.record_audit(&card_request.apdu_requests, &partial);
                match kind {
                    ReaderErrorKind::UnexpectedStatusWord => partial,
                    ReaderErrorKind::CardIo => {
                        return Err(self.error(TransactionErrorKind::CardIo, &message))
                    }
                    ReaderErrorKind::ReaderIo => {
                        return Err(self.error(TransactionErrorKind::ReaderIo, &message))
                    }
                }
            }
        };
        if responses.len() > expected {
            return Err(self.error(
                TransactionErrorKind::InconsistentData,
                &format!(
                    "{} responses received for {} requests",
                    responses.len(),
                    expected
                ),
            ));
        }
        Ok(responses)
    }

    /// Closing transmission: a card I/O failure after the ratification
    /// probe was sent does not abort the close if only the probe's
    /// response is missing
    fn transmit_close(
        &mut self,
        requests: Vec<ApduRequest>,
        channel_control: ChannelControl,
        ratification_sent: bool,
    ) -> Result<Vec<ApduResponse>, TransactionError> {
        let expected = requests.len();
        let card_request = CardRequest::new(requests, true);
        debug!(
            "card request {} (closing): {} APDU(s)",
            card_request.uuid,
            card_request.apdu_requests.len()
        );
        match self
            .reader
            .transmit_card_request(&card_request, channel_control)
        {
            Ok(response) => {
                let responses = response.apdu_responses;
                self.record_audit(&card_request.apdu_requests, &responses);
                Ok(responses)
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                let partial = err
                    .into_response()
                    .map(|r| r.apdu_responses)
                    .unwrap_or_else(Vec::new);
                self.record_audit(&card_request.apdu_requests, &partial);
                match kind {
                    ReaderErrorKind::UnexpectedStatusWord => Ok(partial),
                    ReaderErrorKind::CardIo
                        if ratification_sent && partial.len() == expected - 1 =>
                    {
                        // the card left the field after ratifying
                        debug!("ratification response lost, session considered closed");
                        Ok(partial)
                    }
                    ReaderErrorKind::CardIo => {
                        Err(self.error(TransactionErrorKind::CardIo, &message))
                    }
                    ReaderErrorKind::ReaderIo => {
                        Err(self.error(TransactionErrorKind::ReaderIo, &message))
                    }
                }
            }
        }
    }

    // -- response correlation -----------------------------------------------

    fn is_best_effort_eligible(command: &CardCommand) -> bool {
        match *command {
            CardCommand::ReadRecords(_)
            | CardCommand::ReadRecordMultiple(_)
            | CardCommand::SearchRecordMultiple(_)
            | CardCommand::ReadBinary(_) => true,
            _ => false,
        }
    }

    /// Parse each response against its command, applying the best-effort
    /// rules, optionally feeding the session MAC with the wire bytes
    fn parse_batch(
        &mut self,
        commands: &mut [CardCommand],
        responses: &[ApduResponse],
        in_session: bool,
        feed_mac: bool,
    ) -> Result<(), TransactionError> {
        let audit = self.audit_string();
        if responses.len() > commands.len() {
            fail!(
                TransactionErrorKind::InconsistentData,
                "{} responses for {} commands; audit: [{}]",
                responses.len(),
                commands.len(),
                audit
            );
        }
        for (index, response) in responses.iter().enumerate() {
            let command = &mut commands[index];
            if feed_mac {
                if let Some(ref mut crypto) = self.crypto {
                    crypto
                        .update_terminal_session_mac(command.request().apdu())
                        .and_then(|_| crypto.update_terminal_session_mac(response.bytes()))
                        .map_err(|e| {
                            Error::new(
                                TransactionErrorKind::ReaderIo,
                                Some(format!("session MAC update: {}", e)),
                            )
                        })?;
                }
            }
            if let Err(err) = command.parse(&mut self.card, response) {
                let is_select = match *command {
                    CardCommand::SelectFile(_) => true,
                    _ => false,
                };
                if err.kind() == CardCommandErrorKind::DataAccess {
                    if is_select {
                        fail!(
                            TransactionErrorKind::SelectFile,
                            "{}; audit: [{}]",
                            err,
                            audit
                        );
                    }
                    if !in_session && Self::is_best_effort_eligible(command) {
                        warn!("best effort: {}", err);
                        continue;
                    }
                }
                fail!(
                    TransactionErrorKind::UnexpectedCommandStatus,
                    "{} (status word 0x{:04X}); audit: [{}]",
                    err,
                    response.status_word(),
                    audit
                );
            }
            if let CardCommand::SearchRecordMultiple(ref cmd) = *command {
                self.search_results.push(cmd.search_data().clone());
            }
        }
        if responses.len() < commands.len() {
            fail!(
                TransactionErrorKind::InconsistentData,
                "{} responses for {} commands; audit: [{}]",
                responses.len(),
                commands.len(),
                audit
            );
        }
        Ok(())
    }

    // -- session primitives -------------------------------------------------

    /// Open a session atomically, executing `commands` in the same card
    /// request as the Open Session APDU
    fn process_atomic_opening(
        &mut self,
        level: AccessLevel,
        mut commands: Vec<CardCommand>,
    ) -> Result<(), TransactionError> {
        ensure!(
            self.crypto.is_some(),
            TransactionErrorKind::IllegalState,
            "a secure session requires a crypto driver"
        );
        let serial = self.card.serial_number().to_vec();
        let audit = self.audit_string();
        let extended_wanted = self.card.is_extended_mode_supported();
        let (terminal_challenge, extended) = {
            let crypto = self.crypto.as_mut().expect("crypto checked above");
            crypto
                .set_default_key_diversifier(&serial)
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
            if !audit.is_empty() {
                crypto.set_transaction_audit_data(&audit);
            }
            let challenge = crypto
                .init_terminal_secure_session_context()
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
            let extended = extended_wanted && crypto.is_extended_mode_supported();
            if extended {
                crypto
                    .enable_card_extended_mode()
                    .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
            }
            (challenge, extended)
        };

        // fold a leading one-record read into the Open Session APDU;
        // P1/P2 leave 3 bits for the SFI and 5 for the record number
        let (sfi, record_number) = match commands.first().and_then(|c| c.as_single_record_read()) {
            Some((sfi, record_number)) if sfi <= 0x07 && record_number <= 0x1F => {
                commands.remove(0);
                (sfi, record_number)
            }
            _ => (0, 0),
        };

        let open_cmd = OpenSessionCmd::new(
            &self.card,
            level,
            &terminal_challenge,
            sfi,
            record_number,
            extended,
        );
        self.card.backup_files();

        let in_bytes = self.card.is_modifications_counter_in_bytes();
        let batch_cost: i32 = commands
            .iter()
            .map(|c| c.session_buffer_cost(in_bytes))
            .sum();

        let mut requests = Vec::with_capacity(1 + commands.len());
        requests.push(open_cmd.request().clone());
        requests.extend(commands.iter().map(|c| c.request().clone()));
        let responses = self.transmit(requests, true, ChannelControl::KeepOpen)?;
        if responses.is_empty() {
            return Err(self.error(
                TransactionErrorKind::InconsistentData,
                "no response to Open Secure Session",
            ));
        }

        let output = open_cmd
            .parse(&responses[0])
            .map_err(|e| self.command_status_error("Open Secure Session", &e))?;

        // the session is now open on the card
        self.state = SessionState::SessionOpen;
        self.write_access_level = Some(level);
        self.session_extended = extended;
        self.session_budget = self.card.modifications_counter() - batch_cost;

        self.card
            .set_df_ratified(output.previous_session_ratified);
        if record_number > 0 && !output.record_data.is_empty() {
            self.card
                .set_record_content(sfi, record_number, &output.record_data);
        }

        // resolve the effective session key
        let kvc = output.kvc.or_else(|| self.setting.default_kvc(level));
        let kif = match output.kif {
            Some(kif) => Some(kif),
            None => match kvc {
                Some(kvc) => self.setting.kif_for(level, kvc),
                None => self.setting.default_kif(level),
            },
        };
        let (kif, kvc) = match (kif, kvc) {
            (Some(kif), Some(kvc)) => (kif, kvc),
            _ => {
                return Err(self.error(
                    TransactionErrorKind::UnauthorizedKey,
                    "the session KIF/KVC could not be determined",
                ))
            }
        };
        if !self.setting.is_session_key_authorized(kif, kvc) {
            return Err(self.error(
                TransactionErrorKind::UnauthorizedKey,
                &format!("session key KIF 0x{:02X} / KVC 0x{:02X} not authorized", kif, kvc),
            ));
        }

        {
            let crypto = self.crypto.as_mut().expect("crypto checked above");
            crypto
                .init_terminal_session_mac(responses[0].data_out(), kif, kvc)
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
        }

        // the Open Session pair itself is excluded from the MAC stream
        self.parse_batch(&mut commands, &responses[1..], true, true)
    }

    /// Fill the SV security block of any queued SV Reload/Debit command
    fn finalize_sv_commands(
        &mut self,
        commands: &mut [CardCommand],
    ) -> Result<(), TransactionError> {
        for command in commands.iter_mut() {
            let partial = match *command {
                CardCommand::SvReload(ref cmd) => cmd.partial_request().to_vec(),
                CardCommand::SvDebit(ref cmd) => cmd.partial_request().to_vec(),
                _ => continue,
            };
            let header = match self.card.sv_get_header() {
                Some(header) => header.to_vec(),
                None => {
                    return Err(self.error(
                        TransactionErrorKind::IllegalState,
                        "SV Get must be executed before an SV modifying command",
                    ))
                }
            };
            let response = self
                .card
                .sv_get_data()
                .expect("SV Get response retained with its header")
                .to_vec();
            let mut data = SvCommandSecurityData::new(&header, &response, &partial);
            {
                let crypto = match self.crypto {
                    Some(ref mut crypto) => crypto,
                    None => {
                        return Err(Error::new(
                            TransactionErrorKind::IllegalState,
                            Some("SV operations require a crypto driver".to_string()),
                        ))
                    }
                };
                crypto
                    .generate_sv_command_security_data(&mut data)
                    .map_err(|e| {
                        Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string()))
                    })?;
            }
            let block = data.security_block();
            match *command {
                CardCommand::SvReload(ref mut cmd) => cmd.finalize(&block),
                CardCommand::SvDebit(ref mut cmd) => cmd.finalize(&block),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Transmit a batch inside or outside a session, without closing it
    fn process_atomic_card_commands(
        &mut self,
        mut commands: Vec<CardCommand>,
        channel_control: ChannelControl,
    ) -> Result<(), TransactionError> {
        if commands.is_empty() {
            return Ok(());
        }
        let in_session = self.state == SessionState::SessionOpen;
        self.finalize_sv_commands(&mut commands)?;
        let in_bytes = self.card.is_modifications_counter_in_bytes();
        let requests: Vec<ApduRequest> = commands.iter().map(|c| c.request().clone()).collect();
        let responses = self.transmit(requests, in_session, channel_control)?;
        if in_session {
            let batch_cost: i32 = commands
                .iter()
                .map(|c| c.session_buffer_cost(in_bytes))
                .sum();
            self.session_budget -= batch_cost;
        }
        self.parse_batch(&mut commands, &responses, in_session, in_session)?;
        if !in_session {
            self.verify_out_of_session_sv(&commands, &responses)?;
        }
        Ok(())
    }

    /// Out of session, the SV MAC arrives with the SV command response
    /// and is checked immediately
    fn verify_out_of_session_sv(
        &mut self,
        commands: &[CardCommand],
        responses: &[ApduResponse],
    ) -> Result<(), TransactionError> {
        for (command, response) in commands.iter().zip(responses.iter()) {
            let is_sv = match *command {
                CardCommand::SvReload(_) | CardCommand::SvDebit(_) => true,
                _ => false,
            };
            if !is_sv {
                continue;
            }
            let sv_mac = response.data_out().to_vec();
            let result = match self.crypto {
                Some(ref mut crypto) => crypto.verify_card_sv_mac(&sv_mac),
                None => continue,
            };
            result.map_err(|e| self.map_signature_error(e, "SV MAC verification"))?;
        }
        Ok(())
    }

    fn map_signature_error(&self, err: CryptoError, context: &str) -> TransactionError {
        match err.kind() {
            CryptoErrorKind::Io => self.error(
                TransactionErrorKind::CardSignatureNotVerifiable,
                &format!("{}: {}", context, err),
            ),
            _ => self.error(
                TransactionErrorKind::UnexpectedCommandStatus,
                &format!("{}: {}", context, err),
            ),
        }
    }

    /// Close the session atomically: the modifying `commands` travel in
    /// the same card request as the Close Session APDU, so their
    /// responses are anticipated and fed to the MAC beforehand
    fn process_atomic_closing(
        &mut self,
        mut commands: Vec<CardCommand>,
        ratify: bool,
        explicit_ratification: bool,
        channel_control: ChannelControl,
    ) -> Result<(), TransactionError> {
        self.finalize_sv_commands(&mut commands)?;

        let terminal_mac = {
            let card = &self.card;
            let crypto = match self.crypto {
                Some(ref mut crypto) => crypto,
                None => {
                    return Err(Error::new(
                        TransactionErrorKind::IllegalState,
                        Some("no crypto driver".to_string()),
                    ))
                }
            };
            for command in &commands {
                let anticipated = command.anticipated_response(card).map_err(|e| {
                    Error::new(TransactionErrorKind::IllegalState, Some(e.to_string()))
                })?;
                crypto
                    .update_terminal_session_mac(command.request().apdu())
                    .and_then(|_| crypto.update_terminal_session_mac(anticipated.bytes()))
                    .map_err(|e| {
                        Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string()))
                    })?;
            }
            crypto
                .finalize_terminal_session_mac()
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?
        };

        let close_cmd = CloseSessionCmd::new(
            self.card.card_class(),
            ratify,
            &terminal_mac,
            self.session_extended,
        );
        let mut requests: Vec<ApduRequest> =
            commands.iter().map(|c| c.request().clone()).collect();
        requests.push(close_cmd.request().clone());
        if explicit_ratification {
            requests.push(ratification::request(self.card.card_class()));
        }
        let expected = requests.len();

        let mut responses = self.transmit_close(requests, channel_control, explicit_ratification)?;
        if explicit_ratification && responses.len() == expected {
            // the ratification probe's response carries no data of interest
            responses.pop();
        }
        if responses.len() != commands.len() + 1 {
            return Err(self.error(
                TransactionErrorKind::InconsistentData,
                &format!(
                    "{} responses for {} closing commands",
                    responses.len(),
                    commands.len() + 1
                ),
            ));
        }
        let close_response = responses.pop().expect("length checked above");
        self.parse_batch(&mut commands, &responses, true, false)?;

        let output = close_cmd
            .parse(&close_response)
            .map_err(|e| self.command_status_error("Close Secure Session", &e))?;

        self.state = SessionState::Idle;
        self.session_budget = self.card.modifications_counter();
        if ratify || explicit_ratification {
            self.card.set_df_ratified(true);
        }

        {
            let result = self
                .crypto
                .as_mut()
                .expect("crypto checked above")
                .verify_card_session_mac(&output.card_mac);
            result.map_err(|e| self.map_signature_error(e, "card session MAC"))?;
        }

        // pair postponed items with the commands that produced them
        let mut item_index = 0;
        for command in &commands {
            let postponed = match command.postponed_data(&self.card) {
                Some(postponed) => postponed,
                None => continue,
            };
            let item = match output.postponed_data.get(item_index) {
                Some(item) => item.clone(),
                None => {
                    return Err(self.error(
                        TransactionErrorKind::InconsistentData,
                        "missing postponed data in the Close Session response",
                    ))
                }
            };
            item_index += 1;
            match postponed {
                PostponedData::Counter { sfi, number } => {
                    if item.len() < 3 {
                        return Err(self.error(
                            TransactionErrorKind::InconsistentData,
                            "malformed postponed counter value",
                        ));
                    }
                    self.card
                        .set_counter(sfi, number, BigEndian::read_u24(&item[..3]));
                }
                PostponedData::Sv => {
                    let result = self
                        .crypto
                        .as_mut()
                        .expect("crypto checked above")
                        .verify_card_sv_mac(&item);
                    result.map_err(|e| self.map_signature_error(e, "SV MAC verification"))?;
                    let delta = match *command {
                        CardCommand::SvReload(ref cmd) => cmd.amount(),
                        CardCommand::SvDebit(ref cmd) => cmd.balance_delta(),
                        _ => 0,
                    };
                    self.card.update_sv_balance(delta);
                }
            }
        }

        self.card.discard_backup();
        Ok(())
    }

    /// Close the open session around `batch` and open a continuation
    /// session (multi-session split point)
    fn flush_session_with_close(&mut self, batch: Vec<CardCommand>) -> Result<(), TransactionError> {
        let (writes, reads): (Vec<CardCommand>, Vec<CardCommand>) =
            batch.into_iter().partition(|c| c.is_session_buffer_used());
        self.process_atomic_card_commands(reads, ChannelControl::KeepOpen)?;
        self.process_atomic_closing(writes, false, false, ChannelControl::KeepOpen)?;
        let level = match self.write_access_level {
            Some(level) => level,
            None => {
                return Err(self.error(
                    TransactionErrorKind::IllegalState,
                    "no access level for the continuation session",
                ))
            }
        };
        debug!("session buffer exhausted, opening a continuation session");
        self.process_atomic_opening(level, Vec::new())
    }

    fn channel_control(&self) -> ChannelControl {
        if self.channel_release_requested {
            ChannelControl::CloseAfter
        } else {
            ChannelControl::KeepOpen
        }
    }

    /// Abort the session and restore the image; errors are logged and
    /// swallowed
    fn abort_silently(&mut self) {
        if self.state != SessionState::SessionOpen {
            return;
        }
        warn!("aborting the secure session after a processing error");
        self.card.restore_files();
        let abort = CloseSessionCmd::abort(self.card.card_class());
        if let Err(err) = self.transmit(
            vec![abort.request().clone()],
            false,
            ChannelControl::KeepOpen,
        ) {
            warn!("session abort failed: {}", err);
        }
        self.state = SessionState::Idle;
        self.session_budget = self.card.modifications_counter();
        self.planning_counter = self.card.modifications_counter();
        self.write_access_level = None;
        self.sv_command_prepared = false;
        self.commands.clear();
    }

    fn guard<F>(&mut self, body: F) -> Result<&mut Self, TransactionError>
    where
        F: FnOnce(&mut Self) -> Result<(), TransactionError>,
    {
        match body(self) {
            Ok(()) => Ok(self),
            Err(err) => {
                self.abort_silently();
                Err(err)
            }
        }
    }

    // -- buffer planning ----------------------------------------------------

    /// Account for a modifying command at preparation time; in atomic
    /// mode an overflow fails before anything is transmitted
    fn plan_modifying_command(&mut self, command: &CardCommand) -> Result<(), TransactionError> {
        let in_bytes = self.card.is_modifications_counter_in_bytes();
        let cost = command.session_buffer_cost(in_bytes);
        let max = self.card.modifications_counter();
        ensure!(
            cost <= max,
            TransactionErrorKind::SessionBufferOverflow,
            "{} alone exceeds the session buffer ({} > {})",
            command.name(),
            cost,
            max
        );
        if self.planning_counter - cost < 0 {
            match self.setting.session_modification_mode() {
                SessionModificationMode::Atomic => fail!(
                    TransactionErrorKind::SessionBufferOverflow,
                    "{} overflows the session buffer (cost {}, remaining {})",
                    command.name(),
                    cost,
                    self.planning_counter
                ),
                SessionModificationMode::Multiple => {
                    self.planning_counter = max - cost;
                }
            }
        } else {
            self.planning_counter -= cost;
        }
        Ok(())
    }

    fn push(&mut self, command: CardCommand) -> Result<&mut Self, TransactionError> {
        if command.is_session_buffer_used() {
            self.plan_modifying_command(&command)?;
        }
        self.commands.push(command);
        Ok(self)
    }

    // -- argument validation ------------------------------------------------

    fn check_sfi(&self, sfi: u8) -> Result<(), TransactionError> {
        ensure!(
            sfi >= 1 && sfi <= SFI_MAX,
            TransactionErrorKind::IllegalArgument,
            "SFI {:02X}h out of range [1..{}]",
            sfi,
            SFI_MAX
        );
        Ok(())
    }

    fn check_record_number(&self, record_number: u8) -> Result<(), TransactionError> {
        ensure!(
            record_number >= 1 && record_number <= RECORD_NUMBER_MAX,
            TransactionErrorKind::IllegalArgument,
            "record number {} out of range [1..{}]",
            record_number,
            RECORD_NUMBER_MAX
        );
        Ok(())
    }

    // -- prepare: reads -----------------------------------------------------

    /// Queue the read of one record
    pub fn prepare_read_record(
        &mut self,
        sfi: u8,
        record_number: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_record_number(record_number)?;
        let record_size = self
            .card
            .get_file_by_sfi(sfi)
            .and_then(|f| f.header())
            .map(|h| h.record_size)
            .unwrap_or(0);
        let cmd = ReadRecordsCmd::one_record(&self.card, sfi, record_number, record_size);
        self.push(CardCommand::ReadRecords(cmd))
    }

    /// Queue the read of a record range, batched into as few APDUs as
    /// the product allows
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        from_record: u8,
        to_record: u8,
        record_size: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_record_number(from_record)?;
        self.check_record_number(to_record)?;
        ensure!(
            from_record <= to_record,
            TransactionErrorKind::IllegalArgument,
            "record range {}..{} is reversed",
            from_record,
            to_record
        );
        if from_record == to_record {
            let cmd = ReadRecordsCmd::one_record(&self.card, sfi, from_record, record_size);
            return self.push(CardCommand::ReadRecords(cmd));
        }
        let multiple_supported = match self.card.product_type() {
            ProductType::PrimeRevision3 | ProductType::Light => true,
            _ => false,
        };
        if !multiple_supported {
            for record_number in from_record..=to_record {
                let cmd = ReadRecordsCmd::one_record(&self.card, sfi, record_number, record_size);
                self.push(CardCommand::ReadRecords(cmd))?;
            }
            return Ok(self);
        }
        ensure!(
            record_size > 0,
            TransactionErrorKind::IllegalArgument,
            "record size is required to batch a multiple-record read"
        );
        let per_apdu = (self.card.payload_capacity() / (record_size as usize + 2)).max(1) as u8;
        let mut current = from_record;
        while current <= to_record {
            let remaining = to_record - current + 1;
            if remaining == 1 {
                let cmd = ReadRecordsCmd::one_record(&self.card, sfi, current, record_size);
                self.push(CardCommand::ReadRecords(cmd))?;
                current += 1;
            } else {
                let count = remaining.min(per_apdu);
                let expected = count.saturating_mul(record_size.saturating_add(2));
                let cmd = ReadRecordsCmd::multiple_records(&self.card, sfi, current, expected);
                self.push(CardCommand::ReadRecords(cmd))?;
                current += count;
            }
        }
        Ok(self)
    }

    /// Queue the read of the first `count` counters of a counters file
    pub fn prepare_read_counter(
        &mut self,
        sfi: u8,
        count: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        ensure!(
            count >= 1 && count as usize * 3 <= self.card.payload_capacity(),
            TransactionErrorKind::IllegalArgument,
            "counter count {} out of range",
            count
        );
        let cmd = ReadRecordsCmd::one_record(&self.card, sfi, 1, count * 3);
        self.push(CardCommand::ReadRecords(cmd))
    }

    /// Queue the partial read of a byte range of several records
    /// (revision 3 and Light only)
    pub fn prepare_read_records_partially(
        &mut self,
        sfi: u8,
        from_record: u8,
        to_record: u8,
        offset: u8,
        length: u8,
    ) -> Result<&mut Self, TransactionError> {
        match self.card.product_type() {
            ProductType::PrimeRevision3 | ProductType::Light => {}
            product => fail!(
                TransactionErrorKind::UnsupportedOperation,
                "Read Record Multiple is not available on {:?}",
                product
            ),
        }
        self.check_sfi(sfi)?;
        self.check_record_number(from_record)?;
        self.check_record_number(to_record)?;
        ensure!(
            from_record <= to_record,
            TransactionErrorKind::IllegalArgument,
            "record range {}..{} is reversed",
            from_record,
            to_record
        );
        ensure!(
            length >= 1 && length as usize <= self.card.payload_capacity(),
            TransactionErrorKind::IllegalArgument,
            "partial read length {} out of range",
            length
        );
        let per_apdu = (self.card.payload_capacity() / length as usize).max(1) as u8;
        let mut current = from_record;
        while current <= to_record {
            let cmd = ReadRecordMultipleCmd::new(&self.card, sfi, current, offset, length);
            self.push(CardCommand::ReadRecordMultiple(cmd))?;
            current = match current.checked_add(per_apdu) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(self)
    }

    /// Queue a record search (revision 3 only)
    pub fn prepare_search_records(
        &mut self,
        data: SearchCommandData,
    ) -> Result<&mut Self, TransactionError> {
        ensure!(
            self.card.product_type() == ProductType::PrimeRevision3,
            TransactionErrorKind::UnsupportedOperation,
            "Search Record Multiple is not available on {:?}",
            self.card.product_type()
        );
        self.check_sfi(data.sfi)?;
        self.check_record_number(data.start_record)?;
        ensure!(
            !data.search_data.is_empty()
                && data.search_data.len() + 2 <= self.card.payload_capacity(),
            TransactionErrorKind::IllegalArgument,
            "search data length {} out of range",
            data.search_data.len()
        );
        ensure!(
            data.mask.is_empty() || data.mask.len() == data.search_data.len(),
            TransactionErrorKind::IllegalArgument,
            "mask length {} does not match search data length {}",
            data.mask.len(),
            data.search_data.len()
        );
        let cmd = SearchRecordMultipleCmd::new(&self.card, data);
        self.push(CardCommand::SearchRecordMultiple(cmd))
    }

    /// Queue the read of a byte range of a binary file, split into as
    /// many APDUs as needed
    pub fn prepare_read_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        length: u16,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        ensure!(
            length > 0,
            TransactionErrorKind::IllegalArgument,
            "binary read length must be positive"
        );
        let mut current_sfi = sfi;
        if sfi > 0 && offset > 0xFF {
            // select the file through a prior access
            let probe = ReadBinaryCmd::new(&self.card, sfi, 0, 1);
            self.push(CardCommand::ReadBinary(probe))?;
            current_sfi = 0;
        }
        let capacity = self.card.payload_capacity() as u16;
        let mut remaining = length;
        let mut current_offset = offset;
        while remaining > 0 {
            let chunk = remaining.min(capacity).min(255);
            let cmd = ReadBinaryCmd::new(&self.card, current_sfi, current_offset, chunk as u8);
            self.push(CardCommand::ReadBinary(cmd))?;
            current_offset += chunk;
            remaining -= chunk;
            current_sfi = 0;
        }
        Ok(self)
    }

    /// Queue a Select File by its long identifier
    pub fn prepare_select_file(&mut self, lid: u16) -> Result<&mut Self, TransactionError> {
        let cmd = SelectFileCmd::with_lid(&self.card, lid);
        self.push(CardCommand::SelectFile(cmd))
    }

    /// Queue a Select File relative to the current DF
    pub fn prepare_select_file_control(
        &mut self,
        control: SelectFileControl,
    ) -> Result<&mut Self, TransactionError> {
        let cmd = SelectFileCmd::with_control(&self.card, control);
        self.push(CardCommand::SelectFile(cmd))
    }

    /// Queue a Get Data
    pub fn prepare_get_data(&mut self, tag: GetDataTag) -> Result<&mut Self, TransactionError> {
        let cmd = GetDataCmd::new(&self.card, tag);
        self.push(CardCommand::GetData(cmd))
    }

    // -- prepare: writes ----------------------------------------------------

    fn check_write_length(&self, length: usize) -> Result<(), TransactionError> {
        ensure!(
            length >= 1 && length <= self.card.payload_capacity(),
            TransactionErrorKind::IllegalArgument,
            "data length {} out of range [1..{}]",
            length,
            self.card.payload_capacity()
        );
        Ok(())
    }

    /// Queue an Append Record on a cyclic file
    pub fn prepare_append_record(
        &mut self,
        sfi: u8,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_write_length(content.len())?;
        let cmd = AppendRecordCmd::new(&self.card, sfi, content);
        self.push(CardCommand::AppendRecord(cmd))
    }

    /// Queue an Update Record (full replacement)
    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_record_number(record_number)?;
        self.check_write_length(content.len())?;
        let cmd = WriteRecordCmd::new(
            &self.card,
            WriteRecordMode::Update,
            sfi,
            record_number,
            content,
        );
        self.push(CardCommand::WriteRecord(cmd))
    }

    /// Queue a Write Record (overlay)
    pub fn prepare_write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_record_number(record_number)?;
        self.check_write_length(content.len())?;
        let cmd = WriteRecordCmd::new(
            &self.card,
            WriteRecordMode::Write,
            sfi,
            record_number,
            content,
        );
        self.push(CardCommand::WriteRecord(cmd))
    }

    fn prepare_binary_write(
        &mut self,
        mode: WriteBinaryMode,
        sfi: u8,
        offset: u16,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        self.check_write_length(content.len())?;
        let mut current_sfi = sfi;
        if sfi > 0 && offset > 0xFF {
            let probe = ReadBinaryCmd::new(&self.card, sfi, 0, 1);
            self.push(CardCommand::ReadBinary(probe))?;
            current_sfi = 0;
        }
        let capacity = self.card.payload_capacity();
        let mut current_offset = offset as usize;
        for chunk in content.chunks(capacity) {
            let cmd = WriteBinaryCmd::new(&self.card, mode, current_sfi, current_offset as u16, chunk);
            self.push(CardCommand::WriteBinary(cmd))?;
            current_offset += chunk.len();
            current_sfi = 0;
        }
        Ok(self)
    }

    /// Queue an Update Binary (replace bytes at an offset)
    pub fn prepare_update_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_binary_write(WriteBinaryMode::Update, sfi, offset, content)
    }

    /// Queue a Write Binary (overlay bytes at an offset)
    pub fn prepare_write_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        content: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_binary_write(WriteBinaryMode::Write, sfi, offset, content)
    }

    /// Queue an Increase on one counter
    pub fn prepare_increase_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_counter(CounterOperation::Increase, sfi, counter_number, delta)
    }

    /// Queue a Decrease on one counter
    pub fn prepare_decrease_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_counter(CounterOperation::Decrease, sfi, counter_number, delta)
    }

    fn prepare_counter(
        &mut self,
        operation: CounterOperation,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        ensure!(
            counter_number >= 1,
            TransactionErrorKind::IllegalArgument,
            "counter number must be positive"
        );
        ensure!(
            delta <= 0x00FF_FFFF,
            TransactionErrorKind::IllegalArgument,
            "counter delta {} exceeds 24 bits",
            delta
        );
        let cmd = CounterCmd::new(&self.card, operation, sfi, counter_number, delta);
        self.push(CardCommand::Counter(cmd))
    }

    /// Queue an Increase Multiple over several counters of one file
    pub fn prepare_increase_counters(
        &mut self,
        sfi: u8,
        deltas: Vec<(u8, u32)>,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_counters(CounterOperation::Increase, sfi, deltas)
    }

    /// Queue a Decrease Multiple over several counters of one file
    pub fn prepare_decrease_counters(
        &mut self,
        sfi: u8,
        deltas: Vec<(u8, u32)>,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_counters(CounterOperation::Decrease, sfi, deltas)
    }

    fn prepare_counters(
        &mut self,
        operation: CounterOperation,
        sfi: u8,
        deltas: Vec<(u8, u32)>,
    ) -> Result<&mut Self, TransactionError> {
        self.check_sfi(sfi)?;
        ensure!(
            !deltas.is_empty(),
            TransactionErrorKind::IllegalArgument,
            "no counter to modify"
        );
        ensure!(
            deltas.len() * 4 <= self.card.payload_capacity(),
            TransactionErrorKind::IllegalArgument,
            "{} counters exceed one APDU",
            deltas.len()
        );
        for &(number, delta) in &deltas {
            ensure!(
                number >= 1,
                TransactionErrorKind::IllegalArgument,
                "counter number must be positive"
            );
            ensure!(
                delta <= 0x00FF_FFFF,
                TransactionErrorKind::IllegalArgument,
                "counter delta {} exceeds 24 bits",
                delta
            );
        }
        if deltas.len() == 1 {
            let (number, delta) = deltas[0];
            let cmd = CounterCmd::new(&self.card, operation, sfi, number, delta);
            return self.push(CardCommand::Counter(cmd));
        }
        let cmd = CounterMultipleCmd::new(&self.card, operation, sfi, deltas);
        self.push(CardCommand::CounterMultiple(cmd))
    }

    /// Queue an Invalidate of the current DF
    pub fn prepare_invalidate(&mut self) -> Result<&mut Self, TransactionError> {
        ensure!(
            !self.card.is_df_invalidated(),
            TransactionErrorKind::IllegalState,
            "the DF is already invalidated"
        );
        let cmd = InvalidateCmd::invalidate(&self.card);
        self.push(CardCommand::Invalidate(cmd))
    }

    /// Queue a Rehabilitate of the current DF
    pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self, TransactionError> {
        ensure!(
            self.card.is_df_invalidated(),
            TransactionErrorKind::IllegalState,
            "the DF is not invalidated"
        );
        let cmd = InvalidateCmd::rehabilitate(&self.card);
        self.push(CardCommand::Invalidate(cmd))
    }

    // -- prepare: stored value ----------------------------------------------

    /// Queue the SV Get opening an SV operation
    pub fn prepare_sv_get(
        &mut self,
        operation: SvOperation,
        action: SvAction,
    ) -> Result<&mut Self, TransactionError> {
        ensure!(
            self.card.is_sv_feature_available(),
            TransactionErrorKind::UnsupportedOperation,
            "this application has no Stored Value purse"
        );
        ensure!(
            self.crypto.is_some(),
            TransactionErrorKind::IllegalState,
            "SV operations require a crypto driver"
        );
        self.sv_operation = Some(operation);
        self.sv_action = action;
        if self.setting.is_load_and_debit_sv_log_enabled() {
            if self.card.is_extended_mode_supported() {
                let cmd = SvGetCmd::new(&self.card, operation, true);
                return self.push(CardCommand::SvGet(cmd));
            }
            // two exchanges: fetch the other operation's log first
            let first = SvGetCmd::new(&self.card, operation.other(), false);
            self.push(CardCommand::SvGet(first))?;
        }
        let cmd = SvGetCmd::new(&self.card, operation, false);
        self.push(CardCommand::SvGet(cmd))
    }

    fn check_sv_modifying_allowed(&self, operation: SvOperation) -> Result<(), TransactionError> {
        ensure!(
            !self.sv_command_prepared,
            TransactionErrorKind::IllegalState,
            "only one SV modifying command is allowed per secure session"
        );
        ensure!(
            self.sv_operation == Some(operation),
            TransactionErrorKind::IllegalState,
            "SV Get for {:?} must precede this command",
            operation
        );
        let only_sv_gets = self.commands.iter().all(|c| match *c {
            CardCommand::SvGet(_) => true,
            _ => false,
        });
        ensure!(
            only_sv_gets,
            TransactionErrorKind::IllegalState,
            "an SV modifying command must be first in the prepared queue"
        );
        ensure!(
            !self.commands.is_empty() || self.card.sv_get_data().is_some(),
            TransactionErrorKind::IllegalState,
            "SV Get must directly precede an SV modifying command"
        );
        Ok(())
    }

    /// Queue an SV Reload; must directly follow the SV Get
    pub fn prepare_sv_reload(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sv_modifying_allowed(SvOperation::Reload)?;
        ensure!(
            amount >= -8_388_608 && amount <= 8_388_607,
            TransactionErrorKind::IllegalArgument,
            "SV reload amount {} exceeds 24 bits",
            amount
        );
        let signed_amount = match self.sv_action {
            SvAction::Do => amount,
            SvAction::Undo => -amount,
        };
        let cmd = SvReloadCmd::new(&self.card, signed_amount, date, time, free);
        self.sv_command_prepared = true;
        self.push(CardCommand::SvReload(cmd))
    }

    /// Queue an SV Debit (action `Do`) or SV Undebit (action `Undo`);
    /// must directly follow the SV Get
    pub fn prepare_sv_debit(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    ) -> Result<&mut Self, TransactionError> {
        self.check_sv_modifying_allowed(SvOperation::Debit)?;
        ensure!(
            amount >= 0 && amount <= 32_767,
            TransactionErrorKind::IllegalArgument,
            "SV debit amount {} out of range",
            amount
        );
        if self.sv_action == SvAction::Do && !self.setting.is_sv_negative_balance_authorized() {
            if let Some(balance) = self.card.sv_balance() {
                ensure!(
                    balance - amount >= 0,
                    TransactionErrorKind::IllegalState,
                    "SV debit of {} would drive the balance ({}) below zero",
                    amount,
                    balance
                );
            }
        }
        let mode = match self.sv_action {
            SvAction::Do => SvDebitMode::Debit,
            SvAction::Undo => SvDebitMode::Undebit,
        };
        let cmd = SvDebitCmd::new(&self.card, mode, amount, date, time);
        self.sv_command_prepared = true;
        self.push(CardCommand::SvDebit(cmd))
    }

    // -- prepare: channel and signatures ------------------------------------

    /// Release the card channel after the next `process_*` completes
    pub fn prepare_release_card_channel(&mut self) -> &mut Self {
        self.channel_release_requested = true;
        self
    }

    /// Piggyback a signature computation on the crypto driver
    pub fn prepare_compute_signature(&mut self, data: &[u8]) -> Result<&mut Self, TransactionError> {
        match self.crypto {
            Some(ref mut crypto) => crypto
                .prepare_compute_signature(data)
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?,
            None => fail!(
                TransactionErrorKind::IllegalState,
                "signature operations require a crypto driver"
            ),
        }
        Ok(self)
    }

    /// Piggyback a signature verification on the crypto driver
    pub fn prepare_verify_signature(&mut self, data: &[u8]) -> Result<&mut Self, TransactionError> {
        match self.crypto {
            Some(ref mut crypto) => crypto
                .prepare_verify_signature(data)
                .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?,
            None => fail!(
                TransactionErrorKind::IllegalState,
                "signature operations require a crypto driver"
            ),
        }
        Ok(self)
    }

    // -- process ------------------------------------------------------------

    /// Open a Secure Session at the given access level, executing any
    /// prepared commands atomically with the opening
    pub fn process_opening(&mut self, level: AccessLevel) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            ensure!(
                manager.state == SessionState::Idle,
                TransactionErrorKind::IllegalState,
                "a secure session is already open"
            );
            ensure!(
                manager.crypto.is_some(),
                TransactionErrorKind::IllegalState,
                "a secure session requires a crypto driver"
            );
            let commands: Vec<CardCommand> = manager.commands.drain(..).collect();
            let max = manager.card.modifications_counter();
            let in_bytes = manager.card.is_modifications_counter_in_bytes();

            let mut opened = false;
            let mut counter = max;
            let mut current: Vec<CardCommand> = Vec::new();
            for command in commands {
                let cost = command.session_buffer_cost(in_bytes);
                if command.is_session_buffer_used() && counter - cost < 0 {
                    ensure!(
                        manager.setting.session_modification_mode()
                            == SessionModificationMode::Multiple,
                        TransactionErrorKind::SessionBufferOverflow,
                        "the prepared commands overflow the session buffer"
                    );
                    let batch = ::std::mem::replace(&mut current, Vec::new());
                    if !opened {
                        manager.process_atomic_opening(level, batch)?;
                        opened = true;
                    } else {
                        manager.flush_session_with_close(batch)?;
                    }
                    counter = max;
                }
                counter -= cost;
                current.push(command);
            }
            if !opened {
                manager.process_atomic_opening(level, current)?;
            } else if !current.is_empty() {
                manager.process_atomic_card_commands(current, ChannelControl::KeepOpen)?;
            }
            manager.planning_counter = counter;
            Ok(())
        })
    }

    /// Flush the prepared commands, inside or outside a session
    pub fn process_commands(&mut self) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            let commands: Vec<CardCommand> = manager.commands.drain(..).collect();
            match manager.state {
                SessionState::Idle => {
                    let channel = manager.channel_control();
                    manager.process_atomic_card_commands(commands, channel)?;
                    manager.sv_command_prepared = false;
                }
                SessionState::SessionOpen => {
                    let max = manager.card.modifications_counter();
                    let in_bytes = manager.card.is_modifications_counter_in_bytes();
                    let mut counter = manager.session_budget;
                    let mut current: Vec<CardCommand> = Vec::new();
                    for command in commands {
                        let cost = command.session_buffer_cost(in_bytes);
                        if command.is_session_buffer_used() && counter - cost < 0 {
                            ensure!(
                                manager.setting.session_modification_mode()
                                    == SessionModificationMode::Multiple,
                                TransactionErrorKind::SessionBufferOverflow,
                                "the prepared commands overflow the session buffer"
                            );
                            let batch = ::std::mem::replace(&mut current, Vec::new());
                            manager.flush_session_with_close(batch)?;
                            counter = max;
                        }
                        counter -= cost;
                        current.push(command);
                    }
                    manager.process_atomic_card_commands(current, ChannelControl::KeepOpen)?;
                }
            }
            if let Some(ref mut crypto) = manager.crypto {
                crypto
                    .process_commands()
                    .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
            }
            Ok(())
        })
    }

    /// Close the Secure Session: remaining reads are flushed, remaining
    /// modifying commands travel with the Close Session APDU, and the
    /// card's session MAC is verified
    pub fn process_closing(&mut self) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            ensure!(
                manager.state == SessionState::SessionOpen,
                TransactionErrorKind::IllegalState,
                "no secure session is open"
            );
            let commands: Vec<CardCommand> = manager.commands.drain(..).collect();
            let max = manager.card.modifications_counter();
            let in_bytes = manager.card.is_modifications_counter_in_bytes();
            let mut counter = manager.session_budget;
            let mut reads: Vec<CardCommand> = Vec::new();
            let mut writes: Vec<CardCommand> = Vec::new();
            for command in commands {
                if command.is_session_buffer_used() {
                    let cost = command.session_buffer_cost(in_bytes);
                    if counter - cost < 0 {
                        ensure!(
                            manager.setting.session_modification_mode()
                                == SessionModificationMode::Multiple,
                            TransactionErrorKind::SessionBufferOverflow,
                            "the prepared commands overflow the session buffer"
                        );
                        let read_batch = ::std::mem::replace(&mut reads, Vec::new());
                        let write_batch = ::std::mem::replace(&mut writes, Vec::new());
                        manager.process_atomic_card_commands(read_batch, ChannelControl::KeepOpen)?;
                        manager.process_atomic_closing(
                            write_batch,
                            false,
                            false,
                            ChannelControl::KeepOpen,
                        )?;
                        let level = manager
                            .write_access_level
                            .expect("session open implies an access level");
                        manager.process_atomic_opening(level, Vec::new())?;
                        counter = max;
                    }
                    counter -= cost;
                    writes.push(command);
                } else {
                    reads.push(command);
                }
            }
            manager.process_atomic_card_commands(reads, ChannelControl::KeepOpen)?;
            let ratify = manager.setting.ratification_mode() == RatificationMode::CloseRatified;
            let explicit_ratification = !ratify && manager.reader.is_contactless();
            let channel = manager.channel_control();
            manager.process_atomic_closing(writes, ratify, explicit_ratification, channel)?;

            manager.write_access_level = None;
            manager.planning_counter = max;
            manager.sv_command_prepared = false;
            if let Some(ref mut crypto) = manager.crypto {
                crypto
                    .process_commands()
                    .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?;
            }
            Ok(())
        })
    }

    /// Abort the transaction: clear the queue and, if a session is open,
    /// send an unauthenticated Close Session and restore the card image
    /// from its snapshot
    pub fn process_cancel(&mut self) -> Result<&mut Self, TransactionError> {
        self.commands.clear();
        self.sv_command_prepared = false;
        if self.state == SessionState::SessionOpen {
            self.card.restore_files();
            let abort = CloseSessionCmd::abort(self.card.card_class());
            let channel = self.channel_control();
            if let Err(err) = self.transmit(vec![abort.request().clone()], false, channel) {
                warn!("session abort failed: {}", err);
            }
            self.state = SessionState::Idle;
            self.write_access_level = None;
        }
        let max = self.card.modifications_counter();
        self.planning_counter = max;
        self.session_budget = max;
        Ok(self)
    }

    fn process_get_challenge(&mut self) -> Result<Vec<u8>, TransactionError> {
        let cmd = GetChallengeCmd::new(&self.card);
        let responses = self.transmit(
            vec![cmd.request().clone()],
            true,
            ChannelControl::KeepOpen,
        )?;
        if responses.is_empty() {
            return Err(self.error(
                TransactionErrorKind::InconsistentData,
                "no response to Get Challenge",
            ));
        }
        cmd.parse(&mut self.card, &responses[0])
            .map_err(|e| self.command_status_error("Get Challenge", &e))?;
        Ok(self
            .card
            .card_challenge()
            .expect("challenge retained by the parser")
            .to_vec())
    }

    /// Present the PIN, ciphered by the SAM unless plain transmission
    /// was explicitly enabled
    pub fn process_verify_pin(&mut self, pin: &[u8]) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            ensure!(
                manager.state == SessionState::Idle,
                TransactionErrorKind::IllegalState,
                "PIN verification is not allowed inside a secure session"
            );
            ensure!(
                manager.commands.is_empty(),
                TransactionErrorKind::IllegalState,
                "PIN verification requires an empty command queue"
            );
            ensure!(
                manager.card.is_pin_feature_available(),
                TransactionErrorKind::UnsupportedOperation,
                "this application has no PIN"
            );
            ensure!(
                pin.len() == 4,
                TransactionErrorKind::IllegalArgument,
                "the PIN must be 4 bytes"
            );
            let mut pin_bytes = [0u8; 4];
            pin_bytes.copy_from_slice(pin);

            let cmd = match manager.setting.pin_transmission_mode() {
                PinTransmissionMode::Encrypted => {
                    ensure!(
                        manager.crypto.is_some(),
                        TransactionErrorKind::IllegalState,
                        "encrypted PIN transmission requires a crypto driver"
                    );
                    let challenge = manager.process_get_challenge()?;
                    let (kif, kvc) = match manager.setting.pin_verification_cipher_key() {
                        Some(key) => key,
                        None => fail!(
                            TransactionErrorKind::IllegalState,
                            "no PIN verification ciphering key configured"
                        ),
                    };
                    let block = {
                        let crypto = manager.crypto.as_mut().expect("crypto checked above");
                        crypto
                            .cipher_pin_for_presentation(&challenge, &pin_bytes, kif, kvc)
                            .map_err(|e| {
                                Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string()))
                            })?
                    };
                    VerifyPinCmd::encrypted(&manager.card, &block)
                }
                PinTransmissionMode::Plain => VerifyPinCmd::plain(&manager.card, &pin_bytes),
            };
            pin_bytes.zeroize();

            let channel = manager.channel_control();
            let responses = manager.transmit(vec![cmd.request().clone()], true, channel)?;
            if responses.is_empty() {
                return Err(manager.error(
                    TransactionErrorKind::InconsistentData,
                    "no response to Verify PIN",
                ));
            }
            cmd.parse(&mut manager.card, &responses[0])
                .map_err(|e| {
                    Error::new(
                        TransactionErrorKind::UnexpectedCommandStatus,
                        Some(e.to_string()),
                    )
                })?;
            Ok(())
        })
    }

    /// Replace the PIN, ciphered by the SAM unless plain transmission
    /// was explicitly enabled
    pub fn process_change_pin(&mut self, new_pin: &[u8]) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            ensure!(
                manager.state == SessionState::Idle,
                TransactionErrorKind::IllegalState,
                "PIN modification is not allowed inside a secure session"
            );
            ensure!(
                manager.card.is_pin_feature_available(),
                TransactionErrorKind::UnsupportedOperation,
                "this application has no PIN"
            );
            ensure!(
                new_pin.len() == 4,
                TransactionErrorKind::IllegalArgument,
                "the PIN must be 4 bytes"
            );
            let mut pin_bytes = [0u8; 4];
            pin_bytes.copy_from_slice(new_pin);

            let cmd = match manager.setting.pin_transmission_mode() {
                PinTransmissionMode::Encrypted => {
                    ensure!(
                        manager.crypto.is_some(),
                        TransactionErrorKind::IllegalState,
                        "encrypted PIN transmission requires a crypto driver"
                    );
                    let challenge = manager.process_get_challenge()?;
                    let (kif, kvc) = match manager.setting.pin_modification_cipher_key() {
                        Some(key) => key,
                        None => fail!(
                            TransactionErrorKind::IllegalState,
                            "no PIN modification ciphering key configured"
                        ),
                    };
                    let block = {
                        let crypto = manager.crypto.as_mut().expect("crypto checked above");
                        crypto
                            .cipher_pin_for_modification(
                                &challenge,
                                &[0u8; 4],
                                &pin_bytes,
                                kif,
                                kvc,
                            )
                            .map_err(|e| {
                                Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string()))
                            })?
                    };
                    ChangePinCmd::encrypted(&manager.card, &block)
                }
                PinTransmissionMode::Plain => {
                    ensure!(
                        !manager.card.is_pin_blocked(),
                        TransactionErrorKind::IllegalState,
                        "the PIN is blocked"
                    );
                    ChangePinCmd::plain(&manager.card, &pin_bytes)
                }
            };
            pin_bytes.zeroize();

            let channel = manager.channel_control();
            let responses = manager.transmit(vec![cmd.request().clone()], true, channel)?;
            if responses.is_empty() {
                return Err(manager.error(
                    TransactionErrorKind::InconsistentData,
                    "no response to Change PIN",
                ));
            }
            cmd.parse(&mut manager.card, &responses[0])
                .map_err(|e| manager.command_status_error("Change PIN", &e))?;
            Ok(())
        })
    }

    /// Replace a card key with a cryptogram generated by the SAM
    pub fn process_change_key(
        &mut self,
        key_index: u8,
        new_kif: u8,
        new_kvc: u8,
        issuer_kif: u8,
        issuer_kvc: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.guard(|manager| {
            ensure!(
                manager.state == SessionState::Idle,
                TransactionErrorKind::IllegalState,
                "key modification is not allowed inside a secure session"
            );
            ensure!(
                manager.card.product_type() != ProductType::Basic,
                TransactionErrorKind::UnsupportedOperation,
                "Change Key is not available on {:?}",
                manager.card.product_type()
            );
            ensure!(
                key_index >= 1 && key_index <= 3,
                TransactionErrorKind::IllegalArgument,
                "key index {} out of range [1..3]",
                key_index
            );
            ensure!(
                manager.crypto.is_some(),
                TransactionErrorKind::IllegalState,
                "key modification requires a crypto driver"
            );
            let challenge = manager.process_get_challenge()?;
            let cryptogram = {
                let crypto = manager.crypto.as_mut().expect("crypto checked above");
                crypto
                    .generate_ciphered_card_key(&challenge, issuer_kif, issuer_kvc, new_kif, new_kvc)
                    .map_err(|e| Error::new(TransactionErrorKind::ReaderIo, Some(e.to_string())))?
            };
            let cmd = ChangeKeyCmd::new(&manager.card, key_index, &cryptogram);
            let channel = manager.channel_control();
            let responses = manager.transmit(vec![cmd.request().clone()], true, channel)?;
            if responses.is_empty() {
                return Err(manager.error(
                    TransactionErrorKind::InconsistentData,
                    "no response to Change Key",
                ));
            }
            cmd.parse(&responses[0])
                .map_err(|e| manager.command_status_error("Change Key", &e))?;
            Ok(())
        })
    }
}
