//! Stored Value flows: SV Get variants, in-session debit with postponed
//! SV MAC, out-of-session reload, and the one-SV-command-per-session
//! rule.

extern crate calypso;

mod common;

use calypso::{
    AccessLevel, CardTransactionManager, SecuritySetting, SvAction, SvOperation,
    TransactionErrorKind,
};
use common::{
    close_session_request, close_session_response, open_session_request, open_session_response,
    rev3_card, MockReader, ScriptedCrypto, SV_SECURITY_BLOCK,
};

const SV_GET_RELOAD: [u8; 5] = [0x00, 0x7C, 0x00, 0x07, 0x00];
const SV_GET_DEBIT: [u8; 5] = [0x00, 0x7C, 0x00, 0x09, 0x00];

/// SV Get response for the DEBIT variant: KVC, T-num, balance, then a
/// 19-byte debit log
fn sv_get_debit_response(balance: [u8; 3]) -> Vec<u8> {
    let mut response = vec![0xAA, 0x00, 0x01];
    response.extend_from_slice(&balance);
    response.extend_from_slice(&[0u8; 19]);
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

/// SV Get response for the RELOAD variant: KVC, T-num, balance, then a
/// 22-byte load log
fn sv_get_reload_response(balance: [u8; 3]) -> Vec<u8> {
    let mut response = vec![0xAA, 0x00, 0x01];
    response.extend_from_slice(&balance);
    response.extend_from_slice(&[0u8; 22]);
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

fn sv_debit_apdu(amount: i16) -> Vec<u8> {
    let mut apdu = vec![0x00, 0xBA, 0x00, 0x00, 0x12];
    apdu.push((amount >> 8) as u8);
    apdu.push(amount as u8);
    apdu.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // date, time
    apdu.extend_from_slice(&SV_SECURITY_BLOCK);
    apdu
}

/// S4: SV Get then SV Debit inside a session; the SV MAC arrives as
/// postponed data and the balance drops by the debited amount
#[test]
fn sv_debit_inside_session() {
    let reader = MockReader::new()
        .expect(&open_session_request(0, 0), &open_session_response(true, &[]))
        .expect(&SV_GET_DEBIT, &sv_get_debit_response([0x00, 0x00, 0x64]))
        .expect(&sv_debit_apdu(-2), &[0x62, 0x00])
        .expect(
            &close_session_request(true),
            &close_session_response(&[&[0x5B, 0x5C, 0x5D]]),
        );
    let (crypto, log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new(),
        Box::new(crypto),
    );

    transaction
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)
        .unwrap()
        .process_opening(AccessLevel::Debit)
        .unwrap();
    assert_eq!(transaction.calypso_card().sv_balance(), Some(100));

    transaction
        .prepare_sv_debit(2, [0x00, 0x00], [0x00, 0x00])
        .unwrap()
        .process_closing()
        .unwrap();

    let card = transaction.calypso_card();
    assert_eq!(card.sv_balance(), Some(98));
    assert_eq!(card.sv_last_transaction_number(), Some(2));
    assert_eq!(
        log.borrow().verified_sv_macs,
        vec![vec![0x5B, 0x5C, 0x5D]]
    );
    assert_eq!(transaction.card_reader().remaining(), 0);
}

/// Property 6: a second SV modifying command in the same session fails
#[test]
fn only_one_sv_command_per_session() {
    let reader = MockReader::new()
        .expect(&open_session_request(0, 0), &open_session_response(true, &[]))
        .expect(&SV_GET_DEBIT, &sv_get_debit_response([0x00, 0x00, 0x64]));
    let (crypto, _log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new(),
        Box::new(crypto),
    );

    transaction
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)
        .unwrap()
        .process_opening(AccessLevel::Debit)
        .unwrap();
    transaction.prepare_sv_debit(2, [0; 2], [0; 2]).unwrap();
    let err = transaction.prepare_sv_debit(1, [0; 2], [0; 2]).unwrap_err();
    assert_eq!(err.kind(), TransactionErrorKind::IllegalState);
}

/// Without extended mode, asking for both logs queues two SV Gets, the
/// other operation first
#[test]
fn both_logs_without_extended_mode_use_two_sv_gets() {
    let reader = MockReader::new()
        .expect(&SV_GET_RELOAD, &sv_get_reload_response([0x00, 0x00, 0x64]))
        .expect(&SV_GET_DEBIT, &sv_get_debit_response([0x00, 0x00, 0x64]));
    let (crypto, _log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new().enable_sv_load_and_debit_log(),
        Box::new(crypto),
    );

    transaction
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)
        .unwrap()
        .process_commands()
        .unwrap();

    let card = transaction.calypso_card();
    assert!(card.sv_load_log_record().is_some());
    assert_eq!(card.sv_debit_log_records().len(), 1);
    assert_eq!(transaction.card_reader().remaining(), 0);
}

/// Out of session the SV Reload response carries the SV MAC directly
#[test]
fn sv_reload_out_of_session() {
    let mut reload_apdu = vec![0x00, 0xB8, 0x00, 0x00, 0x15];
    reload_apdu.extend_from_slice(&[0x00, 0x00, 0x32]); // amount 50
    reload_apdu.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x00, 0x00]); // date, time, free
    reload_apdu.extend_from_slice(&SV_SECURITY_BLOCK);

    let reader = MockReader::new()
        .expect(&SV_GET_RELOAD, &sv_get_reload_response([0x00, 0x00, 0x64]))
        .expect(&reload_apdu, &[0x5E, 0x5F, 0x60, 0x90, 0x00]);
    let (crypto, log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new(),
        Box::new(crypto),
    );

    transaction
        .prepare_sv_get(SvOperation::Reload, SvAction::Do)
        .unwrap()
        .process_commands()
        .unwrap();
    transaction
        .prepare_sv_reload(50, [0x01, 0x02], [0x03, 0x04], [0x00, 0x00])
        .unwrap()
        .process_commands()
        .unwrap();

    assert_eq!(transaction.calypso_card().sv_balance(), Some(150));
    assert_eq!(log.borrow().verified_sv_macs, vec![vec![0x5E, 0x5F, 0x60]]);
}

/// A debit driving the balance below zero is refused unless explicitly
/// authorized
#[test]
fn negative_balance_is_refused_by_default() {
    let reader = MockReader::new()
        .expect(&SV_GET_DEBIT, &sv_get_debit_response([0x00, 0x00, 0x64]));
    let (crypto, _log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new(),
        Box::new(crypto),
    );

    transaction
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)
        .unwrap()
        .process_commands()
        .unwrap();
    let err = transaction.prepare_sv_debit(200, [0; 2], [0; 2]).unwrap_err();
    assert_eq!(err.kind(), TransactionErrorKind::IllegalState);
}

/// An SV modifying command without a prior SV Get is refused
#[test]
fn sv_debit_requires_a_prior_sv_get() {
    let reader = MockReader::new();
    let (crypto, _log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x03),
        SecuritySetting::new(),
        Box::new(crypto),
    );
    let err = transaction.prepare_sv_debit(1, [0; 2], [0; 2]).unwrap_err();
    assert_eq!(err.kind(), TransactionErrorKind::IllegalState);
}

/// SV operations need the Stored Value feature bit
#[test]
fn sv_get_requires_the_sv_feature() {
    let reader = MockReader::new();
    let (crypto, _log) = ScriptedCrypto::new();
    let mut transaction = CardTransactionManager::with_crypto(
        reader,
        rev3_card(0x01),
        SecuritySetting::new(),
        Box::new(crypto),
    );
    let err = transaction
        .prepare_sv_get(SvOperation::Debit, SvAction::Do)
        .unwrap_err();
    assert_eq!(err.kind(), TransactionErrorKind::UnsupportedOperation);
}
