//! Session behaviour when the transport refuses writes
//!
//! The session is driven directly with a scripted link, so every command and
//! reply is under the test's control.

mod common;

use common::builders::z_threshold_route;
use common::mock_helpers::connected_link;
use common::{accel_attributes, ACCEL};
use crossbeam_channel::bounded;
use sensorboard::session::Session;
use sensorboard::{BoardConfig, BoardError, DownloadOptions, Notification};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

/// Session over a link that fails every write starting with `refused`
fn session(refused: &'static [u8]) -> (Session, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let log = sent.clone();
    let mut link = connected_link();
    link.expect_send().returning(move |command| {
        log.lock().unwrap().push(command.to_vec());
        if command.starts_with(refused) {
            Err(BoardError::Transport("write refused".to_string()))
        } else {
            Ok(())
        }
    });
    (Session::new(BoardConfig::default(), Box::new(link)), sent)
}

fn reply(session: &mut Session, bytes: &[u8]) {
    session.handle_notification(Notification::Data(bytes.to_vec()), Instant::now());
}

#[test]
fn test_refused_trigger_rolls_back_processors() {
    let (mut session, sent) = session(&[0x0b, 0x02]);
    let accel = session
        .register_source(ACCEL.0, ACCEL.1, None, accel_attributes(), 6)
        .unwrap();

    let (tx, rx) = bounded(1);
    session.create_route(z_threshold_route(accel), tx, Instant::now());
    reply(&mut session, &[0x09, 0x02, 0x00]);
    reply(&mut session, &[0x09, 0x02, 0x01]);

    assert!(matches!(rx.try_recv().unwrap(), Err(BoardError::Transport(_))));
    let sent = sent.lock().unwrap();
    assert_eq!(
        &sent[sent.len() - 2..],
        &[vec![0x09, 0x06, 0x01], vec![0x09, 0x06, 0x00]]
    );
    assert_eq!(session.routes().count(), 0);
    assert!(session.allocator().names().is_empty());
}

#[test]
fn test_refused_readout_fails_download() {
    let (mut session, _) = session(&[0x0b, 0x06]);
    let (tx, rx) = bounded(1);
    session.download_log(DownloadOptions::new(1), tx, Instant::now());
    assert!(session.is_downloading());

    reply(&mut session, &[0x0b, 0x85, 3, 0, 0, 0]);
    assert!(matches!(rx.try_recv().unwrap(), Err(BoardError::Transport(_))));
    assert!(!session.is_downloading());
}

#[test]
fn test_refused_time_read_fails_sync() {
    let (mut session, _) = session(&[0x0b, 0x84]);
    let (tx, rx) = bounded(1);
    session.sync_time(tx, Instant::now());
    assert!(matches!(rx.try_recv().unwrap(), Err(BoardError::Transport(_))));
}

#[test]
fn test_second_download_is_rejected() {
    let (mut session, _) = session(&[0xff]);
    let (first, _first_rx) = bounded(1);
    session.download_log(DownloadOptions::new(1), first, Instant::now());

    let (second, rx) = bounded(1);
    session.download_log(DownloadOptions::new(1), second, Instant::now());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(BoardError::InvalidParameter(_))
    ));
}
