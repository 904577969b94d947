//! Signal hook tests
//!
//! Runs in its own test binary because the handlers stay installed for the
//! rest of the process.

#![cfg(unix)]

mod common;

use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::{FakeToken, TEST_PORT};
use tkey_session::services::lifecycle::{install_with_exit, SIGNAL_EXIT_CODE};
use tkey_session::{AppBinary, SessionError, SessionManager, SignOptions};

fn send_signal(name: &str) {
    let status = Command::new("kill")
        .args([format!("-{name}"), std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn test_hangup_is_ignored_and_terminate_closes_session() {
    let token = FakeToken::signer();
    let session = std::sync::Arc::new(
        SessionManager::builder(token.transport(), AppBinary::from_bytes(vec![1; 16]))
            .port(Some(TEST_PORT.to_string()))
            .idle_disconnect(Duration::from_secs(30))
            .build(),
    );
    session.get_public_key().unwrap();
    assert!(token.is_open());

    let (exit_tx, exit_rx) = mpsc::channel();
    let hooked = std::sync::Arc::clone(&session);
    install_with_exit(
        move || hooked.shutdown(),
        move |code| {
            let _ = exit_tx.send(code);
        },
    )
    .unwrap();

    send_signal("HUP");
    assert!(exit_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(token.is_open());
    session.sign(b"still here", SignOptions::unhashed()).unwrap();

    send_signal("TERM");
    let code = exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(code, SIGNAL_EXIT_CODE);
    assert_eq!(code, 1);
    assert!(!token.is_open());
    assert_eq!(token.closes(), 1);

    // Give the hook thread a moment to finish, then confirm nothing restarts.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.get_public_key(), Err(SessionError::ShuttingDown));
}
