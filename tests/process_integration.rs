//! Integration tests for normal (process) mode.
//!
//! A shell script stands in for signal-cli: it records its arguments and
//! stdin, then answers like the real binary would. Everything runs in one
//! test so no other test thread can fork while the script is being written
//! (which would make exec fail with ETXTBSY).
//!
//! # Running
//!
//! ```bash
//! cargo test --test process_integration -- --nocapture
//! ```

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use signal_bridge::bridge::Bridge;
use signal_bridge::config::{BridgeConfig, TransportMode, TrustMode};
use signal_bridge::error::BridgeError;
use signal_bridge::models::{ProfileUpdate, ReceiveOptions, SendRequest};

const ACCOUNT: &str = "+4915112345678";

fn write_fake_signal_cli(dir: &Path) -> PathBuf {
    let script = dir.join("signal-cli");
    let args_file = dir.join("args");
    let stdin_file = dir.join("stdin");

    let body = format!(
        r#"#!/bin/sh
printf '%s\n' "$@" > '{args}'
case " $* " in
  *" send "*)
    cat > '{stdin}'
    echo 1700000000000
    ;;
  *" listGroups "*)
    echo '[{{"id":"aWQ=","name":"Climbing","isBlocked":false}}]'
    ;;
  *" updateProfile "*)
    echo "Failed to send message due to rate limiting" >&2
    echo "Run: signal-cli -a {account} submitRateLimitChallenge --challenge c0ffee --captcha CAPTCHA" >&2
    exit 5
    ;;
  *" receive "*)
    exec sleep 30
    ;;
  *)
    echo "Unknown command" >&2
    exit 1
    ;;
esac
"#,
        args = args_file.display(),
        stdin = stdin_file.display(),
        account = ACCOUNT,
    );

    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn recorded_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_process_mode_against_fake_signal_cli() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_signal_cli(dir.path());

    let config = BridgeConfig {
        mode: TransportMode::Process,
        binary: script,
        engine_config_dir: Some(dir.path().join("data")),
        command_timeout_secs: 1,
        trust_modes: [(ACCOUNT.to_string(), TrustMode::Always)].into_iter().collect(),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::from_config(&config).await;
    let data_dir = dir.path().join("data").display().to_string();

    // Send: text goes over stdin, trust policy and --config are prepended.
    let timestamps = bridge
        .send(&SendRequest::new(ACCOUNT, &["+4915187654321"], "**hello**").styled())
        .await
        .unwrap();
    assert_eq!(timestamps, vec![1700000000000]);
    assert_eq!(
        recorded_args(dir.path()),
        vec![
            "--trust-new-identities",
            "always",
            "--config",
            data_dir.as_str(),
            "-a",
            ACCOUNT,
            "send",
            "+4915187654321",
            "--message-from-stdin",
            "--text-style",
            "0:5:BOLD",
        ]
    );
    assert_eq!(std::fs::read_to_string(dir.path().join("stdin")).unwrap(), "hello");

    // Structured output is parsed into result models.
    let groups = bridge.list_groups(ACCOUNT).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "Climbing");
    assert_eq!(groups[0].internal_id, "aWQ=");

    // Non-zero exit: stderr becomes the message.
    let err = bridge.set_pin(ACCOUNT, "123456").await.unwrap_err();
    match err {
        BridgeError::RemoteError { code, message } => {
            assert_eq!(code, 1);
            assert_eq!(message, "Unknown command");
        }
        other => panic!("Expected RemoteError, got {:?}", other),
    }

    // Rate limit reported on stderr keeps its challenge token.
    let err = bridge
        .update_profile(
            ACCOUNT,
            &ProfileUpdate {
                about: Some("Climbing".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        BridgeError::RateLimited {
            challenge_tokens, ..
        } => assert_eq!(challenge_tokens, vec!["c0ffee".to_string()]),
        other => panic!("Expected RateLimited, got {:?}", other),
    }

    // A hung signal-cli is killed at the deadline.
    let started = Instant::now();
    let err = bridge
        .receive(ACCOUNT, &ReceiveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(10));
}
