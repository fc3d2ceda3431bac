//! Configuration upload and read-back against the mock controller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use archond::controller::{AcfDocument, ControllerStatus};
use archond::error::ArchonError;
use common::{build_delegate, default_acf_lines, MemorySink, MemoryWriter, MockArchon, MockState};

fn acf_text(lines: &[String]) -> String {
    let mut text = String::from("[CONFIG]\n");
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

/// A config document long enough to have a line 73.
fn long_acf() -> String {
    let mut lines = default_acf_lines(32, 32);
    for n in 0..80 {
        lines.push(format!("MOD4/DIO_LABEL{n}=PIN{n}"));
    }
    acf_text(&lines)
}

#[tokio::test]
async fn write_config_nak_reports_line_and_blocks_exposures() {
    let mock = MockArchon::start(MockState::new(32, 32)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(dir.path(), &[("sp1", mock.addr, 32, 32)]);
    let (_delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;
    let device = controllers["sp1"].clone();
    assert!(device.has_valid_config());

    mock.with_state(|s| s.nak_wconfig_line = Some(73));

    let err = device
        .write_config(&long_acf(), &[], &[])
        .await
        .unwrap_err();
    match &err {
        ArchonError::Config(message) => assert!(message.contains("line 73"), "{message}"),
        other => panic!("expected Config error, got {other:?}"),
    }

    // Status untouched, but exposures are refused until a clean reload.
    assert!(device.status().contains(ControllerStatus::IDLE));
    assert!(!device.status().contains(ControllerStatus::ERROR));
    assert!(!device.has_valid_config());

    let refused = device.expose(Duration::from_millis(100), true).await;
    assert!(matches!(refused, Err(ArchonError::Config(_))));

    // A successful reload re-arms the controller.
    mock.with_state(|s| s.nak_wconfig_line = None);
    device.write_config(&long_acf(), &[], &[]).await.unwrap();
    assert!(device.has_valid_config());

    let handle = device
        .expose(Duration::from_millis(100), true)
        .await
        .expect("exposure accepted after reload");
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn write_then_read_config_round_trips() {
    let mock = MockArchon::start(MockState::new(32, 32)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(dir.path(), &[("sp1", mock.addr, 32, 32)]);
    let (_delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;
    let device = controllers["sp1"].clone();

    let input = acf_text(&default_acf_lines(32, 32));
    device.write_config(&input, &[], &[]).await.unwrap();

    let (_, output) = device.read_config().await.unwrap();

    // Equal up to whitespace and quoting normalisation: the wire form of
    // both documents is identical.
    let input_doc = AcfDocument::parse(&input).unwrap();
    let output_doc = AcfDocument::parse(&output).unwrap();
    assert_eq!(
        input_doc.wire_lines().unwrap(),
        output_doc.wire_lines().unwrap()
    );
}

#[tokio::test]
async fn overrides_are_applied_on_upload() {
    let mock = MockArchon::start(MockState::new(32, 32)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(dir.path(), &[("sp1", mock.addr, 32, 32)]);
    let (_delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;
    let device = controllers["sp1"].clone();

    let input = acf_text(&default_acf_lines(32, 32));
    device
        .write_config(
            &input,
            &[("LINECOUNT".to_string(), "64".to_string())],
            &[],
        )
        .await
        .unwrap();

    let (doc, _) = device.read_config().await.unwrap();
    assert_eq!(doc.config().unwrap().get("LINECOUNT"), Some("64"));
}
