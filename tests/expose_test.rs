//! End-to-end exposure scenarios against mock controllers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use archond::controller::ControllerStatus;
use archond::core::CounterStore;
use archond::exposure::{ExposeParams, FileCounterStore};
use common::{build_delegate, MemorySink, MemoryWriter, MockArchon, MockState};
use tokio::sync::watch;

/// Records every observed status value, with timestamps.
fn record_status(
    mut rx: watch::Receiver<ControllerStatus>,
) -> Arc<Mutex<Vec<(Instant, ControllerStatus)>>> {
    let seen = Arc::new(Mutex::new(vec![(Instant::now(), *rx.borrow_and_update())]));
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = *rx.borrow_and_update();
            sink.lock().unwrap().push((Instant::now(), value));
        }
    });
    seen
}

/// True if `expected` appears, in order, within `observed`.
fn is_subsequence(expected: &[ControllerStatus], observed: &[ControllerStatus]) -> bool {
    let mut idx = 0;
    for value in observed {
        if idx < expected.len() && *value == expected[idx] {
            idx += 1;
        }
    }
    idx == expected.len()
}

#[tokio::test]
async fn single_controller_exposure_writes_one_file() {
    let mock = MockArchon::start(MockState::new(100, 100)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(dir.path(), &[("sp1", mock.addr, 100, 100)]);
    let (delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;

    let device = controllers["sp1"].clone();
    let poweron = ControllerStatus::POWERON;
    assert_eq!(device.status(), ControllerStatus::IDLE | poweron);

    let seen = record_status(device.subscribe_status());

    let paths = delegate
        .expose(ExposeParams::new(Duration::from_secs(1)))
        .await
        .unwrap()
        .expect("files written");

    assert_eq!(paths.len(), 1);
    assert_eq!(
        paths[0].file_name().unwrap().to_str().unwrap(),
        "archon-sp1-r1-00000001.fits"
    );
    assert!(paths[0].exists());
    // The lockfile was removed after the rename.
    assert!(!paths[0].with_extension("fits.lock").exists());

    // Status walked the expected path.
    let observed: Vec<ControllerStatus> =
        seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
    let expected = [
        ControllerStatus::IDLE | poweron,
        ControllerStatus::EXPOSING | ControllerStatus::READOUT_PENDING | poweron,
        ControllerStatus::READING | poweron,
        ControllerStatus::FETCH_PENDING | poweron,
        ControllerStatus::IDLE | poweron,
    ];
    assert!(
        is_subsequence(&expected, &observed),
        "transitions missing from {observed:?}"
    );

    // The reply stream carried a consistent status event and the filenames.
    let statuses = sink.with_key("status");
    assert!(!statuses.is_empty());
    let last = &statuses[statuses.len() - 1];
    let bits = last.payload["status"].as_u64().unwrap() as u16;
    let names: Vec<String> = last.payload["status_names"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        ControllerStatus::from_bits(bits).unwrap().names(),
        names.iter().map(String::as_str).collect::<Vec<_>>()
    );

    let filenames = sink.with_key("filenames");
    assert_eq!(filenames.len(), 1);
    assert_eq!(
        filenames[0].payload["filenames"].as_array().unwrap().len(),
        1
    );
}

#[tokio::test]
async fn two_controller_exposure_is_synchronised() {
    let mock1 = MockArchon::start(MockState::new(64, 64)).await;
    let mock2 = MockArchon::start(MockState::new(64, 64)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(
        dir.path(),
        &[("sp1", mock1.addr, 64, 64), ("sp2", mock2.addr, 64, 64)],
    );
    let (delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;

    let seen1 = record_status(controllers["sp1"].subscribe_status());
    let seen2 = record_status(controllers["sp2"].subscribe_status());

    let paths = delegate
        .expose(ExposeParams::new(Duration::from_secs(1)))
        .await
        .unwrap()
        .expect("files written");

    assert_eq!(paths.len(), 2);
    for path in &paths {
        assert!(path.exists());
    }
    let filenames = sink.with_key("filenames");
    assert_eq!(
        filenames[0].payload["filenames"].as_array().unwrap().len(),
        2
    );

    // Both cameras began integrating together.
    let start_of = |seen: &Arc<Mutex<Vec<(Instant, ControllerStatus)>>>| {
        seen.lock()
            .unwrap()
            .iter()
            .find(|(_, s)| s.contains(ControllerStatus::EXPOSING))
            .map(|(t, _)| *t)
            .expect("controller never exposed")
    };
    let (t1, t2) = (start_of(&seen1), start_of(&seen2));
    let skew = t1.max(t2) - t1.min(t2);
    assert!(skew < Duration::from_millis(100), "start skew {skew:?}");
}

#[tokio::test]
async fn abort_returns_to_idle_without_advancing_the_counter() {
    let mock = MockArchon::start(MockState::new(32, 32)).await;
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let counter_path = dir.path().join("counter");
    let settings = common::test_settings(dir.path(), &[("sp1", mock.addr, 32, 32)]);
    let (delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &counter_path,
    )
    .await;
    let device = controllers["sp1"].clone();

    // A long exposure, aborted shortly after the start.
    let exposing = {
        let delegate = Arc::clone(&delegate);
        tokio::spawn(async move {
            delegate
                .expose(ExposeParams::new(Duration::from_secs(60)))
                .await
        })
    };

    let mut rx = device.subscribe_status();
    while !rx.borrow_and_update().contains(ControllerStatus::EXPOSING) {
        rx.changed().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    delegate.abort().await.unwrap();

    let result = exposing.await.unwrap().unwrap();
    assert!(result.is_none(), "aborted exposure must not produce files");

    assert!(device
        .status()
        .contains(ControllerStatus::IDLE));
    assert!(!device.status().contains(ControllerStatus::READOUT_PENDING));

    // No file, and the exposure number was not consumed.
    let counter = FileCounterStore::new(&counter_path);
    assert_eq!(counter.peek().await.unwrap(), 1);
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "fits"))
        .collect();
    assert!(entries.is_empty());

    // The abort did not poison the fleet: a short exposure still works.
    let paths = delegate
        .expose(ExposeParams::new(Duration::from_millis(200)))
        .await
        .unwrap()
        .expect("files written");
    assert_eq!(paths.len(), 1);
    // The aborted exposure's number was reused.
    assert!(paths[0]
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .contains("00000001"));
}

#[tokio::test]
async fn connection_drop_mid_readout_spares_the_other_controller() {
    let mock1 = MockArchon::start(MockState::new(32, 32)).await;
    let mock2 = MockArchon::start(MockState::new(32, 32)).await;
    // sp2's readout takes long enough to kill the link mid-flight.
    mock2.with_state(|s| s.readout_ms = 2_000);

    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let settings = common::test_settings(
        dir.path(),
        &[("sp1", mock1.addr, 32, 32), ("sp2", mock2.addr, 32, 32)],
    );
    let (delegate, controllers) = build_delegate(
        settings,
        Arc::clone(&sink),
        Arc::new(MemoryWriter),
        &dir.path().join("counter"),
    )
    .await;
    let sp2 = controllers["sp2"].clone();

    let exposing = {
        let delegate = Arc::clone(&delegate);
        tokio::spawn(async move {
            delegate
                .expose(ExposeParams::new(Duration::from_millis(300)))
                .await
        })
    };

    // Wait for sp2 to start reading, then cut its link.
    let mut rx = sp2.subscribe_status();
    while !rx.borrow_and_update().contains(ControllerStatus::READING) {
        rx.changed().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    mock2.drop_clients();

    // sp1 still delivers its file.
    let paths = exposing.await.unwrap().unwrap().expect("sp1 file written");
    assert_eq!(paths.len(), 1);
    assert!(paths[0].to_str().unwrap().contains("sp1"));

    // sp2's failure was surfaced.
    let errors = sink.with_key("error");
    assert!(errors
        .iter()
        .any(|e| e.payload["controller"] == serde_json::json!("sp2")));

    // After an explicit reconnect the controller comes back; with no
    // complete buffer captured there is nothing to recover.
    sp2.reconnect().await.unwrap();
    assert!(sp2.status().contains(ControllerStatus::IDLE));
    let recovered = delegate.recover().await.unwrap();
    assert!(recovered.is_empty());
}
