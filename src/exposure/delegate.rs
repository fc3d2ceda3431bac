//! Multi-controller exposure orchestration.
//!
//! One exposure is a fleet-wide operation: allocate the next exposure
//! number, run the pre-exposure side effects, broadcast `expose` so all
//! cameras integrate together, run the readout side effects while the
//! hardware reads, fetch every buffer, crop the detector rectangles, and
//! persist one FITS file per (controller, detector) behind a lockfile
//! bracket.
//!
//! The delegate holds an exposure-wide lock while the fleet is in motion;
//! the per-controller operation mutexes nest inside it. The exposure number
//! is only committed once readout begins: an aborted exposure reuses its
//! number, while a persist failure after commit leaves the number advanced
//! and relies on lockfile recovery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use super::header::{build_header, ExposureInfo};
use super::recovery::{ExposureRecovery, LockfilePayload};
use crate::config::Settings;
use crate::controller::{ArchonController, ControllerStatus, ExposeOutcome, FetchedFrame};
use crate::core::{Clock, Cotask, CounterStore, FrameWriter, Reporter, SensorReader};
use crate::error::{ArchonError, ArchonResult};
use crate::storage;

/// Parameters of one exposure request.
#[derive(Debug, Clone)]
pub struct ExposeParams {
    pub exposure_time: Duration,
    /// Read out and persist immediately after integration. With `false` the
    /// charge stays on the chips until an explicit [`ExposureDelegate::readout`].
    pub readout: bool,
    /// Subset of controllers to expose; `None` means the whole fleet.
    pub controllers: Option<Vec<String>>,
    /// Extra header cards merged into every file, last.
    pub extra_header: serde_json::Map<String, Value>,
}

impl ExposeParams {
    pub fn new(exposure_time: Duration) -> Self {
        Self {
            exposure_time,
            readout: true,
            controllers: None,
            extra_header: serde_json::Map::new(),
        }
    }
}

/// Shared state of an exposure between integration and readout.
#[derive(Clone)]
struct ExposeData {
    exposure_no: u64,
    exposure_time: Duration,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    extra_header: serde_json::Map<String, Value>,
}

/// An integrated but not yet read exposure. Holds the exposure-wide lock so
/// nothing else can start until it is read or reset away.
struct PendingExposure {
    _guard: OwnedMutexGuard<()>,
    data: ExposeData,
    controllers: Vec<Arc<ArchonController>>,
}

/// Orchestrates exposures across the controller fleet.
pub struct ExposureDelegate {
    settings: Arc<Settings>,
    controllers: HashMap<String, Arc<ArchonController>>,
    reporter: Reporter,
    writer: Arc<dyn FrameWriter>,
    sensors: Arc<dyn SensorReader>,
    clock: Arc<dyn Clock>,
    counter: Arc<dyn CounterStore>,
    recovery: ExposureRecovery,
    pre_cotasks: Vec<Arc<dyn Cotask>>,
    read_cotasks: Vec<Arc<dyn Cotask>>,
    exposure_lock: Arc<tokio::sync::Mutex<()>>,
    pending: StdMutex<Option<PendingExposure>>,
    last_exposure_no: AtomicU64,
}

impl ExposureDelegate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        controllers: HashMap<String, Arc<ArchonController>>,
        reporter: Reporter,
        writer: Arc<dyn FrameWriter>,
        sensors: Arc<dyn SensorReader>,
        clock: Arc<dyn Clock>,
        counter: Arc<dyn CounterStore>,
    ) -> Self {
        let recovery = ExposureRecovery::new(Arc::clone(&writer), reporter.clone());
        Self {
            settings,
            controllers,
            reporter,
            writer,
            sensors,
            clock,
            counter,
            recovery,
            pre_cotasks: Vec::new(),
            read_cotasks: Vec::new(),
            exposure_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending: StdMutex::new(None),
            last_exposure_no: AtomicU64::new(0),
        }
    }

    /// Registers a side effect run concurrently with integration.
    pub fn with_pre_cotask(mut self, cotask: Arc<dyn Cotask>) -> Self {
        self.pre_cotasks.push(cotask);
        self
    }

    /// Registers a side effect run concurrently with readout; its results
    /// are merged into the matching controller's header.
    pub fn with_read_cotask(mut self, cotask: Arc<dyn Cotask>) -> Self {
        self.read_cotasks.push(cotask);
        self
    }

    /// Number of the most recently committed exposure, if any.
    pub fn last_exposure_no(&self) -> Option<u64> {
        match self.last_exposure_no.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn controller(&self, name: &str) -> ArchonResult<Arc<ArchonController>> {
        self.controllers
            .get(name)
            .cloned()
            .ok_or_else(|| ArchonError::Config(format!("unknown controller {name:?}")))
    }

    pub fn controllers(&self) -> Vec<Arc<ArchonController>> {
        let mut all: Vec<_> = self.controllers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    fn select(&self, names: Option<&[String]>) -> ArchonResult<Vec<Arc<ArchonController>>> {
        match names {
            None => Ok(self.controllers()),
            Some(names) => names.iter().map(|name| self.controller(name)).collect(),
        }
    }

    /// Runs a full exposure. Returns the written paths, or `None` when the
    /// exposure ended without files (aborted, or `readout = false`).
    pub async fn expose(&self, params: ExposeParams) -> ArchonResult<Option<Vec<PathBuf>>> {
        let guard = self
            .exposure_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| {
                ArchonError::InvalidState("an exposure is already in progress".to_string())
            })?;

        let controllers = self.select(params.controllers.as_deref())?;
        if controllers.is_empty() {
            return Err(ArchonError::Config("no controllers selected".to_string()));
        }
        for controller in &controllers {
            let status = controller.status();
            if status.contains(ControllerStatus::EXPOSING) {
                return Err(ArchonError::InvalidState(format!(
                    "{} is exposing",
                    controller.name()
                )));
            }
            if status.contains(ControllerStatus::READOUT_PENDING) {
                return Err(ArchonError::InvalidState(format!(
                    "{} has a read out pending",
                    controller.name()
                )));
            }
            if status.contains(ControllerStatus::ERROR) {
                return Err(ArchonError::InvalidState(format!(
                    "{} has status ERROR",
                    controller.name()
                )));
            }
        }

        self.run_pre_cotasks(&controllers).await;

        let exposure_no = self.counter.peek().await?;
        let start_time = self.clock.now();
        let names: Vec<&str> = controllers.iter().map(|c| c.name()).collect();
        self.reporter
            .text(
                None,
                &format!(
                    "starting exposure {exposure_no} on controllers {}",
                    names.join(", ")
                ),
            )
            .await;

        // Broadcast so all cameras start integrating together.
        let starts = future::join_all(
            controllers
                .iter()
                .map(|c| c.expose(params.exposure_time, params.readout)),
        )
        .await;

        let mut handles = Vec::with_capacity(controllers.len());
        let mut start_error = None;
        for (controller, start) in controllers.iter().zip(starts) {
            match start {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.reporter
                        .error(Some(controller.name()), &err.to_string())
                        .await;
                    if start_error.is_none() {
                        start_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = start_error {
            self.abort_fleet(&controllers).await;
            return Err(err);
        }

        // Fan in as each controller finishes. A failure while peers are
        // still integrating aborts them (a synchronised shot is pointless
        // once one camera is gone); a failure during readout leaves the
        // others to finish, and their files are still written.
        let mut waits: futures::stream::FuturesUnordered<_> = controllers
            .iter()
            .cloned()
            .zip(handles)
            .map(|(controller, handle)| async move { (controller, handle.wait().await) })
            .collect();

        let mut survivors = Vec::new();
        let mut aborted = false;
        let mut failures = Vec::new();
        use futures::StreamExt;
        while let Some((controller, outcome)) = waits.next().await {
            match outcome {
                Ok(ExposeOutcome::Aborted) => aborted = true,
                Ok(_) => survivors.push(controller),
                Err(err) => {
                    self.reporter
                        .error(Some(controller.name()), &err.to_string())
                        .await;
                    failures.push(format!("{}: {err}", controller.name()));
                    self.abort_fleet(&controllers).await;
                }
            }
        }

        if survivors.is_empty() {
            if !failures.is_empty() {
                return Err(ArchonError::Device(format!(
                    "exposure failed: {}",
                    failures.join("; ")
                )));
            }
            if aborted {
                self.reporter
                    .text(None, "exposure aborted; no files will be written")
                    .await;
                return Ok(None);
            }
            return Err(ArchonError::Device("no controller completed".to_string()));
        }

        let data = ExposeData {
            exposure_no,
            exposure_time: params.exposure_time,
            start_time,
            end_time: self.clock.now(),
            extra_header: params.extra_header,
        };

        if params.readout {
            let paths = self.finish(data, &survivors).await?;
            Ok(Some(paths))
        } else {
            *self.pending.lock().expect("pending poisoned") = Some(PendingExposure {
                _guard: guard,
                data,
                controllers: survivors,
            });
            self.reporter
                .text(None, "integration complete; readout pending")
                .await;
            Ok(None)
        }
    }

    /// Reads out, fetches, and persists a previously integrated exposure.
    pub async fn readout(
        &self,
        extra_header: serde_json::Map<String, Value>,
    ) -> ArchonResult<Vec<PathBuf>> {
        let pending = self
            .pending
            .lock()
            .expect("pending poisoned")
            .take()
            .ok_or_else(|| {
                ArchonError::InvalidState("no exposure waiting for readout".to_string())
            })?;

        let mut data = pending.data.clone();
        for (key, value) in extra_header {
            data.extra_header.insert(key, value);
        }
        self.finish(data, &pending.controllers).await
    }

    /// Aborts the in-flight integration on every exposing controller.
    pub async fn abort(&self) -> ArchonResult<()> {
        let exposing: Vec<_> = self
            .controllers()
            .into_iter()
            .filter(|c| c.status().contains(ControllerStatus::EXPOSING))
            .collect();
        if exposing.is_empty() {
            return Err(ArchonError::InvalidState(
                "no exposure in progress".to_string(),
            ));
        }
        for controller in &exposing {
            controller.abort().await?;
        }
        Ok(())
    }

    async fn abort_fleet(&self, controllers: &[Arc<ArchonController>]) {
        for controller in controllers {
            if controller.status().contains(ControllerStatus::EXPOSING) {
                if let Err(err) = controller.abort().await {
                    warn!(controller = controller.name(), %err, "abort failed");
                }
            }
        }
    }

    async fn run_pre_cotasks(&self, controllers: &[Arc<ArchonController>]) {
        if self.pre_cotasks.is_empty() {
            return;
        }
        let names: Vec<String> = controllers.iter().map(|c| c.name().to_string()).collect();
        let results =
            future::join_all(self.pre_cotasks.iter().map(|task| task.run(&names))).await;
        for (task, result) in self.pre_cotasks.iter().zip(results) {
            if let Err(err) = result {
                self.reporter
                    .error(None, &format!("pre-exposure task {} failed: {err}", task.name()))
                    .await;
            }
        }
    }

    /// Readout cotasks and sensor readings, keyed by controller name.
    async fn gather_read_headers(
        &self,
        controllers: &[Arc<ArchonController>],
    ) -> HashMap<String, serde_json::Map<String, Value>> {
        let names: Vec<String> = controllers.iter().map(|c| c.name().to_string()).collect();
        let mut merged: HashMap<String, serde_json::Map<String, Value>> = names
            .iter()
            .map(|name| (name.clone(), serde_json::Map::new()))
            .collect();

        let sensor_results =
            future::join_all(names.iter().map(|name| self.sensors.read(name))).await;
        for (name, result) in names.iter().zip(sensor_results) {
            match result {
                Ok(readings) => merged.get_mut(name).expect("seeded").extend(readings),
                Err(err) => {
                    self.reporter
                        .error(Some(name), &format!("sensor read failed: {err}"))
                        .await;
                }
            }
        }

        let cotask_results =
            future::join_all(self.read_cotasks.iter().map(|task| task.run(&names))).await;
        for (task, result) in self.read_cotasks.iter().zip(cotask_results) {
            match result {
                Ok(by_controller) => {
                    for (name, value) in by_controller {
                        if let (Some(target), Value::Object(map)) =
                            (merged.get_mut(&name), value)
                        {
                            target.extend(map);
                        }
                    }
                }
                Err(err) => {
                    self.reporter
                        .error(None, &format!("readout task {} failed: {err}", task.name()))
                        .await;
                }
            }
        }

        merged
    }

    /// Commits the exposure number, drives readout and fetch, and persists
    /// every file. Per-controller failures exclude that controller but do
    /// not fail the rest; persist failures leave lockfiles behind.
    async fn finish(
        &self,
        data: ExposeData,
        controllers: &[Arc<ArchonController>],
    ) -> ArchonResult<Vec<PathBuf>> {
        // Readout is the point of no return for the exposure number.
        self.counter.commit(data.exposure_no).await?;
        self.last_exposure_no
            .store(data.exposure_no, Ordering::SeqCst);

        // Readout side effects run while the hardware clocks the CCDs.
        let (read_headers, readouts) = tokio::join!(
            self.gather_read_headers(controllers),
            future::join_all(controllers.iter().map(|c| Self::ensure_read(c.clone())))
        );

        let mut readable = Vec::new();
        for (controller, result) in controllers.iter().zip(readouts) {
            match result {
                Ok(()) => readable.push(Arc::clone(controller)),
                Err(err) => {
                    self.reporter
                        .error(
                            Some(controller.name()),
                            &format!("readout failed: {err}"),
                        )
                        .await;
                }
            }
        }

        // Fetch buffers in parallel.
        let fetches =
            future::join_all(readable.iter().map(|c| async { c.fetch(None).await })).await;
        let mut frames: Vec<(Arc<ArchonController>, FetchedFrame)> = Vec::new();
        for (controller, result) in readable.iter().zip(fetches) {
            match result {
                Ok(frame) => frames.push((Arc::clone(controller), frame)),
                Err(err) => {
                    self.reporter
                        .error(Some(controller.name()), &format!("fetch failed: {err}"))
                        .await;
                }
            }
        }

        let info = ExposureInfo {
            exposure_no: data.exposure_no,
            exposure_time_s: data.exposure_time.as_secs_f64(),
            start_time: data.start_time,
            end_time: data.end_time,
        };

        // One payload per (controller, detector).
        let mut payloads: Vec<(LockfilePayload, crate::controller::FrameData)> = Vec::new();
        for (controller, frame) in &frames {
            let name = controller.name();
            let system = controller.system().await.unwrap_or_default();
            let geometry = controller.geometry().ok();
            let empty = serde_json::Map::new();
            let sensor_map = read_headers.get(name).unwrap_or(&empty);

            for (ccd, detector) in &controller.descriptor().detectors {
                let [x0, y0, x1, y1] = detector.area;
                let ccd_data = match frame.data.crop(
                    x0 as usize,
                    y0 as usize,
                    x1 as usize,
                    y1 as usize,
                ) {
                    Ok(cropped) => cropped,
                    Err(err) => {
                        self.reporter
                            .error(Some(name), &format!("detector {ccd}: {err}"))
                            .await;
                        continue;
                    }
                };

                let header = build_header(
                    &self.settings.observatory,
                    name,
                    ccd,
                    detector,
                    geometry.as_ref(),
                    &system,
                    &info,
                    sensor_map,
                    &data.extra_header,
                );

                let filename = self.settings.files.data_dir.join(self.settings.files.render(
                    &self.settings.observatory,
                    self.settings.hemisphere(),
                    name,
                    ccd,
                    data.exposure_no,
                ));

                let payload = LockfilePayload::new(
                    data.exposure_no,
                    name,
                    ccd,
                    frame.buffer,
                    frame.frame_number,
                    &ccd_data,
                    header,
                    filename,
                );
                payloads.push((payload, ccd_data));
            }
        }

        // Persist, each file bracketed by its lockfile.
        let mut written = Vec::new();
        if self.settings.files.concurrent_writes {
            let results = future::join_all(
                payloads
                    .iter()
                    .map(|(payload, data)| self.persist_one(payload, data)),
            )
            .await;
            written.extend(results.into_iter().flatten());
        } else {
            for (payload, data) in &payloads {
                if let Some(path) = self.persist_one(payload, data).await {
                    written.push(path);
                }
            }
        }

        self.reporter.filenames(&written).await;
        for controller in controllers {
            self.reporter
                .status(
                    controller.name(),
                    controller.status(),
                    self.last_exposure_no(),
                )
                .await;
        }

        info!(
            exposure_no = data.exposure_no,
            files = written.len(),
            "exposure complete"
        );
        Ok(written)
    }

    /// Drives one controller to the fetchable state, wherever it is now.
    async fn ensure_read(controller: Arc<ArchonController>) -> ArchonResult<()> {
        let status = controller.status();
        if status.contains(ControllerStatus::FETCH_PENDING) {
            // Auto-read already completed the readout.
            Ok(())
        } else if status.contains(ControllerStatus::READOUT_PENDING) {
            controller.readout().await
        } else {
            Err(ArchonError::InvalidState(format!(
                "{} has no frame to read",
                controller.name()
            )))
        }
    }

    /// Lockfile, write, checksum, unlock. Returns the path on success; on a
    /// persist failure the lockfile survives for recovery and `None` is
    /// returned.
    async fn persist_one(
        &self,
        payload: &LockfilePayload,
        data: &crate::controller::FrameData,
    ) -> Option<PathBuf> {
        let name = payload.controller.clone();
        if let Err(err) = self.recovery.record(payload).await {
            self.reporter
                .error(Some(&name), &format!("could not create lockfile: {err}"))
                .await;
            return None;
        }

        match storage::persist_atomic(
            self.writer.as_ref(),
            data,
            &payload.header,
            &payload.filename,
        )
        .await
        {
            Ok(path) => {
                if let Err(err) = storage::append_checksum(
                    &self.settings.checksum,
                    &path,
                    self.clock.now(),
                )
                .await
                {
                    self.reporter
                        .error(Some(&name), &format!("checksum failed: {err}"))
                        .await;
                }
                if let Err(err) = self.recovery.release(&payload.filename, false).await {
                    self.reporter
                        .error(Some(&name), &format!("could not remove lockfile: {err}"))
                        .await;
                }
                self.reporter
                    .text(
                        Some(&name),
                        &format!("file {} written to disk", path.display()),
                    )
                    .await;
                Some(path)
            }
            Err(err) => {
                // The lockfile keeps the data; recovery will redo the write.
                self.reporter
                    .error(
                        Some(&name),
                        &format!(
                            "failed writing {}: {err}; lockfile retained",
                            payload.filename.display()
                        ),
                    )
                    .await;
                None
            }
        }
    }

    /// Aborts any in-flight exposure fleet-wide, discards pending readouts,
    /// and resets every controller to IDLE.
    pub async fn reset(&self) -> ArchonResult<()> {
        *self.pending.lock().expect("pending poisoned") = None;

        let controllers = self.controllers();
        self.abort_fleet(&controllers).await;
        for controller in &controllers {
            if !controller.is_connected() {
                continue;
            }
            if let Err(err) = controller.reset().await {
                self.reporter
                    .error(Some(controller.name()), &format!("reset failed: {err}"))
                    .await;
            }
        }
        self.reporter.text(None, "fleet reset complete").await;
        Ok(())
    }

    /// Replays any lockfiles under the data directory.
    pub async fn recover(&self) -> ArchonResult<Vec<PathBuf>> {
        self.recovery
            .recover_dir(&self.settings.files.data_dir)
            .await
    }
}
