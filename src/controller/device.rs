//! High-level driver for one Archon controller.
//!
//! [`ArchonController`] owns the protocol client, the parsed ACF, and the
//! exposure state machine. The expose / readout / fetch / flush /
//! write-config operations are serialised through a controller-local mutex;
//! pure polls (`STATUS`, `SYSTEM`, `FRAME`) are not gated and may run at any
//! time.
//!
//! Failure discipline: a NAK, timeout, or disconnect on the exposure path
//! raises the `ERROR` status bit and the controller refuses further
//! exposures until [`reset`](ArchonController::reset). A failed
//! `write_config` instead clears the valid-configuration flag without
//! touching status; `expose` then refuses with a configuration error until a
//! successful reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::acf::AcfDocument;
use super::client::{ArchonClient, SendOptions};
use super::codec::BINARY_CHUNK;
use super::command::Reply;
use super::frame::{FrameData, FrameInfo};
use super::geometry::FrameGeometry;
use super::status::ControllerStatus;
use crate::config::{ControllerConfig, TimeoutSettings};
use crate::error::{ArchonError, ArchonResult};

/// Apply step issued after a configuration upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyCommand {
    All,
    Cds,
    System,
    Timing,
}

impl ApplyCommand {
    fn as_str(&self) -> &'static str {
        match self {
            ApplyCommand::All => "APPLYALL",
            ApplyCommand::Cds => "APPLYCDS",
            ApplyCommand::System => "APPLYSYSTEM",
            ApplyCommand::Timing => "LOADTIMING",
        }
    }
}

/// Backplane module types reported by `SYSTEM` (`MODn_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModType {
    None = 0,
    Driver = 1,
    Ad = 2,
    LvBias = 3,
    HvBias = 4,
    Heater = 5,
    Hs = 7,
    HvxBias = 8,
    LvxBias = 9,
    Lvds = 10,
    HeaterX = 11,
    XvBias = 12,
    Adf = 13,
    Adx = 14,
    AdLn = 15,
    Unknown = 16,
}

impl ModType {
    pub fn from_code(code: u8) -> ModType {
        match code {
            0 => ModType::None,
            1 => ModType::Driver,
            2 => ModType::Ad,
            3 => ModType::LvBias,
            4 => ModType::HvBias,
            5 => ModType::Heater,
            7 => ModType::Hs,
            8 => ModType::HvxBias,
            9 => ModType::LvxBias,
            10 => ModType::Lvds,
            11 => ModType::HeaterX,
            12 => ModType::XvBias,
            13 => ModType::Adf,
            14 => ModType::Adx,
            15 => ModType::AdLn,
            _ => ModType::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModType::None => "NONE",
            ModType::Driver => "DRIVER",
            ModType::Ad => "AD",
            ModType::LvBias => "LVBIAS",
            ModType::HvBias => "HVBIAS",
            ModType::Heater => "HEATER",
            ModType::Hs => "HS",
            ModType::HvxBias => "HVXBIAS",
            ModType::LvxBias => "LVXBIAS",
            ModType::Lvds => "LVDS",
            ModType::HeaterX => "HEATERX",
            ModType::XvBias => "XVBIAS",
            ModType::Adf => "ADF",
            ModType::Adx => "ADX",
            ModType::AdLn => "ADLN",
            ModType::Unknown => "UNKNOWN",
        }
    }
}

/// Power state reported by the `STATUS` keyword `POWER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchonPower {
    Unknown = 0,
    NotConfigured = 1,
    Off = 2,
    Intermediate = 3,
    On = 4,
    Standby = 5,
}

impl ArchonPower {
    pub fn from_code(code: i64) -> ArchonPower {
        match code {
            1 => ArchonPower::NotConfigured,
            2 => ArchonPower::Off,
            3 => ArchonPower::Intermediate,
            4 => ArchonPower::On,
            5 => ArchonPower::Standby,
            _ => ArchonPower::Unknown,
        }
    }
}

/// How an exposure driver finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeOutcome {
    /// The exposure was aborted; nothing to read.
    Aborted,
    /// Integration finished; an explicit readout is still required.
    ReadoutPending,
    /// Integration and readout finished; a complete buffer awaits fetch.
    FetchPending,
}

/// Handle on an in-flight exposure. Resolves when readout completes (or when
/// integration completes, for `auto_read = false`).
pub struct ExposureHandle {
    task: JoinHandle<ArchonResult<ExposeOutcome>>,
}

impl ExposureHandle {
    pub async fn wait(self) -> ArchonResult<ExposeOutcome> {
        self.task
            .await
            .map_err(|err| ArchonError::Device(format!("exposure task failed: {err}")))?
    }
}

/// A frame fetched from a controller buffer.
#[derive(Debug, Clone)]
pub struct FetchedFrame {
    pub controller: String,
    pub buffer: u8,
    pub frame_number: u64,
    pub data: FrameData,
}

/// Converts an integration time to the centisecond count the timing script
/// expects, rounding to the nearest centisecond.
pub fn centiseconds(t: Duration) -> u64 {
    (t.as_millis() as u64 + 5) / 10
}

/// High-level interface to one Archon controller.
pub struct ArchonController {
    name: String,
    descriptor: ControllerConfig,
    timeouts: TimeoutSettings,
    client: ArchonClient,
    acf: StdMutex<Option<AcfDocument>>,
    parameters: StdMutex<HashMap<String, i64>>,
    /// A valid configuration is loaded; exposures are refused otherwise.
    config_ok: AtomicBool,
    auto_flush: AtomicBool,
    /// Serialises expose / readout / fetch / flush / write_config.
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ArchonController {
    pub fn new(name: &str, descriptor: ControllerConfig, timeouts: TimeoutSettings) -> Self {
        let client = ArchonClient::new(name, &descriptor.host, descriptor.port, timeouts.connect());
        Self {
            name: name.to_string(),
            descriptor,
            timeouts,
            client,
            acf: StdMutex::new(None),
            parameters: StdMutex::new(HashMap::new()),
            config_ok: AtomicBool::new(false),
            auto_flush: AtomicBool::new(false),
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ControllerConfig {
        &self.descriptor
    }

    pub fn status(&self) -> ControllerStatus {
        self.client.status()
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<ControllerStatus> {
        self.client.subscribe_status()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn has_valid_config(&self) -> bool {
        self.config_ok.load(Ordering::SeqCst)
    }

    /// Connects, retrieves the ACF from the controller, and resets. On
    /// success the status is `IDLE | POWERON` (or `POWERBAD` if the power
    /// check says so).
    pub async fn connect(self: &Arc<Self>) -> ArchonResult<()> {
        self.client.connect().await?;

        match self.read_config().await {
            Ok(_) => debug!(controller = %self.name, "ACF retrieved from controller"),
            Err(err) => {
                warn!(controller = %self.name, %err, "could not read ACF on connect");
            }
        }

        self.reset().await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Explicit reconnect. In-flight state is gone; a reset re-arms the
    /// controller.
    pub async fn reconnect(self: &Arc<Self>) -> ArchonResult<()> {
        self.client.disconnect().await;
        self.connect().await
    }

    /// Sends one command and waits for its reply.
    pub async fn command(&self, text: &str, timeout: Option<Duration>) -> ArchonResult<Reply> {
        let opts = SendOptions {
            timeout: timeout.or(Some(self.timeouts.command())),
            ..Default::default()
        };
        self.client.send(text, opts).await?.wait().await
    }

    /// Raw command pass-through for the `talk` surface; returns the reply
    /// without interpreting it.
    pub async fn talk(&self, text: &str) -> ArchonResult<Reply> {
        let opts = SendOptions {
            timeout: Some(self.timeouts.command()),
            ..Default::default()
        };
        Ok(self.client.send(text, opts).await?.outcome().await)
    }

    fn keyword_map(line: &str) -> ArchonResult<Vec<(String, String)>> {
        line.split_whitespace()
            .map(|word| {
                word.split_once('=')
                    .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                    .ok_or_else(|| ArchonError::Protocol(format!("bad keyword {word:?}")))
            })
            .collect()
    }

    /// `SYSTEM` keyword map, with `modN_type` codes decoded into
    /// `modN_name` entries.
    pub async fn system(&self) -> ArchonResult<serde_json::Map<String, Value>> {
        let reply = self.command("SYSTEM", Some(self.timeouts.status())).await?;
        let mut map = serde_json::Map::new();
        for (key, value) in Self::keyword_map(reply.line())? {
            if let Some(slot) = key
                .strip_prefix("mod")
                .and_then(|rest| rest.strip_suffix("_type"))
                .map(str::to_string)
            {
                if let Ok(code) = value.parse::<u8>() {
                    map.insert(
                        format!("mod{slot}_name"),
                        json!(ModType::from_code(code).name()),
                    );
                }
            }
            map.insert(key, json!(value));
        }
        Ok(map)
    }

    /// `STATUS` keyword map, numbers parsed. Also refreshes the power bits
    /// unless `update_power` is false.
    pub async fn device_status(
        &self,
        update_power: bool,
    ) -> ArchonResult<serde_json::Map<String, Value>> {
        let reply = self.command("STATUS", Some(self.timeouts.status())).await?;
        let mut map = serde_json::Map::new();
        for (key, value) in Self::keyword_map(reply.line())? {
            let parsed = if let Ok(int) = value.parse::<i64>() {
                json!(int)
            } else if let Ok(float) = value.parse::<f64>() {
                json!(float)
            } else {
                json!(value)
            };
            map.insert(key, parsed);
        }

        if update_power {
            self.apply_power_bits(&map);
        }
        Ok(map)
    }

    fn apply_power_bits(&self, status_map: &serde_json::Map<String, Value>) {
        let power = status_map
            .get("power")
            .and_then(Value::as_i64)
            .map(ArchonPower::from_code)
            .unwrap_or(ArchonPower::Unknown);
        let power_good = status_map
            .get("powergood")
            .and_then(Value::as_i64)
            .unwrap_or(1)
            == 1;

        if !power_good || !matches!(power, ArchonPower::On | ArchonPower::Off) {
            self.client.update_status(ControllerStatus::POWERBAD, true);
        } else if power == ArchonPower::On {
            self.client.update_status(ControllerStatus::POWERON, true);
        } else {
            self.client.update_status(ControllerStatus::POWEROFF, true);
        }
    }

    /// Switches CCD bias power; with `mode = None` only refreshes the bits.
    pub async fn power(&self, mode: Option<bool>) -> ArchonResult<ArchonPower> {
        if let Some(on) = mode {
            let text = if on { "POWERON" } else { "POWEROFF" };
            let result = self.command(text, Some(self.timeouts.power())).await;
            if let Err(err) = result {
                self.client.update_status(
                    ControllerStatus::ERROR | ControllerStatus::POWERBAD,
                    true,
                );
                return Err(err);
            }
            // Bias rails settle before the readback is meaningful.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let status = self.device_status(true).await?;
        Ok(status
            .get("power")
            .and_then(Value::as_i64)
            .map(ArchonPower::from_code)
            .unwrap_or(ArchonPower::Unknown))
    }

    /// `FRAME` buffer report. Not gated by the operation lock.
    pub async fn frame(&self) -> ArchonResult<FrameInfo> {
        let reply = self.command("FRAME", Some(self.timeouts.status())).await?;
        FrameInfo::parse(reply.line())
    }

    // -------------------------------------------------------------------------
    // Parameters and configuration
    // -------------------------------------------------------------------------

    /// Sets a timing-script parameter through `FASTLOADPARAM`. Unknown
    /// parameters are skipped with a warning, matching the permissive
    /// behaviour needed while an ACF is only partially known.
    pub async fn set_param(&self, name: &str, value: i64) -> ArchonResult<bool> {
        let known = {
            let params = self.parameters.lock().expect("parameters poisoned");
            params.contains_key(&name.to_uppercase())
        };
        if !known {
            warn!(controller = %self.name, parameter = name, "unknown parameter, not set");
            return Ok(false);
        }

        self.command(&format!("FASTLOADPARAM {name} {value}"), None)
            .await?;
        self.parameters
            .lock()
            .expect("parameters poisoned")
            .insert(name.to_uppercase(), value);
        debug!(controller = %self.name, parameter = name, value, "parameter set");
        Ok(true)
    }

    pub fn parameter(&self, name: &str) -> Option<i64> {
        self.parameters
            .lock()
            .expect("parameters poisoned")
            .get(&name.to_uppercase())
            .copied()
    }

    /// Enables or disables the idle flushing of the detector.
    pub async fn set_autoflush(&self, mode: bool) -> ArchonResult<()> {
        self.set_param("AutoFlush", i64::from(mode)).await?;
        self.auto_flush.store(mode, Ordering::SeqCst);
        Ok(())
    }

    /// Whether idle flushing is currently enabled.
    pub fn auto_flush(&self) -> bool {
        self.auto_flush.load(Ordering::SeqCst)
    }

    /// Rewrites one configuration line (by name) on the controller, then
    /// activates it with `apply` (e.g. `APPLYCDS`) when given.
    pub async fn write_line(
        &self,
        key: &str,
        value: &str,
        apply: Option<&str>,
    ) -> ArchonResult<()> {
        let (line_no, line) = {
            let mut acf = self.acf.lock().expect("acf poisoned");
            let doc = acf
                .as_mut()
                .ok_or_else(|| ArchonError::Config("controller ACF is unknown".to_string()))?;
            let line_no = doc.set_config_value(key, value)?;
            let line = format!(
                "{}={}",
                key.to_uppercase().replace('\\', "/"),
                value.trim_matches('"')
            );
            (line_no, line)
        };

        self.command(&format!("WCONFIG{line_no:04X}{line}"), None)
            .await?;

        if let Some(apply) = apply {
            self.command(&apply.to_uppercase(), Some(self.timeouts.apply()))
                .await?;
            info!(controller = %self.name, key, value, "config line applied");
        }
        Ok(())
    }

    /// Reads the full configuration back from the controller, stopping at
    /// the first empty `RCONFIG` reply. Stores and returns the parsed
    /// document together with its text form.
    pub async fn read_config(&self) -> ArchonResult<(AcfDocument, String)> {
        let _guard = self.op_lock.clone().lock_owned().await;

        self.command("POLLOFF", None).await?;
        let result = self.read_config_lines().await;
        // Restore internal polling whatever happened.
        let pollon = self.command("POLLON", None).await;
        let lines = result?;
        pollon?;

        let mut text = String::from("[CONFIG]\n");
        for line in &lines {
            text.push_str(line);
            text.push('\n');
        }

        let doc = AcfDocument::parse(&text)?;
        self.install_config(doc.clone())?;
        Ok((doc, text))
    }

    async fn read_config_lines(&self) -> ArchonResult<Vec<String>> {
        const CHUNK: usize = 64;
        let mut lines = Vec::new();
        let mut next = 0usize;
        'outer: loop {
            let batch: Vec<String> = (next..next + CHUNK)
                .map(|n| format!("RCONFIG{n:04X}"))
                .collect();
            next += CHUNK;
            let (done, failed) = self
                .client
                .send_many(&batch, CHUNK, Some(self.timeouts.status()))
                .await?;
            if let Some(failure) = failed.first() {
                return Err(ArchonError::Config(format!(
                    "{} failed while reading configuration",
                    failure.command
                )));
            }
            for reply in done {
                if reply.line().is_empty() {
                    break 'outer;
                }
                lines.push(reply.line().to_string());
            }
        }
        Ok(lines)
    }

    fn install_config(&self, doc: AcfDocument) -> ArchonResult<()> {
        let params = doc.parameters()?;
        *self.parameters.lock().expect("parameters poisoned") = params;
        *self.acf.lock().expect("acf poisoned") = Some(doc);
        self.config_ok.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Uploads a full configuration: `POLLOFF`, `CLEARCONFIG`, the
    /// `WCONFIGnnnn` stream (rate-limited), overrides, the requested apply
    /// steps, `POLLON`. Fails atomically: the first NAK abandons the upload
    /// and reports the offending line; the controller keeps its status but
    /// loses its valid-configuration flag until a successful reload.
    pub async fn write_config(
        &self,
        text: &str,
        overrides: &[(String, String)],
        apply: &[ApplyCommand],
    ) -> ArchonResult<()> {
        let doc = AcfDocument::parse(text)?;
        let wire_lines = doc.wire_lines()?;

        let _guard = self.op_lock.clone().lock_owned().await;
        self.config_ok.store(false, Ordering::SeqCst);

        self.command("POLLOFF", None).await?;

        let result = async {
            self.command("CLEARCONFIG", Some(self.timeouts.write_config()))
                .await
                .map_err(|_| {
                    ArchonError::Config("CLEARCONFIG failed; upload abandoned".to_string())
                })?;
            self.write_config_lines(&wire_lines).await
        }
        .await;
        if let Err(err) = result {
            // Best effort: the controller should keep polling internally.
            let _ = self.command("POLLON", None).await;
            return Err(err);
        }

        self.install_config(doc)?;

        for (key, value) in overrides {
            self.write_line(key, value, None).await?;
        }

        self.command("POLLON", None).await?;

        for step in apply {
            self.command(step.as_str(), Some(self.timeouts.apply()))
                .await
                .map_err(|err| match err {
                    ArchonError::CommandFailed { .. } | ArchonError::Timeout { .. } => {
                        ArchonError::Config(format!("{} failed after upload", step.as_str()))
                    }
                    other => other,
                })?;
        }

        info!(controller = %self.name, lines = wire_lines.len(), "configuration written");
        Ok(())
    }

    async fn write_config_lines(&self, wire_lines: &[String]) -> ArchonResult<()> {
        let delay = self.timeouts.write_config_delay();
        for (n, line) in wire_lines.iter().enumerate() {
            let text = format!("WCONFIG{n:04X}{line}");
            if let Err(err) = self.command(&text, Some(self.timeouts.write_config())).await {
                return Err(ArchonError::Config(format!(
                    "config upload failed at line {n} ({line:?}): {err}"
                )));
            }
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Readout geometry computed from the loaded parameter table.
    pub fn geometry(&self) -> ArchonResult<FrameGeometry> {
        let taplines = {
            let acf = self.acf.lock().expect("acf poisoned");
            let doc = acf
                .as_ref()
                .ok_or_else(|| ArchonError::Config("controller ACF is unknown".to_string()))?;
            doc.taplines().unwrap_or(1)
        };
        let params = self.parameters.lock().expect("parameters poisoned");
        FrameGeometry::from_parameters(&params, taplines)
    }

    // -------------------------------------------------------------------------
    // Exposure state machine
    // -------------------------------------------------------------------------

    /// Marks device-side failures on the exposure path.
    fn flag_expose_failure(&self, err: &ArchonError) {
        if err.is_device_error() {
            self.client.update_status(ControllerStatus::ERROR, true);
        }
    }

    /// Holds timing, zeroes the exposure parameters, and re-releases. Also
    /// the recovery from the `ERROR` bit.
    pub async fn reset(&self) -> ArchonResult<()> {
        let _guard = self.op_lock.clone().lock_owned().await;
        self.reset_inner(true, true).await
    }

    async fn reset_inner(&self, autoflush: bool, release_timing: bool) -> ArchonResult<()> {
        info!(controller = %self.name, "resetting");

        self.command("HOLDTIMING", None).await?;

        self.set_autoflush(autoflush).await?;
        for param in ["Exposures", "ReadOut", "AbortExposure", "DoFlush", "WaitCount"] {
            self.set_param(param, 0).await?;
        }

        if release_timing {
            let result = self.command("RELEASETIMING", Some(self.timeouts.command())).await;
            if let Err(err) = result {
                self.flag_expose_failure(&err);
                return Err(err);
            }
        }

        self.client.transition_status(
            ControllerStatus::ERROR
                | ControllerStatus::READOUT_PENDING
                | ControllerStatus::FETCH_PENDING
                | ControllerStatus::FLUSHING,
            ControllerStatus::IDLE,
        );

        // Sets the power bits.
        self.power(None).await?;
        Ok(())
    }

    /// Starts an integration of `exposure_time`. Requires `IDLE`, no pending
    /// readout, and good power. Returns a handle resolving when readout
    /// completes (`auto_read`) or when integration completes.
    pub async fn expose(
        self: &Arc<Self>,
        exposure_time: Duration,
        auto_read: bool,
    ) -> ArchonResult<ExposureHandle> {
        let guard = self.op_lock.clone().lock_owned().await;

        let status = self.status();
        if !status.contains(ControllerStatus::IDLE) {
            return Err(ArchonError::InvalidState(format!(
                "{} is not idle",
                self.name
            )));
        }
        if status.contains(ControllerStatus::READOUT_PENDING) {
            return Err(ArchonError::InvalidState(format!(
                "{} has a readout pending; read the device or flush",
                self.name
            )));
        }
        if status.contains(ControllerStatus::ERROR) {
            return Err(ArchonError::InvalidState(format!(
                "{} is in ERROR state; reset first",
                self.name
            )));
        }
        if !self.has_valid_config() {
            return Err(ArchonError::Config(format!(
                "{} has no valid configuration loaded",
                self.name
            )));
        }
        if !status.contains(ControllerStatus::POWERON)
            || status.contains(ControllerStatus::POWERBAD)
        {
            return Err(ArchonError::Device(format!(
                "{} power is off or invalid",
                self.name
            )));
        }

        let setup = self.expose_setup(exposure_time, auto_read).await;
        let start_frame = match setup {
            Ok(start_frame) => start_frame,
            Err(err) => {
                self.flag_expose_failure(&err);
                return Err(err);
            }
        };

        self.client.update_status(
            ControllerStatus::EXPOSING | ControllerStatus::READOUT_PENDING,
            true,
        );
        info!(
            controller = %self.name,
            centiseconds = centiseconds(exposure_time),
            auto_read,
            "exposure started"
        );

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this
                .drive_exposure(exposure_time, auto_read, start_frame)
                .await;
            if let Err(err) = &result {
                this.flag_expose_failure(err);
            }
            drop(guard);
            result
        });
        Ok(ExposureHandle { task })
    }

    /// Pokes the timing parameters for an exposure and records the starting
    /// frame number.
    async fn expose_setup(&self, exposure_time: Duration, auto_read: bool) -> ArchonResult<u64> {
        self.reset_inner(false, false).await?;

        self.set_param("ReadOut", i64::from(auto_read)).await?;
        self.set_param("IntMS", centiseconds(exposure_time) as i64)
            .await?;
        self.set_param("Exposures", 1).await?;

        let start_frame = self.frame().await?.max_frame_number();

        self.command("RELEASETIMING", Some(self.timeouts.command()))
            .await?;
        Ok(start_frame)
    }

    async fn drive_exposure(
        self: &Arc<Self>,
        exposure_time: Duration,
        auto_read: bool,
        start_frame: u64,
    ) -> ArchonResult<ExposeOutcome> {
        // Integration: wake early if an abort moves the status off EXPOSING.
        let mut status_rx = self.subscribe_status();
        if !status_rx.borrow_and_update().contains(ControllerStatus::EXPOSING) {
            return Ok(ExposeOutcome::Aborted);
        }
        let deadline = tokio::time::Instant::now() + exposure_time;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(ArchonError::Disconnected);
                    }
                    if !status_rx.borrow().contains(ControllerStatus::EXPOSING) {
                        return Ok(ExposeOutcome::Aborted);
                    }
                }
            }
        }
        if !self.status().contains(ControllerStatus::EXPOSING) {
            return Ok(ExposeOutcome::Aborted);
        }

        if !auto_read {
            // Integration done; the charge sits on the chip until an
            // explicit readout or flush.
            self.client
                .transition_status(ControllerStatus::empty(), ControllerStatus::IDLE);
            return Ok(ExposeOutcome::ReadoutPending);
        }

        self.client.transition_status(
            ControllerStatus::READOUT_PENDING,
            ControllerStatus::READING,
        );

        self.wait_readout_complete(start_frame).await?;
        Ok(ExposeOutcome::FetchPending)
    }

    /// Polls `FRAME` until a buffer completes with a frame number beyond the
    /// exposure's starting value, then flips `READING` to `FETCH_PENDING`.
    /// The timing script decrements `Exposures` itself; completion is only
    /// ever trusted from this read-back.
    async fn wait_readout_complete(&self, start_frame: u64) -> ArchonResult<()> {
        let started = tokio::time::Instant::now();
        let max_wait = self.timeouts.readout_max();
        let poll = self.timeouts.poll_interval();

        loop {
            if started.elapsed() > max_wait {
                self.client.update_status(ControllerStatus::ERROR, true);
                return Err(ArchonError::Device(format!(
                    "{} timed out waiting for readout to complete",
                    self.name
                )));
            }

            // STATUS keeps the power bits honest while the hardware reads.
            let _ = self.device_status(true).await;

            let frame = self.frame().await?;
            if let Some(buf) = frame.latest_complete() {
                if buf.frame_number > start_frame {
                    self.client.transition_status(
                        ControllerStatus::READING,
                        ControllerStatus::FETCH_PENDING,
                    );
                    // Idle clocking resumes now the charge is off the chip.
                    let _ = self.set_autoflush(true).await;
                    debug!(
                        controller = %self.name,
                        buffer = buf.index,
                        frame = buf.frame_number,
                        "readout complete"
                    );
                    return Ok(());
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Aborts the current integration. Valid only while `EXPOSING`.
    pub async fn abort(&self) -> ArchonResult<()> {
        if !self.status().contains(ControllerStatus::EXPOSING) {
            return Err(ArchonError::InvalidState(format!(
                "{} is not exposing",
                self.name
            )));
        }

        info!(controller = %self.name, "aborting exposure");
        self.set_param("ReadOut", 0).await?;
        self.set_param("AbortExposure", 1).await?;

        self.client.transition_status(
            ControllerStatus::READOUT_PENDING,
            ControllerStatus::IDLE,
        );
        Ok(())
    }

    /// Triggers a readout of the pending charge. Valid in `READOUT_PENDING`.
    /// Completes once the polled `FRAME` reports the new buffer complete.
    pub async fn readout(self: &Arc<Self>) -> ArchonResult<()> {
        let _guard = self.op_lock.clone().lock_owned().await;

        let status = self.status();
        if !status.contains(ControllerStatus::READOUT_PENDING)
            || status.contains(ControllerStatus::EXPOSING)
        {
            return Err(ArchonError::InvalidState(format!(
                "{} is not in a readable state",
                self.name
            )));
        }

        let result = async {
            let start_frame = self.frame().await?.max_frame_number();
            self.reset_inner(false, false).await?;
            self.set_param("ReadOut", 1).await?;
            self.command("RELEASETIMING", Some(self.timeouts.command()))
                .await?;

            self.client.transition_status(
                ControllerStatus::READOUT_PENDING,
                ControllerStatus::READING,
            );

            self.wait_readout_complete(start_frame).await
        }
        .await;

        if let Err(err) = &result {
            self.flag_expose_failure(err);
        }
        result
    }

    /// Fetches a buffer. With `buffer = None`, requires `FETCH_PENDING` and
    /// picks the complete buffer with the highest frame number.
    pub async fn fetch(self: &Arc<Self>, buffer: Option<u8>) -> ArchonResult<FetchedFrame> {
        let _guard = self.op_lock.clone().lock_owned().await;

        let status = self.status();
        if status.contains(ControllerStatus::FETCHING) {
            return Err(ArchonError::InvalidState(format!(
                "{} is already fetching",
                self.name
            )));
        }
        if buffer.is_none() && !status.contains(ControllerStatus::FETCH_PENDING) {
            return Err(ArchonError::InvalidState(format!(
                "{} has no buffer waiting to be fetched",
                self.name
            )));
        }

        let frame = self.frame().await?;
        let buf = match buffer {
            Some(index) => {
                let buf = frame.buffer(index)?;
                if !buf.complete {
                    return Err(ArchonError::Fetch(format!(
                        "buffer {index} is not complete"
                    )));
                }
                *buf
            }
            None => *frame
                .latest_complete()
                .ok_or_else(|| ArchonError::Fetch("no buffers ready to be read".to_string()))?,
        };

        self.client.transition_status(
            ControllerStatus::FETCH_PENDING,
            ControllerStatus::FETCHING,
        );

        let result = self.fetch_buffer(&buf).await;
        match result {
            Ok(data) => {
                self.client.update_status(ControllerStatus::IDLE, true);
                Ok(FetchedFrame {
                    controller: self.name.clone(),
                    buffer: buf.index,
                    frame_number: buf.frame_number,
                    data,
                })
            }
            Err(err) => {
                self.flag_expose_failure(&err);
                Err(err)
            }
        }
    }

    async fn fetch_buffer(&self, buf: &super::frame::BufferInfo) -> ArchonResult<FrameData> {
        // Lock the buffer against the next readout while we stream it out.
        self.command(&format!("LOCK{}", buf.index), None).await?;

        let blocks = buf.block_count();
        let expected = blocks as usize * BINARY_CHUNK;
        debug!(
            controller = %self.name,
            buffer = buf.index,
            blocks,
            "fetching frame buffer"
        );

        let mut stream = self.client.stream_fetch(buf.base, blocks, None).await?;
        let mut bytes = Vec::with_capacity(expected);
        while let Some(chunk) = stream.chunks.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        let reply = stream.reply.outcome().await;

        // Unlock whatever happened; a stuck lock blocks the next readout.
        let unlock = self.command("LOCK0", None).await;
        reply.into_result()?;
        unlock?;

        if bytes.len() != expected {
            return Err(ArchonError::Fetch(format!(
                "received {} bytes for buffer {}, expected {expected}",
                bytes.len(),
                buf.index
            )));
        }

        // The tail of the last block is padding.
        bytes.truncate(buf.byte_len());
        FrameData::from_le_bytes(
            &bytes,
            buf.width as usize,
            buf.height as usize,
            buf.bytes_per_pixel(),
        )
    }

    /// Flushes the detector `count` times. Valid in `IDLE`. The controller
    /// offers no readback for `DoFlush`, so completion is timed.
    pub async fn flush(self: &Arc<Self>, count: u32) -> ArchonResult<()> {
        let _guard = self.op_lock.clone().lock_owned().await;

        if !self.status().contains(ControllerStatus::IDLE) {
            return Err(ArchonError::InvalidState(format!(
                "{} is not idle",
                self.name
            )));
        }

        info!(controller = %self.name, count, "flushing");

        self.reset_inner(true, false).await?;
        self.set_param("FlushCount", i64::from(count)).await?;
        self.set_param("DoFlush", 1).await?;
        self.command("RELEASETIMING", Some(self.timeouts.command()))
            .await?;

        self.client.update_status(ControllerStatus::FLUSHING, true);
        tokio::time::sleep(self.timeouts.flushing().mul_f64(f64::from(count))).await;

        self.client
            .transition_status(ControllerStatus::FLUSHING, ControllerStatus::IDLE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centiseconds_round_to_nearest() {
        assert_eq!(centiseconds(Duration::from_millis(100)), 10);
        assert_eq!(centiseconds(Duration::from_millis(104)), 10);
        assert_eq!(centiseconds(Duration::from_millis(105)), 11);
        assert_eq!(centiseconds(Duration::from_secs(1)), 100);
        // Long exposures round-trip exactly.
        assert_eq!(centiseconds(Duration::from_secs(10_000)), 1_000_000);
    }

    #[test]
    fn mod_type_codes() {
        assert_eq!(ModType::from_code(2).name(), "AD");
        assert_eq!(ModType::from_code(11).name(), "HEATERX");
        assert_eq!(ModType::from_code(99).name(), "UNKNOWN");
    }

    #[test]
    fn power_codes() {
        assert_eq!(ArchonPower::from_code(4), ArchonPower::On);
        assert_eq!(ArchonPower::from_code(2), ArchonPower::Off);
        assert_eq!(ArchonPower::from_code(3), ArchonPower::Intermediate);
        assert_eq!(ArchonPower::from_code(-1), ArchonPower::Unknown);
    }

    #[test]
    fn apply_commands_map_to_wire_names() {
        assert_eq!(ApplyCommand::All.as_str(), "APPLYALL");
        assert_eq!(ApplyCommand::Timing.as_str(), "LOADTIMING");
    }
}
