//! Daemon configuration.
//!
//! Settings are loaded from a YAML file plus `ARCHOND_`-prefixed environment
//! overrides (double underscore as the nesting separator, e.g.
//! `ARCHOND_FILES__DATA_DIR=/data`). Controller descriptors are immutable
//! after load: identity (host, port), the detector map with readout areas,
//! and per-tap gain/readnoise used for the default FITS header.
//!
//! ## Example
//!
//! ```yaml
//! observatory: lco
//! controllers:
//!   sp1:
//!     host: 10.7.45.26
//!     detectors:
//!       r1:
//!         area: [0, 0, 2048, 2048]
//!         sensor: A
//!         taps:
//!           - { id: AD3L, gain: 2.71, readnoise: 3.8 }
//! files:
//!   data_dir: /data/spectro
//!   template: "sdR-{hemisphere}-{controller}-{exposure_no:08}.fits"
//! timeouts:
//!   readout_max_s: 60
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ArchonError, ArchonResult};

/// Default Archon TCP port.
pub const DEFAULT_PORT: u16 = 4242;

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Observatory code, used in filenames and the default header.
    pub observatory: String,
    /// Hemisphere letter for filenames. Derived from the observatory when
    /// absent ("n" for APO, "s" otherwise).
    #[serde(default)]
    pub hemisphere: Option<String>,
    /// Controllers driven by this daemon, keyed by name.
    pub controllers: HashMap<String, ControllerConfig>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    pub files: FileSettings,
    #[serde(default)]
    pub checksum: ChecksumSettings,
}

impl Settings {
    /// Loads settings from an optional YAML file and the environment.
    pub fn new(path: Option<&Path>) -> ArchonResult<Settings> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("ARCHOND").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn hemisphere(&self) -> &str {
        match &self.hemisphere {
            Some(h) => h,
            None if self.observatory.eq_ignore_ascii_case("apo") => "n",
            None => "s",
        }
    }

    pub fn validate(&self) -> ArchonResult<()> {
        if self.controllers.is_empty() {
            return Err(ArchonError::Config("no controllers configured".to_string()));
        }
        for (name, controller) in &self.controllers {
            for (ccd, detector) in &controller.detectors {
                let [x0, y0, x1, y1] = detector.area;
                if x0 >= x1 || y0 >= y1 {
                    return Err(ArchonError::Config(format!(
                        "detector {name}/{ccd} has a degenerate area {:?}",
                        detector.area
                    )));
                }
            }
        }
        if !self.files.template.contains("{exposure_no") {
            return Err(ArchonError::Config(
                "file template must contain {exposure_no}".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity and detector layout of one controller. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub detectors: HashMap<String, DetectorConfig>,
}

/// One CCD within the controller's virtual focal-plane buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Readout rectangle `[x0, y0, x1, y1]`, end-exclusive.
    pub area: [u32; 4],
    /// Which physical taps feed this detector (A/B/C).
    pub sensor: String,
    #[serde(default)]
    pub taps: Vec<TapConfig>,
}

/// One output channel of a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapConfig {
    pub id: String,
    /// e-/ADU
    pub gain: f64,
    /// e- RMS
    pub readnoise: f64,
}

/// Timeouts and pacing, all overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Default reply deadline for ordinary commands.
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// Reply deadline for SYSTEM / STATUS / FRAME polls.
    #[serde(default = "default_status_ms")]
    pub status_ms: u64,
    /// Per-line deadline during `write_config`.
    #[serde(default = "default_write_config_ms")]
    pub write_config_ms: u64,
    /// Pacing delay between consecutive WCONFIG lines, microseconds.
    #[serde(default = "default_write_config_delay_us")]
    pub write_config_delay_us: u64,
    #[serde(default = "default_apply_ms")]
    pub apply_ms: u64,
    #[serde(default = "default_power_ms")]
    pub power_ms: u64,
    /// Ceiling on waiting for a readout to complete.
    #[serde(default = "default_readout_max_s")]
    pub readout_max_s: u64,
    /// Wall time one flush cycle takes.
    #[serde(default = "default_flushing_s")]
    pub flushing_s: f64,
    /// FRAME/STATUS poll cadence while an exposure is in flight.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }
    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }
    pub fn write_config(&self) -> Duration {
        Duration::from_millis(self.write_config_ms)
    }
    pub fn write_config_delay(&self) -> Duration {
        Duration::from_micros(self.write_config_delay_us)
    }
    pub fn apply(&self) -> Duration {
        Duration::from_millis(self.apply_ms)
    }
    pub fn power(&self) -> Duration {
        Duration::from_millis(self.power_ms)
    }
    pub fn readout_max(&self) -> Duration {
        Duration::from_secs(self.readout_max_s)
    }
    pub fn flushing(&self) -> Duration {
        Duration::from_secs_f64(self.flushing_s)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            command_ms: default_command_ms(),
            status_ms: default_status_ms(),
            write_config_ms: default_write_config_ms(),
            write_config_delay_us: default_write_config_delay_us(),
            apply_ms: default_apply_ms(),
            power_ms: default_power_ms(),
            readout_max_s: default_readout_max_s(),
            flushing_s: default_flushing_s(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Output file handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    /// Root directory for images and lockfiles.
    pub data_dir: PathBuf,
    /// Filename template; `{observatory}`, `{hemisphere}`, `{controller}`,
    /// `{ccd}`, `{exposure_no}` (optionally `{exposure_no:0N}`).
    #[serde(default = "default_template")]
    pub template: String,
    /// Write the files of one exposure concurrently instead of sequentially.
    #[serde(default = "default_true")]
    pub concurrent_writes: bool,
}

impl FileSettings {
    /// Renders the filename template.
    pub fn render(
        &self,
        observatory: &str,
        hemisphere: &str,
        controller: &str,
        ccd: &str,
        exposure_no: u64,
    ) -> String {
        let mut out = self
            .template
            .replace("{observatory}", observatory)
            .replace("{hemisphere}", hemisphere)
            .replace("{controller}", controller)
            .replace("{ccd}", ccd);
        // {exposure_no} with optional zero-padded width, printf style.
        while let Some(start) = out.find("{exposure_no") {
            let end = match out[start..].find('}') {
                Some(offset) => start + offset,
                None => break,
            };
            let spec = &out[start + "{exposure_no".len()..end];
            let rendered = match spec.strip_prefix(":0") {
                Some(width) => {
                    let width: usize = width.parse().unwrap_or(0);
                    format!("{exposure_no:0width$}")
                }
                _ => exposure_no.to_string(),
            };
            out.replace_range(start..=end, &rendered);
        }
        out
    }
}

/// Optional checksum sidecar appended per written image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ChecksumMode,
    /// Daily file name template; `{sjd}` expands to the SDSS Julian Date.
    #[serde(default = "default_checksum_file")]
    pub file: String,
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ChecksumMode::default(),
            file: default_checksum_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    #[default]
    Md5,
    Sha1,
}

impl ChecksumMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumMode::Md5 => "md5",
            ChecksumMode::Sha1 => "sha1",
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_connect_ms() -> u64 {
    5_000
}
fn default_command_ms() -> u64 {
    5_000
}
fn default_status_ms() -> u64 {
    1_000
}
fn default_write_config_ms() -> u64 {
    2_000
}
fn default_write_config_delay_us() -> u64 {
    100
}
fn default_apply_ms() -> u64 {
    5_000
}
fn default_power_ms() -> u64 {
    10_000
}
fn default_readout_max_s() -> u64 {
    40
}
fn default_flushing_s() -> f64 {
    8.2
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_template() -> String {
    "archon-{controller}-{exposure_no:08}.fits".to_string()
}
fn default_checksum_file() -> String {
    "{sjd}.{mode}sum".to_string()
}
