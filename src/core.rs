//! Core ports and shared data types.
//!
//! This module defines the narrow interfaces the exposure machinery is
//! written against, so the whole core can be unit-tested with in-memory
//! fakes:
//!
//! - [`ReplySink`]: publishes structured key/value events to operators. The
//!   daemon only asserts the key/value contract; serialising and transporting
//!   the events is the port's business.
//! - [`FrameWriter`]: persists one frame + header pair to a path.
//! - [`SensorReader`]: environmental readings merged into headers during
//!   readout.
//! - [`Clock`]: the time source, injectable for tests.
//! - [`CounterStore`]: the persisted monotonic exposure number.
//!
//! It also holds the shared [`FitsHeader`] representation used by the
//! exposure path, the writers, and the lockfiles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::controller::frame::FrameData;
use crate::controller::status::ControllerStatus;
use crate::error::ArchonResult;

// =============================================================================
// Reply sink
// =============================================================================

/// Severity of a reply event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One structured message for operators. `payload` is an object carrying at
/// least the `controller` field when the event concerns a single controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEvent {
    pub level: ReplyLevel,
    pub key: String,
    pub payload: Value,
}

/// Publishes structured events to operators.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn emit(&self, event: ReplyEvent);
}

/// Default sink: events go to the log.
pub struct TracingReplySink;

#[async_trait]
impl ReplySink for TracingReplySink {
    async fn emit(&self, event: ReplyEvent) {
        match event.level {
            ReplyLevel::Debug => debug!(key = %event.key, payload = %event.payload, "reply"),
            ReplyLevel::Info => info!(key = %event.key, payload = %event.payload, "reply"),
            ReplyLevel::Warning => warn!(key = %event.key, payload = %event.payload, "reply"),
            ReplyLevel::Error => error!(key = %event.key, payload = %event.payload, "reply"),
        }
    }
}

/// Helper wrapping a sink with the well-known reply keys.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ReplySink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReplySink>) -> Self {
        Self { sink }
    }

    async fn emit(&self, level: ReplyLevel, key: &str, payload: Value) {
        self.sink
            .emit(ReplyEvent {
                level,
                key: key.to_string(),
                payload,
            })
            .await;
    }

    pub async fn text(&self, controller: Option<&str>, message: &str) {
        self.emit(
            ReplyLevel::Info,
            "text",
            json!({ "controller": controller, "text": message }),
        )
        .await;
    }

    pub async fn log(&self, controller: Option<&str>, message: &str) {
        self.emit(
            ReplyLevel::Debug,
            "log",
            json!({ "controller": controller, "log": message }),
        )
        .await;
    }

    pub async fn error(&self, controller: Option<&str>, message: &str) {
        self.emit(
            ReplyLevel::Error,
            "error",
            json!({ "controller": controller, "error": message }),
        )
        .await;
    }

    pub async fn raw_reply(&self, controller: &str, reply: &str) {
        self.emit(
            ReplyLevel::Debug,
            "raw_reply",
            json!({ "controller": controller, "raw_reply": reply }),
        )
        .await;
    }

    pub async fn status(
        &self,
        controller: &str,
        status: ControllerStatus,
        last_exposure_no: Option<u64>,
    ) {
        let mut payload = json!({
            "controller": controller,
            "status": status.bits(),
            "status_names": status.names(),
        });
        if let Some(n) = last_exposure_no {
            payload["last_exposure_no"] = json!(n);
        }
        self.emit(ReplyLevel::Info, "status", payload).await;
    }

    pub async fn frame(&self, controller: &str, frame: Value) {
        let payload = json!({ "controller": controller, "frame": frame });
        self.emit(ReplyLevel::Info, "frame", payload).await;
    }

    pub async fn system(&self, controller: &str, system: Value) {
        let payload = json!({ "controller": controller, "system": system });
        self.emit(ReplyLevel::Info, "system", payload).await;
    }

    pub async fn config(&self, controller: &str, config: Value) {
        let payload = json!({ "controller": controller, "config": config });
        self.emit(ReplyLevel::Info, "config", payload).await;
    }

    pub async fn geometry(&self, controller: &str, geometry: Value) {
        let mut payload = json!({ "controller": controller });
        if let (Value::Object(target), Value::Object(source)) = (&mut payload, geometry) {
            target.extend(source);
        }
        self.emit(ReplyLevel::Info, "geometry", payload).await;
    }

    pub async fn filenames(&self, paths: &[PathBuf]) {
        self.emit(
            ReplyLevel::Info,
            "filenames",
            json!({ "filenames": paths }),
        )
        .await;
    }
}

// =============================================================================
// FITS header
// =============================================================================

/// A FITS header card value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_string())
    }
}
impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}
impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}
impl From<u64> for HeaderValue {
    fn from(v: u64) -> Self {
        HeaderValue::Int(v as i64)
    }
}
impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}
impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

/// One header card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// An ordered FITS header. Re-setting a key replaces its card in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitsHeader {
    cards: Vec<HeaderCard>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<V: Into<HeaderValue>>(&mut self, key: &str, value: V, comment: Option<&str>) {
        let key = key.to_uppercase();
        let card = HeaderCard {
            key: key.clone(),
            value: value.into(),
            comment: comment.map(str::to_string),
        };
        if let Some(existing) = self.cards.iter_mut().find(|c| c.key == key) {
            *existing = card;
        } else {
            self.cards.push(card);
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        let key = key.to_uppercase();
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    /// Merges a JSON object into the header; non-scalar values are skipped.
    pub fn extend_json(&mut self, extra: &serde_json::Map<String, Value>) {
        for (key, value) in extra {
            match value {
                Value::Bool(b) => self.set(key, *b, None),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        self.set(key, i, None);
                    } else if let Some(f) = n.as_f64() {
                        self.set(key, f, None);
                    }
                }
                Value::String(s) => self.set(key, s.as_str(), None),
                _ => {}
            }
        }
    }
}

// =============================================================================
// Writer, sensor, clock, counter ports
// =============================================================================

/// Persists one frame + header pair. Implementations must write the file at
/// exactly `path`; atomicity (temp + rename) is handled by the caller.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    async fn write(&self, data: &FrameData, header: &FitsHeader, path: &Path) -> ArchonResult<()>;
}

/// Reads environmental sensors for one controller. The returned map is
/// merged into the exposure header during readout.
#[async_trait]
pub trait SensorReader: Send + Sync {
    async fn read(&self, controller: &str) -> ArchonResult<serde_json::Map<String, Value>>;
}

/// A sensor reader with nothing to say.
pub struct NullSensorReader;

#[async_trait]
impl SensorReader for NullSensorReader {
    async fn read(&self, _controller: &str) -> ArchonResult<serde_json::Map<String, Value>> {
        Ok(serde_json::Map::new())
    }
}

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The persisted monotonic exposure number.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// The number the next exposure will use. Does not advance anything.
    async fn peek(&self) -> ArchonResult<u64>;
    /// Persists `used + 1` as the next number, under a file lock.
    async fn commit(&self, used: u64) -> ArchonResult<()>;
}

/// Side effects run concurrently with integration (pre-exposure) or with
/// readout. A cotask may fail without aborting the exposure; readout cotask
/// results are merged into the per-controller headers.
#[async_trait]
pub trait Cotask: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, controllers: &[String]) -> ArchonResult<HashMap<String, Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_set_replaces_in_place() {
        let mut header = FitsHeader::new();
        header.set("EXPTIME", 1.0, Some("exposure time"));
        header.set("ccd", "r1", None);
        header.set("exptime", 2.5, Some("exposure time"));
        assert_eq!(header.cards().len(), 2);
        assert_eq!(header.get("EXPTIME"), Some(&HeaderValue::Float(2.5)));
        // Order preserved: EXPTIME stayed first.
        assert_eq!(header.cards()[0].key, "EXPTIME");
        assert_eq!(header.cards()[1].key, "CCD");
    }

    #[test]
    fn header_json_round_trip() {
        let mut header = FitsHeader::new();
        header.set("EXPOSURE", 42u64, None);
        header.set("OBSERVAT", "lco", Some("observatory"));
        let text = serde_json::to_string(&header).unwrap();
        let back: FitsHeader = serde_json::from_str(&text).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn extend_json_skips_nested_values() {
        let mut header = FitsHeader::new();
        let extra = serde_json::json!({
            "TELESCOP": "du Pont",
            "AIRMASS": 1.2,
            "NESTED": { "skipped": true },
        });
        header.extend_json(extra.as_object().unwrap());
        assert!(header.get("TELESCOP").is_some());
        assert!(header.get("AIRMASS").is_some());
        assert!(header.get("NESTED").is_none());
    }
}
