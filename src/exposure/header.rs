//! Default FITS header for an exposure.
//!
//! The header carries the identity of the shot (exposure number, controller,
//! detector, timestamps), the readout geometry, the backplane id, per-tap
//! gain and read noise from the controller descriptor, and the bias-section
//! coordinates. Environmental readings from the sensor port and any
//! caller-supplied extras are merged on top, extras last so operators can
//! override anything.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::config::DetectorConfig;
use crate::controller::geometry::FrameGeometry;
use crate::core::FitsHeader;

/// Shared identity of one exposure across all of its files.
#[derive(Debug, Clone)]
pub struct ExposureInfo {
    pub exposure_no: u64,
    pub exposure_time_s: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

fn isot(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the default header for one detector of one controller.
#[allow(clippy::too_many_arguments)]
pub fn build_header(
    observatory: &str,
    controller: &str,
    ccd: &str,
    detector: &DetectorConfig,
    geometry: Option<&FrameGeometry>,
    system: &serde_json::Map<String, Value>,
    info: &ExposureInfo,
    sensors: &serde_json::Map<String, Value>,
    extra: &serde_json::Map<String, Value>,
) -> FitsHeader {
    let mut header = FitsHeader::new();

    header.set("SPEC", controller, Some("controller name"));
    header.set("CCD", ccd, Some("CCD name"));
    header.set("OBSERVAT", observatory, Some("observatory"));
    header.set("CCDSENS", detector.sensor.as_str(), Some("sensor tap group"));

    header.set("EXPOSURE", info.exposure_no, Some("exposure number"));
    header.set("EXPTIME", info.exposure_time_s, Some("exposure time [s]"));
    header.set(
        "OBSTIME",
        isot(info.start_time),
        Some("start of the observation"),
    );
    header.set(
        "INTSTART",
        isot(info.start_time),
        Some("start of the integration"),
    );
    header.set("INTEND", isot(info.end_time), Some("end of the integration"));

    header.set(
        "SWVER",
        format!("archond {}", env!("CARGO_PKG_VERSION")),
        Some("daemon version"),
    );
    if let Some(backplane) = system.get("backplane_id").and_then(Value::as_str) {
        header.set("BACKPLID", backplane, Some("backplane ID"));
    }
    if let Some(version) = system.get("backplane_version").and_then(Value::as_str) {
        header.set("BACKPVER", version, Some("backplane version"));
    }

    if let Some(geometry) = geometry {
        header.set("LINES", geometry.lines, Some("unbinned lines read"));
        header.set("PIXELS", geometry.pixels, Some("unbinned pixels read"));
        header.set("PRESKIPL", geometry.preskiplines, Some("lines skipped before read"));
        header.set("PSTSKIPL", geometry.postskiplines, Some("lines skipped after read"));
        header.set("PRESKIPP", geometry.preskippixels, Some("pixels skipped before read"));
        header.set("PSTSKIPP", geometry.postskippixels, Some("pixels skipped after read"));
        header.set("OVERSCNL", geometry.overscanlines, Some("overscan lines"));
        header.set("OVERSCNP", geometry.overscanpixels, Some("overscan pixels"));
        header.set("VBIN", geometry.vbin, Some("vertical binning"));
        header.set("HBIN", geometry.hbin, Some("horizontal binning"));

        let data_pixels = geometry.pixels / geometry.hbin;
        header.set(
            "DATASEC",
            format!("[1:{data_pixels},1:{}]", geometry.linecount),
            Some("section containing data"),
        );
        if let Some((x0, x1, y0, y1)) = geometry.bias_section() {
            header.set(
                "BIASSEC",
                format!("[{x0}:{x1},{y0}:{y1}]"),
                Some("section for overscan bias"),
            );
        }
    }

    for (n, tap) in detector.taps.iter().enumerate() {
        let n = n + 1;
        header.set(
            &format!("GAIN{n}"),
            tap.gain,
            Some(&format!("gain of tap {} [e-/ADU]", tap.id)),
        );
        header.set(
            &format!("RDNOISE{n}"),
            tap.readnoise,
            Some(&format!("read noise of tap {} [e-]", tap.id)),
        );
    }

    header.extend_json(sensors);
    header.extend_json(extra);

    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TapConfig;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn detector() -> DetectorConfig {
        DetectorConfig {
            area: [0, 0, 100, 100],
            sensor: "A".to_string(),
            taps: vec![
                TapConfig {
                    id: "AD3L".to_string(),
                    gain: 2.71,
                    readnoise: 3.8,
                },
                TapConfig {
                    id: "AD3R".to_string(),
                    gain: 2.68,
                    readnoise: 4.1,
                },
            ],
        }
    }

    fn geometry() -> FrameGeometry {
        let params: HashMap<String, i64> = [
            ("LINES".to_string(), 100i64),
            ("PIXELS".to_string(), 100),
            ("OVERSCANPIXELS".to_string(), 20),
        ]
        .into_iter()
        .collect();
        FrameGeometry::from_parameters(&params, 2).unwrap()
    }

    #[test]
    fn default_header_carries_identity_and_geometry() {
        let info = ExposureInfo {
            exposure_no: 42,
            exposure_time_s: 15.0,
            start_time: Utc.with_ymd_and_hms(2021, 6, 1, 4, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2021, 6, 1, 4, 0, 15).unwrap(),
        };
        let mut system = serde_json::Map::new();
        system.insert("backplane_id".to_string(), serde_json::json!("01E9FFFF"));

        let header = build_header(
            "lco",
            "sp1",
            "r1",
            &detector(),
            Some(&geometry()),
            &system,
            &info,
            &serde_json::Map::new(),
            &serde_json::Map::new(),
        );

        assert_eq!(
            header.get("EXPOSURE"),
            Some(&crate::core::HeaderValue::Int(42))
        );
        assert_eq!(
            header.get("BACKPLID"),
            Some(&crate::core::HeaderValue::Str("01E9FFFF".to_string()))
        );
        assert_eq!(
            header.get("BIASSEC"),
            Some(&crate::core::HeaderValue::Str("[101:120,1:100]".to_string()))
        );
        assert!(header.get("GAIN2").is_some());
        assert!(header.get("RDNOISE1").is_some());
    }

    #[test]
    fn extras_override_defaults() {
        let info = ExposureInfo {
            exposure_no: 1,
            exposure_time_s: 1.0,
            start_time: Utc::now(),
            end_time: Utc::now(),
        };
        let mut extra = serde_json::Map::new();
        extra.insert("OBSERVAT".to_string(), serde_json::json!("elsewhere"));

        let header = build_header(
            "lco",
            "sp1",
            "r1",
            &detector(),
            None,
            &serde_json::Map::new(),
            &info,
            &serde_json::Map::new(),
            &extra,
        );
        assert_eq!(
            header.get("OBSERVAT"),
            Some(&crate::core::HeaderValue::Str("elsewhere".to_string()))
        );
    }
}
