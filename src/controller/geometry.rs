//! Readout geometry derived from the ACF parameter table.
//!
//! The timing script reads the CCD as `Lines x Pixels` plus optional skip
//! and overscan regions, binned on both axes. The CDS deinterleaver then
//! lays the taps side by side in the frame buffer, so the buffer width is
//! `pixelcount x taplines`. These derived counts are what the `LINECOUNT` /
//! `PIXELCOUNT` config keywords must be set to for the hardware buffer to
//! line up with the detector area map.

use std::collections::HashMap;

use serde_json::json;

use crate::error::{ArchonError, ArchonResult};

/// Readout window and the counts derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub lines: i64,
    pub pixels: i64,
    pub preskiplines: i64,
    pub postskiplines: i64,
    pub preskippixels: i64,
    pub postskippixels: i64,
    pub overscanlines: i64,
    pub overscanpixels: i64,
    pub vbin: i64,
    pub hbin: i64,
    /// Tap count declared by the ACF `TAPLINES` keyword.
    pub taplines: i64,
    /// Binned line count including overscan: `(lines + overscanlines) / vbin`.
    pub linecount: i64,
    /// Binned pixel count including overscan: `(pixels + overscanpixels) / hbin`.
    pub pixelcount: i64,
}

impl FrameGeometry {
    /// Derives the geometry from the parameter table (uppercased names).
    pub fn from_parameters(
        params: &HashMap<String, i64>,
        taplines: usize,
    ) -> ArchonResult<FrameGeometry> {
        let get = |name: &str| -> ArchonResult<i64> {
            params
                .get(name)
                .copied()
                .ok_or_else(|| ArchonError::Config(format!("parameter {name:?} not defined")))
        };
        let opt = |name: &str, default: i64| params.get(name).copied().unwrap_or(default);

        let lines = get("LINES")?;
        let pixels = get("PIXELS")?;
        let vbin = opt("VERTICALBINNING", 1);
        let hbin = opt("HORIZONTALBINNING", 1);
        if lines <= 0 || pixels <= 0 {
            return Err(ArchonError::Config(format!(
                "degenerate readout window {pixels}x{lines}"
            )));
        }
        if vbin < 1 || hbin < 1 {
            return Err(ArchonError::Config(format!(
                "invalid binning {hbin}x{vbin}"
            )));
        }

        let overscanlines = opt("OVERSCANLINES", 0);
        let overscanpixels = opt("OVERSCANPIXELS", 0);

        Ok(FrameGeometry {
            lines,
            pixels,
            preskiplines: opt("PRESKIPLINES", 0),
            postskiplines: opt("POSTSKIPLINES", 0),
            preskippixels: opt("PRESKIPPIXELS", 0),
            postskippixels: opt("POSTSKIPPIXELS", 0),
            overscanlines,
            overscanpixels,
            vbin,
            hbin,
            taplines: taplines as i64,
            linecount: (lines + overscanlines) / vbin,
            pixelcount: (pixels + overscanpixels) / hbin,
        })
    }

    /// Buffer width in pixels once the taps are laid side by side.
    pub fn buffer_width(&self) -> i64 {
        self.pixelcount * self.taplines
    }

    /// Coordinates of the serial-overscan (bias) region within one tap,
    /// 1-based inclusive, FITS section convention. `None` without overscan.
    pub fn bias_section(&self) -> Option<(i64, i64, i64, i64)> {
        if self.overscanpixels == 0 {
            return None;
        }
        let data_pixels = self.pixels / self.hbin;
        Some((data_pixels + 1, self.pixelcount, 1, self.linecount))
    }

    /// JSON payload carrying the geometry reply keys.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "lines": self.lines,
            "pixels": self.pixels,
            "preskiplines": self.preskiplines,
            "postskiplines": self.postskiplines,
            "preskippixels": self.preskippixels,
            "postskippixels": self.postskippixels,
            "overscanlines": self.overscanlines,
            "overscanpixels": self.overscanpixels,
            "vbin": self.vbin,
            "hbin": self.hbin,
            "taplines": self.taplines,
            "linecount": self.linecount,
            "pixelcount": self.pixelcount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn unbinned_counts_include_overscan() {
        let geometry = FrameGeometry::from_parameters(
            &params(&[
                ("LINES", 100),
                ("PIXELS", 100),
                ("OVERSCANPIXELS", 20),
                ("OVERSCANLINES", 8),
            ]),
            4,
        )
        .unwrap();
        assert_eq!(geometry.linecount, 108);
        assert_eq!(geometry.pixelcount, 120);
        assert_eq!(geometry.buffer_width(), 480);
    }

    #[test]
    fn binning_divides_counts() {
        let geometry = FrameGeometry::from_parameters(
            &params(&[
                ("LINES", 4080),
                ("PIXELS", 2040),
                ("OVERSCANPIXELS", 40),
                ("VERTICALBINNING", 2),
                ("HORIZONTALBINNING", 2),
            ]),
            1,
        )
        .unwrap();
        assert_eq!(geometry.linecount, 2040);
        assert_eq!(geometry.pixelcount, 1040);
    }

    #[test]
    fn missing_window_is_a_config_error() {
        let err = FrameGeometry::from_parameters(&params(&[("PIXELS", 100)]), 1).unwrap_err();
        assert!(matches!(err, ArchonError::Config(_)));
    }

    #[test]
    fn bias_section_covers_overscan_columns() {
        let geometry = FrameGeometry::from_parameters(
            &params(&[("LINES", 100), ("PIXELS", 100), ("OVERSCANPIXELS", 20)]),
            1,
        )
        .unwrap();
        assert_eq!(geometry.bias_section(), Some((101, 120, 1, 100)));

        let no_overscan =
            FrameGeometry::from_parameters(&params(&[("LINES", 10), ("PIXELS", 10)]), 1).unwrap();
        assert_eq!(no_overscan.bias_section(), None);
    }
}
