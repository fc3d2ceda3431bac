//! Frame-buffer bookkeeping and fetched-frame data.
//!
//! The `FRAME` command reports the state of the controller's three on-board
//! frame buffers as space-separated `key=value` pairs. [`FrameInfo`] parses
//! that reply; buffer selection picks the complete buffer with the highest
//! frame number. A fetched payload is reshaped into a 2-D array
//! ([`FrameData`]), 16- or 32-bit little-endian as declared by the buffer's
//! sample mode.

use std::collections::HashMap;

use ndarray::Array2;
use serde_json::json;

use crate::error::{ArchonError, ArchonResult};

/// Number of frame-buffer slots on the controller.
pub const BUFFER_COUNT: u8 = 3;

/// State of one on-controller frame buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer slot, 1-based.
    pub index: u8,
    /// The buffer holds a fully written frame.
    pub complete: bool,
    /// Monotonic frame counter.
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    /// Sample mode: 0 means 16-bit pixels, 1 means 32-bit.
    pub sample: u8,
    /// Start address for `FETCH`.
    pub base: u32,
    /// Controller timestamp (10 ns ticks).
    pub timestamp: u64,
}

impl BufferInfo {
    pub fn bytes_per_pixel(&self) -> usize {
        if self.sample == 0 {
            2
        } else {
            4
        }
    }

    /// Payload size of the frame held by this buffer.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }

    /// Number of 1024-byte blocks a `FETCH` of this buffer transfers.
    pub fn block_count(&self) -> u32 {
        self.byte_len().div_ceil(super::codec::BINARY_CHUNK) as u32
    }
}

/// Parsed reply of the `FRAME` command.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Buffer the controller is currently writing to.
    pub wbuf: u8,
    pub buffers: Vec<BufferInfo>,
    /// The raw keyword map, for the `frame` reply key.
    pub raw: HashMap<String, i64>,
}

impl FrameInfo {
    /// Parses the space-separated `key=value` FRAME reply. `*TIME*` values
    /// are hexadecimal; everything else is decimal.
    pub fn parse(line: &str) -> ArchonResult<FrameInfo> {
        let mut raw = HashMap::new();
        for word in line.split_whitespace() {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| ArchonError::Protocol(format!("bad FRAME keyword {word:?}")))?;
            let key = key.to_lowercase();
            let parsed = if key.contains("time") {
                i64::from_str_radix(value, 16)
            } else {
                value.parse::<i64>()
            }
            .map_err(|_| ArchonError::Protocol(format!("bad FRAME value {word:?}")))?;
            raw.insert(key, parsed);
        }

        let get = |key: &str| -> ArchonResult<i64> {
            raw.get(key)
                .copied()
                .ok_or_else(|| ArchonError::Protocol(format!("FRAME reply missing {key:?}")))
        };

        let mut buffers = Vec::with_capacity(BUFFER_COUNT as usize);
        for n in 1..=BUFFER_COUNT {
            buffers.push(BufferInfo {
                index: n,
                complete: get(&format!("buf{n}complete"))? == 1,
                frame_number: get(&format!("buf{n}frame"))? as u64,
                width: get(&format!("buf{n}width"))? as u32,
                height: get(&format!("buf{n}height"))? as u32,
                sample: get(&format!("buf{n}sample"))? as u8,
                base: get(&format!("buf{n}base"))? as u32,
                timestamp: get(&format!("buf{n}timestamp"))? as u64,
            });
        }

        Ok(FrameInfo {
            wbuf: get("wbuf")? as u8,
            buffers,
            raw,
        })
    }

    pub fn buffer(&self, index: u8) -> ArchonResult<&BufferInfo> {
        self.buffers
            .iter()
            .find(|buf| buf.index == index)
            .ok_or_else(|| ArchonError::Fetch(format!("invalid frame buffer {index}")))
    }

    /// The buffer to fetch: complete, with the highest frame number.
    pub fn latest_complete(&self) -> Option<&BufferInfo> {
        self.buffers
            .iter()
            .filter(|buf| buf.complete)
            .max_by_key(|buf| buf.frame_number)
    }

    /// Highest frame number across all buffers, complete or not. Recorded at
    /// exposure start so readout completion can be detected.
    pub fn max_frame_number(&self) -> u64 {
        self.buffers
            .iter()
            .map(|buf| buf.frame_number)
            .max()
            .unwrap_or(0)
    }

    /// JSON payload for the `frame` reply key.
    pub fn to_json(&self) -> serde_json::Value {
        json!(self.raw)
    }
}

/// Pixel data of a fetched frame, in the buffer's native bit width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameData {
    U16(Array2<u16>),
    U32(Array2<u32>),
}

impl FrameData {
    /// Decodes a little-endian payload into a `height x width` array.
    pub fn from_le_bytes(
        bytes: &[u8],
        width: usize,
        height: usize,
        bytes_per_pixel: usize,
    ) -> ArchonResult<FrameData> {
        let expected = width * height * bytes_per_pixel;
        if bytes.len() != expected {
            return Err(ArchonError::Fetch(format!(
                "frame payload is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        match bytes_per_pixel {
            2 => {
                let pixels: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();
                let arr = Array2::from_shape_vec((height, width), pixels)
                    .map_err(|err| ArchonError::Fetch(err.to_string()))?;
                Ok(FrameData::U16(arr))
            }
            4 => {
                let pixels: Vec<u32> = bytes
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                let arr = Array2::from_shape_vec((height, width), pixels)
                    .map_err(|err| ArchonError::Fetch(err.to_string()))?;
                Ok(FrameData::U32(arr))
            }
            other => Err(ArchonError::Fetch(format!(
                "unsupported pixel width {other} bytes"
            ))),
        }
    }

    /// `(height, width)`.
    pub fn dim(&self) -> (usize, usize) {
        match self {
            FrameData::U16(arr) => arr.dim(),
            FrameData::U32(arr) => arr.dim(),
        }
    }

    /// FITS BITPIX for this data (unsigned types map onto the signed FITS
    /// types with BZERO applied by the writer).
    pub fn bits_per_pixel(&self) -> u8 {
        match self {
            FrameData::U16(_) => 16,
            FrameData::U32(_) => 32,
        }
    }

    /// Crops the rectangle `(x0, y0, x1, y1)` (end-exclusive), the detector
    /// area convention of the controller descriptor.
    pub fn crop(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> ArchonResult<FrameData> {
        let (height, width) = self.dim();
        if x0 >= x1 || y0 >= y1 || x1 > width || y1 > height {
            return Err(ArchonError::Fetch(format!(
                "detector area ({x0},{y0},{x1},{y1}) outside {width}x{height} frame"
            )));
        }
        Ok(match self {
            FrameData::U16(arr) => {
                FrameData::U16(arr.slice(ndarray::s![y0..y1, x0..x1]).to_owned())
            }
            FrameData::U32(arr) => {
                FrameData::U32(arr.slice(ndarray::s![y0..y1, x0..x1]).to_owned())
            }
        })
    }

    /// Raw little-endian bytes, row-major. Inverse of
    /// [`from_le_bytes`](Self::from_le_bytes).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            FrameData::U16(arr) => arr.iter().flat_map(|px| px.to_le_bytes()).collect(),
            FrameData::U32(arr) => arr.iter().flat_map(|px| px.to_le_bytes()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_line(frames: [(u64, bool); 3]) -> String {
        let mut line = "WBUF=2 TIMER=00000064".to_string();
        for (n, (frame, complete)) in frames.iter().enumerate() {
            let n = n + 1;
            line.push_str(&format!(
                " BUF{n}COMPLETE={} BUF{n}FRAME={frame} BUF{n}WIDTH=100 BUF{n}HEIGHT=100 \
                 BUF{n}SAMPLE=0 BUF{n}BASE={} BUF{n}TIMESTAMP=0000A{n}",
                u8::from(*complete),
                n * 4096,
            ));
        }
        line
    }

    #[test]
    fn parses_frame_reply() {
        let info = FrameInfo::parse(&frame_line([(10, true), (12, true), (11, true)])).unwrap();
        assert_eq!(info.wbuf, 2);
        assert_eq!(info.buffers.len(), 3);
        assert_eq!(info.buffers[1].frame_number, 12);
        assert!(info.buffers[1].complete);
        // TIMESTAMP is hex.
        assert_eq!(info.buffers[0].timestamp, 0xA1);
    }

    #[test]
    fn selects_highest_complete_frame_number() {
        let info = FrameInfo::parse(&frame_line([(10, true), (12, true), (11, true)])).unwrap();
        assert_eq!(info.latest_complete().unwrap().index, 2);

        // The highest frame number loses to a lower complete one if it is
        // still being written.
        let info = FrameInfo::parse(&frame_line([(10, true), (12, false), (11, true)])).unwrap();
        assert_eq!(info.latest_complete().unwrap().index, 3);

        let info = FrameInfo::parse(&frame_line([(1, false), (2, false), (3, false)])).unwrap();
        assert!(info.latest_complete().is_none());
    }

    #[test]
    fn buffer_geometry_block_arithmetic() {
        let info = FrameInfo::parse(&frame_line([(1, true), (2, true), (3, true)])).unwrap();
        let buf = info.buffer(1).unwrap();
        assert_eq!(buf.bytes_per_pixel(), 2);
        assert_eq!(buf.byte_len(), 100 * 100 * 2);
        // 20000 bytes over 1024-byte blocks rounds up to 20.
        assert_eq!(buf.block_count(), 20);
    }

    #[test]
    fn decode_rejects_one_byte_mismatch() {
        let bytes = vec![0u8; 100 * 100 * 2 - 1];
        assert!(FrameData::from_le_bytes(&bytes, 100, 100, 2).is_err());
    }

    #[test]
    fn decode_reshapes_row_major_little_endian() {
        let mut bytes = Vec::new();
        for px in 0u16..6 {
            bytes.extend_from_slice(&px.to_le_bytes());
        }
        let data = FrameData::from_le_bytes(&bytes, 3, 2, 2).unwrap();
        match &data {
            FrameData::U16(arr) => {
                assert_eq!(arr[[0, 2]], 2);
                assert_eq!(arr[[1, 0]], 3);
            }
            _ => panic!("expected 16-bit"),
        }
        assert_eq!(data.to_le_bytes(), bytes);
    }

    #[test]
    fn crop_extracts_detector_area() {
        let arr = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as u16);
        let data = FrameData::U16(arr);
        let cropped = data.crop(1, 2, 3, 4).unwrap();
        match cropped {
            FrameData::U16(arr) => {
                assert_eq!(arr.dim(), (2, 2));
                assert_eq!(arr[[0, 0]], 9);
                assert_eq!(arr[[1, 1]], 14);
            }
            _ => panic!("expected 16-bit"),
        }
    }

    #[test]
    fn crop_out_of_bounds_is_an_error() {
        let data = FrameData::U16(Array2::zeros((4, 4)));
        assert!(data.crop(0, 0, 5, 4).is_err());
        assert!(data.crop(2, 2, 2, 4).is_err());
    }
}
