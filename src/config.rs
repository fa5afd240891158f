// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

/// Device node of the MFC decoder on the boards this was brought up on.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video8";
/// 1 MB per decoding unit.
pub const DEFAULT_COMPRESSED_BUFFER_SIZE: usize = 1 << 20;
/// Capture buffers allocated on top of the minimum required by the hardware.
pub const DEFAULT_EXTRA_CAPTURE_BUFFERS: u32 = 1;
pub const MAX_CAPTURE_BUFFERS: u32 = 32;
/// Number of decoders that may be alive in the process at the same time.
pub const DEFAULT_MAX_INSTANCES: usize = 4;

/// How decoded frames are handed to the downstream stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// De-tile into the output buffer as I420.
    #[default]
    Linear,
    /// Hand out a descriptor of the tiled capture buffer. Only valid when the consumer reads
    /// NV12MT directly.
    Tiled,
}

impl FromStr for OutputMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" | "i420" | "I420" => Ok(OutputMode::Linear),
            "tiled" | "nv12mt" | "NV12MT" => Ok(OutputMode::Tiled),
            _ => Err("unrecognized output mode. Valid values: linear, tiled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub device_path: PathBuf,
    /// Size of the single compressed input buffer. A coded unit larger than this is dropped.
    pub compressed_buffer_size: usize,
    pub extra_capture_buffers: u32,
    /// Upper bound on the number of capture buffers requested from the hardware.
    pub max_capture_buffers: u32,
    pub output_mode: OutputMode,
    /// Number of buffer ownership violations tolerated before the pipeline gives up.
    pub max_slot_violations: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            compressed_buffer_size: DEFAULT_COMPRESSED_BUFFER_SIZE,
            extra_capture_buffers: DEFAULT_EXTRA_CAPTURE_BUFFERS,
            max_capture_buffers: MAX_CAPTURE_BUFFERS,
            output_mode: OutputMode::Linear,
            max_slot_violations: 3,
        }
    }
}

impl DecoderConfig {
    /// Number of capture buffers to request given the hardware minimum.
    pub fn capture_buffer_count(&self, min_buffers: u32) -> u32 {
        min_buffers
            .saturating_add(self.extra_capture_buffers)
            .min(self.max_capture_buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_count_adds_margin_and_clamps() {
        let config = DecoderConfig::default();
        assert_eq!(config.capture_buffer_count(4), 5);
        assert_eq!(config.capture_buffer_count(40), MAX_CAPTURE_BUFFERS);
    }

    #[test]
    fn output_mode_parsing() {
        assert_eq!("tiled".parse::<OutputMode>(), Ok(OutputMode::Tiled));
        assert_eq!("I420".parse::<OutputMode>(), Ok(OutputMode::Linear));
        assert!("rgb".parse::<OutputMode>().is_err());
    }
}
