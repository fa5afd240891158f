// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful hardware video decoding over V4L2 memory-to-memory devices.
//!
//! The crate is organized leaves first:
//!
//! * [`framer`] splits a continuous compressed byte stream into coded units.
//! * [`image_processing`] converts the hardware's tiled NV12MT layout into linear I420.
//! * [`buffer_slots`] keeps track of who owns each hardware buffer.
//! * [`device`] is the ioctl seam, with a real V4L2 implementation and a simulated one.
//! * [`session`] drives the two-phase bring-up of a decoding session.
//! * [`pipeline`] runs the worker loop that ties everything together.
//! * [`tunnel`] describes tiled frames handed downstream without a copy.

pub mod buffer_slots;
pub mod config;
pub mod device;
pub mod framer;
pub mod image_processing;
pub mod pipeline;
pub mod session;
pub mod tunnel;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Visible rectangle reported by the hardware. Only forwarded, never applied.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// A four character code as used by V4L2.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn from_bytes(code: &[u8; 4]) -> Self {
        Self(
            (code[0] as u32)
                | ((code[1] as u32) << 8)
                | ((code[2] as u32) << 16)
                | ((code[3] as u32) << 24),
        )
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        f.write_str(&String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x} ({})", self.0, self)
    }
}

/// Tiled NV12 with 64x32 macroblock tiles, the native capture format of the hardware.
pub const NV12MT_FOURCC: Fourcc = Fourcc::from_bytes(b"TM12");

/// Compressed stream syntaxes the decoder accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    H264,
    Mpeg4,
    H263,
    Mpeg2,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported compressed format {0}")]
pub struct UnsupportedFormat(pub String);

impl CodecKind {
    /// The fourcc set on the output (compressed-in) queue.
    pub fn fourcc(&self) -> Fourcc {
        match self {
            CodecKind::H264 => Fourcc::from_bytes(b"H264"),
            CodecKind::Mpeg4 => Fourcc::from_bytes(b"MPG4"),
            CodecKind::H263 => Fourcc::from_bytes(b"H263"),
            CodecKind::Mpeg2 => Fourcc::from_bytes(b"MPG2"),
        }
    }
}

impl TryFrom<Fourcc> for CodecKind {
    type Error = UnsupportedFormat;

    fn try_from(fourcc: Fourcc) -> Result<Self, Self::Error> {
        [CodecKind::H264, CodecKind::Mpeg4, CodecKind::H263, CodecKind::Mpeg2]
            .into_iter()
            .find(|kind| kind.fourcc() == fourcc)
            .ok_or_else(|| UnsupportedFormat(fourcc.to_string()))
    }
}

impl FromStr for CodecKind {
    type Err = UnsupportedFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" => Ok(CodecKind::H264),
            "mpeg4" | "MPEG4" | "mp4v" => Ok(CodecKind::Mpeg4),
            "h263" | "H263" => Ok(CodecKind::H263),
            "mpeg2" | "MPEG2" | "mp2v" => Ok(CodecKind::Mpeg2),
            _ => Err(UnsupportedFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_display() {
        let fourcc = Fourcc::from_bytes(b"H264");
        assert_eq!(fourcc.to_string(), "H264");
        assert_eq!(fourcc.0, 0x3436_3248);
        assert_eq!(NV12MT_FOURCC.to_string(), "TM12");
    }

    #[test]
    fn codec_kind_from_fourcc() {
        assert_eq!(CodecKind::try_from(Fourcc::from_bytes(b"MPG2")), Ok(CodecKind::Mpeg2));
        assert_eq!(
            CodecKind::try_from(Fourcc::from_bytes(b"VP80")),
            Err(UnsupportedFormat("VP80".into()))
        );
    }

    #[test]
    fn codec_kind_from_str() {
        assert_eq!("h263".parse::<CodecKind>(), Ok(CodecKind::H263));
        assert!("theora".parse::<CodecKind>().is_err());
    }
}
