// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Descriptor handed downstream instead of a linear copy when the consumer can read NV12MT
//! buffers in place.
//!
//! The descriptor only names the capture slot and where its planes live, the consumer maps them
//! on its side. It travels as a small little endian record so that it can cross process
//! boundaries, and is validated on the way back in.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

use crate::Fourcc;
use crate::Resolution;
use crate::NV12MT_FOURCC;

const VERSION: u16 = 1;

/// Location of one plane of a capture buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneRegion {
    pub mem_offset: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TiledFrameDescriptor {
    pub slot: u16,
    pub coded: Resolution,
    pub luma: PlaneRegion,
    pub chroma: PlaneRegion,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor must be {} bytes, got {0}", TiledFrameDescriptor::ENCODED_LEN)]
    Length(usize),
    #[error("unexpected descriptor tag {0}")]
    Tag(Fourcc),
    #[error("unsupported descriptor version {0}")]
    Version(u16),
}

impl TiledFrameDescriptor {
    /// Size of the record: tag, version, slot, coded size and two plane regions.
    pub const ENCODED_LEN: usize = 4 + 2 + 2 + 4 * 2 + 8 * 2;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];

        LittleEndian::write_u32(&mut buf[0..4], NV12MT_FOURCC.0);
        LittleEndian::write_u16(&mut buf[4..6], VERSION);
        LittleEndian::write_u16(&mut buf[6..8], self.slot);
        LittleEndian::write_u32(&mut buf[8..12], self.coded.width);
        LittleEndian::write_u32(&mut buf[12..16], self.coded.height);
        LittleEndian::write_u32(&mut buf[16..20], self.luma.mem_offset);
        LittleEndian::write_u32(&mut buf[20..24], self.luma.size);
        LittleEndian::write_u32(&mut buf[24..28], self.chroma.mem_offset);
        LittleEndian::write_u32(&mut buf[28..32], self.chroma.size);

        buf
    }
}

impl TryFrom<&[u8]> for TiledFrameDescriptor {
    type Error = DescriptorError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(DescriptorError::Length(buf.len()));
        }

        let tag = Fourcc(LittleEndian::read_u32(&buf[0..4]));
        if tag != NV12MT_FOURCC {
            return Err(DescriptorError::Tag(tag));
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != VERSION {
            return Err(DescriptorError::Version(version));
        }

        Ok(Self {
            slot: LittleEndian::read_u16(&buf[6..8]),
            coded: Resolution {
                width: LittleEndian::read_u32(&buf[8..12]),
                height: LittleEndian::read_u32(&buf[12..16]),
            },
            luma: PlaneRegion {
                mem_offset: LittleEndian::read_u32(&buf[16..20]),
                size: LittleEndian::read_u32(&buf[20..24]),
            },
            chroma: PlaneRegion {
                mem_offset: LittleEndian::read_u32(&buf[24..28]),
                size: LittleEndian::read_u32(&buf[28..32]),
            },
        })
    }
}
