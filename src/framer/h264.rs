// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::framer::ExtractMode;
use crate::framer::ScanContext;
use crate::framer::ScanState;
use crate::framer::UnitSyntax;
use crate::framer::UnitTag;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
}

impl NaluType {
    /// Parameter sets and SEI have to be submitted together with the frame that follows them.
    pub fn is_header(&self) -> bool {
        matches!(self, NaluType::Sei | NaluType::Sps | NaluType::Pps)
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NaluType::Slice | NaluType::SliceIdr)
    }
}

/// Annex B byte stream. Slices only count as a new frame when `first_mb_in_slice` is zero, which
/// shows up as the top bit of the byte after the NAL header being set.
#[derive(Debug, Default)]
pub struct NalSyntax;

impl UnitSyntax for NalSyntax {
    fn step(&mut self, cx: &mut ScanContext, byte: u8, offset: u64, _mode: ExtractMode) {
        match cx.state {
            ScanState::Zero2 => match byte {
                0 => cx.state = ScanState::Zero3,
                1 => cx.state = ScanState::Prefix,
                _ => cx.state = ScanState::NoCode,
            },
            ScanState::Zero3 => match byte {
                1 => cx.state = ScanState::Prefix,
                // Only the last four bytes of a zero run are part of the start code.
                0 => cx.code_start += 1,
                _ => cx.state = ScanState::NoCode,
            },
            ScanState::Prefix => {
                cx.state = ScanState::NoCode;
                match NaluType::n(byte & 0x1f) {
                    Some(nalu_type) if nalu_type.is_slice() => cx.state = ScanState::SliceHeader,
                    Some(nalu_type) if nalu_type.is_header() => cx.count(UnitTag::Header),
                    _ => (),
                }
            }
            ScanState::SliceHeader => {
                cx.state = ScanState::NoCode;
                if byte & 0x80 != 0 {
                    cx.count(UnitTag::Payload);
                }
            }
            ScanState::NoCode | ScanState::Zero1 => cx.track_zeros(byte, offset),
        }
    }
}
