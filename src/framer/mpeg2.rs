// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::framer::ExtractMode;
use crate::framer::ScanContext;
use crate::framer::ScanState;
use crate::framer::UnitSyntax;
use crate::framer::UnitTag;

pub const PICTURE_START: u8 = 0x00;
pub const SEQUENCE_HEADER: u8 = 0xb3;
pub const GROUP_START: u8 = 0xb8;

/// MPEG-2 video. Slices and extensions are part of whatever unit precedes them.
#[derive(Debug, Default)]
pub struct PictureSyntax;

impl UnitSyntax for PictureSyntax {
    fn step(&mut self, cx: &mut ScanContext, byte: u8, offset: u64, _mode: ExtractMode) {
        match cx.state {
            ScanState::Zero2 => match byte {
                1 => cx.state = ScanState::Prefix,
                0 => cx.code_start += 1,
                _ => cx.state = ScanState::NoCode,
            },
            ScanState::Prefix => {
                cx.state = ScanState::NoCode;
                match byte {
                    SEQUENCE_HEADER | GROUP_START => cx.count(UnitTag::Header),
                    PICTURE_START => cx.count(UnitTag::Payload),
                    _ => (),
                }
            }
            _ => cx.track_zeros(byte, offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::framer::framer_for;
    use crate::framer::tests::extract_units;
    use crate::framer::tests::filler;
    use crate::CodecKind;

    fn unit(code: u8, seed: u32, len: usize) -> Vec<u8> {
        [&[0, 0, 1, code][..], &filler(seed, len)].concat()
    }

    #[test]
    fn pictures_carry_their_slices() {
        let picture = |seed| {
            [unit(PICTURE_START, seed, 8), unit(0xb5, seed + 1, 6), unit(0x01, seed + 2, 30)]
                .concat()
        };
        let frames = vec![
            [unit(SEQUENCE_HEADER, 1, 8), unit(GROUP_START, 2, 4), picture(10)].concat(),
            picture(20),
            [unit(GROUP_START, 3, 4), picture(30)].concat(),
            picture(40),
        ];
        let stream = frames.concat();

        for chunk in [1, 2, 5, 17, stream.len()] {
            let mut framer = framer_for(CodecKind::Mpeg2);
            assert_eq!(extract_units(framer.as_mut(), &stream, chunk), frames);
        }
    }

    #[test]
    fn extra_zero_before_start_code_stays_behind() {
        let first = [unit(PICTURE_START, 1, 8), vec![0]].concat();
        let second = unit(PICTURE_START, 2, 8);
        let stream = [first.clone(), second.clone()].concat();

        let mut framer = framer_for(CodecKind::Mpeg2);
        assert_eq!(extract_units(framer.as_mut(), &stream, 4), vec![first, second]);
    }
}
