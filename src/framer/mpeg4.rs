// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::framer::ExtractMode;
use crate::framer::ScanContext;
use crate::framer::ScanState;
use crate::framer::UnitSyntax;
use crate::framer::UnitTag;

pub const VISUAL_OBJECT_SEQUENCE_START: u8 = 0xb0;
pub const USER_DATA_START: u8 = 0xb2;
pub const GROUP_OF_VOP_START: u8 = 0xb3;
pub const VISUAL_OBJECT_START: u8 = 0xb5;
pub const VOP_START: u8 = 0xb6;

/// MPEG-4 Part 2 visual stream, also used for H.263 which only has short video headers.
#[derive(Debug, Default)]
pub struct VopSyntax {
    /// The unit being assembled was opened by a short video header.
    short_header: bool,
}

impl VopSyntax {
    fn classify(byte: u8) -> Option<UnitTag> {
        match byte {
            // video_object_start_code and video_object_layer_start_code.
            _ if matches!(byte & 0xf0, 0x00 | 0x20) => Some(UnitTag::Header),
            VISUAL_OBJECT_SEQUENCE_START
            | USER_DATA_START
            | GROUP_OF_VOP_START
            | VISUAL_OBJECT_START => Some(UnitTag::Header),
            VOP_START => Some(UnitTag::Payload),
            _ => None,
        }
    }

    /// `00 00 1000 00xx` starts a picture with a short video header (H.263 picture start code).
    fn short_video_header(&mut self, cx: &mut ScanContext, mode: ExtractMode) {
        if mode == ExtractMode::Headers && !self.short_header {
            cx.count(UnitTag::Header);
            self.short_header = true;
        } else if !cx.seek_end || self.short_header {
            // While looking for the end of a regular VOP this is a false positive.
            cx.count(UnitTag::Payload);
            self.short_header = true;
        }
    }
}

impl UnitSyntax for VopSyntax {
    fn step(&mut self, cx: &mut ScanContext, byte: u8, offset: u64, mode: ExtractMode) {
        match cx.state {
            ScanState::Zero2 => match byte {
                1 => cx.state = ScanState::Prefix,
                0 => cx.code_start += 1,
                _ if byte & 0xfc == 0x80 => {
                    cx.state = ScanState::NoCode;
                    self.short_video_header(cx, mode);
                }
                _ => cx.state = ScanState::NoCode,
            },
            ScanState::Prefix => {
                cx.state = ScanState::NoCode;
                if let Some(tag) = Self::classify(byte) {
                    cx.count(tag);
                }
            }
            _ => cx.track_zeros(byte, offset),
        }
    }

    fn header_boundary(&mut self) {
        self.short_header = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::framer::framer_for;
    use crate::framer::tests::extract_units;
    use crate::framer::tests::filler;
    use crate::framer::BitstreamFramer;
    use crate::framer::Framer;
    use crate::CodecKind;

    fn unit(code: u8, seed: u32, len: usize) -> Vec<u8> {
        [&[0, 0, 1, code][..], &filler(seed, len)].concat()
    }

    fn h263_picture(seed: u32, len: usize) -> Vec<u8> {
        [&[0, 0, 0x80, 0x02][..], &filler(seed, len)].concat()
    }

    #[test]
    fn headers_travel_with_the_first_vop() {
        let vol = [unit(0xb0, 1, 4), unit(0xb5, 2, 6), unit(0x00, 3, 2), unit(0x20, 4, 12)]
            .concat();
        let frames = vec![
            [vol.clone(), unit(VOP_START, 5, 50)].concat(),
            unit(VOP_START, 6, 31),
            [unit(GROUP_OF_VOP_START, 7, 3), unit(VOP_START, 8, 18)].concat(),
            unit(VOP_START, 9, 7),
        ];
        let stream = frames.concat();

        for chunk in [1, 3, 8, stream.len()] {
            let mut framer = framer_for(CodecKind::Mpeg4);
            assert_eq!(extract_units(framer.as_mut(), &stream, chunk), frames);
        }
    }

    #[test]
    fn header_extraction_returns_vol() {
        let vol = [unit(0xb0, 1, 4), unit(0x20, 4, 12)].concat();
        let stream = [vol.clone(), unit(VOP_START, 5, 50)].concat();

        let mut framer = framer_for(CodecKind::Mpeg4);
        let mut out = vec![0u8; 128];
        let outcome = framer.scan(&stream, &mut out, ExtractMode::Headers);

        assert_eq!(outcome.consumed, vol.len() + 4);
        assert_eq!(&out[..outcome.copied], &vol[..]);
    }

    #[test]
    fn h263_pictures_split_on_short_headers() {
        let pictures = vec![h263_picture(1, 40), h263_picture(2, 12), h263_picture(3, 25)];
        let stream = pictures.concat();

        let mut framer = framer_for(CodecKind::H263);
        assert_eq!(extract_units(framer.as_mut(), &stream, 5), pictures);
    }

    #[test]
    fn h263_header_boundary_leaves_second_picture_open() {
        let pictures = vec![h263_picture(1, 40), h263_picture(2, 12), h263_picture(3, 25)];
        let stream = pictures.concat();

        let mut framer = Framer::<VopSyntax>::new();
        let mut header = vec![0u8; 256];
        let outcome = framer.scan(&stream, &mut header, ExtractMode::Headers);
        assert_eq!(&header[..outcome.copied], &pictures[0][..]);
        assert_eq!(outcome.consumed, pictures[0].len() + 3);

        // The picture that closed the header run is already being assembled as a payload.
        assert_eq!(framer.unit_start, Some(pictures[0].len() as u64));
        assert_eq!(framer.unit_tag, UnitTag::Payload);
        assert!(framer.cx.seek_end);
        assert_eq!((framer.cx.headers, framer.cx.payloads), (0, 0));
        assert!(framer.syntax.short_header);
    }

    /// Headers first, then frames, over the same input fed in `chunk` sized pieces, the way the
    /// pipeline drives the framer.
    fn headers_then_frames(
        kind: CodecKind,
        stream: &[u8],
        chunk: usize,
    ) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut framer = framer_for(kind);
        let mut header = vec![0u8; stream.len()];
        let mut filled = 0;
        let mut rest = Vec::new();

        let mut pieces = stream.chunks(chunk);
        for piece in pieces.by_ref() {
            let outcome = framer.scan(piece, &mut header[filled..], ExtractMode::Headers);
            filled += outcome.copied;
            if outcome.unit.is_some() {
                rest.extend_from_slice(&piece[outcome.consumed..]);
                break;
            }
        }
        rest.extend(pieces.flatten());

        let frames = extract_units(framer.as_mut(), &rest, chunk);
        header.truncate(filled);
        (header, frames)
    }

    #[test]
    fn h263_frames_follow_the_header_unit_across_chunk_sizes() {
        let pictures = vec![
            h263_picture(1, 40),
            h263_picture(2, 12),
            h263_picture(3, 25),
            h263_picture(4, 3),
        ];
        let stream = pictures.concat();

        for chunk in [1, 2, 3, 5, 7, 41, 44, stream.len()] {
            let (header, frames) = headers_then_frames(CodecKind::H263, &stream, chunk);
            assert_eq!(header, pictures[0], "chunk size {}", chunk);
            assert_eq!(frames, pictures[1..], "chunk size {}", chunk);
        }
    }
}
