// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use libfuzzer_sys::fuzz_target;
use m2m_codecs::framer::framer_for;
use m2m_codecs::framer::ExtractMode;
use m2m_codecs::CodecKind;

const KINDS: [CodecKind; 4] =
    [CodecKind::H264, CodecKind::Mpeg4, CodecKind::H263, CodecKind::Mpeg2];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, stream)) = data.split_first() else {
        return;
    };
    let mut framer = framer_for(KINDS[(selector & 3) as usize]);
    let chunk = (selector >> 2) as usize + 1;
    let mut unit = vec![0u8; 4096];
    let mut filled = 0;
    let mut mode = ExtractMode::Headers;

    for piece in stream.chunks(chunk) {
        let mut offset = 0;
        while offset < piece.len() {
            let outcome = framer.scan(&piece[offset..], &mut unit[filled..], mode);
            assert!(outcome.consumed > 0 && offset + outcome.consumed <= piece.len());
            assert!(filled + outcome.copied <= unit.len());
            offset += outcome.consumed;
            filled += outcome.copied;
            if let Some(span) = outcome.unit {
                assert!(span.start <= span.end);
                filled = 0;
                mode = ExtractMode::Frame;
            }
        }
    }

    let last = framer.finish(&mut unit[filled..]);
    assert!(filled + last.copied <= unit.len());
});
