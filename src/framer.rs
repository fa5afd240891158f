// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Incremental splitting of a compressed byte stream into units the hardware can decode.
//!
//! The hardware only accepts whole coded frames, optionally preceded by the stream headers they
//! depend on. The input stream, on the other hand, arrives in arbitrarily sized chunks. A
//! [`Framer`] looks at the stream one byte at a time, recognizes start codes, classifies them
//! as header or payload units using a per-codec [`UnitSyntax`] and reports where a coherent unit
//! ends. The bytes of the unit are copied into a caller-supplied buffer as they are scanned, so
//! a unit may be assembled over several calls.
//!
//! All offsets reported by the framer are absolute offsets into the stream, counted from the
//! first byte ever passed to [`BitstreamFramer::scan`].

pub mod h264;
pub mod mpeg2;
pub mod mpeg4;

use crate::CodecKind;

use h264::NalSyntax;
use mpeg2::PictureSyntax;
use mpeg4::VopSyntax;

/// Boundary policy of a scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtractMode {
    /// Stop as soon as at least one header and the first payload have been seen. The emitted
    /// unit contains the header run only; the payload stays in the framer and starts the next
    /// unit.
    Headers,
    /// Stop on every transition from a payload to the next header run or payload, producing one
    /// decodable frame per unit.
    Frame,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UnitTag {
    #[default]
    Header,
    Payload,
}

/// Absolute byte range of a completed unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameSpan {
    pub start: u64,
    pub end: u64,
    /// Kind of the first start code in the unit.
    pub tag: UnitTag,
}

impl FrameSpan {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Result of one call to [`BitstreamFramer::scan`] or [`BitstreamFramer::finish`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Number of input bytes examined. Never larger than the input.
    pub consumed: usize,
    /// Number of bytes written to the output buffer.
    pub copied: usize,
    /// Set when this call closed a unit. All of its bytes have been copied by now.
    pub unit: Option<FrameSpan>,
    /// Set on a closed unit if some of its bytes did not fit in the output buffers provided.
    pub overflowed: bool,
}

impl ScanOutcome {
    pub fn unit_complete(&self) -> bool {
        self.unit.is_some()
    }
}

/// Position of the scanner within a start code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ScanState {
    #[default]
    NoCode,
    /// One `00` seen.
    Zero1,
    /// `00 00` seen.
    Zero2,
    /// `00 00 00` seen, only used by syntaxes with four byte start codes.
    Zero3,
    /// `00 00 01` seen, the next byte classifies the unit.
    Prefix,
    /// A slice NAL header has been seen, the next byte tells whether it starts a new frame.
    SliceHeader,
}

/// Scanner state shared by all syntaxes.
#[derive(Debug, Default)]
pub struct ScanContext {
    pub state: ScanState,
    /// Absolute offset of the first byte of the start code being recognized.
    pub code_start: u64,
    pub headers: u32,
    pub payloads: u32,
    pub seek_end: bool,
    pub last_tag: UnitTag,
}

impl ScanContext {
    /// Handles the states every syntax treats the same way: looking for the first two zeros.
    pub fn track_zeros(&mut self, byte: u8, offset: u64) {
        match self.state {
            ScanState::Zero1 if byte == 0 => self.state = ScanState::Zero2,
            _ if byte == 0 => {
                self.state = ScanState::Zero1;
                self.code_start = offset;
            }
            _ => self.state = ScanState::NoCode,
        }
    }

    pub fn count(&mut self, tag: UnitTag) {
        match tag {
            UnitTag::Header => self.headers += 1,
            UnitTag::Payload => self.payloads += 1,
        }
        self.last_tag = tag;
    }

    fn reset_counts(&mut self) {
        self.headers = 0;
        self.payloads = 0;
    }
}

/// Start code classification rules of one codec syntax.
pub trait UnitSyntax: Default + Send {
    /// Feeds one byte at absolute `offset` to the state machine. Implementations update
    /// `cx.state`, move `cx.code_start` when extra leading zeros are absorbed, and call
    /// [`ScanContext::count`] when a start code has been classified.
    fn step(&mut self, cx: &mut ScanContext, byte: u8, offset: u64, mode: ExtractMode);

    /// Called when a unit closed on a header start code.
    fn header_boundary(&mut self) {}
}

/// Object-safe interface of a framer, so the codec can be chosen at runtime.
pub trait BitstreamFramer: Send {
    /// Scans `input`, copying the bytes of the current unit to `output`.
    ///
    /// Scanning stops right after the byte that closed a unit, so `consumed` may be smaller than
    /// `input.len()` and the caller is expected to call again with the remaining input and a
    /// fresh output buffer. Bytes that may belong to a start code still being recognized are
    /// held back until the next call, so a unit never ends with part of the next start code.
    fn scan(&mut self, input: &[u8], output: &mut [u8], mode: ExtractMode) -> ScanOutcome;

    /// Flushes the unit still open at the end of the stream.
    fn finish(&mut self, output: &mut [u8]) -> ScanOutcome;

    fn reset(&mut self);
}

/// Returns the framer for streams of `kind`.
pub fn framer_for(kind: CodecKind) -> Box<dyn BitstreamFramer> {
    match kind {
        CodecKind::H264 => Box::new(Framer::<NalSyntax>::new()),
        CodecKind::Mpeg4 | CodecKind::H263 => Box::new(Framer::<VopSyntax>::new()),
        CodecKind::Mpeg2 => Box::new(Framer::<PictureSyntax>::new()),
    }
}

/// Clips the stream range `[from, to)` to the two contiguous segments currently available: the
/// bytes held back from previous calls and the input of the current call starting at `base`.
fn window<'a>(carry: &'a [u8], input: &'a [u8], base: u64, from: u64, to: u64) -> [&'a [u8]; 2] {
    let clip = |segment: &'a [u8], start: u64| -> &'a [u8] {
        let end = start + segment.len() as u64;
        let lo = from.clamp(start, end);
        let hi = to.clamp(start, end);
        if hi <= lo {
            &[]
        } else {
            &segment[(lo - start) as usize..(hi - start) as usize]
        }
    };

    [clip(carry, base - carry.len() as u64), clip(input, base)]
}

#[derive(Debug, Default)]
pub struct Framer<S: UnitSyntax> {
    syntax: S,
    cx: ScanContext,
    /// Absolute offset of the next byte to be scanned.
    pos: u64,
    unit_start: Option<u64>,
    unit_tag: UnitTag,
    /// Bytes `[pos - carry.len(), pos)` that were scanned but not copied yet.
    carry: Vec<u8>,
    overflowed: bool,
}

impl<S: UnitSyntax> Framer<S> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Absolute offset of the next byte to be scanned.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn open_unit(&mut self, tag: UnitTag) {
        self.unit_start = Some(self.cx.code_start);
        self.unit_tag = tag;
    }

    /// Applies the boundary rules after a byte has been stepped. Returns the absolute end of the
    /// unit if one was closed.
    fn check_boundary(&mut self, mode: ExtractMode) -> Option<u64> {
        if mode == ExtractMode::Headers && self.cx.headers >= 1 && self.cx.payloads == 1 {
            return Some(self.cx.code_start);
        }

        if self.unit_start.is_none() {
            match (self.cx.headers, self.cx.payloads) {
                (1, 0) => self.open_unit(UnitTag::Header),
                (0, 1) => {
                    self.open_unit(UnitTag::Payload);
                    self.cx.seek_end = true;
                    self.cx.reset_counts();
                }
                _ => (),
            }
        }

        let cx = &mut self.cx;
        if !cx.seek_end && cx.headers > 0 && cx.payloads == 1 {
            cx.seek_end = true;
            cx.reset_counts();
        }

        if cx.seek_end && (cx.headers > 0 || cx.payloads > 0) {
            return Some(cx.code_start);
        }

        None
    }

    /// Starts the next unit at `end`, the start code that closed the previous one.
    fn close_unit(&mut self, end: u64) -> FrameSpan {
        let span = FrameSpan {
            start: self.unit_start.unwrap_or(end),
            end,
            tag: self.unit_tag,
        };

        match self.cx.last_tag {
            UnitTag::Payload => {
                self.cx.seek_end = true;
                self.cx.reset_counts();
            }
            UnitTag::Header => {
                self.cx.seek_end = false;
                self.cx.headers = 1;
                self.cx.payloads = 0;
                self.syntax.header_boundary();
            }
        }

        self.unit_start = Some(end);
        self.unit_tag = self.cx.last_tag;

        span
    }

    /// Copies `parts` into `output`, flagging the current unit if they do not fit.
    fn copy_out(&mut self, parts: [&[u8]; 2], output: &mut [u8]) -> usize {
        let mut copied = 0;
        for part in parts {
            let len = part.len().min(output.len() - copied);
            output[copied..copied + len].copy_from_slice(&part[..len]);
            copied += len;
            if len < part.len() {
                self.overflowed = true;
            }
        }
        copied
    }
}

impl<S: UnitSyntax> BitstreamFramer for Framer<S> {
    fn scan(&mut self, input: &[u8], output: &mut [u8], mode: ExtractMode) -> ScanOutcome {
        let base = self.pos;

        let mut consumed = 0;
        let mut boundary = None;
        for &byte in input {
            self.syntax.step(&mut self.cx, byte, base + consumed as u64, mode);
            consumed += 1;
            if let Some(end) = self.check_boundary(mode) {
                boundary = Some(end);
                break;
            }
        }

        let scanned = &input[..consumed];
        self.pos = base + consumed as u64;

        // Everything up to here belongs to the current unit, except a start code that is still
        // being recognized.
        let copy_end = match boundary {
            Some(end) => end,
            None if self.cx.state != ScanState::NoCode => self.cx.code_start,
            None => self.pos,
        };

        let mut outcome = ScanOutcome { consumed, ..Default::default() };

        if let Some(start) = self.unit_start {
            let carry = std::mem::take(&mut self.carry);
            outcome.copied = self.copy_out(window(&carry, scanned, base, start, copy_end), output);
            self.carry = carry;
        }

        let [held_carry, held_input] = window(&self.carry, scanned, base, copy_end, self.pos);
        let mut held = Vec::with_capacity(held_carry.len() + held_input.len());
        held.extend_from_slice(held_carry);
        held.extend_from_slice(held_input);
        self.carry = held;

        if let Some(end) = boundary {
            let span = self.close_unit(end);
            log::trace!("closed {:?} unit {}..{}", span.tag, span.start, span.end);
            outcome.unit = Some(span);
            outcome.overflowed = std::mem::take(&mut self.overflowed);
        }

        outcome
    }

    fn finish(&mut self, output: &mut [u8]) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        if let Some(start) = self.unit_start {
            let carry = std::mem::take(&mut self.carry);
            outcome.copied = self.copy_out(window(&carry, &[], self.pos, start, self.pos), output);
            if self.pos > start {
                outcome.unit = Some(FrameSpan {
                    start,
                    end: self.pos,
                    tag: self.unit_tag,
                });
                outcome.overflowed = self.overflowed;
            }
        }

        let pos = self.pos;
        self.reset();
        self.pos = pos;

        outcome
    }

    fn reset(&mut self) {
        *self = Default::default();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Runs `framer` over `stream` fed in `chunk` sized pieces and returns the bytes of every
    /// unit, the last one being flushed by `finish`.
    pub(crate) fn extract_units(
        framer: &mut dyn BitstreamFramer,
        stream: &[u8],
        chunk: usize,
    ) -> Vec<Vec<u8>> {
        let mut units = Vec::new();
        let mut buf = vec![0u8; stream.len() + 16];
        let mut filled = 0;

        for piece in stream.chunks(chunk) {
            let mut offset = 0;
            while offset < piece.len() {
                let outcome =
                    framer.scan(&piece[offset..], &mut buf[filled..], ExtractMode::Frame);
                assert!(outcome.consumed > 0);
                assert!(offset + outcome.consumed <= piece.len());
                offset += outcome.consumed;
                filled += outcome.copied;
                if let Some(span) = outcome.unit {
                    assert!(!outcome.overflowed);
                    assert_eq!(span.len(), filled);
                    units.push(buf[..filled].to_vec());
                    filled = 0;
                }
            }
        }

        let outcome = framer.finish(&mut buf[filled..]);
        filled += outcome.copied;
        if outcome.unit_complete() {
            units.push(buf[..filled].to_vec());
        } else {
            assert_eq!(filled, 0);
        }

        units
    }

    /// Deterministic filler without zero bytes, so it can never form a start code.
    pub(crate) fn filler(seed: u32, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                ((state >> 16) % 255) as u8 + 1
            })
            .collect()
    }

    fn h264_units() -> Vec<Vec<u8>> {
        let unit = |parts: &[&[u8]]| parts.concat();
        vec![
            unit(&[
                &[0, 0, 0, 1, 0x67],
                &filler(1, 12),
                &[0, 0, 0, 1, 0x68],
                &filler(2, 4),
                &[0, 0, 1, 0x65, 0x88],
                &filler(3, 40),
            ]),
            unit(&[&[0, 0, 0, 1, 0x41, 0x9a], &filler(4, 33)]),
            // A second slice of the same picture stays in the same unit.
            unit(&[
                &[0, 0, 1, 0x41, 0x9a],
                &filler(5, 21),
                &[0, 0, 1, 0x41, 0x12],
                &filler(6, 9),
            ]),
            unit(&[
                &[0, 0, 0, 1, 0x06],
                &filler(7, 3),
                &[0, 0, 0, 1, 0x65, 0xb8],
                &filler(8, 17),
            ]),
            unit(&[&[0, 0, 0, 1, 0x41, 0x80], &filler(9, 2)]),
        ]
    }

    #[test]
    fn frame_units_survive_any_chunking() {
        let units = h264_units();
        let stream = units.concat();

        for chunk in [1, 2, 3, 4, 5, 7, 13, 64, stream.len()] {
            let mut framer = framer_for(CodecKind::H264);
            let extracted = extract_units(framer.as_mut(), &stream, chunk);
            assert_eq!(extracted, units, "chunk size {}", chunk);
        }
    }

    #[test]
    fn leading_garbage_is_dropped() {
        let units = h264_units();
        let mut stream = vec![0x12, 0x34, 0x00, 0x56];
        stream.extend(units.concat());

        let mut framer = framer_for(CodecKind::H264);
        let extracted = extract_units(framer.as_mut(), &stream, 6);
        assert_eq!(extracted, units);
    }

    #[test]
    fn straddling_start_code_is_held_back() {
        let units = h264_units();
        let stream = [units[1].clone(), units[4].clone()].concat();
        // Split right after the first two zeros of the second start code.
        let split = units[1].len() + 2;

        let mut framer = Framer::<NalSyntax>::new();
        let mut out = vec![0u8; 256];

        let first = framer.scan(&stream[..split], &mut out, ExtractMode::Frame);
        assert_eq!(first.consumed, split);
        assert_eq!(first.copied, units[1].len());
        assert!(!first.unit_complete());

        let second = framer.scan(&stream[split..], &mut out[first.copied..], ExtractMode::Frame);
        let span = second.unit.unwrap();
        assert_eq!(span.start, 0);
        assert_eq!(span.end, units[1].len() as u64);
        assert_eq!(span.tag, UnitTag::Payload);
        assert_eq!(second.copied, 0);
        assert_eq!(&out[..units[1].len()], &units[1][..]);
    }

    #[test]
    fn overflow_is_reported_with_the_unit() {
        let units = h264_units();
        let stream = units[..2].concat();

        let mut framer = Framer::<NalSyntax>::new();
        let mut small = vec![0u8; 16];
        let outcome = framer.scan(&stream, &mut small, ExtractMode::Frame);

        assert_eq!(outcome.copied, 16);
        assert!(outcome.overflowed);
        assert_eq!(outcome.unit.unwrap().len(), units[0].len());

        // The flag does not leak into the next unit.
        let mut out = vec![0u8; 256];
        let rest = &stream[outcome.consumed..];
        let outcome = framer.scan(rest, &mut out, ExtractMode::Frame);
        assert!(!outcome.unit_complete());
        let last = framer.finish(&mut out[outcome.copied..]);
        assert!(!last.overflowed);
        assert_eq!(outcome.copied + last.copied, units[1].len());
    }

    #[test]
    fn finish_without_start_code_yields_nothing() {
        let mut framer = framer_for(CodecKind::Mpeg2);
        let mut out = vec![0u8; 64];
        let outcome = framer.scan(&filler(3, 50), &mut out, ExtractMode::Frame);
        assert_eq!(outcome.copied, 0);
        let last = framer.finish(&mut out);
        assert_eq!(last, ScanOutcome::default());
    }
}
