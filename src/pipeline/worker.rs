// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::config::DecoderConfig;
use crate::config::OutputMode;
use crate::device::CodecDevice;
use crate::framer::framer_for;
use crate::framer::BitstreamFramer;
use crate::framer::ExtractMode;
use crate::framer::ScanOutcome;
use crate::image_processing::detile_chroma;
use crate::image_processing::detile_luma;
use crate::image_processing::i420_frame_size;
use crate::image_processing::tiled_plane_size;
use crate::pipeline::lock_callbacks;
use crate::pipeline::lock_shared;
use crate::pipeline::BufferFlags;
use crate::pipeline::InputBuffer;
use crate::pipeline::OutputBuffer;
use crate::pipeline::PipelineCallbacks;
use crate::pipeline::PipelineError;
use crate::pipeline::PipelineEvent;
use crate::pipeline::PipelineState;
use crate::pipeline::SharedState;
use crate::session::CodecSession;
use crate::session::DecodedSlot;
use crate::tunnel::TiledFrameDescriptor;
use crate::CodecKind;

/// How long to wait before polling the hardware again when it has nothing for us.
const HARDWARE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Progress of the end of stream handling once the EOS input buffer has been fully scanned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EosStage {
    None,
    /// The framer has been flushed, its last unit still has to reach the hardware.
    SubmitLast,
    /// The empty input buffer has been queued, waiting for the empty capture buffer.
    Draining,
}

/// What the worker should do after synchronizing with the handle.
enum Next {
    Stop,
    Work,
}

pub(crate) struct Worker<D: CodecDevice> {
    session: CodecSession<D>,
    framer: Box<dyn BitstreamFramer>,
    config: DecoderConfig,
    shared: SharedState,
    callbacks: Arc<Mutex<PipelineCallbacks>>,
    input: Option<InputBuffer>,
    output: Option<OutputBuffer>,
    header_parsed: bool,
    /// H.263 has no separate header: the unit the hardware parsed the geometry from is also
    /// the first picture, and goes to the hardware a second time once the session is up.
    replay: Option<Vec<u8>>,
    /// A complete unit sits in the input slot, waiting for the hardware to take it.
    unit_ready: bool,
    eos: EosStage,
    /// Capture slots set aside at the end of a drain, to be queued again with the next stream.
    rearm_capture: bool,
    start_time: bool,
    timestamp: u64,
    /// Units queued to the hardware whose frame has not come out yet.
    frames_in_flight: usize,
    /// Capture slots described to the consumer of tiled frames and not returned yet.
    tiled_slots: BTreeSet<usize>,
    slot_violations: u32,
}

impl<D: CodecDevice> Worker<D> {
    pub(crate) fn new(
        session: CodecSession<D>,
        config: DecoderConfig,
        shared: SharedState,
        callbacks: Arc<Mutex<PipelineCallbacks>>,
    ) -> Self {
        Self {
            framer: framer_for(session.kind()),
            session,
            config,
            shared,
            callbacks,
            input: None,
            output: None,
            header_parsed: false,
            replay: None,
            unit_ready: false,
            eos: EosStage::None,
            rearm_capture: false,
            start_time: false,
            timestamp: 0,
            frames_in_flight: 0,
            tiled_slots: BTreeSet::new(),
            slot_violations: 0,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            match self.sync() {
                Ok(Next::Stop) => break,
                Ok(Next::Work) => (),
                Err(e) => {
                    if self.recover(e) {
                        continue;
                    }
                    break;
                }
            }

            match self.step() {
                Ok(true) => (),
                Ok(false) => self.wait_for_hardware(),
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn set_state(&self, state: PipelineState) {
        let mut shared = lock_shared(&self.shared);
        if shared.state != state && shared.state != PipelineState::Invalid {
            log::debug!("pipeline: {:?} -> {:?}", shared.state, state);
            shared.state = state;
        }
    }

    fn callbacks(&self) -> MutexGuard<'_, PipelineCallbacks> {
        lock_callbacks(&self.callbacks)
    }

    fn return_input(&mut self) {
        if let Some(input) = self.input.take() {
            (self.callbacks().input_done)(input);
        }
    }

    fn deliver_output(&mut self, mut output: OutputBuffer) {
        output.timestamp = self.timestamp;
        if std::mem::take(&mut self.start_time) {
            output.flags |= BufferFlags::START_TIME;
        }
        (self.callbacks().output_done)(output);
    }

    /// Whether the worker has what it needs to make progress without new buffers.
    fn has_work(&self) -> bool {
        if self.output.is_none() {
            return false;
        }
        self.input.is_some()
            || self.replay.is_some()
            || self.unit_ready
            || self.eos == EosStage::Draining
    }

    /// Applies the requests of the handle and waits until there is something to do.
    fn sync(&mut self) -> Result<Next, PipelineError> {
        let shared_state = self.shared.clone();
        let (lock, cvar) = &*shared_state;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if shared.stop {
                return Ok(Next::Stop);
            }

            if shared.flush {
                let inputs = std::mem::take(&mut shared.inputs);
                let outputs = std::mem::take(&mut shared.outputs);
                drop(shared);

                self.flush(inputs, outputs);

                shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
                shared.flush = false;
                cvar.notify_all();
                continue;
            }

            if !shared.returned_slots.is_empty() {
                let returned = std::mem::take(&mut shared.returned_slots);
                drop(shared);

                for slot in returned {
                    self.requeue_tiled(slot)?;
                }

                shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            if shared.pause {
                shared = cvar.wait(shared).unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            if self.output.is_none() {
                self.output = shared.outputs.pop_front();
            }
            if self.input.is_none() && self.eos != EosStage::Draining {
                if let Some(input) = shared.inputs.pop_front() {
                    if input.flags.contains(BufferFlags::START_TIME) {
                        self.start_time = true;
                    }
                    self.timestamp = input.timestamp;
                    if shared.state == PipelineState::Idle {
                        shared.state = PipelineState::Running;
                    }
                    self.input = Some(input);
                }
            }

            if self.has_work() {
                return Ok(Next::Work);
            }

            // Decoded frames keep coming out of the hardware even without new input.
            if self.output.is_some() && self.frames_in_flight > 0 {
                let (guard, _) = cvar
                    .wait_timeout(shared, HARDWARE_POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner);
                drop(guard);
                self.collect_output()?;
                shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            shared = cvar.wait(shared).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_for_hardware(&self) {
        let (lock, cvar) = &*self.shared;
        let shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.stop || shared.flush {
            return;
        }
        let _ = cvar.wait_timeout(shared, HARDWARE_POLL_INTERVAL);
    }

    /// One exchange with the hardware. Returns whether anything moved.
    fn step(&mut self) -> Result<bool, PipelineError> {
        let mut progress = match self.header_parsed {
            false => self.extract_header()?,
            true => self.feed()?,
        };
        progress |= self.collect_output()?;
        progress |= self.finish_input()?;
        Ok(progress)
    }

    /// Runs the framer over the current input buffer, writing into the input slot.
    fn scan_input(&mut self, mode: ExtractMode) -> Result<Option<ScanOutcome>, PipelineError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };
        if input.is_consumed() || !self.session.poll_input_slot()? {
            return Ok(None);
        }

        let data = input.data.clone();
        let (start, end) = (input.offset, input.filled.min(data.len()));
        let available = end - start;
        let outcome = self.framer.scan(&data[start..end], self.session.input_space()?, mode);

        if outcome.consumed > available {
            log::warn!(
                "framer consumed {} bytes out of {}, dropping the rest of the buffer",
                outcome.consumed,
                available
            );
            input.offset = end;
            self.session.discard_input();
            self.framer.reset();
            return Ok(None);
        }

        self.session.advance_input(outcome.copied)?;
        Ok(Some(outcome))
    }

    fn advance_input(&mut self, consumed: usize) {
        if let Some(input) = self.input.as_mut() {
            input.offset += consumed;
        }
    }

    /// Drops a unit that did not fit in the input slot, or records it as ready.
    fn complete_unit(&mut self, overflowed: bool) {
        if overflowed {
            log::warn!(
                "dropping a unit larger than the {} bytes input buffer",
                self.session.input_size()
            );
            self.session.discard_input();
        } else if self.session.pending_input() > 0 {
            self.unit_ready = true;
        }
    }

    fn extract_header(&mut self) -> Result<bool, PipelineError> {
        let Some(outcome) = self.scan_input(ExtractMode::Headers)? else {
            return Ok(false);
        };

        match outcome.unit {
            None => self.advance_input(outcome.consumed),
            Some(_) if outcome.overflowed => {
                log::warn!("dropping stream headers larger than the input buffer");
                self.session.discard_input();
                self.advance_input(outcome.consumed);
            }
            Some(span) => {
                log::debug!("found stream headers at {}..{}", span.start, span.end);
                if self.session.kind() == CodecKind::H263 {
                    self.replay = Some(self.session.input_bytes().to_vec());
                }
                self.advance_input(outcome.consumed);
                self.bring_up()?;
            }
        }

        Ok(true)
    }

    fn bring_up(&mut self) -> Result<(), PipelineError> {
        self.session.submit_header()?;
        let geometry = self.session.read_geometry()?;
        let count = self.config.capture_buffer_count(geometry.min_capture_buffers);
        self.session.allocate_capture_buffers(count)?;
        self.header_parsed = true;

        log::debug!("stream geometry: {:?}, {} capture buffers", geometry, count);
        (self.callbacks().event)(PipelineEvent::FormatChanged(geometry));
        Ok(())
    }

    fn feed(&mut self) -> Result<bool, PipelineError> {
        if std::mem::take(&mut self.rearm_capture) {
            self.session.rearm_capture()?;
        }

        if self.replay.is_some() {
            return self.replay_header();
        }

        if self.unit_ready {
            if !self.session.try_enqueue_input()? {
                return Ok(false);
            }
            self.unit_ready = false;
            self.frames_in_flight += 1;
            return Ok(true);
        }

        let Some(outcome) = self.scan_input(ExtractMode::Frame)? else {
            return Ok(false);
        };
        self.advance_input(outcome.consumed);
        if outcome.unit.is_some() {
            self.complete_unit(outcome.overflowed);
        }
        Ok(true)
    }

    /// Copies the unit kept by [`Worker::extract_header`] back into the input slot once the
    /// hardware has released it.
    fn replay_header(&mut self) -> Result<bool, PipelineError> {
        if !self.session.poll_input_slot()? {
            return Ok(false);
        }
        let Some(unit) = self.replay.take() else {
            return Ok(false);
        };

        let space = self.session.input_space()?;
        let len = unit.len().min(space.len());
        space[..len].copy_from_slice(&unit[..len]);
        self.session.advance_input(len)?;
        self.unit_ready = len > 0;

        log::debug!("replaying the {} bytes header unit as the first picture", len);
        Ok(true)
    }

    /// Returns the current input buffer once it has been fully scanned, running the end of
    /// stream sequence first if it is flagged so.
    fn finish_input(&mut self) -> Result<bool, PipelineError> {
        let Some(input) = self.input.as_ref() else {
            return Ok(false);
        };
        if !input.is_consumed() {
            return Ok(false);
        }
        if !input.flags.contains(BufferFlags::EOS) {
            self.return_input();
            return Ok(true);
        }

        if !self.header_parsed {
            return Ok(self.end_stream_without_header());
        }

        match self.eos {
            EosStage::None => {
                if self.replay.is_some()
                    || self.unit_ready
                    || !self.session.poll_input_slot()?
                {
                    return Ok(false);
                }
                let outcome = self.framer.finish(self.session.input_space()?);
                self.session.advance_input(outcome.copied)?;
                if outcome.unit.is_some() {
                    self.complete_unit(outcome.overflowed);
                }
                self.eos = EosStage::SubmitLast;
                self.set_state(PipelineState::Draining);
                Ok(true)
            }
            EosStage::SubmitLast => {
                if self.unit_ready || !self.session.start_drain()? {
                    return Ok(false);
                }
                self.eos = EosStage::Draining;
                self.return_input();
                Ok(true)
            }
            EosStage::Draining => Ok(false),
        }
    }

    /// End of a stream in which no header was ever found: nothing was decoded.
    fn end_stream_without_header(&mut self) -> bool {
        let Some(mut output) = self.output.take() else {
            return false;
        };
        log::warn!("end of stream before any stream header");
        self.framer.reset();
        self.session.discard_input();
        self.set_state(PipelineState::Idle);
        self.return_input();

        output.filled = 0;
        output.flags |= BufferFlags::EOS;
        self.deliver_output(output);
        (self.callbacks().event)(PipelineEvent::EndOfStream);
        true
    }

    /// Moves a decoded frame, if any, into the current output buffer.
    fn collect_output(&mut self) -> Result<bool, PipelineError> {
        if self.output.is_none() || !self.header_parsed {
            return Ok(false);
        }
        let Some(decoded) = self.session.try_dequeue_output()? else {
            return Ok(false);
        };

        if decoded.is_eos() {
            self.end_of_stream(decoded)?;
            return Ok(true);
        }
        self.frames_in_flight = self.frames_in_flight.saturating_sub(1);

        match self.config.output_mode {
            OutputMode::Linear => self.copy_frame(decoded)?,
            OutputMode::Tiled => self.describe_frame(decoded)?,
        }
        Ok(true)
    }

    fn end_of_stream(&mut self, decoded: DecodedSlot) -> Result<(), PipelineError> {
        self.session.release_capture(decoded.index)?;
        self.rearm_capture = true;
        self.eos = EosStage::None;
        self.unit_ready = false;
        self.frames_in_flight = 0;
        self.framer.reset();
        self.set_state(PipelineState::Idle);

        if let Some(mut output) = self.output.take() {
            output.filled = 0;
            output.flags |= BufferFlags::EOS;
            self.deliver_output(output);
        }
        log::debug!("end of stream reached");
        (self.callbacks().event)(PipelineEvent::EndOfStream);
        Ok(())
    }

    /// De-tiles a decoded frame into the output buffer as I420.
    fn copy_frame(&mut self, decoded: DecodedSlot) -> Result<(), PipelineError> {
        let coded = self.session.geometry().unwrap_or_default().coded;
        let (width, height) = (coded.width as usize, coded.height as usize);
        let frame_size = i420_frame_size(width, height);
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        let (luma, chroma) = self.session.capture_planes(decoded.index)?;
        if output.data.len() < frame_size
            || luma.len() < tiled_plane_size(width, height)
            || chroma.len() < tiled_plane_size(width, height / 2)
        {
            log::warn!(
                "dropping frame {}: {} bytes output buffer for a {}x{} frame",
                decoded.sequence,
                output.data.len(),
                width,
                height
            );
            self.session.requeue_capture(decoded.index)?;
            return Ok(());
        }

        let (y, uv) = output.data[..frame_size].split_at_mut(width * height);
        detile_luma(y, luma, width, height);
        detile_chroma(uv, chroma, width, height);
        output.filled = frame_size;

        self.session.requeue_capture(decoded.index)?;
        if let Some(output) = self.output.take() {
            self.deliver_output(output);
        }
        Ok(())
    }

    /// Hands the tiled capture buffer itself downstream. The slot stays with the consumer
    /// until it is returned.
    fn describe_frame(&mut self, decoded: DecodedSlot) -> Result<(), PipelineError> {
        let descriptor = self.session.capture_descriptor(decoded.index)?.to_bytes();
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        if output.data.len() < TiledFrameDescriptor::ENCODED_LEN {
            log::warn!("output buffer too small for a tiled frame descriptor");
            self.session.requeue_capture(decoded.index)?;
            return Ok(());
        }

        output.data[..descriptor.len()].copy_from_slice(&descriptor);
        output.filled = descriptor.len();
        self.tiled_slots.insert(decoded.index);

        if let Some(output) = self.output.take() {
            self.deliver_output(output);
        }
        Ok(())
    }

    fn requeue_tiled(&mut self, slot: usize) -> Result<(), PipelineError> {
        if !self.tiled_slots.remove(&slot) {
            return Err(PipelineError::UnknownSlot(slot));
        }
        self.session.requeue_capture(slot)?;
        Ok(())
    }

    /// Hands every buffer back and forgets the partially assembled unit.
    fn flush(
        &mut self,
        inputs: impl IntoIterator<Item = InputBuffer>,
        outputs: impl IntoIterator<Item = OutputBuffer>,
    ) {
        log::debug!("flushing pipeline");
        self.framer.reset();
        self.session.discard_input();
        self.replay = None;
        self.unit_ready = false;
        self.start_time = false;
        if self.eos != EosStage::None {
            self.eos = EosStage::None;
            self.set_state(PipelineState::Running);
        }

        let mut callbacks = lock_callbacks(&self.callbacks);
        self.input.take().into_iter().chain(inputs).for_each(&mut callbacks.input_done);
        self.output.take().into_iter().chain(outputs).for_each(&mut callbacks.output_done);
    }

    /// Decides whether the loop can go on after `e`.
    fn recover(&mut self, e: PipelineError) -> bool {
        if e.is_slot_violation() {
            self.slot_violations += 1;
            log::warn!("{} ({} so far)", e, self.slot_violations);
            if self.slot_violations <= self.config.max_slot_violations {
                return true;
            }
            self.fail(PipelineError::TooManySlotViolations(self.slot_violations));
            return false;
        }

        self.fail(e);
        false
    }

    fn fail(&mut self, e: PipelineError) {
        log::error!("pipeline failed: {}", e);
        {
            let mut shared = lock_shared(&self.shared);
            shared.state = PipelineState::Invalid;
            self.shared.1.notify_all();
        }
        (self.callbacks().event)(PipelineEvent::Error(e));
    }

    fn shutdown(&mut self) {
        self.return_input();
        if let Some(output) = self.output.take() {
            (self.callbacks().output_done)(output);
        }

        if !self.tiled_slots.is_empty() {
            log::warn!("{} tiled frames still held downstream", self.tiled_slots.len());
        }
        for slot in std::mem::take(&mut self.tiled_slots) {
            let _ = self.session.release_capture(slot);
        }
        if let Err(e) = self.session.close() {
            log::error!("failed to close decoding session: {}", e);
        }

        let mut shared = lock_shared(&self.shared);
        shared.worker_alive = false;
        self.shared.1.notify_all();
        log::debug!("pipeline worker exiting");
    }
}
