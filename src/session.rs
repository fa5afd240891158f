// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decoding session on a stateful memory-to-memory device.
//!
//! Stateful decoders are brought up in two phases. The compressed format is set first and the
//! stream header is queued on its own; only once the hardware has parsed it can the capture
//! geometry be read and the capture buffers be allocated. After that, the session shuttles one
//! compressed unit at a time through its single input buffer and hands decoded capture buffers
//! back to the caller.
//!
//! Every buffer handed to or taken from the device goes through a [`SlotTable`] first, so that
//! ownership violations never reach the hardware.

use thiserror::Error;

use crate::buffer_slots::SlotError;
use crate::buffer_slots::SlotState;
use crate::buffer_slots::SlotTable;
use crate::config::DecoderConfig;
use crate::device::BufferInfo;
use crate::device::CodecDevice;
use crate::device::DeviceError;
use crate::device::Format;
use crate::device::PlaneFormat;
use crate::device::QueueDirection;
use crate::tunnel::PlaneRegion;
use crate::tunnel::TiledFrameDescriptor;
use crate::CodecKind;
use crate::Rect;
use crate::Resolution;

/// Index of the only compressed input buffer.
const INPUT_SLOT: usize = 0;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    FormatNegotiated,
    HeaderPending,
    Streaming,
    Draining,
    Error,
}

/// Properties of the decoded stream, known once the header has been parsed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamGeometry {
    pub coded: Resolution,
    pub crop: Rect,
    pub min_capture_buffers: u32,
}

/// A capture buffer returned by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedSlot {
    pub index: usize,
    pub bytes_used: u32,
    pub sequence: u32,
}

impl DecodedSlot {
    /// An empty capture buffer marks the end of a drain.
    pub fn is_eos(&self) -> bool {
        self.bytes_used == 0
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("hardware fault: {0}")]
    Device(#[from] DeviceError),
    #[error("buffer ownership violation: {0}")]
    Slot(#[from] SlotError),
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: SessionState },
    #[error("hardware granted {granted} capture buffers, {required} required")]
    NotEnoughBuffers { granted: u32, required: u32 },
    #[error("capture slot {0} is not held by the consumer")]
    NotDequeued(usize),
}

impl SessionError {
    /// Whether the error comes from the hardware misbehaving, after which the session is
    /// unusable.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(self, SessionError::Device(_) | SessionError::NotEnoughBuffers { .. })
    }
}

pub struct CodecSession<D: CodecDevice> {
    device: D,
    kind: CodecKind,
    state: SessionState,
    input_size: usize,
    input_slots: SlotTable,
    capture_slots: SlotTable,
    capture_buffers: Vec<BufferInfo>,
    geometry: Option<StreamGeometry>,
    output_streaming: bool,
    capture_streaming: bool,
}

impl<D: CodecDevice> CodecSession<D> {
    /// Negotiates the compressed format of `kind` and allocates the input buffer.
    pub fn open(
        mut device: D,
        kind: CodecKind,
        config: &DecoderConfig,
    ) -> Result<Self, SessionError> {
        let capabilities = device.capabilities()?;
        if !capabilities.is_mplane_m2m() {
            return Err(DeviceError::MissingCapabilities(capabilities).into());
        }
        log::debug!("device capabilities: {:?}", capabilities);

        let format = Format {
            fourcc: kind.fourcc(),
            resolution: Default::default(),
            planes: vec![PlaneFormat {
                size_image: config.compressed_buffer_size as u32,
                bytes_per_line: 0,
            }],
        };
        let applied = device.set_format(QueueDirection::Output, &format)?;
        log::debug!("Output format:\n\t{:?}\n", applied);

        if device.request_buffers(QueueDirection::Output, 1)? < 1 {
            return Err(SessionError::NotEnoughBuffers { granted: 0, required: 1 });
        }
        let input_size = device
            .map_buffers(QueueDirection::Output)?
            .first()
            .and_then(|buffer| buffer.planes.first())
            .map(|plane| plane.length as usize)
            .ok_or(DeviceError::InvalidBuffer(INPUT_SLOT))?;

        log::debug!("session: Closed -> FormatNegotiated ({:?}, {} bytes input)", kind, input_size);

        Ok(Self {
            device,
            kind,
            state: SessionState::FormatNegotiated,
            input_size,
            input_slots: SlotTable::new(1),
            capture_slots: Default::default(),
            capture_buffers: Vec::new(),
            geometry: None,
            output_streaming: false,
            capture_streaming: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn geometry(&self) -> Option<StreamGeometry> {
        self.geometry
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn capture_slots(&self) -> &SlotTable {
        &self.capture_slots
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("session: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        match allowed.contains(&self.state) {
            true => Ok(()),
            false => Err(SessionError::InvalidState { op, state: self.state }),
        }
    }

    /// Runs `f`, moving the session to the error state if the hardware failed.
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let result = f(self);
        if let Err(e) = &result {
            if e.is_hardware_fault() {
                log::error!("{}", e);
                self.set_state(SessionState::Error);
            }
        }
        result
    }

    /// Whether the input buffer can be written to.
    pub fn input_slot_free(&self) -> bool {
        self.input_slots.state(INPUT_SLOT) == Ok(SlotState::Free)
    }

    /// The writable part of the input buffer, after the bytes accumulated so far.
    pub fn input_space(&mut self) -> Result<&mut [u8], SessionError> {
        let state = self.input_slots.state(INPUT_SLOT)?;
        if state != SlotState::Free {
            return Err(SlotError::InvalidTransition {
                index: INPUT_SLOT,
                from: state,
                to: SlotState::Free,
            }
            .into());
        }
        let offset = self.input_slots.write_offset(INPUT_SLOT)?;
        let plane = self
            .device
            .plane_mut(QueueDirection::Output, INPUT_SLOT, 0)
            .ok_or(DeviceError::InvalidBuffer(INPUT_SLOT))?;
        let offset = offset.min(plane.len());

        Ok(&mut plane[offset..])
    }

    /// Accounts for `len` bytes written through [`CodecSession::input_space`].
    pub fn advance_input(&mut self, len: usize) -> Result<(), SessionError> {
        Ok(self.input_slots.advance(INPUT_SLOT, len, self.input_size)?)
    }

    /// Number of bytes accumulated in the input buffer.
    pub fn pending_input(&self) -> usize {
        self.input_slots.write_offset(INPUT_SLOT).unwrap_or(0)
    }

    /// The bytes accumulated in the input buffer.
    pub fn input_bytes(&self) -> &[u8] {
        let len = self.pending_input();
        self.device
            .plane(QueueDirection::Output, INPUT_SLOT, 0)
            .and_then(|plane| plane.get(..len))
            .unwrap_or_default()
    }

    /// Forgets the bytes accumulated so far.
    pub fn discard_input(&mut self) {
        if let Err(e) = self.input_slots.reset_offset(INPUT_SLOT) {
            log::warn!("failed to discard pending input: {}", e);
        }
    }

    /// Takes the input buffer back from the hardware if it is done with it. Returns whether the
    /// buffer is free.
    pub fn poll_input_slot(&mut self) -> Result<bool, SessionError> {
        self.guarded(|s| {
            if s.input_slot_free() {
                return Ok(true);
            }
            if !s.output_streaming || !s.device.poll()?.output_done {
                return Ok(false);
            }
            match s.device.dequeue_buffer(QueueDirection::Output)? {
                Some(buffer) => {
                    s.input_slots.mark_dequeued(buffer.index)?;
                    s.input_slots.release(buffer.index)?;
                    log::debug!("output << index: {}", buffer.index);
                    Ok(s.input_slot_free())
                }
                None => Ok(false),
            }
        })
    }

    fn queue_input(&mut self, bytes_used: usize) -> Result<(), SessionError> {
        self.input_slots.mark_queued(INPUT_SLOT)?;
        self.device.queue_buffer(QueueDirection::Output, INPUT_SLOT, bytes_used as u32)?;
        log::debug!("output >> index: {}, {} bytes", INPUT_SLOT, bytes_used);
        Ok(())
    }

    /// Queues the stream header accumulated in the input buffer and starts the output queue so
    /// that the hardware parses it.
    pub fn submit_header(&mut self) -> Result<(), SessionError> {
        self.expect_state("submit_header", &[SessionState::FormatNegotiated])?;
        self.guarded(|s| {
            s.set_state(SessionState::HeaderPending);
            s.queue_input(s.pending_input())?;
            s.device.stream_on(QueueDirection::Output)?;
            s.output_streaming = true;
            s.set_state(SessionState::Streaming);
            Ok(())
        })
    }

    /// Reads the geometry of the stream from the parsed header.
    pub fn read_geometry(&mut self) -> Result<StreamGeometry, SessionError> {
        self.expect_state("read_geometry", &[SessionState::Streaming])?;
        self.guarded(|s| {
            let format = s.device.get_format(QueueDirection::Capture)?;
            log::debug!("Capture format:\n\t{:?}\n", format);
            let geometry = StreamGeometry {
                coded: format.resolution,
                crop: s.device.crop(QueueDirection::Capture)?,
                min_capture_buffers: s.device.min_capture_buffers()?,
            };
            s.geometry = Some(geometry);
            Ok(geometry)
        })
    }

    /// Allocates `count` capture buffers, queues all of them and starts the capture queue.
    pub fn allocate_capture_buffers(&mut self, count: u32) -> Result<(), SessionError> {
        self.expect_state("allocate_capture_buffers", &[SessionState::Streaming])?;
        let geometry = match (self.geometry, self.capture_streaming) {
            (Some(geometry), false) => geometry,
            _ => {
                return Err(SessionError::InvalidState {
                    op: "allocate_capture_buffers",
                    state: self.state,
                })
            }
        };
        self.capture_slots.ensure_all_free()?;

        self.guarded(|s| {
            let granted = s.device.request_buffers(QueueDirection::Capture, count)?;
            if granted < geometry.min_capture_buffers {
                return Err(SessionError::NotEnoughBuffers {
                    granted,
                    required: geometry.min_capture_buffers,
                });
            }
            s.capture_buffers = s.device.map_buffers(QueueDirection::Capture)?;
            s.capture_slots = SlotTable::new(s.capture_buffers.len());

            for index in 0..s.capture_buffers.len() {
                s.capture_slots.mark_queued(index)?;
                s.device.queue_buffer(QueueDirection::Capture, index, 0)?;
            }
            s.device.stream_on(QueueDirection::Capture)?;
            s.capture_streaming = true;
            log::debug!("Capture queue: {} buffers, streaming", granted);
            Ok(())
        })
    }

    /// Queues the unit accumulated in the input buffer if the hardware has released it.
    /// Returns whether the unit was queued.
    pub fn try_enqueue_input(&mut self) -> Result<bool, SessionError> {
        self.expect_state("try_enqueue_input", &[SessionState::Streaming])?;
        if !self.poll_input_slot()? {
            return Ok(false);
        }
        let len = self.pending_input();
        if len == 0 {
            // An empty buffer would be taken for the end of the stream.
            return Ok(true);
        }
        self.guarded(|s| s.queue_input(len))?;
        Ok(true)
    }

    /// Takes a decoded capture buffer from the hardware if one is ready.
    pub fn try_dequeue_output(&mut self) -> Result<Option<DecodedSlot>, SessionError> {
        self.expect_state(
            "try_dequeue_output",
            &[SessionState::Streaming, SessionState::Draining],
        )?;
        if !self.capture_streaming {
            return Ok(None);
        }
        self.guarded(|s| {
            if !s.device.poll()?.capture_done {
                return Ok(None);
            }
            let Some(buffer) = s.device.dequeue_buffer(QueueDirection::Capture)? else {
                return Ok(None);
            };
            s.capture_slots.mark_dequeued(buffer.index)?;
            log::debug!("capture << index: {}, {} bytes", buffer.index, buffer.bytes_used);

            let decoded = DecodedSlot {
                index: buffer.index,
                bytes_used: buffer.bytes_used,
                sequence: buffer.sequence,
            };
            if decoded.is_eos() && s.state == SessionState::Draining {
                s.set_state(SessionState::Streaming);
            }
            Ok(Some(decoded))
        })
    }

    fn expect_dequeued(&self, index: usize) -> Result<(), SessionError> {
        match self.capture_slots.state(index)? {
            SlotState::DequeuedPendingConsumer => Ok(()),
            _ => Err(SessionError::NotDequeued(index)),
        }
    }

    /// The luma and chroma planes of a dequeued capture buffer.
    pub fn capture_planes(&self, index: usize) -> Result<(&[u8], &[u8]), SessionError> {
        self.expect_dequeued(index)?;
        let luma = self.device.plane(QueueDirection::Capture, index, 0);
        let chroma = self.device.plane(QueueDirection::Capture, index, 1);
        match (luma, chroma) {
            (Some(luma), Some(chroma)) => Ok((luma, chroma)),
            _ => Err(DeviceError::InvalidBuffer(index).into()),
        }
    }

    /// Describes a dequeued capture buffer for a consumer that reads it in place.
    pub fn capture_descriptor(&self, index: usize) -> Result<TiledFrameDescriptor, SessionError> {
        self.expect_dequeued(index)?;
        let geometry = self.geometry.unwrap_or_default();
        let planes = self
            .capture_buffers
            .get(index)
            .map(|buffer| buffer.planes.as_slice())
            .unwrap_or_default();
        let region = |plane: usize| {
            planes
                .get(plane)
                .map(|info| PlaneRegion { mem_offset: info.mem_offset, size: info.length })
                .ok_or(DeviceError::InvalidBuffer(index))
        };

        Ok(TiledFrameDescriptor {
            slot: index as u16,
            coded: geometry.coded,
            luma: region(0)?,
            chroma: region(1)?,
        })
    }

    /// Hands a capture buffer back to the hardware.
    pub fn requeue_capture(&mut self, index: usize) -> Result<(), SessionError> {
        self.expect_state(
            "requeue_capture",
            &[SessionState::Streaming, SessionState::Draining],
        )?;
        self.capture_slots.mark_queued(index)?;
        self.guarded(|s| {
            s.device.queue_buffer(QueueDirection::Capture, index, 0)?;
            log::debug!("capture >> index: {}", index);
            Ok(())
        })
    }

    /// Keeps a dequeued capture buffer away from the hardware without handing it to anyone.
    pub fn release_capture(&mut self, index: usize) -> Result<(), SessionError> {
        Ok(self.capture_slots.release(index)?)
    }

    /// Queues every free capture buffer, e.g. the ones set aside at the end of a drain.
    pub fn rearm_capture(&mut self) -> Result<(), SessionError> {
        while let Some(index) = self.capture_slots.acquire_free() {
            self.requeue_capture(index)?;
        }
        Ok(())
    }

    /// Queues an empty input buffer, which makes the hardware output every frame it still holds
    /// followed by an empty capture buffer. Returns false if the input buffer is still busy.
    pub fn start_drain(&mut self) -> Result<bool, SessionError> {
        self.expect_state("start_drain", &[SessionState::Streaming])?;
        if !self.poll_input_slot()? {
            return Ok(false);
        }
        self.discard_input();
        self.guarded(|s| {
            s.queue_input(0)?;
            s.set_state(SessionState::Draining);
            Ok(())
        })?;
        Ok(true)
    }

    fn teardown(&mut self, queue: QueueDirection) -> Result<(), SessionError> {
        let (streaming, table) = match queue {
            QueueDirection::Output => (&mut self.output_streaming, &mut self.input_slots),
            QueueDirection::Capture => (&mut self.capture_streaming, &mut self.capture_slots),
        };

        if *streaming {
            self.device.stream_off(queue)?;
            *streaming = false;
        }
        // Stopping the queue only returns the buffers owned by the hardware.
        let held = table.num_pending();
        if held > 0 {
            return Err(SlotError::InUse(held).into());
        }
        table.reclaim_all();
        table.ensure_all_free()?;

        self.device.unmap_buffers(queue);
        self.device.request_buffers(queue, 0)?;
        Ok(())
    }

    /// Stops both queues and frees every buffer. Capture buffers still held by a consumer must
    /// have been released first.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let capture = self.teardown(QueueDirection::Capture);
        let output = self.teardown(QueueDirection::Output);
        if let Err(e) = capture.and(output) {
            log::error!("failed to close session: {}", e);
            self.set_state(SessionState::Error);
            return Err(e);
        }

        self.capture_buffers.clear();
        self.geometry = None;
        self.set_state(SessionState::Closed);
        Ok(())
    }
}

impl<D: CodecDevice> Drop for CodecSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("decoding session dropped without a clean close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::device::dummy::reference_frame;
    use crate::device::dummy::DummyDevice;
    use crate::device::dummy::DummyStream;
    use crate::device::Capabilities;
    use crate::image_processing::detile_chroma;
    use crate::image_processing::detile_luma;
    use crate::image_processing::i420_frame_size;

    fn write_input(session: &mut CodecSession<DummyDevice>, data: &[u8]) {
        session.input_space().unwrap()[..data.len()].copy_from_slice(data);
        session.advance_input(data.len()).unwrap();
    }

    fn streaming_session(device: DummyDevice) -> CodecSession<DummyDevice> {
        let mut session = CodecSession::open(device, CodecKind::H264, &Default::default()).unwrap();
        write_input(&mut session, b"\x00\x00\x00\x01\x67header");
        session.submit_header().unwrap();
        let geometry = session.read_geometry().unwrap();
        session.allocate_capture_buffers(geometry.min_capture_buffers + 1).unwrap();
        session
    }

    #[test]
    fn open_requires_mplane_m2m() {
        let device = DummyDevice::new(Default::default())
            .with_capabilities(Capabilities::VIDEO_CAPTURE_MPLANE | Capabilities::STREAMING);
        let result = CodecSession::open(device, CodecKind::Mpeg4, &Default::default());
        assert!(matches!(
            result,
            Err(SessionError::Device(DeviceError::MissingCapabilities(_)))
        ));
    }

    #[test]
    fn bring_up_sequence() {
        let device = DummyDevice::new(DummyStream {
            coded: Resolution { width: 320, height: 240 },
            crop: Rect { left: 0, top: 0, width: 320, height: 240 },
            min_buffers: 4,
        });
        let record = device.record();
        let mut session = CodecSession::open(device, CodecKind::H264, &Default::default()).unwrap();
        assert_eq!(session.state(), SessionState::FormatNegotiated);
        assert_eq!(session.input_size(), 1 << 20);

        // Geometry is only known once the header went through.
        assert!(session.read_geometry().is_err());

        write_input(&mut session, b"\x00\x00\x00\x01\x67sps");
        assert_eq!(session.input_bytes(), b"\x00\x00\x00\x01\x67sps");
        session.submit_header().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(record.lock().unwrap().header.as_deref(), Some(&b"\x00\x00\x00\x01\x67sps"[..]));

        let geometry = session.read_geometry().unwrap();
        assert_eq!(geometry.coded, Resolution { width: 320, height: 240 });
        assert_eq!(geometry.min_capture_buffers, 4);

        session.allocate_capture_buffers(5).unwrap();
        assert_eq!(session.capture_slots().num_queued(), 5);
        // Header buffers do not decode into anything.
        assert_eq!(session.try_dequeue_output().unwrap(), None);
    }

    #[test]
    fn decode_one_frame() {
        let mut session = streaming_session(DummyDevice::new(Default::default()));

        assert!(session.poll_input_slot().unwrap());
        write_input(&mut session, b"\x00\x00\x00\x01\x65frame");
        assert!(session.try_enqueue_input().unwrap());
        assert!(!session.input_slot_free());
        // The slot is still with the hardware until polled back.
        assert!(session.input_space().is_err());

        let decoded = session.try_dequeue_output().unwrap().unwrap();
        assert_eq!(decoded.index, 0);
        assert!(!decoded.is_eos());

        let (width, height) = (176, 144);
        let mut frame = vec![0u8; i420_frame_size(width, height)];
        let (luma, chroma) = session.capture_planes(decoded.index).unwrap();
        let (y, uv) = frame.split_at_mut(width * height);
        detile_luma(y, luma, width, height);
        detile_chroma(uv, chroma, width, height);
        assert_eq!(frame, reference_frame(Resolution { width: 176, height: 144 }, 0));

        session.requeue_capture(decoded.index).unwrap();
        assert!(matches!(
            session.capture_planes(decoded.index),
            Err(SessionError::NotDequeued(0))
        ));
        assert!(session.poll_input_slot().unwrap());
        assert_eq!(session.pending_input(), 0);
    }

    #[test]
    fn drain_ends_with_empty_capture_buffer() {
        let mut session = streaming_session(DummyDevice::new(Default::default()));

        assert!(session.poll_input_slot().unwrap());
        write_input(&mut session, b"\x00\x00\x00\x01\x65frame");
        assert!(session.try_enqueue_input().unwrap());
        assert!(session.start_drain().unwrap());
        assert_eq!(session.state(), SessionState::Draining);

        let frame = session.try_dequeue_output().unwrap().unwrap();
        assert!(!frame.is_eos());
        let eos = session.try_dequeue_output().unwrap().unwrap();
        assert!(eos.is_eos());
        assert_eq!(session.state(), SessionState::Streaming);

        session.release_capture(eos.index).unwrap();
        session.requeue_capture(frame.index).unwrap();
        session.rearm_capture().unwrap();
        assert_eq!(session.capture_slots().num_free(), 0);
    }

    #[test]
    fn tiled_descriptor_names_the_capture_planes() {
        let mut session = streaming_session(DummyDevice::new(Default::default()));

        assert!(session.poll_input_slot().unwrap());
        write_input(&mut session, b"\x00\x00\x01\xb6vop");
        assert!(session.try_enqueue_input().unwrap());
        let decoded = session.try_dequeue_output().unwrap().unwrap();

        let descriptor = session.capture_descriptor(decoded.index).unwrap();
        assert_eq!(descriptor.slot, 0);
        assert_eq!(descriptor.coded, Resolution { width: 176, height: 144 });
        assert_eq!(descriptor.luma.mem_offset, 1 << 30);
        assert_eq!(descriptor.chroma.mem_offset, (1 << 30) + (1 << 12));
        assert_eq!(descriptor.luma.size, decoded.bytes_used);
    }

    #[test]
    fn ioctl_failure_moves_to_error() {
        // The header and the first capture buffer are queued, the second capture buffer fails.
        let device = DummyDevice::new(Default::default()).with_fault("qbuf", 2);
        let mut session = CodecSession::open(device, CodecKind::H264, &Default::default()).unwrap();
        write_input(&mut session, b"\x00\x00\x00\x01\x67header");
        session.submit_header().unwrap();
        session.read_geometry().unwrap();

        let err = session.allocate_capture_buffers(4).unwrap_err();
        assert!(err.is_hardware_fault());
        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(
            session.try_enqueue_input(),
            Err(SessionError::InvalidState { state: SessionState::Error, .. })
        ));
    }

    #[test]
    fn too_few_capture_buffers_is_a_fault() {
        let mut session = CodecSession::open(
            DummyDevice::new(Default::default()),
            CodecKind::Mpeg2,
            &Default::default(),
        )
        .unwrap();
        write_input(&mut session, b"\x00\x00\x01\xb3seq");
        session.submit_header().unwrap();
        session.read_geometry().unwrap();

        assert!(matches!(
            session.allocate_capture_buffers(2),
            Err(SessionError::NotEnoughBuffers { granted: 2, required: 3 })
        ));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn oversized_unit_is_not_fatal() {
        let config = DecoderConfig { compressed_buffer_size: 4096, ..Default::default() };
        let mut session =
            CodecSession::open(DummyDevice::new(Default::default()), CodecKind::H263, &config)
                .unwrap();

        session.advance_input(4000).unwrap();
        assert!(matches!(
            session.advance_input(200),
            Err(SessionError::Slot(SlotError::WriteOverflow {
                offset: 4000,
                len: 200,
                capacity: 4096
            }))
        ));
        assert_eq!(session.state(), SessionState::FormatNegotiated);

        session.discard_input();
        assert_eq!(session.pending_input(), 0);
    }

    #[test]
    fn close_waits_for_consumers() {
        let mut session = streaming_session(DummyDevice::new(Default::default()));

        assert!(session.poll_input_slot().unwrap());
        write_input(&mut session, b"\x00\x00\x00\x01\x65frame");
        assert!(session.try_enqueue_input().unwrap());
        let decoded = session.try_dequeue_output().unwrap().unwrap();

        assert!(matches!(session.close(), Err(SessionError::Slot(SlotError::InUse(1)))));

        session.release_capture(decoded.index).unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.device().plane(QueueDirection::Capture, 0, 0).is_none());
    }

    #[test]
    fn dropping_a_session_that_cannot_close() {
        let device = DummyDevice::new(Default::default());
        let record = device.record();
        let mut session = streaming_session(device);

        assert!(session.poll_input_slot().unwrap());
        write_input(&mut session, b"\x00\x00\x00\x01\x65frame");
        assert!(session.try_enqueue_input().unwrap());
        session.try_dequeue_output().unwrap().unwrap();

        // A consumer still holds a frame: closing fails and the error is only logged.
        drop(session);
        assert_eq!(record.lock().unwrap().frames.len(), 1);
    }
}
