// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous decoding pipeline.
//!
//! A [`PipelineDriver`] owns a worker thread that moves compressed data from client supplied
//! [`InputBuffer`]s into the hardware and decoded frames from the hardware into client supplied
//! [`OutputBuffer`]s. Buffers are handed back through the [`PipelineCallbacks`] once the worker
//! is done with them.

pub mod registry;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::config::DecoderConfig;
#[cfg(feature = "v4l2")]
use crate::device::v4l2::V4l2Device;
use crate::device::CodecDevice;
use crate::session::CodecSession;
use crate::session::SessionError;
use crate::session::StreamGeometry;
use crate::tunnel::DescriptorError;
use crate::tunnel::TiledFrameDescriptor;
use crate::CodecKind;

use registry::InstanceGuard;
use registry::InstanceRegistry;
use registry::RegistryError;
use worker::Worker;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 1 << 0;
        /// The buffer starts a new timeline. Moved from an input buffer to the next output
        /// buffer.
        const START_TIME = 1 << 1;
    }
}

/// Compressed data handed to the pipeline. Only `data[offset..filled]` is decoded.
#[derive(Clone, Debug, Default)]
pub struct InputBuffer {
    pub data: Bytes,
    pub offset: usize,
    pub filled: usize,
    pub flags: BufferFlags,
    pub timestamp: u64,
}

impl InputBuffer {
    pub fn new(data: impl Into<Bytes>, timestamp: u64) -> Self {
        let data = data.into();
        Self {
            filled: data.len(),
            data,
            timestamp,
            ..Default::default()
        }
    }

    /// An empty buffer signaling the end of the stream.
    pub fn eos(timestamp: u64) -> Self {
        Self {
            flags: BufferFlags::EOS,
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The bytes not decoded yet.
    pub fn remaining(&self) -> &[u8] {
        let end = self.filled.min(self.data.len());
        self.data.get(self.offset.min(end)..end).unwrap_or_default()
    }

    pub fn is_consumed(&self) -> bool {
        self.remaining().is_empty()
    }
}

/// Destination of a decoded frame: I420 planes, or a tunnel descriptor in tiled mode.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    pub data: Vec<u8>,
    pub filled: usize,
    pub flags: BufferFlags,
    pub timestamp: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            ..Default::default()
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.data[..self.filled.min(self.data.len())]
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Idle,
    Running,
    Paused,
    Flushing,
    Draining,
    Invalid,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot {op} while {state:?}")]
    BadState { op: &'static str, state: PipelineState },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid tiled frame descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("capture slot {0} was not handed out")]
    UnknownSlot(usize),
    #[error("giving up after {0} buffer ownership violations")]
    TooManySlotViolations(u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the error is a rejected buffer ownership transition, which leaves the hardware
    /// untouched.
    pub fn is_slot_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::Session(SessionError::Slot(_))
                | PipelineError::Session(SessionError::NotDequeued(_))
                | PipelineError::UnknownSlot(_)
        )
    }
}

#[derive(Debug)]
pub enum PipelineEvent {
    /// The stream header has been parsed and the capture buffers allocated.
    FormatChanged(StreamGeometry),
    /// The output buffer flagged EOS has been delivered.
    EndOfStream,
    /// The pipeline went invalid and must be stopped.
    Error(PipelineError),
}

pub struct PipelineCallbacks {
    pub input_done: Box<dyn FnMut(InputBuffer) + Send>,
    pub output_done: Box<dyn FnMut(OutputBuffer) + Send>,
    pub event: Box<dyn FnMut(PipelineEvent) + Send>,
}

/// State shared between the handle and the worker.
#[derive(Default)]
pub(crate) struct Shared {
    /// State maintained by the worker: Idle, Running, Draining or Invalid.
    state: PipelineState,
    worker_alive: bool,
    stop: bool,
    pause: bool,
    flush: bool,
    inputs: VecDeque<InputBuffer>,
    outputs: VecDeque<OutputBuffer>,
    /// Capture slots given back by the consumer of tiled frames.
    returned_slots: VecDeque<usize>,
}

pub(crate) type SharedState = Arc<(Mutex<Shared>, Condvar)>;

pub(crate) fn lock_shared(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock_callbacks(
    callbacks: &Mutex<PipelineCallbacks>,
) -> MutexGuard<'_, PipelineCallbacks> {
    callbacks.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PipelineDriver {
    config: DecoderConfig,
    registry: Arc<InstanceRegistry>,
    callbacks: Arc<Mutex<PipelineCallbacks>>,
    shared: SharedState,
    worker_thread: Option<JoinHandle<()>>,
    instance: Option<InstanceGuard>,
}

impl PipelineDriver {
    pub fn new(
        config: DecoderConfig,
        registry: Arc<InstanceRegistry>,
        callbacks: PipelineCallbacks,
    ) -> Self {
        Self {
            config,
            registry,
            callbacks: Arc::new(Mutex::new(callbacks)),
            shared: Default::default(),
            worker_thread: None,
            instance: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        let shared = lock_shared(&self.shared);
        if shared.flush {
            PipelineState::Flushing
        } else if shared.pause && shared.state != PipelineState::Invalid {
            PipelineState::Paused
        } else {
            shared.state
        }
    }

    /// Opens a decoding session for `kind` on `device` and starts the worker.
    pub fn start<D: CodecDevice + 'static>(
        &mut self,
        device: D,
        kind: CodecKind,
    ) -> Result<(), PipelineError> {
        if self.worker_thread.is_some() {
            return Err(PipelineError::BadState { op: "start", state: self.state() });
        }

        let instance = self.registry.acquire()?;
        let session = CodecSession::open(device, kind, &self.config)?;

        {
            let mut shared = lock_shared(&self.shared);
            *shared = Shared {
                state: PipelineState::Running,
                worker_alive: true,
                ..Default::default()
            };
        }

        let worker = Worker::new(
            session,
            self.config.clone(),
            self.shared.clone(),
            self.callbacks.clone(),
        );
        let spawned = thread::Builder::new()
            .name(format!("{:?}-decoder", kind).to_lowercase())
            .spawn(move || worker.run())
            .context("failed to spawn the decoding worker");
        let worker_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let mut shared = lock_shared(&self.shared);
                shared.state = PipelineState::Idle;
                shared.worker_alive = false;
                return Err(e.into());
            }
        };
        self.worker_thread = Some(worker_thread);
        self.instance = Some(instance);

        log::debug!("pipeline started for {:?}", kind);
        Ok(())
    }

    /// Opens the V4L2 node named by the configuration and starts decoding `kind` on it.
    #[cfg(feature = "v4l2")]
    pub fn start_hardware(&mut self, kind: CodecKind) -> Result<(), PipelineError> {
        let device = V4l2Device::from_config(&self.config).map_err(SessionError::from)?;
        self.start(device, kind)
    }

    /// Stops the worker, abandoning in-flight work. Buffers still held are returned through
    /// the callbacks.
    pub fn stop(&mut self) {
        {
            let mut shared = lock_shared(&self.shared);
            shared.stop = true;
            self.shared.1.notify_all();
        }

        if let Some(worker_thread) = self.worker_thread.take() {
            if worker_thread.join().is_err() {
                log::error!("pipeline worker panicked");
            }
        }

        let (inputs, outputs) = {
            let mut shared = lock_shared(&self.shared);
            let inputs = std::mem::take(&mut shared.inputs);
            let outputs = std::mem::take(&mut shared.outputs);
            *shared = Default::default();
            (inputs, outputs)
        };
        let mut callbacks = lock_callbacks(&self.callbacks);
        inputs.into_iter().for_each(&mut callbacks.input_done);
        outputs.into_iter().for_each(&mut callbacks.output_done);
        drop(callbacks);

        self.instance = None;
    }

    /// Holds the worker after the exchange in flight.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        let mut shared = lock_shared(&self.shared);
        if !shared.worker_alive || shared.state == PipelineState::Invalid {
            return Err(PipelineError::BadState { op: "pause", state: shared.state });
        }
        shared.pause = true;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        let mut shared = lock_shared(&self.shared);
        if !shared.worker_alive || !shared.pause {
            return Err(PipelineError::BadState { op: "resume", state: shared.state });
        }
        shared.pause = false;
        self.shared.1.notify_all();
        Ok(())
    }

    /// Returns every buffer held by the pipeline and discards the partially assembled unit.
    /// Blocks until the worker has done so.
    pub fn flush(&mut self) -> Result<(), PipelineError> {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !shared.worker_alive || shared.state == PipelineState::Invalid {
            return Err(PipelineError::BadState { op: "flush", state: shared.state });
        }

        shared.flush = true;
        cvar.notify_all();
        while shared.flush && shared.worker_alive {
            shared = cvar.wait(shared).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    fn check_accepting(shared: &Shared, op: &'static str) -> Result<(), PipelineError> {
        match shared.worker_alive && shared.state != PipelineState::Invalid {
            true => Ok(()),
            false => Err(PipelineError::BadState { op, state: shared.state }),
        }
    }

    pub fn queue_input(&mut self, buffer: InputBuffer) -> Result<(), PipelineError> {
        let mut shared = lock_shared(&self.shared);
        Self::check_accepting(&shared, "queue input")?;
        shared.inputs.push_back(buffer);
        self.shared.1.notify_all();
        Ok(())
    }

    pub fn queue_output(&mut self, buffer: OutputBuffer) -> Result<(), PipelineError> {
        let mut shared = lock_shared(&self.shared);
        Self::check_accepting(&shared, "queue output")?;
        shared.outputs.push_back(buffer);
        self.shared.1.notify_all();
        Ok(())
    }

    /// Gives a tiled frame back to the pipeline once the consumer is done reading it.
    pub fn return_tiled(&mut self, descriptor: &[u8]) -> Result<(), PipelineError> {
        let descriptor = TiledFrameDescriptor::try_from(descriptor)?;
        let mut shared = lock_shared(&self.shared);
        Self::check_accepting(&shared, "return tiled frame")?;
        shared.returned_slots.push_back(descriptor.slot as usize);
        self.shared.1.notify_all();
        Ok(())
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    use crate::config::OutputMode;
    use crate::device::dummy::reference_frame;
    use crate::device::dummy::DummyDevice;
    use crate::image_processing::i420_frame_size;
    use crate::Resolution;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const QCIF: Resolution = Resolution { width: 176, height: 144 };

    struct Harness {
        driver: PipelineDriver,
        inputs: Receiver<InputBuffer>,
        outputs: Receiver<OutputBuffer>,
        events: Receiver<PipelineEvent>,
    }

    fn harness(config: DecoderConfig, registry: Arc<InstanceRegistry>) -> Harness {
        let (input_tx, inputs) = mpsc::channel();
        let (output_tx, outputs) = mpsc::channel();
        let (event_tx, events) = mpsc::channel();
        let callbacks = PipelineCallbacks {
            input_done: Box::new(move |buffer| {
                let _ = input_tx.send(buffer);
            }),
            output_done: Box::new(move |buffer| {
                let _ = output_tx.send(buffer);
            }),
            event: Box::new(move |event| {
                let _ = event_tx.send(event);
            }),
        };
        Harness {
            driver: PipelineDriver::new(config, registry, callbacks),
            inputs,
            outputs,
            events,
        }
    }

    fn h264_stream(frames: usize) -> Vec<u8> {
        let mut stream = vec![0, 0, 0, 1, 0x67, 0x42, 0x80, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38];
        for n in 0..frames {
            let nal = if n == 0 { 0x65 } else { 0x41 };
            stream.extend_from_slice(&[0, 0, 0, 1, nal, 0x88, 0x84, n as u8 + 1, 0x21]);
        }
        stream
    }

    #[test]
    fn decodes_a_stream_split_in_arbitrary_chunks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut h = harness(Default::default(), Default::default());
        h.driver.start(DummyDevice::new(Default::default()), CodecKind::H264).unwrap();
        assert_eq!(h.driver.state(), PipelineState::Running);

        let frame_size = i420_frame_size(176, 144);
        for _ in 0..4 {
            h.driver.queue_output(OutputBuffer::new(frame_size)).unwrap();
        }
        let stream = h264_stream(3);
        for (i, chunk) in stream.chunks(7).enumerate() {
            h.driver.queue_input(InputBuffer::new(chunk.to_vec(), i as u64)).unwrap();
        }
        h.driver.queue_input(InputBuffer::eos(100)).unwrap();

        match h.events.recv_timeout(TIMEOUT).unwrap() {
            PipelineEvent::FormatChanged(geometry) => assert_eq!(geometry.coded, QCIF),
            event => panic!("unexpected event {:?}", event),
        }
        for n in 0..3 {
            let output = h.outputs.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(output.frame(), &reference_frame(QCIF, n)[..]);
            assert!(!output.flags.contains(BufferFlags::EOS));
        }
        let last = h.outputs.recv_timeout(TIMEOUT).unwrap();
        assert!(last.flags.contains(BufferFlags::EOS));
        assert_eq!(last.filled, 0);
        assert!(matches!(h.events.recv_timeout(TIMEOUT).unwrap(), PipelineEvent::EndOfStream));

        // Every input came back, the EOS one last.
        let returned: Vec<_> = (0..stream.chunks(7).count() + 1)
            .map(|_| h.inputs.recv_timeout(TIMEOUT).unwrap())
            .collect();
        assert!(returned.last().unwrap().flags.contains(BufferFlags::EOS));
        assert_eq!(h.driver.state(), PipelineState::Idle);
    }

    #[test]
    fn start_time_moves_to_the_next_output() {
        let mut h = harness(Default::default(), Default::default());
        h.driver.start(DummyDevice::new(Default::default()), CodecKind::H264).unwrap();
        for _ in 0..2 {
            h.driver.queue_output(OutputBuffer::new(i420_frame_size(176, 144))).unwrap();
        }

        let input = InputBuffer::new(h264_stream(2), 42).with_flags(BufferFlags::START_TIME);
        h.driver.queue_input(input).unwrap();
        h.driver.queue_input(InputBuffer::eos(43)).unwrap();

        let first = h.outputs.recv_timeout(TIMEOUT).unwrap();
        assert!(first.flags.contains(BufferFlags::START_TIME));
        assert_eq!(first.timestamp, 42);
        let second = h.outputs.recv_timeout(TIMEOUT).unwrap();
        assert!(!second.flags.contains(BufferFlags::START_TIME));
    }

    #[test]
    fn tiled_frames_are_described_and_returned() {
        let config = DecoderConfig { output_mode: OutputMode::Tiled, ..Default::default() };
        let mut h = harness(config, Default::default());
        h.driver.start(DummyDevice::new(Default::default()), CodecKind::H264).unwrap();
        for _ in 0..2 {
            h.driver.queue_output(OutputBuffer::new(TiledFrameDescriptor::ENCODED_LEN)).unwrap();
        }
        h.driver.queue_input(InputBuffer::new(h264_stream(2), 0)).unwrap();
        h.driver.queue_input(InputBuffer::eos(1)).unwrap();

        let first = h.outputs.recv_timeout(TIMEOUT).unwrap();
        let descriptor = TiledFrameDescriptor::try_from(first.frame()).unwrap();
        assert_eq!(descriptor.coded, QCIF);
        assert_eq!(descriptor.slot, 0);

        let second = h.outputs.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(TiledFrameDescriptor::try_from(second.frame()).unwrap().slot, 1);

        h.driver.return_tiled(first.frame()).unwrap();
        h.driver.return_tiled(second.frame()).unwrap();
        assert!(h.driver.return_tiled(&first.frame()[..8]).is_err());
    }

    #[test]
    fn registry_limits_running_pipelines() {
        let registry = Arc::new(InstanceRegistry::new(1));
        let mut first = harness(Default::default(), registry.clone());
        let mut second = harness(Default::default(), registry.clone());

        first.driver.start(DummyDevice::new(Default::default()), CodecKind::Mpeg4).unwrap();
        assert!(matches!(
            second.driver.start(DummyDevice::new(Default::default()), CodecKind::Mpeg4),
            Err(PipelineError::Registry(RegistryError::Exhausted(1)))
        ));

        first.driver.stop();
        assert_eq!(registry.active(), 0);
        second.driver.start(DummyDevice::new(Default::default()), CodecKind::Mpeg4).unwrap();
    }

    #[test]
    fn flush_returns_held_buffers() {
        let mut h = harness(Default::default(), Default::default());
        h.driver.start(DummyDevice::new(Default::default()), CodecKind::H264).unwrap();

        // No output buffer, so the worker cannot start on the input.
        h.driver.queue_input(InputBuffer::new(h264_stream(1), 7)).unwrap();
        h.driver.flush().unwrap();
        assert_eq!(h.inputs.recv_timeout(TIMEOUT).unwrap().timestamp, 7);
        assert_eq!(h.driver.state(), PipelineState::Running);
    }

    #[test]
    fn hardware_fault_invalidates_the_pipeline() {
        let mut h = harness(Default::default(), Default::default());
        // The stream-on of the capture queue fails.
        let device = DummyDevice::new(Default::default()).with_fault("streamon", 1);
        h.driver.start(device, CodecKind::H264).unwrap();
        h.driver.queue_output(OutputBuffer::new(i420_frame_size(176, 144))).unwrap();
        h.driver.queue_input(InputBuffer::new(h264_stream(2), 0)).unwrap();

        let event = loop {
            match h.events.recv_timeout(TIMEOUT).unwrap() {
                PipelineEvent::Error(e) => break e,
                _ => continue,
            }
        };
        assert!(matches!(event, PipelineError::Session(ref e) if e.is_hardware_fault()));
        assert_eq!(h.driver.state(), PipelineState::Invalid);
        assert!(h.driver.queue_input(InputBuffer::eos(1)).is_err());

        h.driver.stop();
        assert_eq!(h.driver.state(), PipelineState::Idle);
        // The held buffers came back.
        assert!(h.outputs.recv_timeout(TIMEOUT).is_ok());
        assert!(h.inputs.recv_timeout(TIMEOUT).is_ok());
    }

    #[test]
    fn internal_failures_are_not_slot_violations() {
        let e = PipelineError::from(anyhow::anyhow!("failed to spawn the decoding worker"));
        assert!(!e.is_slot_violation());
        assert_eq!(e.to_string(), "failed to spawn the decoding worker");
    }

    #[cfg(feature = "v4l2")]
    #[test]
    fn hardware_start_uses_the_configured_node() {
        let config = DecoderConfig {
            device_path: "/dev/this-node-does-not-exist".into(),
            ..Default::default()
        };
        let registry = Arc::new(InstanceRegistry::default());
        let mut h = harness(config, registry.clone());

        let e = h.driver.start_hardware(CodecKind::H264).unwrap_err();
        assert!(e.to_string().contains("this-node-does-not-exist"));
        assert_eq!(h.driver.state(), PipelineState::Idle);
        assert_eq!(registry.active(), 0);
    }
}
