// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy device whose only purpose is to let the session and the pipeline
//! run so we can test them in isolation.
//!
//! The device behaves like the MFC as far as the queue protocol goes: the first compressed
//! buffer is taken as the stream header and produces no frame, every following buffer decodes
//! into exactly one capture buffer, and an empty compressed buffer makes the next capture
//! buffer come back empty to signal the end of the drain. Decoded frames are synthetic, see
//! [`reference_frame`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use nix::errno::Errno;

use crate::device::BufferInfo;
use crate::device::Capabilities;
use crate::device::CodecDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceError;
use crate::device::Format;
use crate::device::PlaneFormat;
use crate::device::PlaneInfo;
use crate::device::QueueDirection;
use crate::device::Readiness;
use crate::device::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::image_processing::i420_frame_size;
use crate::image_processing::tile_chroma;
use crate::image_processing::tile_luma;
use crate::image_processing::tiled_plane_size;
use crate::CodecKind;
use crate::Rect;
use crate::Resolution;
use crate::NV12MT_FOURCC;

/// Offset added to the memory offsets of capture buffers, as V4L2 mem2mem drivers do to tell
/// both queues apart in `mmap`.
const CAPTURE_MEM_OFFSET_BASE: u32 = 1 << 30;

/// The linear I420 content of the `n`th frame decoded by the dummy device.
pub fn reference_frame(resolution: Resolution, n: u32) -> Vec<u8> {
    let size = i420_frame_size(resolution.width as usize, resolution.height as usize);
    (0..size).map(|i| ((i + n as usize * 31) % 251) as u8).collect()
}

/// What the device has been fed, for tests to look at.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DummyRecord {
    pub header: Option<Vec<u8>>,
    pub frames: Vec<Vec<u8>>,
    pub eos_count: usize,
}

/// Stream properties the device reports once it has seen the header.
#[derive(Copy, Clone, Debug)]
pub struct DummyStream {
    pub coded: Resolution,
    pub crop: Rect,
    pub min_buffers: u32,
}

impl Default for DummyStream {
    fn default() -> Self {
        Self {
            coded: Resolution { width: 176, height: 144 },
            crop: Rect { left: 0, top: 0, width: 176, height: 144 },
            min_buffers: 3,
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: &'static str,
    successes: usize,
    calls: Cell<usize>,
}

#[derive(Debug, Default)]
struct DummyBuffer {
    planes: Vec<Vec<u8>>,
    bytes_used: u32,
    queued: bool,
}

#[derive(Debug, Default)]
struct DummyQueue {
    buffers: Vec<DummyBuffer>,
    mapped: bool,
    streaming: bool,
    queued: VecDeque<usize>,
    done: VecDeque<DequeuedBuffer>,
    sequence: u32,
}

impl DummyQueue {
    fn complete(&mut self, index: usize, bytes_used: u32) {
        self.buffers[index].queued = false;
        self.buffers[index].bytes_used = bytes_used;
        self.done.push_back(DequeuedBuffer { index, bytes_used, sequence: self.sequence });
        self.sequence += 1;
    }

    fn return_all(&mut self) {
        self.queued.clear();
        self.done.clear();
        for buffer in self.buffers.iter_mut() {
            buffer.queued = false;
        }
    }
}

pub struct DummyDevice {
    stream: DummyStream,
    capabilities: Capabilities,
    faults: Vec<Fault>,
    output_format: Option<Format>,
    header_parsed: bool,
    output: DummyQueue,
    capture: DummyQueue,
    /// Decoded frames waiting for a capture buffer, `None` being the end of stream marker.
    pending: VecDeque<Option<u32>>,
    frames_decoded: u32,
    record: Arc<Mutex<DummyRecord>>,
}

impl DummyDevice {
    pub fn new(stream: DummyStream) -> Self {
        Self {
            stream,
            capabilities: Capabilities::VIDEO_M2M_MPLANE | Capabilities::STREAMING,
            faults: Vec::new(),
            output_format: None,
            header_parsed: false,
            output: Default::default(),
            capture: Default::default(),
            pending: VecDeque::new(),
            frames_decoded: 0,
            record: Default::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Makes `op` fail with `EIO` after succeeding `successes` times.
    pub fn with_fault(mut self, op: &'static str, successes: usize) -> Self {
        self.faults.push(Fault { op, successes, calls: Cell::new(0) });
        self
    }

    /// Shared view of everything the device received.
    pub fn record(&self) -> Arc<Mutex<DummyRecord>> {
        self.record.clone()
    }

    fn check(&self, op: &'static str) -> Result<(), DeviceError> {
        for fault in self.faults.iter().filter(|fault| fault.op == op) {
            let calls = fault.calls.get();
            fault.calls.set(calls + 1);
            if calls >= fault.successes {
                return Err(DeviceError::Ioctl { op, errno: Errno::EIO });
            }
        }
        Ok(())
    }

    fn queue(&self, queue: QueueDirection) -> &DummyQueue {
        match queue {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, queue: QueueDirection) -> &mut DummyQueue {
        match queue {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    fn capture_format(&self) -> Format {
        let width = self.stream.coded.width as usize;
        let height = self.stream.coded.height as usize;
        Format {
            fourcc: NV12MT_FOURCC,
            resolution: self.stream.coded,
            planes: vec![
                PlaneFormat {
                    size_image: tiled_plane_size(width, height) as u32,
                    bytes_per_line: self.stream.coded.width,
                },
                PlaneFormat {
                    size_image: tiled_plane_size(width, height / 2) as u32,
                    bytes_per_line: self.stream.coded.width,
                },
            ],
        }
    }

    fn require_header(&self, op: &'static str) -> Result<(), DeviceError> {
        match self.header_parsed {
            true => Ok(()),
            false => Err(DeviceError::Ioctl { op, errno: Errno::EINVAL }),
        }
    }

    /// Runs the "hardware": consumes queued compressed buffers and fills capture buffers.
    fn process(&mut self) {
        while self.output.streaming {
            let Some(index) = self.output.queued.pop_front() else {
                break;
            };
            let buffer = &self.output.buffers[index];
            let bytes_used = buffer.bytes_used;
            let data = buffer.planes[0][..bytes_used as usize].to_vec();

            if let Ok(mut record) = self.record.lock() {
                if !self.header_parsed {
                    if bytes_used > 0 {
                        log::debug!("dummy device parsed a {} bytes header", bytes_used);
                        self.header_parsed = true;
                        record.header = Some(data);
                    }
                } else if bytes_used == 0 {
                    record.eos_count += 1;
                    self.pending.push_back(None);
                } else {
                    record.frames.push(data);
                    self.pending.push_back(Some(self.frames_decoded));
                    self.frames_decoded += 1;
                }
            }

            self.output.complete(index, bytes_used);
        }

        while self.capture.streaming && !self.pending.is_empty() {
            let Some(index) = self.capture.queued.pop_front() else {
                break;
            };
            let bytes_used = match self.pending.pop_front().flatten() {
                Some(n) => self.decode_into(index, n),
                None => 0,
            };
            self.capture.complete(index, bytes_used);
        }
    }

    fn decode_into(&mut self, index: usize, n: u32) -> u32 {
        let width = self.stream.coded.width as usize;
        let height = self.stream.coded.height as usize;
        let frame = reference_frame(self.stream.coded, n);
        let (luma, chroma) = frame.split_at(width * height);

        let planes = &mut self.capture.buffers[index].planes;
        tile_luma(&mut planes[0], luma, width, height);
        tile_chroma(&mut planes[1], chroma, width, height);

        planes[0].len() as u32
    }
}

impl CodecDevice for DummyDevice {
    fn capabilities(&self) -> Result<Capabilities, DeviceError> {
        self.check("querycap")?;
        Ok(self.capabilities)
    }

    fn set_format(
        &mut self,
        queue: QueueDirection,
        format: &Format,
    ) -> Result<Format, DeviceError> {
        self.check("s_fmt")?;
        match queue {
            QueueDirection::Output => {
                if CodecKind::try_from(format.fourcc).is_err() {
                    return Err(DeviceError::Ioctl { op: "s_fmt", errno: Errno::EINVAL });
                }
                let mut applied = format.clone();
                applied.planes.truncate(1);
                if applied.planes.is_empty() {
                    applied.planes.push(Default::default());
                }
                applied.planes[0].size_image = applied.planes[0].size_image.max(4096);
                self.output_format = Some(applied.clone());
                Ok(applied)
            }
            QueueDirection::Capture => {
                self.require_header("s_fmt")?;
                match format.fourcc == NV12MT_FOURCC {
                    true => Ok(self.capture_format()),
                    false => Err(DeviceError::Ioctl { op: "s_fmt", errno: Errno::EINVAL }),
                }
            }
        }
    }

    fn get_format(&self, queue: QueueDirection) -> Result<Format, DeviceError> {
        self.check("g_fmt")?;
        match queue {
            QueueDirection::Output => self
                .output_format
                .clone()
                .ok_or(DeviceError::Ioctl { op: "g_fmt", errno: Errno::EINVAL }),
            QueueDirection::Capture => {
                self.require_header("g_fmt")?;
                Ok(self.capture_format())
            }
        }
    }

    fn crop(&self, queue: QueueDirection) -> Result<Rect, DeviceError> {
        self.check("g_crop")?;
        match queue {
            QueueDirection::Capture => {
                self.require_header("g_crop")?;
                Ok(self.stream.crop)
            }
            QueueDirection::Output => {
                Err(DeviceError::Ioctl { op: "g_crop", errno: Errno::EINVAL })
            }
        }
    }

    fn control(&self, id: u32) -> Result<i32, DeviceError> {
        self.check("g_ctrl")?;
        self.require_header("g_ctrl")?;
        match id {
            CID_MIN_BUFFERS_FOR_CAPTURE => Ok(self.stream.min_buffers as i32),
            _ => Err(DeviceError::Ioctl { op: "g_ctrl", errno: Errno::EINVAL }),
        }
    }

    fn request_buffers(&mut self, queue: QueueDirection, count: u32) -> Result<u32, DeviceError> {
        self.check("reqbufs")?;
        let plane_sizes: Vec<usize> = match queue {
            QueueDirection::Output => {
                let format = self
                    .output_format
                    .as_ref()
                    .ok_or(DeviceError::Ioctl { op: "reqbufs", errno: Errno::EINVAL })?;
                vec![format.planes[0].size_image as usize]
            }
            QueueDirection::Capture if count > 0 => {
                self.require_header("reqbufs")?;
                self.capture_format()
                    .planes
                    .iter()
                    .map(|plane| plane.size_image as usize)
                    .collect()
            }
            QueueDirection::Capture => Vec::new(),
        };

        let q = self.queue_mut(queue);
        if q.streaming || q.mapped {
            return Err(DeviceError::Ioctl { op: "reqbufs", errno: Errno::EBUSY });
        }
        q.buffers = (0..count)
            .map(|_| DummyBuffer {
                planes: plane_sizes.iter().map(|&size| vec![0u8; size]).collect(),
                ..Default::default()
            })
            .collect();

        Ok(count)
    }

    fn map_buffers(&mut self, queue: QueueDirection) -> Result<Vec<BufferInfo>, DeviceError> {
        self.check("mmap")?;
        let base = match queue {
            QueueDirection::Output => 0,
            QueueDirection::Capture => CAPTURE_MEM_OFFSET_BASE,
        };
        let q = self.queue_mut(queue);
        q.mapped = true;

        Ok(q.buffers
            .iter()
            .enumerate()
            .map(|(index, buffer)| BufferInfo {
                index,
                planes: buffer
                    .planes
                    .iter()
                    .enumerate()
                    .map(|(plane, data)| PlaneInfo {
                        length: data.len() as u32,
                        mem_offset: base + (((index * 2 + plane) as u32) << 12),
                    })
                    .collect(),
            })
            .collect())
    }

    fn unmap_buffers(&mut self, queue: QueueDirection) {
        self.queue_mut(queue).mapped = false;
    }

    fn plane(&self, queue: QueueDirection, index: usize, plane: usize) -> Option<&[u8]> {
        let q = self.queue(queue);
        if !q.mapped {
            return None;
        }
        q.buffers.get(index)?.planes.get(plane).map(Vec::as_slice)
    }

    fn plane_mut(
        &mut self,
        queue: QueueDirection,
        index: usize,
        plane: usize,
    ) -> Option<&mut [u8]> {
        let q = self.queue_mut(queue);
        if !q.mapped {
            return None;
        }
        q.buffers.get_mut(index)?.planes.get_mut(plane).map(Vec::as_mut_slice)
    }

    fn queue_buffer(
        &mut self,
        queue: QueueDirection,
        index: usize,
        bytes_used: u32,
    ) -> Result<(), DeviceError> {
        self.check("qbuf")?;
        let q = self.queue_mut(queue);
        let buffer = q.buffers.get_mut(index).ok_or(DeviceError::InvalidBuffer(index))?;
        if buffer.queued {
            return Err(DeviceError::Ioctl { op: "qbuf", errno: Errno::EINVAL });
        }
        if queue == QueueDirection::Output {
            if bytes_used as usize > buffer.planes[0].len() {
                return Err(DeviceError::Ioctl { op: "qbuf", errno: Errno::EINVAL });
            }
            buffer.bytes_used = bytes_used;
        }
        buffer.queued = true;
        q.queued.push_back(index);

        self.process();
        Ok(())
    }

    fn dequeue_buffer(
        &mut self,
        queue: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        self.check("dqbuf")?;
        Ok(self.queue_mut(queue).done.pop_front())
    }

    fn stream_on(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        self.check("streamon")?;
        self.queue_mut(queue).streaming = true;
        self.process();
        Ok(())
    }

    fn stream_off(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        self.check("streamoff")?;
        let q = self.queue_mut(queue);
        q.streaming = false;
        q.return_all();
        if queue == QueueDirection::Output {
            self.pending.clear();
        }
        Ok(())
    }

    fn poll(&self) -> Result<Readiness, DeviceError> {
        self.check("poll")?;
        Ok(Readiness {
            output_done: !self.output.done.is_empty(),
            capture_done: !self.capture.done.is_empty(),
        })
    }
}
