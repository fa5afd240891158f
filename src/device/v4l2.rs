// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`CodecDevice`] on top of a V4L2 multi-planar memory-to-memory video node, using `v4l2r`.
//!
//! Buffers always use `MMAP` memory. Every plane is mapped once after allocation and stays
//! mapped until the buffers are freed, so the session can address them by index.

use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use v4l2r::bindings::v4l2_ext_control;
use v4l2r::bindings::v4l2_ext_control__bindgen_ty_1;
use v4l2r::bindings::v4l2_format;
use v4l2r::controls::AsV4l2ControlSlice;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Direction;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::GetFreeCaptureBuffer;
use v4l2r::device::queue::GetFreeOutputBuffer;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Device as VideoDevice;
use v4l2r::device::DeviceConfig;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::ioctl::PlaneMapping;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::memory::MemoryType;
use v4l2r::memory::MmapHandle;
use v4l2r::PixelFormat;
use v4l2r::PlaneLayout;
use v4l2r::QueueType;

use crate::config::DecoderConfig;
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
use crate::Fourcc;
use crate::Rect;
use crate::Resolution;

impl From<QueueDirection> for QueueType {
    fn from(queue: QueueDirection) -> Self {
        match queue {
            QueueDirection::Output => QueueType::VideoOutputMplane,
            QueueDirection::Capture => QueueType::VideoCaptureMplane,
        }
    }
}

impl From<v4l2r::Format> for Format {
    fn from(format: v4l2r::Format) -> Self {
        Format {
            fourcc: Fourcc(format.pixelformat.to_u32()),
            resolution: Resolution { width: format.width, height: format.height },
            planes: format
                .plane_fmt
                .iter()
                .map(|plane| PlaneFormat {
                    size_image: plane.sizeimage,
                    bytes_per_line: plane.bytesperline,
                })
                .collect(),
        }
    }
}

/// A single integer control, read with `VIDIOC_G_EXT_CTRLS`.
struct IntegerControl(v4l2_ext_control);

impl IntegerControl {
    fn new(id: u32) -> Self {
        Self(v4l2_ext_control {
            id,
            __bindgen_anon_1: v4l2_ext_control__bindgen_ty_1 { value: 0 },
            ..Default::default()
        })
    }

    fn value(&self) -> i32 {
        // SAFETY: integer controls have no payload pointer, `value` is the active member.
        unsafe { self.0.__bindgen_anon_1.value }
    }
}

impl AsV4l2ControlSlice for &mut IntegerControl {
    fn as_v4l2_control_slice(&mut self) -> &mut [v4l2_ext_control] {
        std::slice::from_mut(&mut self.0)
    }
}

/// Lifecycle of one queue: formats can only change before buffers are allocated.
enum QueueHandle<D: Direction> {
    Init(Queue<D, QueueInit>),
    Allocated(Queue<D, BuffersAllocated<Vec<MmapHandle>>>),
    /// A transition failed half-way and took the queue with it.
    Lost,
}

impl<D: Direction> Default for QueueHandle<D> {
    fn default() -> Self {
        QueueHandle::Lost
    }
}

impl<D: Direction> QueueHandle<D> {
    fn get_format(&self) -> Result<v4l2r::Format, DeviceError> {
        let format: Result<v4l2r::Format, _> = match self {
            QueueHandle::Init(queue) => queue.get_format(),
            QueueHandle::Allocated(queue) => queue.get_format(),
            QueueHandle::Lost => return Err(lost_queue()),
        };
        Ok(format.context("g_fmt")?)
    }

    fn set_format(&mut self, format: &Format) -> Result<(), DeviceError> {
        let QueueHandle::Init(queue) = self else {
            return Err(DeviceError::Ioctl { op: "s_fmt", errno: Errno::EBUSY });
        };

        queue
            .change_format()
            .context("s_fmt")?
            .set_size(format.resolution.width as usize, format.resolution.height as usize)
            .set_pixelformat(PixelFormat::from_u32(format.fourcc.0))
            .set_planes_layout(
                format
                    .planes
                    .iter()
                    .map(|plane| PlaneLayout {
                        sizeimage: plane.size_image,
                        bytesperline: plane.bytes_per_line,
                    })
                    .collect::<Vec<_>>(),
            )
            .apply::<v4l2_format>()
            .context("s_fmt")?;

        Ok(())
    }

    /// Moves the queue to the state matching `count` buffers, freeing the current ones first.
    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let queue = match std::mem::take(self) {
            QueueHandle::Init(queue) => queue,
            QueueHandle::Allocated(queue) => {
                queue.free_buffers().context("reqbufs(0)")?.queue
            }
            QueueHandle::Lost => return Err(lost_queue()),
        };

        if count == 0 {
            *self = QueueHandle::Init(queue);
            return Ok(0);
        }

        let queue = queue
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, count)
            .context("reqbufs")?;
        let granted = queue.num_buffers() as u32;
        *self = QueueHandle::Allocated(queue);

        Ok(granted)
    }

    fn allocated(&self) -> Result<&Queue<D, BuffersAllocated<Vec<MmapHandle>>>, DeviceError> {
        match self {
            QueueHandle::Allocated(queue) => Ok(queue),
            QueueHandle::Init(_) => Err(DeviceError::Ioctl { op: "qbuf", errno: Errno::EINVAL }),
            QueueHandle::Lost => Err(lost_queue()),
        }
    }

    fn dequeue(&self) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let queue = self.allocated()?;
        let buffer = match queue.try_dequeue() {
            Ok(buffer) => buffer,
            Err(ioctl::DqBufError::IoctlError(
                err @ ioctl::DqBufIoctlError::NotReady | err @ ioctl::DqBufIoctlError::Eos,
            )) => {
                log::trace!("dqbuf: {err:?}");
                return Ok(None);
            }
            Err(err) => return Err(anyhow!("dqbuf failed: {err:?}").into()),
        };

        // Dropping `buffer` hands it back to the free list of the queue.
        Ok(Some(DequeuedBuffer {
            index: buffer.data.index() as usize,
            bytes_used: *buffer.data.get_first_plane().bytesused,
            sequence: buffer.data.sequence(),
        }))
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        Ok(self.allocated()?.stream_on().context("streamon")?)
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        match self {
            QueueHandle::Allocated(queue) => {
                queue.stream_off().context("streamoff")?;
                Ok(())
            }
            // Nothing can be streaming without buffers.
            QueueHandle::Init(_) => Ok(()),
            QueueHandle::Lost => Err(lost_queue()),
        }
    }
}

fn lost_queue() -> DeviceError {
    anyhow!("queue was lost after a failed buffer allocation").into()
}

pub struct V4l2Device {
    device: Arc<VideoDevice>,
    output: QueueHandle<Output>,
    capture: QueueHandle<Capture>,
    output_mappings: Vec<Vec<PlaneMapping>>,
    capture_mappings: Vec<Vec<PlaneMapping>>,
}

impl V4l2Device {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let device = VideoDevice::open(path, DeviceConfig::new().non_blocking_dqbuf())
            .with_context(|| format!("failed to open {}", path.display()))?;
        let device = Arc::new(device);

        let output = Queue::get_output_mplane_queue(device.clone())
            .context("no multi-planar output queue")?;
        let capture = Queue::get_capture_mplane_queue(device.clone())
            .context("no multi-planar capture queue")?;

        log::debug!("opened {} ({})", path.display(), device.caps().driver);

        Ok(Self {
            device,
            output: QueueHandle::Init(output),
            capture: QueueHandle::Init(capture),
            output_mappings: Vec::new(),
            capture_mappings: Vec::new(),
        })
    }

    /// Opens the node named by `config`.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, DeviceError> {
        Self::open(&config.device_path)
    }

    fn mappings(&self, queue: QueueDirection) -> &Vec<Vec<PlaneMapping>> {
        match queue {
            QueueDirection::Output => &self.output_mappings,
            QueueDirection::Capture => &self.capture_mappings,
        }
    }

    fn mappings_mut(&mut self, queue: QueueDirection) -> &mut Vec<Vec<PlaneMapping>> {
        match queue {
            QueueDirection::Output => &mut self.output_mappings,
            QueueDirection::Capture => &mut self.capture_mappings,
        }
    }

    fn num_buffers(&self, queue: QueueDirection) -> usize {
        match queue {
            QueueDirection::Output => self.output.allocated().map_or(0, |q| q.num_buffers()),
            QueueDirection::Capture => self.capture.allocated().map_or(0, |q| q.num_buffers()),
        }
    }
}

impl CodecDevice for V4l2Device {
    fn capabilities(&self) -> Result<Capabilities, DeviceError> {
        let caps = self.device.caps();
        Ok(Capabilities::from_bits_truncate(caps.device_caps().bits()))
    }

    fn set_format(
        &mut self,
        queue: QueueDirection,
        format: &Format,
    ) -> Result<Format, DeviceError> {
        match queue {
            QueueDirection::Output => self.output.set_format(format)?,
            QueueDirection::Capture => self.capture.set_format(format)?,
        }
        self.get_format(queue)
    }

    fn get_format(&self, queue: QueueDirection) -> Result<Format, DeviceError> {
        let format = match queue {
            QueueDirection::Output => self.output.get_format()?,
            QueueDirection::Capture => self.capture.get_format()?,
        };
        log::debug!("{:?} format: {:?}", queue, format);
        Ok(format.into())
    }

    fn crop(&self, queue: QueueDirection) -> Result<Rect, DeviceError> {
        let (selection, target) = match queue {
            QueueDirection::Output => (ioctl::SelectionType::Output, ioctl::SelectionTarget::Crop),
            QueueDirection::Capture => {
                (ioctl::SelectionType::Capture, ioctl::SelectionTarget::Compose)
            }
        };
        let rect = ioctl::g_selection::<v4l2r::Rect>(&*self.device, selection, target)
            .context("g_selection")?;

        Ok(Rect { left: rect.left, top: rect.top, width: rect.width, height: rect.height })
    }

    fn control(&self, id: u32) -> Result<i32, DeviceError> {
        let mut control = IntegerControl::new(id);
        ioctl::g_ext_ctrls(&*self.device, ioctl::CtrlWhich::Current, &mut control)
            .map_err(|err| anyhow!("g_ext_ctrls({id:#x}) failed: {err:?}"))?;

        Ok(control.value())
    }

    fn request_buffers(&mut self, queue: QueueDirection, count: u32) -> Result<u32, DeviceError> {
        // Mappings must not outlive the buffers they point to.
        self.mappings_mut(queue).clear();

        let granted = match queue {
            QueueDirection::Output => self.output.request_buffers(count)?,
            QueueDirection::Capture => self.capture.request_buffers(count)?,
        };
        log::debug!("{:?} queue: requested {} buffers, got {}", queue, count, granted);

        Ok(granted)
    }

    fn map_buffers(&mut self, queue: QueueDirection) -> Result<Vec<BufferInfo>, DeviceError> {
        let count = self.num_buffers(queue);
        let mut infos = Vec::with_capacity(count);
        let mut mappings = Vec::with_capacity(count);

        for index in 0..count {
            let buffer: V4l2Buffer = ioctl::querybuf(&*self.device, queue.into(), index)
                .with_context(|| format!("querybuf({index})"))?;

            let planes = buffer.as_v4l2_planes();
            let info = BufferInfo {
                index,
                planes: planes
                    .iter()
                    .map(|plane| PlaneInfo {
                        length: plane.length,
                        // SAFETY: `mem_offset` is the member filled for MMAP buffers.
                        mem_offset: unsafe { plane.m.mem_offset },
                    })
                    .collect(),
            };

            let planes = info
                .planes
                .iter()
                .enumerate()
                .map(|(plane, p)| {
                    // SAFETY: the offset and length come from the driver for this very buffer.
                    unsafe { ioctl::mmap(&*self.device, p.mem_offset, p.length) }
                        .map_err(|err| anyhow!("failed to map buffer {index} plane {plane}: {err}"))
                })
                .collect::<Result<Vec<_>, _>>()?;

            mappings.push(planes);
            infos.push(info);
        }

        *self.mappings_mut(queue) = mappings;

        Ok(infos)
    }

    fn unmap_buffers(&mut self, queue: QueueDirection) {
        self.mappings_mut(queue).clear();
    }

    fn plane(&self, queue: QueueDirection, index: usize, plane: usize) -> Option<&[u8]> {
        self.mappings(queue).get(index)?.get(plane).map(|mapping| &*mapping.data)
    }

    fn plane_mut(
        &mut self,
        queue: QueueDirection,
        index: usize,
        plane: usize,
    ) -> Option<&mut [u8]> {
        self.mappings_mut(queue).get_mut(index)?.get_mut(plane).map(|mapping| mapping.as_mut())
    }

    fn queue_buffer(
        &mut self,
        queue: QueueDirection,
        index: usize,
        bytes_used: u32,
    ) -> Result<(), DeviceError> {
        if index >= self.num_buffers(queue) {
            return Err(DeviceError::InvalidBuffer(index));
        }

        // The queue hands out free buffers in its own order. Take them until `index` shows up,
        // the others go back to the free list when dropped.
        match queue {
            QueueDirection::Output => {
                let output = self.output.allocated()?;
                let mut skipped = Vec::new();
                loop {
                    let buffer = output
                        .try_get_free_buffer()
                        .map_err(|_| DeviceError::Ioctl { op: "qbuf", errno: Errno::EBUSY })?;
                    if buffer.index() == index {
                        buffer
                            .queue(&[bytes_used as usize])
                            .map_err(|err| anyhow!("qbuf({index}) failed: {err:?}"))?;
                        break;
                    }
                    skipped.push(buffer);
                }
            }
            QueueDirection::Capture => {
                let capture = self.capture.allocated()?;
                let mut skipped = Vec::new();
                loop {
                    let buffer = capture
                        .try_get_free_buffer()
                        .map_err(|_| DeviceError::Ioctl { op: "qbuf", errno: Errno::EBUSY })?;
                    if buffer.index() == index {
                        buffer.queue().map_err(|err| anyhow!("qbuf({index}) failed: {err:?}"))?;
                        break;
                    }
                    skipped.push(buffer);
                }
            }
        }

        Ok(())
    }

    fn dequeue_buffer(
        &mut self,
        queue: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        match queue {
            QueueDirection::Output => self.output.dequeue(),
            QueueDirection::Capture => self.capture.dequeue(),
        }
    }

    fn stream_on(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        match queue {
            QueueDirection::Output => self.output.stream_on()?,
            QueueDirection::Capture => self.capture.stream_on()?,
        }
        log::debug!("{:?} queue streaming", queue);
        Ok(())
    }

    fn stream_off(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        match queue {
            QueueDirection::Output => self.output.stream_off()?,
            QueueDirection::Capture => self.capture.stream_off()?,
        }
        log::debug!("{:?} queue stopped", queue);
        Ok(())
    }

    fn poll(&self) -> Result<Readiness, DeviceError> {
        // SAFETY: the descriptor is owned by `self.device`, which outlives the call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLOUT)];
        poll(&mut fds, PollTimeout::ZERO).map_err(DeviceError::ioctl("poll"))?;

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLERR) {
            return Err(DeviceError::Ioctl { op: "poll", errno: Errno::EIO });
        }

        Ok(Readiness {
            output_done: revents.contains(PollFlags::POLLOUT),
            capture_done: revents.contains(PollFlags::POLLIN),
        })
    }
}
