// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The operations a decoding session needs from a V4L2 memory-to-memory device.
//!
//! [`CodecDevice`] mirrors the handful of ioctls used by the stateful decoding flow. The device
//! owns the mappings of its buffers; callers only borrow them by index, which keeps the lifetime
//! of the mappings tied to the buffer allocation on the device side.

pub mod dummy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use bitflags::bitflags;
use nix::errno::Errno;
use thiserror::Error;

use crate::Fourcc;
use crate::Rect;
use crate::Resolution;

/// Control reporting how many capture buffers the decoder needs for the current stream.
pub const CID_MIN_BUFFERS_FOR_CAPTURE: u32 = 0x0098_0927;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE_MPLANE = 0x0000_1000;
        const VIDEO_OUTPUT_MPLANE = 0x0000_2000;
        const VIDEO_M2M_MPLANE = 0x0000_4000;
        const STREAMING = 0x0400_0000;
        const DEVICE_CAPS = 0x8000_0000;
    }
}

impl Capabilities {
    /// Whether the device can run the multi-planar memory-to-memory decoding flow.
    pub fn is_mplane_m2m(&self) -> bool {
        let mplane = self.contains(Self::VIDEO_CAPTURE_MPLANE | Self::VIDEO_OUTPUT_MPLANE)
            || self.contains(Self::VIDEO_M2M_MPLANE);
        mplane && self.contains(Self::STREAMING)
    }
}

/// The two queues of a memory-to-memory device, named from the application's point of view
/// like V4L2 does: compressed data goes out to the device, decoded frames are captured back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    Output,
    Capture,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub size_image: u32,
    pub bytes_per_line: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Format {
    pub fourcc: Fourcc,
    pub resolution: Resolution,
    pub planes: Vec<PlaneFormat>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    pub length: u32,
    /// Offset to pass to `mmap` for this plane, also used to identify the plane across the
    /// tunnel to the downstream stage.
    pub mem_offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: usize,
    pub planes: Vec<PlaneInfo>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: usize,
    /// Payload size of the first plane.
    pub bytes_used: u32,
    pub sequence: u32,
}

/// Result of a zero-timeout poll of the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A compressed buffer has been consumed and can be dequeued.
    pub output_done: bool,
    /// A decoded frame can be dequeued.
    pub capture_done: bool,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },
    #[error("device lacks multi-planar m2m streaming support ({0:?})")]
    MissingCapabilities(Capabilities),
    #[error("buffer {0} does not exist")]
    InvalidBuffer(usize),
    /// Failures reported by the V4L2 bindings, with the operation as context.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeviceError {
    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| DeviceError::Ioctl { op, errno }
    }
}

pub trait CodecDevice: Send {
    fn capabilities(&self) -> Result<Capabilities, DeviceError>;

    /// Sets the format of `queue` and returns the format actually applied by the driver.
    fn set_format(&mut self, queue: QueueDirection, format: &Format)
        -> Result<Format, DeviceError>;

    fn get_format(&self, queue: QueueDirection) -> Result<Format, DeviceError>;

    fn crop(&self, queue: QueueDirection) -> Result<Rect, DeviceError>;

    fn control(&self, id: u32) -> Result<i32, DeviceError>;

    fn min_capture_buffers(&self) -> Result<u32, DeviceError> {
        let value = self.control(CID_MIN_BUFFERS_FOR_CAPTURE)?;
        Ok(value.max(1) as u32)
    }

    /// Allocates `count` memory-mapped buffers on `queue`, returning the number granted. A count
    /// of zero frees them; their mappings must have been released with
    /// [`CodecDevice::unmap_buffers`] before.
    fn request_buffers(&mut self, queue: QueueDirection, count: u32) -> Result<u32, DeviceError>;

    /// Queries and maps every plane of every buffer allocated on `queue`.
    fn map_buffers(&mut self, queue: QueueDirection) -> Result<Vec<BufferInfo>, DeviceError>;

    fn unmap_buffers(&mut self, queue: QueueDirection);

    fn plane(&self, queue: QueueDirection, index: usize, plane: usize) -> Option<&[u8]>;

    fn plane_mut(&mut self, queue: QueueDirection, index: usize, plane: usize)
        -> Option<&mut [u8]>;

    /// Hands buffer `index` to the device. `bytes_used` is the payload size of the first plane
    /// and is only meaningful on the output queue; an empty output buffer marks the end of the
    /// stream.
    fn queue_buffer(
        &mut self,
        queue: QueueDirection,
        index: usize,
        bytes_used: u32,
    ) -> Result<(), DeviceError>;

    /// Takes back a buffer the device is done with, if there is one.
    fn dequeue_buffer(
        &mut self,
        queue: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError>;

    fn stream_on(&mut self, queue: QueueDirection) -> Result<(), DeviceError>;

    /// Stops `queue`. All its buffers are returned to the application.
    fn stream_off(&mut self, queue: QueueDirection) -> Result<(), DeviceError>;

    /// Checks which queues have buffers ready without blocking.
    fn poll(&self) -> Result<Readiness, DeviceError>;
}

impl<D: CodecDevice + ?Sized> CodecDevice for Box<D> {
    fn capabilities(&self) -> Result<Capabilities, DeviceError> {
        (**self).capabilities()
    }

    fn set_format(
        &mut self,
        queue: QueueDirection,
        format: &Format,
    ) -> Result<Format, DeviceError> {
        (**self).set_format(queue, format)
    }

    fn get_format(&self, queue: QueueDirection) -> Result<Format, DeviceError> {
        (**self).get_format(queue)
    }

    fn crop(&self, queue: QueueDirection) -> Result<Rect, DeviceError> {
        (**self).crop(queue)
    }

    fn control(&self, id: u32) -> Result<i32, DeviceError> {
        (**self).control(id)
    }

    fn request_buffers(&mut self, queue: QueueDirection, count: u32) -> Result<u32, DeviceError> {
        (**self).request_buffers(queue, count)
    }

    fn map_buffers(&mut self, queue: QueueDirection) -> Result<Vec<BufferInfo>, DeviceError> {
        (**self).map_buffers(queue)
    }

    fn unmap_buffers(&mut self, queue: QueueDirection) {
        (**self).unmap_buffers(queue)
    }

    fn plane(&self, queue: QueueDirection, index: usize, plane: usize) -> Option<&[u8]> {
        (**self).plane(queue, index, plane)
    }

    fn plane_mut(
        &mut self,
        queue: QueueDirection,
        index: usize,
        plane: usize,
    ) -> Option<&mut [u8]> {
        (**self).plane_mut(queue, index, plane)
    }

    fn queue_buffer(
        &mut self,
        queue: QueueDirection,
        index: usize,
        bytes_used: u32,
    ) -> Result<(), DeviceError> {
        (**self).queue_buffer(queue, index, bytes_used)
    }

    fn dequeue_buffer(
        &mut self,
        queue: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        (**self).dequeue_buffer(queue)
    }

    fn stream_on(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        (**self).stream_on(queue)
    }

    fn stream_off(&mut self, queue: QueueDirection) -> Result<(), DeviceError> {
        (**self).stream_off(queue)
    }

    fn poll(&self) -> Result<Readiness, DeviceError> {
        (**self).poll()
    }
}
