//! This library implements the buffer management side of a video sink that
//! displays frames through a remote, asynchronous display compositor:
//!
//! * The `memory` module provides the backing storage for frames: shareable
//!   memory regions, either used as a linear shared-memory arena or exported
//!   plane by plane as hardware-like buffer handles.
//!
//! * The `pool` module hands frame buffers to producers, tracks which ones
//!   are currently owned by the compositor, and reclaims them once the
//!   compositor signals it no longer reads them. The `release` module is the
//!   single authoritative path through which buffers come back.
//!
//! * The `pump` module runs the background loop reading events from the
//!   compositor connection, and the `pacer` module issues the per-frame
//!   surface requests and the blocking round-trip used to bound the
//!   compositor backlog.
//!
//! * The `sink` module ties all of the above together behind a single
//!   `VideoSink` object.
//!
//! The compositor itself is abstracted by the `compositor::Compositor` trait.
//! An in-process implementation, `compositor::loopback::LoopbackCompositor`,
//! is provided for testing and demonstration purposes.
pub mod compositor;
pub mod memory;
pub mod pacer;
pub mod pool;
pub mod pump;
pub mod release;
pub mod sink;

use std::fmt;
use std::fmt::Display;

use enumn::N;
use thiserror::Error;

/// A Fourcc pixel format, used to describe the layout of frames handed to the
/// sink. It can be converted back and forth from a 32-bit integer, or a
/// 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 32-bit BGRA, alpha in the last byte.
    pub const BGRA: PixelFormat = PixelFormat::from_fourcc(b"BGRA");
    /// 32-bit BGR with an unused padding byte.
    pub const BGRX: PixelFormat = PixelFormat::from_fourcc(b"BGRx");
    /// Y plane followed by an interleaved, 2x2 subsampled CbCr plane.
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");
    /// Y plane followed by two 2x2 subsampled Cb and Cr planes.
    pub const I420: PixelFormat = PixelFormat::from_fourcc(b"I420");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the sampling of each plane of this format, or `None` if the
    /// format is not one this crate knows how to lay out.
    pub fn planes(self) -> Option<&'static [PlaneSampling]> {
        const PACKED_32: &[PlaneSampling] = &[PlaneSampling::new(4, 1, 1)];
        const NV12: &[PlaneSampling] = &[PlaneSampling::new(1, 1, 1), PlaneSampling::new(2, 2, 2)];
        const I420: &[PlaneSampling] = &[
            PlaneSampling::new(1, 1, 1),
            PlaneSampling::new(1, 2, 2),
            PlaneSampling::new(1, 2, 2),
        ];

        match self {
            PixelFormat::BGRA | PixelFormat::BGRX => Some(PACKED_32),
            PixelFormat::NV12 => Some(NV12),
            PixelFormat::I420 => Some(I420),
            _ => None,
        }
    }

    /// Returns the shared-memory wire code matching this format, if any.
    pub fn to_shm_format(self) -> Option<ShmFormat> {
        SHM_FORMAT_TABLE
            .iter()
            .find(|(format, _)| *format == self)
            .map(|(_, shm)| *shm)
    }

    /// Returns the pixel format matching a shared-memory wire code, if any.
    pub fn from_shm_format(shm: ShmFormat) -> Option<Self> {
        SHM_FORMAT_TABLE
            .iter()
            .find(|(_, s)| *s == shm)
            .map(|(format, _)| *format)
    }
}

impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"BGRA") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use wlsink::PixelFormat;
/// let f = PixelFormat::from(b"BGRA");
/// assert_eq!(f, PixelFormat::BGRA);
/// assert_eq!(&<[u8; 4]>::from(f), b"BGRA");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use wlsink::PixelFormat;
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(format!("{:?}", f), "0x3231564e (NV12)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Wire codes used by the compositor to advertise and receive shared-memory
/// formats. The two mandatory formats have small codes, every other one uses
/// its DRM fourcc.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, N)]
pub enum ShmFormat {
    Argb8888 = 0,
    Xrgb8888 = 1,
}

/// Matching between the frame formats the sink accepts and the shared-memory
/// codes. Byte order is little-endian: BGRA in memory is ARGB8888 on the wire.
const SHM_FORMAT_TABLE: [(PixelFormat, ShmFormat); 2] = [
    (PixelFormat::BGRX, ShmFormat::Xrgb8888),
    (PixelFormat::BGRA, ShmFormat::Argb8888),
];

/// Sampling of a single plane: bytes per sample and subsampling factors
/// relative to the luma/full-resolution plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneSampling {
    pub bytes_per_sample: u32,
    pub horizontal_subsampling: u32,
    pub vertical_subsampling: u32,
}

impl PlaneSampling {
    pub const fn new(bytes_per_sample: u32, horizontal: u32, vertical: u32) -> Self {
        Self {
            bytes_per_sample,
            horizontal_subsampling: horizontal,
            vertical_subsampling: vertical,
        }
    }
}

/// Description of a single plane in a frame.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PlaneLayout {
    /// Offset of the plane from the start of the buffer storage.
    pub offset: usize,
    /// Bytes per line of data.
    pub stride: usize,
    /// Useful size of the plane ; the backing memory must be at least that large.
    pub size: usize,
    /// Number of lines in the plane.
    pub lines: usize,
    /// Number of useful bytes in each line.
    pub line_bytes: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("unknown pixel format {0}")]
    UnknownFormat(PixelFormat),
    #[error("invalid frame size {0}x{1}")]
    InvalidGeometry(u32, u32),
    #[error("stride alignment must be a power of two (got {0})")]
    InvalidAlignment(usize),
}

/// Complete memory layout of a frame: geometry, format and planes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FrameLayout {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub format: PixelFormat,
    /// Individual layout of each plane in this format.
    pub planes: Vec<PlaneLayout>,
}

impl FrameLayout {
    /// Compute the layout of a `width`x`height` frame of `format`, aligning
    /// each line to `stride_alignment` bytes. Planes are laid out
    /// contiguously, each starting at an aligned offset.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wlsink::{FrameLayout, PixelFormat};
    /// let layout = FrameLayout::new(PixelFormat::BGRA, 640, 480, 4).unwrap();
    /// assert_eq!(layout.planes.len(), 1);
    /// assert_eq!(layout.planes[0].stride, 2560);
    /// assert_eq!(layout.size(), 2560 * 480);
    /// ```
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        stride_alignment: usize,
    ) -> Result<Self, LayoutError> {
        if width == 0 || height == 0 {
            return Err(LayoutError::InvalidGeometry(width, height));
        }
        if !stride_alignment.is_power_of_two() {
            return Err(LayoutError::InvalidAlignment(stride_alignment));
        }
        let sampling = format.planes().ok_or(LayoutError::UnknownFormat(format))?;

        let mut offset = 0usize;
        let planes = sampling
            .iter()
            .map(|s| {
                let samples = width.div_ceil(s.horizontal_subsampling) as usize;
                let line_bytes = samples * s.bytes_per_sample as usize;
                let stride = align_up(line_bytes, stride_alignment);
                let lines = height.div_ceil(s.vertical_subsampling) as usize;
                let plane = PlaneLayout {
                    offset,
                    stride,
                    size: stride * lines,
                    lines,
                    line_bytes,
                };
                offset = align_up(offset + plane.size, stride_alignment);
                plane
            })
            .collect();

        Ok(FrameLayout {
            width,
            height,
            format,
            planes,
        })
    }

    /// Total number of bytes needed to store all the planes contiguously.
    pub fn size(&self) -> usize {
        self.planes
            .last()
            .map(|p| p.offset + p.size)
            .unwrap_or(0)
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A rectangle on the compositor surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }

    /// Center `self` inside `dst` without scaling. If `self` is larger than
    /// `dst` in one dimension, it is cropped to `dst` in that dimension.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wlsink::Rect;
    /// let video = Rect::new(0, 0, 640, 480);
    /// let window = Rect::new(0, 0, 800, 600);
    /// assert_eq!(video.center_in(&window), Rect::new(80, 60, 640, 480));
    /// ```
    pub fn center_in(&self, dst: &Rect) -> Rect {
        let width = self.width.min(dst.width);
        let height = self.height.min(dst.height);

        Rect {
            left: dst.left + ((dst.width - width) / 2) as i32,
            top: dst.top + ((dst.height - height) / 2) as i32,
            width,
            height,
        }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_format_table() {
        assert_eq!(
            PixelFormat::BGRA.to_shm_format(),
            Some(ShmFormat::Argb8888)
        );
        assert_eq!(
            PixelFormat::BGRX.to_shm_format(),
            Some(ShmFormat::Xrgb8888)
        );
        assert_eq!(PixelFormat::NV12.to_shm_format(), None);
        assert_eq!(ShmFormat::n(1), Some(ShmFormat::Xrgb8888));
        assert_eq!(ShmFormat::n(7), None);
        assert_eq!(
            PixelFormat::from_shm_format(ShmFormat::Argb8888),
            Some(PixelFormat::BGRA)
        );
    }

    #[test]
    fn test_planar_layout() {
        let layout = FrameLayout::new(PixelFormat::NV12, 101, 51, 32).unwrap();
        assert_eq!(layout.planes.len(), 2);

        let y = &layout.planes[0];
        assert_eq!(y.offset, 0);
        assert_eq!(y.line_bytes, 101);
        assert_eq!(y.stride, 128);
        assert_eq!(y.lines, 51);

        let uv = &layout.planes[1];
        assert_eq!(uv.offset, 128 * 51);
        // 51 chroma samples of 2 bytes each.
        assert_eq!(uv.line_bytes, 102);
        assert_eq!(uv.stride, 128);
        assert_eq!(uv.lines, 26);
        assert_eq!(layout.size(), uv.offset + 128 * 26);
    }

    #[test]
    fn test_invalid_layouts() {
        assert_eq!(
            FrameLayout::new(PixelFormat::BGRA, 0, 480, 4),
            Err(LayoutError::InvalidGeometry(0, 480))
        );
        assert_eq!(
            FrameLayout::new(PixelFormat::BGRA, 640, 480, 3),
            Err(LayoutError::InvalidAlignment(3))
        );
        let yuyv = PixelFormat::from(b"YUYV");
        assert_eq!(
            FrameLayout::new(yuyv, 640, 480, 4),
            Err(LayoutError::UnknownFormat(yuyv))
        );
    }

    #[test]
    fn test_center_rect() {
        let window = Rect::new(0, 0, 320, 240);
        // Larger than the window: cropped and placed at the origin.
        assert_eq!(
            Rect::new(0, 0, 640, 480).center_in(&window),
            Rect::new(0, 0, 320, 240)
        );
        assert_eq!(
            Rect::new(0, 0, 100, 500).center_in(&window),
            Rect::new(110, 0, 100, 240)
        );
    }
}
