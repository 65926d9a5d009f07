//! Media format descriptions shared by channel configs and buffers.
//!
//! All types here are plain data: `Copy` where possible and archivable with
//! rkyv so they can travel inside RPC payloads unchanged.

use rkyv::{Archive, Deserialize, Serialize};

// ============================================================================
// Geometry
// ============================================================================

/// A rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle has no area.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether this rectangle lies entirely inside a `width` x `height` frame.
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

/// Rotation applied by capture, filter or encode stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum Rotation {
    /// No rotation.
    #[default]
    R0,
    /// 90 degrees clockwise.
    R90,
    /// 180 degrees.
    R180,
    /// 270 degrees clockwise.
    R270,
}

impl Rotation {
    /// Whether width and height swap under this rotation.
    pub const fn swaps_axes(&self) -> bool {
        matches!(self, Self::R90 | Self::R270)
    }
}

// ============================================================================
// Video
// ============================================================================

/// Pixel formats (color space and memory layout).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar (Y plane, then interleaved UV plane).
    #[default]
    Nv12 = 0,
    /// YUV 4:2:0 semi-planar with VU ordering.
    Nv21,
    /// YUV 4:2:2 semi-planar.
    Nv16,
    /// YUV 4:2:0 planar.
    Yuv420p,
    /// YUV 4:2:2 planar.
    Yuv422p,
    /// YUV 4:2:2 packed (Y0 U Y1 V).
    Yuyv422,
    /// RGB 8-bit per channel, packed.
    Rgb888,
    /// BGR 8-bit per channel, packed.
    Bgr888,
    /// RGBA 8-bit per channel, packed.
    Rgba8888,
    /// 8-bit grayscale.
    Gray8,
}

impl PixelFormat {
    /// Bytes needed for a frame with the given strides, `None` on overflow.
    pub fn frame_size(&self, hor_stride: u32, ver_stride: u32) -> Option<usize> {
        let pixels = (hor_stride as usize).checked_mul(ver_stride as usize)?;
        match self {
            Self::Nv12 | Self::Nv21 | Self::Yuv420p => pixels.checked_mul(3).map(|n| n / 2),
            Self::Nv16 | Self::Yuv422p | Self::Yuyv422 => pixels.checked_mul(2),
            Self::Rgb888 | Self::Bgr888 => pixels.checked_mul(3),
            Self::Rgba8888 => pixels.checked_mul(4),
            Self::Gray8 => Some(pixels),
        }
    }

    /// Whether the first `hor_stride * ver_stride` bytes are a luma plane.
    pub const fn has_luma_plane(&self) -> bool {
        matches!(
            self,
            Self::Nv12 | Self::Nv21 | Self::Nv16 | Self::Yuv420p | Self::Yuv422p | Self::Gray8
        )
    }
}

/// Geometry and layout of a raw image buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ImageInfo {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Row stride in pixels (>= width).
    pub hor_stride: u32,
    /// Allocated rows (>= height).
    pub ver_stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
}

impl ImageInfo {
    /// Image info with strides equal to the visible size.
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            hor_stride: width,
            ver_stride: height,
            format,
        }
    }

    /// Set explicit strides.
    pub const fn with_strides(mut self, hor_stride: u32, ver_stride: u32) -> Self {
        self.hor_stride = hor_stride;
        self.ver_stride = ver_stride;
        self
    }

    /// Bytes needed to hold one frame, `None` if the geometry overflows.
    pub fn frame_size(&self) -> Option<usize> {
        self.format.frame_size(self.hor_stride, self.ver_stride)
    }

    /// Check that the geometry is usable.
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.hor_stride >= self.width
            && self.ver_stride >= self.height
    }
}

/// Compressed video codecs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum CodecType {
    /// H.264 / AVC.
    #[default]
    H264,
    /// H.265 / HEVC.
    H265,
    /// Motion JPEG.
    Mjpeg,
    /// Still JPEG (snapshot path).
    Jpeg,
}

// ============================================================================
// Audio
// ============================================================================

/// Audio sample formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum SampleFormat {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer (most common).
    #[default]
    S16,
    /// Signed 32-bit integer.
    S32,
    /// 32-bit floating point.
    F32,
}

impl SampleFormat {
    /// Get bytes per sample.
    pub const fn bytes(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }
}

/// Layout of a raw audio buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct AudioInfo {
    /// Sample format.
    pub sample_format: SampleFormat,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per channel in one buffer.
    pub nb_samples: u32,
}

impl AudioInfo {
    /// Bytes needed to hold `nb_samples` frames, `None` on overflow.
    pub fn buffer_size(&self) -> Option<usize> {
        (self.nb_samples as usize)
            .checked_mul(self.channels as usize)?
            .checked_mul(self.sample_format.bytes())
    }

    /// Check that the layout is usable.
    pub fn is_valid(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0 && self.nb_samples > 0
    }
}

/// Compressed audio codecs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum AudioCodec {
    /// AAC-LC.
    #[default]
    Aac,
    /// MPEG-1 layer 2.
    Mp2,
    /// G.711 A-law.
    G711a,
    /// G.711 mu-law.
    G711u,
    /// G.726.
    G726,
}
