//! Per-kind channel configuration.
//!
//! [`ChannelConfig`] is a tagged variant keyed by module kind, so a capture
//! configuration can never be read as an encoder's.

use super::ModuleKind;
use crate::error::{Error, Result};
use crate::format::{AudioCodec, AudioInfo, CodecType, ImageInfo, PixelFormat, Rect, Rotation};
use crate::stage::StageControl;
use rkyv::{Archive, Deserialize, Serialize};

/// Upper bound on mixer inputs.
pub const MAX_MIXER_INPUTS: usize = 16;
/// Upper bound on OSD regions per encoder.
pub const MAX_OSD_REGIONS: usize = 8;

/// Motion detection parameters for a capture channel.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MotionConfig {
    /// 0 (least) to 100 (most sensitive).
    pub sensitivity: u8,
    /// Area to watch; empty means the whole frame.
    pub region: Rect,
}

/// Video capture.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct CaptureConfig {
    /// Device node, e.g. `/dev/video0`.
    pub device: String,
    /// Output frame geometry.
    pub image: ImageInfo,
    /// Driver buffer count.
    pub buffer_count: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Rotation applied at capture.
    pub rotation: Rotation,
    /// Motion detection, if enabled.
    pub motion: Option<MotionConfig>,
}

/// Rate control strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum RateControlMode {
    /// Constant bitrate.
    #[default]
    Cbr,
    /// Variable bitrate.
    Vbr,
    /// Fixed quantizer.
    FixQp,
}

/// Encoder rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct RateControl {
    /// Strategy.
    pub mode: RateControlMode,
    /// Target bits per second (CBR/VBR).
    pub bitrate: u32,
    /// Quantizer (FixQp), 0..=51.
    pub qp: u8,
}

impl Default for RateControl {
    fn default() -> Self {
        Self {
            mode: RateControlMode::Cbr,
            bitrate: 4_000_000,
            qp: 26,
        }
    }
}

impl RateControl {
    fn validate(&self) -> Result<()> {
        if self.qp > 51 {
            return Err(Error::InvalidArgument(format!("qp {} > 51", self.qp)));
        }
        if self.mode != RateControlMode::FixQp && self.bitrate == 0 {
            return Err(Error::InvalidArgument("bitrate must be > 0".into()));
        }
        Ok(())
    }
}

/// One on-screen overlay bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct OsdRegion {
    /// Region id; setting an existing id replaces that region.
    pub id: u8,
    /// Placement in the encoded frame.
    pub rect: Rect,
    /// ARGB8888 bitmap, `rect.width * rect.height * 4` bytes.
    pub bitmap: Vec<u8>,
}

impl OsdRegion {
    fn validate(&self, image: &ImageInfo) -> Result<()> {
        if self.rect.is_empty() || !self.rect.fits_in(image.width, image.height) {
            return Err(Error::InvalidArgument(format!(
                "osd region {} does not fit the frame",
                self.id
            )));
        }
        let expected = self.rect.width as usize * self.rect.height as usize * 4;
        if self.bitmap.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "osd bitmap is {} bytes, expected {}",
                self.bitmap.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// Thumbnail produced next to each JPEG snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ThumbnailConfig {
    /// Thumbnail width.
    pub width: u32,
    /// Thumbnail height.
    pub height: u32,
}

/// Video encode.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EncodeConfig {
    /// Output codec.
    pub codec: CodecType,
    /// Input frame geometry.
    pub image: ImageInfo,
    /// Rate control.
    pub rate_control: RateControl,
    /// Frames between key frames.
    pub gop: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Rotation applied before encoding.
    pub rotation: Rotation,
    /// Region of interest with improved quality.
    pub roi: Option<Rect>,
    /// Overlay regions.
    pub osd: Vec<OsdRegion>,
    /// Snapshot thumbnail (JPEG only).
    pub thumbnail: Option<ThumbnailConfig>,
}

impl EncodeConfig {
    /// Encoder with default rate control, no overlays.
    pub fn new(codec: CodecType, image: ImageInfo) -> Self {
        Self {
            codec,
            image,
            rate_control: RateControl::default(),
            gop: 60,
            frame_rate: 30,
            rotation: Rotation::R0,
            roi: None,
            osd: Vec::new(),
            thumbnail: None,
        }
    }

    /// Whether this encoder runs a multi-stage snapshot chain.
    pub fn is_snapshot_chain(&self) -> bool {
        self.codec == CodecType::Jpeg && self.thumbnail.is_some()
    }
}

/// Video decode.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct DecodeConfig {
    /// Input codec.
    pub codec: CodecType,
    /// Largest picture width the decoder must accept.
    pub max_width: u32,
    /// Largest picture height the decoder must accept.
    pub max_height: u32,
    /// Decoded frame format.
    pub output_format: PixelFormat,
}

/// 2D filter (crop, scale, rotate, convert).
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct FilterConfig {
    /// Expected input geometry.
    pub input: ImageInfo,
    /// Output geometry.
    pub output: ImageInfo,
    /// Crop window on the input.
    pub crop: Option<Rect>,
    /// Rotation.
    pub rotation: Rotation,
}

/// Video render.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct RenderConfig {
    /// Display device.
    pub device: String,
    /// Placement on screen.
    pub display: Rect,
    /// Plane / layer index.
    pub layer: u32,
}

/// One mixer input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MixerInput {
    /// Placement in the composed frame.
    pub region: Rect,
    /// Z-order; higher is on top.
    pub layer: u32,
}

/// Video mixer aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MixerConfig {
    /// Composed frame geometry.
    pub output: ImageInfo,
    /// Input slots; index is the bind slot.
    pub inputs: Vec<MixerInput>,
    /// Frames per second.
    pub frame_rate: u32,
}

/// Container muxer. Slot 0 takes video, slot 1 audio.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MuxConfig {
    /// Output file path (or directory prefix for segmented output).
    pub path: String,
    /// Split output every this many milliseconds; 0 disables splitting.
    pub segment_ms: u64,
    /// Whether the audio slot is used.
    pub with_audio: bool,
}

/// Audio capture.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct AudioCaptureConfig {
    /// Capture device.
    pub device: String,
    /// Sample layout.
    pub info: AudioInfo,
    /// Input gain, 0..=100.
    pub volume: u8,
}

/// Audio playback.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct AudioPlaybackConfig {
    /// Playback device.
    pub device: String,
    /// Sample layout.
    pub info: AudioInfo,
    /// Output volume, 0..=100.
    pub volume: u8,
}

/// Audio encode.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct AudioEncodeConfig {
    /// Output codec.
    pub codec: AudioCodec,
    /// Input sample layout.
    pub info: AudioInfo,
    /// Target bits per second.
    pub bitrate: u32,
}

/// Audio decode.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct AudioDecodeConfig {
    /// Input codec.
    pub codec: AudioCodec,
    /// Decoded sample layout.
    pub output: AudioInfo,
}

/// Configuration of one channel, tagged by module kind.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ChannelConfig {
    /// [`ModuleKind::Vi`]
    Capture(CaptureConfig),
    /// [`ModuleKind::Venc`]
    Encode(EncodeConfig),
    /// [`ModuleKind::Vdec`]
    Decode(DecodeConfig),
    /// [`ModuleKind::Rga`]
    Filter(FilterConfig),
    /// [`ModuleKind::Vo`]
    Render(RenderConfig),
    /// [`ModuleKind::Vmix`]
    Mixer(MixerConfig),
    /// [`ModuleKind::Muxer`]
    Mux(MuxConfig),
    /// [`ModuleKind::Ai`]
    AudioCapture(AudioCaptureConfig),
    /// [`ModuleKind::Ao`]
    AudioPlayback(AudioPlaybackConfig),
    /// [`ModuleKind::Aenc`]
    AudioEncode(AudioEncodeConfig),
    /// [`ModuleKind::Adec`]
    AudioDecode(AudioDecodeConfig),
}

fn require_device(device: &str) -> Result<()> {
    if device.is_empty() {
        return Err(Error::InvalidArgument("device path is empty".into()));
    }
    Ok(())
}

fn require_image(info: &ImageInfo, what: &str) -> Result<()> {
    if !info.is_valid() {
        return Err(Error::InvalidArgument(format!(
            "invalid {} geometry {}x{} (stride {}x{})",
            what, info.width, info.height, info.hor_stride, info.ver_stride
        )));
    }
    Ok(())
}

fn require_audio(info: &AudioInfo) -> Result<()> {
    if !info.is_valid() {
        return Err(Error::InvalidArgument(format!(
            "invalid audio layout {:?}",
            info
        )));
    }
    Ok(())
}

fn require_volume(volume: u8) -> Result<()> {
    if volume > 100 {
        return Err(Error::InvalidArgument(format!("volume {} > 100", volume)));
    }
    Ok(())
}

fn require_rate(frame_rate: u32) -> Result<()> {
    if frame_rate == 0 || frame_rate > 240 {
        return Err(Error::InvalidArgument(format!(
            "frame rate {} out of range",
            frame_rate
        )));
    }
    Ok(())
}

impl ChannelConfig {
    /// Module kind this configuration belongs to.
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Capture(_) => ModuleKind::Vi,
            Self::Encode(_) => ModuleKind::Venc,
            Self::Decode(_) => ModuleKind::Vdec,
            Self::Filter(_) => ModuleKind::Rga,
            Self::Render(_) => ModuleKind::Vo,
            Self::Mixer(_) => ModuleKind::Vmix,
            Self::Mux(_) => ModuleKind::Muxer,
            Self::AudioCapture(_) => ModuleKind::Ai,
            Self::AudioPlayback(_) => ModuleKind::Ao,
            Self::AudioEncode(_) => ModuleKind::Aenc,
            Self::AudioDecode(_) => ModuleKind::Adec,
        }
    }

    /// Number of bindable input slots.
    pub fn input_slots(&self) -> u32 {
        match self {
            Self::Capture(_) | Self::AudioCapture(_) => 0,
            Self::Mixer(cfg) => cfg.inputs.len() as u32,
            Self::Mux(_) => 2,
            _ => 1,
        }
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Capture(cfg) => {
                require_device(&cfg.device)?;
                require_image(&cfg.image, "capture")?;
                require_rate(cfg.frame_rate)?;
                if cfg.buffer_count == 0 {
                    return Err(Error::InvalidArgument("capture needs buffers".into()));
                }
                if let Some(motion) = &cfg.motion {
                    validate_motion(motion, &cfg.image)?;
                }
            }
            Self::Encode(cfg) => {
                require_image(&cfg.image, "encoder input")?;
                require_rate(cfg.frame_rate)?;
                cfg.rate_control.validate()?;
                if cfg.gop == 0 {
                    return Err(Error::InvalidArgument("gop must be > 0".into()));
                }
                if let Some(roi) = cfg.roi
                    && !roi.fits_in(cfg.image.width, cfg.image.height)
                {
                    return Err(Error::InvalidArgument("roi does not fit the frame".into()));
                }
                if cfg.osd.len() > MAX_OSD_REGIONS {
                    return Err(Error::InvalidArgument(format!(
                        "{} osd regions, at most {}",
                        cfg.osd.len(),
                        MAX_OSD_REGIONS
                    )));
                }
                for region in &cfg.osd {
                    region.validate(&cfg.image)?;
                }
                if let Some(thumb) = cfg.thumbnail {
                    if cfg.codec != CodecType::Jpeg {
                        return Err(Error::InvalidArgument(
                            "thumbnails need the JPEG codec".into(),
                        ));
                    }
                    if thumb.width == 0
                        || thumb.height == 0
                        || thumb.width > cfg.image.width
                        || thumb.height > cfg.image.height
                    {
                        return Err(Error::InvalidArgument(
                            "thumbnail must be non-empty and no larger than the frame".into(),
                        ));
                    }
                }
            }
            Self::Decode(cfg) => {
                if cfg.max_width == 0 || cfg.max_height == 0 {
                    return Err(Error::InvalidArgument("decoder needs a max size".into()));
                }
            }
            Self::Filter(cfg) => {
                require_image(&cfg.input, "filter input")?;
                require_image(&cfg.output, "filter output")?;
                if let Some(crop) = cfg.crop
                    && (crop.is_empty() || !crop.fits_in(cfg.input.width, cfg.input.height))
                {
                    return Err(Error::InvalidArgument("crop does not fit the input".into()));
                }
            }
            Self::Render(cfg) => {
                require_device(&cfg.device)?;
                if cfg.display.is_empty() {
                    return Err(Error::InvalidArgument("display rect is empty".into()));
                }
            }
            Self::Mixer(cfg) => {
                require_image(&cfg.output, "mixer output")?;
                require_rate(cfg.frame_rate)?;
                if cfg.inputs.is_empty() || cfg.inputs.len() > MAX_MIXER_INPUTS {
                    return Err(Error::InvalidArgument(format!(
                        "mixer needs 1..={} inputs, got {}",
                        MAX_MIXER_INPUTS,
                        cfg.inputs.len()
                    )));
                }
                for (slot, input) in cfg.inputs.iter().enumerate() {
                    if input.region.is_empty()
                        || !input.region.fits_in(cfg.output.width, cfg.output.height)
                    {
                        return Err(Error::InvalidArgument(format!(
                            "mixer input {} region does not fit the output",
                            slot
                        )));
                    }
                }
            }
            Self::Mux(cfg) => {
                if cfg.path.is_empty() {
                    return Err(Error::InvalidArgument("muxer path is empty".into()));
                }
            }
            Self::AudioCapture(cfg) => {
                require_device(&cfg.device)?;
                require_audio(&cfg.info)?;
                require_volume(cfg.volume)?;
            }
            Self::AudioPlayback(cfg) => {
                require_device(&cfg.device)?;
                require_audio(&cfg.info)?;
                require_volume(cfg.volume)?;
            }
            Self::AudioEncode(cfg) => {
                require_audio(&cfg.info)?;
                if cfg.bitrate == 0 {
                    return Err(Error::InvalidArgument("bitrate must be > 0".into()));
                }
            }
            Self::AudioDecode(cfg) => require_audio(&cfg.output)?,
        }
        Ok(())
    }

    /// Fold a runtime control into the stored attributes.
    ///
    /// Returns `Unsupported` if the control does not apply to this kind and
    /// `InvalidArgument` if its parameters are out of range. The stored
    /// configuration is unchanged on error.
    pub fn apply(&mut self, control: &StageControl) -> Result<()> {
        let kind = self.kind();
        let unsupported =
            || Error::Unsupported(format!("{} does not support {}", kind, control.name()));

        match (&mut *self, control) {
            (Self::Encode(cfg), StageControl::SetRoi(rect)) => {
                if !rect.fits_in(cfg.image.width, cfg.image.height) {
                    return Err(Error::InvalidArgument("roi does not fit the frame".into()));
                }
                cfg.roi = if rect.is_empty() { None } else { Some(*rect) };
            }
            (Self::Encode(cfg), StageControl::SetOsd(region)) => {
                region.validate(&cfg.image)?;
                match cfg.osd.iter().position(|r| r.id == region.id) {
                    Some(pos) => cfg.osd[pos] = region.clone(),
                    None if cfg.osd.len() < MAX_OSD_REGIONS => cfg.osd.push(region.clone()),
                    None => {
                        return Err(Error::ResourceExhausted(format!(
                            "all {} osd regions in use",
                            MAX_OSD_REGIONS
                        )));
                    }
                }
            }
            (Self::Encode(cfg), StageControl::ClearOsd(id)) => {
                cfg.osd.retain(|r| r.id != *id);
            }
            (Self::Encode(cfg), StageControl::SetRateControl(rc)) => {
                rc.validate()?;
                cfg.rate_control = *rc;
            }
            (Self::Encode(_), StageControl::ForceIdr) => {}
            (Self::Encode(cfg), StageControl::SetRotation(rotation)) => cfg.rotation = *rotation,
            (Self::Filter(cfg), StageControl::SetRotation(rotation)) => cfg.rotation = *rotation,
            (Self::Capture(cfg), StageControl::SetRotation(rotation)) => cfg.rotation = *rotation,
            (Self::Encode(cfg), StageControl::SetFrameRate(fps)) => {
                require_rate(*fps)?;
                cfg.frame_rate = *fps;
            }
            (Self::Capture(cfg), StageControl::SetFrameRate(fps)) => {
                require_rate(*fps)?;
                cfg.frame_rate = *fps;
            }
            (Self::Capture(cfg), StageControl::SetMotionDetect(motion)) => {
                if let Some(motion) = motion {
                    validate_motion(motion, &cfg.image)?;
                }
                cfg.motion = motion.clone();
            }
            (Self::AudioCapture(cfg), StageControl::SetVolume(volume)) => {
                require_volume(*volume)?;
                cfg.volume = *volume;
            }
            (Self::AudioPlayback(cfg), StageControl::SetVolume(volume)) => {
                require_volume(*volume)?;
                cfg.volume = *volume;
            }
            (Self::Mixer(cfg), StageControl::SetMixerRegion { slot, region }) => {
                if region.is_empty() || !region.fits_in(cfg.output.width, cfg.output.height) {
                    return Err(Error::InvalidArgument("region does not fit the output".into()));
                }
                mixer_input(cfg, *slot)?.region = *region;
            }
            (Self::Mixer(cfg), StageControl::SetMixerLayer { slot, layer }) => {
                mixer_input(cfg, *slot)?.layer = *layer;
            }
            (Self::Render(cfg), StageControl::SetDisplayRect(rect)) => {
                if rect.is_empty() {
                    return Err(Error::InvalidArgument("display rect is empty".into()));
                }
                cfg.display = *rect;
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }
}

fn validate_motion(motion: &MotionConfig, image: &ImageInfo) -> Result<()> {
    if motion.sensitivity > 100 {
        return Err(Error::InvalidArgument(format!(
            "motion sensitivity {} > 100",
            motion.sensitivity
        )));
    }
    if !motion.region.fits_in(image.width, image.height) {
        return Err(Error::InvalidArgument(
            "motion region does not fit the frame".into(),
        ));
    }
    Ok(())
}

fn mixer_input(cfg: &mut MixerConfig, slot: u32) -> Result<&mut MixerInput> {
    let count = cfg.inputs.len();
    cfg.inputs.get_mut(slot as usize).ok_or_else(|| {
        Error::InvalidArgument(format!("mixer slot {} out of range ({} inputs)", slot, count))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn encoder() -> ChannelConfig {
        ChannelConfig::Encode(EncodeConfig::new(
            CodecType::H264,
            ImageInfo::new(1280, 720, PixelFormat::Nv12),
        ))
    }

    #[test]
    fn test_kind_and_slots() {
        let mixer = ChannelConfig::Mixer(MixerConfig {
            output: ImageInfo::new(1920, 1080, PixelFormat::Nv12),
            inputs: vec![
                MixerInput {
                    region: Rect::new(0, 0, 960, 540),
                    layer: 0,
                };
                4
            ],
            frame_rate: 30,
        });
        assert_eq!(mixer.kind(), ModuleKind::Vmix);
        assert_eq!(mixer.input_slots(), 4);
        assert!(mixer.validate().is_ok());
        assert_eq!(encoder().input_slots(), 1);
    }

    #[test]
    fn test_invalid_capture() {
        let cfg = ChannelConfig::Capture(CaptureConfig {
            device: String::new(),
            image: ImageInfo::new(640, 480, PixelFormat::Nv12),
            buffer_count: 4,
            frame_rate: 30,
            rotation: Rotation::R0,
            motion: None,
        });
        assert_eq!(cfg.validate().unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_thumbnail_requires_jpeg() {
        let mut enc = EncodeConfig::new(CodecType::H264, ImageInfo::new(640, 480, PixelFormat::Nv12));
        enc.thumbnail = Some(ThumbnailConfig {
            width: 160,
            height: 120,
        });
        assert!(ChannelConfig::Encode(enc.clone()).validate().is_err());

        enc.codec = CodecType::Jpeg;
        assert!(enc.is_snapshot_chain());
        assert!(ChannelConfig::Encode(enc).validate().is_ok());
    }

    #[test]
    fn test_apply_roi_and_osd() {
        let mut cfg = encoder();
        cfg.apply(&StageControl::SetRoi(Rect::new(0, 0, 64, 64)))
            .unwrap();
        let region = OsdRegion {
            id: 1,
            rect: Rect::new(0, 0, 2, 2),
            bitmap: vec![0xff; 16],
        };
        cfg.apply(&StageControl::SetOsd(region.clone())).unwrap();
        cfg.apply(&StageControl::SetOsd(region)).unwrap();

        let ChannelConfig::Encode(enc) = &cfg else {
            panic!("kind changed");
        };
        assert_eq!(enc.roi, Some(Rect::new(0, 0, 64, 64)));
        assert_eq!(enc.osd.len(), 1);

        cfg.apply(&StageControl::ClearOsd(1)).unwrap();
        let ChannelConfig::Encode(enc) = &cfg else {
            panic!("kind changed");
        };
        assert!(enc.osd.is_empty());
    }

    #[test]
    fn test_apply_wrong_kind_unsupported() {
        let mut cfg = encoder();
        let before = cfg.clone();
        let err = cfg.apply(&StageControl::SetVolume(50)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unsupported);
        assert_eq!(cfg, before);
    }

    #[test]
    fn test_apply_bad_rate_control_keeps_config() {
        let mut cfg = encoder();
        let before = cfg.clone();
        let err = cfg
            .apply(&StageControl::SetRateControl(RateControl {
                mode: RateControlMode::FixQp,
                bitrate: 0,
                qp: 60,
            }))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(cfg, before);
    }
}
