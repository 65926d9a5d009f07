//! Passive luma sampling for capture channels.
//!
//! The sampler keeps only the most recent frame; each new frame releases the
//! previous one. It never forwards anything, so it can sit beside a bound
//! downstream without competing for buffers.

use super::DeliverySink;
use crate::buffer::MediaBuffer;
use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::format::Rect;
use std::sync::Mutex;

/// Keeps the latest frame of a capture channel for luma queries.
pub struct LumaSampler {
    channel: ChannelId,
    latest: Mutex<Option<MediaBuffer>>,
}

impl LumaSampler {
    /// Sampler for one channel.
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            latest: Mutex::new(None),
        }
    }

    /// Mean Y value inside `rect` on the most recent frame.
    ///
    /// An empty `rect` means the whole frame.
    ///
    /// # Errors
    ///
    /// `NotReady` before the first frame, `Unsupported` for frames without a
    /// luma plane, `InvalidArgument` if `rect` falls outside the frame.
    pub fn mean_luma(&self, rect: Rect) -> Result<u8> {
        let latest = self.latest.lock().unwrap();
        let frame = latest
            .as_ref()
            .ok_or_else(|| Error::NotReady(format!("{} has no frame yet", self.channel)))?;

        let info = frame.image_info().ok_or_else(|| {
            Error::Unsupported(format!("{} does not produce raw images", self.channel))
        })?;
        if !info.format.has_luma_plane() {
            return Err(Error::Unsupported(format!(
                "{:?} has no luma plane",
                info.format
            )));
        }

        let rect = if rect.is_empty() {
            Rect::new(0, 0, info.width, info.height)
        } else {
            rect
        };
        if !rect.fits_in(info.width, info.height) {
            return Err(Error::InvalidArgument(format!(
                "luma window {:?} outside {}x{}",
                rect, info.width, info.height
            )));
        }

        let stride = info.hor_stride as usize;
        let data = frame.data();
        let last_row_end = (rect.y + rect.height - 1) as usize * stride + (rect.x + rect.width) as usize;
        if data.len() < last_row_end {
            return Err(Error::InvalidArgument(format!(
                "frame holds {} bytes, luma window needs {}",
                data.len(),
                last_row_end
            )));
        }

        let mut sum = 0u64;
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * stride + rect.x as usize;
            sum += data[start..start + rect.width as usize]
                .iter()
                .map(|&y| y as u64)
                .sum::<u64>();
        }
        let pixels = rect.width as u64 * rect.height as u64;
        Ok((sum / pixels) as u8)
    }

    /// Whether a frame is held.
    pub fn has_frame(&self) -> bool {
        self.latest.lock().unwrap().is_some()
    }

    /// Release the held frame.
    pub fn clear(&self) {
        let old = self.latest.lock().unwrap().take();
        drop(old);
    }
}

impl DeliverySink for LumaSampler {
    fn deliver(&self, buffer: MediaBuffer) {
        let old = self.latest.lock().unwrap().replace(buffer);
        drop(old);
    }
}
