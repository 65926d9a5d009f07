//! Channel identity, status and configuration.
//!
//! A channel is one slot of a per-module-kind table. It moves through
//! [`ChannelStatus`] as it is configured, enabled and bound; the table that
//! owns it is in [`table`].

mod config;
pub(crate) mod table;

pub use config::{
    AudioCaptureConfig, AudioDecodeConfig, AudioEncodeConfig, AudioPlaybackConfig, CaptureConfig,
    ChannelConfig, DecodeConfig, EncodeConfig, FilterConfig, MixerConfig, MixerInput, MotionConfig,
    MuxConfig, OsdRegion, RateControl, RateControlMode, RenderConfig, ThumbnailConfig,
};
pub use table::{ChannelInfo, ChannelTable};

use crate::error::{Error, Result};
use rkyv::{Archive, Deserialize, Serialize};

// ============================================================================
// Module kinds
// ============================================================================

/// Kind of pipeline module a channel belongs to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum ModuleKind {
    /// Video capture.
    Vi = 0,
    /// Video encode.
    Venc = 1,
    /// Video decode.
    Vdec = 2,
    /// 2D filter: crop, scale, rotate, convert.
    Rga = 3,
    /// Video render.
    Vo = 4,
    /// Video mixer (multi-input aggregator).
    Vmix = 5,
    /// Container muxer.
    Muxer = 6,
    /// Audio capture.
    Ai = 7,
    /// Audio playback.
    Ao = 8,
    /// Audio encode.
    Aenc = 9,
    /// Audio decode.
    Adec = 10,
}

impl ModuleKind {
    /// Every module kind, in table order.
    pub const ALL: [ModuleKind; 11] = [
        Self::Vi,
        Self::Venc,
        Self::Vdec,
        Self::Rga,
        Self::Vo,
        Self::Vmix,
        Self::Muxer,
        Self::Ai,
        Self::Ao,
        Self::Aenc,
        Self::Adec,
    ];

    /// Position in [`ModuleKind::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short upper-case name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vi => "VI",
            Self::Venc => "VENC",
            Self::Vdec => "VDEC",
            Self::Rga => "RGA",
            Self::Vo => "VO",
            Self::Vmix => "VMIX",
            Self::Muxer => "MUXER",
            Self::Ai => "AI",
            Self::Ao => "AO",
            Self::Aenc => "AENC",
            Self::Adec => "ADEC",
        }
    }

    /// Number of channel slots allocated when no override is configured.
    pub const fn default_channel_count(self) -> usize {
        match self {
            Self::Vi => 8,
            Self::Vo => 2,
            Self::Ai | Self::Ao => 1,
            _ => 16,
        }
    }

    /// Whether channels of this kind produce output buffers.
    pub const fn is_source(self) -> bool {
        !matches!(self, Self::Vo | Self::Ao | Self::Muxer)
    }

    /// Whether channels of this kind capture from a device.
    pub const fn is_capture(self) -> bool {
        matches!(self, Self::Vi | Self::Ai)
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Channel id
// ============================================================================

/// Identity of one channel: module kind plus slot index.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ChannelId {
    /// Module kind.
    pub kind: ModuleKind,
    /// Slot index within the kind's table.
    pub index: u32,
}

impl ChannelId {
    /// Create a channel id.
    pub const fn new(kind: ModuleKind, index: u32) -> Self {
        Self { kind, index }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.index)
    }
}

/// A directed edge from one channel's output to another channel's input slot.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct BindEdge {
    /// Producing channel.
    pub src: ChannelId,
    /// Consuming channel.
    pub dst: ChannelId,
    /// Input slot of `dst`.
    pub slot: u32,
}

impl std::fmt::Display for BindEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}#{}", self.src, self.dst, self.slot)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a channel.
///
/// Ordered so that `status >= ChannelStatus::Open` reads as "at least open".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum ChannelStatus {
    /// Unconfigured slot.
    #[default]
    Closed = 0,
    /// Configured, no stage yet.
    Ready = 1,
    /// Stage created and running.
    Open = 2,
    /// Open and part of at least one bind edge.
    Bind = 3,
}

impl ChannelStatus {
    /// Check if a status transition is valid.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ChannelStatus::*;
        matches!(
            (self, next),
            (Closed, Ready) | (Ready, Open) | (Ready, Closed) | (Open, Bind) | (Open, Closed) | (Bind, Open)
        )
    }

    /// Fail with `NotReady` unless this status is at least `required`.
    pub fn require(&self, id: ChannelId, required: Self) -> Result<()> {
        if *self >= required {
            Ok(())
        } else {
            Err(Error::NotReady(format!(
                "{} is {}, needs {}",
                id, self, required
            )))
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Ready => write!(f, "READY"),
            Self::Open => write!(f, "OPEN"),
            Self::Bind => write!(f, "BIND"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ChannelStatus::*;
        assert!(Closed.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Open));
        assert!(Open.can_transition_to(Bind));
        assert!(Bind.can_transition_to(Open));
        assert!(Open.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Bind));
        assert!(!Bind.can_transition_to(Closed));
        assert!(!Ready.can_transition_to(Bind));
    }

    #[test]
    fn test_status_ordering() {
        assert!(ChannelStatus::Bind >= ChannelStatus::Open);
        assert!(ChannelStatus::Ready < ChannelStatus::Open);

        let id = ChannelId::new(ModuleKind::Venc, 3);
        assert!(ChannelStatus::Open.require(id, ChannelStatus::Open).is_ok());
        let err = ChannelStatus::Ready
            .require(id, ChannelStatus::Open)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotReady);
    }

    #[test]
    fn test_module_kind_properties() {
        for (i, kind) in ModuleKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert!(ModuleKind::Vi.is_source());
        assert!(!ModuleKind::Vo.is_source());
        assert!(!ModuleKind::Muxer.is_source());
        assert_eq!(ModuleKind::Vi.default_channel_count(), 8);
        assert_eq!(ModuleKind::Ao.default_channel_count(), 1);
    }

    #[test]
    fn test_display() {
        let edge = BindEdge {
            src: ChannelId::new(ModuleKind::Vi, 0),
            dst: ChannelId::new(ModuleKind::Venc, 2),
            slot: 0,
        };
        assert_eq!(edge.to_string(), "VI[0] -> VENC[2]#0");
    }
}
