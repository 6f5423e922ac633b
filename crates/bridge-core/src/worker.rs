//! Per-device state tracked by the bridge.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Stable identifier of a remote PCM endpoint (the registry's object path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

bitflags! {
    /// Capabilities advertised by a PCM endpoint.
    ///
    /// A usable endpoint has at least one mode bit and exactly one profile bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilityFlags: u8 {
        /// The endpoint produces audio (capture from the bridge's point of view).
        const SOURCE       = 0b0000_0001;
        /// The endpoint consumes audio (playback into the desktop graph).
        const SINK         = 0b0000_0010;
        const PROFILE_A2DP = 0b0000_0100;
        const PROFILE_SCO  = 0b0000_1000;
    }
}

impl CapabilityFlags {
    pub const MODE_MASK: Self = Self::SOURCE.union(Self::SINK);
    pub const PROFILE_MASK: Self = Self::PROFILE_A2DP.union(Self::PROFILE_SCO);

    pub fn has_mode(self) -> bool {
        self.intersects(Self::MODE_MASK)
    }

    /// The selected profile, or `None` when no profile or both profiles are set.
    pub fn profile(self) -> Option<Profile> {
        let profile = self & Self::PROFILE_MASK;
        if profile == Self::PROFILE_A2DP {
            Some(Profile::A2dp)
        } else if profile == Self::PROFILE_SCO {
            Some(Profile::Sco)
        } else {
            None
        }
    }

    pub fn supports(self, direction: Direction) -> bool {
        match direction {
            Direction::Sink => self.contains(Self::SINK),
            Direction::Source => self.contains(Self::SOURCE),
        }
    }
}

/// Bluetooth audio profile carried by a PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// High quality unidirectional streaming.
    A2dp,
    /// Voice call link.
    Sco,
}

/// Pipeline direction relative to the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Playback: bytes arriving from the device are played on the local backend.
    Sink,
    /// Capture: audio recorded from the local backend is written to the device.
    Source,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Sink, Direction::Source];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sink => "sink",
            Direction::Source => "source",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle of a pipeline owned by the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline#{}", self.0)
    }
}

/// Everything the registry reports about a PCM endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Bluetooth address of the remote device, used for diagnostics only.
    pub address: Option<String>,
    pub flags: CapabilityFlags,
    /// Selected codec name; `None` while negotiation is pending.
    pub codec: Option<String>,
    pub channels: u8,
    pub sampling: u32,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            address: None,
            flags: CapabilityFlags::empty(),
            codec: None,
            channels: 0,
            sampling: 0,
        }
    }

    pub fn with_flags(mut self, flags: CapabilityFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_codec<S: Into<String>>(mut self, codec: S) -> Self {
        self.codec = Some(codec.into()).filter(|codec| !codec.is_empty());
        self
    }

    pub fn with_stream(mut self, channels: u8, sampling: u32) -> Self {
        self.channels = channels;
        self.sampling = sampling;
        self
    }

    pub fn with_address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn codec_selected(&self) -> bool {
        self.codec.is_some()
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A subset of descriptor fields carried by a property-change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyChanges {
    pub address: Option<String>,
    /// Replaces the mode bits of the capability flags.
    pub mode: Option<CapabilityFlags>,
    /// Replaces the profile bits of the capability flags.
    pub profile: Option<CapabilityFlags>,
    /// `Some("")` clears the codec selection.
    pub codec: Option<String>,
    pub channels: Option<u8>,
    pub sampling: Option<u32>,
}

impl PropertyChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, descriptor: &mut DeviceDescriptor) {
        if let Some(address) = &self.address {
            descriptor.address = Some(address.clone());
        }
        if let Some(mode) = self.mode {
            descriptor.flags.remove(CapabilityFlags::MODE_MASK);
            descriptor.flags.insert(mode & CapabilityFlags::MODE_MASK);
        }
        if let Some(profile) = self.profile {
            descriptor.flags.remove(CapabilityFlags::PROFILE_MASK);
            descriptor
                .flags
                .insert(profile & CapabilityFlags::PROFILE_MASK);
        }
        if let Some(codec) = &self.codec {
            descriptor.codec = Some(codec.clone()).filter(|codec| !codec.is_empty());
        }
        if let Some(channels) = self.channels {
            descriptor.channels = channels;
        }
        if let Some(sampling) = self.sampling {
            descriptor.sampling = sampling;
        }
    }

    /// Builds a full descriptor for a newly announced device.
    pub fn into_descriptor(self, id: DeviceId) -> DeviceDescriptor {
        let mut descriptor = DeviceDescriptor::new(id);
        self.apply_to(&mut descriptor);
        descriptor
    }
}

/// The data/control descriptor pair returned by the registry's open call.
///
/// Both descriptors are closed when the channel is dropped.
#[derive(Debug)]
pub struct RawChannel {
    data: OwnedFd,
    control: OwnedFd,
}

impl RawChannel {
    pub fn new(data: OwnedFd, control: OwnedFd) -> Self {
        Self { data, control }
    }

    pub fn data_fd(&self) -> RawFd {
        self.data.as_raw_fd()
    }

    pub fn control_fd(&self) -> RawFd {
        self.control.as_raw_fd()
    }
}

/// One remote PCM endpoint and the resources the bridge holds for it.
#[derive(Debug)]
pub struct Worker {
    descriptor: DeviceDescriptor,
    playback: Option<PipelineId>,
    capture: Option<PipelineId>,
    channel: Option<RawChannel>,
}

impl Worker {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            playback: None,
            capture: None,
            channel: None,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.descriptor.flags
    }

    pub fn pipeline(&self, direction: Direction) -> Option<PipelineId> {
        match direction {
            Direction::Sink => self.playback,
            Direction::Source => self.capture,
        }
    }

    pub fn has_pipelines(&self) -> bool {
        self.playback.is_some() || self.capture.is_some()
    }

    pub fn channel(&self) -> Option<&RawChannel> {
        self.channel.as_ref()
    }

    /// True when the worker holds neither pipelines nor an open channel.
    pub fn is_idle(&self) -> bool {
        !self.has_pipelines() && self.channel.is_none()
    }

    /// Replaces the reported fields, keeping the resources already held.
    pub(crate) fn merge(&mut self, descriptor: DeviceDescriptor) {
        debug_assert_eq!(self.descriptor.id, descriptor.id);
        self.descriptor = descriptor;
    }

    pub(crate) fn apply_changes(&mut self, changes: &PropertyChanges) {
        changes.apply_to(&mut self.descriptor);
    }

    pub(crate) fn set_pipeline(&mut self, direction: Direction, pipeline: PipelineId) {
        let slot = match direction {
            Direction::Sink => &mut self.playback,
            Direction::Source => &mut self.capture,
        };
        debug_assert!(slot.is_none(), "{direction} pipeline already active");
        *slot = Some(pipeline);
    }

    pub(crate) fn take_pipeline(&mut self, direction: Direction) -> Option<PipelineId> {
        match direction {
            Direction::Sink => self.playback.take(),
            Direction::Source => self.capture.take(),
        }
    }

    pub(crate) fn attach_channel(&mut self, channel: RawChannel) {
        self.channel = Some(channel);
    }

    pub(crate) fn take_channel(&mut self) -> Option<RawChannel> {
        self.channel.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_requires_exactly_one_bit() {
        assert_eq!(CapabilityFlags::SINK.profile(), None);
        assert_eq!(
            (CapabilityFlags::SINK | CapabilityFlags::PROFILE_A2DP).profile(),
            Some(Profile::A2dp)
        );
        assert_eq!(CapabilityFlags::PROFILE_SCO.profile(), Some(Profile::Sco));
        assert_eq!(CapabilityFlags::PROFILE_MASK.profile(), None);
    }

    #[test]
    fn property_changes_replace_mode_and_profile_bits() {
        let mut descriptor = DeviceDescriptor::new("/pcm").with_flags(
            CapabilityFlags::SINK | CapabilityFlags::PROFILE_A2DP,
        );
        let changes = PropertyChanges {
            mode: Some(CapabilityFlags::SOURCE),
            profile: Some(CapabilityFlags::PROFILE_SCO),
            codec: Some("mSBC".into()),
            ..PropertyChanges::default()
        };
        changes.apply_to(&mut descriptor);
        assert_eq!(
            descriptor.flags,
            CapabilityFlags::SOURCE | CapabilityFlags::PROFILE_SCO
        );
        assert!(descriptor.codec_selected());

        let clear = PropertyChanges {
            codec: Some(String::new()),
            ..PropertyChanges::default()
        };
        clear.apply_to(&mut descriptor);
        assert!(!descriptor.codec_selected());
    }

    #[test]
    fn empty_codec_is_not_selected() {
        let descriptor = DeviceDescriptor::new("/pcm").with_codec("");
        assert!(!descriptor.codec_selected());
    }
}
