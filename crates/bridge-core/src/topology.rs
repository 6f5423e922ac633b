//! Fixed pipeline topologies for each direction.

use std::fmt;
use std::os::fd::RawFd;

use crate::worker::{Direction, Profile};

/// Element carrying the raw channel descriptor (`fdsrc`/`fdsink`).
pub const DEVICE_ELEMENT: &str = "device_io";
/// Element connected to the shared audio backend.
pub const BACKEND_ELEMENT: &str = "backend";
/// Capsfilter describing the device-side stream.
pub const DEVICE_CAPS: &str = "device_caps";
/// Capsfilter in front of the raw parser on the playback path.
pub const PARSE_CAPS: &str = "parse_caps";
/// Capsfilter after the mixer on the playback path.
pub const MIX_CAPS: &str = "mix_caps";

/// Format of the shared backend side of every pipeline.
const BACKEND_FORMAT: &str = "F32LE";
const BACKEND_BYTES_PER_SAMPLE: u64 = 4;

/// Target state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Null,
}

/// Raw audio caps negotiated with the device: interleaved S16LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCaps {
    pub channels: u8,
    pub rate: u32,
}

impl AudioCaps {
    pub fn new(channels: u8, rate: u32) -> Self {
        Self { channels, rate }
    }
}

impl fmt::Display for AudioCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audio/x-raw,format=S16LE,layout=interleaved,channels={},rate={}",
            self.channels, self.rate
        )
    }
}

/// A named structure of string properties handed to the backend stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProperties {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl StreamProperties {
    /// Properties for a voice-call capture stream.
    pub fn communication() -> Self {
        Self {
            name: "props".into(),
            entries: vec![
                ("media.role".into(), "Communication".into()),
                ("wireplumber.keep-linked".into(), "1".into()),
            ],
        }
    }
}

impl fmt::Display for StreamProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.entries {
            write!(f, ",{key}={value}")?;
        }
        Ok(())
    }
}

/// Value assigned to an element property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Caps(AudioCaps),
    Fd(RawFd),
    Structure(StreamProperties),
}

/// Parameters shared by every topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Sample rate of the shared backend side.
    pub output_rate: u32,
    /// Audio held by the leaky capture queue, in milliseconds.
    pub capture_queue_ms: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            output_rate: 48_000,
            capture_queue_ms: 50,
        }
    }
}

/// A topology description plus the element properties still to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub direction: Direction,
    pub description: String,
    /// Capsfilters that receive the device caps.
    pub caps_elements: &'static [&'static str],
    /// Stream properties for the backend element, if any.
    pub stream_properties: Option<StreamProperties>,
}

impl Topology {
    /// The fixed topology for `direction` on `profile`, if one exists.
    ///
    /// Capture is only routed for SCO; A2DP sources have no topology.
    pub fn for_direction(
        direction: Direction,
        profile: Profile,
        caps: AudioCaps,
        config: &TopologyConfig,
    ) -> Option<Self> {
        match (direction, profile) {
            (Direction::Sink, _) => Some(Self::playback(config)),
            (Direction::Source, Profile::Sco) => Some(Self::capture(caps, config)),
            (Direction::Source, Profile::A2dp) => None,
        }
    }

    /// Playback mixes the device stream over a silent live source.
    ///
    /// The live source keeps the output continuous across gaps and clocks the
    /// pipeline from the system clock, which the sending side also uses.
    fn playback(config: &TopologyConfig) -> Self {
        let description = format!(
            "audiotestsrc is-live=true wave=silence ! capsfilter name={DEVICE_CAPS} \
             ! audiomixer name=mix \
             fdsrc name={DEVICE_ELEMENT} do-timestamp=true ! capsfilter name={PARSE_CAPS} \
             ! rawaudioparse use-sink-caps=true ! mix. \
             mix.src ! capsfilter name={MIX_CAPS} ! audioconvert ! audioresample \
             ! audio/x-raw,format={BACKEND_FORMAT},rate={rate} ! pwaudiosink name={BACKEND_ELEMENT}",
            rate = config.output_rate,
        );
        Self {
            direction: Direction::Sink,
            description,
            caps_elements: &[DEVICE_CAPS, PARSE_CAPS, MIX_CAPS],
            stream_properties: None,
        }
    }

    /// Capture reads the backend through a leaky queue so the source keeps
    /// running while nobody drains the device channel.
    fn capture(caps: AudioCaps, config: &TopologyConfig) -> Self {
        let description = format!(
            "pwaudiosrc name={BACKEND_ELEMENT} \
             ! audio/x-raw,format={BACKEND_FORMAT},rate={rate},channels={channels} \
             ! queue leaky=downstream max-size-time=0 max-size-buffers=0 max-size-bytes={bytes} \
             ! audioconvert ! audioresample ! capsfilter name={DEVICE_CAPS} \
             ! fdsink name={DEVICE_ELEMENT}",
            rate = config.output_rate,
            channels = caps.channels.max(1),
            bytes = capture_queue_bytes(caps.channels, config),
        );
        Self {
            direction: Direction::Source,
            description,
            caps_elements: &[DEVICE_CAPS],
            stream_properties: Some(StreamProperties::communication()),
        }
    }
}

/// Bytes of backend-format audio held by the capture queue.
pub fn capture_queue_bytes(channels: u8, config: &TopologyConfig) -> u64 {
    let channels = u64::from(channels.max(1));
    BACKEND_BYTES_PER_SAMPLE * channels * u64::from(config.output_rate)
        * u64::from(config.capture_queue_ms)
        / 1000
}
