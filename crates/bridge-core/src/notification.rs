//! Registry notifications and their decoding into [`Notification`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::worker::{CapabilityFlags, DeviceDescriptor, DeviceId, PropertyChanges};

pub const MANAGER_INTERFACE: &str = "org.bluealsa.Manager1";
pub const PCM_INTERFACE: &str = "org.bluealsa.PCM1";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub const PCM_ADDED: &str = "PCMAdded";
pub const PCM_REMOVED: &str = "PCMRemoved";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// A signal as delivered by the transport, before any interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNotification {
    pub path: String,
    pub interface: String,
    pub member: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RawNotification {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
        }
    }

    pub fn pcm_added(pcm_path: &str, properties: Value) -> Self {
        Self::new(
            "/org/bluealsa",
            MANAGER_INTERFACE,
            PCM_ADDED,
            vec![Value::String(pcm_path.into()), properties],
        )
    }

    pub fn pcm_removed(pcm_path: &str) -> Self {
        Self::new(
            "/org/bluealsa",
            MANAGER_INTERFACE,
            PCM_REMOVED,
            vec![Value::String(pcm_path.into())],
        )
    }

    pub fn properties_changed(pcm_path: &str, changed: Value) -> Self {
        Self::new(
            pcm_path,
            PROPERTIES_INTERFACE,
            PROPERTIES_CHANGED,
            vec![Value::String(PCM_INTERFACE.into()), changed],
        )
    }
}

/// The notifications the bridge reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DeviceAdded(DeviceDescriptor),
    DeviceRemoved(DeviceId),
    PropertyChanged {
        device: DeviceId,
        interface: String,
        changes: PropertyChanges,
    },
}

impl Notification {
    /// Decodes a raw signal. Nothing is returned unless every known field has
    /// the expected type.
    pub fn decode(raw: &RawNotification) -> Result<Self, DecodeError> {
        match (raw.interface.as_str(), raw.member.as_str()) {
            (MANAGER_INTERFACE, PCM_ADDED) => {
                let path = arg_str(&raw.args, 0).ok_or(DecodeError::Signature(
                    "PCMAdded expects an object path and a property map",
                ))?;
                let properties = arg_map(&raw.args, 1).ok_or(DecodeError::Signature(
                    "PCMAdded expects an object path and a property map",
                ))?;
                let descriptor = decode_properties(properties)?.into_descriptor(DeviceId::new(path));
                Ok(Notification::DeviceAdded(descriptor))
            }
            (MANAGER_INTERFACE, PCM_REMOVED) => {
                let path = arg_str(&raw.args, 0)
                    .ok_or(DecodeError::Signature("PCMRemoved expects an object path"))?;
                Ok(Notification::DeviceRemoved(DeviceId::new(path)))
            }
            (PROPERTIES_INTERFACE, PROPERTIES_CHANGED) => {
                let interface = arg_str(&raw.args, 0).ok_or(DecodeError::Signature(
                    "PropertiesChanged expects an interface name",
                ))?;
                let changed = arg_map(&raw.args, 1).ok_or(DecodeError::Signature(
                    "PropertiesChanged expects a property map",
                ))?;
                Ok(Notification::PropertyChanged {
                    device: DeviceId::new(raw.path.as_str()),
                    interface: interface.to_string(),
                    changes: decode_properties(changed)?,
                })
            }
            (interface, member) => Err(DecodeError::UnknownSignal {
                interface: interface.to_string(),
                member: member.to_string(),
            }),
        }
    }
}

impl TryFrom<&RawNotification> for Notification {
    type Error = DecodeError;

    fn try_from(raw: &RawNotification) -> Result<Self, Self::Error> {
        Notification::decode(raw)
    }
}

fn arg_str(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(Value::as_str)
}

fn arg_map(args: &[Value], index: usize) -> Option<&Map<String, Value>> {
    args.get(index).and_then(Value::as_object)
}

/// Decodes the PCM property map. Unknown keys are ignored.
pub fn decode_properties(properties: &Map<String, Value>) -> Result<PropertyChanges, DecodeError> {
    let mut changes = PropertyChanges::default();
    for (key, value) in properties {
        match key.as_str() {
            "Device" => {
                let device = expect_str(key, value, "object path")?;
                changes.address = address_from_device_path(device);
            }
            "Mode" => {
                changes.mode = Some(match expect_str(key, value, "\"sink\" or \"source\"")? {
                    "sink" => CapabilityFlags::SINK,
                    "source" => CapabilityFlags::SOURCE,
                    _ => {
                        return Err(DecodeError::PropertyType {
                            key: key.clone(),
                            expected: "\"sink\" or \"source\"",
                        })
                    }
                });
            }
            "Transport" => {
                let transport = expect_str(key, value, "string")?;
                changes.profile = Some(profile_from_transport(transport));
            }
            "Codec" => {
                changes.codec = Some(expect_str(key, value, "string")?.to_string());
            }
            "Channels" => {
                changes.channels = Some(expect_uint(key, value, "byte")?);
            }
            "Sampling" => {
                changes.sampling = Some(expect_uint(key, value, "uint32")?);
            }
            _ => {}
        }
    }
    Ok(changes)
}

fn expect_str<'a>(key: &str, value: &'a Value, expected: &'static str) -> Result<&'a str, DecodeError> {
    value.as_str().ok_or_else(|| DecodeError::PropertyType {
        key: key.to_string(),
        expected,
    })
}

fn expect_uint<T: TryFrom<u64>>(key: &str, value: &Value, expected: &'static str) -> Result<T, DecodeError> {
    value
        .as_u64()
        .and_then(|value| T::try_from(value).ok())
        .ok_or_else(|| DecodeError::PropertyType {
            key: key.to_string(),
            expected,
        })
}

/// Maps a transport name such as `A2DP-sink` or `HFP-AG` onto the profile bits.
fn profile_from_transport(transport: &str) -> CapabilityFlags {
    if transport.starts_with("A2DP") {
        CapabilityFlags::PROFILE_A2DP
    } else if transport.starts_with("HFP") || transport.starts_with("HSP") {
        CapabilityFlags::PROFILE_SCO
    } else {
        CapabilityFlags::empty()
    }
}

/// Extracts `00:11:22:33:44:55` from `/org/bluez/hci0/dev_00_11_22_33_44_55`.
fn address_from_device_path(path: &str) -> Option<String> {
    path.rsplit('/')
        .find_map(|segment| segment.strip_prefix("dev_"))
        .map(|address| address.replace('_', ":"))
}
