//! Supervises per-device audio pipelines for Bluetooth PCM endpoints.
//!
//! Notifications from the PCM registry are decoded into [`Notification`]s,
//! applied to the [`WorkerRegistry`], and every touched [`Worker`] is
//! re-evaluated by the [`supervisor`] before the [`PipelineManager`] starts or
//! stops its pipelines.

mod config;
mod dispatch;
mod error;
mod lifecycle;
mod notification;
mod poll;
mod registry;
mod topology;
mod worker;

pub mod backend;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod virtual_backend;

pub use backend::{GraphEngine, NotificationSource, RegistryService};
pub use config::BridgeConfig;
pub use dispatch::{BridgeContext, DispatchLoop, LoopState, ShutdownToken};
pub use error::{
    ConfigError, DecodeError, DispatchError, GraphError, RegistryError, StartError, TransportError,
};
pub use lifecycle::PipelineManager;
pub use notification::{
    decode_properties, Notification, RawNotification, MANAGER_INTERFACE, PCM_ADDED,
    PCM_INTERFACE, PCM_REMOVED, PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};
pub use poll::PollSet;
pub use registry::WorkerRegistry;
pub use supervisor::{evaluate, Action};
pub use topology::{
    capture_queue_bytes, AudioCaps, PipelineState, PropertyValue, StreamProperties, Topology,
    TopologyConfig, BACKEND_ELEMENT, DEVICE_CAPS, DEVICE_ELEMENT, MIX_CAPS, PARSE_CAPS,
};
pub use worker::{
    CapabilityFlags, DeviceDescriptor, DeviceId, Direction, PipelineId, Profile, PropertyChanges,
    RawChannel, Worker,
};
