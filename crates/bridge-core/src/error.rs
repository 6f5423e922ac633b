use thiserror::Error;

use crate::topology::PipelineState;
use crate::worker::{Direction, PipelineId, Profile};

/// Failures reported by the remote PCM registry service.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("registry call {method} failed: {message}")]
    Call { method: String, message: String },
    #[error("malformed registry reply: {0}")]
    Reply(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("channel open failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the audio-graph engine.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to build pipeline: {0}")]
    Build(String),
    #[error("unknown pipeline {0}")]
    UnknownPipeline(PipelineId),
    #[error("pipeline has no element named `{0}`")]
    MissingElement(String),
    #[error("failed to set `{property}` on `{element}`: {reason}")]
    Property {
        element: String,
        property: String,
        reason: String,
    },
    #[error("failed to change pipeline state to {state:?}: {reason}")]
    StateChange {
        state: PipelineState,
        reason: String,
    },
}

/// A raw notification that does not have the expected shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported signal {interface}.{member}")]
    UnknownSignal { interface: String, member: String },
    #[error("invalid signal signature: {0}")]
    Signature(&'static str),
    #[error("property `{key}` has the wrong type, expected {expected}")]
    PropertyType { key: String, expected: &'static str },
}

/// Failures of the notification transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to the registry service: {0}")]
    Connect(std::io::Error),
    #[error("failed to register subscription for {rule}: {reason}")]
    Subscribe { rule: String, reason: String },
    #[error("transport requires more than {capacity} poll descriptors")]
    DescriptorCapacity { capacity: usize },
    #[error("registry service closed the connection")]
    Closed,
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a pipeline could not be started for a direction.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("no {direction:?} topology for the {profile:?} profile")]
    NoTopology {
        direction: Direction,
        profile: Option<Profile>,
    },
    #[error("couldn't open PCM: {0}")]
    Channel(#[from] RegistryError),
    #[error("failed to start pipeline: {0}")]
    Graph(#[from] GraphError),
}

/// Fatal failures that end the dispatch loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("poll failed: {0}")]
    Poll(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
