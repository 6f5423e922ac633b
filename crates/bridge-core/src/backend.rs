//! Boundaries to the external services the bridge drives.

use crate::error::{GraphError, RegistryError, TransportError};
use crate::notification::RawNotification;
use crate::poll::PollSet;
use crate::topology::{PipelineState, PropertyValue, Topology};
use crate::worker::{DeviceDescriptor, DeviceId, Direction, PipelineId, RawChannel};

/// The remote PCM registry.
pub trait RegistryService {
    /// Lists every PCM currently known to the registry.
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, RegistryError>;

    /// Opens the data and control channels of a PCM. May block.
    fn open_channel(
        &mut self,
        device: &DeviceId,
        direction: Direction,
    ) -> Result<RawChannel, RegistryError>;
}

/// The declarative audio-graph runtime.
pub trait GraphEngine {
    fn name(&self) -> &'static str;

    fn build_pipeline(&mut self, topology: &Topology) -> Result<PipelineId, GraphError>;

    fn set_element_property(
        &mut self,
        pipeline: PipelineId,
        element: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError>;

    fn set_state(&mut self, pipeline: PipelineId, state: PipelineState) -> Result<(), GraphError>;

    /// Drops the engine's pipeline object. Unknown ids are ignored.
    fn release_pipeline(&mut self, pipeline: PipelineId);
}

/// The pub/sub transport delivering registry notifications.
pub trait NotificationSource {
    /// Registers the descriptors the dispatch loop has to wait on.
    fn poll_fds(&mut self, set: &mut PollSet) -> Result<(), TransportError>;

    /// Blocks until a registered descriptor is ready.
    fn wait(&mut self, set: &mut PollSet) -> std::io::Result<usize> {
        set.wait()
    }

    /// Reads whatever became ready during the last wait into the internal buffer.
    fn dispatch(&mut self, set: &PollSet) -> Result<(), TransportError>;

    /// Pops the next buffered notification, in delivery order.
    fn next_notification(&mut self) -> Option<RawNotification>;
}
