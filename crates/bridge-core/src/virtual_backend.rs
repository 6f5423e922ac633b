//! In-memory collaborators used for testing and development.
//!
//! They record every call so tests can assert on exactly what the bridge asked
//! the external services to do.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use crate::backend::{GraphEngine, NotificationSource, RegistryService};
use crate::dispatch::ShutdownToken;
use crate::error::{GraphError, RegistryError, TransportError};
use crate::notification::RawNotification;
use crate::poll::PollSet;
use crate::topology::{PipelineState, PropertyValue, Topology};
use crate::worker::{DeviceDescriptor, DeviceId, Direction, PipelineId, RawChannel};

/// One call made against [`VirtualGraphEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphCall {
    Build(PipelineId, Direction),
    SetProperty(PipelineId, String, String),
    SetState(PipelineId, PipelineState),
    Release(PipelineId),
}

#[derive(Debug, Clone)]
pub struct VirtualPipeline {
    pub topology: Topology,
    pub properties: Vec<(String, String, PropertyValue)>,
    pub state: PipelineState,
}

impl VirtualPipeline {
    pub fn property(&self, element: &str, property: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .rev()
            .find(|(el, prop, _)| el == element && prop == property)
            .map(|(_, _, value)| value)
    }
}

/// Graph engine that only keeps pipeline descriptions in memory.
#[derive(Debug, Default)]
pub struct VirtualGraphEngine {
    next_id: u64,
    pipelines: BTreeMap<PipelineId, VirtualPipeline>,
    calls: Vec<GraphCall>,
    fail_builds: bool,
    fail_state_changes: bool,
}

impl VirtualGraphEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_builds(&mut self, fail: bool) {
        self.fail_builds = fail;
    }

    pub fn fail_state_changes(&mut self, fail: bool) {
        self.fail_state_changes = fail;
    }

    pub fn calls(&self) -> &[GraphCall] {
        &self.calls
    }

    /// Number of successful `build_pipeline` calls so far.
    pub fn builds(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, GraphCall::Build(..)))
            .count()
    }

    pub fn builds_for(&self, direction: Direction) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, GraphCall::Build(_, dir) if *dir == direction))
            .count()
    }

    /// Pipelines built and not yet released.
    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&VirtualPipeline> {
        self.pipelines.get(&id)
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> Result<&mut VirtualPipeline, GraphError> {
        self.pipelines
            .get_mut(&id)
            .ok_or(GraphError::UnknownPipeline(id))
    }
}

impl GraphEngine for VirtualGraphEngine {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn build_pipeline(&mut self, topology: &Topology) -> Result<PipelineId, GraphError> {
        if self.fail_builds {
            return Err(GraphError::Build("no element \"pwaudiosink\"".into()));
        }
        self.next_id += 1;
        let id = PipelineId(self.next_id);
        self.pipelines.insert(
            id,
            VirtualPipeline {
                topology: topology.clone(),
                properties: Vec::new(),
                state: PipelineState::Null,
            },
        );
        self.calls.push(GraphCall::Build(id, topology.direction));
        Ok(id)
    }

    fn set_element_property(
        &mut self,
        pipeline: PipelineId,
        element: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError> {
        let entry = self.pipeline_mut(pipeline)?;
        if !entry.topology.description.contains(&format!("name={element}")) {
            return Err(GraphError::MissingElement(element.to_string()));
        }
        entry
            .properties
            .push((element.to_string(), property.to_string(), value));
        self.calls.push(GraphCall::SetProperty(
            pipeline,
            element.to_string(),
            property.to_string(),
        ));
        Ok(())
    }

    fn set_state(&mut self, pipeline: PipelineId, state: PipelineState) -> Result<(), GraphError> {
        let fail = self.fail_state_changes;
        let entry = self.pipeline_mut(pipeline)?;
        if fail {
            return Err(GraphError::StateChange {
                state,
                reason: "virtual engine refused the state change".into(),
            });
        }
        entry.state = state;
        self.calls.push(GraphCall::SetState(pipeline, state));
        Ok(())
    }

    fn release_pipeline(&mut self, pipeline: PipelineId) {
        if self.pipelines.remove(&pipeline).is_some() {
            self.calls.push(GraphCall::Release(pipeline));
        }
    }
}

/// Registry serving a fixed device list and socketpair-backed channels.
#[derive(Debug, Default)]
pub struct VirtualRegistry {
    devices: Vec<DeviceDescriptor>,
    opened: Vec<(DeviceId, Direction)>,
    failing: HashSet<DeviceId>,
    fail_enumeration: bool,
    peers: Vec<UnixStream>,
}

impl VirtualRegistry {
    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    pub fn fail_open(&mut self, device: DeviceId) {
        self.failing.insert(device);
    }

    pub fn fail_enumeration(&mut self, fail: bool) {
        self.fail_enumeration = fail;
    }

    pub fn open_calls(&self) -> &[(DeviceId, Direction)] {
        &self.opened
    }
}

impl RegistryService for VirtualRegistry {
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        if self.fail_enumeration {
            return Err(RegistryError::Call {
                method: "GetPCMs".into(),
                message: "service unknown".into(),
            });
        }
        Ok(self.devices.clone())
    }

    fn open_channel(
        &mut self,
        device: &DeviceId,
        direction: Direction,
    ) -> Result<RawChannel, RegistryError> {
        self.opened.push((device.clone(), direction));
        if self.failing.contains(device) {
            return Err(RegistryError::Call {
                method: "Open".into(),
                message: "PCM busy".into(),
            });
        }
        let (data, data_peer) = UnixStream::pair()?;
        let (control, control_peer) = UnixStream::pair()?;
        self.peers.push(data_peer);
        self.peers.push(control_peer);
        Ok(RawChannel::new(OwnedFd::from(data), OwnedFd::from(control)))
    }
}

/// Transport that delivers pre-arranged batches, one batch per wake-up.
///
/// Once every batch has been delivered the attached shutdown token, if any,
/// is triggered so the dispatch loop winds down.
#[derive(Debug)]
pub struct VirtualTransport {
    batches: VecDeque<Vec<RawNotification>>,
    buffered: VecDeque<RawNotification>,
    waker: UnixStream,
    wake_fd: UnixStream,
    descriptors: usize,
    shutdown: Option<ShutdownToken>,
}

impl VirtualTransport {
    pub fn new() -> std::io::Result<Self> {
        let (waker, wake_fd) = UnixStream::pair()?;
        Ok(Self {
            batches: VecDeque::new(),
            buffered: VecDeque::new(),
            waker,
            wake_fd,
            descriptors: 1,
            shutdown: None,
        })
    }

    /// Queues notifications that become readable together on the next wake-up.
    pub fn push_batch(&mut self, batch: Vec<RawNotification>) -> std::io::Result<()> {
        self.batches.push_back(batch);
        self.waker.write_all(&[1])
    }

    /// Requests shutdown through `token` after the last batch.
    pub fn shutdown_when_drained(&mut self, token: ShutdownToken) -> std::io::Result<()> {
        self.shutdown = Some(token);
        self.waker.write_all(&[0])
    }

    /// Number of descriptors registered per wait.
    pub fn set_descriptor_count(&mut self, count: usize) {
        self.descriptors = count;
    }
}

impl NotificationSource for VirtualTransport {
    fn poll_fds(&mut self, set: &mut PollSet) -> Result<(), TransportError> {
        for _ in 0..self.descriptors {
            set.register(self.wake_fd.as_raw_fd())?;
        }
        Ok(())
    }

    fn dispatch(&mut self, set: &PollSet) -> Result<(), TransportError> {
        if !set.is_ready(self.wake_fd.as_raw_fd()) {
            return Ok(());
        }
        let mut byte = [0u8; 1];
        self.wake_fd.read_exact(&mut byte)?;
        match self.batches.pop_front() {
            Some(batch) => self.buffered.extend(batch),
            None => {
                if let Some(token) = &self.shutdown {
                    token.request();
                }
            }
        }
        Ok(())
    }

    fn next_notification(&mut self) -> Option<RawNotification> {
        self.buffered.pop_front()
    }
}
