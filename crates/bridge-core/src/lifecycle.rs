//! Starts and stops the pipelines of a worker against the external services.

use tracing::{debug, error, info, warn};

use crate::backend::{GraphEngine, RegistryService};
use crate::error::{GraphError, StartError};
use crate::supervisor::{evaluate, Action};
use crate::topology::{
    AudioCaps, PipelineState, PropertyValue, Topology, TopologyConfig, BACKEND_ELEMENT,
    DEVICE_ELEMENT,
};
use crate::worker::{Direction, PipelineId, Worker};

/// Owns the registry and graph engine and applies supervisor actions to workers.
pub struct PipelineManager<R, E> {
    registry: R,
    engine: E,
    topology: TopologyConfig,
}

impl<R: RegistryService, E: GraphEngine> PipelineManager<R, E> {
    pub fn new(registry: R, engine: E, topology: TopologyConfig) -> Self {
        Self {
            registry,
            engine,
            topology,
        }
    }

    pub fn registry_service(&self) -> &R {
        &self.registry
    }

    pub fn registry_service_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    /// Evaluates `worker` and applies the resulting action.
    pub fn supervise(&mut self, worker: &mut Worker) -> Action {
        let action = evaluate(worker);
        self.apply(worker, action);
        action
    }

    /// Applies `action` to `worker`. Start failures are logged and left for
    /// the next notification to retry.
    pub fn apply(&mut self, worker: &mut Worker, action: Action) {
        match action {
            Action::NoChange => {}
            Action::Stop => {
                if !worker.is_idle() {
                    debug!(device = %worker.id(), "stop worker");
                }
                self.teardown(worker);
            }
            start => {
                debug!(
                    device = %worker.id(),
                    address = worker.descriptor().address.as_deref().unwrap_or("unknown"),
                    flags = ?worker.flags(),
                    "worker start"
                );
                for &direction in start.directions() {
                    match self.start(worker, direction) {
                        Ok(()) => {}
                        Err(err @ StartError::NoTopology { .. }) => {
                            debug!(device = %worker.id(), "{err}");
                        }
                        Err(err) => {
                            error!(device = %worker.id(), %direction, "{err}");
                        }
                    }
                }
            }
        }
    }

    /// Starts the pipeline for `direction` unless one is already running.
    ///
    /// On failure the worker is left without a pipeline for `direction`, and a
    /// channel opened by this call is closed again unless another pipeline
    /// still uses it.
    pub fn start(&mut self, worker: &mut Worker, direction: Direction) -> Result<(), StartError> {
        if worker.pipeline(direction).is_some() {
            return Ok(());
        }

        let profile = worker.flags().profile();
        let caps = AudioCaps::new(worker.descriptor().channels, worker.descriptor().sampling);
        let topology = profile
            .and_then(|profile| Topology::for_direction(direction, profile, caps, &self.topology))
            .ok_or(StartError::NoTopology { direction, profile })?;

        let mut opened_here = false;
        let data_fd = match worker.channel() {
            Some(channel) => channel.data_fd(),
            None => {
                let channel = self.registry.open_channel(worker.id(), direction)?;
                let fd = channel.data_fd();
                worker.attach_channel(channel);
                opened_here = true;
                fd
            }
        };

        debug!(device = %worker.id(), %direction, %caps, "{direction} start");
        match self.build(&topology, caps, data_fd) {
            Ok(pipeline) => {
                worker.set_pipeline(direction, pipeline);
                info!(
                    device = %worker.id(),
                    %direction,
                    %pipeline,
                    engine = self.engine.name(),
                    "pipeline running"
                );
                Ok(())
            }
            Err(err) => {
                if opened_here && !worker.has_pipelines() {
                    drop(worker.take_channel());
                }
                Err(err.into())
            }
        }
    }

    fn build(
        &mut self,
        topology: &Topology,
        caps: AudioCaps,
        data_fd: std::os::fd::RawFd,
    ) -> Result<PipelineId, GraphError> {
        let mut pending = PendingPipeline::build(&mut self.engine, topology)?;
        for element in topology.caps_elements {
            pending.set(element, "caps", PropertyValue::Caps(caps))?;
        }
        pending.set(DEVICE_ELEMENT, "fd", PropertyValue::Fd(data_fd))?;
        if let Some(properties) = &topology.stream_properties {
            pending.set(
                BACKEND_ELEMENT,
                "stream-properties",
                PropertyValue::Structure(properties.clone()),
            )?;
        }
        pending.play()
    }

    /// Stops and releases the pipeline for `direction`, if any.
    ///
    /// Closes the channel once no pipeline of the worker is left.
    pub fn stop(&mut self, worker: &mut Worker, direction: Direction) {
        if let Some(pipeline) = worker.take_pipeline(direction) {
            debug!(device = %worker.id(), %direction, %pipeline, "stopping pipeline");
            if let Err(err) = self.engine.set_state(pipeline, PipelineState::Null) {
                warn!(device = %worker.id(), %pipeline, "{err}");
            }
            self.engine.release_pipeline(pipeline);
        }
        if !worker.has_pipelines() && worker.take_channel().is_some() {
            debug!(device = %worker.id(), "closed PCM channel");
        }
    }

    /// Stops both directions and closes the channel. Safe on an idle worker.
    pub fn teardown(&mut self, worker: &mut Worker) {
        for direction in Direction::ALL {
            self.stop(worker, direction);
        }
        drop(worker.take_channel());
    }
}

/// A pipeline under construction; released unless it reaches `Playing`.
struct PendingPipeline<'a, E: GraphEngine> {
    engine: &'a mut E,
    id: PipelineId,
    armed: bool,
}

impl<'a, E: GraphEngine> PendingPipeline<'a, E> {
    fn build(engine: &'a mut E, topology: &Topology) -> Result<Self, GraphError> {
        let id = engine.build_pipeline(topology)?;
        Ok(Self {
            engine,
            id,
            armed: true,
        })
    }

    fn set(&mut self, element: &str, property: &str, value: PropertyValue) -> Result<(), GraphError> {
        self.engine
            .set_element_property(self.id, element, property, value)
    }

    fn play(mut self) -> Result<PipelineId, GraphError> {
        self.engine.set_state(self.id, PipelineState::Playing)?;
        self.armed = false;
        Ok(self.id)
    }
}

impl<E: GraphEngine> Drop for PendingPipeline<'_, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.engine.set_state(self.id, PipelineState::Null) {
            debug!(pipeline = %self.id, "{err}");
        }
        self.engine.release_pipeline(self.id);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::virtual_backend::{VirtualGraphEngine, VirtualRegistry};
    use crate::worker::{CapabilityFlags, DeviceDescriptor};

    type Manager = PipelineManager<VirtualRegistry, VirtualGraphEngine>;

    fn manager() -> Manager {
        PipelineManager::new(
            VirtualRegistry::default(),
            VirtualGraphEngine::default(),
            TopologyConfig::default(),
        )
    }

    fn a2dp_sink() -> Worker {
        Worker::new(
            DeviceDescriptor::new("/org/bluealsa/hci0/dev_00_11_22_33_44_55/a2dpsnk/source")
                .with_flags(CapabilityFlags::SINK | CapabilityFlags::PROFILE_A2DP)
                .with_codec("SBC")
                .with_stream(2, 44_100),
        )
    }

    fn sco_duplex() -> Worker {
        Worker::new(
            DeviceDescriptor::new("/org/bluealsa/hci0/dev_00_11_22_33_44_55/hfpag/sink")
                .with_flags(CapabilityFlags::MODE_MASK | CapabilityFlags::PROFILE_SCO)
                .with_codec("mSBC")
                .with_stream(1, 16_000),
        )
    }

    #[test]
    fn playback_pipeline_gets_device_caps() {
        let mut manager = manager();
        let mut worker = a2dp_sink();
        assert_eq!(manager.supervise(&mut worker), Action::StartSink);

        let pipeline = worker.pipeline(Direction::Sink).unwrap();
        let built = manager.engine().pipeline(pipeline).unwrap();
        assert_eq!(built.state, PipelineState::Playing);
        assert_eq!(
            built.property("device_caps", "caps"),
            Some(&PropertyValue::Caps(AudioCaps::new(2, 44_100)))
        );
        assert_eq!(
            built.property(DEVICE_ELEMENT, "fd"),
            Some(&PropertyValue::Fd(worker.channel().unwrap().data_fd()))
        );
        assert!(built.property(BACKEND_ELEMENT, "stream-properties").is_none());
        assert_eq!(manager.registry_service().open_calls().len(), 1);
    }

    #[test]
    fn repeated_supervision_is_idempotent() {
        let mut manager = manager();
        let mut worker = a2dp_sink();
        manager.supervise(&mut worker);
        assert_eq!(manager.supervise(&mut worker), Action::NoChange);
        manager.apply(&mut worker, Action::StartSink);
        assert_eq!(manager.engine().builds(), 1);
        assert_eq!(manager.registry_service().open_calls().len(), 1);
    }

    #[test]
    fn both_directions_share_one_channel() {
        let mut manager = manager();
        let mut worker = sco_duplex();
        assert_eq!(manager.supervise(&mut worker), Action::StartBoth);
        assert!(worker.pipeline(Direction::Sink).is_some());
        let capture = worker.pipeline(Direction::Source).unwrap();
        assert_eq!(manager.engine().builds(), 2);
        assert_eq!(manager.registry_service().open_calls().len(), 1);
        assert!(manager
            .engine()
            .pipeline(capture)
            .unwrap()
            .property(BACKEND_ELEMENT, "stream-properties")
            .is_some());

        manager.stop(&mut worker, Direction::Sink);
        assert!(worker.channel().is_some());
        manager.stop(&mut worker, Direction::Source);
        assert!(worker.is_idle());
    }

    #[test]
    fn channel_failure_leaves_direction_stopped() {
        let mut manager = manager();
        let mut worker = a2dp_sink();
        manager
            .registry_service_mut()
            .fail_open(worker.id().clone());
        assert!(matches!(
            manager.start(&mut worker, Direction::Sink),
            Err(StartError::Channel(_))
        ));
        assert!(worker.is_idle());
        assert_eq!(manager.engine().builds(), 0);
    }

    #[test]
    fn build_failure_releases_pipeline_and_channel() {
        let mut manager = manager();
        manager.engine_mut().fail_state_changes(true);
        let mut worker = a2dp_sink();
        assert!(matches!(
            manager.start(&mut worker, Direction::Sink),
            Err(StartError::Graph(GraphError::StateChange { .. }))
        ));
        assert!(worker.is_idle());
        assert_eq!(manager.engine().builds(), 1);
        assert_eq!(manager.engine().live_pipelines(), 0);
    }

    #[test]
    fn failed_second_direction_keeps_shared_channel() {
        let mut manager = manager();
        let mut worker = sco_duplex();
        manager.start(&mut worker, Direction::Sink).unwrap();
        manager.engine_mut().fail_builds(true);
        assert!(manager.start(&mut worker, Direction::Source).is_err());
        assert!(worker.pipeline(Direction::Sink).is_some());
        assert!(worker.channel().is_some());
    }

    #[test]
    fn a2dp_capture_never_opens_channel() {
        let mut manager = manager();
        let mut worker = Worker::new(
            DeviceDescriptor::new("/a2dp/source")
                .with_flags(CapabilityFlags::SOURCE | CapabilityFlags::PROFILE_A2DP)
                .with_stream(2, 48_000),
        );
        assert_eq!(manager.supervise(&mut worker), Action::StartSource);
        assert!(worker.is_idle());
        assert!(manager.registry_service().open_calls().is_empty());
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut manager = manager();
        let mut worker = sco_duplex();
        manager.supervise(&mut worker);
        manager.teardown(&mut worker);
        assert!(worker.is_idle());
        let calls = manager.engine().calls().len();
        manager.teardown(&mut worker);
        assert!(worker.is_idle());
        assert_eq!(manager.engine().calls().len(), calls);
        assert_eq!(manager.engine().live_pipelines(), 0);
    }
}
