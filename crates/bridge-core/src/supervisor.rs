//! Maps the current state of a worker onto the pipeline action it needs.

use tracing::debug;

use crate::worker::{CapabilityFlags, Direction, Profile, Worker};

/// What the lifecycle manager has to do to bring a worker in line with its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tear down every pipeline and close the channel.
    Stop,
    StartSink,
    StartSource,
    StartBoth,
    /// Everything that should run is already running.
    NoChange,
}

impl Action {
    /// Directions this action starts.
    pub fn directions(self) -> &'static [Direction] {
        match self {
            Action::StartSink => &[Direction::Sink],
            Action::StartSource => &[Direction::Source],
            Action::StartBoth => &Direction::ALL,
            Action::Stop | Action::NoChange => &[],
        }
    }
}

/// Decides the action for `worker` from its flags and currently held pipelines.
///
/// The result depends only on the worker, so evaluating unchanged state twice
/// never asks for a pipeline that is already running.
pub fn evaluate(worker: &Worker) -> Action {
    let flags = worker.flags();

    if !flags.intersects(CapabilityFlags::MODE_MASK) {
        return Action::Stop;
    }

    let profile = match flags.profile() {
        Some(profile) => profile,
        None => {
            if flags.contains(CapabilityFlags::PROFILE_MASK) {
                debug!(device = %worker.id(), "PCM reports both A2DP and SCO; ignoring");
            }
            return Action::Stop;
        }
    };

    if profile == Profile::Sco && !worker.descriptor().codec_selected() {
        debug!(device = %worker.id(), "Skipping SCO with codec not selected");
        return Action::Stop;
    }

    let wants = |direction| flags.supports(direction) && worker.pipeline(direction).is_none();
    match (wants(Direction::Sink), wants(Direction::Source)) {
        (true, true) => Action::StartBoth,
        (true, false) => Action::StartSink,
        (false, true) => Action::StartSource,
        (false, false) => Action::NoChange,
    }
}
