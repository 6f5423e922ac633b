use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, info};

use crate::backend::{GraphEngine, RegistryService};
use crate::lifecycle::PipelineManager;
use crate::worker::{DeviceDescriptor, DeviceId, PropertyChanges, Worker};

/// Every known worker, keyed by device id.
///
/// Each mutation is followed by supervision of the affected worker; the
/// registry itself never looks at capability flags.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<DeviceId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a worker for `descriptor`, or merges it into the existing one.
    pub fn upsert<R, E>(&mut self, descriptor: DeviceDescriptor, pipelines: &mut PipelineManager<R, E>)
    where
        R: RegistryService,
        E: GraphEngine,
    {
        let worker = match self.workers.entry(descriptor.id.clone()) {
            Entry::Occupied(entry) => {
                debug!(device = %descriptor.id, "merging descriptor into existing worker");
                let worker = entry.into_mut();
                worker.merge(descriptor);
                worker
            }
            Entry::Vacant(entry) => {
                info!(device = %descriptor.id, "new worker");
                entry.insert(Worker::new(descriptor))
            }
        };
        pipelines.supervise(worker);
    }

    /// Applies `changes` to a known worker and re-evaluates it.
    ///
    /// Returns `false` for unknown devices.
    pub fn update<R, E>(
        &mut self,
        device: &DeviceId,
        changes: &PropertyChanges,
        pipelines: &mut PipelineManager<R, E>,
    ) -> bool
    where
        R: RegistryService,
        E: GraphEngine,
    {
        let Some(worker) = self.workers.get_mut(device) else {
            return false;
        };
        worker.apply_changes(changes);
        pipelines.supervise(worker);
        true
    }

    /// Tears down and forgets a worker. Unknown devices are ignored.
    pub fn remove<R, E>(&mut self, device: &DeviceId, pipelines: &mut PipelineManager<R, E>) -> bool
    where
        R: RegistryService,
        E: GraphEngine,
    {
        let Some(mut worker) = self.workers.remove(device) else {
            return false;
        };
        pipelines.teardown(&mut worker);
        info!(device = %device, "worker removed");
        true
    }

    /// Tears down every worker and empties the registry.
    pub fn teardown_all<R, E>(&mut self, pipelines: &mut PipelineManager<R, E>)
    where
        R: RegistryService,
        E: GraphEngine,
    {
        for (_, mut worker) in self.workers.drain() {
            pipelines.teardown(&mut worker);
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<&Worker> {
        self.workers.get(device)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.workers.contains_key(device)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }
}
