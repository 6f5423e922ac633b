//! Graph engine that runs each pipeline as a `gst-launch-1.0` child process.
//!
//! Element properties are rendered inline into the launch description, right
//! after the `name=` token of the element they belong to. The device channel
//! is inherited by the child as descriptor 3.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use bridge_core::{GraphEngine, GraphError, PipelineId, PipelineState, PropertyValue, Topology};
use tracing::{debug, warn};

/// Descriptor number the inherited device channel gets in the child.
pub const CHILD_FD: RawFd = 3;

#[derive(Debug)]
struct LaunchPipeline {
    description: String,
    properties: Vec<(String, String, String)>,
    inherited_fd: Option<RawFd>,
    child: Option<Child>,
}

impl LaunchPipeline {
    fn has_element(&self, element: &str) -> bool {
        let token = format!("name={element}");
        self.description.split_whitespace().any(|word| word == token)
    }

    fn render(&self) -> String {
        let mut words: Vec<String> = Vec::new();
        for word in self.description.split_whitespace() {
            words.push(word.to_string());
            if let Some(element) = word.strip_prefix("name=") {
                words.extend(
                    self.properties
                        .iter()
                        .filter(|(target, _, _)| target == element)
                        .map(|(_, property, value)| format!("{property}={value}")),
                );
            }
        }
        words.join(" ")
    }
}

/// Runs pipelines through an external launcher program.
#[derive(Debug)]
pub struct LaunchEngine {
    program: String,
    next_id: u64,
    pipelines: HashMap<PipelineId, LaunchPipeline>,
}

impl LaunchEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            next_id: 0,
            pipelines: HashMap::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The description the launcher receives for `pipeline`.
    pub fn command_line(&self, pipeline: PipelineId) -> Option<String> {
        self.pipelines.get(&pipeline).map(LaunchPipeline::render)
    }

    pub fn is_running(&self, pipeline: PipelineId) -> bool {
        self.pipelines
            .get(&pipeline)
            .is_some_and(|entry| entry.child.is_some())
    }

    fn spawn(&self, entry: &LaunchPipeline) -> io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .arg("-q")
            .arg(entry.render())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        if let Some(fd) = entry.inherited_fd {
            // SAFETY: the closure only calls async-signal-safe functions.
            unsafe {
                command.pre_exec(move || inherit_as_child_fd(fd));
            }
        }
        command.spawn()
    }
}

fn inherit_as_child_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on a descriptor owned by the parent.
    unsafe {
        if fd == CHILD_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(fd, CHILD_FD) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn stop_child(pipeline: PipelineId, mut child: Child) {
    if let Err(err) = child.kill() {
        debug!(%pipeline, "kill failed: {err}");
    }
    match child.wait() {
        Ok(status) => debug!(%pipeline, ?status, "pipeline process exited"),
        Err(err) => warn!(%pipeline, "failed to reap pipeline process: {err}"),
    }
}

impl GraphEngine for LaunchEngine {
    fn name(&self) -> &'static str {
        "gst-launch"
    }

    fn build_pipeline(&mut self, topology: &Topology) -> Result<PipelineId, GraphError> {
        if topology.description.trim().is_empty() {
            return Err(GraphError::Build("empty pipeline description".into()));
        }
        self.next_id += 1;
        let id = PipelineId(self.next_id);
        self.pipelines.insert(
            id,
            LaunchPipeline {
                description: topology.description.clone(),
                properties: Vec::new(),
                inherited_fd: None,
                child: None,
            },
        );
        Ok(id)
    }

    fn set_element_property(
        &mut self,
        pipeline: PipelineId,
        element: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError> {
        let entry = self
            .pipelines
            .get_mut(&pipeline)
            .ok_or(GraphError::UnknownPipeline(pipeline))?;
        if !entry.has_element(element) {
            return Err(GraphError::MissingElement(element.to_string()));
        }
        let rendered = match value {
            PropertyValue::Caps(caps) => format!("\"{caps}\""),
            PropertyValue::Structure(structure) => format!("\"{structure}\""),
            PropertyValue::Fd(fd) => {
                if entry.inherited_fd.is_some_and(|current| current != fd) {
                    return Err(GraphError::Property {
                        element: element.to_string(),
                        property: property.to_string(),
                        reason: "only one descriptor can be inherited".into(),
                    });
                }
                entry.inherited_fd = Some(fd);
                CHILD_FD.to_string()
            }
        };
        entry.properties.retain(|(target, name, _)| {
            !(target.as_str() == element && name.as_str() == property)
        });
        entry
            .properties
            .push((element.to_string(), property.to_string(), rendered));
        Ok(())
    }

    fn set_state(&mut self, pipeline: PipelineId, state: PipelineState) -> Result<(), GraphError> {
        let entry = self
            .pipelines
            .get(&pipeline)
            .ok_or(GraphError::UnknownPipeline(pipeline))?;
        match state {
            PipelineState::Playing => {
                if entry.child.is_some() {
                    return Ok(());
                }
                let child = self.spawn(entry).map_err(|err| GraphError::StateChange {
                    state,
                    reason: format!("failed to run {}: {err}", self.program),
                })?;
                debug!(%pipeline, pid = child.id(), "pipeline process started");
                if let Some(entry) = self.pipelines.get_mut(&pipeline) {
                    entry.child = Some(child);
                }
            }
            PipelineState::Null => {
                if let Some(child) = self
                    .pipelines
                    .get_mut(&pipeline)
                    .and_then(|entry| entry.child.take())
                {
                    stop_child(pipeline, child);
                }
            }
        }
        Ok(())
    }

    fn release_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(entry) = self.pipelines.remove(&pipeline) {
            if let Some(child) = entry.child {
                stop_child(pipeline, child);
            }
        }
    }
}

impl Drop for LaunchEngine {
    fn drop(&mut self) {
        for (pipeline, entry) in self.pipelines.drain() {
            if let Some(child) = entry.child {
                stop_child(pipeline, child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bridge_core::{
        AudioCaps, Direction, Profile, StreamProperties, TopologyConfig, BACKEND_ELEMENT,
        DEVICE_CAPS, DEVICE_ELEMENT,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn capture() -> Topology {
        Topology::for_direction(
            Direction::Source,
            Profile::Sco,
            AudioCaps::new(1, 16_000),
            &TopologyConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn properties_render_after_their_element() {
        let mut engine = LaunchEngine::new("gst-launch-1.0");
        let id = engine.build_pipeline(&capture()).unwrap();
        engine
            .set_element_property(id, DEVICE_ELEMENT, "fd", PropertyValue::Fd(17))
            .unwrap();
        engine
            .set_element_property(
                id,
                BACKEND_ELEMENT,
                "stream-properties",
                PropertyValue::Structure(StreamProperties::communication()),
            )
            .unwrap();
        engine
            .set_element_property(
                id,
                DEVICE_CAPS,
                "caps",
                PropertyValue::Caps(AudioCaps::new(1, 16_000)),
            )
            .unwrap();

        let line = engine.command_line(id).unwrap();
        assert!(line.starts_with(
            "pwaudiosrc name=backend \
             stream-properties=\"props,media.role=Communication,wireplumber.keep-linked=1\""
        ));
        assert!(line.contains(
            "capsfilter name=device_caps \
             caps=\"audio/x-raw,format=S16LE,layout=interleaved,channels=1,rate=16000\""
        ));
        assert!(line.ends_with("fdsink name=device_io fd=3"));
    }

    #[test]
    fn unknown_element_is_rejected() {
        let mut engine = LaunchEngine::new("gst-launch-1.0");
        let id = engine.build_pipeline(&capture()).unwrap();
        let err = engine
            .set_element_property(id, "mix_caps", "caps", PropertyValue::Caps(AudioCaps::new(1, 8000)))
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingElement(ref name) if name == "mix_caps"));
    }

    #[test]
    fn unknown_pipeline_is_rejected() {
        let mut engine = LaunchEngine::new("gst-launch-1.0");
        assert!(matches!(
            engine.set_state(PipelineId(9), PipelineState::Playing),
            Err(GraphError::UnknownPipeline(PipelineId(9)))
        ));
        engine.release_pipeline(PipelineId(9));
    }

    #[test]
    fn missing_program_fails_the_state_change() {
        let mut engine = LaunchEngine::new("/nonexistent/gst-launch-1.0");
        let id = engine.build_pipeline(&capture()).unwrap();
        let err = engine.set_state(id, PipelineState::Playing).unwrap_err();
        assert!(matches!(
            err,
            GraphError::StateChange {
                state: PipelineState::Playing,
                ..
            }
        ));
        assert!(!engine.is_running(id));
    }

    #[test]
    fn null_stops_the_process_and_release_forgets_it() {
        let mut engine = LaunchEngine::new("true");
        let id = engine
            .build_pipeline(&Topology {
                direction: Direction::Sink,
                description: "fakesrc name=device_io ! fakesink".into(),
                caps_elements: &[],
                stream_properties: None,
            })
            .unwrap();
        engine.set_state(id, PipelineState::Playing).unwrap();
        assert!(engine.is_running(id));
        engine.set_state(id, PipelineState::Playing).unwrap();

        engine.set_state(id, PipelineState::Null).unwrap();
        assert!(!engine.is_running(id));
        assert_eq!(
            engine.command_line(id).as_deref(),
            Some("fakesrc name=device_io ! fakesink")
        );

        engine.release_pipeline(id);
        assert_eq!(engine.command_line(id), None);
    }
}
