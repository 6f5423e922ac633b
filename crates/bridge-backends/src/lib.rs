//! Concrete service backends for the btaudio bridge.
//!
//! [`socket`] talks to the PCM registry over a Unix socket and serves both the
//! registry calls and the notification stream. [`launch`] runs the audio
//! graphs as launcher child processes.

pub mod launch;
pub mod socket;

pub use launch::{LaunchEngine, CHILD_FD};
pub use socket::{Frame, RegistryClient, SocketNotifications};
