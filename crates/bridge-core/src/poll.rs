//! Bounded readiness set handed to the transport before every wait.

use std::io;
use std::os::fd::RawFd;

use crate::error::TransportError;

/// A fixed-capacity set of descriptors waited on for readability.
#[derive(Debug)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    capacity: usize,
}

impl PollSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a descriptor; exceeding the capacity is an error.
    pub fn register(&mut self, fd: RawFd) -> Result<(), TransportError> {
        if self.fds.len() >= self.capacity {
            return Err(TransportError::DescriptorCapacity {
                capacity: self.capacity,
            });
        }
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until at least one descriptor is ready.
    ///
    /// Returns `ErrorKind::Interrupted` when a signal arrives first.
    pub fn wait(&mut self) -> io::Result<usize> {
        // Safety: `fds` is a valid, initialised array of `len` pollfd structs.
        let ready = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                -1,
            )
        };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ready as usize)
    }

    /// True when `fd` reported readiness (including hang-up or error) in the last wait.
    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.fds
            .iter()
            .any(|pfd| pfd.fd == fd && pfd.revents != 0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mut set = PollSet::with_capacity(1);
        set.register(0).unwrap();
        assert!(matches!(
            set.register(1),
            Err(TransportError::DescriptorCapacity { capacity: 1 })
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wait_reports_readable_descriptor() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        writer.write_all(b"x").unwrap();
        let mut set = PollSet::with_capacity(2);
        set.register(reader.as_raw_fd()).unwrap();
        assert_eq!(set.wait().unwrap(), 1);
        assert!(set.is_ready(reader.as_raw_fd()));
    }
}
