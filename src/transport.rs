//! Hypervisor socket transport.
//!
//! The host control plane connects to the agent over an AF_VSOCK stream.
//! The agent dials the host (CID 2) on the well-known command port and
//! hands the bridge two independently owned halves of the connection so
//! the reader and writer tasks never share a descriptor.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// A connected duplex byte stream split into its two directions.
pub struct Duplex {
    /// Receive half, owned by the bridge's reader task.
    pub reader: Box<dyn Read + Send>,
    /// Send half, owned by the bridge's writer task.
    pub writer: Box<dyn Write + Send>,
}

/// Connection factory the bridge uses to reach the host.
pub trait Transport: Send + Sync {
    /// Open a duplex connection to the host on `port`.
    fn dial(&self, port: u32) -> io::Result<Duplex>;
}

const AF_VSOCK: libc::c_int = 40;
const VMADDR_CID_HOST: u32 = 2;

#[repr(C)]
#[allow(non_camel_case_types)]
struct sockaddr_vm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

/// vsock stream half backed by its own file descriptor.
pub struct VsockStream {
    fd: OwnedFd,
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: reading into a valid buffer on an owned descriptor.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: writing from a valid buffer on an owned descriptor.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport that dials the host over AF_VSOCK.
pub struct HvsockTransport;

impl Transport for HvsockTransport {
    fn dial(&self, port: u32) -> io::Result<Duplex> {
        // SAFETY: plain socket creation; the descriptor is wrapped in an
        // OwnedFd immediately.
        let fd = unsafe { libc::socket(AF_VSOCK, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket() and is not owned
        // elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = sockaddr_vm {
            svm_family: AF_VSOCK as libc::sa_family_t,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: VMADDR_CID_HOST,
            svm_zero: [0; 4],
        };
        // SAFETY: addr is a valid sockaddr_vm for the lifetime of the call.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const sockaddr_vm as *const libc::sockaddr,
                std::mem::size_of::<sockaddr_vm>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let write_fd = fd.try_clone()?;
        Ok(Duplex {
            reader: Box::new(VsockStream { fd }),
            writer: Box::new(VsockStream { fd: write_fd }),
        })
    }
}
