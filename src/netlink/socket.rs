// AF_NETLINK raw socket bound to the netfilter subsystem.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::CtError;
use crate::netlink::{self, FramedMessage};
use crate::sampler::SockFilter;

/// Receive errors, classified by errno rather than message text.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// EBADF/EPIPE or an explicitly closed transport: orderly shutdown.
    #[error("socket closed")]
    Closed,
    /// ENOBUFS: the kernel dropped messages because the socket buffer
    /// overflowed.
    #[error("no buffer space available")]
    NoBufferSpace,
    /// EAGAIN from the receive-timeout tick; not an error, just an idle
    /// poll.
    #[error("receive timed out")]
    WouldBlock,
    #[error("receive error: {0}")]
    Other(#[source] io::Error),
}

/// Result of one bulk receive. A partial receive can carry both messages
/// and an error; the two are reported independently.
#[derive(Debug, Default)]
pub struct Batch {
    pub messages: Vec<FramedMessage>,
    pub netns: Option<i32>,
    pub error: Option<RecvError>,
}

impl Batch {
    pub(crate) fn error(err: RecvError) -> Self {
        Self {
            messages: Vec::new(),
            netns: None,
            error: Some(err),
        }
    }
}

/// Kernel-socket operations consumed by the connection layer and the
/// consumer. The production implementation is `NetlinkSocket`; tests
/// substitute a scripted transport.
pub trait NetlinkTransport: Send + Sync {
    /// One bulk receive into `buf`, framed into messages aliasing `buf`.
    fn receive_into(&self, buf: &mut [u8]) -> Batch;

    /// Send one framed request datagram to the kernel.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Mirror of setsockopt(2) for integer options.
    fn set_sockopt_int(&self, level: i32, name: i32, value: i32) -> io::Result<()>;

    /// Readback of the effective receive buffer size (SO_RCVBUF).
    fn recv_buffer_size(&self) -> io::Result<i32>;

    /// Attach a classic BPF filter evaluated per inbound datagram.
    fn attach_filter(&self, prog: &[SockFilter]) -> io::Result<()>;

    /// Join a netlink multicast group.
    fn join_group(&self, group: u32) -> io::Result<()>;

    /// Idempotent close; pending receives observe `RecvError::Closed`.
    fn close(&self);

    /// The kernel-assigned netlink port id.
    fn pid(&self) -> u32;
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *mut SockFilter,
}

const CLOSED_FD: i32 = -1;

// Poll interval of the receive loop; a close from another thread is
// observed at the next tick.
const RECV_TIMEOUT_USEC: libc::suseconds_t = 500_000;

/// A netlink socket with a kernel-assigned port id.
///
/// The descriptor is held in an atomic so `close` can race a blocked
/// receive without locking; the receive observes EBADF or the next
/// timeout tick.
pub struct NetlinkSocket {
    fd: AtomicI32,
    pid: u32,
    collect_nsid: AtomicBool,
}

impl NetlinkSocket {
    /// Open and bind a socket for the given netlink protocol
    /// (NETLINK_NETFILTER for conntrack, NETLINK_ROUTE for namespace
    /// queries).
    pub fn open(protocol: i32) -> Result<Self, CtError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(CtError::Socket(io::Error::last_os_error()));
        }

        let fail = |fd: i32| {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            Err(CtError::Socket(err))
        };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return fail(fd);
        }

        // Read back the kernel-assigned port id.
        let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                fd,
                &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return fail(fd);
        }

        // Receive timeout so a close from another thread is noticed even
        // when the kernel has nothing to deliver.
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: RECV_TIMEOUT_USEC,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "SO_RCVTIMEO failed on netlink socket: {}",
                io::Error::last_os_error()
            );
        }

        Ok(Self {
            fd: AtomicI32::new(fd),
            pid: addr.nl_pid,
            collect_nsid: AtomicBool::new(false),
        })
    }

    fn raw_fd(&self) -> Option<i32> {
        match self.fd.load(Ordering::Acquire) {
            CLOSED_FD => None,
            fd => Some(fd),
        }
    }

    fn classify(&self, err: io::Error) -> RecvError {
        if self.raw_fd().is_none() {
            return RecvError::Closed;
        }
        match err.raw_os_error() {
            Some(libc::EBADF) | Some(libc::EPIPE) => RecvError::Closed,
            Some(libc::ENOBUFS) => RecvError::NoBufferSpace,
            Some(libc::EAGAIN) => RecvError::WouldBlock,
            _ => RecvError::Other(err),
        }
    }
}

impl NetlinkTransport for NetlinkSocket {
    fn receive_into(&self, buf: &mut [u8]) -> Batch {
        let Some(fd) = self.raw_fd() else {
            return Batch::error(RecvError::Closed);
        };

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        let collect_nsid = self.collect_nsid.load(Ordering::Relaxed);
        if collect_nsid {
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();
        }

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Batch::error(self.classify(io::Error::last_os_error()));
        }

        let netns = if collect_nsid {
            origin_nsid(&msg)
        } else {
            None
        };
        let (messages, frame_err) = netlink::parse_frames(&buf[..n as usize]);
        Batch {
            messages,
            netns,
            error: frame_err
                .map(|e| RecvError::Other(io::Error::new(io::ErrorKind::InvalidData, e))),
        }
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let Some(fd) = self.raw_fd() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let n = unsafe {
            libc::sendto(
                fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_sockopt_int(&self, level: i32, name: i32, value: i32) -> io::Result<()> {
        let Some(fd) = self.raw_fd() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const i32 as *const libc::c_void,
                mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if level == libc::SOL_NETLINK && name == libc::NETLINK_LISTEN_ALL_NSID {
            self.collect_nsid.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn recv_buffer_size(&self) -> io::Result<i32> {
        let Some(fd) = self.raw_fd() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };
        let mut size: i32 = 0;
        let mut len = mem::size_of::<i32>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut size as *mut i32 as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    }

    fn attach_filter(&self, prog: &[SockFilter]) -> io::Result<()> {
        let Some(fd) = self.raw_fd() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };
        let mut insns = prog.to_vec();
        let fprog = SockFprog {
            len: insns.len() as u16,
            filter: insns.as_mut_ptr(),
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const SockFprog as *const libc::c_void,
                mem::size_of::<SockFprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn join_group(&self, group: u32) -> io::Result<()> {
        self.set_sockopt_int(
            libc::SOL_NETLINK,
            libc::NETLINK_ADD_MEMBERSHIP,
            group as i32,
        )
    }

    fn close(&self) {
        let fd = self.fd.swap(CLOSED_FD, Ordering::AcqRel);
        if fd != CLOSED_FD {
            unsafe { libc::close(fd) };
        }
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pull the origin namespace id out of the receive ancillary data, present
/// when NETLINK_LISTEN_ALL_NSID is active.
fn origin_nsid(msg: &libc::msghdr) -> Option<i32> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_NETLINK
                && (*cmsg).cmsg_type == libc::NETLINK_LISTEN_ALL_NSID
            {
                let data = libc::CMSG_DATA(cmsg) as *const i32;
                return Some(std::ptr::read_unaligned(data));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}
