// Framed request/reply connection over a netlink transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::CtError;
use crate::netlink::{self, OwnedMessage};
use crate::netlink::socket::{NetlinkTransport, RecvError};

// Large enough for one kernel dump datagram.
const RECV_BUF_SIZE: usize = 32 * 1024;

/// A connection owning the request/reply framing conventions: sequence
/// number assignment, port id stamping, and blocking receive.
pub struct NetlinkConn {
    transport: Arc<dyn NetlinkTransport>,
    seq: AtomicU32,
}

impl NetlinkConn {
    pub fn new(transport: Arc<dyn NetlinkTransport>) -> Self {
        Self {
            transport,
            seq: AtomicU32::new(0),
        }
    }

    /// Send one request. A zero sequence number or port id in the header
    /// is filled in before transmission; the message as sent is returned
    /// for correlation with replies.
    pub fn send(&self, mut msg: OwnedMessage) -> Result<OwnedMessage, CtError> {
        if msg.header.seq == 0 {
            msg.header.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if msg.header.pid == 0 {
            msg.header.pid = self.transport.pid();
        }
        msg.header.len = (netlink::NLMSG_HDRLEN + msg.data.len()) as u32;

        let bytes = netlink::serialize(&msg);
        self.transport.send(&bytes).map_err(CtError::Request)?;
        Ok(msg)
    }

    /// Block until at least one message arrives or the socket is closed.
    pub fn receive(&self) -> Result<Vec<OwnedMessage>, CtError> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let batch = self.transport.receive_into(&mut buf);
            match batch.error {
                Some(RecvError::WouldBlock) => {
                    if batch.messages.is_empty() {
                        continue;
                    }
                }
                Some(RecvError::Closed) => return Err(CtError::SocketClosed),
                Some(RecvError::NoBufferSpace) => {
                    return Err(CtError::Socket(std::io::Error::from_raw_os_error(
                        libc::ENOBUFS,
                    )));
                }
                Some(RecvError::Other(e)) => return Err(CtError::Socket(e)),
                None => {}
            }
            if batch.messages.is_empty() {
                continue;
            }
            return Ok(batch
                .messages
                .iter()
                .map(|m| OwnedMessage {
                    header: m.header,
                    data: buf[m.payload.clone()].to_vec(),
                })
                .collect());
        }
    }

    pub fn join_group(&self, group: u32) -> Result<(), CtError> {
        self.transport.join_group(group).map_err(CtError::Socket)
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
