use crate::error::CtError;
use crate::netlink::socket::{NetlinkSocket, NetlinkTransport};

/// Check that we can open conntrack netlink sockets.
///
/// Three outcomes:
/// - UID 0 (root): pass immediately.
/// - Non-root with CAP_NET_ADMIN (probed by opening a netfilter socket):
///   pass with a warning that the forced buffer enlargement may fail.
/// - Neither: return `InsufficientPermission` with guidance.
pub fn check_netlink_access() -> Result<(), CtError> {
    // Root always has access.
    if unsafe { libc::getuid() } == 0 {
        return Ok(());
    }

    match NetlinkSocket::open(libc::NETLINK_NETFILTER) {
        Ok(socket) => {
            socket.close();
            log::warn!(
                "Running without root: receive buffer enlargement and namespace \
                 discovery may be limited. For full functionality, run with: sudo ctstream"
            );
            Ok(())
        }
        Err(_) => Err(CtError::InsufficientPermission(
            "ctstream requires CAP_NET_ADMIN for conntrack netlink sockets. Either:\n  \
             1. Run with sudo: sudo ctstream\n  \
             2. Grant the capability: sudo setcap cap_net_admin+ep $(command -v ctstream)"
                .to_string(),
        )),
    }
}
