// Network namespace handles and scoped entry.
//
// Namespaces are discovered by scanning the numeric PID directories under
// the configured proc root and deduplicating on the identity of each
// process's net namespace file. Entry uses setns(2) on the calling thread
// with drop-guard restoration, so the previous namespace is re-entered on
// every exit path, panics included.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use crate::error::CtError;

/// An open handle to a network namespace.
#[derive(Debug)]
pub struct NsHandle {
    fd: OwnedFd,
}

impl NsHandle {
    /// Open a namespace file such as `/proc/1/ns/net`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        Ok(Self { fd: file.into() })
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Namespace identity as a (device, inode) pair.
    pub fn ids(&self) -> io::Result<(u64, u64)> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd.as_raw_fd(), &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((st.st_dev, st.st_ino))
    }

    /// True when both handles refer to the same namespace. Unreadable
    /// handles compare unequal.
    pub fn same_ns(&self, other: &NsHandle) -> bool {
        match (self.ids(), other.ids()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Namespace operations consumed by the consumer.
///
/// The default implementation is backed by a proc filesystem; tests swap in
/// a fake that runs closures in place.
pub trait Namespaces: Send + Sync {
    /// Handle to the root network namespace.
    fn root(&self) -> Result<NsHandle, CtError>;

    /// Handles to every distinct network namespace with a live process.
    fn list(&self) -> Result<Vec<NsHandle>, CtError>;

    /// Run `f` with the calling thread switched into `ns`, restoring the
    /// previous namespace afterwards.
    fn enter(
        &self,
        ns: &NsHandle,
        f: &mut dyn FnMut() -> Result<(), CtError>,
    ) -> Result<(), CtError>;
}

/// Proc-backed namespace discovery and entry.
pub struct ProcNamespaces {
    proc_root: PathBuf,
}

impl ProcNamespaces {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Namespaces for ProcNamespaces {
    fn root(&self) -> Result<NsHandle, CtError> {
        NsHandle::open(&self.proc_root.join("1/ns/net")).map_err(CtError::Namespace)
    }

    fn list(&self) -> Result<Vec<NsHandle>, CtError> {
        list_net_namespaces(&self.proc_root).map_err(CtError::Namespace)
    }

    fn enter(
        &self,
        ns: &NsHandle,
        f: &mut dyn FnMut() -> Result<(), CtError>,
    ) -> Result<(), CtError> {
        let prev = NsHandle::open(&self.proc_root.join("thread-self/ns/net"))
            .map_err(CtError::Namespace)?;
        // Already there; switching would only cost a capability check.
        if prev.same_ns(ns) {
            return f();
        }
        set_net_ns(ns).map_err(CtError::Namespace)?;
        let _restore = RestoreNs { prev };
        f()
    }
}

/// Restores the saved namespace when dropped.
struct RestoreNs {
    prev: NsHandle,
}

impl Drop for RestoreNs {
    fn drop(&mut self) {
        if let Err(e) = set_net_ns(&self.prev) {
            log::error!("failed to restore network namespace: {e}");
        }
    }
}

fn set_net_ns(ns: &NsHandle) -> io::Result<()> {
    if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Scan `<proc_root>/<pid>/ns/net` for every numeric PID directory,
/// returning one handle per distinct namespace.
fn list_net_namespaces(proc_root: &Path) -> io::Result<Vec<NsHandle>> {
    let mut seen = std::collections::HashSet::new();
    let mut handles = Vec::new();

    for entry in fs::read_dir(proc_root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        if name.to_string_lossy().parse::<u32>().is_err() {
            continue;
        }

        // Processes exit while we scan; open failures are expected.
        let handle = match NsHandle::open(&entry.path().join("ns/net")) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let ids = match handle.ids() {
            Ok(ids) => ids,
            Err(_) => continue,
        };
        if seen.insert(ids) {
            handles.push(handle);
        }
    }

    Ok(handles)
}
