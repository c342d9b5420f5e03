// Kernel release probe.
//
// Socket filters can read the per-packet PRNG word (SKF_AD_RANDOM) only on
// kernels >= 3.15; older hosts cannot run the sampling filter and the
// consumer falls back to unthrottled reads.

use std::ffi::CStr;
use std::sync::OnceLock;

/// Pack a kernel release into a single comparable code, mirroring the
/// KERNEL_VERSION macro from linux/version.h.
pub fn version_code(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor << 8) | patch.min(255)
}

/// Version code of the running kernel, from uname(2).
///
/// Returns `None` when the release string cannot be parsed.
pub fn host_version() -> Option<u32> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    parse_release(release.to_str().ok()?)
}

/// True when the running kernel predates 3.15 (no SKF_AD_RANDOM support).
pub fn pre_315() -> bool {
    static PRE_315: OnceLock<bool> = OnceLock::new();
    *PRE_315.get_or_init(|| {
        host_version().is_some_and(|v| v < version_code(3, 15, 0))
    })
}

/// Parse a release string like "5.15.0-91-generic" or "6.1.injected".
fn parse_release(release: &str) -> Option<u32> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(version_code(major, minor, patch))
}
