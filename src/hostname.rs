//! Names of volume servers, for zephyr subscriptions.

use std::net::Ipv4Addr;

pub trait HostNames {
    /// The name `addr` resolves back to, `None` when it has none.
    fn host_name(&self, addr: Ipv4Addr) -> Option<String>;
}

/// Reverse lookups through the system resolver.
#[cfg(feature = "openafs")]
#[derive(Debug, Default)]
pub struct SystemHostNames;

#[cfg(feature = "openafs")]
impl HostNames for SystemHostNames {
    fn host_name(&self, addr: Ipv4Addr) -> Option<String> {
        use libc::{c_char, sockaddr, sockaddr_in, socklen_t};
        use std::ffi::CStr;
        use tracing::trace;

        const NI_MAXHOST: usize = 1025;

        // SAFETY: sockaddr_in is plain old data, all zeroes is a valid value.
        let mut sin: sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());

        let mut host = [0 as c_char; NI_MAXHOST];
        // SAFETY: `sin` and `host` outlive the call and their sizes are passed
        // alongside them.
        let rc = unsafe {
            libc::getnameinfo(
                std::ptr::addr_of!(sin).cast::<sockaddr>(),
                std::mem::size_of::<sockaddr_in>() as socklen_t,
                host.as_mut_ptr(),
                NI_MAXHOST as socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            trace!(%addr, rc, "no name for address");
            return None;
        }

        // SAFETY: getnameinfo wrote a NUL terminated name into `host`.
        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }
}

#[cfg(all(test, feature = "openafs"))]
mod tests {
    use super::*;

    #[test]
    fn test_unnamed_address() {
        // TEST-NET-1 is never delegated.
        assert_eq!(SystemHostNames.host_name(Ipv4Addr::new(192, 0, 2, 1)), None);
    }
}
