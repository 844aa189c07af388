use std::{collections::HashSet, net::Ipv4Addr};

use tracing::{debug, warn};

/// Enumerates the IPv4 addresses of every local interface.
///
/// Heartbeats whose source address appears in this set were multicast by
/// this host and must not be treated as foreign.
pub fn host_ipv4_addrs() -> HashSet<Ipv4Addr> {
    let mut addrs = HashSet::new();

    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            warn!(e = %std::io::Error::last_os_error(), "getifaddrs failed");
            return addrs;
        }

        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() && i32::from((*ifa.ifa_addr).sa_family) == libc::AF_INET {
                let sin = &*ifa.ifa_addr.cast::<libc::sockaddr_in>();
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                debug!(%ip, "registering host interface");
                addrs.insert(ip);
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(ifap);
    }

    addrs
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_is_a_host_address() {
        let addrs = host_ipv4_addrs();
        assert!(addrs.contains(&Ipv4Addr::LOCALHOST));
    }
}
