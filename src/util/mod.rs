use std::net::IpAddr;

use anyhow::{anyhow, Result};
use systemstat::{Platform, System};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Prefers the address of the default route as reported by
/// `local-ip-address`. Falls back to the first interface from `systemstat`
/// that is neither loopback, link-local nor broadcast.
///
/// ## Errors
///
/// Fails if the host exposes no usable IPv4 address.
pub fn select_host_address() -> Result<IpAddr> {
    if let Ok(ip) = local_ip_address::local_ip() {
        if is_shareable(ip) {
            info!("Using default route address {}", ip);
            return Ok(ip);
        }
    }

    let system = System::new();
    let networks = system.networks()?;

    for (name, net) in networks.iter() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                let ip = IpAddr::V4(v);
                if is_shareable(ip) {
                    debug!("iface: {} / {:?}", name, ip);
                    return Ok(ip);
                }
            }
        }
    }

    Err(anyhow!("Found no usable network interface"))
}

fn is_shareable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v) => !v.is_loopback() && !v.is_link_local() && !v.is_broadcast(),
        IpAddr::V6(_) => false,
    }
}
