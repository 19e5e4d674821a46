use std::net::{IpAddr, Ipv4Addr};

use anyhow::bail;
use systemstat::{Platform, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs to stdout. `RUST_LOG` overrides the default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Asks `local_ip_address` for the address of the default route first. When
/// that is not usable, iterates over all interfaces provided by `systemstat`,
/// skipping loopback, link-local and broadcast addresses.
pub fn select_host_address() -> anyhow::Result<IpAddr> {
    if let Ok(IpAddr::V4(v)) = local_ip_address::local_ip() {
        if is_shareable(v) {
            return Ok(IpAddr::V4(v));
        }
    }

    let system = System::new();
    let networks = system.networks()?;

    for (name, net) in &networks {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if is_shareable(v) {
                    info!("Using interface {} / {}", name, v);
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    bail!("Found no usable network interface")
}

fn is_shareable(v: Ipv4Addr) -> bool {
    !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() && !v.is_unspecified()
}

/// Cancels `token` on Ctrl-C.
pub fn shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => {
                    warn!("Could not listen for Ctrl-C: {}", e);
                    return;
                }
            },
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_not_shareable() {
        assert!(!is_shareable(Ipv4Addr::LOCALHOST));
        assert!(!is_shareable(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_shareable(Ipv4Addr::UNSPECIFIED));
        assert!(is_shareable(Ipv4Addr::new(192, 168, 1, 20)));
    }
}
