//! Default values used in [`portmap`][`crate`].

use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use std::time::Duration;

/// Timeout for a NAT-PMP request/response exchange.
pub const PMP_RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for a PCP request/response exchange.
pub const PCP_RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum duration of the SSDP search for a UPnP gateway.
pub const SSDP_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for each individual SOAP exchange with a UPnP gateway.
pub const SOAP_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Throwaway port used to probe for NAT-PMP support.
pub const PMP_PROBE_PORT: NonZeroU16 = match NonZeroU16::new(55555) {
    Some(port) => port,
    None => unreachable!(),
};

/// Throwaway port used to probe for PCP support.
pub const PCP_PROBE_PORT: NonZeroU16 = match NonZeroU16::new(55556) {
    Some(port) => port,
    None => unreachable!(),
};

/// Throwaway port used to probe for UPnP support.
pub const UPNP_PROBE_PORT: NonZeroU16 = match NonZeroU16::new(55557) {
    Some(port) => port,
    None => unreachable!(),
};

/// Lifetime requested for probe mappings, in seconds. Probes are deleted right
/// after they succeed, the lifetime only bounds the damage if that fails.
pub const PROBE_MAPPING_LIFETIME: u32 = 10;

/// Lease requested on the PMP/PCP wire when the caller asked for an indefinite
/// mapping. Zero means deletion in both protocols, so the renewal layer
/// requests a day at a time instead and re-requests forever.
pub const INDEFINITE_WIRE_LIFETIME: u32 = 86_400;

/// How often an indefinite mapping is re-requested.
pub const PERPETUAL_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Period of the automatic public-address sweep.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(600);

/// Returns the lease to put on the PMP/PCP wire for a requested lifetime.
pub fn wire_lifetime(requested: u32) -> u32 {
    if requested == 0 {
        INDEFINITE_WIRE_LIFETIME
    } else {
        requested
    }
}

/// Gateway addresses commonly used by residential routers.
///
/// These are probed when neither the router cache nor the local interfaces
/// point at a responding gateway. The list is part of the crate's interface:
/// callers can rely on these being tried, in this order, in the fallback wave.
pub const SEED_ROUTERS: [Ipv4Addr; 21] = [
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 2),
    Ipv4Addr::new(10, 0, 0, 138),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(10, 10, 1, 1),
    Ipv4Addr::new(10, 90, 90, 90),
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 0, 10),
    Ipv4Addr::new(192, 168, 0, 100),
    Ipv4Addr::new(192, 168, 0, 254),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 2, 254),
    Ipv4Addr::new(192, 168, 8, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(192, 168, 178, 1),
];
