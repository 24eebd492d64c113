//! The unit of state tracked for every established port mapping.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

/// Protocol that established a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Protocol {
    /// NAT Port Mapping Protocol (RFC 6886).
    #[display("NAT-PMP")]
    NatPmp,
    /// Port Control Protocol (RFC 6887).
    #[display("PCP")]
    Pcp,
    /// UPnP Internet Gateway Device.
    #[display("UPnP")]
    Upnp,
}

/// A port mapping granted by a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    /// Protocol that established the mapping.
    pub protocol: Protocol,
    /// Port the mapped traffic is delivered to on this host.
    pub internal_port: NonZeroU16,
    /// Port the mapping is reachable at from the outside.
    pub external_port: u16,
    /// Private address advertised to the gateway, chosen by longest-prefix
    /// match against the router address.
    pub internal_ip: Ipv4Addr,
    /// External address of the mapping, when the protocol reveals it.
    pub external_ip: Option<Ipv4Addr>,
    /// The gateway that granted the mapping.
    pub router_ip: Ipv4Addr,
    /// Lease actually granted by the gateway, in seconds. Gateways may grant
    /// less than what was asked for.
    pub lifetime: u32,
    /// Lease the caller asked for, in seconds. Zero means indefinite.
    pub requested_lifetime: u32,
    /// Mapping nonce, present on PCP mappings and required to delete them.
    pub nonce: Option<[u8; 12]>,
    /// Diagnostic note when the gateway degraded the request, e.g. granted a
    /// different external port than the one asked for.
    pub error_info: Option<String>,
}

impl MappingRecord {
    /// The external identity this record is registered under.
    ///
    /// `None` when the mapping is not established: either no external address
    /// is known or the external port is the zero sentinel.
    pub fn key(&self) -> Option<MappingKey> {
        let external_ip = self.external_ip?;
        if self.external_port == 0 {
            return None;
        }
        Some(MappingKey {
            external_ip,
            external_port: self.external_port,
        })
    }
}

/// Identity of an active mapping: the pair the outside world sees.
///
/// Keying by external identity rather than internal port lets a stale entry be
/// replaced without collision when the host moves to another network and comes
/// back with a different public address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{external_ip}:{external_port}")]
pub struct MappingKey {
    /// Public address of the mapping.
    pub external_ip: Ipv4Addr,
    /// Public port of the mapping.
    pub external_port: u16,
}
