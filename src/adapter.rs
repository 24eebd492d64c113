//! The contract every NAT-protocol implementation satisfies.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use async_trait::async_trait;

use crate::mapping::{MappingRecord, Protocol};

/// One mapping request, as handed to an adapter by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingIntent {
    /// Port the mapped traffic should be delivered to on this host.
    pub internal_port: NonZeroU16,
    /// Requested external port. Zero asks the gateway for any free port.
    pub external_port: u16,
    /// Requested lease in seconds. Zero asks for an indefinite mapping; the
    /// adapter normalizes it for wires where zero means deletion.
    pub lifetime_seconds: u32,
}

/// Errors surfaced by an adapter attempt.
///
/// Adapters return these instead of panicking through the dispatcher; the
/// dispatcher reacts to every variant the same way, by advancing to the next
/// candidate.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// No response within the protocol deadline.
    #[error("no response within the protocol deadline")]
    Timeout,
    /// Socket bind or send failure. Treated like a timeout by the dispatcher.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// Malformed or negative-result protocol response.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The gateway could not be located or refused the operation.
    #[error("gateway: {0}")]
    Gateway(String),
    /// The protocol probe failed; the adapter is unusable on this network.
    #[error("protocol unsupported on this network")]
    Unsupported,
    /// No private address shares a prefix with the candidate router.
    #[error("no private address matches router {router}")]
    NoMatchingLocalIp {
        /// The candidate that had to be skipped.
        router: Ipv4Addr,
    },
    /// The dispatcher ran out of router candidates before any answered.
    #[error("no router candidate answered")]
    NoCandidates,
}

/// A NAT-protocol implementation the manager can drive.
///
/// Implementations perform one attempt against one candidate gateway per
/// [`create_mapping`][Adapter::create_mapping] call; fan-out across candidates
/// and retry policy belong to the dispatcher.
#[async_trait]
pub trait Adapter: std::fmt::Debug + Send + Sync {
    /// The protocol this adapter speaks.
    fn protocol(&self) -> Protocol;

    /// Whether the adapter locates its own gateway (e.g. by SSDP) instead of
    /// taking router candidates from the dispatcher.
    fn self_discovering(&self) -> bool {
        false
    }

    /// Attempts a throwaway mapping on the protocol's probe port to decide
    /// whether the protocol is usable on this network.
    async fn probe(&self) -> bool;

    /// Performs one mapping attempt against one candidate gateway.
    ///
    /// On success the returned record carries the granted external identity,
    /// the granted lease and the private address that was advertised, chosen
    /// by longest-prefix match against `router_ip`.
    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        intent: MappingIntent,
    ) -> Result<MappingRecord, AdapterError>;

    /// Removes a previously created mapping.
    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError>;
}
