//! Inbound port mappings on consumer gateways.
//!
//! A host behind a residential NAT cannot accept connections until the
//! gateway forwards a port to it. This crate establishes and maintains such
//! forwards over the three protocols deployed in practice — NAT-PMP
//! (RFC 6886), PCP (RFC 6887) and UPnP IGD — and keeps them alive as leases
//! run out or the host roams between networks.
//!
//! The entry point is [`Client`]: a cheap handle to a background service that
//! owns the active-mapping table, dispatches protocol attempts across
//! candidate gateways in two waves (known and derived routers first, the
//! common residential defaults second), renews shortened leases and sweeps
//! for public-address changes.
//!
//! ```no_run
//! use std::num::NonZeroU16;
//! use portmap::{Client, Config};
//!
//! # async fn run() -> Result<(), portmap::Error> {
//! let client = Client::new(Config::default());
//! let port = NonZeroU16::new(4242).expect("non-zero");
//! let mapping = client.add_mapping(port, 4242, 3600).await?;
//! println!("reachable at {:?}:{}", mapping.external_ip, mapping.external_port);
//! # client.close().await;
//! # Ok(())
//! # }
//! ```

mod adapter;
mod chooser;
pub mod defaults;
mod dispatcher;
mod mapping;
mod nat_pmp;
mod net;
mod pcp;
mod registry;
mod service;
mod upnp;
mod util;

#[cfg(test)]
mod test_utils;

pub use adapter::{Adapter, AdapterError, MappingIntent};
pub use mapping::{MappingKey, MappingRecord, Protocol};
pub use nat_pmp::NatPmpAdapter;
pub use net::{NetworkProbe, ProbeError, SystemProbe};
pub use pcp::PcpAdapter;
pub use service::{AdapterKind, Client, Config, Error, Event, ProbeReport};
pub use upnp::UpnpAdapter;
