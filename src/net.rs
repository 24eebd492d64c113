//! The view of the local network the mapping orchestrator works from.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::trace;

use crate::defaults;
use crate::nat_pmp::protocol;

/// Errors answering a public-address query.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// No default gateway is known.
    #[error("no gateway found")]
    NoGateway,
    /// Socket bind or send failure.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// No response from the gateway within the deadline.
    #[error("no response from the gateway within the deadline")]
    Timeout,
    /// The gateway response could not be decoded.
    #[error("gateway response malformed: {0}")]
    Decode(String),
    /// The gateway answered an address query with a mapping response.
    #[error("gateway answered an address query with a mapping response")]
    UnexpectedResponse,
}

/// Supplier of the local addressing facts the orchestrator needs.
///
/// The default implementation is [`SystemProbe`]; tests substitute stubs.
#[async_trait]
pub trait NetworkProbe: std::fmt::Debug + Send + Sync {
    /// The private IPv4 addresses assigned to this host.
    async fn private_ips(&self) -> Vec<Ipv4Addr>;

    /// The active default gateway, if one is known.
    async fn gateway_ip(&self) -> Option<Ipv4Addr>;

    /// The public address this host's traffic currently originates from.
    async fn public_ip(&self) -> Result<Ipv4Addr, ProbeError>;
}

/// [`NetworkProbe`] backed by the operating system's interface tables.
///
/// The public address is learned from the gateway itself through the NAT-PMP
/// external-address opcode rather than any third-party service.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn private_ips(&self) -> Vec<Ipv4Addr> {
        let mut ips = Vec::new();
        for iface in default_net::get_interfaces() {
            for net in iface.ipv4 {
                let addr = net.addr;
                if addr.is_private() && !addr.is_loopback() && !addr.is_unspecified() {
                    ips.push(addr);
                }
            }
        }
        trace!("local private addresses: {ips:?}");
        ips
    }

    async fn gateway_ip(&self) -> Option<Ipv4Addr> {
        match default_net::get_default_gateway() {
            Ok(gateway) => match gateway.ip_addr {
                std::net::IpAddr::V4(ip) => Some(ip),
                std::net::IpAddr::V6(_) => {
                    trace!("default gateway is ipv6, ignoring");
                    None
                }
            },
            Err(e) => {
                trace!("no default gateway: {e}");
                None
            }
        }
    }

    async fn public_ip(&self) -> Result<Ipv4Addr, ProbeError> {
        let gateway = self.gateway_ip().await.ok_or(ProbeError::NoGateway)?;
        public_ip_from_gateway(gateway).await
    }
}

/// Asks `gateway` for its external address with the NAT-PMP opcode for it.
async fn public_ip_from_gateway(gateway: Ipv4Addr) -> Result<Ipv4Addr, ProbeError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((gateway, protocol::SERVER_PORT)).await?;
    socket
        .send(&protocol::Request::ExternalAddress.encode())
        .await?;

    let mut buffer = vec![0u8; protocol::Response::MAX_SIZE];
    let read = time::timeout(defaults::PMP_RECV_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    let response = protocol::Response::decode(&buffer[..read])
        .map_err(|err| ProbeError::Decode(err.to_string()))?;
    match response {
        protocol::Response::PublicAddress { public_ip, .. } => Ok(public_ip),
        protocol::Response::PortMap { .. } => Err(ProbeError::UnexpectedResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_probe_reports_private_addresses_only() {
        let probe = SystemProbe;
        for ip in probe.private_ips().await {
            assert!(ip.is_private(), "{ip} leaked out of the private set");
        }
    }
}
