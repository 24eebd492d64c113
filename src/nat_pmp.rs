//! NAT-PMP adapter, see [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886).

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace};

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::chooser;
use crate::defaults;
use crate::mapping::{MappingRecord, Protocol};
use crate::net::NetworkProbe;

pub(crate) mod protocol;

/// Port mapping over NAT-PMP.
///
/// The gateway does not reveal the external address in the mapping response;
/// it is learned through the separate external-address opcode against the same
/// gateway.
#[derive(Debug)]
pub struct NatPmpAdapter {
    probe: Arc<dyn NetworkProbe>,
}

impl NatPmpAdapter {
    pub fn new(probe: Arc<dyn NetworkProbe>) -> Self {
        NatPmpAdapter { probe }
    }

    /// One request/response exchange with `router`, on a fresh socket.
    async fn exchange(
        &self,
        local_ip: Ipv4Addr,
        router: Ipv4Addr,
        request: protocol::Request,
    ) -> Result<protocol::Response, AdapterError> {
        let socket = UdpSocket::bind((local_ip, 0)).await?;
        socket.connect((router, protocol::SERVER_PORT)).await?;
        socket.send(&request.encode()).await?;

        let mut buffer = vec![0u8; protocol::Response::MAX_SIZE];
        let read = time::timeout(defaults::PMP_RECV_TIMEOUT, socket.recv(&mut buffer))
            .await
            .map_err(|_| AdapterError::Timeout)??;
        protocol::Response::decode(&buffer[..read])
            .map_err(|err| AdapterError::Protocol(err.to_string()))
    }
}

#[async_trait]
impl Adapter for NatPmpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::NatPmp
    }

    async fn probe(&self) -> bool {
        let Some(gateway) = self.probe.gateway_ip().await else {
            debug!("pmp probe skipped, no gateway");
            return false;
        };
        let intent = MappingIntent {
            internal_port: defaults::PMP_PROBE_PORT,
            external_port: defaults::PMP_PROBE_PORT.get(),
            lifetime_seconds: defaults::PROBE_MAPPING_LIFETIME,
        };
        match self.create_mapping(gateway, intent).await {
            Ok(record) => {
                if let Err(err) = self.delete_mapping(&record).await {
                    trace!("failed to release pmp probe mapping: {err}");
                }
                true
            }
            Err(err) => {
                debug!("pmp probe failed: {err}");
                false
            }
        }
    }

    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        intent: MappingIntent,
    ) -> Result<MappingRecord, AdapterError> {
        let privates = self.probe.private_ips().await;
        let local_ip = chooser::closest(&privates, router_ip)
            .ok_or(AdapterError::NoMatchingLocalIp { router: router_ip })?;

        let wire_lifetime = defaults::wire_lifetime(intent.lifetime_seconds);
        let request = protocol::Request::Mapping {
            local_port: intent.internal_port.get(),
            external_port: intent.external_port,
            lifetime_seconds: wire_lifetime,
        };
        let response = self.exchange(local_ip, router_ip, request).await?;

        let protocol::Response::PortMap {
            private_port,
            external_port,
            lifetime_seconds,
            ..
        } = response
        else {
            return Err(AdapterError::Protocol(
                "expected a mapping response".into(),
            ));
        };

        if private_port != intent.internal_port.get() {
            return Err(AdapterError::Protocol(
                "mapping response is for another internal port".into(),
            ));
        }
        if external_port == 0 {
            return Err(AdapterError::Protocol(
                "gateway granted a zero external port".into(),
            ));
        }
        if lifetime_seconds == 0 {
            return Err(AdapterError::Protocol(
                "gateway granted a zero lifetime".into(),
            ));
        }

        // leases never exceed what was asked for
        let lifetime = lifetime_seconds.min(wire_lifetime);

        let response = self
            .exchange(local_ip, router_ip, protocol::Request::ExternalAddress)
            .await?;
        let protocol::Response::PublicAddress { public_ip, .. } = response else {
            return Err(AdapterError::Protocol(
                "expected an external address response".into(),
            ));
        };

        let error_info = (intent.external_port != 0 && external_port != intent.external_port)
            .then(|| {
                format!(
                    "external port {} was taken, gateway granted {external_port}",
                    intent.external_port
                )
            });

        Ok(MappingRecord {
            protocol: Protocol::NatPmp,
            internal_port: intent.internal_port,
            external_port,
            internal_ip: local_ip,
            external_ip: Some(public_ip),
            router_ip,
            lifetime,
            requested_lifetime: intent.lifetime_seconds,
            nonce: None,
            error_info,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        // deletion is a mapping request with zero external port and lifetime
        let request = protocol::Request::Mapping {
            local_port: record.internal_port.get(),
            external_port: 0,
            lifetime_seconds: 0,
        };
        let response = self
            .exchange(record.internal_ip, record.router_ip, request)
            .await?;
        match response {
            protocol::Response::PortMap { .. } => Ok(()),
            protocol::Response::PublicAddress { .. } => Err(AdapterError::Protocol(
                "expected a mapping response".into(),
            )),
        }
    }
}
