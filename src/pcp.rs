//! PCP adapter, see [RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887).

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace};

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::chooser;
use crate::defaults;
use crate::mapping::{MappingRecord, Protocol};
use crate::net::NetworkProbe;

pub(crate) mod protocol;

/// Port mapping over PCP.
///
/// Every mapping is tagged with a fresh 12-byte nonce; the nonce is stored on
/// the record and sent verbatim in the deletion request.
#[derive(Debug)]
pub struct PcpAdapter {
    probe: Arc<dyn NetworkProbe>,
}

impl PcpAdapter {
    pub fn new(probe: Arc<dyn NetworkProbe>) -> Self {
        PcpAdapter { probe }
    }

    /// Sends `request` to `router` on a fresh socket and decodes the answer.
    async fn exchange(
        &self,
        local_ip: Ipv4Addr,
        router: Ipv4Addr,
        request: protocol::MapRequest,
    ) -> Result<Result<protocol::MapResponse, protocol::Error>, AdapterError> {
        let socket = UdpSocket::bind((local_ip, 0)).await?;
        socket.connect((router, protocol::SERVER_PORT)).await?;
        socket.send(&request.encode()).await?;

        let mut buffer = vec![0u8; protocol::MapResponse::MAX_SIZE];
        let read = time::timeout(defaults::PCP_RECV_TIMEOUT, socket.recv(&mut buffer))
            .await
            .map_err(|_| AdapterError::Timeout)??;
        Ok(protocol::MapResponse::decode(&buffer[..read]))
    }
}

#[async_trait]
impl Adapter for PcpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Pcp
    }

    async fn probe(&self) -> bool {
        let Some(gateway) = self.probe.gateway_ip().await else {
            debug!("pcp probe skipped, no gateway");
            return false;
        };
        let intent = MappingIntent {
            internal_port: defaults::PCP_PROBE_PORT,
            external_port: defaults::PCP_PROBE_PORT.get(),
            lifetime_seconds: defaults::PROBE_MAPPING_LIFETIME,
        };
        match self.create_mapping(gateway, intent).await {
            Ok(record) => {
                if let Err(err) = self.delete_mapping(&record).await {
                    trace!("failed to release pcp probe mapping: {err}");
                }
                true
            }
            Err(err) => {
                debug!("pcp probe failed: {err}");
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

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let wire_lifetime = defaults::wire_lifetime(intent.lifetime_seconds);
        let request = protocol::MapRequest {
            lifetime_seconds: wire_lifetime,
            client_ip: local_ip,
            nonce,
            local_port: intent.internal_port.get(),
            external_port: intent.external_port,
            external_address: None,
        };

        let response = self
            .exchange(local_ip, router_ip, request)
            .await?
            .map_err(|err| AdapterError::Protocol(err.to_string()))?;

        if response.nonce != nonce {
            return Err(AdapterError::Protocol(
                "response nonce does not match the request".into(),
            ));
        }
        if response.local_port != intent.internal_port.get() {
            return Err(AdapterError::Protocol(
                "mapping response is for another internal port".into(),
            ));
        }
        if response.external_port == 0 {
            return Err(AdapterError::Protocol(
                "gateway granted a zero external port".into(),
            ));
        }
        if response.lifetime_seconds == 0 {
            return Err(AdapterError::Protocol(
                "gateway granted a zero lifetime".into(),
            ));
        }
        let external_ip = response
            .external_address
            .to_ipv4_mapped()
            .ok_or_else(|| AdapterError::Protocol("external address is not ipv4".into()))?;

        // leases never exceed what was asked for
        let lifetime = response.lifetime_seconds.min(wire_lifetime);

        let error_info = (intent.external_port != 0
            && response.external_port != intent.external_port)
            .then(|| {
                format!(
                    "external port {} was taken, gateway granted {}",
                    intent.external_port, response.external_port
                )
            });

        Ok(MappingRecord {
            protocol: Protocol::Pcp,
            internal_port: intent.internal_port,
            external_port: response.external_port,
            internal_ip: local_ip,
            external_ip: Some(external_ip),
            router_ip,
            lifetime,
            requested_lifetime: intent.lifetime_seconds,
            nonce: Some(nonce),
            error_info,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        let Some(nonce) = record.nonce else {
            return Err(AdapterError::Protocol(
                "record carries no mapping nonce".into(),
            ));
        };

        // deletion is a MAP request with zero lifetime and the original nonce
        let request = protocol::MapRequest {
            lifetime_seconds: 0,
            client_ip: record.internal_ip,
            nonce,
            local_port: record.internal_port.get(),
            external_port: 0,
            external_address: None,
        };
        let response = self
            .exchange(record.internal_ip, record.router_ip, request)
            .await?;
        match response {
            Ok(_) => Ok(()),
            // the resource no longer exists, which is what deletion wanted
            Err(protocol::Error::Failure(protocol::ErrorCode::NoResources)) => Ok(()),
            Err(err) => Err(AdapterError::Protocol(err.to_string())),
        }
    }
}
