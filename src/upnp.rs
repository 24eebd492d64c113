//! UPnP IGD adapter.
//!
//! SSDP discovery, device-XML retrieval and the SOAP control calls are the
//! `igd` crate's concern; this adapter supplies the deadlines, the port and
//! lease arguments, and the interpretation of gateway errors.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use igd::aio as aigd;
use tokio::time;
use tracing::{debug, trace};

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::chooser;
use crate::defaults;
use crate::mapping::{MappingRecord, Protocol};
use crate::net::NetworkProbe;

/// Description attached to mappings, visible in router admin pages.
const PORT_MAPPING_DESCRIPTION: &str = "portmap";

/// Port mapping over UPnP IGD.
///
/// The gateway is located by SSDP search rather than by candidate fan-out and
/// cached for the adapter's lifetime. A requested lifetime of zero is the
/// protocol's permanent static mapping and is passed through untouched.
#[derive(derive_more::Debug)]
pub struct UpnpAdapter {
    probe: Arc<dyn NetworkProbe>,
    #[debug("_")]
    gateway: tokio::sync::Mutex<Option<aigd::Gateway>>,
}

impl UpnpAdapter {
    pub fn new(probe: Arc<dyn NetworkProbe>) -> Self {
        UpnpAdapter {
            probe,
            gateway: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the cached gateway, searching for one on the first call.
    async fn gateway(&self) -> Result<aigd::Gateway, AdapterError> {
        let mut slot = self.gateway.lock().await;
        if let Some(gateway) = slot.as_ref() {
            return Ok(gateway.clone());
        }
        let gateway = aigd::search_gateway(igd::SearchOptions {
            timeout: Some(defaults::SSDP_SEARCH_TIMEOUT),
            ..Default::default()
        })
        .await
        .map_err(|err| AdapterError::Gateway(err.to_string()))?;
        trace!("found upnp gateway at {}", gateway.addr);
        *slot = Some(gateway.clone());
        Ok(gateway)
    }
}

#[async_trait]
impl Adapter for UpnpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Upnp
    }

    fn self_discovering(&self) -> bool {
        true
    }

    async fn probe(&self) -> bool {
        let Ok(gateway) = self.gateway().await else {
            debug!("upnp probe failed, no gateway answered the search");
            return false;
        };
        let router_ip = *gateway.addr.ip();
        let privates = self.probe.private_ips().await;
        let Some(local_ip) = chooser::closest(&privates, router_ip) else {
            debug!("upnp probe failed, no private address matches {router_ip}");
            return false;
        };

        let probe_port = defaults::UPNP_PROBE_PORT.get();
        let local_addr = SocketAddrV4::new(local_ip, probe_port);
        let added = time::timeout(
            defaults::SOAP_STEP_TIMEOUT,
            gateway.add_port(
                igd::PortMappingProtocol::UDP,
                probe_port,
                local_addr,
                defaults::PROBE_MAPPING_LIFETIME,
                PORT_MAPPING_DESCRIPTION,
            ),
        )
        .await;

        match added {
            Ok(Ok(())) => {
                let removed = time::timeout(
                    defaults::SOAP_STEP_TIMEOUT,
                    gateway.remove_port(igd::PortMappingProtocol::UDP, probe_port),
                )
                .await;
                if !matches!(removed, Ok(Ok(()))) {
                    trace!("failed to release upnp probe mapping");
                }
                true
            }
            // a conflict on the probe port still proves the gateway works
            Ok(Err(igd::AddPortError::PortInUse)) => true,
            Ok(Err(err)) => {
                debug!("upnp probe failed: {err}");
                false
            }
            Err(_) => {
                debug!("upnp probe timed out");
                false
            }
        }
    }

    async fn create_mapping(
        &self,
        _router_hint: Ipv4Addr,
        intent: MappingIntent,
    ) -> Result<MappingRecord, AdapterError> {
        let gateway = self.gateway().await?;
        let router_ip = *gateway.addr.ip();

        let privates = self.probe.private_ips().await;
        let local_ip = chooser::closest(&privates, router_ip)
            .ok_or(AdapterError::NoMatchingLocalIp { router: router_ip })?;
        let local_addr = SocketAddrV4::new(local_ip, intent.internal_port.get());

        let external_ip = time::timeout(defaults::SOAP_STEP_TIMEOUT, gateway.get_external_ip())
            .await
            .map_err(|_| AdapterError::Timeout)?
            .map_err(|err| AdapterError::Gateway(err.to_string()))?;

        // zero is the permanent static lease here, not a deletion
        let lease = intent.lifetime_seconds;

        let (external_port, error_info) = if intent.external_port != 0 {
            let added = time::timeout(
                defaults::SOAP_STEP_TIMEOUT,
                gateway.add_port(
                    igd::PortMappingProtocol::UDP,
                    intent.external_port,
                    local_addr,
                    lease,
                    PORT_MAPPING_DESCRIPTION,
                ),
            )
            .await
            .map_err(|_| AdapterError::Timeout)?;
            match added {
                Ok(()) => (intent.external_port, None),
                Err(igd::AddPortError::PortInUse) => {
                    // requested port is taken; fall back to any free port
                    let port = add_any_port(&gateway, local_addr, lease).await?;
                    let note = format!(
                        "external port {} in use, gateway granted {port}",
                        intent.external_port
                    );
                    (port, Some(note))
                }
                Err(err) => return Err(AdapterError::Gateway(err.to_string())),
            }
        } else {
            (add_any_port(&gateway, local_addr, lease).await?, None)
        };

        Ok(MappingRecord {
            protocol: Protocol::Upnp,
            internal_port: intent.internal_port,
            external_port,
            internal_ip: local_ip,
            external_ip: Some(external_ip),
            router_ip,
            lifetime: lease,
            requested_lifetime: intent.lifetime_seconds,
            nonce: None,
            error_info,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        let gateway = self.gateway().await?;
        let removed = time::timeout(
            defaults::SOAP_STEP_TIMEOUT,
            gateway.remove_port(igd::PortMappingProtocol::UDP, record.external_port),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?;
        match removed {
            Ok(()) => Ok(()),
            // already gone is what deletion wanted
            Err(igd::RemovePortError::NoSuchPortMapping) => Ok(()),
            Err(err) => Err(AdapterError::Gateway(err.to_string())),
        }
    }
}

/// Asks the gateway for any free external port.
async fn add_any_port(
    gateway: &aigd::Gateway,
    local_addr: SocketAddrV4,
    lease: u32,
) -> Result<u16, AdapterError> {
    let port = time::timeout(
        defaults::SOAP_STEP_TIMEOUT,
        gateway.add_any_port(
            igd::PortMappingProtocol::UDP,
            local_addr,
            lease,
            PORT_MAPPING_DESCRIPTION,
        ),
    )
    .await
    .map_err(|_| AdapterError::Timeout)?
    .map_err(|err| AdapterError::Gateway(err.to_string()))?;
    if port == 0 {
        return Err(AdapterError::Gateway(
            "gateway granted a zero external port".into(),
        ));
    }
    Ok(port)
}
