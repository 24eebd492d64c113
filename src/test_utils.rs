//! Stub adapters and probes for exercising the orchestration layers.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::mapping::{MappingRecord, Protocol};
use crate::net::{NetworkProbe, ProbeError};

/// A [`NetworkProbe`] reporting a fixed LAN and a settable public address.
#[derive(Debug)]
pub(crate) struct StubProbe {
    privates: Vec<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    public: Mutex<Ipv4Addr>,
}

impl StubProbe {
    pub fn new() -> Self {
        StubProbe {
            privates: vec![Ipv4Addr::new(192, 168, 1, 20)],
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            public: Mutex::new(Ipv4Addr::new(1, 2, 3, 4)),
        }
    }

    pub fn with_privates(mut self, privates: Vec<Ipv4Addr>) -> Self {
        self.privates = privates;
        self
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn without_gateway(mut self) -> Self {
        self.gateway = None;
        self
    }

    pub fn current_public(&self) -> Ipv4Addr {
        *self.public.lock()
    }

    pub fn set_public(&self, ip: Ipv4Addr) {
        *self.public.lock() = ip;
    }
}

#[async_trait]
impl NetworkProbe for StubProbe {
    async fn private_ips(&self) -> Vec<Ipv4Addr> {
        self.privates.clone()
    }

    async fn gateway_ip(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    async fn public_ip(&self) -> Result<Ipv4Addr, ProbeError> {
        Ok(self.current_public())
    }
}

type CreateFn =
    dyn Fn(Ipv4Addr, &MappingIntent) -> Result<MappingRecord, AdapterError> + Send + Sync;

/// An [`Adapter`] with scripted behavior that records every call.
pub(crate) struct StubAdapter {
    protocol: Protocol,
    probe_available: bool,
    probe_calls: AtomicUsize,
    /// Every `create_mapping` call, with the candidate it was aimed at.
    pub created: Mutex<Vec<(Ipv4Addr, MappingIntent)>>,
    /// Every record handed to `delete_mapping`.
    pub deleted: Mutex<Vec<MappingRecord>>,
    create: Box<CreateFn>,
    delete_ok: bool,
    self_discovering: bool,
}

impl std::fmt::Debug for StubAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubAdapter")
            .field("protocol", &self.protocol)
            .field("probe_available", &self.probe_available)
            .finish_non_exhaustive()
    }
}

impl StubAdapter {
    pub fn new(
        protocol: Protocol,
        create: impl Fn(Ipv4Addr, &MappingIntent) -> Result<MappingRecord, AdapterError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        StubAdapter {
            protocol,
            probe_available: true,
            probe_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            create: Box::new(create),
            delete_ok: true,
            self_discovering: false,
        }
    }

    /// An adapter whose probe succeeds but every attempt times out.
    pub fn failing(protocol: Protocol) -> Self {
        Self::new(protocol, |_, _| Err(AdapterError::Timeout))
    }

    /// An adapter whose probe reports the protocol as unusable.
    pub fn unavailable(protocol: Protocol) -> Self {
        let mut stub = Self::failing(protocol);
        stub.probe_available = false;
        stub
    }

    pub fn with_failing_delete(mut self) -> Self {
        self.delete_ok = false;
        self
    }

    pub fn with_self_discovery(mut self) -> Self {
        self.self_discovering = true;
        self
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn self_discovering(&self) -> bool {
        self.self_discovering
    }

    async fn probe(&self) -> bool {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.probe_available
    }

    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        intent: MappingIntent,
    ) -> Result<MappingRecord, AdapterError> {
        self.created.lock().push((router_ip, intent.clone()));
        (self.create)(router_ip, &intent)
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        self.deleted.lock().push(record.clone());
        if self.delete_ok {
            Ok(())
        } else {
            Err(AdapterError::Gateway("scripted delete failure".into()))
        }
    }
}

/// Builds the record a cooperative gateway would grant for `intent`.
///
/// The granted lease is `max_grant` capped at what went on the wire, so a
/// `max_grant` of `u32::MAX` grants the full request and a small value
/// models a lease-shortening gateway.
pub(crate) fn granted(
    protocol: Protocol,
    router_ip: Ipv4Addr,
    intent: &MappingIntent,
    external_ip: Ipv4Addr,
    max_grant: u32,
) -> MappingRecord {
    let wire = crate::defaults::wire_lifetime(intent.lifetime_seconds);
    MappingRecord {
        protocol,
        internal_port: intent.internal_port,
        external_port: if intent.external_port == 0 {
            40000
        } else {
            intent.external_port
        },
        internal_ip: Ipv4Addr::new(192, 168, 1, 20),
        external_ip: Some(external_ip),
        router_ip,
        lifetime: max_grant.min(wire),
        requested_lifetime: intent.lifetime_seconds,
        nonce: (protocol == Protocol::Pcp).then(|| *b"stub-nonce!!"),
        error_info: None,
    }
}
