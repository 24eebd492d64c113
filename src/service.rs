//! Port mapping client and service.
//!
//! The service is a long-running actor owning all mapping state: the
//! active-mapping table, the renewal timers and the periodic public-address
//! sweep. Clients talk to it over a channel; every network operation runs as
//! its own task so that no attempt ever blocks the dispatch of another
//! mapping.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::defaults;
use crate::dispatcher::Dispatcher;
use crate::mapping::{MappingKey, MappingRecord, Protocol};
use crate::nat_pmp::NatPmpAdapter;
use crate::net::{NetworkProbe, ProbeError, SystemProbe};
use crate::pcp::PcpAdapter;
use crate::registry::{ActiveEntry, Registry, Regime, RouterCache};
use crate::upnp::UpnpAdapter;
use crate::util::{AbortOnDropHandle, CancelOnDrop};

/// Capacity of the channel to communicate with the long-running service.
const SERVICE_CHANNEL_CAPACITY: usize = 32; // should be plenty

/// Capacity of the mapping-event channel handed to subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Which protocol adapters the service drives, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// NAT-PMP (RFC 6886).
    NatPmp,
    /// PCP (RFC 6887).
    Pcp,
    /// UPnP IGD.
    Upnp,
}

/// Configures the port mapping service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether the periodic public-address sweep runs.
    pub auto_renew: bool,
    /// Period of the sweep.
    pub renew_interval: Duration,
    /// Adapters to try, in order. The first one whose dispatch succeeds wins.
    pub adapters: Vec<AdapterKind>,
}

impl Default for Config {
    /// NAT-PMP first, UPnP second, sweeping every ten minutes. PCP is opt-in.
    fn default() -> Self {
        Config {
            auto_renew: true,
            renew_interval: defaults::RENEW_INTERVAL,
            adapters: vec![AdapterKind::NatPmp, AdapterKind::Upnp],
        }
    }
}

/// Notifications emitted by the service.
#[derive(Debug, Clone)]
pub enum Event {
    /// A mapping was created or renewed.
    Mapping {
        /// The granted mapping.
        record: MappingRecord,
    },
}

/// Per-protocol availability as reported by the adapter probes.
///
/// `None` means the protocol is not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, derive_more::Display)]
#[display("probe: pmp={pmp:?} pcp={pcp:?} upnp={upnp:?}")]
pub struct ProbeReport {
    /// NAT-PMP availability.
    pub pmp: Option<bool>,
    /// PCP availability.
    pub pcp: Option<bool>,
    /// UPnP availability.
    pub upnp: Option<bool>,
}

/// Errors surfaced by the [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every configured adapter failed; carries the last adapter's error.
    #[error("every adapter failed, last error: {0}")]
    MappingFailed(#[from] AdapterError),
    /// No active mapping is registered under the given external identity.
    #[error("no active mapping for {external_ip}:{external_port}")]
    NotFound {
        /// External address the lookup used.
        external_ip: Ipv4Addr,
        /// External port the lookup used.
        external_port: u16,
    },
    /// The current public address could not be determined.
    #[error("could not determine the public address: {0}")]
    PublicIp(#[from] ProbeError),
    /// The gateway refused or failed to delete a mapping. The local entry is
    /// removed regardless.
    #[error("gateway failed to delete the mapping: {0}")]
    DeleteFailed(AdapterError),
    /// The service has shut down.
    #[error("port mapping service closed")]
    Closed,
}

#[derive(derive_more::Debug)]
enum Message {
    AddMapping {
        internal_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<MappingRecord, Error>>,
    },
    DeleteMapping {
        external_port: NonZeroU16,
        external_ip: Option<Ipv4Addr>,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    ActiveMappings {
        #[debug("_")]
        result_tx: oneshot::Sender<Vec<MappingRecord>>,
    },
    Renew {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Probe {
        #[debug("_")]
        result_tx: oneshot::Sender<ProbeReport>,
    },
    /// A renewal timer fired for the given key.
    RenewDue { key: MappingKey },
    Close {
        #[debug("_")]
        result_tx: oneshot::Sender<()>,
    },
}

/// Where a mapping attempt came from; decides what happens to its outcome.
#[derive(derive_more::Debug)]
enum Origin {
    /// A caller is waiting on the attempt.
    User {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<MappingRecord, Error>>,
    },
    /// A renewal timer fired for this registered mapping.
    Renew { prior: MappingKey },
    /// The sweep evicted this mapping after a public-address change.
    Sweep { prior: MappingKey },
}

/// Outcome of one spawned task, joined by the actor loop.
#[derive(derive_more::Debug)]
enum TaskDone {
    Mapping {
        origin: Origin,
        #[debug("_")]
        outcome: Result<(MappingRecord, usize), Error>,
    },
    DeleteKey {
        external_port: NonZeroU16,
        resolved: Result<Ipv4Addr, Error>,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Deleted {
        outcome: Result<(), AdapterError>,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    SweepIp {
        outcome: Result<Ipv4Addr, ProbeError>,
    },
    Probed { report: ProbeReport },
}

/// Port mapping client.
///
/// Cheap to clone. The background service lives as long as any clone does and
/// is also shut down by [`close`][Client::close].
#[derive(Debug, Clone)]
pub struct Client {
    service_tx: mpsc::Sender<Message>,
    events_tx: broadcast::Sender<Event>,
    _service_handle: Arc<CancelOnDrop>,
}

impl Client {
    /// Creates a client backed by the operating system's view of the network.
    pub fn new(config: Config) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe))
    }

    /// Creates a client with a custom [`NetworkProbe`].
    pub fn with_probe(config: Config, probe: Arc<dyn NetworkProbe>) -> Self {
        let adapters = config
            .adapters
            .iter()
            .map(|kind| match kind {
                AdapterKind::NatPmp => {
                    Arc::new(NatPmpAdapter::new(probe.clone())) as Arc<dyn Adapter>
                }
                AdapterKind::Pcp => Arc::new(PcpAdapter::new(probe.clone())) as Arc<dyn Adapter>,
                AdapterKind::Upnp => Arc::new(UpnpAdapter::new(probe.clone())) as Arc<dyn Adapter>,
            })
            .collect();
        Self::with_adapters(config, probe, adapters)
    }

    /// Creates a client driving the given adapters, in the given priority
    /// order. `config.adapters` is ignored in favor of the explicit list.
    pub fn with_adapters(
        config: Config,
        probe: Arc<dyn NetworkProbe>,
        adapters: Vec<Arc<dyn Adapter>>,
    ) -> Self {
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let service = Service::new(
            config,
            probe,
            adapters,
            service_rx,
            service_tx.clone(),
            events_tx.clone(),
        );
        let handle = CancelOnDrop::new(
            "portmap_service",
            tokio::spawn(service.run().instrument(info_span!("portmap.service"))).abort_handle(),
        );

        Client {
            service_tx,
            events_tx,
            _service_handle: Arc::new(handle),
        }
    }

    /// Establishes a mapping from `external_port` to `internal_port`.
    ///
    /// An `external_port` of zero lets the gateway pick any free port. A
    /// `lifetime_seconds` of zero asks for an indefinite mapping, renewed a
    /// day at a time on protocols without permanent leases.
    pub async fn add_mapping(
        &self,
        internal_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<MappingRecord, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::AddMapping {
                internal_port,
                external_port,
                lifetime_seconds,
                result_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)?
    }

    /// Deletes the mapping registered under `(external_ip, external_port)`.
    ///
    /// Without an explicit `external_ip` the current public address is used.
    /// The local entry is removed even when the gateway cannot be reached;
    /// such failures are still reported.
    pub async fn delete_mapping(
        &self,
        external_port: NonZeroU16,
        external_ip: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::DeleteMapping {
                external_port,
                external_ip,
                result_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)?
    }

    /// Returns a snapshot of the active mappings.
    pub async fn active_mappings(&self) -> Result<Vec<MappingRecord>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::ActiveMappings { result_tx })
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)
    }

    /// Runs a sweep now: compares every active mapping against the current
    /// public address and re-establishes the ones left behind by a network
    /// change. Resolves once evictions and re-mappings have finished.
    pub async fn renew_mappings(&self) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::Renew { result_tx })
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)?
    }

    /// Probes every configured adapter and reports availability.
    ///
    /// Requests arriving while a probe is in flight share its result.
    pub async fn probe_all(&self) -> Result<ProbeReport, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::Probe { result_tx })
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)
    }

    /// Subscribes to mapping events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Cancels all timers and in-flight attempts, deletes every active
    /// mapping in parallel and stops the service.
    pub async fn close(&self) {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::Close { result_tx })
            .await
            .is_ok()
        {
            let _ = result_rx.await;
        }
    }
}

/// The long-running mapping service.
#[derive(Debug)]
struct Service {
    /// Channel over which the service is informed of requests.
    rx: mpsc::Receiver<Message>,
    /// Sender handed to renewal timers so their expiry comes back as a
    /// message.
    msg_tx: mpsc::Sender<Message>,
    probe: Arc<dyn NetworkProbe>,
    /// Adapters in priority order.
    adapters: Vec<Arc<dyn Adapter>>,
    /// Probe verdict per adapter; `None` until first probed. An adapter whose
    /// probe failed is skipped on later calls.
    usable: Arc<Mutex<Vec<Option<bool>>>>,
    dispatcher: Dispatcher,
    registry: Registry,
    /// Every spawned network task; aborted wholesale on shutdown.
    tasks: JoinSet<TaskDone>,
    auto_renew: bool,
    renew_interval: Duration,
    /// Whether a sweep (address query or re-mapping) is in progress.
    sweep_running: bool,
    /// Re-mapping attempts the running sweep still waits for.
    sweep_outstanding: usize,
    sweep_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    probe_waiters: Vec<oneshot::Sender<ProbeReport>>,
    probing: bool,
    events_tx: broadcast::Sender<Event>,
}

impl Service {
    fn new(
        config: Config,
        probe: Arc<dyn NetworkProbe>,
        adapters: Vec<Arc<dyn Adapter>>,
        rx: mpsc::Receiver<Message>,
        msg_tx: mpsc::Sender<Message>,
        events_tx: broadcast::Sender<Event>,
    ) -> Self {
        let usable = Arc::new(Mutex::new(vec![None; adapters.len()]));
        let dispatcher = Dispatcher::new(probe.clone(), RouterCache::default());
        Service {
            rx,
            msg_tx,
            probe,
            adapters,
            usable,
            dispatcher,
            registry: Registry::default(),
            tasks: JoinSet::new(),
            auto_renew: config.auto_renew,
            renew_interval: config.renew_interval,
            sweep_running: false,
            sweep_outstanding: 0,
            sweep_waiters: Vec::new(),
            probe_waiters: Vec::new(),
            probing: false,
            events_tx,
        }
    }

    async fn run(mut self) {
        debug!("port mapping service starting");
        let mut sweep_timer = time::interval_at(
            time::Instant::now() + self.renew_interval,
            self.renew_interval,
        );
        sweep_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(msg) => {
                            if let Some(close_tx) = self.handle_msg(msg) {
                                self.shutdown().await;
                                let _ = close_tx.send(());
                                break;
                            }
                        }
                        None => {
                            debug!("service channel dropped, shutting down");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(task) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match task {
                        Ok(done) => {
                            trace!("tick: task {done:?}");
                            self.on_task_done(done);
                        }
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => warn!("in-flight task failed: {err}"),
                    }
                }
                _ = sweep_timer.tick(), if self.auto_renew => {
                    trace!("tick: sweep");
                    self.start_sweep(None);
                }
            }
        }
        debug!("port mapping service stopped");
    }

    /// Handles one request. Returns the reply channel of a close request,
    /// which the run loop answers after teardown.
    fn handle_msg(&mut self, msg: Message) -> Option<oneshot::Sender<()>> {
        match msg {
            Message::AddMapping {
                internal_port,
                external_port,
                lifetime_seconds,
                result_tx,
            } => {
                let intent = MappingIntent {
                    internal_port,
                    external_port,
                    lifetime_seconds,
                };
                self.start_attempt(Origin::User { result_tx }, intent);
            }
            Message::DeleteMapping {
                external_port,
                external_ip,
                result_tx,
            } => self.start_delete(external_port, external_ip, result_tx),
            Message::ActiveMappings { result_tx } => {
                let _ = result_tx.send(self.registry.snapshot());
            }
            Message::Renew { result_tx } => self.start_sweep(Some(result_tx)),
            Message::Probe { result_tx } => self.start_probe(result_tx),
            Message::RenewDue { key } => self.on_renew_due(key),
            Message::Close { result_tx } => return Some(result_tx),
        }
        None
    }

    /// Spawns the adapter cascade for one mapping attempt.
    fn start_attempt(&mut self, origin: Origin, intent: MappingIntent) {
        let adapters = self.adapters.clone();
        let usable = self.usable.clone();
        let dispatcher = self.dispatcher.clone();
        self.tasks.spawn(
            async move {
                let outcome = procure_mapping(&adapters, &usable, &dispatcher, intent).await;
                TaskDone::Mapping { origin, outcome }
            }
            .instrument(info_span!("portmap.attempt")),
        );
    }

    fn start_delete(
        &mut self,
        external_port: NonZeroU16,
        external_ip: Option<Ipv4Addr>,
        result_tx: oneshot::Sender<Result<(), Error>>,
    ) {
        match external_ip {
            Some(external_ip) => self.delete_key(
                MappingKey {
                    external_ip,
                    external_port: external_port.get(),
                },
                result_tx,
            ),
            None => {
                // no explicit address: the mapping is assumed to live under
                // the current public address
                let probe = self.probe.clone();
                self.tasks.spawn(async move {
                    let resolved = probe.public_ip().await.map_err(Error::PublicIp);
                    TaskDone::DeleteKey {
                        external_port,
                        resolved,
                        result_tx,
                    }
                });
            }
        }
    }

    /// Removes `key` locally and asks the owning adapter to delete it.
    ///
    /// The registry entry is gone regardless of what the gateway answers; the
    /// reply only reports the gateway outcome.
    fn delete_key(&mut self, key: MappingKey, result_tx: oneshot::Sender<Result<(), Error>>) {
        let Some(entry) = self.registry.remove(&key) else {
            let _ = result_tx.send(Err(Error::NotFound {
                external_ip: key.external_ip,
                external_port: key.external_port,
            }));
            return;
        };
        debug!("mapping {key} removed");
        let ActiveEntry {
            record, adapter, ..
        } = entry;
        self.tasks.spawn(async move {
            let outcome = adapter.delete_mapping(&record).await;
            TaskDone::Deleted { outcome, result_tx }
        });
    }

    fn start_sweep(&mut self, waiter: Option<oneshot::Sender<Result<(), Error>>>) {
        if let Some(waiter) = waiter {
            self.sweep_waiters.push(waiter);
        }
        if self.sweep_running {
            return;
        }
        if self.registry.is_empty() {
            self.finish_sweep();
            return;
        }
        self.sweep_running = true;
        let probe = self.probe.clone();
        self.tasks.spawn(
            async move {
                TaskDone::SweepIp {
                    outcome: probe.public_ip().await,
                }
            }
            .instrument(info_span!("portmap.sweep")),
        );
    }

    fn on_sweep_ip(&mut self, outcome: Result<Ipv4Addr, ProbeError>) {
        let public_ip = match outcome {
            Ok(ip) => ip,
            Err(err) => {
                debug!("sweep skipped, public address unknown: {err}");
                self.sweep_running = false;
                self.finish_sweep();
                return;
            }
        };

        let stale: Vec<MappingKey> = self
            .registry
            .keys()
            .filter(|key| key.external_ip != public_ip)
            .collect();
        for key in stale {
            // the old gateway is gone with the old network, so there is no
            // point telling it anything; evict and re-map from scratch
            let Some(entry) = self.registry.remove(&key) else {
                continue;
            };
            debug!("public address changed to {public_ip}, re-establishing {key}");
            let intent = MappingIntent {
                internal_port: entry.record.internal_port,
                external_port: entry.record.external_port,
                lifetime_seconds: entry.record.requested_lifetime,
            };
            self.sweep_outstanding += 1;
            self.start_attempt(Origin::Sweep { prior: key }, intent);
        }

        if self.sweep_outstanding == 0 {
            self.sweep_running = false;
            self.finish_sweep();
        }
    }

    fn sweep_attempt_finished(&mut self) {
        self.sweep_outstanding = self.sweep_outstanding.saturating_sub(1);
        if self.sweep_outstanding == 0 {
            self.sweep_running = false;
            self.finish_sweep();
        }
    }

    fn finish_sweep(&mut self) {
        for waiter in self.sweep_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn start_probe(&mut self, result_tx: oneshot::Sender<ProbeReport>) {
        self.probe_waiters.push(result_tx);
        if self.probing {
            return;
        }
        self.probing = true;
        let adapters = self.adapters.clone();
        let usable = self.usable.clone();
        self.tasks.spawn(
            async move {
                let verdicts =
                    futures_util::future::join_all(adapters.iter().map(|adapter| adapter.probe()))
                        .await;
                {
                    let mut usable = usable.lock();
                    for (idx, verdict) in verdicts.iter().enumerate() {
                        usable[idx] = Some(*verdict);
                    }
                }
                let mut report = ProbeReport::default();
                for (adapter, verdict) in adapters.iter().zip(verdicts) {
                    match adapter.protocol() {
                        Protocol::NatPmp => report.pmp = Some(verdict),
                        Protocol::Pcp => report.pcp = Some(verdict),
                        Protocol::Upnp => report.upnp = Some(verdict),
                    }
                }
                TaskDone::Probed { report }
            }
            .instrument(info_span!("portmap.probe")),
        );
    }

    fn on_task_done(&mut self, done: TaskDone) {
        match done {
            TaskDone::Mapping { origin, outcome } => self.on_mapping_done(origin, outcome),
            TaskDone::DeleteKey {
                external_port,
                resolved,
                result_tx,
            } => match resolved {
                Ok(external_ip) => self.delete_key(
                    MappingKey {
                        external_ip,
                        external_port: external_port.get(),
                    },
                    result_tx,
                ),
                Err(err) => {
                    let _ = result_tx.send(Err(err));
                }
            },
            TaskDone::Deleted { outcome, result_tx } => {
                let _ = result_tx.send(outcome.map_err(Error::DeleteFailed));
            }
            TaskDone::SweepIp { outcome } => self.on_sweep_ip(outcome),
            TaskDone::Probed { report } => {
                debug!("{report}");
                self.probing = false;
                for waiter in self.probe_waiters.drain(..) {
                    let _ = waiter.send(report.clone());
                }
            }
        }
    }

    fn on_mapping_done(&mut self, origin: Origin, outcome: Result<(MappingRecord, usize), Error>) {
        match origin {
            Origin::User { result_tx } => match outcome {
                Ok((record, adapter_idx)) => {
                    let record = self.register(record, adapter_idx);
                    let _ = result_tx.send(Ok(record));
                }
                Err(err) => {
                    let _ = result_tx.send(Err(err));
                }
            },
            Origin::Renew { prior } => match outcome {
                Ok((record, adapter_idx)) => {
                    self.registry.remove(&prior);
                    self.register(record, adapter_idx);
                }
                Err(err) => {
                    // the lease ran out while the renewal was failing
                    self.registry.remove(&prior);
                    warn!("renewal of {prior} failed, mapping evicted: {err}");
                }
            },
            Origin::Sweep { prior } => {
                match outcome {
                    Ok((record, adapter_idx)) => {
                        self.register(record, adapter_idx);
                    }
                    Err(err) => {
                        warn!("failed to re-establish {prior} after address change: {err}");
                    }
                }
                self.sweep_attempt_finished();
            }
        }
    }

    /// Enters a granted mapping into the registry, arms its renewal timer and
    /// emits the event. Replaces any entry already registered under the same
    /// external identity.
    fn register(&mut self, record: MappingRecord, adapter_idx: usize) -> MappingRecord {
        let Some(key) = record.key() else {
            warn!("mapping has no external identity, not tracking it");
            return record;
        };

        let (regime, delay) = plan(&record);
        let timer = delay.map(|after| self.arm_timer(key, after));
        let entry = ActiveEntry {
            record: record.clone(),
            adapter: self.adapters[adapter_idx].clone(),
            regime,
            timer,
        };
        if self.registry.insert(key, entry).is_some() {
            debug!("mapping {key} replaced an existing entry");
        }
        debug!(
            "mapping {key} active ({}, lease {}s of {}s requested)",
            record.protocol, record.lifetime, record.requested_lifetime
        );
        let _ = self.events_tx.send(Event::Mapping {
            record: record.clone(),
        });
        record
    }

    /// Arms a timer that reports back as [`Message::RenewDue`]. The returned
    /// handle aborts the timer when dropped.
    fn arm_timer(&self, key: MappingKey, after: Duration) -> AbortOnDropHandle<()> {
        let tx = self.msg_tx.clone();
        tokio::spawn(async move {
            time::sleep(after).await;
            let _ = tx.send(Message::RenewDue { key }).await;
        })
        .into()
    }

    fn on_renew_due(&mut self, key: MappingKey) {
        let Some(entry) = self.registry.get(&key) else {
            return;
        };
        match entry.regime {
            Regime::Static => {}
            Regime::Expire => {
                debug!("lease for {key} elapsed");
                self.registry.remove(&key);
            }
            Regime::Perpetual => {
                let intent = MappingIntent {
                    internal_port: entry.record.internal_port,
                    external_port: entry.record.external_port,
                    lifetime_seconds: 0,
                };
                self.start_attempt(Origin::Renew { prior: key }, intent);
            }
            Regime::Finite { remaining } => {
                let intent = MappingIntent {
                    internal_port: entry.record.internal_port,
                    external_port: entry.record.external_port,
                    lifetime_seconds: remaining,
                };
                self.start_attempt(Origin::Renew { prior: key }, intent);
            }
        }
    }

    /// Aborts everything in flight and deletes every active mapping in
    /// parallel.
    async fn shutdown(&mut self) {
        debug!("port mapping service shutting down");
        self.tasks.shutdown().await;
        for waiter in self.sweep_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Closed));
        }
        self.probe_waiters.clear();

        let entries = self.registry.drain();
        let deletions = entries.into_iter().map(|entry| async move {
            let ActiveEntry {
                record, adapter, ..
            } = entry;
            if let Err(err) = adapter.delete_mapping(&record).await {
                debug!("failed to release mapping on shutdown: {err}");
            }
        });
        futures_util::future::join_all(deletions).await;
    }
}

/// Tries every adapter in priority order until one's dispatch succeeds.
///
/// Adapters are probed on first use; one whose probe failed is skipped on
/// later calls. The error of the last adapter tried is surfaced when all of
/// them fail.
async fn procure_mapping(
    adapters: &[Arc<dyn Adapter>],
    usable: &Mutex<Vec<Option<bool>>>,
    dispatcher: &Dispatcher,
    intent: MappingIntent,
) -> Result<(MappingRecord, usize), Error> {
    let mut last_err = AdapterError::Unsupported;
    for (idx, adapter) in adapters.iter().enumerate() {
        let known = usable.lock()[idx];
        let available = match known {
            Some(available) => available,
            None => {
                let available = adapter.probe().await;
                debug!(
                    "{} probe: {}",
                    adapter.protocol(),
                    if available { "available" } else { "unavailable" }
                );
                usable.lock()[idx] = Some(available);
                available
            }
        };
        if !available {
            last_err = AdapterError::Unsupported;
            continue;
        }
        match dispatcher.create_mapping(adapter, intent.clone()).await {
            Ok(record) => return Ok((record, idx)),
            Err(err) => {
                debug!("{} attempt failed: {err}", adapter.protocol());
                last_err = err;
            }
        }
    }
    Err(Error::MappingFailed(last_err))
}

/// Decides how a granted mapping is kept alive and when its timer fires.
fn plan(record: &MappingRecord) -> (Regime, Option<Duration>) {
    let lease = Duration::from_secs(u64::from(record.lifetime));
    if record.requested_lifetime == 0 {
        if record.protocol == Protocol::Upnp {
            // permanent static mapping, nothing to renew
            (Regime::Static, None)
        } else {
            (Regime::Perpetual, Some(defaults::PERPETUAL_RENEW_INTERVAL))
        }
    } else if record.lifetime < record.requested_lifetime {
        let remaining = record.requested_lifetime - record.lifetime;
        (Regime::Finite { remaining }, Some(lease))
    } else {
        (Regime::Expire, Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{granted, StubAdapter, StubProbe};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn port(p: u16) -> NonZeroU16 {
        NonZeroU16::new(p).unwrap()
    }

    fn test_config() -> Config {
        Config {
            auto_renew: false,
            ..Config::default()
        }
    }

    /// Adapter granting whatever is asked, reporting the probe's current
    /// public address as the mapping's external address.
    fn granting_adapter(protocol: Protocol, probe: &Arc<StubProbe>) -> Arc<StubAdapter> {
        let probe = probe.clone();
        Arc::new(StubAdapter::new(protocol, move |router, intent| {
            Ok(granted(protocol, router, intent, probe.current_public(), u32::MAX))
        }))
    }

    #[tokio::test]
    async fn first_adapter_failure_falls_through_to_the_next() {
        let probe = Arc::new(StubProbe::new());
        let failing = Arc::new(StubAdapter::failing(Protocol::NatPmp));
        let granting = granting_adapter(Protocol::Upnp, &probe);
        let client = Client::with_adapters(
            test_config(),
            probe,
            vec![failing.clone(), granting.clone()],
        );

        let record = client.add_mapping(port(55555), 55555, 0).await.unwrap();
        assert_eq!(record.protocol, Protocol::Upnp);
        assert_eq!(record.internal_port, port(55555));
        assert!(!failing.created.lock().is_empty(), "first adapter was tried");

        client.close().await;
    }

    #[tokio::test]
    async fn failing_adapters_surface_the_last_error() {
        let probe = Arc::new(StubProbe::new());
        let client = Client::with_adapters(
            test_config(),
            probe,
            vec![
                Arc::new(StubAdapter::failing(Protocol::NatPmp)),
                Arc::new(StubAdapter::failing(Protocol::Pcp)),
            ],
        );

        let err = client.add_mapping(port(55555), 55555, 0).await.unwrap_err();
        assert!(matches!(err, Error::MappingFailed(AdapterError::Timeout)));

        client.close().await;
    }

    #[tokio::test]
    async fn unavailable_adapter_is_probed_once_and_skipped() {
        let probe = Arc::new(StubProbe::new());
        let unavailable = Arc::new(StubAdapter::unavailable(Protocol::NatPmp));
        let granting = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(
            test_config(),
            probe,
            vec![unavailable.clone(), granting.clone()],
        );

        let first = client.add_mapping(port(60000), 60000, 3600).await.unwrap();
        let second = client.add_mapping(port(60001), 60001, 3600).await.unwrap();
        assert_eq!(first.protocol, Protocol::Pcp);
        assert_eq!(second.protocol, Protocol::Pcp);

        assert_eq!(unavailable.probe_calls(), 1);
        assert!(unavailable.created.lock().is_empty());

        client.close().await;
    }

    #[tokio::test]
    async fn external_identity_keys_the_table() {
        let probe = Arc::new(StubProbe::new());
        let granting = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![granting.clone()]);

        client.add_mapping(port(60000), 60010, 3600).await.unwrap();
        // same external identity again: replaced, not duplicated
        client.add_mapping(port(60000), 60010, 3600).await.unwrap();
        client.add_mapping(port(60000), 60011, 3600).await.unwrap();

        let active = client.active_mappings().await.unwrap();
        assert_eq!(active.len(), 2);

        client.close().await;
    }

    #[tokio::test]
    async fn delete_removes_the_entry_even_when_the_gateway_fails() {
        let probe = Arc::new(StubProbe::new());
        let public = probe.current_public();
        let adapter = {
            let probe = probe.clone();
            Arc::new(
                StubAdapter::new(Protocol::NatPmp, move |router, intent| {
                    Ok(granted(
                        Protocol::NatPmp,
                        router,
                        intent,
                        probe.current_public(),
                        u32::MAX,
                    ))
                })
                .with_failing_delete(),
            )
        };
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        client.add_mapping(port(60000), 60001, 3600).await.unwrap();
        let err = client
            .delete_mapping(port(60001), Some(public))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeleteFailed(_)));

        // the local entry is gone regardless
        assert!(client.active_mappings().await.unwrap().is_empty());
        assert_eq!(adapter.deleted.lock().len(), 1);

        client.close().await;
    }

    #[tokio::test]
    async fn delete_defaults_to_the_current_public_address() {
        let probe = Arc::new(StubProbe::new());
        let granting = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![granting.clone()]);

        client.add_mapping(port(60000), 60002, 3600).await.unwrap();
        client.delete_mapping(port(60002), None).await.unwrap();
        assert!(client.active_mappings().await.unwrap().is_empty());

        // deleting again reports the missing entry
        let err = client.delete_mapping(port(60002), None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { external_port: 60002, .. }));

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shortened_lease_schedules_renewal_for_the_remainder() {
        let probe = Arc::new(StubProbe::new());
        let adapter = {
            let probe = probe.clone();
            // the gateway caps every lease at 120 seconds
            Arc::new(StubAdapter::new(Protocol::NatPmp, move |router, intent| {
                Ok(granted(
                    Protocol::NatPmp,
                    router,
                    intent,
                    probe.current_public(),
                    120,
                ))
            }))
        };
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        let record = client.add_mapping(port(60000), 60001, 3600).await.unwrap();
        assert_eq!(record.lifetime, 120);
        assert_eq!(record.requested_lifetime, 3600);

        // the renewal fires when the granted lease runs out and asks for the
        // un-granted remainder on the same ports
        time::sleep(Duration::from_secs(121)).await;
        let intents: Vec<MappingIntent> = adapter
            .created
            .lock()
            .iter()
            .map(|(_, intent)| intent.clone())
            .collect();
        assert!(intents.len() >= 2, "renewal attempt expected");
        assert_eq!(intents[1].lifetime_seconds, 3600 - 120);
        assert_eq!(intents[1].external_port, 60001);
        assert_eq!(intents[1].internal_port, port(60000));

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn indefinite_mapping_renews_perpetually() {
        let probe = Arc::new(StubProbe::new());
        let adapter = {
            let probe = probe.clone();
            Arc::new(StubAdapter::new(Protocol::Pcp, move |router, intent| {
                Ok(granted(
                    Protocol::Pcp,
                    router,
                    intent,
                    probe.current_public(),
                    u32::MAX,
                ))
            }))
        };
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        client.add_mapping(port(60000), 60001, 0).await.unwrap();
        // a full day passes; the mapping is re-requested with lifetime 0
        time::sleep(defaults::PERPETUAL_RENEW_INTERVAL + Duration::from_secs(1)).await;

        let intents: Vec<MappingIntent> = adapter
            .created
            .lock()
            .iter()
            .map(|(_, intent)| intent.clone())
            .collect();
        assert!(intents.len() >= 2, "perpetual renewal expected");
        assert_eq!(intents[1].lifetime_seconds, 0);

        let active = client.active_mappings().await.unwrap();
        assert_eq!(active.len(), 1);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fully_granted_lease_expires_without_renewal() {
        let probe = Arc::new(StubProbe::new());
        let adapter = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        client.add_mapping(port(60000), 60001, 60).await.unwrap();
        assert_eq!(client.active_mappings().await.unwrap().len(), 1);

        time::sleep(Duration::from_secs(61)).await;
        assert!(client.active_mappings().await.unwrap().is_empty());
        // expiry is local bookkeeping, no renewal attempt is made
        assert_eq!(adapter.created.lock().len(), 1);

        client.close().await;
    }

    #[tokio::test]
    async fn address_change_reestablishes_under_the_new_key() {
        let probe = Arc::new(StubProbe::new());
        let adapter = granting_adapter(Protocol::NatPmp, &probe);
        let client = Client::with_adapters(test_config(), probe.clone(), vec![adapter.clone()]);

        let record = client.add_mapping(port(60000), 60004, 3600).await.unwrap();
        assert_eq!(record.external_ip, Some(ip("1.2.3.4")));

        probe.set_public(ip("5.6.7.8"));
        client.renew_mappings().await.unwrap();

        let active = client.active_mappings().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_ip, Some(ip("5.6.7.8")));
        assert_eq!(active[0].external_port, 60004);

        client.close().await;
    }

    #[tokio::test]
    async fn unchanged_address_leaves_mappings_alone() {
        let probe = Arc::new(StubProbe::new());
        let adapter = granting_adapter(Protocol::NatPmp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        client.add_mapping(port(60000), 60005, 3600).await.unwrap();
        client.renew_mappings().await.unwrap();

        assert_eq!(adapter.created.lock().len(), 1, "no re-mapping expected");
        assert_eq!(client.active_mappings().await.unwrap().len(), 1);

        client.close().await;
    }

    #[tokio::test]
    async fn close_releases_every_mapping_and_stops_the_service() {
        let probe = Arc::new(StubProbe::new());
        let adapter = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![adapter.clone()]);

        client.add_mapping(port(60000), 60006, 3600).await.unwrap();
        client.add_mapping(port(60001), 60007, 3600).await.unwrap();

        client.close().await;
        assert_eq!(adapter.deleted.lock().len(), 2);
        assert!(matches!(
            client.active_mappings().await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn events_follow_successful_mappings() {
        let probe = Arc::new(StubProbe::new());
        let adapter = granting_adapter(Protocol::Pcp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![adapter]);
        let mut events = client.subscribe();

        let record = client.add_mapping(port(60000), 60008, 3600).await.unwrap();
        let Event::Mapping { record: emitted } = events.recv().await.unwrap();
        assert_eq!(emitted, record);

        client.close().await;
    }

    #[tokio::test]
    async fn probe_all_reports_only_configured_protocols() {
        let probe = Arc::new(StubProbe::new());
        let unavailable = Arc::new(StubAdapter::unavailable(Protocol::NatPmp));
        let granting = granting_adapter(Protocol::Upnp, &probe);
        let client = Client::with_adapters(test_config(), probe, vec![unavailable, granting]);

        let report = client.probe_all().await.unwrap();
        assert_eq!(report.pmp, Some(false));
        assert_eq!(report.upnp, Some(true));
        assert_eq!(report.pcp, None);

        client.close().await;
    }
}
