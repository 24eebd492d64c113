//! Fan-out of one adapter attempt across candidate gateways.
//!
//! Candidates are split into two waves. The matched wave holds gateways that
//! have answered before plus the longest-prefix matches derived from the local
//! addresses; the fallback wave holds every other known router address. The
//! fallback only launches once the matched wave is exhausted, which keeps the
//! common case from spraying the whole LAN on every call.

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::adapter::{Adapter, AdapterError, MappingIntent};
use crate::chooser;
use crate::defaults;
use crate::mapping::MappingRecord;
use crate::net::NetworkProbe;
use crate::registry::RouterCache;

#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    probe: Arc<dyn NetworkProbe>,
    cache: RouterCache,
}

impl Dispatcher {
    pub fn new(probe: Arc<dyn NetworkProbe>, cache: RouterCache) -> Self {
        Dispatcher { probe, cache }
    }

    /// Runs `adapter` against candidate gateways until one grants a mapping.
    ///
    /// The matched wave completes, by success or exhaustion, strictly before
    /// the fallback wave begins. Within a wave candidates race; the first
    /// success cancels its siblings and is promoted into the router cache.
    pub async fn create_mapping(
        &self,
        adapter: &Arc<dyn Adapter>,
        intent: MappingIntent,
    ) -> Result<MappingRecord, AdapterError> {
        if adapter.self_discovering() {
            // the adapter finds its own gateway; the candidate is only a hint
            let hint = self
                .probe
                .gateway_ip()
                .await
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            let record = adapter.create_mapping(hint, intent).await?;
            self.cache.promote(record.router_ip);
            return Ok(record);
        }

        let (matched, fallback) = self.waves().await;
        trace!(
            "dispatching {} over {} matched / {} fallback candidates",
            adapter.protocol(),
            matched.len(),
            fallback.len()
        );

        let mut last_err = None;
        for wave in [matched, fallback] {
            if wave.is_empty() {
                continue;
            }
            match self.race(adapter, &wave, &intent).await {
                Ok(record) => return Ok(record),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(AdapterError::NoCandidates))
    }

    /// Splits the known router addresses into the matched and fallback waves.
    async fn waves(&self) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>) {
        let cached = self.cache.snapshot();
        let gateway = self.probe.gateway_ip().await;
        let privates = self.probe.private_ips().await;

        let mut known: Vec<Ipv4Addr> = Vec::with_capacity(cached.len() + 1 + defaults::SEED_ROUTERS.len());
        for ip in cached
            .iter()
            .copied()
            .chain(gateway)
            .chain(defaults::SEED_ROUTERS)
        {
            if !known.contains(&ip) {
                known.push(ip);
            }
        }

        let mut matched: Vec<Ipv4Addr> = Vec::new();
        for ip in cached {
            if !matched.contains(&ip) {
                matched.push(ip);
            }
        }
        for private in privates {
            // an empty candidate list would yield None; `known` never is
            if let Some(best) = chooser::closest(&known, private) {
                if !matched.contains(&best) {
                    matched.push(best);
                }
            }
        }

        let fallback = known
            .into_iter()
            .filter(|ip| !matched.contains(ip))
            .collect();
        (matched, fallback)
    }

    /// Races one wave of candidates; first success wins and cancels the rest.
    async fn race(
        &self,
        adapter: &Arc<dyn Adapter>,
        wave: &[Ipv4Addr],
        intent: &MappingIntent,
    ) -> Result<MappingRecord, AdapterError> {
        let mut attempts: FuturesUnordered<_> = wave
            .iter()
            .map(|&router| {
                let adapter = Arc::clone(adapter);
                let intent = intent.clone();
                async move { (router, adapter.create_mapping(router, intent).await) }
            })
            .collect();

        let mut last_err = AdapterError::NoCandidates;
        while let Some((router, result)) = attempts.next().await {
            match result {
                Ok(record) => {
                    debug!("router {router} granted a {} mapping", adapter.protocol());
                    self.cache.promote(router);
                    // dropping the remaining attempts closes their sockets
                    return Ok(record);
                }
                Err(err) => {
                    trace!("candidate {router} failed: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::*;
    use crate::mapping::Protocol;
    use crate::test_utils::{granted, StubAdapter, StubProbe};

    fn intent() -> MappingIntent {
        MappingIntent {
            internal_port: NonZeroU16::new(60000).unwrap(),
            external_port: 60000,
            lifetime_seconds: 3600,
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn matched_wave_failure_cascades_to_fallback() {
        let probe = Arc::new(StubProbe::new().with_privates(vec![ip("10.0.0.7")]).without_gateway());
        let winner = ip("192.168.1.1");
        let adapter: Arc<dyn Adapter> = Arc::new(StubAdapter::new(Protocol::NatPmp, move |router, intent| {
            if router == winner {
                Ok(granted(Protocol::NatPmp, router, intent, ip("1.2.3.4"), 3600))
            } else {
                Err(AdapterError::Timeout)
            }
        }));
        let cache = RouterCache::default();
        let dispatcher = Dispatcher::new(probe, cache.clone());

        let record = dispatcher
            .create_mapping(&adapter, intent())
            .await
            .expect("fallback wave should win");
        assert_eq!(record.router_ip, winner);
        assert!(cache.contains(winner));
    }

    #[tokio::test]
    async fn matched_wave_completes_before_fallback_launches() {
        let probe = Arc::new(StubProbe::new().with_privates(vec![ip("10.0.0.7")]).without_gateway());
        let adapter = Arc::new(StubAdapter::failing(Protocol::NatPmp));
        let as_adapter: Arc<dyn Adapter> = adapter.clone();
        let dispatcher = Dispatcher::new(probe, RouterCache::default());

        let err = dispatcher
            .create_mapping(&as_adapter, intent())
            .await
            .expect_err("every candidate fails");
        assert!(matches!(err, AdapterError::Timeout));

        // 10.0.0.1 is the longest-prefix match for 10.0.0.7 among the seeds,
        // so it forms the whole matched wave and must come first
        let attempted: Vec<Ipv4Addr> = adapter
            .created
            .lock()
            .iter()
            .map(|(router, _)| *router)
            .collect();
        assert_eq!(attempted.len(), defaults::SEED_ROUTERS.len());
        assert_eq!(attempted[0], ip("10.0.0.1"));
    }

    #[tokio::test]
    async fn cached_router_joins_the_matched_wave() {
        let probe = Arc::new(StubProbe::new().with_privates(vec![ip("10.0.0.7")]).without_gateway());
        let cache = RouterCache::default();
        cache.promote(ip("192.168.123.254"));

        let adapter = Arc::new(StubAdapter::failing(Protocol::Pcp));
        let as_adapter: Arc<dyn Adapter> = adapter.clone();
        let dispatcher = Dispatcher::new(probe, cache);

        dispatcher
            .create_mapping(&as_adapter, intent())
            .await
            .expect_err("every candidate fails");

        // matched wave = cached router + the longest-prefix seed; both must be
        // attempted before any fallback candidate
        let attempted: Vec<Ipv4Addr> = adapter
            .created
            .lock()
            .iter()
            .map(|(router, _)| *router)
            .collect();
        assert!(attempted[..2].contains(&ip("192.168.123.254")));
        assert!(attempted[..2].contains(&ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn no_private_addresses_falls_back_to_every_candidate() {
        let probe = Arc::new(StubProbe::new().with_privates(vec![]).without_gateway());
        let winner = ip("192.168.178.1");
        let adapter: Arc<dyn Adapter> = Arc::new(StubAdapter::new(Protocol::NatPmp, move |router, intent| {
            if router == winner {
                Ok(granted(Protocol::NatPmp, router, intent, ip("1.2.3.4"), 3600))
            } else {
                Err(AdapterError::Timeout)
            }
        }));
        let dispatcher = Dispatcher::new(probe, RouterCache::default());

        let record = dispatcher.create_mapping(&adapter, intent()).await.unwrap();
        assert_eq!(record.router_ip, winner);
    }

    #[tokio::test]
    async fn self_discovering_adapter_gets_a_single_attempt() {
        let probe = Arc::new(StubProbe::new());
        let adapter = Arc::new(
            StubAdapter::new(Protocol::Upnp, |router, intent| {
                Ok(granted(Protocol::Upnp, router, intent, ip("1.2.3.4"), 3600))
            })
            .with_self_discovery(),
        );
        let as_adapter: Arc<dyn Adapter> = adapter.clone();
        let cache = RouterCache::default();
        let dispatcher = Dispatcher::new(probe, cache.clone());

        dispatcher.create_mapping(&as_adapter, intent()).await.unwrap();
        assert_eq!(adapter.created.lock().len(), 1);
        assert!(cache.contains(ip("192.168.1.1")));
    }
}
