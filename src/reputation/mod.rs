//! IP reputation aggregation.
//!
//! Providers classify an IP as malicious or as a Tor exit. Aggregation
//! walks the caller-supplied provider order, short-circuits on the first
//! positive, and treats provider failures as `Unknown` so they fall through
//! instead of masquerading as clean results. Conclusive verdicts are cached
//! per `(provider, ip)` with a shared TTL cache; `Unknown` is never cached.

pub mod providers;

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::audit::LogSink;
use crate::cache::TtlCache;
use crate::geo::{is_geo_flagged, GeoProvider};
use crate::settings::Settings;
use crate::types::Verdict;

pub use providers::{
    DnsblProvider, ExoneratorProvider, HostResolver, IpApiProvider, IpIntelProvider,
    StaticHostResolver, SystemHostResolver, IPINTEL_SCORE_THRESHOLD,
};

/// What a provider classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationKind {
    Malicious,
    Tor,
}

/// A single reputation source.
///
/// `check` must be total: network failure, timeout, or an unparseable
/// response yield [`Verdict::Unknown`], never a panic or error.
pub trait ReputationProvider: Send + Sync {
    /// Stable name, also used for enablement via `Settings::third_parties`
    /// and as the cache key component.
    fn name(&self) -> &str;

    fn kind(&self) -> ReputationKind;

    fn check(&self, ip: IpAddr) -> Verdict;
}

/// Aggregator over an ordered provider list with shared TTL caching.
pub struct ReputationService {
    providers: Vec<Arc<dyn ReputationProvider>>,
    geo: Vec<Arc<dyn GeoProvider>>,
    cache: Arc<TtlCache<(String, String), bool>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl ReputationService {
    pub fn new(
        providers: Vec<Arc<dyn ReputationProvider>>,
        geo: Vec<Arc<dyn GeoProvider>>,
        cache: Arc<TtlCache<(String, String), bool>>,
    ) -> Self {
        Self {
            providers,
            geo,
            cache,
            sink: None,
        }
    }

    /// Record positive verdicts (with the provider's identity) through this
    /// sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Whether `ip` is classified as malicious by the enabled providers.
    ///
    /// First provider answering `Flagged` wins; `Clean` is conclusive for
    /// the provider chain; `Unknown` falls through. When no provider
    /// flagged the IP, the local GeoIP/ASN classification is consulted as a
    /// last resort. The collapsed boolean is cached per IP.
    pub fn is_malicious(&self, ip: IpAddr, settings: &Settings) -> bool {
        self.aggregate(ip, settings, ReputationKind::Malicious)
    }

    /// Whether `ip` is a known Tor exit.
    pub fn is_tor(&self, ip: IpAddr, settings: &Settings) -> bool {
        self.aggregate(ip, settings, ReputationKind::Tor)
    }

    fn aggregate(&self, ip: IpAddr, settings: &Settings, kind: ReputationKind) -> bool {
        let aggregate_name = match kind {
            ReputationKind::Malicious => "malicious",
            ReputationKind::Tor => "tor",
        };
        let aggregate_key = (aggregate_name.to_string(), ip.to_string());
        if let Some(cached) = self.cache.get(&aggregate_key) {
            return cached;
        }

        let mut flagged = false;
        for provider in self.providers.iter().filter(|p| p.kind() == kind) {
            if !settings.provider_enabled(provider.name()) {
                continue;
            }
            match self.check_provider(provider.as_ref(), ip) {
                Verdict::Flagged => {
                    flagged = true;
                    break;
                }
                // A conclusive negative ends the provider chain
                Verdict::Clean => break,
                Verdict::Unknown => continue,
            }
        }

        if !flagged && kind == ReputationKind::Malicious && settings.provider_enabled("geoip") {
            flagged = self.geo_last_resort(ip);
            if flagged {
                log::info!("geoip flagged {} as malicious", ip);
                self.record_positive("geoip", ip);
            }
        }

        self.cache.put(aggregate_key, flagged);
        flagged
    }

    /// Provider call behind the `(provider, ip)` cache. Only conclusive
    /// verdicts are stored; `Unknown` is re-queried next time.
    fn check_provider(&self, provider: &dyn ReputationProvider, ip: IpAddr) -> Verdict {
        let key = (provider.name().to_string(), ip.to_string());
        if let Some(cached) = self.cache.get(&key) {
            log::debug!("reputation cache hit: {} / {}", provider.name(), ip);
            return Verdict::from_bool(cached);
        }

        let verdict = provider.check(ip);
        match verdict {
            Verdict::Flagged => {
                self.cache.put(key, true);
                log::info!("{} flagged {}", provider.name(), ip);
                self.record_positive(provider.name(), ip);
            }
            Verdict::Clean => {
                self.cache.put(key, false);
            }
            Verdict::Unknown => {
                log::debug!("{} could not classify {}", provider.name(), ip);
            }
        }
        verdict
    }

    /// Merged local GeoIP view: anonymous-network flags or a hosting ASN.
    fn geo_last_resort(&self, ip: IpAddr) -> bool {
        let mut merged = Map::new();
        for provider in &self.geo {
            if let Some(record) = provider.lookup(ip) {
                for (key, value) in record {
                    merged.entry(key).or_insert(value);
                }
            }
        }
        !merged.is_empty() && is_geo_flagged(&merged)
    }

    fn record_positive(&self, provider: &str, ip: IpAddr) {
        if let Some(sink) = &self.sink {
            let mut record = Map::new();
            record.insert("provider".to_string(), Value::String(provider.to_string()));
            record.insert("verdict".to_string(), Value::String("flagged".to_string()));
            sink.append(&ip.to_string(), &record);
        }
    }
}

/// Scriptable provider returning a fixed verdict, counting its calls.
/// Useful for tests and for hosts wiring in allow/deny lists.
pub struct StaticProvider {
    name: String,
    kind: ReputationKind,
    verdict: Verdict,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, kind: ReputationKind, verdict: Verdict) -> Self {
        Self {
            name: name.into(),
            kind,
            verdict,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `check` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReputationProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ReputationKind {
        self.kind
    }

    fn check(&self, _ip: IpAddr) -> Verdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
    }
}
