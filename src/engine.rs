//! The decision engine.
//!
//! [`Engine`] ties the pieces together: per-request field resolution, rule
//! evaluation into effective [`Settings`], the suspicion cascade, and the
//! audit trail. Hosts construct one through [`EngineBuilder`] at startup and
//! call [`Engine::evaluate`] once per inbound request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::audit::LogSink;
use crate::cache::{Clock, SystemClock, TtlCache, DEFAULT_CACHE_SIZE, DEFAULT_REPUTATION_TTL};
use crate::error::Result;
use crate::fields::FieldResolver;
use crate::fingerprint::beam_id;
use crate::geo::GeoProvider;
use crate::render::{render_variables, TEMPLATE_ACCESS_DENIED, TEMPLATE_ONECLICK_CAPTCHA};
use crate::reputation::{
    DnsblProvider, ExoneratorProvider, IpApiProvider, IpIntelProvider, ReputationProvider,
    ReputationService,
};
use crate::settings::{resolve_settings, ActionSetting, Ruleset, Settings};
use crate::types::{Action, Decision, RequestInfo};

/// Well-formed user agents carry at least one product/version token.
static UA_STRUCTURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._\-]+/[0-9][A-Za-z0-9.\-]*")
        .expect("UA_STRUCTURE: hardcoded regex is invalid")
});

/// Substrings that identify self-declared crawlers and scripted clients.
static CRAWLER_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(bot|crawler|spider|slurp|headless|python-requests|python-urllib|scrapy|wget|curl|go-http-client|phantomjs)")
        .expect("CRAWLER_SIGNATURE: hardcoded regex is invalid")
});

/// Why a request was considered suspicious, for the audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suspicion {
    None,
    MissingUserAgent,
    MalformedUserAgent,
    Crawler,
    UnresolvableIp,
    MaliciousIp,
    TorExit,
}

impl Suspicion {
    fn as_str(&self) -> &'static str {
        match self {
            Suspicion::None => "none",
            Suspicion::MissingUserAgent => "missing_user_agent",
            Suspicion::MalformedUserAgent => "malformed_user_agent",
            Suspicion::Crawler => "crawler",
            Suspicion::UnresolvableIp => "unresolvable_ip",
            Suspicion::MaliciousIp => "malicious_ip",
            Suspicion::TorExit => "tor_exit",
        }
    }
}

/// Everything derived for one request: the effective settings snapshot,
/// the client address, and the request fingerprint. Built once per
/// evaluation and passed explicitly; the engine itself holds no
/// per-request state.
struct RequestContext {
    settings: Settings,
    client_ip: Option<std::net::IpAddr>,
    ip_display: String,
    ray_id: String,
}

/// Request evaluation engine. Cheap to share behind an `Arc`; all interior
/// state (the reputation cache, audit locks) is already synchronized.
pub struct Engine {
    defaults: Settings,
    ruleset: Ruleset,
    resolver: FieldResolver,
    reputation: Arc<ReputationService>,
    audit: Option<Arc<dyn LogSink>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Evaluate one request into a [`Decision`].
    ///
    /// Exactly one audit entry is written per call, whatever the outcome.
    /// Reputation lookups only happen when the suspicion cascade runs or a
    /// matched rule references a reputation field.
    pub fn evaluate(&self, request: &RequestInfo) -> Decision {
        let mut fields = self.resolver.base_fields(request);
        let wanted = self.ruleset.referenced_fields();
        self.resolver.ensure(&mut fields, &wanted, &self.defaults);

        let settings = resolve_settings(&self.defaults, &self.ruleset, &fields);
        let client_ip = fields
            .get("ip")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let ip_display =
            client_ip.map_or_else(|| "-".to_string(), |ip: std::net::IpAddr| ip.to_string());
        let ray_id = beam_id(&[&ip_display, request.user_agent()]);
        let ctx = RequestContext {
            settings,
            client_ip,
            ip_display,
            ray_id,
        };

        let (action, suspicion) = match ctx.settings.action {
            ActionSetting::Allow => (Action::Allow, Suspicion::None),
            ActionSetting::Block => (Action::Block, Suspicion::None),
            ActionSetting::Fight => (Action::Challenge, Suspicion::None),
            ActionSetting::Auto | ActionSetting::BlockIfSuspicious => {
                let suspicion = self.classify(request, &ctx);
                let action = if suspicion == Suspicion::None {
                    Action::Allow
                } else if ctx.settings.action == ActionSetting::BlockIfSuspicious {
                    Action::Block
                } else {
                    Action::Challenge
                };
                (action, suspicion)
            }
        };

        self.audit_entry(request, &ctx, action, suspicion);

        log::info!(
            "{} {}{} -> {} ({})",
            request.method,
            request.host,
            request.path,
            action.as_str(),
            suspicion.as_str()
        );

        match action {
            Action::Allow => Decision::allow(),
            Action::Block => Decision {
                action,
                http_status: action.http_status(),
                template_id: Some(TEMPLATE_ACCESS_DENIED.to_string()),
                render_variables: render_variables(request, &ctx.settings, ctx.client_ip, &ctx.ray_id),
            },
            Action::Challenge => Decision {
                action,
                http_status: action.http_status(),
                template_id: Some(TEMPLATE_ONECLICK_CAPTCHA.to_string()),
                render_variables: render_variables(request, &ctx.settings, ctx.client_ip, &ctx.ray_id),
            },
        }
    }

    /// The suspicion cascade: cheapest signals first, reputation lookups
    /// last and only when nothing cheaper already decided.
    fn classify(&self, request: &RequestInfo, ctx: &RequestContext) -> Suspicion {
        let user_agent = request.user_agent().trim();
        if user_agent.is_empty() {
            return Suspicion::MissingUserAgent;
        }
        if !UA_STRUCTURE.is_match(user_agent) {
            return Suspicion::MalformedUserAgent;
        }
        if ctx.settings.block_crawlers && CRAWLER_SIGNATURE.is_match(user_agent) {
            return Suspicion::Crawler;
        }

        let ip = match ctx.client_ip {
            Some(ip) => ip,
            // No routable client address at all
            None => return Suspicion::UnresolvableIp,
        };
        if self.reputation.is_malicious(ip, &ctx.settings) {
            return Suspicion::MaliciousIp;
        }
        if self.reputation.is_tor(ip, &ctx.settings) {
            return Suspicion::TorExit;
        }
        Suspicion::None
    }

    fn audit_entry(
        &self,
        request: &RequestInfo,
        ctx: &RequestContext,
        action: Action,
        suspicion: Suspicion,
    ) {
        let sink = match &self.audit {
            Some(sink) => sink,
            None => return,
        };
        let mut record = Map::new();
        // Whole-second precision so repeated identical requests produce
        // identical records and the sink can suppress the duplicates.
        record.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        record.insert("ip".to_string(), Value::String(ctx.ip_display.clone()));
        record.insert(
            "user_agent".to_string(),
            Value::String(request.user_agent().to_string()),
        );
        record.insert(
            "http_version".to_string(),
            Value::String(request.http_version.clone()),
        );
        record.insert("host".to_string(), Value::String(request.host.clone()));
        record.insert("path".to_string(), Value::String(request.path.clone()));
        record.insert(
            "action".to_string(),
            Value::String(action.as_str().to_string()),
        );
        if suspicion != Suspicion::None {
            record.insert(
                "suspicion".to_string(),
                Value::String(suspicion.as_str().to_string()),
            );
        }
        sink.append(&ctx.ray_id, &record);
    }
}

/// Startup-time engine assembly.
pub struct EngineBuilder {
    defaults: Settings,
    ruleset: Ruleset,
    reputation_providers: Vec<Arc<dyn ReputationProvider>>,
    geo_providers: Vec<Arc<dyn GeoProvider>>,
    audit: Option<Arc<dyn LogSink>>,
    clock: Arc<dyn Clock>,
    cache_capacity: usize,
    cache_ttl: Duration,
    builtin_providers: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            defaults: Settings::default(),
            ruleset: Ruleset::new(),
            reputation_providers: Vec::new(),
            geo_providers: Vec::new(),
            audit: None,
            clock: Arc::new(SystemClock),
            cache_capacity: DEFAULT_CACHE_SIZE,
            cache_ttl: DEFAULT_REPUTATION_TTL,
            builtin_providers: true,
        }
    }

    pub fn defaults(mut self, settings: Settings) -> Self {
        self.defaults = settings;
        self
    }

    pub fn ruleset(mut self, ruleset: Ruleset) -> Self {
        self.ruleset = ruleset;
        self
    }

    /// Append a reputation provider. Provider order is consultation order.
    pub fn reputation_provider(mut self, provider: Arc<dyn ReputationProvider>) -> Self {
        self.reputation_providers.push(provider);
        self
    }

    /// Skip registering the built-in network providers. Tests and hosts
    /// with a fully custom provider list use this.
    pub fn without_builtin_providers(mut self) -> Self {
        self.builtin_providers = false;
        self
    }

    pub fn geo_provider(mut self, provider: Arc<dyn GeoProvider>) -> Self {
        self.geo_providers.push(provider);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Replace the wall clock, letting tests drive cache expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.defaults.validate()?;

        let mut providers = self.reputation_providers;
        if self.builtin_providers {
            providers.push(Arc::new(IpApiProvider::new()));
            providers.push(Arc::new(IpIntelProvider::new()));
            providers.push(Arc::new(DnsblProvider::new()));
            providers.push(Arc::new(ExoneratorProvider::new()));
        }

        for name in &self.defaults.third_parties {
            let known = name == "geoip" || providers.iter().any(|p| p.name() == name);
            if !known {
                log::warn!("third_parties names unregistered provider {:?}", name);
            }
        }

        let cache = Arc::new(TtlCache::new(
            self.cache_capacity,
            self.cache_ttl,
            self.clock,
        ));
        let mut reputation =
            ReputationService::new(providers, self.geo_providers.clone(), cache);
        if let Some(sink) = &self.audit {
            reputation = reputation.with_sink(sink.clone());
        }
        let reputation = Arc::new(reputation);

        Ok(Engine {
            defaults: self.defaults,
            ruleset: self.ruleset,
            resolver: FieldResolver::new(reputation.clone(), self.geo_providers),
            reputation,
            audit: self.audit,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ua_structure_accepts_real_agents() {
        assert!(UA_STRUCTURE.is_match("Mozilla/5.0 (X11; Linux x86_64)"));
        assert!(UA_STRUCTURE.is_match("curl/8.4.0"));
        assert!(UA_STRUCTURE.is_match("python-requests/2.31"));
    }

    #[test]
    fn test_ua_structure_rejects_garbage() {
        assert!(!UA_STRUCTURE.is_match("hello"));
        assert!(!UA_STRUCTURE.is_match("()"));
        assert!(!UA_STRUCTURE.is_match("/5.0"));
        assert!(!UA_STRUCTURE.is_match("Mozilla/x"));
    }

    #[test]
    fn test_crawler_signature() {
        assert!(CRAWLER_SIGNATURE.is_match("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        assert!(CRAWLER_SIGNATURE.is_match("curl/8.4.0"));
        assert!(CRAWLER_SIGNATURE.is_match("Scrapy/2.11 (+https://scrapy.org)"));
        assert!(!CRAWLER_SIGNATURE.is_match("Mozilla/5.0 (Windows NT 10.0) Firefox/121.0"));
    }

    #[test]
    fn test_build_rejects_invalid_defaults() {
        let bad = Settings {
            hardness: 0,
            ..Settings::default()
        };
        let result = Engine::builder()
            .defaults(bad)
            .without_builtin_providers()
            .build();
        assert!(result.is_err());
    }
}
