//! riskgate - request-time risk evaluation for web services
//!
//! This library decides, per inbound request, whether to allow it, block it,
//! or challenge the client, based on:
//! - A rule DSL over request-derived fields (host, path, IP, user agent,
//!   GeoIP attributes) that overrides per-request settings
//! - Multi-provider IP reputation (proxy/hosting detection, Tor exits) with
//!   ordered fallback, tri-state verdicts, and TTL caching
//! - A suspicion cascade over cheap request signals
//!
//! It is framework-agnostic: the host adapts its request type into
//! [`RequestInfo`], calls [`Engine::evaluate`], and turns the returned
//! [`Decision`] into a response with whatever templating it already has.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use riskgate::{Action, Engine, MemoryLog, RequestInfo, Ruleset, Settings};
//!
//! let ruleset = Ruleset::parse(r#"
//! ## staff network bypasses everything
//! ip isin ["198.51.100.10"] => {"action": "allow"}
//! path startswith /admin => {"action": "fight"}
//! "#).unwrap();
//!
//! let audit = Arc::new(MemoryLog::new());
//! let engine = Engine::builder()
//!     .defaults(Settings::default())
//!     .ruleset(ruleset)
//!     .audit_sink(audit.clone())
//!     .without_builtin_providers() // no network in this example
//!     .build()
//!     .unwrap();
//!
//! let request = RequestInfo::new("example.com", "/admin/users")
//!     .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
//!     .with_remote_addr("93.184.216.34".parse().unwrap());
//!
//! let decision = engine.evaluate(&request);
//! assert_eq!(decision.action, Action::Challenge);
//! assert_eq!(audit.total_entries(), 1);
//! ```
//!
//! # Rule Syntax
//!
//! One rule per line: `<expression> => <json override object>`.
//! Expressions are `field operator value` atoms joined by `and`/`or`
//! (evaluated left to right, first connective binds loosest):
//!
//! ```text
//! host endswith .example.com => {"action": "allow"}
//! path startswith /login and is_ip_tor is true => {"action": "block"}
//! user_agent contains "python" => {"action": "fight", "hardness": 3}
//! ```
//!
//! String values containing a `*` match as wildcards. Fields absent from a
//! request never match, and an unrecognized operator makes its atom always
//! false, so malformed rules fail closed.

pub mod audit;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fields;
pub mod fingerprint;
pub mod geo;
pub mod render;
pub mod reputation;
pub mod rules;
pub mod settings;
pub mod types;

pub use audit::{JsonFileLog, LogSink, MemoryLog};
pub use cache::{Clock, FakeClock, SystemClock, TtlCache, DEFAULT_REPUTATION_TTL};
pub use engine::{Engine, EngineBuilder};
pub use error::{GeoErrorKind, ProviderErrorKind, Result, RiskError};
pub use fields::{client_ip, FieldResolver, IP_HEADER_CHAIN};
pub use fingerprint::beam_id;
pub use geo::{GeoProvider, MemoryGeoProvider, MmdbGeoProvider, MmdbKind, NilGeoProvider};
pub use render::{PlainRenderer, Renderer, TEMPLATE_ACCESS_DENIED, TEMPLATE_ONECLICK_CAPTCHA};
pub use reputation::{
    DnsblProvider, ExoneratorProvider, IpApiProvider, IpIntelProvider, ReputationKind,
    ReputationProvider, ReputationService, StaticProvider,
};
pub use rules::{parse_expr, FieldMap, Op, RuleExpr};
pub use settings::{
    resolve_settings, ActionSetting, CaptchaType, Rule, Ruleset, Settings, SettingsPatch, Theme,
};
pub use types::{Action, Decision, RequestInfo, Verdict};
