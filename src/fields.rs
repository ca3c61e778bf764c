//! Request field resolution.
//!
//! Rules reference named fields ("host", "ip", "is_ip_malicious", GeoIP
//! attributes). Base fields are derived from the request up front; expensive
//! fields (reputation lookups, GeoIP reads) are resolved lazily, only when a
//! loaded rule actually references them, and memoized into the field map.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

use crate::geo::GeoProvider;
use crate::reputation::ReputationService;
use crate::rules::FieldMap;
use crate::settings::Settings;
use crate::types::RequestInfo;

/// Headers consulted for the real client address, most trusted first.
/// The raw peer address is the final fallback.
pub const IP_HEADER_CHAIN: &[&str] = &[
    "X-Real-Ip",
    "CF-Connecting-IP",
    "X-Forwarded-For",
    "X-Cluster-Client-Ip",
    "X-Forwarded",
    "True-Client-Ip",
    "X-Appengine-User-Ip",
];

static UNWANTED_IPV4_RANGES: Lazy<Vec<Ipv4Net>> = Lazy::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.88.99.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

static UNWANTED_IPV6_RANGES: Lazy<Vec<Ipv6Net>> = Lazy::new(|| {
    [
        "::/128",
        "::1/128",
        "::ffff:0:0/96",
        "64:ff9b::/96",
        "64:ff9b:1::/48",
        "100::/64",
        "2001::/32",
        "2001:20::/28",
        "2001:db8::/32",
        "2002::/16",
        "5f00::/16",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// Whether `ip` is a plausible public client address: parsed, and outside
/// the reserved/private/documentation ranges.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !UNWANTED_IPV4_RANGES.iter().any(|net| net.contains(&v4)),
        IpAddr::V6(v6) => !UNWANTED_IPV6_RANGES.iter().any(|net| net.contains(&v6)),
    }
}

/// Resolve the client address: walk the forwarding-header chain, taking the
/// first value that parses to a routable address, then fall back to the raw
/// peer address.
pub fn client_ip(request: &RequestInfo) -> Option<IpAddr> {
    for header in IP_HEADER_CHAIN {
        if let Some(raw) = request.header(header) {
            // X-Forwarded-For may carry a proxy chain; the client is first
            let candidate = raw.split(',').next().unwrap_or(raw).trim();
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                if is_routable(ip) {
                    return Some(ip);
                }
                log::debug!("{} carries non-routable address {}", header, ip);
            }
        }
    }
    request.remote_addr.filter(|ip| is_routable(*ip))
}

/// Split `host` into registrable domain and subdomain parts.
/// "a.b.example.com" yields ("example.com", "a.b"); a bare "example.com"
/// has an empty subdomain. Port suffixes are stripped first.
fn split_host(host: &str) -> (String, String) {
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return (host.to_string(), String::new());
    }
    let domain = labels[labels.len() - 2..].join(".");
    let subdomain = labels[..labels.len() - 2].join(".");
    (domain, subdomain)
}

/// Lazily materializes rule fields for one request.
pub struct FieldResolver {
    reputation: Arc<ReputationService>,
    geo: Vec<Arc<dyn GeoProvider>>,
}

impl FieldResolver {
    pub fn new(reputation: Arc<ReputationService>, geo: Vec<Arc<dyn GeoProvider>>) -> Self {
        Self { reputation, geo }
    }

    /// The cheap fields every request gets, no network or disk involved.
    pub fn base_fields(&self, request: &RequestInfo) -> FieldMap {
        let (domain, subdomain) = split_host(&request.host);
        let ip = client_ip(request);

        let mut fields = FieldMap::new();
        fields.insert("method".to_string(), json!(request.method));
        fields.insert("scheme".to_string(), json!(request.scheme));
        fields.insert("host".to_string(), json!(request.host));
        fields.insert("path".to_string(), json!(request.path));
        fields.insert("url".to_string(), json!(request.url()));
        fields.insert("domain".to_string(), json!(domain));
        fields.insert("subdomain".to_string(), json!(subdomain));
        fields.insert(
            "args".to_string(),
            Value::Object(
                request
                    .query
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect::<Map<String, Value>>(),
            ),
        );
        fields.insert("is_json".to_string(), json!(request.json_body.is_some()));
        fields.insert(
            "json".to_string(),
            request.json_body.clone().unwrap_or(Value::Null),
        );
        fields.insert(
            "ip".to_string(),
            ip.map_or(Value::Null, |ip| json!(ip.to_string())),
        );
        fields.insert("user_agent".to_string(), json!(request.user_agent()));
        fields
    }

    /// Fill in every field of `wanted` that the base map lacks. Reputation
    /// fields go through the aggregator; anything else is asked of the GeoIP
    /// providers that advertise it. Unresolvable fields stay absent so rules
    /// referencing them evaluate to false.
    pub fn ensure(&self, fields: &mut FieldMap, wanted: &[&str], settings: &Settings) {
        let ip = fields
            .get("ip")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<IpAddr>().ok());

        for &field in wanted {
            if fields.contains_key(field) {
                continue;
            }
            match field {
                "is_ip_malicious" => {
                    let flagged = ip
                        .map(|ip| self.reputation.is_malicious(ip, settings))
                        .unwrap_or(false);
                    fields.insert(field.to_string(), json!(flagged));
                }
                "is_ip_tor" => {
                    let flagged = ip
                        .map(|ip| self.reputation.is_tor(ip, settings))
                        .unwrap_or(false);
                    fields.insert(field.to_string(), json!(flagged));
                }
                _ => {
                    if !settings.provider_enabled("geoip") {
                        continue;
                    }
                    if let Some(ip) = ip {
                        self.resolve_geo_field(fields, field, ip);
                    }
                }
            }
        }
    }

    /// Ask the first provider advertising `field`; merge its whole record so
    /// sibling fields from the same database come along for free.
    fn resolve_geo_field(&self, fields: &mut FieldMap, field: &str, ip: IpAddr) {
        for provider in &self.geo {
            if !provider.fields().iter().any(|f| f == field) {
                continue;
            }
            if let Some(record) = provider.lookup(ip) {
                for (key, value) in record {
                    fields.entry(key).or_insert(value);
                }
            }
            return;
        }
        log::debug!("no geo provider advertises field {:?}", field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FakeClock, TtlCache, DEFAULT_REPUTATION_TTL};
    use crate::geo::MemoryGeoProvider;
    use crate::reputation::{ReputationKind, StaticProvider};
    use crate::types::Verdict;

    fn resolver_with(
        providers: Vec<Arc<dyn crate::reputation::ReputationProvider>>,
        geo: Vec<Arc<dyn GeoProvider>>,
    ) -> FieldResolver {
        let clock = Arc::new(FakeClock::new());
        let cache = Arc::new(TtlCache::new(64, DEFAULT_REPUTATION_TTL, clock));
        let service = Arc::new(ReputationService::new(providers, geo.clone(), cache));
        FieldResolver::new(service, geo)
    }

    #[test]
    fn test_routable_rejects_reserved_ranges() {
        assert!(!is_routable("127.0.0.1".parse().unwrap()));
        assert!(!is_routable("10.1.2.3".parse().unwrap()));
        assert!(!is_routable("192.168.0.7".parse().unwrap()));
        assert!(!is_routable("169.254.9.9".parse().unwrap()));
        assert!(!is_routable("::1".parse().unwrap()));
        assert!(!is_routable("fe80::1".parse().unwrap()));
        assert!(!is_routable("fc00::1".parse().unwrap()));
        assert!(is_routable("8.8.8.8".parse().unwrap()));
        assert!(is_routable("2600:1f00::1".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_prefers_headers_over_peer() {
        let req = RequestInfo::new("example.com", "/")
            .with_header("X-Forwarded-For", "8.8.4.4, 172.16.0.1")
            .with_remote_addr("172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&req), Some("8.8.4.4".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_skips_non_routable_header_values() {
        let req = RequestInfo::new("example.com", "/")
            .with_header("X-Real-Ip", "10.0.0.5")
            .with_header("True-Client-Ip", "9.9.9.9");
        assert_eq!(client_ip(&req), Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let req =
            RequestInfo::new("example.com", "/").with_remote_addr("8.8.8.8".parse().unwrap());
        assert_eq!(client_ip(&req), Some("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_none_when_everything_reserved() {
        let req =
            RequestInfo::new("example.com", "/").with_remote_addr("127.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&req), None);
    }

    #[test]
    fn test_split_host() {
        assert_eq!(
            split_host("example.com"),
            ("example.com".to_string(), String::new())
        );
        assert_eq!(
            split_host("www.example.com"),
            ("example.com".to_string(), "www".to_string())
        );
        assert_eq!(
            split_host("a.b.example.com:8443"),
            ("example.com".to_string(), "a.b".to_string())
        );
        assert_eq!(
            split_host("localhost"),
            ("localhost".to_string(), String::new())
        );
    }

    #[test]
    fn test_base_fields_shape() {
        let resolver = resolver_with(Vec::new(), Vec::new());
        let mut req = RequestInfo::new("shop.example.com", "/checkout")
            .with_header("User-Agent", "Mozilla/5.0")
            .with_remote_addr("8.8.8.8".parse().unwrap());
        req.query.insert("id".to_string(), "42".to_string());

        let fields = resolver.base_fields(&req);
        assert_eq!(fields["host"], json!("shop.example.com"));
        assert_eq!(fields["domain"], json!("example.com"));
        assert_eq!(fields["subdomain"], json!("shop"));
        assert_eq!(fields["ip"], json!("8.8.8.8"));
        assert_eq!(fields["is_json"], json!(false));
        assert_eq!(fields["args"]["id"], json!("42"));
    }

    #[test]
    fn test_ensure_reputation_field_without_ip_is_false() {
        let provider = Arc::new(StaticProvider::new(
            "p",
            ReputationKind::Malicious,
            Verdict::Flagged,
        ));
        let resolver = resolver_with(vec![provider.clone()], Vec::new());
        let req = RequestInfo::new("example.com", "/");

        let mut fields = resolver.base_fields(&req);
        let settings = Settings::default();
        resolver.ensure(&mut fields, &["is_ip_malicious"], &settings);
        assert_eq!(fields["is_ip_malicious"], json!(false));
        assert_eq!(provider.calls(), 0, "no lookup without a client address");
    }

    #[test]
    fn test_ensure_reputation_field_with_ip() {
        let provider = Arc::new(StaticProvider::new(
            "p",
            ReputationKind::Tor,
            Verdict::Flagged,
        ));
        let resolver = resolver_with(vec![provider], Vec::new());
        let req =
            RequestInfo::new("example.com", "/").with_remote_addr("8.8.8.8".parse().unwrap());

        let mut fields = resolver.base_fields(&req);
        let settings = Settings {
            third_parties: vec!["p".to_string()],
            ..Settings::default()
        };
        resolver.ensure(&mut fields, &["is_ip_tor"], &settings);
        assert_eq!(fields["is_ip_tor"], json!(true));
    }

    #[test]
    fn test_ensure_geo_field_merges_record() {
        let mut geo = MemoryGeoProvider::new("city", &["country_code", "city_name"]);
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        let mut record = Map::new();
        record.insert("country_code".to_string(), json!("US"));
        record.insert("city_name".to_string(), json!("Mountain View"));
        geo.insert(ip, record);

        let resolver = resolver_with(Vec::new(), vec![Arc::new(geo)]);
        let req = RequestInfo::new("example.com", "/").with_remote_addr(ip);

        let mut fields = resolver.base_fields(&req);
        let settings = Settings::default();
        resolver.ensure(&mut fields, &["country_code"], &settings);
        assert_eq!(fields["country_code"], json!("US"));
        // Sibling field piggybacks on the same record
        assert_eq!(fields["city_name"], json!("Mountain View"));
    }

    #[test]
    fn test_ensure_unknown_field_stays_absent() {
        let resolver = resolver_with(Vec::new(), Vec::new());
        let req = RequestInfo::new("example.com", "/");
        let mut fields = resolver.base_fields(&req);
        let settings = Settings::default();
        resolver.ensure(&mut fields, &["no_such_field"], &settings);
        assert!(!fields.contains_key("no_such_field"));
    }
}
