//! Built-in reputation providers.
//!
//! Every provider maps transport failures, timeouts, and unparseable
//! responses to [`Verdict::Unknown`] so the aggregator can fall through to
//! the next source.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{ProviderErrorKind, RiskError};
use crate::geo::is_hosting_operator;
use crate::types::Verdict;

use super::{ReputationKind, ReputationProvider};

/// Timeout for HTTP reputation lookups.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the ExoneratorProvider, which streams a larger page.
pub const EXONERATOR_TIMEOUT: Duration = Duration::from_secs(3);

/// Score at or above which getipintel.net classifies as malicious,
/// on a 0-100 scale.
pub const IPINTEL_SCORE_THRESHOLD: u32 = 90;

fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .new_agent()
}

/// Fold a transport failure into the provider error taxonomy. Every one of
/// these downgrades to `Verdict::Unknown` at the call site.
fn provider_error(provider: &str, e: ureq::Error) -> RiskError {
    let kind = match &e {
        ureq::Error::Timeout(_) => ProviderErrorKind::Timeout,
        ureq::Error::HostNotFound => ProviderErrorKind::DnsFailed,
        ureq::Error::Io(_) | ureq::Error::ConnectionFailed => ProviderErrorKind::ConnectionFailed,
        _ => ProviderErrorKind::InvalidResponse,
    };
    RiskError::ProviderError {
        kind,
        message: format!("{}: {}", provider, e),
    }
}

/// GET `url` and read the whole body as text.
fn fetch_text(agent: &ureq::Agent, provider: &str, url: &str) -> crate::error::Result<String> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| provider_error(provider, e))?;
    let (_, mut body) = response.into_parts();
    body.read_to_string().map_err(|e| provider_error(provider, e))
}

/// ip-api.com: flags proxies, hosting ranges, and hosting-operator ISPs.
pub struct IpApiProvider {
    agent: ureq::Agent,
    endpoint: String,
}

impl IpApiProvider {
    pub fn new() -> Self {
        Self::with_endpoint("http://ip-api.com")
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            agent: http_agent(PROVIDER_TIMEOUT),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for IpApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationProvider for IpApiProvider {
    fn name(&self) -> &str {
        "ipapi"
    }

    fn kind(&self) -> ReputationKind {
        ReputationKind::Malicious
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let url = format!("{}/json/{}?fields=proxy,hosting,isp", self.endpoint, ip);
        match fetch_text(&self.agent, "ipapi", &url) {
            Ok(text) => classify_ipapi(&text),
            Err(e) => {
                log::debug!("lookup for {} failed: {}", ip, e);
                Verdict::Unknown
            }
        }
    }
}

/// Classify an ip-api.com JSON body. A response missing both boolean
/// fields is inconclusive, not clean.
fn classify_ipapi(body: &str) -> Verdict {
    let data: Value = match serde_json::from_str(body) {
        Ok(data) => data,
        Err(_) => return Verdict::Unknown,
    };
    let proxy = data.get("proxy").and_then(Value::as_bool);
    let hosting = data.get("hosting").and_then(Value::as_bool);
    if proxy.is_none() && hosting.is_none() {
        return Verdict::Unknown;
    }
    if proxy == Some(true) || hosting == Some(true) {
        return Verdict::Flagged;
    }
    if let Some(isp) = data.get("isp").and_then(Value::as_str) {
        if is_hosting_operator(isp) {
            return Verdict::Flagged;
        }
    }
    Verdict::Clean
}

/// getipintel.net: probability-of-abuse score.
pub struct IpIntelProvider {
    agent: ureq::Agent,
    endpoint: String,
}

impl IpIntelProvider {
    pub fn new() -> Self {
        Self::with_endpoint("https://check.getipintel.net")
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            agent: http_agent(PROVIDER_TIMEOUT),
            endpoint: endpoint.into(),
        }
    }

    fn contact_for(ip: IpAddr) -> String {
        // The service requires a contact address; derive a stable local
        // part from the queried IP.
        let digest = Sha256::digest(ip.to_string().as_bytes());
        format!("{:02x}{:02x}{:02x}{:02x}@gmail.com", digest[0], digest[1], digest[2], digest[3])
    }
}

impl Default for IpIntelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationProvider for IpIntelProvider {
    fn name(&self) -> &str {
        "ipintel"
    }

    fn kind(&self) -> ReputationKind {
        ReputationKind::Malicious
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let url = format!(
            "{}/check.php?ip={}&contact={}",
            self.endpoint,
            ip,
            Self::contact_for(ip)
        );
        match fetch_text(&self.agent, "ipintel", &url) {
            Ok(text) => classify_ipintel(&text),
            Err(e) => {
                log::debug!("lookup for {} failed: {}", ip, e);
                Verdict::Unknown
            }
        }
    }
}

/// Classify a getipintel.net body. The service answers a bare number:
/// a probability in `0.0..=1.0`, an integer percentage, or a negative
/// error code. Error codes and garbage are inconclusive.
fn classify_ipintel(body: &str) -> Verdict {
    let score: f64 = match body.trim().parse() {
        Ok(score) => score,
        Err(_) => return Verdict::Unknown,
    };
    if score < 0.0 {
        // Negative values are service error codes
        return Verdict::Unknown;
    }
    let percent = if score <= 1.0 { score * 100.0 } else { score };
    Verdict::from_bool(percent >= IPINTEL_SCORE_THRESHOLD as f64)
}

/// Hostname resolution seam for [`DnsblProvider`].
pub trait HostResolver: Send + Sync {
    /// Resolve `host` to its addresses. `Ok(vec![])` or an NXDOMAIN-style
    /// error both mean "no answer".
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver.
pub struct SystemHostResolver;

impl HostResolver for SystemHostResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        // Port is irrelevant; ToSocketAddrs needs one to resolve.
        let addrs = (host, 0)
            .to_socket_addrs()?
            .map(|addr: SocketAddr| addr.ip())
            .collect();
        Ok(addrs)
    }
}

/// Fixed name-to-address table for tests.
#[derive(Default)]
pub struct StaticHostResolver {
    entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticHostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, addrs: Vec<IpAddr>) {
        self.entries.insert(host.into(), addrs);
    }
}

impl HostResolver for StaticHostResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        match self.entries.get(host) {
            Some(addrs) => Ok(addrs.clone()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such host",
            )),
        }
    }
}

/// Tor exit detection via a DNS blocklist zone. IPv4 only; the listed
/// sentinel answer is `127.0.0.2`.
pub struct DnsblProvider {
    zone: String,
    resolver: Box<dyn HostResolver>,
}

/// Answer meaning "listed" in the DNSBL zone.
const DNSBL_SENTINEL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

impl DnsblProvider {
    pub fn new() -> Self {
        Self::with_resolver("dnsel.torproject.org", Box::new(SystemHostResolver))
    }

    pub fn with_resolver(zone: impl Into<String>, resolver: Box<dyn HostResolver>) -> Self {
        Self {
            zone: zone.into(),
            resolver,
        }
    }

    /// Query name for `ip`: octets reversed, zone appended.
    fn query_name(&self, ip: Ipv4Addr) -> String {
        let [a, b, c, d] = ip.octets();
        format!("{}.{}.{}.{}.{}", d, c, b, a, self.zone)
    }
}

impl Default for DnsblProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationProvider for DnsblProvider {
    fn name(&self) -> &str {
        "dnsbl"
    }

    fn kind(&self) -> ReputationKind {
        ReputationKind::Tor
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let ipv4 = match ip {
            IpAddr::V4(ipv4) => ipv4,
            // The zone only covers IPv4; defer to other providers
            IpAddr::V6(_) => return Verdict::Unknown,
        };
        match self.resolver.resolve(&self.query_name(ipv4)) {
            Ok(addrs) => {
                Verdict::from_bool(addrs.contains(&IpAddr::V4(DNSBL_SENTINEL)))
            }
            Err(e) => {
                // NXDOMAIN and resolver outage are indistinguishable here
                log::debug!("dnsbl lookup for {} failed: {}", ip, e);
                Verdict::Unknown
            }
        }
    }
}

/// Tor exit detection via the ExoneraTor web service.
///
/// The result page is large; the body is streamed in small chunks and the
/// scan stops as soon as the positive marker appears.
pub struct ExoneratorProvider {
    agent: ureq::Agent,
    endpoint: String,
}

const EXONERATOR_CHUNK: usize = 128;
const EXONERATOR_MARKER: &str = "Result is positive";
/// Upper bound on how much of the page is scanned before giving up.
const EXONERATOR_SCAN_LIMIT: usize = 512 * 1024;

impl ExoneratorProvider {
    pub fn new() -> Self {
        Self::with_endpoint("https://metrics.torproject.org")
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            agent: http_agent(EXONERATOR_TIMEOUT),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for ExoneratorProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationProvider for ExoneratorProvider {
    fn name(&self) -> &str {
        "exonerator"
    }

    fn kind(&self) -> ReputationKind {
        ReputationKind::Tor
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        // The service indexes by day with a publication lag
        let date = (Utc::now() - chrono::Duration::days(2)).format("%Y-%m-%d");
        let url = format!(
            "{}/exonerator.html?ip={}&timestamp={}&lang=en",
            self.endpoint, ip, date
        );
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(e) => {
                log::debug!("lookup for {} failed: {}", ip, provider_error("exonerator", e));
                return Verdict::Unknown;
            }
        };
        let (_, body) = response.into_parts();
        scan_for_marker(body.into_reader())
    }
}

/// Stream `reader` and look for the positive marker, returning as soon as
/// it is seen. A read error before a conclusion is inconclusive.
fn scan_for_marker(mut reader: impl Read) -> Verdict {
    let mut page = String::new();
    let mut chunk = [0u8; EXONERATOR_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Verdict::Clean,
            Ok(n) => n,
            Err(e) => {
                log::debug!("exonerator stream failed: {}", e);
                return Verdict::Unknown;
            }
        };
        page.push_str(&String::from_utf8_lossy(&chunk[..n]));
        if page.contains(EXONERATOR_MARKER) {
            return Verdict::Flagged;
        }
        if page.len() >= EXONERATOR_SCAN_LIMIT {
            return Verdict::Clean;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_classify_ipapi_proxy() {
        let body = r#"{"proxy": true, "hosting": false, "isp": "Example Net"}"#;
        assert_eq!(classify_ipapi(body), Verdict::Flagged);
    }

    #[test]
    fn test_classify_ipapi_hosting() {
        let body = r#"{"proxy": false, "hosting": true, "isp": "Example Net"}"#;
        assert_eq!(classify_ipapi(body), Verdict::Flagged);
    }

    #[test]
    fn test_classify_ipapi_hosting_isp() {
        let body = r#"{"proxy": false, "hosting": false, "isp": "Hetzner Online GmbH"}"#;
        assert_eq!(classify_ipapi(body), Verdict::Flagged);
    }

    #[test]
    fn test_classify_ipapi_clean() {
        let body = r#"{"proxy": false, "hosting": false, "isp": "Residential ISP"}"#;
        assert_eq!(classify_ipapi(body), Verdict::Clean);
    }

    #[test]
    fn test_classify_ipapi_missing_fields_is_unknown() {
        assert_eq!(classify_ipapi(r#"{"status": "fail"}"#), Verdict::Unknown);
        assert_eq!(classify_ipapi("not json"), Verdict::Unknown);
    }

    #[test]
    fn test_classify_ipintel_scales() {
        assert_eq!(classify_ipintel("0.95"), Verdict::Flagged);
        assert_eq!(classify_ipintel("0.5"), Verdict::Clean);
        assert_eq!(classify_ipintel("95"), Verdict::Flagged);
        assert_eq!(classify_ipintel("12"), Verdict::Clean);
        assert_eq!(classify_ipintel("1"), Verdict::Flagged);
    }

    #[test]
    fn test_classify_ipintel_error_codes() {
        assert_eq!(classify_ipintel("-1"), Verdict::Unknown);
        assert_eq!(classify_ipintel("-5"), Verdict::Unknown);
        assert_eq!(classify_ipintel(""), Verdict::Unknown);
        assert_eq!(classify_ipintel("<html>"), Verdict::Unknown);
    }

    #[test]
    fn test_dnsbl_query_name_reverses_octets() {
        let provider = DnsblProvider::new();
        let name = provider.query_name(Ipv4Addr::new(203, 0, 113, 9));
        assert_eq!(name, "9.113.0.203.dnsel.torproject.org");
    }

    #[test]
    fn test_dnsbl_sentinel_flags() {
        let mut resolver = StaticHostResolver::new();
        resolver.insert(
            "9.113.0.203.torbl.example",
            vec!["127.0.0.2".parse().unwrap()],
        );
        let provider = DnsblProvider::with_resolver("torbl.example", Box::new(resolver));
        assert_eq!(
            provider.check("203.0.113.9".parse().unwrap()),
            Verdict::Flagged
        );
    }

    #[test]
    fn test_dnsbl_other_answer_is_clean() {
        let mut resolver = StaticHostResolver::new();
        resolver.insert(
            "9.113.0.203.torbl.example",
            vec!["127.0.0.1".parse().unwrap()],
        );
        let provider = DnsblProvider::with_resolver("torbl.example", Box::new(resolver));
        assert_eq!(
            provider.check("203.0.113.9".parse().unwrap()),
            Verdict::Clean
        );
    }

    #[test]
    fn test_dnsbl_no_answer_is_unknown() {
        let provider =
            DnsblProvider::with_resolver("torbl.example", Box::new(StaticHostResolver::new()));
        assert_eq!(
            provider.check("203.0.113.9".parse().unwrap()),
            Verdict::Unknown
        );
    }

    #[test]
    fn test_dnsbl_skips_ipv6() {
        let provider =
            DnsblProvider::with_resolver("torbl.example", Box::new(StaticHostResolver::new()));
        assert_eq!(
            provider.check("2001:db8::1".parse().unwrap()),
            Verdict::Unknown
        );
    }

    #[test]
    fn test_scan_finds_marker() {
        let page = format!("{}Result is positive{}", "x".repeat(300), "y".repeat(300));
        assert_eq!(scan_for_marker(Cursor::new(page)), Verdict::Flagged);
    }

    #[test]
    fn test_scan_clean_page() {
        let page = format!("{}Result is negative{}", "x".repeat(300), "y".repeat(300));
        assert_eq!(scan_for_marker(Cursor::new(page)), Verdict::Clean);
    }

    #[test]
    fn test_scan_marker_across_chunk_boundary() {
        // Position the marker so it straddles a 128-byte read
        let page = format!("{}Result is positive", "x".repeat(120));
        assert_eq!(scan_for_marker(Cursor::new(page)), Verdict::Flagged);
    }

    #[test]
    fn test_scan_stops_at_marker() {
        struct FailAfter<R> {
            inner: R,
            remaining: usize,
        }
        impl<R: Read> Read for FailAfter<R> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.remaining == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "read past marker",
                    ));
                }
                let cap = buf.len().min(self.remaining);
                let n = self.inner.read(&mut buf[..cap])?;
                self.remaining -= n;
                Ok(n)
            }
        }

        // Marker fits in the first two chunks; reads beyond that fail, so a
        // full-body scan would return Unknown instead of Flagged.
        let page = format!("{}Result is positive{}", "x".repeat(100), "z".repeat(4096));
        let reader = FailAfter {
            inner: Cursor::new(page),
            remaining: 256,
        };
        assert_eq!(scan_for_marker(reader), Verdict::Flagged);
    }

    #[test]
    fn test_scan_read_error_is_unknown() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            }
        }
        assert_eq!(scan_for_marker(Broken), Verdict::Unknown);
    }

    #[test]
    fn test_ipintel_contact_is_stable() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let a = IpIntelProvider::contact_for(ip);
        let b = IpIntelProvider::contact_for(ip);
        assert_eq!(a, b);
        assert!(a.ends_with("@gmail.com"));
    }
}
