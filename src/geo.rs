//! GeoIP/ASN data providers.
//!
//! Providers advertise the field names they can supply; the field resolver
//! walks the configured list in order and the first provider carrying a
//! requested field wins. The MMDB-backed provider reads MaxMind GeoLite2
//! databases (city, ASN, anonymous-IP).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{GeoErrorKind, Result, RiskError};

/// ISP/ASN organization fragments that mark hosting, proxy, and CDN
/// operators. An IP attributed to one of these is not residential traffic.
pub const HOSTING_OPERATORS: &[&str] = &[
    "Fastly",
    "Incapsula",
    "Akamai",
    "AkamaiGslb",
    "Google",
    "Datacamp Limited",
    "Bing",
    "Censys",
    "Hetzner",
    "Linode",
    "Amazon",
    "AWS",
    "DigitalOcean",
    "Vultr",
    "Azure",
    "Alibaba",
    "Netlify",
    "IBM",
    "Oracle",
    "Scaleway",
    "Cloud",
];

/// True when an ISP/ASN organization name matches the hosting deny-list.
pub fn is_hosting_operator(name: &str) -> bool {
    let name = name.to_lowercase();
    HOSTING_OPERATORS
        .iter()
        .any(|op| name.contains(&op.to_lowercase()))
}

/// Source of per-IP attributes (country, ASN, anonymity flags).
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Field names this provider can supply.
    fn fields(&self) -> &[String];

    /// Attributes for `ip`, or `None` when the database has no record.
    fn lookup(&self, ip: IpAddr) -> Option<Map<String, Value>>;
}

/// Database flavor of an MMDB file, determining the decoded field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmdbKind {
    City,
    Asn,
    Anonymous,
}

impl MmdbKind {
    fn field_names(&self) -> Vec<String> {
        let names: &[&str] = match self {
            MmdbKind::City => &["country", "continent", "city"],
            MmdbKind::Asn => &["asn", "asn_organization"],
            MmdbKind::Anonymous => &[
                "is_anonymous",
                "is_anonymous_vpn",
                "is_hosting_provider",
                "is_public_proxy",
                "is_residential_proxy",
                "is_tor_exit_node",
            ],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    fn name(&self) -> &'static str {
        match self {
            MmdbKind::City => "geoip-city",
            MmdbKind::Asn => "geoip-asn",
            MmdbKind::Anonymous => "geoip-anonymous",
        }
    }
}

#[derive(Deserialize)]
struct CityRecord {
    country: Option<NamedCode>,
    continent: Option<NamedCode>,
    city: Option<LocalizedName>,
}

#[derive(Deserialize)]
struct NamedCode {
    #[serde(alias = "code")]
    iso_code: Option<String>,
}

#[derive(Deserialize)]
struct LocalizedName {
    names: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
    autonomous_system_organization: Option<String>,
}

#[derive(Deserialize)]
#[serde(default)]
struct AnonymousRecord {
    is_anonymous: bool,
    is_anonymous_vpn: bool,
    is_hosting_provider: bool,
    is_public_proxy: bool,
    is_residential_proxy: bool,
    is_tor_exit_node: bool,
}

impl Default for AnonymousRecord {
    fn default() -> Self {
        Self {
            is_anonymous: false,
            is_anonymous_vpn: false,
            is_hosting_provider: false,
            is_public_proxy: false,
            is_residential_proxy: false,
            is_tor_exit_node: false,
        }
    }
}

/// MaxMind MMDB database provider.
///
/// The reader is shared: MMDB files can hold millions of networks and the
/// maxminddb crate is optimized for on-demand lookups, so nothing is
/// pre-loaded.
pub struct MmdbGeoProvider {
    reader: Arc<maxminddb::Reader<Vec<u8>>>,
    kind: MmdbKind,
    field_names: Vec<String>,
}

impl MmdbGeoProvider {
    pub fn open(path: impl AsRef<Path>, kind: MmdbKind) -> Result<Self> {
        let reader =
            maxminddb::Reader::open_readfile(path.as_ref()).map_err(|e| RiskError::GeoIpError {
                kind: GeoErrorKind::FileError,
                message: format!("failed to open MMDB {}: {}", path.as_ref().display(), e),
            })?;
        Ok(Self {
            reader: Arc::new(reader),
            kind,
            field_names: kind.field_names(),
        })
    }

    fn decode(&self, ip: IpAddr) -> Option<Map<String, Value>> {
        let result = self.reader.lookup(ip).ok()?;
        let mut map = Map::new();

        match self.kind {
            MmdbKind::City => {
                let record: CityRecord = result.decode().ok()??;
                if let Some(code) = record.country.and_then(|c| c.iso_code) {
                    map.insert("country".to_string(), Value::String(code));
                }
                if let Some(code) = record.continent.and_then(|c| c.iso_code) {
                    map.insert("continent".to_string(), Value::String(code));
                }
                if let Some(name) = record
                    .city
                    .and_then(|c| c.names)
                    .and_then(|mut names| names.remove("en"))
                {
                    map.insert("city".to_string(), Value::String(name));
                }
            }
            MmdbKind::Asn => {
                let record: AsnRecord = result.decode().ok()??;
                if let Some(number) = record.autonomous_system_number {
                    map.insert("asn".to_string(), Value::Number(number.into()));
                }
                if let Some(org) = record.autonomous_system_organization {
                    map.insert("asn_organization".to_string(), Value::String(org));
                }
            }
            MmdbKind::Anonymous => {
                let record: AnonymousRecord = result.decode().ok()??;
                map.insert("is_anonymous".to_string(), record.is_anonymous.into());
                map.insert(
                    "is_anonymous_vpn".to_string(),
                    record.is_anonymous_vpn.into(),
                );
                map.insert(
                    "is_hosting_provider".to_string(),
                    record.is_hosting_provider.into(),
                );
                map.insert("is_public_proxy".to_string(), record.is_public_proxy.into());
                map.insert(
                    "is_residential_proxy".to_string(),
                    record.is_residential_proxy.into(),
                );
                map.insert(
                    "is_tor_exit_node".to_string(),
                    record.is_tor_exit_node.into(),
                );
            }
        }

        if map.is_empty() {
            None
        } else {
            Some(map)
        }
    }
}

impl GeoProvider for MmdbGeoProvider {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn fields(&self) -> &[String] {
        &self.field_names
    }

    fn lookup(&self, ip: IpAddr) -> Option<Map<String, Value>> {
        self.decode(ip)
    }
}

/// In-memory provider with predefined records, for tests and fixtures.
pub struct MemoryGeoProvider {
    name: String,
    field_names: Vec<String>,
    records: HashMap<IpAddr, Map<String, Value>>,
}

impl MemoryGeoProvider {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            field_names: fields.iter().map(|s| s.to_string()).collect(),
            records: HashMap::new(),
        }
    }

    pub fn insert(&mut self, ip: IpAddr, record: Map<String, Value>) {
        self.records.insert(ip, record);
    }
}

impl GeoProvider for MemoryGeoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[String] {
        &self.field_names
    }

    fn lookup(&self, ip: IpAddr) -> Option<Map<String, Value>> {
        self.records.get(&ip).cloned()
    }
}

/// Provider that never returns data.
pub struct NilGeoProvider;

impl GeoProvider for NilGeoProvider {
    fn name(&self) -> &str {
        "nil"
    }

    fn fields(&self) -> &[String] {
        &[]
    }

    fn lookup(&self, _ip: IpAddr) -> Option<Map<String, Value>> {
        None
    }
}

/// Local last-resort malicious classification from geo attributes: any
/// anonymous-network flag, or an ASN organization on the hosting deny-list.
pub fn is_geo_flagged(record: &Map<String, Value>) -> bool {
    const FLAG_FIELDS: &[&str] = &[
        "is_anonymous",
        "is_anonymous_vpn",
        "is_hosting_provider",
        "is_public_proxy",
        "is_tor_exit_node",
    ];
    for field in FLAG_FIELDS {
        if record.get(*field).and_then(Value::as_bool) == Some(true) {
            return true;
        }
    }
    if let Some(org) = record.get("asn_organization").and_then(Value::as_str) {
        if is_hosting_operator(org) {
            return true;
        }
    }
    false
}
