use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final action for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Let the request through untouched
    Allow,
    /// Deny with an access-denied page
    Block,
    /// Present a challenge (CAPTCHA) before letting the client proceed
    Challenge,
}

impl Action {
    /// Conventional HTTP status for this action.
    pub fn http_status(&self) -> u16 {
        match self {
            Action::Allow => 200,
            Action::Block => 403,
            Action::Challenge => 200,
        }
    }

    /// Stable lowercase name, used in audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Block => "block",
            Action::Challenge => "challenge",
        }
    }
}

/// Tri-state reputation classification result.
///
/// `Unknown` (provider error, timeout, no classifiable data) is distinct
/// from `Clean` and must never collapse into it before aggregation: it
/// causes fallthrough to the next provider in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Provider flagged the input
    Flagged,
    /// Provider affirmatively classified the input as clean
    Clean,
    /// Provider could not classify the input
    Unknown,
}

impl Verdict {
    pub fn is_flagged(&self) -> bool {
        matches!(self, Verdict::Flagged)
    }

    /// True for `Flagged` and `Clean`: verdicts that are safe to cache.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, Verdict::Unknown)
    }

    pub fn from_bool(flagged: bool) -> Self {
        if flagged {
            Verdict::Flagged
        } else {
            Verdict::Clean
        }
    }
}

/// The request-accessor boundary: everything the engine may ask of an
/// inbound HTTP request, already detached from any particular server
/// framework.
///
/// Header names are matched case-insensitively. `remote_addr` is the raw
/// peer address; the resolved client IP (which may instead come from a
/// forwarded-for header) is computed by the field resolver.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<Value>,
    pub remote_addr: Option<IpAddr>,
    pub http_version: String,
}

impl RequestInfo {
    /// Create a minimal GET request description.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: host.into(),
            path: path.into(),
            http_version: "HTTP/1.1".to_string(),
            ..Default::default()
        }
    }

    /// Add a header (chainable).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the raw peer address (chainable).
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// First header value for `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// User-Agent header, or empty string when absent.
    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Full request URL, reassembled from scheme, host, path and query.
    pub fn url(&self) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.host, self.path);
        if !self.query.is_empty() {
            let mut pairs: Vec<_> = self.query.iter().collect();
            pairs.sort();
            let qs: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        url
    }
}

/// Outcome of one evaluation: the action plus everything the host needs to
/// produce a response body through its renderer.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub http_status: u16,
    /// Template the host should render for non-allow outcomes
    /// (e.g. `"access_denied"`, `"oneclick_captcha"`); `None` for allow.
    pub template_id: Option<String>,
    pub render_variables: HashMap<String, String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
            http_status: Action::Allow.http_status(),
            template_id: None,
            render_variables: HashMap::new(),
        }
    }
}
