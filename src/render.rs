//! Response rendering seam.
//!
//! The engine never produces HTML itself; it picks a template id and a set
//! of string variables, and the host's [`Renderer`] turns those into a
//! response body in whatever templating system it already uses.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::Utc;

use crate::settings::Settings;
use crate::types::RequestInfo;

/// Template for blocked requests.
pub const TEMPLATE_ACCESS_DENIED: &str = "access_denied";
/// Template for the single-click challenge page.
pub const TEMPLATE_ONECLICK_CAPTCHA: &str = "oneclick_captcha";

/// Host-side template renderer.
pub trait Renderer: Send + Sync {
    fn render(&self, template_id: &str, variables: &HashMap<String, String>) -> String;
}

/// Renderer producing a minimal plain-text body, used when the host does
/// not supply one.
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, template_id: &str, variables: &HashMap<String, String>) -> String {
        let mut pairs: Vec<_> = variables.iter().collect();
        pairs.sort();
        let detail: Vec<String> = pairs.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        format!("[{}]\n{}", template_id, detail.join("\n"))
    }
}

/// The variable set every template receives.
pub fn render_variables(
    request: &RequestInfo,
    settings: &Settings,
    client_ip: Option<IpAddr>,
    ray_id: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("domain".to_string(), request.host.clone());
    vars.insert("path".to_string(), request.path.clone());
    vars.insert("ray_id".to_string(), ray_id.to_string());
    vars.insert("theme".to_string(), settings.theme.as_str().to_string());
    vars.insert("language".to_string(), settings.language.clone());
    vars.insert(
        "client_ip".to_string(),
        client_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
    );
    vars.insert(
        "client_user_agent".to_string(),
        request.user_agent().to_string(),
    );
    vars.insert(
        "timestamp".to_string(),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    vars
}
