//! Typed engine configuration.
//!
//! [`Settings`] enumerates every recognized option with its default, replacing
//! the loosely keyed dictionaries such systems tend to grow. Rules override
//! settings through [`SettingsPatch`], a partial-update struct that rejects
//! unknown keys at load time.
//!
//! Ruleset text format, one rule per line in precedence order (later-matching
//! rules win on key collision):
//!
//! ```text
//! # staff network bypasses everything
//! ip isin ["198.51.100.10","198.51.100.11"] => {"action": "allow"}
//! path startswith /admin => {"action": "fight", "hardness": 3}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskError};
use crate::rules::{parse_expr, FieldMap, RuleExpr};

/// Default provider list, in precedence order.
pub const DEFAULT_THIRD_PARTIES: &[&str] = &["ipapi", "ipintel", "dnsbl", "exonerator", "geoip"];

/// Default TTL for client verification, in seconds.
pub const DEFAULT_VERIFICATION_AGE: u64 = 3600;

/// Configured base action.
///
/// `Auto` runs the full suspicion cascade; the others short-circuit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSetting {
    Auto,
    Allow,
    Block,
    /// Challenge unconditionally, skipping reputation checks
    Fight,
    /// Like `Auto`, but suspicious clients are blocked instead of challenged
    BlockIfSuspicious,
}

/// Challenge flavor presented to suspicious clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaType {
    Oneclick,
    Multiclick,
    Trueclick,
}

/// UI theme for rendered pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

/// Effective configuration for one request.
///
/// Construction starts from [`Settings::default`]; rule overrides are layered
/// on through [`SettingsPatch::apply`]. The resolved value is immutable for
/// the remainder of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub action: ActionSetting,
    pub captcha_type: CaptchaType,
    /// Challenge difficulty, 1-3
    pub hardness: u8,
    /// Seconds a passed verification stays valid
    pub verification_age: u64,
    pub store_anonymously: bool,

    /// Challenge dataset name
    pub dataset: String,
    /// (keys, images per key)
    pub dataset_size: (u32, u32),

    pub enable_rate_limit: bool,
    /// (max requests, window seconds)
    pub rate_limit: (u32, u32),

    pub enable_queue: bool,
    pub client_limit: u32,

    /// Treat known crawler user agents as suspicious
    pub block_crawlers: bool,
    pub crawler_hints: bool,

    pub enable_trueclick: bool,
    pub trueclick_hardness: u8,

    pub theme: Theme,
    pub language: String,
    pub without_cookies: bool,
    pub without_watermark: bool,

    pub debug: bool,
    /// Enabled reputation/geo providers, in precedence order
    pub third_parties: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            action: ActionSetting::Auto,
            captcha_type: CaptchaType::Oneclick,
            hardness: 1,
            verification_age: DEFAULT_VERIFICATION_AGE,
            store_anonymously: true,
            dataset: "keys".to_string(),
            dataset_size: (20, 100),
            enable_rate_limit: false,
            rate_limit: (15, 300),
            enable_queue: false,
            client_limit: 20,
            block_crawlers: false,
            crawler_hints: true,
            enable_trueclick: false,
            trueclick_hardness: 2,
            theme: Theme::Light,
            language: "en".to_string(),
            without_cookies: false,
            without_watermark: false,
            debug: false,
            third_parties: DEFAULT_THIRD_PARTIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Validate value ranges. Called once at engine construction; a failure
    /// here is the single fatal configuration class.
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.hardness) {
            return Err(RiskError::ConfigError(format!(
                "hardness must be 1-3, got {}",
                self.hardness
            )));
        }
        if !(1..=3).contains(&self.trueclick_hardness) {
            return Err(RiskError::ConfigError(format!(
                "trueclick_hardness must be 1-3, got {}",
                self.trueclick_hardness
            )));
        }
        if self.dataset_size.0 > self.dataset_size.1 {
            return Err(RiskError::ConfigError(format!(
                "dataset_size keys ({}) exceeds images per key ({})",
                self.dataset_size.0, self.dataset_size.1
            )));
        }
        if self.enable_rate_limit && (self.rate_limit.0 == 0 || self.rate_limit.1 == 0) {
            return Err(RiskError::ConfigError(
                "rate_limit requires a non-zero request count and window".to_string(),
            ));
        }
        if self.verification_age == 0 {
            return Err(RiskError::ConfigError(
                "verification_age must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse settings from a JSON document. Absent keys keep their
    /// defaults; unknown keys and out-of-range values are load-time errors.
    pub fn from_json(text: &str) -> Result<Self> {
        let patch: SettingsPatch = serde_json::from_str(text)?;
        let mut settings = Settings::default();
        patch.apply(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Whether the named third-party provider is enabled.
    pub fn provider_enabled(&self, name: &str) -> bool {
        self.third_parties.iter().any(|p| p == name)
    }
}

/// Partial settings update applied when a rule matches.
///
/// Deserialization rejects unknown keys so a typo in a ruleset surfaces at
/// load time instead of silently never applying.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub action: Option<ActionSetting>,
    pub captcha_type: Option<CaptchaType>,
    pub hardness: Option<u8>,
    pub verification_age: Option<u64>,
    pub store_anonymously: Option<bool>,
    pub dataset: Option<String>,
    pub dataset_size: Option<(u32, u32)>,
    pub enable_rate_limit: Option<bool>,
    pub rate_limit: Option<(u32, u32)>,
    pub enable_queue: Option<bool>,
    pub client_limit: Option<u32>,
    pub block_crawlers: Option<bool>,
    pub crawler_hints: Option<bool>,
    pub enable_trueclick: Option<bool>,
    pub trueclick_hardness: Option<u8>,
    pub theme: Option<Theme>,
    pub language: Option<String>,
    pub without_cookies: Option<bool>,
    pub without_watermark: Option<bool>,
    pub debug: Option<bool>,
    pub third_parties: Option<Vec<String>>,
}

macro_rules! apply_field {
    ($self:ident, $target:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$self.$field {
                $target.$field = value.clone();
            }
        )+
    };
}

impl SettingsPatch {
    /// Overlay every present key onto `target`.
    pub fn apply(&self, target: &mut Settings) {
        apply_field!(
            self, target, action, captcha_type, hardness, verification_age, store_anonymously,
            dataset, dataset_size, enable_rate_limit, rate_limit, enable_queue, client_limit,
            block_crawlers, crawler_hints, enable_trueclick, trueclick_hardness, theme, language,
            without_cookies, without_watermark, debug, third_parties,
        );
    }
}

/// One rule with the overrides it triggers.
#[derive(Debug, Clone)]
pub struct Rule {
    pub expr: RuleExpr,
    pub patch: SettingsPatch,
    /// Line number in the ruleset text, 0 for programmatic rules
    pub line_num: usize,
}

/// Ordered rule collection. Iteration order is precedence order: a
/// later-matching rule overwrites earlier overrides on key collision.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a ruleset from text. Each non-comment line is
    /// `<expression> => <json override object>`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();

        for (line_num, line) in text.lines().enumerate() {
            let line_num = line_num + 1; // 1-based line numbers

            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (expr_text, patch_text) =
                line.split_once("=>").ok_or_else(|| RiskError::ParseErrorAtLine {
                    line: line_num,
                    message: format!("missing '=>' separator: {}", line),
                })?;

            let expr = parse_expr(expr_text).map_err(|e| RiskError::ParseErrorAtLine {
                line: line_num,
                message: e.to_string(),
            })?;

            let patch: SettingsPatch =
                serde_json::from_str(patch_text.trim()).map_err(|e| RiskError::ParseErrorAtLine {
                    line: line_num,
                    message: format!("invalid override object: {}", e),
                })?;

            rules.push(Rule {
                expr,
                patch,
                line_num,
            });
        }

        Ok(Self { rules })
    }

    /// Read and parse a ruleset file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Append a programmatic rule.
    pub fn push(&mut self, expr: RuleExpr, patch: SettingsPatch) {
        self.rules.push(Rule {
            expr,
            patch,
            line_num: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Every field name referenced by any rule, deduplicated.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for rule in &self.rules {
            rule.expr.collect_fields(&mut out);
        }
        out
    }
}

/// Merge defaults with the overrides of every matching rule.
///
/// Deterministic for fixed field data; the caller memoizes the result for
/// the rest of the request.
pub fn resolve_settings(defaults: &Settings, ruleset: &Ruleset, fields: &FieldMap) -> Settings {
    let mut settings = defaults.clone();
    for rule in ruleset.iter() {
        if rule.expr.matches(fields) {
            log::debug!("rule at line {} matched, applying overrides", rule.line_num);
            rule.patch.apply(&mut settings);
        }
    }
    settings
}
