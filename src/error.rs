use thiserror::Error;

/// Classifies reputation provider failures for programmatic matching.
///
/// Every variant downgrades to an `Unknown` verdict during evaluation; these
/// kinds exist for logging and tests, not for aborting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Connection to the provider failed
    ConnectionFailed,
    /// Provider call exceeded its timeout
    Timeout,
    /// Response could not be parsed or carried no classifiable field
    InvalidResponse,
    /// DNS lookup failure
    DnsFailed,
}

/// Classifies GeoIP database errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoErrorKind {
    /// Required database path not configured
    NotConfigured,
    /// File open/read failure
    FileError,
    /// Data format or decoding error (corrupt file, wrong version, etc.)
    InvalidData,
}

/// Risk engine error types.
///
/// Per-request evaluation never surfaces these to the host: provider errors
/// collapse to `Unknown` verdicts and malformed rule atoms evaluate to
/// `false`. The variants below are returned from configuration load and
/// engine construction, where failing fast is the right behavior.
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Parse error at line {line}: {message}")]
    ParseErrorAtLine { line: usize, message: String },

    #[error("Invalid rule expression: {0}")]
    InvalidRule(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Provider error: {message}")]
    ProviderError {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("GeoIP error: {message}")]
    GeoIpError { kind: GeoErrorKind, message: String },

    #[error("Audit log error: {0}")]
    AuditError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RiskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_kind_is_matchable() {
        // Consumers should be able to programmatically match error sub-types
        // instead of parsing error message strings.
        let err = RiskError::ProviderError {
            kind: ProviderErrorKind::Timeout,
            message: "ip-api.com call timed out".into(),
        };
        match &err {
            RiskError::ProviderError { kind, .. } => {
                assert!(matches!(kind, ProviderErrorKind::Timeout));
            }
            _ => panic!("expected ProviderError"),
        }
    }

    #[test]
    fn test_provider_error_display_includes_message() {
        let err = RiskError::ProviderError {
            kind: ProviderErrorKind::InvalidResponse,
            message: "no proxy/hosting field in response".into(),
        };
        let display = format!("{}", err);
        assert!(display.contains("no proxy/hosting field"), "got: {}", display);
    }

    #[test]
    fn test_geo_error_kind_is_matchable() {
        let err = RiskError::GeoIpError {
            kind: GeoErrorKind::NotConfigured,
            message: "ASN database path not configured".into(),
        };
        match &err {
            RiskError::GeoIpError { kind, .. } => {
                assert!(matches!(kind, GeoErrorKind::NotConfigured));
            }
            _ => panic!("expected GeoIpError"),
        }
    }

    #[test]
    fn test_parse_error_at_line_display() {
        let err = RiskError::ParseErrorAtLine {
            line: 4,
            message: "missing '=>' separator".into(),
        };
        assert_eq!(
            format!("{}", err),
            "Parse error at line 4: missing '=>' separator"
        );
    }
}
