use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Authentication,
    QuotaExceeded,
    VoiceNotFound,
    EngineUnavailable,
    InvalidText,
    Timeout,
    Configuration,
    System,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Network,
        ErrorKind::Authentication,
        ErrorKind::QuotaExceeded,
        ErrorKind::VoiceNotFound,
        ErrorKind::EngineUnavailable,
        ErrorKind::InvalidText,
        ErrorKind::Timeout,
        ErrorKind::Configuration,
        ErrorKind::System,
        ErrorKind::Unknown,
    ];

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Authentication | ErrorKind::Configuration => Severity::Critical,
            ErrorKind::Network
            | ErrorKind::QuotaExceeded
            | ErrorKind::EngineUnavailable
            | ErrorKind::System => Severity::High,
            ErrorKind::VoiceNotFound | ErrorKind::Timeout | ErrorKind::Unknown => Severity::Medium,
            ErrorKind::InvalidText => Severity::Low,
        }
    }

    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::EngineUnavailable
                | ErrorKind::VoiceNotFound
                | ErrorKind::InvalidText
        )
    }

    pub fn suggested_action(self) -> &'static str {
        match self {
            ErrorKind::Network => "Check network connectivity to the synthesis service",
            ErrorKind::Authentication => "Verify the engine's API key or credentials",
            ErrorKind::QuotaExceeded => "Wait for the quota window to reset or raise the plan limit",
            ErrorKind::VoiceNotFound => "Check the voice mapping for this engine",
            ErrorKind::EngineUnavailable => "Install or restart the synthesis engine",
            ErrorKind::InvalidText => "Remove unsupported characters or shorten the text",
            ErrorKind::Timeout => "Increase the backend timeout or reduce text length",
            ErrorKind::Configuration => "Review the gateway and engine configuration",
            ErrorKind::System => "Check host resources (memory, disk, processes)",
            ErrorKind::Unknown => "Inspect the engine logs for details",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::VoiceNotFound => "voice_not_found",
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::InvalidText => "invalid_text",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
            ErrorKind::System => "system",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A backend failure after classification. This is the only shape in which engine
/// errors travel past the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub engine: String,
    pub message: String,
    pub recoverable: bool,
    pub suggested_action: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.engine, self.kind, self.message)
    }
}

lazy_static! {
    // Ordered: the first group that matches decides the kind.
    static ref KEYWORD_GROUPS: Vec<(ErrorKind, Regex)> = vec![
        (
            ErrorKind::Authentication,
            Regex::new(r"(?i)\b(401|403)\b|unauthori[sz]ed|forbidden|authenticat|api[ _-]?key|invalid key|credential|access denied").unwrap(),
        ),
        (
            ErrorKind::QuotaExceeded,
            Regex::new(r"(?i)\b429\b|quota|rate[ _-]?limit|too many requests|limit exceeded|billing|insufficient (credit|balance)").unwrap(),
        ),
        (
            ErrorKind::Timeout,
            Regex::new(r"(?i)time[ _-]?out|timed out|deadline exceeded").unwrap(),
        ),
        (
            ErrorKind::Network,
            Regex::new(r"(?i)network|connection|connect error|\bdns\b|unreachable|refused|reset by peer|socket|\btls\b|\bssl\b|host not found|name resolution").unwrap(),
        ),
        (
            ErrorKind::VoiceNotFound,
            Regex::new(r"(?i)voice (not found|unavailable|not supported)|unknown voice|invalid voice|no such voice|model not found").unwrap(),
        ),
        (
            ErrorKind::EngineUnavailable,
            Regex::new(r"(?i)\b(502|503)\b|unavailable|not available|not installed|not initiali[sz]ed|no such file|command not found|service down|not ready").unwrap(),
        ),
        (
            ErrorKind::InvalidText,
            Regex::new(r"(?i)invalid text|text too long|too long|empty text|invalid character|unsupported character|encoding|utf-?8|ssml|invalid input").unwrap(),
        ),
        (
            ErrorKind::Configuration,
            Regex::new(r"(?i)config|not configured|missing setting|invalid url|relative url|builder error").unwrap(),
        ),
        (
            ErrorKind::System,
            Regex::new(r"(?i)out of memory|\bmemory\b|disk|no space|i/o error|broken pipe|panic|internal error|\b500\b|killed|segmentation").unwrap(),
        ),
    ];
}

/// Keyword-based, stateless classification of raw engine error text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn kind_of(raw_message: &str) -> ErrorKind {
        KEYWORD_GROUPS
            .iter()
            .find(|(_, pattern)| pattern.is_match(raw_message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn classify(&self, raw_message: &str, engine: &str) -> ClassifiedError {
        let kind = Self::kind_of(raw_message);
        ClassifiedError {
            kind,
            severity: kind.severity(),
            engine: engine.to_string(),
            message: raw_message.to_string(),
            recoverable: kind.is_recoverable(),
            suggested_action: kind.suggested_action().to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_groups() {
        let cases = [
            ("HTTP 401 Unauthorized", ErrorKind::Authentication),
            ("Invalid API key supplied", ErrorKind::Authentication),
            ("429 Too Many Requests", ErrorKind::QuotaExceeded),
            ("monthly quota used up", ErrorKind::QuotaExceeded),
            ("request timed out after 15000ms", ErrorKind::Timeout),
            ("Connection refused (os error 111)", ErrorKind::Network),
            ("Voice not found: en-XX-Nobody", ErrorKind::VoiceNotFound),
            ("Piper model not found locally for voice: x", ErrorKind::VoiceNotFound),
            ("service unavailable", ErrorKind::EngineUnavailable),
            ("No such file or directory (os error 2)", ErrorKind::EngineUnavailable),
            ("text too long for engine", ErrorKind::InvalidText),
            ("engine not configured", ErrorKind::Configuration),
            ("out of memory", ErrorKind::System),
            ("something odd happened", ErrorKind::Unknown),
        ];
        for (message, kind) in cases {
            assert_eq!(ErrorClassifier::kind_of(message), kind, "{}", message);
        }
    }

    #[test]
    fn test_status_codes_are_word_bounded() {
        assert_eq!(ErrorClassifier::kind_of("exit code 14015"), ErrorKind::Unknown);
    }

    #[test]
    fn test_first_group_wins() {
        // Mentions both a timeout and a connection; timeout is checked first.
        assert_eq!(
            ErrorClassifier::kind_of("connection timed out"),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_severity_and_recoverability_tables() {
        let err = ErrorClassifier::new().classify("403 forbidden", "remote");
        assert_eq!(err.severity, Severity::Critical);
        assert!(!err.recoverable);
        assert_eq!(err.engine, "remote");

        let err = ErrorClassifier::new().classify("unsupported character", "espeak");
        assert_eq!(err.kind, ErrorKind::InvalidText);
        assert_eq!(err.severity, Severity::Low);
        assert!(err.recoverable);

        let recoverable: Vec<_> = ErrorKind::ALL
            .iter()
            .filter(|k| k.is_recoverable())
            .copied()
            .collect();
        assert_eq!(
            recoverable,
            vec![
                ErrorKind::Network,
                ErrorKind::VoiceNotFound,
                ErrorKind::EngineUnavailable,
                ErrorKind::InvalidText,
                ErrorKind::Timeout,
            ]
        );
    }
}
