use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

use crate::config::LoggerConfig;

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    static ref PHONE_REGEX: Regex = Regex::new(r"(?:\+1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s][0-9]{4}\b").unwrap();
    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref MRN_REGEX: Regex = Regex::new(r"\bMRN[-:\s]?\d{4,}\b").unwrap();
    static ref DATE_REGEX: Regex = Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap();
    static ref IP_REGEX: Regex = Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").unwrap();
}

/// PHI redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_mrn: bool,
    pub redact_dates: bool,
    pub redact_ip_addresses: bool,
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_mrn: true,
            redact_dates: true,
            redact_ip_addresses: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl From<&LoggerConfig> for RedactionConfig {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            enabled: config.redaction_enabled,
            hash_for_correlation: config.hash_for_correlation,
            ..Self::default()
        }
    }
}

/// Scrubs identifiers out of free text (remote error bodies, user input echoed
/// back by a server) before it is attached to a log event.
#[derive(Debug, Clone, Default)]
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn from_logger_config(config: &LoggerConfig) -> Self {
        Self::new(RedactionConfig::from(config))
    }

    /// Add an organisation specific pattern, applied after the built-in ones.
    pub fn with_pattern(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.config.custom_patterns.push((pattern, replacement.into()));
        self
    }

    pub fn redact(&self, text: &str) -> String {
        if !self.config.enabled {
            return text.to_string();
        }

        let mut result = text.to_string();

        if self.config.redact_emails {
            result = self.replace(&EMAIL_REGEX, &result, "EMAIL", |email| {
                match email.split_once('@') {
                    Some((user, domain)) => format!(
                        "{}***@{}***",
                        user.chars().next().unwrap_or('*'),
                        domain.chars().next().unwrap_or('*')
                    ),
                    None => "***@***".to_string(),
                }
            });
        }

        // SSN before phone: the phone pattern would otherwise eat the digits
        if self.config.redact_ssn {
            result = self.replace(&SSN_REGEX, &result, "SSN", |_| "***-**-****".to_string());
        }

        if self.config.redact_phones {
            result = self.replace(&PHONE_REGEX, &result, "PHONE", |_| "(***) ***-****".to_string());
        }

        if self.config.redact_mrn {
            result = self.replace(&MRN_REGEX, &result, "MRN", |_| "MRN******".to_string());
        }

        if self.config.redact_dates {
            result = self.replace(&DATE_REGEX, &result, "DATE", |_| "****-**-**".to_string());
        }

        if self.config.redact_ip_addresses {
            result = self.replace(&IP_REGEX, &result, "IP", |ip| {
                let parts: Vec<&str> = ip.split('.').collect();
                match (parts.first(), parts.last()) {
                    (Some(first), Some(last)) if parts.len() == 4 => format!("{first}.***.***.{last}"),
                    _ => "***.***.***.***".to_string(),
                }
            });
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    fn replace<F>(&self, pattern: &Regex, text: &str, label: &str, mask: F) -> String
    where
        F: Fn(&str) -> String,
    {
        pattern
            .replace_all(text, |caps: &Captures| {
                let matched = caps.get(0).map_or("", |m| m.as_str());
                if self.config.hash_for_correlation {
                    format!("{label}[{}]", hash_value(matched))
                } else {
                    mask(matched)
                }
            })
            .to_string()
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    // First 8 bytes keep the tag short while staying stable across log lines
    general_purpose::STANDARD_NO_PAD.encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masking() -> PiiRedactor {
        PiiRedactor::new(RedactionConfig {
            hash_for_correlation: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_email_redaction() {
        let redacted = masking().redact("duplicate contact jane.doe@example.com");
        assert!(redacted.contains("j***@e***"));
        assert!(!redacted.contains("jane.doe"));
    }

    #[test]
    fn test_phone_and_ssn_redaction() {
        let redacted = masking().redact("call (555) 123-4567, ssn 123-45-6789");
        assert!(redacted.contains("(***) ***-****"));
        assert!(redacted.contains("***-**-****"));
        assert!(!redacted.contains("6789"));
    }

    #[test]
    fn test_mrn_and_birth_date_redaction() {
        let redacted = masking().redact("patient MRN123456 born 1984-02-29 rejected");
        assert_eq!(redacted, "patient MRN****** born ****-**-** rejected");
    }

    #[test]
    fn test_hashing_is_stable_for_correlation() {
        let redactor = PiiRedactor::default();
        let first = redactor.redact("owner a@b.org");
        let second = redactor.redact("owner a@b.org again");
        assert!(first.starts_with("owner EMAIL["));
        assert!(second.starts_with(&first));
    }

    #[test]
    fn test_disabled_redaction_passes_text_through() {
        let redactor = PiiRedactor::from_logger_config(&LoggerConfig {
            redaction_enabled: false,
            ..LoggerConfig::default()
        });
        assert_eq!(redactor.redact("MRN123456"), "MRN123456");
    }

    #[test]
    fn test_custom_pattern() {
        let redactor = masking().with_pattern(Regex::new(r"\bBed \d+\b").unwrap(), "Bed [REDACTED]");
        assert_eq!(redactor.redact("moved to Bed 12"), "moved to Bed [REDACTED]");
    }
}
