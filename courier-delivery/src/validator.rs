use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RejectReason;

const DISPOSABLE_DOMAINS: [&str; 10] = [
    "mailinator.com",
    "yopmail.com",
    "guerrillamail.com",
    "tempmail.com",
    "temp-mail.org",
    "fakeinbox.com",
    "throwawaymail.com",
    "sharklasers.com",
    "trash-mail.com",
    "getairmail.com",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Domains rejected in addition to the built-in disposable list
    #[serde(default)]
    pub disposable_domains: Vec<String>,
}

/// Recipient address check: shape plus a disposable-domain deny list.
///
/// A domain is denied when it equals a listed domain or is a subdomain of one.
#[derive(Debug, Clone)]
pub struct AddressValidator {
    denied: Vec<String>,
}

impl Default for AddressValidator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl AddressValidator {
    #[must_use]
    pub fn new(config: &ValidatorConfig) -> Self {
        let denied = DISPOSABLE_DOMAINS
            .iter()
            .map(|domain| (*domain).to_string())
            .chain(
                config
                    .disposable_domains
                    .iter()
                    .map(|domain| domain.trim().to_ascii_lowercase()),
            )
            .filter(|domain| !domain.is_empty())
            .collect();
        Self { denied }
    }

    /// # Errors
    ///
    /// Returns the reason `address` must not be delivered to.
    pub fn validate(&self, address: &str) -> Result<(), RejectReason> {
        let Some(domain) = well_formed_domain(address) else {
            warn!(address = %address, "Invalid email format");
            return Err(RejectReason::InvalidAddress(address.to_string()));
        };

        let domain = domain.to_ascii_lowercase();
        if self.is_denied(&domain) {
            warn!(address = %address, domain = %domain, "Disposable email domain detected");
            return Err(RejectReason::DisposableDomain(domain));
        }

        Ok(())
    }

    fn is_denied(&self, domain: &str) -> bool {
        self.denied.iter().any(|denied| {
            domain == denied
                || domain
                    .strip_suffix(denied.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// A subject is written into a single header line, so it may not contain
/// line breaks.
///
/// # Errors
///
/// Returns [`RejectReason::UnsafeSubject`] for a subject holding CR or LF.
pub fn validate_subject(subject: &str) -> Result<(), RejectReason> {
    if subject.contains(['\r', '\n']) {
        warn!("Subject contains a line break");
        return Err(RejectReason::UnsafeSubject);
    }
    Ok(())
}

/// `local@domain.tld`: exactly one `@`, no whitespace, non-empty local part,
/// and a dot in the domain with text on both sides of some dot.
fn well_formed_domain(address: &str) -> Option<&str> {
    if address.chars().any(char::is_whitespace) {
        return None;
    }

    let (local, domain) = address.split_once('@')?;
    if local.is_empty() || domain.contains('@') {
        return None;
    }

    let (head, tail) = domain.rsplit_once('.')?;
    (!head.is_empty() && !tail.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_format() {
        let validator = AddressValidator::default();
        assert!(validator.validate("user@example.com").is_ok());
        assert!(validator.validate("first.last+tag@mail.example.co.uk").is_ok());

        for bad in [
            "not-an-email",
            "@example.com",
            "user@",
            "user@example",
            "user@.com",
            "user@example.",
            "us er@example.com",
            "a@b@example.com",
            "",
        ] {
            assert_eq!(
                validator.validate(bad),
                Err(RejectReason::InvalidAddress(bad.to_string())),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_disposable_domains() {
        let validator = AddressValidator::default();
        assert_eq!(
            validator.validate("x@mailinator.com"),
            Err(RejectReason::DisposableDomain("mailinator.com".to_string()))
        );
        assert_eq!(
            validator.validate("x@Inbox.YopMail.com"),
            Err(RejectReason::DisposableDomain("inbox.yopmail.com".to_string()))
        );
        assert!(validator.validate("x@notmailinator.com").is_ok());
    }

    #[test]
    fn test_extra_domains() {
        let validator = AddressValidator::new(&ValidatorConfig {
            disposable_domains: vec![" Burner.Example ".to_string()],
        });
        assert!(validator.validate("x@burner.example").is_err());
        assert!(validator.validate("x@mailinator.com").is_err());
        assert!(validator.validate("x@example.com").is_ok());
    }

    #[test]
    fn test_subject_line_breaks() {
        assert!(validate_subject("Quarterly report (draft)").is_ok());
        assert!(validate_subject("Grüße aus Köln").is_ok());
        for bad in ["Hi\r\nBcc: victim@evil.example", "Hi\nBcc: x@y.z", "Hi\r"] {
            assert_eq!(validate_subject(bad), Err(RejectReason::UnsafeSubject));
        }
    }
}
