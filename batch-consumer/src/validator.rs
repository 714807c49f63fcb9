use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::message::{Record, RecordId};

/// A single violated rule on a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, rule: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_owned(),
            rule: rule.to_owned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.rule, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub record_id: RecordId,
    pub field_errors: Vec<FieldError>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.field_errors.is_empty()
    }
}

type Check<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct Rule<T> {
    field: &'static str,
    tag: &'static str,
    check: Check<T>,
}

/// Field-level rules for a record type.
///
/// Every rule runs on every record, failures are collected in registration
/// order. Format and length rules accept blank values: blankness is only
/// reported by `required`, so a blank required field yields a single error.
pub struct Validator<T> {
    rules: Vec<Rule<T>>,
}

impl<T> Default for Validator<T> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<T> Validator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arbitrary check. `check` returns the violation message, if any.
    pub fn rule<F>(mut self, field: &'static str, tag: &'static str, check: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            field,
            tag,
            check: Box::new(check),
        });
        self
    }

    /// Register a predicate that must hold, such as a flag that must be set.
    pub fn custom<F>(
        self,
        field: &'static str,
        tag: &'static str,
        message: &'static str,
        predicate: F,
    ) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.rule(field, tag, move |value| {
            (!predicate(value)).then(|| message.to_owned())
        })
    }

    pub fn required<F>(self, field: &'static str, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.rule(field, "required", move |value| {
            get(value)
                .trim()
                .is_empty()
                .then(|| format!("{field} is required"))
        })
    }

    pub fn max_len<F>(self, field: &'static str, max: usize, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.rule(field, "max", move |value| {
            let raw = get(value);
            if raw.trim().is_empty() {
                return None;
            }
            let len = raw.chars().count();
            (len > max).then(|| format!("{field} must be at most {max} characters, got {len}"))
        })
    }

    pub fn email<F>(self, field: &'static str, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.format(field, "email", get, |s| email_pattern().is_match(s))
    }

    pub fn url<F>(self, field: &'static str, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.format(field, "url", get, is_http_url)
    }

    pub fn phone<F>(self, field: &'static str, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.format(field, "phone", get, |s| phone_pattern().is_match(s))
    }

    pub fn username<F>(self, field: &'static str, get: F) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.format(field, "username", get, |s| username_pattern().is_match(s))
    }

    fn format<F>(
        self,
        field: &'static str,
        tag: &'static str,
        get: F,
        matches: fn(&str) -> bool,
    ) -> Self
    where
        F: Fn(&T) -> &str + Send + Sync + 'static,
    {
        self.rule(field, tag, move |value| {
            let raw = get(value);
            (!raw.trim().is_empty() && !matches(raw))
                .then(|| format!("{field} is not a valid {tag}"))
        })
    }

    /// Run every rule against a value.
    pub fn check(&self, value: &T) -> Vec<FieldError> {
        self.rules
            .iter()
            .filter_map(|rule| {
                (rule.check)(value).map(|message| FieldError::new(rule.field, rule.tag, message))
            })
            .collect()
    }

    pub fn validate(&self, record: &Record<T>) -> ValidationOutcome {
        ValidationOutcome {
            record_id: record.id,
            field_errors: self.check(&record.value),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
            .expect("email pattern is valid")
    })
}

fn phone_pattern() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| {
        Regex::new(r"^\+?[0-9][0-9 ().-]{5,}[0-9]$").expect("phone pattern is valid")
    })
}

fn username_pattern() -> &'static Regex {
    static USERNAME: OnceLock<Regex> = OnceLock::new();
    USERNAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("username pattern is valid")
    })
}

fn is_http_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.has_host(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::collections::HashMap;

    struct Contact {
        name: String,
        email: String,
        homepage: String,
        phone: String,
        verified: bool,
    }

    fn contact() -> Contact {
        Contact {
            name: "ada".to_string(),
            email: "ada@example.com".to_string(),
            homepage: "https://example.com/ada".to_string(),
            phone: "+44 20 7946 0958".to_string(),
            verified: true,
        }
    }

    fn validator() -> Validator<Contact> {
        Validator::new()
            .username("name", |c: &Contact| c.name.as_str())
            .max_len("name", 8, |c: &Contact| c.name.as_str())
            .required("email", |c: &Contact| c.email.as_str())
            .email("email", |c: &Contact| c.email.as_str())
            .url("homepage", |c: &Contact| c.homepage.as_str())
            .phone("phone", |c: &Contact| c.phone.as_str())
            .custom("verified", "verified", "contact must be verified", |c: &Contact| {
                c.verified
            })
    }

    #[test]
    fn accepts_a_valid_value() {
        assert!(validator().check(&contact()).is_empty());
    }

    #[test]
    fn empty_required_field_yields_a_single_error() {
        for blank in ["", "   ", "\t\n"] {
            let mut c = contact();
            c.email = blank.to_string();

            let errors = validator().check(&c);

            assert_eq!(
                errors,
                vec![FieldError::new("email", "required", "email is required")],
                "email = {blank:?}"
            );
        }
    }

    #[test]
    fn blank_optional_field_is_skipped_by_format_and_length_rules() {
        let mut c = contact();
        c.name = " ".repeat(20);

        assert!(validator().check(&c).is_empty());
    }

    #[test]
    fn collects_every_violation_in_rule_order() {
        let c = Contact {
            name: "not a username at all".to_string(),
            email: "nope".to_string(),
            homepage: "ftp://example.com".to_string(),
            phone: "call me".to_string(),
            verified: false,
        };

        let errors = validator().check(&c);
        let tags: Vec<(&str, &str)> = errors
            .iter()
            .map(|e| (e.field.as_str(), e.rule.as_str()))
            .collect();

        assert_eq!(
            tags,
            vec![
                ("name", "username"),
                ("name", "max"),
                ("email", "email"),
                ("homepage", "url"),
                ("phone", "phone"),
                ("verified", "verified"),
            ]
        );
    }

    #[test]
    fn validation_is_deterministic() {
        let mut c = contact();
        c.phone = "12".to_string();
        let validator = validator();

        assert_eq!(validator.check(&c), validator.check(&c));
    }

    #[test]
    fn max_len_counts_characters() {
        let validator = Validator::new().max_len("name", 8, |c: &Contact| c.name.as_str());
        let mut c = contact();

        c.name = "éééééééé".to_string();
        assert!(validator.check(&c).is_empty());

        c.name = "ééééééééé".to_string();
        assert_eq!(validator.check(&c)[0].rule, "max");
    }

    #[test]
    fn validate_carries_the_record_id() {
        let mut c = contact();
        c.verified = false;
        let record = Record::new(42, Message::new("{}", HashMap::new()), c);

        let outcome = validator().validate(&record);

        assert_eq!(outcome.record_id, 42);
        assert!(!outcome.is_valid());
        assert_eq!(outcome.field_errors[0].message, "contact must be verified");
    }
}
