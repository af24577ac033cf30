// SPDX-License-Identifier: PMPL-1.0-or-later

//! Masks volatile tokens in response bodies before structural hashing.

use crate::error::{EngineError, EngineResult};
use regex::bytes::Regex;
use std::borrow::Cow;

const BUILTIN: &[(&str, &str)] = &[
    // ISO-8601 timestamps
    (
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        "<DATE>",
    ),
    // RFC 7231 dates
    (
        r"(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun), \d{2} (?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) \d{4} \d{2}:\d{2}:\d{2} GMT",
        "<DATE>",
    ),
    (
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "<UUID>",
    ),
    (
        r#"(?i)(csrf[_-]?token|xsrf[_-]?token|authenticity_token|_token|nonce)(["']?\s*[:=]\s*["']?|"\s+value=")[A-Za-z0-9+/=_\-]{8,}"#,
        "${1}${2}<TOKEN>",
    ),
    (r"\b[0-9a-fA-F]{16,}\b", "<HEX>"),
    // Unix epoch seconds or milliseconds
    (r"\b1\d{9}(?:\d{3})?\b", "<EPOCH>"),
];

pub struct Normalizer {
    rules: Vec<(Regex, String)>,
}

impl Normalizer {
    /// The built-in rules: dates, UUIDs, CSRF tokens, hex nonces, epochs.
    pub fn builtin() -> EngineResult<Self> {
        let mut normalizer = Self::empty();
        for (pattern, replacement) in BUILTIN {
            normalizer = normalizer.with_rule(pattern, replacement)?;
        }
        Ok(normalizer)
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule; `replacement` may reference capture groups as `${n}`.
    pub fn with_rule(mut self, pattern: &str, replacement: &str) -> EngineResult<Self> {
        let regex = Regex::new(pattern).map_err(|err| {
            EngineError::invalid(format!("normalizer pattern {:?}: {}", pattern, err))
        })?;
        self.rules.push((regex, replacement.to_string()));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in order. Borrows when nothing matched.
    pub fn normalize<'a>(&self, body: &'a [u8]) -> Cow<'a, [u8]> {
        let mut current: Cow<'a, [u8]> = Cow::Borrowed(body);
        for (regex, replacement) in &self.rules {
            let replaced = match regex.replace_all(&current, replacement.as_bytes()) {
                Cow::Owned(bytes) => Some(bytes),
                Cow::Borrowed(_) => None,
            };
            if let Some(bytes) = replaced {
                current = Cow::Owned(bytes);
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(body: &str) -> String {
        let normalizer = Normalizer::builtin().expect("builtin patterns compile");
        String::from_utf8(normalizer.normalize(body.as_bytes()).into_owned()).unwrap()
    }

    #[test]
    fn masks_timestamps() {
        assert_eq!(
            norm("generated 2024-05-01T12:30:45.123Z by node"),
            "generated <DATE> by node"
        );
        assert_eq!(
            norm("Date: Tue, 15 Nov 1994 08:12:31 GMT"),
            "Date: <DATE>"
        );
        assert_eq!(norm("ts=1714566645 end"), "ts=<EPOCH> end");
    }

    #[test]
    fn masks_identifiers() {
        assert_eq!(
            norm("req 550e8400-e29b-41d4-a716-446655440000"),
            "req <UUID>"
        );
        assert_eq!(norm("etag deadbeefcafebabe1234"), "etag <HEX>");
        assert_eq!(
            norm(r#"<input name="csrf_token" value="aZ9kQ2xLm0pR">"#),
            r#"<input name="csrf_token" value="<TOKEN>">"#
        );
        assert_eq!(norm("csrf_token=aZ9kQ2xLm0pR&x=1"), "csrf_token=<TOKEN>&x=1");
    }

    #[test]
    fn untouched_body_is_borrowed() {
        let normalizer = Normalizer::builtin().unwrap();
        assert!(matches!(
            normalizer.normalize(b"<p>static</p>"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn custom_rule() {
        let normalizer = Normalizer::empty()
            .with_rule(r"session=\w+", "session=<S>")
            .unwrap();
        assert_eq!(
            &normalizer.normalize(b"a session=abc123 b")[..],
            &b"a session=<S> b"[..]
        );
        assert!(Normalizer::empty().with_rule("(", "x").is_err());
    }
}
