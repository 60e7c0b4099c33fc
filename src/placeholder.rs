//! Secret placeholder tokens in guest code.
//!
//! A token is `runjs:secret:` followed by exactly 32 hex digits (either
//! case). Anything else, including 31 or 33 digits, is plain text.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\brunjs:secret:[0-9a-fA-F]{32}\b").expect("static regex compiles")
    })
}

/// A placeholder exactly as written in the code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaceholderToken(String);

impl PlaceholderToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The store id this token refers to (hex normalized to lowercase).
    pub fn secret_id(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl std::fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubstituteError {
    #[error("no value resolved for placeholder {0}")]
    Unresolved(String),
}

/// Distinct tokens in `code`, in order of first appearance.
pub fn extract_tokens(code: &str) -> Vec<PlaceholderToken> {
    let mut seen = HashSet::new();
    token_pattern()
        .find_iter(code)
        .map(|m| m.as_str())
        .filter(|t| seen.insert(*t))
        .map(|t| PlaceholderToken(t.to_string()))
        .collect()
}

/// Replaces every token occurrence with its value in one left-to-right
/// pass, so a value that itself looks like a token is never re-expanded.
///
/// Fails if any token in `code` has no entry in `values`; nothing is
/// returned in that case.
pub fn substitute(
    code: &str,
    values: &HashMap<PlaceholderToken, SecretString>,
) -> Result<SecretString, SubstituteError> {
    let mut missing = None;
    let replaced = token_pattern().replace_all(code, |caps: &regex::Captures| {
        let token = &caps[0];
        match values.get(&PlaceholderToken(token.to_string())) {
            Some(value) => value.expose_secret().to_string(),
            None => {
                missing.get_or_insert_with(|| token.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(token) => Err(SubstituteError::Unresolved(token)),
        None => Ok(SecretString::from(replaced.into_owned())),
    }
}

/// Replaces each plaintext value found in `text` by its token. Longer
/// values are replaced first so a value containing another is not split.
pub fn redact(text: &str, values: &HashMap<PlaceholderToken, SecretString>) -> String {
    let mut pairs: Vec<(&PlaceholderToken, &str)> = values
        .iter()
        .map(|(token, value)| (token, value.expose_secret()))
        .filter(|(_, value)| !value.is_empty())
        .collect();
    pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut out = text.to_string();
    for (token, value) in pairs {
        if out.contains(value) {
            out = out.replace(value, token.as_str());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "runjs:secret:0123456789abcdef0123456789abcdef";
    const B: &str = "runjs:secret:ffffffffffffffffffffffffffffffff";

    fn values(pairs: &[(&str, &str)]) -> HashMap<PlaceholderToken, SecretString> {
        pairs
            .iter()
            .map(|(t, v)| (PlaceholderToken(t.to_string()), SecretString::from(*v)))
            .collect()
    }

    // ── extract_tokens ──────────────────────────────────

    #[test]
    fn test_extract_empty_input() {
        assert!(extract_tokens("").is_empty());
        assert!(extract_tokens("return 1 + 1;").is_empty());
    }

    #[test]
    fn test_extract_dedup_in_order() {
        let code = format!("f('{B}'); g('{A}'); h('{B}');");
        let tokens = extract_tokens(&code);
        assert_eq!(
            tokens.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            vec![B, A]
        );
    }

    #[test]
    fn test_extract_uppercase_hex() {
        let upper = "runjs:secret:0123456789ABCDEF0123456789ABCDEF";
        let tokens = extract_tokens(&format!("x = '{upper}'"));
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].as_str(), upper);
        assert_eq!(tokens[0].secret_id(), A);
    }

    #[test]
    fn test_extract_rejects_wrong_width() {
        let short = "runjs:secret:0123456789abcdef0123456789abcde";
        let long = "runjs:secret:0123456789abcdef0123456789abcdef0";
        assert!(extract_tokens(short).is_empty());
        assert!(extract_tokens(long).is_empty());
    }

    #[test]
    fn test_extract_rejects_other_shapes() {
        assert!(extract_tokens("secret:0123456789abcdef0123456789abcdef").is_empty());
        assert!(extract_tokens("runjs:secret:0123456789abcdef0123456789abcdeg").is_empty());
        assert!(extract_tokens("xrunjs:secret:0123456789abcdef0123456789abcdef").is_empty());
    }

    #[test]
    fn test_extract_inside_template_and_header() {
        let code = format!(
            "fetch(url, {{ headers: {{ Authorization: `Bearer {A}` }} }})"
        );
        assert_eq!(extract_tokens(&code).len(), 1);
    }

    // ── substitute ──────────────────────────────────────

    #[test]
    fn test_substitute_all_occurrences() {
        let code = format!("return '{A}' + '{B}' + '{A}';");
        let out = substitute(&code, &values(&[(A, "one"), (B, "two")])).unwrap();
        assert_eq!(out.expose_secret(), "return 'one' + 'two' + 'one';");
        assert!(extract_tokens(out.expose_secret()).is_empty());
    }

    #[test]
    fn test_substitute_no_tokens_is_identity() {
        let out = substitute("return 42;", &HashMap::new()).unwrap();
        assert_eq!(out.expose_secret(), "return 42;");
    }

    #[test]
    fn test_substitute_missing_value_fails() {
        let code = format!("a('{A}'); b('{B}');");
        let err = substitute(&code, &values(&[(A, "one")])).unwrap_err();
        let SubstituteError::Unresolved(token) = err;
        assert_eq!(token, B);
    }

    #[test]
    fn test_substitute_value_resembling_token_not_reexpanded() {
        let code = format!("x = '{A}';");
        let out = substitute(&code, &values(&[(A, B), (B, "nested")])).unwrap();
        assert_eq!(out.expose_secret(), format!("x = '{B}';"));
    }

    // ── redact ──────────────────────────────────────────

    #[test]
    fn test_redact_replaces_plaintext() {
        let text = "HTTP 401 for key sk-live-123";
        assert_eq!(
            redact(text, &values(&[(A, "sk-live-123")])),
            format!("HTTP 401 for key {A}")
        );
    }

    #[test]
    fn test_redact_longest_first() {
        let text = "token=abc123456 short=abc";
        let out = redact(text, &values(&[(A, "abc"), (B, "abc123456")]));
        assert_eq!(out, format!("token={B} short={A}"));
    }

    #[test]
    fn test_redact_ignores_empty_values() {
        assert_eq!(redact("unchanged", &values(&[(A, "")])), "unchanged");
    }
}
