//! Cache keys and glob patterns
//!
//! Keys follow `namespace:environment:entity:method[:param=value...]` with
//! parameters sorted by name, so the same logical query always maps to the
//! same key regardless of argument order. Parameter names and values are
//! percent-encoded (`%`, `:`, `=`) so a value can never read as another
//! parameter.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

/// A structured cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start building a key for `entity.method`
    pub fn builder(
        namespace: impl Into<String>,
        environment: impl Into<String>,
        entity: impl Into<String>,
        method: impl Into<String>,
    ) -> CacheKeyBuilder {
        CacheKeyBuilder {
            scope: format!("{}:{}:{}", namespace.into(), environment.into(), entity.into()),
            method: method.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builder returned by [`CacheKey::builder`]
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    scope: String,
    method: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Add a call parameter; a repeated name replaces the earlier value
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params
            .insert(encode_segment(&name.into()), encode_segment(&value.to_string()));
        self
    }

    /// Add every field of a JSON object as a parameter
    ///
    /// Strings are used verbatim, everything else in its compact JSON form.
    /// Non-object values are ignored.
    #[must_use]
    pub fn params_json(mut self, params: &serde_json::Value) -> Self {
        if let Some(object) = params.as_object() {
            for (name, value) in object {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.params
                    .insert(encode_segment(name), encode_segment(&rendered));
            }
        }
        self
    }

    pub fn build(self) -> CacheKey {
        let mut key = format!("{}:{}", self.scope, self.method);
        for (name, value) in &self.params {
            key.push(':');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        CacheKey(key)
    }
}

/// Labels extracted from a key for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyParts<'a> {
    pub namespace: &'a str,
    pub method: &'a str,
}

impl<'a> KeyParts<'a> {
    /// Parse the entity and method segments, falling back to `"unknown"`
    pub fn parse(key: &'a str) -> Self {
        let mut segments = key.split(':');
        let first = segments.next().unwrap_or("unknown");
        let _environment = segments.next();
        match (segments.next(), segments.next()) {
            (Some(entity), Some(method)) => Self {
                namespace: entity,
                method: method.split('=').next().unwrap_or(method),
            },
            (Some(entity), None) => Self {
                namespace: entity,
                method: "unknown",
            },
            _ => Self {
                namespace: if first.is_empty() { "unknown" } else { first },
                method: "unknown",
            },
        }
    }
}

/// Group label for key-size accounting: the first three segments
pub fn namespace_prefix(key: &str) -> &str {
    match key.match_indices(':').nth(2) {
        Some((idx, _)) => key.get(..idx).unwrap_or(key),
        None => key,
    }
}

/// Matcher equivalent to a Redis `SCAN MATCH` glob
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    /// Compile a glob supporting `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes
    ///
    /// # Errors
    ///
    /// Returns an error if the translated expression cannot be compiled.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Percent-encode the characters that delimit key segments
pub fn encode_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape glob metacharacters so `text` matches only itself
pub fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 6);
    // globs match newlines too
    out.push_str("(?s)^");

    let mut i = 0;
    while let Some(&c) = chars.get(i) {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                i += 1;
                let literal = chars.get(i).copied().unwrap_or('\\');
                out.push_str(&regex::escape(&literal.to_string()));
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars.get(j) == Some(&'^') {
                        out.push('^');
                        j += 1;
                    }
                    while j < end {
                        let Some(&cc) = chars.get(j) else { break };
                        match cc {
                            '\\' => {
                                j += 1;
                                if let Some(&escaped) = chars.get(j) {
                                    out.push_str(&regex::escape(&escaped.to_string()));
                                }
                            }
                            '[' | '&' | '~' => {
                                out.push('\\');
                                out.push(cc);
                            }
                            _ => out.push(cc),
                        }
                        j += 1;
                    }
                    out.push(']');
                    i = end;
                }
                None => out.push_str(r"\["),
            },
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'^') {
        j += 1;
    }
    // an empty class never closes
    if chars.get(j) == Some(&']') {
        return None;
    }
    while let Some(&c) = chars.get(j) {
        match c {
            '\\' => j += 2,
            ']' => return Some(j),
            _ => j += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_sorted_and_order_independent() {
        let a = CacheKey::builder("petpro", "dev", "pet", "findByUser")
            .param("userId", 42)
            .param("active", true)
            .build();
        let b = CacheKey::builder("petpro", "dev", "pet", "findByUser")
            .param("active", true)
            .param("userId", 42)
            .build();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "petpro:dev:pet:findByUser:active=true:userId=42");
    }

    #[test]
    fn test_params_json() {
        let key = CacheKey::builder("petpro", "dev", "pet", "list")
            .params_json(&serde_json::json!({"page": 2, "species": "cat"}))
            .build();
        assert_eq!(key.as_str(), "petpro:dev:pet:list:page=2:species=cat");
    }

    #[test]
    fn test_key_parts() {
        let parts = KeyParts::parse("petpro:dev:pet:findByUser:userId=42");
        assert_eq!(parts.namespace, "pet");
        assert_eq!(parts.method, "findByUser");

        let parts = KeyParts::parse("session");
        assert_eq!(parts.namespace, "session");
        assert_eq!(parts.method, "unknown");
    }

    #[test]
    fn test_namespace_prefix() {
        assert_eq!(namespace_prefix("petpro:dev:pet:findById:id=1"), "petpro:dev:pet");
        assert_eq!(namespace_prefix("short:key"), "short:key");
    }

    #[test]
    fn test_glob_matching() {
        let m = GlobMatcher::new("petpro:dev:pet:*").unwrap();
        assert!(m.is_match("petpro:dev:pet:findByUser:userId=42"));
        assert!(!m.is_match("petpro:dev:user:findById:id=1"));

        let m = GlobMatcher::new("user:?:name").unwrap();
        assert!(m.is_match("user:1:name"));
        assert!(!m.is_match("user:12:name"));

        let m = GlobMatcher::new("h[ae]llo").unwrap();
        assert!(m.is_match("hallo"));
        assert!(!m.is_match("hillo"));

        let m = GlobMatcher::new("h[^e]llo").unwrap();
        assert!(m.is_match("hallo"));
        assert!(!m.is_match("hello"));
    }

    #[test]
    fn test_glob_literals() {
        let m = GlobMatcher::new(r"price:\*:(usd).v1").unwrap();
        assert!(m.is_match("price:*:(usd).v1"));
        assert!(!m.is_match("price:x:(usd).v1"));
        assert!(!m.is_match("price:*:(usd)xv1"));

        let m = GlobMatcher::new("broken[class").unwrap();
        assert!(m.is_match("broken[class"));
    }

    #[test]
    fn test_param_values_cannot_forge_params() {
        let forged = CacheKey::builder("petpro", "dev", "pet", "find")
            .param("a", "1:b=2")
            .build();
        let real = CacheKey::builder("petpro", "dev", "pet", "find")
            .param("a", 1)
            .param("b", 2)
            .build();
        assert_ne!(forged, real);
        assert_eq!(forged.as_str(), "petpro:dev:pet:find:a=1%3Ab%3D2");
        assert_eq!(real.as_str(), "petpro:dev:pet:find:a=1:b=2");

        let from_json = CacheKey::builder("petpro", "dev", "pet", "find")
            .params_json(&serde_json::json!({"a": "1:b=2", "c%": "x"}))
            .build();
        assert_eq!(from_json.as_str(), "petpro:dev:pet:find:a=1%3Ab%3D2:c%25=x");
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("plain-42"), "plain-42");
        assert_eq!(encode_segment("50%:a=b"), "50%25%3Aa%3Db");
    }

    #[test]
    fn test_glob_wildcards_match_newlines() {
        let m = GlobMatcher::new("petpro:dev:pet:*").unwrap();
        assert!(m.is_match("petpro:dev:pet:note\nline"));
        let m = GlobMatcher::new("a?b").unwrap();
        assert!(m.is_match("a\nb"));
    }

    #[test]
    fn test_escape_glob() {
        let id = "a*b?[c]";
        let m = GlobMatcher::new(&format!("pet:id={}", escape_glob(id))).unwrap();
        assert!(m.is_match("pet:id=a*b?[c]"));
        assert!(!m.is_match("pet:id=aXXb?[c]"));
    }
}
