//! Rule-driven extraction of named values from responses.

use crate::error::{ExtractionError, RuleError};
use crate::http::HttpResponse;
use crate::json_path;
use crate::model::scalar;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source tag for values that came from a rule's `default`.
pub const DEFAULT_SOURCE: &str = "default";

/// Where a rule looks for its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Regex,
    #[serde(rename = "jsonpath", alias = "json_path", alias = "json")]
    JsonPath,
    Header,
    Cookie,
    Custom,
}

impl ExtractorKind {
    /// Provenance tag attached to values found by this kind of rule.
    pub fn source(self) -> &'static str {
        match self {
            Self::Regex | Self::JsonPath => "body",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Regex => "regex",
            Self::JsonPath => "jsonpath",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A recipe for pulling one named value out of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Variable name the value is stored under.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    /// Regex, JSON path, header name, cookie name or custom selector.
    pub pattern: String,
    /// Capture group for regex rules. `0` picks the first capture
    /// group when the pattern has one, otherwise the whole match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    #[serde(default)]
    pub required: bool,
    #[serde(
        default,
        deserialize_with = "scalar::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<String>,
    /// Name of a registered transform applied to found values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl ExtractionRule {
    pub fn new(name: impl Into<String>, kind: ExtractorKind, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            pattern: pattern.into(),
            group: None,
            required: false,
            default: None,
            transform: None,
        }
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, ExtractorKind::Regex, pattern)
    }

    pub fn json_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, ExtractorKind::JsonPath, path)
    }

    pub fn header(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self::new(name, ExtractorKind::Header, header)
    }

    pub fn cookie(name: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self::new(name, ExtractorKind::Cookie, cookie)
    }

    pub fn custom(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self::new(name, ExtractorKind::Custom, selector)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = Some(group);
        self
    }

    // ── presets ─────────────────────────────────────────

    /// Hidden form field carrying a CSRF token.
    pub fn csrf_token(name: impl Into<String>) -> Self {
        Self::regex(
            name,
            r#"(?i)<input[^>]*name=["'](?:csrf[_-]?token|_csrf|_token|authenticity_token|csrfmiddlewaretoken)["'][^>]*value=["']([^"']+)["']"#,
        )
    }

    /// Session identifier set through `Set-Cookie`.
    pub fn session_cookie(name: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self::cookie(name, cookie)
    }

    /// Bearer token returned in a JSON body, e.g. `access_token`.
    pub fn bearer_token(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::json_path(name, path).with_transform("trim")
    }

    /// Target of a redirect.
    pub fn redirect_location(name: impl Into<String>) -> Self {
        Self::header(name, "Location")
    }

    /// Check the fields every rule needs. Regex patterns are compiled
    /// here so callers can fail before anything runs.
    pub fn validate(&self) -> Result<(), RuleError> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<Option<Regex>, RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.pattern.is_empty() {
            return Err(RuleError::EmptyPattern(self.name.clone()));
        }

        let needs_regex = match self.kind {
            ExtractorKind::Regex => true,
            ExtractorKind::Custom => CustomSelector::parse(&self.pattern).is_none(),
            _ => false,
        };
        if !needs_regex {
            return Ok(None);
        }

        Regex::new(&self.pattern)
            .map(Some)
            .map_err(|source| RuleError::InvalidRegex {
                name: self.name.clone(),
                source,
            })
    }
}

/// Built-in selectors available to `custom` rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CustomSelector {
    StatusCode,
    ContentType,
    BodyLength,
}

impl CustomSelector {
    fn parse(pattern: &str) -> Option<Self> {
        match pattern {
            "status_code" => Some(Self::StatusCode),
            "content_type" => Some(Self::ContentType),
            "body_length" => Some(Self::BodyLength),
            _ => None,
        }
    }
}

/// Everything a rule may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionInput {
    pub body: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub status_code: u16,
    pub content_type: String,
}

impl ExtractionInput {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            body: response.text().into_owned(),
            headers: response.header_map(),
            cookies: parse_set_cookie(response.header_values("set-cookie")),
            status_code: response.status,
            content_type: response.header("content-type").unwrap_or_default().to_string(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Build a cookie map from `Set-Cookie` header values. Attributes
/// after the first `;` are ignored; later cookies overwrite earlier
/// ones with the same name.
pub fn parse_set_cookie<'a>(values: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    values
        .into_iter()
        .filter_map(|line| {
            let pair = line.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Outcome of running one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    pub name: String,
    pub value: String,
    pub found: bool,
    pub error: Option<String>,
    pub source: String,
}

/// A value transform, looked up by name from a rule's `transform`.
pub type TransformFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: ExtractionRule,
    regex: Option<Regex>,
}

/// Holds registered rules and transforms.
#[derive(Clone)]
pub struct Extractor {
    rules: Vec<CompiledRule>,
    transforms: HashMap<String, TransformFn>,
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("Extractor")
            .field("rules", &self.rules)
            .field("transforms", &names)
            .finish()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        let mut extractor = Self {
            rules: Vec::new(),
            transforms: HashMap::new(),
        };
        extractor.register_transform("trim", |s| s.trim().to_string());
        extractor.register_transform("lower", |s| s.to_lowercase());
        extractor.register_transform("upper", |s| s.to_uppercase());
        extractor.register_transform("urldecode", |s| {
            urlencoding::decode(s)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| s.to_string())
        });
        extractor.register_transform("urlencode", |s| urlencoding::encode(s).into_owned());
        extractor.register_transform("htmlunescape", html_unescape);
        extractor.register_transform("base64", |s| STANDARD.encode(s));
        extractor.register_transform("base64decode", |s| {
            STANDARD
                .decode(s.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| s.to_string())
        });
        extractor
    }

    /// Build an extractor with `rules` already registered.
    pub fn with_rules<I>(rules: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = ExtractionRule>,
    {
        let mut extractor = Self::new();
        for rule in rules {
            extractor.add_rule(rule)?;
        }
        Ok(extractor)
    }

    /// A new extractor sharing this one's transforms but holding only
    /// `rules`.
    pub fn scoped<'a, I>(&self, rules: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = &'a ExtractionRule>,
    {
        let mut extractor = Self {
            rules: Vec::new(),
            transforms: self.transforms.clone(),
        };
        for rule in rules {
            extractor.add_rule(rule.clone())?;
        }
        Ok(extractor)
    }

    /// Validate and register a rule.
    pub fn add_rule(&mut self, rule: ExtractionRule) -> Result<(), RuleError> {
        let regex = rule.compile()?;
        debug!(name = %rule.name, kind = %rule.kind, "registered extraction rule");
        self.rules.push(CompiledRule { rule, regex });
        Ok(())
    }

    /// Register (or replace) a named transform.
    pub fn register_transform<F>(&mut self, name: impl Into<String>, transform: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn rules(&self) -> impl Iterator<Item = &ExtractionRule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule once, in registration order.
    pub fn extract(&self, input: &ExtractionInput) -> Vec<ExtractionResult> {
        self.rules
            .iter()
            .map(|compiled| self.apply(compiled, input))
            .collect()
    }

    /// Collect every found value. Missing `required` values are
    /// reported together in one error; values found by other rules are
    /// still returned.
    pub fn extract_to_map(
        &self,
        input: &ExtractionInput,
    ) -> (HashMap<String, String>, Option<ExtractionError>) {
        let mut values = HashMap::new();
        let mut errors = Vec::new();
        for result in self.extract(input) {
            if result.found {
                values.insert(result.name, result.value);
            } else if let Some(error) = result.error {
                errors.push(error);
            }
        }
        let error = (!errors.is_empty()).then(|| ExtractionError(errors));
        (values, error)
    }

    fn apply(&self, compiled: &CompiledRule, input: &ExtractionInput) -> ExtractionResult {
        let rule = &compiled.rule;
        let raw = match rule.kind {
            ExtractorKind::Regex => compiled
                .regex
                .as_ref()
                .and_then(|re| capture(re, &input.body, rule.group.unwrap_or(0))),
            ExtractorKind::JsonPath => json_path::lookup_str(&input.body, &rule.pattern),
            ExtractorKind::Header => input.header(&rule.pattern).map(str::to_string),
            ExtractorKind::Cookie => input.cookies.get(&rule.pattern).cloned(),
            ExtractorKind::Custom => match CustomSelector::parse(&rule.pattern) {
                Some(CustomSelector::StatusCode) => Some(input.status_code.to_string()),
                Some(CustomSelector::ContentType) => Some(input.content_type.clone()),
                Some(CustomSelector::BodyLength) => Some(input.body.len().to_string()),
                None => compiled
                    .regex
                    .as_ref()
                    .and_then(|re| capture(re, &input.body, rule.group.unwrap_or(0))),
            },
        };

        match raw {
            Some(value) => {
                let value = self.transform(rule, value);
                debug!(name = %rule.name, kind = %rule.kind, "extracted value");
                ExtractionResult {
                    name: rule.name.clone(),
                    value,
                    found: true,
                    error: None,
                    source: rule.kind.source().to_string(),
                }
            }
            None => match &rule.default {
                // Defaults are used literally, transforms do not apply.
                Some(default) => ExtractionResult {
                    name: rule.name.clone(),
                    value: default.clone(),
                    found: true,
                    error: None,
                    source: DEFAULT_SOURCE.to_string(),
                },
                None => ExtractionResult {
                    name: rule.name.clone(),
                    value: String::new(),
                    found: false,
                    error: rule.required.then(|| {
                        format!(
                            "required value '{}' not found ({} {:?})",
                            rule.name, rule.kind, rule.pattern
                        )
                    }),
                    source: rule.kind.source().to_string(),
                },
            },
        }
    }

    fn transform(&self, rule: &ExtractionRule, value: String) -> String {
        let Some(name) = rule.transform.as_deref() else {
            return value;
        };
        match self.transforms.get(name) {
            Some(transform) => transform(&value),
            None => {
                warn!(rule = %rule.name, transform = name, "unknown transform, value left as is");
                value
            }
        }
    }
}

fn capture(re: &Regex, haystack: &str, group: usize) -> Option<String> {
    let caps = re.captures(haystack)?;
    let index = if re.captures_len() > 1 {
        group.max(1)
    } else {
        0
    };
    caps.get(index).map(|m| m.as_str().to_string())
}

/// Decode the common named entities plus decimal and hex character
/// references.
pub fn html_unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                        None => num.parse().ok()?,
                    };
                    char::from_u32(code)
                }),
            };
            ch.map(|c| (c, end + 1))
        });

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(body: &str) -> ExtractionInput {
        ExtractionInput {
            body: body.to_string(),
            status_code: 200,
            content_type: "application/json".to_string(),
            ..ExtractionInput::default()
        }
    }

    fn run_one(rule: ExtractionRule, input: &ExtractionInput) -> ExtractionResult {
        let extractor = Extractor::with_rules([rule]).unwrap();
        extractor.extract(input).remove(0)
    }

    #[test]
    fn test_add_rule_validation() {
        let mut extractor = Extractor::new();
        assert!(matches!(
            extractor.add_rule(ExtractionRule::regex("", "x")),
            Err(RuleError::EmptyName)
        ));
        assert!(matches!(
            extractor.add_rule(ExtractionRule::header("h", "")),
            Err(RuleError::EmptyPattern(_))
        ));
        assert!(matches!(
            extractor.add_rule(ExtractionRule::regex("bad", "([a-z")),
            Err(RuleError::InvalidRegex { .. })
        ));
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_regex_group_selection() {
        let body = "id=42 name=bob";
        let first = run_one(ExtractionRule::regex("id", r"id=(\d+) name=(\w+)"), &input(body));
        assert_eq!(first.value, "42");
        let second = run_one(
            ExtractionRule::regex("name", r"id=(\d+) name=(\w+)").with_group(2),
            &input(body),
        );
        assert_eq!(second.value, "bob");
        let whole = run_one(ExtractionRule::regex("all", r"name=\w+"), &input(body));
        assert_eq!(whole.value, "name=bob");
        let missing = run_one(ExtractionRule::regex("none", r"zzz(\d)"), &input(body));
        assert!(!missing.found);
        assert!(missing.error.is_none());
    }

    #[test]
    fn test_jsonpath_extraction() {
        let body = r#"{"items":[{"id":"a1"},{"id":"b2"}],"token":"abc123"}"#;
        let result = run_one(ExtractionRule::json_path("id", "items.1.id"), &input(body));
        assert_eq!((result.found, result.value.as_str()), (true, "b2"));
        assert_eq!(result.source, "body");

        let malformed = run_one(ExtractionRule::json_path("id", "items"), &input("<html>"));
        assert!(!malformed.found);
        assert!(malformed.error.is_none());
    }

    #[test]
    fn test_default_and_required_semantics() {
        let body = r#"{"other":1}"#;
        let defaulted = run_one(
            ExtractionRule::json_path("token", "token").with_default("d"),
            &input(body),
        );
        assert!(defaulted.found);
        assert_eq!(defaulted.value, "d");
        assert_eq!(defaulted.source, DEFAULT_SOURCE);

        let required = run_one(
            ExtractionRule::json_path("token", "token").required(),
            &input(body),
        );
        assert!(!required.found);
        assert!(required.error.is_some());
    }

    #[test]
    fn test_header_cookie_and_custom() {
        let response = HttpResponse::new(201, "hello")
            .with_header("Content-Type", "text/plain")
            .with_header("X-Request-Id", "req-9")
            .with_header("Set-Cookie", "session=s3cr3t; Path=/; HttpOnly")
            .with_header("Set-Cookie", "theme=dark");
        let input = ExtractionInput::from_response(&response);

        let extractor = Extractor::with_rules([
            ExtractionRule::header("rid", "x-request-id"),
            ExtractionRule::session_cookie("sid", "session"),
            ExtractionRule::cookie("case", "Session"),
            ExtractionRule::custom("status", "status_code"),
            ExtractionRule::custom("ctype", "content_type"),
            ExtractionRule::custom("len", "body_length"),
            ExtractionRule::custom("word", r"h(el)lo"),
        ])
        .unwrap();
        let values: Vec<(bool, String)> = extractor
            .extract(&input)
            .into_iter()
            .map(|r| (r.found, r.value))
            .collect();
        assert_eq!(
            values,
            vec![
                (true, "req-9".to_string()),
                (true, "s3cr3t".to_string()),
                (false, String::new()),
                (true, "201".to_string()),
                (true, "text/plain".to_string()),
                (true, "5".to_string()),
                (true, "el".to_string()),
            ]
        );
    }

    #[test]
    fn test_transforms_apply_to_found_values_only() {
        let body = r#"{"name":"  Alice  "}"#;
        let trimmed = run_one(
            ExtractionRule::json_path("name", "name")
                .with_transform("trim")
                .with_default("  keep  "),
            &input(body),
        );
        assert_eq!(trimmed.value, "Alice");

        let defaulted = run_one(
            ExtractionRule::json_path("nick", "nick")
                .with_transform("trim")
                .with_default("  keep  "),
            &input(body),
        );
        assert_eq!(defaulted.value, "  keep  ");

        let unknown = run_one(
            ExtractionRule::json_path("name", "name").with_transform("nope"),
            &input(body),
        );
        assert_eq!(unknown.value, "  Alice  ");
    }

    #[test]
    fn test_custom_transform_registration() {
        let mut extractor = Extractor::new();
        extractor.register_transform("reverse", |s| s.chars().rev().collect());
        extractor
            .add_rule(ExtractionRule::regex("word", r"\w+").with_transform("reverse"))
            .unwrap();
        assert_eq!(extractor.extract(&input("abc"))[0].value, "cba");
    }

    #[test]
    fn test_builtin_transforms() {
        let extractor = Extractor::new();
        let apply = |name: &str, value: &str| {
            let rule = ExtractionRule::regex("x", ".").with_transform(name);
            extractor.transform(&rule, value.to_string())
        };
        assert_eq!(apply("upper", "abc"), "ABC");
        assert_eq!(apply("lower", "ABC"), "abc");
        assert_eq!(apply("urldecode", "a%20b%26c"), "a b&c");
        assert_eq!(apply("htmlunescape", "&lt;a href=&quot;x&quot;&gt; &#65;&#x42; &bogus"), "<a href=\"x\"> AB &bogus");
        assert_eq!(apply("base64", "test"), "dGVzdA==");
        assert_eq!(apply("base64decode", "dGVzdA=="), "test");
    }

    #[test]
    fn test_extract_to_map_combines_errors() {
        let extractor = Extractor::with_rules([
            ExtractionRule::json_path("token", "token"),
            ExtractionRule::json_path("user", "user").required(),
            ExtractionRule::json_path("org", "org").required(),
            ExtractionRule::json_path("opt", "opt"),
        ])
        .unwrap();
        let (values, error) = extractor.extract_to_map(&input(r#"{"token":"t"}"#));
        assert_eq!(values.len(), 1);
        assert_eq!(values["token"], "t");
        let error = error.expect("missing required values should error");
        assert_eq!(error.0.len(), 2);
        assert!(error.to_string().contains("'user'"));
        assert!(error.to_string().contains("; "));
    }

    #[test]
    fn test_presets() {
        let html = r#"<form><input type="hidden" name="csrf_token" value="tok123"></form>"#;
        assert_eq!(run_one(ExtractionRule::csrf_token("csrf"), &input(html)).value, "tok123");

        let response = HttpResponse::new(302, "").with_header("location", "/home");
        let input = ExtractionInput::from_response(&response);
        assert_eq!(run_one(ExtractionRule::redirect_location("next"), &input).value, "/home");

        let json = ExtractionInput {
            body: r#"{"access_token":" xyz "}"#.to_string(),
            ..Default::default()
        };
        assert_eq!(
            run_one(ExtractionRule::bearer_token("bearer", "access_token"), &json).value,
            "xyz"
        );
    }

    #[test]
    fn test_rule_from_yaml() {
        let rule: ExtractionRule = serde_yaml::from_str(
            "name: count\ntype: jsonpath\npattern: meta.count\ndefault: 0\n",
        )
        .unwrap();
        assert_eq!(rule.kind, ExtractorKind::JsonPath);
        assert_eq!(rule.default.as_deref(), Some("0"));
        let unknown = serde_yaml::from_str::<ExtractionRule>("name: x\ntype: xpath\npattern: /a\n");
        assert!(unknown.is_err());
    }
}
