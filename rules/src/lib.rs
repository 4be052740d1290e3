//! Header propagation rules.
//!
//! A [`RuleSet`] is compiled from either a comma-separated list of header
//! names or a JSON rule array (the `HEADER_RULES`/`ctxforge.io/header-rules`
//! format). The forwarder consults it once per request via
//! [`RuleSet::evaluate`]; the policy controller reuses the same parser to
//! validate annotations at admission time.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use http::{header::HeaderName, HeaderValue, Method};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

mod generate;

pub use generate::{Generator, GeneratorKind};

/// Maximum accepted length of a header name.
pub const MAX_NAME_LEN: usize = 256;

/// One configured header propagation rule, as serialized in `HEADER_RULES`
/// and the `ctxforge.io/header-rules` annotation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRule {
    /// HTTP header name. Matched case-insensitively, emitted in canonical
    /// case.
    pub name: String,

    /// Synthesize a value when the header is absent on the incoming
    /// request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub generate: bool,

    /// How to synthesize a value. Defaults to `uuid` when `generate` is
    /// set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_type: Option<GeneratorKind>,

    /// Attach the extracted/generated value to outbound requests.
    #[serde(default = "default_true")]
    pub propagate: bool,

    /// Optional regex over the request path; absent matches all paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,

    /// Optional set of HTTP methods; absent matches all methods.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl HeaderRule {
    /// A plain propagate-only rule, as produced from the legacy
    /// comma-separated list.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generate: false,
            generator_type: None,
            propagate: true,
            path_regex: None,
            methods: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("header name cannot be empty")]
    EmptyName,

    #[error("header name {0:?} exceeds maximum length of {MAX_NAME_LEN} characters")]
    NameTooLong(String),

    #[error(
        "header name {0:?} is invalid: must contain only alphanumeric characters and hyphens, starting with an alphanumeric character"
    )]
    InvalidName(String),

    #[error("header {name:?}: invalid HTTP method {method:?}")]
    InvalidMethod { name: String, method: String },

    #[error("header {name:?}: invalid path regex {pattern:?}: {source}")]
    InvalidPathRegex {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid rules JSON: {0} (expected format: [{{\"name\":\"x-request-id\",\"generate\":true,\"generatorType\":\"uuid\"}}])")]
    Json(#[from] serde_json::Error),

    #[error("at least one header rule is required")]
    Empty,
}

/// Methods a rule may be scoped to.
const KNOWN_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-zA-Z0-9][a-zA-Z0-9-]*$").expect("name regex must compile"))
}

/// Validates a header name: ASCII alphanumerics and hyphens, beginning
/// with an alphanumeric, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(name: &str) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ParseError::NameTooLong(name.to_string()));
    }
    if !name_regex().is_match(name) {
        return Err(ParseError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Folds a header name to canonical case: the first character of each
/// hyphen-delimited segment uppercased, the rest lowercased.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c == '-' {
            out.push('-');
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Parses the legacy comma-separated header-name list. Empty segments are
/// ignored; every surviving name is validated.
pub fn parse_list(input: &str) -> Result<Vec<HeaderRule>, ParseError> {
    let mut rules = Vec::new();
    for part in input.split(',') {
        let name = part.trim();
        if name.is_empty() {
            continue;
        }
        validate_name(name)?;
        rules.push(HeaderRule::named(name));
    }
    Ok(rules)
}

/// Parses the structured JSON rule array and validates every rule.
pub fn parse_rules(input: &str) -> Result<Vec<HeaderRule>, ParseError> {
    let rules: Vec<HeaderRule> = serde_json::from_str(input)?;
    for rule in &rules {
        validate_rule(rule)?;
    }
    Ok(rules)
}

/// Validates a single rule without compiling it.
pub fn validate_rule(rule: &HeaderRule) -> Result<(), ParseError> {
    validate_name(&rule.name)?;

    if let Some(pattern) = &rule.path_regex {
        Regex::new(pattern).map_err(|source| ParseError::InvalidPathRegex {
            name: rule.name.clone(),
            pattern: pattern.clone(),
            source,
        })?;
    }

    for method in &rule.methods {
        let m = method.to_ascii_uppercase();
        if !KNOWN_METHODS.iter().any(|k| k.as_str() == m) {
            return Err(ParseError::InvalidMethod {
                name: rule.name.clone(),
                method: method.clone(),
            });
        }
    }

    Ok(())
}

/// A single compiled rule.
#[derive(Debug)]
struct Rule {
    name: HeaderName,
    generator: Option<Generator>,
    propagate: bool,
    path_regex: Option<Regex>,
    methods: Vec<Method>,
}

impl Rule {
    fn matches(&self, path: &str, method: &Method) -> bool {
        if let Some(re) = &self.path_regex {
            if !re.is_match(path) {
                return false;
            }
        }
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        true
    }
}

/// The outcome of evaluating a rule set against one request.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Headers to record for downstream propagation, in canonical name
    /// order of first appearance. Later rules naming the same header
    /// replace earlier entries.
    pub scope: Vec<(HeaderName, HeaderValue)>,

    /// Generated values that must also be set on the forwarded request.
    pub generated: Vec<(HeaderName, HeaderValue)>,
}

/// An ordered, compiled set of header rules.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compiles validated rules. The rule list must be non-empty.
    pub fn compile(rules: Vec<HeaderRule>) -> Result<Self, ParseError> {
        if rules.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            validate_rule(&rule)?;

            let name = HeaderName::from_bytes(rule.name.as_bytes())
                .map_err(|_| ParseError::InvalidName(rule.name.clone()))?;

            let generator = if rule.generate {
                Some(Generator::new(
                    rule.generator_type.unwrap_or(GeneratorKind::Uuid),
                ))
            } else {
                None
            };

            let path_regex = match &rule.path_regex {
                Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                    ParseError::InvalidPathRegex {
                        name: rule.name.clone(),
                        pattern: pattern.clone(),
                        source,
                    }
                })?),
                None => None,
            };

            let methods = rule
                .methods
                .iter()
                .map(|m| {
                    let m = m.to_ascii_uppercase();
                    KNOWN_METHODS
                        .iter()
                        .find(|k| k.as_str() == m)
                        .cloned()
                        .ok_or_else(|| ParseError::InvalidMethod {
                            name: rule.name.clone(),
                            method: m.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            compiled.push(Rule {
                name,
                generator,
                propagate: rule.propagate,
                path_regex,
                methods,
            });
        }

        Ok(Self { rules: compiled })
    }

    /// Compiles a rule set from the two mutually exclusive inputs. The
    /// structured JSON takes precedence when both are set.
    pub fn from_inputs(
        list: Option<&str>,
        rules_json: Option<&str>,
    ) -> Result<Self, ParseError> {
        let rules = match (rules_json, list) {
            (Some(json), _) => parse_rules(json)?,
            (None, Some(list)) => parse_list(list)?,
            (None, None) => Vec::new(),
        };
        Self::compile(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The names of headers this set may propagate, in rule order.
    pub fn propagated_names(&self) -> impl Iterator<Item = &HeaderName> {
        self.rules
            .iter()
            .filter(|r| r.propagate)
            .map(|r| &r.name)
    }

    /// Evaluates every rule against a request, generating values for
    /// absent headers where configured.
    ///
    /// Matching against `headers` is case-insensitive; empty values are
    /// treated as absent and never propagated.
    pub fn evaluate(&self, path: &str, method: &Method, headers: &http::HeaderMap) -> Evaluation {
        let mut eval = Evaluation::default();

        for rule in &self.rules {
            if !rule.matches(path, method) {
                continue;
            }

            let mut value = headers
                .get(&rule.name)
                .filter(|v| !v.is_empty())
                .cloned();

            if value.is_none() {
                if let Some(generator) = &rule.generator {
                    let generated = generator.generate();
                    match HeaderValue::from_str(&generated) {
                        Ok(v) => {
                            tracing::debug!(header = %rule.name, value = %generated, "generated header value");
                            eval.generated.push((rule.name.clone(), v.clone()));
                            value = Some(v);
                        }
                        Err(error) => {
                            // Generators only emit ASCII-safe values; a
                            // failure here indicates a generator bug.
                            tracing::warn!(header = %rule.name, %error, "generated value is not a valid header value");
                        }
                    }
                }
            }

            if let Some(value) = value {
                if rule.propagate {
                    match eval.scope.iter_mut().find(|(n, _)| *n == rule.name) {
                        Some(entry) => entry.1 = value,
                        None => eval.scope.push((rule.name.clone(), value)),
                    }
                }
            }
        }

        eval
    }
}
