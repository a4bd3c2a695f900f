//! # Request Authorizer Module
//!
//! Turns an inbound query carrying a public scoped key into the query sent
//! upstream, or rejects it.
//!
//! ## Request Flow
//!
//! 1. Read the scoped key from the `api_key` parameter
//! 2. Decrypt it with the public secret
//! 3. If the key names an `analysisType`, require the last path segment to match
//! 4. If the key carries filters, narrow the request's filters against them
//! 5. Overwrite request parameters with every non-`filters` key parameter
//! 6. Re-encrypt the key's parameters with the master secret as the new `api_key`
//!
//! Every failure is a rejection (403). A client holding a bad key has to come
//! back with a new one; nothing is retried.

use serde_json::Value;
use std::fmt;
use tracing::debug;
use url::form_urlencoded;

use crate::cache;
use crate::filters::{self, FilterParseError};
use crate::token::{self, FILTERS, TokenError, TokenSecret};

pub const API_KEY_PARAM: &str = "api_key";

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Query ready to be sent upstream
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RewrittenRequest {
    pub fn query_string(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish()
    }

    pub fn path_and_query(&self) -> String {
        let query = self.query_string();
        if query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, query)
        }
    }

    /// Cache identity of this request
    pub fn cache_key(&self) -> String {
        cache::cache_key(&self.path, &self.query_string())
    }
}

/// Reasons a request is refused
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    MissingKey,
    InvalidKey(TokenError),
    AnalysisTypeMismatch {
        expected: String,
        actual: Option<String>,
    },
    InvalidFilters(FilterParseError),
    KeyEncoding(TokenError),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingKey => write!(f, "request carries no api_key"),
            Rejection::InvalidKey(err) => write!(f, "{}", err),
            Rejection::AnalysisTypeMismatch { expected, actual } => write!(
                f,
                "analysis type '{}' does not match scoped key analysis type '{}'",
                actual.as_deref().unwrap_or(""),
                expected
            ),
            Rejection::InvalidFilters(err) => write!(f, "{}", err),
            Rejection::KeyEncoding(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Rejection {}

/// Validates scoped keys and rewrites queries for the upstream
#[derive(Debug, Clone)]
pub struct RequestAuthorizer {
    public_secret: TokenSecret,
    master_secret: TokenSecret,
}

impl RequestAuthorizer {
    pub fn new(public_secret: TokenSecret, master_secret: TokenSecret) -> Self {
        Self {
            public_secret,
            master_secret,
        }
    }

    /// Authorize a request given its path and raw query string
    pub fn authorize(
        &self,
        path: &str,
        raw_query: Option<&str>,
    ) -> Result<RewrittenRequest, Rejection> {
        let mut params: Vec<(String, String)> = raw_query
            .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let public_key = find_param(&params, API_KEY_PARAM).ok_or(Rejection::MissingKey)?;
        let scoped = token::decode(&self.public_secret, public_key).map_err(Rejection::InvalidKey)?;
        debug!(
            allowed_operations = ?scoped.allowed_operations(),
            analysis_type = ?scoped.analysis_type(),
            "Decrypted scoped key"
        );

        if let Some(expected) = scoped.analysis_type() {
            let actual = analysis_segment(path);
            if actual != Some(expected) {
                return Err(Rejection::AnalysisTypeMismatch {
                    expected: expected.to_string(),
                    actual: actual.map(str::to_string),
                });
            }
        }

        // Without scoped filters the request's own filters pass through untouched
        let merged = match scoped.filters() {
            Some(scoped_filters) => {
                let requested = match find_param(&params, FILTERS) {
                    Some(raw) => filters::parse_requested_filters(raw)
                        .map_err(Rejection::InvalidFilters)?,
                    None => Vec::new(),
                };
                Some(filters::restrict_filters(scoped_filters, &requested))
            }
            None => None,
        };

        for (key, value) in scoped.overrides() {
            set_param(&mut params, key, query_values(value));
        }

        if let Some(merged) = merged {
            set_param(&mut params, FILTERS, vec![filters::to_query_value(&merged)]);
        }

        let upstream_key =
            token::encode(&self.master_secret, &scoped).map_err(Rejection::KeyEncoding)?;
        set_param(&mut params, API_KEY_PARAM, vec![upstream_key]);

        Ok(RewrittenRequest {
            path: path.to_string(),
            query: params,
        })
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

fn find_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Replace every occurrence of `key` with `values`, keeping the position of the
/// first occurrence or appending when the key is new
fn set_param(params: &mut Vec<(String, String)>, key: &str, values: Vec<String>) {
    let position = params.iter().position(|(k, _)| k == key);
    params.retain(|(k, _)| k != key);
    let at = position.unwrap_or(params.len());
    for (offset, value) in values.into_iter().enumerate() {
        params.insert(at + offset, (key.to_string(), value));
    }
}

fn query_values(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(query_text).collect(),
        other => vec![query_text(other)],
    }
}

fn query_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn analysis_segment(path: &str) -> Option<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).last()
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
impl RewrittenRequest {
    /// First value of a query parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Filter;
    use crate::token::ScopedTokenParams;
    use serde_json::json;

    const PUBLIC: &str = "0123456789abcdef0123456789abcdef";
    const MASTER: &str = "masterkeymasterkeymasterkeymaste";

    fn authorizer() -> RequestAuthorizer {
        RequestAuthorizer::new(
            TokenSecret::new(PUBLIC).unwrap(),
            TokenSecret::new(MASTER).unwrap(),
        )
    }

    fn public_key(params: &ScopedTokenParams) -> String {
        token::encode(&TokenSecret::new(PUBLIC).unwrap(), params).unwrap()
    }

    fn query(pairs: &[(&str, &str)]) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish()
    }

    #[test]
    fn test_key_params_override_request_params() {
        let params = ScopedTokenParams::new(["read"])
            .with_param("event_collection", json!("pageviews"))
            .unwrap();
        let key = public_key(&params);
        let raw = query(&[
            ("api_key", key.as_str()),
            ("event_collection", "purchases"),
            ("timeframe", "this_week"),
        ]);

        let rewritten = authorizer().authorize("/3.0/projects/P/queries/count", Some(&raw)).unwrap();

        assert_eq!(rewritten.param("event_collection"), Some("pageviews"));
        assert_eq!(rewritten.param("timeframe"), Some("this_week"));
        assert_eq!(rewritten.param("allowed_operations"), Some("read"));
        assert_eq!(rewritten.param("filters"), None);
    }

    #[test]
    fn test_upstream_key_is_minted_with_master_secret() {
        let params = ScopedTokenParams::new(["read"]);
        let key = public_key(&params);
        let raw = query(&[("api_key", key.as_str())]);

        let rewritten = authorizer().authorize("/3.0/projects/P/", Some(&raw)).unwrap();
        let upstream_key = rewritten.param("api_key").unwrap();

        assert_ne!(upstream_key, key);
        assert_eq!(
            token::decode(&TokenSecret::new(MASTER).unwrap(), upstream_key).unwrap(),
            params
        );
        assert!(token::decode(&TokenSecret::new(PUBLIC).unwrap(), upstream_key).is_err());
        // position of the key parameter is preserved
        assert_eq!(rewritten.query[0].0, "api_key");
    }

    #[test]
    fn test_missing_and_invalid_keys_are_rejected() {
        assert_eq!(
            authorizer().authorize("/q", Some("timeframe=this_week")),
            Err(Rejection::MissingKey)
        );
        assert_eq!(authorizer().authorize("/q", None), Err(Rejection::MissingKey));
        assert!(matches!(
            authorizer().authorize("/q", Some("api_key=BUTTS")),
            Err(Rejection::InvalidKey(_))
        ));
    }

    #[test]
    fn test_key_for_another_secret_is_rejected() {
        let other = TokenSecret::new("fedcba9876543210fedcba9876543210").unwrap();
        let key = token::encode(&other, &ScopedTokenParams::new(["read"])).unwrap();
        let raw = query(&[("api_key", key.as_str())]);

        assert!(matches!(
            authorizer().authorize("/q", Some(&raw)),
            Err(Rejection::InvalidKey(_))
        ));
    }

    #[test]
    fn test_scoped_filters_replace_widened_request_filters() {
        let params = ScopedTokenParams::new(["read"])
            .with_filters(vec![Filter::eq("x", json!("1"))]);
        let key = public_key(&params);
        let requested = filters::to_query_value(&[Filter::eq("x", json!("2"))]);
        let raw = query(&[("api_key", key.as_str()), ("filters", requested.as_str())]);

        let rewritten = authorizer().authorize("/q", Some(&raw)).unwrap();
        let sent = filters::parse_filters(rewritten.param("filters").unwrap()).unwrap();

        assert_eq!(sent, vec![Filter::eq("x", json!("1"))]);
    }

    #[test]
    fn test_scoped_filters_apply_without_request_filters() {
        let params = ScopedTokenParams::new(["read"])
            .with_filters(vec![Filter::is_in("app", vec![json!("a"), json!("b")])]);
        let key = public_key(&params);
        let raw = query(&[("api_key", key.as_str())]);

        let rewritten = authorizer().authorize("/q", Some(&raw)).unwrap();
        let sent = filters::parse_filters(rewritten.param("filters").unwrap()).unwrap();

        assert_eq!(sent, params.filters().unwrap());
    }

    #[test]
    fn test_request_filters_pass_through_without_scoped_filters() {
        let key = public_key(&ScopedTokenParams::new(["read"]));
        let raw = query(&[("api_key", key.as_str()), ("filters", "anything at all")]);

        let rewritten = authorizer().authorize("/q", Some(&raw)).unwrap();
        assert_eq!(rewritten.param("filters"), Some("anything at all"));
    }

    #[test]
    fn test_unparseable_request_filters_are_rejected_when_scoped() {
        let params = ScopedTokenParams::new(["read"])
            .with_filters(vec![Filter::eq("x", json!("1"))]);
        let key = public_key(&params);
        let raw = query(&[("api_key", key.as_str()), ("filters", "{not json")]);

        assert!(matches!(
            authorizer().authorize("/q", Some(&raw)),
            Err(Rejection::InvalidFilters(_))
        ));
    }

    #[test]
    fn test_malformed_request_filter_elements_are_dropped() {
        let params = ScopedTokenParams::new(["read"])
            .with_filters(vec![Filter::eq("x", json!("1"))]);
        let key = public_key(&params);
        let raw = query(&[
            ("api_key", key.as_str()),
            ("filters", r#"[{"operator":"eq","property_value":"2"}]"#),
        ]);

        let rewritten = authorizer().authorize("/q", Some(&raw)).unwrap();
        let sent = filters::parse_filters(rewritten.param("filters").unwrap()).unwrap();
        assert_eq!(sent, vec![Filter::eq("x", json!("1"))]);
    }

    #[test]
    fn test_analysis_type_must_match_path() {
        let params = ScopedTokenParams::new(["read"]).with_analysis_type("count");
        let key = public_key(&params);
        let raw = query(&[("api_key", key.as_str())]);

        assert!(
            authorizer()
                .authorize("/3.0/projects/P/queries/count", Some(&raw))
                .is_ok()
        );
        assert!(
            authorizer()
                .authorize("/3.0/projects/P/queries/count/", Some(&raw))
                .is_ok()
        );
        assert_eq!(
            authorizer().authorize("/3.0/projects/P/queries/sum", Some(&raw)),
            Err(Rejection::AnalysisTypeMismatch {
                expected: "count".to_string(),
                actual: Some("sum".to_string()),
            })
        );
    }

    #[test]
    fn test_cache_key_is_stable_across_reencoding() {
        let key = public_key(&ScopedTokenParams::new(["read"]));
        let raw = query(&[("api_key", key.as_str()), ("timeframe", "this_week")]);

        let first = authorizer().authorize("/q", Some(&raw)).unwrap();
        let second = authorizer().authorize("/q", Some(&raw)).unwrap();

        assert_ne!(first.param("api_key"), second.param("api_key"));
        assert_eq!(first.cache_key(), second.cache_key());
        assert!(!first.cache_key().contains("api_key"));
    }

    #[test]
    fn test_set_param_keeps_first_position() {
        let mut params = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "3".to_string()),
        ];
        set_param(&mut params, "a", vec!["x".to_string(), "y".to_string()]);
        set_param(&mut params, "c", vec!["z".to_string()]);

        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "x"), ("a", "y"), ("b", "2"), ("c", "z")]);
    }
}
