//! Per-request propagation scope.

use http::{header::HeaderName, HeaderMap, HeaderValue};
use std::sync::Arc;

/// The headers recorded for one request, carried in that request's
/// extensions for the duration of the request only.
///
/// The scope is immutable once built and is never held by the handler,
/// the connection, or the outbound transport; the send path reads it
/// solely from the request it is about to send. That is the property that
/// keeps values from one request off of the next one when outbound
/// connections are reused.
#[derive(Clone, Debug, Default)]
pub struct RequestScope(Arc<[(HeaderName, HeaderValue)]>);

impl RequestScope {
    pub fn new(entries: Vec<(HeaderName, HeaderValue)>) -> Self {
        Self(entries.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(HeaderName, HeaderValue)> {
        self.0.iter()
    }

    /// Sets each recorded header on `headers` unless the name is already
    /// present. Returns how many headers were added.
    pub fn apply(&self, headers: &mut HeaderMap) -> usize {
        let mut added = 0;
        for (name, value) in self.iter() {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
                added += 1;
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> RequestScope {
        RequestScope::new(
            pairs
                .iter()
                .map(|(n, v)| {
                    (
                        HeaderName::from_bytes(n.as_bytes()).unwrap(),
                        HeaderValue::from_str(v).unwrap(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn applies_missing_headers() {
        let mut headers = HeaderMap::new();
        let added = scope(&[("x-request-id", "a"), ("x-tenant-id", "t")]).apply(&mut headers);
        assert_eq!(added, 2);
        assert_eq!(headers["x-request-id"], "a");
        assert_eq!(headers["x-tenant-id"], "t");
    }

    #[test]
    fn never_overwrites() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("original"));
        let added = scope(&[("x-request-id", "injected")]).apply(&mut headers);
        assert_eq!(added, 0);
        assert_eq!(headers["x-request-id"], "original");
    }
}
