//! Token extraction from an inbound request.
//!
//! Lookup order is a fallback chain: the named header, then the named query
//! parameter, then the named cookie. Only the header value has its
//! `Bearer ` prefix removed; query and cookie values are used verbatim.

use axum::http::{HeaderMap, Request, header::COOKIE};

/// Read-only view of the request parts authentication looks at.
pub struct AuthRequest<'a> {
    path: &'a str,
    headers: &'a HeaderMap,
    query: Vec<(String, String)>,
}

impl<'a> AuthRequest<'a> {
    /// Build a view from raw parts. `query` is the undecoded query string.
    #[must_use]
    pub fn new(path: &'a str, query: Option<&str>, headers: &'a HeaderMap) -> Self {
        let query = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            path,
            headers,
            query,
        }
    }

    /// Build a view over an HTTP request.
    #[must_use]
    pub fn from_http<B>(request: &'a Request<B>) -> Self {
        Self::new(request.uri().path(), request.uri().query(), request.headers())
    }

    /// Request path (no query string).
    #[must_use]
    pub fn path(&self) -> &'a str {
        self.path
    }

    /// Header value by name (case-insensitive). Non-UTF-8 values are ignored.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First query parameter named `name`, percent-decoded.
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Cookie value by name, searched across all `Cookie` headers.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}

/// Remove a leading `Bearer ` (any ASCII case) if present.
///
/// The same rule is applied to values read back from the revocation store, so
/// both sides of the comparison are normalised identically.
#[must_use]
pub fn strip_bearer(value: &str) -> &str {
    const PREFIX: &str = "bearer ";
    match value.get(..PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PREFIX) => &value[PREFIX.len()..],
        _ => value,
    }
}

/// Locate the bearer token: header, then query parameter, then cookie.
///
/// Returns `None` when none of the three sources is present.
#[must_use]
pub fn extract_token<'r>(
    request: &'r AuthRequest<'r>,
    header: &str,
    query: &str,
    cookie: &str,
) -> Option<&'r str> {
    if let Some(value) = request.header(header) {
        return Some(strip_bearer(value));
    }
    if let Some(value) = request.query(query) {
        return Some(value);
    }
    request.cookie(cookie)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn strip_bearer_handles_both_cases() {
        assert_eq!(strip_bearer("Bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(strip_bearer("bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(strip_bearer("BEARER abc"), "abc");
        assert_eq!(strip_bearer("abc.def.ghi"), "abc.def.ghi");
        assert_eq!(strip_bearer("Bearer"), "Bearer");
        assert_eq!(strip_bearer(""), "");
    }

    #[test]
    fn strip_bearer_only_removes_one_prefix() {
        assert_eq!(strip_bearer("Bearer Bearer x"), "Bearer x");
    }

    #[test]
    fn header_wins_over_query_and_cookie() {
        // GIVEN: all three sources present
        let h = headers(&[("authorization", "Bearer from-header"), ("cookie", "jwt=from-cookie")]);
        let req = AuthRequest::new("/api", Some("jwt=from-query"), &h);

        // THEN: the header is used
        assert_eq!(
            extract_token(&req, "authorization", "jwt", "jwt"),
            Some("from-header")
        );
    }

    #[test]
    fn query_wins_over_cookie() {
        let h = headers(&[("cookie", "jwt=from-cookie")]);
        let req = AuthRequest::new("/api", Some("other=1&jwt=from-query"), &h);

        assert_eq!(extract_token(&req, "authorization", "jwt", "jwt"), Some("from-query"));
    }

    #[test]
    fn cookie_used_last() {
        let h = headers(&[("cookie", "session=x; jwt=from-cookie")]);
        let req = AuthRequest::new("/api", None, &h);

        assert_eq!(extract_token(&req, "authorization", "jwt", "jwt"), Some("from-cookie"));
    }

    #[test]
    fn missing_everywhere_is_none() {
        let h = HeaderMap::new();
        let req = AuthRequest::new("/api", Some("foo=bar"), &h);

        assert_eq!(extract_token(&req, "authorization", "jwt", "jwt"), None);
    }

    #[test]
    fn query_and_cookie_values_are_not_stripped() {
        let h = headers(&[("cookie", "jwt=Bearer tok")]);
        let req = AuthRequest::new("/api", None, &h);
        assert_eq!(extract_token(&req, "authorization", "jwt", "jwt"), Some("Bearer tok"));

        let h = HeaderMap::new();
        let req = AuthRequest::new("/api", Some("jwt=Bearer%20tok"), &h);
        assert_eq!(extract_token(&req, "authorization", "jwt", "jwt"), Some("Bearer tok"));
    }

    #[test]
    fn header_without_prefix_is_used_raw() {
        let h = headers(&[("x-token", "raw-token")]);
        let req = AuthRequest::new("/api", None, &h);
        assert_eq!(extract_token(&req, "X-Token", "jwt", "jwt"), Some("raw-token"));
    }

    #[test]
    fn cookie_lookup_spans_multiple_headers() {
        let h = headers(&[("cookie", "a=1"), ("cookie", "b=2; jwt=tok")]);
        let req = AuthRequest::new("/", None, &h);
        assert_eq!(req.cookie("jwt"), Some("tok"));
        assert_eq!(req.cookie("a"), Some("1"));
        assert_eq!(req.cookie("missing"), None);
    }
}
