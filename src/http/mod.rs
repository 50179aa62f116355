//! HTTP/1.1 request-head data model.
//!
//! Only the pieces a protocol upgrade needs: the request line and a header
//! multimap. Parsing raw bytes into these types is the HTTP codec's job and
//! lives outside this crate.
//!
//! Headers are an *ordered multimap*: a name may appear on several lines, and
//! each line may carry a comma-separated list. The [`Headers::canonical`]
//! accessor flattens both layers into individual elements, which is the form
//! upgrade validation reads.

use core::fmt;

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
    /// PATCH
    Patch,
    /// Extension method not covered by the standard set.
    Extension(String),
}

impl Method {
    /// Returns the method as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Extension(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl Version {
    /// Returns the version as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns the number of header lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a header line, keeping any existing lines with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every line matching `name` (case-insensitive) with a single
    /// line, or appends one if the name is absent.
    pub fn replace_or_add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Returns true if at least one line matches `name` (case-insensitive).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Returns the raw values of every line matching `name`, in order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns the first raw value matching `name`, if any.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the canonical form of `name`: every matching raw value split
    /// on commas into individual elements, preserved verbatim.
    ///
    /// No whitespace trimming is applied, so `"13 "` stays a single element
    /// `"13 "` and list values like `"a, b"` yield `"a"` and `" b"`.
    #[must_use]
    pub fn canonical(&self, name: &str) -> Vec<&str> {
        self.get_all(name)
            .into_iter()
            .flat_map(|value| value.split(','))
            .collect()
    }

    /// Returns the value of `name` iff its canonical form has exactly one
    /// element.
    ///
    /// A missing header, a duplicated header line, and a comma-separated
    /// list all yield `None`.
    #[must_use]
    pub fn exactly_one(&self, name: &str) -> Option<&str> {
        match self.canonical(name).as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// Iterates all header lines in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Decoded HTTP/1.1 request head: request line plus headers, no body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// HTTP method.
    pub method: Method,
    /// Request URI (origin form, e.g. `/chat`).
    pub uri: String,
    /// HTTP version.
    pub version: Version,
    /// Request headers.
    pub headers: Headers,
}

impl RequestHead {
    /// Creates a request head with no headers, defaulting to HTTP/1.1.
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::Http11,
            headers: Headers::new(),
        }
    }

    /// Appends a header line, builder style.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Sec-WebSocket-Key", "abc");
        assert_eq!(headers.first("sec-websocket-key"), Some("abc"));
        assert!(headers.contains("SEC-WEBSOCKET-KEY"));
        assert!(!headers.contains("sec-websocket-version"));
    }

    #[test]
    fn add_keeps_duplicates_in_order() {
        let mut headers = Headers::new();
        headers.add("Via", "a");
        headers.add("Via", "b");
        assert_eq!(headers.get_all("via"), ["a", "b"]);
    }

    #[test]
    fn replace_or_add_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.add("Connection", "keep-alive");
        headers.add("connection", "close");
        headers.replace_or_add("Connection", "upgrade");
        assert_eq!(headers.get_all("connection"), ["upgrade"]);
    }

    #[test]
    fn canonical_splits_commas_verbatim() {
        let mut headers = Headers::new();
        headers.add("Sec-WebSocket-Version", "13, 8");
        assert_eq!(headers.canonical("sec-websocket-version"), ["13", " 8"]);
    }

    #[test]
    fn canonical_flattens_repeated_lines() {
        let mut headers = Headers::new();
        headers.add("Sec-WebSocket-Key", "k1");
        headers.add("Sec-WebSocket-Key", "k2");
        assert_eq!(headers.canonical("sec-websocket-key"), ["k1", "k2"]);
    }

    #[test]
    fn exactly_one_rejects_absent_lists_and_duplicates() {
        let mut headers = Headers::new();
        assert_eq!(headers.exactly_one("x"), None);

        headers.add("X", "a,b");
        assert_eq!(headers.exactly_one("x"), None);

        let mut dup = Headers::new();
        dup.add("X", "a");
        dup.add("X", "b");
        assert_eq!(dup.exactly_one("x"), None);

        let mut single = Headers::new();
        single.add("X", "a");
        assert_eq!(single.exactly_one("x"), Some("a"));
    }

    #[test]
    fn exactly_one_does_not_trim() {
        let mut headers = Headers::new();
        headers.add("Sec-WebSocket-Version", "13 ");
        assert_eq!(headers.exactly_one("sec-websocket-version"), Some("13 "));
    }

    #[test]
    fn request_head_builder() {
        let head = RequestHead::new(Method::Get, "/chat").with_header("Host", "example.com");
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.first("host"), Some("example.com"));
    }
}
