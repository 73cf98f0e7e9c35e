//! The parsed head of an inbound request.

use std::collections::BTreeMap;
use std::io::Read;

use capbridge_core::{Deadline, Error, Result, Value};
use url::form_urlencoded;

use crate::io::{read_some, RequestIo};

/// Upper bound on a request head read from a raw transport.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Method, target, headers and routing results for one request.
///
/// Header lookups ignore ASCII case. Repeated headers and query keys keep
/// every value; single-value getters return the first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHead {
    method: String,
    url: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    path_variables: BTreeMap<String, String>,
}

impl RequestHead {
    /// `url` is the request target: a path with an optional query string.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        let method: String = method.into();
        let url: String = url.into();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, query),
            None => (url.as_str(), ""),
        };
        let query = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self {
            method: method.to_ascii_uppercase(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            url,
            query,
            headers: Vec::new(),
            path_variables: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn set_path_variables(&mut self, variables: BTreeMap<String, String>) {
        self.path_variables = variables;
    }

    /// Parse an HTTP/1.x request line and headers from `io`.
    ///
    /// Reads one byte at a time so nothing past the blank line is consumed;
    /// the body stays on the transport for the request context.
    pub fn read_from<R: Read + ?Sized>(io: &mut R) -> Result<Self> {
        Self::read_with(|byte| Ok(io.read(byte)?))
    }

    /// Like [`read_from`](Self::read_from), but the whole head must arrive
    /// before `deadline`. A client trickling bytes times out all the same.
    pub fn read_from_within<R: RequestIo + ?Sized>(io: &mut R, deadline: &Deadline) -> Result<Self> {
        Self::read_with(|byte| read_some(&mut *io, byte, deadline, "read request head"))
    }

    fn read_with(mut read: impl FnMut(&mut [u8]) -> Result<usize>) -> Result<Self> {
        let mut raw = Vec::with_capacity(512);
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            if raw.len() >= MAX_HEAD_BYTES {
                return Err(Error::exhausted("request head too large"));
            }
            if read(&mut byte)? == 0 {
                return Err(Error::illegal_state("connection closed inside request head"));
            }
            raw.push(byte[0]);
        }

        let text = String::from_utf8_lossy(&raw);
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/") => {
                (method, target)
            }
            _ => {
                return Err(Error::illegal_state(format!(
                    "malformed request line {:?}",
                    request_line
                )))
            }
        };

        let mut head = RequestHead::new(method, target);
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::illegal_state(format!("malformed header {:?}", line)))?;
            head.headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(head)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw request target.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Look a cookie up across every `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, value)| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn path_variables(&self) -> &BTreeMap<String, String> {
        &self.path_variables
    }

    pub fn path_variable(&self, name: &str) -> Option<&str> {
        self.path_variables.get(name).map(String::as_str)
    }

    /// Declared body length. A missing or unparsable header means no body.
    pub fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Query parameters as a map of first values, the shape scripts see.
    pub fn query_value(&self) -> Value {
        let mut map = BTreeMap::new();
        for (key, value) in &self.query {
            map.entry(key.clone())
                .or_insert_with(|| Value::from(value.as_str()));
        }
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collection_literals::btree;

    #[test]
    fn splits_path_and_query() {
        let head = RequestHead::new("get", "/items/7?tag=a&tag=b&q=hello%20world");
        assert_eq!(head.method(), "GET");
        assert_eq!(head.path(), "/items/7");
        assert_eq!(head.query("q"), Some("hello world"));
        assert_eq!(head.query_all("tag"), vec!["a", "b"]);
        assert_eq!(head.query("missing"), None);
    }

    #[test]
    fn headers_ignore_case() {
        let head = RequestHead::new("GET", "/").with_header("Content-Type", "text/plain");
        assert_eq!(head.header("content-type"), Some("text/plain"));
        assert_eq!(head.header("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn cookies_across_headers() {
        let head = RequestHead::new("GET", "/")
            .with_header("Cookie", "session=abc; theme=dark")
            .with_header("cookie", "lang=en");
        assert_eq!(head.cookie("theme"), Some("dark"));
        assert_eq!(head.cookie("lang"), Some("en"));
        assert_eq!(head.cookie("nope"), None);
    }

    #[test]
    fn parses_raw_head_without_consuming_body() {
        let raw = b"POST /upload?x=1 HTTP/1.1\r\nHost: local\r\nContent-Length: 4\r\n\r\nbody";
        let mut cursor = &raw[..];
        let head = RequestHead::read_from(&mut cursor).unwrap();
        assert_eq!(head.method(), "POST");
        assert_eq!(head.path(), "/upload");
        assert_eq!(head.content_length(), 4);
        assert_eq!(cursor, b"body");
    }

    #[test]
    fn rejects_truncated_head() {
        let mut cursor = &b"GET / HTTP/1.1\r\nHost: x\r\n"[..];
        assert!(RequestHead::read_from(&mut cursor).is_err());
        let mut cursor = &b"garbage\r\n\r\n"[..];
        assert!(RequestHead::read_from(&mut cursor).is_err());
    }

    #[test]
    fn trickled_head_times_out_as_a_whole() {
        use std::io::Write;
        use std::time::{Duration, Instant};

        let (mut client, mut server) = crate::io::duplex();
        let writer = std::thread::spawn(move || {
            // Each byte arrives well inside any single read timeout.
            for byte in b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n" {
                if client.write_all(&[*byte]).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        });
        let start = Instant::now();
        let err = RequestHead::read_from_within(&mut server, &Deadline::from_timeout_ms(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(500));
        drop(server);
        writer.join().unwrap();
    }

    #[test]
    fn head_within_deadline_parses() {
        let (mut client, mut server) = crate::io::duplex();
        std::io::Write::write_all(&mut client, b"GET /ok?a=1 HTTP/1.1\r\n\r\n").unwrap();
        let head = RequestHead::read_from_within(&mut server, &Deadline::from_timeout_ms(1_000)).unwrap();
        assert_eq!(head.path(), "/ok");
        assert_eq!(head.query("a"), Some("1"));
    }

    #[test]
    fn path_variables_round_trip() {
        let mut head = RequestHead::new("GET", "/users/42");
        head.set_path_variables(btree! { "id".to_string() => "42".to_string() });
        assert_eq!(head.path_variable("id"), Some("42"));
        assert_eq!(head.query_value(), Value::map());
    }
}
