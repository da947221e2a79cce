//! Incremental HTTP/1.1 request parser.
//!
//! A strict forward state machine over the connection's read buffer:
//! `RequestLine → Headers → Body → Finished`. The driver consumes one
//! CRLF-terminated line at a time; when no complete line is buffered it
//! stops and reports incomplete without consuming the partial line, so
//! a later read can resume exactly where it left off.
//!
//! Known boundary: once the `Body` state is entered, whatever is
//! buffered (up to the declared `Content-Length`) is taken in a single
//! pass and the request finishes. A body split across read cycles is
//! truncated. Header names are stored and looked up with the exact case
//! the client sent.

use std::collections::HashMap;

use skiff_core::Buffer;

use crate::auth::CredentialStore;

/// Routes served as `<route>.html` when requested without an extension.
const DEFAULT_ROUTES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

const FORM_MIME: &str = "application/x-www-form-urlencoded";

/// Form targets that trigger credential verification.
/// Returns `Some(is_login)`.
fn form_target(path: &str) -> Option<bool> {
    match path {
        "/register.html" => Some(false),
        "/login.html" => Some(true),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request is parsed; the fields below are valid.
    Complete,
    /// Needs more data; nothing partial was consumed.
    Incomplete,
    /// Structurally malformed; respond 400.
    BadRequest,
}

pub struct HttpRequest {
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    form: HashMap<String, String>,
    state: ParseState,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            form: HashMap::new(),
            state: ParseState::RequestLine,
        }
    }

    /// Reset for the next request on a kept-alive socket.
    pub fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.form.clear();
        self.state = ParseState::RequestLine;
    }

    /// Drive the state machine over `buf`. `store` backs the
    /// login/register form targets.
    pub fn parse(&mut self, buf: &mut Buffer, store: &dyn CredentialStore) -> ParseStatus {
        if buf.readable_bytes() == 0 {
            return ParseStatus::Incomplete;
        }
        while buf.readable_bytes() > 0 && self.state != ParseState::Finished {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return ParseStatus::Incomplete;
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve(end + 2);
                    if self.state == ParseState::RequestLine {
                        if !self.parse_request_line(&line) {
                            log::debug!("malformed request line: {:?}", line);
                            return ParseStatus::BadRequest;
                        }
                        self.normalize_path();
                        self.state = ParseState::Headers;
                    } else {
                        self.parse_header_line(&line);
                    }
                }
                ParseState::Body => self.parse_body(buf, store),
                ParseState::Finished => unreachable!(),
            }
        }
        if self.state == ParseState::Finished {
            log::debug!(
                "request [{}] [{}] [{}]",
                self.method,
                self.path,
                self.version
            );
            ParseStatus::Complete
        } else {
            ParseStatus::Incomplete
        }
    }

    /// `METHOD SP PATH SP HTTP/VERSION`, single spaces, GET or POST.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if method != "GET" && method != "POST" {
            return false;
        }
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return false;
        };
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        true
    }

    /// Bare and empty paths map onto their `.html` documents.
    fn normalize_path(&mut self) {
        if self.path.is_empty() || self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_ROUTES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// `NAME: VALUE` stores a header; any line that fails the pattern
    /// (notably the blank line) is the header/body separator.
    fn parse_header_line(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                self.headers
                    .insert(name.to_string(), value.trim().to_string());
            }
            None => {
                self.state = if self.content_length() > 0 {
                    ParseState::Body
                } else {
                    ParseState::Finished
                };
            }
        }
    }

    /// One pass: take whatever is buffered up to the declared length,
    /// decode form payloads, finish unconditionally.
    fn parse_body(&mut self, buf: &mut Buffer, store: &dyn CredentialStore) {
        let take = self.content_length().min(buf.readable_bytes());
        self.body = String::from_utf8_lossy(&buf.peek()[..take]).into_owned();
        buf.retrieve(take);
        self.parse_post(store);
        self.state = ParseState::Finished;
    }

    /// Urlencoded POST bodies populate the form map; the login/register
    /// targets additionally verify credentials and rewrite the path to
    /// the welcome or error page.
    fn parse_post(&mut self, store: &dyn CredentialStore) {
        if self.method != "POST"
            || self.headers.get("Content-Type").map(String::as_str) != Some(FORM_MIME)
        {
            return;
        }
        self.form = decode_urlencoded(&self.body);
        if let Some(is_login) = form_target(&self.path) {
            let user = self.form.get("username").map(String::as_str).unwrap_or("");
            let password = self.form.get("password").map(String::as_str).unwrap_or("");
            self.path = if store.verify(user, password, is_login) {
                "/welcome.html".to_string()
            } else {
                "/error.html".to_string()
            };
        }
    }

    fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Keep-alive requires the exact header value and HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.headers.get("Connection").map(String::as_str) == Some("keep-alive")
            && self.version == "1.1"
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Decode `key=value&key=value` with `+` → space and `%XX` unescaping.
fn decode_urlencoded(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        form.insert(decode_component(key), decode_component(value));
    }
    form
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentials;

    fn parse_str(req: &mut HttpRequest, input: &str) -> ParseStatus {
        let mut buf = Buffer::new();
        buf.append(input.as_bytes());
        req.parse(&mut buf, &MemoryCredentials::new())
    }

    #[test]
    fn test_minimal_get_is_deterministic() {
        let mut req = HttpRequest::new();
        let status = parse_str(&mut req, "GET / HTTP/1.1\r\n\r\n");
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header_count(), 0);
        assert_eq!(req.state(), ParseState::Finished);
    }

    #[test]
    fn test_finished_request_does_not_reparse() {
        let mut req = HttpRequest::new();
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        let store = MemoryCredentials::new();
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(buf.readable_bytes(), 0);
        // Re-invoking on the now-empty region reports incomplete.
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Incomplete);
        assert_eq!(req.state(), ParseState::Finished);
    }

    #[test]
    fn test_bare_route_gets_extension() {
        let mut req = HttpRequest::new();
        parse_str(&mut req, "GET /login HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/login.html");

        let mut req = HttpRequest::new();
        parse_str(&mut req, "GET /other HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/other");
    }

    #[test]
    fn test_headers_stored_case_sensitively() {
        let mut req = HttpRequest::new();
        let status = parse_str(
            &mut req,
            "GET /a.txt HTTP/1.1\r\nHost: example.com\r\nuser-agent: tester\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(req.header("Host"), Some("example.com"));
        assert_eq!(req.header("user-agent"), Some("tester"));
        // Lookup uses the exact case as stored.
        assert_eq!(req.header("host"), None);
    }

    #[test]
    fn test_malformed_request_line_is_bad_request() {
        for input in [
            "DELETE /x HTTP/1.1\r\n\r\n",
            "GET /index.html\r\n\r\n",
            "GET  /index.html HTTP/1.1\r\n\r\n",
            "GET /index.html FTP/1.1\r\n\r\n",
        ] {
            let mut req = HttpRequest::new();
            assert_eq!(
                parse_str(&mut req, input),
                ParseStatus::BadRequest,
                "input: {input:?}"
            );
        }
    }

    #[test]
    fn test_incomplete_line_not_consumed() {
        let mut req = HttpRequest::new();
        let mut buf = Buffer::new();
        let store = MemoryCredentials::new();
        buf.append(b"GET /index.html HT");
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Incomplete);
        assert_eq!(buf.readable_bytes(), 18);

        // The rest arrives on a later read cycle.
        buf.append(b"TP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.header("Host"), Some("h"));
    }

    #[test]
    fn test_keep_alive_detection() {
        let mut req = HttpRequest::new();
        parse_str(
            &mut req,
            "GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(req.is_keep_alive());

        let mut req = HttpRequest::new();
        parse_str(&mut req, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.is_keep_alive());

        // HTTP/1.0 never keeps alive, whatever the header says.
        let mut req = HttpRequest::new();
        parse_str(
            &mut req,
            "GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_post_form_decoding() {
        let mut req = HttpRequest::new();
        let body = "name=hello+world&note=a%26b%3Dc";
        let input = format!(
            "POST /submit HTTP/1.1\r\nContent-Type: {FORM_MIME}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        assert_eq!(parse_str(&mut req, &input), ParseStatus::Complete);
        assert_eq!(req.form_value("name"), Some("hello world"));
        assert_eq!(req.form_value("note"), Some("a&b=c"));
    }

    #[test]
    fn test_login_rewrites_path() {
        let store = MemoryCredentials::with_users([("alice", "secret")]);
        let body = "username=alice&password=secret";
        let input = format!(
            "POST /login HTTP/1.1\r\nContent-Type: {FORM_MIME}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut buf = Buffer::new();
        buf.append(input.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(req.path(), "/welcome.html");

        // Wrong password lands on the error page.
        let body = "username=alice&password=nope";
        let input = format!(
            "POST /login HTTP/1.1\r\nContent-Type: {FORM_MIME}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut buf = Buffer::new();
        buf.append(input.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_register_inserts_user() {
        let store = MemoryCredentials::new();
        let body = "username=bob&password=pw";
        let input = format!(
            "POST /register HTTP/1.1\r\nContent-Type: {FORM_MIME}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut buf = Buffer::new();
        buf.append(input.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(req.path(), "/welcome.html");
        assert!(store.verify("bob", "pw", true));
    }

    #[test]
    fn test_body_stops_at_declared_length() {
        // Bytes past Content-Length are left for the next request.
        let mut req = HttpRequest::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcrest");
        let store = MemoryCredentials::new();
        assert_eq!(req.parse(&mut buf, &store), ParseStatus::Complete);
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.peek(), b"rest");
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut req = HttpRequest::new();
        parse_str(&mut req, "GET /login HTTP/1.1\r\nHost: h\r\n\r\n");
        req.reset();
        assert_eq!(req.state(), ParseState::RequestLine);
        assert_eq!(req.method(), "");
        assert_eq!(req.header_count(), 0);
    }
}
