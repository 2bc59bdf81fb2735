//! HTTP request disguise framing.
//!
//! Outbound, the first chunk is prefixed with a templated HTTP request
//! header naming the configured host; the ciphertext rides as the body and
//! later chunks flow bare. Inbound, everything up to the first `\r\n\r\n`
//! is discarded as the peer's header and the remainder is ciphertext.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

use super::hex_token;

/// Header/body delimiter.
const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Bytes of entropy in the disguise request path.
const PATH_TOKEN_LEN: usize = 8;

/// Ceiling on a peer header while reassembling it across reads.
const MAX_HEADER_LEN: usize = 8 * 1024;

#[derive(Clone, Copy, PartialEq)]
enum Verb {
    Get,
    Post,
}

/// One direction's worth of HTTP disguise state.
pub(crate) struct HttpObfs {
    verb: Verb,
    host: String,
    port: u16,
    header_sent: bool,
    header_stripped: bool,
    pending: Vec<u8>,
}

impl HttpObfs {
    pub(crate) fn get(host: &str, port: u16) -> Self {
        Self::new(Verb::Get, host, port)
    }

    pub(crate) fn post(host: &str, port: u16) -> Self {
        Self::new(Verb::Post, host, port)
    }

    fn new(verb: Verb, host: &str, port: u16) -> Self {
        Self {
            verb,
            host: host.to_string(),
            port,
            header_sent: false,
            header_stripped: false,
            pending: Vec::new(),
        }
    }

    /// Prefix the first chunk with the request header; pass later chunks.
    pub(crate) fn wrap(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        if self.header_sent {
            return ciphertext.to_vec();
        }
        self.header_sent = true;

        let header = self.request_header();
        let mut framed = Vec::with_capacity(header.len() + ciphertext.len());
        framed.extend_from_slice(header.as_bytes());
        framed.extend_from_slice(ciphertext);
        framed
    }

    /// Strip the peer's header from the first chunk; pass later chunks.
    pub(crate) fn unwrap(&mut self, framed: &[u8]) -> Result<Vec<u8>> {
        if self.header_stripped {
            return Ok(framed.to_vec());
        }

        let delimiter = find_delimiter(framed).ok_or_else(|| {
            Error::invalid_protocol("http framing lacks header/body delimiter")
        })?;

        let header = &framed[..delimiter];
        if !looks_like_http(header) {
            return Err(Error::invalid_protocol("first line is not HTTP"));
        }

        self.header_stripped = true;
        Ok(framed[delimiter + CRLF_CRLF.len()..].to_vec())
    }

    /// Streaming variant of [`Self::unwrap`] for relay reads.
    ///
    /// A header split across reads is reassembled internally; the call
    /// yields nothing until the delimiter arrives. A peer that streams more
    /// than [`MAX_HEADER_LEN`] bytes without one is violating the framing.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        if self.header_stripped {
            return Ok(chunk.to_vec());
        }

        self.pending.extend_from_slice(chunk);
        if find_delimiter(&self.pending).is_none() {
            if self.pending.len() > MAX_HEADER_LEN {
                return Err(Error::invalid_protocol("header exceeds size limit"));
            }
            return Ok(Vec::new());
        }

        let buffered = std::mem::take(&mut self.pending);
        self.unwrap(&buffered)
    }

    fn request_header(&self) -> String {
        let mut token = [0u8; PATH_TOKEN_LEN];
        OsRng.fill_bytes(&mut token);
        let path = hex_token(&token);

        let host = if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };

        match self.verb {
            Verb::Get => format!(
                "GET /{path} HTTP/1.1\r\n\
                 Host: {host}\r\n\
                 User-Agent: curl/7.88.1\r\n\
                 Accept: */*\r\n\
                 Connection: keep-alive\r\n\r\n"
            ),
            Verb::Post => {
                let mut boundary = [0u8; PATH_TOKEN_LEN];
                OsRng.fill_bytes(&mut boundary);
                format!(
                    "POST /{path} HTTP/1.1\r\n\
                     Host: {host}\r\n\
                     User-Agent: curl/7.88.1\r\n\
                     Accept: */*\r\n\
                     Content-Type: multipart/form-data; boundary=----{}\r\n\
                     Connection: keep-alive\r\n\r\n",
                    hex_token(&boundary)
                )
            }
        }
    }
}

fn find_delimiter(data: &[u8]) -> Option<usize> {
    data.windows(CRLF_CRLF.len())
        .position(|window| window == CRLF_CRLF)
}

/// Accepts both requests (`GET / HTTP/1.1`) and responses (`HTTP/1.1 200`).
fn looks_like_http(header: &[u8]) -> bool {
    let first_line = header.split(|&b| b == b'\r').next().unwrap_or(header);
    std::str::from_utf8(first_line)
        .map(|line| line.contains("HTTP/1."))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_carries_header() {
        let mut obfs = HttpObfs::get("ssr.example.com", 8388);

        let framed = obfs.wrap(b"ciphertext");
        assert!(framed.starts_with(b"GET /"));

        // Later chunks flow bare
        let framed = obfs.wrap(b"more");
        assert_eq!(framed, b"more");
    }

    #[test]
    fn test_header_is_valid_http_naming_host() {
        let ciphertext = vec![0xEE; 512];
        let mut obfs = HttpObfs::get("ssr.example.com", 8388);
        let framed = obfs.wrap(&ciphertext);

        let delimiter = find_delimiter(&framed).unwrap();
        let header = std::str::from_utf8(&framed[..delimiter]).unwrap();
        let mut lines = header.lines();

        // Request line: VERB SP path SP version
        let request_line: Vec<&str> = lines.next().unwrap().split(' ').collect();
        assert_eq!(request_line.len(), 3);
        assert_eq!(request_line[0], "GET");
        assert!(request_line[1].starts_with('/'));
        assert_eq!(request_line[2], "HTTP/1.1");

        // Every header line is "Name: value", with the Host we configured
        let mut saw_host = false;
        for line in lines {
            let (name, value) = line.split_once(": ").unwrap();
            assert!(!name.is_empty() && !value.is_empty());
            if name == "Host" {
                assert_eq!(value, "ssr.example.com:8388");
                saw_host = true;
            }
        }
        assert!(saw_host);

        // Body is the untouched ciphertext
        assert_eq!(&framed[delimiter + 4..], ciphertext.as_slice());
    }

    #[test]
    fn test_post_variant_has_content_type() {
        let mut obfs = HttpObfs::post("ssr.example.com", 8388);
        let framed = obfs.wrap(b"upload");
        let text = String::from_utf8_lossy(&framed);

        assert!(text.starts_with("POST /"));
        assert!(text.contains("Content-Type: multipart/form-data; boundary=----"));
    }

    #[test]
    fn test_default_port_omitted_from_host() {
        let mut obfs = HttpObfs::get("ssr.example.com", 80);
        let framed = obfs.wrap(b"x");
        let text = String::from_utf8_lossy(&framed);
        assert!(text.contains("Host: ssr.example.com\r\n"));
    }

    #[test]
    fn test_unwrap_roundtrip() {
        let mut out = HttpObfs::post("ssr.example.com", 8388);
        let mut inbound = HttpObfs::post("ssr.example.com", 8388);

        let framed = out.wrap(b"first payload");
        assert_eq!(inbound.unwrap(&framed).unwrap(), b"first payload");

        let framed = out.wrap(b"second payload");
        assert_eq!(inbound.unwrap(&framed).unwrap(), b"second payload");
    }

    #[test]
    fn test_unwrap_accepts_server_response_header() {
        let mut inbound = HttpObfs::get("ssr.example.com", 8388);
        let framed = b"HTTP/1.1 200 OK\r\nServer: nginx\r\n\r\nbody-bytes".to_vec();
        assert_eq!(inbound.unwrap(&framed).unwrap(), b"body-bytes");
    }

    #[test]
    fn test_missing_delimiter_is_protocol_violation() {
        let mut inbound = HttpObfs::get("ssr.example.com", 8388);
        let truncated = b"GET / HTTP/1.1\r\nHost: ssr.example.com\r\n";

        let result = inbound.unwrap(truncated);
        assert!(matches!(result, Err(Error::InvalidProtocol(_))));
        // No partial data escaped and the state did not advance
        assert!(!inbound.header_stripped);
    }

    #[test]
    fn test_feed_reassembles_split_header() {
        let mut out = HttpObfs::get("ssr.example.com", 8388);
        let mut inbound = HttpObfs::get("ssr.example.com", 8388);

        let framed = out.wrap(b"payload after split header");
        let split = 10; // mid-request-line

        assert_eq!(inbound.feed(&framed[..split]).unwrap(), Vec::<u8>::new());
        assert_eq!(
            inbound.feed(&framed[split..]).unwrap(),
            b"payload after split header"
        );

        // Steady state passes through
        assert_eq!(inbound.feed(b"more").unwrap(), b"more");
    }

    #[test]
    fn test_feed_bounds_headerless_stream() {
        let mut inbound = HttpObfs::get("ssr.example.com", 8388);
        let garbage = vec![b'a'; MAX_HEADER_LEN + 1];
        assert!(matches!(
            inbound.feed(&garbage),
            Err(Error::InvalidProtocol(_))
        ));
    }

    #[test]
    fn test_non_http_prefix_is_protocol_violation() {
        let mut inbound = HttpObfs::get("ssr.example.com", 8388);
        let bogus = b"\x16\x03\x01 binary junk\r\n\r\npayload";
        assert!(matches!(
            inbound.unwrap(bogus),
            Err(Error::InvalidProtocol(_))
        ));
    }
}
