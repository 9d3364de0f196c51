//! Request URI carried in the wire envelope
//!
//! The broker reads the route segment and entity keys from it and appends
//! side-channel query parameters (`cli_identity`, `issued_ipaddr`,
//! `issued_port`, `start_time`, `processing-time`). Query values are kept
//! in their encoded form so untouched parameters survive a rewrite
//! byte-for-byte.

use crate::{CoreError, Result};
use std::fmt;

/// Parsed `scheme://authority/path?query` URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestUri {
    scheme: String,
    authority: String,
    path: String,
    // (key, percent-encoded value)
    queries: Vec<(String, String)>,
}

impl RequestUri {
    /// Parse a request URI. The scheme is optional; the path must be
    /// absolute when present.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(CoreError::InvalidArgument("empty uri".to_string()));
        }

        // A scheme separator only counts before any path or query
        let prefix_end = input.find(|c: char| c == '/' || c == '?').unwrap_or(input.len());
        let (scheme, rest) = match input.find("://") {
            Some(pos) if pos < prefix_end => (&input[..pos], &input[pos + 3..]),
            _ => ("", input),
        };

        let (before_query, query) = match rest.find('?') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };

        let (authority, path) = if scheme.is_empty() {
            // Without a scheme the input is a bare path
            ("", before_query)
        } else {
            match before_query.find('/') {
                Some(pos) => (&before_query[..pos], &before_query[pos..]),
                None => (before_query, ""),
            }
        };

        if !path.is_empty() && !path.starts_with('/') {
            return Err(CoreError::InvalidArgument(format!(
                "relative path in uri: {}",
                input
            )));
        }

        let mut queries = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = match pair.find('=') {
                    Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                    None => (pair, ""),
                };
                queries.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            queries,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// First path segment including its leading slash ("/update" for
    /// "ztcp://host/update/x?vid=1")
    pub fn url_name(&self) -> Option<&str> {
        let rest = self.path.strip_prefix('/')?;
        let end = rest.find('/').unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        Some(&self.path[..end + 1])
    }

    /// Decoded value of the first query parameter named `key`
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.query_bytes(key)
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }

    /// Raw decoded bytes of the first query parameter named `key`
    pub fn query_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.queries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| percent_decode(v))
    }

    /// Append a query parameter
    pub fn add_query(&mut self, key: &str, value: &str) -> Result<()> {
        self.add_query_bytes(key, value.as_bytes())
    }

    /// Append a query parameter holding arbitrary bytes
    pub fn add_query_bytes(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CoreError::InvalidArgument("empty query key".to_string()));
        }
        self.queries.push((key.to_string(), percent_encode(value)));
        Ok(())
    }

    /// Replace the value of an existing query parameter
    pub fn change_query(&mut self, key: &str, value: &str) -> Result<()> {
        match self.queries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                entry.1 = percent_encode(value.as_bytes());
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("query parameter {}", key))),
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }
}

impl fmt::Display for RequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://{}", self.scheme, self.authority)?;
        }
        f.write_str(&self.path)?;
        for (i, (key, value)) in self.queries.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        Ok(())
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b':')
}

fn percent_encode(value: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(value.len());
    for &b in value {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            write!(&mut out, "%{:02X}", b).ok();
        }
    }
    out
}

fn percent_decode(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
