//! Request variance, per HTTP's `Vary` rules.
//!
//! A cached response may carry a `Vary` header naming the request fields
//! that select among variants. The rule is captured when the response is
//! stored; at lookup time the candidate request's variant key is built into
//! workspace scratch and compared against the stored key.

use std::str::FromStr;

use http::{HeaderMap, HeaderName};

use crate::{workspace::Workspace, Error};

/// The set of request fields a stored response varies on, sorted and
/// deduplicated so header order on the wire does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaryRule {
    headers: Vec<HeaderName>,
    wildcard: bool,
}

impl FromStr for VaryRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut wildcard = false;
        let mut headers = Vec::new();
        for field in s.split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            if field == "*" {
                wildcard = true;
                continue;
            }
            headers.push(HeaderName::try_from(field)?);
        }
        headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        headers.dedup();
        Ok(VaryRule { headers, wildcard })
    }
}

impl VaryRule {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && !self.wildcard
    }

    /// `Vary: *` can never be matched by a later request.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Build the variant key for a request, allocating. Used at store time.
    pub fn variant(&self, headers: &HeaderMap) -> Variant {
        let mut key = Vec::new();
        self.write_key(headers, |bytes| {
            key.extend_from_slice(bytes);
            true
        });
        Variant(key)
    }

    /// Build the variant key into workspace scratch and compare against a
    /// stored key. A key too large for the workspace never matches.
    pub fn matches(&self, headers: &HeaderMap, stored: &Variant, ws: &mut Workspace) -> bool {
        if self.wildcard {
            return false;
        }
        let buf = ws.reserve();
        let mut len = 0usize;
        let mut fits = true;
        self.write_key(headers, |bytes| {
            if len + bytes.len() > buf.len() {
                fits = false;
                return false;
            }
            buf[len..len + bytes.len()].copy_from_slice(bytes);
            len += bytes.len();
            true
        });
        let matched = fits && &buf[..len] == stored.0.as_slice();
        ws.release(0);
        matched
    }

    fn write_key(&self, headers: &HeaderMap, mut sink: impl FnMut(&[u8]) -> bool) {
        for name in &self.headers {
            if !sink(name.as_str().as_bytes()) {
                return;
            }
            if !sink(b":") {
                return;
            }
            for value in headers.get_all(name) {
                if !sink(value.as_bytes()) {
                    return;
                }
            }
            if !sink(b"\0") {
                return;
            }
        }
    }
}

/// A serialized variant key; two requests with equal keys under a rule may
/// share a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variant(Vec<u8>);

impl Variant {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
