//! Request-target normalization: splitting a request-line target into
//! path segments, query pairs, and a fragment, with percent-decoding done
//! lazily and cached on first access.
//!
//! The route registry and path-parameter matcher that actually consume
//! `segments()` live outside this crate (see the crate-level docs); this
//! module only produces the normalized, decodable view §3 describes.
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;

/// The normalized form of a request-line target: path segments (with
/// empty segments, `.`, and `..` already folded), query pairs in
/// declaration order, and an optional fragment.
///
/// Each escaped piece is decoded at most once; the decoded form is cached
/// the first time it's asked for.
pub struct RequestTarget {
    raw: String,
    segments: Vec<Escaped>,
    query: Vec<(Escaped, Escaped)>,
    fragment: Option<Escaped>,
}

struct Escaped {
    raw: String,
    decoded: OnceLock<String>,
}

impl Escaped {
    fn new(raw: impl Into<String>) -> Self {
        Escaped {
            raw: raw.into(),
            decoded: OnceLock::new(),
        }
    }

    fn decode(&self) -> &str {
        self.decoded
            .get_or_init(|| percent_decode_str(&self.raw).decode_utf8_lossy().into_owned())
    }
}

impl RequestTarget {
    /// Parses the raw request-target string taken straight off the
    /// request line (e.g. `/a/b%20c?x=1&x=2#frag`).
    pub fn parse(raw: &str) -> RequestTarget {
        let (path_and_query, fragment) = match raw.split_once('#') {
            Some((pq, frag)) => (pq, Some(Escaped::new(frag))),
            None => (raw, None),
        };
        let (path, query_str) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };

        RequestTarget {
            raw: raw.to_string(),
            segments: normalize_segments(path),
            query: parse_query(query_str.unwrap_or("")),
            fragment,
        }
    }

    /// The untouched request-target, exactly as it appeared on the wire.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Path segments in order, after dropping empty segments and `.`, and
    /// folding `..` against the segments seen so far (never climbing past
    /// the root). Each segment is still escaped; use [`decoded_segments`]
    /// for the percent-decoded form.
    ///
    /// [`decoded_segments`]: RequestTarget::decoded_segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.raw.as_str())
    }

    /// Path segments, percent-decoded. Each segment's decoded form is
    /// computed once and cached.
    pub fn decoded_segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.decode())
    }

    /// Query pairs in declaration order, escaped form. Repeated keys
    /// appear as repeated pairs, matching `map<string, list<string>>`
    /// semantics over an ordered sequence.
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query.iter().map(|(k, v)| (k.raw.as_str(), v.raw.as_str()))
    }

    /// Query pairs, percent-decoded, cached on first access per pair.
    pub fn decoded_query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query.iter().map(|(k, v)| (k.decode(), v.decode()))
    }

    /// All values declared for `key`, percent-decoded, in declaration
    /// order.
    pub fn query_values(&self, key: &str) -> impl Iterator<Item = &str> {
        self.query
            .iter()
            .filter(move |(k, _)| k.decode() == key)
            .map(|(_, v)| v.decode())
    }

    /// The escaped fragment, if the target carried one.
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_ref().map(|f| f.raw.as_str())
    }

    /// The percent-decoded fragment, if the target carried one.
    pub fn decoded_fragment(&self) -> Option<&str> {
        self.fragment.as_ref().map(|f| f.decode())
    }
}

impl std::fmt::Debug for RequestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTarget").field("raw", &self.raw).finish()
    }
}

/// Splits `path` on `/`, dropping empty segments and `.`, and folding
/// `..` against whatever real segment precedes it (never climbing above
/// the root — a leading run of `..` is simply dropped).
fn normalize_segments(path: &str) -> Vec<Escaped> {
    let mut out: Vec<Escaped> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            seg => out.push(Escaped::new(seg)),
        }
    }
    out
}

fn parse_query(query: &str) -> Vec<(Escaped, Escaped)> {
    if query.is_empty() {
        return Vec::new();
    }
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (Escaped::new(k), Escaped::new(v)),
            None => (Escaped::new(pair), Escaped::new("")),
        })
        .collect()
}

fn _assert_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<RequestTarget>();
    assert_sync::<RequestTarget>();
}
