use crate::sink::RequestHead;
use http::{Method, header};
use std::collections::HashSet;
use std::fmt::Debug;

/// Decides from the request alone whether its response may be compressed.
///
/// Filters are shared by every in-flight request and must be side-effect free.
pub trait RequestFilter: Debug + Send + Sync {
    /// Returns `false` to skip compression for this request.
    fn should_compress(&self, req: &RequestHead<'_>) -> bool;
}

/// Rejects body-less methods, protocol upgrades and clients without gzip.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommonRequestFilter;

impl CommonRequestFilter {
    /// Creates the filter.
    pub fn new() -> Self {
        Self
    }
}

impl RequestFilter for CommonRequestFilter {
    fn should_compress(&self, req: &RequestHead<'_>) -> bool {
        *req.method != Method::HEAD
            && *req.method != Method::OPTIONS
            && !req.headers.contains_key(header::UPGRADE)
            && accepts_gzip(req)
    }
}

/// Checks every `Accept-Encoding` value for a gzip entry with non-zero quality.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, br;q=1.0, zstd;q=0.8").
fn accepts_gzip(req: &RequestHead<'_>) -> bool {
    req.headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|part| parse_encoding_with_quality(part.trim()))
        .any(|(encoding, quality)| {
            quality > 0.0
                && (encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip"))
        })
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            q.strip_prefix("q=")
                .or_else(|| q.strip_prefix("Q="))
                .and_then(|v| v.trim().parse::<f32>().ok())
        })
        .unwrap_or(1.0);

    (encoding, quality)
}

/// Text-like extensions compressed by default. The empty entry admits paths
/// without an extension.
const DEFAULT_EXTENSIONS: &[&str] = &[
    "", ".txt", ".htm", ".html", ".css", ".php", ".js", ".json", ".md", ".mdown", ".xml", ".svg",
    ".go", ".cgi", ".py", ".pl", ".aspx", ".asp", ".m3u", ".m3u8", ".wasm",
];

/// Gates compression on the extension of the request path.
///
/// Omit this filter to compress regardless of extension.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: HashSet<String>,
    allow_empty: bool,
}

impl ExtensionFilter {
    /// Builds a filter from extensions such as `".html"`. An empty string
    /// allows paths that have no extension.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allow_empty = false;
        let mut set = HashSet::new();
        for ext in extensions {
            let ext = ext.as_ref().trim_start_matches('.');
            if ext.is_empty() {
                allow_empty = true;
            } else {
                set.insert(ext.to_ascii_lowercase());
            }
        }
        Self {
            extensions: set,
            allow_empty,
        }
    }
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

impl RequestFilter for ExtensionFilter {
    fn should_compress(&self, req: &RequestHead<'_>) -> bool {
        match extension(req.uri.path()) {
            None => self.allow_empty,
            Some(ext) => self.extensions.contains(&ext.to_ascii_lowercase()),
        }
    }
}

/// The text after the last dot of the final path segment, if that segment has a dot.
fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(_, ext)| ext)
}
