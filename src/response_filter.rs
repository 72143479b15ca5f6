use http::{HeaderMap, header};
use mime::Mime;
use std::collections::HashSet;
use std::fmt::Debug;

/// Decides from the response headers whether the body may be compressed.
///
/// Evaluated once per response, when the first body byte arrives.
pub trait ResponseFilter: Debug + Send + Sync {
    /// Returns `false` to send the body untouched.
    fn should_compress(&self, headers: &HeaderMap) -> bool;
}

/// Skips bodies an upstream layer already encoded or chunked.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipCompressedFilter;

impl SkipCompressedFilter {
    /// Creates the filter.
    pub fn new() -> Self {
        Self
    }
}

impl ResponseFilter for SkipCompressedFilter {
    fn should_compress(&self, headers: &HeaderMap) -> bool {
        !headers.contains_key(header::CONTENT_ENCODING)
            && !headers.contains_key(header::TRANSFER_ENCODING)
    }
}

/// Compressible media types, matched on the type/subtype essence.
const DEFAULT_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "text/richtext",
    "text/plain",
    "text/css",
    "text/x-script",
    "text/x-component",
    "text/x-java-source",
    "text/x-markdown",
    "application/javascript",
    "application/x-javascript",
    "text/javascript",
    "text/js",
    "image/x-icon",
    "application/x-perl",
    "application/x-httpd-cgi",
    "text/xml",
    "application/xml",
    "application/xml+rss",
    "application/json",
    "multipart/bag",
    "multipart/mixed",
    "application/xhtml+xml",
    "font/ttf",
    "font/otf",
    "font/x-woff",
    "image/svg+xml",
    "application/vnd.ms-fontobject",
    "application/ttf",
    "application/x-ttf",
    "application/otf",
    "application/x-otf",
    "application/truetype",
    "application/opentype",
    "application/x-opentype",
    "application/font-woff",
    "application/eot",
    "application/font",
    "application/font-sfnt",
    "application/wasm",
];

/// Compresses only media types in an allow-set.
///
/// A missing or empty `Content-Type` is its own case: `allow_empty` decides
/// it, and the writer later sniffs a type from the body. A declared type that
/// is not in the set, or cannot be parsed, is always rejected.
#[derive(Debug, Clone)]
pub struct ContentTypeFilter {
    types: HashSet<String>,
    allow_empty: bool,
}

impl ContentTypeFilter {
    /// Builds a filter from media types such as `"text/html"`. Parameters in
    /// the list are ignored. Empty content types are allowed.
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let types = types
            .into_iter()
            .map(|t| essence_of(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            types,
            allow_empty: true,
        }
    }

    /// Sets whether a response without a declared content type may be compressed.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }
}

impl Default for ContentTypeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_TYPES)
    }
}

impl ResponseFilter for ContentTypeFilter {
    fn should_compress(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(header::CONTENT_TYPE) else {
            return self.allow_empty;
        };
        let Ok(content_type) = value.to_str() else {
            return false;
        };
        if content_type.trim().is_empty() {
            return self.allow_empty;
        }
        match content_type.parse::<Mime>() {
            Ok(mime) => self
                .types
                .contains(&mime.essence_str().to_ascii_lowercase()),
            Err(_) => false,
        }
    }
}

fn essence_of(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Rejects responses whose declared `Content-Length` is zero or below a minimum.
///
/// Responses without a declared length pass.
#[derive(Debug, Clone, Copy)]
pub struct ContentLengthFilter(u64);

impl ContentLengthFilter {
    /// Creates a filter with the given minimum length in bytes.
    pub fn new(min: u64) -> Self {
        Self(min)
    }
}

impl ResponseFilter for ContentLengthFilter {
    fn should_compress(&self, headers: &HeaderMap) -> bool {
        match declared_content_length(headers) {
            None => true,
            Some(length) => length != 0 && length >= self.0,
        }
    }
}

/// Parses the `Content-Length` header, treating a malformed value as absent.
pub(crate) fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
