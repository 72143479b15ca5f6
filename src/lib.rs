//! Streaming conditional gzip compression for HTTP response writers.
//!
//! This crate sits between a handler and the response sink. It gzips the
//! body when doing so is worthwhile and safe, and passes bytes through
//! untouched otherwise, deciding in a single pass while the handler writes.
//!
//! # Example
//!
//! ```
//! use http::Request;
//! use http_response_gzip::{GzipHandler, ResponseRecorder, ResponseWriter};
//! use std::io::Write;
//!
//! let gzip = GzipHandler::default();
//! let req = Request::get("/").header("accept-encoding", "gzip").body(()).unwrap();
//! let mut res = ResponseRecorder::new();
//!
//! gzip.wrap(&req, &mut res, |res| {
//!     res.headers_mut().insert("content-type", "text/plain".parse().unwrap());
//!     res.write_all(&[b'a'; 4096])
//! })
//! .unwrap()
//! .unwrap();
//!
//! let response = res.into_response();
//! assert_eq!(response.headers()["content-encoding"], "gzip");
//! ```
//!
//! # Compression Rules
//!
//! The request is not considered when:
//! - The method is `HEAD` or `OPTIONS`
//! - An `Upgrade` header is present
//! - `Accept-Encoding` does not list `gzip` with a non-zero quality
//! - The path extension is not in the allow-list (default filters)
//!
//! The response is not compressed when:
//! - The status is `204 No Content` or `304 Not Modified`
//! - `Content-Encoding` or `Transfer-Encoding` is already set
//! - `Content-Type` is not in the allow-list (default filters)
//! - The body is no longer than the minimum content length, either as
//!   declared by `Content-Length` or as observed when the response ends
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to `gzip`
//! - `Content-Length` and `Accept-Ranges` headers are removed
//! - `Vary` header includes `Accept-Encoding`
//! - A strong `ETag` is made weak
//! - A missing `Content-Type` is sniffed from the first body bytes

#![deny(missing_docs)]

mod codec;
mod error;
mod handler;
mod layer;
mod pool;
mod recorder;
mod request_filter;
mod response_filter;
mod sink;
mod sniff;
mod writer;

pub use codec::{CodecPool, CompressionLevel, GzipEncoder};
pub use error::ConfigError;
pub use handler::{Config, DEFAULT_MIN_CONTENT_LENGTH, GzipHandler, Handler};
pub use layer::{Compression, CompressionLayer};
pub use recorder::ResponseRecorder;
pub use request_filter::{CommonRequestFilter, ExtensionFilter, RequestFilter};
pub use response_filter::{
    ContentLengthFilter, ContentTypeFilter, ResponseFilter, SkipCompressedFilter,
};
pub use sink::{RequestHead, ResponseWriter};
pub use sniff::{ContentSniffer, SNIFF_LEN, SignatureSniffer};
pub use writer::CompressWriter;
