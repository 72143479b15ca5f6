use crate::codec::{CodecPool, CompressionLevel};
use crate::error::ConfigError;
use crate::layer::Compression;
use crate::request_filter::{CommonRequestFilter, ExtensionFilter, RequestFilter};
use crate::response_filter::{ContentTypeFilter, ResponseFilter, SkipCompressedFilter};
use crate::sink::{RequestHead, ResponseWriter};
use crate::sniff::{ContentSniffer, SignatureSniffer};
use crate::writer::{CompressWriter, WriterContext};
use http::Request;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Default minimum body size for compression, in bytes.
pub const DEFAULT_MIN_CONTENT_LENGTH: usize = 1024;

/// A synchronous HTTP handler writing its response into a [`ResponseWriter`].
pub trait Handler<B> {
    /// Handles one request.
    fn call(&self, req: &Request<B>, res: &mut dyn ResponseWriter);
}

impl<B, F> Handler<B> for F
where
    F: Fn(&Request<B>, &mut dyn ResponseWriter),
{
    fn call(&self, req: &Request<B>, res: &mut dyn ResponseWriter) {
        self(req, res)
    }
}

/// Settings for a [`GzipHandler`].
///
/// Filters run in order and the first rejection wins.
#[derive(Debug)]
pub struct Config {
    /// Compression effort of every encoder.
    pub level: CompressionLevel,
    /// Bodies of at most this many bytes are sent uncompressed.
    ///
    /// Without a declared `Content-Length`, up to this many bytes are held in
    /// memory per response until the verdict is known.
    pub min_content_length: usize,
    /// Checked before the handler runs.
    pub request_filters: Vec<Box<dyn RequestFilter>>,
    /// Checked against the response headers on the first body write.
    pub response_filters: Vec<Box<dyn ResponseFilter>>,
    /// Supplies a content type for compressed bodies that lack one.
    pub sniffer: Box<dyn ContentSniffer>,
}

impl Config {
    /// Sets the compression level.
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the minimum body size required for compression.
    pub fn with_min_content_length(mut self, length: usize) -> Self {
        self.min_content_length = length;
        self
    }

    /// Replaces the request filters.
    pub fn with_request_filters(mut self, filters: Vec<Box<dyn RequestFilter>>) -> Self {
        self.request_filters = filters;
        self
    }

    /// Replaces the response filters.
    pub fn with_response_filters(mut self, filters: Vec<Box<dyn ResponseFilter>>) -> Self {
        self.response_filters = filters;
        self
    }

    /// Replaces the content sniffer.
    pub fn with_sniffer(mut self, sniffer: impl ContentSniffer + 'static) -> Self {
        self.sniffer = Box::new(sniffer);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Default,
            min_content_length: DEFAULT_MIN_CONTENT_LENGTH,
            request_filters: vec![
                Box::new(CommonRequestFilter::new()),
                Box::new(ExtensionFilter::default()),
            ],
            response_filters: vec![
                Box::new(SkipCompressedFilter::new()),
                Box::new(ContentTypeFilter::default()),
            ],
            sniffer: Box::new(SignatureSniffer::new()),
        }
    }
}

struct Inner {
    request_filters: Vec<Box<dyn RequestFilter>>,
    writer: WriterContext,
}

/// Gzip compression for synchronous response writers.
///
/// Holds the immutable configuration plus the encoder and writer pools.
/// Cloning is cheap and clones share the pools.
#[derive(Clone)]
pub struct GzipHandler {
    inner: Arc<Inner>,
}

impl GzipHandler {
    /// Validates `config` and builds a handler.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let level = config.level.validate()?;
        if config.min_content_length == 0 {
            return Err(ConfigError::InvalidMinContentLength(
                config.min_content_length,
            ));
        }
        Ok(Self::from_validated(Config { level, ..config }))
    }

    fn from_validated(config: Config) -> Self {
        let writer = WriterContext::new(
            config.min_content_length,
            config.response_filters,
            config.sniffer,
            CodecPool::new(config.level),
        );
        Self {
            inner: Arc::new(Inner {
                request_filters: config.request_filters,
                writer,
            }),
        }
    }

    /// Whether a response to this request may be compressed at all.
    ///
    /// Runs the request filters only; cheap and allocation free, for adaptors
    /// that want to skip wrapping entirely.
    pub fn should_compress<'r>(&self, req: impl Into<RequestHead<'r>>) -> bool {
        let req = req.into();
        match self
            .inner
            .request_filters
            .iter()
            .find(|f| !f.should_compress(&req))
        {
            Some(filter) => {
                debug!(?filter, path = req.uri.path(), "request filter rejected compression");
                false
            }
            None => true,
        }
    }

    /// Takes a pooled writer bound to `res`. It is recycled when dropped.
    pub fn writer<'a>(&'a self, res: &'a mut dyn ResponseWriter) -> CompressWriter<'a> {
        CompressWriter::new(&self.inner.writer, res)
    }

    /// Runs `next` against a compressing writer when the request qualifies,
    /// and against `res` directly otherwise.
    ///
    /// The writer is finished after `next` returns; errors from that final
    /// write are returned. If `next` panics the writer is still recycled.
    pub fn wrap<'r, R>(
        &self,
        req: impl Into<RequestHead<'r>>,
        res: &mut dyn ResponseWriter,
        next: impl FnOnce(&mut dyn ResponseWriter) -> R,
    ) -> io::Result<R> {
        if !self.should_compress(req) {
            return Ok(next(res));
        }
        let mut writer = self.writer(res);
        let output = next(&mut writer);
        writer.finish()?;
        Ok(output)
    }

    /// Decorates `handler` with this handler's compression.
    pub fn wrap_handler<H>(&self, handler: H) -> Compression<H> {
        Compression::new(handler, self.clone())
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &WriterContext {
        &self.inner.writer
    }
}

impl Default for GzipHandler {
    fn default() -> Self {
        Self::from_validated(Config::default())
    }
}

impl fmt::Debug for GzipHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipHandler")
            .field("request_filters", &self.inner.request_filters)
            .field("writer", &self.inner.writer)
            .finish()
    }
}
