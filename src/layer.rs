use crate::handler::{GzipHandler, Handler};
use crate::sink::ResponseWriter;
use http::Request;
use tower::Layer;
use tracing::warn;

/// A Tower layer that gzips the responses of synchronous handlers.
///
/// # Example
///
/// ```
/// use http_response_gzip::{CompressionLayer, ResponseWriter};
/// use std::io::Write;
/// use tower::Layer;
///
/// let hello = |_: &http::Request<()>, res: &mut dyn ResponseWriter| {
///     res.write_all(b"hello").unwrap();
/// };
/// let handler = CompressionLayer::new().layer(hello);
/// # let _ = handler;
/// ```
#[derive(Debug, Clone, Default)]
pub struct CompressionLayer {
    gzip: GzipHandler,
}

impl CompressionLayer {
    /// Creates a layer with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a layer sharing the pools and settings of `gzip`.
    pub fn with_handler(gzip: GzipHandler) -> Self {
        Self { gzip }
    }
}

impl<H> Layer<H> for CompressionLayer {
    type Service = Compression<H>;

    fn layer(&self, inner: H) -> Self::Service {
        Compression::new(inner, self.gzip.clone())
    }
}

/// A handler whose responses are compressed when eligible.
#[derive(Debug, Clone)]
pub struct Compression<H> {
    inner: H,
    gzip: GzipHandler,
}

impl<H> Compression<H> {
    /// Wraps `inner` with the given compression settings.
    pub fn new(inner: H, gzip: GzipHandler) -> Self {
        Self { inner, gzip }
    }

    /// Returns a reference to the inner handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Returns a mutable reference to the inner handler.
    pub fn inner_mut(&mut self) -> &mut H {
        &mut self.inner
    }

    /// Consumes this handler, returning the inner handler.
    pub fn into_inner(self) -> H {
        self.inner
    }
}

impl<B, H> Handler<B> for Compression<H>
where
    H: Handler<B>,
{
    fn call(&self, req: &Request<B>, res: &mut dyn ResponseWriter) {
        let result = self
            .gzip
            .wrap(req, res, |res: &mut dyn ResponseWriter| self.inner.call(req, res));
        // There is no one left to report to; the transport sees a truncated body.
        if let Err(err) = result {
            warn!(%err, path = req.uri().path(), "failed to finish compressed response");
        }
    }
}
