use http::{HeaderMap, Method, Request, StatusCode, Uri, request};
use std::io;

/// The response side of an HTTP exchange, as seen by a handler.
///
/// Body bytes go through [`io::Write`]; `flush` asks the transport to push
/// whatever it holds. Sinks without a manual flush simply return `Ok(())`.
pub trait ResponseWriter: io::Write {
    /// The response headers.
    fn headers(&self) -> &HeaderMap;

    /// Mutable response headers. Changes after the header was sent are ignored
    /// by the transport.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sends the status line and headers. Only the first call has an effect.
    fn write_header(&mut self, status: StatusCode);
}

impl<W: ResponseWriter + ?Sized> ResponseWriter for &mut W {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        (**self).write_header(status)
    }
}

impl<W: ResponseWriter + ?Sized> ResponseWriter for Box<W> {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        (**self).write_header(status)
    }
}

/// A borrowed view of the request fields compression decisions look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    /// Request method.
    pub method: &'a Method,
    /// Request target.
    pub uri: &'a Uri,
    /// Request headers.
    pub headers: &'a HeaderMap,
}

impl<'a> RequestHead<'a> {
    /// Builds a view from its parts.
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }
}

impl<'a, B> From<&'a Request<B>> for RequestHead<'a> {
    fn from(req: &'a Request<B>) -> Self {
        Self::new(req.method(), req.uri(), req.headers())
    }
}

impl<'a> From<&'a request::Parts> for RequestHead<'a> {
    fn from(parts: &'a request::Parts) -> Self {
        Self::new(&parts.method, &parts.uri, &parts.headers)
    }
}
