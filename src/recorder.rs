//! An in-memory [`ResponseWriter`] for tests.

use crate::sink::ResponseWriter;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};
use std::io;

/// Records everything a handler does to a response.
///
/// Like a real transport, the recorder freezes the header map the moment the
/// header is sent: later mutations through [`ResponseWriter::headers_mut`] are
/// kept apart and do not show up in [`ResponseRecorder::sent_headers`].
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    headers: HeaderMap,
    sent: Option<(StatusCode, HeaderMap)>,
    header_calls: usize,
    body: BytesMut,
    flushes: usize,
    fail_writes: bool,
}

impl ResponseRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent body write fail with `BrokenPipe`.
    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// The status that was sent, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.sent.as_ref().map(|(status, _)| *status)
    }

    /// The headers as they were when the header was sent.
    pub fn sent_headers(&self) -> Option<&HeaderMap> {
        self.sent.as_ref().map(|(_, headers)| headers)
    }

    /// Number of `write_header` calls received, including ignored ones.
    pub fn header_calls(&self) -> usize {
        self.header_calls
    }

    /// The raw body bytes received.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of manual flushes received.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Converts the recording into a response with the sent status and headers.
    ///
    /// A recorder that never sent a header yields `200 OK` with the current
    /// header map.
    pub fn into_response(self) -> Response<Bytes> {
        let (status, headers) = self
            .sent
            .unwrap_or_else(|| (StatusCode::OK, self.headers));
        let mut response = Response::new(self.body.freeze());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

impl io::Write for ResponseRecorder {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.sent.is_none() {
            self.sent = Some((StatusCode::OK, self.headers.clone()));
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

impl ResponseWriter for ResponseRecorder {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.header_calls += 1;
        if self.sent.is_none() {
            self.sent = Some((status, self.headers.clone()));
        }
    }
}
