use crate::codec::{CodecPool, GzipEncoder};
use crate::pool::Pool;
use crate::response_filter::{ResponseFilter, declared_content_length};
use crate::sink::ResponseWriter;
use crate::sniff::{ContentSniffer, SNIFF_LEN};
use bytes::BytesMut;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use std::fmt;
use std::io::{self, Write};
use tracing::{debug, trace, warn};

/// Idle writer states retained between requests.
const MAX_IDLE_WRITERS: usize = 1024;

/// Everything a [`CompressWriter`] needs that outlives a single response.
#[derive(Debug)]
pub(crate) struct WriterContext {
    min_content_length: usize,
    filters: Vec<Box<dyn ResponseFilter>>,
    sniffer: Box<dyn ContentSniffer>,
    codecs: CodecPool,
    states: Pool<WriterState>,
}

impl WriterContext {
    pub(crate) fn new(
        min_content_length: usize,
        filters: Vec<Box<dyn ResponseFilter>>,
        sniffer: Box<dyn ContentSniffer>,
        codecs: CodecPool,
    ) -> Self {
        Self {
            min_content_length,
            filters,
            sniffer,
            codecs,
            states: Pool::new(MAX_IDLE_WRITERS, WriterState::default),
        }
    }

    #[cfg(test)]
    pub(crate) fn codecs(&self) -> &CodecPool {
        &self.codecs
    }

    #[cfg(test)]
    pub(crate) fn idle_writers(&self) -> usize {
        self.states.idle()
    }
}

/// Where the body of the current response is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No body byte has been accepted yet.
    Fresh,
    /// Filters passed; bytes are held until the threshold is crossed.
    Buffering,
    /// Bytes go to the sink untouched.
    Passthrough,
    /// Bytes go through the gzip encoder.
    Compressing,
}

/// The per-response state of a writer, recycled through a pool.
pub(crate) struct WriterState {
    mode: Mode,
    /// Cleared by a rejecting filter, a 204/304 status or a small body.
    /// Never set again within one response.
    should_compress: bool,
    header_flushed: bool,
    status: Option<StatusCode>,
    /// Holds at most `min_content_length` bytes.
    buffer: BytesMut,
    written: u64,
    encoder: Option<GzipEncoder>,
}

impl Default for WriterState {
    fn default() -> Self {
        Self {
            mode: Mode::Fresh,
            should_compress: true,
            header_flushed: false,
            status: None,
            buffer: BytesMut::new(),
            written: 0,
            encoder: None,
        }
    }
}

impl WriterState {
    /// Back to `Fresh`, returning any encoder and keeping the buffer capacity.
    fn reset(&mut self, codecs: &CodecPool) {
        if let Some(encoder) = self.encoder.take() {
            codecs.release(encoder);
        }
        self.mode = Mode::Fresh;
        self.should_compress = true;
        self.header_flushed = false;
        self.status = None;
        self.buffer.clear();
        self.written = 0;
    }
}

impl fmt::Debug for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterState")
            .field("mode", &self.mode)
            .field("should_compress", &self.should_compress)
            .field("header_flushed", &self.header_flushed)
            .field("status", &self.status)
            .field("buffered", &self.buffer.len())
            .field("written", &self.written)
            .finish()
    }
}

/// A response writer that gzips the body when it is worth it.
///
/// The compress-or-not verdict is reached once, lazily:
///
/// - a 204 or 304 status, or any response filter rejecting the headers on the
///   first body write, sends the body through untouched;
/// - a declared `Content-Length` above the threshold compresses right away;
/// - otherwise bytes are held until they exceed the threshold (compress) or
///   the response ends first (send as-is);
/// - a content type sniffed when compression engages is filtered again.
///
/// The real header is only sent once the verdict is known. Dropping the
/// writer finishes the response and recycles its state; [`finish`] does the
/// same but reports errors.
///
/// [`finish`]: CompressWriter::finish
pub struct CompressWriter<'a> {
    ctx: &'a WriterContext,
    inner: &'a mut dyn ResponseWriter,
    state: WriterState,
}

impl<'a> CompressWriter<'a> {
    pub(crate) fn new(ctx: &'a WriterContext, inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            ctx,
            inner,
            state: ctx.states.acquire(),
        }
    }

    /// Points the writer at a new response, discarding the current one.
    ///
    /// A held encoder goes back to the pool unfinished; nothing more is
    /// written to the previous sink.
    pub fn reset(&mut self, inner: &'a mut dyn ResponseWriter) {
        self.state.reset(&self.ctx.codecs);
        self.inner = inner;
    }

    /// The status that is or will be sent.
    pub fn status(&self) -> Option<StatusCode> {
        self.state.status
    }

    /// Uncompressed body bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.state.written
    }

    /// Whether the real header has been sent.
    pub fn header_sent(&self) -> bool {
        self.state.header_flushed
    }

    /// Whether the body is being gzipped.
    pub fn is_compressing(&self) -> bool {
        self.state.mode == Mode::Compressing
    }

    /// Ends the response: fixes the verdict, sends the header, drains any
    /// held bytes and closes the gzip stream.
    pub fn finish(mut self) -> io::Result<()> {
        self.complete()
    }

    fn complete(&mut self) -> io::Result<()> {
        self.finalize()?;
        if let Some(mut encoder) = self.state.encoder.take() {
            let result = encoder.finish(&mut *self.inner);
            self.ctx.codecs.release(encoder);
            result?;
        }
        Ok(())
    }

    /// Fixes the verdict if it is still open and sends the header.
    ///
    /// A body that never crossed the threshold is sent uncompressed.
    fn finalize(&mut self) -> io::Result<()> {
        if matches!(self.state.mode, Mode::Fresh | Mode::Buffering) {
            trace!(buffered = self.state.buffer.len(), "response below threshold");
            self.state.should_compress = false;
            self.state.mode = Mode::Passthrough;
            self.flush_header();
            if !self.state.buffer.is_empty() {
                let result = self.inner.write_all(&self.state.buffer);
                self.state.buffer.clear();
                result?;
            }
        }
        self.flush_header();
        Ok(())
    }

    /// Runs the response filters against the headers on the first body write.
    fn decide(&mut self, first: &[u8]) -> io::Result<()> {
        if self.state.should_compress {
            let headers = self.inner.headers();
            if let Some(filter) = self.ctx.filters.iter().find(|f| !f.should_compress(headers)) {
                debug!(?filter, "response filter rejected compression");
                self.state.should_compress = false;
            }
        }
        if !self.state.should_compress {
            self.state.mode = Mode::Passthrough;
            self.flush_header();
            return Ok(());
        }

        let threshold = self.ctx.min_content_length as u64;
        match declared_content_length(self.inner.headers()) {
            Some(length) if length > threshold => self.engage(first),
            Some(length) => {
                debug!(length, threshold, "declared content length below threshold");
                self.state.should_compress = false;
                self.state.mode = Mode::Passthrough;
                self.flush_header();
                Ok(())
            }
            None => {
                self.state.mode = Mode::Buffering;
                Ok(())
            }
        }
    }

    /// Switches to compression: settles the content type, sends the header
    /// and binds an encoder. `pending` is the write that triggered it and is
    /// only used for sniffing here.
    ///
    /// A sniffed content type goes through the response filters again; on
    /// rejection the held bytes are sent as-is and the mode is `Passthrough`.
    fn engage(&mut self, pending: &[u8]) -> io::Result<()> {
        if !self.inner.headers().contains_key(header::CONTENT_TYPE) {
            self.sniff_content_type(pending);
            let headers = self.inner.headers();
            if let Some(filter) = self.ctx.filters.iter().find(|f| !f.should_compress(headers)) {
                debug!(?filter, "response filter rejected sniffed content type");
                self.state.should_compress = false;
                self.state.mode = Mode::Passthrough;
                self.flush_header();
                if !self.state.buffer.is_empty() {
                    let result = self.inner.write_all(&self.state.buffer);
                    self.state.buffer.clear();
                    result?;
                }
                return Ok(());
            }
        }
        self.state.mode = Mode::Compressing;
        self.flush_header();

        let mut encoder = self.ctx.codecs.acquire();
        let result = if self.state.buffer.is_empty() {
            Ok(())
        } else {
            encoder.write(&self.state.buffer, &mut *self.inner)
        };
        self.state.buffer.clear();
        self.state.encoder = Some(encoder);
        result
    }

    fn sniff_content_type(&mut self, pending: &[u8]) {
        let buffered = &self.state.buffer[..];
        let content_type = if buffered.len() >= SNIFF_LEN || pending.is_empty() {
            self.ctx.sniffer.sniff(&buffered[..buffered.len().min(SNIFF_LEN)])
        } else {
            let mut prefix = Vec::with_capacity(SNIFF_LEN);
            prefix.extend_from_slice(buffered);
            let rest = (SNIFF_LEN - prefix.len()).min(pending.len());
            prefix.extend_from_slice(&pending[..rest]);
            self.ctx.sniffer.sniff(&prefix)
        };
        trace!(%content_type, "sniffed content type");
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            self.inner.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    /// Sends the real header exactly once.
    fn flush_header(&mut self) {
        if self.state.header_flushed {
            return;
        }
        if self.state.mode == Mode::Compressing {
            let headers = self.inner.headers_mut();
            headers.remove(header::CONTENT_LENGTH);
            // Ranges of the identity body do not apply to the gzip stream.
            headers.remove(header::ACCEPT_RANGES);
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            add_vary_accept_encoding(headers);
            weaken_etag(headers);
        }
        let status = self.state.status.unwrap_or(StatusCode::OK);
        self.inner.write_header(status);
        self.state.header_flushed = true;
    }

    fn pass(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.state.written += n as u64;
        Ok(n)
    }

    fn compress(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.state.encoder.as_mut() {
            Some(encoder) => {
                encoder.write(data, &mut *self.inner)?;
                self.state.written += data.len() as u64;
                Ok(data.len())
            }
            None => Err(io::Error::other("gzip stream already finished")),
        }
    }
}

impl io::Write for CompressWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.state.status.is_none() {
            self.state.status = Some(StatusCode::OK);
        }

        if self.state.mode == Mode::Fresh {
            // An empty write says nothing about the body.
            if data.is_empty() {
                return Ok(0);
            }
            self.decide(data)?;
        }

        match self.state.mode {
            Mode::Passthrough => self.pass(data),
            Mode::Compressing => self.compress(data),
            Mode::Buffering => {
                if self.state.buffer.len() + data.len() <= self.ctx.min_content_length {
                    self.state.buffer.extend_from_slice(data);
                    self.state.written += data.len() as u64;
                    trace!(buffered = self.state.buffer.len(), "buffering response body");
                    return Ok(data.len());
                }
                debug!(
                    threshold = self.ctx.min_content_length,
                    "response body crossed threshold"
                );
                self.engage(data)?;
                if self.state.mode == Mode::Compressing {
                    self.compress(data)
                } else {
                    self.pass(data)
                }
            }
            Mode::Fresh => unreachable!("decide always leaves the fresh state"),
        }
    }

    /// Fixes the verdict, pushes pending compressed bytes and flushes the sink.
    ///
    /// Unlike [`CompressWriter::finish`] the gzip stream stays open, so more
    /// body may follow.
    fn flush(&mut self) -> io::Result<()> {
        self.finalize()?;
        if let Some(encoder) = self.state.encoder.as_mut() {
            encoder.flush(&mut *self.inner)?;
        }
        self.inner.flush()
    }
}

impl ResponseWriter for CompressWriter<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    /// Records the status to send. The last call before the first body byte
    /// wins; later calls are ignored.
    fn write_header(&mut self, status: StatusCode) {
        if self.state.header_flushed || self.state.mode != Mode::Fresh {
            trace!(%status, "ignoring status after body started");
            return;
        }
        self.state.status = Some(status);
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            self.state.should_compress = false;
        }
    }
}

impl Drop for CompressWriter<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("response writer dropped during panic, skipping finalization");
        } else if let Err(err) = self.complete() {
            warn!(%err, "failed to finish response");
        }
        let mut state = std::mem::take(&mut self.state);
        state.reset(&self.ctx.codecs);
        self.ctx.states.release(state);
    }
}

impl fmt::Debug for CompressWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressWriter")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
}

/// A strong validator does not survive the transformation; mark it weak.
fn weaken_etag(headers: &mut HeaderMap) {
    let Some(etag) = headers.get(header::ETAG) else {
        return;
    };
    if etag.as_bytes().starts_with(b"W/") {
        return;
    }
    let weak = [b"W/", etag.as_bytes()].concat();
    match HeaderValue::from_bytes(&weak) {
        Ok(value) => {
            headers.insert(header::ETAG, value);
        }
        Err(_) => {
            headers.remove(header::ETAG);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionLevel;
    use crate::recorder::ResponseRecorder;
    use crate::response_filter::ContentTypeFilter;
    use crate::sniff::SignatureSniffer;
    use flate2::read::GzDecoder;
    use std::io::Read;

    const MIN_CONTENT_LENGTH: usize = 100;

    const SMALL_PAYLOAD: &[u8] = b"Chancellor on brink of second bailout for banks";

    fn big_payload() -> Vec<u8> {
        b"Four score and seven years ago our fathers brought forth on this continent, \
          a new nation, conceived in Liberty. "
            .repeat(20)
    }

    #[derive(Debug)]
    struct Verdict(bool);

    impl ResponseFilter for Verdict {
        fn should_compress(&self, _headers: &HeaderMap) -> bool {
            self.0
        }
    }

    fn context(filters: Vec<Box<dyn ResponseFilter>>) -> WriterContext {
        WriterContext::new(
            MIN_CONTENT_LENGTH,
            filters,
            Box::new(SignatureSniffer::new()),
            CodecPool::new(CompressionLevel::Default),
        )
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn is_gzip(recorder: &ResponseRecorder) -> bool {
        recorder
            .sent_headers()
            .and_then(|h| h.get(header::CONTENT_ENCODING))
            .is_some_and(|v| v == "gzip")
    }

    #[test]
    fn test_flush_reaches_sink() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.flush().unwrap();
        }
        assert_eq!(recorder.flushes(), 1);
        assert_eq!(recorder.status(), Some(StatusCode::OK));
    }

    #[test]
    fn test_new_writer_is_fresh() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let writer = CompressWriter::new(&ctx, &mut recorder);
        assert!(writer.state.should_compress);
        assert_eq!(writer.state.mode, Mode::Fresh);
        assert!(!writer.header_sent());
        assert_eq!(writer.status(), None);
    }

    #[test]
    fn test_headers_pass_through() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert("x-hi", HeaderValue::from_static("I am here!"));
        let writer = CompressWriter::new(&ctx, &mut recorder);
        assert_eq!(writer.headers().get("x-hi").unwrap(), "I am here!");
    }

    #[test]
    fn test_write_header_twice_last_wins() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_header(StatusCode::BAD_REQUEST);
            writer.write_header(StatusCode::NOT_IMPLEMENTED);
            assert!(!writer.header_sent());
            writer.finish().unwrap();
        }
        assert_eq!(recorder.status(), Some(StatusCode::NOT_IMPLEMENTED));
        assert_eq!(recorder.header_calls(), 1);
    }

    #[test]
    fn test_status_frozen_after_first_write() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(SMALL_PAYLOAD).unwrap();
            writer.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            writer.finish().unwrap();
        }
        assert_eq!(recorder.status(), Some(StatusCode::OK));
    }

    #[test]
    fn test_no_content_and_not_modified_never_compress() {
        for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
            let ctx = context(vec![]);
            let mut recorder = ResponseRecorder::new();
            {
                let mut writer = CompressWriter::new(&ctx, &mut recorder);
                writer.write_header(status);
                assert!(!writer.state.should_compress);
                // A later status does not bring compression back.
                writer.write_header(StatusCode::OK);
                writer.write_all(&big_payload()).unwrap();
                assert!(!writer.is_compressing());
                writer.finish().unwrap();
            }
            assert!(!is_gzip(&recorder));
            assert!(recorder.sent_headers().unwrap().get(header::VARY).is_none());
            assert_eq!(recorder.body(), big_payload().as_slice());
        }
    }

    #[test]
    fn test_write_after_write_header_keeps_status() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_header(StatusCode::CONFLICT);
            writer.write_all(&big_payload()).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(recorder.status(), Some(StatusCode::CONFLICT));
        assert!(is_gzip(&recorder));
        assert_eq!(gunzip(recorder.body()), big_payload());
    }

    #[test]
    fn test_write_big_compresses() {
        let ctx = context(vec![Box::new(Verdict(true)), Box::new(Verdict(true))]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&big_payload()).unwrap();
            assert!(writer.is_compressing());
            assert_eq!(writer.written(), big_payload().len() as u64);
            writer.finish().unwrap();
        }

        let headers = recorder.sent_headers().unwrap();
        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/plain");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(gunzip(recorder.body()), big_payload());
    }

    #[test]
    fn test_any_rejecting_filter_disables_compression() {
        for verdicts in [
            [true, false, true],
            [false, true, false],
            [false, false, false],
        ] {
            let filters = verdicts
                .iter()
                .map(|v| Box::new(Verdict(*v)) as Box<dyn ResponseFilter>)
                .collect();
            let ctx = context(filters);
            let mut recorder = ResponseRecorder::new();
            {
                let mut writer = CompressWriter::new(&ctx, &mut recorder);
                writer.write_all(&big_payload()).unwrap();
                assert!(!writer.state.should_compress);
                // Rejection sends the header immediately.
                assert!(writer.header_sent());
                writer.finish().unwrap();
            }
            assert!(!is_gzip(&recorder));
            assert_eq!(recorder.body(), big_payload().as_slice());
        }
    }

    #[test]
    fn test_write_small_passes_through() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(SMALL_PAYLOAD).unwrap();
            assert!(!writer.header_sent());
            writer.finish().unwrap();
        }
        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), SMALL_PAYLOAD);
    }

    #[test]
    fn test_many_writes_up_to_threshold_pass_through() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let body = vec![b'x'; MIN_CONTENT_LENGTH];
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            for chunk in body.chunks(7) {
                writer.write_all(chunk).unwrap();
            }
            assert!(!writer.header_sent());
            writer.finish().unwrap();
        }
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), body.as_slice());
    }

    #[test]
    fn test_two_writes_crossing_threshold_compress() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let first = vec![b'a'; 50];
        let second = vec![b'b'; 60];
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&first).unwrap();
            assert!(!writer.header_sent());
            writer.write_all(&second).unwrap();
            assert!(writer.header_sent());
            assert!(writer.is_compressing());
            writer.finish().unwrap();
        }
        assert!(is_gzip(&recorder));
        assert_eq!(gunzip(recorder.body()), [first, second].concat());
    }

    #[test]
    fn test_single_small_write_then_finish() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let body = vec![b'z'; 40];
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&body).unwrap();
            writer.finish().unwrap();
        }
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), body.as_slice());
    }

    #[test]
    fn test_small_write_with_big_content_length() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(500));
        recorder
            .headers_mut()
            .insert(header::ETAG, HeaderValue::from_static("12345"));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&[b'q'; 10]).unwrap();
            // No buffering: the verdict was reached on the first write.
            assert!(writer.header_sent());
            assert!(writer.is_compressing());
            writer.finish().unwrap();
        }

        let headers = recorder.sent_headers().unwrap();
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
        assert_eq!(headers.get(header::ETAG).unwrap(), "W/12345");
        assert_eq!(gunzip(recorder.body()), vec![b'q'; 10]);
    }

    #[test]
    fn test_small_declared_content_length_passes_through() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(SMALL_PAYLOAD.len()));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(SMALL_PAYLOAD).unwrap();
            assert!(writer.header_sent());
            writer.finish().unwrap();
        }
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), SMALL_PAYLOAD);
    }

    #[test]
    fn test_existing_content_encoding_never_compressed() {
        let ctx = context(vec![Box::new(crate::response_filter::SkipCompressedFilter::new())]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&big_payload()).unwrap();
            writer.finish().unwrap();
        }
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "br");
        assert_eq!(recorder.body(), big_payload().as_slice());
    }

    #[test]
    fn test_etag_weakened_only_when_compressed() {
        let ctx = context(vec![]);

        let mut compressed = ResponseRecorder::new();
        compressed
            .headers_mut()
            .insert(header::ETAG, HeaderValue::from_static("abc123"));
        CompressWriter::new(&ctx, &mut compressed)
            .write_all(&big_payload())
            .unwrap();
        let headers = compressed.sent_headers().unwrap();
        assert_eq!(headers.get(header::ETAG).unwrap(), "W/abc123");

        let mut plain = ResponseRecorder::new();
        plain
            .headers_mut()
            .insert(header::ETAG, HeaderValue::from_static("abc123"));
        CompressWriter::new(&ctx, &mut plain)
            .write_all(SMALL_PAYLOAD)
            .unwrap();
        let headers = plain.sent_headers().unwrap();
        assert_eq!(headers.get(header::ETAG).unwrap(), "abc123");
    }

    #[test]
    fn test_weak_etag_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("W/\"v1\""));
        weaken_etag(&mut headers);
        assert_eq!(headers.get(header::ETAG).unwrap(), "W/\"v1\"");

        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        weaken_etag(&mut headers);
        assert_eq!(headers.get(header::ETAG).unwrap(), "W/\"v1\"");
    }

    #[test]
    fn test_vary_preserved_and_not_duplicated() {
        let mut headers = HeaderMap::new();
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        add_vary_accept_encoding(&mut headers);
        let vary: Vec<_> = headers
            .get_all(header::VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary, vec!["Origin", "Accept-Encoding"]);

        let mut headers = HeaderMap::new();
        headers.insert(header::VARY, HeaderValue::from_static("origin, accept-encoding"));
        add_vary_accept_encoding(&mut headers);
        assert_eq!(headers.get_all(header::VARY).iter().count(), 1);

        let mut headers = HeaderMap::new();
        headers.insert(header::VARY, HeaderValue::from_static("*"));
        add_vary_accept_encoding(&mut headers);
        assert_eq!(headers.get(header::VARY).unwrap(), "*");
    }

    #[test]
    fn test_accept_ranges_removed_when_compressing() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        CompressWriter::new(&ctx, &mut recorder)
            .write_all(&big_payload())
            .unwrap();
        assert!(recorder.sent_headers().unwrap().get(header::ACCEPT_RANGES).is_none());
    }

    #[test]
    fn test_content_type_sniffed_before_header_sent() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let mut body = b"<html><body>".to_vec();
        body.extend(std::iter::repeat_n(b'x', 200));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&body[..10]).unwrap();
            writer.write_all(&body[10..]).unwrap();
            writer.finish().unwrap();
        }
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(gunzip(recorder.body()), body);
    }

    fn png_body() -> Vec<u8> {
        let mut body = b"\x89PNG\x0D\x0A\x1A\x0A".to_vec();
        body.extend(std::iter::repeat_n(0u8, 4 * MIN_CONTENT_LENGTH));
        body
    }

    #[test]
    fn test_sniffed_binary_type_passes_through() {
        let ctx = context(vec![Box::new(ContentTypeFilter::default())]);
        let mut recorder = ResponseRecorder::new();
        let body = png_body();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&body[..20]).unwrap();
            writer.write_all(&body[20..]).unwrap();
            assert!(writer.header_sent());
            assert!(!writer.is_compressing());
            assert_eq!(writer.written(), body.len() as u64);
            writer.finish().unwrap();
        }
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
        assert!(headers.get(header::VARY).is_none());
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), body.as_slice());
        assert_eq!(ctx.codecs().idle(), 0);
    }

    #[test]
    fn test_sniffed_binary_type_with_declared_length_passes_through() {
        let ctx = context(vec![Box::new(ContentTypeFilter::default())]);
        let mut recorder = ResponseRecorder::new();
        let body = png_body();
        recorder
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&body).unwrap();
            writer.finish().unwrap();
        }
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), &body.len().to_string());
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), body.as_slice());
    }

    #[test]
    fn test_sniffed_html_still_compresses() {
        let ctx = context(vec![Box::new(ContentTypeFilter::default())]);
        let mut recorder = ResponseRecorder::new();
        let body = b"<!DOCTYPE html><html><body>".repeat(10);
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&body).unwrap();
            writer.finish().unwrap();
        }
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert!(is_gzip(&recorder));
        assert_eq!(gunzip(recorder.body()), body);
    }

    #[test]
    fn test_declared_content_type_not_sniffed() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        CompressWriter::new(&ctx, &mut recorder)
            .write_all(&big_payload())
            .unwrap();
        let headers = recorder.sent_headers().unwrap();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_flush_twice_sends_header_once() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(SMALL_PAYLOAD).unwrap();
            writer.flush().unwrap();
            writer.flush().unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(recorder.header_calls(), 1);
        assert_eq!(recorder.flushes(), 2);
        assert_eq!(recorder.body(), SMALL_PAYLOAD);
    }

    #[test]
    fn test_flush_while_compressing_keeps_stream_open() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        let payload = big_payload();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&payload).unwrap();
            writer.flush().unwrap();
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(recorder.header_calls(), 1);
        assert_eq!(gunzip(recorder.body()), [payload.clone(), payload].concat());
    }

    #[test]
    fn test_flush_fixes_small_verdict() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(SMALL_PAYLOAD).unwrap();
            writer.flush().unwrap();
            // Once flushed uncompressed, the rest follows uncompressed.
            writer.write_all(&big_payload()).unwrap();
            assert!(!writer.is_compressing());
        }
        assert!(!is_gzip(&recorder));
        assert_eq!(recorder.body(), [SMALL_PAYLOAD, big_payload().as_slice()].concat());
    }

    #[test]
    fn test_empty_first_write_defers_decision() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            assert_eq!(writer.write(&[]).unwrap(), 0);
            assert_eq!(writer.state.mode, Mode::Fresh);
            assert!(!writer.header_sent());
            writer.write_all(&big_payload()).unwrap();
            writer.finish().unwrap();
        }
        assert!(is_gzip(&recorder));
    }

    #[test]
    fn test_finish_without_body_sends_status() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        CompressWriter::new(&ctx, &mut recorder).finish().unwrap();
        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert!(recorder.body().is_empty());
        assert!(!is_gzip(&recorder));
    }

    #[test]
    fn test_drop_recycles_state_and_encoder() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut recorder);
            writer.write_all(&big_payload()).unwrap();
        }
        assert_eq!(ctx.idle_writers(), 1);
        assert_eq!(ctx.codecs().idle(), 1);
        // Drop finished the gzip stream.
        assert_eq!(gunzip(recorder.body()), big_payload());

        let mut second = ResponseRecorder::new();
        let writer = CompressWriter::new(&ctx, &mut second);
        assert_eq!(writer.state.mode, Mode::Fresh);
        assert!(writer.state.buffer.is_empty());
        assert_eq!(writer.written(), 0);
        assert_eq!(ctx.idle_writers(), 0);
    }

    #[test]
    fn test_reset_releases_encoder() {
        let ctx = context(vec![]);
        let mut first = ResponseRecorder::new();
        let mut second = ResponseRecorder::new();
        {
            let mut writer = CompressWriter::new(&ctx, &mut first);
            writer.write_all(&big_payload()).unwrap();
            assert!(writer.state.encoder.is_some());

            writer.reset(&mut second);
            assert!(writer.state.encoder.is_none());
            assert_eq!(ctx.codecs().idle(), 1);
            assert!(!writer.header_sent());

            writer.write_all(SMALL_PAYLOAD).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(second.body(), SMALL_PAYLOAD);
        assert_eq!(second.header_calls(), 1);
    }

    #[test]
    fn test_sink_errors_propagate() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new().fail_writes();
        let mut writer = CompressWriter::new(&ctx, &mut recorder);
        writer.write_all(SMALL_PAYLOAD).unwrap();
        let err = writer.finish().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_sink_errors_while_compressing_propagate() {
        let ctx = context(vec![]);
        let mut recorder = ResponseRecorder::new().fail_writes();
        let mut writer = CompressWriter::new(&ctx, &mut recorder);
        let err = writer.write_all(&big_payload()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        drop(writer);
        // The encoder still made it back to the pool.
        assert_eq!(ctx.codecs().idle(), 1);
    }
}
