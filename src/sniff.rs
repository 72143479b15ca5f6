use std::borrow::Cow;
use std::fmt::Debug;

/// Most bytes any sniffer is shown.
pub const SNIFF_LEN: usize = 512;

/// Infers a content type from the leading bytes of a body.
///
/// Used when a response reaches the compression threshold without a declared
/// `Content-Type`; the result is set before the header is sent.
pub trait ContentSniffer: Debug + Send + Sync {
    /// Returns a media type for a prefix of at most [`SNIFF_LEN`] bytes.
    fn sniff(&self, prefix: &[u8]) -> Cow<'static, str>;
}

/// Signature based detection in the spirit of the WHATWG MIME sniffing rules.
///
/// Falls back to `text/plain; charset=utf-8` when no binary control bytes are
/// present and `application/octet-stream` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureSniffer;

impl SignatureSniffer {
    /// Creates the sniffer.
    pub fn new() -> Self {
        Self
    }
}

const TEXT_HTML: &str = "text/html; charset=utf-8";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Tags that mark an HTML document when followed by a space or `>`.
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// `(pattern, mask, content type)`; a zero mask byte is a wildcard.
const MASKED: &[(&[u8], &[u8], &str)] = &[
    (
        b"RIFF\x00\x00\x00\x00WEBPVP",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        "image/webp",
    ),
    (
        b"RIFF\x00\x00\x00\x00WAVE",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        "audio/wave",
    ),
    (
        b"\x00\x00\x00\x00ftyp",
        b"\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        "video/mp4",
    ),
];

const EXACT: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", TEXT_PLAIN),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"\x00\x00\x02\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    (b"\x00asm", "application/wasm"),
];

impl ContentSniffer for SignatureSniffer {
    fn sniff(&self, prefix: &[u8]) -> Cow<'static, str> {
        let data = &prefix[..prefix.len().min(SNIFF_LEN)];
        Cow::Borrowed(detect(data))
    }
}

fn detect(data: &[u8]) -> &'static str {
    let text = skip_whitespace(data);
    if HTML_TAGS.iter().any(|tag| is_html_tag(text, tag)) {
        return TEXT_HTML;
    }
    if text.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if let Some((_, content_type)) = EXACT.iter().find(|(sig, _)| data.starts_with(sig)) {
        return *content_type;
    }
    if let Some((_, _, content_type)) = MASKED
        .iter()
        .find(|(pattern, mask, _)| masked_match(data, pattern, mask))
    {
        return *content_type;
    }

    if data.iter().copied().any(is_binary) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN
    }
}

fn skip_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_html_tag(data: &[u8], tag: &[u8]) -> bool {
    data.len() > tag.len()
        && data[..tag.len()].eq_ignore_ascii_case(tag)
        && matches!(data[tag.len()], b' ' | b'>')
}

fn masked_match(data: &[u8], pattern: &[u8], mask: &[u8]) -> bool {
    data.len() >= pattern.len()
        && data
            .iter()
            .zip(pattern.iter().zip(mask))
            .all(|(d, (p, m))| d & m == p & m)
}

fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
