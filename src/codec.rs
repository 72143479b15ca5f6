use crate::error::ConfigError;
use crate::pool::Pool;
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use std::fmt;
use std::io::{self, Write};
use tracing::warn;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Idle encoders retained by a [`CodecPool`].
const MAX_IDLE_ENCODERS: usize = 256;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_METHOD_DEFLATE: u8 = 0x08;
const GZIP_OS_UNKNOWN: u8 = 0xff;

/// Compression effort used by every encoder of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Deflate with stored blocks only.
    None,
    /// Fastest compression (level 1).
    Fastest,
    /// The zlib default (level 6).
    #[default]
    Default,
    /// Best compression (level 9).
    Best,
    /// An explicit level in `0..=9`.
    Precise(u32),
    /// Every write is compressed as an independent segment.
    ///
    /// The dictionary history is cleared after each write, so later writes
    /// never back-reference earlier ones. The ratio is worse and depends on
    /// the size of individual writes.
    Stateless,
}

impl CompressionLevel {
    /// Checks the level against the range supported by the codec.
    pub(crate) fn validate(self) -> Result<Self, ConfigError> {
        match self {
            CompressionLevel::Precise(level) if level > 9 => {
                Err(ConfigError::InvalidCompressionLevel(level))
            }
            level => Ok(level),
        }
    }

    fn compression(self) -> Compression {
        match self {
            CompressionLevel::None => Compression::none(),
            CompressionLevel::Fastest | CompressionLevel::Stateless => Compression::fast(),
            CompressionLevel::Default => Compression::default(),
            CompressionLevel::Best => Compression::best(),
            CompressionLevel::Precise(level) => Compression::new(level),
        }
    }

    /// The gzip XFL byte advertising the effort used.
    fn extra_flags(self) -> u8 {
        match self.compression().level() {
            9 => 2,
            1 => 4,
            _ => 0,
        }
    }
}

/// Lifecycle of a pooled encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncoderState {
    /// Fresh from the pool; nothing has been emitted.
    Idle,
    /// The gzip header has been written to a response sink.
    Bound,
    /// The trailer has been written; only `reset` is meaningful.
    Retired,
}

/// A gzip stream encoder that does not own its output.
///
/// Every call takes the sink to write to, so the same encoder (and its deflate
/// state) can be pointed at a different response each time it leaves the pool.
pub struct GzipEncoder {
    compress: Compress,
    crc: Crc,
    output: Box<[u8]>,
    level: CompressionLevel,
    state: EncoderState,
}

impl GzipEncoder {
    /// Creates an idle encoder for the given level.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compress: Compress::new(level.compression(), false),
            crc: Crc::new(),
            output: vec![0u8; OUTPUT_BUFFER_SIZE].into_boxed_slice(),
            level,
            state: EncoderState::Idle,
        }
    }

    pub(crate) fn state(&self) -> EncoderState {
        self.state
    }

    /// Compresses `data` into `sink`, emitting the gzip header on first use.
    pub fn write<W: Write + ?Sized>(&mut self, data: &[u8], sink: &mut W) -> io::Result<()> {
        self.bind(sink)?;
        self.crc.update(data);
        let flush = if self.level == CompressionLevel::Stateless {
            FlushCompress::Full
        } else {
            FlushCompress::None
        };
        self.deflate(data, flush, sink)
    }

    /// Pushes every pending compressed byte to `sink` without ending the stream.
    pub fn flush<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.state != EncoderState::Bound {
            return Ok(());
        }
        self.deflate(&[], FlushCompress::Sync, sink)
    }

    /// Ends the gzip stream: drains the deflate state and writes the trailer.
    ///
    /// Finishing twice is a no-op.
    pub fn finish<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.state == EncoderState::Retired {
            return Ok(());
        }
        self.bind(sink)?;
        self.deflate(&[], FlushCompress::Finish, sink)?;

        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&self.crc.sum().to_le_bytes());
        trailer[4..].copy_from_slice(&self.crc.amount().to_le_bytes());
        sink.write_all(&trailer)?;

        self.state = EncoderState::Retired;
        Ok(())
    }

    /// Returns the encoder to its idle state, keeping its allocations.
    pub fn reset(&mut self) {
        self.compress.reset();
        self.crc.reset();
        self.state = EncoderState::Idle;
    }

    fn bind<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.state != EncoderState::Idle {
            return Ok(());
        }
        let header = [
            GZIP_MAGIC[0],
            GZIP_MAGIC[1],
            GZIP_METHOD_DEFLATE,
            0, // flags
            0,
            0,
            0,
            0, // mtime
            self.level.extra_flags(),
            GZIP_OS_UNKNOWN,
        ];
        sink.write_all(&header)?;
        self.state = EncoderState::Bound;
        Ok(())
    }

    fn deflate<W: Write + ?Sized>(
        &mut self,
        mut input: &[u8],
        flush: FlushCompress,
        sink: &mut W,
    ) -> io::Result<()> {
        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            let status = self
                .compress
                .compress(input, &mut self.output, flush)
                .map_err(io::Error::other)?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced > 0 {
                sink.write_all(&self.output[..produced])?;
            }

            let done = match flush {
                FlushCompress::Finish => status == Status::StreamEnd,
                FlushCompress::None => input.is_empty(),
                // A flush is complete once the output buffer was not filled.
                _ => input.is_empty() && produced < self.output.len(),
            };
            if done {
                return Ok(());
            }

            if consumed == 0 && produced == 0 {
                if status == Status::BufError && flush != FlushCompress::Finish {
                    return Ok(());
                }
                return Err(io::Error::other("deflate stream made no progress"));
            }
        }
    }
}

impl fmt::Debug for GzipEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipEncoder")
            .field("level", &self.level)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A pool of [`GzipEncoder`]s sharing one compression level.
///
/// Building an encoder allocates the deflate window and hash tables, so
/// encoders are recycled across responses instead.
#[derive(Debug)]
pub struct CodecPool {
    encoders: Pool<GzipEncoder>,
    level: CompressionLevel,
}

impl CodecPool {
    /// Creates an empty pool; encoders are built lazily.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            encoders: Pool::new(MAX_IDLE_ENCODERS, move || GzipEncoder::new(level)),
            level,
        }
    }

    /// The level every encoder of this pool compresses with.
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Takes an idle encoder. Never waits on I/O.
    pub fn acquire(&self) -> GzipEncoder {
        self.encoders.acquire()
    }

    /// Retires an encoder and makes it available again.
    ///
    /// A stream that was never finished is closed into a discard sink first,
    /// so no response receives stray end-of-stream bytes.
    pub fn release(&self, mut encoder: GzipEncoder) {
        if encoder.state() == EncoderState::Bound {
            if let Err(err) = encoder.finish(&mut io::sink()) {
                warn!(%err, "failed to close abandoned gzip stream");
            }
        }
        encoder.reset();
        self.encoders.release(encoder);
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.encoders.idle()
    }
}
