//! Compression codecs for blobs read from and shards written to storage.
//!
//! ## Built-in Codecs
//!
//! - **Gzip** (`.gz`, `.gzip`) - via `flate2` (feature: `compression-gzip`).
//!   Concatenated members are read as one stream.
//! - **Zip** (`.zip`) - single-entry archives (feature: `compression-zip`).
//!   Reading streams the first local entry (stored or deflate) and checks its
//!   CRC; writing emits one deflate entry followed by a data descriptor and
//!   the central directory, so nothing has to be buffered or seeked.
//!
//! ## Detection
//!
//! [`open_decompressed`] uses, in order: an explicitly configured codec, the
//! blob name's extension, the stream's magic bytes. Anything unrecognized is
//! read as plain text.
//!
//! Corrupt input (bad CRC, truncated stream) surfaces as an I/O error of kind
//! `InvalidData`, `InvalidInput`, or `UnexpectedEof`, which the reader
//! reports as malformed input.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = &[0x50, 0x4b, 0x03, 0x04];

/// Codec applied to a blob or shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zip,
}

impl Compression {
    /// File extension appended to shard names, including the dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zip => ".zip",
        }
    }

    /// Codec implied by the extension of `path`, if any.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let lower = path.as_ref().to_string_lossy().to_lowercase();
        if lower.ends_with(".gz") || lower.ends_with(".gzip") {
            Some(Compression::Gzip)
        } else if lower.ends_with(".zip") {
            Some(Compression::Zip)
        } else {
            None
        }
    }

    /// Codec implied by the first bytes of a stream.
    #[must_use]
    pub fn from_magic(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(ZIP_MAGIC) {
            Compression::Zip
        } else {
            Compression::None
        }
    }
}

#[cfg_attr(all(feature = "compression-gzip", feature = "compression-zip"), allow(dead_code))]
fn unsupported(codec: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{codec} support is not compiled in"),
    )
}

/// Wrap `reader` so it yields decompressed bytes.
///
/// # Errors
/// Fails when the codec is not compiled in, or when a zip local header is
/// missing or describes an entry that cannot be streamed.
pub fn wrap_decompress(
    reader: Box<dyn Read + Send>,
    compression: Compression,
) -> io::Result<Box<dyn Read + Send>> {
    match compression {
        Compression::None => Ok(reader),
        #[cfg(feature = "compression-gzip")]
        Compression::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
        #[cfg(not(feature = "compression-gzip"))]
        Compression::Gzip => Err(unsupported("gzip")),
        #[cfg(feature = "compression-zip")]
        Compression::Zip => Ok(Box::new(zip::ZipEntryReader::open(Box::new(BufReader::new(
            reader,
        )))?)),
        #[cfg(not(feature = "compression-zip"))]
        Compression::Zip => Err(unsupported("zip")),
    }
}

/// Pick a codec for a blob named `name` and wrap `reader` with it.
///
/// `declared` wins when set; otherwise the extension decides, and failing
/// that the magic bytes.
///
/// # Errors
/// Errors of [`wrap_decompress`], or a failure peeking at the stream.
pub fn open_decompressed(
    reader: Box<dyn Read + Send>,
    name: &str,
    declared: Option<Compression>,
) -> io::Result<(Compression, Box<dyn Read + Send>)> {
    if let Some(codec) = declared.or_else(|| Compression::from_path(name)) {
        return Ok((codec, wrap_decompress(reader, codec)?));
    }
    let mut buffered = BufReader::new(reader);
    let codec = Compression::from_magic(buffered.fill_buf()?);
    Ok((codec, wrap_decompress(Box::new(buffered), codec)?))
}

/// Wrap `writer` so bytes written to it are compressed.
///
/// `entry_name` names the single archive entry for zip output and is ignored
/// otherwise.
///
/// # Errors
/// Fails when the codec is not compiled in, or when writing the zip local
/// header fails.
#[cfg_attr(not(feature = "compression-zip"), allow(unused_variables))]
pub fn wrap_compress<W: Write>(
    writer: W,
    compression: Compression,
    entry_name: &str,
) -> io::Result<CompressedWriter<W>> {
    match compression {
        Compression::None => Ok(CompressedWriter::Plain(writer)),
        #[cfg(feature = "compression-gzip")]
        Compression::Gzip => Ok(CompressedWriter::Gzip(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::default(),
        ))),
        #[cfg(not(feature = "compression-gzip"))]
        Compression::Gzip => Err(unsupported("gzip")),
        #[cfg(feature = "compression-zip")]
        Compression::Zip => Ok(CompressedWriter::Zip(zip::ZipEntryWriter::new(
            writer, entry_name,
        )?)),
        #[cfg(not(feature = "compression-zip"))]
        Compression::Zip => Err(unsupported("zip")),
    }
}

/// A writer produced by [`wrap_compress`]. Call [`finish`](Self::finish) to
/// write trailers; dropping it leaves the output truncated.
pub enum CompressedWriter<W: Write> {
    Plain(W),
    #[cfg(feature = "compression-gzip")]
    Gzip(flate2::write::GzEncoder<W>),
    #[cfg(feature = "compression-zip")]
    Zip(zip::ZipEntryWriter<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Flush the codec, write its trailer, and hand back the inner writer.
    ///
    /// # Errors
    /// Any write error from the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressedWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            #[cfg(feature = "compression-gzip")]
            CompressedWriter::Gzip(enc) => enc.finish(),
            #[cfg(feature = "compression-zip")]
            CompressedWriter::Zip(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            #[cfg(feature = "compression-gzip")]
            CompressedWriter::Gzip(enc) => enc.write(buf),
            #[cfg(feature = "compression-zip")]
            CompressedWriter::Zip(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            #[cfg(feature = "compression-gzip")]
            CompressedWriter::Gzip(enc) => enc.flush(),
            #[cfg(feature = "compression-zip")]
            CompressedWriter::Zip(enc) => enc.flush(),
        }
    }
}

#[cfg(feature = "compression-zip")]
pub use zip::{ZipEntryReader, ZipEntryWriter};

#[cfg(feature = "compression-zip")]
mod zip {
    use flate2::bufread::DeflateDecoder;
    use flate2::write::DeflateEncoder;
    use std::io::{self, BufRead, Read, Take, Write};

    const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
    const DESCRIPTOR_SIG: u32 = 0x0807_4b50;
    const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
    const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;
    const FLAG_DESCRIPTOR: u16 = 0x0008;
    const METHOD_STORED: u16 = 0;
    const METHOD_DEFLATE: u16 = 8;
    const VERSION: u16 = 20;
    // 1980-01-01, the earliest DOS date.
    const DOS_DATE: u16 = (1 << 5) | 1;

    fn invalid(message: impl Into<String>) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, message.into())
    }

    fn read_u16(r: &mut impl Read) -> io::Result<u16> {
        let mut b = [0u8; 2];
        r.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(r: &mut impl Read) -> io::Result<u32> {
        let mut b = [0u8; 4];
        r.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn put_u16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    type Source = Box<dyn BufRead + Send>;

    enum Body {
        Stored(Take<Source>),
        Deflated(DeflateDecoder<Source>),
    }

    /// Streams the first entry of a zip archive.
    pub struct ZipEntryReader {
        body: Body,
        /// CRC and size from the local header, absent when a data descriptor follows.
        expected: Option<(u32, u64)>,
        hasher: crc32fast::Hasher,
        produced: u64,
        verified: bool,
    }

    impl ZipEntryReader {
        pub fn open(mut source: Source) -> io::Result<Self> {
            if read_u32(&mut source)? != LOCAL_HEADER_SIG {
                return Err(invalid("zip local file header not found"));
            }
            let _version = read_u16(&mut source)?;
            let flags = read_u16(&mut source)?;
            let method = read_u16(&mut source)?;
            let _time = read_u16(&mut source)?;
            let _date = read_u16(&mut source)?;
            let crc = read_u32(&mut source)?;
            let compressed = read_u32(&mut source)?;
            let size = read_u32(&mut source)?;
            let name_len = read_u16(&mut source)?;
            let extra_len = read_u16(&mut source)?;
            let skip = u64::from(name_len) + u64::from(extra_len);
            io::copy(&mut (&mut source).take(skip), &mut io::sink())?;

            let has_descriptor = flags & FLAG_DESCRIPTOR != 0;
            if compressed == u32::MAX || size == u32::MAX {
                return Err(invalid("zip64 entries are not supported"));
            }
            let body = match method {
                METHOD_STORED if has_descriptor => {
                    return Err(invalid("stored zip entry with a data descriptor cannot be streamed"));
                }
                METHOD_STORED => Body::Stored(source.take(u64::from(compressed))),
                METHOD_DEFLATE => Body::Deflated(DeflateDecoder::new(source)),
                other => return Err(invalid(format!("unsupported zip compression method {other}"))),
            };
            Ok(Self {
                body,
                expected: (!has_descriptor).then_some((crc, u64::from(size))),
                hasher: crc32fast::Hasher::new(),
                produced: 0,
                verified: false,
            })
        }

        fn trailer(&mut self) -> io::Result<(u32, u64)> {
            if let Some(expected) = self.expected {
                return Ok(expected);
            }
            let Body::Deflated(decoder) = &mut self.body else {
                return Err(invalid("zip data descriptor missing"));
            };
            let source = decoder.get_mut();
            let mut crc = read_u32(source)?;
            if crc == DESCRIPTOR_SIG {
                crc = read_u32(source)?;
            }
            let _compressed = read_u32(source)?;
            let size = read_u32(source)?;
            Ok((crc, u64::from(size)))
        }

        fn verify(&mut self) -> io::Result<()> {
            let (crc, size) = self.trailer()?;
            let actual = std::mem::take(&mut self.hasher).finalize();
            if crc != actual || size != self.produced {
                return Err(invalid(format!(
                    "zip entry check failed: crc {actual:08x}/{crc:08x}, size {}/{size}",
                    self.produced
                )));
            }
            Ok(())
        }
    }

    impl Read for ZipEntryReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = match &mut self.body {
                Body::Stored(r) => r.read(buf)?,
                Body::Deflated(r) => r.read(buf)?,
            };
            if n > 0 {
                self.hasher.update(&buf[..n]);
                self.produced += n as u64;
            } else if !buf.is_empty() && !self.verified {
                self.verified = true;
                self.verify()?;
            }
            Ok(n)
        }
    }

    struct Counting<W> {
        inner: W,
        written: u64,
    }

    impl<W: Write> Write for Counting<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.inner.write(buf)?;
            self.written += n as u64;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    /// Writes a single-entry zip archive without seeking.
    pub struct ZipEntryWriter<W: Write> {
        encoder: DeflateEncoder<Counting<W>>,
        name: Vec<u8>,
        data_start: u64,
        hasher: crc32fast::Hasher,
        size: u64,
    }

    impl<W: Write> ZipEntryWriter<W> {
        pub fn new(writer: W, entry_name: &str) -> io::Result<Self> {
            let name = entry_name.as_bytes().to_vec();
            let name_len = u16::try_from(name.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "zip entry name too long"))?;
            let mut header = Vec::with_capacity(30 + name.len());
            put_u32(&mut header, LOCAL_HEADER_SIG);
            put_u16(&mut header, VERSION);
            put_u16(&mut header, FLAG_DESCRIPTOR);
            put_u16(&mut header, METHOD_DEFLATE);
            put_u16(&mut header, 0);
            put_u16(&mut header, DOS_DATE);
            put_u32(&mut header, 0);
            put_u32(&mut header, 0);
            put_u32(&mut header, 0);
            put_u16(&mut header, name_len);
            put_u16(&mut header, 0);
            header.extend_from_slice(&name);

            let mut out = Counting {
                inner: writer,
                written: 0,
            };
            out.write_all(&header)?;
            Ok(Self {
                data_start: out.written,
                encoder: DeflateEncoder::new(out, flate2::Compression::default()),
                name,
                hasher: crc32fast::Hasher::new(),
                size: 0,
            })
        }

        pub fn finish(self) -> io::Result<W> {
            let Self {
                encoder,
                name,
                data_start,
                hasher,
                size,
            } = self;
            let mut out = encoder.finish()?;
            let too_large = |_| io::Error::new(io::ErrorKind::InvalidInput, "zip entry exceeds 4 GiB");
            let crc = hasher.finalize();
            let compressed = u32::try_from(out.written - data_start).map_err(too_large)?;
            let size = u32::try_from(size).map_err(too_large)?;

            let mut trailer = Vec::new();
            put_u32(&mut trailer, DESCRIPTOR_SIG);
            put_u32(&mut trailer, crc);
            put_u32(&mut trailer, compressed);
            put_u32(&mut trailer, size);

            let central_start = out.written + trailer.len() as u64;
            let mut central = Vec::with_capacity(46 + name.len());
            put_u32(&mut central, CENTRAL_HEADER_SIG);
            put_u16(&mut central, VERSION);
            put_u16(&mut central, VERSION);
            put_u16(&mut central, FLAG_DESCRIPTOR);
            put_u16(&mut central, METHOD_DEFLATE);
            put_u16(&mut central, 0);
            put_u16(&mut central, DOS_DATE);
            put_u32(&mut central, crc);
            put_u32(&mut central, compressed);
            put_u32(&mut central, size);
            put_u16(&mut central, name.len() as u16);
            put_u16(&mut central, 0);
            put_u16(&mut central, 0);
            put_u16(&mut central, 0);
            put_u16(&mut central, 0);
            put_u32(&mut central, 0);
            put_u32(&mut central, 0);
            central.extend_from_slice(&name);

            trailer.extend_from_slice(&central);
            put_u32(&mut trailer, END_OF_CENTRAL_SIG);
            put_u16(&mut trailer, 0);
            put_u16(&mut trailer, 0);
            put_u16(&mut trailer, 1);
            put_u16(&mut trailer, 1);
            put_u32(&mut trailer, central.len() as u32);
            put_u32(&mut trailer, u32::try_from(central_start).map_err(too_large)?);
            put_u16(&mut trailer, 0);

            out.write_all(&trailer)?;
            out.flush()?;
            Ok(out.inner)
        }
    }

    impl<W: Write> Write for ZipEntryWriter<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.encoder.write(buf)?;
            self.hasher.update(&buf[..n]);
            self.size += n as u64;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.encoder.flush()
        }
    }
}
