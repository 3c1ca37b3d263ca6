//! Forward-only ZIP reader over a non-seekable byte stream.
//!
//! Unlike a central-directory driven reader, this walks the archive front to
//! back, one local file header at a time. It never needs to know the total
//! size of the archive, which is what lets an object body be unzipped while it
//! is still downloading.
//!
//! ## Entry framing
//!
//! Each entry is a local file header, the (possibly compressed) data, and an
//! optional data descriptor. When the writer did not know the sizes up front
//! (flag bit 3), the header carries zeros and the real CRC and sizes follow the
//! data. DEFLATE streams are self-terminating, so those entries can still be
//! read; STORED entries with deferred sizes cannot and are rejected.
//!
//! Iteration stops at the first central directory header, at the end of
//! central directory record, or at a clean end of stream.

use flate2::{Crc, Decompress, FlushDecompress, Status};
use std::io::ErrorKind;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::structures::*;

/// Boxed object body the archive is read from.
pub type ArchiveSource = Pin<Box<dyn AsyncRead + Send>>;

/// Capacity of the buffer between the object body and the decoder.
const SOURCE_BUFFER_BYTES: usize = 64 * 1024;

/// Scratch size used when discarding the unread rest of an entry.
const SKIP_BUFFER_BYTES: usize = 16 * 1024;

/// Sequential ZIP entry iterator.
///
/// ## Example
///
/// ```ignore
/// let mut reader = ZipStreamReader::new(body);
/// while let Some(mut entry) = reader.next_entry().await? {
///     let mut buf = vec![0u8; 8192];
///     while entry.read(&mut buf).await? > 0 {}
/// }
/// ```
pub struct ZipStreamReader {
    source: BufReader<ArchiveSource>,
    body: Option<EntryBody>,
    finished: bool,
    entries: u64,
}

/// Decoding state of the entry currently being read.
struct EntryBody {
    name: String,
    header: LocalFileHeader,
    decoder: Decoder,
    crc: Crc,
    compressed_read: u64,
    uncompressed_read: u64,
    done: bool,
}

enum Decoder {
    Stored { remaining: u64 },
    Deflate { inflater: Box<Decompress>, ended: bool },
}

impl Decoder {
    fn exhausted(&self) -> bool {
        match self {
            Decoder::Stored { remaining } => *remaining == 0,
            Decoder::Deflate { ended, .. } => *ended,
        }
    }
}

impl ZipStreamReader {
    pub fn new(source: ArchiveSource) -> Self {
        Self {
            source: BufReader::with_capacity(SOURCE_BUFFER_BYTES, source),
            body: None,
            finished: false,
            entries: 0,
        }
    }

    /// Number of file entries handed out so far (directories excluded).
    pub fn entries_read(&self) -> u64 {
        self.entries
    }

    /// Advance to the next file entry.
    ///
    /// Whatever is left of the previous entry is read and discarded first, so
    /// its CRC is still verified. Directory entries are skipped.
    pub async fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>> {
        loop {
            self.skip_body().await?;
            if self.finished {
                return Ok(None);
            }

            let Some((header, name)) = self.read_local_header().await? else {
                self.finished = true;
                return Ok(None);
            };

            let decoder = decoder_for(&header, &name)?;
            let is_directory = name.ends_with('/');

            trace!(
                name = %name,
                method = header.compression_method.as_u16(),
                compressed = ?header.declared_compressed_size(),
                uncompressed = ?header.declared_uncompressed_size(),
                "read local file header"
            );

            let entry_meta = (
                header.compression_method,
                header.declared_compressed_size(),
                header.declared_uncompressed_size(),
            );

            self.body = Some(EntryBody {
                name: name.clone(),
                header,
                decoder,
                crc: Crc::new(),
                compressed_read: 0,
                uncompressed_read: 0,
                done: false,
            });

            if is_directory {
                debug!(name = %name, "skipping directory entry");
                continue;
            }

            validate_entry_name(&name)?;
            self.entries += 1;

            return Ok(Some(ArchiveEntry {
                reader: self,
                name,
                compression_method: entry_meta.0,
                compressed_size: entry_meta.1,
                uncompressed_size: entry_meta.2,
            }));
        }
    }

    /// Read the next local file header, or `None` when the entries are over.
    async fn read_local_header(&mut self) -> Result<Option<(LocalFileHeader, String)>> {
        let mut signature = [0u8; 4];
        loop {
            let n = read_fully(&mut self.source, &mut signature).await?;
            if n == 0 {
                return Ok(None);
            }
            if n < signature.len() {
                return Err(unexpected_eof());
            }

            if signature == LFH_SIGNATURE {
                break;
            }
            if signature == CDFH_SIGNATURE
                || signature == EOCD_SIGNATURE
                || signature == ZIP64_EOCD_SIGNATURE
            {
                return Ok(None);
            }
            if signature == SPANNED_MARKER && self.entries == 0 && self.body.is_none() {
                continue;
            }

            return Err(Error::ArchiveMalformed(format!(
                "unexpected record signature {:02x?}",
                signature
            )));
        }

        let mut fixed = [0u8; LFH_SIZE];
        fixed[..4].copy_from_slice(&signature);
        self.source
            .read_exact(&mut fixed[4..])
            .await
            .map_err(truncated)?;
        let mut header = LocalFileHeader::from_bytes(&fixed)?;

        let mut name_bytes = vec![0u8; header.file_name_length as usize];
        self.source
            .read_exact(&mut name_bytes)
            .await
            .map_err(truncated)?;

        let mut extra = vec![0u8; header.extra_field_length as usize];
        self.source.read_exact(&mut extra).await.map_err(truncated)?;
        header.apply_extra_field(&extra)?;

        // Use lossy conversion to handle non-UTF8 filenames gracefully
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        Ok(Some((header, name)))
    }

    /// Read decompressed bytes of the current entry. Returns 0 at its end.
    async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        if body.done || buf.is_empty() {
            return Ok(0);
        }

        let produced = match &mut body.decoder {
            Decoder::Stored { remaining } => {
                if *remaining == 0 {
                    0
                } else {
                    let available = self.source.fill_buf().await?;
                    if available.is_empty() {
                        return Err(unexpected_eof());
                    }
                    let n = available
                        .len()
                        .min(buf.len())
                        .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    buf[..n].copy_from_slice(&available[..n]);
                    self.source.consume(n);
                    *remaining -= n as u64;
                    body.compressed_read += n as u64;
                    n
                }
            }
            Decoder::Deflate { inflater, ended } => loop {
                if *ended {
                    break 0;
                }

                let input = self.source.fill_buf().await?;
                let eof = input.is_empty();
                let flush = if eof {
                    FlushDecompress::Finish
                } else {
                    FlushDecompress::None
                };

                let (in_before, out_before) = (inflater.total_in(), inflater.total_out());
                let status = inflater.decompress(input, buf, flush).map_err(|err| {
                    Error::ArchiveMalformed(format!("corrupt deflate stream in {}: {err}", body.name))
                })?;
                let consumed = (inflater.total_in() - in_before) as usize;
                let written = (inflater.total_out() - out_before) as usize;

                self.source.consume(consumed);
                body.compressed_read += consumed as u64;

                if status == Status::StreamEnd {
                    *ended = true;
                    break written;
                }
                if written > 0 {
                    break written;
                }
                if eof {
                    return Err(unexpected_eof());
                }
                if consumed == 0 {
                    return Err(Error::ArchiveMalformed(format!(
                        "deflate stream in {} stopped making progress",
                        body.name
                    )));
                }
            },
        };

        body.crc.update(&buf[..produced]);
        body.uncompressed_read += produced as u64;

        if body.decoder.exhausted() {
            self.finish_body().await?;
        }

        Ok(produced)
    }

    /// Verify the finished entry against its header or data descriptor.
    async fn finish_body(&mut self) -> Result<()> {
        let Some(body) = self.body.as_mut() else {
            return Ok(());
        };
        if body.done {
            return Ok(());
        }
        body.done = true;

        let name = body.name.clone();
        let zip64 = body.header.zip64;
        let actual = DataDescriptor {
            crc32: body.crc.sum(),
            compressed_size: body.compressed_read,
            uncompressed_size: body.uncompressed_read,
        };

        let (expected, sizes_are_64bit) = if body.header.has_data_descriptor() {
            (self.read_data_descriptor(zip64).await?, zip64)
        } else {
            (
                DataDescriptor {
                    crc32: body.header.crc32,
                    compressed_size: body.header.compressed_size,
                    uncompressed_size: body.header.uncompressed_size,
                },
                true,
            )
        };

        if expected.crc32 != actual.crc32 {
            return Err(Error::ArchiveMalformed(format!(
                "CRC mismatch for {name}: expected {:08x}, got {:08x}",
                expected.crc32, actual.crc32
            )));
        }

        let truncate = |size: u64| if sizes_are_64bit { size } else { size & 0xFFFF_FFFF };
        if expected.uncompressed_size != truncate(actual.uncompressed_size)
            || expected.compressed_size != truncate(actual.compressed_size)
        {
            return Err(Error::ArchiveMalformed(format!(
                "size mismatch for {name}: expected {}/{} bytes, got {}/{}",
                expected.compressed_size,
                expected.uncompressed_size,
                actual.compressed_size,
                actual.uncompressed_size
            )));
        }

        trace!(name = %name, bytes = actual.uncompressed_size, crc = actual.crc32, "entry verified");
        Ok(())
    }

    async fn read_data_descriptor(&mut self, zip64: bool) -> Result<DataDescriptor> {
        let size = DataDescriptor::body_size(zip64);
        let mut data = vec![0u8; size];

        self.source
            .read_exact(&mut data[..4])
            .await
            .map_err(truncated)?;
        if data[..4] == *DATA_DESCRIPTOR_SIGNATURE {
            self.source.read_exact(&mut data).await.map_err(truncated)?;
        } else {
            self.source
                .read_exact(&mut data[4..])
                .await
                .map_err(truncated)?;
        }

        DataDescriptor::from_bytes(&data, zip64)
    }

    /// Discard the rest of the current entry, if any.
    async fn skip_body(&mut self) -> Result<()> {
        if self.body.as_ref().is_some_and(|body| !body.done) {
            let mut scratch = vec![0u8; SKIP_BUFFER_BYTES];
            while self.read_body(&mut scratch).await? > 0 {}
            self.finish_body().await?;
        }
        self.body = None;
        Ok(())
    }
}

/// One file inside the archive.
///
/// The entry borrows the reader, so it cannot outlive the next call to
/// [`ZipStreamReader::next_entry`].
pub struct ArchiveEntry<'a> {
    reader: &'a mut ZipStreamReader,
    name: String,
    compression_method: CompressionMethod,
    compressed_size: Option<u64>,
    uncompressed_size: Option<u64>,
}

impl ArchiveEntry<'_> {
    /// Entry path as stored in the archive, `/` separated.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compression_method(&self) -> CompressionMethod {
        self.compression_method
    }

    /// Size from the local header. `None` for streamed entries; never a limit.
    pub fn declared_compressed_size(&self) -> Option<u64> {
        self.compressed_size
    }

    /// Size from the local header. `None` for streamed entries; never a limit.
    pub fn declared_uncompressed_size(&self) -> Option<u64> {
        self.uncompressed_size
    }

    /// Read decompressed bytes. Returns 0 once the entry is exhausted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read_body(buf).await
    }

    /// Read the remaining bytes of the entry into `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0u8; SKIP_BUFFER_BYTES];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }
}

fn decoder_for(header: &LocalFileHeader, name: &str) -> Result<Decoder> {
    if header.is_encrypted() {
        return Err(Error::ArchiveMalformed(format!(
            "{name} is encrypted, which is not supported"
        )));
    }

    match header.compression_method {
        CompressionMethod::Stored => match header.declared_compressed_size() {
            Some(size) => Ok(Decoder::Stored { remaining: size }),
            None => Err(Error::ArchiveMalformed(format!(
                "{name} is stored with a data descriptor and cannot be read as a stream"
            ))),
        },
        CompressionMethod::Deflate => Ok(Decoder::Deflate {
            inflater: Box::new(Decompress::new(false)),
            ended: false,
        }),
        CompressionMethod::Unknown(method) => Err(Error::ArchiveMalformed(format!(
            "{name} uses unsupported compression method {method}"
        ))),
    }
}

/// Entry names become object keys, so absolute paths and parent segments are refused.
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ArchiveMalformed("entry with empty name".into()));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(Error::ArchiveMalformed(format!(
            "entry {name} has an absolute path"
        )));
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(Error::ArchiveMalformed(format!(
            "entry {name} escapes the output prefix"
        )));
    }
    Ok(())
}

/// Fill `buf` as far as the stream allows; returns the number of bytes read.
async fn read_fully<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn unexpected_eof() -> Error {
    Error::ArchiveMalformed("unexpected end of archive".into())
}

fn truncated(err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::UnexpectedEof {
        unexpected_eof()
    } else {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    /// Assemble a single-entry archive by hand.
    fn entry_bytes(name: &str, data: &[u8], deflate: bool, descriptor: bool) -> Vec<u8> {
        let mut crc = Crc::new();
        crc.update(data);

        let payload = if deflate {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        } else {
            data.to_vec()
        };

        let flags: u16 = if descriptor { 0x0008 } else { 0 };
        let method: u16 = if deflate { 8 } else { 0 };
        let (header_crc, header_compressed, header_uncompressed) = if descriptor {
            (0, 0, 0)
        } else {
            (crc.sum(), payload.len() as u32, data.len() as u32)
        };

        let mut out = Vec::new();
        out.extend_from_slice(LFH_SIGNATURE);
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&header_crc.to_le_bytes());
        out.extend_from_slice(&header_compressed.to_le_bytes());
        out.extend_from_slice(&header_uncompressed.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);

        if descriptor {
            out.extend_from_slice(DATA_DESCRIPTOR_SIGNATURE);
            out.extend_from_slice(&crc.sum().to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        out
    }

    fn reader_for(bytes: Vec<u8>) -> ZipStreamReader {
        ZipStreamReader::new(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn collect(bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut reader = reader_for(bytes);
        let mut out = Vec::new();
        while let Some(mut entry) = reader.next_entry().await? {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).await?;
            out.push((entry.name().to_string(), data));
        }
        Ok(out)
    }

    #[tokio::test]
    async fn reads_stored_and_deflated_entries() {
        let mut archive = entry_bytes("a.txt", b"hello", false, false);
        archive.extend(entry_bytes("dir/b.txt", b"world world world", true, false));
        archive.extend_from_slice(CDFH_SIGNATURE);

        let entries = collect(archive).await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("a.txt".to_string(), b"hello".to_vec()),
                ("dir/b.txt".to_string(), b"world world world".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn reads_streamed_deflate_entry_with_descriptor() {
        let data: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut archive = entry_bytes("streamed.bin", &data, true, true);
        archive.extend(entry_bytes("next.txt", b"after", false, false));

        let mut reader = reader_for(archive);
        let entry = reader.next_entry().await.unwrap().unwrap();
        assert_eq!(entry.declared_uncompressed_size(), None);
        drop(entry);

        // Advancing without reading must still land on the next header.
        let mut entry = reader.next_entry().await.unwrap().unwrap();
        assert_eq!(entry.name(), "next.txt");
        let mut out = Vec::new();
        entry.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"after");
        assert!(reader.next_entry().await.unwrap().is_none());
        assert_eq!(reader.entries_read(), 2);
    }

    #[tokio::test]
    async fn skips_directories() {
        let mut archive = entry_bytes("dir/", b"", false, false);
        archive.extend(entry_bytes("dir/file", b"x", false, false));

        let entries = collect(archive).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "dir/file");
    }

    #[tokio::test]
    async fn empty_stream_has_no_entries() {
        assert!(collect(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detects_crc_mismatch() {
        let mut archive = entry_bytes("a.txt", b"hello", false, false);
        // Flip a byte of the stored data.
        let len = archive.len();
        archive[len - 1] ^= 0xFF;

        let err = collect(archive).await.unwrap_err();
        assert!(matches!(err, Error::ArchiveMalformed(msg) if msg.contains("CRC")));
    }

    #[tokio::test]
    async fn detects_truncated_entry() {
        let mut archive = entry_bytes("a.bin", &[7u8; 4096], true, false);
        archive.truncate(archive.len() - 10);

        let err = collect(archive).await.unwrap_err();
        assert!(matches!(err, Error::ArchiveMalformed(_)));
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let err = collect(b"not a zip file at all".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::ArchiveMalformed(_)));
    }

    #[tokio::test]
    async fn rejects_stored_entry_with_descriptor() {
        let archive = entry_bytes("a.txt", b"hello", false, true);
        let err = collect(archive).await.unwrap_err();
        assert!(matches!(err, Error::ArchiveMalformed(msg) if msg.contains("stored")));
    }

    #[tokio::test]
    async fn rejects_escaping_names() {
        for name in ["/etc/passwd", "a/../../b"] {
            let err = collect(entry_bytes(name, b"x", false, false)).await.unwrap_err();
            assert!(matches!(err, Error::ArchiveMalformed(_)), "{name}");
        }
    }
}
