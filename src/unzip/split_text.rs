use async_trait::async_trait;
use tracing::{debug, info};

use super::{EntryReport, READ_CHUNK_BYTES, UnzipContext, UnzipStrategy, unzip_failed};
use crate::error::{Error, Result};
use crate::upload::{MIB, MultipartUpload, PartBuffer};
use crate::zip::ArchiveEntry;

/// Splits a text entry into numbered shards of roughly `file_bytes_limit`
/// bytes, cutting only between lines.
///
/// Shards are keyed `output_prefix + n + "-" + name` starting at 1. With
/// `header` set, the entry's first line is repeated at the top of every shard
/// after the first. Lines keep their original delimiter, so concatenating the
/// shards (minus repeated headers) gives back the entry byte for byte.
///
/// The limit is checked at every line boundary, not only when an upload part
/// fills up, so a shard exceeds `file_bytes_limit` by at most one line. An
/// entry therefore yields more, smaller shards than part-boundary rollover
/// would: 200 MB of CSV with a 10 MiB limit gives about 20 shards, not 6.
#[derive(Debug, Clone)]
pub struct SplitTextStrategy {
    header: bool,
    file_bytes_limit: u64,
    delimiter: Vec<u8>,
}

impl Default for SplitTextStrategy {
    fn default() -> Self {
        Self {
            header: false,
            file_bytes_limit: 100 * MIB as u64,
            delimiter: b"\n".to_vec(),
        }
    }
}

impl SplitTextStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    pub fn with_file_bytes_limit(mut self, limit: u64) -> Self {
        self.file_bytes_limit = limit;
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<Vec<u8>>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn header(&self) -> bool {
        self.header
    }

    pub fn file_bytes_limit(&self) -> u64 {
        self.file_bytes_limit
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    async fn split(
        &self,
        entry: &mut ArchiveEntry<'_>,
        shards: &mut ShardWriter<'_>,
        ctx: &UnzipContext,
    ) -> Result<()> {
        let mut lines = LineReader::new(&self.delimiter);
        let mut header = Vec::new();
        let mut capturing_header = self.header;
        let mut mid_line = false;

        while let Some(segment) = lines.next_segment(entry).await? {
            ctx.check_cancelled()?;

            if !mid_line && shards.is_over_limit() {
                shards.roll_over(&header).await?;
            }
            if capturing_header {
                header.extend_from_slice(segment.bytes);
                capturing_header = !segment.line_end;
            }

            shards.write(segment.bytes).await?;
            mid_line = !segment.line_end;
        }

        shards.finish().await
    }
}

#[async_trait]
impl UnzipStrategy for SplitTextStrategy {
    fn validate(&self) -> Result<()> {
        if self.file_bytes_limit == 0 {
            return Err(Error::InvalidConfiguration(
                "file bytes limit must be positive".into(),
            ));
        }
        if self.delimiter.is_empty() {
            return Err(Error::InvalidConfiguration(
                "line delimiter must not be empty".into(),
            ));
        }
        Ok(())
    }

    async fn unzip(&self, entry: &mut ArchiveEntry<'_>, ctx: &UnzipContext) -> Result<EntryReport> {
        self.validate()?;
        let name = entry.name().to_string();
        let mut shards = ShardWriter::new(ctx, &name, self.file_bytes_limit);

        match self.split(entry, &mut shards, ctx).await {
            Ok(()) => Ok(EntryReport {
                name,
                output_keys: shards.keys,
                bytes: shards.entry_bytes,
            }),
            Err(e) => {
                shards.abort().await;
                Err(unzip_failed(&name, e))
            }
        }
    }
}

/// The shard currently being written plus the bookkeeping across shards.
struct ShardWriter<'a> {
    ctx: &'a UnzipContext,
    name: String,
    file_bytes_limit: u64,
    index: u32,
    upload: Option<MultipartUpload>,
    buffer: PartBuffer,
    file_bytes: u64,
    entry_bytes: u64,
    keys: Vec<String>,
}

impl<'a> ShardWriter<'a> {
    fn new(ctx: &'a UnzipContext, name: &str, file_bytes_limit: u64) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            file_bytes_limit,
            index: 0,
            upload: None,
            buffer: PartBuffer::new(ctx.upload.upload_part_bytes_limit),
            file_bytes: 0,
            entry_bytes: 0,
            keys: Vec::new(),
        }
    }

    fn is_over_limit(&self) -> bool {
        self.upload.is_some() && self.file_bytes > self.file_bytes_limit
    }

    async fn open_next(&mut self) -> Result<&mut MultipartUpload> {
        self.index += 1;
        let key = self.ctx.shard_key(self.index, &self.name);
        let upload = self.ctx.open_upload(&key).await?;
        debug!(key = %key, shard = self.index, "opened shard");
        self.keys.push(key);
        self.file_bytes = 0;
        Ok(self.upload.insert(upload))
    }

    async fn current(&mut self) -> Result<&mut MultipartUpload> {
        if self.upload.is_none() {
            return self.open_next().await;
        }
        self.upload
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no open shard".into()))
    }

    /// Append entry bytes to the current shard.
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.entry_bytes += data.len() as u64;
        self.append(data).await
    }

    async fn append(&mut self, mut data: &[u8]) -> Result<()> {
        self.current().await?;
        self.file_bytes += data.len() as u64;
        while !data.is_empty() {
            let n = self.buffer.extend(data);
            data = &data[n..];
            if self.buffer.is_full() {
                let part = self.buffer.take();
                self.current().await?.upload_part(part).await?;
            }
        }
        Ok(())
    }

    /// Complete the current shard, open the next and replay the header.
    async fn roll_over(&mut self, header: &[u8]) -> Result<()> {
        self.complete_current().await?;
        self.open_next().await?;
        self.append(header).await
    }

    async fn complete_current(&mut self) -> Result<()> {
        let part = self.buffer.take();
        let (shard, bytes) = (self.index, self.file_bytes);
        let upload = self.current().await?;
        upload.upload_final_part(part).await?;
        info!(key = upload.key(), shard, bytes, "completed shard");
        Ok(())
    }

    /// Complete the last shard. An empty entry still yields shard 1.
    async fn finish(&mut self) -> Result<()> {
        self.complete_current().await
    }

    async fn abort(&mut self) {
        if let Some(upload) = self.upload.as_mut() {
            upload.abort().await;
        }
    }
}

/// A run of bytes from the entry. `line_end` marks the end of a line, either
/// at a delimiter (included in `bytes`) or at the end of the entry.
struct Segment<'a> {
    bytes: &'a [u8],
    line_end: bool,
}

/// Splits an entry into lines without holding a whole line in memory: a line
/// longer than the read window comes back as several segments.
struct LineReader<'d> {
    delimiter: &'d [u8],
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
}

impl<'d> LineReader<'d> {
    fn new(delimiter: &'d [u8]) -> Self {
        Self {
            delimiter,
            buf: vec![0u8; READ_CHUNK_BYTES.max(delimiter.len() * 2)],
            start: 0,
            end: 0,
            eof: false,
        }
    }

    async fn next_segment(&mut self, entry: &mut ArchiveEntry<'_>) -> Result<Option<Segment<'_>>> {
        loop {
            let found = find(&self.buf[self.start..self.end], self.delimiter);
            if let Some(pos) = found {
                let from = self.start;
                self.start += pos + self.delimiter.len();
                return Ok(Some(Segment {
                    bytes: &self.buf[from..self.start],
                    line_end: true,
                }));
            }

            if self.eof {
                if self.start == self.end {
                    return Ok(None);
                }
                let from = self.start;
                self.start = self.end;
                return Ok(Some(Segment {
                    bytes: &self.buf[from..self.end],
                    line_end: true,
                }));
            }

            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }

            if self.end == self.buf.len() {
                // Window full without a delimiter. Hand out all but a possible
                // partial delimiter at the tail.
                let emit = self.end - (self.delimiter.len() - 1);
                self.start = emit;
                return Ok(Some(Segment {
                    bytes: &self.buf[..emit],
                    line_end: false,
                }));
            }

            let n = entry.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.end += n;
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    match needle {
        [] => None,
        [byte] => haystack.iter().position(|b| b == byte),
        _ => haystack
            .windows(needle.len())
            .position(|window| window == needle),
    }
}
