use async_trait::async_trait;
use tracing::debug;

use super::{EntryReport, READ_CHUNK_BYTES, UnzipContext, UnzipStrategy, unzip_failed};
use crate::error::Result;
use crate::upload::{MultipartUpload, PartBuffer};
use crate::zip::ArchiveEntry;

/// Writes each entry to exactly one object at `output_prefix + name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSplitStrategy;

impl NoSplitStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UnzipStrategy for NoSplitStrategy {
    async fn unzip(&self, entry: &mut ArchiveEntry<'_>, ctx: &UnzipContext) -> Result<EntryReport> {
        let name = entry.name().to_string();
        let key = ctx.output_key(&name);

        let mut upload = ctx
            .open_upload(&key)
            .await
            .map_err(|e| unzip_failed(&name, e))?;

        match copy_entry(entry, &mut upload, ctx).await {
            Ok(bytes) => Ok(EntryReport {
                name,
                output_keys: vec![key],
                bytes,
            }),
            Err(e) => {
                upload.abort().await;
                Err(unzip_failed(&name, e))
            }
        }
    }
}

async fn copy_entry(
    entry: &mut ArchiveEntry<'_>,
    upload: &mut MultipartUpload,
    ctx: &UnzipContext,
) -> Result<u64> {
    let limit = ctx.upload.upload_part_bytes_limit;
    let mut buffer = PartBuffer::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES.min(limit)];
    let mut total = 0u64;

    loop {
        ctx.check_cancelled()?;
        let n = entry.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        total += n as u64;

        let mut offset = 0;
        while offset < n {
            offset += buffer.extend(&chunk[offset..n]);
            if buffer.is_full() {
                upload.upload_part(buffer.take()).await?;
            }
        }
    }

    debug!(key = upload.key(), bytes = total, "entry fully read");
    upload.upload_final_part(buffer.take()).await?;
    Ok(total)
}
