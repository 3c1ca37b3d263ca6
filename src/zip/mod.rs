//! Streaming ZIP archive reading.
//!
//! This module reads ZIP archives front to back from a forward-only byte
//! stream, such as the body of an object GET. No seeking, no central
//! directory, no temporary files.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures for the records found in the stream
//!   (local file headers, data descriptors, record signatures)
//! - [`reader`]: The sequential entry iterator and per-entry body reader
//!
//! ## Supported Features
//!
//! - STORED (no compression) and DEFLATE compression methods
//! - Data descriptors (streamed DEFLATE entries with unknown sizes)
//! - ZIP64 sizes in local headers and data descriptors
//! - CRC-32 verification of every entry
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - STORED entries must declare their size in the local header

mod reader;
mod structures;

pub use reader::{ArchiveEntry, ArchiveSource, ZipStreamReader};
pub use structures::*;
