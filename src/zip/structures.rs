use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Central Directory File Header. Seeing one means the last entry has been read.
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";

/// End of Central Directory records, regular and ZIP64.
pub const EOCD_SIGNATURE: &[u8] = b"PK\x05\x06";
pub const ZIP64_EOCD_SIGNATURE: &[u8] = b"PK\x06\x06";

/// Marker some writers put at the start of a single-segment "spanned" archive.
pub const SPANNED_MARKER: &[u8] = b"PK\x30\x30";

/// Optional signature in front of a data descriptor.
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

/// Fixed part of a local file header, with ZIP64 sizes already applied.
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    /// Set when the extra field carried a ZIP64 record; data descriptors then use 8-byte sizes.
    pub zip64: bool,
}

impl LocalFileHeader {
    /// Parse the 30 fixed bytes of a local file header, signature included.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LFH_SIZE || &data[0..4] != LFH_SIGNATURE {
            return Err(Error::ArchiveMalformed("invalid local file header".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: CompressionMethod::from_u16(cursor.read_u16::<LittleEndian>()?),
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            uncompressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
            zip64: false,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Sizes and CRC follow the entry data instead of living in the header.
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    /// Apply the ZIP64 extended information extra field, if present.
    ///
    /// In a local header the ZIP64 record holds the uncompressed size followed by
    /// the compressed size, each present only when the 32-bit header field is
    /// saturated.
    pub fn apply_extra_field(&mut self, extra: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(extra);
        let end = extra.len() as u64;

        while cursor.position() + 4 <= end {
            let header_id = cursor.read_u16::<LittleEndian>()?;
            let field_size = cursor.read_u16::<LittleEndian>()? as u64;
            let field_end = cursor.position() + field_size;
            if field_end > end {
                return Err(Error::ArchiveMalformed("truncated extra field".into()));
            }

            if header_id == ZIP64_EXTRA_ID {
                self.zip64 = true;
                if self.uncompressed_size == ZIP64_MARKER as u64 && cursor.position() + 8 <= field_end {
                    self.uncompressed_size = cursor.read_u64::<LittleEndian>()?;
                }
                if self.compressed_size == ZIP64_MARKER as u64 && cursor.position() + 8 <= field_end {
                    self.compressed_size = cursor.read_u64::<LittleEndian>()?;
                }
            }

            cursor.set_position(field_end);
        }

        Ok(())
    }

    /// Compressed size, unless it is deferred to a data descriptor.
    pub fn declared_compressed_size(&self) -> Option<u64> {
        self.declared(self.compressed_size)
    }

    /// Uncompressed size, unless it is deferred to a data descriptor.
    pub fn declared_uncompressed_size(&self) -> Option<u64> {
        self.declared(self.uncompressed_size)
    }

    fn declared(&self, size: u64) -> Option<u64> {
        if self.has_data_descriptor() && size == 0 {
            None
        } else if size == ZIP64_MARKER as u64 {
            None
        } else {
            Some(size)
        }
    }
}

/// Trailer written after entry data when bit 3 of the flags is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    /// Size of the descriptor body (signature excluded).
    pub fn body_size(zip64: bool) -> usize {
        if zip64 { 20 } else { 12 }
    }

    /// Parse a descriptor body, i.e. the bytes after the optional signature.
    pub fn from_bytes(data: &[u8], zip64: bool) -> Result<Self> {
        if data.len() < Self::body_size(zip64) {
            return Err(Error::ArchiveMalformed("truncated data descriptor".into()));
        }

        let mut cursor = Cursor::new(data);
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let (compressed_size, uncompressed_size) = if zip64 {
            (
                cursor.read_u64::<LittleEndian>()?,
                cursor.read_u64::<LittleEndian>()?,
            )
        } else {
            (
                cursor.read_u32::<LittleEndian>()? as u64,
                cursor.read_u32::<LittleEndian>()? as u64,
            )
        };

        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(flags: u16, method: u16, compressed: u32, uncompressed: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(LFH_SIGNATURE);
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&method.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(&compressed.to_le_bytes());
        data.extend_from_slice(&uncompressed.to_le_bytes());
        data.extend_from_slice(&8u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data
    }

    #[test]
    fn parses_local_header() {
        let header = LocalFileHeader::from_bytes(&header_bytes(0, 8, 10, 42)).unwrap();
        assert_eq!(header.compression_method, CompressionMethod::Deflate);
        assert_eq!(header.crc32, 0xDEAD_BEEF);
        assert_eq!(header.declared_compressed_size(), Some(10));
        assert_eq!(header.declared_uncompressed_size(), Some(42));
        assert_eq!(header.file_name_length, 8);
        assert!(!header.has_data_descriptor());
    }

    #[test]
    fn streamed_entries_have_unknown_sizes() {
        let header = LocalFileHeader::from_bytes(&header_bytes(FLAG_DATA_DESCRIPTOR, 8, 0, 0)).unwrap();
        assert!(header.has_data_descriptor());
        assert_eq!(header.declared_compressed_size(), None);
        assert_eq!(header.declared_uncompressed_size(), None);
    }

    #[test]
    fn applies_zip64_sizes() {
        let mut header =
            LocalFileHeader::from_bytes(&header_bytes(0, 0, 0xFFFF_FFFF, 0xFFFF_FFFF)).unwrap();
        let mut extra = Vec::new();
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(5u64 << 32).to_le_bytes());
        extra.extend_from_slice(&(4u64 << 32).to_le_bytes());

        header.apply_extra_field(&extra).unwrap();
        assert!(header.zip64);
        assert_eq!(header.uncompressed_size, 5u64 << 32);
        assert_eq!(header.compressed_size, 4u64 << 32);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = header_bytes(0, 0, 0, 0);
        data[2] = 0x01;
        assert!(matches!(
            LocalFileHeader::from_bytes(&data),
            Err(Error::ArchiveMalformed(_))
        ));
    }

    #[test]
    fn parses_data_descriptor() {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&9u32.to_le_bytes());
        let descriptor = DataDescriptor::from_bytes(&body, false).unwrap();
        assert_eq!(
            descriptor,
            DataDescriptor {
                crc32: 7,
                compressed_size: 3,
                uncompressed_size: 9
            }
        );
    }
}
