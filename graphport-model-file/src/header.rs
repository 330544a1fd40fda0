//! Parse and serialize the header of a `.gport` model file.

use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::io::{ValueReader, ValueWriter};

/// Magic bytes at the start of every `.gport` file.
pub const MAGIC: &[u8; 4] = b"GPRT";

/// Container format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Errors produced when reading the header of a `.gport` model file.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderError {
    /// The header is incomplete.
    TooShort,

    /// The file format version specified in the header is unsupported.
    UnsupportedVersion,

    /// The header doesn't start with the magic bytes "GPRT".
    InvalidMagic,

    /// A segment offset in the header is invalid.
    InvalidOffset,

    /// A segment length in the header is invalid.
    InvalidLength,
}

impl Display for HeaderError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::TooShort => write!(fmt, "header is too short"),
            HeaderError::UnsupportedVersion => write!(fmt, "unsupported file version"),
            HeaderError::InvalidMagic => write!(fmt, "incorrect file magic"),
            HeaderError::InvalidOffset => write!(fmt, "segment offset is invalid"),
            HeaderError::InvalidLength => write!(fmt, "segment length is invalid"),
        }
    }
}

impl Error for HeaderError {}

/// Header for a `.gport` model file.
///
/// This specifies the file version and the location of the graph and tensor
/// data sections within the file.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    /// Major version of the file format. Currently 1.
    pub version: u32,

    /// Offset of the serialized graph section.
    pub graph_offset: u64,

    /// Length of the serialized graph section.
    pub graph_len: u64,

    /// Offset of constant tensor data stored outside the graph section.
    pub tensor_data_offset: u64,
}

impl Header {
    /// Size of the serialized header in bytes.
    pub const LEN: usize = 32;

    /// Read the file header from a byte buffer.
    ///
    /// `buf` is expected to be a slice that contains the entire file, as its
    /// length is used to validate offsets in the header.
    pub fn from_buf(buf: &[u8]) -> Result<Header, HeaderError> {
        let too_short = Err(HeaderError::TooShort);
        let file_size = buf.len() as u64;

        let mut reader = ValueReader::new(buf);

        let Some(magic) = reader.read_bytes(4) else {
            return too_short;
        };
        if magic != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let Some(version) = reader.read::<u32>() else {
            return too_short;
        };
        if version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion);
        }

        let Some(graph_offset) = reader.read::<u64>() else {
            return too_short;
        };
        if graph_offset < Self::LEN as u64 || graph_offset > file_size {
            return Err(HeaderError::InvalidOffset);
        }
        let Some(graph_len) = reader.read::<u64>() else {
            return too_short;
        };
        if graph_offset.saturating_add(graph_len) > file_size {
            return Err(HeaderError::InvalidLength);
        }

        let Some(tensor_data_offset) = reader.read::<u64>() else {
            return too_short;
        };
        if tensor_data_offset < Self::LEN as u64 || tensor_data_offset > file_size {
            return Err(HeaderError::InvalidOffset);
        }

        Ok(Header {
            version,
            graph_offset,
            graph_len,
            tensor_data_offset,
        })
    }

    /// Serialize this header to a byte buffer.
    pub fn to_buf(&self) -> Vec<u8> {
        let mut writer = ValueWriter::new();
        writer.write_bytes(MAGIC);
        writer.write(self.version);
        writer.write(self.graph_offset);
        writer.write(self.graph_len);
        writer.write(self.tensor_data_offset);
        writer.into_vec()
    }
}
