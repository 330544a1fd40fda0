//! Low-level crate for reading and writing `.gport` model containers.
//!
//! # About .gport model files
//!
//! A `.gport` file contains both a serialized model graph and the data for
//! its constant tensors. The file starts with a fixed-size header specifying
//! the format version and the offsets of the graph and tensor data sections.
//! The graph section is a self-describing record stream; tensor data is
//! stored after it as raw little-endian bytes so that a consuming runtime can
//! reference it without copying.
//!
//! This crate only understands the container layout. Translating between the
//! container and an in-memory graph representation is the responsibility of
//! higher-level crates.

pub mod header;
pub mod io;

pub use header::{Header, HeaderError};
pub use io::{ValueReader, ValueWriter};
