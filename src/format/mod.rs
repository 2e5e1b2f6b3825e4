//! Structured array files
//!
//! A [StructuredFile] wraps a byte stream as a self-describing array file:
//! groups, dimensions, typed variables with attributes, and contiguous data
//! slabs addressed by region. The partitioning engine talks only to this
//! trait and never peeks inside byte layouts; [binfile::BinFile] is the
//! default implementation shipped with the crate.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::{
    error::{Error, Result},
    stream::ByteStore,
    types::{ArrayData, AttrValue, ElemType},
    uri::ObjectUri,
};

pub mod binfile;

pub use binfile::{BinFile, BinFileOpener};

/// Storage format tags for structured files
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StorageFormat {
    /// Classic flat format
    Classic,
    /// Classic flat format with 64-bit offsets
    #[strum(serialize = "64bit-offset")]
    #[serde(rename = "64bit-offset")]
    Offset64,
    /// Classic flat format with 64-bit data
    #[strum(serialize = "64bit-data")]
    #[serde(rename = "64bit-data")]
    Data64,
    /// Hierarchical hdf-based format
    #[default]
    #[strum(serialize = "hdf-based")]
    #[serde(rename = "hdf-based")]
    Hdf,
}

impl StorageFormat {
    /// Whether the format supports hierarchical groups.
    pub fn hierarchical(self) -> bool {
        matches!(self, StorageFormat::Hdf)
    }

    /// The magic bytes written at the start of a file of this format.
    pub fn magic(self) -> &'static [u8] {
        match self {
            StorageFormat::Classic => b"CDF\x01",
            StorageFormat::Offset64 => b"CDF\x02",
            StorageFormat::Data64 => b"CDF\x05",
            StorageFormat::Hdf => b"\x89HDF\r\n\x1a\n",
        }
    }

    /// File extension used for subarray naming.
    pub fn extension(self) -> &'static str {
        "nc"
    }
}

/// Identify a structured file from its leading bytes.
///
/// Returns the detected format and the length of the magic prefix. The
/// hdf-based format has two recognized variants: the v5 signature
/// `\x89HDF\r\n\x1a\n` and the legacy v4 signature `\x0e\x03\x13\x01`.
pub fn detect_format(magic: &[u8], uri: &str) -> Result<(StorageFormat, usize)> {
    if magic.len() >= 4 && magic[0] == 0x89 && &magic[1..4] == b"HDF" {
        return Ok((StorageFormat::Hdf, StorageFormat::Hdf.magic().len()));
    }
    if magic.starts_with(b"\x0e\x03\x13\x01") {
        return Ok((StorageFormat::Hdf, 4));
    }
    if magic.starts_with(b"CDF\x01") {
        return Ok((StorageFormat::Classic, 4));
    }
    if magic.starts_with(b"CDF\x02") {
        return Ok((StorageFormat::Offset64, 4));
    }
    if magic.starts_with(b"CDF\x05") {
        return Ok((StorageFormat::Data64, 4));
    }
    Err(Error::NotARecognizedFile {
        uri: uri.to_string(),
        magic: magic.iter().copied().take(6).collect(),
    })
}

/// Options passed through to the structured-file provider on open/create
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Keep the file in memory without a backing object
    pub diskless: bool,
    /// Persist a diskless file on close after all
    pub persist: bool,
    /// Replace an existing file on create
    pub clobber: bool,
    /// Let the provider hold weak references to cached handles
    pub keep_weak_ref: bool,
}

/// Metadata of one variable in a structured file
#[derive(Debug, Clone, PartialEq)]
pub struct VarMeta {
    pub dtype: ElemType,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub fill: Vec<u8>,
}

/// A structured array file: groups, dimensions, variables, attributes, slabs
///
/// Group paths are `/`-separated and relative to the root; the empty string
/// names the root group itself.
pub trait StructuredFile {
    fn format(&self) -> StorageFormat;

    fn uri(&self) -> &str;

    /// Create a group (and any missing ancestors).
    fn create_group(&mut self, path: &str) -> Result<()>;

    fn group_names(&self, path: &str) -> Result<Vec<String>>;

    fn has_group(&self, path: &str) -> bool;

    /// Declare a dimension; `None` marks it unlimited.
    fn create_dimension(&mut self, group: &str, name: &str, len: Option<usize>) -> Result<()>;

    /// Dimensions of a group as `(name, declared_len, current_len)`.
    fn dimensions(&self, group: &str) -> Result<Vec<(String, Option<usize>, usize)>>;

    fn create_variable(
        &mut self,
        group: &str,
        name: &str,
        dtype: ElemType,
        dims: &[String],
        fill: Option<&[u8]>,
    ) -> Result<()>;

    fn variable_names(&self, group: &str) -> Result<Vec<String>>;

    fn variable_meta(&self, group: &str, name: &str) -> Result<VarMeta>;

    fn rename_variable(&mut self, group: &str, old: &str, new: &str) -> Result<()>;

    /// Write a contiguous slab with its lowest corner at `origin`.
    fn write_slab(
        &mut self,
        group: &str,
        var: &str,
        origin: &[usize],
        data: &ArrayData,
    ) -> Result<()>;

    /// Read a contiguous slab given inclusive-exclusive per-axis bounds.
    fn read_slab(&self, group: &str, var: &str, bounds: &[(usize, usize)]) -> Result<ArrayData>;

    fn set_attr(&mut self, group: &str, var: Option<&str>, name: &str, value: AttrValue)
        -> Result<()>;

    fn get_attr(&self, group: &str, var: Option<&str>, name: &str) -> Result<Option<AttrValue>>;

    fn del_attr(&mut self, group: &str, var: Option<&str>, name: &str) -> Result<()>;

    fn attr_names(&self, group: &str, var: Option<&str>) -> Result<Vec<String>>;

    /// Bytes currently held in memory for this file.
    fn size_hint(&self) -> usize;

    /// Persist the current state to the backing byte stream.
    fn flush(&mut self) -> Result<()>;

    /// Flush and release the backing stream.
    fn close(&mut self) -> Result<()>;
}

/// Opens and creates [StructuredFile]s over a byte store.
///
/// The file manager goes through this seam so an alternative provider can be
/// swapped in without touching the caching logic.
pub trait StructuredOpener {
    fn create(
        &self,
        store: &dyn ByteStore,
        uri: &ObjectUri,
        format: StorageFormat,
        opts: &OpenOptions,
    ) -> Result<Box<dyn StructuredFile>>;

    fn open(&self, store: &dyn ByteStore, uri: &ObjectUri) -> Result<Box<dyn StructuredFile>>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn magic_detection_recognizes_all_variants() {
        assert_eq!(
            detect_format(b"\x89HDF\r\n\x1a\n", "m").unwrap(),
            (StorageFormat::Hdf, 8)
        );
        assert_eq!(
            detect_format(b"\x0e\x03\x13\x01\x00\x00", "m").unwrap(),
            (StorageFormat::Hdf, 4)
        );
        assert_eq!(
            detect_format(b"CDF\x01\x00\x00", "m").unwrap(),
            (StorageFormat::Classic, 4)
        );
        assert_eq!(
            detect_format(b"CDF\x02\x00\x00", "m").unwrap(),
            (StorageFormat::Offset64, 4)
        );
        assert_eq!(
            detect_format(b"CDF\x05\x00\x00", "m").unwrap(),
            (StorageFormat::Data64, 4)
        );
    }

    #[test]
    fn unknown_magic_is_not_a_recognized_file() {
        let err = detect_format(b"PK\x03\x04hi", "archive.zip").unwrap_err();
        match err {
            Error::NotARecognizedFile { uri, magic } => {
                assert_eq!(uri, "archive.zip");
                assert_eq!(magic, b"PK\x03\x04hi".to_vec());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn format_names_parse() {
        use std::str::FromStr;

        assert_eq!(StorageFormat::from_str("classic").unwrap(), StorageFormat::Classic);
        assert_eq!(
            StorageFormat::from_str("64bit-offset").unwrap(),
            StorageFormat::Offset64
        );
        assert_eq!(StorageFormat::from_str("hdf-based").unwrap(), StorageFormat::Hdf);
    }
}
