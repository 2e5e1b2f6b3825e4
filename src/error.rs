//! Library errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors returned by cfarray
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Append mode is not supported")]
    #[diagnostic(
        code(cfarray::api_misuse::append),
        help("Open the dataset in `w` mode and rewrite it, or in `r` mode to read it")
    )]
    AppendUnsupported,

    #[error("The open mode '{0}' is not recognized")]
    #[diagnostic(
        code(cfarray::api_misuse::mode),
        help("The accepted modes are `r` and `w`")
    )]
    InvalidMode(String),

    #[error("The dataset is open in read mode and cannot be modified")]
    #[diagnostic(code(cfarray::api_misuse::read_only))]
    ReadOnly,

    #[error("A {kind} named '{name}' already exists")]
    #[diagnostic(code(cfarray::api_misuse::name_collision))]
    NameCollision { kind: &'static str, name: String },

    #[error("No {kind} named '{name}' exists")]
    #[diagnostic(code(cfarray::api_misuse::not_found))]
    NotFound { kind: &'static str, name: String },

    #[error("The attribute '{name}' is not present")]
    #[diagnostic(code(cfarray::api_misuse::attribute_missing))]
    AttributeMissing { name: String },

    #[error("Slice has {actual} axes but the variable has {expected}")]
    #[diagnostic(code(cfarray::api_misuse::slice_rank))]
    SliceRank { expected: usize, actual: usize },

    #[error("Slice step {step} on axis {axis} is invalid")]
    #[diagnostic(
        code(cfarray::api_misuse::slice_step),
        help("Steps must be positive; negative and zero steps are not supported")
    )]
    InvalidStride { axis: usize, step: i64 },

    #[error("Writes require unit strides, got step {step} on axis {axis}")]
    #[diagnostic(code(cfarray::api_misuse::non_unit_stride))]
    NonUnitStride { axis: usize, step: i64 },

    #[error("Data of shape {actual:?} does not match the slice shape {expected:?}")]
    #[diagnostic(code(cfarray::api_misuse::shape_mismatch))]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Element type {actual} does not match the variable's type {expected}")]
    #[diagnostic(code(cfarray::api_misuse::element_type))]
    ElementTypeMismatch { expected: String, actual: String },

    #[error("Slab write to '{variable}' falls outside the variable's shape")]
    #[diagnostic(code(cfarray::api_misuse::slab_bounds))]
    SlabOutOfBounds { variable: String },

    #[error("Partitioned variable '{variable}' cannot use an unlimited dimension")]
    #[diagnostic(
        code(cfarray::api_misuse::unlimited),
        help("Give every dimension of a partitioned variable a fixed length")
    )]
    UnlimitedUnsupported { variable: String },

    #[error("An unlimited dimension must be the first dimension of '{variable}'")]
    #[diagnostic(code(cfarray::api_misuse::unlimited_position))]
    UnlimitedNotFirst { variable: String },

    #[error("Convention {convention} cannot be combined with the {format} format")]
    #[diagnostic(
        code(cfarray::format_mismatch),
        help("CFA-0.5 requires a hierarchical storage format; use an hdf-based format")
    )]
    FormatMismatch { format: String, convention: String },

    #[error("'{uri}' is not a recognized array file (magic bytes {magic:02x?})")]
    #[diagnostic(code(cfarray::not_a_recognized_file))]
    NotARecognizedFile { uri: String, magic: Vec<u8> },

    #[error("Metadata in '{uri}' is corrupt: {detail}")]
    #[diagnostic(code(cfarray::not_a_recognized_file::metadata))]
    CorruptMetadata { uri: String, detail: String },

    #[error("Transport failure on '{uri}'")]
    #[diagnostic(code(cfarray::transport_failure))]
    Transport {
        uri: String,
        #[source]
        source: io::Error,
    },

    #[error("Memory cap of {limit} bytes cannot hold {requested} more bytes")]
    #[diagnostic(
        code(cfarray::resource_exhausted),
        help("Raise `memory_limit`, or use a smaller `subarray_shape` / `max_subarray_size`")
    )]
    ResourceExhausted { requested: usize, limit: usize },

    #[error("Cannot partition variable '{variable}': {detail}")]
    #[diagnostic(code(cfarray::partitioning_failure))]
    Partitioning { variable: String, detail: String },

    #[error("Internal invariant violated: {0}")]
    #[diagnostic(
        code(cfarray::internal_invariant),
        help("This is a bug in cfarray; please report it")
    )]
    InternalInvariant(String),
}

impl Error {
    /// Wrap an I/O error as a transport failure against the given URI.
    pub fn transport(uri: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            uri: uri.into(),
            source,
        }
    }

    pub(crate) fn corrupt(uri: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::CorruptMetadata {
            uri: uri.into(),
            detail: detail.into(),
        }
    }
}
