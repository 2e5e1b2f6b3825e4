//! cfarray exposes a single array-dataset abstraction whose contents may be
//! sharded across many backing files, some on remote object stores. Large
//! variables are transparently partitioned into subarray files indexed by a
//! master file that follows the CFA aggregation convention.
//!
//! The crate's core is the partitioning engine: the partitioned-variable
//! data model, the translation of n-dimensional slices into per-subarray
//! reads and writes, the on-demand lifecycle of subarray files under a
//! memory cap, and the serialization of partition metadata into the master.
//! Storage transports and the array-file codec sit behind the [stream] and
//! [format] traits.

pub mod config;
pub mod convention;
pub mod dataset;
pub mod dimension;
pub mod error;
pub mod file_manager;
pub mod format;
pub mod group;
pub mod partition;
pub mod slice;
pub mod stream;
pub mod types;
pub mod uri;
pub mod variable;

pub use config::{DatasetOptions, VariableSpec};
pub use convention::ConventionVersion;
pub use dataset::{Dataset, DatasetFormat, VariableHandle};
pub use error::{Error, Result};
pub use file_manager::{FileManager, FileState, OpenMode};
pub use format::{StorageFormat, StructuredFile};
pub use group::Group;
pub use partition::{Partition, PartitionMatrix};
pub use slice::Slice;
pub use stream::{ByteStore, ByteStream, LocalStore, MemoryStore};
pub use types::{ArrayData, AttrValue, ElemType};
pub use uri::ObjectUri;
pub use variable::Variable;

pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
