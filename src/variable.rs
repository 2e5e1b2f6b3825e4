//! Variables: classical or partitioned

use std::collections::BTreeMap;

use crate::{
    format::StorageFormat,
    partition::PartitionMatrix,
    types::{AttrValue, ElemType},
};

/// Where a variable's data lives
#[derive(Debug, Clone)]
pub enum VarKind {
    /// Data stored inline in the current file
    Classical,
    /// Data sharded across subarray files indexed by the partition matrix
    Partitioned(PartitionMatrix),
}

impl VarKind {
    pub fn is_partitioned(&self) -> bool {
        matches!(self, VarKind::Partitioned(_))
    }
}

/// A named, typed, n-dimensional variable
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    dtype: ElemType,
    dims: Vec<String>,
    /// In-memory attribute overlay; authoritative for writes, flushed to the
    /// backing file on dataset close
    pub(crate) attrs: BTreeMap<String, AttrValue>,
    /// Fill value as element bytes
    fill: Vec<u8>,
    pub(crate) kind: VarKind,
    /// Format used for this variable's subarray files
    subarray_format: StorageFormat,
}

impl Variable {
    pub fn classical(name: &str, dtype: ElemType, dims: Vec<String>, fill: Vec<u8>) -> Self {
        Variable {
            name: name.to_string(),
            dtype,
            dims,
            attrs: BTreeMap::new(),
            fill,
            kind: VarKind::Classical,
            subarray_format: StorageFormat::default(),
        }
    }

    pub fn partitioned(
        name: &str,
        dtype: ElemType,
        dims: Vec<String>,
        fill: Vec<u8>,
        matrix: PartitionMatrix,
        subarray_format: StorageFormat,
    ) -> Self {
        Variable {
            name: name.to_string(),
            dtype,
            dims,
            attrs: BTreeMap::new(),
            fill,
            kind: VarKind::Partitioned(matrix),
            subarray_format,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn dtype(&self) -> ElemType {
        self.dtype
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Fill value as element bytes.
    pub fn fill(&self) -> &[u8] {
        &self.fill
    }

    pub fn kind(&self) -> &VarKind {
        &self.kind
    }

    pub fn is_partitioned(&self) -> bool {
        self.kind.is_partitioned()
    }

    pub fn subarray_format(&self) -> StorageFormat {
        self.subarray_format
    }

    pub fn matrix(&self) -> Option<&PartitionMatrix> {
        match &self.kind {
            VarKind::Partitioned(matrix) => Some(matrix),
            VarKind::Classical => None,
        }
    }

    pub fn matrix_mut(&mut self) -> Option<&mut PartitionMatrix> {
        match &mut self.kind {
            VarKind::Partitioned(matrix) => Some(matrix),
            VarKind::Classical => None,
        }
    }

    /// The in-memory attribute overlay.
    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }
}
