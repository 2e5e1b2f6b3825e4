//! The v0.4 convention: a stringified partition table
//!
//! Each partitioned variable is stored in the master as a scalar whose
//! `cfa_partitioning` attribute carries the full partition enumeration as a
//! JSON record.

use serde::{Deserialize, Serialize};

use crate::{
    convention::CFA_PARTITIONING_ATTR,
    error::{Error, Result},
    format::{StorageFormat, StructuredFile},
    partition::{Partition, PartitionMatrix},
    types::AttrValue,
    variable::Variable,
};

#[derive(Debug, Serialize, Deserialize)]
struct PartitionTable {
    pmshape: Vec<usize>,
    partitions: Vec<Partition>,
}

pub fn write_variable(
    path: &str,
    name: &str,
    var: &Variable,
    matrix: &PartitionMatrix,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    let table = PartitionTable {
        pmshape: matrix.counts().to_vec(),
        partitions: matrix.all_descriptors(var.subarray_format(), name),
    };
    let json = serde_json::to_string(&table)
        .map_err(|e| Error::InternalInvariant(format!("partition table encode: {e}")))?;
    master.set_attr(path, Some(name), CFA_PARTITIONING_ATTR, AttrValue::Text(json))
}

pub fn read_variable(
    path: &str,
    name: &str,
    shape: &[usize],
    master: &dyn StructuredFile,
) -> Result<(PartitionMatrix, StorageFormat)> {
    let json = master
        .get_attr(path, Some(name), CFA_PARTITIONING_ATTR)?
        .and_then(|v| v.as_text().map(str::to_string))
        .ok_or_else(|| {
            Error::corrupt(master.uri(), format!("{name}: missing cfa_partitioning"))
        })?;
    let table: PartitionTable = serde_json::from_str(&json)
        .map_err(|e| Error::corrupt(master.uri(), format!("{name}: partition table: {e}")))?;
    let format = table
        .partitions
        .first()
        .map(|p| p.format)
        .unwrap_or_default();
    let matrix = PartitionMatrix::from_partitions(shape, &table.pmshape, table.partitions)?;
    Ok((matrix, format))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partition_json_round_trips_every_field() {
        let part = Partition {
            index: vec![1, 2],
            location: vec![(3, 6), (6, 9)],
            shape: vec![3, 3],
            file: Some("s3://host/bucket/m/t.1.2.nc".to_string()),
            format: StorageFormat::Hdf,
            in_variable: "t".to_string(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"format\":\"hdf-based\""));
        assert!(json.contains("\"location\":[[3,6],[6,9]]"));
        let back: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn untouched_tiles_serialize_with_null_files() {
        let part = Partition {
            index: vec![0],
            location: vec![(0, 4)],
            shape: vec![4],
            file: None,
            format: StorageFormat::Classic,
            in_variable: "p".to_string(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"file\":null"));
        let back: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.file, None);
    }
}
