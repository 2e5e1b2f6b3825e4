//! The v0.5 convention: structured metadata variables
//!
//! The partition enumeration lives in auxiliary variables of a `cfa_meta`
//! sub-group of the master rather than in stringified attributes. The field
//! variable stays scalar. This layout needs hierarchical groups, which is
//! why v0.5 is rejected on classical storage formats.

use crate::{
    convention::{join_path, CFA_META_GROUP},
    error::{Error, Result},
    format::{StorageFormat, StructuredFile},
    partition::{Partition, PartitionMatrix},
    types::{ArrayData, AttrValue, ElemType},
    variable::Variable,
};

const INDEX_VAR: &str = "index";
const LOCATION_VAR: &str = "location";
const PART_DIM: &str = "part";
const DIM_DIM: &str = "dim";
const BND_DIM: &str = "bnd";
const PMSHAPE_ATTR: &str = "pmshape";
const FILES_ATTR: &str = "files";
const FORMATS_ATTR: &str = "formats";
const IN_VARIABLES_ATTR: &str = "in_variables";

fn meta_group(path: &str, name: &str) -> String {
    let var_path = join_path(path, name).replace('/', ".");
    format!("{CFA_META_GROUP}/{var_path}")
}

pub fn write_variable(
    path: &str,
    name: &str,
    var: &Variable,
    matrix: &PartitionMatrix,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    let parts = matrix.all_descriptors(var.subarray_format(), name);
    let nparts = parts.len();
    let ndims = matrix.shape().len();
    let group = meta_group(path, name);
    master.create_group(&group)?;

    master.create_dimension(&group, PART_DIM, Some(nparts))?;
    master.create_dimension(&group, DIM_DIM, Some(ndims))?;
    master.create_dimension(&group, BND_DIM, Some(2))?;

    let dims_idx = [PART_DIM.to_string(), DIM_DIM.to_string()];
    let dims_loc = [
        PART_DIM.to_string(),
        DIM_DIM.to_string(),
        BND_DIM.to_string(),
    ];
    master.create_variable(&group, INDEX_VAR, ElemType::I64, &dims_idx, None)?;
    master.create_variable(&group, LOCATION_VAR, ElemType::I64, &dims_loc, None)?;

    let mut index = Vec::with_capacity(nparts * ndims);
    let mut location = Vec::with_capacity(nparts * ndims * 2);
    let mut files = Vec::with_capacity(nparts);
    let mut formats = Vec::with_capacity(nparts);
    let mut in_variables = Vec::with_capacity(nparts);
    for part in &parts {
        index.extend(part.index.iter().map(|&v| v as i64));
        for &(start, end) in &part.location {
            location.push(start as i64);
            location.push(end as i64);
        }
        files.push(part.file.clone().unwrap_or_default());
        formats.push(part.format.to_string());
        in_variables.push(part.in_variable.clone());
    }

    let index = ArrayData::from_elems(ElemType::I64, &[nparts, ndims], &index)?;
    master.write_slab(&group, INDEX_VAR, &[0, 0], &index)?;
    let location = ArrayData::from_elems(ElemType::I64, &[nparts, ndims, 2], &location)?;
    master.write_slab(&group, LOCATION_VAR, &[0, 0, 0], &location)?;

    master.set_attr(
        &group,
        None,
        PMSHAPE_ATTR,
        AttrValue::IntList(matrix.counts().iter().map(|&v| v as i64).collect()),
    )?;
    master.set_attr(&group, None, FILES_ATTR, AttrValue::TextList(files))?;
    master.set_attr(&group, None, FORMATS_ATTR, AttrValue::TextList(formats))?;
    master.set_attr(
        &group,
        None,
        IN_VARIABLES_ATTR,
        AttrValue::TextList(in_variables),
    )?;
    Ok(())
}

pub fn read_variable(
    path: &str,
    name: &str,
    shape: &[usize],
    master: &dyn StructuredFile,
) -> Result<(PartitionMatrix, StorageFormat)> {
    let group = meta_group(path, name);
    let corrupt = |detail: &str| Error::corrupt(master.uri(), format!("{name}: {detail}"));

    let counts: Vec<usize> = match master.get_attr(&group, None, PMSHAPE_ATTR)? {
        Some(AttrValue::IntList(list)) => list.iter().map(|&v| v as usize).collect(),
        Some(AttrValue::Int(v)) => vec![v as usize],
        _ => return Err(corrupt("missing pmshape")),
    };
    let files = match master.get_attr(&group, None, FILES_ATTR)? {
        Some(AttrValue::TextList(list)) => list,
        _ => return Err(corrupt("missing files")),
    };
    let formats = match master.get_attr(&group, None, FORMATS_ATTR)? {
        Some(AttrValue::TextList(list)) => list,
        _ => return Err(corrupt("missing formats")),
    };
    let in_variables = match master.get_attr(&group, None, IN_VARIABLES_ATTR)? {
        Some(AttrValue::TextList(list)) => list,
        _ => return Err(corrupt("missing in_variables")),
    };

    let ndims = shape.len();
    let nparts = files.len();
    if formats.len() != nparts || in_variables.len() != nparts {
        return Err(corrupt("partition metadata lengths disagree"));
    }

    let index = master.read_slab(&group, INDEX_VAR, &[(0, nparts), (0, ndims)])?;
    let location = master.read_slab(&group, LOCATION_VAR, &[(0, nparts), (0, ndims), (0, 2)])?;
    let index: &[i64] = index.as_slice();
    let location: &[i64] = location.as_slice();

    let mut partitions = Vec::with_capacity(nparts);
    for p in 0..nparts {
        let idx: Vec<usize> = index[p * ndims..(p + 1) * ndims]
            .iter()
            .map(|&v| v as usize)
            .collect();
        let loc: Vec<(usize, usize)> = (0..ndims)
            .map(|d| {
                let base = (p * ndims + d) * 2;
                (location[base] as usize, location[base + 1] as usize)
            })
            .collect();
        let part_shape: Vec<usize> = loc.iter().map(|&(s, e)| e - s).collect();
        let format: StorageFormat = formats[p]
            .parse()
            .map_err(|_| corrupt("unknown subarray format"))?;
        partitions.push(Partition {
            index: idx,
            location: loc,
            shape: part_shape,
            file: (!files[p].is_empty()).then(|| files[p].clone()),
            format,
            in_variable: in_variables[p].clone(),
        });
    }

    let format = partitions.first().map(|p| p.format).unwrap_or_default();
    let matrix = PartitionMatrix::from_partitions(shape, &counts, partitions)?;
    Ok((matrix, format))
}
