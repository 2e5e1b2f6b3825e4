//! Aggregation-convention serialization
//!
//! The master file records how each partitioned variable is sharded across
//! subarray files. Two convention versions are supported: v0.4 stringifies
//! the partition table into attributes of a scalar field variable; v0.5
//! stores the same information in auxiliary variables under a `cfa_meta`
//! sub-group and is only valid on hierarchical storage formats.
//!
//! The read path materializes every partitioned variable with its full
//! partition matrix before any user slice is issued; no subarray file is
//! opened during parse.

use std::str::FromStr;

use log::debug;
use strum::Display;

use crate::{
    dimension::Dimension,
    error::{Error, Result},
    format::StructuredFile,
    group::{Group, ROOT_GROUP},
    types::AttrValue,
    variable::{VarKind, Variable},
};

pub mod v04;
pub mod v05;

/// Root attribute carrying the convention string.
pub const CONVENTIONS_ATTR: &str = "Conventions";
/// Marker attribute identifying a partitioned field variable.
pub const CFA_ARRAY_ATTR: &str = "cfa_array";
/// Space-joined dimension names of the logical variable.
pub const CFA_DIMENSIONS_ATTR: &str = "cfa_dimensions";
/// Logical shape of the variable.
pub const CFA_SHAPE_ATTR: &str = "cfa_array_shape";
/// v0.4 stringified partition table.
pub const CFA_PARTITIONING_ATTR: &str = "cfa_partitioning";
/// v0.5 metadata sub-group at the master root.
pub const CFA_META_GROUP: &str = "cfa_meta";
/// Fill-value attribute.
pub const FILL_ATTR: &str = "_FillValue";

/// Supported aggregation-convention versions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum ConventionVersion {
    #[default]
    #[strum(serialize = "CFA-0.4")]
    V04,
    #[strum(serialize = "CFA-0.5")]
    V05,
}

impl FromStr for ConventionVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0.4" | "CFA-0.4" => Ok(ConventionVersion::V04),
            "0.5" | "CFA-0.5" => Ok(ConventionVersion::V05),
            other => Err(Error::FormatMismatch {
                format: "any".to_string(),
                convention: other.to_string(),
            }),
        }
    }
}

/// Whether an attribute name belongs to the convention rather than the user.
pub fn is_convention_attr(name: &str) -> bool {
    name.starts_with("cfa_") || name == CONVENTIONS_ATTR
}

/// Detect the convention version from a master's root attributes.
///
/// A master without a convention marker is a plain array file; its
/// variables are all classical.
pub fn detect(master: &dyn StructuredFile) -> Result<Option<ConventionVersion>> {
    let conventions = master.get_attr("", None, CONVENTIONS_ATTR)?;
    let Some(text) = conventions.as_ref().and_then(AttrValue::as_text) else {
        return Ok(None);
    };
    if text.contains("CFA-0.5") {
        Ok(Some(ConventionVersion::V05))
    } else if text.contains("CFA-0.4") {
        Ok(Some(ConventionVersion::V04))
    } else {
        Ok(None)
    }
}

/// Serialize the in-memory model into the master file.
pub fn write_master(
    version: ConventionVersion,
    root: &Group,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    debug!("serializing master metadata as {version}");
    write_group(version, "", root, master)?;
    // written last so a user attribute of the same name cannot mask it
    master.set_attr(
        "",
        None,
        CONVENTIONS_ATTR,
        AttrValue::Text(format!("CF-1.8 {version}")),
    )
}

fn write_group(
    version: ConventionVersion,
    path: &str,
    group: &Group,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    if !path.is_empty() {
        master.create_group(path)?;
    }
    for (name, value) in group.attrs() {
        master.set_attr(path, None, name, value.clone())?;
    }

    let existing_dims: Vec<String> = master
        .dimensions(path)?
        .into_iter()
        .map(|(name, _, _)| name)
        .collect();
    for (name, dim) in &group.dims {
        if !existing_dims.contains(name) {
            master.create_dimension(path, name, dim.len())?;
        }
    }

    for (name, var) in &group.vars {
        match &var.kind {
            VarKind::Classical => write_classical(path, name, var, master)?,
            VarKind::Partitioned(matrix) => {
                master.create_variable(path, name, var.dtype(), &[], Some(var.fill()))?;
                master.set_attr(path, Some(name), CFA_ARRAY_ATTR, AttrValue::Int(1))?;
                master.set_attr(
                    path,
                    Some(name),
                    CFA_DIMENSIONS_ATTR,
                    AttrValue::Text(var.dims().join(" ")),
                )?;
                master.set_attr(
                    path,
                    Some(name),
                    CFA_SHAPE_ATTR,
                    AttrValue::IntList(matrix.shape().iter().map(|&v| v as i64).collect()),
                )?;
                write_fill_attr(path, name, var, master)?;
                for (attr, value) in var.attrs() {
                    master.set_attr(path, Some(name), attr, value.clone())?;
                }
                match version {
                    ConventionVersion::V04 => v04::write_variable(path, name, var, matrix, master)?,
                    ConventionVersion::V05 => v05::write_variable(path, name, var, matrix, master)?,
                }
            }
        }
    }

    // Dimension attributes persist on the dimension variable when one exists.
    for (name, dim) in &group.dims {
        if group.vars.contains_key(name) {
            for (attr, value) in dim.attrs() {
                master.set_attr(path, Some(name), attr, value.clone())?;
            }
        }
    }

    for (name, child) in &group.groups {
        let child_path = join_path(path, name);
        write_group(version, &child_path, child, master)?;
    }
    Ok(())
}

fn write_classical(
    path: &str,
    name: &str,
    var: &Variable,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    // Classical data lands on the master as it is written; only the
    // attribute overlay remains to flush here.
    if !master.variable_names(path)?.contains(&name.to_string()) {
        master.create_variable(path, name, var.dtype(), var.dims(), Some(var.fill()))?;
    }
    write_fill_attr(path, name, var, master)?;
    for (attr, value) in var.attrs() {
        master.set_attr(path, Some(name), attr, value.clone())?;
    }
    Ok(())
}

fn write_fill_attr(
    path: &str,
    name: &str,
    var: &Variable,
    master: &mut dyn StructuredFile,
) -> Result<()> {
    if var.fill() != var.dtype().default_fill() {
        if let Some(value) = var.dtype().scalar_attr(var.fill()) {
            master.set_attr(path, Some(name), FILL_ATTR, value)?;
        }
    }
    Ok(())
}

/// Materialize the in-memory model from a parsed master file.
pub fn read_master(master: &dyn StructuredFile) -> Result<(Option<ConventionVersion>, Group)> {
    let version = detect(master)?;
    let root = read_group(version, "", ROOT_GROUP, master)?;
    Ok((version, root))
}

fn read_group(
    version: Option<ConventionVersion>,
    path: &str,
    name: &str,
    master: &dyn StructuredFile,
) -> Result<Group> {
    let mut group = Group::new(name);

    for attr in master.attr_names(path, None)? {
        if is_convention_attr(&attr) {
            continue;
        }
        if let Some(value) = master.get_attr(path, None, &attr)? {
            group.attrs.insert(attr, value);
        }
    }

    for (dim_name, declared, _current) in master.dimensions(path)? {
        let mut dim = Dimension::new(&dim_name, declared);
        // A dimension variable's units/axis attributes settle classification.
        for attr in ["units", "axis"] {
            if let Ok(Some(value)) = master.get_attr(path, Some(&dim_name), attr) {
                dim.set_attr(attr, value);
            }
        }
        group.dims.insert(dim_name, dim);
    }

    for var_name in master.variable_names(path)? {
        let cfa_marker = master.get_attr(path, Some(&var_name), CFA_ARRAY_ATTR)?;
        let var = if version.is_some() && cfa_marker.and_then(|v| v.as_int()) == Some(1) {
            read_partitioned(version.unwrap(), path, &var_name, master)?
        } else {
            let meta = master.variable_meta(path, &var_name)?;
            Variable::classical(&var_name, meta.dtype, meta.dims, meta.fill)
        };
        group.vars.insert(var_name, var);
    }

    for child in master.group_names(path)? {
        if path.is_empty() && child == CFA_META_GROUP {
            continue;
        }
        let child_path = join_path(path, &child);
        let parsed = read_group(version, &child_path, &child, master)?;
        group.groups.insert(child, parsed);
    }

    Ok(group)
}

fn read_partitioned(
    version: ConventionVersion,
    path: &str,
    name: &str,
    master: &dyn StructuredFile,
) -> Result<Variable> {
    let meta = master.variable_meta(path, name)?;
    let dims: Vec<String> = master
        .get_attr(path, Some(name), CFA_DIMENSIONS_ATTR)?
        .and_then(|v| v.as_text().map(str::to_string))
        .map(|text| text.split_whitespace().map(str::to_string).collect())
        .ok_or_else(|| Error::corrupt(master.uri(), format!("{name}: missing cfa_dimensions")))?;
    let shape: Vec<usize> = match master.get_attr(path, Some(name), CFA_SHAPE_ATTR)? {
        Some(AttrValue::IntList(list)) => list.iter().map(|&v| v as usize).collect(),
        Some(AttrValue::Int(v)) => vec![v as usize],
        _ => {
            return Err(Error::corrupt(
                master.uri(),
                format!("{name}: missing cfa_array_shape"),
            ))
        }
    };
    let fill = match master.get_attr(path, Some(name), FILL_ATTR)? {
        Some(value) => value
            .to_elem_bytes(meta.dtype)
            .unwrap_or_else(|| meta.dtype.default_fill()),
        None => meta.dtype.default_fill(),
    };

    let (matrix, subarray_format) = match version {
        ConventionVersion::V04 => v04::read_variable(path, name, &shape, master)?,
        ConventionVersion::V05 => v05::read_variable(path, name, &shape, master)?,
    };
    Ok(Variable::partitioned(
        name,
        meta.dtype,
        dims,
        fill,
        matrix,
        subarray_format,
    ))
}

pub(crate) fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn convention_strings_parse_both_spellings() {
        assert_eq!(
            "0.4".parse::<ConventionVersion>().unwrap(),
            ConventionVersion::V04
        );
        assert_eq!(
            "CFA-0.5".parse::<ConventionVersion>().unwrap(),
            ConventionVersion::V05
        );
        assert!("0.6".parse::<ConventionVersion>().is_err());
        assert_eq!(ConventionVersion::V04.to_string(), "CFA-0.4");
    }

    #[test]
    fn convention_attrs_are_recognized() {
        assert!(is_convention_attr("cfa_array"));
        assert!(is_convention_attr("Conventions"));
        assert!(!is_convention_attr("units"));
    }
}
