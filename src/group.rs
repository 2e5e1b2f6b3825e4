//! Groups: named containers of dimensions, variables, and child groups

use std::collections::BTreeMap;

use crate::{
    dimension::Dimension,
    error::{Error, Result},
    types::AttrValue,
    variable::Variable,
};

/// The name of the synthetic top-level group every dataset carries.
pub const ROOT_GROUP: &str = "root";

/// A container of dimensions, variables, attributes, and child groups
#[derive(Debug, Clone, Default)]
pub struct Group {
    name: String,
    pub(crate) attrs: BTreeMap<String, AttrValue>,
    pub(crate) dims: BTreeMap<String, Dimension>,
    pub(crate) vars: BTreeMap<String, Variable>,
    pub(crate) groups: BTreeMap<String, Group>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Group {
            name: name.to_string(),
            ..Group::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    /// Resolve a `/`-separated path relative to this group. The empty path
    /// names this group itself. Names compare by value.
    pub fn group(&self, path: &str) -> Result<&Group> {
        let mut node = self;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.groups.get(seg).ok_or_else(|| Error::NotFound {
                kind: "group",
                name: path.to_string(),
            })?;
        }
        Ok(node)
    }

    pub fn group_mut(&mut self, path: &str) -> Result<&mut Group> {
        let mut node = self;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.groups.get_mut(seg).ok_or_else(|| Error::NotFound {
                kind: "group",
                name: path.to_string(),
            })?;
        }
        Ok(node)
    }

    /// Create a child group, failing on a name collision.
    pub fn create_child(&mut self, name: &str) -> Result<&mut Group> {
        if self.groups.contains_key(name) {
            return Err(Error::NameCollision {
                kind: "group",
                name: name.to_string(),
            });
        }
        self.groups.insert(name.to_string(), Group::new(name));
        Ok(self.groups.get_mut(name).unwrap())
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn dimension(&self, name: &str) -> Result<&Dimension> {
        self.dims.get(name).ok_or_else(|| Error::NotFound {
            kind: "dimension",
            name: name.to_string(),
        })
    }

    pub fn dimension_mut(&mut self, name: &str) -> Result<&mut Dimension> {
        self.dims.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "dimension",
            name: name.to_string(),
        })
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.dims.keys().cloned().collect()
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.vars.get(name).ok_or_else(|| Error::NotFound {
            kind: "variable",
            name: name.to_string(),
        })
    }

    pub fn variable_mut(&mut self, name: &str) -> Result<&mut Variable> {
        self.vars.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "variable",
            name: name.to_string(),
        })
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Whether a dimension variable exists for the named dimension.
    pub fn has_dimension_variable(&self, dim: &str) -> bool {
        self.dims.contains_key(dim) && self.vars.contains_key(dim)
    }
}
