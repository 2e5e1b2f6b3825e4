//! Dimensions and axis classification

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::types::AttrValue;

/// Axis roles a dimension can play
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[non_exhaustive]
pub enum AxisKind {
    X,
    Y,
    Z,
    T,
    #[default]
    Unknown,
}

/// A named axis of a group
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    /// Declared length; `None` marks the dimension unlimited
    len: Option<usize>,
    axis: AxisKind,
    attrs: BTreeMap<String, AttrValue>,
}

impl Dimension {
    /// Declare a dimension, classifying its axis from the name.
    pub fn new(name: &str, len: Option<usize>) -> Self {
        Dimension {
            name: name.to_string(),
            len,
            axis: classify(name, &BTreeMap::new()),
            attrs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared length; `None` for unlimited.
    pub fn len(&self) -> Option<usize> {
        self.len
    }

    pub fn is_unlimited(&self) -> bool {
        self.len.is_none()
    }

    pub fn axis(&self) -> AxisKind {
        self.axis
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    /// Set an attribute and re-run axis classification, since `units` and
    /// `axis` attributes can settle an otherwise unknown axis.
    pub fn set_attr(&mut self, name: &str, value: AttrValue) {
        self.attrs.insert(name.to_string(), value);
        self.axis = classify(&self.name, &self.attrs);
    }
}

/// Classify an axis from a dimension name and its attributes.
///
/// The `axis` attribute wins, then time-like `units`, then well-known names.
pub fn classify(name: &str, attrs: &BTreeMap<String, AttrValue>) -> AxisKind {
    if let Some(axis) = attrs.get("axis").and_then(AttrValue::as_text) {
        match axis.to_ascii_uppercase().as_str() {
            "X" => return AxisKind::X,
            "Y" => return AxisKind::Y,
            "Z" => return AxisKind::Z,
            "T" => return AxisKind::T,
            _ => {}
        }
    }
    if let Some(units) = attrs.get("units").and_then(AttrValue::as_text) {
        if units.contains(" since ") {
            return AxisKind::T;
        }
    }
    match name.to_ascii_lowercase().as_str() {
        "x" | "lon" | "longitude" => AxisKind::X,
        "y" | "lat" | "latitude" => AxisKind::Y,
        "z" | "lev" | "level" | "height" | "depth" | "plev" => AxisKind::Z,
        "t" | "time" => AxisKind::T,
        _ => AxisKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_names_classify() {
        assert_eq!(Dimension::new("longitude", Some(360)).axis(), AxisKind::X);
        assert_eq!(Dimension::new("lat", Some(180)).axis(), AxisKind::Y);
        assert_eq!(Dimension::new("height", Some(40)).axis(), AxisKind::Z);
        assert_eq!(Dimension::new("time", None).axis(), AxisKind::T);
        assert_eq!(Dimension::new("ensemble", Some(4)).axis(), AxisKind::Unknown);
    }

    #[test]
    fn time_units_reclassify_an_unknown_axis() {
        let mut dim = Dimension::new("record", Some(12));
        assert_eq!(dim.axis(), AxisKind::Unknown);
        dim.set_attr("units", AttrValue::from("days since 1970-01-01"));
        assert_eq!(dim.axis(), AxisKind::T);
    }

    #[test]
    fn axis_attribute_wins() {
        let mut dim = Dimension::new("time", Some(12));
        dim.set_attr("axis", AttrValue::from("Z"));
        assert_eq!(dim.axis(), AxisKind::Z);
    }
}
