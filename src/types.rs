//! Element types, attribute values, and the row-major array buffer

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::{
    error::{Error, Result},
    slice::Region,
};

/// Supported array element types
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum ElemType {
    I8 = 1,
    U8 = 2,
    I16 = 3,
    U16 = 4,
    I32 = 5,
    U32 = 6,
    I64 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElemType::I8 | ElemType::U8 => 1,
            ElemType::I16 | ElemType::U16 => 2,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }

    /// Default fill value, little-endian encoded.
    ///
    /// These are the stock netCDF fill constants.
    pub fn default_fill(self) -> Vec<u8> {
        match self {
            ElemType::I8 => (-127i8).to_le_bytes().to_vec(),
            ElemType::U8 => 255u8.to_le_bytes().to_vec(),
            ElemType::I16 => (-32767i16).to_le_bytes().to_vec(),
            ElemType::U16 => 65535u16.to_le_bytes().to_vec(),
            ElemType::I32 => (-2147483647i32).to_le_bytes().to_vec(),
            ElemType::U32 => 4294967295u32.to_le_bytes().to_vec(),
            ElemType::I64 => (-9223372036854775806i64).to_le_bytes().to_vec(),
            ElemType::U64 => 18446744073709551614u64.to_le_bytes().to_vec(),
            ElemType::F32 => 9.9692099683868690e+36f32.to_le_bytes().to_vec(),
            ElemType::F64 => 9.9692099683868690e+36f64.to_le_bytes().to_vec(),
        }
    }

    /// Decode element bytes into a scalar attribute value, for persisting
    /// fill values. Unsigned values beyond the signed range have no exact
    /// attribute form and yield `None`.
    pub fn scalar_attr(self, bytes: &[u8]) -> Option<AttrValue> {
        if bytes.len() != self.size() {
            return None;
        }
        Some(match self {
            ElemType::I8 => AttrValue::Int(i8::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::U8 => AttrValue::Int(u8::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::I16 => AttrValue::Int(i16::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::U16 => AttrValue::Int(u16::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::I32 => AttrValue::Int(i32::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::U32 => AttrValue::Int(u32::from_le_bytes(bytes.try_into().ok()?) as i64),
            ElemType::I64 => AttrValue::Int(i64::from_le_bytes(bytes.try_into().ok()?)),
            ElemType::U64 => {
                let v = u64::from_le_bytes(bytes.try_into().ok()?);
                AttrValue::Int(i64::try_from(v).ok()?)
            }
            ElemType::F32 => AttrValue::Float(f32::from_le_bytes(bytes.try_into().ok()?) as f64),
            ElemType::F64 => AttrValue::Float(f64::from_le_bytes(bytes.try_into().ok()?)),
        })
    }

    /// Create an [ElemType] from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        use ElemType::*;

        match code {
            1 => Some(I8),
            2 => Some(U8),
            3 => Some(I16),
            4 => Some(U16),
            5 => Some(I32),
            6 => Some(U32),
            7 => Some(I64),
            8 => Some(U64),
            9 => Some(F32),
            10 => Some(F64),
            _ => None,
        }
    }
}

/// An attribute value on a group, dimension, or variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum AttrValue {
    Text(String),
    TextList(Vec<String>),
    Int(i64),
    IntList(Vec<i64>),
    Float(f64),
    FloatList(Vec<f64>),
}

impl AttrValue {
    /// Interpret the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as an integer, widening if needed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Encode a scalar numeric attribute as element bytes of the given type.
    ///
    /// Used to turn a user-supplied `_FillValue` into the variable's element
    /// representation.
    pub fn to_elem_bytes(&self, dtype: ElemType) -> Option<Vec<u8>> {
        let v = match self {
            AttrValue::Int(v) => *v as f64,
            AttrValue::Float(v) => *v,
            _ => return None,
        };
        Some(encode_scalar(dtype, v))
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

fn encode_scalar(dtype: ElemType, v: f64) -> Vec<u8> {
    match dtype {
        ElemType::I8 => (v as i8).to_le_bytes().to_vec(),
        ElemType::U8 => (v as u8).to_le_bytes().to_vec(),
        ElemType::I16 => (v as i16).to_le_bytes().to_vec(),
        ElemType::U16 => (v as u16).to_le_bytes().to_vec(),
        ElemType::I32 => (v as i32).to_le_bytes().to_vec(),
        ElemType::U32 => (v as u32).to_le_bytes().to_vec(),
        ElemType::I64 => (v as i64).to_le_bytes().to_vec(),
        ElemType::U64 => (v as u64).to_le_bytes().to_vec(),
        ElemType::F32 => (v as f32).to_le_bytes().to_vec(),
        ElemType::F64 => v.to_le_bytes().to_vec(),
    }
}

/// A typed, contiguous, row-major n-dimensional buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    dtype: ElemType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl ArrayData {
    /// Allocate a zero-initialized array.
    pub fn zeroed(dtype: ElemType, shape: &[usize]) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        ArrayData {
            dtype,
            shape: shape.to_vec(),
            bytes: vec![0; len],
        }
    }

    /// Allocate an array initialized with the given element bytes.
    pub fn filled(dtype: ElemType, shape: &[usize], fill: &[u8]) -> Self {
        let mut out = Self::zeroed(dtype, shape);
        out.fill_with(fill);
        out
    }

    /// Build an array from a typed element slice.
    pub fn from_elems<T: Pod>(dtype: ElemType, shape: &[usize], elems: &[T]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if elems.len() != expected || std::mem::size_of::<T>() != dtype.size() {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![elems.len()],
            });
        }
        Ok(ArrayData {
            dtype,
            shape: shape.to_vec(),
            bytes: bytemuck::cast_slice(elems).to_vec(),
        })
    }

    /// Rebuild an array from raw little-endian bytes.
    pub fn from_bytes(dtype: ElemType, shape: &[usize], bytes: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if bytes.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![bytes.len() / dtype.size().max(1)],
            });
        }
        Ok(ArrayData {
            dtype,
            shape: shape.to_vec(),
            bytes,
        })
    }

    pub fn dtype(&self) -> ElemType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elems(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// View the buffer as a typed slice.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(&self.bytes)
    }

    /// Overwrite every element with the given element bytes.
    pub fn fill_with(&mut self, fill: &[u8]) {
        debug_assert_eq!(fill.len(), self.dtype.size());
        for chunk in self.bytes.chunks_exact_mut(fill.len()) {
            chunk.copy_from_slice(fill);
        }
    }

    /// Row-major strides in elements.
    fn strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        strides
    }

    /// Copy `src[src_region]` into `self` starting at `dst_start`.
    ///
    /// The source region may carry per-axis steps; the destination is always
    /// unit-stride. Region counts define the copied shape.
    pub fn copy_strided_from(
        &mut self,
        dst_start: &[usize],
        src: &ArrayData,
        src_region: &Region,
    ) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(Error::ElementTypeMismatch {
                expected: self.dtype.to_string(),
                actual: src.dtype.to_string(),
            });
        }
        let counts = src_region.shape();
        if counts.len() != self.shape.len() || counts.len() != src.shape.len() {
            return Err(Error::InternalInvariant(format!(
                "strided copy rank mismatch: {} vs {}/{}",
                counts.len(),
                self.shape.len(),
                src.shape.len()
            )));
        }
        for (d, span) in src_region.spans().iter().enumerate() {
            let src_end = span.start + span.count.saturating_sub(1) * span.step + 1;
            if span.count > 0 && src_end > src.shape[d] {
                return Err(Error::InternalInvariant(format!(
                    "strided copy source overrun on axis {d}"
                )));
            }
            if dst_start[d] + counts[d] > self.shape[d] {
                return Err(Error::InternalInvariant(format!(
                    "strided copy target overrun on axis {d}"
                )));
            }
        }

        let esz = self.dtype.size();
        let n = counts.len();
        if n == 0 || counts.iter().any(|&c| c == 0) {
            if n == 0 {
                self.bytes[..esz].copy_from_slice(&src.bytes[..esz]);
            }
            return Ok(());
        }

        let sstr = Self::strides(&src.shape);
        let dstr = Self::strides(&self.shape);
        let spans = src_region.spans();
        let inner = counts[n - 1];
        let inner_step = spans[n - 1].step;

        // Odometer over all axes but the innermost; the innermost is copied
        // as a run when unit-stride, element-wise otherwise.
        let mut idx = vec![0usize; n - 1];
        loop {
            let mut soff = (spans[n - 1].start) * sstr[n - 1];
            let mut doff = dst_start[n - 1] * dstr[n - 1];
            for d in 0..n - 1 {
                soff += (spans[d].start + idx[d] * spans[d].step) * sstr[d];
                doff += (dst_start[d] + idx[d]) * dstr[d];
            }
            if inner_step == 1 {
                let sb = soff * esz;
                let db = doff * esz;
                self.bytes[db..db + inner * esz].copy_from_slice(&src.bytes[sb..sb + inner * esz]);
            } else {
                for i in 0..inner {
                    let sb = (soff + i * inner_step) * esz;
                    let db = (doff + i) * esz;
                    self.bytes[db..db + esz].copy_from_slice(&src.bytes[sb..sb + esz]);
                }
            }

            // advance the odometer
            let mut d = n - 1;
            loop {
                if d == 0 {
                    return Ok(());
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < counts[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    /// Extract a (possibly strided) region into a fresh contiguous array.
    pub fn extract(&self, region: &Region) -> Result<ArrayData> {
        let mut out = ArrayData::zeroed(self.dtype, &region.shape());
        let zeros = vec![0usize; region.spans().len()];
        out.copy_strided_from(&zeros, self, region)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::slice::{AxisSpan, Region};

    #[test]
    fn elem_type_sizes_and_codes_round_trip() {
        use strum::IntoEnumIterator;

        for t in ElemType::iter() {
            assert_eq!(ElemType::from_code(t as u8), Some(t));
            assert_eq!(t.default_fill().len(), t.size());
        }
    }

    #[test]
    fn fill_with_writes_every_element() {
        let mut a = ArrayData::zeroed(ElemType::F32, &[2, 3]);
        a.fill_with(&1.5f32.to_le_bytes());
        assert_eq!(a.as_slice::<f32>(), &[1.5; 6]);
    }

    #[test]
    fn copy_region_unit_stride() {
        let src = ArrayData::from_elems(
            ElemType::I32,
            &[3, 3],
            &[0i32, 1, 2, 3, 4, 5, 6, 7, 8],
        )
        .unwrap();
        let mut dst = ArrayData::zeroed(ElemType::I32, &[2, 2]);
        let region = Region::new(vec![
            AxisSpan {
                start: 1,
                count: 2,
                step: 1,
            },
            AxisSpan {
                start: 1,
                count: 2,
                step: 1,
            },
        ]);
        dst.copy_strided_from(&[0, 0], &src, &region).unwrap();
        assert_eq!(dst.as_slice::<i32>(), &[4, 5, 7, 8]);
    }

    #[test]
    fn copy_region_with_step() {
        let src =
            ArrayData::from_elems(ElemType::I32, &[1, 6], &[0i32, 1, 2, 3, 4, 5]).unwrap();
        let mut dst = ArrayData::zeroed(ElemType::I32, &[1, 3]);
        let region = Region::new(vec![
            AxisSpan {
                start: 0,
                count: 1,
                step: 1,
            },
            AxisSpan {
                start: 0,
                count: 3,
                step: 2,
            },
        ]);
        dst.copy_strided_from(&[0, 0], &src, &region).unwrap();
        assert_eq!(dst.as_slice::<i32>(), &[0, 2, 4]);
    }

    #[test]
    fn extract_matches_manual_copy() {
        let src = ArrayData::from_elems(
            ElemType::F64,
            &[4, 4],
            &(0..16).map(|v| v as f64).collect::<Vec<_>>(),
        )
        .unwrap();
        let region = Region::from_bounds(&[(1, 3), (2, 4)]);
        let out = src.extract(&region).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.as_slice::<f64>(), &[6.0, 7.0, 10.0, 11.0]);
    }
}
