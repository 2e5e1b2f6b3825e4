//! The built-in structured-file codec
//!
//! A [BinFile] keeps the whole file materialized in memory as a group tree
//! and serializes it to its byte stream on flush: the format magic, a
//! container tag, then the root group encoded recursively with little-endian
//! fields. Masters hold metadata only and subarrays hold one tile, so full
//! materialization is the intended working set.

use std::collections::BTreeMap;

use log::debug;

use crate::{
    error::{Error, Result},
    format::{detect_format, OpenOptions, StorageFormat, StructuredFile, StructuredOpener, VarMeta},
    stream::{ByteStore, ByteStream},
    types::{ArrayData, AttrValue, ElemType},
    uri::ObjectUri,
};

const CONTAINER_TAG: &[u8; 4] = b"CFB1";

#[derive(Debug, Clone, Default)]
struct Node {
    attrs: BTreeMap<String, AttrValue>,
    dims: BTreeMap<String, DimNode>,
    vars: BTreeMap<String, VarNode>,
    groups: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, Copy)]
struct DimNode {
    /// Declared length; `None` marks the dimension unlimited.
    declared: Option<usize>,
    /// Current length; for fixed dimensions this equals the declaration.
    current: usize,
}

#[derive(Debug, Clone)]
struct VarNode {
    dtype: ElemType,
    dims: Vec<String>,
    fill: Vec<u8>,
    attrs: BTreeMap<String, AttrValue>,
    data: ArrayData,
}

/// The default [StructuredFile] implementation
pub struct BinFile {
    uri: String,
    format: StorageFormat,
    root: Node,
    stream: Option<Box<dyn ByteStream>>,
    diskless: bool,
    persist: bool,
    dirty: bool,
}

impl BinFile {
    /// Create an empty file of the given format over a byte stream.
    pub fn create(
        stream: Box<dyn ByteStream>,
        uri: &str,
        format: StorageFormat,
        opts: &OpenOptions,
    ) -> Self {
        BinFile {
            uri: uri.to_string(),
            format,
            root: Node::default(),
            stream: Some(stream),
            diskless: opts.diskless,
            persist: opts.persist,
            dirty: true,
        }
    }

    /// Open an existing file, materializing it from its stream.
    pub fn open(mut stream: Box<dyn ByteStream>, uri: &str) -> Result<Self> {
        let bytes = stream.read_all()?;
        let mut file = Self::from_bytes(&bytes, uri)?;
        file.stream = Some(stream);
        Ok(file)
    }

    /// Parse a file from raw bytes without keeping a backing stream.
    pub fn from_bytes(bytes: &[u8], uri: &str) -> Result<Self> {
        let (format, magic_len) = detect_format(bytes, uri)?;
        let mut reader = ByteReader::new(&bytes[magic_len..], uri);
        let tag = reader.take(4)?;
        if tag != CONTAINER_TAG {
            return Err(Error::corrupt(uri, "missing container tag"));
        }
        let root = decode_node(&mut reader)?;
        Ok(BinFile {
            uri: uri.to_string(),
            format,
            root,
            stream: None,
            diskless: false,
            persist: false,
            dirty: false,
        })
    }

    /// Serialize the file to its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.buf.extend_from_slice(self.format.magic());
        w.buf.extend_from_slice(CONTAINER_TAG);
        encode_node(&mut w, &self.root);
        w.buf
    }

    fn node(&self, path: &str) -> Result<&Node> {
        let mut node = &self.root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.groups.get(seg).ok_or_else(|| Error::NotFound {
                kind: "group",
                name: path.to_string(),
            })?;
        }
        Ok(node)
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut Node> {
        let mut node = &mut self.root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.groups.get_mut(seg).ok_or_else(|| Error::NotFound {
                kind: "group",
                name: path.to_string(),
            })?;
        }
        Ok(node)
    }

    fn var(&self, group: &str, name: &str) -> Result<&VarNode> {
        self.node(group)?.vars.get(name).ok_or_else(|| Error::NotFound {
            kind: "variable",
            name: name.to_string(),
        })
    }

    fn var_mut(&mut self, group: &str, name: &str) -> Result<&mut VarNode> {
        self.node_mut(group)?
            .vars
            .get_mut(name)
            .ok_or_else(|| Error::NotFound {
                kind: "variable",
                name: name.to_string(),
            })
    }
}

impl StructuredFile for BinFile {
    fn format(&self) -> StorageFormat {
        self.format
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_group(&mut self, path: &str) -> Result<()> {
        if !path.is_empty() && !self.format.hierarchical() {
            return Err(Error::FormatMismatch {
                format: self.format.to_string(),
                convention: "groups".to_string(),
            });
        }
        let mut node = &mut self.root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.groups.entry(seg.to_string()).or_default();
        }
        self.dirty = true;
        Ok(())
    }

    fn group_names(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.node(path)?.groups.keys().cloned().collect())
    }

    fn has_group(&self, path: &str) -> bool {
        self.node(path).is_ok()
    }

    fn create_dimension(&mut self, group: &str, name: &str, len: Option<usize>) -> Result<()> {
        let node = self.node_mut(group)?;
        if node.dims.contains_key(name) {
            return Err(Error::NameCollision {
                kind: "dimension",
                name: name.to_string(),
            });
        }
        node.dims.insert(
            name.to_string(),
            DimNode {
                declared: len,
                current: len.unwrap_or(0),
            },
        );
        self.dirty = true;
        Ok(())
    }

    fn dimensions(&self, group: &str) -> Result<Vec<(String, Option<usize>, usize)>> {
        Ok(self
            .node(group)?
            .dims
            .iter()
            .map(|(name, dim)| (name.clone(), dim.declared, dim.current))
            .collect())
    }

    fn create_variable(
        &mut self,
        group: &str,
        name: &str,
        dtype: ElemType,
        dims: &[String],
        fill: Option<&[u8]>,
    ) -> Result<()> {
        let node = self.node_mut(group)?;
        if node.vars.contains_key(name) {
            return Err(Error::NameCollision {
                kind: "variable",
                name: name.to_string(),
            });
        }
        let mut shape = Vec::with_capacity(dims.len());
        for (i, dim_name) in dims.iter().enumerate() {
            let dim = node.dims.get(dim_name).ok_or_else(|| Error::NotFound {
                kind: "dimension",
                name: dim_name.clone(),
            })?;
            match dim.declared {
                Some(len) => shape.push(len),
                None if i == 0 => shape.push(0),
                None => {
                    return Err(Error::UnlimitedNotFirst {
                        variable: name.to_string(),
                    })
                }
            }
        }
        let fill = fill.map(<[u8]>::to_vec).unwrap_or_else(|| dtype.default_fill());
        let data = ArrayData::filled(dtype, &shape, &fill);
        node.vars.insert(
            name.to_string(),
            VarNode {
                dtype,
                dims: dims.to_vec(),
                fill,
                attrs: BTreeMap::new(),
                data,
            },
        );
        self.dirty = true;
        Ok(())
    }

    fn variable_names(&self, group: &str) -> Result<Vec<String>> {
        Ok(self.node(group)?.vars.keys().cloned().collect())
    }

    fn variable_meta(&self, group: &str, name: &str) -> Result<VarMeta> {
        let var = self.var(group, name)?;
        Ok(VarMeta {
            dtype: var.dtype,
            dims: var.dims.clone(),
            shape: var.data.shape().to_vec(),
            fill: var.fill.clone(),
        })
    }

    fn rename_variable(&mut self, group: &str, old: &str, new: &str) -> Result<()> {
        let node = self.node_mut(group)?;
        if node.vars.contains_key(new) {
            return Err(Error::NameCollision {
                kind: "variable",
                name: new.to_string(),
            });
        }
        let var = node.vars.remove(old).ok_or_else(|| Error::NotFound {
            kind: "variable",
            name: old.to_string(),
        })?;
        node.vars.insert(new.to_string(), var);
        self.dirty = true;
        Ok(())
    }

    fn write_slab(
        &mut self,
        group: &str,
        var: &str,
        origin: &[usize],
        data: &ArrayData,
    ) -> Result<()> {
        let unlimited_axis0 = {
            let node = self.node(group)?;
            let v = node.vars.get(var).ok_or_else(|| Error::NotFound {
                kind: "variable",
                name: var.to_string(),
            })?;
            v.dims
                .first()
                .and_then(|d| node.dims.get(d))
                .is_some_and(|d| d.declared.is_none())
        };

        let v = self.var_mut(group, var)?;
        let rank = v.data.shape().len();
        if origin.len() != rank || data.shape().len() != rank {
            return Err(Error::SlabOutOfBounds {
                variable: var.to_string(),
            });
        }
        if data.dtype() != v.dtype {
            return Err(Error::ElementTypeMismatch {
                expected: v.dtype.to_string(),
                actual: data.dtype().to_string(),
            });
        }
        for d in 0..rank {
            let end = origin[d] + data.shape()[d];
            if end > v.data.shape()[d] && !(d == 0 && unlimited_axis0) {
                return Err(Error::SlabOutOfBounds {
                    variable: var.to_string(),
                });
            }
        }

        // Grow an unlimited record axis by appending fill-valued rows.
        if rank > 0 && unlimited_axis0 {
            let needed = origin[0] + data.shape()[0];
            if needed > v.data.shape()[0] {
                let mut shape = v.data.shape().to_vec();
                let row: usize = shape[1..].iter().product::<usize>() * v.dtype.size();
                let mut bytes = std::mem::replace(&mut v.data, ArrayData::zeroed(v.dtype, &[0]))
                    .into_bytes();
                let old_rows = shape[0];
                bytes.reserve((needed - old_rows) * row);
                for _ in old_rows..needed {
                    let mut filled = vec![0u8; row];
                    for chunk in filled.chunks_exact_mut(v.fill.len().max(1)) {
                        chunk.copy_from_slice(&v.fill);
                    }
                    bytes.extend_from_slice(&filled);
                }
                shape[0] = needed;
                v.data = ArrayData::from_bytes(v.dtype, &shape, bytes)?;
            }
        }

        let src_region = crate::slice::Region::from_bounds(
            &data.shape().iter().map(|&c| (0, c)).collect::<Vec<_>>(),
        );
        v.data.copy_strided_from(origin, data, &src_region)?;

        if unlimited_axis0 && rank > 0 {
            let current = v.data.shape()[0];
            let dim_name = v.dims[0].clone();
            let node = self.node_mut(group)?;
            if let Some(dim) = node.dims.get_mut(&dim_name) {
                dim.current = dim.current.max(current);
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn read_slab(&self, group: &str, var: &str, bounds: &[(usize, usize)]) -> Result<ArrayData> {
        let v = self.var(group, var)?;
        let shape = v.data.shape();
        if bounds.len() != shape.len() {
            return Err(Error::SlabOutOfBounds {
                variable: var.to_string(),
            });
        }
        for (d, &(start, end)) in bounds.iter().enumerate() {
            if start > end || end > shape[d] {
                return Err(Error::SlabOutOfBounds {
                    variable: var.to_string(),
                });
            }
        }
        v.data.extract(&crate::slice::Region::from_bounds(bounds))
    }

    fn set_attr(
        &mut self,
        group: &str,
        var: Option<&str>,
        name: &str,
        value: AttrValue,
    ) -> Result<()> {
        let attrs = match var {
            Some(var) => &mut self.var_mut(group, var)?.attrs,
            None => &mut self.node_mut(group)?.attrs,
        };
        attrs.insert(name.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    fn get_attr(&self, group: &str, var: Option<&str>, name: &str) -> Result<Option<AttrValue>> {
        let attrs = match var {
            Some(var) => &self.var(group, var)?.attrs,
            None => &self.node(group)?.attrs,
        };
        Ok(attrs.get(name).cloned())
    }

    fn del_attr(&mut self, group: &str, var: Option<&str>, name: &str) -> Result<()> {
        let attrs = match var {
            Some(var) => &mut self.var_mut(group, var)?.attrs,
            None => &mut self.node_mut(group)?.attrs,
        };
        attrs.remove(name).ok_or(Error::AttributeMissing {
            name: name.to_string(),
        })?;
        self.dirty = true;
        Ok(())
    }

    fn attr_names(&self, group: &str, var: Option<&str>) -> Result<Vec<String>> {
        let attrs = match var {
            Some(var) => &self.var(group, var)?.attrs,
            None => &self.node(group)?.attrs,
        };
        Ok(attrs.keys().cloned().collect())
    }

    fn size_hint(&self) -> usize {
        fn node_size(node: &Node) -> usize {
            let vars: usize = node
                .vars
                .values()
                .map(|v| v.data.bytes().len() + 256)
                .sum();
            let groups: usize = node.groups.values().map(node_size).sum();
            vars + groups + 512
        }
        node_size(&self.root)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.diskless && !self.persist {
            debug!("diskless file {} not persisted", self.uri);
            self.dirty = false;
            return Ok(());
        }
        let bytes = self.to_bytes();
        let stream = self.stream.as_mut().ok_or(Error::ReadOnly)?;
        debug!("flushing {} ({} bytes)", self.uri, bytes.len());
        stream.close(Some(&bytes))?;
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(mut stream) = self.stream.take() {
            stream.close(None)?;
        }
        Ok(())
    }
}

/// Default [StructuredOpener] producing [BinFile]s
#[derive(Debug, Clone, Copy, Default)]
pub struct BinFileOpener;

impl StructuredOpener for BinFileOpener {
    fn create(
        &self,
        store: &dyn ByteStore,
        uri: &ObjectUri,
        format: StorageFormat,
        opts: &OpenOptions,
    ) -> Result<Box<dyn StructuredFile>> {
        let stream = store.create(uri, opts.clobber)?;
        Ok(Box::new(BinFile::create(
            stream,
            &uri.to_string(),
            format,
            opts,
        )))
    }

    fn open(&self, store: &dyn ByteStore, uri: &ObjectUri) -> Result<Box<dyn StructuredFile>> {
        let stream = store.open(uri)?;
        Ok(Box::new(BinFile::open(stream, &uri.to_string())?))
    }
}

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn put_bytes(&mut self, b: &[u8]) {
        self.put_u64(b.len() as u64);
        self.buf.extend_from_slice(b);
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    uri: &'a str,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8], uri: &'a str) -> Self {
        ByteReader { data, pos: 0, uri }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::corrupt(self.uri, "unexpected end of data"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_str(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::corrupt(self.uri, "invalid utf-8 string"))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

const ATTR_TEXT: u8 = 1;
const ATTR_TEXT_LIST: u8 = 2;
const ATTR_INT: u8 = 3;
const ATTR_INT_LIST: u8 = 4;
const ATTR_FLOAT: u8 = 5;
const ATTR_FLOAT_LIST: u8 = 6;

fn encode_attr(w: &mut ByteWriter, value: &AttrValue) {
    match value {
        AttrValue::Text(s) => {
            w.put_u8(ATTR_TEXT);
            w.put_str(s);
        }
        AttrValue::TextList(list) => {
            w.put_u8(ATTR_TEXT_LIST);
            w.put_u32(list.len() as u32);
            for s in list {
                w.put_str(s);
            }
        }
        AttrValue::Int(v) => {
            w.put_u8(ATTR_INT);
            w.put_i64(*v);
        }
        AttrValue::IntList(list) => {
            w.put_u8(ATTR_INT_LIST);
            w.put_u32(list.len() as u32);
            for v in list {
                w.put_i64(*v);
            }
        }
        AttrValue::Float(v) => {
            w.put_u8(ATTR_FLOAT);
            w.put_f64(*v);
        }
        AttrValue::FloatList(list) => {
            w.put_u8(ATTR_FLOAT_LIST);
            w.put_u32(list.len() as u32);
            for v in list {
                w.put_f64(*v);
            }
        }
    }
}

fn decode_attr(r: &mut ByteReader) -> Result<AttrValue> {
    let tag = r.take_u8()?;
    Ok(match tag {
        ATTR_TEXT => AttrValue::Text(r.take_str()?),
        ATTR_TEXT_LIST => {
            let count = r.take_u32()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(r.take_str()?);
            }
            AttrValue::TextList(list)
        }
        ATTR_INT => AttrValue::Int(r.take_i64()?),
        ATTR_INT_LIST => {
            let count = r.take_u32()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(r.take_i64()?);
            }
            AttrValue::IntList(list)
        }
        ATTR_FLOAT => AttrValue::Float(r.take_f64()?),
        ATTR_FLOAT_LIST => {
            let count = r.take_u32()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(r.take_f64()?);
            }
            AttrValue::FloatList(list)
        }
        _ => return Err(Error::corrupt(r.uri, format!("unknown attribute tag {tag}"))),
    })
}

fn encode_attrs(w: &mut ByteWriter, attrs: &BTreeMap<String, AttrValue>) {
    w.put_u32(attrs.len() as u32);
    for (name, value) in attrs {
        w.put_str(name);
        encode_attr(w, value);
    }
}

fn decode_attrs(r: &mut ByteReader) -> Result<BTreeMap<String, AttrValue>> {
    let count = r.take_u32()? as usize;
    let mut attrs = BTreeMap::new();
    for _ in 0..count {
        let name = r.take_str()?;
        attrs.insert(name, decode_attr(r)?);
    }
    Ok(attrs)
}

fn encode_node(w: &mut ByteWriter, node: &Node) {
    encode_attrs(w, &node.attrs);

    w.put_u32(node.dims.len() as u32);
    for (name, dim) in &node.dims {
        w.put_str(name);
        w.put_u8(dim.declared.is_none() as u8);
        w.put_u64(dim.declared.unwrap_or(0) as u64);
        w.put_u64(dim.current as u64);
    }

    w.put_u32(node.vars.len() as u32);
    for (name, var) in &node.vars {
        w.put_str(name);
        w.put_u8(var.dtype as u8);
        w.put_u32(var.dims.len() as u32);
        for dim in &var.dims {
            w.put_str(dim);
        }
        w.put_u32(var.fill.len() as u32);
        w.buf.extend_from_slice(&var.fill);
        for &len in var.data.shape() {
            w.put_u64(len as u64);
        }
        w.put_bytes(var.data.bytes());
        encode_attrs(w, &var.attrs);
    }

    w.put_u32(node.groups.len() as u32);
    for (name, group) in &node.groups {
        w.put_str(name);
        encode_node(w, group);
    }
}

fn decode_node(r: &mut ByteReader) -> Result<Node> {
    let attrs = decode_attrs(r)?;

    let dim_count = r.take_u32()? as usize;
    let mut dims = BTreeMap::new();
    for _ in 0..dim_count {
        let name = r.take_str()?;
        let unlimited = r.take_u8()? != 0;
        let declared = r.take_u64()? as usize;
        let current = r.take_u64()? as usize;
        dims.insert(
            name,
            DimNode {
                declared: (!unlimited).then_some(declared),
                current,
            },
        );
    }

    let var_count = r.take_u32()? as usize;
    let mut vars = BTreeMap::new();
    for _ in 0..var_count {
        let name = r.take_str()?;
        let dtype = ElemType::from_code(r.take_u8()?)
            .ok_or_else(|| Error::corrupt(r.uri, "unknown element type"))?;
        let ndims = r.take_u32()? as usize;
        let mut var_dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            var_dims.push(r.take_str()?);
        }
        let fill_len = r.take_u32()? as usize;
        let fill = r.take(fill_len)?.to_vec();
        let mut shape = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            shape.push(r.take_u64()? as usize);
        }
        let bytes = r.take_bytes()?;
        let data = ArrayData::from_bytes(dtype, &shape, bytes)
            .map_err(|_| Error::corrupt(r.uri, "variable data length mismatch"))?;
        let attrs = decode_attrs(r)?;
        vars.insert(
            name,
            VarNode {
                dtype,
                dims: var_dims,
                fill,
                attrs,
                data,
            },
        );
    }

    let group_count = r.take_u32()? as usize;
    let mut groups = BTreeMap::new();
    for _ in 0..group_count {
        let name = r.take_str()?;
        groups.insert(name, decode_node(r)?);
    }

    Ok(Node {
        attrs,
        dims,
        vars,
        groups,
    })
}
