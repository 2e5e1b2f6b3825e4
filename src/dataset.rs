//! Aggregated datasets: the master-file-level object
//!
//! A [Dataset] owns its group tree, the master [StructuredFile], and the
//! [FileManager] holding open subarray files. Variables are classical
//! (stored inline in the master) or partitioned (sharded across subarray
//! files); the caller's choice of `subarray_shape` or `max_subarray_size`
//! at variable creation decides which.
//!
//! A dataset is single-threaded: one slice operation runs at a time and all
//! I/O it issues completes before the call returns. Durability to a remote
//! backend is only guaranteed after [Dataset::close].

use std::{str::FromStr, sync::Arc};

use log::{info, warn};
use strum::{Display, EnumString, VariantNames};

use crate::{
    config::{DatasetOptions, HostConfig, VariableSpec},
    convention::{self, is_convention_attr, ConventionVersion},
    dimension::Dimension,
    error::{Error, Result},
    file_manager::{FileManager, FileState, OpenMode},
    format::{BinFileOpener, StorageFormat, StructuredFile, StructuredOpener},
    group::{Group, ROOT_GROUP},
    partition::{choose_tile_shape, TileSpec},
    slice::{normalize, output_shape, AxisSpan, Region, Slice},
    stream::ByteStore,
    types::{ArrayData, AttrValue, ElemType},
    uri::ObjectUri,
    variable::{VarKind, Variable},
};

/// Dataset-level file formats
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[non_exhaustive]
pub enum DatasetFormat {
    /// Classic flat master, no aggregation
    #[strum(serialize = "classical")]
    Classic,
    /// 64-bit-offset flat master, no aggregation
    #[strum(serialize = "64bit")]
    Offset64,
    /// 64-bit-data flat master, no aggregation
    #[strum(serialize = "64bit-data")]
    Data64,
    /// Hierarchical master, no aggregation
    #[strum(serialize = "hdf-based")]
    Hdf,
    /// Aggregated master over classic subarrays
    #[strum(serialize = "aggregated-classical")]
    AggregatedClassic,
    /// Aggregated master over hierarchical subarrays
    #[strum(serialize = "aggregated-hdf")]
    AggregatedHdf,
    /// Alias for `aggregated-hdf`
    #[default]
    #[strum(serialize = "default")]
    Default,
}

impl DatasetFormat {
    /// Resolve the `default` alias.
    pub fn resolve(self) -> DatasetFormat {
        match self {
            DatasetFormat::Default => DatasetFormat::AggregatedHdf,
            other => other,
        }
    }

    /// Storage format of the master file.
    pub fn storage_format(self) -> StorageFormat {
        match self.resolve() {
            DatasetFormat::Classic | DatasetFormat::AggregatedClassic => StorageFormat::Classic,
            DatasetFormat::Offset64 => StorageFormat::Offset64,
            DatasetFormat::Data64 => StorageFormat::Data64,
            DatasetFormat::Hdf | DatasetFormat::AggregatedHdf => StorageFormat::Hdf,
            DatasetFormat::Default => unreachable!(),
        }
    }

    /// Storage format used for subarray files.
    pub fn subarray_format(self) -> StorageFormat {
        match self.resolve() {
            DatasetFormat::AggregatedClassic => StorageFormat::Classic,
            _ => StorageFormat::Hdf,
        }
    }
}

/// The master-file-level object: groups, dimensions, variables, conventions
pub struct Dataset {
    uri: ObjectUri,
    mode: OpenMode,
    format: DatasetFormat,
    convention: ConventionVersion,
    master: Box<dyn StructuredFile>,
    root: Group,
    fm: FileManager,
    closed: bool,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("uri", &self.uri)
            .field("mode", &self.mode)
            .field("format", &self.format)
            .field("convention", &self.convention)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Dataset {
    /// Open or create a dataset, matching the documented entry point:
    /// `open(uri, mode, format, convention_version, options)`.
    pub fn open_with(
        store: Arc<dyn ByteStore>,
        uri: &str,
        mode: &str,
        format: DatasetFormat,
        convention_version: &str,
        options: DatasetOptions,
    ) -> Result<Self> {
        match OpenMode::from_str(mode)? {
            OpenMode::Read => Self::open(store, uri, options),
            OpenMode::Write => {
                let convention = ConventionVersion::from_str(convention_version)?;
                Self::create(store, uri, format, convention, options)
            }
        }
    }

    /// Create a dataset for writing.
    pub fn create(
        store: Arc<dyn ByteStore>,
        uri: &str,
        format: DatasetFormat,
        convention: ConventionVersion,
        options: DatasetOptions,
    ) -> Result<Self> {
        let format = format.resolve();
        if convention == ConventionVersion::V05 && !format.storage_format().hierarchical() {
            return Err(Error::FormatMismatch {
                format: format.to_string(),
                convention: convention.to_string(),
            });
        }

        let uri = ObjectUri::parse(uri);
        let opener = BinFileOpener;
        let master = opener.create(
            store.as_ref(),
            &uri,
            format.storage_format(),
            &options.open_options(),
        )?;

        let host = HostConfig::load().unwrap_or_default();
        let fm = FileManager::new(
            store,
            Box::new(BinFileOpener),
            Some(options.effective_memory_limit(&host)),
            options.open_options(),
        );
        info!("created dataset {} ({format}, {convention})", uri);
        Ok(Dataset {
            uri,
            mode: OpenMode::Write,
            format,
            convention,
            master,
            root: Group::new(ROOT_GROUP),
            fm,
            closed: false,
        })
    }

    /// Open an existing dataset read-only, detecting format and convention.
    pub fn open(store: Arc<dyn ByteStore>, uri: &str, options: DatasetOptions) -> Result<Self> {
        let uri = ObjectUri::parse(uri);
        let opener = BinFileOpener;
        let master = opener.open(store.as_ref(), &uri)?;

        let (version, root) = convention::read_master(master.as_ref())?;
        if version == Some(ConventionVersion::V05) && !master.format().hierarchical() {
            return Err(Error::FormatMismatch {
                format: master.format().to_string(),
                convention: ConventionVersion::V05.to_string(),
            });
        }
        let format = match (master.format(), version.is_some()) {
            (StorageFormat::Classic, true) => DatasetFormat::AggregatedClassic,
            (StorageFormat::Classic, false) => DatasetFormat::Classic,
            (StorageFormat::Offset64, _) => DatasetFormat::Offset64,
            (StorageFormat::Data64, _) => DatasetFormat::Data64,
            (StorageFormat::Hdf, true) => DatasetFormat::AggregatedHdf,
            (StorageFormat::Hdf, false) => DatasetFormat::Hdf,
        };

        let host = HostConfig::load().unwrap_or_default();
        let fm = FileManager::new(
            store,
            Box::new(BinFileOpener),
            Some(options.effective_memory_limit(&host)),
            options.open_options(),
        );
        info!("opened dataset {} ({format})", uri);
        Ok(Dataset {
            uri,
            mode: OpenMode::Read,
            format,
            convention: version.unwrap_or_default(),
            master,
            root,
            fm,
            closed: false,
        })
    }

    pub fn uri(&self) -> &ObjectUri {
        &self.uri
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn format(&self) -> DatasetFormat {
        self.format
    }

    pub fn convention(&self) -> ConventionVersion {
        self.convention
    }

    /// The synthetic root group.
    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn file_manager(&self) -> &FileManager {
        &self.fm
    }

    fn require_write(&self) -> Result<()> {
        match self.mode {
            OpenMode::Write => Ok(()),
            OpenMode::Read => Err(Error::ReadOnly),
        }
    }

    /// Create a child group under an existing parent path.
    pub fn create_group(&mut self, path: &str) -> Result<()> {
        self.require_write()?;
        let (parent, leaf) = match path.rsplit_once('/') {
            Some((parent, leaf)) => (parent, leaf),
            None => ("", path),
        };
        if leaf.is_empty() {
            return Err(Error::NotFound {
                kind: "group",
                name: path.to_string(),
            });
        }
        self.root.group_mut(parent)?.create_child(leaf)?;
        self.master.create_group(path)
    }

    /// Declare a dimension; `None` marks it unlimited.
    pub fn create_dimension(&mut self, group: &str, name: &str, len: Option<usize>) -> Result<()> {
        self.require_write()?;
        let node = self.root.group_mut(group)?;
        if node.dims.contains_key(name) {
            return Err(Error::NameCollision {
                kind: "dimension",
                name: name.to_string(),
            });
        }
        node.dims.insert(name.to_string(), Dimension::new(name, len));
        self.master.create_dimension(group, name, len)
    }

    pub fn dimension(&self, group: &str, name: &str) -> Result<&Dimension> {
        self.root.group(group)?.dimension(name)
    }

    /// Mutable access to a dimension, e.g. to set its attributes.
    pub fn dimension_mut(&mut self, group: &str, name: &str) -> Result<&mut Dimension> {
        self.require_write()?;
        self.root.group_mut(group)?.dimension_mut(name)
    }

    /// Create a variable. It is partitioned iff the spec carries a
    /// `subarray_shape` or a positive `max_subarray_size`.
    pub fn create_variable(
        &mut self,
        group: &str,
        name: &str,
        dtype: ElemType,
        dims: &[&str],
        spec: VariableSpec,
    ) -> Result<()> {
        self.require_write()?;
        let subarray_format = self.format.subarray_format();
        let node = self.root.group_mut(group)?;
        if node.vars.contains_key(name) {
            return Err(Error::NameCollision {
                kind: "variable",
                name: name.to_string(),
            });
        }
        let dim_names: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
        for dim in &dim_names {
            node.dimension(dim)?;
        }
        let fill = spec
            .fill_value
            .as_ref()
            .and_then(|v| v.to_elem_bytes(dtype))
            .unwrap_or_else(|| dtype.default_fill());

        let var = if spec.is_partitioned() {
            let mut shape = Vec::with_capacity(dim_names.len());
            let mut axes = Vec::with_capacity(dim_names.len());
            for dim in &dim_names {
                let dim = node.dimension(dim)?;
                shape.push(dim.len().ok_or_else(|| Error::UnlimitedUnsupported {
                    variable: name.to_string(),
                })?);
                axes.push(dim.axis());
            }
            let tile_spec = match &spec.subarray_shape {
                Some(shape) => TileSpec::Shape(shape.clone()),
                None => TileSpec::MaxBytes(spec.max_subarray_size),
            };
            let tile = choose_tile_shape(name, &shape, dtype.size(), &axes, &tile_spec)?;
            let matrix = crate::partition::PartitionMatrix::new(&shape, &tile);
            Variable::partitioned(name, dtype, dim_names, fill, matrix, subarray_format)
        } else {
            self.master
                .create_variable(group, name, dtype, &dim_names, Some(&fill))?;
            Variable::classical(name, dtype, dim_names, fill)
        };
        node.vars.insert(name.to_string(), var);
        Ok(())
    }

    /// A handle for slice and attribute operations on one variable.
    pub fn variable<'a>(&'a mut self, group: &str, name: &str) -> Result<VariableHandle<'a>> {
        self.root.group(group)?.variable(name)?;
        Ok(VariableHandle {
            ds: self,
            group: group.to_string(),
            name: name.to_string(),
        })
    }

    /// Set a group attribute (the empty path addresses the root group,
    /// i.e. the dataset itself).
    pub fn set_attr(&mut self, group: &str, name: &str, value: AttrValue) -> Result<()> {
        self.require_write()?;
        self.root
            .group_mut(group)?
            .attrs
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Get a group attribute, falling back to the backing file.
    pub fn get_attr(&self, group: &str, name: &str) -> Result<AttrValue> {
        if let Some(value) = self.root.group(group)?.attrs.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.master.get_attr(group, None, name)? {
            return Ok(value);
        }
        Err(Error::AttributeMissing {
            name: name.to_string(),
        })
    }

    pub fn del_attr(&mut self, group: &str, name: &str) -> Result<()> {
        self.require_write()?;
        self.root
            .group_mut(group)?
            .attrs
            .remove(name)
            .ok_or(Error::AttributeMissing {
                name: name.to_string(),
            })?;
        Ok(())
    }

    pub fn attr_names(&self, group: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.root.group(group)?.attrs.keys().cloned().collect();
        for name in self.master.attr_names(group, None)? {
            if !is_convention_attr(&name) && !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Enumerate a partitioned variable's subarray objects on the backing
    /// store, via wildcard listing.
    pub fn list_subarrays(&self, group: &str, name: &str) -> Result<Vec<String>> {
        let var = self.root.group(group)?.variable(name)?;
        let var_path = convention::join_path(group, name);
        let pattern = self
            .uri
            .subarray_pattern(&var_path, var.subarray_format().extension());
        self.fm.store().list(&pattern)
    }

    /// Serialize convention metadata into the master, then drain the
    /// file manager, flushing every open subarray.
    pub fn close(mut self) -> Result<()> {
        if self.mode == OpenMode::Write {
            convention::write_master(self.convention, &self.root, self.master.as_mut())?;
        }
        self.master.close()?;
        self.fm.close_all()?;
        self.closed = true;
        info!("closed dataset {}", self.uri);
        Ok(())
    }

    // ---- variable I/O -----------------------------------------------------

    fn var_write(&mut self, group: &str, name: &str, slices: &[Slice], data: &ArrayData) -> Result<()> {
        self.require_write()?;
        let (dtype, partitioned) = {
            let var = self.root.group(group)?.variable(name)?;
            (var.dtype(), var.is_partitioned())
        };
        if data.dtype() != dtype {
            return Err(Error::ElementTypeMismatch {
                expected: dtype.to_string(),
                actual: data.dtype().to_string(),
            });
        }
        if partitioned {
            self.write_partitioned(group, name, slices, data)
        } else {
            self.write_classical(group, name, slices, data)
        }
    }

    fn write_classical(
        &mut self,
        group: &str,
        name: &str,
        slices: &[Slice],
        data: &ArrayData,
    ) -> Result<()> {
        let meta = self.master.variable_meta(group, name)?;
        let mut shape = meta.shape.clone();
        // an unlimited record axis grows to cover an explicit stop bound
        let unlimited_axis0 = match meta.dims.first() {
            Some(dim) => self
                .root
                .group(group)?
                .dimension(dim)
                .map(Dimension::is_unlimited)
                .unwrap_or(false),
            None => false,
        };
        if unlimited_axis0 {
            if let Some(stop) = slices.first().and_then(|s| s.stop) {
                if stop > 0 && stop as usize > shape[0] {
                    shape[0] = stop as usize;
                }
            }
        }
        let spans = normalize(slices, &shape, true)?;
        if data.shape() != output_shape(&spans) {
            return Err(Error::ShapeMismatch {
                expected: output_shape(&spans),
                actual: data.shape().to_vec(),
            });
        }
        let starts: Vec<usize> = spans.iter().map(|s| s.start).collect();
        self.master.write_slab(group, name, &starts, data)
    }

    fn write_partitioned(
        &mut self,
        group: &str,
        name: &str,
        slices: &[Slice],
        data: &ArrayData,
    ) -> Result<()> {
        struct Plan {
            uri: ObjectUri,
            format: StorageFormat,
            in_variable: String,
            location: Vec<(usize, usize)>,
            tile_shape: Vec<usize>,
            source: Region,
            target: Region,
        }

        let var_path = convention::join_path(group, name);
        let master_uri = self.uri.clone();

        // Plan every affected tile first, assigning URIs to first-touched
        // tiles, so the I/O phase below borrows only the file manager and
        // the master.
        let (dtype, fill, dims, dim_has_var, plans) = {
            let node = self.root.group_mut(group)?;
            let dim_has_var: Vec<bool>;
            {
                let var = node.variable(name)?;
                dim_has_var = var
                    .dims()
                    .iter()
                    .map(|d| node.has_dimension_variable(d))
                    .collect();
            }
            let var = node.variable_mut(name)?;
            let dtype = var.dtype();
            let fill = var.fill().to_vec();
            let dims = var.dims().to_vec();
            let subarray_format = var.subarray_format();
            let matrix = var
                .matrix_mut()
                .ok_or_else(|| Error::InternalInvariant("classical variable in partitioned path".into()))?;

            let spans = normalize(slices, &matrix.shape().to_vec(), true)?;
            if data.shape() != output_shape(&spans) {
                return Err(Error::ShapeMismatch {
                    expected: output_shape(&spans),
                    actual: data.shape().to_vec(),
                });
            }

            let mut plans = Vec::new();
            for entry in matrix.entries_for(&spans) {
                let part = matrix.ensure_cell(&entry.tile, subarray_format, name);
                if part.file.is_none() {
                    part.file = Some(
                        master_uri
                            .subarray(&var_path, &entry.tile, part.format.extension())
                            .to_string(),
                    );
                }
                plans.push(Plan {
                    uri: ObjectUri::parse(part.file.as_ref().unwrap()),
                    format: part.format,
                    in_variable: part.in_variable.clone(),
                    location: part.location.clone(),
                    tile_shape: part.shape.clone(),
                    source: entry.source,
                    target: entry.target,
                });
            }
            (dtype, fill, dims, dim_has_var, plans)
        };

        for plan in plans {
            let projected = plan.tile_shape.iter().product::<usize>() * dtype.size() + 1024;
            let key = plan.uri.to_string();

            // dimension-coordinate slabs subset from the master at the
            // tile's location, for first-touch structure creation
            let mut dim_slabs: Vec<Option<ArrayData>> = Vec::with_capacity(dims.len());
            for (d, dim) in dims.iter().enumerate() {
                if dim_has_var[d] {
                    dim_slabs.push(Some(self.master.read_slab(group, dim, &[plan.location[d]])?));
                } else {
                    dim_slabs.push(None);
                }
            }

            let record = self
                .fm
                .request_file(&plan.uri, projected, OpenMode::Write, plan.format)?;
            let file = record.file_mut()?;
            if !file.variable_names("")?.contains(&plan.in_variable) {
                for (d, dim) in dims.iter().enumerate() {
                    file.create_dimension("", dim, Some(plan.tile_shape[d]))?;
                }
                for (d, dim) in dims.iter().enumerate() {
                    if let Some(slab) = &dim_slabs[d] {
                        file.create_variable("", dim, slab.dtype(), &[dim.clone()], None)?;
                        file.write_slab("", dim, &[0], slab)?;
                    }
                }
                file.create_variable("", &plan.in_variable, dtype, &dims, Some(&fill))?;
            }

            let slab = data.extract(&plan.target)?;
            file.write_slab("", &plan.in_variable, &plan.source.starts(), &slab)?;
            record.dirty = true;
            self.fm.refresh_size(&key)?;
        }
        Ok(())
    }

    fn var_read(&mut self, group: &str, name: &str, slices: &[Slice]) -> Result<ArrayData> {
        let partitioned = self.root.group(group)?.variable(name)?.is_partitioned();
        if partitioned {
            self.read_partitioned(group, name, slices)
        } else {
            self.read_classical(group, name, slices)
        }
    }

    fn read_classical(&mut self, group: &str, name: &str, slices: &[Slice]) -> Result<ArrayData> {
        let meta = self.master.variable_meta(group, name)?;
        let spans = normalize(slices, &meta.shape, false)?;
        let bounding: Vec<(usize, usize)> = spans.iter().map(|s| (s.start, s.end())).collect();
        let slab = self.master.read_slab(group, name, &bounding)?;
        if spans.iter().all(|s| s.step == 1) {
            return Ok(slab);
        }
        let rebased = Region::new(
            spans
                .iter()
                .map(|s| AxisSpan {
                    start: 0,
                    count: s.count,
                    step: s.step,
                })
                .collect(),
        );
        slab.extract(&rebased)
    }

    fn read_partitioned(&mut self, group: &str, name: &str, slices: &[Slice]) -> Result<ArrayData> {
        struct Plan {
            uri: ObjectUri,
            format: StorageFormat,
            in_variable: String,
            tile_bytes: usize,
            source: Region,
            target: Region,
        }

        let (dtype, fill, plans, out_shape) = {
            let var = self.root.group(group)?.variable(name)?;
            let matrix = var
                .matrix()
                .ok_or_else(|| Error::InternalInvariant("classical variable in partitioned path".into()))?;
            let spans = normalize(slices, matrix.shape(), false)?;
            let out_shape = output_shape(&spans);

            let mut plans = Vec::new();
            for entry in matrix.entries_for(&spans) {
                let Some(part) = matrix.cell(&entry.tile) else {
                    continue;
                };
                let Some(file) = &part.file else {
                    continue;
                };
                plans.push(Plan {
                    uri: ObjectUri::parse(file),
                    format: part.format,
                    in_variable: part.in_variable.clone(),
                    tile_bytes: part.shape.iter().product::<usize>() * var.dtype().size() + 1024,
                    source: entry.source,
                    target: entry.target,
                });
            }
            (var.dtype(), var.fill().to_vec(), plans, out_shape)
        };

        let mut result = self.fm.request_array(&out_shape, dtype, Some(&fill));
        for plan in plans {
            let record = self
                .fm
                .request_file(&plan.uri, plan.tile_bytes, OpenMode::Read, plan.format)?;
            if record.state == FileState::DoesNotExist {
                // tile never landed on the backing store: leave the fill
                continue;
            }
            let file = record.file()?;
            let slab = file.read_slab("", &plan.in_variable, &plan.source.bounding())?;
            let rebased = Region::new(
                plan.source
                    .spans()
                    .iter()
                    .map(|s| AxisSpan {
                        start: 0,
                        count: s.count,
                        step: s.step,
                    })
                    .collect(),
            );
            result.copy_strided_from(&plan.target.starts(), &slab, &rebased)?;
        }
        Ok(result)
    }

    fn var_rename(&mut self, group: &str, old: &str, new: &str) -> Result<()> {
        self.require_write()?;
        let node = self.root.group_mut(group)?;
        if node.vars.contains_key(new) {
            return Err(Error::NameCollision {
                kind: "variable",
                name: new.to_string(),
            });
        }
        let mut var = node.vars.remove(old).ok_or_else(|| Error::NotFound {
            kind: "variable",
            name: old.to_string(),
        })?;
        var.set_name(new);
        let classical = matches!(var.kind(), VarKind::Classical);
        node.vars.insert(new.to_string(), var);
        if classical {
            // classical renames delegate to the provider; partitioned ones
            // are in-memory until the serializer writes the new name
            self.master.rename_variable(group, old, new)?;
        }
        Ok(())
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if !self.closed && self.mode == OpenMode::Write {
            warn!("dataset {} dropped without close; unflushed data is lost", self.uri);
        }
    }
}

/// Borrowed access to one variable of a dataset
pub struct VariableHandle<'a> {
    ds: &'a mut Dataset,
    group: String,
    name: String,
}

impl VariableHandle<'_> {
    fn var(&self) -> Result<&Variable> {
        self.ds.root.group(&self.group)?.variable(&self.name)
    }

    pub fn dtype(&self) -> Result<ElemType> {
        Ok(self.var()?.dtype())
    }

    /// Fill value as element bytes.
    pub fn fill_value(&self) -> Result<Vec<u8>> {
        Ok(self.var()?.fill().to_vec())
    }

    pub fn is_partitioned(&self) -> Result<bool> {
        Ok(self.var()?.is_partitioned())
    }

    /// The variable's logical shape.
    pub fn shape(&self) -> Result<Vec<usize>> {
        let var = self.var()?;
        match var.kind() {
            VarKind::Partitioned(matrix) => Ok(matrix.shape().to_vec()),
            VarKind::Classical => Ok(self
                .ds
                .master
                .variable_meta(&self.group, &self.name)?
                .shape),
        }
    }

    /// Write `data` into the region selected by `slices`.
    pub fn write(&mut self, slices: &[Slice], data: &ArrayData) -> Result<()> {
        self.ds.var_write(&self.group, &self.name, slices, data)
    }

    /// Read the region selected by `slices` into a fresh buffer. Regions no
    /// write has reached hold the fill value.
    pub fn read(&mut self, slices: &[Slice]) -> Result<ArrayData> {
        self.ds.var_read(&self.group, &self.name, slices)
    }

    /// Set an attribute in the in-memory overlay; the backing file is only
    /// touched at dataset close.
    pub fn set_attr(&mut self, name: &str, value: AttrValue) -> Result<()> {
        self.ds.require_write()?;
        let var = self
            .ds
            .root
            .group_mut(&self.group)?
            .variable_mut(&self.name)?;
        var.attrs.insert(name.to_string(), value);
        Ok(())
    }

    /// Get an attribute, falling back from the overlay to the backing file.
    pub fn get_attr(&self, name: &str) -> Result<AttrValue> {
        if let Some(value) = self.var()?.attrs().get(name) {
            return Ok(value.clone());
        }
        // in write mode a partitioned variable reaches the master only at
        // close, so a failed backing lookup is a miss, not an error
        if let Ok(Some(value)) = self.ds.master.get_attr(&self.group, Some(&self.name), name) {
            return Ok(value);
        }
        Err(Error::AttributeMissing {
            name: name.to_string(),
        })
    }

    pub fn del_attr(&mut self, name: &str) -> Result<()> {
        self.ds.require_write()?;
        let var = self
            .ds
            .root
            .group_mut(&self.group)?
            .variable_mut(&self.name)?;
        var.attrs.remove(name).ok_or(Error::AttributeMissing {
            name: name.to_string(),
        })?;
        Ok(())
    }

    /// Attribute names from the overlay and the backing file, convention
    /// markers excluded.
    pub fn attr_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.var()?.attrs().keys().cloned().collect();
        if let Ok(backing) = self.ds.master.attr_names(&self.group, Some(&self.name)) {
            for name in backing {
                if !is_convention_attr(&name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Rename the variable. Only in-memory state changes for partitioned
    /// variables; subarray files keep recording the original name.
    pub fn rename(mut self, new_name: &str) -> Result<()> {
        self.ds.var_rename(&self.group, &self.name, new_name)?;
        self.name = new_name.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{format::BinFile, stream::MemoryStore};

    const MASTER: &str = "s3://host/bucket/data/m.nc";

    fn ones(shape: &[usize]) -> ArrayData {
        let count: usize = shape.iter().product();
        ArrayData::from_elems(ElemType::F32, shape, &vec![1.0f32; count]).unwrap()
    }

    fn new_dataset(store: &MemoryStore) -> Dataset {
        Dataset::create(
            Arc::new(store.clone()),
            MASTER,
            DatasetFormat::Default,
            ConventionVersion::V04,
            DatasetOptions::new(),
        )
        .unwrap()
    }

    fn four_by_four(ds: &mut Dataset) {
        ds.create_dimension("", "x", Some(4)).unwrap();
        ds.create_dimension("", "y", Some(4)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::F32,
            &["x", "y"],
            VariableSpec::new().with_subarray_shape(vec![2, 2]),
        )
        .unwrap();
    }

    #[test]
    fn scalar_read_back_through_close_and_reopen() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        ds.close().unwrap();

        for tile in ["t.0.0", "t.0.1", "t.1.0", "t.1.1"] {
            let key = format!("s3://host/bucket/data/m/{tile}.nc");
            assert!(store.keys().contains(&key), "missing {key}");
        }

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::range(1, 3), Slice::range(1, 3)])
            .unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.as_slice::<f32>(), &[1.0; 4]);
    }

    #[test]
    fn sparse_writes_leave_fill_and_one_subarray() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        let sevens =
            ArrayData::from_elems(ElemType::F32, &[2, 2], &[7.0f32; 4]).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::range(0, 2), Slice::range(0, 2)], &sevens)
            .unwrap();
        ds.close().unwrap();

        // the master plus exactly one subarray landed on the store
        assert_eq!(store.object_count(), 2);
        assert!(store
            .keys()
            .contains(&"s3://host/bucket/data/m/t.0.0.nc".to_string()));

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::all(), Slice::all()])
            .unwrap();
        let fill = 9.9692099683868690e+36f32;
        let values: &[f32] = out.as_slice();
        for row in 0..4 {
            for col in 0..4 {
                let expected = if row < 2 && col < 2 { 7.0 } else { fill };
                assert_eq!(values[row * 4 + col], expected, "at ({row},{col})");
            }
        }
    }

    #[test]
    fn v05_rejects_classical_formats() {
        let store = MemoryStore::new();
        for format in [DatasetFormat::Classic, DatasetFormat::AggregatedClassic] {
            let err = Dataset::create(
                Arc::new(store.clone()),
                MASTER,
                format,
                ConventionVersion::V05,
                DatasetOptions::new().with_clobber(true),
            )
            .unwrap_err();
            assert!(matches!(err, Error::FormatMismatch { .. }), "{format}");
        }
    }

    #[test]
    fn foreign_magic_is_not_a_recognized_file() {
        let store = MemoryStore::new();
        store
            .create(&ObjectUri::parse(MASTER), false)
            .unwrap()
            .close(Some(b"PK\x03\x04hi"))
            .unwrap();
        let err =
            Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap_err();
        assert!(matches!(err, Error::NotARecognizedFile { .. }));
    }

    #[test]
    fn eviction_keeps_every_tile_durable_under_the_cap() {
        let tile_bytes = 512 * 8;
        let cap = 2 * (tile_bytes + 1024);
        let store = MemoryStore::new();
        let mut ds = Dataset::create(
            Arc::new(store.clone()),
            MASTER,
            DatasetFormat::Default,
            ConventionVersion::V04,
            DatasetOptions::new().with_memory_limit(cap),
        )
        .unwrap();
        ds.create_dimension("", "x", Some(5 * 512)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::F64,
            &["x"],
            VariableSpec::new().with_subarray_shape(vec![512]),
        )
        .unwrap();

        let data =
            ArrayData::from_elems(ElemType::F64, &[5 * 512], &vec![3.5f64; 5 * 512]).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all()], &data)
            .unwrap();

        let peak = ds.file_manager().peak_memory();
        assert!(
            peak <= cap + tile_bytes + 2048,
            "peak {peak} exceeded cap {cap} by more than one tile"
        );
        ds.close().unwrap();

        // all five tiles plus the master are durable, each subarray object
        // carrying its full tile payload
        assert_eq!(store.object_count(), 6);
        for key in store.keys() {
            if key.contains("/m/t.") {
                assert!(store.object_size(&key).unwrap() > tile_bytes);
            }
        }

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let out = ds.variable("", "t").unwrap().read(&[Slice::all()]).unwrap();
        assert!(out.as_slice::<f64>().iter().all(|&v| v == 3.5));
    }

    #[test]
    fn unwritten_variables_read_as_fill() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::all(), Slice::all()])
            .unwrap();
        let fill = 9.9692099683868690e+36f32;
        assert!(out.as_slice::<f32>().iter().all(|&v| v == fill));
    }

    #[test]
    fn writes_are_visible_before_close_through_the_cache() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        let mut var = ds.variable("", "t").unwrap();
        var.write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        let out = var.read(&[Slice::range(0, 1), Slice::all()]).unwrap();
        assert_eq!(out.as_slice::<f32>(), &[1.0; 4]);
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "x", Some(7)).unwrap();
        ds.create_dimension("", "y", Some(5)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::F64,
            &["x", "y"],
            VariableSpec::new().with_subarray_shape(vec![3, 2]),
        )
        .unwrap();

        let values: Vec<f64> = (0..35).map(|v| (v as f64).sqrt() * 1.0e-7).collect();
        let data = ArrayData::from_elems(ElemType::F64, &[7, 5], &values).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &data)
            .unwrap();
        ds.close().unwrap();

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::all(), Slice::all()])
            .unwrap();
        assert_eq!(out.as_slice::<f64>(), values.as_slice());
    }

    #[test]
    fn strided_reads_match_the_request_grid() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "x", Some(8)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::I32,
            &["x"],
            VariableSpec::new().with_subarray_shape(vec![3]),
        )
        .unwrap();
        let values: Vec<i32> = (0..8).collect();
        let data = ArrayData::from_elems(ElemType::I32, &[8], &values).unwrap();
        let mut var = ds.variable("", "t").unwrap();
        var.write(&[Slice::all()], &data).unwrap();

        let out = var.read(&[Slice::stride(1, 8, 3)]).unwrap();
        assert_eq!(out.as_slice::<i32>(), &[1, 4, 7]);

        let err = var
            .write(&[Slice::stride(0, 8, 2)], &data)
            .unwrap_err();
        assert!(matches!(err, Error::NonUnitStride { .. }));
    }

    #[test]
    fn v05_round_trips_through_meta_variables() {
        let store = MemoryStore::new();
        let mut ds = Dataset::create(
            Arc::new(store.clone()),
            MASTER,
            DatasetFormat::AggregatedHdf,
            ConventionVersion::V05,
            DatasetOptions::new(),
        )
        .unwrap();
        four_by_four(&mut ds);
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        ds.close().unwrap();

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        assert_eq!(ds.convention(), ConventionVersion::V05);
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::all(), Slice::all()])
            .unwrap();
        assert_eq!(out.as_slice::<f32>(), &[1.0; 16]);
    }

    #[test]
    fn convention_round_trip_reproduces_every_partition_field() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        let sevens = ArrayData::from_elems(ElemType::F32, &[2, 2], &[7.0f32; 4]).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::range(2, 4), Slice::range(0, 2)], &sevens)
            .unwrap();

        let before = ds
            .root()
            .variable("t")
            .unwrap()
            .matrix()
            .unwrap()
            .all_descriptors(StorageFormat::Hdf, "t");
        ds.close().unwrap();

        let ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let after = ds
            .root()
            .variable("t")
            .unwrap()
            .matrix()
            .unwrap()
            .all_descriptors(StorageFormat::Hdf, "t");
        assert_eq!(before, after);
        assert_eq!(
            after.iter().filter(|p| p.file.is_some()).count(),
            1
        );
    }

    #[test]
    fn dimension_variables_are_subset_into_subarrays() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "x", Some(4)).unwrap();
        ds.create_variable("", "x", ElemType::F64, &["x"], VariableSpec::new())
            .unwrap();
        let coords = ArrayData::from_elems(ElemType::F64, &[4], &[0.0f64, 0.5, 1.0, 1.5]).unwrap();
        ds.variable("", "x")
            .unwrap()
            .write(&[Slice::all()], &coords)
            .unwrap();

        ds.create_variable(
            "",
            "t",
            ElemType::F32,
            &["x"],
            VariableSpec::new().with_subarray_shape(vec![2]),
        )
        .unwrap();
        let data = ArrayData::from_elems(ElemType::F32, &[4], &[1.0f32; 4]).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all()], &data)
            .unwrap();
        ds.close().unwrap();

        // the second tile carries coordinates 1.0 and 1.5
        let key = ObjectUri::parse("s3://host/bucket/data/m/t.1.nc");
        let mut stream = store.open(&key).unwrap();
        let sub = BinFile::from_bytes(&stream.read_all().unwrap(), "t.1.nc").unwrap();
        let coords = sub.read_slab("", "x", &[(0, 2)]).unwrap();
        assert_eq!(coords.as_slice::<f64>(), &[1.0, 1.5]);
    }

    #[test]
    fn attribute_overlay_is_idempotent_and_falls_back() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        {
            let mut var = ds.variable("", "t").unwrap();
            var.set_attr("units", AttrValue::from("K")).unwrap();
            var.set_attr("units", AttrValue::from("K")).unwrap();
            assert_eq!(var.get_attr("units").unwrap(), AttrValue::from("K"));
            assert!(matches!(
                var.get_attr("missing").unwrap_err(),
                Error::AttributeMissing { .. }
            ));
        }
        ds.set_attr("", "title", AttrValue::from("ocean run")).unwrap();
        ds.close().unwrap();

        // after reopen the overlay is empty and lookups hit the backing file
        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        assert_eq!(ds.get_attr("", "title").unwrap(), AttrValue::from("ocean run"));
        let var = ds.variable("", "t").unwrap();
        assert_eq!(var.get_attr("units").unwrap(), AttrValue::from("K"));
        assert_eq!(var.attr_names().unwrap(), vec!["units".to_string()]);
    }

    #[test]
    fn custom_fill_values_apply_to_unwritten_tiles() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "x", Some(4)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::F32,
            &["x"],
            VariableSpec::new()
                .with_subarray_shape(vec![2])
                .with_fill_value(-999.0),
        )
        .unwrap();
        let twos = ArrayData::from_elems(ElemType::F32, &[2], &[2.0f32; 2]).unwrap();
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::range(0, 2)], &twos)
            .unwrap();
        ds.close().unwrap();

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let out = ds.variable("", "t").unwrap().read(&[Slice::all()]).unwrap();
        assert_eq!(out.as_slice::<f32>(), &[2.0, 2.0, -999.0, -999.0]);
    }

    #[test]
    fn renamed_variables_serialize_under_the_new_name() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        ds.variable("", "t").unwrap().rename("temp").unwrap();
        ds.close().unwrap();

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        assert!(ds.variable("", "t").is_err());
        let out = ds
            .variable("", "temp")
            .unwrap()
            .read(&[Slice::all(), Slice::all()])
            .unwrap();
        // subarray files keep recording the original in_variable name
        assert_eq!(out.as_slice::<f32>(), &[1.0; 16]);
    }

    #[test]
    fn grouped_variables_keep_subarrays_under_the_group_prefix() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_group("inst").unwrap();
        ds.create_dimension("inst", "x", Some(4)).unwrap();
        ds.create_variable(
            "inst",
            "t",
            ElemType::F32,
            &["x"],
            VariableSpec::new().with_subarray_shape(vec![2]),
        )
        .unwrap();
        let data = ArrayData::from_elems(ElemType::F32, &[4], &[1.0f32; 4]).unwrap();
        ds.variable("inst", "t")
            .unwrap()
            .write(&[Slice::all()], &data)
            .unwrap();
        ds.close().unwrap();

        assert!(store
            .keys()
            .contains(&"s3://host/bucket/data/m/inst/t.0.nc".to_string()));

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();

        // the parsed tree reports the same structure the writer declared
        assert_eq!(ds.root().group_names(), vec!["inst".to_string()]);
        let inst = ds.root().group("inst").unwrap();
        assert_eq!(inst.dimension_names(), vec!["x".to_string()]);
        assert_eq!(inst.variable_names(), vec!["t".to_string()]);

        let out = ds.variable("inst", "t").unwrap().read(&[Slice::all()]).unwrap();
        assert_eq!(out.as_slice::<f32>(), &[1.0; 4]);
    }

    #[test]
    fn subarray_listing_enumerates_committed_tiles() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        ds.close().unwrap();

        let ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        let listed = ds.list_subarrays("", "t").unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed
            .iter()
            .all(|key| key.starts_with("s3://host/bucket/data/m/t.")));
    }

    #[test]
    fn read_mode_rejects_mutation() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        four_by_four(&mut ds);
        ds.close().unwrap();

        let mut ds = Dataset::open(Arc::new(store.clone()), MASTER, DatasetOptions::new()).unwrap();
        assert!(matches!(
            ds.create_dimension("", "z", Some(2)).unwrap_err(),
            Error::ReadOnly
        ));
        let err = ds
            .variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[test]
    fn open_with_dispatches_on_mode_and_rejects_append() {
        let store = MemoryStore::new();
        let ds = Dataset::open_with(
            Arc::new(store.clone()),
            MASTER,
            "w",
            DatasetFormat::Default,
            "0.4",
            DatasetOptions::new(),
        )
        .unwrap();
        ds.close().unwrap();

        let err = Dataset::open_with(
            Arc::new(store.clone()),
            MASTER,
            "a",
            DatasetFormat::Default,
            "0.4",
            DatasetOptions::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AppendUnsupported));

        let ds = Dataset::open_with(
            Arc::new(store.clone()),
            MASTER,
            "r",
            DatasetFormat::Default,
            "0.4",
            DatasetOptions::new(),
        )
        .unwrap();
        assert_eq!(ds.mode(), OpenMode::Read);
    }

    #[test]
    fn local_store_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("m.nc");
        let master = master.to_str().unwrap();
        let store = Arc::new(crate::stream::LocalStore::new());

        let mut ds = Dataset::create(
            store.clone(),
            master,
            DatasetFormat::Default,
            ConventionVersion::V04,
            DatasetOptions::new(),
        )
        .unwrap();
        four_by_four(&mut ds);
        ds.variable("", "t")
            .unwrap()
            .write(&[Slice::all(), Slice::all()], &ones(&[4, 4]))
            .unwrap();
        ds.close().unwrap();

        assert!(dir.path().join("m/t.0.0.nc").exists());

        let mut ds = Dataset::open(store, master, DatasetOptions::new()).unwrap();
        let out = ds
            .variable("", "t")
            .unwrap()
            .read(&[Slice::range(1, 3), Slice::range(1, 3)])
            .unwrap();
        assert_eq!(out.as_slice::<f32>(), &[1.0; 4]);
    }

    #[test]
    fn partitioned_variables_reject_unlimited_dimensions() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "time", None).unwrap();
        let err = ds
            .create_variable(
                "",
                "t",
                ElemType::F32,
                &["time"],
                VariableSpec::new().with_subarray_shape(vec![2]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnlimitedUnsupported { .. }));
    }

    #[test]
    fn max_subarray_size_partitions_on_creation() {
        let store = MemoryStore::new();
        let mut ds = new_dataset(&store);
        ds.create_dimension("", "time", Some(8)).unwrap();
        ds.create_dimension("", "x", Some(4)).unwrap();
        ds.create_variable(
            "",
            "t",
            ElemType::F64,
            &["time", "x"],
            VariableSpec::new().with_max_subarray_size(128),
        )
        .unwrap();

        let matrix = ds.root().variable("t").unwrap().matrix().unwrap();
        // 8x4 f64 = 256 bytes; one split along time meets the bound
        assert_eq!(matrix.counts(), &[2, 1]);
    }
}
