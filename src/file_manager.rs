//! Open-file lifecycle, placement, and memory accounting
//!
//! The [FileManager] owns every open subarray file of a dataset. Remote
//! files are streamed into memory and counted against a global cap; local
//! files live on disk. When the cap would be exceeded, least-recently-used
//! in-memory records are evicted with dirty write-back. Dirty records are
//! never silently dropped.

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};
use strum::Display;

use crate::{
    error::{Error, Result},
    format::{OpenOptions, StorageFormat, StructuredFile, StructuredOpener},
    stream::ByteStore,
    types::{ArrayData, ElemType},
    uri::ObjectUri,
};

/// Dataset open modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OpenMode {
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "w")]
    Write,
}

impl std::str::FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" | "r+" | "a+" => Err(Error::AppendUnsupported),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Lifecycle states of an open-file record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    /// First-time open; buffer lives in RAM and must be flushed on close
    NewInMemory,
    /// First-time open; file created on the local filesystem
    NewOnDisk,
    /// Existing remote file streamed into RAM
    ExistsInMemory,
    /// Existing local file
    ExistsOnDisk,
    /// Read requested for a URI absent on the backing store
    DoesNotExist,
    /// Terminal
    Closed,
}

impl FileState {
    fn in_memory(self) -> bool {
        matches!(self, FileState::NewInMemory | FileState::ExistsInMemory)
    }
}

/// One entry of the open-file table
pub struct OpenFileRecord {
    pub state: FileState,
    file: Option<Box<dyn StructuredFile>>,
    pub size: usize,
    pub dirty: bool,
    last_used: u64,
}

impl std::fmt::Debug for OpenFileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFileRecord")
            .field("state", &self.state)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}

impl OpenFileRecord {
    pub fn file(&self) -> Result<&dyn StructuredFile> {
        self.file
            .as_deref()
            .ok_or_else(|| Error::InternalInvariant("record has no open file".to_string()))
    }

    pub fn file_mut(&mut self) -> Result<&mut dyn StructuredFile> {
        match self.file.as_deref_mut() {
            Some(file) => Ok(file),
            None => Err(Error::InternalInvariant(
                "record has no open file".to_string(),
            )),
        }
    }
}

/// Owns open subarray files, bounded memory, and result buffers
pub struct FileManager {
    store: Arc<dyn ByteStore>,
    opener: Box<dyn StructuredOpener>,
    table: HashMap<String, OpenFileRecord>,
    open_opts: OpenOptions,
    clock: u64,
    mem_used: usize,
    mem_limit: usize,
    peak_mem: usize,
}

impl FileManager {
    pub fn new(
        store: Arc<dyn ByteStore>,
        opener: Box<dyn StructuredOpener>,
        mem_limit: Option<usize>,
        open_opts: OpenOptions,
    ) -> Self {
        FileManager {
            store,
            opener,
            table: HashMap::new(),
            open_opts,
            clock: 0,
            mem_used: 0,
            mem_limit: mem_limit.unwrap_or_else(default_memory_limit),
            peak_mem: 0,
        }
    }

    pub fn store(&self) -> &dyn ByteStore {
        self.store.as_ref()
    }

    pub fn memory_limit(&self) -> usize {
        self.mem_limit
    }

    pub fn memory_in_use(&self) -> usize {
        self.mem_used
    }

    /// High-water mark of in-memory subarray bytes.
    pub fn peak_memory(&self) -> usize {
        self.peak_mem
    }

    pub fn open_count(&self) -> usize {
        self.table.len()
    }

    /// Return the record for a URI, opening or creating the file on demand.
    ///
    /// A read request for a URI absent on the backing store yields a
    /// `DOES_NOT_EXIST` record; the caller fills the affected region with
    /// the variable's fill value instead of reading.
    pub fn request_file(
        &mut self,
        uri: &ObjectUri,
        projected_size: usize,
        mode: OpenMode,
        format: StorageFormat,
    ) -> Result<&mut OpenFileRecord> {
        self.clock += 1;
        let key = uri.to_string();
        let remote = uri.is_remote() || self.store.is_remote();

        // A tile first requested for read and later written transitions out
        // of DOES_NOT_EXIST by creating the file.
        let needs_create = self
            .table
            .get(&key)
            .is_some_and(|r| r.state == FileState::DoesNotExist && mode == OpenMode::Write);
        if needs_create {
            if remote {
                self.ensure_capacity(projected_size, Some(&key))?;
            }
            let file = self.create_file(uri, format)?;
            let state = if remote {
                self.mem_used += projected_size;
                FileState::NewInMemory
            } else {
                FileState::NewOnDisk
            };
            let record = self.table.get_mut(&key).unwrap();
            record.file = Some(file);
            record.state = state;
            record.size = projected_size;
            record.dirty = true;
        }

        if self.table.contains_key(&key) {
            self.peak_mem = self.peak_mem.max(self.mem_used);
            let clock = self.clock;
            let record = self.table.get_mut(&key).unwrap();
            record.last_used = clock;
            return Ok(record);
        }

        let exists = self.store.exists(uri)?;
        let record = match (exists, mode) {
            (false, OpenMode::Read) => {
                debug!("{key} does not exist; reads will fill");
                OpenFileRecord {
                    state: FileState::DoesNotExist,
                    file: None,
                    size: 0,
                    dirty: false,
                    last_used: self.clock,
                }
            }
            (false, OpenMode::Write) => {
                if remote {
                    self.ensure_capacity(projected_size, None)?;
                    self.mem_used += projected_size;
                }
                let file = self.create_file(uri, format)?;
                OpenFileRecord {
                    state: if remote {
                        FileState::NewInMemory
                    } else {
                        FileState::NewOnDisk
                    },
                    file: Some(file),
                    size: projected_size,
                    dirty: true,
                    last_used: self.clock,
                }
            }
            (true, _) => {
                if remote {
                    self.ensure_capacity(projected_size, None)?;
                }
                let file = self.opener.open(self.store.as_ref(), uri)?;
                let size = projected_size.max(file.size_hint());
                if remote {
                    self.mem_used += size;
                }
                OpenFileRecord {
                    state: if remote {
                        FileState::ExistsInMemory
                    } else {
                        FileState::ExistsOnDisk
                    },
                    file: Some(file),
                    size,
                    dirty: false,
                    last_used: self.clock,
                }
            }
        };

        self.table.insert(key.clone(), record);
        self.peak_mem = self.peak_mem.max(self.mem_used);
        Ok(self.table.get_mut(&key).unwrap())
    }

    fn create_file(
        &self,
        uri: &ObjectUri,
        format: StorageFormat,
    ) -> Result<Box<dyn StructuredFile>> {
        // Subarray creation replaces leftovers from an earlier run of the
        // same master; the dataset-level clobber option guards the master.
        let opts = OpenOptions {
            clobber: true,
            ..self.open_opts
        };
        self.opener.create(self.store.as_ref(), uri, format, &opts)
    }

    /// Re-read a record's size after writes and rebalance the cap.
    ///
    /// The record being refreshed is never evicted, so a single oversized
    /// tile can exceed the cap by at most its own size.
    pub fn refresh_size(&mut self, uri: &str) -> Result<()> {
        let (old, new, in_memory) = match self.table.get(uri) {
            Some(record) => (
                record.size,
                record.file.as_ref().map_or(record.size, |f| f.size_hint()),
                record.state.in_memory(),
            ),
            None => return Ok(()),
        };
        if in_memory {
            self.mem_used = self.mem_used - old + new;
            self.peak_mem = self.peak_mem.max(self.mem_used);
        }
        self.table.get_mut(uri).unwrap().size = new;
        while self.mem_used > self.mem_limit {
            if !self.evict_one(Some(uri))? {
                break;
            }
        }
        Ok(())
    }

    /// Allocate a result buffer, zeroed or fill-initialized.
    pub fn request_array(
        &self,
        shape: &[usize],
        dtype: ElemType,
        fill: Option<&[u8]>,
    ) -> ArrayData {
        match fill {
            Some(fill) => ArrayData::filled(dtype, shape, fill),
            None => ArrayData::zeroed(dtype, shape),
        }
    }

    fn ensure_capacity(&mut self, needed: usize, keep: Option<&str>) -> Result<()> {
        if needed > self.mem_limit {
            return Err(Error::ResourceExhausted {
                requested: needed,
                limit: self.mem_limit,
            });
        }
        while self.mem_used + needed > self.mem_limit {
            if !self.evict_one(keep)? {
                return Err(Error::ResourceExhausted {
                    requested: needed,
                    limit: self.mem_limit,
                });
            }
        }
        Ok(())
    }

    /// Evict the least-recently-used in-memory record, writing back dirty
    /// state. Ties break on the URI so eviction is deterministic.
    fn evict_one(&mut self, keep: Option<&str>) -> Result<bool> {
        let victim = self
            .table
            .iter()
            .filter(|(key, record)| {
                record.state.in_memory() && keep.is_none_or(|k| k != key.as_str())
            })
            .min_by(|(ka, a), (kb, b)| a.last_used.cmp(&b.last_used).then_with(|| ka.cmp(kb)))
            .map(|(key, _)| key.clone());

        let Some(key) = victim else {
            return Ok(false);
        };
        let mut record = self.table.remove(&key).unwrap();
        debug!(
            "evicting {key} ({} bytes, dirty={})",
            record.size, record.dirty
        );
        if let Some(file) = record.file.as_mut() {
            file.close()?;
        }
        record.state = FileState::Closed;
        self.mem_used = self.mem_used.saturating_sub(record.size);
        Ok(true)
    }

    /// Flush and close every open record. Order is deterministic (sorted by
    /// URI); in-memory buffers upload through their byte streams.
    pub fn close_all(&mut self) -> Result<()> {
        let mut keys: Vec<String> = self.table.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let mut record = self.table.remove(&key).unwrap();
            if let Some(file) = record.file.as_mut() {
                debug!("closing {key}");
                file.close()?;
            }
            record.state = FileState::Closed;
        }
        self.mem_used = 0;
        Ok(())
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        let dirty: Vec<&String> = self
            .table
            .iter()
            .filter(|(_, r)| r.dirty)
            .map(|(k, _)| k)
            .collect();
        if !dirty.is_empty() {
            warn!("file manager dropped with {} dirty files", dirty.len());
        }
    }
}

/// Default cap on in-memory subarray bytes: an eighth of physical memory,
/// or 1 GiB when the size cannot be queried.
pub fn default_memory_limit() -> usize {
    physical_memory().map(|m| m / 8).unwrap_or(1 << 30)
}

#[cfg(unix)]
fn physical_memory() -> Option<usize> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as usize * page_size as usize)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn physical_memory() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        format::BinFileOpener,
        stream::MemoryStore,
        types::ElemType,
    };

    fn manager(limit: usize) -> (MemoryStore, FileManager) {
        let store = MemoryStore::new();
        let fm = FileManager::new(
            Arc::new(store.clone()),
            Box::new(BinFileOpener),
            Some(limit),
            OpenOptions::default(),
        );
        (store, fm)
    }

    fn write_tile(fm: &mut FileManager, uri: &str, bytes: usize) {
        let uri = ObjectUri::parse(uri);
        let record = fm
            .request_file(&uri, bytes, OpenMode::Write, StorageFormat::Hdf)
            .unwrap();
        let file = record.file_mut().unwrap();
        file.create_dimension("", "x", Some(bytes)).unwrap();
        file.create_variable("", "v", ElemType::U8, &["x".to_string()], None)
            .unwrap();
        record.dirty = true;
        fm.refresh_size(&uri.to_string()).unwrap();
    }

    #[test]
    fn missing_reads_become_does_not_exist_records() {
        let (_store, mut fm) = manager(1 << 20);
        let uri = ObjectUri::parse("s3://host/bucket/m/t.0.0.nc");
        let record = fm
            .request_file(&uri, 128, OpenMode::Read, StorageFormat::Hdf)
            .unwrap();
        assert_eq!(record.state, FileState::DoesNotExist);
        assert!(record.file().is_err());
    }

    #[test]
    fn does_not_exist_transitions_to_new_on_write() {
        let (_store, mut fm) = manager(1 << 20);
        let uri = ObjectUri::parse("s3://host/bucket/m/t.0.0.nc");
        fm.request_file(&uri, 128, OpenMode::Read, StorageFormat::Hdf)
            .unwrap();
        let record = fm
            .request_file(&uri, 128, OpenMode::Write, StorageFormat::Hdf)
            .unwrap();
        assert_eq!(record.state, FileState::NewInMemory);
        assert!(record.dirty);
    }

    #[test]
    fn eviction_writes_back_dirty_records() {
        let (store, mut fm) = manager(8192);
        for i in 0..5 {
            write_tile(&mut fm, &format!("s3://host/bucket/m/t.{i}.nc"), 2048);
        }
        // everything evicted along the way is already durable
        fm.close_all().unwrap();
        assert_eq!(store.object_count(), 5);
        assert!(fm.peak_memory() <= 8192 + 4096);
    }

    #[test]
    fn reopened_records_promote_in_lru_order() {
        let (_store, mut fm) = manager(1 << 20);
        write_tile(&mut fm, "s3://host/bucket/m/t.0.nc", 1024);
        write_tile(&mut fm, "s3://host/bucket/m/t.1.nc", 1024);
        // touch t.0 so t.1 becomes the LRU victim
        fm.request_file(
            &ObjectUri::parse("s3://host/bucket/m/t.0.nc"),
            1024,
            OpenMode::Read,
            StorageFormat::Hdf,
        )
        .unwrap();
        fm.evict_one(None).unwrap();
        assert!(fm.table.contains_key("s3://host/bucket/m/t.0.nc"));
        assert!(!fm.table.contains_key("s3://host/bucket/m/t.1.nc"));
    }

    #[test]
    fn oversized_requests_exhaust_resources() {
        let (_store, mut fm) = manager(1024);
        let uri = ObjectUri::parse("s3://host/bucket/m/t.0.nc");
        let err = fm
            .request_file(&uri, 4096, OpenMode::Write, StorageFormat::Hdf)
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }

    #[test]
    fn evicted_files_reopen_as_existing() {
        let (_store, mut fm) = manager(1 << 20);
        let uri = ObjectUri::parse("s3://host/bucket/m/t.0.nc");
        write_tile(&mut fm, &uri.to_string(), 1024);
        fm.evict_one(None).unwrap();

        let record = fm
            .request_file(&uri, 1024, OpenMode::Read, StorageFormat::Hdf)
            .unwrap();
        assert_eq!(record.state, FileState::ExistsInMemory);
        assert_eq!(
            record.file().unwrap().variable_names("").unwrap(),
            vec!["v".to_string()]
        );
    }

    #[test]
    fn request_array_honors_the_fill() {
        let (_store, fm) = manager(1024);
        let fill = 7.0f32.to_le_bytes();
        let out = fm.request_array(&[2, 2], ElemType::F32, Some(&fill));
        assert_eq!(out.as_slice::<f32>(), &[7.0; 4]);
    }

    #[test]
    fn mode_strings_parse_and_append_is_rejected() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("w".parse::<OpenMode>().unwrap(), OpenMode::Write);
        assert!(matches!(
            "a".parse::<OpenMode>().unwrap_err(),
            Error::AppendUnsupported
        ));
        assert!(matches!(
            "x".parse::<OpenMode>().unwrap_err(),
            Error::InvalidMode(_)
        ));
    }
}
