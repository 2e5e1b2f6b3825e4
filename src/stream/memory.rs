//! An in-memory byte store with object-store semantics
//!
//! Objects are immutable blobs keyed by URI; writes stage into a pending
//! buffer that only becomes visible once the stream is closed, mirroring a
//! multipart upload. Cloning the store shares the underlying namespace, so a
//! "reopened" dataset sees what an earlier one uploaded.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    error::{Error, Result},
    stream::{ByteStore, ByteStream},
    uri::ObjectUri,
};

type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// A [ByteStore] backed by process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Objects,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of committed objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Committed object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Size in bytes of one committed object.
    pub fn object_size(&self, uri: &str) -> Option<usize> {
        self.objects.lock().unwrap().get(uri).map(Vec::len)
    }
}

impl ByteStore for MemoryStore {
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn ByteStream>> {
        let key = uri.to_string();
        let content = self
            .objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                Error::transport(
                    key.clone(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
                )
            })?;
        Ok(Box::new(MemoryStream {
            objects: self.objects.clone(),
            key,
            buf: content,
            pos: 0,
            dirty: false,
        }))
    }

    fn create(&self, uri: &ObjectUri, clobber: bool) -> Result<Box<dyn ByteStream>> {
        let key = uri.to_string();
        if !clobber && self.objects.lock().unwrap().contains_key(&key) {
            return Err(Error::NameCollision {
                kind: "object",
                name: key,
            });
        }
        debug!("staging object {}", key);
        Ok(Box::new(MemoryStream {
            objects: self.objects.clone(),
            key,
            buf: Vec::new(),
            pos: 0,
            dirty: true,
        }))
    }

    fn exists(&self, uri: &ObjectUri) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(&uri.to_string()))
    }

    fn list(&self, pattern: &ObjectUri) -> Result<Vec<String>> {
        let matcher = pattern.wildcard_matcher()?;
        let mut found: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| {
                let parsed = ObjectUri::parse(key);
                parsed.scheme == pattern.scheme
                    && parsed.host == pattern.host
                    && matcher.is_match(&parsed.path)
            })
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct MemoryStream {
    objects: Objects,
    key: String,
    buf: Vec<u8>,
    pos: usize,
    dirty: bool,
}

impl ByteStream for MemoryStream {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = (offset as usize).min(self.buf.len());
        let end = (start + len).min(self.buf.len());
        Ok(self.buf[start..end].to_vec())
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        Ok(self.buf.clone())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        self.dirty = true;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos as usize;
        Ok(())
    }

    fn close(&mut self, payload: Option<&[u8]>) -> Result<()> {
        if let Some(payload) = payload {
            self.buf = payload.to_vec();
            self.dirty = true;
        }
        if self.dirty {
            debug!("committing object {} ({} bytes)", self.key, self.buf.len());
            self.objects
                .lock()
                .unwrap()
                .insert(self.key.clone(), self.buf.clone());
            self.dirty = false;
        }
        Ok(())
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn objects_become_visible_on_close() {
        let store = MemoryStore::new();
        let uri = ObjectUri::parse("s3://host/bucket/a.nc");

        let mut stream = store.create(&uri, false).unwrap();
        stream.write(b"payload").unwrap();
        assert!(!store.exists(&uri).unwrap());
        stream.close(None).unwrap();
        assert!(store.exists(&uri).unwrap());

        let mut stream = store.open(&uri).unwrap();
        assert_eq!(stream.read_all().unwrap(), b"payload");
    }

    #[test]
    fn close_payload_replaces_content() {
        let store = MemoryStore::new();
        let uri = ObjectUri::parse("s3://host/bucket/a.nc");

        let mut stream = store.create(&uri, false).unwrap();
        stream.write(b"draft").unwrap();
        stream.close(Some(b"final")).unwrap();

        let mut stream = store.open(&uri).unwrap();
        assert_eq!(stream.read_all().unwrap(), b"final");
    }

    #[test]
    fn listing_filters_by_namespace_and_pattern() {
        let store = MemoryStore::new();
        for key in [
            "s3://host/bucket/m/t.0.0.nc",
            "s3://host/bucket/m/t.0.1.nc",
            "s3://host/bucket/m/p.0.0.nc",
            "s3://other/bucket/m/t.0.0.nc",
        ] {
            store
                .create(&ObjectUri::parse(key), false)
                .unwrap()
                .close(None)
                .unwrap();
        }

        let found = store
            .list(&ObjectUri::parse("s3://host/bucket/m/t.*.nc"))
            .unwrap();
        assert_eq!(
            found,
            vec![
                "s3://host/bucket/m/t.0.0.nc".to_string(),
                "s3://host/bucket/m/t.0.1.nc".to_string()
            ]
        );
    }

    #[test]
    fn open_of_missing_object_is_a_transport_failure() {
        let store = MemoryStore::new();
        let err = store.open(&ObjectUri::parse("s3://host/bucket/nope.nc")).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
