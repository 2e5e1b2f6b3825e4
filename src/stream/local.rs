//! Local filesystem byte streams

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Error, Result},
    stream::{ByteStore, ByteStream},
    uri::ObjectUri,
};

/// A [ByteStore] over the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        LocalStore
    }
}

impl ByteStore for LocalStore {
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn ByteStream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&uri.path)
            .or_else(|_| File::open(&uri.path))
            .map_err(|e| Error::transport(uri.to_string(), e))?;
        Ok(Box::new(LocalStream {
            uri: uri.to_string(),
            file,
        }))
    }

    fn create(&self, uri: &ObjectUri, clobber: bool) -> Result<Box<dyn ByteStream>> {
        let path = Path::new(&uri.path);
        if !clobber && path.exists() {
            return Err(Error::NameCollision {
                kind: "file",
                name: uri.to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::transport(uri.to_string(), e))?;
        }
        debug!("creating local file {}", uri);
        let file = File::create(path).map_err(|e| Error::transport(uri.to_string(), e))?;
        Ok(Box::new(LocalStream {
            uri: uri.to_string(),
            file,
        }))
    }

    fn exists(&self, uri: &ObjectUri) -> Result<bool> {
        Ok(Path::new(&uri.path).exists())
    }

    fn list(&self, pattern: &ObjectUri) -> Result<Vec<String>> {
        let matcher = pattern.wildcard_matcher()?;
        let parent: PathBuf = Path::new(&pattern.path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut found = Vec::new();
        let entries = match fs::read_dir(&parent) {
            Ok(entries) => entries,
            Err(_) => return Ok(found),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::transport(pattern.to_string(), e))?;
            let path = entry.path().to_string_lossy().into_owned();
            if matcher.is_match(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct LocalStream {
    uri: String,
    file: File,
}

impl LocalStream {
    fn wrap<T>(&self, res: std::io::Result<T>) -> Result<T> {
        res.map_err(|e| Error::transport(self.uri.clone(), e))
    }
}

impl ByteStream for LocalStream {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let res = self.file.seek(SeekFrom::Start(offset)).map(|_| ());
        self.wrap(res)?;
        let mut buf = vec![0u8; len];
        let res = self.file.read(&mut buf);
        let n = self.wrap(res)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        let res = self.file.seek(SeekFrom::Start(0)).map(|_| ());
        self.wrap(res)?;
        let mut buf = Vec::new();
        let res = self.file.read_to_end(&mut buf);
        self.wrap(res)?;
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let res = self.file.write_all(data);
        self.wrap(res)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let res = self.file.seek(SeekFrom::Start(pos)).map(|_| ());
        self.wrap(res)
    }

    fn close(&mut self, payload: Option<&[u8]>) -> Result<()> {
        if let Some(payload) = payload {
            let res = self.file.seek(SeekFrom::Start(0)).map(|_| ());
            self.wrap(res)?;
            let res = self.file.set_len(0);
            self.wrap(res)?;
            let res = self.file.write_all(payload);
            self.wrap(res)?;
        }
        let res = self.file.flush();
        self.wrap(res)
    }

    fn is_remote(&self) -> bool {
        false
    }
}
