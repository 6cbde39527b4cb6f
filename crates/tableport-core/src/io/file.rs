use crate::{Result, StorageError};
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::io;
use std::sync::Arc;

/// A file that is buffered in memory and stored when closed.
///
/// Implements [`std::io::Write`] so format writers can stream into it.
/// Nothing is visible in storage until [`OutputFile::close`] or
/// [`OutputFile::close_new`] succeeds.
pub struct OutputFile {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    location: String,
    buffer: Vec<u8>,
}

impl OutputFile {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, path: ObjectPath, location: String) -> Self {
        Self {
            store,
            path,
            location,
            buffer: Vec::new(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Store the file, replacing any existing object. Returns its length.
    pub async fn close(self) -> Result<u64> {
        let length = self.len();
        let payload = PutPayload::from_bytes(Bytes::from(self.buffer));
        self.store.put(&self.path, payload).await?;
        Ok(length)
    }

    /// Store the file only if nothing exists at its location yet.
    ///
    /// Fails with [`StorageError::AlreadyExists`] when another writer created
    /// the file first.
    pub async fn close_new(self) -> Result<u64> {
        let length = self.len();
        let payload = PutPayload::from_bytes(Bytes::from(self.buffer));
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };

        match self.store.put_opts(&self.path, payload, opts).await {
            Ok(_) => Ok(length),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(StorageError::AlreadyExists(self.location).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A readable file in storage.
pub struct InputFile {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    location: String,
}

impl InputFile {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, path: ObjectPath, location: String) -> Self {
        Self {
            store,
            path,
            location,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn read(&self) -> Result<Bytes> {
        let result = self.store.get(&self.path).await?;
        Ok(result.bytes().await?)
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.store.head(&self.path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn length(&self) -> Result<u64> {
        let meta = self.store.head(&self.path).await?;
        Ok(meta.size as u64)
    }
}
