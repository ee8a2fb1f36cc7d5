//! Filesystem-backed durable store.
//!
//! Entries live under a fan-out directory layout derived from the key bytes
//! (`ab/cdef01/…`), written via a temporary file in a sibling directory and
//! atomically persisted into place. Leftover temporaries from crashed runs
//! are swept on startup.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::store::DurableStore;

pub struct FilesystemStore {
    root: PathBuf,
    tmp: PathBuf,
}

impl std::fmt::Debug for FilesystemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemStore")
            .field("root", &self.root)
            .finish()
    }
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let tmp = root.join("tmp");
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&tmp)?;

        let store = FilesystemStore { root, tmp };
        store.clear_tmp()?;
        Ok(store)
    }

    /// Sweep temporaries left behind by a crashed run.
    fn clear_tmp(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.tmp)? {
            let path = entry?.path();
            if path.is_file() {
                if let Err(error) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), %error, "failed to remove stale temp file");
                }
            }
        }
        Ok(())
    }

    /// Relative fan-out path for a key: `ab/cdef01/…` over the hex form.
    fn entry_path(&self, key: &[u8]) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2 + 2);
        for byte in key {
            write!(name, "{byte:02x}").expect("writing to a String cannot fail");
        }
        let (shard, rest) = name.split_at(2.min(name.len()));
        let (fan, file) = rest.split_at(6.min(rest.len()));
        if file.is_empty() {
            self.root.join(shard).join(fan)
        } else {
            self.root.join(shard).join(fan).join(file)
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

impl DurableStore for FilesystemStore {
    fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
        let path = self.entry_path(key);
        catch_not_found(|| fs::read(&path).map(Bytes::from))
    }

    fn put(&self, key: &[u8], value: Bytes) -> io::Result<()> {
        let path = self.entry_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("entry path has no parent"))?;

        // A concurrent cleanup could remove the directories we are operating
        // in, so retry the sequence a bounded number of times.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(error) = fs::create_dir_all(parent) {
                tracing::error!(path = %parent.display(), %error, "failed to create cache directory");
                if retries > MAX_RETRIES {
                    return Err(error);
                }
                continue;
            }

            let mut temp_file = match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp)
            {
                Ok(temp_file) => temp_file,
                Err(error) => {
                    tracing::error!(path = %self.tmp.display(), %error, "failed to create temp file");
                    if retries > MAX_RETRIES {
                        return Err(error);
                    }
                    continue;
                }
            };
            io::Write::write_all(temp_file.as_file_mut(), &value)?;

            match temp_file.persist(&path) {
                Ok(_) => return Ok(()),
                Err(error) => {
                    tracing::error!(path = %path.display(), error = %error.error, "failed to persist cache file");
                    if retries > MAX_RETRIES {
                        return Err(error.error);
                    }
                }
            }
        }
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        let path = self.entry_path(key);
        catch_not_found(|| fs::remove_file(&path))?;
        Ok(())
    }
}
