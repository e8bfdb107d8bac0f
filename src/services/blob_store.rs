//! BlobStore: key-addressed payload storage on local disk.
//!
//! Keys are `/`-separated relative paths beneath `root`. Every write lands in a
//! temporary sibling file, is fsynced, and is then renamed into place, so a key
//! either holds a complete payload or nothing.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;
const PLACEHOLDER_NAME: &str = ".keep";

/// Outcome of writing or concatenating into a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub size_bytes: u64,
    /// Lowercase hex MD5 of the payload.
    pub etag: String,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Public URL under which a stored key is served.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Reject keys that could escape `root` or confuse the filesystem.
    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let invalid = key.is_empty()
            || key.len() > MAX_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob key `{}`", key),
            ));
        }
        Ok(self.root.join(key))
    }

    /// Create the directory for `prefix` and drop an empty placeholder into it.
    pub async fn reserve(&self, prefix: &str) -> io::Result<()> {
        let dir = self.resolve(prefix)?;
        fs::create_dir_all(&dir).await?;
        File::create(dir.join(PLACEHOLDER_NAME)).await?;
        Ok(())
    }

    /// Write `data` at `key`, replacing any previous payload.
    pub async fn put_bytes(&self, key: &str, data: Bytes) -> io::Result<StoredBlob> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(data) });
        self.put_stream(key, stream).await
    }

    /// Stream a payload into `key`, computing its size and MD5 as it is written.
    pub async fn put_stream<S>(&self, key: &str, stream: S) -> io::Result<StoredBlob>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let path = self.resolve(key)?;
        let parent = parent_of(&path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = match File::create(&tmp_path).await {
            // A concurrent prune may remove the directory between the two calls.
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&parent).await?;
                File::create(&tmp_path).await?
            }
            created => created?,
        };

        match write_stream(file, stream).await {
            Ok(stored) => {
                if let Err(err) = fs::rename(&tmp_path, &path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
                Ok(stored)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    /// Concatenate `sources` in order into `dest` without buffering whole payloads.
    ///
    /// Fails with `NotFound` if any source is missing; `dest` is left untouched.
    pub async fn concat(&self, sources: &[String], dest: &str) -> io::Result<StoredBlob> {
        let mut paths = Vec::with_capacity(sources.len());
        for key in sources {
            paths.push(self.resolve(key)?);
        }

        let stream = futures::stream::iter(paths)
            .then(|path| async move {
                File::open(&path).await.map_err(|err| {
                    io::Error::new(
                        err.kind(),
                        format!("opening {}: {}", path.display(), err),
                    )
                })
            })
            .map(|opened| match opened {
                Ok(file) => ReaderStream::new(file).left_stream(),
                Err(err) => futures::stream::once(async move { Err(err) }).right_stream(),
            })
            .flatten();

        self.put_stream(dest, stream).await
    }

    /// Open `key` for reading.
    pub async fn open(&self, key: &str) -> io::Result<File> {
        File::open(self.resolve(key)?).await
    }

    /// Delete `key`. Returns `false` if it did not exist.
    pub async fn delete(&self, key: &str) -> io::Result<bool> {
        match fs::remove_file(self.resolve(key)?).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete `key`, then remove the directories it leaves empty, walking up
    /// to but not including `stop`.
    pub async fn delete_and_prune(&self, key: &str, stop: &str) -> io::Result<bool> {
        let path = self.resolve(key)?;
        let stop = self.resolve(stop)?;
        let removed = self.delete(key).await?;

        let mut current = parent_of(&path)?;
        while current.starts_with(&stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(()) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    break;
                }
                Err(err) => {
                    debug!("failed to prune {}: {}", current.display(), err);
                    break;
                }
            }
        }
        Ok(removed)
    }

    /// Recursively delete everything beneath `prefix`. Missing prefixes are fine.
    pub async fn delete_prefix(&self, prefix: &str) -> io::Result<()> {
        let dir = self.resolve(prefix)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("removed blob prefix {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Write, read back and delete a probe file under the root.
    pub async fn probe(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let tmp_path = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(io::Error::new(ErrorKind::Other, "file content mismatch"));
        }
        Ok(())
    }
}

fn parent_of(path: &Path) -> io::Result<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, "blob path missing parent directory")
    })
}

async fn write_stream<S>(mut file: File, stream: S) -> io::Result<StoredBlob>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();

    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(StoredBlob {
        size_bytes,
        etag: format!("{:x}", digest.compute()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), "http://files.test/");
        (dir, store)
    }

    async fn read_all(store: &BlobStore, key: &str) -> Vec<u8> {
        let mut out = Vec::new();
        store
            .open(key)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn put_overwrites_previous_payload() {
        let (_dir, store) = store();
        store
            .put_bytes("a/b/c.part", Bytes::from_static(b"first"))
            .await
            .unwrap();
        let stored = store
            .put_bytes("a/b/c.part", Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, 6);
        assert_eq!(stored.etag, format!("{:x}", md5::compute(b"second")));
        assert_eq!(read_all(&store, "a/b/c.part").await, b"second");
    }

    #[tokio::test]
    async fn concat_joins_sources_in_order() {
        let (_dir, store) = store();
        for (i, part) in ["he", "llo ", "world"].iter().enumerate() {
            store
                .put_bytes(&format!("u/.chunks/{i}"), Bytes::from(part.to_string()))
                .await
                .unwrap();
        }
        let sources: Vec<String> = (0..3).map(|i| format!("u/.chunks/{i}")).collect();

        let stored = store.concat(&sources, "u/out.txt").await.unwrap();

        assert_eq!(stored.size_bytes, 11);
        assert_eq!(read_all(&store, "u/out.txt").await, b"hello world");
    }

    #[tokio::test]
    async fn concat_with_missing_source_leaves_no_output() {
        let (_dir, store) = store();
        store
            .put_bytes("u/.chunks/0", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let sources = vec!["u/.chunks/0".to_string(), "u/.chunks/1".to_string()];

        let err = store.concat(&sources, "u/out.bin").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            store.open("u/out.bin").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store();
        for key in ["", "/etc/passwd", "a/../b", "a//b", "a\\b", "./a"] {
            let err = store
                .put_bytes(key, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{key:?}");
        }
    }

    #[tokio::test]
    async fn reserve_then_delete_prefix() {
        let (dir, store) = store();
        store.reserve("owner/123-abc").await.unwrap();
        assert!(dir.path().join("owner/123-abc/.keep").exists());

        store.delete_prefix("owner/123-abc").await.unwrap();
        store.delete_prefix("owner/123-abc").await.unwrap();
        assert!(!dir.path().join("owner/123-abc").exists());
    }

    #[tokio::test]
    async fn delete_and_prune_stops_at_non_empty_or_stop_dir() {
        let (dir, store) = store();
        store.reserve("o/1-a").await.unwrap();
        store
            .put_bytes("o/1-a/.chunks/0.part", Bytes::from_static(b"x"))
            .await
            .unwrap();
        store
            .put_bytes("o/1-a/.chunks/1.part", Bytes::from_static(b"y"))
            .await
            .unwrap();

        assert!(store.delete_and_prune("o/1-a/.chunks/0.part", "o/1-a").await.unwrap());
        assert!(dir.path().join("o/1-a/.chunks/1.part").exists());

        assert!(store.delete_and_prune("o/1-a/.chunks/1.part", "o/1-a").await.unwrap());
        assert!(!dir.path().join("o/1-a/.chunks").exists());
        assert!(dir.path().join("o/1-a/.keep").exists());
    }

    #[tokio::test]
    async fn public_url_joins_base_and_key() {
        let (_dir, store) = store();
        assert_eq!(store.public_url("o/k.bin"), "http://files.test/o/k.bin");
        assert!(!store.delete("o/missing").await.unwrap());
        store.probe().await.unwrap();
    }
}
