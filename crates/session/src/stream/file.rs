//! Local file streams.
//!
//! Paths requested by the engine are resolved inside a [`FileStore`]. The
//! default store confines every path to one root directory.

use super::io::{IoReader, IoWriter};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio::fs::OpenOptions;
use tracing::debug;
use wisp_platform::{ByteStream, StreamKind, WispError, WispResult};

/// How a file is opened, using the `fopen` mode letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`: read an existing file.
    Read,
    /// `w`: truncate or create, write only.
    Write,
    /// `a`: append, creating if missing.
    Append,
    /// `r+`: read and write an existing file.
    ReadWrite,
    /// `w+`: truncate or create, read and write.
    ReadWriteTruncate,
    /// `a+`: read and append, creating if missing.
    ReadAppend,
}

impl OpenMode {
    /// Returns the mode letters.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::Write => "w",
            OpenMode::Append => "a",
            OpenMode::ReadWrite => "r+",
            OpenMode::ReadWriteTruncate => "w+",
            OpenMode::ReadAppend => "a+",
        }
    }

    fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::Write => {
                opts.write(true).create(true).truncate(true);
            }
            OpenMode::Append => {
                opts.append(true).create(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
            OpenMode::ReadWriteTruncate => {
                opts.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::ReadAppend => {
                opts.read(true).append(true).create(true);
            }
        }
        opts
    }
}

impl FromStr for OpenMode {
    type Err = WispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "b" is meaningless here; accept it the way fopen does.
        let letters: String = s.chars().filter(|c| *c != 'b').collect();
        match letters.as_str() {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadWrite),
            "w+" => Ok(OpenMode::ReadWriteTruncate),
            "a+" => Ok(OpenMode::ReadAppend),
            _ => Err(WispError::InvalidParameters(format!(
                "unsupported open mode '{}'",
                s
            ))),
        }
    }
}

/// Storage backend for file descriptors.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Opens `path` with `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::NotFound`] or [`WispError::PermissionDenied`]
    /// when the file cannot be opened.
    async fn open(&self, path: &str, mode: OpenMode) -> WispResult<ByteStream>;
}

/// A [`FileStore`] rooted at one directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a requested path onto the root, refusing anything that escapes it.
    pub fn resolve(&self, path: &str) -> WispResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(WispError::PermissionDenied(format!(
                        "'{}' escapes the file store",
                        path
                    )))
                }
            }
        }
        if resolved == self.root {
            return Err(WispError::InvalidParameters(format!(
                "'{}' does not name a file",
                path
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl FileStore for DirectoryStore {
    async fn open(&self, path: &str, mode: OpenMode) -> WispResult<ByteStream> {
        let resolved = self.resolve(path)?;
        let file = mode.options().open(&resolved).await?;
        debug!(path, mode = mode.as_str(), "opened file");

        let (reader, writer) = tokio::io::split(file);
        Ok(ByteStream::new(
            StreamKind::LocalFile,
            path,
            Box::new(IoReader::new(reader)),
            Box::new(IoWriter::new(writer)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_platform::ReadOutcome;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("rb".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("w+".parse::<OpenMode>().unwrap(), OpenMode::ReadWriteTruncate);
        assert_eq!("a+".parse::<OpenMode>().unwrap(), OpenMode::ReadAppend);
        assert!("x".parse::<OpenMode>().is_err());
        assert!("".parse::<OpenMode>().is_err());
    }

    #[test]
    fn test_resolve_confines_paths() {
        let store = DirectoryStore::new("/srv/wisp");
        assert_eq!(
            store.resolve("/.ssh/known_hosts").unwrap(),
            PathBuf::from("/srv/wisp/.ssh/known_hosts")
        );
        assert_eq!(
            store.resolve("./notes.txt").unwrap(),
            PathBuf::from("/srv/wisp/notes.txt")
        );
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(WispError::PermissionDenied(_))
        ));
        assert!(matches!(
            store.resolve("/a/../../b"),
            Err(WispError::PermissionDenied(_))
        ));
        assert!(store.resolve("/").is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());

        let mut out = store.open("/notes.txt", OpenMode::Write).await.unwrap();
        assert_eq!(out.kind(), StreamKind::LocalFile);
        out.write_all(b"first line\n").await.unwrap();
        out.close().await.unwrap();

        let mut out = store.open("/notes.txt", OpenMode::Append).await.unwrap();
        out.write_all(b"second line\n").await.unwrap();
        out.close().await.unwrap();

        let mut input = store.open("/notes.txt", OpenMode::Read).await.unwrap();
        let mut contents = Vec::new();
        while let ReadOutcome::Data(chunk) = input.read(5).await.unwrap() {
            contents.extend_from_slice(&chunk);
        }
        assert_eq!(contents, b"first line\nsecond line\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let err = store.open("/absent", OpenMode::Read).await.unwrap_err();
        assert!(matches!(err, WispError::NotFound(_)), "{:?}", err);
    }
}
