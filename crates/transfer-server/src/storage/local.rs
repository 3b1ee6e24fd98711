use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tracing::debug;

use super::{
    validate_name, FileEntry, FileHandle, ReadStream, SharedFolder, StorageError, WriteStream,
};

/// Shared folder backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFolder {
    root: PathBuf,
}

impl LocalFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `name` inside the folder after validating the root is usable.
    async fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        self.check_access().await?;
        Ok(self.root.join(name))
    }

    fn access_error(&self, err: std::io::Error) -> StorageError {
        StorageError::Access(format!("{}: {err}", self.root.display()))
    }
}

#[async_trait]
impl SharedFolder for LocalFolder {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn check_access(&self) -> Result<(), StorageError> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| self.access_error(e))?;
        if !meta.is_dir() {
            return Err(StorageError::Access(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        fs::read_dir(&self.root)
            .await
            .map_err(|e| self.access_error(e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FileEntry>, StorageError> {
        self.check_access().await?;
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.access_error(e))?;

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(|e| self.access_error(e))? {
            let Ok(name) = item.file_name().into_string() else {
                debug!(path = %item.path().display(), "skipping non-UTF-8 file name");
                continue;
            };
            // Follows symlinks; dangling links and unreadable entries are skipped.
            let meta = match fs::metadata(item.path()).await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            entries.push(FileEntry {
                mime: mime_guess::from_path(&name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_owned(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn find(&self, name: &str) -> Result<Option<FileEntry>, StorageError> {
        let path = self.resolve(name).await?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileEntry {
                name: name.to_owned(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                mime: mime_guess::from_path(name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_owned(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, name: &str) -> Result<FileHandle, StorageError> {
        let path = self.resolve(name).await?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(FileHandle::new(name)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(name.to_owned()))
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(self.access_error(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.resolve(name).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(self.access_error(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, handle: &FileHandle) -> Result<ReadStream, StorageError> {
        let path = self.resolve(handle.name()).await?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.name().to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_write(&self, handle: &FileHandle) -> Result<WriteStream, StorageError> {
        let path = self.resolve(handle.name()).await?;
        match OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await
        {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.name().to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_folder() -> (LocalFolder, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (LocalFolder::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn list_returns_sorted_regular_files_only() {
        let (folder, dir) = make_folder();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let entries = folder.list().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.txt"]);
        assert_eq!(entries[0].mime, "image/png");
        assert_eq!(entries[1].size, 2);
    }

    #[tokio::test]
    async fn create_never_replaces() {
        let (folder, _dir) = make_folder();
        folder.create("x.bin").await.unwrap();
        assert!(matches!(
            folder.create("x.bin").await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (folder, _dir) = make_folder();
        let handle = folder.create("note.txt").await.unwrap();
        let mut w = folder.open_write(&handle).await.unwrap();
        w.write_all(b"hello").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);

        let mut r = folder.open_read(&handle).await.unwrap();
        let mut buf = String::new();
        r.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello");

        let entry = folder.find("note.txt").await.unwrap().unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(entry.mime, "text/plain");
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let (folder, dir) = make_folder();
        std::fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        assert!(folder.delete("gone.txt").await.unwrap());
        assert!(!folder.delete("gone.txt").await.unwrap());
        assert!(folder.find("gone.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_ignores_directories() {
        let (folder, dir) = make_folder();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(folder.find("sub").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_read_missing_is_not_found() {
        let (folder, _dir) = make_folder();
        let res = folder.open_read(&FileHandle::new("nope")).await;
        assert!(matches!(res, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn vanished_root_is_access_error() {
        let (folder, dir) = make_folder();
        drop(dir);
        assert!(matches!(
            folder.check_access().await,
            Err(StorageError::Access(_))
        ));
        assert!(matches!(folder.list().await, Err(StorageError::Access(_))));
        assert!(matches!(
            folder.create("late.txt").await,
            Err(StorageError::Access(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_only_folder_can_still_be_browsed() {
        use std::os::unix::fs::PermissionsExt;

        let (folder, dir) = make_folder();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();

        let listed = folder.list().await;
        let found = folder.find("a.txt").await;
        let opened = folder.open_read(&FileHandle::new("a.txt")).await.is_ok();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(folder.check_access().await.is_ok());
        assert_eq!(listed.unwrap().len(), 1);
        assert_eq!(found.unwrap().unwrap().size, 3);
        assert!(opened);
    }

    #[tokio::test]
    async fn traversal_names_are_rejected_before_touching_disk() {
        let (folder, _dir) = make_folder();
        assert!(matches!(
            folder.create("../escape.txt").await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            folder.delete("..").await,
            Err(StorageError::InvalidName(_))
        ));
    }
}
