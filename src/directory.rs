use std::collections::BTreeMap;
use std::io;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::file::{self, FileBackend};
use crate::memory_storage::MemoryStorage;

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
/// A unique identifier for a file.
pub struct FileId {
    /// The group the file belongs to.
    pub group: FileGroup,
    /// The file number assigned by the creator of the file.
    pub file_no: u32,
}

impl std::fmt::Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileId({:?}, {})", self.group, self.file_no)
    }
}

/// The default expected ref count if there are no other
/// access to the file other than the directory.
const DEFAULT_FILE_REF_COUNT: usize = 1;
/// In-memory files are additionally referenced by their storage.
const MEMORY_FILE_REF_COUNT: usize = 2;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
/// The [FileGroup] determines where a file is stored.
pub enum FileGroup {
    /// File is part of the UNDO log of a logfile group.
    Undo,
    /// File contains disk data pages of a tablespace.
    Data,
}

impl FileGroup {
    fn extension(&self) -> &'static str {
        match self {
            FileGroup::Undo => "undo.lnx",
            FileGroup::Data => "dat.lnx",
        }
    }

    fn folder(&self) -> &'static str {
        match self {
            FileGroup::Undo => "undo",
            FileGroup::Data => "data",
        }
    }
}

enum Backing {
    Disk(PathBuf),
    Memory(MemoryStorage),
}

#[derive(Clone)]
/// The [SystemDirectory] tracks all open files of the system and manages
/// creation and removal of files.
pub struct SystemDirectory(Arc<SystemDirectoryInner>);

impl Deref for SystemDirectory {
    type Target = SystemDirectoryInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SystemDirectory {
    /// Open the [SystemDirectory] at a given file path.
    ///
    /// If the folders do not exist, they will be created.
    pub async fn open(base_path: &Path) -> io::Result<Self> {
        for group in [FileGroup::Undo, FileGroup::Data] {
            create_base_dir(&base_path.join(group.folder())).await?;
        }

        let inner = SystemDirectoryInner {
            backing: Backing::Disk(base_path.to_path_buf()),
            files: Mutex::new(BTreeMap::new()),
        };
        Ok(Self(Arc::new(inner)))
    }

    /// Open a [SystemDirectory] backed by in-memory storage.
    pub fn in_memory(storage: MemoryStorage) -> Self {
        let inner = SystemDirectoryInner {
            backing: Backing::Memory(storage),
            files: Mutex::new(BTreeMap::new()),
        };
        Self(Arc::new(inner))
    }
}

pub struct SystemDirectoryInner {
    backing: Backing,
    files: Mutex<BTreeMap<FileId, Arc<dyn FileBackend>>>,
}

impl SystemDirectoryInner {
    /// Create a new empty file in the target group.
    ///
    /// Errors if the file already exists.
    pub async fn create_file(
        &self,
        group: FileGroup,
        file_no: u32,
    ) -> io::Result<file::RWFile> {
        let file_id = FileId { group, file_no };
        let backend: Arc<dyn FileBackend> = match &self.backing {
            Backing::Disk(base_path) => {
                let path = self.file_path(base_path, file_id);
                let file = tokio::task::spawn_blocking(move || {
                    crate::utils::create_file(&path, false)
                })
                .await
                .expect("spawn worker thread")?;
                Arc::new(file)
            },
            Backing::Memory(storage) => storage.create(group, file_no)?,
        };

        tracing::debug!(file_id = ?file_id, "created file");
        self.files.lock().insert(file_id, backend.clone());
        Ok(file::RWFile::new(file_id, backend))
    }

    /// Open an existing file in the target group.
    pub async fn open_file(
        &self,
        group: FileGroup,
        file_no: u32,
    ) -> io::Result<file::RWFile> {
        let file_id = FileId { group, file_no };
        if let Some(backend) = self.files.lock().get(&file_id).cloned() {
            return Ok(file::RWFile::new(file_id, backend));
        }

        let backend: Arc<dyn FileBackend> = match &self.backing {
            Backing::Disk(base_path) => {
                let path = self.file_path(base_path, file_id);
                let file = tokio::task::spawn_blocking(move || open_file(&path))
                    .await
                    .expect("spawn worker thread")?;
                Arc::new(file)
            },
            Backing::Memory(storage) => storage.open(group, file_no)?,
        };

        self.files.lock().insert(file_id, backend.clone());
        Ok(file::RWFile::new(file_id, backend))
    }

    /// Remove an existing file in the target group.
    ///
    /// The file must not currently be in use by any other systems otherwise this call
    /// will error.
    pub async fn remove_file(&self, group: FileGroup, file_no: u32) -> io::Result<()> {
        let file_id = FileId { group, file_no };
        {
            let mut files = self.files.lock();
            let expected_ref_count = match &self.backing {
                Backing::Disk(_) => DEFAULT_FILE_REF_COUNT,
                Backing::Memory(_) => MEMORY_FILE_REF_COUNT,
            };
            if let Some(backend) = files.get(&file_id)
                && Arc::strong_count(backend) > expected_ref_count
            {
                return Err(io::Error::new(
                    ErrorKind::ResourceBusy,
                    "file is still in use",
                ));
            }
            files.remove(&file_id);
        }

        match &self.backing {
            Backing::Disk(base_path) => {
                let path = self.file_path(base_path, file_id);
                tokio::task::spawn_blocking(move || std::fs::remove_file(&path))
                    .await
                    .expect("spawn worker thread")
            },
            Backing::Memory(storage) => storage.remove(group, file_no),
        }
    }

    /// List all file numbers present in the group.
    pub async fn list_dir(&self, group: FileGroup) -> io::Result<Vec<u32>> {
        match &self.backing {
            Backing::Disk(base_path) => {
                let path = base_path.join(group.folder());
                tokio::task::spawn_blocking(move || list_files(group, &path))
                    .await
                    .expect("spawn worker thread")
            },
            Backing::Memory(storage) => Ok(storage.list_files(group)),
        }
    }

    /// Get the file path of a file with a given ID.
    fn file_path(&self, base_path: &Path, file_id: FileId) -> PathBuf {
        let file_no = file_id.file_no;
        let file_name = format!("{file_no:010}-{file_no}.{}", file_id.group.extension());
        base_path.join(file_id.group.folder()).join(file_name)
    }
}

async fn create_base_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::create_dir_all(&path))
        .await
        .expect("spawn worker thread")
}

fn open_file(path: &Path) -> io::Result<std::fs::File> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .read(true)
        .open(path)?;

    // On open, we always issue a full fsync to ensure we don't have random
    // fragments sitting around from a process crash.
    file.sync_all()?;

    Ok(file)
}

#[tracing::instrument(skip(path))]
fn list_files(file_group: FileGroup, path: &Path) -> io::Result<Vec<u32>> {
    let mut file_nos = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let path = entry.path();

        if metadata.is_dir() {
            tracing::warn!(
                path = %path.display(),
                "unexpected directory present in system files",
            );
            continue;
        }

        let raw_file_name = entry.file_name();
        let file_name = raw_file_name.to_string_lossy();
        if !file_name.ends_with(file_group.extension()) {
            tracing::warn!(
                path = %path.display(),
                "unexpected file present in system files",
            );
            continue;
        }

        let Some((_sort_id, remaining)) = file_name.split_once('-') else {
            tracing::warn!(path = %path.display(), "malformed file name");
            continue;
        };
        let Some((file_no, _remaining)) = remaining.split_once('.') else {
            tracing::warn!(path = %path.display(), "malformed file name");
            continue;
        };

        let file_no = file_no.parse::<u32>().map_err(|e| {
            io::Error::new(ErrorKind::InvalidData, format!("invalid file no present: {e}"))
        })?;

        file_nos.push(file_no);
    }

    file_nos.sort_unstable();
    Ok(file_nos)
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::undo(FileGroup::Undo)]
    #[case::data(FileGroup::Data)]
    #[tokio::test]
    async fn test_disk_directory_create_list_remove(#[case] group: FileGroup) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let directory = SystemDirectory::open(tmp_dir.path()).await.unwrap();

        let file = directory.create_file(group, 7).await.unwrap();
        assert_eq!(file.id(), FileId { group, file_no: 7 });
        drop(file);

        let err = directory.create_file(group, 7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        directory.create_file(group, 3).await.unwrap();
        assert_eq!(directory.list_dir(group).await.unwrap(), vec![3, 7]);

        directory.remove_file(group, 7).await.unwrap();
        assert_eq!(directory.list_dir(group).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_remove_file_in_use() {
        let directory = SystemDirectory::in_memory(MemoryStorage::new());
        let file = directory.create_file(FileGroup::Undo, 1).await.unwrap();

        let err = directory.remove_file(FileGroup::Undo, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);

        drop(file);
        directory.remove_file(FileGroup::Undo, 1).await.unwrap();
        assert!(directory.list_dir(FileGroup::Undo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_existing_file_reads_written_data() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let directory = SystemDirectory::open(tmp_dir.path()).await.unwrap();
        let file = directory.create_file(FileGroup::Data, 1).await.unwrap();
        file.write_at(b"hello".to_vec(), 0).await.unwrap();
        file.sync_data().await.unwrap();
        drop(file);

        let reopened = SystemDirectory::open(tmp_dir.path()).await.unwrap();
        let file = reopened.open_file(FileGroup::Data, 1).await.unwrap();
        let data = file.read_at(5, 0).await.unwrap();
        assert_eq!(data, b"hello");
    }
}
