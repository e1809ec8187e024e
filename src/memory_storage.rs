//! An in-memory storage backend which models the durability guarantees
//! of a real file system.
//!
//! Writes are buffered per file until `sync_data` is called, a crash image
//! only contains data which was made durable. This lets the restart code be
//! exercised against the same partially written states a power loss produces.

use std::collections::BTreeMap;
use std::io;
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::directory::FileGroup;
use crate::file::FileBackend;
use crate::layout::PAGE_SIZE;

/// A hook invoked before every write reaches a file.
///
/// Arguments are the file group, file number, byte offset and the written bytes.
/// Returning an error fails the write without changing the file.
pub type WriteObserver =
    Arc<dyn Fn(FileGroup, u32, u64, &[u8]) -> io::Result<()> + Send + Sync>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The kind of damage to apply to a page of a crash image.
pub enum PageDamage {
    /// The page was never written, it reads back as zeroes.
    Unwritten,
    /// Only the first half of the page reached the disk.
    Torn,
}

#[derive(Clone, Default)]
/// Shared handle to a set of in-memory files.
pub struct MemoryStorage(Arc<MemoryStorageInner>);

#[derive(Default)]
struct MemoryStorageInner {
    files: Mutex<BTreeMap<(FileGroup, u32), Arc<MemoryFile>>>,
    observer: RwLock<Option<WriteObserver>>,
}

impl MemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the observer called for every write.
    pub fn set_write_observer(&self, observer: Option<WriteObserver>) {
        *self.0.observer.write() = observer;
    }

    /// Produce the storage state as it would be seen after a power loss.
    ///
    /// Any data written but not synced is discarded.
    pub fn crash_image(&self) -> MemoryStorage {
        let files = self.0.files.lock();
        let image = MemoryStorage::new();
        let mut image_files = image.0.files.lock();
        for (key, file) in files.iter() {
            let durable = file.state.lock().durable.clone();
            let copy = MemoryFile::new(key.0, key.1, image.0.clone(), durable);
            image_files.insert(*key, Arc::new(copy));
        }
        drop(image_files);
        image
    }

    /// Damage a page of a file, both the durable and visible state are changed.
    pub fn damage_page(
        &self,
        group: FileGroup,
        file_no: u32,
        page_no: u32,
        damage: PageDamage,
    ) -> io::Result<()> {
        let file = self.get(group, file_no)?;
        let mut state = file.state.lock();
        state.flush_pending();

        let start = page_no as usize * PAGE_SIZE;
        let end = start + PAGE_SIZE;
        if end > state.durable.len() {
            return Err(io::Error::from(ErrorKind::UnexpectedEof));
        }

        let damaged_start = match damage {
            PageDamage::Unwritten => start,
            PageDamage::Torn => start + PAGE_SIZE / 2,
        };
        state.durable[damaged_start..end].fill(0);
        state.visible[damaged_start..end].fill(0);
        Ok(())
    }

    /// Returns the list of file numbers within the group.
    pub fn list_files(&self, group: FileGroup) -> Vec<u32> {
        self.0
            .files
            .lock()
            .keys()
            .filter(|(file_group, _)| *file_group == group)
            .map(|(_, file_no)| *file_no)
            .collect()
    }

    /// Returns a copy of the durable contents of a file.
    pub fn durable_contents(&self, group: FileGroup, file_no: u32) -> io::Result<Vec<u8>> {
        let file = self.get(group, file_no)?;
        Ok(file.state.lock().durable.clone())
    }

    pub(crate) fn create(
        &self,
        group: FileGroup,
        file_no: u32,
    ) -> io::Result<Arc<dyn FileBackend>> {
        let mut files = self.0.files.lock();
        if files.contains_key(&(group, file_no)) {
            return Err(io::Error::from(ErrorKind::AlreadyExists));
        }
        let file = Arc::new(MemoryFile::new(group, file_no, self.0.clone(), Vec::new()));
        files.insert((group, file_no), file.clone());
        Ok(file)
    }

    pub(crate) fn open(
        &self,
        group: FileGroup,
        file_no: u32,
    ) -> io::Result<Arc<dyn FileBackend>> {
        self.get(group, file_no).map(|file| file as Arc<dyn FileBackend>)
    }

    pub(crate) fn remove(&self, group: FileGroup, file_no: u32) -> io::Result<()> {
        self.0.files.lock().remove(&(group, file_no));
        Ok(())
    }

    fn get(&self, group: FileGroup, file_no: u32) -> io::Result<Arc<MemoryFile>> {
        self.0
            .files
            .lock()
            .get(&(group, file_no))
            .cloned()
            .ok_or_else(|| io::Error::from(ErrorKind::NotFound))
    }
}

struct MemoryFile {
    group: FileGroup,
    file_no: u32,
    storage: Arc<MemoryStorageInner>,
    state: Mutex<MemoryFileState>,
}

impl MemoryFile {
    fn new(
        group: FileGroup,
        file_no: u32,
        storage: Arc<MemoryStorageInner>,
        contents: Vec<u8>,
    ) -> Self {
        let state = MemoryFileState {
            visible: contents.clone(),
            durable: contents,
            pending: Vec::new(),
            pending_len: None,
        };
        Self {
            group,
            file_no,
            storage,
            state: Mutex::new(state),
        }
    }
}

struct MemoryFileState {
    /// What readers of the file observe.
    visible: Vec<u8>,
    /// What survives a crash.
    durable: Vec<u8>,
    pending: Vec<(u64, Vec<u8>)>,
    pending_len: Option<u64>,
}

impl MemoryFileState {
    fn flush_pending(&mut self) {
        if let Some(len) = self.pending_len.take() {
            self.durable.resize(len as usize, 0);
        }
        for (offset, data) in self.pending.drain(..) {
            write_into(&mut self.durable, offset, &data);
        }
    }
}

fn write_into(target: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let start = offset as usize;
    let end = start + data.len();
    if target.len() < end {
        target.resize(end, 0);
    }
    target[start..end].copy_from_slice(data);
}

impl FileBackend for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let state = self.state.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > state.visible.len() {
            return Err(io::Error::from(ErrorKind::UnexpectedEof));
        }
        buf.copy_from_slice(&state.visible[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let observer = self.storage.observer.read().clone();
        if let Some(observer) = observer {
            observer(self.group, self.file_no, offset, buf)?;
        }

        let mut state = self.state.lock();
        write_into(&mut state.visible, offset, buf);
        state.pending.push((offset, buf.to_vec()));
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        self.state.lock().flush_pending();
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.state.lock().visible.len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        state.visible.resize(len as usize, 0);
        state.pending_len = Some(len);
        Ok(())
    }
}
