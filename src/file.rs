use std::any::type_name;
use std::fmt::Formatter;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::directory::FileId;

/// A read only file.
pub type ROFile = File<RO>;
/// A read/write file.
pub type RWFile = File<RW>;

/// Read mode.
pub struct RO;
impl FileMode for RO {}
impl sealed::Sealed for RO {}

/// Read/write mode.
pub struct RW;
impl FileMode for RW {}
impl sealed::Sealed for RW {}

/// The file mode.
pub trait FileMode: sealed::Sealed {}

/// Positional, blocking IO against some storage medium.
///
/// Implementations are always driven from a blocking worker thread and
/// never from within the async runtime directly.
pub trait FileBackend: Send + Sync + 'static {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` starting at `offset`.
    ///
    /// The data is not guaranteed to be durable until [FileBackend::sync_data]
    /// returns successfully.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Make all previously written data durable.
    fn sync_data(&self) -> io::Result<()>;

    /// Returns the length of the file in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Truncate or extend the file to `len` bytes.
    fn set_len(&self, len: u64) -> io::Result<()>;
}

impl FileBackend for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    fn sync_data(&self) -> io::Result<()> {
        std::fs::File::sync_data(self)
    }

    fn len(&self) -> io::Result<u64> {
        self.metadata().map(|metadata| metadata.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        std::fs::File::set_len(self, len)
    }
}

/// An open file handle.
///
/// All IO is executed on the blocking thread pool, the calling task is
/// suspended until the operation completes.
pub struct File<M> {
    id: FileId,
    backend: Arc<dyn FileBackend>,
    _mode: PhantomData<M>,
}

impl<M> Clone for File<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            backend: self.backend.clone(),
            _mode: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for File<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "File(mode={}, id={:?})", type_name::<M>(), self.id)
    }
}

impl<M> File<M> {
    pub(crate) fn new(id: FileId, backend: Arc<dyn FileBackend>) -> Self {
        Self {
            id,
            backend,
            _mode: PhantomData,
        }
    }

    #[cfg(test)]
    #[inline]
    /// Returns the unique ID of the file.
    pub fn id(&self) -> FileId {
        self.id
    }
}

impl<M: FileMode> File<M> {
    /// Read `len` bytes starting at `offset`.
    pub async fn read_at(&self, len: usize, offset: u64) -> io::Result<Vec<u8>> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("file::ro::read_at", crate::utils::parse_io_error_return);

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0; len];
            backend.read_at(&mut buffer, offset)?;
            Ok(buffer)
        })
        .await
        .expect("spawn worker thread")
    }

    /// Returns the true length of the file.
    pub async fn get_len(&self) -> io::Result<u64> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("file::ro::get_len", crate::utils::parse_io_error_return);

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.len())
            .await
            .expect("spawn worker thread")
    }
}

impl File<RW> {
    /// Write the buffer to the file at the target offset.
    ///
    /// The write is not durable until [File::sync_data] completes.
    pub async fn write_at(&self, buffer: Vec<u8>, offset: u64) -> io::Result<()> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("file::rw::write_at", crate::utils::parse_io_error_return);

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.write_at(&buffer, offset))
            .await
            .expect("spawn worker thread")
    }

    /// Flush all written data to durable storage.
    pub async fn sync_data(&self) -> io::Result<()> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("file::rw::sync_data", crate::utils::parse_io_error_return);

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.sync_data())
            .await
            .expect("spawn worker thread")
    }

    /// Set the length of the file, newly allocated space reads as zeroes.
    pub async fn set_len(&self, len: u64) -> io::Result<()> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("file::rw::set_len", crate::utils::parse_io_error_return);

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.set_len(len))
            .await
            .expect("spawn worker thread")
    }
}

impl From<RWFile> for ROFile {
    fn from(file: RWFile) -> Self {
        Self {
            id: file.id,
            backend: file.backend,
            _mode: PhantomData,
        }
    }
}

mod sealed {
    pub trait Sealed: Send + Sync + 'static {}
}
