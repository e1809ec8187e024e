use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::directory::SystemDirectory;
use crate::memory_storage::MemoryStorage;

enum StorageTarget {
    Disk(PathBuf),
    Memory(MemoryStorage),
}

/// Create a new [Context] instance with options.
pub struct ContextBuilder {
    target: StorageTarget,
}

impl ContextBuilder {
    /// Creates a new [ContextBuilder] with a provided base path.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            target: StorageTarget::Disk(base_path.as_ref().to_path_buf()),
        }
    }

    /// Creates a new [ContextBuilder] storing all files in the given [MemoryStorage].
    pub fn in_memory(storage: MemoryStorage) -> Self {
        Self {
            target: StorageTarget::Memory(storage),
        }
    }

    /// Open the context.
    pub async fn open(self) -> io::Result<Context> {
        let (directory, guard_file) = match self.target {
            StorageTarget::Disk(base_path) => {
                let directory = SystemDirectory::open(&base_path).await?;
                let guard_file = acquire_guard_file(&base_path)?;
                (directory, Some(guard_file))
            },
            StorageTarget::Memory(storage) => (SystemDirectory::in_memory(storage), None),
        };

        Ok(Context {
            directory,
            configs: parking_lot::RwLock::new(BTreeMap::new()),
            _guard_file: guard_file,
        })
    }
}

fn acquire_guard_file(base_path: &Path) -> io::Result<std::fs::File> {
    static GUARD_FILE: &str = ".lnx-diskdata-guard";
    let guard_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(base_path.join(GUARD_FILE))?;

    guard_file.try_lock().map_err(|_| {
        io::Error::new(
            io::ErrorKind::ResourceBusy,
            "system already open on this directory",
        )
    })?;
    tracing::info!("acquired guard file lock");
    Ok(guard_file)
}

/// The context owns the state shared by the log and page cache managers of a node.
pub struct Context {
    directory: SystemDirectory,
    configs: parking_lot::RwLock<BTreeMap<TypeId, Box<dyn Any + Send + Sync>>>,
    _guard_file: Option<std::fs::File>,
}

impl Context {
    #[cfg(test)]
    /// Create a new context backed by a fresh in-memory storage for testing.
    pub(crate) fn for_test() -> std::sync::Arc<Self> {
        Self::for_test_with_storage(MemoryStorage::new())
    }

    #[cfg(test)]
    /// Create a new context using the given storage for testing.
    pub(crate) fn for_test_with_storage(storage: MemoryStorage) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            directory: SystemDirectory::in_memory(storage),
            configs: parking_lot::RwLock::new(BTreeMap::new()),
            _guard_file: None,
        })
    }

    #[inline]
    /// Returns a reference to the [SystemDirectory].
    pub(crate) fn directory(&self) -> &SystemDirectory {
        &self.directory
    }

    /// Set a config value in the context.
    pub fn set_config<C: Any + Send + Sync + Clone>(&self, config: C) {
        let config_value = Box::new(config) as Box<dyn Any + Send + Sync>;
        self.configs.write().insert(TypeId::of::<C>(), config_value);
    }

    #[cfg(test)]
    #[track_caller]
    /// Get a config value from the context.
    ///
    /// Panics if the config does not exist.
    pub(crate) fn config<C: Any + Send + Sync + Clone>(&self) -> C {
        self.config_opt().expect("config not initialized")
    }

    /// Get a config value from the context if it has been set.
    pub(crate) fn config_opt<C: Any + Send + Sync + Clone>(&self) -> Option<C> {
        self.configs
            .read()
            .get(&TypeId::of::<C>())
            .and_then(|config| config.downcast_ref())
            .cloned()
    }
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;
    use crate::config::LgmanConfig;

    #[tokio::test]
    async fn test_config_system_opt() {
        let ctx = Context::for_test();
        assert!(ctx.config_opt::<()>().is_none());
        ctx.set_config(());
        assert!(ctx.config_opt::<()>().is_some());
    }

    #[tokio::test]
    async fn test_config_replaced() {
        let ctx = Context::for_test();
        ctx.set_config(LgmanConfig {
            buffer_pages: 4,
            ..Default::default()
        });
        ctx.set_config(LgmanConfig {
            buffer_pages: 9,
            ..Default::default()
        });
        assert_eq!(ctx.config::<LgmanConfig>().buffer_pages, 9);
    }

    #[should_panic(expected = "config not initialized")]
    #[tokio::test]
    async fn test_config_system_config_panics() {
        let ctx = Context::for_test();
        ctx.config::<()>();
    }

    #[tokio::test]
    async fn test_guard_file_prevents_second_open() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let _ctx = ContextBuilder::new(tmp_dir.path()).open().await.unwrap();

        let err = ContextBuilder::new(tmp_dir.path())
            .open()
            .await
            .err()
            .expect("second open should fail");
        assert_eq!(err.kind(), io::ErrorKind::ResourceBusy);
    }
}
