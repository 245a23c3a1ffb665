use serde::{de::DeserializeOwned, Serialize};
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions, TryLockError},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::warn;

const LOCK_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock on {} not acquired within {waited:?}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

/* ====== Файловая блокировка ======
   Лочим соседний файл `<target>.lock`, а не сам target: target переписывается
   через rename и меняет inode. Блокировка снимается в Drop на любом пути выхода. */
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn shared(target: &Path, timeout: Duration) -> Result<Self, StoreError> {
        Self::acquire(target, timeout, LockKind::Shared)
    }

    pub fn exclusive(target: &Path, timeout: Duration) -> Result<Self, StoreError> {
        Self::acquire(target, timeout, LockKind::Exclusive)
    }

    fn acquire(target: &Path, timeout: Duration, kind: LockKind) -> Result<Self, StoreError> {
        let path = with_suffix(target, ".lock");
        ensure_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = match kind {
                LockKind::Shared => file.try_lock_shared(),
                LockKind::Exclusive => file.try_lock(),
            };
            match attempt {
                Ok(()) => return Ok(Self { file, path }),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => thread::sleep(LOCK_POLL),
                Err(TryLockError::WouldBlock) => {
                    return Err(StoreError::LockTimeout { path, waited: timeout })
                }
                Err(TryLockError::Error(e)) => return Err(StoreError::io(&path, e)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}

/* ====== Атомарная запись снапшота (tmp + rename) ====== */
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let tmp = with_suffix(path, ".tmp");
    let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Нет файла или он пустой — значение по умолчанию. Битый JSON — ошибка,
/// молча терять леджер нельзя.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&data).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Запуск блокирующей файловой работы вне async-потоков.
pub async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| E::from(StoreError::Join(e)))?
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn exclusive_lock_times_out_instead_of_hanging() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ledger.csv");
        let _held = FileLock::exclusive(&target, Duration::from_millis(100)).unwrap();

        let started = Instant::now();
        let second = FileLock::exclusive(&target, Duration::from_millis(80));
        assert!(matches!(second, Err(StoreError::LockTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));

        let reader = FileLock::shared(&target, Duration::from_millis(50));
        assert!(matches!(reader, Err(StoreError::LockTimeout { .. })));
    }

    #[test]
    fn shared_locks_coexist_and_release_on_drop() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ledger.csv");
        {
            let _a = FileLock::shared(&target, Duration::from_millis(50)).unwrap();
            let _b = FileLock::shared(&target, Duration::from_millis(50)).unwrap();
        }
        let _w = FileLock::exclusive(&target, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn json_snapshot_defaults_and_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        assert_eq!(read_json_or_default::<Doc>(&path).unwrap(), Doc::default());

        write_json_atomic(&path, &Doc { n: 7 }).unwrap();
        assert_eq!(read_json_or_default::<Doc>(&path).unwrap(), Doc { n: 7 });
        assert!(!with_suffix(&path, ".tmp").exists());

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(read_json_or_default::<Doc>(&path), Err(StoreError::Json { .. })));
    }
}
