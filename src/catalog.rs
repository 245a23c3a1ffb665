use crate::channels::ChannelDirectory;
use crate::fsio::{self, FileLock, StoreError};
use crate::text::{normalize, similarity};
use crate::validate::{self, ValidationError};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const LEDGER_HEADER: [&str; 3] = ["movie_name", "message_id", "channel_id"];

pub const EXACT_SCORE: f64 = 100.0;
pub const SUBSTRING_SCORE: f64 = 80.0;
pub const FUZZY_THRESHOLD: f64 = 60.0;
pub const MAX_GROUPS: usize = 10;

/* ====== Запись каталога ====== */

/// Фильм → сообщение в канале-источнике. После добавления не меняется.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    movie_name: String,
    message_id: i32,
    channel_id: i64,
}

impl CatalogRecord {
    pub fn new(movie_name: &str, message_id: i32, channel_id: i64) -> Result<Self, ValidationError> {
        Ok(Self {
            movie_name: validate::validate_movie_name(movie_name)?,
            message_id: validate::validate_message_id(message_id)?,
            channel_id: validate::validate_channel_id(channel_id)?,
        })
    }

    // строки леджера уже прошли проверку при добавлении
    fn from_ledger(movie_name: &str, message_id: i32, channel_id: i64) -> Self {
        Self { movie_name: movie_name.to_string(), message_id, channel_id }
    }

    pub fn movie_name(&self) -> &str {
        &self.movie_name
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("channel {0} is not a configured source")]
    UnknownChannel(i64),
    #[error("catalog header is corrupt: {0:?}")]
    CorruptHeader(Vec<String>),
    #[error("catalog row codec: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CatalogError {
    /// Ошибка входных данных (а не инфраструктуры).
    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::UnknownChannel(_))
    }
}

/// Снимок всего каталога для поиска.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<CatalogRecord>,
    pub built_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.built_at
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.age().to_std().is_ok_and(|age| age <= ttl)
    }
}

/// Группа результатов поиска: все записи с одинаковым нормализованным названием.
#[derive(Debug, Clone)]
pub struct SearchGroup {
    pub key: String,
    pub score: f64,
    pub records: Vec<CatalogRecord>,
}

impl SearchGroup {
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Название для показа: как в первом найденном посте.
    pub fn title(&self) -> &str {
        self.records.first().map(|r| r.movie_name()).unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone)]
pub struct CatalogStats {
    pub total: usize,
    pub per_channel: BTreeMap<i64, usize>,
    pub cache_age: Duration,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub ledger_path: PathBuf,
    pub cache_path: PathBuf,
    pub buffer_threshold: usize,
    pub cache_ttl: Duration,
    pub lock_timeout: Duration,
}

impl CatalogSettings {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ledger_path: dir.join("catalog.csv"),
            cache_path: dir.join("catalog_cache.json"),
            buffer_threshold: 50,
            cache_ttl: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/* ====== Хранилище каталога ======
   Один экземпляр на процесс, раздаётся хендлерам клоном (внутри Arc).
   Буфер записи принадлежит хранилищу; поиск читает только через кэш. */
#[derive(Clone)]
pub struct CatalogStore {
    inner: Arc<Inner>,
}

struct Inner {
    settings: CatalogSettings,
    channels: ChannelDirectory,
    buffer: Mutex<Vec<CatalogRecord>>,
    cache: Cache<(), Arc<Snapshot>>,
    // заполнение кэша (память + файл) и инвалидация не пересекаются
    fill: Mutex<()>,
}

impl CatalogStore {
    pub fn new(settings: CatalogSettings, channels: ChannelDirectory) -> Self {
        let cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(settings.cache_ttl)
            .build();
        Self {
            inner: Arc::new(Inner {
                settings,
                channels,
                buffer: Mutex::new(Vec::new()),
                cache,
                fill: Mutex::new(()),
            }),
        }
    }

    pub fn channels(&self) -> &ChannelDirectory {
        &self.inner.channels
    }

    /// Добавить запись. Любое невалидное поле — отказ без записи.
    /// Кэш сбрасывается всегда, даже если физический flush отложен.
    pub async fn append(
        &self,
        movie_name: &str,
        message_id: i32,
        channel_id: i64,
    ) -> Result<CatalogRecord, CatalogError> {
        let record = CatalogRecord::new(movie_name, message_id, channel_id)?;
        if !self.inner.channels.contains(channel_id) {
            return Err(CatalogError::UnknownChannel(channel_id));
        }

        let pending = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push(record.clone());
            buffer.len()
        };
        if pending >= self.inner.settings.buffer_threshold {
            // запись уже в буфере, её покажет read() и сбросит следующий flush
            if let Err(e) = self.flush().await {
                error!(error = %e, pending, "threshold flush failed");
            }
        }
        self.invalidate().await;

        info!(
            movie = %record.movie_name,
            message_id = record.message_id,
            channel_id = record.channel_id,
            "catalog record appended"
        );
        Ok(record)
    }

    /// Дописать буфер в леджер под эксклюзивной блокировкой.
    /// Пустой буфер — no-op. Битая строка пропускается, остальные пишутся.
    pub async fn flush(&self) -> Result<usize, CatalogError> {
        let mut buffer = self.inner.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(0);
        }
        let rows = buffer.clone();
        let path = self.inner.settings.ledger_path.clone();
        let timeout = self.inner.settings.lock_timeout;
        let written = fsio::blocking(move || append_rows(&path, &rows, timeout)).await?;

        debug!(written, attempted = buffer.len(), "catalog buffer flushed");
        buffer.clear();
        Ok(written)
    }

    /// Все записи леджера плюс ещё не сброшенный буфер (read-after-append).
    /// Битый заголовок: один rebuild и повторное чтение.
    pub async fn read(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        // буфер держим всё чтение, чтобы flush не проскочил между файлом и буфером
        let buffer = self.inner.buffer.lock().await;
        let path = self.inner.settings.ledger_path.clone();
        let timeout = self.inner.settings.lock_timeout;
        let mut records = fsio::blocking(move || read_or_rebuild(&path, timeout)).await?;
        records.extend(buffer.iter().cloned());
        Ok(records)
    }

    /// Пересобрать леджер из того, что удаётся разобрать; старый файл уходит в бэкап.
    pub async fn rebuild(&self) -> Result<usize, CatalogError> {
        let kept = {
            let _buffer = self.inner.buffer.lock().await;
            let path = self.inner.settings.ledger_path.clone();
            let timeout = self.inner.settings.lock_timeout;
            fsio::blocking(move || rebuild_ledger(&path, timeout)).await?
        };
        self.invalidate().await;
        Ok(kept)
    }

    /// Кэш в памяти → снимок на диске → полное чтение леджера.
    pub async fn get_cached(&self) -> Result<Arc<Snapshot>, CatalogError> {
        if let Some(snapshot) = self.cached().await {
            return Ok(snapshot);
        }

        // invalidate() ждёт, пока оба уровня не заполнены, и только потом чистит их
        let _fill = self.inner.fill.lock().await;
        if let Some(snapshot) = self.cached().await {
            return Ok(snapshot);
        }
        let (snapshot, from_disk) = self.load_snapshot().await?;
        self.inner.cache.insert((), Arc::clone(&snapshot)).await;
        if !from_disk {
            let path = self.inner.settings.cache_path.clone();
            let copy = Arc::clone(&snapshot);
            if let Err(e) = fsio::blocking(move || fsio::write_json_atomic(&path, &*copy)).await {
                warn!(error = %e, "catalog snapshot file not written");
            }
        }
        Ok(snapshot)
    }

    async fn cached(&self) -> Option<Arc<Snapshot>> {
        let snapshot = self.inner.cache.get(&()).await?;
        if snapshot.is_fresh(self.inner.settings.cache_ttl) {
            return Some(snapshot);
        }
        self.inner.cache.invalidate(&()).await;
        None
    }

    async fn load_snapshot(&self) -> Result<(Arc<Snapshot>, bool), CatalogError> {
        let ttl = self.inner.settings.cache_ttl;
        let path = self.inner.settings.cache_path.clone();
        match fsio::blocking(move || fsio::read_json_or_default::<Option<Snapshot>>(&path)).await {
            Ok(Some(snapshot)) if snapshot.is_fresh(ttl) => {
                debug!(records = snapshot.records.len(), "catalog loaded from snapshot file");
                return Ok((Arc::new(snapshot), true));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "catalog snapshot file ignored"),
        }

        let records = self.read().await?;
        debug!(records = records.len(), "catalog loaded from ledger");
        Ok((Arc::new(Snapshot { records, built_at: Utc::now() }), false))
    }

    /// Сбросить оба уровня кэша.
    pub async fn invalidate(&self) {
        let _fill = self.inner.fill.lock().await;
        self.inner.cache.invalidate(&()).await;
        match tokio::fs::remove_file(&self.inner.settings.cache_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "catalog snapshot file not removed"),
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchGroup>, CatalogError> {
        let snapshot = self.get_cached().await?;
        Ok(rank(&snapshot.records, query))
    }

    pub async fn stats(&self) -> Result<CatalogStats, CatalogError> {
        let snapshot = self.get_cached().await?;
        let mut per_channel = BTreeMap::new();
        for r in &snapshot.records {
            *per_channel.entry(r.channel_id).or_insert(0) += 1;
        }
        Ok(CatalogStats {
            total: snapshot.records.len(),
            per_channel,
            cache_age: snapshot.age().to_std().unwrap_or_default(),
        })
    }

    /// Сколько записей ждёт flush.
    pub async fn pending(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }
}

/* ====== Поиск ====== */

/// Точное совпадение 100, подстрока 80, иначе похожесть, если > 60.
/// Группы по нормализованному названию, по убыванию score, не больше 10.
pub fn rank(records: &[CatalogRecord], query: &str) -> Vec<SearchGroup> {
    let query = normalize(query);
    if query.is_empty() {
        return Vec::new();
    }

    let mut groups: Vec<SearchGroup> = Vec::new();
    // None — название уже проверено и не подошло
    let mut seen: HashMap<String, Option<usize>> = HashMap::new();
    for record in records {
        let key = normalize(&record.movie_name);
        match seen.get(&key).copied() {
            Some(Some(i)) => groups[i].records.push(record.clone()),
            Some(None) => {}
            None => match score(&key, &query) {
                Some(score) => {
                    seen.insert(key.clone(), Some(groups.len()));
                    groups.push(SearchGroup { key, score, records: vec![record.clone()] });
                }
                None => {
                    seen.insert(key, None);
                }
            },
        }
    }

    // sort_by стабильный: при равном score порядок появления в каталоге
    groups.sort_by(|a, b| b.score.total_cmp(&a.score));
    groups.truncate(MAX_GROUPS);
    groups
}

fn score(name: &str, query: &str) -> Option<f64> {
    if name == query {
        Some(EXACT_SCORE)
    } else if name.contains(query) {
        Some(SUBSTRING_SCORE)
    } else {
        let s = similarity(name, query);
        (s > FUZZY_THRESHOLD).then_some(s)
    }
}

/* ====== Файл леджера (CSV с обязательным заголовком) ====== */

fn append_rows(path: &Path, rows: &[CatalogRecord], timeout: Duration) -> Result<usize, CatalogError> {
    let _lock = FileLock::exclusive(path, timeout)?;
    fsio::ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let is_new = file.metadata().map_err(|e| StoreError::io(path, e))?.len() == 0;
    if is_new {
        file.write_all(&encode_row(&LEDGER_HEADER)?)
            .map_err(|e| StoreError::io(path, e))?;
    }

    let mut written = 0;
    for record in rows {
        let row = encode_row(&[
            record.movie_name.as_str(),
            &record.message_id.to_string(),
            &record.channel_id.to_string(),
        ])
        .map_err(CatalogError::from)
        .and_then(|bytes| {
            file.write_all(&bytes)
                .map_err(|e| CatalogError::from(StoreError::io(path, e)))
        });
        match row {
            Ok(()) => written += 1,
            Err(e) => error!(
                error = %e,
                movie = %record.movie_name,
                message_id = record.message_id,
                "catalog row not written"
            ),
        }
    }
    if let Err(e) = file.sync_all() {
        warn!(error = %e, "catalog fsync failed");
    }
    Ok(written)
}

fn encode_row(fields: &[&str]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer.into_inner().map_err(|e| e.into_error().into())
}

fn read_or_rebuild(path: &Path, timeout: Duration) -> Result<Vec<CatalogRecord>, CatalogError> {
    match read_ledger(path, timeout) {
        Err(CatalogError::CorruptHeader(found)) => {
            warn!(header = ?found, path = %path.display(), "catalog header corrupt, rebuilding");
            rebuild_ledger(path, timeout)?;
            read_ledger(path, timeout)
        }
        other => other,
    }
}

fn read_ledger(path: &Path, timeout: Duration) -> Result<Vec<CatalogRecord>, CatalogError> {
    let _lock = FileLock::shared(path, timeout)?;
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e).into()),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);
    let mut rows = reader.records();
    match rows.next() {
        None => return Ok(Vec::new()),
        Some(Ok(header)) if is_canonical_header(&header) => {}
        Some(Ok(header)) => {
            return Err(CatalogError::CorruptHeader(header.iter().map(String::from).collect()))
        }
        Some(Err(e)) => return Err(CatalogError::CorruptHeader(vec![e.to_string()])),
    }

    let mut records = Vec::new();
    for (line, row) in rows.enumerate() {
        let parsed = row.ok().and_then(|row| {
            parse_fields(row.get(0)?, row.get(1)?, row.get(2)?)
        });
        match parsed {
            Some(record) => records.push(record),
            None => debug!(line = line + 2, "malformed catalog row skipped"),
        }
    }
    Ok(records)
}

fn is_canonical_header(header: &csv::StringRecord) -> bool {
    header.len() == LEDGER_HEADER.len()
        && header
            .iter()
            .zip(LEDGER_HEADER)
            .all(|(got, want)| got.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(want))
}

fn parse_fields(name: &str, message_id: &str, channel_id: &str) -> Option<CatalogRecord> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let message_id = message_id.trim().parse::<i32>().ok().filter(|id| *id > 0)?;
    let channel_id = channel_id.trim().parse::<i64>().ok().filter(|id| *id != 0)?;
    Some(CatalogRecord::from_ledger(name, message_id, channel_id))
}

/// Разбор строки «как получится»: два последних поля — id, всё до них — название.
fn split_line_best_effort(line: &str) -> Option<CatalogRecord> {
    let line = line.trim().trim_start_matches('\u{feff}');
    if line.is_empty() {
        return None;
    }
    let mut parts = line.rsplitn(3, ',');
    let channel_id = parts.next()?.trim().trim_matches('"');
    let message_id = parts.next()?.trim().trim_matches('"');
    let name = parts.next()?.trim().trim_matches('"').replace("\"\"", "\"");
    parse_fields(&name, message_id, channel_id)
}

fn rebuild_ledger(path: &Path, timeout: Duration) -> Result<usize, CatalogError> {
    let _lock = FileLock::exclusive(path, timeout)?;
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(path, e).into()),
    };

    let backup = backup_path(path, Utc::now());
    fs::write(&backup, &raw).map_err(|e| StoreError::io(&backup, e))?;

    let records: Vec<CatalogRecord> = String::from_utf8_lossy(&raw)
        .lines()
        .filter_map(split_line_best_effort)
        .collect();

    let mut bytes = encode_row(&LEDGER_HEADER)?;
    for r in &records {
        bytes.extend(encode_row(&[
            r.movie_name.as_str(),
            &r.message_id.to_string(),
            &r.channel_id.to_string(),
        ])?);
    }
    fsio::write_atomic(path, &bytes)?;

    warn!(
        backup = %backup.display(),
        kept = records.len(),
        "catalog ledger rebuilt"
    );
    Ok(records.len())
}

fn backup_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    fsio::with_suffix(path, &format!(".bak.{}", at.format("%Y%m%d_%H%M%S%3f")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, threshold: usize) -> CatalogStore {
        let mut settings = CatalogSettings::in_dir(dir.path());
        settings.buffer_threshold = threshold;
        settings.lock_timeout = Duration::from_millis(500);
        let channels = ChannelDirectory::new(&[-100], &[-200]).unwrap();
        CatalogStore::new(settings, channels)
    }

    fn ledger_lines(dir: &TempDir) -> Vec<String> {
        fs::read_to_string(dir.path().join("catalog.csv"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    fn record(name: &str, message_id: i32) -> CatalogRecord {
        CatalogRecord::new(name, message_id, -100).unwrap()
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop_twice() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 50);
        assert_eq!(store.flush().await.unwrap(), 0);
        assert_eq!(store.flush().await.unwrap(), 0);
        assert!(!dir.path().join("catalog.csv").exists());
    }

    // read() включает буфер, поэтому запись видна до физического flush
    #[tokio::test]
    async fn appended_record_is_visible_before_flush() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 50);
        store.append("Existing", 1, -100).await.unwrap();
        store.flush().await.unwrap();

        let before = store.get_cached().await.unwrap().records.len();
        store.append("Fresh Movie", 2, -200).await.unwrap();
        assert_eq!(store.pending().await, 1);

        let after = store.get_cached().await.unwrap();
        assert_eq!(after.records.len(), before + 1);
        assert_eq!(ledger_lines(&dir).len(), 2, "header + one flushed row only");

        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.get_cached().await.unwrap().records.len(), before + 1);
        assert_eq!(ledger_lines(&dir).len(), 3);
    }

    #[tokio::test]
    async fn invalid_append_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 1);
        assert!(matches!(store.append("x", 1, -100).await, Err(CatalogError::Invalid(_))));
        assert!(matches!(store.append("Good Name", 0, -100).await, Err(CatalogError::Invalid(_))));
        assert!(matches!(
            store.append("Good Name", 5, -999).await,
            Err(CatalogError::UnknownChannel(-999))
        ));
        assert_eq!(store.pending().await, 0);
        assert!(!dir.path().join("catalog.csv").exists());
    }

    #[tokio::test]
    async fn reaching_threshold_flushes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 2);
        store.append("First, with comma", 1, -100).await.unwrap();
        assert!(!dir.path().join("catalog.csv").exists());
        store.append("Second", 2, -200).await.unwrap();
        assert_eq!(store.pending().await, 0);

        let lines = ledger_lines(&dir);
        assert_eq!(lines[0], "movie_name,message_id,channel_id");
        assert_eq!(lines[1], "\"First, with comma\",1,-100");
        assert_eq!(lines[2], "Second,2,-200");
        let read = store.read().await.unwrap();
        assert_eq!(read[0].movie_name(), "First, with comma");
    }

    #[tokio::test]
    async fn failed_flush_keeps_buffer() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 50);
        store.append("Pathaan", 1, -100).await.unwrap();

        let ledger = dir.path().join("catalog.csv");
        let held = FileLock::exclusive(&ledger, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            store.flush().await,
            Err(CatalogError::Store(StoreError::LockTimeout { .. }))
        ));
        assert_eq!(store.pending().await, 1);

        drop(held);
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.pending().await, 0);
    }

    #[tokio::test]
    async fn append_survives_failed_threshold_flush() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 2);
        let ledger = dir.path().join("catalog.csv");
        let held = FileLock::exclusive(&ledger, Duration::from_secs(1)).unwrap();

        store.append("Jawan", 1, -100).await.unwrap();
        let second = store.append("Animal", 2, -200).await.unwrap();
        assert_eq!(second.movie_name(), "Animal");
        assert_eq!(store.pending().await, 2);
        assert!(!ledger.exists());

        drop(held);
        assert_eq!(store.search("animal").await.unwrap()[0].count(), 1);
        assert_eq!(store.flush().await.unwrap(), 2);
    }

    // поиск, идущий параллельно с append, не должен оставить старый снимок ни в памяти, ни в файле
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fill_never_hides_append() {
        for round in 0..100 {
            let dir = TempDir::new().unwrap();
            let store = store_in(&dir, 50);
            store.append("Animal", 1, -100).await.unwrap();
            store.flush().await.unwrap();

            let reader = tokio::spawn({
                let store = store.clone();
                async move { store.get_cached().await.map(|s| s.records.len()) }
            });
            let writer = tokio::spawn({
                let store = store.clone();
                async move { store.append("Jawan", 2, -100).await }
            });
            reader.await.unwrap().unwrap();
            writer.await.unwrap().unwrap();

            let after = store.get_cached().await.unwrap();
            assert_eq!(after.records.len(), 2, "round {round}");

            // снимок на диске тоже свежий: новый экземпляр видит обе записи
            let other = store_in(&dir, 50);
            assert_eq!(other.get_cached().await.unwrap().records.len(), 2, "round {round}");
        }
    }

    #[test]
    fn exact_match_outranks_substring() {
        let records = vec![record("Pushpa", 1), record("Pushpa 2", 2), record("KGF", 3)];
        let groups = rank(&records, "pushpa");
        let keys: Vec<_> = groups.iter().map(|g| (g.key.as_str(), g.score)).collect();
        assert_eq!(keys, vec![("pushpa", 100.0), ("pushpa 2", 80.0)]);
    }

    #[test]
    fn groups_merge_same_title_and_cap_at_ten() {
        let mut records: Vec<_> = (1..=12).map(|i| record(&format!("Movie {i}"), i)).collect();
        records.push(CatalogRecord::new("movie  1", 99, -200).unwrap());
        let groups = rank(&records, "movie");
        assert_eq!(groups.len(), MAX_GROUPS);
        assert_eq!(groups[0].key, "movie 1");
        assert_eq!(groups[0].count(), 2);
        assert_eq!(groups[0].title(), "Movie 1");
    }

    #[test]
    fn fuzzy_matches_only_above_threshold() {
        let records = vec![record("Pathaan", 1), record("Jawan", 2)];
        let groups = rank(&records, "pathan");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "pathaan");
        assert!(groups[0].score > FUZZY_THRESHOLD && groups[0].score < SUBSTRING_SCORE + 20.0);
        assert!(rank(&records, "   ").is_empty());
    }

    #[tokio::test]
    async fn animal_scenario_ranks_two_groups() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 50);
        store.append("Animal", 101, -100).await.unwrap();
        store.append("Animal 2 (2025)", 102, -100).await.unwrap();
        store.append("KGF Chapter 2", 103, -200).await.unwrap();
        assert_eq!(store.flush().await.unwrap(), 3);

        let groups = store.search("animal").await.unwrap();
        let keys: Vec<_> = groups.iter().map(|g| (g.key.as_str(), g.score)).collect();
        assert_eq!(keys, vec![("animal", 100.0), ("animal 2 (2025)", 80.0)]);
        assert_eq!(groups.iter().map(SearchGroup::count).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn corrupt_header_triggers_rebuild_with_backup() {
        let dir = TempDir::new().unwrap();
        let ledger = dir.path().join("catalog.csv");
        fs::write(
            &ledger,
            "mov!e_nme;;broken\n\
             Animal,101,-100\n\
             \"Quoted, Name\",102,-100\n\
             ,103,-100\n\
             KGF,abc,-200\n\
             Jawan,104,-200\n",
        )
        .unwrap();

        let store = store_in(&dir, 50);
        let records = store.read().await.unwrap();
        let names: Vec<_> = records.iter().map(CatalogRecord::movie_name).collect();
        assert_eq!(names, vec!["Animal", "Quoted, Name", "Jawan"]);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("catalog.csv.bak."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(fs::read_to_string(backups[0].path()).unwrap().starts_with("mov!e_nme"));

        let lines = ledger_lines(&dir);
        assert_eq!(lines[0], "movie_name,message_id,channel_id");
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn rows_with_empty_name_or_bad_ids_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("catalog.csv"),
            "movie_name,message_id,channel_id\n  ,5,-100\nGood One,7,-100\nBad Id,-3,-100\nShort\n",
        )
        .unwrap();
        let store = store_in(&dir, 50);
        let records = store.read().await.unwrap();
        assert_eq!(records, vec![record("Good One", 7)]);
    }

    #[tokio::test]
    async fn snapshot_file_serves_second_process_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let first = store_in(&dir, 1);
        first.append("Animal", 1, -100).await.unwrap();
        assert_eq!(first.get_cached().await.unwrap().records.len(), 1);
        assert!(dir.path().join("catalog_cache.json").exists());

        // запись мимо хранилища: второй экземпляр её не увидит, пока жив снимок
        let mut file = OpenOptions::new().append(true).open(dir.path().join("catalog.csv")).unwrap();
        writeln!(file, "Jawan,2,-200").unwrap();

        let second = store_in(&dir, 1);
        assert_eq!(second.get_cached().await.unwrap().records.len(), 1);

        second.invalidate().await;
        assert!(!dir.path().join("catalog_cache.json").exists());
        assert_eq!(second.get_cached().await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn stats_count_per_channel() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 50);
        store.append("Animal", 1, -100).await.unwrap();
        store.append("Jawan", 2, -200).await.unwrap();
        store.append("Dunki", 3, -200).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.per_channel.get(&-100), Some(&1));
        assert_eq!(stats.per_channel.get(&-200), Some(&2));
        assert!(stats.cache_age < Duration::from_secs(5));
    }
}
