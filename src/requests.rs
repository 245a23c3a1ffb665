use crate::fsio::{self, FileLock, StoreError};
use crate::text::{normalize, similarity};
use crate::validate::{MAX_NAME_LEN, MIN_NAME_LEN};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use unicode_segmentation::UnicodeSegmentation;

pub const AUTO_APPROVE_REASON: &str = "Фильм добавлен в каталог";
pub const AUTO_APPROVE_SIMILARITY: f64 = 80.0;

// окно и для дублей, и для суточного лимита
fn request_window() -> TimeDelta {
    TimeDelta::hours(24)
}

/* ====== Модель заявки ====== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "на рассмотрении",
            Self::Approved => "одобрена",
            Self::Rejected => "отклонена",
        })
    }
}

/// Кто закрыл заявку.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Moderator {
    System,
    Admin(i64),
}

impl fmt::Display for Moderator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Admin(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRequest {
    pub id: u64,
    pub user_id: i64,
    pub display_name: String,
    pub movie_name: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Moderator>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<Moderator>,
    pub reason: Option<String>,
    pub is_notified: bool,
}

impl MovieRequest {
    fn new(
        id: u64,
        user_id: i64,
        movie_name: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, RequestError> {
        Ok(Self {
            id,
            user_id,
            display_name: display_name.trim().to_string(),
            movie_name: checked_name(movie_name)?,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            approved_at: None,
            approved_by: None,
            rejected_at: None,
            rejected_by: None,
            reason: None,
            is_notified: false,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn key(&self) -> String {
        normalize(&self.movie_name)
    }
}

fn checked_name(raw: &str) -> Result<String, RequestError> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let len = name.graphemes(true).count();
    if (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        Ok(name)
    } else {
        Err(RequestError::InvalidName)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub total: u32,
    pub pending: u32,
    pub approved: u32,
    pub rejected: u32,
    /// Заявок в текущем 24-часовом окне.
    pub window_count: u32,
    pub window_started_at: Option<DateTime<Utc>>,
}

impl UserStats {
    /// Счётчик окна с учётом того, что окно могло уже истечь.
    pub fn window_count_at(&self, now: DateTime<Utc>) -> u32 {
        match self.window_started_at {
            Some(start) if now - start < request_window() => self.window_count,
            _ => 0,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        if self.window_count_at(now) == 0 {
            self.window_started_at = Some(now);
            self.window_count = 0;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total: u32,
    pub pending: u32,
    pub approved: u32,
    pub rejected: u32,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("название фильма должно быть от {MIN_NAME_LEN} до {MAX_NAME_LEN} символов")]
    InvalidName,
    #[error("этот фильм уже запрошен (заявка #{existing_id}) и ждёт рассмотрения")]
    Duplicate { existing_id: u64 },
    #[error("лимит заявок исчерпан: не больше {limit} за сутки")]
    FloodLimit { limit: u32 },
    #[error("заявка #{0} не найдена")]
    NotFound(u64),
    #[error("заявка #{id} уже {status}")]
    NotPending { id: u64, status: RequestStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RequestError {
    /// Ожидаемый отказ по правилам (показываем пользователю), а не сбой хранилища.
    pub fn is_declined(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Итог пакетной операции: результат по каждому id.
#[derive(Debug)]
pub struct BulkOutcome {
    pub results: Vec<(u64, Result<MovieRequest, RequestError>)>,
    pub succeeded: usize,
}

#[derive(Debug, Clone)]
enum Decision {
    Approve { by: Moderator, reason: Option<String> },
    Reject { by: Moderator, reason: Option<String> },
}

/* ====== Документ леджера ====== */

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDoc {
    next_id: u64,
    requests: BTreeMap<u64, MovieRequest>,
    stats: SystemStats,
    users: HashMap<i64, UserStats>,
}

impl LedgerDoc {
    fn submit(
        &mut self,
        user_id: i64,
        movie_name: &str,
        display_name: &str,
        now: DateTime<Utc>,
        daily_limit: u32,
    ) -> Result<MovieRequest, RequestError> {
        let request = MovieRequest::new(self.next_id + 1, user_id, movie_name, display_name, now)?;

        let key = request.key();
        if let Some(existing) = self.requests.values().find(|r| {
            r.user_id == user_id
                && r.is_pending()
                && now - r.created_at < request_window()
                && r.key() == key
        }) {
            return Err(RequestError::Duplicate { existing_id: existing.id });
        }

        let user = self.users.entry(user_id).or_default();
        if user.window_count_at(now) >= daily_limit {
            return Err(RequestError::FloodLimit { limit: daily_limit });
        }

        user.roll_window(now);
        user.window_count += 1;
        user.total += 1;
        user.pending += 1;
        self.stats.total += 1;
        self.stats.pending += 1;
        self.next_id = request.id;
        self.requests.insert(request.id, request.clone());
        Ok(request)
    }

    fn resolve(
        &mut self,
        id: u64,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<MovieRequest, RequestError> {
        let request = self.requests.get_mut(&id).ok_or(RequestError::NotFound(id))?;
        if !request.is_pending() {
            return Err(RequestError::NotPending { id, status: request.status });
        }

        let user = self.users.entry(request.user_id).or_default();
        user.pending = user.pending.saturating_sub(1);
        self.stats.pending = self.stats.pending.saturating_sub(1);
        match decision {
            Decision::Approve { by, reason } => {
                request.status = RequestStatus::Approved;
                request.approved_by = Some(by);
                request.approved_at = Some(now);
                request.reason = reason;
                user.approved += 1;
                self.stats.approved += 1;
            }
            Decision::Reject { by, reason } => {
                request.status = RequestStatus::Rejected;
                request.rejected_by = Some(by);
                request.rejected_at = Some(now);
                request.reason = reason;
                user.rejected += 1;
                self.stats.rejected += 1;
            }
        }
        request.updated_at = now;
        Ok(request.clone())
    }

    fn auto_approve(&mut self, movie_name: &str, now: DateTime<Utc>) -> Vec<MovieRequest> {
        let new_key = normalize(movie_name);
        if new_key.is_empty() {
            return Vec::new();
        }
        let matched: Vec<u64> = self
            .requests
            .values()
            .filter(|r| r.is_pending() && titles_match(&r.key(), &new_key))
            .map(|r| r.id)
            .collect();

        matched
            .into_iter()
            .filter_map(|id| {
                let decision = Decision::Approve {
                    by: Moderator::System,
                    reason: Some(AUTO_APPROVE_REASON.to_string()),
                };
                self.resolve(id, decision, now).ok()
            })
            .collect()
    }
}

/// Эвристика автоодобрения: подстрока в любую сторону или похожесть > 80.
/// Может ошибаться на коротких названиях.
pub fn titles_match(request_key: &str, catalog_key: &str) -> bool {
    catalog_key.contains(request_key)
        || request_key.contains(catalog_key)
        || similarity(request_key, catalog_key) > AUTO_APPROVE_SIMILARITY
}

/* ====== Леджер заявок ======
   Каждая операция: блокировка файла → загрузка → изменение → атомарное сохранение.
   Отказ по правилам ничего не сохраняет, так что память и файл не расходятся. */

#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub path: PathBuf,
    pub daily_limit: u32,
    pub lock_timeout: Duration,
}

impl RequestSettings {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join("requests.json"),
            daily_limit: 3,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct RequestLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    settings: RequestSettings,
    // внутри процесса операции идут по одной; между процессами разводит FileLock
    writer: Mutex<()>,
}

impl RequestLedger {
    pub fn new(settings: RequestSettings) -> Self {
        Self { inner: Arc::new(LedgerInner { settings, writer: Mutex::new(()) }) }
    }

    async fn transact<T, F>(&self, op: F) -> Result<T, RequestError>
    where
        F: FnOnce(&mut LedgerDoc) -> Result<T, RequestError> + Send + 'static,
        T: Send + 'static,
    {
        let _writer = self.inner.writer.lock().await;
        let path = self.inner.settings.path.clone();
        let timeout = self.inner.settings.lock_timeout;
        let result = fsio::blocking(move || {
            let _lock = FileLock::exclusive(&path, timeout)?;
            let mut doc: LedgerDoc = fsio::read_json_or_default(&path)?;
            let out = op(&mut doc)?;
            fsio::write_json_atomic(&path, &doc)?;
            Ok(out)
        })
        .await;
        if let Err(RequestError::Store(e)) = &result {
            error!(error = %e, "request ledger transaction failed");
        }
        result
    }

    async fn view<T, F>(&self, f: F) -> Result<T, RequestError>
    where
        F: FnOnce(LedgerDoc) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.inner.settings.path.clone();
        let timeout = self.inner.settings.lock_timeout;
        fsio::blocking(move || {
            let _lock = FileLock::shared(&path, timeout)?;
            let doc: LedgerDoc = fsio::read_json_or_default(&path)?;
            Ok(f(doc))
        })
        .await
    }

    pub async fn submit(
        &self,
        user_id: i64,
        movie_name: &str,
        display_name: &str,
    ) -> Result<MovieRequest, RequestError> {
        self.submit_at(user_id, movie_name, display_name, Utc::now()).await
    }

    /// Порядок проверок: название → дубль → лимит → запись.
    pub async fn submit_at(
        &self,
        user_id: i64,
        movie_name: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MovieRequest, RequestError> {
        let limit = self.inner.settings.daily_limit;
        let (movie_name, display_name) = (movie_name.to_string(), display_name.to_string());
        let result = self
            .transact(move |doc| doc.submit(user_id, &movie_name, &display_name, now, limit))
            .await;
        match &result {
            Ok(r) => info!(id = r.id, user_id, movie = %r.movie_name, "movie request submitted"),
            Err(e) if e.is_declined() => debug!(user_id, reason = %e, "movie request declined"),
            Err(_) => {}
        }
        result
    }

    pub async fn approve(&self, id: u64, by: Moderator) -> Result<MovieRequest, RequestError> {
        self.decide(id, Decision::Approve { by, reason: None }).await
    }

    pub async fn reject(
        &self,
        id: u64,
        by: Moderator,
        reason: Option<&str>,
    ) -> Result<MovieRequest, RequestError> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty()).map(String::from);
        self.decide(id, Decision::Reject { by, reason }).await
    }

    async fn decide(&self, id: u64, decision: Decision) -> Result<MovieRequest, RequestError> {
        let now = Utc::now();
        let result = self.transact(move |doc| doc.resolve(id, decision, now)).await;
        match &result {
            Ok(r) => info!(id, status = ?r.status, "movie request resolved"),
            Err(e) if e.is_declined() => debug!(id, reason = %e, "moderation declined"),
            Err(_) => {}
        }
        result
    }

    /// Каждый id обрабатывается отдельно; ошибка по одному не останавливает пакет.
    pub async fn bulk_approve(&self, ids: &[u64], by: Moderator) -> BulkOutcome {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push((id, self.approve(id, by).await));
        }
        BulkOutcome::from_results(results)
    }

    pub async fn bulk_reject(&self, ids: &[u64], by: Moderator, reason: Option<&str>) -> BulkOutcome {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push((id, self.reject(id, by, reason).await));
        }
        BulkOutcome::from_results(results)
    }

    /// Одобрить все заявки, которые закрывает только что добавленный фильм.
    pub async fn auto_approve(&self, movie_name: &str) -> Result<Vec<MovieRequest>, RequestError> {
        let name = movie_name.to_string();
        let now = Utc::now();
        let approved = self.transact(move |doc| Ok(doc.auto_approve(&name, now))).await?;
        if !approved.is_empty() {
            info!(
                movie = %movie_name,
                ids = ?approved.iter().map(|r| r.id).collect::<Vec<_>>(),
                "requests auto-approved"
            );
        }
        Ok(approved)
    }

    /// Заявки на рассмотрении, старые первыми.
    pub async fn list_pending(
        &self,
        limit: usize,
        filter: Option<&str>,
    ) -> Result<Vec<MovieRequest>, RequestError> {
        let filter = filter.map(normalize).filter(|f| !f.is_empty());
        self.view(move |doc| {
            let mut pending: Vec<MovieRequest> = doc
                .requests
                .into_values()
                .filter(|r| r.is_pending())
                .filter(|r| filter.as_deref().is_none_or(|f| r.key().contains(f)))
                .collect();
            pending.sort_by_key(|r| (r.created_at, r.id));
            pending.truncate(limit);
            pending
        })
        .await
    }

    /// Заявки пользователя, новые первыми.
    pub async fn list_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<MovieRequest>, RequestError> {
        self.view(move |doc| {
            let mut mine: Vec<MovieRequest> =
                doc.requests.into_values().filter(|r| r.user_id == user_id).collect();
            mine.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.id)));
            mine.truncate(limit);
            mine
        })
        .await
    }

    pub async fn get(&self, id: u64) -> Result<Option<MovieRequest>, RequestError> {
        self.view(move |mut doc| doc.requests.remove(&id)).await
    }

    pub async fn stats(&self) -> Result<SystemStats, RequestError> {
        self.view(|doc| doc.stats).await
    }

    pub async fn user_stats(&self, user_id: i64) -> Result<UserStats, RequestError> {
        self.view(move |mut doc| doc.users.remove(&user_id).unwrap_or_default()).await
    }

    /// Пользователь уведомлён об итоге заявки.
    pub async fn mark_notified(&self, id: u64) -> Result<(), RequestError> {
        self.transact(move |doc| {
            let request = doc.requests.get_mut(&id).ok_or(RequestError::NotFound(id))?;
            request.is_notified = true;
            Ok(())
        })
        .await
    }

    /// Обнулить суточный счётчик пользователя (ручной сброс лимита админом).
    pub async fn reset_daily_counter(&self, user_id: i64) -> Result<(), RequestError> {
        self.transact(move |doc| {
            if let Some(user) = doc.users.get_mut(&user_id) {
                user.window_count = 0;
                user.window_started_at = None;
            }
            Ok(())
        })
        .await
    }
}

impl BulkOutcome {
    fn from_results(results: Vec<(u64, Result<MovieRequest, RequestError>)>) -> Self {
        let succeeded = results.iter().filter(|(_, r)| r.is_ok()).count();
        Self { results, succeeded }
    }
}
