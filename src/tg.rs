use crate::autodelete::AutoDeleteLedger;
use crate::callback::CallbackAction;
use crate::catalog::{CatalogRecord, CatalogStore, SearchGroup};
use crate::channels::DeliveryMode;
use crate::config::Config;
use crate::ingest::{self, IngestError};
use crate::requests::{
    BulkOutcome, Moderator, MovieRequest, RequestError as LedgerError, RequestLedger, RequestStatus,
};
use crate::validate;
use chrono::{TimeDelta, Utc};
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{path::Path, sync::Arc, time::Duration};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, User},
    utils::command::BotCommands,
};
use tracing::{debug, error, info, warn};

const GENERIC_FAILURE: &str = "Что-то пошло не так, попробуй позже.";
const PENDING_PAGE: usize = 20;
const MY_REQUESTS_PAGE: usize = 10;
const AUTO_DELETE_SWEEP: Duration = Duration::from_secs(30);

// "#request Pathaan" / "#запрос Патхан"
static REQUEST_PHRASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*#(?:request|запрос)\s+(.+)$").expect("valid regex"));

/* ====== Состояние бота ======
   Всё, что нужно хендлерам, собрано один раз в main и передаётся клоном. */
#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub catalog: CatalogStore,
    pub requests: RequestLedger,
    pub autodelete: AutoDeleteLedger,
    // чат -> группы последнего поиска (для кнопок get:<n>)
    sessions: Cache<i64, Arc<Vec<SearchGroup>>>,
}

impl BotState {
    pub fn new(
        config: Config,
        catalog: CatalogStore,
        requests: RequestLedger,
        autodelete: AutoDeleteLedger,
    ) -> Self {
        let sessions = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.search_session_ttl)
            .build();
        Self { config: Arc::new(config), catalog, requests, autodelete, sessions }
    }
}

/* ====== Команды ====== */
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Команды:")]
enum Command {
    #[command(description = "начать")]
    Start,
    #[command(description = "помощь")]
    Help,
    #[command(description = "запросить фильм: /request название")]
    Request(String),
    #[command(description = "мои заявки")]
    MyRequests,
    #[command(description = "заявки на рассмотрении (админ)")]
    Pending(String),
    #[command(description = "одобрить: /approve 1 2 3 (админ)")]
    Approve(String),
    #[command(description = "отклонить: /reject 1 2 причина (админ)")]
    Reject(String),
    #[command(description = "статистика (админ)")]
    Stats,
    #[command(description = "записать буфер каталога на диск (админ)")]
    Flush,
    #[command(description = "пересобрать файл каталога с бэкапом (админ)")]
    Rebuild,
    #[command(description = "сбросить суточный лимит: /resetlimit user_id (админ)")]
    ResetLimit(String),
}

impl Command {
    fn admin_only(&self) -> bool {
        matches!(
            self,
            Self::Pending(_)
                | Self::Approve(_)
                | Self::Reject(_)
                | Self::Stats
                | Self::Flush
                | Self::Rebuild
                | Self::ResetLimit(_)
        )
    }
}

pub async fn run(bot: Bot, state: BotState) {
    spawn_maintenance(bot.clone(), state.clone());

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint({
            let state = state.clone();
            move |bot: Bot, msg: Message| {
                let state = state.clone();
                async move { on_channel_post(bot, msg, &state).await }
            }
        }))
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint({
                    let state = state.clone();
                    move |bot: Bot, msg: Message, cmd: Command| {
                        let state = state.clone();
                        async move { on_command(bot, msg, cmd, &state).await }
                    }
                }))
                .branch({
                    let state = state.clone();
                    dptree::endpoint(move |bot: Bot, msg: Message| {
                        let state = state.clone();
                        async move { on_text(bot, msg, &state).await }
                    })
                }),
        )
        .branch(Update::filter_callback_query().endpoint({
            let state = state.clone();
            move |bot: Bot, q: CallbackQuery| {
                let state = state.clone();
                async move { on_callback(bot, q, &state).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/* ====== Фоновые задачи: периодический flush и автоудаление ====== */
fn spawn_maintenance(bot: Bot, state: BotState) {
    if let Some(every) = state.config.flush_interval {
        let catalog = state.catalog.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                match catalog.flush().await {
                    Ok(0) => {}
                    Ok(written) => debug!(written, "periodic catalog flush"),
                    Err(e) => error!(error = %e, "periodic catalog flush failed"),
                }
            }
        });
    }

    if state.config.auto_delete.is_some() {
        let autodelete = state.autodelete.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AUTO_DELETE_SWEEP);
            loop {
                tick.tick().await;
                let due = match autodelete.take_due(Utc::now()).await {
                    Ok(due) => due,
                    Err(e) => {
                        error!(error = %e, "auto-delete sweep failed");
                        continue;
                    }
                };
                for entry in due {
                    // пользователь мог удалить сам — это не ошибка
                    if let Err(e) = bot.delete_message(ChatId(entry.chat_id), MessageId(entry.message_id)).await {
                        debug!(error = %e, chat_id = entry.chat_id, "auto-delete skipped");
                    }
                }
            }
        });
    }
}

/* ====== Посты в каналах-источниках ====== */
async fn on_channel_post(bot: Bot, msg: Message, state: &BotState) -> ResponseResult<()> {
    let channel_id = msg.chat.id.0;
    if !state.catalog.channels().contains(channel_id) {
        return Ok(());
    }
    let text = post_text(&msg);
    match ingest::ingest_post(&state.catalog, &state.requests, channel_id, msg.id.0, &text).await {
        Ok(outcome) => {
            debug!(
                movie = %outcome.record.movie_name(),
                channel_id = outcome.record.channel_id(),
                approved = outcome.approved.len(),
                "channel post indexed"
            );
            for request in &outcome.approved {
                notify_resolved(&bot, state, request).await;
            }
        }
        Err(IngestError::NoTitle) => {}
        Err(IngestError::Catalog(e)) if e.is_declined() => {
            info!(error = %e, channel_id, message_id = msg.id.0, "channel post not indexed");
        }
        Err(e) => error!(error = %e, channel_id, message_id = msg.id.0, "channel post not indexed"),
    }
    Ok(())
}

/// Текст поста: text → подпись → имя файла → дата публикации.
fn post_text(msg: &Message) -> String {
    if let Some(t) = msg.text().or(msg.caption()) {
        return t.to_string();
    }
    let file_name = msg
        .document()
        .and_then(|d| d.file_name.as_deref())
        .or_else(|| msg.video().and_then(|v| v.file_name.as_deref()));
    match file_name {
        Some(name) => title_from_file_name(name),
        None => format!("Post {}", msg.date.format("%Y-%m-%d %H:%M")),
    }
}

// "Pathaan.2023.1080p.mkv" -> "Pathaan 2023 1080p"
fn title_from_file_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    stem.replace(['.', '_'], " ")
}

/* ====== Команды ====== */
async fn on_command(bot: Bot, msg: Message, cmd: Command, state: &BotState) -> ResponseResult<()> {
    let chat = msg.chat.id;
    let Some(user) = msg.from.as_ref() else { return Ok(()); };
    let user_id = user.id.0 as i64;

    if cmd.admin_only() && !state.config.is_admin(user_id) {
        bot.send_message(chat, "Команда доступна только админам.").await?;
        return Ok(());
    }
    let admin = Moderator::Admin(user_id);

    match cmd {
        Command::Start | Command::Help => {
            let text = format!(
                "Пришли название фильма — найду посты.\nНет в каталоге? Запроси: /request название\n\n{}",
                Command::descriptions()
            );
            bot.send_message(chat, text).await?;
        }
        Command::Request(name) => submit_request(&bot, chat, user, &name, state).await?,
        Command::MyRequests => send_my_requests(&bot, chat, user_id, state).await?,
        Command::Pending(filter) => send_pending(&bot, chat, filter.trim(), state).await?,
        Command::Approve(args) => {
            let (ids, _) = parse_moderation_args(&args);
            if ids.is_empty() {
                bot.send_message(chat, "Формат: /approve 1 2 3").await?;
                return Ok(());
            }
            let outcome = state.requests.bulk_approve(&ids, admin).await;
            report_bulk(&bot, chat, state, outcome).await?;
        }
        Command::Reject(args) => {
            let (ids, reason) = parse_moderation_args(&args);
            if ids.is_empty() {
                bot.send_message(chat, "Формат: /reject 1 2 причина").await?;
                return Ok(());
            }
            let outcome = state.requests.bulk_reject(&ids, admin, reason.as_deref()).await;
            report_bulk(&bot, chat, state, outcome).await?;
        }
        Command::Stats => send_stats(&bot, chat, state).await?,
        Command::Flush => {
            let text = match state.catalog.flush().await {
                Ok(written) => format!("Записано строк: {written}"),
                Err(e) => {
                    error!(error = %e, "manual flush failed");
                    GENERIC_FAILURE.to_string()
                }
            };
            bot.send_message(chat, text).await?;
        }
        Command::Rebuild => {
            let text = match state.catalog.rebuild().await {
                Ok(kept) => format!("Каталог пересобран, записей: {kept}"),
                Err(e) => {
                    error!(error = %e, "manual rebuild failed");
                    GENERIC_FAILURE.to_string()
                }
            };
            bot.send_message(chat, text).await?;
        }
        Command::ResetLimit(arg) => {
            let Ok(target) = arg.trim().parse::<i64>() else {
                bot.send_message(chat, "Формат: /resetlimit user_id").await?;
                return Ok(());
            };
            let text = match state.requests.reset_daily_counter(target).await {
                Ok(()) => format!("Лимит пользователя {target} сброшен."),
                Err(e) => {
                    error!(error = %e, target, "limit reset failed");
                    GENERIC_FAILURE.to_string()
                }
            };
            bot.send_message(chat, text).await?;
        }
    }
    Ok(())
}

/* ====== Свободный текст: заявка или поиск ====== */
async fn on_text(bot: Bot, msg: Message, state: &BotState) -> ResponseResult<()> {
    let Some(text) = msg.text() else { return Ok(()); };
    let chat = msg.chat.id;

    if let Some(name) = REQUEST_PHRASE.captures(text).and_then(|c| c.get(1)) {
        if let Some(user) = msg.from.as_ref() {
            submit_request(&bot, chat, user, name.as_str(), state).await?;
        }
        return Ok(());
    }

    let Some(query) = validate::clean_query(text) else {
        bot.send_message(chat, "Слишком короткий запрос.").await?;
        return Ok(());
    };
    let groups = match state.catalog.search(&query).await {
        Ok(groups) => groups,
        Err(e) => {
            error!(error = %e, "catalog search failed");
            bot.send_message(chat, GENERIC_FAILURE).await?;
            return Ok(());
        }
    };

    if groups.is_empty() {
        let text = format!(
            "Ничего не нашёл 😕\nМожно запросить: <code>/request {}</code>",
            html_escape(&query)
        );
        bot.send_message(chat, text).parse_mode(ParseMode::Html).await?;
    } else if groups.len() == 1 {
        deliver_group(&bot, chat, &groups[0], state).await?;
    } else {
        let kb = keyboard_results(&groups);
        state.sessions.insert(chat.0, Arc::new(groups)).await;
        bot.send_message(chat, "Нашлось несколько вариантов, выбери:")
            .reply_markup(kb)
            .await?;
    }
    Ok(())
}

async fn submit_request(
    bot: &Bot,
    chat: ChatId,
    user: &User,
    name: &str,
    state: &BotState,
) -> ResponseResult<()> {
    if name.trim().is_empty() {
        bot.send_message(chat, "Напиши название: /request Pathaan").await?;
        return Ok(());
    }
    let text = match state.requests.submit(user.id.0 as i64, name, &user.full_name()).await {
        Ok(request) => {
            notify_admins(bot, state, &request).await;
            format!(
                "Заявка #{} принята: <b>{}</b>\nСообщу, когда фильм появится.",
                request.id,
                html_escape(&request.movie_name)
            )
        }
        Err(e) if e.is_declined() => format!("Заявка не принята: {}", html_escape(&e.to_string())),
        Err(_) => GENERIC_FAILURE.to_string(),
    };
    bot.send_message(chat, text).parse_mode(ParseMode::Html).await?;
    Ok(())
}

/* ====== Выдача постов ====== */
async fn deliver_group(bot: &Bot, chat: ChatId, group: &SearchGroup, state: &BotState) -> ResponseResult<()> {
    let mut delivered = 0;
    for record in &group.records {
        match deliver(bot, chat, record, state).await {
            Ok(sent) => {
                delivered += 1;
                schedule_delete(state, chat, sent).await;
            }
            Err(e) => warn!(
                error = %e,
                channel_id = record.channel_id(),
                message_id = record.message_id(),
                "delivery failed"
            ),
        }
    }

    if delivered == 0 {
        bot.send_message(chat, "Не удалось отправить пост, попробуй позже.").await?;
    } else if let Some(after) = state.config.auto_delete {
        bot.send_message(chat, format!("Посты удалятся через {} мин.", after.as_secs().div_ceil(60)))
            .await?;
    }
    Ok(())
}

/// Публичный канал — forward (источник виден), приватный — copy (источник скрыт).
async fn deliver(
    bot: &Bot,
    chat: ChatId,
    record: &CatalogRecord,
    state: &BotState,
) -> Result<MessageId, teloxide::RequestError> {
    let from = ChatId(record.channel_id());
    let id = MessageId(record.message_id());
    match state.catalog.channels().delivery_mode(record.channel_id()) {
        Some(DeliveryMode::Forward) => Ok(bot.forward_message(chat, from, id).await?.id),
        Some(DeliveryMode::Copy) => bot.copy_message(chat, from, id).await,
        None => Err(to_req_err(format!("channel {} is not configured", record.channel_id()))),
    }
}

async fn schedule_delete(state: &BotState, chat: ChatId, sent: MessageId) {
    let Some(after) = state.config.auto_delete else { return };
    let at = Utc::now() + TimeDelta::from_std(after).unwrap_or(TimeDelta::zero());
    if let Err(e) = state.autodelete.schedule(chat.0, sent.0, at).await {
        warn!(error = %e, "auto-delete not scheduled");
    }
}

/* ====== Callback-кнопки ====== */
async fn on_callback(bot: Bot, q: CallbackQuery, state: &BotState) -> ResponseResult<()> {
    let Some(action) = q.data.as_deref().and_then(CallbackAction::parse) else {
        answer_cb(&bot, &q, "Неизвестная команда").await?;
        return Ok(());
    };
    let user_id = q.from.id.0 as i64;
    let chat = q.message.as_ref().map(|m| m.chat().id).unwrap_or(ChatId(user_id));

    match action {
        CallbackAction::Deliver(index) => {
            let group = state.sessions.get(&chat.0).await.and_then(|g| g.get(index).cloned());
            match group {
                Some(group) => {
                    answer_cb(&bot, &q, "Отправляю").await?;
                    deliver_group(&bot, chat, &group, state).await?;
                }
                None => answer_cb(&bot, &q, "Поиск устарел, повтори запрос").await?,
            }
        }
        CallbackAction::Approve(_) | CallbackAction::Reject(_) if !state.config.is_admin(user_id) => {
            answer_cb(&bot, &q, "Только для админов").await?;
        }
        CallbackAction::Approve(id) => {
            let result = state.requests.approve(id, Moderator::Admin(user_id)).await;
            report_moderation(&bot, &q, state, result).await?;
        }
        CallbackAction::Reject(id) => {
            let result = state.requests.reject(id, Moderator::Admin(user_id), None).await;
            report_moderation(&bot, &q, state, result).await?;
        }
    }
    Ok(())
}

async fn report_moderation(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
    result: Result<MovieRequest, LedgerError>,
) -> ResponseResult<()> {
    match result {
        Ok(request) => {
            answer_cb(bot, q, &format!("Заявка #{} {}", request.id, request.status)).await?;
            notify_resolved(bot, state, &request).await;
        }
        // кнопка у второго админа: показываем, кто успел раньше
        Err(LedgerError::NotPending { id, .. }) => {
            let text = match state.requests.get(id).await {
                Ok(Some(request)) => resolved_note(&request),
                _ => GENERIC_FAILURE.to_string(),
            };
            answer_cb(bot, q, &text).await?;
        }
        Err(e) if e.is_declined() => answer_cb(bot, q, &e.to_string()).await?,
        Err(_) => answer_cb(bot, q, GENERIC_FAILURE).await?,
    }
    Ok(())
}

fn resolved_note(request: &MovieRequest) -> String {
    let by = request.approved_by.or(request.rejected_by);
    match by {
        Some(moderator) => format!("Заявка #{} уже {} ({moderator})", request.id, request.status),
        None => format!("Заявка #{} уже {}", request.id, request.status),
    }
}

/* ====== Уведомления ====== */
async fn notify_admins(bot: &Bot, state: &BotState, request: &MovieRequest) {
    let text = format!(
        "Новая заявка #{}: <b>{}</b>\nот {} (<code>{}</code>)",
        request.id,
        html_escape(&request.movie_name),
        html_escape(&request.display_name),
        request.user_id
    );
    for &admin in &state.config.admin_ids {
        let sent = bot
            .send_message(ChatId(admin), text.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard_moderation(request.id))
            .await;
        if let Err(e) = sent {
            warn!(error = %e, admin, "admin not notified");
        }
    }
}

/// Сообщить автору заявки итог и отметить это в леджере.
async fn notify_resolved(bot: &Bot, state: &BotState, request: &MovieRequest) {
    let name = html_escape(&request.movie_name);
    let text = match request.status {
        RequestStatus::Approved => format!("🎉 <b>{name}</b> теперь в каталоге! Пришли название, чтобы получить."),
        RequestStatus::Rejected => match &request.reason {
            Some(reason) => format!("Заявка на <b>{name}</b> отклонена: {}", html_escape(reason)),
            None => format!("Заявка на <b>{name}</b> отклонена."),
        },
        RequestStatus::Pending => return,
    };
    if let Err(e) = bot
        .send_message(ChatId(request.user_id), text)
        .parse_mode(ParseMode::Html)
        .await
    {
        warn!(error = %e, id = request.id, "requester not notified");
        return;
    }
    if let Err(e) = state.requests.mark_notified(request.id).await {
        warn!(error = %e, id = request.id, "notification flag not saved");
    }
}

/* ====== Списки ====== */
async fn send_my_requests(bot: &Bot, chat: ChatId, user_id: i64, state: &BotState) -> ResponseResult<()> {
    let listed = state.requests.list_for_user(user_id, MY_REQUESTS_PAGE).await;
    let stats = state.requests.user_stats(user_id).await;
    let text = match (listed, stats) {
        (Ok(list), _) if list.is_empty() => "Заявок пока нет.".to_string(),
        (Ok(list), Ok(stats)) => {
            let lines: Vec<_> = list
                .iter()
                .map(|r| format!("#{} {} — {}", r.id, html_escape(&r.movie_name), r.status))
                .collect();
            format!(
                "<b>Твои заявки</b> (за сутки {} из {}, одобрено всего {}):\n{}",
                stats.window_count_at(Utc::now()),
                state.config.daily_limit,
                stats.approved,
                lines.join("\n")
            )
        }
        _ => GENERIC_FAILURE.to_string(),
    };
    bot.send_message(chat, text).parse_mode(ParseMode::Html).await?;
    Ok(())
}

async fn send_pending(bot: &Bot, chat: ChatId, filter: &str, state: &BotState) -> ResponseResult<()> {
    let filter = (!filter.is_empty()).then_some(filter);
    let list = match state.requests.list_pending(PENDING_PAGE, filter).await {
        Ok(list) => list,
        Err(_) => {
            bot.send_message(chat, GENERIC_FAILURE).await?;
            return Ok(());
        }
    };
    if list.is_empty() {
        bot.send_message(chat, "Заявок на рассмотрении нет.").await?;
        return Ok(());
    }
    for r in &list {
        let text = format!(
            "#{} <b>{}</b>\nот {} (<code>{}</code>), {}",
            r.id,
            html_escape(&r.movie_name),
            html_escape(&r.display_name),
            r.user_id,
            r.created_at.format("%d.%m %H:%M")
        );
        bot.send_message(chat, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard_moderation(r.id))
            .await?;
    }
    Ok(())
}

async fn report_bulk(bot: &Bot, chat: ChatId, state: &BotState, outcome: BulkOutcome) -> ResponseResult<()> {
    let mut lines = vec![format!("Готово: {} из {}", outcome.succeeded, outcome.results.len())];
    for (id, result) in &outcome.results {
        match result {
            Ok(request) => {
                lines.push(format!("#{id} — {}", request.status));
                notify_resolved(bot, state, request).await;
            }
            Err(e) if e.is_declined() => lines.push(format!("#{id} — {e}")),
            Err(_) => lines.push(format!("#{id} — ошибка хранилища")),
        }
    }
    bot.send_message(chat, lines.join("\n")).await?;
    Ok(())
}

async fn send_stats(bot: &Bot, chat: ChatId, state: &BotState) -> ResponseResult<()> {
    let (catalog, requests) = match (state.catalog.stats().await, state.requests.stats().await) {
        (Ok(c), Ok(r)) => (c, r),
        (Err(e), _) => {
            error!(error = %e, "catalog stats failed");
            bot.send_message(chat, GENERIC_FAILURE).await?;
            return Ok(());
        }
        (_, Err(e)) => {
            error!(error = %e, "request stats failed");
            bot.send_message(chat, GENERIC_FAILURE).await?;
            return Ok(());
        }
    };
    let mut lines = vec![format!(
        "<b>Каталог:</b> {} записей, в буфере {}, возраст кэша {} с",
        catalog.total,
        state.catalog.pending().await,
        catalog.cache_age.as_secs()
    )];
    for (channel, count) in &catalog.per_channel {
        lines.push(format!("• <code>{channel}</code>: {count}"));
    }
    lines.push(format!(
        "<b>Заявки:</b> всего {}, ждут {}, одобрено {}, отклонено {}",
        requests.total, requests.pending, requests.approved, requests.rejected
    ));
    if let Ok(queued) = state.autodelete.len().await {
        lines.push(format!("<b>Ждут автоудаления:</b> {queued}"));
    }
    bot.send_message(chat, lines.join("\n")).parse_mode(ParseMode::Html).await?;
    Ok(())
}

/* ====== Кнопки ====== */

fn keyboard_results(groups: &[SearchGroup]) -> InlineKeyboardMarkup {
    // по 1 в строке
    let rows = groups
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let label = format!("🎬 {} ({})", g.title(), g.count());
            vec![InlineKeyboardButton::callback(label, CallbackAction::Deliver(i).to_string())]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

fn keyboard_moderation(id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Одобрить", CallbackAction::Approve(id).to_string()),
        InlineKeyboardButton::callback("❌ Отклонить", CallbackAction::Reject(id).to_string()),
    ]])
}

/* ====== Вспомогательные ====== */

/// "/reject 3, 4 5 нет релиза" → ([3, 4, 5], Some("нет релиза"))
fn parse_moderation_args(args: &str) -> (Vec<u64>, Option<String>) {
    let mut ids = Vec::new();
    let mut rest = Vec::new();
    for token in args.split_whitespace() {
        if rest.is_empty() {
            let parsed: Option<Vec<u64>> = token
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().ok())
                .collect();
            if let Some(parsed) = parsed.filter(|p| !p.is_empty()) {
                ids.extend(parsed);
                continue;
            }
        }
        rest.push(token);
    }
    let reason = (!rest.is_empty()).then(|| rest.join(" "));
    (ids, reason)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

async fn answer_cb(bot: &Bot, q: &CallbackQuery, text: &str) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone())
        .text(text)
        .show_alert(false)
        .await?;
    Ok(())
}

fn to_req_err<E: std::fmt::Display>(e: E) -> teloxide::RequestError {
    teloxide::RequestError::Io(std::sync::Arc::new(std::io::Error::other(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::RequestSettings;
    use tempfile::TempDir;

    #[tokio::test]
    async fn late_moderation_names_who_resolved_first() {
        let dir = TempDir::new().unwrap();
        let ledger = RequestLedger::new(RequestSettings::in_dir(dir.path()));
        let request = ledger.submit(10, "Dunki", "Asha").await.unwrap();
        ledger.approve(request.id, Moderator::Admin(77)).await.unwrap();

        let second = ledger.reject(request.id, Moderator::Admin(88), None).await;
        let Err(LedgerError::NotPending { id, .. }) = second else {
            panic!("expected NotPending, got {second:?}");
        };
        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(resolved_note(&stored), format!("Заявка #{id} уже одобрена (77)"));
    }

    #[test]
    fn moderation_args_split_ids_and_reason() {
        assert_eq!(
            parse_moderation_args("3, 4 5 нет релиза 2024"),
            (vec![3, 4, 5], Some("нет релиза 2024".to_string()))
        );
        assert_eq!(parse_moderation_args("7"), (vec![7], None));
        assert_eq!(parse_moderation_args("плохо"), (vec![], Some("плохо".to_string())));
        assert_eq!(parse_moderation_args(""), (vec![], None));
    }

    #[test]
    fn request_phrase_is_detected() {
        let caps = REQUEST_PHRASE.captures("#request KGF 3").unwrap();
        assert_eq!(&caps[1], "KGF 3");
        assert!(REQUEST_PHRASE.is_match("  #ЗАПРОС Брат 3"));
        assert!(!REQUEST_PHRASE.is_match("request KGF"));
    }

    #[test]
    fn file_names_become_titles() {
        assert_eq!(title_from_file_name("Pathaan.2023.1080p.mkv"), "Pathaan 2023 1080p");
        assert_eq!(title_from_file_name("KGF_Chapter_2"), "KGF Chapter 2");
    }

    #[test]
    fn admin_commands_are_flagged() {
        assert!(Command::Flush.admin_only());
        assert!(Command::Approve(String::new()).admin_only());
        assert!(!Command::Request("x".into()).admin_only());
        assert!(!Command::MyRequests.admin_only());
    }
}
