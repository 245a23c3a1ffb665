use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_QUERY_LEN: usize = 100;

// пунктуация, допустимая в названиях помимо букв/цифр любых алфавитов
const ALLOWED_PUNCT: &[char] = &[
    '-', '_', '.', ',', ':', ';', '!', '?', '\'', '"', '(', ')', '[', ']', '&', '+', '#', '/',
    '@', '|',
];

static LINKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:https?://|www\.|t\.me/)\S+").expect("valid regex"));
static MENTIONS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[@#]\w+").expect("valid regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("название должно быть от {MIN_NAME_LEN} до {MAX_NAME_LEN} символов")]
    NameLength,
    #[error("недопустимый символ в названии: {0:?}")]
    NameCharacter(String),
    #[error("некорректный id сообщения: {0}")]
    MessageId(i32),
    #[error("некорректный id канала: {0}")]
    ChannelId(i64),
}

/// Проверка названия фильма. Возвращает нормализованное название
/// (обрезанные края, одиночные пробелы).
pub fn validate_movie_name(raw: &str) -> Result<String, ValidationError> {
    let name = collapse_whitespace(raw);
    let len = name.graphemes(true).count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(ValidationError::NameLength);
    }
    if let Some(bad) = name.graphemes(true).find(|g| !grapheme_allowed(g)) {
        return Err(ValidationError::NameCharacter(bad.to_string()));
    }
    Ok(name)
}

pub fn validate_message_id(id: i32) -> Result<i32, ValidationError> {
    if id > 0 { Ok(id) } else { Err(ValidationError::MessageId(id)) }
}

pub fn validate_channel_id(id: i64) -> Result<i64, ValidationError> {
    if id != 0 { Ok(id) } else { Err(ValidationError::ChannelId(id)) }
}

/// Достаёт название из подписи поста: первая строка, в которой после чистки
/// (ссылки, @упоминания, #теги, эмодзи) осталось хотя бы 2 символа.
pub fn clean_caption(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let line = LINKS.replace_all(line, " ");
        let line = MENTIONS.replace_all(&line, " ");
        let kept: String = line
            .graphemes(true)
            .map(|g| if grapheme_allowed(g) { g } else { " " })
            .collect();
        let kept = clip_graphemes(&collapse_whitespace(&kept), MAX_NAME_LEN);
        // строка из одной пунктуации названием не считается
        let has_word = kept.chars().any(char::is_alphanumeric);
        (has_word && kept.graphemes(true).count() >= MIN_NAME_LEN).then_some(kept)
    })
}

/// Чистка поискового запроса пользователя.
pub fn clean_query(text: &str) -> Option<String> {
    let q = clip_graphemes(&collapse_whitespace(text), MAX_QUERY_LEN);
    (q.graphemes(true).count() >= MIN_NAME_LEN).then_some(q)
}

fn grapheme_allowed(g: &str) -> bool {
    match g.chars().next() {
        Some(' ') => g == " ",
        Some(c) if c.is_alphanumeric() => true,
        Some(c) => g.chars().count() == 1 && ALLOWED_PUNCT.contains(&c),
        None => false,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clip_graphemes(s: &str, max: usize) -> String {
    let clipped: String = s.graphemes(true).take(max).collect();
    clipped.trim_end().to_string()
}
