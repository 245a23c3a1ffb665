use std::fmt;

/* ====== Callback-кнопки ======
   get:<n>  — выдать n-ю группу из последнего поиска
   ok:<id>  — одобрить заявку (админ)
   no:<id>  — отклонить заявку (админ)
   Разбираем один раз на входе, дальше только match. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Deliver(usize),
    Approve(u64),
    Reject(u64),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let (tag, arg) = data.split_once(':')?;
        match tag {
            "get" => arg.parse().ok().map(Self::Deliver),
            "ok" => arg.parse().ok().map(Self::Approve),
            "no" => arg.parse().ok().map(Self::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deliver(n) => write!(f, "get:{n}"),
            Self::Approve(id) => write!(f, "ok:{id}"),
            Self::Reject(id) => write!(f, "no:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_payloads() {
        assert_eq!(CallbackAction::parse("get:3"), Some(CallbackAction::Deliver(3)));
        assert_eq!(CallbackAction::parse("ok:17"), Some(CallbackAction::Approve(17)));
        assert_eq!(CallbackAction::Reject(9).to_string(), "no:9");
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(CallbackAction::parse("add:1"), None);
        assert_eq!(CallbackAction::parse("ok:-1"), None);
        assert_eq!(CallbackAction::parse("get"), None);
        assert_eq!(CallbackAction::parse(""), None);
    }
}
