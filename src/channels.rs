use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// Как доставлять пост пользователю.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// forward — источник виден (публичный канал)
    Forward,
    /// copy — источник скрыт (приватный канал)
    Copy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} is listed as both public and private")]
    Conflict(i64),
    #[error("no source channels configured")]
    Empty,
}

/// Таблица каналов-источников из конфига.
#[derive(Debug, Clone, Default)]
pub struct ChannelDirectory {
    channels: HashMap<i64, Visibility>,
}

impl ChannelDirectory {
    pub fn new(public: &[i64], private: &[i64]) -> Result<Self, ChannelError> {
        let mut channels = HashMap::new();
        for &id in public {
            channels.insert(id, Visibility::Public);
        }
        for &id in private {
            if channels.insert(id, Visibility::Private) == Some(Visibility::Public) {
                return Err(ChannelError::Conflict(id));
            }
        }
        if channels.is_empty() {
            return Err(ChannelError::Empty);
        }
        Ok(Self { channels })
    }

    pub fn contains(&self, channel_id: i64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    pub fn visibility(&self, channel_id: i64) -> Option<Visibility> {
        self.channels.get(&channel_id).copied()
    }

    pub fn delivery_mode(&self, channel_id: i64) -> Option<DeliveryMode> {
        self.visibility(channel_id).map(|v| match v {
            Visibility::Public => DeliveryMode::Forward,
            Visibility::Private => DeliveryMode::Copy,
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_follows_visibility() {
        let dir = ChannelDirectory::new(&[-100], &[-200]).unwrap();
        assert_eq!(dir.delivery_mode(-100), Some(DeliveryMode::Forward));
        assert_eq!(dir.delivery_mode(-200), Some(DeliveryMode::Copy));
        assert_eq!(dir.delivery_mode(-300), None);
        assert!(dir.contains(-200));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn rejects_conflicting_or_empty_config() {
        assert_eq!(ChannelDirectory::new(&[-1], &[-1]).unwrap_err(), ChannelError::Conflict(-1));
        assert_eq!(ChannelDirectory::new(&[], &[]).unwrap_err(), ChannelError::Empty);
    }
}
