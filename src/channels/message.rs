use std::{fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Имя канала.
///
/// Неизменяемый идентификатор, дешёвый в клонировании (`Arc<str>`), так как
/// одно и то же имя хранится в реестре, в каждой подписке и в каждом
/// сообщении.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(Arc<str>);

/// Токен упорядочивания, назначенный бэкендом.
///
/// Формат совпадает с идентификаторами Redis Streams: `<ms>-<seq>`.
/// В пределах одного канала идентификаторы строго возрастают.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId {
    pub ms: u64,
    pub seq: u64,
}

/// Ошибка разбора `MessageId` из строки.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid message id '{0}'")]
pub struct ParseMessageIdError(pub String);

/// Опубликованное сообщение. Неизменяемо после создания.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: ChannelName,
    pub payload: Bytes,
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ChannelName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MessageId {
    /// Минимальный идентификатор, меньше любого реального.
    pub const ZERO: MessageId = MessageId { ms: 0, seq: 0 };

    pub const fn new(
        ms: u64,
        seq: u64,
    ) -> Self {
        Self { ms, seq }
    }

    /// Следующий идентификатор после `self` для момента `now_ms`.
    ///
    /// Если часы ушли назад или остались в той же миллисекунде,
    /// увеличивается последовательный номер.
    pub fn next_after(
        self,
        now_ms: u64,
    ) -> Self {
        if now_ms > self.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }

    /// Время создания, закодированное в идентификаторе.
    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }
}

impl Message {
    /// Собирает сообщение; время берётся из идентификатора.
    pub fn new(
        channel: ChannelName,
        payload: impl Into<Bytes>,
        id: MessageId,
    ) -> Self {
        Self {
            channel,
            payload: payload.into(),
            timestamp: id.timestamp(),
            id,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for ChannelName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        ChannelName::new(s)
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        ChannelName(Arc::from(s))
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMessageIdError(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(MessageId::new(
                ms.parse().map_err(|_| err())?,
                seq.parse().map_err(|_| err())?,
            )),
            None => Ok(MessageId::new(s.parse().map_err(|_| err())?, 0)),
        }
    }
}
