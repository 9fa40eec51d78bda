use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::HubError;

/// Что делать, когда очередь подписки заполнена.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Вытеснить самое старое недоставленное сообщение.
    #[default]
    DropOldest,
    /// Закрыть подписку и сообщить `SlowConsumer`.
    Disconnect,
}

/// Выбор бэкенда хаба.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendConfig {
    #[default]
    Memory,
    Stream(StreamConfig),
}

/// Параметры бэкенда Redis Streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: String,
    /// Префикс всех ключей хаба.
    pub key_prefix: String,
    /// Максимальное время одного блокирующего `XREAD`.
    pub read_block: Duration,
    /// Максимум записей за одно чтение.
    pub read_count: usize,
    /// `MAXLEN ~` вместо точного `MAXLEN =`.
    pub cap_approximate: bool,
}

/// Конфигурация хаба.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub backend: BackendConfig,
    /// Сколько последних сообщений канала хранит бэкенд.
    pub max_backlog: usize,
    /// Через сколько простоя канал считается заброшенным.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    /// Ёмкость очереди одной подписки.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Сколько раз `publish` повторяет запись при транзиентной ошибке.
    pub publish_retries: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

#[derive(Debug, Default)]
pub struct HubConfigBuilder {
    backend: Option<BackendConfig>,
    max_backlog: Option<usize>,
    idle_ttl: Option<Duration>,
    sweep_interval: Option<Duration>,
    queue_capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
    publish_retries: Option<u32>,
    retry_initial: Option<Duration>,
    retry_max: Option<Duration>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn key_prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl HubConfig {
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }

    /// Проверяет значения. Хаб не стартует с некорректной конфигурацией.
    pub fn validate(&self) -> Result<(), HubError> {
        fn invalid(
            field: &'static str,
            reason: &str,
        ) -> Result<(), HubError> {
            Err(HubError::Configuration {
                field,
                reason: reason.to_string(),
            })
        }

        if self.max_backlog == 0 {
            return invalid("max_backlog", "must be at least 1");
        }
        if self.idle_ttl.is_zero() {
            return invalid("idle_ttl", "must be positive");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval", "must be positive");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity", "must be at least 1");
        }
        if self.retry_initial > self.retry_max {
            return invalid("retry_initial", "must not exceed retry_max");
        }

        if let BackendConfig::Stream(stream) = &self.backend {
            if stream.url.trim().is_empty() {
                return invalid("backend.url", "must not be empty");
            }
            if stream.key_prefix.is_empty() {
                return invalid("backend.key_prefix", "must not be empty");
            }
            if stream.read_block.is_zero() {
                return invalid("backend.read_block", "must be positive");
            }
            if stream.read_count == 0 {
                return invalid("backend.read_count", "must be at least 1");
            }
            // PEXPIRE принимает целые миллисекунды
            if self.idle_ttl < Duration::from_millis(1) {
                return invalid("idle_ttl", "must be at least 1ms for the stream backend");
            }
        }

        Ok(())
    }
}

impl HubConfigBuilder {
    pub fn backend(
        mut self,
        backend: BackendConfig,
    ) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn memory(self) -> Self {
        self.backend(BackendConfig::Memory)
    }

    pub fn stream(
        self,
        config: StreamConfig,
    ) -> Self {
        self.backend(BackendConfig::Stream(config))
    }

    pub fn max_backlog(
        mut self,
        max_backlog: usize,
    ) -> Self {
        self.max_backlog = Some(max_backlog);
        self
    }

    pub fn idle_ttl(
        mut self,
        ttl: Duration,
    ) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    pub fn sweep_interval(
        mut self,
        interval: Duration,
    ) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn queue_capacity(
        mut self,
        capacity: usize,
    ) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn overflow(
        mut self,
        policy: OverflowPolicy,
    ) -> Self {
        self.overflow = Some(policy);
        self
    }

    pub fn publish_retries(
        mut self,
        retries: u32,
    ) -> Self {
        self.publish_retries = Some(retries);
        self
    }

    pub fn retry_backoff(
        mut self,
        initial: Duration,
        max: Duration,
    ) -> Self {
        self.retry_initial = Some(initial);
        self.retry_max = Some(max);
        self
    }

    pub fn build(self) -> HubConfig {
        let default = HubConfig::default();
        HubConfig {
            backend: self.backend.unwrap_or(default.backend),
            max_backlog: self.max_backlog.unwrap_or(default.max_backlog),
            idle_ttl: self.idle_ttl.unwrap_or(default.idle_ttl),
            sweep_interval: self.sweep_interval.unwrap_or(default.sweep_interval),
            queue_capacity: self.queue_capacity.unwrap_or(default.queue_capacity),
            overflow: self.overflow.unwrap_or(default.overflow),
            publish_retries: self.publish_retries.unwrap_or(default.publish_retries),
            retry_initial: self.retry_initial.unwrap_or(default.retry_initial),
            retry_max: self.retry_max.unwrap_or(default.retry_max),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ZUMIC_CHANNELS".to_string(),
            read_block: Duration::from_millis(500),
            read_count: 100,
            cap_approximate: true,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Memory,
            max_backlog: 1000,
            idle_ttl: Duration::from_secs(3600), // 1ч
            sweep_interval: Duration::from_secs(60),
            queue_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
            publish_retries: 3,
            retry_initial: Duration::from_millis(50),
            retry_max: Duration::from_secs(2),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::DropOldest => write!(f, "drop-oldest"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
