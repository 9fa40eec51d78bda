use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки операций хаба каналов и его бэкендов.
///
/// `UnknownChannel` здесь намеренно отсутствует: публикация или чтение
/// истории неизвестного канала создаёт/возвращает пустое состояние.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// Бэкенд недоступен (потеря соединения, таймаут). Транзиентная ошибка.
    #[error("Backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// Подписка переполнила очередь при политике `disconnect`.
    #[error("Subscription {subscription} exceeded its queue capacity ({capacity})")]
    SlowConsumer { subscription: u64, capacity: usize },

    /// Некорректная конфигурация хаба.
    #[error("Invalid configuration for '{field}': {reason}")]
    Configuration { field: &'static str, reason: String },

    /// Запись потока без ожидаемых полей.
    #[error("Malformed stream entry {id} in '{key}': {reason}")]
    MalformedEntry {
        key: String,
        id: String,
        reason: String,
    },

    /// Хаб остановлен.
    #[error("Hub is shut down")]
    Closed,
}

impl HubError {
    /// Стоит ли повторять операцию, завершившуюся этой ошибкой.
    pub fn is_retryable(&self) -> bool {
        self.status_code().is_retryable()
    }
}

impl ErrorExt for HubError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BackendUnavailable { .. } => StatusCode::StorageUnavailable,
            Self::SlowConsumer { .. } => StatusCode::SlowConsumer,
            Self::Configuration { .. } => StatusCode::InvalidConfig,
            Self::MalformedEntry { .. } => StatusCode::CorruptedData,
            Self::Closed => StatusCode::ShuttingDown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::BackendUnavailable { .. } => "Channel backend unavailable".to_string(),
            Self::SlowConsumer { capacity, .. } => {
                format!("Consumer too slow (queue capacity {capacity})")
            }
            Self::Configuration { field, .. } => format!("Invalid configuration: {field}"),
            Self::MalformedEntry { .. } => "Message format error".to_string(),
            Self::Closed => "Hub is shut down".to_string(),
        }
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "hub".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::BackendUnavailable { backend, .. } => {
                tags.push(("backend", backend.to_string()));
            }
            Self::SlowConsumer { capacity, .. } => {
                tags.push(("queue_capacity", capacity.to_string()));
            }
            Self::MalformedEntry { key, .. } => {
                tags.push(("stream_key", key.clone()));
            }
            _ => {}
        }

        tags
    }
}

/// Конвертация из redis::RedisError. Любая ошибка клиента Redis трактуется
/// как недоступность бэкенда потоков.
#[cfg(feature = "redis")]
impl From<redis::RedisError> for HubError {
    fn from(err: redis::RedisError) -> Self {
        HubError::BackendUnavailable {
            backend: "stream",
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_is_retryable() {
        let err = HubError::BackendUnavailable {
            backend: "stream",
            reason: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::StorageUnavailable);
        assert!(err
            .metrics_tags()
            .iter()
            .any(|(k, v)| *k == "backend" && v == "stream"));
    }

    #[test]
    fn test_slow_consumer() {
        let err = HubError::SlowConsumer {
            subscription: 7,
            capacity: 16,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Subscription 7"));
        assert_eq!(err.client_message(), "Consumer too slow (queue capacity 16)");
    }

    #[test]
    fn test_configuration_error() {
        let err = HubError::Configuration {
            field: "idle_ttl",
            reason: "must be positive".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
        assert!(err.to_string().contains("idle_ttl"));
    }
}
