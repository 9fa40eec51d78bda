use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки ожидания сообщения из подписки.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    /// Подписка закрыта (отписка, остановка хаба).
    #[error("Subscription is closed")]
    Closed,
    /// Подписка отключена за переполнение очереди. Возвращается один раз,
    /// дальше подписка отвечает `Closed`.
    #[error("Subscription disconnected: queue capacity {capacity} exceeded")]
    SlowConsumer { capacity: usize },
}

/// Ошибки неблокирующего получения сообщения.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Нет доступных сообщений.
    #[error("No messages available")]
    Empty,
    /// Подписка закрыта.
    #[error("Subscription is closed")]
    Closed,
    /// Подписка отключена за переполнение очереди.
    #[error("Subscription disconnected: queue capacity {capacity} exceeded")]
    SlowConsumer { capacity: usize },
}

impl ErrorExt for RecvError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Closed => StatusCode::ConnectionClosed,
            Self::SlowConsumer { .. } => StatusCode::SlowConsumer,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ErrorExt for TryRecvError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Empty => StatusCode::NotFound,
            Self::Closed => StatusCode::ConnectionClosed,
            Self::SlowConsumer { .. } => StatusCode::SlowConsumer,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl From<RecvError> for TryRecvError {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::Closed => TryRecvError::Closed,
            RecvError::SlowConsumer { capacity } => TryRecvError::SlowConsumer { capacity },
        }
    }
}
