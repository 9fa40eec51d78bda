use std::fmt;

use num_enum::TryFromPrimitive;

/// Коды статуса для категоризации ошибок хаба каналов.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки данных
/// - 4xxx: Ограничения потребителей (backpressure)
/// - 5xxx: Бэкенд хранения
/// - 6xxx: Сеть / IO
///
/// `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`,
/// что удобно, если код передаётся транспортному слою как число.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unsupported = 1001,
    Internal = 1003,
    InvalidArgs = 1004,
    InvalidConfig = 1006,
    ShuttingDown = 1007,

    // === 2xxx: Ошибки данных ===
    NotFound = 2000,
    InvalidData = 2009,

    // === 4xxx: Backpressure ===
    SlowConsumer = 4004,

    // === 5xxx: Бэкенд ===
    StorageUnavailable = 5000,
    CorruptedData = 5002,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ConnectionFailed = 6004,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с этим кодом имеет смысл повторить.
    ///
    /// Используется циклами публикации и чтения бэкенда при выборе между
    /// повтором с backoff и немедленным отказом.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::StorageUnavailable | Self::ConnectionFailed | Self::Io
        )
    }

    /// Является ли код ошибкой со стороны клиента.
    pub fn is_client_error(&self) -> bool {
        let c = self.code();
        if (2000..=4999).contains(&c) {
            return true;
        }
        matches!(self, Self::InvalidArgs | Self::InvalidConfig)
    }

    /// Является ли код ошибкой сервера или инфраструктуры.
    pub fn is_server_error(&self) -> bool {
        matches!(self.code(), 1000..=1999 | 5000..=6999) && !self.is_client_error()
    }

    /// Требуется ли логировать как критическую ошибку.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Internal | Self::CorruptedData | Self::StorageUnavailable
        )
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::NotFound | Self::ShuttingDown => LogLevel::Debug,
            Self::InvalidArgs | Self::InvalidConfig | Self::InvalidData => LogLevel::Info,
            Self::SlowConsumer | Self::Timeout | Self::ConnectionClosed => LogLevel::Warn,
            Self::Internal | Self::CorruptedData | Self::StorageUnavailable => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что retryable-коды помечаются корректно.
    #[test]
    fn test_retryable() {
        assert!(StatusCode::Timeout.is_retryable());
        assert!(StatusCode::StorageUnavailable.is_retryable());
        assert!(!StatusCode::InvalidConfig.is_retryable());
        assert!(!StatusCode::SlowConsumer.is_retryable());
    }

    /// Тест проверяет разделение клиентских и серверных ошибок.
    #[test]
    fn test_client_vs_server() {
        assert!(StatusCode::InvalidConfig.is_client_error());
        assert!(StatusCode::SlowConsumer.is_client_error());
        assert!(StatusCode::Internal.is_server_error());
        assert!(StatusCode::StorageUnavailable.is_server_error());
        assert!(!StatusCode::InvalidArgs.is_server_error());
    }

    /// Тест проверяет конвертацию через `TryFrom<u32>`.
    #[test]
    fn test_from_try_from_u32() {
        let n = StatusCode::SlowConsumer.code();
        assert_eq!(StatusCode::try_from(n).unwrap(), StatusCode::SlowConsumer);
        assert!(StatusCode::from_u32(99999).is_none());
        let raw: u32 = StatusCode::NotFound.into();
        assert_eq!(raw, 2000);
    }

    /// Тест проверяет уровни логирования для разных кодов.
    #[test]
    fn test_log_level_mappings() {
        assert_eq!(StatusCode::Success.log_level(), LogLevel::Trace);
        assert_eq!(StatusCode::SlowConsumer.log_level(), LogLevel::Warn);
        assert_eq!(StatusCode::StorageUnavailable.log_level(), LogLevel::Error);
        assert!(StatusCode::StorageUnavailable.is_critical());
    }

    /// Тест проверяет формат `Display`.
    #[test]
    fn test_display_contains_name_and_code() {
        let s = format!("{}", StatusCode::SlowConsumer);
        assert!(s.contains("4004"), "got: {s}");
        assert!(s.contains("SlowConsumer"), "got: {s}");
    }
}
