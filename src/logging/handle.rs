use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;

/// Handle для управления жизненным циклом логирования.
///
/// Держит `WorkerGuard` файлового приёмника: пока handle жив, фоновый
/// writer `tracing-appender` продолжает сбрасывать буфер на диск.
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    /// Таймаут сброса при остановке (по умолчанию 5 секунд)
    flush_timeout: Duration,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            flush_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_flush_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn has_file_sink(&self) -> bool {
        self.file_guard.is_some()
    }

    /// Останавливает файловый writer, дожидаясь сброса буфера не дольше
    /// `flush_timeout`.
    pub async fn shutdown(mut self) {
        let Some(guard) = self.file_guard.take() else {
            return;
        };

        tracing::debug!(
            timeout_ms = self.flush_timeout.as_millis() as u64,
            "Flushing file log sink"
        );

        match tokio::time::timeout(
            self.flush_timeout,
            tokio::task::spawn_blocking(move || drop(guard)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("Logging shutdown task panicked: {e}"),
            Err(_) => eprintln!(
                "WARNING: Logging shutdown exceeded timeout of {}ms",
                self.flush_timeout.as_millis()
            ),
        }
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("file_sink", &self.has_file_sink())
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_without_file_sink() {
        let handle = LoggingHandle::new(None).with_flush_timeout(Duration::from_millis(10));
        assert!(!handle.has_file_sink());
        handle.shutdown().await;
    }

    /// Тест проверяет, что остановка сбрасывает файловый writer.
    #[tokio::test]
    async fn test_shutdown_flushes_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), "test.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);

        {
            use std::io::Write;
            let mut w = writer.clone();
            w.write_all(b"hello\n").unwrap();
        }

        let handle = LoggingHandle::new(Some(guard));
        assert!(handle.has_file_sink());
        handle.shutdown().await;

        let content = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert_eq!(content, "hello\n");
    }
}
