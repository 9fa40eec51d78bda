use std::time::Duration;

/// Экспоненциальная задержка между повторными попытками со случайным
/// разбросом.
///
/// Используется при повторе публикации и при переподключении цикла чтения
/// потоков.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    /// Доля задержки (0.0..=1.0), на которую она может случайно уменьшиться.
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(
        initial: Duration,
        max: Duration,
    ) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: 2,
            jitter: 0.2,
            attempt: 0,
        }
    }

    pub fn with_jitter(
        mut self,
        jitter: f64,
    ) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Номер следующей попытки (с нуля).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Задержка перед следующей попыткой; каждый вызов увеличивает её.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.factor.saturating_pow(self.attempt.min(16));
        let base = self.initial.saturating_mul(exp).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return base;
        }
        base.mul_f64(1.0 - self.jitter * fastrand::f64())
    }

    /// Сбрасывает задержку после успешной операции.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет удвоение задержки и потолок `max`.
    #[test]
    fn test_growth_is_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50))
                .with_jitter(0.0);

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.attempt(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    /// Тест проверяет, что разброс только уменьшает задержку.
    #[test]
    fn test_jitter_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(0.5);
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50));
        }
    }

    /// Тест проверяет, что большое число попыток не переполняет задержку.
    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30))
                .with_jitter(0.0);
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
