use std::time::Duration;

use tokio::time::Instant;

/// A cancellable one-shot with a quiet period. Each `schedule` replaces the
/// pending value and restarts the period; `fired` resolves once the period
/// passes without another `schedule`.
///
/// There is no background task: the timer only exists while `fired` is
/// being awaited, so dropping the debouncer releases everything.
#[derive(Debug)]
pub struct Debouncer<T> {
    quiet: Duration,
    pending: Option<(Instant, T)>,
}

impl<T> Debouncer<T> {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: None,
        }
    }

    pub fn schedule(&mut self, value: T) {
        self.pending = Some((Instant::now() + self.quiet, value));
    }

    /// Drop the pending value, if any, without firing.
    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|(_, value)| value)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(deadline, _)| *deadline)
    }

    /// Resolves with the pending value after the quiet period. Never
    /// resolves while nothing is scheduled. Cancel-safe: dropping the
    /// future keeps the value pending.
    pub async fn fired(&mut self) -> T {
        loop {
            let Some(deadline) = self.deadline() else {
                return std::future::pending().await;
            };
            tokio::time::sleep_until(deadline).await;
            if let Some((_, value)) = self.pending.take() {
                return value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const QUIET: Duration = Duration::from_millis(150);

    #[tokio::test(start_paused = true)]
    async fn rapid_schedules_fire_once_with_the_last_value() {
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.schedule("r");
        advance(Duration::from_millis(100)).await;
        debouncer.schedule("rx");
        advance(Duration::from_millis(100)).await;
        debouncer.schedule("rx4");

        let started = Instant::now();
        assert_eq!(debouncer.fired().await, "rx4");
        assert!(started.elapsed() >= QUIET);
        assert!(debouncer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_before_the_quiet_period() {
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.schedule(7);
        let early = timeout(Duration::from_millis(149), debouncer.fired()).await;
        assert!(early.is_err());
        assert!(debouncer.deadline().is_some());
        assert_eq!(debouncer.fired().await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_or_idle_never_fires() {
        let mut debouncer = Debouncer::new(QUIET);
        assert!(timeout(Duration::from_secs(5), debouncer.fired()).await.is_err());

        debouncer.schedule(1);
        assert_eq!(debouncer.cancel(), Some(1));
        assert!(timeout(Duration::from_secs(5), debouncer.fired()).await.is_err());
        assert_eq!(debouncer.deadline(), None);
    }
}
