//! Time source for periodic background work.
//!
//! Production code sleeps on the tokio timer. Tests drive periodic tasks
//! with [`ManualClock`], releasing one sleep per [`ManualClock::advance`]
//! step so convergence can be checked round by round.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Wait for one period to elapse.
    async fn sleep(&self, period: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

/// Clock whose sleeps only return when the test lets them.
#[derive(Debug, Clone)]
pub struct ManualClock {
    ticks: Arc<Semaphore>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `periods` pending or future sleeps complete, whatever their length.
    pub fn advance(&self, periods: usize) {
        self.ticks.add_permits(periods);
    }

    /// Sleeps released by `advance` that nobody has consumed yet.
    pub fn unconsumed(&self) -> usize {
        self.ticks.available_permits()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, _period: Duration) {
        match self.ticks.acquire().await {
            Ok(permit) => permit.forget(),
            // closed semaphore: nothing will ever advance us again
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_releases_one_sleep_per_tick() {
        let clock = ManualClock::new();
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_secs(3600)).await;
                clock.sleep(Duration::from_secs(3600)).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(2);
        sleeper.await.unwrap();
        assert_eq!(clock.unconsumed(), 0);
    }
}
