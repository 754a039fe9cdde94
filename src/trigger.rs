//! External action fired after every acquisition.
//!
//! A [`Trigger`] wraps a callback with no arguments and an optional delay.
//! The controller fires it once per successful poll. Delayed triggers run on
//! their own task so the poll loop never waits for them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};

/// Callback plus delay.
#[derive(Clone)]
pub struct Trigger {
    action: Arc<dyn Fn() + Send + Sync>,
    delay: Duration,
}

impl Trigger {
    /// Trigger running `action` `delay` after each acquisition.
    pub fn new<F>(action: F, delay: Duration) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            action: Arc::new(action),
            delay,
        }
    }

    /// A trigger that fires as soon as data is acquired.
    pub fn immediate<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(action, Duration::ZERO)
    }

    /// Wait between acquisition and action.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run the action now, or schedule it after the delay.
    ///
    /// Must be called from within a Tokio runtime when the delay is non-zero.
    pub fn fire(&self) {
        if self.delay.is_zero() {
            Self::send(&self.action);
            return;
        }

        info!("Trigger will be sent in {} seconds.", self.delay.as_secs_f64());
        let action = Arc::clone(&self.action);
        let delay = self.delay;
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                Self::send(&action);
            }
            .in_current_span(),
        );
    }

    fn send(action: &Arc<dyn Fn() + Send + Sync>) {
        info!("Trigger sent.");
        action();
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").field("delay", &self.delay).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Trigger, Trigger) {
        let count = Arc::new(AtomicUsize::new(0));
        let now = {
            let count = Arc::clone(&count);
            Trigger::immediate(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let later = {
            let count = Arc::clone(&count);
            Trigger::new(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(300),
            )
        };
        (count, now, later)
    }

    #[test]
    fn test_immediate_trigger_runs_inline() {
        let (count, now, _) = counting();
        now.fire();
        now.fire();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_delayed_trigger_waits() {
        let (count, _, later) = counting();

        later.fire();
        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Trigger will be sent in 0.3 seconds."));
        assert!(logs_contain("Trigger sent."));
    }

    #[test]
    fn test_debug_shows_delay() {
        let (_, _, later) = counting();
        assert!(format!("{later:?}").contains("300ms"));
    }
}
