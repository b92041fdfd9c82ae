//! Heartbeat scheduler for periodic maintenance callbacks.
//!
//! Components register sweeps here (XDB waiter expiry, connector queue
//! drains, reconnect supervision) instead of spawning ad-hoc timers. All
//! registered tasks stop together at shutdown.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Registry of periodic callbacks, each running on its own interval task.
#[derive(Default)]
pub struct Heartbeat {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new() -> Heartbeat {
        Heartbeat::default()
    }

    /// Run `beat` every `period`, first firing one period from now.
    pub fn register<F, Fut>(&self, period: Duration, beat: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                beat().await;
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Stop every registered callback.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        debug!(count = tasks.len(), "stopping heartbeat tasks");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_beat_fires_on_period() {
        let heartbeat = Heartbeat::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        heartbeat.register(Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // nothing before the first period elapses
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        heartbeat.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
