use std::future::Future;

use tokio::task::JoinHandle;

/// A background task on the tokio runtime that is cancelled when the `Timer` is dropped.
///
/// Delayed and recurring work (health probes, topology refreshes) is owned through one of
/// these, so dropping the record that owns the timer also stops the work.
#[derive(Debug)]
pub(crate) struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(task)),
        }
    }

    /// Lets the task run to completion without cancelling it. Used by a task that removes its
    /// own timer from the map that owns it.
    pub(crate) fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::Timer;

    #[tokio::test]
    async fn dropping_timer_cancels_task() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        drop(timer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disarmed_timer_runs_to_completion() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        timer.disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fired.load(Ordering::SeqCst));
    }
}
