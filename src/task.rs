//! Restart-on-panic supervision for background tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns `make()` and spawns it again whenever it panics.
///
/// Supervision ends when the task returns normally or `cancel` fires; on
/// cancellation the running task is aborted.
pub(crate) fn supervise<F, Fut>(name: String, cancel: CancellationToken, make: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut task = tokio::spawn(make());

            tokio::select! {
                result = &mut task => match result {
                    Ok(()) => return,
                    Err(e) if e.is_panic() => {
                        tracing::error!("{name} panicked, restarting: {e}");
                    }
                    Err(e) => {
                        tracing::debug!("{name} stopped: {e}");
                        return;
                    }
                },

                () = cancel.cancelled() => {
                    task.abort();
                    tracing::debug!("{name} cancelled");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn supervise_restarts_after_panic() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let handle = supervise("flaky".to_string(), CancellationToken::new(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn supervise_stops_on_cancel() {
        let cancel = CancellationToken::new();

        let handle = supervise("idle".to_string(), cancel.clone(), || {
            futures::future::pending::<()>()
        });

        cancel.cancel();
        handle.await.unwrap();
    }
}
