//! Cancellation plumbing for collaborator calls.

use std::future::Future;
use std::time::Duration;

use imgpull_core::error::{PullError, Result};
use tokio_util::sync::CancellationToken;

pub(crate) fn canceled(what: &str) -> PullError {
    PullError::Canceled(format!("{} canceled", what))
}

/// Race `fut` against `cancel`; the future is dropped as soon as the token
/// fires.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(canceled(what));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(canceled(what)),
        result = fut => result,
    }
}

/// Sleep for `delay` unless canceled first.
pub(crate) async fn sleep(cancel: &CancellationToken, what: &str, delay: Duration) -> Result<()> {
    cancellable(cancel, what, async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}
