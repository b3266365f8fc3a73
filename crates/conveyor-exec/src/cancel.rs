//! The wait-or-cancel primitive every step builds on.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use conveyor_core::{Error, Result};

/// Races a future against cancellation. Returns `Interrupted` if the
/// token fires first; a token already cancelled wins immediately, so
/// remote calls return promptly once a step is signalled.
pub async fn with_cancel<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Interrupted),
        value = fut => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn passes_the_value_through_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = with_cancel(&token, async { 17 }).await.unwrap();
        assert_eq!(value, 17);
    }

    #[tokio::test]
    async fn interrupts_a_pending_future() {
        let token = CancellationToken::new();
        let racing = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            racing.cancel();
        });

        let err = with_cancel(&token, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test]
    async fn already_cancelled_token_wins_over_a_ready_future() {
        let token = CancellationToken::new();
        token.cancel();

        let err = with_cancel(&token, async { 17 }).await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}
