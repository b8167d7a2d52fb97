//! Bounded, cancellable polling.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{CommError, PollCondition};

/// Interval between probes and the maximum number of probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until cancelled.
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Sleep one interval, then probe; repeat until the probe yields a value.
///
/// The caller is expected to have probed once already, so consecutive probes
/// are always at least `interval` apart. Probe errors end the loop.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    condition: PollCondition,
    mut probe: F,
) -> Result<T, CommError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, CommError>>,
{
    let mut attempts: u32 = 0;
    loop {
        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(CommError::PollTimeout {
                condition,
                attempts,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CommError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }

        attempts += 1;
        debug!("[labcomm-poll] Checking {} (attempt {})", condition, attempts);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CommError::Cancelled),
            outcome = probe(attempts) => outcome?,
        };
        if let Some(value) = outcome {
            return Ok(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_probes_are_spaced_by_interval() {
        let cancel = CancellationToken::new();
        let times = Arc::new(Mutex::new(Vec::new()));
        let seen = times.clone();

        let value = poll_until(
            PollPolicy::new(Duration::from_millis(1000), None),
            &cancel,
            PollCondition::Licensed,
            move |attempt| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(Instant::now());
                    Ok::<_, CommError>((attempt == 3).then_some(attempt))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap() {
        let cancel = CancellationToken::new();
        let err = poll_until(
            PollPolicy::new(Duration::from_millis(10), Some(4)),
            &cancel,
            PollCondition::BackendUp,
            |_| async { Ok::<Option<()>, CommError>(None) },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CommError::PollTimeout {
                condition: PollCondition::BackendUp,
                attempts: 4
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = poll_until(
            PollPolicy::new(Duration::from_millis(1000), None),
            &cancel,
            PollCondition::Licensed,
            |_| async { Ok::<Option<()>, CommError>(None) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_ends_loop() {
        let cancel = CancellationToken::new();
        let err = poll_until(
            PollPolicy::new(Duration::from_millis(1000), None),
            &cancel,
            PollCondition::BackendUp,
            |_| async { Err::<Option<()>, _>(CommError::ChannelUnavailable("nb".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommError::ChannelUnavailable(_)));
    }
}
