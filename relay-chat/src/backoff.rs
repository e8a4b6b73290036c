use std::{future::Future, io, time::Duration};

use tracing::warn;

/// Each retry waits the previous delay raised to this power.
pub const BACKOFF_EXPONENT: u32 = 2;

/// Reconnect delay schedule, in whole seconds.
///
/// The delay is squared after every attempt, so initial values of 0 and 1
/// never grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: u64,
}

impl Backoff {
    pub fn new(initial_secs: u64) -> Self {
        Self {
            current: initial_secs,
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs(self.current)
    }

    /// Returns the delay to wait now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.current = self.current.saturating_pow(BACKOFF_EXPONENT);
        delay
    }
}

/// Calls `connect` until it succeeds, sleeping according to [`Backoff`]
/// between failures. There is no attempt limit.
pub async fn connect_with_backoff<T, F, Fut>(initial_secs: u64, mut connect: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut backoff = Backoff::new(initial_secs);
    loop {
        match connect().await {
            Ok(connection) => return connection,
            Err(error) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %error,
                    "connection failed, retrying in {} seconds",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn delays_square_and_saturate() {
        let mut backoff = Backoff::new(2);
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 16, 256]);

        let mut huge = Backoff::new(u64::MAX / 2);
        huge.next_delay();
        assert_eq!(huge.current().as_secs(), u64::MAX);
    }

    #[test]
    fn zero_and_one_never_grow() {
        for initial in [0, 1] {
            let mut backoff = Backoff::new(initial);
            for _ in 0..3 {
                assert_eq!(backoff.next_delay().as_secs(), initial);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_b_then_b_squared() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = Arc::clone(&attempts);
        let value = connect_with_backoff(3, move || {
            let recorded = Arc::clone(&recorded);
            async move {
                let mut attempts = recorded.lock().expect("lock");
                attempts.push(start.elapsed());
                if attempts.len() < 3 {
                    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(value, "connected");
        let attempts = attempts.lock().expect("lock");
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![3, 9]);
    }
}
