use std::time::Duration;

/// Delay before the next status poll, as a function of how many polls have
/// already been made.
pub trait PollBackoffStrategy: Send + Sync {
    fn backoff(&self, iteration: u32) -> Duration;
}

impl<F> PollBackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn backoff(&self, iteration: u32) -> Duration {
        self(iteration)
    }
}

/// Doubles from `initial` up to `max`. Short scripts get answers quickly,
/// long ones are not polled more than once per `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialPollBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ExponentialPollBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl PollBackoffStrategy for ExponentialPollBackoff {
    fn backoff(&self, iteration: u32) -> Duration {
        let shift = iteration.min(30);
        let millis = (self.initial.as_millis() as u64).saturating_mul(1u64 << shift);
        let max = (self.max.as_millis() as u64).max(1);
        Duration::from_millis(millis.clamp(1, max))
    }
}
