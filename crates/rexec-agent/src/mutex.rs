use dashmap::DashMap;
use rexec_protocol::{Isolation, IsolationLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Name used when a fully isolated script does not name its mutex.
pub const DEFAULT_MUTEX_NAME: &str = "RunningScript";

/// Named locks serializing fully isolated scripts.
#[derive(Debug, Default, Clone)]
pub struct IsolationMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for as long as the script runs. Empty for unisolated scripts.
#[derive(Debug)]
pub struct IsolationGuard {
    _held: Option<OwnedMutexGuard<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    TimedOut,
    Cancelled,
}

impl IsolationMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the right to run. `NoIsolation` never waits and never
    /// blocks anyone else.
    pub async fn acquire(
        &self,
        isolation: &Isolation,
        cancel: &CancellationToken,
    ) -> Result<IsolationGuard, AcquireError> {
        if isolation.level == IsolationLevel::NoIsolation {
            return Ok(IsolationGuard { _held: None });
        }

        let name = if isolation.mutex_name.is_empty() {
            DEFAULT_MUTEX_NAME
        } else {
            isolation.mutex_name.as_str()
        };
        let lock = Arc::clone(self.locks.entry(name.to_string()).or_default().value());
        let timeout = isolation.mutex_timeout_ms.map(Duration::from_millis);

        let acquire = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                    .await
                    .map_err(|_| AcquireError::TimedOut),
                None => Ok(lock.lock_owned().await),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AcquireError::Cancelled),
            held = acquire => held.map(|guard| IsolationGuard { _held: Some(guard) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_isolation_serializes_same_name() {
        let mutex = IsolationMutex::new();
        let never = CancellationToken::new();
        let first = mutex.acquire(&Isolation::full("deploy"), &never).await.unwrap();

        let mut isolation = Isolation::full("deploy");
        isolation.mutex_timeout_ms = Some(50);
        assert_eq!(
            mutex.acquire(&isolation, &never).await.unwrap_err(),
            AcquireError::TimedOut
        );

        drop(first);
        assert!(mutex.acquire(&isolation, &never).await.is_ok());
    }

    #[tokio::test]
    async fn different_names_and_no_isolation_do_not_block() {
        let mutex = IsolationMutex::new();
        let never = CancellationToken::new();
        let _held = mutex.acquire(&Isolation::full("deploy"), &never).await.unwrap();

        assert!(mutex.acquire(&Isolation::full("other"), &never).await.is_ok());
        assert!(mutex.acquire(&Isolation::none("deploy"), &never).await.is_ok());
    }

    #[tokio::test]
    async fn empty_name_uses_default_mutex() {
        let mutex = IsolationMutex::new();
        let never = CancellationToken::new();
        let _held = mutex.acquire(&Isolation::full(""), &never).await.unwrap();

        let mut isolation = Isolation::full(DEFAULT_MUTEX_NAME);
        isolation.mutex_timeout_ms = Some(20);
        assert_eq!(
            mutex.acquire(&isolation, &never).await.unwrap_err(),
            AcquireError::TimedOut
        );
    }

    #[tokio::test]
    async fn waiting_acquire_can_be_cancelled() {
        let mutex = IsolationMutex::new();
        let never = CancellationToken::new();
        let _held = mutex.acquire(&Isolation::full("deploy"), &never).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let mutex = mutex.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mutex.acquire(&Isolation::full("deploy"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), AcquireError::Cancelled);
    }
}
