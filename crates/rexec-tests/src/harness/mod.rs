pub mod agent;
pub mod faults;
pub mod observer;

use rexec_client::ClientOptions;
use rexec_client::config::{PollBackoffSettings, RetrySettings};
use std::future::Future;
use std::time::Duration;

/// Client options scaled down for tests: fast polling and short backoff.
pub fn fast_options() -> ClientOptions {
    ClientOptions {
        retries: RetrySettings {
            base_delay_ms: 20,
            max_delay_ms: 200,
            ..RetrySettings::default()
        },
        abandon_grace_ms: 1_000,
        complete_abandon_after_ms: 1_000,
        poll_backoff: PollBackoffSettings {
            initial_ms: 20,
            max_ms: 200,
        },
        ..ClientOptions::default()
    }
}

/// Poll `check` until it returns true, or give up after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("rexec_client=debug,rexec_agent=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
