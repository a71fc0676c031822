//! Task spawning and timers for the client's background work.

use std::future::Future;
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
const LOG_TARGET: &str = "firestore::runtime";

/// Runs `future` in the background without waiting for it.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Runs `future` in the background without waiting for it.
///
/// Uses the ambient Tokio runtime when there is one. Otherwise the task goes
/// to a process-wide runtime driven by its own thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }
    match fallback_runtime() {
        Some(runtime) => {
            runtime.spawn(future);
        }
        None => log::error!(target: LOG_TARGET, "no runtime available; background task dropped"),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn fallback_runtime() -> Option<&'static tokio::runtime::Runtime> {
    use std::sync::{Once, OnceLock};
    use tokio::runtime::{Builder, Runtime};

    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    static DRIVER: Once = Once::new();

    let runtime: &'static Runtime = RUNTIME
        .get_or_init(|| match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!(target: LOG_TARGET, "failed to build background runtime: {err}");
                None
            }
        })
        .as_ref()?;
    DRIVER.call_once(|| {
        let driver = std::thread::Builder::new()
            .name("firestore-background".to_string())
            .spawn(move || runtime.block_on(std::future::pending::<()>()));
        if let Err(err) = driver {
            log::error!(target: LOG_TARGET, "failed to start background thread: {err}");
        }
    });
    Some(runtime)
}

/// Waits for `duration`. Returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn spawns_without_an_ambient_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        sleep(Duration::ZERO).await;
    }
}
