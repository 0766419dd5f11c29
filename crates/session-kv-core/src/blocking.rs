//! Bridge for callers that cannot `.await`.

use std::{future::Future, sync::OnceLock};

use tokio::runtime::Handle;

/// Drive a future to completion from synchronous code.
///
/// Inside a Tokio runtime the future runs on a scoped helper thread that
/// enters the current runtime, so the calling worker is never re-entered.
/// Outside a runtime a shared current-thread runtime is used.
///
/// # Panics
/// Panics if the helper thread panics or the fallback runtime cannot be built.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

    if let Ok(handle) = Handle::try_current() {
        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = handle.enter();
                futures::executor::block_on(future)
            })
            .join()
            .expect("blocking bridge thread panicked")
        })
    } else {
        RT.get_or_init(|| {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create blocking bridge runtime")
        })
        .block_on(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_without_runtime() {
        assert_eq!(block_on(async { 40 + 2 }), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_inside_runtime() {
        let value = block_on(async {
            tokio::task::yield_now().await;
            "done"
        });
        assert_eq!(value, "done");
    }
}
