//! Path Walker Client (C1): requests an enumeration of a container's
//! filesystem under a bounded timeout and concurrency cap (§4.1).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use nv_policy::{FileMode, WalkResult};

use crate::error::WalkerError;

/// The out-of-scope collaborator that actually walks a container's
/// mount namespace (§1 "Out of scope": container discovery,
/// mount-namespace walking). Implementations run on whatever executor
/// they like; the client only imposes the timeout and concurrency cap.
#[async_trait::async_trait]
pub trait Walker: Send + Sync {
    async fn walk(&self, root_pid: u32, dirs: Vec<String>) -> Result<RawWalkResult, WalkerError>;
}

/// Unprocessed walker response, mirroring §4.1's `{dirs, files}` shape
/// before the filter engine (C2) narrows it to a [`WalkResult`].
pub struct RawWalkResult {
    pub dirs: Vec<(String, FileMode)>,
    pub files: Vec<(String, FileMode)>,
}

/// Wraps a [`Walker`] with the timeout and semaphore required by §4.1
/// and §5: at most `capacity` concurrent walks, each bounded by
/// `timeout`.
pub struct WalkerClient {
    walker: Arc<dyn Walker>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl WalkerClient {
    #[must_use]
    pub fn new(walker: Arc<dyn Walker>, capacity: usize, timeout: Duration) -> Self {
        Self {
            walker,
            semaphore: Arc::new(Semaphore::new(capacity)),
            timeout,
        }
    }

    /// On timeout, task failure, or a malformed response the caller
    /// proceeds with an empty enumeration (§7 "Walker timeout yields an
    /// empty enumeration") — this method still returns `Err` so the
    /// core can log the condition, but [`WalkResult::default`] is
    /// always a safe fallback for its caller.
    pub async fn walk(&self, root_pid: u32, dirs: Vec<String>) -> Result<WalkResult, WalkerError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| WalkerError::TaskFailed("semaphore closed".to_string()))?;

        let result = tokio::time::timeout(self.timeout, self.walker.walk(root_pid, dirs)).await;

        match result {
            Err(_) => Err(WalkerError::Timeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(raw)) => {
                if raw.dirs.iter().any(|(path, _)| path.is_empty()) {
                    return Err(WalkerError::MalformedResponse("empty directory path".to_string()));
                }
                Ok(WalkResult {
                    dirs: raw.dirs,
                    files: raw.files,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowWalker {
        delay: Duration,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Walker for SlowWalker {
        async fn walk(&self, _root_pid: u32, _dirs: Vec<String>) -> Result<RawWalkResult, WalkerError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(RawWalkResult { dirs: vec![("/etc".to_string(), 0o755)], files: vec![] })
        }
    }

    struct FailingWalker;

    #[async_trait::async_trait]
    impl Walker for FailingWalker {
        async fn walk(&self, _root_pid: u32, _dirs: Vec<String>) -> Result<RawWalkResult, WalkerError> {
            Err(WalkerError::TaskFailed("boom".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_capped_at_two() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let walker = Arc::new(SlowWalker {
            delay: Duration::from_millis(50),
            concurrent: concurrent.clone(),
            max_concurrent: max_concurrent.clone(),
        });
        let client = Arc::new(WalkerClient::new(walker, 2, Duration::from_secs(1)));

        let mut handles = Vec::new();
        for pid in 0..5 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.walk(pid, vec![]).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_timeout_error() {
        let walker = Arc::new(SlowWalker {
            delay: Duration::from_millis(200),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Arc::new(AtomicUsize::new(0)),
        });
        let client = WalkerClient::new(walker, 2, Duration::from_millis(10));
        let err = client.walk(1, vec![]).await.unwrap_err();
        assert!(matches!(err, WalkerError::Timeout));
    }

    #[tokio::test]
    async fn task_failure_propagates() {
        let client = WalkerClient::new(Arc::new(FailingWalker), 2, Duration::from_secs(1));
        let err = client.walk(1, vec![]).await.unwrap_err();
        assert!(matches!(err, WalkerError::TaskFailed(_)));
    }
}
