use std::sync::Arc;
use tokio::sync::watch;

/// 一次性广播信号
///
/// A fuse starts intact and can be broken exactly once. Breaking never blocks,
/// and any number of tasks may wait on it, before or after it breaks.
#[derive(Clone, Debug)]
pub struct Fuse {
    tx: Arc<watch::Sender<bool>>,
}

impl Fuse {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Breaks the fuse. Returns `true` only for the call that actually broke it.
    pub fn break_fuse(&self) -> bool {
        self.tx.send_if_modified(|broken| {
            if *broken {
                false
            } else {
                *broken = true;
                true
            }
        })
    }

    pub fn is_broken(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the fuse is broken.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this can only return Ok
        let _ = rx.wait_for(|broken| *broken).await;
    }
}

impl Default for Fuse {
    fn default() -> Self {
        Self::new()
    }
}
