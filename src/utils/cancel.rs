use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

type Hook = Box<dyn FnOnce() + Send>;

/// Job-wide cancellation signal.
///
/// Blocking I/O cannot poll a flag, so in-flight work registers an abort hook
/// (kill the child, shut the socket) that `cancel` runs exactly once.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    hooks: Mutex<Vec<(u64, Hook)>>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = {
            let mut guard = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        tracing::debug!("cancel: running {} abort hook(s)", hooks.len());
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Registers `hook` until the returned guard is dropped. Runs it right
    /// away when the token is already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            drop(guard);
            hook();
        } else {
            guard.push((id, Box::new(hook)));
        }
        CancelGuard {
            token: self.clone(),
            id,
        }
    }
}

pub struct CancelGuard {
    token: CancelToken,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut hooks = self
            .token
            .inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        hooks.retain(|(id, _)| *id != self.id);
    }
}

/// Routes SIGINT and SIGTERM to `token`. Must run before any other thread
/// is spawned so every thread inherits the blocked mask. A second signal
/// exits immediately.
pub fn cancel_on_signals(token: CancelToken) -> anyhow::Result<()> {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let mut seen = 0;
            while let Ok(sig) = set.wait() {
                seen += 1;
                if seen > 1 {
                    tracing::warn!("{sig:?} again, exiting");
                    std::process::exit(130);
                }
                tracing::warn!("{sig:?} received, aborting running commands");
                token.cancel();
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn hooks_run_once_on_cancel() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _g = token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_guard_deregisters() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let g = token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(g);
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _g = token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }
}
