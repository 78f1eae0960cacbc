// Copyright (c) 2025 Sean McNamara <smcnam@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A cheap, cloneable cancellation signal shared across the daemon's
//! long-lived activities.
//!
//! This stands in for the "ambient cancellation context" threaded through
//! every suspension point in the design. A `CancellationToken` is either
//! linked to its parent (the common case) or detached (used around VCS
//! operations once an execution has already succeeded, so a shutdown
//! request cannot tear apart a half-finished release).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns a token that reports this token's cancellation state at the
    /// moment of the call, but can never itself be cancelled or observe
    /// future cancellation. Used around VCS operations per the processor's
    /// post-execution release step.
    pub fn detached(&self) -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Block the calling thread until either cancellation fires or `timeout`
    /// elapses, whichever comes first. Returns `true` if cancellation fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.inner.lock.lock().unwrap();
        let (_guard, _result) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap();
        self.is_cancelled()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn detached_ignores_parent_cancellation() {
        let token = CancellationToken::new();
        let detached = token.detached();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(!detached.is_cancelled());
    }

    #[test]
    fn wait_timeout_returns_on_cancel() {
        let token = CancellationToken::new();
        let clone = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            clone.cancel();
        });

        let cancelled = token.wait_timeout(Duration::from_secs(2));
        assert!(cancelled);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_cancel() {
        let token = CancellationToken::new();
        let cancelled = token.wait_timeout(Duration::from_millis(20));
        assert!(!cancelled);
    }
}
