// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/queue.rs

// Pending request queue for one execution context. Other threads and
// the memory manager post work here; the dispatch loop notices the
// attention flag at its next safepoint and handles the requests.

// <>

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Signals are queued
pub const SIGQ: u8 = 0b01;
/// Finalizers are pending
pub const FINQ: u8 = 0b10;

/// Attention flags and queued signal numbers
#[derive(Debug, Default)]
pub struct RequestQueue {
    flags: AtomicU8,
    signals: Mutex<VecDeque<i32>>,
}

impl RequestQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether any request awaits the next safepoint
    #[inline(always)]
    pub fn pending(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    pub fn post_signal(&self, sig: i32) {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(sig);
        self.flags.fetch_or(SIGQ, Ordering::Release);
    }

    pub fn post_finalizers(&self) {
        self.flags.fetch_or(FINQ, Ordering::Release);
    }

    /// Drains queued signals in arrival order
    pub fn take_signals(&self) -> Vec<i32> {
        let mut queue = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        self.flags.fetch_and(!SIGQ, Ordering::AcqRel);
        queue.drain(..).collect()
    }

    /// Clears the finalizer flag, reporting whether it was set
    pub fn take_finalizer_request(&self) -> bool {
        self.flags.fetch_and(!FINQ, Ordering::AcqRel) & FINQ != 0
    }

    pub fn sender(self: &Arc<Self>) -> SignalSender {
        SignalSender {
            queue: Arc::clone(self),
        }
    }
}

/// Handle for delivering signals to a context from any thread
#[derive(Clone, Debug)]
pub struct SignalSender {
    queue: Arc<RequestQueue>,
}

impl SignalSender {
    pub fn send(&self, sig: i32) {
        log::debug!("posting signal {}", sig);
        self.queue.post_signal(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn flags() {
        let q = RequestQueue::new();
        assert!(!q.pending());
        q.post_finalizers();
        assert!(q.pending());
        assert!(q.take_finalizer_request());
        assert!(!q.take_finalizer_request());
        assert!(!q.pending());
    }

    #[test]
    fn signals_cross_threads() {
        let q = RequestQueue::new();
        let tx = q.sender();
        let handle = thread::spawn(move || {
            tx.send(2);
            tx.send(15);
        });
        handle.join().unwrap();

        assert!(q.pending());
        assert_eq!(q.take_signals(), vec![2, 15]);
        assert!(!q.pending());
        assert!(q.take_signals().is_empty());
    }
}
