// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/memmgt.rs

// Memory management interface for the Sail virtual machine. Accounts
// heap words claimed by frames migrated off the stack, keeps the
// finalizer registry, and owns the hook that ends the process when
// memory cannot be had.

// <>

use super::queue::RequestQueue;
use super::value::Value;

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Exit status used when the process is aborted for lack of memory
pub const ABORT_STATUS: i32 = 1;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MemError {
    #[error("region limit of {limit} words exceeded (requested {requested}, in use {used})")]
    Exhausted {
        limit: usize,
        requested: usize,
        used: usize,
    },
}

/// Usage figures for a memory manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemStats {
    pub live_words: usize,
    pub peak_words: usize,
    pub total_words: usize,
    pub finalizers: usize,
    pub pending_finalizers: usize,
}

/// Claim on heap words; returned to the manager when dropped
pub struct Lease {
    words: usize,
    live: Rc<Cell<usize>>,
}

impl Lease {
    pub fn words(&self) -> usize {
        self.words
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.live.set(self.live.get() - self.words);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease({})", self.words)
    }
}

/// Services the evaluator needs from a memory manager
pub trait MemoryManager {
    /// Registers the queue to notify when finalizers become pending
    fn attach(&mut self, requests: Arc<RequestQueue>);

    fn allocate(&mut self, words: usize) -> Result<Lease, MemError>;

    /// Runs `proc_` on `obj` once nothing else refers to it
    fn register_finalizer(&mut self, obj: Value, proc_: Value);

    /// Finds unreachable finalizable objects; returns how many
    fn collect(&mut self) -> usize;

    fn take_pending_finalizers(&mut self) -> Vec<(Value, Value)>;

    fn stats(&self) -> MemStats;

    /// Ends the process; called when memory cannot be had
    fn abort(&self, msg: &str) -> !;
}

/// Default memory manager with an optional word limit
pub struct Region {
    limit: Option<usize>,
    live: Rc<Cell<usize>>,
    peak: usize,
    total: usize,
    finalizers: Vec<(Value, Value)>,
    pending: Vec<(Value, Value)>,
    requests: Option<Arc<RequestQueue>>,
}

/// Creates a new memory region
pub fn acquire_mem_region(limit: Option<usize>) -> Box<Region> {
    if cfg!(feature = "memdbg") {
        log::debug!("Creating mem region, limit {:?}", limit);
    }

    Box::new(Region {
        limit,
        live: Rc::new(Cell::new(0)),
        peak: 0,
        total: 0,
        finalizers: Vec::new(),
        pending: Vec::new(),
        requests: None,
    })
}

impl MemoryManager for Region {
    fn attach(&mut self, requests: Arc<RequestQueue>) {
        self.requests = Some(requests);
    }

    fn allocate(&mut self, words: usize) -> Result<Lease, MemError> {
        let used = self.live.get();
        if let Some(limit) = self.limit {
            if used + words > limit {
                return Err(MemError::Exhausted {
                    limit,
                    requested: words,
                    used,
                });
            }
        }

        self.live.set(used + words);
        self.total += words;
        self.peak = self.peak.max(used + words);

        if cfg!(feature = "memdbg") {
            log::debug!("allocated {} words, {} live", words, used + words);
        }

        Ok(Lease {
            words,
            live: self.live.clone(),
        })
    }

    fn register_finalizer(&mut self, obj: Value, proc_: Value) {
        self.finalizers.push((obj, proc_));
    }

    fn collect(&mut self) -> usize {
        let (dead, live): (Vec<_>, Vec<_>) = self
            .finalizers
            .drain(..)
            .partition(|(obj, _)| obj.ref_count() == Some(1));
        self.finalizers = live;

        let found = dead.len();
        if found > 0 {
            self.pending.extend(dead);
            if let Some(q) = &self.requests {
                q.post_finalizers();
            }
        }

        if cfg!(feature = "memdbg") {
            log::debug!(
                "collection found {} finalizable objects, {} registered",
                found,
                self.finalizers.len()
            );
        }
        found
    }

    fn take_pending_finalizers(&mut self) -> Vec<(Value, Value)> {
        std::mem::take(&mut self.pending)
    }

    fn stats(&self) -> MemStats {
        MemStats {
            live_words: self.live.get(),
            peak_words: self.peak,
            total_words: self.total,
            finalizers: self.finalizers.len(),
            pending_finalizers: self.pending.len(),
        }
    }

    fn abort(&self, msg: &str) -> ! {
        log::error!("{}", msg);
        eprintln!("{}", msg);
        std::process::exit(ABORT_STATUS)
    }
}

/// Region whose abort hook panics, so fatal paths can be tested
#[cfg(test)]
pub(crate) struct PanickingRegion(pub Box<Region>);

#[cfg(test)]
impl MemoryManager for PanickingRegion {
    fn attach(&mut self, requests: Arc<RequestQueue>) {
        self.0.attach(requests)
    }

    fn allocate(&mut self, words: usize) -> Result<Lease, MemError> {
        self.0.allocate(words)
    }

    fn register_finalizer(&mut self, obj: Value, proc_: Value) {
        self.0.register_finalizer(obj, proc_)
    }

    fn collect(&mut self) -> usize {
        self.0.collect()
    }

    fn take_pending_finalizers(&mut self) -> Vec<(Value, Value)> {
        self.0.take_pending_finalizers()
    }

    fn stats(&self) -> MemStats {
        self.0.stats()
    }

    fn abort(&self, msg: &str) -> ! {
        panic!("abort: {}", msg)
    }
}

#[cfg(test)]
mod region_tests {
    use super::*;

    #[test]
    fn accounts_words() {
        let mut region = acquire_mem_region(None);
        let a = region.allocate(10).unwrap();
        let b = region.allocate(5).unwrap();
        assert_eq!(region.stats().live_words, 15);
        drop(a);
        assert_eq!(region.stats().live_words, 5);
        assert_eq!(region.stats().peak_words, 15);
        assert_eq!(b.words(), 5);
    }

    #[test]
    fn enforces_limit() {
        let mut region = acquire_mem_region(Some(8));
        let _a = region.allocate(6).unwrap();
        assert_eq!(
            region.allocate(4).unwrap_err(),
            MemError::Exhausted {
                limit: 8,
                requested: 4,
                used: 6
            }
        );
        drop(_a);
        assert!(region.allocate(4).is_ok());
    }

    #[test]
    fn finds_unreachable() {
        let q = RequestQueue::new();
        let mut region = acquire_mem_region(None);
        region.attach(q.clone());

        let kept = Value::vector(vec![]);
        region.register_finalizer(kept.clone(), Value::Nil);
        region.register_finalizer(Value::vector(vec![]), Value::Nil);

        assert_eq!(region.collect(), 1);
        assert!(q.take_finalizer_request());
        assert_eq!(region.take_pending_finalizers().len(), 1);
        assert_eq!(region.stats().finalizers, 1);

        drop(kept);
        assert_eq!(region.collect(), 1);
    }
}
