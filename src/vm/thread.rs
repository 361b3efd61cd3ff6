// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/thread.rs

// Worker threads. Each one builds and owns a context; other threads
// reach it only through its signal queue.

// <>

use super::error::VmError;
use super::queue::{RequestQueue, SignalSender};
use super::{Vm, VmConfig};

use std::io;
use std::thread;

/// Handle to a running worker
pub struct Worker<R> {
    name: String,
    handle: thread::JoinHandle<R>,
    signals: SignalSender,
}

/// Starts a named OS thread that creates a context from `config` and
/// hands it to `f`
pub fn spawn_worker<R, F>(name: &str, config: VmConfig, f: F) -> io::Result<Worker<R>>
where
    R: Send + 'static,
    F: FnOnce(&mut Vm) -> R + Send + 'static,
{
    let requests = RequestQueue::new();
    let signals = requests.sender();

    let thread_name = name.to_string();
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        log::debug!("worker {} starting", thread_name);
        let mut vm = Vm::with_queue(config, requests);
        let out = f(&mut vm);
        vm.cleanup();
        log::debug!("worker {} finished", thread_name);
        out
    })?;

    Ok(Worker {
        name: name.to_string(),
        handle,
        signals,
    })
}

impl<R> Worker<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts a signal, delivered at the worker's next safepoint
    pub fn signal(&self, sig: i32) {
        self.signals.send(sig);
    }

    pub fn signal_sender(&self) -> SignalSender {
        self.signals.clone()
    }

    /// Waits for the worker to finish
    pub fn join(self) -> Result<R, VmError> {
        self.handle
            .join()
            .map_err(|_| VmError::WorkerPanicked(self.name))
    }
}
