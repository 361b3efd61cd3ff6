// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/mod.rs

// The Sail virtual machine. An execution context owns a fixed stack,
// the register set, and the chains that drive non-local control;
// native code enters it through evaluate and apply.

// <>

pub mod asm;
pub mod code;
pub mod cont;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod memmgt;
pub mod parser;
pub mod queue;
pub mod stdenv;
pub mod symtab;
pub mod thread;
pub mod value;
pub mod wind;

mod call;
mod eval;

use code::{CompiledCode, Pc};
use cont::EscapePoint;
use dispatch::{MethodDispatch, TypeDispatch};
use error::{describe, ConditionKind, Escape, VmError, VmResult};
use frame::{ContRef, EnvRef, Slot};
use memmgt::{MemStats, MemoryManager};
use queue::{RequestQueue, SignalSender};
use symtab::Module;
use value::{Generic, Procedure, Value};
use wind::WindChain;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Capacity of the value register plus the secondary values
pub const MAX_VALUES: usize = 20;
/// Slots taken by one continuation frame
pub const CONT_FRAME_SIZE: usize = 1;
/// Slots taken by one environment header
pub const ENV_HDR_SIZE: usize = 1;

/// Settings fixed when a context is created
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Stack capacity in slots
    pub stack_size: usize,
    /// Words of heap frames allowed before migration fails
    pub heap_limit: Option<usize>,
    /// Frames shown in an error report
    pub trace_depth: usize,
    pub report_to_stderr: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 10000,
            heap_limit: None,
            trace_depth: 30,
            report_to_stderr: true,
        }
    }
}

impl VmConfig {
    pub fn with_stack_size(mut self, slots: usize) -> Self {
        self.stack_size = slots;
        self
    }

    pub fn with_heap_limit(mut self, words: usize) -> Self {
        self.heap_limit = Some(words);
        self
    }

    pub fn with_trace_depth(mut self, depth: usize) -> Self {
        self.trace_depth = depth;
        self
    }

    pub fn with_report_to_stderr(mut self, on: bool) -> Self {
        self.report_to_stderr = on;
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RuntimeFlags {
    pub error_being_reported: bool,
}

/// Frame migration counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    pub migrations: usize,
    pub frames_moved: usize,
}

/// Record of one entry from native code into the evaluator
pub(crate) struct Marker {
    pub id: u64,
    /// The boundary frame pushed on entry
    pub cont: Option<ContRef>,
}

/// One execution context
pub struct Vm {
    pub(crate) config: VmConfig,

    pub(crate) stack: Vec<Slot>,
    pub(crate) sp: usize,
    pub(crate) argp: usize,
    pub(crate) pc: Pc,
    pub(crate) base: Option<Rc<CompiledCode>>,
    pub(crate) env: Option<EnvRef>,
    pub(crate) cont: Option<ContRef>,

    pub(crate) val0: Value,
    pub(crate) vals: Vec<Value>,
    pub(crate) num_vals: usize,

    pub(crate) handlers: WindChain,
    pub(crate) exception_handler: Option<Value>,
    pub(crate) escape_point: Option<Rc<EscapePoint>>,
    pub(crate) floating: Option<Rc<EscapePoint>>,
    pub(crate) markers: Vec<Marker>,
    next_marker: u64,

    pub(crate) flags: RuntimeFlags,
    pub(crate) requests: Arc<RequestQueue>,
    signal_handlers: HashMap<i32, Value>,
    pub(crate) memory: Box<dyn MemoryManager>,
    pub(crate) module: Rc<Module>,
    pub(crate) dispatch: Box<dyn MethodDispatch>,
    pub(crate) object_apply: Value,
    pub(crate) default_escape_handler: Option<Value>,
    pub(crate) last_report: Option<String>,
    pub(crate) stats: VmStats,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_queue(config, RequestQueue::new())
    }

    /// Creates a context that takes its requests from `requests`
    pub fn with_queue(config: VmConfig, requests: Arc<RequestQueue>) -> Self {
        log::debug!(
            "creating context: stack {} slots, heap limit {:?}",
            config.stack_size,
            config.heap_limit
        );

        let mut memory = memmgt::acquire_mem_region(config.heap_limit);
        memory.attach(requests.clone());

        let sail = Module::new("sail");
        stdenv::install(&sail);
        let module = Module::with_parent("user", sail);

        let object_apply = Value::procedure(Procedure::Generic(Generic::with_fallback(
            "object-apply",
            Rc::new(|vm: &mut Vm, args: &[Value]| {
                let what = args.first().cloned().unwrap_or_default();
                Err(vm.error(
                    ConditionKind::WrongTypeArgument,
                    format!("invalid application: {}", what),
                ))
            }),
        )));

        let mut stack = Vec::with_capacity(config.stack_size);
        stack.resize_with(config.stack_size, Slot::default);

        Self {
            config,
            stack,
            sp: 0,
            argp: 0,
            pc: Pc::Ret,
            base: None,
            env: None,
            cont: None,
            val0: Value::Undefined,
            vals: Vec::new(),
            num_vals: 1,
            handlers: None,
            exception_handler: None,
            escape_point: None,
            floating: None,
            markers: Vec::new(),
            next_marker: 1,
            flags: RuntimeFlags::default(),
            requests,
            signal_handlers: HashMap::new(),
            memory,
            module,
            dispatch: Box::new(TypeDispatch),
            object_apply,
            default_escape_handler: None,
            last_report: None,
            stats: VmStats::default(),
        }
    }

    pub fn set_memory_manager(&mut self, mut memory: Box<dyn MemoryManager>) {
        memory.attach(self.requests.clone());
        self.memory = memory;
    }

    pub fn set_dispatch(&mut self, dispatch: Box<dyn MethodDispatch>) {
        self.dispatch = dispatch;
    }

    /// Runs compiled code to completion
    pub fn evaluate(&mut self, code: Rc<CompiledCode>) -> Result<Value, VmError> {
        self.env = None;
        let out = self.eval_inner(code, Pc::At(0));
        self.surface(out)
    }

    /// Applies a procedure to arguments and runs it to completion
    pub fn apply(&mut self, proc_: &Value, args: &[Value]) -> Result<Value, VmError> {
        let out = self.call(proc_, args);
        self.surface(out)
    }

    /// Nested application for native procedures that need the result.
    /// Escapes propagate to the caller unchanged.
    pub fn call(&mut self, proc_: &Value, args: &[Value]) -> VmResult<Value> {
        self.eval_inner(CompiledCode::apply_stub(proc_, args), Pc::At(0))
    }

    fn surface(&mut self, out: VmResult<Value>) -> Result<Value, VmError> {
        match out {
            Ok(v) => Ok(v),
            Err(Escape::Error { condition, .. }) => {
                let (type_name, message) = describe(&condition);
                Err(VmError::Uncaught {
                    type_name,
                    message,
                    report: self.last_report.take().unwrap_or_default(),
                })
            }
            Err(Escape::Continuation { .. }) => Err(VmError::StrayContinuation),
        }
    }

    /// All values produced by the last evaluation
    pub fn results(&self) -> Vec<Value> {
        if self.num_vals == 0 {
            return Vec::new();
        }
        let mut out = vec![self.val0.clone()];
        out.extend(self.vals.iter().take(self.num_vals - 1).cloned());
        out
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    pub fn define(&self, name: &str, value: Value) {
        self.module.define(name, value);
    }

    /// Handle for posting signals to this context from other threads
    pub fn signal_sender(&self) -> SignalSender {
        self.requests.sender()
    }

    pub fn set_signal_handler(&mut self, sig: i32, handler: Value) {
        self.signal_handlers.insert(sig, handler);
    }

    pub(crate) fn signal_handler(&self, sig: i32) -> Option<Value> {
        self.signal_handlers.get(&sig).cloned()
    }

    pub fn register_finalizer(&mut self, obj: Value, proc_: Value) {
        self.memory.register_finalizer(obj, proc_);
    }

    /// Drops dead stack references, then lets the memory manager look
    /// for finalizable objects
    pub fn collect_garbage(&mut self) -> usize {
        self.clear_dead_slots();
        self.memory.collect()
    }

    /// Replaces the built-in error report with a procedure of one
    /// argument; None restores the default
    pub fn set_error_reporter(&mut self, reporter: Option<Value>) {
        self.default_escape_handler = reporter;
    }

    pub fn last_report(&self) -> Option<&str> {
        self.last_report.as_deref()
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub fn memory_stats(&self) -> MemStats {
        self.memory.stats()
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    /// Runs the after thunks of every active dynamic-wind
    pub fn cleanup(&mut self) {
        let mut hp = self.handlers.clone();
        while let Some(node) = hp {
            self.handlers = node.next.clone();
            if let Err(e) = self.call(&node.entry.after, &[]) {
                log::warn!("after thunk failed during cleanup: {:?}", e);
            }
            hp = node.next.clone();
        }
    }

    pub(crate) fn current_marker(&self) -> u64 {
        self.markers.last().map_or(0, |m| m.id)
    }

    pub(crate) fn push_marker(&mut self) -> u64 {
        let id = self.next_marker;
        self.next_marker += 1;
        self.markers.push(Marker {
            id,
            cont: self.cont.clone(),
        });
        log::debug!("enter level {} (depth {})", id, self.markers.len());
        id
    }

    pub(crate) fn pop_marker(&mut self, id: u64) -> Marker {
        match self.markers.pop() {
            Some(m) if m.id == id => {
                log::debug!("leave level {}", id);
                m
            }
            _ => panic!("native-caller marker {} is not innermost", id),
        }
    }
}
