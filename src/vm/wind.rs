// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/wind.rs

// Dynamic-wind and the exception protocol. Before and after thunks
// live on a persistent chain shared with captured continuations;
// raising a condition runs a user handler or unwinds to the nearest
// error handler scope.

// <>

use super::cont::EscapePoint;
use super::error::{ConditionKind, Escape, VmResult};
use super::value::Value;
use super::Vm;

use std::cell::RefCell;
use std::rc::Rc;

/// One active dynamic-wind
pub struct WindEntry {
    pub before: Value,
    pub after: Value,
}

pub struct WindNode {
    pub entry: Rc<WindEntry>,
    pub next: WindChain,
}

/// Innermost entry first
pub type WindChain = Option<Rc<WindNode>>;

pub fn push_entry(chain: &WindChain, before: Value, after: Value) -> WindChain {
    Some(Rc::new(WindNode {
        entry: Rc::new(WindEntry { before, after }),
        next: chain.clone(),
    }))
}

pub fn chain_len(chain: &WindChain) -> usize {
    let mut n = 0;
    let mut cur = chain;
    while let Some(node) = cur {
        n += 1;
        cur = &node.next;
    }
    n
}

/// Whether `entry` itself is on the chain
pub fn contains(chain: &WindChain, entry: &Rc<WindEntry>) -> bool {
    let mut cur = chain;
    while let Some(node) = cur {
        if Rc::ptr_eq(&node.entry, entry) {
            return true;
        }
        cur = &node.next;
    }
    false
}

fn same_chain(a: &WindChain, b: &WindChain) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

impl Vm {
    /// Applies `before`, `body`, then `after` in tail position, keeping
    /// the pair on the handler chain while `body` runs. The result is
    /// the value of `body`.
    pub fn dynamic_wind(&mut self, before: Value, body: Value, after: Value) -> Value {
        let first = before.clone();
        self.push_native_cont(move |vm, _| {
            Ok(vm.dynamic_wind_body(before.clone(), body.clone(), after.clone()))
        });
        self.vm_apply(&first, &[])
    }

    /// Dynamic-wind over Rust closures
    pub fn dynamic_wind_native<B, T, A>(&mut self, before: B, body: T, after: A) -> Value
    where
        B: Fn(&mut Vm) -> VmResult<Value> + 'static,
        T: Fn(&mut Vm) -> VmResult<Value> + 'static,
        A: Fn(&mut Vm) -> VmResult<Value> + 'static,
    {
        let before = Value::subr("%before", 0, false, move |vm, _| before(vm));
        let body = Value::subr("%body", 0, false, move |vm, _| body(vm));
        let after = Value::subr("%after", 0, false, move |vm, _| after(vm));
        self.dynamic_wind(before, body, after)
    }

    fn dynamic_wind_body(&mut self, before: Value, body: Value, after: Value) -> Value {
        let prev = self.handlers.clone();
        self.handlers = push_entry(&prev, before, after.clone());
        self.push_native_cont(move |vm, result| {
            Ok(vm.dynamic_wind_after(result, after.clone(), prev.clone()))
        });
        self.vm_apply(&body, &[])
    }

    fn dynamic_wind_after(&mut self, result: Value, after: Value, prev: WindChain) -> Value {
        self.handlers = prev;
        let num_vals = self.num_vals;
        let vals = self.vals.clone();
        self.push_native_cont(move |vm, _| {
            vm.num_vals = num_vals;
            vm.vals = vals.clone();
            Ok(result.clone())
        });
        self.vm_apply(&after, &[])
    }

    /// Raises `obj`. A handler may resume a non-condition; conditions
    /// always end in an escape.
    pub fn throw_exception(&mut self, obj: Value) -> VmResult<Value> {
        if let Some(handler) = self.exception_handler.clone() {
            let v = self.call(&handler, &[obj.clone()])?;
            if obj.is_serious() {
                self.exception_handler = None;
                return Err(self.error(
                    ConditionKind::Error,
                    format!(
                        "user-defined exception handler returned on non-continuable exception {}",
                        obj
                    ),
                ));
            }
            return Ok(v);
        }

        if !obj.is_serious() {
            let mut ep = self.escape_point.clone();
            while let Some(p) = ep {
                if let Some(x) = p.xhandler.clone() {
                    return self.call(&x, &[obj]);
                }
                ep = p.prev.clone();
            }
        }
        self.default_exception_handler(obj)
    }

    /// Hands `obj` to the innermost error handler scope, or reports it
    /// and unwinds everything when there is none
    fn default_exception_handler(&mut self, obj: Value) -> VmResult<Value> {
        let ep = match self.escape_point.clone() {
            Some(ep) => ep,
            None => {
                self.report_error(&obj)?;
                let mut hp = self.handlers.clone();
                while let Some(node) = hp {
                    self.handlers = node.next.clone();
                    self.call(&node.entry.after, &[])?;
                    hp = node.next.clone();
                }
                return Err(Escape::Error {
                    ep: None,
                    condition: obj,
                });
            }
        };

        self.escape_point = ep.prev.clone();
        self.floating = Some(ep.clone());

        match self.run_error_handler(&ep, &obj) {
            Err(e) => {
                self.floating = ep.floating.clone();
                Err(e)
            }
            Ok((result, num_vals, vals)) => {
                self.vals = vals;
                self.num_vals = num_vals;
                self.val0 = result;
                self.cont = ep.cont.borrow().clone();
                self.floating = ep.floating.clone();
                if ep.error_reporting {
                    self.flags.error_being_reported = true;
                }
                Err(Escape::Error {
                    ep: Some(ep),
                    condition: obj,
                })
            }
        }
    }

    fn run_error_handler(
        &mut self,
        ep: &EscapePoint,
        obj: &Value,
    ) -> VmResult<(Value, usize, Vec<Value>)> {
        let result = self.call(&ep.ehandler, &[obj.clone()])?;
        let (num_vals, vals) = (self.num_vals, self.vals.clone());

        let mut hp = self.handlers.clone();
        while let Some(node) = hp {
            if same_chain(&Some(node.clone()), &ep.handlers) {
                break;
            }
            self.handlers = node.next.clone();
            self.call(&node.entry.after, &[])?;
            hp = node.next.clone();
        }
        Ok((result, num_vals, vals))
    }

    /// Runs `thunk` with `handler` catching errors raised inside it. The
    /// handler's value becomes the value of the whole form.
    pub fn with_error_handler(&mut self, handler: Value, thunk: Value) -> Value {
        let ep = Rc::new(EscapePoint {
            prev: self.escape_point.clone(),
            floating: self.floating.clone(),
            ehandler: handler,
            handlers: self.handlers.clone(),
            marker: self.current_marker(),
            xhandler: self.exception_handler.clone(),
            cont: RefCell::new(self.cont.clone()),
            error_reporting: self.flags.error_being_reported,
        });
        self.escape_point = Some(ep.clone());

        let installed = ep.clone();
        let install = Value::subr("%install-ehandler", 0, false, move |vm, _| {
            vm.exception_handler = None;
            vm.escape_point = Some(installed.clone());
            vm.flags.error_being_reported = false;
            Ok(Value::Undefined)
        });
        let discard = Value::subr("%discard-ehandler", 0, false, move |vm, _| {
            vm.escape_point = ep.prev.clone();
            vm.exception_handler = ep.xhandler.clone();
            if ep.error_reporting {
                vm.flags.error_being_reported = true;
            }
            Ok(Value::Undefined)
        });
        self.dynamic_wind(install, thunk, discard)
    }

    /// Runs `thunk` with `handler` as the exception handler
    pub fn with_exception_handler(&mut self, handler: Value, thunk: Value) -> Value {
        let current = self.exception_handler.clone();
        let install = Value::subr("%install-xhandler", 0, false, move |vm, _| {
            vm.exception_handler = Some(handler.clone());
            Ok(Value::Undefined)
        });
        let restore = Value::subr("%restore-xhandler", 0, false, move |vm, _| {
            vm.exception_handler = current.clone();
            Ok(Value::Undefined)
        });
        self.dynamic_wind(install, thunk, restore)
    }
}
