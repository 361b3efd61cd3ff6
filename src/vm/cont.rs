// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/cont.rs

// First-class continuations and escape points. A continuation is
// valid while the evaluator level that captured it is still on the
// marker chain; throwing to it from a deeper level unwinds the Rust
// frames in between with a typed escape.

// <>

use super::code::Pc;
use super::error::{ConditionKind, Escape, VmResult};
use super::frame::ContRef;
use super::value::Value;
use super::wind::{self, WindChain};
use super::{Vm, MAX_VALUES};

use std::cell::RefCell;
use std::rc::Rc;

/// Saved control state for a handler scope or a captured continuation
pub struct EscapePoint {
    pub prev: Option<Rc<EscapePoint>>,
    /// Escape point that was floating when this one was made
    pub floating: Option<Rc<EscapePoint>>,
    /// Error handler; unused for continuations
    pub ehandler: Value,
    pub handlers: WindChain,
    /// Id of the evaluator level that made this point
    pub marker: u64,
    /// Exception handler active outside the scope; None is the default
    pub xhandler: Option<Value>,
    /// Redirected when the frame it names moves to the heap
    pub cont: RefCell<Option<ContRef>>,
    pub error_reporting: bool,
}

/// Thunk to run while throwing, with the handler chain it runs under
type WindStep = (Value, WindChain);

impl Vm {
    pub(crate) fn escape_point_depth(&self) -> usize {
        let mut n = 0;
        let mut ep = self.escape_point.clone();
        while let Some(p) = ep {
            n += 1;
            ep = p.prev.clone();
        }
        n
    }

    /// Captures the current continuation and applies `proc_` to it
    pub fn call_cc(&mut self, proc_: &Value) -> VmResult<Value> {
        let ok = match proc_ {
            Value::Proc(p) => p.accepts(1),
            _ => false,
        };
        if !ok {
            return Err(self.error(
                ConditionKind::WrongTypeArgument,
                format!("Procedure taking one argument is required, but got: {}", proc_),
            ));
        }

        self.save_cont();
        let ep = Rc::new(EscapePoint {
            prev: None,
            floating: None,
            ehandler: Value::Bool(false),
            handlers: self.handlers.clone(),
            marker: self.current_marker(),
            xhandler: None,
            cont: RefCell::new(self.cont.clone()),
            error_reporting: false,
        });

        if cfg!(feature = "stkdbg") {
            log::trace!("captured continuation at level {}", ep.marker);
        }

        let k = Value::subr("continuation", 0, true, move |vm, args| {
            vm.throw_continuation(&ep, args.to_vec())
        });
        Ok(self.vm_apply(proc_, &[k]))
    }

    /// Transfers control to the continuation saved in `ep`
    pub(crate) fn throw_continuation(
        &mut self,
        ep: &Rc<EscapePoint>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        if ep.marker == self.current_marker() {
            let steps = self.throw_cont_handlers(ep);
            self.throw_cont_body(steps, ep.clone(), args)
        } else if self.markers.iter().any(|m| m.id == ep.marker) {
            log::debug!("continuation escapes to level {}", ep.marker);
            Err(Escape::Continuation {
                ep: ep.clone(),
                args,
            })
        } else {
            Err(self.error(
                ConditionKind::ContinuationExtentViolation,
                "a continuation is thrown outside of its extent",
            ))
        }
    }

    /// After thunks of the scopes being left, innermost first, then
    /// before thunks of the scopes being entered, outermost first
    pub(crate) fn throw_cont_handlers(&self, ep: &EscapePoint) -> Vec<WindStep> {
        let target = &ep.handlers;
        let mut steps = Vec::new();

        let mut cur = self.handlers.clone();
        while let Some(node) = cur {
            if wind::contains(target, &node.entry) {
                break;
            }
            steps.push((node.entry.after.clone(), node.next.clone()));
            cur = node.next.clone();
        }

        let mut entering = Vec::new();
        let mut t = target.clone();
        while let Some(node) = t {
            t = node.next.clone();
            entering.push(node);
        }
        for node in entering.iter().rev() {
            if !wind::contains(&self.handlers, &node.entry) {
                steps.push((node.entry.before.clone(), node.next.clone()));
            }
        }
        steps
    }

    /// Runs the next wind step, chaining the rest through a native
    /// continuation; with none left, reinstates the saved continuation
    /// and hands over the thrown values
    pub(crate) fn throw_cont_body(
        &mut self,
        mut steps: Vec<WindStep>,
        ep: Rc<EscapePoint>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        if !steps.is_empty() {
            let (thunk, chain) = steps.remove(0);
            self.push_native_cont(move |vm, _| {
                vm.throw_cont_body(steps.clone(), ep.clone(), args.clone())
            });
            self.handlers = chain;
            return Ok(self.vm_apply(&thunk, &[]));
        }

        self.pc = Pc::Ret;
        self.cont = ep.cont.borrow().clone();
        self.handlers = ep.handlers.clone();

        match args.len() {
            0 => {
                self.num_vals = 0;
                Ok(Value::Undefined)
            }
            1 => {
                self.num_vals = 1;
                Ok(args[0].clone())
            }
            n if n >= MAX_VALUES => Err(self.error(
                ConditionKind::TooManyValues,
                "too many values passed to the continuation",
            )),
            n => {
                self.vals = args[1..].to_vec();
                self.num_vals = n;
                Ok(args[0].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::asm::assemble;
    use super::super::error::VmError;
    use super::super::VmConfig;
    use super::*;

    use std::cell::Cell;

    fn quiet_vm() -> Vm {
        Vm::new(VmConfig::default().with_report_to_stderr(false))
    }

    #[test]
    fn escapes_pending_work() {
        let mut vm = quiet_vm();
        // (+ 1 (call/cc (lambda (k) (k 10) 20)))
        let v = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (const-push 1)
                       (pre-call k)
                       (closure (code body 1
                          (pre-call next) (const-push 10) (lref 0 0) (call 1)
                          next
                          (const-ret 20)))
                       (push)
                       (gref-call call/cc 1)
                       k
                       (num-add2)
                       (ret))",
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(v, Value::Int(11));
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn reenters_live_extent() {
        let mut vm = quiet_vm();
        // (+ 1 (call/cc (lambda (k) (set! saved k) 10))), then throws
        // 10 to saved once more while the evaluation is still running
        let v = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (const 0) (define count)
                       (const #f) (define saved)
                       (const #f) (define result)
                       (const-push 1)
                       (pre-call k)
                       (closure (code body 1 (lref 0 0) (gset saved) (const-ret 10)))
                       (push)
                       (gref-call call/cc 1)
                       k
                       (num-add2)
                       (gset result)
                       (gref count) (num-addi 1) (gset count)
                       (gref count) (push) (const 1) (num-eq2)
                       (bf finish)
                       (const-push 10) (gref-tail-call saved 1)
                       finish
                       (gref result) (ret))",
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(v, Value::Int(11));
        assert_eq!(vm.module().get("count"), Some(Value::Int(2)));
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn extent_violation() {
        let mut vm = quiet_vm();
        let k = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (closure (code grab 1 (lref 0 0) (ret)))
                       (push)
                       (gref-tail-call call/cc 1))",
                )
                .unwrap(),
            )
            .unwrap();

        let sp = vm.stack_pointer();
        match vm.apply(&k, &[Value::Int(1)]).unwrap_err() {
            VmError::Uncaught { type_name, message, .. } => {
                assert_eq!(type_name, "continuation-extent-violation");
                assert_eq!(message, "a continuation is thrown outside of its extent");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(vm.stack_pointer(), sp);
    }

    #[test]
    fn escapes_through_native_level() {
        let mut vm = quiet_vm();
        // a native procedure calls back into the evaluator, and the
        // inner level throws to a continuation of the outer one
        vm.define(
            "call-native",
            Value::subr("call-native", 1, false, |vm, args| {
                let r = vm.call(&args[0], &[])?;
                Ok(Value::cons(Value::sym("returned"), r))
            }),
        );
        let v = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (closure (code body 1
                          (lref 0 0) (define k)
                          (closure (code inner 0 (const-push 42) (gref-tail-call k 1)))
                          (push)
                          (gref-tail-call call-native 1)))
                       (push)
                       (gref-tail-call call/cc 1))",
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(v, Value::Int(42));
        assert!(vm.markers.is_empty());
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn wind_order_on_escape() {
        let mut vm = quiet_vm();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["before", "after", "body"] {
            let l = log.clone();
            vm.define(
                name,
                Value::subr(name, 0, false, move |_, _| {
                    l.borrow_mut().push(name);
                    Ok(Value::Undefined)
                }),
            );
        }
        // body escapes through k; after must still run
        let v = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (closure (code outer 1
                          (lref 0 0) (define k)
                          (gref-push before)
                          (closure (code thunk 0
                             (pre-call c) (gref-call body 0) c
                             (const-push 5) (gref-tail-call k 1)))
                          (push)
                          (gref-push after)
                          (gref-tail-call dynamic-wind 3)))
                       (push)
                       (gref-tail-call call/cc 1))",
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(v, Value::Int(5));
        assert_eq!(*log.borrow(), vec!["before", "body", "after"]);
        assert!(vm.handlers.is_none());
    }

    #[test]
    fn rewinds_on_reentry() {
        let mut vm = quiet_vm();
        let befores = Rc::new(Cell::new(0));
        let b = befores.clone();
        vm.define(
            "before",
            Value::subr("before", 0, false, move |_, _| {
                b.set(b.get() + 1);
                Ok(Value::Undefined)
            }),
        );
        vm.define("after", Value::subr("after", 0, false, |_, _| Ok(Value::Undefined)));
        // captures inside the wind, leaves it, then throws back in once
        let v = vm
            .evaluate(
                assemble(
                    "(code top 0
                       (const #f) (define again)
                       (const #f) (define k2)
                       (const 0) (define n)
                       (pre-call w)
                       (gref-push before)
                       (closure (code thunk 0
                          (closure (code grab 1 (lref 0 0) (gset again) (const-ret 1)))
                          (push)
                          (gref-tail-call call/cc 1)))
                       (push)
                       (gref-push after)
                       (gref-call dynamic-wind 3)
                       w
                       (gset n)
                       (gref again) (bf out)
                       (gref again) (gset k2)
                       (const #f) (gset again)
                       (const-push 2) (gref-tail-call k2 1)
                       out
                       (gref n) (ret))",
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(v, Value::Int(2));
        assert_eq!(befores.get(), 2);
        assert!(vm.handlers.is_none());
    }

    #[test]
    fn too_many_values_to_continuation() {
        let mut vm = quiet_vm();
        let text = format!(
            "(code top 0
               (closure (code body 1 {} (lref 0 0) (tail-call {})))
               (push)
               (gref-tail-call call/cc 1))",
            "(const-push 0) ".repeat(MAX_VALUES),
            MAX_VALUES
        );
        match vm.evaluate(assemble(&text).unwrap()).unwrap_err() {
            VmError::Uncaught { type_name, .. } => assert_eq!(type_name, "too-many-values"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
