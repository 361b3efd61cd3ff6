// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/call.rs

// Calling convention. Dispatches on the kind of procedure in the
// value register, folds rest arguments, builds the callee's
// environment, and shifts argument frames for tail calls.

// <>

use super::code::Pc;
use super::error::{ConditionKind, Escape, VmResult};
use super::frame::{ContRef, EnvRef, Slot};
use super::value::{Method, MethodBody, NativeFn, NextMethod, Procedure, Value};
use super::{Vm, CONT_FRAME_SIZE};

use std::fmt;
use std::mem;
use std::rc::Rc;

impl Vm {
    /// Calls the procedure in the value register on the current
    /// argument frame
    pub(crate) fn call_entry(&mut self) -> VmResult<()> {
        self.num_vals = 1;

        if !matches!(self.val0, Value::Proc(_)) {
            let obj = mem::replace(&mut self.val0, self.object_apply.clone());
            self.insert_arg(obj);
        }
        let proc_ = match &self.val0 {
            Value::Proc(p) => p.clone(),
            _ => unreachable!(),
        };

        if cfg!(feature = "stkdbg") {
            log::trace!("call {} with {} args", proc_, self.sp - self.argp);
        }

        let argc = self.sp - self.argp;
        match &*proc_ {
            Procedure::Subr(s) => {
                if !proc_.accepts(argc) {
                    return Err(self.wrong_args(&proc_, s.required, argc));
                }
                self.call_native(&s.func)
            }
            Procedure::Closure(c) => {
                self.adjust_arguments(&proc_, c.code.required, c.code.rest, argc)?;
                let env = c.env.clone().map(EnvRef::Heap);
                if self.sp > self.argp {
                    self.finish_env(c.code.info.clone(), env);
                } else {
                    self.env = env;
                    self.argp = self.sp;
                }
                self.base = Some(c.code.clone());
                self.pc = Pc::At(0);
                self.ensure_headroom(c.code.max_stack);
                Ok(())
            }
            Procedure::Generic(g) => {
                let args = self.arg_values().into_vec();
                let methods = self.dispatch.compute_applicable_methods(g, &args);
                if methods.is_empty() {
                    return self.call_native(&g.fallback);
                }
                let mut sorted = self.dispatch.sort_methods(methods, &args);
                let first = sorted.remove(0);
                let next = NextMethod::new(Some(g.fallback.clone()), sorted, args);
                self.enter_method(first, next)
            }
            Procedure::Method(m) => {
                let next = NextMethod::new(None, Vec::new(), self.arg_values().into_vec());
                self.enter_method(m.clone(), next)
            }
            Procedure::NextMethod(n) => {
                if argc == 0 {
                    for v in &n.args {
                        self.push_arg(v.clone());
                    }
                }
                match n.methods.split_first() {
                    Some((first, rest)) => {
                        let args = self.arg_values().into_vec();
                        let next = NextMethod::new(n.fallback.clone(), rest.to_vec(), args);
                        self.enter_method(first.clone(), next)
                    }
                    None => match &n.fallback {
                        Some(f) => self.call_native(f),
                        None => Err(self.error(ConditionKind::Error, "no next method")),
                    },
                }
            }
        }
    }

    fn call_native(&mut self, f: &NativeFn) -> VmResult<()> {
        let args = self.take_args();
        self.pc = Pc::Ret;
        self.val0 = (**f)(self, &args)?;
        Ok(())
    }

    fn enter_method(&mut self, m: Rc<Method>, next: Value) -> VmResult<()> {
        let argc = self.sp - self.argp;
        let label = format!("#<method {}>", m.name);
        self.adjust_arguments(&label, m.required, m.rest, argc)?;

        match &m.body {
            MethodBody::Native(f) => {
                let args = self.take_args();
                self.pc = Pc::Ret;
                self.val0 = (**f)(self, &args, &next)?;
                Ok(())
            }
            MethodBody::Code { code, env } => {
                self.push_arg(next);
                self.finish_env(code.info.clone(), env.clone().map(EnvRef::Heap));
                self.base = Some(code.clone());
                self.pc = Pc::At(0);
                self.ensure_headroom(code.max_stack);
                Ok(())
            }
        }
    }

    /// Folds arguments past the required ones into a list, or checks
    /// the count exactly when there is no rest parameter
    fn adjust_arguments(
        &mut self,
        what: &dyn fmt::Display,
        required: usize,
        rest: bool,
        argc: usize,
    ) -> VmResult<()> {
        if rest {
            if argc < required {
                return Err(self.wrong_args(what, required, argc));
            }
            let mut tail = Value::Nil;
            for _ in required..argc {
                let v = self.pop_arg();
                tail = Value::cons(v, tail);
            }
            self.push_arg(tail);
        } else if argc != required {
            return Err(self.wrong_args(what, required, argc));
        }
        Ok(())
    }

    fn wrong_args(&mut self, what: &dyn fmt::Display, required: usize, got: usize) -> Escape {
        self.error(
            ConditionKind::WrongArgumentCount,
            format!(
                "wrong number of arguments for {} (required {}, got {})",
                what, required, got
            ),
        )
    }

    /// Moves the argument frame down onto the current continuation, or
    /// to the stack base when that continuation is not on the stack,
    /// and drops the current environment
    pub(crate) fn shift_for_tail_call(&mut self) {
        let argc = self.sp - self.argp;
        let to = match &self.cont {
            Some(ContRef::Stack(i)) => i + CONT_FRAME_SIZE,
            _ => 0,
        };
        if to != self.argp {
            for k in 0..argc {
                let v = mem::take(&mut self.stack[self.argp + k]);
                self.stack[to + k] = v;
            }
        }
        self.argp = to;
        self.sp = to + argc;
        self.env = None;
    }

    /// Arranges for `proc_` to be applied to `args` once the running
    /// native procedure returns. The result belongs in the value
    /// register.
    pub fn vm_apply(&mut self, proc_: &Value, args: &[Value]) -> Value {
        for a in args {
            self.push_arg(a.clone());
        }
        self.pc = Pc::Apply(args.len());
        proc_.clone()
    }

    /// Puts `v` in front of the current arguments
    fn insert_arg(&mut self, v: Value) {
        self.check_stack(1);
        for k in (self.argp..self.sp).rev() {
            let s = mem::take(&mut self.stack[k]);
            self.stack[k + 1] = s;
        }
        self.stack[self.argp] = Slot::Val(v);
        self.sp += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::super::asm::assemble;
    use super::super::error::VmError;
    use super::super::value::{Generic, TypeTag};
    use super::super::VmConfig;
    use super::*;

    fn quiet_vm() -> Vm {
        Vm::new(VmConfig::default().with_report_to_stderr(false))
    }

    fn run(vm: &mut Vm, text: &str) -> Result<Value, VmError> {
        vm.evaluate(assemble(text).unwrap())
    }

    #[test]
    fn closure_call() {
        let mut vm = quiet_vm();
        let v = run(
            &mut vm,
            "(code top 0
               (closure (code sub 2 (lref 0 0) (push) (lref 0 1) (num-sub2) (ret)))
               (define sub)
               (pre-call k)
               (const-push 10) (const-push 3)
               (gref-call sub 2)
               k
               (num-addi 100)
               (ret))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(107));
    }

    #[test]
    fn rest_arguments() {
        let mut vm = quiet_vm();
        let code = assemble("(code tail 1 rest (lref 0 1) (ret))").unwrap();
        let tail = Value::procedure(Procedure::Closure(super::super::value::Closure {
            code,
            env: None,
        }));
        let got = vm
            .apply(&tail, &[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        assert_eq!(got.to_string(), "(2 3)");
        let none = vm.apply(&tail, &[Value::Int(1)]).unwrap();
        assert_eq!(none, Value::Nil);
    }

    #[test]
    fn arity_enforced() {
        let mut vm = quiet_vm();
        let hits = Rc::new(std::cell::Cell::new(0));
        let h = hits.clone();
        vm.define(
            "bump",
            Value::subr("bump", 0, false, move |_, _| {
                h.set(h.get() + 1);
                Ok(Value::Undefined)
            }),
        );
        let err = run(
            &mut vm,
            "(code top 0
               (closure (code two 2 (gref-call bump 0) (ret)))
               (define two)
               (const-push 1) (const-push 2) (const-push 3)
               (gref-tail-call two 3))",
        )
        .unwrap_err();
        match err {
            VmError::Uncaught { type_name, message, .. } => {
                assert_eq!(type_name, "wrong-argument-count");
                assert_eq!(
                    message,
                    "wrong number of arguments for #<closure two> (required 2, got 3)"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hits.get(), 0);
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn subr_arity() {
        let mut vm = quiet_vm();
        let car = vm.module().get("car").unwrap();
        match vm.apply(&car, &[]).unwrap_err() {
            VmError::Uncaught { message, .. } => {
                assert_eq!(message, "wrong number of arguments for #<subr car> (required 1, got 0)")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn object_apply_fallback() {
        let mut vm = quiet_vm();
        let err = vm.apply(&Value::Int(3), &[Value::Int(4)]).unwrap_err();
        match err {
            VmError::Uncaught { type_name, message, .. } => {
                assert_eq!(type_name, "wrong-type-argument");
                assert_eq!(message, "invalid application: 3");
            }
            other => panic!("unexpected {:?}", other),
        }

        // an applicable-object method makes integers callable
        if let Value::Proc(p) = &vm.object_apply {
            if let Procedure::Generic(g) = &**p {
                g.add_method(Method::native(
                    "int-apply",
                    vec![TypeTag::Int, TypeTag::Int],
                    false,
                    |_, args, _| Ok(Value::Int(args[0].as_int().unwrap_or(0) * args[1].as_int().unwrap_or(0))),
                ));
            }
        }
        assert_eq!(vm.apply(&Value::Int(3), &[Value::Int(4)]).unwrap(), Value::Int(12));
    }

    #[test]
    fn generic_next_method() {
        let mut vm = quiet_vm();
        let g = Generic::new("describe");
        g.add_method(Method::native("describe-top", vec![TypeTag::Top], false, |_, _, _| {
            Ok(Value::sym("thing"))
        }));
        g.add_method(Method::native("describe-int", vec![TypeTag::Int], false, |vm, _, next| {
            let outer = vm.call(next, &[])?;
            Ok(Value::cons(Value::sym("int"), outer))
        }));
        let g = Value::procedure(Procedure::Generic(g));

        assert_eq!(vm.apply(&g, &[Value::Int(1)]).unwrap().to_string(), "(int . thing)");
        assert_eq!(vm.apply(&g, &[Value::Nil]).unwrap(), Value::sym("thing"));

        match vm.apply(&g, &[]).unwrap_err() {
            VmError::Uncaught { message, .. } => {
                assert_eq!(message, "no applicable method for describe with arguments ()")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn code_method_gets_next_method() {
        let mut vm = quiet_vm();
        let g = Generic::new("twice");
        g.add_method(Method::native("twice-top", vec![TypeTag::Top], false, |_, args, _| {
            Ok(Value::list(vec![args[0].clone(), args[0].clone()]))
        }));
        // argument at offset 0, next-method at offset 1; calling the
        // next method with no arguments reuses the saved ones
        let body = assemble("(code twice-int 2 (lref 0 1) (tail-call 0))").unwrap();
        g.add_method(Method::with_code(vec![TypeTag::Int], body));
        let g = Value::procedure(Procedure::Generic(g));
        assert_eq!(vm.apply(&g, &[Value::Int(7)]).unwrap().to_string(), "(7 7)");
    }

    #[test]
    fn tail_call_reuses_frame() {
        let mut vm = quiet_vm();
        vm.push_arg(Value::Int(0));
        vm.push_cont(super::super::frame::Resume::Code(Pc::At(0)));
        vm.push_arg(Value::Int(1));
        vm.push_arg(Value::Int(2));
        vm.finish_env(None, None);
        vm.push_arg(Value::Int(3));
        vm.shift_for_tail_call();
        assert_eq!((vm.argp, vm.sp), (2, 3));
        assert_eq!(&vm.arg_values()[..], &[Value::Int(3)]);
        assert!(vm.env.is_none());
    }
}
