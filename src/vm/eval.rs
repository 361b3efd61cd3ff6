// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/eval.rs

// The dispatch loop. Each evaluator level pushes a boundary frame and
// a native-caller marker, then runs instructions until control
// returns through the boundary. Escapes aimed at this level restart
// the loop; all others pop the level and travel on.

// <>

use super::code::{CompiledCode, Insn, Pc};
use super::error::{ConditionKind, Escape, VmResult};
use super::frame::{ContRef, EnvRef, Resume};
use super::value::{Closure, Instance, Procedure, Value};
use super::wind;
use super::{Vm, CONT_FRAME_SIZE, ENV_HDR_SIZE, MAX_VALUES};

use std::mem;
use std::rc::Rc;

/// What the loop does after an instruction
pub(crate) enum Flow {
    Next,
    /// Control reached the boundary frame of this level
    Exit,
}

impl Vm {
    /// Runs `code` from `entry` in a new evaluator level
    pub(crate) fn eval_inner(&mut self, code: Rc<CompiledCode>, entry: Pc) -> VmResult<Value> {
        let prev_pc = self.pc;
        self.push_cont(Resume::Code(Pc::Boundary));
        self.ensure_headroom(code.max_stack);
        self.base = Some(code);
        self.pc = entry;
        let id = self.push_marker();

        let mut outcome = self.run_loop();
        loop {
            match outcome {
                Ok(()) => {
                    let marker = self.pop_marker(id);
                    if self.same_cont(&self.cont, &marker.cont) {
                        self.pop_cont();
                    } else if self.cont.is_none() {
                        self.cont = marker.cont;
                        self.pop_cont();
                    }
                    self.pc = prev_pc;
                    if self.markers.is_empty() {
                        self.clear_dead_slots();
                    }
                    return Ok(self.val0.clone());
                }
                Err(Escape::Continuation { ep, args }) if ep.marker == id => {
                    log::debug!("continuation arrives at level {}", id);
                    let steps = self.throw_cont_handlers(&ep);
                    self.pc = Pc::Ret;
                    outcome = match self.throw_cont_body(steps, ep, args) {
                        Ok(v) => {
                            self.val0 = v;
                            self.run_loop()
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(Escape::Error { ep: Some(ep), .. }) if ep.marker == id => {
                    log::debug!("error handler returns at level {}", id);
                    self.cont = ep.cont.borrow().clone();
                    self.pc = Pc::Ret;
                    outcome = self.run_loop();
                }
                Err(escape) => {
                    let marker = self.pop_marker(id);
                    self.cont = marker.cont;
                    self.pop_cont();
                    self.pc = prev_pc;
                    if self.markers.is_empty() {
                        self.clear_dead_slots();
                    }
                    return Err(escape);
                }
            }
        }
    }

    /// Fetches and executes instructions until this level exits
    fn run_loop(&mut self) -> VmResult<()> {
        loop {
            if self.requests.pending() {
                self.process_queue()?;
            }

            let flow = match self.pc {
                Pc::At(i) => {
                    let code = match &self.base {
                        Some(b) => b.clone(),
                        None => panic!("no code to run at {}", i),
                    };
                    let insn = match code.code.get(i) {
                        Some(insn) => insn,
                        None => panic!("ran off the end of {}", code.name),
                    };
                    if cfg!(feature = "stkdbg") {
                        log::trace!("{}:{:>4} {:<24} sp={} argp={}", code.name, i, insn.to_string(), self.sp, self.argp);
                    }
                    self.pc = Pc::At(i + 1);
                    self.execute(insn)?
                }
                Pc::Ret => self.return_op()?,
                Pc::Apply(n) => {
                    if cfg!(feature = "stkdbg") {
                        log::trace!("apply with {} args", n);
                    }
                    self.pc = Pc::Ret;
                    self.shift_for_tail_call();
                    self.call_entry()?;
                    Flow::Next
                }
                Pc::Boundary => panic!("boundary frame resumed"),
            };

            if let Flow::Exit = flow {
                return Ok(());
            }
        }
    }

    /// Pops one continuation frame, or exits at a boundary
    fn return_op(&mut self) -> VmResult<Flow> {
        match &self.cont {
            None => return Ok(Flow::Exit),
            Some(c) if self.is_boundary(c) => return Ok(Flow::Exit),
            _ => {}
        }
        if let Some(after) = self.pop_cont() {
            let v = mem::take(&mut self.val0);
            self.val0 = (*after)(self, v)?;
        }
        Ok(Flow::Next)
    }

    /// Delivers queued signals and runs pending finalizers, then
    /// resumes exactly where the loop stopped
    fn process_queue(&mut self) -> VmResult<()> {
        self.check_stack(CONT_FRAME_SIZE * 2);
        self.push_cont(Resume::Code(self.pc));

        let (val0, vals, num_vals) = (self.val0.clone(), self.vals.clone(), self.num_vals);
        self.push_native_cont(move |vm, _| {
            vm.vals = vals.clone();
            vm.num_vals = num_vals;
            Ok(val0.clone())
        });

        for sig in self.requests.take_signals() {
            match self.signal_handler(sig) {
                Some(handler) => {
                    log::debug!("delivering signal {}", sig);
                    self.call(&handler, &[Value::Int(sig as i64)])?;
                }
                None => log::warn!("signal {} has no handler", sig),
            }
        }

        if self.requests.take_finalizer_request() {
            for (obj, proc_) in self.memory.take_pending_finalizers() {
                self.call(&proc_, &[obj])?;
            }
        }

        self.pc = Pc::Ret;
        Ok(())
    }

    /// Whether the next instruction returns
    fn in_tail_position(&self) -> bool {
        match (self.pc, &self.base) {
            (Pc::Ret, _) => true,
            (Pc::At(i), Some(b)) => matches!(b.code.get(i), Some(Insn::Ret)),
            _ => false,
        }
    }

    fn execute(&mut self, insn: &Insn) -> VmResult<Flow> {
        match insn {
            Insn::Nop => {}
            Insn::Const(v) => self.set_val(v.clone()),
            Insn::ConstPush(v) => self.push_arg(v.clone()),
            Insn::ConstRet(v) => {
                self.set_val(v.clone());
                return self.return_op();
            }
            Insn::Push => self.push_arg(self.val0.clone()),
            Insn::PreCall(l) => self.push_cont(Resume::Code(Pc::At(*l))),
            Insn::PushPreCall(l) => {
                self.push_arg(self.val0.clone());
                self.push_cont(Resume::Code(Pc::At(*l)));
            }
            Insn::CheckStack(n) => self.check_stack(*n),
            Insn::Call(_) => self.call_entry()?,
            Insn::TailCall(_) => {
                self.shift_for_tail_call();
                self.call_entry()?;
            }
            Insn::Jump(l) => self.pc = Pc::At(*l),
            Insn::Ret => return self.return_op(),
            Insn::Bf(l) => {
                if !self.val0.is_true() {
                    self.pc = Pc::At(*l);
                }
            }
            Insn::Bt(l) => {
                if self.val0.is_true() {
                    self.pc = Pc::At(*l);
                }
            }
            Insn::Rf => {
                if !self.val0.is_true() {
                    return self.return_op();
                }
            }

            Insn::LRef(d, o) => {
                let e = self.env_at(*d);
                let v = self.env_get(&e, *o);
                self.set_val(v);
            }
            Insn::LRefPush(d, o) => {
                let e = self.env_at(*d);
                let v = self.env_get(&e, *o);
                self.push_arg(v);
            }
            Insn::LSet(d, o) => {
                let e = self.env_at(*d);
                let v = self.val0.clone();
                self.env_set(&e, *o, v);
            }

            Insn::GRef(g) => {
                let v = self.global_value(g)?;
                self.set_val(v);
            }
            Insn::GRefPush(g) => {
                let v = self.global_value(g)?;
                self.push_arg(v);
            }
            Insn::GRefCall(g, _) => {
                self.val0 = self.global_value(g)?;
                self.call_entry()?;
            }
            Insn::GRefTailCall(g, _) => {
                self.val0 = self.global_value(g)?;
                self.shift_for_tail_call();
                self.call_entry()?;
            }
            Insn::GSet(g) => {
                let cell = match g.resolve(&self.module) {
                    Some(cell) => cell,
                    None => {
                        return Err(self.error(
                            ConditionKind::UnboundVariable,
                            format!("symbol not defined: {}", g.name),
                        ))
                    }
                };
                if cell.set(self.val0.clone()).is_err() {
                    return Err(self.error(
                        ConditionKind::Error,
                        format!("cannot change constant binding: {}", g.name),
                    ));
                }
            }
            Insn::Define { name, constant } => {
                let v = self.val0.clone();
                if *constant {
                    self.module.define_const(name, v);
                } else {
                    self.module.define(name, v);
                }
                self.set_val(Value::Sym(name.clone()));
            }

            Insn::LocalEnv(n) => self.close_local_env(*n),
            Insn::PushLocalEnv(n) => {
                self.push_arg(self.val0.clone());
                self.close_local_env(*n);
            }
            Insn::PopLocalEnv => {
                let e = match &self.env {
                    Some(e) => e.clone(),
                    None => panic!("pop-local-env without an environment"),
                };
                self.env = self.env_up(&e);
            }
            Insn::LocalEnvJump(depth, l) => self.local_env_jump(*depth, *l),
            Insn::Closure(code) => {
                let env = self.get_env();
                self.set_val(Value::procedure(Procedure::Closure(Closure {
                    code: code.clone(),
                    env,
                })));
            }

            Insn::Receive {
                required,
                rest,
                cont,
            } => self.receive(*required, *rest, Some(*cont))?,
            Insn::TailReceive { required, rest } => self.receive(*required, *rest, None)?,
            Insn::Values(n) => self.values(*n)?,
            Insn::Apply(n) => self.apply_insn(*n, false)?,
            Insn::TailApply(n) => self.apply_insn(*n, true)?,
            Insn::ConstApply { proc_, args } => {
                self.check_stack(args.len() + ENV_HDR_SIZE);
                for a in args {
                    self.push_arg(a.clone());
                }
                self.val0 = proc_.clone();
                self.shift_for_tail_call();
                self.call_entry()?;
            }

            Insn::Cons => {
                let x = self.pop_arg();
                let v = Value::cons(x, mem::take(&mut self.val0));
                self.set_val(v);
            }
            Insn::Car | Insn::Cdr => {
                let part = match (&self.val0, insn) {
                    (Value::Pair(p), Insn::Car) => p.car.clone(),
                    (Value::Pair(p), _) => p.cdr.clone(),
                    (other, _) => {
                        let other = other.clone();
                        return Err(self.wrong_type("pair", &other));
                    }
                };
                self.set_val(part);
            }
            Insn::List(n) => {
                let mut list = Value::Nil;
                if *n > 0 {
                    list = Value::cons(mem::take(&mut self.val0), list);
                    for _ in 1..*n {
                        let x = self.pop_arg();
                        list = Value::cons(x, list);
                    }
                }
                self.set_val(list);
            }
            Insn::NullP => self.set_val(Value::Bool(self.val0.is_null())),
            Insn::Not => self.set_val(Value::Bool(!self.val0.is_true())),
            Insn::Eq => {
                let x = self.pop_arg();
                let same = x.is_eq(&self.val0);
                self.set_val(Value::Bool(same));
            }

            Insn::NumAdd2 | Insn::NumSub2 | Insn::NumMul2 | Insn::NumLt2 | Insn::NumEq2 => {
                let x = self.pop_arg();
                let y = mem::take(&mut self.val0);
                let (a, b) = self.int_pair(&x, &y)?;
                let v = match insn {
                    Insn::NumAdd2 => Value::Int(self.checked(a.checked_add(b))?),
                    Insn::NumSub2 => Value::Int(self.checked(a.checked_sub(b))?),
                    Insn::NumMul2 => Value::Int(self.checked(a.checked_mul(b))?),
                    Insn::NumLt2 => Value::Bool(a < b),
                    _ => Value::Bool(a == b),
                };
                self.set_val(v);
            }
            Insn::NumAddI(i) => {
                let y = mem::take(&mut self.val0);
                let (a, b) = self.int_pair(&Value::Int(*i), &y)?;
                let v = self.checked(b.checked_add(a))?;
                self.set_val(Value::Int(v));
            }

            Insn::VecRef => {
                let vec = self.pop_arg();
                let idx = mem::take(&mut self.val0);
                let v = self.vector_slot(&vec, &idx, |items, k| items[k].clone())?;
                self.set_val(v);
            }
            Insn::VecSet => {
                let idx = self.pop_arg();
                let vec = self.pop_arg();
                let v = mem::take(&mut self.val0);
                self.vector_slot(&vec, &idx, move |items, k| items[k] = v)?;
                self.set_val(Value::Undefined);
            }
            Insn::VecLen => {
                let n = match &self.val0 {
                    Value::Vector(items) => items.borrow().len() as i64,
                    other => {
                        let other = other.clone();
                        return Err(self.wrong_type("vector", &other));
                    }
                };
                self.set_val(Value::Int(n));
            }

            Insn::SlotRef => {
                let obj = self.pop_arg();
                let name = mem::take(&mut self.val0);
                let v = self.slot_ref(obj, name)?;
                self.set_val(v);
            }
            Insn::SlotSet => {
                let name = self.pop_arg();
                let obj = self.pop_arg();
                let v = mem::take(&mut self.val0);
                let out = self.slot_set(obj, name, v)?;
                self.set_val(out);
            }

            Insn::PushHandlers => {
                let before = self.pop_arg();
                let after = self.val0.clone();
                self.handlers = wind::push_entry(&self.handlers, before, after);
            }
            Insn::PopHandlers => {
                self.handlers = match &self.handlers {
                    Some(node) => node.next.clone(),
                    None => panic!("pop-handlers on an empty chain"),
                };
            }
        }
        Ok(Flow::Next)
    }

    #[inline(always)]
    fn set_val(&mut self, v: Value) {
        self.val0 = v;
        self.num_vals = 1;
    }

    fn global_value(&mut self, g: &super::code::GlobalRef) -> VmResult<Value> {
        match g.resolve(&self.module).and_then(|cell| cell.get()) {
            Some(v) => Ok(v),
            None => Err(self.error(
                ConditionKind::UnboundVariable,
                format!("unbound variable: {}", g.name),
            )),
        }
    }

    /// Closes the argument frame into an environment of `n` slots
    fn close_local_env(&mut self, n: usize) {
        let have = self.sp - self.argp;
        for _ in have..n {
            self.push_arg(Value::Undefined);
        }
        let up = self.env.clone();
        self.finish_env(None, up);
    }

    /// Rebinds a loop: discards the environments between here and
    /// `depth`, moves the new bindings down, and jumps to the body
    fn local_env_jump(&mut self, depth: usize, target: usize) {
        let nargs = self.sp - self.argp;
        let mut tenv = self.env.clone();
        for _ in 0..depth {
            tenv = tenv.and_then(|e| self.env_up(&e));
        }

        let cont_end = match &self.cont {
            Some(ContRef::Stack(i)) => Some(i + CONT_FRAME_SIZE),
            _ => None,
        };
        let to = match &tenv {
            Some(EnvRef::Stack(t)) => match cont_end {
                Some(c) if c > *t => c,
                _ => t + ENV_HDR_SIZE,
            },
            _ => cont_end.unwrap_or(0),
        };

        if to != self.argp {
            for k in 0..nargs {
                let v = mem::take(&mut self.stack[self.argp + k]);
                self.stack[to + k] = v;
            }
        }
        self.argp = to;
        self.sp = to + nargs;

        if nargs > 0 {
            self.finish_env(None, tenv);
        } else {
            self.env = tenv;
        }
        self.pc = Pc::At(target);
    }

    fn receive(&mut self, required: usize, rest: bool, cont: Option<usize>) -> VmResult<()> {
        let n = self.num_vals;
        if n < required {
            return Err(self.error(
                ConditionKind::ValuesArityMismatch,
                "received fewer values than expected",
            ));
        }
        if !rest && n > required {
            return Err(self.error(
                ConditionKind::ValuesArityMismatch,
                "received more values than expected",
            ));
        }

        if let Some(l) = cont {
            self.push_cont(Resume::Code(Pc::At(l)));
        }

        let mut all = Vec::with_capacity(n);
        if n > 0 {
            all.push(self.val0.clone());
            all.extend(self.vals.iter().take(n - 1).cloned());
        }
        let tail = all.split_off(required);
        for v in all {
            self.push_arg(v);
        }
        if rest {
            self.push_arg(Value::list(tail));
        }
        let up = self.env.clone();
        self.finish_env(None, up);
        Ok(())
    }

    fn values(&mut self, n: usize) -> VmResult<()> {
        if n >= MAX_VALUES {
            return Err(self.error(ConditionKind::TooManyValues, "values got too many args"));
        }
        if n == 0 {
            self.val0 = Value::Undefined;
        } else {
            let mut vals = vec![Value::Undefined; n - 1];
            for k in (0..n - 1).rev() {
                vals[k] = mem::take(&mut self.val0);
                self.val0 = self.pop_arg();
            }
            self.vals = vals;
        }
        self.num_vals = n;
        Ok(())
    }

    /// Applies a procedure to spread arguments ending in a list
    fn apply_insn(&mut self, n: usize, tail: bool) -> VmResult<()> {
        let mut list = mem::take(&mut self.val0);
        for _ in 2..n {
            let x = self.pop_arg();
            list = Value::cons(x, list);
        }
        let proc_ = self.pop_arg();

        let args = match list.list_to_vec() {
            Some(args) => args,
            None => return Err(self.wrong_type("proper list", &list)),
        };
        if !tail {
            self.push_cont(Resume::Code(self.pc));
        }
        self.pc = Pc::Ret;
        self.val0 = self.vm_apply(&proc_, &args);
        Ok(())
    }

    fn int_pair(&mut self, x: &Value, y: &Value) -> VmResult<(i64, i64)> {
        match (x, y) {
            (Value::Int(a), Value::Int(b)) => Ok((*a, *b)),
            (Value::Int(_), bad) | (bad, _) => Err(self.wrong_type("integer", bad)),
        }
    }

    fn checked(&mut self, v: Option<i64>) -> VmResult<i64> {
        match v {
            Some(v) => Ok(v),
            None => Err(self.error(ConditionKind::Error, "integer overflow")),
        }
    }

    fn vector_slot<T>(
        &mut self,
        vec: &Value,
        idx: &Value,
        f: impl FnOnce(&mut Vec<Value>, usize) -> T,
    ) -> VmResult<T> {
        let items = match vec {
            Value::Vector(items) => items.clone(),
            other => return Err(self.wrong_type("vector", other)),
        };
        let k = match idx {
            Value::Int(k) => *k,
            other => return Err(self.wrong_type("integer", other)),
        };
        let len = items.borrow().len();
        if k < 0 || k as usize >= len {
            return Err(self.error(
                ConditionKind::IndexOutOfRange,
                format!("vector index out of range: {}", k),
            ));
        }
        let mut items = items.borrow_mut();
        Ok(f(&mut items, k as usize))
    }

    /// Calls an accessor procedure as if by a call instruction in the
    /// current position
    fn tail_call_accessor(&mut self, proc_: &Value, args: &[Value]) -> Value {
        if !self.in_tail_position() {
            self.push_cont(Resume::Code(self.pc));
            self.pc = Pc::Ret;
        }
        self.vm_apply(proc_, args)
    }

    fn find_slot(&mut self, obj: &Value, name: &Value) -> VmResult<(Rc<Instance>, usize)> {
        let inst = match obj {
            Value::Instance(i) => i.clone(),
            other => return Err(self.wrong_type("instance", other)),
        };
        let slot = match name {
            Value::Sym(s) => s.clone(),
            other => return Err(self.wrong_type("symbol", other)),
        };
        match inst.class.slot_index(&slot) {
            Some(k) => Ok((inst, k)),
            None => Err(self.error(
                ConditionKind::Error,
                format!("object {} doesn't have such slot: {}", obj, slot),
            )),
        }
    }

    fn slot_ref(&mut self, obj: Value, name: Value) -> VmResult<Value> {
        let (inst, k) = self.find_slot(&obj, &name)?;
        if let Some(getter) = &inst.class.slots[k].getter {
            return Ok(self.tail_call_accessor(getter, &[obj]));
        }
        let v = inst.slots.borrow()[k].clone();
        if let Value::Undefined = v {
            return Err(self.error(
                ConditionKind::Error,
                format!("slot {} of object {} is unbound", name, obj),
            ));
        }
        Ok(v)
    }

    fn slot_set(&mut self, obj: Value, name: Value, v: Value) -> VmResult<Value> {
        let (inst, k) = self.find_slot(&obj, &name)?;
        if let Some(setter) = &inst.class.slots[k].setter {
            return Ok(self.tail_call_accessor(setter, &[obj, v]));
        }
        inst.slots.borrow_mut()[k] = v;
        Ok(Value::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::super::asm::assemble;
    use super::super::error::VmError;
    use super::super::value::{Class, SlotDef};
    use super::super::VmConfig;
    use super::*;

    use std::cell::Cell;

    fn quiet_vm() -> Vm {
        Vm::new(VmConfig::default().with_report_to_stderr(false))
    }

    fn run(vm: &mut Vm, text: &str) -> Result<Value, VmError> {
        vm.evaluate(assemble(text).unwrap())
    }

    fn kind_of(e: VmError) -> String {
        match e {
            VmError::Uncaught { type_name, .. } => type_name,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tail_loop_constant_space() {
        let mut vm = Vm::new(VmConfig::default().with_stack_size(64));
        let v = run(
            &mut vm,
            "(code top 0
               (closure (code loop 1
                  (lref-push 0 0) (const 0) (num-eq2) (bt done)
                  (lref 0 0) (num-addi -1) (push)
                  (gref-tail-call loop 1)
                  done
                  (const-ret finished)))
               (define loop)
               (const-push 100000)
               (gref-tail-call loop 1))",
        )
        .unwrap();
        assert_eq!(v, Value::sym("finished"));
        assert_eq!(vm.stats().migrations, 0);
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn deep_recursion_migrates() {
        let mut vm = Vm::new(VmConfig::default().with_stack_size(128));
        // (define (sum n) (if (= n 0) 0 (+ n (sum (- n 1)))))
        let v = run(
            &mut vm,
            "(code top 0
               (closure (code sum 1
                  (lref-push 0 0) (const 0) (num-eq2) (bf rec)
                  (const-ret 0)
                  rec
                  (lref-push 0 0)
                  (pre-call k)
                  (lref 0 0) (num-addi -1) (push)
                  (gref-call sum 1)
                  k
                  (num-add2)
                  (ret)))
               (define sum)
               (const-push 2000)
               (gref-tail-call sum 1))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(2001000));
        assert!(vm.stats().migrations > 0);
        assert_eq!(vm.stack_pointer(), 0);
        assert!(vm.memory_stats().total_words > 0);
        assert_eq!(vm.memory_stats().live_words, 0);
    }

    #[test]
    fn heap_frames_released_after_error() {
        let mut vm = Vm::new(VmConfig::default().with_stack_size(128).with_report_to_stderr(false));
        // recurses 500 deep, then takes the car of a number
        let err = run(
            &mut vm,
            "(code top 0
               (closure (code dig 1
                  (lref-push 0 0) (const 0) (num-eq2) (bf rec)
                  (const-push 1) (gref-tail-call car 1)
                  rec
                  (lref-push 0 0)
                  (pre-call k)
                  (lref 0 0) (num-addi -1) (push)
                  (gref-call dig 1)
                  k
                  (num-add2)
                  (ret)))
               (define dig)
               (const-push 500)
               (gref-tail-call dig 1))",
        )
        .unwrap_err();
        assert_eq!(kind_of(err), "wrong-type-argument");
        assert!(vm.stats().migrations > 0);
        assert_eq!(vm.stack_pointer(), 0);
        assert_eq!(vm.memory_stats().live_words, 0);
    }

    #[test]
    fn closures_survive_migration() {
        let mut vm = Vm::new(VmConfig::default().with_stack_size(96));
        // each level makes an adder over its argument and calls it
        // after the deeper levels return
        let v = run(
            &mut vm,
            "(code top 0
               (closure (code f 1
                  (lref-push 0 0) (const 0) (num-eq2) (bf rec)
                  (const-ret 0)
                  rec
                  (closure (code add 1 (lref-push 0 0) (lref 1 0) (num-add2) (ret)))
                  (push-local-env 1)
                  (pre-call k)
                  (lref 1 0) (num-addi -1) (push)
                  (gref-call f 1)
                  k
                  (push)
                  (lref 0 0)
                  (tail-call 1)))
               (define f)
               (const-push 300)
               (gref-tail-call f 1))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(45150));
        assert!(vm.stats().migrations > 0);
    }

    #[test]
    fn local_env_and_lset() {
        let mut vm = quiet_vm();
        let v = run(
            &mut vm,
            "(code top 0
               (const-push 1) (const 2) (push-local-env 3)
               (const 30) (lset 0 2)
               (lref-push 0 0) (lref-push 0 1) (lref 0 2) (list 3)
               (ret))",
        )
        .unwrap();
        assert_eq!(v.to_string(), "(1 2 30)");
    }

    #[test]
    fn local_env_jump_loops() {
        let mut vm = Vm::new(VmConfig::default().with_stack_size(64));
        // (let loop ((i 0) (acc 0)) (if (= i 500) acc (loop (+ i 1) (+ acc i))))
        let v = run(
            &mut vm,
            "(code top 0
               (const-push 0) (const-push 0) (local-env 2)
               body
               (lref-push 0 0) (const 500) (num-eq2) (bf next)
               (lref 0 1) (ret)
               next
               (lref 0 0) (num-addi 1) (push)
               (lref-push 0 0) (lref 0 1) (num-add2) (push)
               (local-env-jump 1 body))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(124750));
        assert_eq!(vm.stats().migrations, 0);
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn multiple_values() {
        let mut vm = quiet_vm();
        let v = run(
            &mut vm,
            "(code top 0
               (const-push 1) (const-push 2) (const 3) (values 3)
               (receive 1 rest after)
               (lref-push 0 0) (lref 0 1) (cons) (ret)
               after
               (ret))",
        )
        .unwrap();
        assert_eq!(v.to_string(), "(1 2 3)");

        let err = run(
            &mut vm,
            "(code top 0 (const-push 1) (const 2) (values 2) (tail-receive 3) (const-ret #f))",
        )
        .unwrap_err();
        assert_eq!(kind_of(err), "values-arity-mismatch");

        let err = run(
            &mut vm,
            "(code top 0 (const-push 1) (const 2) (values 2) (tail-receive 1) (const-ret #f))",
        )
        .unwrap_err();
        assert_eq!(kind_of(err), "values-arity-mismatch");

        run(&mut vm, "(code top 0 (values 0) (ret))").unwrap();
        assert!(vm.results().is_empty());
    }

    #[test]
    fn too_many_values() {
        let mut vm = quiet_vm();
        let text = format!(
            "(code top 0 {} (const 0) (values {}) (ret))",
            "(const-push 0) ".repeat(MAX_VALUES - 1),
            MAX_VALUES
        );
        assert_eq!(kind_of(run(&mut vm, &text).unwrap_err()), "too-many-values");
        assert_eq!(vm.stack_pointer(), 0);
    }

    #[test]
    fn apply_spreads_list() {
        let mut vm = quiet_vm();
        let v = run(
            &mut vm,
            "(code top 0
               (gref-push list) (const-push 1) (const (2 3)) (apply 3)
               (push) (const 4) (cons) (ret))",
        )
        .unwrap();
        assert_eq!(v.to_string(), "((1 2 3) . 4)");

        let v = run(
            &mut vm,
            "(code top 0 (gref-push +) (const (5 6 7)) (tail-apply 2))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(18));
    }

    #[test]
    fn globals() {
        let mut vm = quiet_vm();
        let err = run(&mut vm, "(code top 0 (const 1) (gset nowhere) (ret))").unwrap_err();
        match err {
            VmError::Uncaught { type_name, message, .. } => {
                assert_eq!(type_name, "unbound-variable");
                assert_eq!(message, "symbol not defined: nowhere");
            }
            other => panic!("unexpected {:?}", other),
        }

        let v = run(
            &mut vm,
            "(code top 0 (const 3) (define x) (const 4) (gset x) (gref x) (ret))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(4));

        let err = run(&mut vm, "(code top 0 (const 1) (define pi const) (const 2) (gset pi) (ret))");
        assert_eq!(kind_of(err.unwrap_err()), "error");
    }

    #[test]
    fn inline_type_errors() {
        let mut vm = quiet_vm();
        let cases = [
            ("(code top 0 (const-push 1) (const a) (num-add2) (ret))", "wrong-type-argument"),
            ("(code top 0 (const #(1 2)) (push) (const 2) (vec-ref) (ret))", "index-out-of-range"),
            ("(code top 0 (const 3) (vec-len) (ret))", "wrong-type-argument"),
            ("(code top 0 (const 9223372036854775807) (num-addi 1) (ret))", "error"),
        ];
        for (text, kind) in cases {
            assert_eq!(kind_of(run(&mut vm, text).unwrap_err()), kind, "{}", text);
            assert_eq!(vm.stack_pointer(), 0);
        }
    }

    #[test]
    fn vectors() {
        let mut vm = quiet_vm();
        let v = run(
            &mut vm,
            "(code top 0
               (const #(1 2 3)) (define v)
               (gref-push v) (const-push 1) (const 20) (vec-set)
               (gref-push v) (const 1) (vec-ref) (push)
               (gref v) (vec-len) (num-add2)
               (ret))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(23));
    }

    #[test]
    fn slots_and_accessors() {
        let mut vm = quiet_vm();
        let reads = Rc::new(Cell::new(0));
        let r = reads.clone();
        let class = Class::new(
            "point",
            vec![
                SlotDef::plain("x"),
                SlotDef {
                    name: Rc::from("y"),
                    getter: Some(Value::subr("point-y", 1, false, move |_, _| {
                        r.set(r.get() + 1);
                        Ok(Value::Int(99))
                    })),
                    setter: None,
                },
            ],
        );
        vm.define("p", Instance::new(&class));

        let v = run(
            &mut vm,
            "(code top 0
               (gref-push p) (const-push x) (const 5) (slot-set)
               (gref-push p) (const x) (slot-ref) (push)
               (gref-push p) (const y) (slot-ref)
               (num-add2) (ret))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(104));
        assert_eq!(reads.get(), 1);
        assert_eq!(vm.stack_pointer(), 0);

        let err = run(&mut vm, "(code top 0 (gref-push p) (const z) (slot-ref) (ret))").unwrap_err();
        assert_eq!(kind_of(err), "error");
    }

    #[test]
    fn handler_chain_instructions() {
        let mut vm = quiet_vm();
        run(
            &mut vm,
            "(code top 0 (const-push 1) (const 2) (push-handlers) (ret))",
        )
        .unwrap();
        assert_eq!(wind::chain_len(&vm.handlers), 1);
        run(&mut vm, "(code top 0 (pop-handlers) (ret))").unwrap();
        assert!(vm.handlers.is_none());
    }

    #[test]
    fn signals_at_safepoint() {
        let mut vm = quiet_vm();
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        vm.set_signal_handler(
            15,
            Value::subr("on-term", 1, false, move |_, args| {
                s.set(args[0].as_int().unwrap_or(0));
                Ok(Value::Int(-1))
            }),
        );
        let tx = vm.signal_sender();
        std::thread::spawn(move || tx.send(15)).join().unwrap();

        let v = run(
            &mut vm,
            "(code top 0 (const-push 1) (const 2) (values 2) (ret))",
        )
        .unwrap();
        assert_eq!(v, Value::Int(1));
        assert_eq!(vm.results(), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(seen.get(), 15);
    }

    #[test]
    fn finalizers_run() {
        let mut vm = quiet_vm();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        vm.register_finalizer(
            Value::vector(vec![Value::Int(1)]),
            Value::subr("fin", 1, false, move |_, _| {
                r.set(true);
                Ok(Value::Undefined)
            }),
        );
        assert_eq!(vm.collect_garbage(), 1);
        assert!(!ran.get());
        assert_eq!(run(&mut vm, "(code top 0 (const 1) (ret))").unwrap(), Value::Int(1));
        assert!(ran.get());
    }
}
