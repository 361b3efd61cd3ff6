// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/frame.rs

// Frame allocation for the Sail virtual machine. Environment and
// continuation frames live on the stack until something needs them to
// outlive it; then they move to the heap, leaving a relocation marker
// behind so that handles into the stack still find them.

// <>

use super::code::{CompiledCode, Pc};
use super::error::VmResult;
use super::memmgt::Lease;
use super::value::Value;
use super::{Vm, CONT_FRAME_SIZE, ENV_HDR_SIZE};

use smallvec::SmallVec;

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// Rust code to run when a continuation frame is popped; receives the
/// returned value and produces the new value register
pub type NativeCont = Rc<dyn Fn(&mut Vm, Value) -> VmResult<Value>>;

/// Where a continuation frame resumes
#[derive(Clone)]
pub enum Resume {
    Code(Pc),
    Native(NativeCont),
}

/// Handle to an environment frame
#[derive(Clone)]
pub enum EnvRef {
    Stack(usize),
    Heap(Rc<HeapEnv>),
}

/// Handle to a continuation frame
#[derive(Clone)]
pub enum ContRef {
    Stack(usize),
    Heap(Rc<HeapCont>),
}

impl PartialEq for EnvRef {
    fn eq(&self, other: &EnvRef) -> bool {
        match (self, other) {
            (EnvRef::Stack(a), EnvRef::Stack(b)) => a == b,
            (EnvRef::Heap(a), EnvRef::Heap(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for ContRef {
    fn eq(&self, other: &ContRef) -> bool {
        match (self, other) {
            (ContRef::Stack(a), ContRef::Stack(b)) => a == b,
            (ContRef::Heap(a), ContRef::Heap(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for EnvRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvRef::Stack(i) => write!(f, "env@{}", i),
            EnvRef::Heap(h) => write!(f, "env@{:p}", Rc::as_ptr(h)),
        }
    }
}

impl fmt::Debug for ContRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContRef::Stack(i) => write!(f, "cont@{}", i),
            ContRef::Heap(h) => write!(f, "cont@{:p}", Rc::as_ptr(h)),
        }
    }
}

/// Header slot above the data of a stack environment
pub struct EnvHeader {
    pub up: Option<EnvRef>,
    pub info: Option<Value>,
    /// Number of data slots directly below the header
    pub size: usize,
}

/// Stack continuation frame; the saved argument frame of the caller
/// sits in `size` slots starting at `argp`
pub struct ContHeader {
    pub prev: Option<ContRef>,
    pub env: Option<EnvRef>,
    pub argp: usize,
    pub size: usize,
    pub resume: Resume,
    pub base: Option<Rc<CompiledCode>>,
}

/// One stack word
#[derive(Default)]
pub enum Slot {
    #[default]
    Empty,
    Val(Value),
    Env(EnvHeader),
    Cont(ContHeader),
    /// Environment relocated to the heap
    MovedEnv(Rc<HeapEnv>),
    /// Continuation relocated to the heap
    MovedCont(Rc<HeapCont>),
}

impl Slot {
    pub fn value(&self) -> Value {
        match self {
            Slot::Val(v) => v.clone(),
            Slot::Empty => Value::Undefined,
            _ => panic!("frame header found in an argument slot"),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Slot::Val(v) => v,
            Slot::Empty => Value::Undefined,
            _ => panic!("frame header found in an argument slot"),
        }
    }
}

/// Environment frame on the heap
pub struct HeapEnv {
    pub up: Option<Rc<HeapEnv>>,
    pub info: Option<Value>,
    pub slots: RefCell<Vec<Value>>,
    _lease: Lease,
}

/// Continuation frame on the heap, with a copy of its argument frame
pub struct HeapCont {
    pub prev: Option<Rc<HeapCont>>,
    pub env: Option<Rc<HeapEnv>>,
    pub args: Vec<Value>,
    pub resume: Resume,
    pub base: Option<Rc<CompiledCode>>,
    _lease: Lease,
}

/// Read-only summary of a continuation frame
pub struct ContView {
    pub prev: Option<ContRef>,
    pub base: Option<Rc<CompiledCode>>,
    /// None for native continuations
    pub pc: Option<Pc>,
    pub boundary: bool,
}

impl Vm {
    #[inline(always)]
    pub(crate) fn push_arg(&mut self, v: Value) {
        self.check_stack(1);
        self.stack[self.sp] = Slot::Val(v);
        self.sp += 1;
    }

    #[inline(always)]
    pub(crate) fn pop_arg(&mut self) -> Value {
        assert!(self.sp > self.argp, "argument frame underflow");
        self.sp -= 1;
        mem::take(&mut self.stack[self.sp]).into_value()
    }

    /// Copies of the values in the current argument frame
    pub(crate) fn arg_values(&self) -> SmallVec<[Value; 8]> {
        self.stack[self.argp..self.sp].iter().map(Slot::value).collect()
    }

    /// Removes the current argument frame, returning its values
    pub(crate) fn take_args(&mut self) -> SmallVec<[Value; 8]> {
        let args = self.stack[self.argp..self.sp]
            .iter_mut()
            .map(|s| mem::take(s).into_value())
            .collect();
        self.sp = self.argp;
        args
    }

    /// Makes room for `n` more slots, migrating frames if the stack is
    /// full. Running out after migration ends the process.
    pub(crate) fn check_stack(&mut self, n: usize) {
        if self.sp + n > self.stack.len() {
            self.save_stack();
            if self.sp + n > self.stack.len() {
                let free = self.stack.len() - self.sp;
                self.fatal(&format!(
                    "stack exhausted: {} slots needed, {} free after migration",
                    n, free
                ));
            }
        }
    }

    /// Stack check on entry to compiled code; the static bound is
    /// loose, so it is capped and individual pushes check again
    pub(crate) fn ensure_headroom(&mut self, n: usize) {
        let cap = self.stack.len() / 2;
        self.check_stack(n.min(cap));
    }

    pub(crate) fn fatal(&self, msg: &str) -> ! {
        log::error!("fatal: {}", msg);
        self.memory.abort(msg)
    }

    fn lease(&mut self, words: usize) -> Lease {
        match self.memory.allocate(words) {
            Ok(lease) => lease,
            Err(e) => self.fatal(&format!("cannot move frames off the stack: {}", e)),
        }
    }

    /// Pushes a continuation frame that saves the registers
    pub(crate) fn push_cont(&mut self, resume: Resume) {
        self.check_stack(CONT_FRAME_SIZE);

        let at = self.sp;
        let env = match resume {
            Resume::Code(_) => self.env.clone(),
            Resume::Native(_) => None,
        };
        self.stack[at] = Slot::Cont(ContHeader {
            prev: self.cont.take(),
            env,
            argp: self.argp,
            size: at - self.argp,
            resume,
            base: self.base.clone(),
        });
        self.sp += CONT_FRAME_SIZE;
        self.argp = self.sp;
        self.cont = Some(ContRef::Stack(at));

        if cfg!(feature = "stkdbg") {
            log::trace!("push cont at {}", at);
        }
    }

    pub(crate) fn push_native_cont<F>(&mut self, after: F)
    where
        F: Fn(&mut Vm, Value) -> VmResult<Value> + 'static,
    {
        self.push_cont(Resume::Native(Rc::new(after)));
    }

    /// Pops the current continuation frame and restores the registers
    /// it saved. A native frame is handed back for the caller to run.
    pub(crate) fn pop_cont(&mut self) -> Option<NativeCont> {
        let cont = match self.cont.take() {
            Some(c) => self.resolve_cont(c),
            None => panic!("no continuation frame to pop"),
        };

        if cfg!(feature = "stkdbg") {
            log::trace!("pop {:?}", cont);
        }

        match cont {
            ContRef::Stack(i) => {
                // the slot is dead once popped; leaving the header in
                // place would keep its heap chain alive
                let ContHeader {
                    prev,
                    env,
                    argp,
                    size,
                    resume,
                    base,
                } = match mem::take(&mut self.stack[i]) {
                    Slot::Cont(h) => h,
                    _ => panic!("no continuation frame at slot {}", i),
                };
                self.argp = argp;
                self.sp = argp + size;
                self.cont = prev;
                self.base = base;
                match resume {
                    Resume::Code(pc) => {
                        self.env = env;
                        self.pc = pc;
                        None
                    }
                    Resume::Native(after) => {
                        self.env = None;
                        self.pc = Pc::Ret;
                        Some(after)
                    }
                }
            }
            ContRef::Heap(h) => {
                self.argp = 0;
                self.sp = 0;
                for v in &h.args {
                    self.stack[self.sp] = Slot::Val(v.clone());
                    self.sp += 1;
                }
                self.cont = h.prev.clone().map(ContRef::Heap);
                self.base = h.base.clone();
                match &h.resume {
                    Resume::Code(pc) => {
                        self.env = h.env.clone().map(EnvRef::Heap);
                        self.pc = *pc;
                        None
                    }
                    Resume::Native(after) => {
                        self.env = None;
                        self.pc = Pc::Ret;
                        Some(after.clone())
                    }
                }
            }
        }
    }

    /// Turns the current argument frame into an environment frame
    pub(crate) fn finish_env(&mut self, info: Option<Value>, up: Option<EnvRef>) {
        // a migration would clear the slot a stack handle names
        let up = if self.sp + ENV_HDR_SIZE > self.stack.len() {
            up.map(|e| EnvRef::Heap(self.save_env(e)))
        } else {
            up
        };
        self.check_stack(ENV_HDR_SIZE);

        let at = self.sp;
        self.stack[at] = Slot::Env(EnvHeader {
            up,
            info,
            size: at - self.argp,
        });
        self.sp += ENV_HDR_SIZE;
        self.argp = self.sp;
        self.env = Some(EnvRef::Stack(at));
    }

    /// Extends the current environment by `n` unbound slots
    pub(crate) fn push_local_env(&mut self, n: usize, info: Option<Value>) {
        for _ in 0..n {
            self.push_arg(Value::Undefined);
        }
        let up = self.env.clone();
        self.finish_env(info, up);
    }

    fn resolve_cont(&self, c: ContRef) -> ContRef {
        if let ContRef::Stack(i) = c {
            if let Slot::MovedCont(h) = &self.stack[i] {
                return ContRef::Heap(h.clone());
            }
        }
        c
    }

    fn moved_env(&self, i: usize) -> Option<Rc<HeapEnv>> {
        match &self.stack[i] {
            Slot::MovedEnv(h) => Some(h.clone()),
            _ => None,
        }
    }

    /// Whether two handles name the same continuation frame
    pub(crate) fn same_cont(&self, a: &Option<ContRef>, b: &Option<ContRef>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.resolve_cont(a.clone()) == self.resolve_cont(b.clone()),
            _ => false,
        }
    }

    /// Copies the stack-resident part of an environment chain to the
    /// heap, oldest frame first, leaving a relocation marker in place
    /// of each header. Frames already moved are not copied again.
    pub(crate) fn save_env(&mut self, e: EnvRef) -> Rc<HeapEnv> {
        let mut chain = Vec::new();
        let mut tail = None;
        let mut cur = Some(e);
        while let Some(r) = cur {
            match r {
                EnvRef::Heap(h) => {
                    tail = Some(h);
                    break;
                }
                EnvRef::Stack(i) => match &self.stack[i] {
                    Slot::MovedEnv(h) => {
                        tail = Some(h.clone());
                        break;
                    }
                    Slot::Env(hdr) => {
                        chain.push(i);
                        cur = hdr.up.clone();
                    }
                    _ => panic!("no environment frame at slot {}", i),
                },
            }
        }

        let mut up = tail;
        for &i in chain.iter().rev() {
            let (size, info) = match &self.stack[i] {
                Slot::Env(hdr) => (hdr.size, hdr.info.clone()),
                _ => unreachable!(),
            };
            let slots = self.stack[i - size..i].iter().map(Slot::value).collect();
            let lease = self.lease(size + ENV_HDR_SIZE);
            let heap = Rc::new(HeapEnv {
                up: up.take(),
                info,
                slots: RefCell::new(slots),
                _lease: lease,
            });
            self.stack[i] = Slot::MovedEnv(heap.clone());
            self.stats.frames_moved += 1;
            up = Some(heap);
        }

        match up {
            Some(h) => h,
            None => unreachable!("environment chain ended without a frame"),
        }
    }

    /// Copies every stack continuation frame to the heap, then
    /// redirects the handles held outside the stack: the continuation
    /// register, the native-caller markers and the escape points
    pub(crate) fn save_cont(&mut self) {
        if let Some(e) = self.env.take() {
            self.env = Some(EnvRef::Heap(self.save_env(e)));
        }

        let mut chain = Vec::new();
        let mut tail = None;
        let mut cur = self.cont.clone();
        while let Some(r) = cur {
            match r {
                ContRef::Heap(h) => {
                    tail = Some(h);
                    break;
                }
                ContRef::Stack(i) => match &self.stack[i] {
                    Slot::MovedCont(h) => {
                        tail = Some(h.clone());
                        break;
                    }
                    Slot::Cont(hdr) => {
                        chain.push(i);
                        cur = hdr.prev.clone();
                    }
                    _ => panic!("no continuation frame at slot {}", i),
                },
            }
        }

        let mut prev = tail;
        for &i in chain.iter().rev() {
            let (env, argp, size, resume, base) = match &self.stack[i] {
                Slot::Cont(hdr) => (
                    hdr.env.clone(),
                    hdr.argp,
                    hdr.size,
                    hdr.resume.clone(),
                    hdr.base.clone(),
                ),
                _ => unreachable!(),
            };
            let env = env.map(|e| self.save_env(e));
            let args = self.stack[argp..argp + size].iter().map(Slot::value).collect();
            let lease = self.lease(size + CONT_FRAME_SIZE);
            let heap = Rc::new(HeapCont {
                prev: prev.take(),
                env,
                args,
                resume,
                base,
                _lease: lease,
            });
            self.stack[i] = Slot::MovedCont(heap.clone());
            self.stats.frames_moved += 1;
            prev = Some(heap);
        }
        if let Some(h) = prev {
            self.cont = Some(ContRef::Heap(h));
        }

        for k in 0..self.markers.len() {
            let fwd = self.markers[k].cont.clone().map(|c| self.resolve_cont(c));
            self.markers[k].cont = fwd;
        }

        let mut ep = self.escape_point.clone();
        while let Some(p) = ep {
            let fwd = p.cont.borrow().clone().map(|c| self.resolve_cont(c));
            *p.cont.borrow_mut() = fwd;
            ep = p.prev.clone();
        }
        let mut ep = self.floating.clone();
        while let Some(p) = ep {
            let fwd = p.cont.borrow().clone().map(|c| self.resolve_cont(c));
            *p.cont.borrow_mut() = fwd;
            ep = p.floating.clone();
        }
    }

    /// Moves every frame to the heap and restarts the stack with only
    /// the current argument frame, shifted down to the base
    pub(crate) fn save_stack(&mut self) {
        let before = self.stats.frames_moved;
        self.save_cont();

        let n = self.sp - self.argp;
        for k in 0..n {
            let v = mem::take(&mut self.stack[self.argp + k]);
            self.stack[k] = v;
        }
        for s in &mut self.stack[n..] {
            *s = Slot::Empty;
        }
        self.argp = 0;
        self.sp = n;
        self.stats.migrations += 1;

        log::debug!(
            "stack migrated: {} frames moved, {} arguments kept",
            self.stats.frames_moved - before,
            n
        );
    }

    /// Environment for a new closure; moves the current chain to the
    /// heap and points the stack continuations at the copies
    pub(crate) fn get_env(&mut self) -> Option<Rc<HeapEnv>> {
        let e = self.env.clone()?;
        if let EnvRef::Heap(h) = e {
            return Some(h);
        }

        let saved = self.save_env(e);
        self.env = Some(EnvRef::Heap(saved.clone()));

        let mut c = self.cont.clone();
        while let Some(ContRef::Stack(i)) = &c {
            let i = *i;
            let (next, fwd) = match &self.stack[i] {
                Slot::Cont(hdr) => (
                    hdr.prev.clone(),
                    match &hdr.env {
                        Some(EnvRef::Stack(j)) => self.moved_env(*j),
                        _ => None,
                    },
                ),
                _ => break,
            };
            if let (Some(m), Slot::Cont(hdr)) = (fwd, &mut self.stack[i]) {
                hdr.env = Some(EnvRef::Heap(m));
            }
            c = next;
        }
        Some(saved)
    }

    /// Clears dead slots above the stack pointer so they stop holding
    /// references
    pub(crate) fn clear_dead_slots(&mut self) {
        let sp = self.sp;
        for s in &mut self.stack[sp..] {
            *s = Slot::Empty;
        }
    }

    pub(crate) fn env_up(&self, e: &EnvRef) -> Option<EnvRef> {
        match e {
            EnvRef::Stack(i) => match &self.stack[*i] {
                Slot::Env(hdr) => hdr.up.clone(),
                Slot::MovedEnv(h) => h.up.clone().map(EnvRef::Heap),
                _ => panic!("no environment frame at slot {}", i),
            },
            EnvRef::Heap(h) => h.up.clone().map(EnvRef::Heap),
        }
    }

    /// The environment `depth` frames up from the current one
    pub(crate) fn env_at(&self, depth: usize) -> EnvRef {
        let mut e = match &self.env {
            Some(e) => e.clone(),
            None => panic!("local variable reference without an environment"),
        };
        for _ in 0..depth {
            e = match self.env_up(&e) {
                Some(up) => up,
                None => panic!("environment depth {} out of range", depth),
            };
        }
        e
    }

    pub(crate) fn env_get(&self, e: &EnvRef, off: usize) -> Value {
        match e {
            EnvRef::Stack(i) => match &self.stack[*i] {
                Slot::Env(hdr) => {
                    assert!(off < hdr.size, "local offset {} out of range", off);
                    self.stack[*i - hdr.size + off].value()
                }
                Slot::MovedEnv(h) => h.slots.borrow()[off].clone(),
                _ => panic!("no environment frame at slot {}", i),
            },
            EnvRef::Heap(h) => h.slots.borrow()[off].clone(),
        }
    }

    pub(crate) fn env_set(&mut self, e: &EnvRef, off: usize, v: Value) {
        match e {
            EnvRef::Stack(i) => {
                let i = *i;
                let size = match &self.stack[i] {
                    Slot::Env(hdr) => hdr.size,
                    Slot::MovedEnv(h) => {
                        h.slots.borrow_mut()[off] = v;
                        return;
                    }
                    _ => panic!("no environment frame at slot {}", i),
                };
                assert!(off < size, "local offset {} out of range", off);
                self.stack[i - size + off] = Slot::Val(v);
            }
            EnvRef::Heap(h) => h.slots.borrow_mut()[off] = v,
        }
    }

    pub(crate) fn cont_view(&self, c: &ContRef) -> ContView {
        let view = |prev, base, resume: &Resume| ContView {
            prev,
            base,
            pc: match resume {
                Resume::Code(pc) => Some(*pc),
                Resume::Native(_) => None,
            },
            boundary: matches!(resume, Resume::Code(Pc::Boundary)),
        };
        match c {
            ContRef::Stack(i) => match &self.stack[*i] {
                Slot::Cont(hdr) => view(hdr.prev.clone(), hdr.base.clone(), &hdr.resume),
                Slot::MovedCont(h) => view(
                    h.prev.clone().map(ContRef::Heap),
                    h.base.clone(),
                    &h.resume,
                ),
                _ => panic!("no continuation frame at slot {}", i),
            },
            ContRef::Heap(h) => view(
                h.prev.clone().map(ContRef::Heap),
                h.base.clone(),
                &h.resume,
            ),
        }
    }

    pub(crate) fn is_boundary(&self, c: &ContRef) -> bool {
        self.cont_view(c).boundary
    }
}

#[cfg(test)]
mod tests {
    use super::super::memmgt::{acquire_mem_region, PanickingRegion};
    use super::super::VmConfig;
    use super::*;

    fn small_vm() -> Vm {
        Vm::new(VmConfig::default().with_stack_size(64))
    }

    #[test]
    fn cont_restores_registers() {
        let mut vm = small_vm();
        vm.push_arg(Value::Int(1));
        vm.push_arg(Value::Int(2));
        vm.pc = Pc::At(7);
        vm.push_cont(Resume::Code(Pc::At(7)));
        assert_eq!(vm.sp, 3);
        assert_eq!(vm.argp, 3);

        vm.push_arg(Value::Int(9));
        vm.pc = Pc::At(0);
        assert!(vm.pop_cont().is_none());
        assert_eq!(vm.pc, Pc::At(7));
        assert_eq!((vm.argp, vm.sp), (0, 2));
        assert_eq!(&vm.arg_values()[..], &[Value::Int(1), Value::Int(2)]);
        assert!(vm.cont.is_none());
    }

    #[test]
    fn env_data_below_header() {
        let mut vm = small_vm();
        vm.push_arg(Value::Int(10));
        vm.push_arg(Value::Int(20));
        vm.finish_env(None, None);
        let e = vm.env_at(0);
        assert_eq!(vm.env_get(&e, 0), Value::Int(10));
        assert_eq!(vm.env_get(&e, 1), Value::Int(20));

        vm.env_set(&e, 1, Value::Int(21));
        vm.push_local_env(1, None);
        let inner = vm.env_at(0);
        assert_eq!(vm.env_get(&inner, 0), Value::Undefined);
        assert_eq!(vm.env_get(&vm.env_at(1), 1), Value::Int(21));
    }

    #[test]
    fn moved_env_forwards() {
        let mut vm = small_vm();
        vm.push_arg(Value::Int(5));
        vm.finish_env(None, None);
        vm.push_arg(Value::Int(6));
        vm.finish_env(None, vm.env.clone());
        let stale = vm.env_at(0);

        let heap = vm.get_env().unwrap();
        assert_eq!(heap.slots.borrow()[0], Value::Int(6));
        assert_eq!(heap.up.as_ref().unwrap().slots.borrow()[0], Value::Int(5));

        // the old stack handle sees the heap copy
        vm.env_set(&stale, 0, Value::Int(7));
        assert_eq!(heap.slots.borrow()[0], Value::Int(7));
        assert_eq!(vm.stats.frames_moved, 2);

        // saving again moves nothing
        let again = vm.save_env(stale);
        assert!(Rc::ptr_eq(&again, &heap));
        assert_eq!(vm.stats.frames_moved, 2);
    }

    #[test]
    fn migration_keeps_arguments() {
        let mut vm = small_vm();
        vm.push_arg(Value::Int(1));
        vm.finish_env(None, None);
        vm.push_cont(Resume::Code(Pc::At(3)));
        vm.push_arg(Value::Int(2));
        vm.push_arg(Value::Int(3));

        vm.save_stack();
        assert_eq!((vm.argp, vm.sp), (0, 2));
        assert_eq!(&vm.arg_values()[..], &[Value::Int(2), Value::Int(3)]);
        assert!(matches!(vm.cont, Some(ContRef::Heap(_))));
        assert_eq!(vm.stats.migrations, 1);

        vm.take_args();
        assert!(vm.pop_cont().is_none());
        assert_eq!(vm.pc, Pc::At(3));
        let e = vm.env_at(0);
        assert!(matches!(e, EnvRef::Heap(_)));
        assert_eq!(vm.env_get(&e, 0), Value::Int(1));
    }

    #[test]
    fn overflow_migrates() {
        let mut vm = small_vm();
        for n in 0..40 {
            vm.push_arg(Value::Int(n));
            vm.push_cont(Resume::Code(Pc::At(n as usize)));
        }
        assert!(vm.stats.migrations > 0);
        for n in (0..40).rev() {
            assert!(vm.pop_cont().is_none());
            assert_eq!(vm.pc, Pc::At(n as usize));
            assert_eq!(vm.pop_arg(), Value::Int(n));
        }
        let stats = vm.memory.stats();
        assert!(stats.total_words > 0);
        assert_eq!(stats.live_words, 0);
    }

    #[test]
    fn popped_frames_release_heap_chain() {
        let mut vm = small_vm();
        for n in 0..40 {
            vm.push_arg(Value::Int(n));
            vm.push_cont(Resume::Code(Pc::At(n as usize)));
        }
        // the newest frames are still on the stack and link to heap copies
        assert!(matches!(vm.cont, Some(ContRef::Stack(_))));
        let at = match vm.cont {
            Some(ContRef::Stack(i)) => i,
            _ => unreachable!(),
        };
        assert!(vm.pop_cont().is_none());
        assert!(matches!(vm.stack[at], Slot::Empty));
        assert!(vm.memory.stats().live_words > 0);

        // dropping the register and the live stack frees the copies
        vm.cont = None;
        vm.sp = 0;
        vm.argp = 0;
        vm.clear_dead_slots();
        assert_eq!(vm.memory.stats().live_words, 0);
    }

    #[test]
    #[should_panic(expected = "cannot move frames off the stack")]
    fn refused_migration_is_fatal() {
        let mut vm = small_vm();
        vm.set_memory_manager(Box::new(PanickingRegion(acquire_mem_region(Some(16)))));
        for n in 0..200 {
            vm.push_arg(Value::Int(n));
            vm.push_cont(Resume::Code(Pc::At(0)));
        }
    }
}
