// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/code.rs

// Compiled code objects: the instruction set, program counters, and
// global references that memoize their binding cell on first use.

// <>

use super::symtab::{Gloc, Module};
use super::value::Value;

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

/// Program counter
///
/// Besides positions in the current code base, the counter may point
/// at one of two shared stubs: a lone return, and a tail call of a
/// given arity followed by a return. Boundary frames resume at a
/// sentinel that is never executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pc {
    At(usize),
    Ret,
    Apply(usize),
    Boundary,
}

/// Defines an enum along with a TryFrom<u8> implementation
macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

enum_and_tryfrom! {
    /// Operation codes for every instruction
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Opcode {
        Nop,
        Const,
        ConstPush,
        ConstRet,
        Push,
        PreCall,
        PushPreCall,
        CheckStack,
        Call,
        TailCall,
        Jump,
        Ret,
        Bf,
        Bt,
        Rf,
        LRef,
        LRefPush,
        LSet,
        GRef,
        GRefPush,
        GRefCall,
        GRefTailCall,
        GSet,
        Define,
        LocalEnv,
        PushLocalEnv,
        PopLocalEnv,
        LocalEnvJump,
        Closure,
        Receive,
        TailReceive,
        Values,
        Apply,
        TailApply,
        ConstApply,
        Cons,
        Car,
        Cdr,
        List,
        NullP,
        Not,
        Eq,
        NumAdd2,
        NumSub2,
        NumMul2,
        NumLt2,
        NumEq2,
        NumAddI,
        VecRef,
        VecSet,
        VecLen,
        SlotRef,
        SlotSet,
        PushHandlers,
        PopHandlers,
    }
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Const => "const",
            Opcode::ConstPush => "const-push",
            Opcode::ConstRet => "const-ret",
            Opcode::Push => "push",
            Opcode::PreCall => "pre-call",
            Opcode::PushPreCall => "push-pre-call",
            Opcode::CheckStack => "check-stack",
            Opcode::Call => "call",
            Opcode::TailCall => "tail-call",
            Opcode::Jump => "jump",
            Opcode::Ret => "ret",
            Opcode::Bf => "bf",
            Opcode::Bt => "bt",
            Opcode::Rf => "rf",
            Opcode::LRef => "lref",
            Opcode::LRefPush => "lref-push",
            Opcode::LSet => "lset",
            Opcode::GRef => "gref",
            Opcode::GRefPush => "gref-push",
            Opcode::GRefCall => "gref-call",
            Opcode::GRefTailCall => "gref-tail-call",
            Opcode::GSet => "gset",
            Opcode::Define => "define",
            Opcode::LocalEnv => "local-env",
            Opcode::PushLocalEnv => "push-local-env",
            Opcode::PopLocalEnv => "pop-local-env",
            Opcode::LocalEnvJump => "local-env-jump",
            Opcode::Closure => "closure",
            Opcode::Receive => "receive",
            Opcode::TailReceive => "tail-receive",
            Opcode::Values => "values",
            Opcode::Apply => "apply",
            Opcode::TailApply => "tail-apply",
            Opcode::ConstApply => "const-apply",
            Opcode::Cons => "cons",
            Opcode::Car => "car",
            Opcode::Cdr => "cdr",
            Opcode::List => "list",
            Opcode::NullP => "nullp",
            Opcode::Not => "not",
            Opcode::Eq => "eq",
            Opcode::NumAdd2 => "num-add2",
            Opcode::NumSub2 => "num-sub2",
            Opcode::NumMul2 => "num-mul2",
            Opcode::NumLt2 => "num-lt2",
            Opcode::NumEq2 => "num-eq2",
            Opcode::NumAddI => "num-addi",
            Opcode::VecRef => "vec-ref",
            Opcode::VecSet => "vec-set",
            Opcode::VecLen => "vec-len",
            Opcode::SlotRef => "slot-ref",
            Opcode::SlotSet => "slot-set",
            Opcode::PushHandlers => "push-handlers",
            Opcode::PopHandlers => "pop-handlers",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        (0..=u8::MAX)
            .map_while(|b| Opcode::try_from(b).ok())
            .find(|op| op.mnemonic() == name)
    }
}

/// A global variable reference; the binding cell is resolved on
/// first use and kept for later executions
pub struct GlobalRef {
    pub name: Rc<str>,
    cell: OnceCell<Rc<Gloc>>,
}

impl GlobalRef {
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            cell: OnceCell::new(),
        }
    }

    /// Looks up the binding, memoizing it if found. Repeating the
    /// memoization is harmless; the first cell stored wins.
    pub fn resolve(&self, module: &Module) -> Option<Rc<Gloc>> {
        if let Some(gloc) = self.cell.get() {
            return Some(gloc.clone());
        }
        let gloc = module.lookup(&self.name)?;
        Some(self.cell.get_or_init(|| gloc).clone())
    }

    pub fn is_memoized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One instruction with its operands; label operands are already
/// resolved to instruction indices
#[derive(Debug)]
pub enum Insn {
    Nop,
    Const(Value),
    ConstPush(Value),
    ConstRet(Value),
    Push,
    PreCall(usize),
    PushPreCall(usize),
    CheckStack(usize),
    Call(usize),
    TailCall(usize),
    Jump(usize),
    Ret,
    Bf(usize),
    Bt(usize),
    Rf,
    /// Local variable at (depth, offset)
    LRef(usize, usize),
    LRefPush(usize, usize),
    LSet(usize, usize),
    GRef(GlobalRef),
    GRefPush(GlobalRef),
    GRefCall(GlobalRef, usize),
    GRefTailCall(GlobalRef, usize),
    GSet(GlobalRef),
    Define { name: Rc<str>, constant: bool },
    /// Closes the argument frame into an environment of the given
    /// size, padding it with unbound slots
    LocalEnv(usize),
    PushLocalEnv(usize),
    PopLocalEnv,
    /// Rebinds a loop: (depth of env to keep, loop body)
    LocalEnvJump(usize, usize),
    Closure(Rc<CompiledCode>),
    Receive { required: usize, rest: bool, cont: usize },
    TailReceive { required: usize, rest: bool },
    Values(usize),
    Apply(usize),
    TailApply(usize),
    /// Tail-applies a constant procedure to constant arguments
    ConstApply { proc_: Value, args: Vec<Value> },
    Cons,
    Car,
    Cdr,
    List(usize),
    NullP,
    Not,
    Eq,
    NumAdd2,
    NumSub2,
    NumMul2,
    NumLt2,
    NumEq2,
    NumAddI(i64),
    VecRef,
    VecSet,
    VecLen,
    SlotRef,
    SlotSet,
    PushHandlers,
    PopHandlers,
}

impl Insn {
    pub fn opcode(&self) -> Opcode {
        match self {
            Insn::Nop => Opcode::Nop,
            Insn::Const(_) => Opcode::Const,
            Insn::ConstPush(_) => Opcode::ConstPush,
            Insn::ConstRet(_) => Opcode::ConstRet,
            Insn::Push => Opcode::Push,
            Insn::PreCall(_) => Opcode::PreCall,
            Insn::PushPreCall(_) => Opcode::PushPreCall,
            Insn::CheckStack(_) => Opcode::CheckStack,
            Insn::Call(_) => Opcode::Call,
            Insn::TailCall(_) => Opcode::TailCall,
            Insn::Jump(_) => Opcode::Jump,
            Insn::Ret => Opcode::Ret,
            Insn::Bf(_) => Opcode::Bf,
            Insn::Bt(_) => Opcode::Bt,
            Insn::Rf => Opcode::Rf,
            Insn::LRef(..) => Opcode::LRef,
            Insn::LRefPush(..) => Opcode::LRefPush,
            Insn::LSet(..) => Opcode::LSet,
            Insn::GRef(_) => Opcode::GRef,
            Insn::GRefPush(_) => Opcode::GRefPush,
            Insn::GRefCall(..) => Opcode::GRefCall,
            Insn::GRefTailCall(..) => Opcode::GRefTailCall,
            Insn::GSet(_) => Opcode::GSet,
            Insn::Define { .. } => Opcode::Define,
            Insn::LocalEnv(_) => Opcode::LocalEnv,
            Insn::PushLocalEnv(_) => Opcode::PushLocalEnv,
            Insn::PopLocalEnv => Opcode::PopLocalEnv,
            Insn::LocalEnvJump(..) => Opcode::LocalEnvJump,
            Insn::Closure(_) => Opcode::Closure,
            Insn::Receive { .. } => Opcode::Receive,
            Insn::TailReceive { .. } => Opcode::TailReceive,
            Insn::Values(_) => Opcode::Values,
            Insn::Apply(_) => Opcode::Apply,
            Insn::TailApply(_) => Opcode::TailApply,
            Insn::ConstApply { .. } => Opcode::ConstApply,
            Insn::Cons => Opcode::Cons,
            Insn::Car => Opcode::Car,
            Insn::Cdr => Opcode::Cdr,
            Insn::List(_) => Opcode::List,
            Insn::NullP => Opcode::NullP,
            Insn::Not => Opcode::Not,
            Insn::Eq => Opcode::Eq,
            Insn::NumAdd2 => Opcode::NumAdd2,
            Insn::NumSub2 => Opcode::NumSub2,
            Insn::NumMul2 => Opcode::NumMul2,
            Insn::NumLt2 => Opcode::NumLt2,
            Insn::NumEq2 => Opcode::NumEq2,
            Insn::NumAddI(_) => Opcode::NumAddI,
            Insn::VecRef => Opcode::VecRef,
            Insn::VecSet => Opcode::VecSet,
            Insn::VecLen => Opcode::VecLen,
            Insn::SlotRef => Opcode::SlotRef,
            Insn::SlotSet => Opcode::SlotSet,
            Insn::PushHandlers => Opcode::PushHandlers,
            Insn::PopHandlers => Opcode::PopHandlers,
        }
    }

    /// Most stack slots this instruction can claim by itself
    pub fn max_push(&self) -> usize {
        match self {
            Insn::ConstPush(_)
            | Insn::Push
            | Insn::PreCall(_)
            | Insn::LRefPush(..)
            | Insn::GRefPush(_)
            | Insn::LocalEnvJump(..) => 1,
            Insn::PushPreCall(_) => 2,
            Insn::LocalEnv(n) | Insn::PushLocalEnv(n) => n + 1,
            Insn::Receive { required, .. } => required + 3,
            Insn::TailReceive { required, .. } => required + 2,
            Insn::ConstApply { args, .. } => args.len(),
            Insn::SlotRef | Insn::SlotSet | Insn::Apply(_) => 3,
            _ => 0,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode().mnemonic();
        match self {
            Insn::Const(v) | Insn::ConstPush(v) | Insn::ConstRet(v) => write!(f, "{} {}", op, v),
            Insn::PreCall(n)
            | Insn::PushPreCall(n)
            | Insn::CheckStack(n)
            | Insn::Call(n)
            | Insn::TailCall(n)
            | Insn::Jump(n)
            | Insn::Bf(n)
            | Insn::Bt(n)
            | Insn::LocalEnv(n)
            | Insn::PushLocalEnv(n)
            | Insn::Values(n)
            | Insn::Apply(n)
            | Insn::TailApply(n)
            | Insn::List(n) => write!(f, "{} {}", op, n),
            Insn::LRef(d, o) | Insn::LRefPush(d, o) | Insn::LSet(d, o) | Insn::LocalEnvJump(d, o) => {
                write!(f, "{} {} {}", op, d, o)
            }
            Insn::GRef(g) | Insn::GRefPush(g) | Insn::GSet(g) => write!(f, "{} {}", op, g.name),
            Insn::GRefCall(g, n) | Insn::GRefTailCall(g, n) => write!(f, "{} {} {}", op, g.name, n),
            Insn::Define { name, constant } => {
                write!(f, "{} {}{}", op, name, if *constant { " const" } else { "" })
            }
            Insn::Closure(c) => write!(f, "{} {}", op, c.name),
            Insn::Receive {
                required,
                rest,
                cont,
            } => write!(f, "{} {} {} {}", op, required, *rest as u8, cont),
            Insn::TailReceive { required, rest } => write!(f, "{} {} {}", op, required, *rest as u8),
            Insn::ConstApply { proc_, args } => {
                let form = Value::cons(proc_.clone(), Value::list(args.clone()));
                write!(f, "{} {} {}", op, args.len(), form)
            }
            Insn::NumAddI(i) => write!(f, "{} {}", op, i),
            _ => write!(f, "{}", op),
        }
    }
}

/// Bytecode with its metadata
#[derive(Debug)]
pub struct CompiledCode {
    pub name: Rc<str>,
    pub required: usize,
    pub rest: bool,
    /// Upper bound on stack slots claimed by the body
    pub max_stack: usize,
    pub code: Vec<Insn>,
    /// (instruction index, source line), sorted by index
    pub lines: Vec<(usize, u32)>,
    pub info: Option<Value>,
}

impl CompiledCode {
    pub fn new(name: &str, required: usize, rest: bool, code: Vec<Insn>) -> Self {
        let max_stack = code.iter().map(Insn::max_push).sum::<usize>() + required + rest as usize;
        Self {
            name: Rc::from(name),
            required,
            rest,
            max_stack,
            code,
            lines: Vec::new(),
            info: None,
        }
    }

    pub fn with_lines(mut self, lines: Vec<(usize, u32)>) -> Self {
        self.lines = lines;
        self
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Source line of the instruction at `index`, if recorded
    pub fn line_of(&self, index: usize) -> Option<u32> {
        self.lines
            .iter()
            .take_while(|(at, _)| *at <= index)
            .last()
            .map(|(_, line)| *line)
    }

    /// Code that applies `proc` to `args` as a tail call
    pub(crate) fn apply_stub(proc_: &Value, args: &[Value]) -> Rc<Self> {
        let insn = Insn::ConstApply {
            proc_: proc_.clone(),
            args: args.to_vec(),
        };
        Rc::new(Self::new("%apply", 0, false, vec![insn, Insn::Ret]))
    }

    /// Human readable listing of the code and any nested closures
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "code {} (required {}{}, max stack {}):\n",
            self.name,
            self.required,
            if self.rest { " + rest" } else { "" },
            self.max_stack
        );
        let mut nested = Vec::new();
        for (i, insn) in self.code.iter().enumerate() {
            match self.lines.iter().find(|(at, _)| *at == i) {
                Some((_, line)) => out.push_str(&format!("  {:>4} {:<30}; line {}\n", i, insn.to_string(), line)),
                None => out.push_str(&format!("  {:>4} {}\n", i, insn)),
            }
            if let Insn::Closure(c) = insn {
                nested.push(c.clone());
            }
        }
        for c in nested {
            out.push_str(&c.disassemble());
        }
        out
    }
}
