// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/asm.rs

// Assembler from parenthesized listings to compiled code.
//
// A listing is (code NAME REQUIRED [rest] ITEM ...). Each item is an
// instruction form such as (lref 0 1), a bare symbol marking a label,
// or (line N) noting the source line of the next instruction.

// <>

use super::code::{CompiledCode, GlobalRef, Insn, Opcode};
use super::error::VmError;
use super::parser;
use super::value::Value;

use std::collections::HashMap;
use std::rc::Rc;

/// Assembles a single listing
pub fn assemble(text: &str) -> Result<Rc<CompiledCode>, VmError> {
    assemble_form(&parser::parse(text)?)
}

/// Assembles every listing in the input, in order
pub fn assemble_all(text: &str) -> Result<Vec<Rc<CompiledCode>>, VmError> {
    parser::parse_all(text)?.iter().map(assemble_form).collect()
}

/// Assembles an already parsed (code ...) form
pub fn assemble_form(form: &Value) -> Result<Rc<CompiledCode>, VmError> {
    let items = match form.list_to_vec() {
        Some(items) => items,
        None => return Err(VmError::assemble(format!("listing must be a proper list: {}", form))),
    };
    if items.first() != Some(&Value::sym("code")) {
        return Err(VmError::assemble(format!("listing must start with code: {}", form)));
    }

    let name = match items.get(1) {
        Some(Value::Sym(s)) => s.clone(),
        _ => return Err(VmError::assemble("code name must be a symbol")),
    };
    let required = match items.get(2) {
        Some(Value::Int(n)) if *n >= 0 => *n as usize,
        _ => return Err(VmError::assemble(format!("bad argument count for {}", name))),
    };
    let rest = items.get(3) == Some(&Value::sym("rest"));
    let body = &items[if rest { 4 } else { 3 }..];

    let labels = collect_labels(&name, body)?;

    let mut code = Vec::new();
    let mut lines = Vec::new();
    for item in body {
        match item {
            Value::Sym(_) => {}
            _ => {
                let parts = match item.list_to_vec() {
                    Some(parts) if !parts.is_empty() => parts,
                    _ => return Err(VmError::assemble(format!("bad item {} in {}", item, name))),
                };
                if parts[0] == Value::sym("line") {
                    let line = Operands::new(&name, &parts, &labels).int(1)?;
                    lines.push((code.len(), line as u32));
                    continue;
                }
                code.push(assemble_insn(&name, &parts, &labels)?);
            }
        }
    }

    if code.is_empty() {
        return Err(VmError::assemble(format!("{} has no instructions", name)));
    }

    Ok(Rc::new(
        CompiledCode::new(&name, required, rest, code).with_lines(lines),
    ))
}

/// First pass: maps each label to the index of the next instruction
fn collect_labels(name: &str, body: &[Value]) -> Result<HashMap<Rc<str>, usize>, VmError> {
    let mut labels = HashMap::new();
    let mut index = 0;
    for item in body {
        match item {
            Value::Sym(label) => {
                if labels.insert(label.clone(), index).is_some() {
                    return Err(VmError::assemble(format!("duplicate label {} in {}", label, name)));
                }
            }
            Value::Pair(p) if p.car == Value::sym("line") => {}
            _ => index += 1,
        }
    }
    Ok(labels)
}

/// Operand accessors for one instruction form
struct Operands<'a> {
    code: &'a str,
    parts: &'a [Value],
    labels: &'a HashMap<Rc<str>, usize>,
}

impl<'a> Operands<'a> {
    fn new(code: &'a str, parts: &'a [Value], labels: &'a HashMap<Rc<str>, usize>) -> Self {
        Self {
            code,
            parts,
            labels,
        }
    }

    fn error(&self, what: &str) -> VmError {
        VmError::assemble(format!(
            "{} in {} of {}",
            what,
            Value::list(self.parts.to_vec()),
            self.code
        ))
    }

    fn count(&self, min: usize, max: usize) -> Result<(), VmError> {
        let n = self.parts.len() - 1;
        if n < min || n > max {
            return Err(self.error("wrong operand count"));
        }
        Ok(())
    }

    fn get(&self, i: usize) -> Result<&'a Value, VmError> {
        self.parts.get(i).ok_or_else(|| self.error("missing operand"))
    }

    fn int(&self, i: usize) -> Result<i64, VmError> {
        match self.get(i)? {
            Value::Int(n) => Ok(*n),
            _ => Err(self.error("integer operand expected")),
        }
    }

    fn index(&self, i: usize) -> Result<usize, VmError> {
        usize::try_from(self.int(i)?).map_err(|_| self.error("negative operand"))
    }

    fn symbol(&self, i: usize) -> Result<Rc<str>, VmError> {
        match self.get(i)? {
            Value::Sym(s) => Ok(s.clone()),
            _ => Err(self.error("symbol operand expected")),
        }
    }

    fn label(&self, i: usize) -> Result<usize, VmError> {
        let name = self.symbol(i)?;
        match self.labels.get(&name) {
            Some(at) => Ok(*at),
            None => Err(self.error(&format!("undefined label {}", name))),
        }
    }

    fn flag(&self, i: usize, word: &str) -> bool {
        self.parts.get(i) == Some(&Value::sym(word))
    }
}

fn assemble_insn(
    code: &str,
    parts: &[Value],
    labels: &HashMap<Rc<str>, usize>,
) -> Result<Insn, VmError> {
    let ops = Operands::new(code, parts, labels);
    let op = match &parts[0] {
        Value::Sym(s) => match Opcode::from_mnemonic(s) {
            Some(op) => op,
            None => return Err(ops.error(&format!("unknown instruction {}", s))),
        },
        _ => return Err(ops.error("instruction name expected")),
    };

    let insn = match op {
        Opcode::Nop => nullary(&ops, Insn::Nop)?,
        Opcode::Push => nullary(&ops, Insn::Push)?,
        Opcode::Ret => nullary(&ops, Insn::Ret)?,
        Opcode::Rf => nullary(&ops, Insn::Rf)?,
        Opcode::PopLocalEnv => nullary(&ops, Insn::PopLocalEnv)?,
        Opcode::Cons => nullary(&ops, Insn::Cons)?,
        Opcode::Car => nullary(&ops, Insn::Car)?,
        Opcode::Cdr => nullary(&ops, Insn::Cdr)?,
        Opcode::NullP => nullary(&ops, Insn::NullP)?,
        Opcode::Not => nullary(&ops, Insn::Not)?,
        Opcode::Eq => nullary(&ops, Insn::Eq)?,
        Opcode::NumAdd2 => nullary(&ops, Insn::NumAdd2)?,
        Opcode::NumSub2 => nullary(&ops, Insn::NumSub2)?,
        Opcode::NumMul2 => nullary(&ops, Insn::NumMul2)?,
        Opcode::NumLt2 => nullary(&ops, Insn::NumLt2)?,
        Opcode::NumEq2 => nullary(&ops, Insn::NumEq2)?,
        Opcode::VecRef => nullary(&ops, Insn::VecRef)?,
        Opcode::VecSet => nullary(&ops, Insn::VecSet)?,
        Opcode::VecLen => nullary(&ops, Insn::VecLen)?,
        Opcode::SlotRef => nullary(&ops, Insn::SlotRef)?,
        Opcode::SlotSet => nullary(&ops, Insn::SlotSet)?,
        Opcode::PushHandlers => nullary(&ops, Insn::PushHandlers)?,
        Opcode::PopHandlers => nullary(&ops, Insn::PopHandlers)?,

        Opcode::Const | Opcode::ConstPush | Opcode::ConstRet => {
            ops.count(1, 1)?;
            let v = ops.get(1)?.clone();
            match op {
                Opcode::Const => Insn::Const(v),
                Opcode::ConstPush => Insn::ConstPush(v),
                _ => Insn::ConstRet(v),
            }
        }

        Opcode::PreCall | Opcode::PushPreCall | Opcode::Jump | Opcode::Bf | Opcode::Bt => {
            ops.count(1, 1)?;
            let l = ops.label(1)?;
            match op {
                Opcode::PreCall => Insn::PreCall(l),
                Opcode::PushPreCall => Insn::PushPreCall(l),
                Opcode::Jump => Insn::Jump(l),
                Opcode::Bf => Insn::Bf(l),
                _ => Insn::Bt(l),
            }
        }

        Opcode::CheckStack
        | Opcode::Call
        | Opcode::TailCall
        | Opcode::LocalEnv
        | Opcode::PushLocalEnv
        | Opcode::Values
        | Opcode::Apply
        | Opcode::TailApply
        | Opcode::List => {
            ops.count(1, 1)?;
            let n = ops.index(1)?;
            match op {
                Opcode::CheckStack => Insn::CheckStack(n),
                Opcode::Call => Insn::Call(n),
                Opcode::TailCall => Insn::TailCall(n),
                Opcode::LocalEnv => Insn::LocalEnv(n),
                Opcode::PushLocalEnv => Insn::PushLocalEnv(n),
                Opcode::Values => Insn::Values(n),
                Opcode::Apply | Opcode::TailApply if n < 2 => {
                    return Err(ops.error("apply needs a procedure and a list"))
                }
                Opcode::Apply => Insn::Apply(n),
                Opcode::TailApply => Insn::TailApply(n),
                _ => Insn::List(n),
            }
        }

        Opcode::LRef | Opcode::LRefPush | Opcode::LSet => {
            ops.count(2, 2)?;
            let (d, o) = (ops.index(1)?, ops.index(2)?);
            match op {
                Opcode::LRef => Insn::LRef(d, o),
                Opcode::LRefPush => Insn::LRefPush(d, o),
                _ => Insn::LSet(d, o),
            }
        }

        Opcode::LocalEnvJump => {
            ops.count(2, 2)?;
            Insn::LocalEnvJump(ops.index(1)?, ops.label(2)?)
        }

        Opcode::GRef | Opcode::GRefPush | Opcode::GSet => {
            ops.count(1, 1)?;
            let g = GlobalRef::new(&ops.symbol(1)?);
            match op {
                Opcode::GRef => Insn::GRef(g),
                Opcode::GRefPush => Insn::GRefPush(g),
                _ => Insn::GSet(g),
            }
        }

        Opcode::GRefCall | Opcode::GRefTailCall => {
            ops.count(2, 2)?;
            let g = GlobalRef::new(&ops.symbol(1)?);
            let n = ops.index(2)?;
            match op {
                Opcode::GRefCall => Insn::GRefCall(g, n),
                _ => Insn::GRefTailCall(g, n),
            }
        }

        Opcode::Define => {
            ops.count(1, 2)?;
            if parts.len() == 3 && !ops.flag(2, "const") {
                return Err(ops.error("only const may follow the name"));
            }
            Insn::Define {
                name: ops.symbol(1)?,
                constant: ops.flag(2, "const"),
            }
        }

        Opcode::Closure => {
            ops.count(1, 1)?;
            Insn::Closure(assemble_form(ops.get(1)?)?)
        }

        Opcode::Receive => {
            ops.count(2, 3)?;
            let rest = ops.flag(2, "rest");
            if parts.len() == 4 && !rest {
                return Err(ops.error("only rest may follow the count"));
            }
            Insn::Receive {
                required: ops.index(1)?,
                rest,
                cont: ops.label(parts.len() - 1)?,
            }
        }

        Opcode::TailReceive => {
            ops.count(1, 2)?;
            let rest = ops.flag(2, "rest");
            if parts.len() == 3 && !rest {
                return Err(ops.error("only rest may follow the count"));
            }
            Insn::TailReceive {
                required: ops.index(1)?,
                rest,
            }
        }

        Opcode::ConstApply => {
            ops.count(2, 2)?;
            let n = ops.index(1)?;
            match ops.get(2)?.list_to_vec() {
                Some(mut items) if items.len() == n + 1 => {
                    let proc_ = items.remove(0);
                    Insn::ConstApply { proc_, args: items }
                }
                _ => return Err(ops.error("form must hold a procedure and its arguments")),
            }
        }

        Opcode::NumAddI => {
            ops.count(1, 1)?;
            Insn::NumAddI(ops.int(1)?)
        }
    };
    Ok(insn)
}

fn nullary(ops: &Operands, insn: Insn) -> Result<Insn, VmError> {
    ops.count(0, 0)?;
    Ok(insn)
}
