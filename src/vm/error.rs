// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/error.rs

// Error types for the Sail virtual machine. Conditions raised inside
// the evaluator, the typed non-local exit carried through Rust
// frames, errors surfaced to native callers, and the report printed
// for unhandled conditions.

// <>

use super::cont::EscapePoint;
use super::value::Value;
use super::Vm;

use std::fmt;
use std::rc::Rc;

/// Condition taxonomy raised through the exception protocol
///
/// A refused frame migration and an error escaping while a report is
/// in progress are not conditions; both end in the memory manager's
/// abort hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    WrongArgumentCount,
    UnboundVariable,
    WrongTypeArgument,
    IndexOutOfRange,
    ValuesArityMismatch,
    TooManyValues,
    ContinuationExtentViolation,
    DependencyLoop,
    /// Raised by user code through `error`
    Error,
}

impl ConditionKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ConditionKind::WrongArgumentCount => "wrong-argument-count",
            ConditionKind::UnboundVariable => "unbound-variable",
            ConditionKind::WrongTypeArgument => "wrong-type-argument",
            ConditionKind::IndexOutOfRange => "index-out-of-range",
            ConditionKind::ValuesArityMismatch => "values-arity-mismatch",
            ConditionKind::TooManyValues => "too-many-values",
            ConditionKind::ContinuationExtentViolation => "continuation-extent-violation",
            ConditionKind::DependencyLoop => "dependency-loop",
            ConditionKind::Error => "error",
        }
    }
}

/// A raised condition object
#[derive(Debug)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    pub irritants: Vec<Value>,
}

impl Condition {
    pub fn make(kind: ConditionKind, message: String, irritants: Vec<Value>) -> Value {
        Value::Condition(Rc::new(Self {
            kind,
            message,
            irritants,
        }))
    }

    /// Message followed by the written irritants
    pub fn full_message(&self) -> String {
        let mut out = self.message.clone();
        for irritant in &self.irritants {
            out.push(' ');
            out.push_str(&irritant.to_string());
        }
        out
    }
}

/// Non-local exit travelling up to an evaluator level
pub enum Escape {
    /// Continuation invoked below the level that captured it
    Continuation {
        ep: Rc<EscapePoint>,
        args: Vec<Value>,
    },
    /// Error escape to the installing handler's level, or outward
    Error {
        ep: Option<Rc<EscapePoint>>,
        condition: Value,
    },
}

impl fmt::Debug for Escape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escape::Continuation { ep, args } => write!(
                f,
                "Escape::Continuation(marker {}, {} values)",
                ep.marker,
                args.len()
            ),
            Escape::Error { ep, condition } => write!(
                f,
                "Escape::Error({}, {})",
                ep.as_ref()
                    .map_or("no handler".to_string(), |p| format!("marker {}", p.marker)),
                condition
            ),
        }
    }
}

pub type VmResult<T> = Result<T, Escape>;

/// Errors surfaced to native callers of the evaluator
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("*** {}: {message}", .type_name.to_uppercase())]
    Uncaught {
        type_name: String,
        message: String,
        report: String,
    },
    #[error("continuation escaped past the outermost evaluation")]
    StrayContinuation,
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("assembly error: {message}")]
    Assemble { message: String },
    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmError {
    pub fn assemble(message: impl Into<String>) -> Self {
        VmError::Assemble {
            message: message.into(),
        }
    }
}

/// Type name and message of any raised object
pub fn describe(obj: &Value) -> (String, String) {
    match obj {
        Value::Condition(c) => (c.kind.type_name().to_string(), c.full_message()),
        other => ("raised-object".to_string(), other.to_string()),
    }
}

impl Vm {
    /// Raises a condition of the given kind. The result is always an
    /// escape; a handler can never resume a serious condition.
    pub fn error(&mut self, kind: ConditionKind, message: impl Into<String>) -> Escape {
        let condition = Condition::make(kind, message.into(), vec![]);

        match self.throw_exception(condition) {
            Err(escape) => escape,
            Ok(_) => unreachable!("serious condition was resumed"),
        }
    }

    /// Raises an error condition carrying irritants
    pub fn error_with(&mut self, message: &str, irritants: Vec<Value>) -> Escape {
        let condition = Condition::make(ConditionKind::Error, message.to_string(), irritants);
        match self.throw_exception(condition) {
            Err(escape) => escape,
            Ok(_) => unreachable!("serious condition was resumed"),
        }
    }

    pub(crate) fn wrong_type(&mut self, expected: &str, got: &Value) -> Escape {
        self.error(
            ConditionKind::WrongTypeArgument,
            format!("{} required, but got {}", expected, got),
        )
    }

    /// Reports an unhandled condition, through the installed reporter
    /// if there is one
    pub(crate) fn report_error(&mut self, obj: &Value) -> VmResult<()> {
        if self.flags.error_being_reported {
            self.memory
                .abort("Unhandled error occurred during reporting an error.  Process aborted.");
        }

        self.flags.error_being_reported = true;
        let out = match self.default_escape_handler.clone() {
            Some(reporter) => self.call(&reporter, &[obj.clone()]).map(|_| ()),
            None => {
                let report = self.format_report(obj);
                if self.config.report_to_stderr {
                    eprintln!("{}", report);
                } else {
                    log::error!("{}", report);
                }
                self.last_report = Some(report);
                Ok(())
            }
        };
        self.flags.error_being_reported = false;
        out
    }

    /// Heading with the condition type and message, then a trace
    /// derived from the continuation chain
    pub fn format_report(&self, obj: &Value) -> String {
        let (type_name, message) = describe(obj);
        let mut out = format!("*** {}: {}\n", type_name.to_uppercase(), message);
        out.push_str("Stack Trace:\n");
        out.push_str("_______________________________________\n");
        for line in self.stack_trace() {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// One line per active frame, newest first, limited in depth
    pub fn stack_trace(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut frames = vec![(self.base.clone(), Some(self.pc))];
        let mut cont = self.cont.clone();
        while let Some(c) = cont {
            let view = self.cont_view(&c);
            frames.push((view.base, view.pc));
            cont = view.prev;
        }

        for (depth, (base, pc)) in frames.into_iter().enumerate() {
            if depth >= self.config.trace_depth {
                lines.push("  ...".to_string());
                break;
            }
            let name = base.as_ref().map_or("<native>", |b| &*b.name).to_string();
            let line = match (base, pc) {
                (Some(b), Some(super::code::Pc::At(i))) => b.line_of(i.saturating_sub(1)),
                _ => None,
            };
            match line {
                Some(n) => lines.push(format!("  {:>3}  {} (line {})", depth, name, n)),
                None => lines.push(format!("  {:>3}  {}", depth, name)),
            }
        }
        lines
    }

    /// Readout of the register set, for debugging
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "VM: sp={} argp={} pc={:?} base={}\n",
            self.sp,
            self.argp,
            self.pc,
            self.base.as_ref().map_or("<none>", |b| &*b.name)
        ));
        out.push_str(&format!(
            "    val0={} num_vals={} env={:?} cont={:?}\n",
            self.val0, self.num_vals, self.env, self.cont
        ));
        out.push_str(&format!(
            "    markers={} handlers={} escape_points={}\n",
            self.markers.len(),
            super::wind::chain_len(&self.handlers),
            self.escape_point_depth()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::asm::assemble;
    use super::super::memmgt::{acquire_mem_region, PanickingRegion};
    use super::super::VmConfig;
    use super::*;

    #[test]
    fn names() {
        assert_eq!(ConditionKind::WrongArgumentCount.type_name(), "wrong-argument-count");
        assert_eq!(
            ConditionKind::ContinuationExtentViolation.type_name(),
            "continuation-extent-violation"
        );
    }

    #[test]
    fn describes() {
        let c = Condition::make(ConditionKind::Error, "bad thing:".to_string(), vec![Value::Int(4)]);
        assert_eq!(describe(&c), ("error".to_string(), "bad thing: 4".to_string()));
        assert_eq!(describe(&Value::sym("oops")).0, "raised-object");

        let e = VmError::Uncaught {
            type_name: "error".to_string(),
            message: "x".to_string(),
            report: String::new(),
        };
        assert_eq!(e.to_string(), "*** ERROR: x");
    }

    #[test]
    #[should_panic(expected = "Unhandled error occurred during reporting an error")]
    fn error_in_reporter_is_fatal() {
        let mut vm = Vm::new(VmConfig::default().with_report_to_stderr(false));
        vm.set_memory_manager(Box::new(PanickingRegion(acquire_mem_region(None))));
        vm.set_error_reporter(Some(Value::subr("reporter", 1, false, |vm, _| {
            Err(vm.error(ConditionKind::Error, "reporter broke"))
        })));
        let _ = vm.evaluate(assemble("(code top 0 (const-push 1) (gref-tail-call car 1))").unwrap());
    }
}
