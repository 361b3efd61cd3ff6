// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/value.rs

// Value representation for the Sail virtual machine. Immediates,
// pairs, vectors, procedures of every calling kind, conditions, and
// slotted instances with optional accessor procedures.

// <>

use super::code::CompiledCode;
use super::error::{Condition, VmResult};
use super::frame::HeapEnv;
use super::Vm;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Native procedure body; receives the raw argument slots
pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> VmResult<Value>>;

/// Native method body; receives the arguments and the next-method value
pub type MethodFn = Rc<dyn Fn(&mut Vm, &[Value], &Value) -> VmResult<Value>>;

/// Any value manipulated by the evaluator
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Nil,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Sym(Rc<str>),
    Pair(Rc<Pair>),
    Vector(Rc<RefCell<Vec<Value>>>),
    Proc(Rc<Procedure>),
    Condition(Rc<Condition>),
    Instance(Rc<Instance>),
}

pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

impl Value {
    pub fn cons(car: Value, cdr: Value) -> Self {
        Value::Pair(Rc::new(Pair { car, cdr }))
    }

    pub fn sym(name: &str) -> Self {
        Value::Sym(Rc::from(name))
    }

    pub fn string(text: &str) -> Self {
        Value::Str(Rc::from(text))
    }

    pub fn vector(items: Vec<Value>) -> Self {
        Value::Vector(Rc::new(RefCell::new(items)))
    }

    pub fn procedure(p: Procedure) -> Self {
        Value::Proc(Rc::new(p))
    }

    /// Wraps a Rust closure as a primitive procedure value
    pub fn subr<F>(name: &str, required: usize, rest: bool, func: F) -> Self
    where
        F: Fn(&mut Vm, &[Value]) -> VmResult<Value> + 'static,
    {
        Value::procedure(Procedure::Subr(Subr {
            name: Rc::from(name),
            required,
            rest,
            func: Rc::new(func),
        }))
    }

    /// Builds a proper list from the given items
    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self::list_with_tail(items, Value::Nil)
    }

    pub fn list_with_tail<I>(items: I, tail: Value) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Value::cons(item, acc))
    }

    /// Collects the elements of a proper list; None for anything else
    pub fn list_to_vec(&self) -> Option<Vec<Value>> {
        let mut out = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Value::Nil => return Some(out),
                Value::Pair(p) => {
                    out.push(p.car.clone());
                    cur = &p.cdr;
                }
                _ => return None,
            }
        }
    }

    pub fn car(&self) -> Option<&Value> {
        match self {
            Value::Pair(p) => Some(&p.car),
            _ => None,
        }
    }

    pub fn cdr(&self) -> Option<&Value> {
        match self {
            Value::Pair(p) => Some(&p.cdr),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<&Rc<Procedure>> {
        match self {
            Value::Proc(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        !matches!(self, Value::Bool(false))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Conditions are non-continuable; any other raised object is
    pub fn is_serious(&self) -> bool {
        matches!(self, Value::Condition(_))
    }

    /// Identity comparison
    pub fn is_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Sym(a), Value::Sym(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Condition(a), Value::Condition(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Strong reference count of a heap value; immediates have none
    pub fn ref_count(&self) -> Option<usize> {
        match self {
            Value::Str(s) | Value::Sym(s) => Some(Rc::strong_count(s)),
            Value::Pair(p) => Some(Rc::strong_count(p)),
            Value::Vector(v) => Some(Rc::strong_count(v)),
            Value::Proc(p) => Some(Rc::strong_count(p)),
            Value::Condition(c) => Some(Rc::strong_count(c)),
            Value::Instance(i) => Some(Rc::strong_count(i)),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Undefined => TypeTag::Undefined,
            Value::Nil => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Str(_) => TypeTag::Str,
            Value::Sym(_) => TypeTag::Sym,
            Value::Pair(_) => TypeTag::Pair,
            Value::Vector(_) => TypeTag::Vector,
            Value::Proc(_) => TypeTag::Proc,
            Value::Condition(_) => TypeTag::Condition,
            Value::Instance(i) => TypeTag::Class(i.class.name.clone()),
        }
    }
}

/// Structural equality, used by `equal?` and by tests
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => a.car == b.car && a.cdr == b.cdr,
            (Value::Vector(a), Value::Vector(b)) => *a.borrow() == *b.borrow(),
            _ => self.is_eq(other),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "#<undef>"),
            Value::Nil => write!(f, "()"),
            Value::Bool(true) => write!(f, "#t"),
            Value::Bool(false) => write!(f, "#f"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", &**s),
            Value::Sym(s) => write!(f, "{}", s),
            Value::Pair(p) => {
                write!(f, "({}", p.car)?;
                let mut cur = &p.cdr;
                loop {
                    match cur {
                        Value::Nil => break,
                        Value::Pair(q) => {
                            write!(f, " {}", q.car)?;
                            cur = &q.cdr;
                        }
                        other => {
                            write!(f, " . {}", other)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Value::Vector(v) => {
                write!(f, "#(")?;
                for (i, item) in v.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Proc(p) => write!(f, "{}", p),
            Value::Condition(c) => write!(f, "#<{} {:?}>", c.kind.type_name(), c.message),
            Value::Instance(i) => write!(f, "#<{}>", i.class.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Every kind of applicable object
pub enum Procedure {
    Subr(Subr),
    Closure(Closure),
    Generic(Generic),
    Method(Rc<Method>),
    NextMethod(NextMethod),
}

pub struct Subr {
    pub name: Rc<str>,
    pub required: usize,
    pub rest: bool,
    pub func: NativeFn,
}

pub struct Closure {
    pub code: Rc<CompiledCode>,
    pub env: Option<Rc<HeapEnv>>,
}

impl Procedure {
    pub fn name(&self) -> &str {
        match self {
            Procedure::Subr(s) => &s.name,
            Procedure::Closure(c) => &c.code.name,
            Procedure::Generic(g) => &g.name,
            Procedure::Method(m) => &m.name,
            Procedure::NextMethod(_) => "next-method",
        }
    }

    /// Whether a call with `argc` arguments passes the arity check
    pub fn accepts(&self, argc: usize) -> bool {
        let (required, rest) = match self {
            Procedure::Subr(s) => (s.required, s.rest),
            Procedure::Closure(c) => (c.code.required, c.code.rest),
            Procedure::Method(m) => (m.required, m.rest),
            Procedure::Generic(_) | Procedure::NextMethod(_) => return true,
        };
        argc == required || (rest && argc > required)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Subr(s) => write!(f, "#<subr {}>", s.name),
            Procedure::Closure(c) => write!(f, "#<closure {}>", c.code.name),
            Procedure::Generic(g) => {
                write!(f, "#<generic {} ({})>", g.name, g.methods.borrow().len())
            }
            Procedure::Method(m) => write!(f, "#<method {}>", m.name),
            Procedure::NextMethod(_) => write!(f, "#<next-method>"),
        }
    }
}

/// Generic function; a set of methods and a fallback for no match
pub struct Generic {
    pub name: Rc<str>,
    pub methods: RefCell<Vec<Rc<Method>>>,
    pub fallback: NativeFn,
}

impl Generic {
    pub fn new(name: &str) -> Self {
        let owner: Rc<str> = Rc::from(name);
        let label = owner.clone();
        Self {
            name: owner,
            methods: RefCell::new(Vec::new()),
            fallback: Rc::new(move |vm: &mut Vm, args: &[Value]| {
                Err(vm.error(
                    super::error::ConditionKind::Error,
                    format!(
                        "no applicable method for {} with arguments {}",
                        label,
                        Value::list(args.to_vec())
                    ),
                ))
            }),
        }
    }

    pub fn with_fallback(name: &str, fallback: NativeFn) -> Self {
        Self {
            name: Rc::from(name),
            methods: RefCell::new(Vec::new()),
            fallback,
        }
    }

    /// Adds a method, replacing one with identical specializers
    pub fn add_method(&self, method: Rc<Method>) {
        let mut methods = self.methods.borrow_mut();
        methods.retain(|m| m.specializers != method.specializers || m.rest != method.rest);
        methods.push(method);
    }
}

pub enum MethodBody {
    Native(MethodFn),
    /// Bytecode receiving the next-method value after its arguments
    Code {
        code: Rc<CompiledCode>,
        env: Option<Rc<HeapEnv>>,
    },
}

pub struct Method {
    pub name: Rc<str>,
    pub specializers: Vec<TypeTag>,
    pub required: usize,
    pub rest: bool,
    pub body: MethodBody,
}

impl Method {
    pub fn native<F>(name: &str, specializers: Vec<TypeTag>, rest: bool, func: F) -> Rc<Self>
    where
        F: Fn(&mut Vm, &[Value], &Value) -> VmResult<Value> + 'static,
    {
        Rc::new(Self {
            name: Rc::from(name),
            required: specializers.len(),
            specializers,
            rest,
            body: MethodBody::Native(Rc::new(func)),
        })
    }

    pub fn with_code(specializers: Vec<TypeTag>, code: Rc<CompiledCode>) -> Rc<Self> {
        Rc::new(Self {
            name: code.name.clone(),
            required: specializers.len(),
            rest: code.rest,
            specializers,
            body: MethodBody::Code { code, env: None },
        })
    }
}

/// Remaining applicable methods of one generic invocation
pub struct NextMethod {
    /// Runs when no methods remain
    pub fallback: Option<NativeFn>,
    pub methods: Vec<Rc<Method>>,
    pub args: Vec<Value>,
}

impl NextMethod {
    pub fn new(fallback: Option<NativeFn>, methods: Vec<Rc<Method>>, args: Vec<Value>) -> Value {
        Value::procedure(Procedure::NextMethod(NextMethod {
            fallback,
            methods,
            args,
        }))
    }
}

/// Type specializer used for method applicability and ordering
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Top,
    Undefined,
    Nil,
    Bool,
    Int,
    Str,
    Sym,
    Pair,
    Vector,
    Proc,
    Condition,
    /// Any instance, regardless of class
    Instance,
    Class(Rc<str>),
}

impl TypeTag {
    pub fn matches(&self, v: &Value) -> bool {
        match self {
            TypeTag::Top => true,
            TypeTag::Instance => matches!(v, Value::Instance(_)),
            tag => *tag == v.type_tag(),
        }
    }

    /// Larger is more specific
    pub fn specificity(&self) -> u8 {
        match self {
            TypeTag::Top => 0,
            TypeTag::Instance => 1,
            _ => 2,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "top" => TypeTag::Top,
            "undefined" => TypeTag::Undefined,
            "null" => TypeTag::Nil,
            "boolean" => TypeTag::Bool,
            "integer" => TypeTag::Int,
            "string" => TypeTag::Str,
            "symbol" => TypeTag::Sym,
            "pair" => TypeTag::Pair,
            "vector" => TypeTag::Vector,
            "procedure" => TypeTag::Proc,
            "condition" => TypeTag::Condition,
            "instance" => TypeTag::Instance,
            other => TypeTag::Class(Rc::from(other)),
        }
    }
}

/// A slot description; accessor procedures run as tail calls
pub struct SlotDef {
    pub name: Rc<str>,
    pub getter: Option<Value>,
    pub setter: Option<Value>,
}

impl SlotDef {
    pub fn plain(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            getter: None,
            setter: None,
        }
    }
}

pub struct Class {
    pub name: Rc<str>,
    pub slots: Vec<SlotDef>,
}

impl Class {
    pub fn new(name: &str, slots: Vec<SlotDef>) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(name),
            slots,
        })
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| &*s.name == name)
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    pub slots: RefCell<Vec<Value>>,
}

impl Instance {
    pub fn new(class: &Rc<Class>) -> Value {
        Value::Instance(Rc::new(Self {
            class: class.clone(),
            slots: RefCell::new(vec![Value::Undefined; class.slots.len()]),
        }))
    }
}
