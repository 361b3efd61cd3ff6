// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/stdenv.rs

// Native procedures, which are part of the standard environment and
// are bound in the base module of every context.

// <>

use super::error::{ConditionKind, VmResult};
use super::symtab::Module;
use super::value::Value;
use super::{Vm, MAX_VALUES};

/// Native procedure signature used by the standard table
pub type StdFn = fn(&mut Vm, &[Value]) -> VmResult<Value>;

/// Generates a slice of native procedures along with their names,
/// required argument counts and whether they take a rest list
///
/// The syntax is close to that of regular functions but eases access
/// to arguments in the body. Named arguments bind the leading
/// positions; the whole argument slice is also in scope. The call
/// protocol checks arity before a body runs.
macro_rules! native_fn {
    ( const $array:ident; $vm:ident $all:ident;
      $( $name:literal $argct:literal $rest:literal [ $($args:ident),* ] $body:block )+
    ) => {
        #[allow(unused_variables, unused_assignments, unused_mut)]
        pub const $array: &[(&str, usize, bool, StdFn)] =
            &[$(($name, $argct, $rest,
                 |$vm: &mut Vm, $all: &[Value]| -> VmResult<Value> {
                    let mut _ind = 0;
                    $(
                        let $args = &$all[_ind];
                        _ind += 1;
                    )*

                    $body
                })),+];
    };
}

native_fn! {
    const STDFNS;
    vm args;

    "+" 0 true [] {
        let mut sum: i64 = 0;
        for a in args {
            let n = int_arg(vm, a)?;
            sum = checked(vm, sum.checked_add(n))?;
        }
        Ok(Value::Int(sum))
    }

    "-" 1 true [fst] {
        let first = int_arg(vm, fst)?;
        if args.len() == 1 {
            return Ok(Value::Int(checked(vm, first.checked_neg())?));
        }
        let mut out = first;
        for a in &args[1..] {
            let n = int_arg(vm, a)?;
            out = checked(vm, out.checked_sub(n))?;
        }
        Ok(Value::Int(out))
    }

    "*" 0 true [] {
        let mut prod: i64 = 1;
        for a in args {
            let n = int_arg(vm, a)?;
            prod = checked(vm, prod.checked_mul(n))?;
        }
        Ok(Value::Int(prod))
    }

    "=" 2 true [] {
        compare(vm, args, |a, b| a == b)
    }

    "<" 2 true [] {
        compare(vm, args, |a, b| a < b)
    }

    "car" 1 false [pair] {
        match pair.car() {
            Some(v) => Ok(v.clone()),
            None => Err(vm.wrong_type("pair", pair)),
        }
    }

    "cdr" 1 false [pair] {
        match pair.cdr() {
            Some(v) => Ok(v.clone()),
            None => Err(vm.wrong_type("pair", pair)),
        }
    }

    "cons" 2 false [car, cdr] {
        Ok(Value::cons(car.clone(), cdr.clone()))
    }

    "list" 0 true [] {
        Ok(Value::list(args.iter().cloned()))
    }

    "null?" 1 false [obj] {
        Ok(Value::Bool(obj.is_null()))
    }

    "not" 1 false [obj] {
        Ok(Value::Bool(!obj.is_true()))
    }

    "eq?" 2 false [a, b] {
        Ok(Value::Bool(a.is_eq(b)))
    }

    "equal?" 2 false [a, b] {
        Ok(Value::Bool(a == b))
    }

    "vector" 0 true [] {
        Ok(Value::vector(args.to_vec()))
    }

    "vector-ref" 2 false [vec, idx] {
        let items = match vec {
            Value::Vector(items) => items.clone(),
            other => return Err(vm.wrong_type("vector", other)),
        };
        let k = int_arg(vm, idx)?;
        let found = usize::try_from(k).ok().and_then(|k| items.borrow().get(k).cloned());
        match found {
            Some(v) => Ok(v),
            None => Err(vm.error(
                ConditionKind::IndexOutOfRange,
                format!("vector index out of range: {}", k),
            )),
        }
    }

    "vector-length" 1 false [vec] {
        match vec {
            Value::Vector(items) => Ok(Value::Int(items.borrow().len() as i64)),
            other => Err(vm.wrong_type("vector", other)),
        }
    }

    "values" 0 true [] {
        if args.len() >= MAX_VALUES {
            return Err(vm.error(ConditionKind::TooManyValues, "values got too many args"));
        }
        vm.num_vals = args.len();
        match args.split_first() {
            Some((first, rest)) => {
                vm.vals = rest.to_vec();
                Ok(first.clone())
            }
            None => Ok(Value::Undefined),
        }
    }

    "call/cc" 1 false [proc_] {
        vm.call_cc(proc_)
    }

    "call-with-current-continuation" 1 false [proc_] {
        vm.call_cc(proc_)
    }

    "dynamic-wind" 3 false [before, body, after] {
        Ok(vm.dynamic_wind(before.clone(), body.clone(), after.clone()))
    }

    "with-error-handler" 2 false [handler, thunk] {
        Ok(vm.with_error_handler(handler.clone(), thunk.clone()))
    }

    "with-exception-handler" 2 false [handler, thunk] {
        Ok(vm.with_exception_handler(handler.clone(), thunk.clone()))
    }

    "raise" 1 false [obj] {
        vm.throw_exception(obj.clone())
    }

    "error" 1 true [msg] {
        let text = match msg {
            Value::Str(s) => s.to_string(),
            other => other.to_string(),
        };
        Err(vm.error_with(&text, args[1..].to_vec()))
    }

    "apply" 1 true [proc_] {
        let mut spread = args[1..].to_vec();
        if let Some(last) = spread.pop() {
            match last.list_to_vec() {
                Some(tail) => spread.extend(tail),
                None => return Err(vm.wrong_type("proper list", &last)),
            }
        }
        Ok(vm.vm_apply(proc_, &spread))
    }

    "condition-type" 1 false [obj] {
        match obj {
            Value::Condition(c) => Ok(Value::sym(c.kind.type_name())),
            other => Err(vm.wrong_type("condition", other)),
        }
    }

    "condition-message" 1 false [obj] {
        match obj {
            Value::Condition(c) => Ok(Value::string(&c.message)),
            other => Err(vm.wrong_type("condition", other)),
        }
    }

    "print" 0 true [] {
        let line: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        println!("{}", line.join(" "));
        Ok(Value::Undefined)
    }

    "gc" 0 false [] {
        Ok(Value::Int(vm.collect_garbage() as i64))
    }
}

/// Binds every standard procedure in `module`
pub fn install(module: &Module) {
    for (name, required, rest, func) in STDFNS {
        module.define(name, Value::subr(name, *required, *rest, *func));
    }
}

fn int_arg(vm: &mut Vm, v: &Value) -> VmResult<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        other => Err(vm.wrong_type("integer", other)),
    }
}

fn checked(vm: &mut Vm, v: Option<i64>) -> VmResult<i64> {
    match v {
        Some(v) => Ok(v),
        None => Err(vm.error(ConditionKind::Error, "integer overflow")),
    }
}

fn compare(vm: &mut Vm, args: &[Value], op: fn(i64, i64) -> bool) -> VmResult<Value> {
    let mut nums = Vec::with_capacity(args.len());
    for a in args {
        nums.push(int_arg(vm, a)?);
    }
    Ok(Value::Bool(nums.windows(2).all(|w| op(w[0], w[1]))))
}

#[cfg(test)]
mod tests {
    use super::super::error::VmError;
    use super::super::VmConfig;
    use super::*;

    fn quiet_vm() -> Vm {
        Vm::new(VmConfig::default().with_report_to_stderr(false))
    }

    fn call(vm: &mut Vm, name: &str, args: &[Value]) -> Result<Value, VmError> {
        let f = vm.module().get(name).unwrap();
        vm.apply(&f, args)
    }

    #[test]
    fn installed() {
        let m = Module::new("base");
        install(&m);
        assert_eq!(m.len(), STDFNS.len());
        assert!(m.get("call/cc").is_some());
        assert_eq!(m.get("car").unwrap().to_string(), "#<subr car>");
    }

    #[test]
    fn table_arities() {
        let arity = |name: &str| {
            STDFNS
                .iter()
                .find(|(n, ..)| *n == name)
                .map(|(_, required, rest, _)| (*required, *rest))
        };
        assert_eq!(arity("car"), Some((1, false)));
        assert_eq!(arity("-"), Some((1, true)));
        assert_eq!(arity("dynamic-wind"), Some((3, false)));
        assert_eq!(arity("nope"), None);

        let mut vm = quiet_vm();
        let (_, _, _, cons) = STDFNS.iter().find(|(n, ..)| *n == "cons").unwrap();
        let pair = cons(&mut vm, &[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(pair.to_string(), "(1 . 2)");
    }

    #[test]
    fn arithmetic() {
        let mut vm = quiet_vm();
        let ints = |ns: &[i64]| ns.iter().map(|&n| Value::Int(n)).collect::<Vec<_>>();
        assert_eq!(call(&mut vm, "+", &[]).unwrap(), Value::Int(0));
        assert_eq!(call(&mut vm, "+", &ints(&[1, 2, 3])).unwrap(), Value::Int(6));
        assert_eq!(call(&mut vm, "-", &ints(&[5])).unwrap(), Value::Int(-5));
        assert_eq!(call(&mut vm, "-", &ints(&[10, 3, 2])).unwrap(), Value::Int(5));
        assert_eq!(call(&mut vm, "*", &ints(&[2, 3, 4])).unwrap(), Value::Int(24));
        assert_eq!(call(&mut vm, "<", &ints(&[1, 2, 3])).unwrap(), Value::Bool(true));
        assert_eq!(call(&mut vm, "=", &ints(&[1, 1, 2])).unwrap(), Value::Bool(false));

        match call(&mut vm, "+", &[Value::Int(1), Value::sym("a")]) {
            Err(VmError::Uncaught { message, .. }) => {
                assert_eq!(message, "integer required, but got a")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(call(&mut vm, "*", &ints(&[i64::MAX, 2])).is_err());
    }

    #[test]
    fn lists_and_vectors() {
        let mut vm = quiet_vm();
        let l = call(&mut vm, "list", &[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(call(&mut vm, "car", &[l.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call(&mut vm, "cdr", &[l.clone()]).unwrap().to_string(), "(2)");
        assert_eq!(
            call(&mut vm, "equal?", &[l.clone(), Value::list(vec![Value::Int(1), Value::Int(2)])])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(call(&mut vm, "null?", &[Value::Nil]).unwrap(), Value::Bool(true));

        let v = call(&mut vm, "vector", &[Value::Int(7), Value::Int(8)]).unwrap();
        assert_eq!(call(&mut vm, "vector-ref", &[v.clone(), Value::Int(1)]).unwrap(), Value::Int(8));
        assert_eq!(call(&mut vm, "vector-length", &[v.clone()]).unwrap(), Value::Int(2));
        match call(&mut vm, "vector-ref", &[v, Value::Int(2)]) {
            Err(VmError::Uncaught { type_name, .. }) => assert_eq!(type_name, "index-out-of-range"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn values_and_apply() {
        let mut vm = quiet_vm();
        let v = call(&mut vm, "values", &[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(v, Value::Int(1));
        assert_eq!(vm.results(), vec![Value::Int(1), Value::Int(2)]);

        let plus = vm.module().get("+").unwrap();
        let v = call(
            &mut vm,
            "apply",
            &[plus, Value::Int(1), Value::list(vec![Value::Int(2), Value::Int(3)])],
        )
        .unwrap();
        assert_eq!(v, Value::Int(6));
        assert_eq!(vm.results(), vec![Value::Int(6)]);
    }

    #[test]
    fn user_errors() {
        let mut vm = quiet_vm();
        match call(&mut vm, "error", &[Value::string("bad input:"), Value::Int(3)]) {
            Err(VmError::Uncaught { type_name, message, .. }) => {
                assert_eq!(type_name, "error");
                assert_eq!(message, "bad input: 3");
            }
            other => panic!("unexpected {:?}", other),
        }
        match call(&mut vm, "raise", &[Value::sym("boom")]) {
            Err(VmError::Uncaught { type_name, .. }) => assert_eq!(type_name, "raised-object"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
