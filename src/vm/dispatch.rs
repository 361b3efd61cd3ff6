// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/dispatch.rs

// Generic function dispatch protocol, and a dispatcher that matches
// methods on the type tags of their arguments.

// <>

use super::value::{Generic, Method, Value};

use std::cmp::Ordering;
use std::rc::Rc;

/// Method selection consulted on every generic call
pub trait MethodDispatch {
    /// Methods of `generic` that accept `args`, in any order
    fn compute_applicable_methods(&self, generic: &Generic, args: &[Value]) -> Vec<Rc<Method>>;

    /// Orders applicable methods, most specific first
    fn sort_methods(&self, methods: Vec<Rc<Method>>, args: &[Value]) -> Vec<Rc<Method>>;
}

/// Dispatch on argument type tags, comparing specializers left to right
pub struct TypeDispatch;

impl MethodDispatch for TypeDispatch {
    fn compute_applicable_methods(&self, generic: &Generic, args: &[Value]) -> Vec<Rc<Method>> {
        generic
            .methods
            .borrow()
            .iter()
            .filter(|m| applicable(m, args))
            .cloned()
            .collect()
    }

    fn sort_methods(&self, mut methods: Vec<Rc<Method>>, _args: &[Value]) -> Vec<Rc<Method>> {
        methods.sort_by(|a, b| more_specific(a, b));
        methods
    }
}

fn applicable(m: &Method, args: &[Value]) -> bool {
    if args.len() < m.required || (!m.rest && args.len() != m.required) {
        return false;
    }
    m.specializers.iter().zip(args).all(|(tag, v)| tag.matches(v))
}

fn more_specific(a: &Method, b: &Method) -> Ordering {
    for (x, y) in a.specializers.iter().zip(&b.specializers) {
        match y.specificity().cmp(&x.specificity()) {
            Ordering::Equal => continue,
            o => return o,
        }
    }
    // a fixed arity beats a rest list
    a.rest.cmp(&b.rest)
}

#[cfg(test)]
mod tests {
    use super::super::value::TypeTag;
    use super::*;

    fn method(name: &str, tags: Vec<TypeTag>, rest: bool) -> Rc<Method> {
        Method::native(name, tags, rest, |_, _, _| Ok(Value::Undefined))
    }

    #[test]
    fn selects_and_orders() {
        let g = Generic::new("area");
        g.add_method(method("any", vec![TypeTag::Top], false));
        g.add_method(method("obj", vec![TypeTag::Instance], false));
        g.add_method(method("shape", vec![TypeTag::from_name("shape")], false));
        g.add_method(method("int", vec![TypeTag::Int], false));

        let class = super::super::value::Class::new("shape", vec![]);
        let shape = super::super::value::Instance::new(&class);

        let d = TypeDispatch;
        let found = d.compute_applicable_methods(&g, &[shape.clone()]);
        assert_eq!(found.len(), 3);
        let names: Vec<_> = d
            .sort_methods(found, &[shape])
            .iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(names, vec!["shape", "obj", "any"]);

        assert_eq!(d.compute_applicable_methods(&g, &[]).len(), 0);
        assert_eq!(d.compute_applicable_methods(&g, &[Value::Int(1), Value::Int(2)]).len(), 0);
    }

    #[test]
    fn rest_methods() {
        let g = Generic::new("sum");
        g.add_method(method("fixed", vec![TypeTag::Int], false));
        g.add_method(method("many", vec![TypeTag::Int], true));

        let d = TypeDispatch;
        let one = d.compute_applicable_methods(&g, &[Value::Int(1)]);
        let names: Vec<_> = d
            .sort_methods(one, &[])
            .iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(names, vec!["fixed", "many"]);

        let two = d.compute_applicable_methods(&g, &[Value::Int(1), Value::Int(2)]);
        assert_eq!(two.len(), 1);
        assert_eq!(&*two[0].name, "many");
    }
}
