// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/symtab.rs

// A table associating global names with binding cells. Cells are
// stable for the life of the table, so code may keep a resolved cell
// and skip later lookups.

// <>

use super::value::Value;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Binding cell for one global name
#[derive(Debug)]
pub struct Gloc {
    pub name: Rc<str>,
    value: RefCell<Option<Value>>,
    constant: Cell<bool>,
}

/// Attempted assignment to a constant binding
#[derive(Debug, PartialEq, Eq)]
pub struct ConstantBinding;

impl Gloc {
    fn new(name: Rc<str>) -> Self {
        Self {
            name,
            value: RefCell::new(None),
            constant: Cell::new(false),
        }
    }

    /// Current value; None while unbound
    pub fn get(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Value) -> Result<(), ConstantBinding> {
        if self.constant.get() {
            return Err(ConstantBinding);
        }
        *self.value.borrow_mut() = Some(value);
        Ok(())
    }

    pub fn is_constant(&self) -> bool {
        self.constant.get()
    }
}

/// Global binding scope, optionally inheriting from a parent
pub struct Module {
    pub name: Rc<str>,
    table: RefCell<HashMap<Rc<str>, Rc<Gloc>>>,
    parent: Option<Rc<Module>>,
}

impl Module {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(name),
            table: RefCell::new(HashMap::with_capacity(256)),
            parent: None,
        })
    }

    pub fn with_parent(name: &str, parent: Rc<Module>) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(name),
            table: RefCell::new(HashMap::new()),
            parent: Some(parent),
        })
    }

    /// Finds the cell for a name here or in any ancestor
    pub fn lookup(&self, name: &str) -> Option<Rc<Gloc>> {
        if let Some(gloc) = self.table.borrow().get(name) {
            return Some(gloc.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Value bound to a name, if bound anywhere in scope
    pub fn get(&self, name: &str) -> Option<Value> {
        self.lookup(name).and_then(|g| g.get())
    }

    /// Binds a name in this module, reusing its cell if one exists
    pub fn define(&self, name: &str, value: Value) -> Rc<Gloc> {
        let gloc = self.local_cell(name);
        gloc.constant.set(false);
        *gloc.value.borrow_mut() = Some(value);
        gloc
    }

    pub fn define_const(&self, name: &str, value: Value) -> Rc<Gloc> {
        let gloc = self.local_cell(name);
        *gloc.value.borrow_mut() = Some(value);
        gloc.constant.set(true);
        gloc
    }

    fn local_cell(&self, name: &str) -> Rc<Gloc> {
        let mut table = self.table.borrow_mut();
        if let Some(gloc) = table.get(name) {
            return gloc.clone();
        }
        let key: Rc<str> = Rc::from(name);
        let gloc = Rc::new(Gloc::new(key.clone()));
        table.insert(key, gloc.clone());
        gloc
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }
}
