// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// Execution core for Sail: a stack machine with first-class
// continuations, multiple values, tail calls and dynamic-extent
// handlers.

// <>

pub mod vm;

pub use vm::asm::{assemble, assemble_all};
pub use vm::code::{CompiledCode, Insn};
pub use vm::error::{ConditionKind, VmError};
pub use vm::thread::{spawn_worker, Worker};
pub use vm::value::Value;
pub use vm::{Vm, VmConfig};
