// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Command line driver: runs or disassembles listing files, or checks
// that the stack stays balanced across calls and migrations.

// <>

use sail_vm::{assemble, assemble_all, Value, Vm, VmConfig, VmError};

use std::env;
use std::fs;
use std::process;

/// Exit status for an uncaught condition
const EXIT_UNCAUGHT: i32 = 70;

fn main() {
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init()
    {
        eprintln!("logger unavailable: {}", e);
    }

    // sail-vm <file> runs every listing in a file
    // sail-vm dis <file> prints the disassembly
    // sail-vm selftest checks stack balance
    let args: Vec<String> = env::args().collect();
    let out = match args.get(1).map(String::as_str) {
        Some("dis") if args.len() >= 3 => disassemble(&args[2]),
        Some("selftest") => selftest(),
        Some(file) => run_file(file),
        None => {
            eprintln!("usage: sail-vm <file> | sail-vm dis <file> | sail-vm selftest");
            process::exit(2);
        }
    };

    if let Err(e) = out {
        match &e {
            VmError::Uncaught { report, .. } if !report.is_empty() => {}
            _ => eprintln!("{}", e),
        }
        process::exit(match e {
            VmError::Uncaught { .. } => EXIT_UNCAUGHT,
            _ => 1,
        });
    }
}

fn run_file(path: &str) -> Result<(), VmError> {
    let text = fs::read_to_string(path)?;
    let mut vm = Vm::new(VmConfig::default());

    let mut last = Value::Undefined;
    for code in assemble_all(&text)? {
        last = match vm.evaluate(code) {
            Ok(v) => v,
            Err(e) => {
                vm.cleanup();
                return Err(e);
            }
        };
    }
    vm.cleanup();

    let results = vm.results();
    match results.len() {
        0 => {}
        1 => println!("{}", last),
        _ => {
            let shown: Vec<String> = results.iter().map(Value::to_string).collect();
            println!("{}", shown.join("\n"));
        }
    }
    Ok(())
}

fn disassemble(path: &str) -> Result<(), VmError> {
    let text = fs::read_to_string(path)?;
    for code in assemble_all(&text)? {
        print!("{}", code.disassemble());
    }
    Ok(())
}

/// Runs a recursion deep enough to migrate frames several times, a long
/// tail loop, and a handled error, checking the stack each time
fn selftest() -> Result<(), VmError> {
    let checks = [
        (
            "deep recursion",
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
               (const-push 5000)
               (gref-tail-call sum 1))",
            Value::Int(12502500),
        ),
        (
            "tail loop",
            "(code top 0
               (const-push 0) (local-env 1)
               loop
               (lref-push 0 0) (const 100000) (num-eq2) (bf next)
               (const-ret done)
               next
               (lref 0 0) (num-addi 1) (push)
               (local-env-jump 1 loop))",
            Value::sym("done"),
        ),
        (
            "handled error",
            "(code top 0
               (closure (code handler 1 (const-ret handled)))
               (push)
               (closure (code thunk 0 (const-push 1) (const a) (num-add2) (ret)))
               (push)
               (gref-tail-call with-error-handler 2))",
            Value::sym("handled"),
        ),
    ];

    let mut vm = Vm::new(VmConfig::default().with_stack_size(256).with_report_to_stderr(false));
    for (name, text, expected) in checks {
        let got = vm.evaluate(assemble(text)?)?;
        let sp = vm.stack_pointer();
        if got != expected || sp != 0 {
            eprintln!("{}: FAILED, got {} with stack pointer {}", name, got, sp);
            eprintln!("{}", vm.dump());
            process::exit(1);
        }
        println!("{}: ok ({} migrations so far)", name, vm.stats().migrations);
    }
    println!("{}", vm.dump());
    Ok(())
}
