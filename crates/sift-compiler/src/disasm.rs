//! Human-readable rendering of compiled bytecode. Used by tests and
//! debugging sessions; the output format is not a stable interface.

use std::fmt::Write;

use hashbrown::HashSet;

use crate::bytecode::{Bytecode, Globals, Program, NEW_CLOSURE};
use crate::ops::Op;

/// Disassemble a whole program, main function first, then every nested
/// function depth-first.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    disasm_func(&mut out, &program.main, &program.globals, "main");
    out
}

fn disasm_func(out: &mut String, bc: &Bytecode, globals: &Globals, label: &str) {
    writeln!(out, "== {label} ==").unwrap();

    let targets = branch_targets(&bc.code);
    let code = &bc.code;
    let mut pc = 0usize;
    while pc < code.len() {
        let marker = if targets.contains(&(pc as u32)) {
            '>'
        } else {
            ' '
        };
        let Some(op) = Op::from_u16(code[pc]) else {
            writeln!(out, "{marker}{pc:04}  UNKNOWN({:#06x})", code[pc]).unwrap();
            pc += 1;
            continue;
        };
        let name = op.name();

        match op {
            Op::Call => {
                let argc = code[pc + 1] as usize;
                let level = code[pc + 2];
                let index = code[pc + 3];
                write!(out, "{marker}{pc:04}  {name:<13} {argc} {}", closure_operand(level, index))
                    .unwrap();
                for i in 0..argc {
                    let level = code[pc + 4 + 2 * i];
                    let index = code[pc + 5 + 2 * i];
                    write!(out, " {}", closure_operand(level, index)).unwrap();
                }
                writeln!(out).unwrap();
                pc += 4 + 2 * argc;
            }
            Op::CallNative => {
                let argc = code[pc + 1];
                let index = code[pc + 2] as usize;
                let native = globals
                    .native_names
                    .get(index)
                    .map(String::as_str)
                    .unwrap_or("?");
                writeln!(out, "{marker}{pc:04}  {name:<13} {argc} {index} ; {native}").unwrap();
                pc += 3;
            }
            _ if op.has_constant() => {
                let index = code[pc + 1] as usize;
                let val = &bc.constants[index];
                writeln!(out, "{marker}{pc:04}  {name:<13} {index} ; {val}").unwrap();
                pc += 2;
            }
            _ if op.has_variable() => {
                let level = code[pc + 1];
                let index = code[pc + 2] as usize;
                let local = if level == 0 {
                    bc.debuginfo.locals.get(index).map(String::as_str)
                } else {
                    None
                };
                match local {
                    Some(local) => {
                        writeln!(out, "{marker}{pc:04}  {name:<13} {level} {index} ; ${local}")
                            .unwrap()
                    }
                    None => writeln!(out, "{marker}{pc:04}  {name:<13} {level} {index}").unwrap(),
                }
                pc += 3;
            }
            _ if op.has_branch() => {
                let target = pc + 2 + code[pc + 1] as usize;
                writeln!(out, "{marker}{pc:04}  {name:<13} -> {target:04}").unwrap();
                pc += 2;
            }
            _ => {
                writeln!(out, "{marker}{pc:04}  {name}").unwrap();
                pc += 1;
            }
        }
    }

    for (i, sub) in bc.subfunctions.iter().enumerate() {
        let sub_name = sub.debuginfo.name.as_deref().unwrap_or("@anon");
        disasm_func(out, sub, globals, &format!("{label}/{i} {sub_name}"));
    }
}

/// Word positions branch instructions land on.
fn branch_targets(code: &[u16]) -> HashSet<u32> {
    let mut targets = HashSet::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let Some(op) = Op::from_u16(code[pc]) else {
            pc += 1;
            continue;
        };
        if op.has_branch() {
            targets.insert((pc + 2 + code[pc + 1] as usize) as u32);
        }
        pc += encoded_len(op, code, pc);
    }
    targets
}

fn encoded_len(op: Op, code: &[u16], pc: usize) -> usize {
    match op {
        Op::Call => 4 + 2 * code[pc + 1] as usize,
        other => other.describe().length.max(1) as usize,
    }
}

fn closure_operand(level: u16, index: u16) -> String {
    if index & NEW_CLOSURE != 0 {
        format!("new({level}:{})", index & !NEW_CLOSURE)
    } else {
        format!("param({level}:{index})")
    }
}
