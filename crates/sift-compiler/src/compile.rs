//! Call-site expansion and code emission.
//!
//! Compilation runs per function: expand call sites, lay out encoded
//! positions and frame indices, recursively compile nested functions,
//! then emit the 16-bit words. Unresolved symbols are reported and
//! counted; everything else that can go wrong here is a compiler bug and
//! asserts.

use std::rc::Rc;

use sift_core::{resolve, NativeFn, Value};

use crate::block::{Arena, Block, FuncRef, Imm, InstId};
use crate::bytecode::{Bytecode, DebugInfo, Globals, Program, NEW_CLOSURE};
use crate::gen::Import;
use crate::ops::Op;

/// Successful compilation: the bytecode tree plus the import records
/// peeled off the program head.
#[derive(Debug)]
pub struct Compiled {
    pub program: Program,
    pub imports: Vec<Import>,
}

/// The located diagnostics of a failed compilation. Compilation keeps
/// going after an unresolved symbol so one run surfaces as many errors as
/// possible; the partial bytecode is discarded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compilation failed with {} error(s)", .diagnostics.len())]
pub struct CompileErrors {
    pub diagnostics: Vec<String>,
}

impl CompileErrors {
    pub fn count(&self) -> usize {
        self.diagnostics.len()
    }
}

/// Compile a program block against a native-function table.
///
/// Imports are stripped first and returned alongside the bytecode; native
/// and user definitions are bound, unreferenced ones ahead of the `Top`
/// sentinel pruned, and the surviving body compiled recursively.
pub fn compile(
    arena: &mut Arena,
    program: Block,
    natives: &[Rc<NativeFn>],
) -> Result<Compiled, CompileErrors> {
    let mut body = program;
    let imports = arena.take_imports(&mut body);
    let body = arena.gen_natives(natives, body);
    let body = arena.drop_unreferenced(body);
    let nnatives = count_natives(arena, body);

    let mut compiler = Compiler {
        arena,
        globals: Globals::default(),
        diagnostics: Vec::new(),
        nfuncs: 0,
    };
    let root = compiler.alloc_func(0);
    let main = compiler.compile_func(body, root, 0, None, Vec::new());
    assert_eq!(compiler.globals.natives.len(), nnatives);

    if compiler.diagnostics.is_empty() {
        Ok(Compiled {
            program: Program {
                main,
                globals: compiler.globals,
            },
            imports,
        })
    } else {
        Err(CompileErrors {
            diagnostics: compiler.diagnostics,
        })
    }
}

fn count_natives(arena: &Arena, b: Block) -> usize {
    let mut n = 0;
    for id in arena.iter(b) {
        if arena.op_of(id) == Op::MakeNative {
            n += 1;
        }
        n += count_natives(arena, arena.inst(id).subfn);
    }
    n
}

struct Compiler<'a> {
    arena: &'a mut Arena,
    globals: Globals,
    diagnostics: Vec<String>,
    nfuncs: u32,
}

impl Compiler<'_> {
    fn alloc_func(&mut self, level: u16) -> FuncRef {
        let id = self.nfuncs;
        self.nfuncs += 1;
        FuncRef { id, level }
    }

    /// Parent hops from the current function to the one holding the
    /// binder. Binders are only ever in the same function or an enclosing
    /// one, so the depth difference is the hop count.
    fn nesting_level(&self, current: FuncRef, binder: InstId) -> u16 {
        let target = self
            .arena
            .inst(binder)
            .compiled
            .expect("binder was never laid out");
        assert!(target.level <= current.level, "binder below its reference");
        if target.level == current.level {
            assert_eq!(target.id, current.id, "binder in a sibling function");
        }
        current.level - target.level
    }

    /// Rewrite every call site in `b` into a prelude that materializes
    /// closure arguments plus the call instruction itself.
    ///
    /// Calls to user functions and formal parameters hoist inline
    /// `MakeClosure` arguments into the prelude and replace them with
    /// bound `ClosureRef`s. Calls to natives inline each argument body as
    /// a subexpression in reverse evaluation order and retag the call to
    /// `CallNative`, whose arity includes the implicit input. Unresolved
    /// references are reported and left in place.
    fn expand_calls(&mut self, b: &mut Block) {
        let mut ret = Block::EMPTY;
        while let Some(curr) = self.arena.take(b) {
            let inst = self.arena.inst(curr);
            if inst.op.has_binding() && inst.bound_by.is_none() {
                let arglist = inst.arglist;
                let arity = self.arena.count_actuals(arglist);
                let inst = self.arena.inst(curr);
                let name = resolve(inst.symbol.expect("binding op without a symbol"));
                let message = format!("error: {name}/{arity} is not defined");
                self.diagnostics.push(match &inst.file {
                    Some(file) => file.locate(inst.source, &message),
                    None => message,
                });
                let ib = self.arena.single(curr);
                ret = self.arena.join(ret, ib);
                continue;
            }

            let mut prelude = Block::EMPTY;
            if self.arena.op_of(curr) == Op::Call {
                let binder = self.arena.inst(curr).bound_by.unwrap();
                match self.arena.op_of(binder) {
                    Op::MakeClosure | Op::ClosureParam => {
                        let mut callargs = Block::EMPTY;
                        let mut actual_args: u16 = 0;
                        let mut arglist = self.arena.inst(curr).arglist;
                        while let Some(arg) = self.arena.take(&mut arglist) {
                            assert!(self.arena.op_of(arg).is_call_pseudo());
                            let ab = self.arena.single(arg);
                            match self.arena.op_of(arg) {
                                Op::ClosureRef => self.arena.append(&mut callargs, ab),
                                Op::MakeClosure => {
                                    self.arena.append(&mut prelude, ab);
                                    let r = self.arena.gen_bound(Op::ClosureRef, ab);
                                    self.arena.append(&mut callargs, r);
                                }
                                op => panic!("unknown parameter type {op:?}"),
                            }
                            actual_args += 1;
                        }
                        {
                            let inst = self.arena.inst_mut(curr);
                            inst.imm = Imm::Int(actual_args);
                            inst.arglist = callargs;
                        }
                        let desired_args = if self.arena.op_of(binder) == Op::MakeClosure {
                            self.arena.count_formals(binder)
                        } else {
                            0
                        };
                        assert_eq!(actual_args, desired_args, "arity mismatch after binding");
                    }

                    Op::MakeNative => {
                        let mut actual_args: u16 = 0;
                        let mut arglist = self.arena.inst(curr).arglist;
                        self.arena.inst_mut(curr).arglist = Block::EMPTY;
                        while let Some(arg) = self.arena.take(&mut arglist) {
                            assert_eq!(self.arena.op_of(arg), Op::MakeClosure);
                            let mut body = self.arena.inst(arg).subfn;
                            self.arena.inst_mut(arg).subfn = Block::EMPTY;
                            // arguments are pushed in reverse order, so each
                            // finished body is prepended to the prelude
                            self.expand_calls(&mut body);
                            let sub = self.arena.gen_subexp(body);
                            prelude = self.arena.join(sub, prelude);
                            actual_args += 1;
                        }
                        {
                            let inst = self.arena.inst_mut(curr);
                            inst.op = Op::CallNative;
                            // include the implicit input in the arg count
                            inst.imm = Imm::Int(actual_args + 1);
                        }
                        let desired_args = self
                            .arena
                            .inst(binder)
                            .nformals
                            .expect("native binder without cached arity");
                        assert_eq!(actual_args, desired_args, "arity mismatch after binding");
                    }

                    op => panic!("unknown function type {op:?}"),
                }
            }
            let ib = self.arena.single(curr);
            let expanded = self.arena.join(prelude, ib);
            ret = self.arena.join(ret, expanded);
        }
        *b = ret;
    }

    fn compile_func(
        &mut self,
        body: Block,
        func: FuncRef,
        nclosures: u16,
        name: Option<String>,
        params: Vec<String>,
    ) -> Bytecode {
        let errors_before = self.diagnostics.len();
        let mut b = body;
        self.expand_calls(&mut b);
        let ret = self.arena.gen_op(Op::Return);
        let b = self.arena.join(b, ret);

        // Pass A: layout. Encoded positions, local frame indices in
        // definition order, sub-function and native indices.
        let mut pos: u32 = 0;
        let mut var_frame_idx: u16 = 0;
        let mut nsubfunctions: u16 = 0;
        let mut locals: Vec<String> = Vec::new();
        let mut cur = b.first;
        while let Some(id) = cur {
            let inst = self.arena.inst(id);
            let op = inst.op;
            assert!(op != Op::ClosureRef && op != Op::ClosureParam);
            let mut length = op.describe().length as u32;
            if op == Op::Call {
                length += 2 * self.arena.iter(inst.arglist).count() as u32;
            }
            pos += length;
            {
                let inst = self.arena.inst_mut(id);
                inst.bytecode_pos = Some(pos);
                inst.compiled = Some(func);
            }

            let inst = self.arena.inst(id);
            if op.has_variable() && inst.bound_by == Some(id) {
                locals.push(resolve(inst.symbol.expect("local without a name")));
                self.arena.inst_mut(id).imm = Imm::Int(var_frame_idx);
                var_frame_idx += 1;
            }
            if op == Op::MakeClosure {
                assert_eq!(self.arena.inst(id).bound_by, Some(id));
                self.arena.inst_mut(id).imm = Imm::Int(nsubfunctions);
                nsubfunctions += 1;
            }
            if op == Op::MakeNative {
                assert_eq!(self.arena.inst(id).bound_by, Some(id));
                let nf = Rc::clone(self.arena.inst(id).imm.native());
                let idx = self.globals.natives.len() as u16;
                self.globals.native_names.push(nf.name.clone());
                self.globals.natives.push(nf);
                self.arena.inst_mut(id).imm = Imm::Int(idx);
            }
            cur = self.arena.inst(id).next;
        }
        let codelen = pos;

        // Pass B: recursively compile nested functions, assigning
        // closure-parameter indices first so bodies can refer to them.
        let mut subfunctions: Vec<Option<Bytecode>> = (0..nsubfunctions).map(|_| None).collect();
        let mut cur = b.first;
        while let Some(id) = cur {
            if self.arena.op_of(id) == Op::MakeClosure {
                let sub_idx = self.arena.inst(id).imm.int();
                let child = self.alloc_func(func.level + 1);
                let mut child_nclosures: u16 = 0;
                let mut child_params = Vec::new();
                let arglist = self.arena.inst(id).arglist;
                let mut p = arglist.first;
                while let Some(param) = p {
                    assert_eq!(self.arena.op_of(param), Op::ClosureParam);
                    assert_eq!(self.arena.inst(param).bound_by, Some(param));
                    child_params.push(resolve(
                        self.arena.inst(param).symbol.expect("param without a name"),
                    ));
                    self.arena.inst_mut(param).imm = Imm::Int(child_nclosures);
                    self.arena.inst_mut(param).compiled = Some(child);
                    child_nclosures += 1;
                    p = self.arena.inst(param).next;
                }
                let child_name = resolve(self.arena.inst(id).symbol.expect("unnamed definition"));
                let child_body = self.arena.inst(id).subfn;
                self.arena.inst_mut(id).subfn = Block::EMPTY;
                let compiled = self.compile_func(
                    child_body,
                    child,
                    child_nclosures,
                    Some(child_name),
                    child_params,
                );
                subfunctions[sub_idx as usize] = Some(compiled);
            }
            cur = self.arena.inst(id).next;
        }
        let subfunctions: Vec<Bytecode> = subfunctions
            .into_iter()
            .map(|c| c.expect("sub-function never compiled"))
            .collect();

        // Pass C: emit.
        let mut code: Vec<u16> = Vec::with_capacity(codelen as usize);
        let mut constants: Vec<Value> = Vec::new();
        let mut maxvar: i32 = -1;
        if self.diagnostics.len() == errors_before {
            let mut cur = b.first;
            while let Some(id) = cur {
                let inst = self.arena.inst(id);
                let op = inst.op;
                let desc = op.describe();
                if desc.length == 0 {
                    cur = inst.next;
                    continue;
                }
                code.push(op as u16);
                match op {
                    Op::CallNative => {
                        let binder = inst.bound_by.expect("unbound native call");
                        assert_eq!(self.arena.op_of(binder), Op::MakeNative);
                        assert!(inst.arglist.is_empty());
                        code.push(inst.imm.int());
                        code.push(self.arena.inst(binder).imm.int());
                    }
                    Op::Call => {
                        let binder = inst.bound_by.expect("unbound call survived expansion");
                        let bop = self.arena.op_of(binder);
                        assert!(bop == Op::MakeClosure || bop == Op::ClosureParam);
                        code.push(inst.imm.int());
                        code.push(self.nesting_level(func, binder));
                        let mut index = self.arena.inst(binder).imm.int();
                        if bop == Op::MakeClosure {
                            index |= NEW_CLOSURE;
                        }
                        code.push(index);
                        let args: Vec<InstId> = self.arena.iter(inst.arglist).collect();
                        for arg in args {
                            assert_eq!(self.arena.op_of(arg), Op::ClosureRef);
                            let arg_binder = self.arena.inst(arg).bound_by.unwrap();
                            assert_eq!(self.arena.op_of(arg_binder), Op::MakeClosure);
                            code.push(self.nesting_level(func, arg_binder));
                            code.push(self.arena.inst(arg_binder).imm.int() | NEW_CLOSURE);
                        }
                    }
                    _ if op.has_constant() => {
                        code.push(constants.len() as u16);
                        constants.push(inst.imm.constant().clone());
                    }
                    _ if op.has_variable() => {
                        let binder = inst.bound_by.expect("unbound variable survived binding");
                        code.push(self.nesting_level(func, binder));
                        let var = self.arena.inst(binder).imm.int();
                        code.push(var);
                        if var as i32 > maxvar {
                            maxvar = var as i32;
                        }
                    }
                    _ if op.has_branch() => {
                        let target = inst.imm.target();
                        let tpos = self
                            .arena
                            .inst(target)
                            .bytecode_pos
                            .expect("branch target was never laid out");
                        let at = code.len() as u32;
                        // forward branches only
                        assert!(tpos > at, "backward branch to {tpos} from {at}");
                        code.push((tpos - (at + 1)) as u16);
                    }
                    _ => {
                        assert_eq!(desc.length, 1, "codegen not implemented for {}", desc.name);
                    }
                }
                cur = self.arena.inst(id).next;
            }
            assert_eq!(code.len() as u32, codelen, "layout and emission disagree");
        }

        Bytecode {
            code,
            constants,
            subfunctions,
            nclosures,
            nlocals: (maxvar + 2) as u16,
            level: func.level,
            debuginfo: DebugInfo {
                name,
                params,
                locals,
            },
        }
    }
}
