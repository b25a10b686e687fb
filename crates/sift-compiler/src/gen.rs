//! Block builders: constructors for single-instruction fragments and the
//! lowerings that turn surface control-flow forms into backtracking IR.
//!
//! Every builder consumes its block arguments; the returned block owns
//! their instructions.

use std::rc::Rc;

use serde_json::json;
use sift_core::{intern, resolve, Location, NativeFn, SourceFile, Value};

use crate::block::{Arena, Block, Imm};
use crate::ops::{flags, Op};

/// One import declaration peeled off the front of a program, in source
/// order. `alias` and `search` mirror the optional strings given to
/// `gen_import`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub alias: Option<String>,
    pub search: Option<String>,
}

impl Arena {
    /// The empty block.
    pub fn gen_noop(&mut self) -> Block {
        Block::EMPTY
    }

    /// A single opcode with no immediate.
    pub fn gen_op(&mut self, op: Op) -> Block {
        assert_eq!(op.describe().length, 1);
        let id = self.alloc(op);
        self.single(id)
    }

    /// `Const` with an owned constant.
    pub fn gen_const(&mut self, constant: Value) -> Block {
        assert!(Op::Const.has_constant());
        let id = self.alloc(Op::Const);
        self.inst_mut(id).imm = Imm::Const(constant);
        self.single(id)
    }

    /// A branch whose target is the last instruction of `target` (the
    /// branch lands just past it). The target block is not consumed; the
    /// caller joins it into the surrounding sequence itself.
    pub fn gen_branch(&mut self, op: Op, target: Block) -> Block {
        assert!(op.has_branch());
        let last = target.last.expect("branch target must be non-empty");
        let id = self.alloc(op);
        self.inst_mut(id).imm = Imm::Target(last);
        self.single(id)
    }

    /// A branch to be patched later with `set_target`.
    pub fn gen_branch_later(&mut self, op: Op) -> Block {
        assert!(op.has_branch());
        let id = self.alloc(op);
        self.single(id)
    }

    /// Patch a `gen_branch_later` branch.
    pub fn set_target(&mut self, branch: Block, target: Block) {
        assert!(self.block_is_single(branch));
        let b = branch.first.unwrap();
        assert!(self.inst(b).op.has_branch());
        let last = target.last.expect("branch target must be non-empty");
        self.inst_mut(b).imm = Imm::Target(last);
    }

    /// An unbound instruction carrying a symbol.
    pub fn gen_unbound(&mut self, op: Op, name: &str) -> Block {
        assert!(op.has_binding());
        let id = self.alloc(op);
        self.inst_mut(id).symbol = Some(intern(name));
        self.single(id)
    }

    /// A fresh local-variable binder: an unbound variable instruction
    /// bound to itself.
    pub fn gen_var_fresh(&mut self, op: Op, hint: &str) -> Block {
        assert!(op.has_variable());
        let binder = self.gen_unbound(op, hint);
        self.bind(binder, Block::EMPTY, flags::HAS_VARIABLE)
    }

    /// A reference preset to the given single-instruction binder.
    pub fn gen_bound(&mut self, op: Op, binder: Block) -> Block {
        assert!(self.block_is_single(binder));
        let binder_id = binder.first.unwrap();
        assert!(op.has_binding());
        let symbol = self.inst(binder_id).symbol;
        let id = self.alloc(op);
        let inst = self.inst_mut(id);
        inst.symbol = symbol;
        inst.bound_by = Some(binder_id);
        self.single(id)
    }

    // ── Source locations ──────────────────────────────────────────────

    /// Stamp `loc`/`file` on every instruction in the block that does not
    /// already carry a location. Parsers call this as they reduce, so
    /// inner fragments keep their tighter positions.
    pub fn gen_location(&mut self, loc: Location, file: &Rc<SourceFile>, b: Block) -> Block {
        let mut cur = b.first;
        while let Some(id) = cur {
            let inst = self.inst_mut(id);
            if inst.source.is_none() {
                inst.source = Some(loc);
                inst.file = Some(Rc::clone(file));
            }
            cur = self.inst(id).next;
        }
        b
    }

    // ── Functions & calls ─────────────────────────────────────────────

    /// A function definition: binds each formal into `body`, packages the
    /// body and formals on a `MakeClosure`, then binds the definition
    /// against itself so recursive calls resolve.
    pub fn gen_function(&mut self, name: &str, formals: Block, body: Block) -> Block {
        self.bind_each(formals, body, flags::IS_CALL_PSEUDO);
        let id = self.alloc(Op::MakeClosure);
        {
            let inst = self.inst_mut(id);
            inst.subfn = body;
            inst.symbol = Some(intern(name));
            inst.arglist = formals;
        }
        let b = self.single(id);
        self.bind_subblock(id, b, flags::IS_CALL_PSEUDO | flags::HAS_BINDING, None);
        b
    }

    /// A formal parameter placeholder.
    pub fn gen_param(&mut self, name: &str) -> Block {
        self.gen_unbound(Op::ClosureParam, name)
    }

    /// An anonymous function with no formals.
    pub fn gen_lambda(&mut self, body: Block) -> Block {
        self.gen_function("@lambda", Block::EMPTY, body)
    }

    /// An unbound call site carrying its actual arguments.
    pub fn gen_call(&mut self, name: &str, args: Block) -> Block {
        let b = self.gen_unbound(Op::Call, name);
        self.inst_mut(b.first.unwrap()).arglist = args;
        b
    }

    /// Bind a `MakeNative` binder per native function so unbound
    /// references in `code` resolve to them.
    pub fn gen_natives(&mut self, natives: &[Rc<NativeFn>], code: Block) -> Block {
        let mut code = code;
        for nf in natives {
            let id = self.alloc(Op::MakeNative);
            {
                let inst = self.inst_mut(id);
                inst.imm = Imm::Native(Rc::clone(nf));
                inst.symbol = Some(intern(&nf.name));
            }
            let binder = self.single(id);
            code = self.bind(binder, code, flags::IS_CALL_PSEUDO);
        }
        code
    }

    // ── Imports ───────────────────────────────────────────────────────

    /// An import declaration. Carries the module name as its symbol and
    /// `{as?, search?}` as a constant; stripped by `take_imports` before
    /// compilation.
    pub fn gen_import(&mut self, name: &str, alias: Option<&str>, search: Option<&str>) -> Block {
        let id = self.alloc(Op::Dep);
        let mut opts = serde_json::Map::new();
        if let Some(alias) = alias {
            opts.insert("as".into(), Value::String(alias.into()));
        }
        if let Some(search) = search {
            opts.insert("search".into(), Value::String(search.into()));
        }
        {
            let inst = self.inst_mut(id);
            inst.symbol = Some(intern(name));
            inst.imm = Imm::Const(Value::Object(opts));
        }
        self.single(id)
    }

    /// Peel all `Dep` instructions off the front of the program (after an
    /// optional `Top` sentinel, which is preserved) and return them as
    /// import records in source order.
    pub fn take_imports(&mut self, body: &mut Block) -> Vec<Import> {
        let mut imports = Vec::new();

        let top = if self.block_has_main(*body) {
            self.take(body)
        } else {
            None
        };
        while matches!(body.first, Some(id) if self.inst(id).op == Op::Dep) {
            let dep = self.take(body).unwrap();
            let inst = self.inst(dep);
            let opts = inst.imm.constant();
            imports.push(Import {
                name: resolve(inst.symbol.expect("import without a module name")),
                alias: opts.get("as").and_then(Value::as_str).map(String::from),
                search: opts.get("search").and_then(Value::as_str).map(String::from),
            });
        }
        if let Some(top) = top {
            let t = self.single(top);
            *body = self.join(t, *body);
        }
        imports
    }

    // ── Control flow ──────────────────────────────────────────────────

    /// Wrap `a` so the VM treats it as a path-constructing expression.
    pub fn gen_subexp(&mut self, a: Block) -> Block {
        let begin = self.gen_op(Op::SubexpBegin);
        let end = self.gen_op(Op::SubexpEnd);
        self.seq([begin, a, end])
    }

    /// Produce the values of `a`, then of `b`.
    pub fn gen_both(&mut self, a: Block, b: Block) -> Block {
        let jump = self.gen_branch_later(Op::Jump);
        let fork = self.gen_branch(Op::Fork, jump);
        let c = self.seq([fork, a, jump, b]);
        self.set_target(jump, c);
        c
    }

    /// Array comprehension: collect every value of `expr` into a fresh
    /// local, then load it.
    pub fn gen_collect(&mut self, expr: Block) -> Block {
        let array_var = self.gen_var_fresh(Op::StoreVar, "collect");
        let dup = self.gen_op(Op::Dup);
        let empty = self.gen_const(json!([]));
        let init = self.seq([dup, empty, array_var]);

        let append = self.gen_bound(Op::Append, array_var);
        let backtrack = self.gen_op(Op::Backtrack);
        let tail = self.join(append, backtrack);

        let fork = self.gen_branch(Op::Fork, tail);
        let load = self.gen_bound(Op::TakeVar, array_var);
        self.seq([init, fork, expr, tail, load])
    }

    /// `reduce source as $var (init; body)`.
    pub fn gen_reduce(&mut self, varname: &str, source: Block, init: Block, body: Block) -> Block {
        let res_var = self.gen_var_fresh(Op::StoreVar, "reduce");
        let load_res = self.gen_bound(Op::TakeVar, res_var);
        let store_res = self.gen_bound(Op::StoreVar, res_var);
        let step = self.seq([load_res, body, store_res]);
        let var_binder = self.gen_unbound(Op::StoreVar, varname);
        let step = self.bind(var_binder, step, flags::HAS_VARIABLE);

        let dup = self.gen_op(Op::Dup);
        let backtrack = self.gen_op(Op::Backtrack);
        let loop_ = self.seq([dup, source, step, backtrack]);

        let dup = self.gen_op(Op::Dup);
        let fork = self.gen_branch(Op::Fork, loop_);
        let out = self.gen_bound(Op::TakeVar, res_var);
        self.seq([dup, init, res_var, fork, loop_, out])
    }

    /// `foreach source as $var (init; update; extract)`: like reduce, but
    /// each iteration also yields the extracted value. A surrounding `try`
    /// swallows exactly the error string `"break"`; anything else is
    /// re-raised.
    pub fn gen_foreach(
        &mut self,
        varname: &str,
        source: Block,
        init: Block,
        update: Block,
        extract: Block,
    ) -> Block {
        let output = self.gen_branch_later(Op::Jump);
        let state_var = self.gen_var_fresh(Op::StoreVar, "foreach");

        // load state, update it, stash the new state, extract an output
        let load_state = self.gen_bound(Op::TakeVar, state_var);
        let dup = self.gen_op(Op::Dup);
        let store_state = self.gen_bound(Op::StoreVar, state_var);
        let step = self.seq([load_state, update, dup, store_state, extract, output]);
        let var_binder = self.gen_unbound(Op::StoreVar, varname);
        let step = self.bind(var_binder, step, flags::HAS_VARIABLE);

        let dup = self.gen_op(Op::Dup);
        let loop_ = self.seq([dup, source, step]);

        let dup = self.gen_op(Op::Dup);
        let fork = self.gen_branch(Op::Fork, loop_);
        // once the source is exhausted the input is back on top of the
        // stack; it must not leak out, so backtrack
        let backtrack = self.gen_op(Op::Backtrack);
        let foreach = self.seq([dup, init, state_var, fork, loop_, backtrack]);
        self.set_target(output, foreach);

        let break_const = self.gen_const(json!("break"));
        let want_break = self.gen_lambda(break_const);
        let noop = self.gen_lambda(Block::EMPTY);
        let eq_args = self.join(want_break, noop);
        let is_break = self.gen_call("_equal", eq_args);
        let swallow = self.gen_op(Op::Backtrack);
        let reraise = self.gen_call("break", Block::EMPTY);
        let handler = self.gen_cond(is_break, swallow, reraise);

        self.gen_try(foreach, handler)
    }

    /// `a // b`: produce the values of `a`; if there are none that are
    /// truthy, produce the values of `b` instead. Tracks whether `a`
    /// produced anything in a fresh local flag.
    pub fn gen_definedor(&mut self, a: Block, b: Block) -> Block {
        // var found := false
        let found_var = self.gen_var_fresh(Op::StoreVar, "found");
        let dup = self.gen_op(Op::Dup);
        let fals = self.gen_const(json!(false));
        let init = self.seq([dup, fals, found_var]);

        // if found, backtrack. Otherwise execute b
        let backtrack = self.gen_op(Op::Backtrack);
        let dup = self.gen_op(Op::Dup);
        let load_found = self.gen_bound(Op::LoadVar, found_var);
        let jf = self.gen_branch(Op::JumpIfFalse, backtrack);
        let pop = self.gen_op(Op::Pop);
        let tail = self.seq([dup, load_found, jf, backtrack, pop, b]);

        // try again
        let if_notfound = self.gen_op(Op::Backtrack);

        // found := true, produce result
        let dup = self.gen_op(Op::Dup);
        let tru = self.gen_const(json!(true));
        let store_found = self.gen_bound(Op::StoreVar, found_var);
        let jump_tail = self.gen_branch(Op::Jump, tail);
        let if_found = self.seq([dup, tru, store_found, jump_tail]);

        let fork = self.gen_branch(Op::Fork, if_notfound);
        let jf = self.gen_branch(Op::JumpIfFalse, if_found);
        self.seq([init, fork, a, jf, if_found, if_notfound, tail])
    }

    fn gen_condbranch(&mut self, iftrue: Block, iffalse: Block) -> Block {
        let jump_past = self.gen_branch(Op::Jump, iffalse);
        let iftrue = self.join(iftrue, jump_past);
        let jf = self.gen_branch(Op::JumpIfFalse, iftrue);
        self.seq([jf, iftrue, iffalse])
    }

    /// `a and b = if a then (if b then true else false) else false`.
    pub fn gen_and(&mut self, a: Block, b: Block) -> Block {
        let dup = self.gen_op(Op::Dup);
        let tru = self.gen_const(json!(true));
        let fals = self.gen_const(json!(false));
        let inner = self.gen_condbranch(tru, fals);
        let pop = self.gen_op(Op::Pop);
        let then = self.seq([pop, b, inner]);
        let pop = self.gen_op(Op::Pop);
        let fals = self.gen_const(json!(false));
        let els = self.join(pop, fals);
        let branch = self.gen_condbranch(then, els);
        self.seq([dup, a, branch])
    }

    /// `a or b = if a then true else (if b then true else false)`.
    pub fn gen_or(&mut self, a: Block, b: Block) -> Block {
        let dup = self.gen_op(Op::Dup);
        let pop = self.gen_op(Op::Pop);
        let tru = self.gen_const(json!(true));
        let then = self.join(pop, tru);
        let tru = self.gen_const(json!(true));
        let fals = self.gen_const(json!(false));
        let inner = self.gen_condbranch(tru, fals);
        let pop = self.gen_op(Op::Pop);
        let els = self.seq([pop, b, inner]);
        let branch = self.gen_condbranch(then, els);
        self.seq([dup, a, branch])
    }

    /// `<var> as $name | body`.
    pub fn gen_var_binding(&mut self, var: Block, name: &str, body: Block) -> Block {
        let dup = self.gen_op(Op::Dup);
        let binder = self.gen_unbound(Op::StoreVar, name);
        let bound = self.bind(binder, body, flags::HAS_VARIABLE);
        self.seq([dup, var, bound])
    }

    /// `if cond then iftrue else iffalse end`: duplicate the input, run
    /// the condition over it, and dispatch; each branch pops the test
    /// value first.
    pub fn gen_cond(&mut self, cond: Block, iftrue: Block, iffalse: Block) -> Block {
        let dup = self.gen_op(Op::Dup);
        let pop = self.gen_op(Op::Pop);
        let then = self.join(pop, iftrue);
        let pop = self.gen_op(Op::Pop);
        let els = self.join(pop, iffalse);
        let branch = self.gen_condbranch(then, els);
        self.seq([dup, cond, branch])
    }

    /// `try exp catch handler`:
    ///
    /// ```text
    ///   ForkOpt <just past exp's trailing jump>
    ///   <exp>
    ///   Jump <end of handler>
    ///   <handler>
    /// ```
    ///
    /// The handler runs only if the VM backtracks to the `ForkOpt` with an
    /// error. If `exp` produces no value the `ForkOpt` backtracks,
    /// propagating the empty; if it produces values, execution falls
    /// through past the handler.
    pub fn gen_try(&mut self, exp: Block, handler: Block) -> Block {
        let handler = if handler.is_empty() {
            // identity handler: keep the error value flowing through
            let dup = self.gen_op(Op::Dup);
            let pop = self.gen_op(Op::Pop);
            self.seq([dup, pop, handler])
        } else {
            handler
        };
        let jump = self.gen_branch(Op::Jump, handler);
        let exp = self.join(exp, jump);
        let fork_opt = self.gen_branch(Op::ForkOpt, exp);
        self.seq([fork_opt, exp, handler])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops_of(arena: &Arena, b: Block) -> Vec<Op> {
        arena.iter(b).map(|id| arena.op_of(id)).collect()
    }

    #[test]
    fn test_gen_both_shape() {
        let mut arena = Arena::new();
        let a = arena.gen_const(json!(1));
        let b = arena.gen_const(json!(2));
        let both = arena.gen_both(a, b);
        assert_eq!(
            ops_of(&arena, both),
            vec![Op::Fork, Op::Const, Op::Jump, Op::Const]
        );
        // The fork resumes at the jump; the jump lands past the whole form.
        let ids: Vec<_> = arena.iter(both).collect();
        assert_eq!(arena.inst(ids[0]).imm.target(), ids[2]);
        assert_eq!(arena.inst(ids[2]).imm.target(), ids[3]);
    }

    #[test]
    fn test_gen_try_empty_handler() {
        let mut arena = Arena::new();
        let exp = arena.gen_const(json!(1));
        let t = arena.gen_try(exp, Block::EMPTY);
        assert_eq!(
            ops_of(&arena, t),
            vec![Op::ForkOpt, Op::Const, Op::Jump, Op::Dup, Op::Pop]
        );
    }

    #[test]
    fn test_gen_subexp_wraps() {
        let mut arena = Arena::new();
        let a = arena.gen_op(Op::Dup);
        let s = arena.gen_subexp(a);
        assert_eq!(
            ops_of(&arena, s),
            vec![Op::SubexpBegin, Op::Dup, Op::SubexpEnd]
        );
    }

    #[test]
    fn test_take_imports() {
        let mut arena = Arena::new();
        let top = arena.gen_op(Op::Top);
        let dep_a = arena.gen_import("m", Some("m"), None);
        let dep_b = arena.gen_import("util", None, Some("./lib"));
        let main = arena.gen_op(Op::Dup);
        let mut program = arena.seq([top, dep_a, dep_b, main]);

        let imports = arena.take_imports(&mut program);
        assert_eq!(
            imports,
            vec![
                Import {
                    name: "m".into(),
                    alias: Some("m".into()),
                    search: None,
                },
                Import {
                    name: "util".into(),
                    alias: None,
                    search: Some("./lib".into()),
                },
            ]
        );
        // Top sentinel preserved at the head; deps gone.
        assert_eq!(ops_of(&arena, program), vec![Op::Top, Op::Dup]);
    }

    #[test]
    fn test_take_imports_without_top() {
        let mut arena = Arena::new();
        let dep = arena.gen_import("m", None, None);
        let main = arena.gen_op(Op::Dup);
        let mut program = arena.join(dep, main);
        let imports = arena.take_imports(&mut program);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].alias, None);
        assert_eq!(ops_of(&arena, program), vec![Op::Dup]);
    }

    #[test]
    fn test_gen_location_stamps_only_unset() {
        let mut arena = Arena::new();
        let file = SourceFile::new("f.sift", "1 + 2\n");
        let inner = arena.gen_const(json!(1));
        let inner = arena.gen_location(Location::new(0, 1), &file, inner);
        let outer_op = arena.gen_op(Op::Dup);
        let b = arena.join(inner, outer_op);
        let b = arena.gen_location(Location::new(0, 5), &file, b);

        let ids: Vec<_> = arena.iter(b).collect();
        assert_eq!(arena.inst(ids[0]).source, Some(Location::new(0, 1)));
        assert_eq!(arena.inst(ids[1]).source, Some(Location::new(0, 5)));
    }

    #[test]
    fn test_gen_function_self_binds() {
        let mut arena = Arena::new();
        let recur = arena.gen_call("f", Block::EMPTY);
        let f = arena.gen_function("f", Block::EMPTY, recur);
        let def = f.first.unwrap();
        assert_eq!(arena.inst(def).bound_by, Some(def));
        let body_call = arena.inst(def).subfn.first.unwrap();
        assert_eq!(arena.inst(body_call).bound_by, Some(def));
    }
}
