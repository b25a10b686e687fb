//! Name binding and reference analysis.
//!
//! A binder is an instruction whose `bound_by` points to itself; binding
//! attaches free references whose symbol and flags match. Call references
//! additionally bind by arity: a call only binds to a definition with the
//! same number of formals (natives subtract one for the implicit input).

use sift_core::{intern, resolve, Spur};

use crate::block::{Arena, Block, InstId};
use crate::ops::{flags, Op};

impl Arena {
    /// Number of formal parameters of a binder, caching aside.
    pub(crate) fn count_formals(&self, binder: InstId) -> u16 {
        let inst = self.inst(binder);
        if inst.op == Op::MakeNative {
            return inst.imm.native().arity - 1;
        }
        let arglist = inst.arglist;
        let mut args = 0;
        for id in self.iter(arglist) {
            assert_eq!(self.inst(id).op, Op::ClosureParam);
            args += 1;
        }
        args
    }

    /// Number of actual arguments at a call site.
    pub(crate) fn count_actuals(&self, arglist: Block) -> u16 {
        let mut args = 0;
        for id in self.iter(arglist) {
            match self.inst(id).op {
                Op::MakeClosure | Op::ClosureParam | Op::MakeNative => args += 1,
                op => panic!("unknown function type {op:?} in arglist"),
            }
        }
        args
    }

    /// Count references to `binder` in `body`, recursing into nested
    /// function bodies and argument lists.
    pub(crate) fn count_refs(&self, binder: InstId, body: Block) -> usize {
        let mut nrefs = 0;
        for id in self.iter(body) {
            let inst = self.inst(id);
            if id != binder && inst.bound_by == Some(binder) {
                nrefs += 1;
            }
            nrefs += self.count_refs(binder, inst.subfn);
            nrefs += self.count_refs(binder, inst.arglist);
        }
        nrefs
    }

    /// Every instruction in the block is a binder matching `bindflags`.
    pub fn block_has_only_binders(&self, binders: Block, bindflags: u8) -> bool {
        let bindflags = bindflags | flags::HAS_BINDING;
        self.iter(binders)
            .all(|id| self.inst(id).op.describe().flags & bindflags == bindflags)
    }

    /// Like `block_has_only_binders`, but tolerates interleaved import
    /// declarations.
    pub fn block_has_only_binders_and_imports(&self, binders: Block, bindflags: u8) -> bool {
        let bindflags = bindflags | flags::HAS_BINDING;
        self.iter(binders).all(|id| {
            let inst = self.inst(id);
            inst.op == Op::Dep || inst.op.describe().flags & bindflags == bindflags
        })
    }

    /// Bind `binder` against every matching free reference in `body`.
    ///
    /// `qualified`, when given, is the name references must carry instead
    /// of the binder's own symbol (library binding). Returns the number of
    /// references bound.
    pub(crate) fn bind_subblock(
        &mut self,
        binder: InstId,
        body: Block,
        bindflags: u8,
        qualified: Option<Spur>,
    ) -> usize {
        {
            let inst = self.inst(binder);
            assert_eq!(inst.op.describe().flags & bindflags, bindflags);
            assert!(inst.symbol.is_some());
            assert!(inst.bound_by.is_none() || inst.bound_by == Some(binder));
        }
        self.inst_mut(binder).bound_by = Some(binder);
        if self.inst(binder).nformals.is_none() {
            let n = self.count_formals(binder);
            self.inst_mut(binder).nformals = Some(n);
        }
        let match_symbol = qualified.or(self.inst(binder).symbol);

        let mut nrefs = 0;
        let mut cur = body.first;
        while let Some(id) = cur {
            let inst = self.inst(id);
            let fl = inst.op.describe().flags;
            if fl & bindflags == bindflags && inst.bound_by.is_none() && inst.symbol == match_symbol
            {
                if inst.op == Op::Call && inst.nactuals.is_none() {
                    let arglist = inst.arglist;
                    let n = self.count_actuals(arglist);
                    self.inst_mut(id).nactuals = Some(n);
                }
                let inst = self.inst(id);
                if inst.nactuals.is_none() || inst.nactuals == self.inst(binder).nformals {
                    self.inst_mut(id).bound_by = Some(binder);
                    nrefs += 1;
                }
            }
            // binding recurses into closures and argument lists
            let subfn = self.inst(id).subfn;
            nrefs += self.bind_subblock(binder, subfn, bindflags, qualified);
            let arglist = self.inst(id).arglist;
            nrefs += self.bind_subblock(binder, arglist, bindflags, qualified);
            cur = self.inst(id).next;
        }
        nrefs
    }

    /// Bind each binder in `binders` against `body`. Sibling definitions
    /// are swept as well, so definitions in one binder list see each other
    /// (this is what makes mutually recursive definitions resolve in a
    /// single pass).
    pub(crate) fn bind_each(&mut self, binders: Block, body: Block, bindflags: u8) -> usize {
        assert!(self.block_has_only_binders(binders, bindflags));
        let bindflags = bindflags | flags::HAS_BINDING;
        let mut nrefs = 0;
        let mut cur = binders.first;
        while let Some(id) = cur {
            let mut sibling = binders.first;
            while let Some(sib) = sibling {
                if sib != id {
                    let subfn = self.inst(sib).subfn;
                    nrefs += self.bind_subblock(id, subfn, bindflags, None);
                    let arglist = self.inst(sib).arglist;
                    nrefs += self.bind_subblock(id, arglist, bindflags, None);
                }
                sibling = self.inst(sib).next;
            }
            nrefs += self.bind_subblock(id, body, bindflags, None);
            cur = self.inst(id).next;
        }
        nrefs
    }

    /// Bind and prepend: attach every matching free reference in `body`
    /// to the binders, then join the binders ahead of the body.
    pub fn bind(&mut self, binders: Block, body: Block, bindflags: u8) -> Block {
        self.bind_each(binders, body, bindflags);
        self.join(binders, body)
    }

    /// Bind a library's definitions against `body`, matching references by
    /// the qualified name `libname::symbol`. The definitions' own symbols
    /// are untouched. Returns the body alone — library definitions are
    /// joined ahead of the program by the linker, not here.
    pub fn bind_library(
        &mut self,
        binders: Block,
        body: Block,
        bindflags: u8,
        libname: &str,
    ) -> Block {
        assert!(self.block_has_only_binders(binders, bindflags));
        let bindflags = bindflags | flags::HAS_BINDING;
        let mut cur = binders.first;
        while let Some(id) = cur {
            let name = resolve(self.inst(id).symbol.expect("binder without a symbol"));
            let qualified = intern(&format!("{libname}::{name}"));
            self.bind_subblock(id, body, bindflags, Some(qualified));
            cur = self.inst(id).next;
        }
        body
    }

    /// Bind binders to `body` and keep only the definitions referenced,
    /// directly or indirectly, from it. Iterates to a fixed point so a
    /// definition referenced only by an already-kept definition is
    /// promoted too; the rest are discarded.
    pub fn bind_referenced(&mut self, binders: Block, body: Block, bindflags: u8) -> Block {
        assert!(self.block_has_only_binders(binders, bindflags));
        let bindflags = bindflags | flags::HAS_BINDING;
        let mut binders = binders;
        let mut refd = Block::EMPTY;
        let mut unrefd = Block::EMPTY;
        let (mut last_kept, mut kept) = (0usize, 0usize);
        loop {
            while let Some(curr) = self.take(&mut binders) {
                let mut nrefs = self.bind_subblock(curr, body, bindflags, None);
                // Check whether this binder is referenced from any of the
                // ones already known to be referenced by the body.
                nrefs += self.count_refs(curr, refd);
                nrefs += self.count_refs(curr, body);
                let b = self.single(curr);
                if nrefs > 0 {
                    refd = self.join(refd, b);
                    kept += 1;
                } else {
                    unrefd = self.join(unrefd, b);
                }
            }
            if kept == last_kept {
                break;
            }
            last_kept = kept;
            binders = unrefd;
            unrefd = Block::EMPTY;
        }
        self.join(refd, body)
    }

    /// Reachability pass over a finalized body: drop definitions not
    /// referenced from anything ahead of the `Top` sentinel, which is
    /// preserved along with everything after it.
    pub fn drop_unreferenced(&mut self, body: Block) -> Block {
        let mut body = body;
        loop {
            let mut refd = Block::EMPTY;
            let mut dropped = 0;
            let mut top = None;
            while let Some(curr) = self.take(&mut body) {
                if self.inst(curr).op == Op::Top {
                    top = Some(curr);
                    break;
                }
                let nrefs = self.count_refs(curr, refd) + self.count_refs(curr, body);
                let b = self.single(curr);
                if nrefs == 0 {
                    dropped += 1;
                } else {
                    refd = self.join(refd, b);
                }
            }
            if let Some(top) = top {
                let t = self.single(top);
                body = self.join(t, body);
            }
            body = self.join(refd, body);
            if dropped == 0 {
                break;
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape(arena: &Arena, b: Block) -> Vec<(Op, Option<String>)> {
        arena
            .iter(b)
            .map(|id| {
                let inst = arena.inst(id);
                (inst.op, inst.symbol.map(resolve))
            })
            .collect()
    }

    #[test]
    fn test_bind_variable() {
        let mut arena = Arena::new();
        let load = arena.gen_unbound(Op::LoadVar, "x");
        let load_id = load.first.unwrap();
        let binder = arena.gen_unbound(Op::StoreVar, "x");
        let binder_id = binder.first.unwrap();
        let bound = arena.bind(binder, load, flags::HAS_VARIABLE);
        assert_eq!(arena.inst(binder_id).bound_by, Some(binder_id));
        assert_eq!(arena.inst(load_id).bound_by, Some(binder_id));
        assert!(arena.block_has_only_binders(binder, flags::HAS_VARIABLE));
        assert_eq!(shape(&arena, bound).len(), 2);
    }

    #[test]
    fn test_bind_respects_shadowing() {
        // An already-bound reference is not rebound.
        let mut arena = Arena::new();
        let inner_binder = arena.gen_unbound(Op::StoreVar, "x");
        let inner_id = inner_binder.first.unwrap();
        let load = arena.gen_unbound(Op::LoadVar, "x");
        let load_id = load.first.unwrap();
        let inner = arena.bind(inner_binder, load, flags::HAS_VARIABLE);

        let outer_binder = arena.gen_unbound(Op::StoreVar, "x");
        let outer_id = outer_binder.first.unwrap();
        arena.bind(outer_binder, inner, flags::HAS_VARIABLE);
        assert_eq!(arena.inst(load_id).bound_by, Some(inner_id));
        assert_ne!(arena.inst(load_id).bound_by, Some(outer_id));
    }

    #[test]
    fn test_call_binding_is_arity_gated() {
        let mut arena = Arena::new();
        // def f(g): 1;  called once as f and once as f(...)
        let param = arena.gen_param("g");
        let body = arena.gen_const(json!(1));
        let def = arena.gen_function("f", param, body);
        let def_id = def.first.unwrap();

        let zero_arity = arena.gen_call("f", Block::EMPTY);
        let zero_id = zero_arity.first.unwrap();
        let arg_body = arena.gen_const(json!(2));
        let arg = arena.gen_lambda(arg_body);
        let one_arity = arena.gen_call("f", arg);
        let one_id = one_arity.first.unwrap();

        let calls = arena.join(zero_arity, one_arity);
        arena.bind(def, calls, flags::IS_CALL_PSEUDO);

        assert_eq!(arena.inst(zero_id).bound_by, None, "f/0 must not bind f/1");
        assert_eq!(arena.inst(one_id).bound_by, Some(def_id));
        assert_eq!(arena.inst(one_id).nactuals, Some(1));
        assert_eq!(arena.inst(def_id).nformals, Some(1));
    }

    #[test]
    fn test_mutual_recursion_binds_in_one_pass() {
        let mut arena = Arena::new();
        let call_odd = arena.gen_call("odd", Block::EMPTY);
        let call_odd_id = call_odd.first.unwrap();
        let def_even = arena.gen_function("even", Block::EMPTY, call_odd);
        let even_id = def_even.first.unwrap();

        let call_even = arena.gen_call("even", Block::EMPTY);
        let call_even_id = call_even.first.unwrap();
        let def_odd = arena.gen_function("odd", Block::EMPTY, call_even);
        let odd_id = def_odd.first.unwrap();

        let binders = arena.join(def_even, def_odd);
        let main = arena.gen_call("even", Block::EMPTY);
        let main_id = main.first.unwrap();
        arena.bind(binders, main, flags::IS_CALL_PSEUDO);

        assert_eq!(arena.inst(call_odd_id).bound_by, Some(odd_id));
        assert_eq!(arena.inst(call_even_id).bound_by, Some(even_id));
        assert_eq!(arena.inst(main_id).bound_by, Some(even_id));
    }

    #[test]
    fn test_bind_referenced_drops_unused() {
        let mut arena = Arena::new();
        let one = arena.gen_const(json!(1));
        let def_used = arena.gen_function("used", Block::EMPTY, one);
        let used_id = def_used.first.unwrap();
        let two = arena.gen_const(json!(2));
        let def_unused = arena.gen_function("unused", Block::EMPTY, two);

        let binders = arena.join(def_unused, def_used);
        let main = arena.gen_call("used", Block::EMPTY);
        let out = arena.bind_referenced(binders, main, flags::IS_CALL_PSEUDO);

        let kept = shape(&arena, out);
        assert_eq!(
            kept,
            vec![
                (Op::MakeClosure, Some("used".into())),
                (Op::Call, Some("used".into())),
            ]
        );
        assert_eq!(arena.inst(out.first.unwrap()).bound_by, Some(used_id));
    }

    #[test]
    fn test_bind_referenced_promotes_transitive() {
        let mut arena = Arena::new();
        // helper is referenced only from used; both must survive.
        let one = arena.gen_const(json!(1));
        let def_helper = arena.gen_function("helper", Block::EMPTY, one);
        let call_helper = arena.gen_call("helper", Block::EMPTY);
        let def_used = arena.gen_function("used", Block::EMPTY, call_helper);

        // helper first, so it is examined before anything references it.
        let binders = arena.join(def_helper, def_used);
        let main = arena.gen_call("used", Block::EMPTY);
        let out = arena.bind_referenced(binders, main, flags::IS_CALL_PSEUDO);

        let names: Vec<_> = shape(&arena, out)
            .into_iter()
            .filter(|(op, _)| *op == Op::MakeClosure)
            .map(|(_, sym)| sym.unwrap())
            .collect();
        assert!(names.contains(&"helper".to_string()));
        assert!(names.contains(&"used".to_string()));
    }

    #[test]
    fn test_drop_unreferenced_preserves_top_and_is_idempotent() {
        let mut arena = Arena::new();
        let one = arena.gen_const(json!(1));
        let def_dead = arena.gen_function("dead", Block::EMPTY, one);
        let two = arena.gen_const(json!(2));
        let def_live = arena.gen_function("live", Block::EMPTY, two);
        let live_bound = {
            let call = arena.gen_call("live", Block::EMPTY);
            arena.bind(def_live, call, flags::IS_CALL_PSEUDO)
        };
        let top = arena.gen_op(Op::Top);
        // [dead, live, top, call live] — binders ahead of the sentinel
        let mut pre = arena.join(def_dead, Block::EMPTY);
        let (live_def, live_rest) = {
            let mut b = live_bound;
            let d = arena.take(&mut b).unwrap();
            (arena.single(d), b)
        };
        pre = arena.join(pre, live_def);
        pre = arena.join(pre, top);
        let body = arena.join(pre, live_rest);

        let once = arena.drop_unreferenced(body);
        let shape_once = shape(&arena, once);
        assert_eq!(
            shape_once,
            vec![
                (Op::MakeClosure, Some("live".into())),
                (Op::Top, None),
                (Op::Call, Some("live".into())),
            ]
        );

        let twice = arena.drop_unreferenced(once);
        assert_eq!(shape(&arena, twice), shape_once);
    }

    #[test]
    fn test_bind_library_qualified_only_during_binding() {
        let mut arena = Arena::new();
        let body42 = arena.gen_const(json!(42));
        let def = arena.gen_function("f", Block::EMPTY, body42);
        let def_id = def.first.unwrap();

        let plain = arena.gen_call("f", Block::EMPTY);
        let plain_id = plain.first.unwrap();
        let qualified = arena.gen_call("m::f", Block::EMPTY);
        let qualified_id = qualified.first.unwrap();
        let body = arena.join(plain, qualified);

        let out = arena.bind_library(def, body, flags::IS_CALL_PSEUDO, "m");

        // Only the qualified reference binds, and the definition keeps its
        // unqualified symbol afterwards.
        assert_eq!(arena.inst(qualified_id).bound_by, Some(def_id));
        assert_eq!(arena.inst(plain_id).bound_by, None);
        assert_eq!(resolve(arena.inst(def_id).symbol.unwrap()), "f");
        // The returned block is the body alone, without the definitions.
        assert_eq!(shape(&arena, out).len(), 2);
    }
}
