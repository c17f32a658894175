// Islet Evaluator - Special Forms and Core Evaluation
//
// Recursive reduction of forms against lexical environments. Non-local
// exits ride the error channel of EvalResult; every installer restores its
// stacks on every exit path.

use crate::arena::Node;
use crate::arrays::VectorId;
use crate::classes::{ClassId, GenericId, MethodBody, MethodId, MethodQualifier, SlotDefinition};
use crate::conditions::Handler;
use crate::control::{Control, EvalResult};
use crate::env::Env;
use crate::machine::Machine;
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::{NodeId, Value};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Type for native functions. A native receives the evaluated arguments;
/// interpreter state (and thus the environment) is reachable through the
/// Interpreter. Signaling a condition is the only failure channel.
pub type NativeFn = fn(&mut Interpreter, &[NodeId]) -> EvalResult;

/// A closure: lambda list + body + captured environment.
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<SymbolId>,
    /// The single symbol after :rest / &rest, bound to the excess arguments
    pub rest: Option<SymbolId>,
    /// List of body forms
    pub body: NodeId,
    pub env: Env,
}

/// State for call-next-method during a generic invocation.
#[derive(Debug, Clone)]
pub struct NextMethodState {
    pub arounds: Vec<MethodId>,
    pub befores: Vec<MethodId>,
    pub primaries: Vec<MethodId>,
    /// Least-specific first
    pub afters: Vec<MethodId>,
    pub args: Vec<NodeId>,
    pub in_primary: bool,
}

/// Special form head symbols (cached ids)
#[derive(Debug, Clone, Copy)]
pub struct SpecialForms {
    pub quote: SymbolId,
    pub r#if: SymbolId,
    pub progn: SymbolId,
    pub r#let: SymbolId,
    pub let_star: SymbolId,
    pub lambda: SymbolId,
    pub function: SymbolId,
    pub defun: SymbolId,
    pub defmacro: SymbolId,
    pub defglobal: SymbolId,
    pub defdynamic: SymbolId,
    pub dynamic: SymbolId,
    pub dynamic_let: SymbolId,
    pub setq: SymbolId,
    pub setf: SymbolId,
    pub block: SymbolId,
    pub return_from: SymbolId,
    pub tagbody: SymbolId,
    pub go: SymbolId,
    pub catch: SymbolId,
    pub throw: SymbolId,
    pub unwind_protect: SymbolId,
    pub with_handler: SymbolId,
    pub signal_condition: SymbolId,
    pub defclass: SymbolId,
    pub defgeneric: SymbolId,
    pub defmethod: SymbolId,
    pub class: SymbolId,
    pub flet: SymbolId,
    pub labels: SymbolId,
    pub and: SymbolId,
    pub or: SymbolId,
    pub cond: SymbolId,
    pub r#while: SymbolId,
    pub quasiquote: SymbolId,
    pub unquote: SymbolId,
    pub unquote_splicing: SymbolId,
    // Place heads recognized by setf
    pub car: SymbolId,
    pub cdr: SymbolId,
    pub elt: SymbolId,
    pub aref: SymbolId,
    pub slot_value: SymbolId,
}

impl SpecialForms {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        Self {
            quote: symbols.intern("QUOTE"),
            r#if: symbols.intern("IF"),
            progn: symbols.intern("PROGN"),
            r#let: symbols.intern("LET"),
            let_star: symbols.intern("LET*"),
            lambda: symbols.intern("LAMBDA"),
            function: symbols.intern("FUNCTION"),
            defun: symbols.intern("DEFUN"),
            defmacro: symbols.intern("DEFMACRO"),
            defglobal: symbols.intern("DEFGLOBAL"),
            defdynamic: symbols.intern("DEFDYNAMIC"),
            dynamic: symbols.intern("DYNAMIC"),
            dynamic_let: symbols.intern("DYNAMIC-LET"),
            setq: symbols.intern("SETQ"),
            setf: symbols.intern("SETF"),
            block: symbols.intern("BLOCK"),
            return_from: symbols.intern("RETURN-FROM"),
            tagbody: symbols.intern("TAGBODY"),
            go: symbols.intern("GO"),
            catch: symbols.intern("CATCH"),
            throw: symbols.intern("THROW"),
            unwind_protect: symbols.intern("UNWIND-PROTECT"),
            with_handler: symbols.intern("WITH-HANDLER"),
            signal_condition: symbols.intern("SIGNAL-CONDITION"),
            defclass: symbols.intern("DEFCLASS"),
            defgeneric: symbols.intern("DEFGENERIC"),
            defmethod: symbols.intern("DEFMETHOD"),
            class: symbols.intern("CLASS"),
            flet: symbols.intern("FLET"),
            labels: symbols.intern("LABELS"),
            and: symbols.intern("AND"),
            or: symbols.intern("OR"),
            cond: symbols.intern("COND"),
            r#while: symbols.intern("WHILE"),
            quasiquote: symbols.intern("QUASIQUOTE"),
            unquote: symbols.intern("UNQUOTE"),
            unquote_splicing: symbols.intern("UNQUOTE-SPLICING"),
            car: symbols.intern("CAR"),
            cdr: symbols.intern("CDR"),
            elt: symbols.intern("ELT"),
            aref: symbols.intern("AREF"),
            slot_value: symbols.intern("SLOT-VALUE"),
        }
    }

    /// Macros must not shadow these names in the evaluator's dispatch.
    pub fn is_special(&self, sym: SymbolId) -> bool {
        sym == self.quote
            || sym == self.r#if
            || sym == self.progn
            || sym == self.r#let
            || sym == self.let_star
            || sym == self.lambda
            || sym == self.function
            || sym == self.defun
            || sym == self.defmacro
            || sym == self.defglobal
            || sym == self.defdynamic
            || sym == self.dynamic
            || sym == self.dynamic_let
            || sym == self.setq
            || sym == self.setf
            || sym == self.block
            || sym == self.return_from
            || sym == self.tagbody
            || sym == self.go
            || sym == self.catch
            || sym == self.throw
            || sym == self.unwind_protect
            || sym == self.with_handler
            || sym == self.signal_condition
            || sym == self.defclass
            || sym == self.defgeneric
            || sym == self.defmethod
            || sym == self.class
            || sym == self.flet
            || sym == self.labels
            || sym == self.and
            || sym == self.or
            || sym == self.cond
            || sym == self.r#while
            || sym == self.quasiquote
    }
}

/// The Islet interpreter. Borrows the machine for one evaluation.
pub struct Interpreter<'a> {
    pub machine: &'a mut Machine,
}

impl<'a> Interpreter<'a> {
    pub fn new(machine: &'a mut Machine) -> Self {
        Self { machine }
    }

    // =========================================================================
    // Signaling
    // =========================================================================

    /// Signal a condition: run matching handlers innermost-out at the signal
    /// site. A continuable signal returns Ok with the value supplied by a
    /// handler's continue-condition.
    pub fn signal(&mut self, condition: NodeId, continuable: bool) -> EvalResult {
        let depth = self.machine.conditions.begin_signal(condition, continuable);
        let result = self.run_handlers(condition, depth);
        self.machine.conditions.end_signal(depth);
        result
    }

    fn run_handlers(&mut self, condition: NodeId, depth: u32) -> EvalResult {
        let saved = self.machine.conditions.snapshot();
        let cond_class = self.machine.class_of(condition);
        let mut idx = saved.len();
        while idx > 0 {
            idx -= 1;
            let handler = saved[idx].clone();
            if !self.machine.classes.subclass_of(cond_class, handler.class) {
                continue;
            }
            // The handler and everything inside it are masked while it runs.
            self.machine.conditions.restore(saved[..idx].to_vec());
            let r = self.apply(handler.function, &[condition]);
            self.machine.conditions.restore(saved.clone());
            match r {
                Err(Control::ContinueSignal { depth: d, value }) if d == depth => {
                    return Ok(value);
                }
                Err(tok) => return Err(tok),
                Ok(_) => {
                    // A handler must transfer control or continue; returning
                    // normally is a control error, signaled to the handlers
                    // outside the one that misbehaved.
                    self.machine.conditions.restore(saved[..idx].to_vec());
                    let ce = self.machine.control_error(condition);
                    let r2 = self.signal(ce, false);
                    self.machine.conditions.restore(saved.clone());
                    return r2;
                }
            }
        }
        Err(Control::Condition { condition })
    }

    /// Signal a non-continuable condition and hand back the token.
    pub fn raise(&mut self, condition: NodeId) -> Control {
        match self.signal(condition, false) {
            Err(tok) => tok,
            // Non-continuable signals cannot produce a value.
            Ok(_) => Control::Condition { condition },
        }
    }

    pub fn raise_program_error(&mut self) -> Control {
        let c = self.machine.program_error();
        self.raise(c)
    }

    pub fn raise_domain_error(&mut self, object: NodeId, expected: ClassId) -> Control {
        let c = self.machine.domain_error(object, expected);
        self.raise(c)
    }

    pub fn raise_simple_error(&mut self, format: &str, arguments: &[NodeId]) -> Control {
        let args = self.machine.list(arguments);
        let c = self.machine.simple_error(format, args);
        self.raise(c)
    }

    // =========================================================================
    // Core evaluation
    // =========================================================================

    /// Main evaluation entry point
    pub fn eval(&mut self, expr: NodeId, env: &Env) -> EvalResult {
        let node = self.machine.arena.get_unchecked(expr).clone();
        match node {
            Node::Leaf(Value::Symbol(id)) => {
                let sym = SymbolId(id);
                if sym == self.machine.t_sym || self.machine.symbols.is_keyword(sym) {
                    return Ok(expr);
                }
                if let Some(val) = env.lookup_var(sym) {
                    return Ok(val);
                }
                if let Some(&val) = self.machine.toplevel.variables.get(&sym) {
                    return Ok(val);
                }
                // Continuable: a handler may supply the value to use.
                let cond = self.machine.unbound_variable(sym);
                self.signal(cond, true)
            }
            Node::Leaf(_) => Ok(expr),
            Node::Cons(head, args) => self.eval_application(head, args, env),
        }
    }

    /// Public boundary: stray non-condition tokens become <control-error>.
    pub fn eval_toplevel(&mut self, expr: NodeId, env: &Env) -> EvalResult {
        match self.eval(expr, env) {
            Err(Control::Return { .. }) => {
                let name = self.machine.intern_node("RETURN-FROM");
                let c = self.machine.control_error(name);
                Err(Control::Condition { condition: c })
            }
            Err(Control::Go { tag, .. }) => {
                let name = self.machine.make_symbol(tag);
                let c = self.machine.control_error(name);
                Err(Control::Condition { condition: c })
            }
            Err(Control::Throw { tag, .. }) => {
                let c = self.machine.control_error(tag);
                Err(Control::Condition { condition: c })
            }
            Err(Control::ContinueSignal { .. }) => {
                let name = self.machine.intern_node("CONTINUE-CONDITION");
                let c = self.machine.control_error(name);
                Err(Control::Condition { condition: c })
            }
            other => other,
        }
    }

    /// Evaluate body forms in order; nil if empty.
    fn eval_body(&mut self, body: NodeId, env: &Env) -> EvalResult {
        let mut result = self.machine.make_nil();
        let mut current = body;
        while let Node::Cons(form, rest) = self.machine.arena.get_unchecked(current).clone() {
            result = self.eval(form, env)?;
            current = rest;
        }
        Ok(result)
    }

    fn eval_application(&mut self, head: NodeId, args: NodeId, env: &Env) -> EvalResult {
        if let Node::Leaf(Value::Symbol(id)) = self.machine.arena.get_unchecked(head) {
            let sym = SymbolId(*id);
            let sf = self.machine.special;

            if sym == sf.quote {
                return self.eval_quote(args);
            }
            if sym == sf.r#if {
                return self.eval_if(args, env);
            }
            if sym == sf.progn {
                return self.eval_body(args, env);
            }
            if sym == sf.r#let {
                return self.eval_let(args, env);
            }
            if sym == sf.let_star {
                return self.eval_let_star(args, env);
            }
            if sym == sf.lambda {
                return self.eval_lambda(args, env);
            }
            if sym == sf.function {
                return self.eval_function(args, env);
            }
            if sym == sf.defun {
                return self.eval_defun(args, env);
            }
            if sym == sf.defmacro {
                return self.eval_defmacro(args, env);
            }
            if sym == sf.defglobal {
                return self.eval_defglobal(args, env);
            }
            if sym == sf.defdynamic {
                return self.eval_defdynamic(args, env);
            }
            if sym == sf.dynamic {
                return self.eval_dynamic(args);
            }
            if sym == sf.dynamic_let {
                return self.eval_dynamic_let(args, env);
            }
            if sym == sf.setq {
                return self.eval_setq(args, env);
            }
            if sym == sf.setf {
                return self.eval_setf(args, env);
            }
            if sym == sf.block {
                return self.eval_block(args, env);
            }
            if sym == sf.return_from {
                return self.eval_return_from(args, env);
            }
            if sym == sf.tagbody {
                return self.eval_tagbody(args, env);
            }
            if sym == sf.go {
                return self.eval_go(args, env);
            }
            if sym == sf.catch {
                return self.eval_catch(args, env);
            }
            if sym == sf.throw {
                return self.eval_throw(args, env);
            }
            if sym == sf.unwind_protect {
                return self.eval_unwind_protect(args, env);
            }
            if sym == sf.with_handler {
                return self.eval_with_handler(args, env);
            }
            if sym == sf.signal_condition {
                return self.eval_signal_condition(args, env);
            }
            if sym == sf.defclass {
                return self.eval_defclass(args, env);
            }
            if sym == sf.defgeneric {
                return self.eval_defgeneric(args, env);
            }
            if sym == sf.defmethod {
                return self.eval_defmethod(args, env);
            }
            if sym == sf.class {
                return self.eval_class(args);
            }
            if sym == sf.flet {
                return self.eval_flet(args, env, false);
            }
            if sym == sf.labels {
                return self.eval_flet(args, env, true);
            }
            if sym == sf.and {
                return self.eval_and(args, env);
            }
            if sym == sf.or {
                return self.eval_or(args, env);
            }
            if sym == sf.cond {
                return self.eval_cond(args, env);
            }
            if sym == sf.r#while {
                return self.eval_while(args, env);
            }
            if sym == sf.quasiquote {
                let (template, _) = self.expect_cons(args)?;
                return self.eval_quasiquote(template, 1, env);
            }

            // Macro expansion is eager and not cached.
            let expander = env
                .lookup_macro(sym)
                .or_else(|| self.machine.toplevel.macros.get(&sym).copied());
            if let Some(expander) = expander {
                let expansion = self.expand_macro(expander, args)?;
                return self.eval(expansion, env);
            }

            // Ordinary call: function namespace, then apply.
            let callee = env
                .lookup_fun(sym)
                .or_else(|| self.machine.toplevel.functions.get(&sym).copied());
            if let Some(callee) = callee {
                let argv = self.eval_args(args, env)?;
                return self.apply(callee, &argv);
            }

            let cond = self.machine.undefined_function(sym);
            return self.signal(cond, false);
        }

        // Operator is not a symbol: ((lambda ...) args) and friends.
        let callee = self.eval(head, env)?;
        let argv = self.eval_args(args, env)?;
        self.apply(callee, &argv)
    }

    /// Left-to-right; a token from any argument short-circuits the call.
    fn eval_args(&mut self, args: NodeId, env: &Env) -> Result<SmallVec<[NodeId; 8]>, Control> {
        let mut out: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut current = args;
        while let Node::Cons(arg, rest) = self.machine.arena.get_unchecked(current).clone() {
            out.push(self.eval(arg, env)?);
            current = rest;
        }
        Ok(out)
    }

    // =========================================================================
    // Application
    // =========================================================================

    /// Apply a callable to evaluated arguments.
    pub fn apply(&mut self, callee: NodeId, args: &[NodeId]) -> EvalResult {
        match self.machine.arena.get_unchecked(callee).clone() {
            Node::Leaf(Value::Closure(idx)) => self.apply_closure_idx(idx, args),
            Node::Leaf(Value::Native(idx)) => {
                let func = self.machine.natives[idx as usize];
                func(self, args)
            }
            Node::Leaf(Value::Generic(id)) => self.apply_generic(GenericId(id), args),
            _ => {
                let expected = self.machine.classes.function_class;
                Err(self.raise_domain_error(callee, expected))
            }
        }
    }

    fn apply_closure_idx(&mut self, idx: u32, args: &[NodeId]) -> EvalResult {
        let closure = match self.machine.closures.get(idx as usize) {
            Some(c) => c.clone(),
            None => return Err(self.raise_simple_error("invalid closure ~A", &[])),
        };
        if args.len() < closure.params.len()
            || (closure.rest.is_none() && args.len() > closure.params.len())
        {
            let form = self.machine.list(args);
            let cond = self.machine.arity_error(form);
            return self.signal(cond, false);
        }

        let call_env = closure.env.child();
        for (&param, &val) in closure.params.iter().zip(args.iter()) {
            call_env.bind_var(param, val);
        }
        if let Some(rest) = closure.rest {
            let rest_list = self.machine.list(&args[closure.params.len()..]);
            call_env.bind_var(rest, rest_list);
        }
        self.eval_body(closure.body, &call_env)
    }

    /// Apply a macro expander to the UNEVALUATED argument forms.
    fn expand_macro(&mut self, expander: NodeId, args: NodeId) -> EvalResult {
        let argv: Vec<NodeId> = {
            let mut out = Vec::new();
            let mut current = args;
            while let Node::Cons(arg, rest) = self.machine.arena.get_unchecked(current).clone() {
                out.push(arg);
                current = rest;
            }
            out
        };
        self.apply(expander, &argv)
    }

    // =========================================================================
    // Generic dispatch
    // =========================================================================

    fn apply_generic(&mut self, gf: GenericId, args: &[NodeId]) -> EvalResult {
        let (required, has_rest, precedence) = {
            let g = self.machine.classes.get_generic(gf).expect("generic exists");
            (g.required, g.has_rest, g.argument_precedence.clone())
        };
        if args.len() < required || (!has_rest && args.len() > required) {
            let form = self.machine.list(args);
            let cond = self.machine.arity_error(form);
            return self.signal(cond, false);
        }

        let arg_classes: Vec<ClassId> = args[..required]
            .iter()
            .map(|&a| self.machine.class_of(a))
            .collect();
        let mut applicable = self.machine.classes.compute_applicable(gf, &arg_classes);
        if applicable.is_empty() {
            let form = self.machine.list(args);
            return Err(self.raise_simple_error("no applicable method: ~S", &[form]));
        }
        if self
            .machine
            .classes
            .sort_by_specificity(&mut applicable, &arg_classes, precedence.as_deref())
            .is_err()
        {
            let c = self
                .machine
                .make_condition(self.machine.classes.method_combination_error, &[]);
            return self.signal(c, false);
        }

        let mut arounds = Vec::new();
        let mut befores = Vec::new();
        let mut primaries = Vec::new();
        let mut afters = Vec::new();
        for &mid in &applicable {
            match self.machine.classes.get_method(mid).unwrap().qualifier {
                MethodQualifier::Around => arounds.push(mid),
                MethodQualifier::Before => befores.push(mid),
                MethodQualifier::Primary => primaries.push(mid),
                MethodQualifier::After => afters.push(mid),
            }
        }
        afters.reverse(); // least-specific first
        if primaries.is_empty() {
            let form = self.machine.list(args);
            return Err(self.raise_simple_error("no primary method: ~S", &[form]));
        }

        self.machine.next_methods.push(NextMethodState {
            arounds,
            befores,
            primaries,
            afters,
            args: args.to_vec(),
            in_primary: false,
        });
        let result = self.invoke_next_method();
        self.machine.next_methods.pop();
        result
    }

    /// Advance the effective method: remaining :around methods first, then
    /// the core (:before, primary chain, :after).
    pub fn invoke_next_method(&mut self) -> EvalResult {
        enum Step {
            Method(MethodId),
            Core,
            Exhausted,
        }
        let step = {
            let state = self
                .machine
                .next_methods
                .last_mut()
                .expect("next-method state");
            if !state.in_primary {
                if state.arounds.is_empty() {
                    Step::Core
                } else {
                    Step::Method(state.arounds.remove(0))
                }
            } else if state.primaries.is_empty() {
                Step::Exhausted
            } else {
                Step::Method(state.primaries.remove(0))
            }
        };
        match step {
            Step::Method(mid) => {
                let args = self.machine.next_methods.last().unwrap().args.clone();
                self.invoke_method(mid, &args)
            }
            Step::Core => {
                let (befores, args) = {
                    let state = self.machine.next_methods.last_mut().unwrap();
                    state.in_primary = true;
                    (std::mem::take(&mut state.befores), state.args.clone())
                };
                for mid in befores {
                    self.invoke_method(mid, &args)?;
                }
                let result = self.invoke_next_method()?;
                let afters = {
                    let state = self.machine.next_methods.last_mut().unwrap();
                    std::mem::take(&mut state.afters)
                };
                for mid in afters {
                    self.invoke_method(mid, &args)?;
                }
                Ok(result)
            }
            Step::Exhausted => Err(self.raise_simple_error("no next method", &[])),
        }
    }

    pub fn has_next_method(&self) -> bool {
        match self.machine.next_methods.last() {
            Some(state) => {
                if state.in_primary {
                    !state.primaries.is_empty()
                } else {
                    true // an around always has the core beneath it
                }
            }
            None => false,
        }
    }

    fn invoke_method(&mut self, mid: MethodId, args: &[NodeId]) -> EvalResult {
        let body = self.machine.classes.get_method(mid).unwrap().body.clone();
        match body {
            MethodBody::Closure(idx) => self.apply_closure_idx(idx, args),
            MethodBody::SlotReader(name) => self.read_slot(args[0], name),
            MethodBody::SlotWriter(name) => {
                let value = args[0];
                let object = args[1];
                self.write_slot(object, name, value)?;
                Ok(value)
            }
            MethodBody::SlotBoundp(name) => {
                let bound = self.slot_is_bound(args[0], name);
                Ok(self.machine.bool_node(bound))
            }
        }
    }

    // =========================================================================
    // Slot access
    // =========================================================================

    pub fn read_slot(&mut self, object: NodeId, name: SymbolId) -> EvalResult {
        if let Node::Leaf(Value::Instance(i)) = self.machine.arena.get_unchecked(object) {
            let i = *i;
            let class = self.machine.classes.get_instance(i).unwrap().class;
            match self.machine.classes.slot_index(class, name) {
                Some(idx) => match self.machine.classes.get_instance(i).unwrap().slots[idx] {
                    Some(v) => Ok(v),
                    None => {
                        let n = self.machine.make_symbol(name);
                        Err(self.raise_simple_error("slot ~A is unbound", &[n]))
                    }
                },
                None => {
                    let n = self.machine.make_symbol(name);
                    Err(self.raise_simple_error("no slot named ~A", &[n]))
                }
            }
        } else {
            let expected = self.machine.classes.standard_object;
            Err(self.raise_domain_error(object, expected))
        }
    }

    pub fn write_slot(&mut self, object: NodeId, name: SymbolId, value: NodeId) -> EvalResult {
        if let Node::Leaf(Value::Instance(i)) = self.machine.arena.get_unchecked(object) {
            let i = *i;
            let class = self.machine.classes.get_instance(i).unwrap().class;
            match self.machine.classes.slot_index(class, name) {
                Some(idx) => {
                    self.machine.classes.get_instance_mut(i).unwrap().slots[idx] = Some(value);
                    Ok(value)
                }
                None => {
                    let n = self.machine.make_symbol(name);
                    Err(self.raise_simple_error("no slot named ~A", &[n]))
                }
            }
        } else {
            let expected = self.machine.classes.standard_object;
            Err(self.raise_domain_error(object, expected))
        }
    }

    pub fn slot_is_bound(&self, object: NodeId, name: SymbolId) -> bool {
        if let Node::Leaf(Value::Instance(i)) = self.machine.arena.get_unchecked(object) {
            let inst = self.machine.classes.get_instance(*i).unwrap();
            if let Some(idx) = self.machine.classes.slot_index(inst.class, name) {
                return inst.slots[idx].is_some();
            }
        }
        false
    }

    // =========================================================================
    // Special-form reducers
    // =========================================================================

    fn expect_cons(&mut self, node: NodeId) -> Result<(NodeId, NodeId), Control> {
        match self.machine.arena.get_unchecked(node) {
            Node::Cons(car, cdr) => Ok((*car, *cdr)),
            _ => Err(self.raise_program_error()),
        }
    }

    fn expect_symbol(&mut self, node: NodeId) -> Result<SymbolId, Control> {
        match self.machine.node_to_symbol(node) {
            Some(sym) => Ok(sym),
            None => {
                let expected = self.machine.classes.symbol_class;
                Err(self.raise_domain_error(node, expected))
            }
        }
    }

    /// (quote x) -> x unevaluated
    fn eval_quote(&mut self, args: NodeId) -> EvalResult {
        let (expr, _) = self.expect_cons(args)?;
        Ok(expr)
    }

    /// (if c t [e])
    fn eval_if(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (test, rest) = self.expect_cons(args)?;
        let (then_form, else_rest) = self.expect_cons(rest)?;
        let test_val = self.eval(test, env)?;
        if self.machine.is_truthy(test_val) {
            self.eval(then_form, env)
        } else if let Some(else_form) = self.machine.car(else_rest) {
            self.eval(else_form, env)
        } else {
            Ok(self.machine.make_nil())
        }
    }

    /// (let ((v e)...) body...) — all initializers evaluated first, then
    /// bound simultaneously.
    fn eval_let(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (bindings, body) = self.expect_cons(args)?;
        let mut pairs: Vec<(SymbolId, NodeId)> = Vec::new();
        let mut current = bindings;
        while let Node::Cons(binding, rest) = self.machine.arena.get_unchecked(current).clone() {
            let (sym, init) = self.parse_binding(binding)?;
            let val = match init {
                Some(form) => self.eval(form, env)?,
                None => self.machine.make_nil(),
            };
            pairs.push((sym, val));
            current = rest;
        }
        let inner = env.child();
        for (sym, val) in pairs {
            inner.bind_var(sym, val);
        }
        self.eval_body(body, &inner)
    }

    /// (let* ((v e)...) body...) — sequential binding.
    fn eval_let_star(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (bindings, body) = self.expect_cons(args)?;
        let inner = env.child();
        let mut current = bindings;
        while let Node::Cons(binding, rest) = self.machine.arena.get_unchecked(current).clone() {
            let (sym, init) = self.parse_binding(binding)?;
            let val = match init {
                Some(form) => self.eval(form, &inner)?,
                None => self.machine.make_nil(),
            };
            inner.bind_var(sym, val);
            current = rest;
        }
        self.eval_body(body, &inner)
    }

    /// Binding spec: symbol, or (symbol form)
    fn parse_binding(&mut self, binding: NodeId) -> Result<(SymbolId, Option<NodeId>), Control> {
        if let Some(sym) = self.machine.node_to_symbol(binding) {
            return Ok((sym, None));
        }
        let (name, rest) = self.expect_cons(binding)?;
        let sym = self.expect_symbol(name)?;
        Ok((sym, self.machine.car(rest)))
    }

    /// (lambda (params...) body...)
    fn eval_lambda(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (params, body) = self.expect_cons(args)?;
        self.make_closure(params, body, env)
    }

    fn make_closure(&mut self, params: NodeId, body: NodeId, env: &Env) -> EvalResult {
        let (params, rest) = self.parse_lambda_list(params)?;
        let closure = Closure {
            params,
            rest,
            body,
            env: env.clone(),
        };
        let idx = self.machine.closures.len() as u32;
        self.machine.closures.push(closure);
        Ok(self
            .machine
            .arena
            .alloc(Node::Leaf(Value::Closure(idx))))
    }

    /// Required parameters, optionally closed by ":rest sym" / "&rest sym".
    fn parse_lambda_list(
        &mut self,
        params: NodeId,
    ) -> Result<(Vec<SymbolId>, Option<SymbolId>), Control> {
        let mut required = Vec::new();
        let mut rest = None;
        let mut current = params;
        while let Node::Cons(param, tail) = self.machine.arena.get_unchecked(current).clone() {
            let sym = self.expect_symbol(param)?;
            if sym == self.machine.rest_kw || sym == self.machine.amp_rest {
                let (rest_param, after) = self.expect_cons(tail)?;
                rest = Some(self.expect_symbol(rest_param)?);
                if !self.machine.is_nil(after) {
                    return Err(self.raise_program_error());
                }
                return Ok((required, rest));
            }
            required.push(sym);
            current = tail;
        }
        Ok((required, rest))
    }

    /// (function f) — f a function name or a lambda form
    fn eval_function(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (designator, _) = self.expect_cons(args)?;
        if let Some(sym) = self.machine.node_to_symbol(designator) {
            if let Some(f) = env
                .lookup_fun(sym)
                .or_else(|| self.machine.toplevel.functions.get(&sym).copied())
            {
                return Ok(f);
            }
            let cond = self.machine.undefined_function(sym);
            return self.signal(cond, false);
        }
        if let Node::Cons(head, _) = self.machine.arena.get_unchecked(designator) {
            if self.machine.node_to_symbol(*head) == Some(self.machine.special.lambda) {
                return self.eval(designator, env);
            }
        }
        let expected = self.machine.classes.function_class;
        Err(self.raise_domain_error(designator, expected))
    }

    /// (defun name (params...) body...) — top-level function
    fn eval_defun(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (params, body) = self.expect_cons(rest)?;
        let closure = self.make_closure(params, body, env)?;
        self.machine.toplevel.functions.insert(name, closure);
        Ok(name_node)
    }

    /// (defmacro name (params...) body...) — top-level macro
    fn eval_defmacro(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        // A macro must not shadow a special form.
        if self.machine.special.is_special(name) {
            return Err(self.raise_program_error());
        }
        let (params, body) = self.expect_cons(rest)?;
        let closure = self.make_closure(params, body, env)?;
        self.machine.toplevel.macros.insert(name, closure);
        Ok(name_node)
    }

    /// (defglobal name form)
    fn eval_defglobal(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (form, _) = self.expect_cons(rest)?;
        let val = self.eval(form, env)?;
        self.machine.toplevel.variables.insert(name, val);
        Ok(name_node)
    }

    /// (defdynamic name form)
    fn eval_defdynamic(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (form, _) = self.expect_cons(rest)?;
        let val = self.eval(form, env)?;
        self.machine.toplevel.dynamics.insert(name, val);
        Ok(name_node)
    }

    /// (dynamic var)
    fn eval_dynamic(&mut self, args: NodeId) -> EvalResult {
        let (name_node, _) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        match self.machine.dynamic_lookup(name) {
            Some(v) => Ok(v),
            None => {
                let cond = self.machine.unbound_variable(name);
                self.signal(cond, true)
            }
        }
    }

    /// (dynamic-let ((v e)...) body...) — bindings popped on every exit path
    fn eval_dynamic_let(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (bindings, body) = self.expect_cons(args)?;
        let mut pairs: Vec<(SymbolId, NodeId)> = Vec::new();
        let mut current = bindings;
        while let Node::Cons(binding, rest) = self.machine.arena.get_unchecked(current).clone() {
            let (sym, init) = self.parse_binding(binding)?;
            let val = match init {
                Some(form) => self.eval(form, env)?,
                None => self.machine.make_nil(),
            };
            pairs.push((sym, val));
            current = rest;
        }
        let mark = self.machine.dynamic_stack.len();
        self.machine.dynamic_stack.extend(pairs);
        let result = self.eval_body(body, env);
        self.machine.dynamic_stack.truncate(mark);
        result
    }

    /// (setq name form)
    fn eval_setq(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (form, _) = self.expect_cons(rest)?;
        let val = self.eval(form, env)?;
        if env.set_var(name, val) {
            return Ok(val);
        }
        if self.machine.toplevel.variables.contains_key(&name) {
            self.machine.toplevel.variables.insert(name, val);
            return Ok(val);
        }
        let cond = self.machine.unbound_variable(name);
        self.signal(cond, false)
    }

    /// (setf place form) — table of place handlers
    fn eval_setf(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (place, rest) = self.expect_cons(args)?;
        let (form, _) = self.expect_cons(rest)?;

        // Plain variable: setq
        if self.machine.node_to_symbol(place).is_some() {
            let pair = self.machine.cons(form, self.machine.nil_node);
            let two = self.machine.cons(place, pair);
            return self.eval_setq(two, env);
        }

        // Place subforms are evaluated before the value form, in textual
        // order.
        let (head, place_args) = self.expect_cons(place)?;
        let head_sym = self.expect_symbol(head)?;
        let sf = self.machine.special;

        if head_sym == sf.car || head_sym == sf.cdr {
            let (cell_form, _) = self.expect_cons(place_args)?;
            let cell = self.eval(cell_form, env)?;
            let value = self.eval(form, env)?;
            let (car, cdr) = match self.machine.arena.get_unchecked(cell) {
                Node::Cons(a, d) => (*a, *d),
                _ => {
                    let expected = self.machine.classes.cons_class;
                    return Err(self.raise_domain_error(cell, expected));
                }
            };
            if head_sym == sf.car {
                self.machine.arena.overwrite(cell, Node::Cons(value, cdr));
            } else {
                self.machine.arena.overwrite(cell, Node::Cons(car, value));
            }
            return Ok(value);
        }

        if head_sym == sf.elt || head_sym == sf.aref {
            let argv = self.eval_args(place_args, env)?;
            if argv.len() < 2 {
                return Err(self.raise_program_error());
            }
            let value = self.eval(form, env)?;
            return self.set_element(argv[0], &argv[1..], value);
        }

        if head_sym == sf.dynamic {
            let (name_node, _) = self.expect_cons(place_args)?;
            let name = self.expect_symbol(name_node)?;
            let value = self.eval(form, env)?;
            if self.machine.dynamic_set(name, value) {
                return Ok(value);
            }
            let cond = self.machine.unbound_variable(name);
            return self.signal(cond, false);
        }

        if head_sym == sf.slot_value {
            let argv = self.eval_args(place_args, env)?;
            if argv.len() != 2 {
                return Err(self.raise_program_error());
            }
            let value = self.eval(form, env)?;
            let slot = self.expect_symbol(argv[1])?;
            return self.write_slot(argv[0], slot, value);
        }

        // Slot accessor place installed by defclass :accessor
        if let Some(slot) = self.machine.classes.setf_slot(head_sym) {
            let argv = self.eval_args(place_args, env)?;
            if argv.len() != 1 {
                return Err(self.raise_program_error());
            }
            let value = self.eval(form, env)?;
            return self.write_slot(argv[0], slot, value);
        }

        Err(self.raise_program_error())
    }

    /// Indexed assignment into lists, vectors, strings and arrays.
    fn set_element(&mut self, seq: NodeId, indices: &[NodeId], value: NodeId) -> EvalResult {
        let mut subs = Vec::with_capacity(indices.len());
        for &i in indices {
            match self.machine.arena.get_unchecked(i) {
                Node::Leaf(Value::Integer(n)) if *n >= 0 => subs.push(*n as usize),
                _ => {
                    let expected = self.machine.classes.integer_class;
                    return Err(self.raise_domain_error(i, expected));
                }
            }
        }
        match self.machine.arena.get_unchecked(seq).clone() {
            Node::Cons(_, _) => {
                if subs.len() != 1 {
                    return Err(self.raise_program_error());
                }
                let mut current = seq;
                for _ in 0..subs[0] {
                    current = match self.machine.cdr(current) {
                        Some(c) => c,
                        None => {
                            let expected = self.machine.classes.cons_class;
                            return Err(self.raise_domain_error(seq, expected));
                        }
                    };
                }
                match self.machine.arena.get_unchecked(current) {
                    Node::Cons(_, cdr) => {
                        let cdr = *cdr;
                        self.machine.arena.overwrite(current, Node::Cons(value, cdr));
                        Ok(value)
                    }
                    _ => {
                        let expected = self.machine.classes.cons_class;
                        Err(self.raise_domain_error(seq, expected))
                    }
                }
            }
            Node::Leaf(Value::Vector(h)) => {
                let vid = VectorId(h);
                let index = {
                    let arr = match self.machine.arrays.get(vid) {
                        Some(a) => a,
                        None => return Err(self.raise_program_error()),
                    };
                    match arr.row_major_index(&subs) {
                        Some(i) => i,
                        None => {
                            let expected = self.machine.classes.integer_class;
                            return Err(self.raise_domain_error(indices[0], expected));
                        }
                    }
                };
                let is_string = self.machine.arrays.get(vid).map_or(false, |a| a.is_string());
                if is_string {
                    match self.machine.arena.get_unchecked(value) {
                        Node::Leaf(Value::Character(c)) => {
                            self.machine.arrays.set_char(vid, index, *c);
                            Ok(value)
                        }
                        _ => {
                            let expected = self.machine.classes.character_class;
                            Err(self.raise_domain_error(value, expected))
                        }
                    }
                } else {
                    self.machine.arrays.set_general(vid, index, value);
                    Ok(value)
                }
            }
            _ => {
                let expected = self.machine.classes.basic_array;
                Err(self.raise_domain_error(seq, expected))
            }
        }
    }

    /// Block tag designator: a bare symbol or a quoted one.
    fn block_tag(&mut self, node: NodeId, env: &Env) -> Result<SymbolId, Control> {
        if let Some(sym) = self.machine.node_to_symbol(node) {
            return Ok(sym);
        }
        let val = self.eval(node, env)?;
        self.expect_symbol(val)
    }

    /// (block tag body...)
    fn eval_block(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (tag_form, body) = self.expect_cons(args)?;
        let tag = self.block_tag(tag_form, env)?;
        let id = self.machine.new_block_id();
        let inner = env.child();
        inner.bind_block(tag, id);
        match self.eval_body(body, &inner) {
            Err(Control::Return { block, value }) if block == id => Ok(value),
            other => other,
        }
    }

    /// (return-from tag [form])
    fn eval_return_from(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (tag_form, rest) = self.expect_cons(args)?;
        let tag = self.block_tag(tag_form, env)?;
        let block = match env.lookup_block(tag) {
            Some(id) => id,
            None => {
                let name = self.machine.make_symbol(tag);
                let cond = self.machine.control_error(name);
                return self.signal(cond, false);
            }
        };
        let value = match self.machine.car(rest) {
            Some(form) => self.eval(form, env)?,
            None => self.machine.make_nil(),
        };
        Err(Control::Return { block, value })
    }

    /// (tagbody {label | statement}*) — labels are symbols, statements are
    /// non-symbols. Completion yields nil.
    fn eval_tagbody(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let mut labels: HashMap<SymbolId, usize> = HashMap::new();
        let mut items: Vec<(Option<SymbolId>, NodeId)> = Vec::new();
        let mut current = args;
        while let Node::Cons(item, rest) = self.machine.arena.get_unchecked(current).clone() {
            match self.machine.node_to_symbol(item) {
                Some(sym) => {
                    labels.insert(sym, items.len());
                    items.push((Some(sym), item));
                }
                None => items.push((None, item)),
            }
            current = rest;
        }

        let id = self.machine.new_tagbody_id();
        let inner = env.child();
        for &label in labels.keys() {
            inner.bind_tag(label, id);
        }

        let mut pc = 0;
        while pc < items.len() {
            let (label, stmt) = items[pc];
            if label.is_none() {
                match self.eval(stmt, &inner) {
                    Ok(_) => {}
                    Err(Control::Go { tagbody, tag }) if tagbody == id => {
                        match labels.get(&tag) {
                            Some(&target) => {
                                pc = target;
                                continue;
                            }
                            None => return Err(Control::Go { tagbody, tag }),
                        }
                    }
                    Err(tok) => return Err(tok),
                }
            }
            pc += 1;
        }
        Ok(self.machine.make_nil())
    }

    /// (go label)
    fn eval_go(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (label_node, _) = self.expect_cons(args)?;
        let label = self.expect_symbol(label_node)?;
        match env.lookup_tag(label) {
            Some(tagbody) => Err(Control::Go { tagbody, tag: label }),
            None => {
                let name = self.machine.make_symbol(label);
                let cond = self.machine.control_error(name);
                self.signal(cond, false)
            }
        }
    }

    /// (catch tag-form body...) — tag compared by eql
    fn eval_catch(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (tag_form, body) = self.expect_cons(args)?;
        let tag = self.eval(tag_form, env)?;
        match self.eval_body(body, env) {
            Err(Control::Throw { tag: thrown, value }) if self.machine.eql(thrown, tag) => {
                Ok(value)
            }
            other => other,
        }
    }

    /// (throw tag-form value-form)
    fn eval_throw(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (tag_form, rest) = self.expect_cons(args)?;
        let tag = self.eval(tag_form, env)?;
        let value = match self.machine.car(rest) {
            Some(form) => self.eval(form, env)?,
            None => self.machine.make_nil(),
        };
        Err(Control::Throw { tag, value })
    }

    /// (unwind-protect protected cleanup...) — cleanup runs exactly once on
    /// every exit path; a token signaled from cleanup replaces the one in
    /// flight.
    fn eval_unwind_protect(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (protected, cleanup) = self.expect_cons(args)?;
        let result = self.eval(protected, env);
        let mut current = cleanup;
        while let Node::Cons(form, rest) = self.machine.arena.get_unchecked(current).clone() {
            self.eval(form, env)?;
            current = rest;
        }
        result
    }

    /// (with-handler handler-form body...)
    fn eval_with_handler(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (handler_form, body) = self.expect_cons(args)?;
        let handler = self.eval(handler_form, env)?;
        match self.machine.arena.get_unchecked(handler) {
            Node::Leaf(Value::Closure(_)) | Node::Leaf(Value::Native(_))
            | Node::Leaf(Value::Generic(_)) => {}
            _ => {
                let expected = self.machine.classes.function_class;
                return Err(self.raise_domain_error(handler, expected));
            }
        }
        let mark = self.machine.conditions.handler_depth();
        self.machine.conditions.push_handler(Handler {
            class: self.machine.classes.serious_condition,
            function: handler,
        });
        let result = self.eval_body(body, env);
        self.machine.conditions.truncate_handlers(mark);
        result
    }

    /// (signal-condition condition-form continuable-form)
    fn eval_signal_condition(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (cond_form, rest) = self.expect_cons(args)?;
        let condition = self.eval(cond_form, env)?;
        if !self
            .machine
            .instance_of(condition, self.machine.classes.serious_condition)
        {
            let expected = self.machine.classes.serious_condition;
            return Err(self.raise_domain_error(condition, expected));
        }
        let continuable = match self.machine.car(rest) {
            Some(form) => {
                let v = self.eval(form, env)?;
                self.machine.is_truthy(v)
            }
            None => false,
        };
        self.signal(condition, continuable)
    }

    /// (class name) -> the class object
    fn eval_class(&mut self, args: NodeId) -> EvalResult {
        let (name_node, _) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        match self.machine.classes.find_class(name) {
            Some(id) => Ok(self.machine.make_class_node(id)),
            None => {
                let cond = self.machine.undefined_class(name);
                self.signal(cond, false)
            }
        }
    }

    /// (flet ((name (params) body...)...) body...) — labels: recursive
    fn eval_flet(&mut self, args: NodeId, env: &Env, recursive: bool) -> EvalResult {
        let (defs, body) = self.expect_cons(args)?;
        let inner = env.child();
        let capture_env = if recursive { inner.clone() } else { env.clone() };
        let mut current = defs;
        while let Node::Cons(def, rest) = self.machine.arena.get_unchecked(current).clone() {
            let (name_node, def_rest) = self.expect_cons(def)?;
            let name = self.expect_symbol(name_node)?;
            let (params, fn_body) = self.expect_cons(def_rest)?;
            let closure = self.make_closure(params, fn_body, &capture_env)?;
            inner.bind_fun(name, closure);
            current = rest;
        }
        self.eval_body(body, &inner)
    }

    /// (and form*) — nil short-circuits; t when empty
    fn eval_and(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let mut result = self.machine.make_t();
        let mut current = args;
        while let Node::Cons(form, rest) = self.machine.arena.get_unchecked(current).clone() {
            result = self.eval(form, env)?;
            if self.machine.is_nil(result) {
                return Ok(result);
            }
            current = rest;
        }
        Ok(result)
    }

    /// (or form*) — first non-nil wins
    fn eval_or(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let mut current = args;
        while let Node::Cons(form, rest) = self.machine.arena.get_unchecked(current).clone() {
            let result = self.eval(form, env)?;
            if self.machine.is_truthy(result) {
                return Ok(result);
            }
            current = rest;
        }
        Ok(self.machine.make_nil())
    }

    /// (cond (test body...)*)
    fn eval_cond(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let mut current = args;
        while let Node::Cons(clause, rest) = self.machine.arena.get_unchecked(current).clone() {
            let (test, body) = self.expect_cons(clause)?;
            let test_val = self.eval(test, env)?;
            if self.machine.is_truthy(test_val) {
                if self.machine.is_nil(body) {
                    return Ok(test_val);
                }
                return self.eval_body(body, env);
            }
            current = rest;
        }
        Ok(self.machine.make_nil())
    }

    /// (while test body...) -> nil
    fn eval_while(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (test, body) = self.expect_cons(args)?;
        loop {
            let t = self.eval(test, env)?;
            if self.machine.is_nil(t) {
                return Ok(self.machine.make_nil());
            }
            self.eval_body(body, env)?;
        }
    }

    // =========================================================================
    // Quasiquote
    // =========================================================================

    fn eval_quasiquote(&mut self, template: NodeId, depth: usize, env: &Env) -> EvalResult {
        let sf = self.machine.special;
        match self.machine.arena.get_unchecked(template).clone() {
            Node::Cons(head, rest) => {
                let head_sym = self.machine.node_to_symbol(head);
                if head_sym == Some(sf.unquote) {
                    let (form, _) = self.expect_cons(rest)?;
                    if depth == 1 {
                        return self.eval(form, env);
                    }
                    let inner = self.eval_quasiquote(form, depth - 1, env)?;
                    let uq = self.machine.make_symbol(sf.unquote);
                    return Ok(self.machine.list(&[uq, inner]));
                }
                if head_sym == Some(sf.quasiquote) {
                    let (form, _) = self.expect_cons(rest)?;
                    let inner = self.eval_quasiquote(form, depth + 1, env)?;
                    let qq = self.machine.make_symbol(sf.quasiquote);
                    return Ok(self.machine.list(&[qq, inner]));
                }
                self.eval_quasiquote_list(template, depth, env)
            }
            _ => Ok(template),
        }
    }

    /// Rebuild a (possibly dotted) list template, splicing where asked.
    fn eval_quasiquote_list(&mut self, list: NodeId, depth: usize, env: &Env) -> EvalResult {
        let sf = self.machine.special;
        let mut elements: Vec<NodeId> = Vec::new();
        let mut tail = self.machine.make_nil();
        let mut current = list;
        loop {
            match self.machine.arena.get_unchecked(current).clone() {
                Node::Cons(head, rest) => {
                    // (a . ,b) reads as (a unquote b): unquote in cdr position
                    if self.machine.node_to_symbol(head) == Some(sf.unquote) && depth == 1 {
                        let (form, _) = self.expect_cons(rest)?;
                        tail = self.eval(form, env)?;
                        break;
                    }
                    // ,@x element at depth 1 splices
                    let mut spliced = false;
                    if let Node::Cons(inner_head, inner_rest) =
                        self.machine.arena.get_unchecked(head).clone()
                    {
                        if self.machine.node_to_symbol(inner_head) == Some(sf.unquote_splicing)
                            && depth == 1
                        {
                            let (form, _) = self.expect_cons(inner_rest)?;
                            let value = self.eval(form, env)?;
                            match self.machine.list_to_vec(value) {
                                Some(items) => elements.extend(items),
                                None => {
                                    let expected = self.machine.classes.list_class;
                                    return Err(self.raise_domain_error(value, expected));
                                }
                            }
                            spliced = true;
                        }
                    }
                    if !spliced {
                        let item = self.eval_quasiquote(head, depth, env)?;
                        elements.push(item);
                    }
                    current = rest;
                }
                Node::Leaf(Value::Nil) => break,
                _ => {
                    tail = self.eval_quasiquote(current, depth, env)?;
                    break;
                }
            }
        }
        let mut result = tail;
        for &item in elements.iter().rev() {
            result = self.machine.cons(item, result);
        }
        Ok(result)
    }

    // =========================================================================
    // Object system forms
    // =========================================================================

    /// (defclass name (supers...) (slot-specs...) class-opts...)
    fn eval_defclass(&mut self, args: NodeId, _env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (supers_node, rest2) = self.expect_cons(rest)?;
        let (slots_node, opts) = self.expect_cons(rest2)?;

        let mut supers = Vec::new();
        let mut current = supers_node;
        while let Node::Cons(super_name, next) = self.machine.arena.get_unchecked(current).clone()
        {
            let sym = self.expect_symbol(super_name)?;
            match self.machine.classes.find_class(sym) {
                Some(id) => supers.push(id),
                None => {
                    let cond = self.machine.undefined_class(sym);
                    return self.signal(cond, false);
                }
            }
            current = next;
        }

        let mut slots = Vec::new();
        let mut current = slots_node;
        while let Node::Cons(spec, next) = self.machine.arena.get_unchecked(current).clone() {
            slots.push(self.parse_slot_spec(spec)?);
            current = next;
        }

        let mut abstractp = false;
        let mut current = opts;
        while let Node::Cons(opt, next) = self.machine.arena.get_unchecked(current).clone() {
            if let Node::Cons(key, val_rest) = self.machine.arena.get_unchecked(opt).clone() {
                if let Some(key_sym) = self.machine.node_to_symbol(key) {
                    if self.machine.symbols.symbol_name(key_sym) == Some(":ABSTRACTP") {
                        if let Some(v) = self.machine.car(val_rest) {
                            abstractp = self.machine.is_truthy(v);
                        }
                    }
                }
            }
            current = next;
        }

        let class_id = match self
            .machine
            .classes
            .define_class(name, supers, slots.clone(), abstractp)
        {
            Ok(id) => id,
            Err(()) => {
                let cond = self.machine.class_error(name_node);
                return self.signal(cond, false);
            }
        };

        // Slot options install accessor methods on (auto-created) generics.
        let object = self.machine.classes.object_class;
        for slot in &slots {
            for &reader in &slot.readers {
                self.install_slot_method(
                    reader,
                    1,
                    vec![class_id],
                    MethodBody::SlotReader(slot.name),
                );
            }
            for &writer in &slot.writers {
                self.install_slot_method(
                    writer,
                    2,
                    vec![object, class_id],
                    MethodBody::SlotWriter(slot.name),
                );
            }
            for &boundp in &slot.boundps {
                self.install_slot_method(
                    boundp,
                    1,
                    vec![class_id],
                    MethodBody::SlotBoundp(slot.name),
                );
            }
        }

        Ok(name_node)
    }

    /// Slot spec: name | (name {:reader r | :writer w | :accessor a |
    /// :boundp b | :initarg k | :initform form}*)
    fn parse_slot_spec(&mut self, spec: NodeId) -> Result<SlotDefinition, Control> {
        let mut slot = SlotDefinition {
            name: self.machine.nil_sym,
            initarg: None,
            initform: None,
            readers: Vec::new(),
            writers: Vec::new(),
            boundps: Vec::new(),
            index: 0,
        };
        if let Some(sym) = self.machine.node_to_symbol(spec) {
            slot.name = sym;
            return Ok(slot);
        }
        let (name_node, mut current) = self.expect_cons(spec)?;
        slot.name = self.expect_symbol(name_node)?;
        while let Node::Cons(key, rest) = self.machine.arena.get_unchecked(current).clone() {
            let key_sym = self.expect_symbol(key)?;
            let (val, next) = self.expect_cons(rest)?;
            match self.machine.symbols.symbol_name(key_sym) {
                Some(":READER") => slot.readers.push(self.expect_symbol(val)?),
                Some(":WRITER") => slot.writers.push(self.expect_symbol(val)?),
                Some(":ACCESSOR") => {
                    let acc = self.expect_symbol(val)?;
                    slot.readers.push(acc);
                    self.machine.classes.register_setf_accessor(acc, slot.name);
                }
                Some(":BOUNDP") => slot.boundps.push(self.expect_symbol(val)?),
                Some(":INITARG") => slot.initarg = Some(self.expect_symbol(val)?),
                Some(":INITFORM") => slot.initform = Some(val),
                _ => return Err(self.raise_program_error()),
            }
            current = next;
        }
        Ok(slot)
    }

    fn install_slot_method(
        &mut self,
        name: SymbolId,
        required: usize,
        specializers: Vec<ClassId>,
        body: MethodBody,
    ) {
        let gf = match self.machine.classes.find_generic(name) {
            Some(id) => id,
            None => self.machine.classes.define_generic(name, required, false, None),
        };
        self.ensure_generic_binding(name, gf);
        self.machine
            .classes
            .add_method(gf, MethodQualifier::Primary, specializers, body);
    }

    fn ensure_generic_binding(&mut self, name: SymbolId, gf: GenericId) {
        let node = self.machine.arena.alloc(Node::Leaf(Value::Generic(gf.0)));
        self.machine.toplevel.functions.insert(name, node);
    }

    /// (defgeneric name (lambda-list) {(:argument-precedence-order p*)}*)
    fn eval_defgeneric(&mut self, args: NodeId, _env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (lambda_list, opts) = self.expect_cons(rest)?;
        let (params, rest_param) = self.parse_lambda_list(lambda_list)?;

        let mut precedence = None;
        let mut current = opts;
        while let Node::Cons(opt, next) = self.machine.arena.get_unchecked(current).clone() {
            if let Node::Cons(key, vals) = self.machine.arena.get_unchecked(opt).clone() {
                if let Some(key_sym) = self.machine.node_to_symbol(key) {
                    if self.machine.symbols.symbol_name(key_sym)
                        == Some(":ARGUMENT-PRECEDENCE-ORDER")
                    {
                        let mut order = Vec::new();
                        let mut v = vals;
                        while let Node::Cons(p, n) = self.machine.arena.get_unchecked(v).clone() {
                            let p_sym = self.expect_symbol(p)?;
                            match params.iter().position(|&x| x == p_sym) {
                                Some(i) => order.push(i),
                                None => return Err(self.raise_program_error()),
                            }
                            v = n;
                        }
                        precedence = Some(order);
                    }
                }
            }
            current = next;
        }

        let gf = self.machine.classes.define_generic(
            name,
            params.len(),
            rest_param.is_some(),
            precedence,
        );
        self.ensure_generic_binding(name, gf);
        Ok(name_node)
    }

    /// (defmethod name [qualifier] (param-specs...) body...)
    fn eval_defmethod(&mut self, args: NodeId, env: &Env) -> EvalResult {
        let (name_node, rest) = self.expect_cons(args)?;
        let name = self.expect_symbol(name_node)?;
        let (second, rest2) = self.expect_cons(rest)?;

        let (qualifier, params_node, body) = match self.machine.node_to_symbol(second) {
            Some(q) if self.machine.symbols.is_keyword(q) => {
                let qualifier = match self.machine.symbols.symbol_name(q) {
                    Some(":BEFORE") => MethodQualifier::Before,
                    Some(":AFTER") => MethodQualifier::After,
                    Some(":AROUND") => MethodQualifier::Around,
                    _ => return Err(self.raise_program_error()),
                };
                let (params, body) = self.expect_cons(rest2)?;
                (qualifier, params, body)
            }
            _ => (MethodQualifier::Primary, second, rest2),
        };

        // Parameter specs: (p <class>) | p | {:rest|&rest} r
        let mut params: Vec<SymbolId> = Vec::new();
        let mut specializers: Vec<ClassId> = Vec::new();
        let mut rest_param = None;
        let mut current = params_node;
        while let Node::Cons(spec, next) = self.machine.arena.get_unchecked(current).clone() {
            if let Some(sym) = self.machine.node_to_symbol(spec) {
                if sym == self.machine.rest_kw || sym == self.machine.amp_rest {
                    let (rp, _) = self.expect_cons(next)?;
                    rest_param = Some(self.expect_symbol(rp)?);
                    break;
                }
                params.push(sym);
                specializers.push(self.machine.classes.object_class);
            } else {
                let (pname, ptype) = self.expect_cons(spec)?;
                params.push(self.expect_symbol(pname)?);
                let (cname, _) = self.expect_cons(ptype)?;
                let csym = self.expect_symbol(cname)?;
                match self.machine.classes.find_class(csym) {
                    Some(cid) => specializers.push(cid),
                    None => {
                        let cond = self.machine.undefined_class(csym);
                        return self.signal(cond, false);
                    }
                }
            }
            current = next;
        }

        let gf = match self.machine.classes.find_generic(name) {
            Some(id) => {
                let g = self.machine.classes.get_generic(id).unwrap();
                if g.required != params.len() {
                    return Err(self.raise_program_error());
                }
                id
            }
            None => {
                let id = self.machine.classes.define_generic(
                    name,
                    params.len(),
                    rest_param.is_some(),
                    None,
                );
                id
            }
        };
        self.ensure_generic_binding(name, gf);

        let closure = Closure {
            params,
            rest: rest_param,
            body,
            env: env.clone(),
        };
        let idx = self.machine.closures.len() as u32;
        self.machine.closures.push(closure);
        self.machine
            .classes
            .add_method(gf, qualifier, specializers, MethodBody::Closure(idx));
        Ok(name_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn eval_str(m: &mut Machine, input: &str) -> EvalResult {
        let expr = crate::reader::read_from_string(input, m).unwrap();
        let mut interp = Interpreter::new(m);
        interp.eval_toplevel(expr, &Env::new())
    }

    fn assert_int(m: &Machine, result: EvalResult, expected: i64) {
        let node = result.expect("evaluation succeeded");
        match m.arena.get_unchecked(node) {
            Node::Leaf(Value::Integer(n)) => assert_eq!(*n, expected),
            other => panic!("expected integer {}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_self_evaluating() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "42");
        assert_int(&m, r, 42);
        let t = eval_str(&mut m, "t").unwrap();
        assert!(m.eq(t, m.t_node));
        let nil = eval_str(&mut m, "nil").unwrap();
        assert!(m.is_nil(nil));
    }

    #[test]
    fn test_if_and_progn() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "(if nil 1 (progn 2 3))");
        assert_int(&m, r, 3);
        let r = eval_str(&mut m, "(if t 1)");
        assert_int(&m, r, 1);
        let r = eval_str(&mut m, "(if nil 1)").unwrap();
        assert!(m.is_nil(r));
    }

    #[test]
    fn test_let_is_parallel() {
        let mut m = Machine::new();
        eval_str(&mut m, "(defglobal x 1)").unwrap();
        // The inner x init must see the outer x, not the sibling binding.
        let r = eval_str(&mut m, "(let ((x 10) (y x)) y)");
        assert_int(&m, r, 1);
        let r = eval_str(&mut m, "(let* ((x 10) (y x)) y)");
        assert_int(&m, r, 10);
    }

    #[test]
    fn test_lexical_closure_capture() {
        let mut m = Machine::new();
        // A tiny native stand-in for +
        m.register_native("TINY-ADD", |interp, args| {
            let a = match interp.machine.arena.get_unchecked(args[0]) {
                Node::Leaf(Value::Integer(n)) => *n,
                _ => 0,
            };
            let b = match interp.machine.arena.get_unchecked(args[1]) {
                Node::Leaf(Value::Integer(n)) => *n,
                _ => 0,
            };
            Ok(interp.machine.make_integer(a + b))
        });
        let r = eval_str(&mut m, "((lambda (x) (tiny-add x 1)) 41)");
        assert_int(&m, r, 42);
        // flet closes over the lexical n
        let r = eval_str(
            &mut m,
            "(let ((n 5)) (flet ((g (x) (tiny-add x n))) (g 1)))",
        );
        assert_int(&m, r, 6);
        // labels permits recursion
        m.register_native("TINY-ZEROP", |interp, args| {
            let z = matches!(
                interp.machine.arena.get_unchecked(args[0]),
                Node::Leaf(Value::Integer(0))
            );
            Ok(interp.machine.bool_node(z))
        });
        let r = eval_str(
            &mut m,
            "(labels ((count-down (n acc) \
                        (if (tiny-zerop n) acc (count-down (tiny-add n -1) (tiny-add acc 1))))) \
               (count-down 3 0))",
        );
        assert_int(&m, r, 3);
    }

    #[test]
    fn test_setq_assigns_innermost() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "(let ((x 1)) (setq x 5) x)");
        assert_int(&m, r, 5);
    }

    #[test]
    fn test_unbound_variable_signals() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "no-such-variable");
        match r {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.unbound_variable));
            }
            other => panic!("expected unbound-variable, got {:?}", other),
        }
    }

    #[test]
    fn test_block_absorbs_its_own_return() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "(block foo 1 (return-from foo 2) 3)");
        assert_int(&m, r, 2);
    }

    #[test]
    fn test_quasiquote() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "`(1 ,(quote x) ,@(quote (2 3)))").unwrap();
        let printed = crate::printer::print_to_string(&m, r);
        assert_eq!(printed, "(1 X 2 3)");
    }

    #[test]
    fn test_macro_cannot_shadow_special_form() {
        let mut m = Machine::new();
        let r = eval_str(&mut m, "(defmacro if (a) a)");
        match r {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.program_error));
            }
            other => panic!("expected program-error, got {:?}", other),
        }
    }
}
