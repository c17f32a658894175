// Islet Machine - Interpreter State
//
// Aggregates the arena, symbol table, class registry, side stores, the
// top-level environment, and the dynamic stacks (dynamic variables,
// condition handlers, next-method chains). The evaluator borrows a Machine
// for the duration of an evaluation.

use crate::arena::{Arena, Node};
use crate::arrays::{ArrayStore, VectorId};
use crate::classes::{ClassId, ClassRegistry};
use crate::conditions::ConditionSystem;
use crate::env::{BlockId, TagbodyId, TopLevel};
use crate::eval::{Closure, NativeFn, NextMethodState, SpecialForms};
use crate::streams::StreamStore;
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::{NodeId, Value};

pub struct Machine {
    pub arena: Arena,
    pub symbols: SymbolTable,
    pub classes: ClassRegistry,
    pub arrays: ArrayStore,
    pub streams: StreamStore,
    pub closures: Vec<Closure>,
    pub natives: Vec<NativeFn>,
    pub toplevel: TopLevel,
    pub conditions: ConditionSystem,
    pub special: SpecialForms,

    /// Dynamic-variable bindings, innermost last (extent = call stack)
    pub dynamic_stack: Vec<(SymbolId, NodeId)>,
    /// call-next-method state for generic invocations in progress
    pub next_methods: Vec<NextMethodState>,

    // Cached standard objects and symbols
    pub nil_node: NodeId,
    pub t_node: NodeId,
    pub nil_sym: SymbolId,
    pub t_sym: SymbolId,
    pub rest_kw: SymbolId,
    pub amp_rest: SymbolId,
    pub initialize_object_sym: SymbolId,

    block_counter: u32,
    tagbody_counter: u32,
}

impl Machine {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        let classes = ClassRegistry::new(&mut symbols);
        let special = SpecialForms::new(&mut symbols);
        let mut arena = Arena::new();

        let nil_sym = symbols.intern("NIL");
        let t_sym = symbols.intern("T");
        let rest_kw = symbols.intern(":REST");
        let amp_rest = symbols.intern("&REST");
        let initialize_object_sym = symbols.intern("INITIALIZE-OBJECT");

        let nil_node = arena.alloc(Node::Leaf(Value::Nil));
        let t_node = arena.alloc(Node::Leaf(Value::Symbol(t_sym.0)));

        Self {
            arena,
            symbols,
            classes,
            arrays: ArrayStore::new(),
            streams: StreamStore::new(),
            closures: Vec::new(),
            natives: Vec::new(),
            toplevel: TopLevel::new(),
            conditions: ConditionSystem::new(),
            special,
            dynamic_stack: Vec::new(),
            next_methods: Vec::new(),
            nil_node,
            t_node,
            nil_sym,
            t_sym,
            rest_kw,
            amp_rest,
            initialize_object_sym,
            block_counter: 0,
            tagbody_counter: 0,
        }
    }

    // -- Constructors -------------------------------------------------------

    pub fn make_nil(&self) -> NodeId {
        self.nil_node
    }

    pub fn make_t(&self) -> NodeId {
        self.t_node
    }

    pub fn bool_node(&self, b: bool) -> NodeId {
        if b {
            self.t_node
        } else {
            self.nil_node
        }
    }

    pub fn make_integer(&mut self, n: i64) -> NodeId {
        self.arena.alloc(Node::Leaf(Value::Integer(n)))
    }

    pub fn make_float(&mut self, f: f64) -> NodeId {
        self.arena.alloc(Node::Leaf(Value::Float(f)))
    }

    pub fn make_character(&mut self, c: char) -> NodeId {
        self.arena.alloc(Node::Leaf(Value::Character(c)))
    }

    pub fn make_symbol(&mut self, sym: SymbolId) -> NodeId {
        if sym == self.nil_sym {
            return self.nil_node;
        }
        self.arena.alloc(Node::Leaf(Value::Symbol(sym.0)))
    }

    pub fn intern_node(&mut self, name: &str) -> NodeId {
        let sym = self.symbols.intern(name);
        self.make_symbol(sym)
    }

    pub fn make_string(&mut self, s: &str) -> NodeId {
        let id = self.arrays.alloc_string(s);
        self.arena.alloc(Node::Leaf(Value::Vector(id.0)))
    }

    pub fn cons(&mut self, car: NodeId, cdr: NodeId) -> NodeId {
        self.arena.alloc(Node::Cons(car, cdr))
    }

    /// Build a proper list from a slice of nodes
    pub fn list(&mut self, items: &[NodeId]) -> NodeId {
        let mut result = self.nil_node;
        for &item in items.iter().rev() {
            result = self.cons(item, result);
        }
        result
    }

    // -- Accessors ----------------------------------------------------------

    pub fn car(&self, node: NodeId) -> Option<NodeId> {
        match self.arena.get_unchecked(node) {
            Node::Cons(car, _) => Some(*car),
            _ => None,
        }
    }

    pub fn cdr(&self, node: NodeId) -> Option<NodeId> {
        match self.arena.get_unchecked(node) {
            Node::Cons(_, cdr) => Some(*cdr),
            _ => None,
        }
    }

    pub fn is_nil(&self, node: NodeId) -> bool {
        matches!(self.arena.get_unchecked(node), Node::Leaf(Value::Nil))
    }

    pub fn is_truthy(&self, node: NodeId) -> bool {
        !self.is_nil(node)
    }

    pub fn is_cons(&self, node: NodeId) -> bool {
        matches!(self.arena.get_unchecked(node), Node::Cons(_, _))
    }

    /// NIL counts as the symbol named NIL.
    pub fn node_to_symbol(&self, node: NodeId) -> Option<SymbolId> {
        match self.arena.get_unchecked(node) {
            Node::Leaf(Value::Symbol(id)) => Some(SymbolId(*id)),
            Node::Leaf(Value::Nil) => Some(self.nil_sym),
            _ => None,
        }
    }

    /// Collect a proper list into a vector; None for dotted lists.
    pub fn list_to_vec(&self, list: NodeId) -> Option<Vec<NodeId>> {
        let mut items = Vec::new();
        let mut current = list;
        loop {
            match self.arena.get_unchecked(current) {
                Node::Cons(car, cdr) => {
                    items.push(*car);
                    current = *cdr;
                }
                Node::Leaf(Value::Nil) => return Some(items),
                _ => return None,
            }
        }
    }

    pub fn list_length(&self, list: NodeId) -> Option<usize> {
        self.list_to_vec(list).map(|v| v.len())
    }

    pub fn string_value(&self, node: NodeId) -> Option<String> {
        match self.arena.get_unchecked(node) {
            Node::Leaf(Value::Vector(h)) => self.arrays.get(VectorId(*h))?.as_string(),
            _ => None,
        }
    }

    // -- Identity and equality ---------------------------------------------

    /// eq: object identity. Interned symbols and immediate values compare
    /// by content, everything else by cell or handle identity.
    pub fn eq(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let (na, nb) = (self.arena.get_unchecked(a), self.arena.get_unchecked(b));
        match (na, nb) {
            (Node::Leaf(va), Node::Leaf(vb)) => match (va, vb) {
                (Value::Nil, Value::Nil) => true,
                (Value::Symbol(x), Value::Symbol(y)) => x == y,
                (Value::Integer(x), Value::Integer(y)) => x == y,
                (Value::Character(x), Value::Character(y)) => x == y,
                (Value::Vector(x), Value::Vector(y)) => x == y,
                (Value::Closure(x), Value::Closure(y)) => x == y,
                (Value::Native(x), Value::Native(y)) => x == y,
                (Value::Generic(x), Value::Generic(y)) => x == y,
                (Value::Instance(x), Value::Instance(y)) => x == y,
                (Value::Class(x), Value::Class(y)) => x == y,
                (Value::Stream(x), Value::Stream(y)) => x == y,
                _ => false,
            },
            _ => false,
        }
    }

    /// eql: eq, or same numeric class and value.
    pub fn eql(&self, a: NodeId, b: NodeId) -> bool {
        if self.eq(a, b) {
            return true;
        }
        let (na, nb) = (self.arena.get_unchecked(a), self.arena.get_unchecked(b));
        match (na, nb) {
            (Node::Leaf(va), Node::Leaf(vb)) => match (va, vb) {
                (Value::Float(x), Value::Float(y)) => x == y,
                (Value::Integer(x), Value::BigInt(y)) => &num_bigint::BigInt::from(*x) == y,
                (Value::BigInt(x), Value::Integer(y)) => x == &num_bigint::BigInt::from(*y),
                (Value::BigInt(x), Value::BigInt(y)) => x == y,
                _ => false,
            },
            _ => false,
        }
    }

    /// equal: eql extended structurally over conses, strings and vectors.
    pub fn equal(&self, a: NodeId, b: NodeId) -> bool {
        if self.eql(a, b) {
            return true;
        }
        let (na, nb) = (self.arena.get_unchecked(a), self.arena.get_unchecked(b));
        match (na, nb) {
            (Node::Cons(ca, da), Node::Cons(cb, db)) => {
                let (ca, da, cb, db) = (*ca, *da, *cb, *db);
                self.equal(ca, cb) && self.equal(da, db)
            }
            (Node::Leaf(Value::Vector(x)), Node::Leaf(Value::Vector(y))) => {
                let (ax, ay) = match (self.arrays.get(VectorId(*x)), self.arrays.get(VectorId(*y)))
                {
                    (Some(ax), Some(ay)) => (ax, ay),
                    _ => return false,
                };
                if ax.dimensions != ay.dimensions {
                    return false;
                }
                match (&ax.body, &ay.body) {
                    (crate::arrays::ArrayBody::Chars(sx), crate::arrays::ArrayBody::Chars(sy)) => {
                        sx == sy
                    }
                    (
                        crate::arrays::ArrayBody::General(vx),
                        crate::arrays::ArrayBody::General(vy),
                    ) => vx
                        .iter()
                        .zip(vy.iter())
                        .all(|(&ex, &ey)| self.equal(ex, ey)),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    // -- Classes ------------------------------------------------------------

    pub fn class_of(&self, node: NodeId) -> ClassId {
        match self.arena.get_unchecked(node) {
            Node::Cons(_, _) => self.classes.cons_class,
            Node::Leaf(v) => match v {
                Value::Nil => self.classes.null_class,
                Value::Integer(_) | Value::BigInt(_) => self.classes.integer_class,
                Value::Float(_) => self.classes.float_class,
                Value::Character(_) => self.classes.character_class,
                Value::Symbol(_) => self.classes.symbol_class,
                Value::Vector(h) => match self.arrays.get(VectorId(*h)) {
                    Some(a) if a.is_string() => self.classes.string_class,
                    Some(a) if a.rank() == 1 => self.classes.general_vector,
                    _ => self.classes.general_array,
                },
                Value::Closure(_) | Value::Native(_) => self.classes.function_class,
                Value::Generic(_) => self.classes.standard_generic_function,
                Value::Instance(i) => self
                    .classes
                    .get_instance(*i)
                    .map(|inst| inst.class)
                    .unwrap_or(self.classes.standard_object),
                Value::Class(c) => {
                    if self
                        .classes
                        .get_class(ClassId(*c))
                        .map_or(false, |cl| cl.builtin)
                    {
                        self.classes.built_in_class
                    } else {
                        self.classes.standard_class
                    }
                }
                Value::Stream(_) => self.classes.stream_class,
            },
        }
    }

    pub fn instance_of(&self, node: NodeId, class: ClassId) -> bool {
        self.classes.subclass_of(self.class_of(node), class)
    }

    pub fn make_class_node(&mut self, class: ClassId) -> NodeId {
        self.arena.alloc(Node::Leaf(Value::Class(class.0)))
    }

    // -- Conditions ---------------------------------------------------------

    /// Allocate a condition instance of `class` with the given slot values.
    pub fn make_condition(&mut self, class: ClassId, slots: &[(SymbolId, NodeId)]) -> NodeId {
        let idx = self.classes.create_instance(class);
        for &(name, value) in slots {
            if let Some(i) = self.classes.slot_index(class, name) {
                if let Some(inst) = self.classes.get_instance_mut(idx) {
                    inst.slots[i] = Some(value);
                }
            }
        }
        self.arena.alloc(Node::Leaf(Value::Instance(idx)))
    }

    pub fn simple_error(&mut self, format: &str, arguments: NodeId) -> NodeId {
        let fs = self.make_string(format);
        let fs_sym = self.symbols.intern("FORMAT-STRING");
        let fa_sym = self.symbols.intern("FORMAT-ARGUMENTS");
        self.make_condition(
            self.classes.simple_error,
            &[(fs_sym, fs), (fa_sym, arguments)],
        )
    }

    pub fn domain_error(&mut self, object: NodeId, expected: ClassId) -> NodeId {
        let class_node = self.make_class_node(expected);
        let obj_sym = self.symbols.intern("OBJECT");
        let exp_sym = self.symbols.intern("EXPECTED-CLASS");
        self.make_condition(
            self.classes.domain_error,
            &[(obj_sym, object), (exp_sym, class_node)],
        )
    }

    pub fn arity_error(&mut self, form: NodeId) -> NodeId {
        let form_sym = self.symbols.intern("FORM");
        self.make_condition(self.classes.arity_error, &[(form_sym, form)])
    }

    pub fn unbound_variable(&mut self, name: SymbolId) -> NodeId {
        let name_node = self.make_symbol(name);
        let ns = self.intern_node("VARIABLE");
        let name_sym = self.symbols.intern("NAME");
        let ns_sym = self.symbols.intern("NAMESPACE");
        self.make_condition(
            self.classes.unbound_variable,
            &[(name_sym, name_node), (ns_sym, ns)],
        )
    }

    pub fn undefined_function(&mut self, name: SymbolId) -> NodeId {
        let name_node = self.make_symbol(name);
        let ns = self.intern_node("FUNCTION");
        let name_sym = self.symbols.intern("NAME");
        let ns_sym = self.symbols.intern("NAMESPACE");
        self.make_condition(
            self.classes.undefined_function,
            &[(name_sym, name_node), (ns_sym, ns)],
        )
    }

    pub fn undefined_class(&mut self, name: SymbolId) -> NodeId {
        let name_node = self.make_symbol(name);
        let ns = self.intern_node("CLASS");
        let name_sym = self.symbols.intern("NAME");
        let ns_sym = self.symbols.intern("NAMESPACE");
        self.make_condition(
            self.classes.undefined_entity,
            &[(name_sym, name_node), (ns_sym, ns)],
        )
    }

    pub fn control_error(&mut self, name: NodeId) -> NodeId {
        let name_sym = self.symbols.intern("NAME");
        self.make_condition(self.classes.control_error, &[(name_sym, name)])
    }

    pub fn program_error(&mut self) -> NodeId {
        self.make_condition(self.classes.program_error, &[])
    }

    pub fn class_error(&mut self, name: NodeId) -> NodeId {
        let name_sym = self.symbols.intern("NAME");
        self.make_condition(self.classes.class_error, &[(name_sym, name)])
    }

    pub fn arithmetic_error(&mut self, class: ClassId, operation: NodeId, operands: NodeId) -> NodeId {
        let op_sym = self.symbols.intern("OPERATION");
        let args_sym = self.symbols.intern("OPERANDS");
        self.make_condition(class, &[(op_sym, operation), (args_sym, operands)])
    }

    pub fn parse_error(&mut self, text: &str, expected: ClassId) -> NodeId {
        let s = self.make_string(text);
        let class_node = self.make_class_node(expected);
        let str_sym = self.symbols.intern("STRING");
        let exp_sym = self.symbols.intern("EXPECTED-CLASS");
        self.make_condition(
            self.classes.parse_error,
            &[(str_sym, s), (exp_sym, class_node)],
        )
    }

    pub fn end_of_stream(&mut self, stream: NodeId) -> NodeId {
        let s_sym = self.symbols.intern("STREAM");
        self.make_condition(self.classes.end_of_stream, &[(s_sym, stream)])
    }

    // -- Dynamic variables --------------------------------------------------

    pub fn dynamic_lookup(&self, sym: SymbolId) -> Option<NodeId> {
        self.dynamic_stack
            .iter()
            .rev()
            .find(|(s, _)| *s == sym)
            .map(|&(_, v)| v)
            .or_else(|| self.toplevel.dynamics.get(&sym).copied())
    }

    pub fn dynamic_set(&mut self, sym: SymbolId, val: NodeId) -> bool {
        if let Some(entry) = self.dynamic_stack.iter_mut().rev().find(|(s, _)| *s == sym) {
            entry.1 = val;
            return true;
        }
        if self.toplevel.dynamics.contains_key(&sym) {
            self.toplevel.dynamics.insert(sym, val);
            return true;
        }
        false
    }

    // -- Misc ---------------------------------------------------------------

    pub fn new_block_id(&mut self) -> BlockId {
        self.block_counter += 1;
        BlockId(self.block_counter)
    }

    pub fn new_tagbody_id(&mut self) -> TagbodyId {
        self.tagbody_counter += 1;
        TagbodyId(self.tagbody_counter)
    }

    /// Register a host routine as an ordinary top-level function.
    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        let sym = self.symbols.intern(name);
        let idx = self.natives.len() as u32;
        self.natives.push(func);
        let node = self.arena.alloc(Node::Leaf(Value::Native(idx)));
        self.toplevel.functions.insert(sym, node);
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
