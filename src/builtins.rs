// Islet Builtins - Standard Library Natives
//
// Library entries register themselves into the top-level function namespace
// as ordinary callables; the evaluator knows nothing about them beyond
// "apply a callable to a list of arguments".

use crate::arena::Node;
use crate::arrays::VectorId;
use crate::control::{Control, EvalResult};
use crate::env::Env;
use crate::eval::Interpreter;
use crate::machine::Machine;
use crate::printer;
use crate::streams::StreamId;
use crate::symbol::SymbolId;
use crate::types::{NodeId, Value};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

/// Register all standard natives into the top-level environment.
pub fn register_natives(m: &mut Machine) {
    // List operations
    m.register_native("CONS", native_cons);
    m.register_native("CAR", native_car);
    m.register_native("CDR", native_cdr);
    m.register_native("LIST", native_list);
    m.register_native("CREATE-LIST", native_create_list);
    m.register_native("APPEND", native_append);
    m.register_native("REVERSE", native_reverse);
    m.register_native("NREVERSE", native_nreverse);
    m.register_native("MEMBER", native_member);
    m.register_native("ASSOC", native_assoc);
    m.register_native("MAPCAR", native_mapcar);
    m.register_native("MAPC", native_mapc);
    m.register_native("LENGTH", native_length);
    m.register_native("ELT", native_elt);

    // Predicates
    m.register_native("NULL", native_null);
    m.register_native("NOT", native_null);
    m.register_native("ATOM", native_atom);
    m.register_native("CONSP", native_consp);
    m.register_native("LISTP", native_listp);
    m.register_native("SYMBOLP", native_symbolp);
    m.register_native("NUMBERP", native_numberp);
    m.register_native("INTEGERP", native_integerp);
    m.register_native("FLOATP", native_floatp);
    m.register_native("CHARACTERP", native_characterp);
    m.register_native("STRINGP", native_stringp);
    m.register_native("FUNCTIONP", native_functionp);
    m.register_native("GENERIC-FUNCTION-P", native_generic_function_p);
    m.register_native("STREAMP", native_streamp);
    m.register_native("EQ", native_eq);
    m.register_native("EQL", native_eql);
    m.register_native("EQUAL", native_equal);

    // Arithmetic
    m.register_native("+", native_add);
    m.register_native("-", native_sub);
    m.register_native("*", native_mul);
    m.register_native("DIV", native_div);
    m.register_native("MOD", native_mod);
    m.register_native("QUOTIENT", native_quotient);
    m.register_native("ABS", native_abs);
    m.register_native("MIN", native_min);
    m.register_native("MAX", native_max);
    m.register_native("SQRT", native_sqrt);
    m.register_native("EXPT", native_expt);
    m.register_native("FLOOR", native_floor);
    m.register_native("CEILING", native_ceiling);
    m.register_native("ROUND", native_round);
    m.register_native("TRUNCATE", native_truncate);
    m.register_native("FLOAT", native_float);
    m.register_native("=", native_num_eq);
    m.register_native("<", native_lt);
    m.register_native("<=", native_le);
    m.register_native(">", native_gt);
    m.register_native(">=", native_ge);

    // Characters and strings
    m.register_native("CHAR=", native_char_eq);
    m.register_native("CHAR<", native_char_lt);
    m.register_native("CREATE-STRING", native_create_string);
    m.register_native("STRING=", native_string_eq);
    m.register_native("STRING-APPEND", native_string_append);
    m.register_native("PARSE-NUMBER", native_parse_number);

    // Vectors and arrays
    m.register_native("VECTOR", native_vector);
    m.register_native("CREATE-VECTOR", native_create_vector);
    m.register_native("CREATE-ARRAY", native_create_array);
    m.register_native("AREF", native_aref);
    m.register_native("SET-AREF", native_set_aref);
    m.register_native("ARRAY-DIMENSIONS", native_array_dimensions);

    // Object system
    m.register_native("CLASS-OF", native_class_of);
    m.register_native("INSTANCEP", native_instancep);
    m.register_native("SUBCLASSP", native_subclassp);
    m.register_native("CREATE", native_create);
    m.register_native("SLOT-VALUE", native_slot_value);
    m.register_native("SET-SLOT-VALUE", native_set_slot_value);
    m.register_native("CALL-NEXT-METHOD", native_call_next_method);
    m.register_native("NEXT-METHOD-P", native_next_method_p);

    // Conditions
    m.register_native("ERROR", native_error);
    m.register_native("CONTINUE-CONDITION", native_continue_condition);
    m.register_native("SIMPLE-ERROR-FORMAT-STRING", native_sef_string);
    m.register_native("SIMPLE-ERROR-FORMAT-ARGUMENTS", native_sef_arguments);
    m.register_native("DOMAIN-ERROR-OBJECT", native_de_object);
    m.register_native("DOMAIN-ERROR-EXPECTED-CLASS", native_de_expected_class);
    m.register_native("UNDEFINED-ENTITY-NAME", native_ue_name);
    m.register_native("UNDEFINED-ENTITY-NAMESPACE", native_ue_namespace);
    m.register_native("ARITHMETIC-ERROR-OPERATION", native_ae_operation);
    m.register_native("ARITHMETIC-ERROR-OPERANDS", native_ae_operands);

    // Application
    m.register_native("FUNCALL", native_funcall);
    m.register_native("APPLY", native_apply);
    m.register_native("IDENTITY", native_identity);
    m.register_native("EVAL", native_eval);
    m.register_native("GENSYM", native_gensym);

    // I/O
    m.register_native("FORMAT", native_format);
    m.register_native("PRINT", native_print);
    m.register_native("STANDARD-INPUT", native_standard_input);
    m.register_native("STANDARD-OUTPUT", native_standard_output);
    m.register_native("ERROR-OUTPUT", native_error_output);
    m.register_native("CREATE-STRING-INPUT-STREAM", native_create_string_input);
    m.register_native("CREATE-STRING-OUTPUT-STREAM", native_create_string_output);
    m.register_native("GET-OUTPUT-STREAM-STRING", native_get_output_stream_string);
    m.register_native("READ", native_read);
    m.register_native("READ-CHAR", native_read_char);
    m.register_native("READ-LINE", native_read_line);
    m.register_native("CLOSE", native_close);
}

// ============================================================================
// Argument helpers
// ============================================================================

fn check_arity(
    interp: &mut Interpreter,
    args: &[NodeId],
    min: usize,
    max: Option<usize>,
) -> Result<(), Control> {
    if args.len() < min || max.map_or(false, |mx| args.len() > mx) {
        let form = interp.machine.list(args);
        let cond = interp.machine.arity_error(form);
        return Err(interp.raise(cond));
    }
    Ok(())
}

fn symbol_arg(interp: &mut Interpreter, node: NodeId) -> Result<SymbolId, Control> {
    match interp.machine.node_to_symbol(node) {
        Some(sym) => Ok(sym),
        None => {
            let expected = interp.machine.classes.symbol_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn list_arg(interp: &mut Interpreter, node: NodeId) -> Result<Vec<NodeId>, Control> {
    match interp.machine.list_to_vec(node) {
        Some(items) => Ok(items),
        None => {
            let expected = interp.machine.classes.list_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn index_arg(interp: &mut Interpreter, node: NodeId) -> Result<usize, Control> {
    match interp.machine.arena.get_unchecked(node) {
        Node::Leaf(Value::Integer(n)) if *n >= 0 => Ok(*n as usize),
        _ => {
            let expected = interp.machine.classes.integer_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn char_arg(interp: &mut Interpreter, node: NodeId) -> Result<char, Control> {
    match interp.machine.arena.get_unchecked(node) {
        Node::Leaf(Value::Character(c)) => Ok(*c),
        _ => {
            let expected = interp.machine.classes.character_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn string_arg(interp: &mut Interpreter, node: NodeId) -> Result<String, Control> {
    match interp.machine.string_value(node) {
        Some(s) => Ok(s),
        None => {
            let expected = interp.machine.classes.string_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn stream_arg(interp: &mut Interpreter, node: NodeId) -> Result<StreamId, Control> {
    match interp.machine.arena.get_unchecked(node) {
        Node::Leaf(Value::Stream(h)) => Ok(StreamId(*h)),
        _ => {
            let expected = interp.machine.classes.stream_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn make_stream_node(interp: &mut Interpreter, id: StreamId) -> NodeId {
    interp
        .machine
        .arena
        .alloc(Node::Leaf(Value::Stream(id.0)))
}

// ============================================================================
// Numeric tower
// ============================================================================

#[derive(Debug, Clone)]
enum NumVal {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

impl NumVal {
    fn to_f64(&self) -> f64 {
        match self {
            NumVal::Int(n) => *n as f64,
            NumVal::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
            NumVal::Float(f) => *f,
        }
    }

    fn add(self, other: NumVal) -> NumVal {
        match (self, other) {
            (NumVal::Int(a), NumVal::Int(b)) => match a.checked_add(b) {
                Some(r) => NumVal::Int(r),
                None => NumVal::Big(BigInt::from(a) + BigInt::from(b)),
            },
            (NumVal::Float(a), b) => NumVal::Float(a + b.to_f64()),
            (a, NumVal::Float(b)) => NumVal::Float(a.to_f64() + b),
            (NumVal::Big(a), NumVal::Big(b)) => NumVal::Big(a + b),
            (NumVal::Big(a), NumVal::Int(b)) => NumVal::Big(a + BigInt::from(b)),
            (NumVal::Int(a), NumVal::Big(b)) => NumVal::Big(BigInt::from(a) + b),
        }
    }

    fn sub(self, other: NumVal) -> NumVal {
        match (self, other) {
            (NumVal::Int(a), NumVal::Int(b)) => match a.checked_sub(b) {
                Some(r) => NumVal::Int(r),
                None => NumVal::Big(BigInt::from(a) - BigInt::from(b)),
            },
            (NumVal::Float(a), b) => NumVal::Float(a - b.to_f64()),
            (a, NumVal::Float(b)) => NumVal::Float(a.to_f64() - b),
            (NumVal::Big(a), NumVal::Big(b)) => NumVal::Big(a - b),
            (NumVal::Big(a), NumVal::Int(b)) => NumVal::Big(a - BigInt::from(b)),
            (NumVal::Int(a), NumVal::Big(b)) => NumVal::Big(BigInt::from(a) - b),
        }
    }

    fn mul(self, other: NumVal) -> NumVal {
        match (self, other) {
            (NumVal::Int(a), NumVal::Int(b)) => match a.checked_mul(b) {
                Some(r) => NumVal::Int(r),
                None => NumVal::Big(BigInt::from(a) * BigInt::from(b)),
            },
            (NumVal::Float(a), b) => NumVal::Float(a * b.to_f64()),
            (a, NumVal::Float(b)) => NumVal::Float(a.to_f64() * b),
            (NumVal::Big(a), NumVal::Big(b)) => NumVal::Big(a * b),
            (NumVal::Big(a), NumVal::Int(b)) => NumVal::Big(a * BigInt::from(b)),
            (NumVal::Int(a), NumVal::Big(b)) => NumVal::Big(BigInt::from(a) * b),
        }
    }

    fn neg(self) -> NumVal {
        match self {
            NumVal::Int(n) => match n.checked_neg() {
                Some(r) => NumVal::Int(r),
                None => NumVal::Big(-BigInt::from(n)),
            },
            NumVal::Big(b) => NumVal::Big(-b),
            NumVal::Float(f) => NumVal::Float(-f),
        }
    }

    fn cmp_with(&self, other: &NumVal) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (NumVal::Int(a), NumVal::Int(b)) => a.cmp(b),
            (NumVal::Big(a), NumVal::Big(b)) => a.cmp(b),
            (NumVal::Int(a), NumVal::Big(b)) => BigInt::from(*a).cmp(b),
            (NumVal::Big(a), NumVal::Int(b)) => a.cmp(&BigInt::from(*b)),
            _ => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            NumVal::Int(n) => *n == 0,
            NumVal::Big(b) => b == &BigInt::from(0),
            NumVal::Float(f) => *f == 0.0,
        }
    }

    fn to_node(self, m: &mut Machine) -> NodeId {
        match self {
            NumVal::Int(n) => m.make_integer(n),
            NumVal::Big(b) => match b.to_i64() {
                Some(n) => m.make_integer(n),
                None => m.arena.alloc(Node::Leaf(Value::BigInt(b))),
            },
            NumVal::Float(f) => m.make_float(f),
        }
    }
}

fn number_arg(interp: &mut Interpreter, node: NodeId) -> Result<NumVal, Control> {
    match interp.machine.arena.get_unchecked(node) {
        Node::Leaf(Value::Integer(n)) => Ok(NumVal::Int(*n)),
        Node::Leaf(Value::BigInt(b)) => Ok(NumVal::Big(b.clone())),
        Node::Leaf(Value::Float(f)) => Ok(NumVal::Float(*f)),
        _ => {
            let expected = interp.machine.classes.number_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn raise_division_by_zero(
    interp: &mut Interpreter,
    operation: &str,
    args: &[NodeId],
) -> Control {
    let op = interp.machine.intern_node(operation);
    let operands = interp.machine.list(args);
    let class = interp.machine.classes.division_by_zero;
    let cond = interp.machine.arithmetic_error(class, op, operands);
    interp.raise(cond)
}

// ============================================================================
// List operations
// ============================================================================

fn native_cons(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    Ok(interp.machine.cons(args[0], args[1]))
}

fn native_car(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    match interp.machine.car(args[0]) {
        Some(v) => Ok(v),
        None => {
            let expected = interp.machine.classes.cons_class;
            Err(interp.raise_domain_error(args[0], expected))
        }
    }
}

fn native_cdr(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    match interp.machine.cdr(args[0]) {
        Some(v) => Ok(v),
        None => {
            let expected = interp.machine.classes.cons_class;
            Err(interp.raise_domain_error(args[0], expected))
        }
    }
}

fn native_list(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    Ok(interp.machine.list(args))
}

fn native_create_list(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(2))?;
    let n = index_arg(interp, args[0])?;
    let fill = args.get(1).copied().unwrap_or(interp.machine.nil_node);
    let items = vec![fill; n];
    Ok(interp.machine.list(&items))
}

fn native_append(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let mut items = Vec::new();
    for &arg in args {
        items.extend(list_arg(interp, arg)?);
    }
    Ok(interp.machine.list(&items))
}

fn native_reverse(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let mut items = list_arg(interp, args[0])?;
    items.reverse();
    Ok(interp.machine.list(&items))
}

/// nreverse is permitted, not required, to reuse conses; this one allocates.
fn native_nreverse(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    native_reverse(interp, args)
}

fn native_member(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let obj = args[0];
    if interp.machine.list_to_vec(args[1]).is_none() {
        let expected = interp.machine.classes.list_class;
        return Err(interp.raise_domain_error(args[1], expected));
    }
    let mut current = args[1];
    while let Some(car) = interp.machine.car(current) {
        if interp.machine.eql(car, obj) {
            return Ok(current);
        }
        current = interp.machine.cdr(current).unwrap();
    }
    Ok(interp.machine.make_nil())
}

fn native_assoc(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let obj = args[0];
    let pairs = list_arg(interp, args[1])?;
    for pair in pairs {
        let key = match interp.machine.car(pair) {
            Some(k) => k,
            None => {
                let expected = interp.machine.classes.cons_class;
                return Err(interp.raise_domain_error(pair, expected));
            }
        };
        if interp.machine.eql(key, obj) {
            return Ok(pair);
        }
    }
    Ok(interp.machine.make_nil())
}

fn native_mapcar(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let function = args[0];
    let mut lists = Vec::new();
    for &arg in &args[1..] {
        lists.push(list_arg(interp, arg)?);
    }
    // The iteration terminates when the shortest list runs out.
    let len = lists.iter().map(|l| l.len()).min().unwrap_or(0);
    let mut results = Vec::with_capacity(len);
    for i in 0..len {
        let call_args: Vec<NodeId> = lists.iter().map(|l| l[i]).collect();
        results.push(interp.apply(function, &call_args)?);
    }
    Ok(interp.machine.list(&results))
}

fn native_mapc(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let function = args[0];
    let mut lists = Vec::new();
    for &arg in &args[1..] {
        lists.push(list_arg(interp, arg)?);
    }
    let len = lists.iter().map(|l| l.len()).min().unwrap_or(0);
    for i in 0..len {
        let call_args: Vec<NodeId> = lists.iter().map(|l| l[i]).collect();
        interp.apply(function, &call_args)?;
    }
    Ok(args[1])
}

fn native_length(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    if let Some(items) = interp.machine.list_to_vec(args[0]) {
        return Ok(interp.machine.make_integer(items.len() as i64));
    }
    if let Node::Leaf(Value::Vector(h)) = interp.machine.arena.get_unchecked(args[0]) {
        let h = *h;
        if let Some(arr) = interp.machine.arrays.get(VectorId(h)) {
            if arr.is_vector() {
                let len = arr.len() as i64;
                return Ok(interp.machine.make_integer(len));
            }
        }
    }
    let expected = interp.machine.classes.basic_vector;
    Err(interp.raise_domain_error(args[0], expected))
}

fn native_elt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let index = index_arg(interp, args[1])?;
    if interp.machine.is_cons(args[0]) || interp.machine.is_nil(args[0]) {
        let items = list_arg(interp, args[0])?;
        return match items.get(index) {
            Some(&v) => Ok(v),
            None => Err(interp.raise_simple_error("index ~A out of range", &[args[1]])),
        };
    }
    if let Node::Leaf(Value::Vector(h)) = interp.machine.arena.get_unchecked(args[0]) {
        let vid = VectorId(*h);
        if let Some(c) = interp.machine.arrays.aref_char(vid, index) {
            return Ok(interp.machine.make_character(c));
        }
        if let Some(v) = interp.machine.arrays.aref_general(vid, index) {
            return Ok(v);
        }
        return Err(interp.raise_simple_error("index ~A out of range", &[args[1]]));
    }
    let expected = interp.machine.classes.basic_vector;
    Err(interp.raise_domain_error(args[0], expected))
}

// ============================================================================
// Predicates
// ============================================================================

fn native_null(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    Ok(interp.machine.bool_node(interp.machine.is_nil(args[0])))
}

fn native_atom(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    Ok(interp.machine.bool_node(!interp.machine.is_cons(args[0])))
}

fn native_consp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    Ok(interp.machine.bool_node(interp.machine.is_cons(args[0])))
}

fn native_listp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let is_list = interp.machine.is_cons(args[0]) || interp.machine.is_nil(args[0]);
    Ok(interp.machine.bool_node(is_list))
}

fn class_predicate(interp: &mut Interpreter, args: &[NodeId], class: crate::classes::ClassId) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    Ok(interp
        .machine
        .bool_node(interp.machine.instance_of(args[0], class)))
}

fn native_symbolp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.symbol_class;
    class_predicate(interp, args, class)
}

fn native_numberp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.number_class;
    class_predicate(interp, args, class)
}

fn native_integerp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.integer_class;
    class_predicate(interp, args, class)
}

fn native_floatp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.float_class;
    class_predicate(interp, args, class)
}

fn native_characterp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.character_class;
    class_predicate(interp, args, class)
}

fn native_stringp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.string_class;
    class_predicate(interp, args, class)
}

fn native_functionp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.function_class;
    class_predicate(interp, args, class)
}

fn native_generic_function_p(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.generic_function;
    class_predicate(interp, args, class)
}

fn native_streamp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let class = interp.machine.classes.stream_class;
    class_predicate(interp, args, class)
}

fn native_eq(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    Ok(interp.machine.bool_node(interp.machine.eq(args[0], args[1])))
}

fn native_eql(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    Ok(interp
        .machine
        .bool_node(interp.machine.eql(args[0], args[1])))
}

fn native_equal(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    Ok(interp
        .machine
        .bool_node(interp.machine.equal(args[0], args[1])))
}

// ============================================================================
// Arithmetic
// ============================================================================

fn native_add(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let mut sum = NumVal::Int(0);
    for &arg in args {
        let val = number_arg(interp, arg)?;
        sum = sum.add(val);
    }
    Ok(sum.to_node(interp.machine))
}

fn native_sub(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    let first = number_arg(interp, args[0])?;
    if args.len() == 1 {
        return Ok(first.neg().to_node(interp.machine));
    }
    let mut result = first;
    for &arg in &args[1..] {
        let val = number_arg(interp, arg)?;
        result = result.sub(val);
    }
    Ok(result.to_node(interp.machine))
}

fn native_mul(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let mut product = NumVal::Int(1);
    for &arg in args {
        let val = number_arg(interp, arg)?;
        product = product.mul(val);
    }
    Ok(product.to_node(interp.machine))
}

/// Integer floor division
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn native_div(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = number_arg(interp, args[0])?;
    let b = number_arg(interp, args[1])?;
    if b.is_zero() {
        return Err(raise_division_by_zero(interp, "DIV", args));
    }
    match (a, b) {
        (NumVal::Int(a), NumVal::Int(b)) => Ok(interp.machine.make_integer(floor_div(a, b))),
        (a, b) => {
            let q = (a.to_f64() / b.to_f64()).floor();
            Ok(interp.machine.make_integer(q as i64))
        }
    }
}

fn native_mod(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = number_arg(interp, args[0])?;
    let b = number_arg(interp, args[1])?;
    if b.is_zero() {
        return Err(raise_division_by_zero(interp, "MOD", args));
    }
    match (a, b) {
        (NumVal::Int(a), NumVal::Int(b)) => {
            let m = a - b * floor_div(a, b);
            Ok(interp.machine.make_integer(m))
        }
        (a, b) => {
            let (fa, fb) = (a.to_f64(), b.to_f64());
            let m = fa - fb * (fa / fb).floor();
            Ok(interp.machine.make_float(m))
        }
    }
}

fn native_quotient(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = number_arg(interp, args[0])?;
    let b = number_arg(interp, args[1])?;
    if b.is_zero() {
        return Err(raise_division_by_zero(interp, "QUOTIENT", args));
    }
    match (&a, &b) {
        (NumVal::Int(x), NumVal::Int(y)) if x % y == 0 => {
            Ok(interp.machine.make_integer(x / y))
        }
        _ => {
            let q = a.to_f64() / b.to_f64();
            Ok(interp.machine.make_float(q))
        }
    }
}

fn native_abs(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let val = match number_arg(interp, args[0])? {
        NumVal::Int(n) => match n.checked_abs() {
            Some(r) => NumVal::Int(r),
            None => NumVal::Big(BigInt::from(n).abs()),
        },
        NumVal::Big(b) => NumVal::Big(b.abs()),
        NumVal::Float(f) => NumVal::Float(f.abs()),
    };
    Ok(val.to_node(interp.machine))
}

fn native_min(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    let mut best = args[0];
    let mut best_val = number_arg(interp, args[0])?;
    for &arg in &args[1..] {
        let val = number_arg(interp, arg)?;
        if val.cmp_with(&best_val) == std::cmp::Ordering::Less {
            best = arg;
            best_val = val;
        }
    }
    Ok(best)
}

fn native_max(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    let mut best = args[0];
    let mut best_val = number_arg(interp, args[0])?;
    for &arg in &args[1..] {
        let val = number_arg(interp, arg)?;
        if val.cmp_with(&best_val) == std::cmp::Ordering::Greater {
            best = arg;
            best_val = val;
        }
    }
    Ok(best)
}

fn native_sqrt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let f = number_arg(interp, args[0])?.to_f64();
    if f < 0.0 {
        let expected = interp.machine.classes.number_class;
        return Err(interp.raise_domain_error(args[0], expected));
    }
    let root = f.sqrt();
    if root == root.trunc() && root.abs() < i64::MAX as f64 {
        let exact = root as i64;
        if matches!(
            interp.machine.arena.get_unchecked(args[0]),
            Node::Leaf(Value::Integer(_)) | Node::Leaf(Value::BigInt(_))
        ) {
            return Ok(interp.machine.make_integer(exact));
        }
    }
    Ok(interp.machine.make_float(root))
}

fn native_expt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let base = number_arg(interp, args[0])?;
    let exp = number_arg(interp, args[1])?;
    match (&base, &exp) {
        (NumVal::Int(b), NumVal::Int(e)) if *e >= 0 => {
            if let Ok(e32) = u32::try_from(*e) {
                if let Some(r) = b.checked_pow(e32) {
                    return Ok(interp.machine.make_integer(r));
                }
                let big = BigInt::from(*b).pow(e32);
                return Ok(NumVal::Big(big).to_node(interp.machine));
            }
        }
        _ => {}
    }
    let r = base.to_f64().powf(exp.to_f64());
    Ok(interp.machine.make_float(r))
}

fn rounding_op(
    interp: &mut Interpreter,
    args: &[NodeId],
    op: fn(f64) -> f64,
) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    match number_arg(interp, args[0])? {
        NumVal::Int(_) | NumVal::Big(_) => Ok(args[0]),
        NumVal::Float(f) => Ok(interp.machine.make_integer(op(f) as i64)),
    }
}

fn native_floor(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    rounding_op(interp, args, f64::floor)
}

fn native_ceiling(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    rounding_op(interp, args, f64::ceil)
}

fn native_round(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    rounding_op(interp, args, f64::round)
}

fn native_truncate(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    rounding_op(interp, args, f64::trunc)
}

fn native_float(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let f = number_arg(interp, args[0])?.to_f64();
    Ok(interp.machine.make_float(f))
}

fn chain_compare(
    interp: &mut Interpreter,
    args: &[NodeId],
    pred: fn(std::cmp::Ordering) -> bool,
) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let mut prev = number_arg(interp, args[0])?;
    for &arg in &args[1..] {
        let next = number_arg(interp, arg)?;
        if !pred(prev.cmp_with(&next)) {
            return Ok(interp.machine.make_nil());
        }
        prev = next;
    }
    Ok(interp.machine.make_t())
}

fn native_num_eq(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    chain_compare(interp, args, |o| o == std::cmp::Ordering::Equal)
}

fn native_lt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    chain_compare(interp, args, |o| o == std::cmp::Ordering::Less)
}

fn native_le(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    chain_compare(interp, args, |o| o != std::cmp::Ordering::Greater)
}

fn native_gt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    chain_compare(interp, args, |o| o == std::cmp::Ordering::Greater)
}

fn native_ge(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    chain_compare(interp, args, |o| o != std::cmp::Ordering::Less)
}

// ============================================================================
// Characters and strings
// ============================================================================

fn native_char_eq(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = char_arg(interp, args[0])?;
    let b = char_arg(interp, args[1])?;
    Ok(interp.machine.bool_node(a == b))
}

fn native_char_lt(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = char_arg(interp, args[0])?;
    let b = char_arg(interp, args[1])?;
    Ok(interp.machine.bool_node(a < b))
}

fn native_create_string(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(2))?;
    let n = index_arg(interp, args[0])?;
    let fill = match args.get(1) {
        Some(&c) => char_arg(interp, c)?,
        None => ' ',
    };
    let s: String = std::iter::repeat(fill).take(n).collect();
    Ok(interp.machine.make_string(&s))
}

fn native_string_eq(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = string_arg(interp, args[0])?;
    let b = string_arg(interp, args[1])?;
    Ok(interp.machine.bool_node(a == b))
}

fn native_string_append(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let mut out = String::new();
    for &arg in args {
        out.push_str(&string_arg(interp, arg)?);
    }
    Ok(interp.machine.make_string(&out))
}

fn native_parse_number(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let s = string_arg(interp, args[0])?;
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(interp.machine.make_integer(n));
    }
    if let Ok(b) = trimmed.parse::<BigInt>() {
        return Ok(NumVal::Big(b).to_node(interp.machine));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Ok(interp.machine.make_float(f));
    }
    let expected = interp.machine.classes.number_class;
    let cond = interp.machine.parse_error(trimmed, expected);
    interp.signal(cond, false)
}

// ============================================================================
// Vectors and arrays
// ============================================================================

fn native_vector(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    let vid = interp.machine.arrays.alloc_from_vec(args.to_vec());
    Ok(interp
        .machine
        .arena
        .alloc(Node::Leaf(Value::Vector(vid.0))))
}

fn native_create_vector(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(2))?;
    let n = index_arg(interp, args[0])?;
    let fill = args.get(1).copied().unwrap_or(interp.machine.nil_node);
    let vid = interp.machine.arrays.alloc_vector(n, fill);
    Ok(interp
        .machine
        .arena
        .alloc(Node::Leaf(Value::Vector(vid.0))))
}

fn native_create_array(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(2))?;
    let dim_nodes = list_arg(interp, args[0])?;
    let mut dims = Vec::with_capacity(dim_nodes.len());
    for d in dim_nodes {
        dims.push(index_arg(interp, d)?);
    }
    let fill = args.get(1).copied().unwrap_or(interp.machine.nil_node);
    let vid = interp.machine.arrays.alloc_array(dims, fill);
    Ok(interp
        .machine
        .arena
        .alloc(Node::Leaf(Value::Vector(vid.0))))
}

fn array_subscripts(
    interp: &mut Interpreter,
    args: &[NodeId],
) -> Result<Vec<usize>, Control> {
    let mut subs = Vec::with_capacity(args.len());
    for &a in args {
        subs.push(index_arg(interp, a)?);
    }
    Ok(subs)
}

fn native_aref(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let vid = match interp.machine.arena.get_unchecked(args[0]) {
        Node::Leaf(Value::Vector(h)) => VectorId(*h),
        _ => {
            let expected = interp.machine.classes.basic_array;
            return Err(interp.raise_domain_error(args[0], expected));
        }
    };
    let subs = array_subscripts(interp, &args[1..])?;
    let index = {
        let arr = interp.machine.arrays.get(vid).unwrap();
        match arr.row_major_index(&subs) {
            Some(i) => i,
            None => {
                return Err(interp.raise_simple_error("subscripts ~S out of range", &[args[1]]))
            }
        }
    };
    if let Some(c) = interp.machine.arrays.aref_char(vid, index) {
        return Ok(interp.machine.make_character(c));
    }
    match interp.machine.arrays.aref_general(vid, index) {
        Some(v) => Ok(v),
        None => Err(interp.raise_simple_error("subscripts ~S out of range", &[args[1]])),
    }
}

/// (set-aref value array subscripts...)
fn native_set_aref(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 3, None)?;
    let value = args[0];
    let vid = match interp.machine.arena.get_unchecked(args[1]) {
        Node::Leaf(Value::Vector(h)) => VectorId(*h),
        _ => {
            let expected = interp.machine.classes.basic_array;
            return Err(interp.raise_domain_error(args[1], expected));
        }
    };
    let subs = array_subscripts(interp, &args[2..])?;
    let (index, is_string) = {
        let arr = interp.machine.arrays.get(vid).unwrap();
        match arr.row_major_index(&subs) {
            Some(i) => (i, arr.is_string()),
            None => {
                return Err(interp.raise_simple_error("subscripts ~S out of range", &[args[2]]))
            }
        }
    };
    if is_string {
        let c = char_arg(interp, value)?;
        interp.machine.arrays.set_char(vid, index, c);
    } else {
        interp.machine.arrays.set_general(vid, index, value);
    }
    Ok(value)
}

fn native_array_dimensions(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let dims = match interp.machine.arena.get_unchecked(args[0]) {
        Node::Leaf(Value::Vector(h)) => interp
            .machine
            .arrays
            .get(VectorId(*h))
            .map(|a| a.dimensions.clone()),
        _ => None,
    };
    match dims {
        Some(dims) => {
            let mut nodes = Vec::with_capacity(dims.len());
            for d in dims {
                nodes.push(interp.machine.make_integer(d as i64));
            }
            Ok(interp.machine.list(&nodes))
        }
        None => {
            let expected = interp.machine.classes.basic_array;
            Err(interp.raise_domain_error(args[0], expected))
        }
    }
}

// ============================================================================
// Object system
// ============================================================================

fn native_class_of(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let class = interp.machine.class_of(args[0]);
    Ok(interp.machine.make_class_node(class))
}

fn class_arg(interp: &mut Interpreter, node: NodeId) -> Result<crate::classes::ClassId, Control> {
    match interp.machine.arena.get_unchecked(node) {
        Node::Leaf(Value::Class(c)) => Ok(crate::classes::ClassId(*c)),
        _ => {
            let expected = interp.machine.classes.standard_class;
            Err(interp.raise_domain_error(node, expected))
        }
    }
}

fn native_instancep(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let class = class_arg(interp, args[1])?;
    Ok(interp
        .machine
        .bool_node(interp.machine.instance_of(args[0], class)))
}

fn native_subclassp(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let a = class_arg(interp, args[0])?;
    let b = class_arg(interp, args[1])?;
    Ok(interp.machine.bool_node(interp.machine.classes.subclass_of(a, b)))
}

/// (create class initarg value ...) — instance creation protocol
fn native_create(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    let class_id = class_arg(interp, args[0])?;
    let class = interp.machine.classes.get_class(class_id).unwrap().clone();
    if class.builtin || class.abstractp {
        let name = interp.machine.make_symbol(class.name);
        return Err(interp.raise_simple_error("cannot create an instance of ~A", &[name]));
    }
    if (args.len() - 1) % 2 != 0 {
        return Err(interp.raise_program_error());
    }

    let idx = interp.machine.classes.create_instance(class_id);
    let obj = interp.machine.arena.alloc(Node::Leaf(Value::Instance(idx)));

    // Initargs first, left to right
    for pair in args[1..].chunks(2) {
        let key = symbol_arg(interp, pair[0])?;
        let value = pair[1];
        if let Some(slot) = class.slots.iter().find(|s| s.initarg == Some(key)) {
            let slot_index = slot.index;
            if let Some(inst) = interp.machine.classes.get_instance_mut(idx) {
                inst.slots[slot_index] = Some(value);
            }
        }
    }

    // Then initforms for still-unbound slots, left to right
    for slot in &class.slots {
        let unbound = interp
            .machine
            .classes
            .get_instance(idx)
            .map_or(false, |inst| inst.slots[slot.index].is_none());
        if unbound {
            if let Some(form) = slot.initform {
                let value = interp.eval(form, &Env::new())?;
                if let Some(inst) = interp.machine.classes.get_instance_mut(idx) {
                    inst.slots[slot.index] = Some(value);
                }
            }
        }
    }

    // initialize-object, if the user has defined methods on it
    let init_sym = interp.machine.initialize_object_sym;
    if let Some(gf) = interp.machine.classes.find_generic(init_sym) {
        if !interp.machine.classes.get_generic(gf).unwrap().methods.is_empty() {
            if let Some(&callee) = interp.machine.toplevel.functions.get(&init_sym) {
                let mut call_args = vec![obj];
                call_args.extend_from_slice(&args[1..]);
                interp.apply(callee, &call_args)?;
            }
        }
    }

    Ok(obj)
}

/// slot-value funnel: instances by slot name; built-in vectors and strings
/// answer LENGTH and integer indices.
fn native_slot_value(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, Some(2))?;
    let obj = args[0];
    let key = args[1];
    match interp.machine.arena.get_unchecked(obj).clone() {
        Node::Leaf(Value::Instance(_)) => {
            let name = symbol_arg(interp, key)?;
            interp.read_slot(obj, name)
        }
        Node::Leaf(Value::Vector(h)) => {
            if let Some(sym) = interp.machine.node_to_symbol(key) {
                if interp.machine.symbols.symbol_name(sym) == Some("LENGTH") {
                    let rank = interp
                        .machine
                        .arrays
                        .get(VectorId(h))
                        .map_or(1, |a| a.rank());
                    // Rank-n arrays answer LENGTH with their dimension list.
                    if rank != 1 {
                        return native_array_dimensions(interp, &[obj]);
                    }
                    return native_length(interp, &[obj]);
                }
            }
            native_elt(interp, &[obj, key])
        }
        _ => {
            let expected = interp.machine.classes.standard_object;
            Err(interp.raise_domain_error(obj, expected))
        }
    }
}

/// (set-slot-value obj key value)
fn native_set_slot_value(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 3, Some(3))?;
    let obj = args[0];
    let key = args[1];
    let value = args[2];
    match interp.machine.arena.get_unchecked(obj).clone() {
        Node::Leaf(Value::Instance(_)) => {
            let name = symbol_arg(interp, key)?;
            interp.write_slot(obj, name, value)
        }
        Node::Leaf(Value::Vector(_)) => native_set_aref(interp, &[value, obj, key]),
        _ => {
            let expected = interp.machine.classes.standard_object;
            Err(interp.raise_domain_error(obj, expected))
        }
    }
}

fn native_call_next_method(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    if interp.machine.next_methods.is_empty() {
        return Err(interp.raise_simple_error("call-next-method outside a method", &[]));
    }
    interp.invoke_next_method()
}

fn native_next_method_p(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    Ok(interp.machine.bool_node(interp.has_next_method()))
}

// ============================================================================
// Conditions
// ============================================================================

/// (error format-string obj*) — non-continuable simple error
fn native_error(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    let format = string_arg(interp, args[0])?;
    let rest = interp.machine.list(&args[1..]);
    let cond = interp.machine.simple_error(&format, rest);
    interp.signal(cond, false)
}

/// (continue-condition condition [value])
fn native_continue_condition(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(2))?;
    let condition = args[0];
    let value = args.get(1).copied().unwrap_or(interp.machine.nil_node);
    match interp.machine.conditions.find_active(condition) {
        Some(active) if active.continuable => Err(Control::ContinueSignal {
            depth: active.depth,
            value,
        }),
        _ => {
            let cond = interp.machine.control_error(condition);
            interp.signal(cond, false)
        }
    }
}

fn condition_slot(interp: &mut Interpreter, args: &[NodeId], slot: &str) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let name = interp.machine.symbols.intern(slot);
    interp.read_slot(args[0], name)
}

fn native_sef_string(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "FORMAT-STRING")
}

fn native_sef_arguments(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "FORMAT-ARGUMENTS")
}

fn native_de_object(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "OBJECT")
}

fn native_de_expected_class(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "EXPECTED-CLASS")
}

fn native_ue_name(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "NAME")
}

fn native_ue_namespace(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "NAMESPACE")
}

fn native_ae_operation(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "OPERATION")
}

fn native_ae_operands(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    condition_slot(interp, args, "OPERANDS")
}

// ============================================================================
// Application
// ============================================================================

fn native_funcall(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, None)?;
    interp.apply(args[0], &args[1..])
}

/// (apply function obj* list)
fn native_apply(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let mut call_args: Vec<NodeId> = args[1..args.len() - 1].to_vec();
    call_args.extend(list_arg(interp, args[args.len() - 1])?);
    interp.apply(args[0], &call_args)
}

fn native_identity(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    Ok(args[0])
}

fn native_eval(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    interp.eval(args[0], &Env::new())
}

fn native_gensym(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    let sym = interp.machine.symbols.gensym();
    Ok(interp
        .machine
        .arena
        .alloc(Node::Leaf(Value::Symbol(sym.0))))
}

// ============================================================================
// I/O
// ============================================================================

/// (format stream control-string obj*) -> nil
fn native_format(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 2, None)?;
    let stream = stream_arg(interp, args[0])?;
    let control = string_arg(interp, args[1])?;
    let text = printer::format_to_string(interp.machine, &control, &args[2..]);
    interp.machine.streams.write_string(stream, &text);
    Ok(interp.machine.make_nil())
}

/// (print obj) -> obj, written readably to standard output with a newline
fn native_print(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let text = printer::print_to_string(interp.machine, args[0]);
    let stdout = interp.machine.streams.stdout_id();
    interp.machine.streams.write_string(stdout, &text);
    interp.machine.streams.write_char(stdout, '\n');
    Ok(args[0])
}

fn native_standard_input(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    let id = interp.machine.streams.stdin_id();
    Ok(make_stream_node(interp, id))
}

fn native_standard_output(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    let id = interp.machine.streams.stdout_id();
    Ok(make_stream_node(interp, id))
}

fn native_error_output(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    let id = interp.machine.streams.stderr_id();
    Ok(make_stream_node(interp, id))
}

fn native_create_string_input(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let s = string_arg(interp, args[0])?;
    let id = interp.machine.streams.create_string_input(&s);
    Ok(make_stream_node(interp, id))
}

fn native_create_string_output(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(0))?;
    let id = interp.machine.streams.create_string_output();
    Ok(make_stream_node(interp, id))
}

fn native_get_output_stream_string(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let id = stream_arg(interp, args[0])?;
    match interp.machine.streams.get_output_stream_string(id) {
        Some(s) => Ok(interp.machine.make_string(&s)),
        None => {
            let expected = interp.machine.classes.stream_class;
            Err(interp.raise_domain_error(args[0], expected))
        }
    }
}

/// (read [stream]) — parse one object from the stream
fn native_read(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(1))?;
    let id = match args.first() {
        Some(&s) => stream_arg(interp, s)?,
        None => interp.machine.streams.stdin_id(),
    };

    let text = match interp.machine.streams.remaining_text(id) {
        Some(text) => text,
        None => match interp.machine.streams.read_line(id) {
            Some(line) => line,
            None => {
                let stream = args.first().copied().unwrap_or(interp.machine.nil_node);
                let cond = interp.machine.end_of_stream(stream);
                return interp.signal(cond, false);
            }
        },
    };

    let mut reader = crate::reader::Reader::new(&text, interp.machine);
    if reader.at_eof() {
        let consumed = reader.consumed();
        interp.machine.streams.advance(id, consumed);
        let stream = args.first().copied().unwrap_or(interp.machine.nil_node);
        let cond = interp.machine.end_of_stream(stream);
        return interp.signal(cond, false);
    }
    match reader.read() {
        Ok(node) => {
            let consumed = reader.consumed();
            interp.machine.streams.advance(id, consumed);
            Ok(node)
        }
        Err(e) => {
            let expected = interp.machine.classes.object_class;
            let msg = e.to_string();
            let cond = interp.machine.parse_error(&msg, expected);
            interp.signal(cond, false)
        }
    }
}

fn native_read_char(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(1))?;
    let id = match args.first() {
        Some(&s) => stream_arg(interp, s)?,
        None => interp.machine.streams.stdin_id(),
    };
    match interp.machine.streams.read_char(id) {
        Some(c) => Ok(interp.machine.make_character(c)),
        None => {
            let stream = args.first().copied().unwrap_or(interp.machine.nil_node);
            let cond = interp.machine.end_of_stream(stream);
            interp.signal(cond, false)
        }
    }
}

fn native_read_line(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 0, Some(1))?;
    let id = match args.first() {
        Some(&s) => stream_arg(interp, s)?,
        None => interp.machine.streams.stdin_id(),
    };
    match interp.machine.streams.read_line(id) {
        Some(line) => Ok(interp.machine.make_string(&line)),
        None => {
            let stream = args.first().copied().unwrap_or(interp.machine.nil_node);
            let cond = interp.machine.end_of_stream(stream);
            interp.signal(cond, false)
        }
    }
}

fn native_close(interp: &mut Interpreter, args: &[NodeId]) -> EvalResult {
    check_arity(interp, args, 1, Some(1))?;
    let id = stream_arg(interp, args[0])?;
    interp.machine.streams.close(id);
    Ok(interp.machine.make_nil())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use crate::env::Env;
    use crate::eval::Interpreter;

    fn machine() -> Machine {
        let mut m = Machine::new();
        register_natives(&mut m);
        m
    }

    fn eval_str(m: &mut Machine, input: &str) -> EvalResult {
        let expr = crate::reader::read_from_string(input, m).unwrap();
        let mut interp = Interpreter::new(m);
        interp.eval_toplevel(expr, &Env::new())
    }

    fn eval_print(m: &mut Machine, input: &str) -> String {
        let node = eval_str(m, input).expect("evaluation succeeded");
        printer::print_to_string(m, node)
    }

    #[test]
    fn test_arithmetic() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(+ 1 2 3)"), "6");
        assert_eq!(eval_print(&mut m, "(- 10 4)"), "6");
        assert_eq!(eval_print(&mut m, "(- 5)"), "-5");
        assert_eq!(eval_print(&mut m, "(* 2 3 4)"), "24");
        assert_eq!(eval_print(&mut m, "(div 7 2)"), "3");
        assert_eq!(eval_print(&mut m, "(div -7 2)"), "-4");
        assert_eq!(eval_print(&mut m, "(mod 7 2)"), "1");
        assert_eq!(eval_print(&mut m, "(mod -7 2)"), "1");
        assert_eq!(eval_print(&mut m, "(+ 1 2.5)"), "3.5");
    }

    #[test]
    fn test_overflow_promotes() {
        let mut m = machine();
        assert_eq!(
            eval_print(&mut m, "(* 9223372036854775807 2)"),
            "18446744073709551614"
        );
    }

    #[test]
    fn test_comparison_chains() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(< 1 2 3)"), "T");
        assert_eq!(eval_print(&mut m, "(< 1 3 2)"), "NIL");
        assert_eq!(eval_print(&mut m, "(= 2 2.0)"), "T");
        assert_eq!(eval_print(&mut m, "(>= 3 3 2)"), "T");
    }

    #[test]
    fn test_division_by_zero_signals() {
        let mut m = machine();
        match eval_str(&mut m, "(div 1 0)") {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.division_by_zero));
            }
            other => panic!("expected division-by-zero, got {:?}", other),
        }
    }

    #[test]
    fn test_list_operations() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(cons 1 2)"), "(1 . 2)");
        assert_eq!(eval_print(&mut m, "(list 1 2 3)"), "(1 2 3)");
        assert_eq!(eval_print(&mut m, "(car '(1 2))"), "1");
        assert_eq!(eval_print(&mut m, "(cdr '(1 2))"), "(2)");
        assert_eq!(eval_print(&mut m, "(append '(1 2) '(3) '())"), "(1 2 3)");
        assert_eq!(eval_print(&mut m, "(reverse '(1 2 3))"), "(3 2 1)");
        assert_eq!(eval_print(&mut m, "(length '(a b c))"), "3");
        assert_eq!(eval_print(&mut m, "(member 2 '(1 2 3))"), "(2 3)");
        assert_eq!(eval_print(&mut m, "(assoc 'b '((a 1) (b 2)))"), "(B 2)");
        assert_eq!(eval_print(&mut m, "(create-list 3 'x)"), "(X X X)");
        assert_eq!(eval_print(&mut m, "(elt '(a b c) 1)"), "B");
    }

    #[test]
    fn test_car_of_non_cons_is_domain_error() {
        let mut m = machine();
        match eval_str(&mut m, "(car 1)") {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.domain_error));
            }
            other => panic!("expected domain-error, got {:?}", other),
        }
    }

    #[test]
    fn test_mapcar_stops_at_shortest() {
        let mut m = machine();
        assert_eq!(
            eval_print(&mut m, "(mapcar #'+ '(1 2 3) '(10 20))"),
            "(11 22)"
        );
    }

    #[test]
    fn test_predicates() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(null '())"), "T");
        assert_eq!(eval_print(&mut m, "(atom 1)"), "T");
        assert_eq!(eval_print(&mut m, "(atom '(1))"), "NIL");
        assert_eq!(eval_print(&mut m, "(listp nil)"), "T");
        assert_eq!(eval_print(&mut m, "(symbolp 'a)"), "T");
        assert_eq!(eval_print(&mut m, "(integerp 3)"), "T");
        assert_eq!(eval_print(&mut m, "(floatp 3.5)"), "T");
        assert_eq!(eval_print(&mut m, "(stringp \"x\")"), "T");
        assert_eq!(eval_print(&mut m, "(functionp #'car)"), "T");
        assert_eq!(eval_print(&mut m, "(eq 'a 'a)"), "T");
        assert_eq!(eval_print(&mut m, "(eql 1.0 1.0)"), "T");
        assert_eq!(eval_print(&mut m, "(eql 1 1.0)"), "NIL");
        assert_eq!(eval_print(&mut m, "(equal '(1 (2)) '(1 (2)))"), "T");
    }

    #[test]
    fn test_strings_and_chars() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(string-append \"foo\" \"bar\")"), "\"foobar\"");
        assert_eq!(eval_print(&mut m, "(string= \"a\" \"a\")"), "T");
        assert_eq!(eval_print(&mut m, "(char= #\\a #\\a)"), "T");
        assert_eq!(eval_print(&mut m, "(char< #\\a #\\b)"), "T");
        assert_eq!(eval_print(&mut m, "(create-string 3 #\\x)"), "\"xxx\"");
        assert_eq!(eval_print(&mut m, "(elt \"abc\" 1)"), "#\\b");
        assert_eq!(eval_print(&mut m, "(parse-number \"42\")"), "42");
    }

    #[test]
    fn test_vectors_and_arrays() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(vector 1 2 3)"), "#(1 2 3)");
        assert_eq!(eval_print(&mut m, "(create-vector 2 0)"), "#(0 0)");
        assert_eq!(eval_print(&mut m, "(aref (vector 1 2 3) 1)"), "2");
        assert_eq!(eval_print(&mut m, "(array-dimensions (create-array '(2 3) 0))"), "(2 3)");
        assert_eq!(
            eval_print(&mut m, "(aref (create-array '(2 2) 7) 1 1)"),
            "7"
        );
    }

    #[test]
    fn test_funcall_and_apply() {
        let mut m = machine();
        assert_eq!(eval_print(&mut m, "(funcall #'+ 1 2)"), "3");
        assert_eq!(eval_print(&mut m, "(apply #'+ 1 2 '(3 4))"), "10");
        assert_eq!(eval_print(&mut m, "(funcall (lambda (x) (* x x)) 5)"), "25");
    }

    #[test]
    fn test_string_streams() {
        let mut m = machine();
        eval_str(&mut m, "(defglobal out (create-string-output-stream))").unwrap();
        eval_str(&mut m, "(format out \"x=~A\" 42)").unwrap();
        assert_eq!(
            eval_print(&mut m, "(get-output-stream-string out)"),
            "\"x=42\""
        );
        eval_str(&mut m, "(defglobal in (create-string-input-stream \"(1 2) foo\"))").unwrap();
        assert_eq!(eval_print(&mut m, "(read in)"), "(1 2)");
        assert_eq!(eval_print(&mut m, "(read in)"), "FOO");
        match eval_str(&mut m, "(read in)") {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.end_of_stream));
            }
            other => panic!("expected end-of-stream, got {:?}", other),
        }
    }

    #[test]
    fn test_error_signals_simple_error() {
        let mut m = machine();
        match eval_str(&mut m, "(error \"boom: ~A\" 13)") {
            Err(Control::Condition { condition }) => {
                assert!(m.instance_of(condition, m.classes.simple_error));
            }
            other => panic!("expected simple-error, got {:?}", other),
        }
    }
}
