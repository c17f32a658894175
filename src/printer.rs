// Islet Printer - Canonical Textual Forms
//
// Each built-in class renders to its canonical form; prin1 escapes for
// re-reading, princ is for humans.

use crate::arena::Node;
use crate::arrays::{ArrayBody, VectorId};
use crate::classes::ClassId;
use crate::machine::Machine;
use crate::symbol::SymbolId;
use crate::types::{NodeId, Value};

/// Print options
#[derive(Debug, Clone)]
pub struct PrintOptions {
    /// Print readably (escape strings and characters)
    pub escape: bool,
    /// Maximum depth to print
    pub max_depth: usize,
    /// Maximum list length to print
    pub max_length: usize,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            escape: true,
            max_depth: 100,
            max_length: 1000,
        }
    }
}

impl PrintOptions {
    /// Readable output
    pub fn prin1() -> Self {
        Self::default()
    }

    /// Human-readable output
    pub fn princ() -> Self {
        Self {
            escape: false,
            ..Self::default()
        }
    }
}

/// The Islet printer
pub struct Printer<'a> {
    machine: &'a Machine,
    output: String,
    options: PrintOptions,
    current_depth: usize,
}

impl<'a> Printer<'a> {
    pub fn new(machine: &'a Machine, options: PrintOptions) -> Self {
        Self {
            machine,
            output: String::new(),
            options,
            current_depth: 0,
        }
    }

    /// Print an expression to string
    pub fn print(&mut self, node: NodeId) -> &str {
        self.print_node(node);
        &self.output
    }

    fn print_node(&mut self, node: NodeId) {
        if self.current_depth > self.options.max_depth {
            self.output.push_str("...");
            return;
        }
        self.current_depth += 1;
        match self.machine.arena.get_unchecked(node).clone() {
            Node::Leaf(val) => self.print_leaf(&val),
            Node::Cons(_, _) => self.print_list(node),
        }
        self.current_depth -= 1;
    }

    fn print_leaf(&mut self, val: &Value) {
        match val {
            Value::Nil => self.output.push_str("NIL"),
            Value::Integer(n) => self.output.push_str(&n.to_string()),
            Value::BigInt(n) => self.output.push_str(&n.to_string()),
            Value::Float(f) => self.print_float(*f),
            Value::Character(c) => self.print_character(*c),
            Value::Symbol(id) => {
                match self.machine.symbols.symbol_name(SymbolId(*id)) {
                    Some(name) => self.output.push_str(name),
                    None => self.output.push_str(&format!("#<symbol:{}>", id)),
                }
            }
            Value::Vector(h) => self.print_array(VectorId(*h)),
            Value::Closure(id) => self.output.push_str(&format!("#<function:{}>", id)),
            Value::Native(id) => self.output.push_str(&format!("#<native:{}>", id)),
            Value::Generic(id) => self.output.push_str(&format!("#<generic:{}>", id)),
            Value::Instance(id) => {
                let class_name = self
                    .machine
                    .classes
                    .get_instance(*id)
                    .and_then(|inst| {
                        self.machine
                            .symbols
                            .symbol_name(self.machine.classes.class_name(inst.class))
                    })
                    .unwrap_or("?");
                self.output
                    .push_str(&format!("#<instance of {}>", class_name));
            }
            Value::Class(id) => {
                let name = self
                    .machine
                    .symbols
                    .symbol_name(self.machine.classes.class_name(ClassId(*id)))
                    .unwrap_or("?");
                self.output.push_str(&format!("#<class {}>", name));
            }
            Value::Stream(_) => self.output.push_str("#<stream>"),
        }
    }

    /// Floats always carry a decimal point.
    fn print_float(&mut self, f: f64) {
        if f.is_nan() {
            self.output.push_str("NaN");
        } else if f.is_infinite() {
            if f.is_sign_positive() {
                self.output.push_str("+Inf");
            } else {
                self.output.push_str("-Inf");
            }
        } else if f == f.trunc() {
            self.output.push_str(&format!("{:.1}", f));
        } else {
            self.output.push_str(&format!("{}", f));
        }
    }

    fn print_character(&mut self, c: char) {
        if !self.options.escape {
            self.output.push(c);
            return;
        }
        match c {
            ' ' => self.output.push_str("#\\space"),
            '\n' => self.output.push_str("#\\newline"),
            '\t' => self.output.push_str("#\\tab"),
            _ => {
                self.output.push_str("#\\");
                self.output.push(c);
            }
        }
    }

    fn print_array(&mut self, id: VectorId) {
        let Some(arr) = self.machine.arrays.get(id) else {
            self.output.push_str("#<array:?>");
            return;
        };
        match &arr.body {
            ArrayBody::Chars(chars) => {
                if self.options.escape {
                    self.output.push('"');
                    for &c in chars {
                        if c == '"' || c == '\\' {
                            self.output.push('\\');
                        }
                        self.output.push(c);
                    }
                    self.output.push('"');
                } else {
                    self.output.extend(chars.iter());
                }
            }
            ArrayBody::General(elements) => {
                if arr.rank() == 1 {
                    self.output.push_str("#(");
                    for (i, &e) in elements.iter().enumerate() {
                        if i > 0 {
                            self.output.push(' ');
                        }
                        if i >= self.options.max_length {
                            self.output.push_str("...");
                            break;
                        }
                        self.print_node(e);
                    }
                    self.output.push(')');
                } else {
                    self.output.push_str(&format!("#{}A", arr.rank()));
                    let dims = arr.dimensions.clone();
                    let elements = elements.clone();
                    self.print_array_level(&dims, &elements, 0);
                }
            }
        }
    }

    /// Nested (…) groups for a rank-n array, row-major.
    fn print_array_level(&mut self, dims: &[usize], elements: &[NodeId], offset: usize) {
        self.output.push('(');
        if dims.len() == 1 {
            for i in 0..dims[0] {
                if i > 0 {
                    self.output.push(' ');
                }
                self.print_node(elements[offset + i]);
            }
        } else {
            let stride: usize = dims[1..].iter().product();
            for i in 0..dims[0] {
                if i > 0 {
                    self.output.push(' ');
                }
                self.print_array_level(&dims[1..], elements, offset + i * stride);
            }
        }
        self.output.push(')');
    }

    fn print_list(&mut self, node: NodeId) {
        self.output.push('(');
        let mut current = node;
        let mut first = true;
        let mut count = 0;
        loop {
            if count >= self.options.max_length {
                self.output.push_str(" ...");
                break;
            }
            match self.machine.arena.get_unchecked(current).clone() {
                Node::Cons(car, cdr) => {
                    if !first {
                        self.output.push(' ');
                    }
                    first = false;
                    self.print_node(car);
                    current = cdr;
                    count += 1;
                }
                Node::Leaf(Value::Nil) => break,
                _ => {
                    self.output.push_str(" . ");
                    self.print_node(current);
                    break;
                }
            }
        }
        self.output.push(')');
    }
}

/// Print expression readably (like prin1)
pub fn print_to_string(machine: &Machine, node: NodeId) -> String {
    let mut printer = Printer::new(machine, PrintOptions::prin1());
    printer.print(node).to_string()
}

/// Print expression without escapes (like princ)
pub fn princ_to_string(machine: &Machine, node: NodeId) -> String {
    let mut printer = Printer::new(machine, PrintOptions::princ());
    printer.print(node).to_string()
}

/// Format directive subset: ~A ~S ~D ~C ~% ~& ~~
pub fn format_to_string(machine: &Machine, control: &str, args: &[NodeId]) -> String {
    let mut output = String::new();
    let mut chars = control.chars();
    let mut arg_idx = 0;

    while let Some(c) = chars.next() {
        if c != '~' {
            output.push(c);
            continue;
        }
        match chars.next() {
            Some('A') | Some('a') => {
                if arg_idx < args.len() {
                    output.push_str(&princ_to_string(machine, args[arg_idx]));
                    arg_idx += 1;
                }
            }
            Some('S') | Some('s') => {
                if arg_idx < args.len() {
                    output.push_str(&print_to_string(machine, args[arg_idx]));
                    arg_idx += 1;
                }
            }
            Some('D') | Some('d') => {
                if arg_idx < args.len() {
                    output.push_str(&print_to_string(machine, args[arg_idx]));
                    arg_idx += 1;
                }
            }
            Some('C') | Some('c') => {
                if arg_idx < args.len() {
                    output.push_str(&princ_to_string(machine, args[arg_idx]));
                    arg_idx += 1;
                }
            }
            Some('%') => output.push('\n'),
            Some('&') => {
                if !output.ends_with('\n') && !output.is_empty() {
                    output.push('\n');
                }
            }
            Some('~') => output.push('~'),
            Some(c) => {
                output.push('~');
                output.push(c);
            }
            None => output.push('~'),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    #[test]
    fn test_print_integer() {
        let mut m = Machine::new();
        let n = m.make_integer(42);
        assert_eq!(print_to_string(&m, n), "42");
    }

    #[test]
    fn test_print_float_keeps_point() {
        let mut m = Machine::new();
        let f = m.make_float(3.0);
        assert_eq!(print_to_string(&m, f), "3.0");
        let f = m.make_float(3.14);
        assert!(print_to_string(&m, f).starts_with("3.14"));
    }

    #[test]
    fn test_print_nil_and_t() {
        let m = Machine::new();
        assert_eq!(print_to_string(&m, m.nil_node), "NIL");
        assert_eq!(print_to_string(&m, m.t_node), "T");
    }

    #[test]
    fn test_print_list() {
        let mut m = Machine::new();
        let items = [m.make_integer(1), m.make_integer(2), m.make_integer(3)];
        let list = m.list(&items);
        assert_eq!(print_to_string(&m, list), "(1 2 3)");
    }

    #[test]
    fn test_print_dotted_pair() {
        let mut m = Machine::new();
        let a = m.make_integer(1);
        let b = m.make_integer(2);
        let pair = m.cons(a, b);
        assert_eq!(print_to_string(&m, pair), "(1 . 2)");
    }

    #[test]
    fn test_print_character() {
        let mut m = Machine::new();
        let c = m.make_character('a');
        assert_eq!(print_to_string(&m, c), "#\\a");
        assert_eq!(princ_to_string(&m, c), "a");
        let sp = m.make_character(' ');
        assert_eq!(print_to_string(&m, sp), "#\\space");
    }

    #[test]
    fn test_print_string_escaped() {
        let mut m = Machine::new();
        let s = m.make_string("he said \"hi\"");
        assert_eq!(print_to_string(&m, s), "\"he said \\\"hi\\\"\"");
        assert_eq!(princ_to_string(&m, s), "he said \"hi\"");
    }

    #[test]
    fn test_print_vector() {
        let mut m = Machine::new();
        let one = m.make_integer(1);
        let two = m.make_integer(2);
        let vid = m.arrays.alloc_from_vec(vec![one, two]);
        let v = m.arena.alloc(crate::arena::Node::Leaf(Value::Vector(vid.0)));
        assert_eq!(print_to_string(&m, v), "#(1 2)");
    }

    #[test]
    fn test_format_basic() {
        let m = Machine::new();
        let result = format_to_string(&m, "Hello~%World", &[]);
        assert_eq!(result, "Hello\nWorld");
    }

    #[test]
    fn test_format_with_args() {
        let mut m = Machine::new();
        let num = m.make_integer(42);
        let result = format_to_string(&m, "Value: ~D", &[num]);
        assert_eq!(result, "Value: 42");
        let s = m.make_string("x");
        assert_eq!(format_to_string(&m, "~A", &[s]), "x");
        assert_eq!(format_to_string(&m, "~S", &[s]), "\"x\"");
    }
}
