// Islet REPL
//
// Reader, evaluator and printer wired into a read-eval-print loop.

use islet::arena::Node;
use islet::builtins::register_natives;
use islet::control::Control;
use islet::env::Env;
use islet::eval::Interpreter;
use islet::machine::Machine;
use islet::printer::{self, print_to_string};
use islet::types::{NodeId, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io;

const PRELUDE: &str = include_str!("prelude.lisp");

fn main() -> io::Result<()> {
    println!("Islet v0.2.0 - ISO ISLISP runtime");
    println!("Type (quit) or Ctrl-D to exit");
    println!();

    let mut machine = Machine::new();
    register_natives(&mut machine);
    let env = Env::new();

    // Bootstrap the prelude
    let forms = match islet::reader::read_all(PRELUDE, &mut machine) {
        Ok(forms) => forms,
        Err(e) => {
            eprintln!("Bootstrap error (parse): {}", e);
            std::process::exit(1);
        }
    };
    for form in forms {
        let mut interp = Interpreter::new(&mut machine);
        if let Err(e) = interp.eval_toplevel(form, &env) {
            eprintln!("Bootstrap error (eval): {:?}", e);
            std::process::exit(1);
        }
    }

    // Run a file when given one
    if let Some(path) = std::env::args().nth(1) {
        let content = std::fs::read_to_string(&path)?;
        let forms = match islet::reader::read_all(&content, &mut machine) {
            Ok(forms) => forms,
            Err(e) => {
                eprintln!("{}: parse error: {}", path, e);
                std::process::exit(1);
            }
        };
        for form in forms {
            let mut interp = Interpreter::new(&mut machine);
            if let Err(token) = interp.eval_toplevel(form, &env) {
                eprintln!("{}: {}", path, describe_token(&machine, &token));
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut rl = DefaultEditor::new().expect("readline init");
    let quit_sym = machine.symbols.intern("QUIT");

    loop {
        match rl.readline("islet> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                let forms = match islet::reader::read_all(&line, &mut machine) {
                    Ok(forms) => forms,
                    Err(e) => {
                        eprintln!("Parse error: {}", e);
                        continue;
                    }
                };
                for form in forms {
                    if let Some(head) = machine.car(form) {
                        if machine.node_to_symbol(head) == Some(quit_sym) {
                            return Ok(());
                        }
                    }
                    let mut interp = Interpreter::new(&mut machine);
                    match interp.eval_toplevel(form, &env) {
                        Ok(value) => println!("{}", print_to_string(&machine, value)),
                        Err(token) => eprintln!("Error: {}", describe_token(&machine, &token)),
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }
    Ok(())
}

fn describe_token(machine: &Machine, token: &Control) -> String {
    match token {
        Control::Condition { condition } => describe_condition(machine, *condition),
        other => format!("control transfer escaped: {:?}", other),
    }
}

fn describe_condition(machine: &Machine, condition: NodeId) -> String {
    let class = machine.class_of(condition);
    let class_name = machine
        .symbols
        .symbol_name(machine.classes.class_name(class))
        .unwrap_or("?")
        .to_string();

    // Simple errors carry a format string worth showing.
    if machine.classes.subclass_of(class, machine.classes.simple_error) {
        if let Node::Leaf(Value::Instance(i)) = machine.arena.get_unchecked(condition) {
            if let Some(inst) = machine.classes.get_instance(*i) {
                let slot_named = |name: &str| {
                    machine
                        .classes
                        .get_class(class)
                        .and_then(|c| {
                            c.slots
                                .iter()
                                .find(|s| machine.symbols.symbol_name(s.name) == Some(name))
                        })
                        .and_then(|s| inst.slots[s.index])
                };
                if let Some(fs) = slot_named("FORMAT-STRING") {
                    if let Some(control) = machine.string_value(fs) {
                        let args = slot_named("FORMAT-ARGUMENTS")
                            .and_then(|a| machine.list_to_vec(a))
                            .unwrap_or_default();
                        let msg = printer::format_to_string(machine, &control, &args);
                        return format!("{}: {}", class_name, msg);
                    }
                }
            }
        }
    }
    class_name
}
