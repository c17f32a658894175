// unwind-protect and stack-balance properties across every exit path.

use islet::builtins::register_natives;
use islet::control::Control;
use islet::env::Env;
use islet::eval::Interpreter;
use islet::machine::Machine;
use islet::printer::print_to_string;
use islet::types::NodeId;

fn machine() -> Machine {
    let mut m = Machine::new();
    register_natives(&mut m);
    m
}

fn eval_string(m: &mut Machine, input: &str) -> Result<NodeId, Control> {
    let forms = islet::reader::read_all(input, m).expect("parse");
    let env = Env::new();
    let mut last = m.make_nil();
    for form in forms {
        let mut interp = Interpreter::new(m);
        last = interp.eval_toplevel(form, &env)?;
    }
    Ok(last)
}

fn eval_print(m: &mut Machine, input: &str) -> String {
    let node = eval_string(m, input).expect("evaluation succeeded");
    print_to_string(m, node)
}

fn cleanup_count(m: &mut Machine, body: &str) -> String {
    eval_string(m, "(defglobal count 0)").unwrap();
    eval_string(m, body).ok();
    eval_print(m, "count")
}

#[test]
fn test_cleanup_runs_once_on_normal_return() {
    let mut m = machine();
    let count = cleanup_count(
        &mut m,
        "(unwind-protect 'value (setq count (+ count 1)))",
    );
    assert_eq!(count, "1");
}

#[test]
fn test_cleanup_runs_once_on_throw() {
    let mut m = machine();
    let count = cleanup_count(
        &mut m,
        "(catch 'tag (unwind-protect (throw 'tag 1) (setq count (+ count 1))))",
    );
    assert_eq!(count, "1");
}

#[test]
fn test_cleanup_runs_once_on_return_from() {
    let mut m = machine();
    let count = cleanup_count(
        &mut m,
        "(block b (unwind-protect (return-from b 1) (setq count (+ count 1))))",
    );
    assert_eq!(count, "1");
}

#[test]
fn test_cleanup_runs_once_on_go() {
    let mut m = machine();
    let count = cleanup_count(
        &mut m,
        "(tagbody (unwind-protect (go out) (setq count (+ count 1))) out)",
    );
    assert_eq!(count, "1");
}

#[test]
fn test_cleanup_runs_once_on_signal() {
    let mut m = machine();
    let count = cleanup_count(
        &mut m,
        "(catch 'esc
           (with-handler (lambda (c) (throw 'esc 'handled))
             (unwind-protect (error \"x\") (setq count (+ count 1)))))",
    );
    assert_eq!(count, "1");
}

#[test]
fn test_cleanups_run_innermost_out() {
    let mut m = machine();
    eval_string(&mut m, "(defglobal order nil)").unwrap();
    eval_string(
        &mut m,
        "(catch 'tag
           (unwind-protect
               (unwind-protect (throw 'tag 1)
                 (setq order (cons 'inner order)))
             (setq order (cons 'outer order))))",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "order"), "(OUTER INNER)");
}

#[test]
fn test_protected_value_survives_cleanup() {
    let mut m = machine();
    assert_eq!(
        eval_print(&mut m, "(defglobal x 0) (unwind-protect 41 (setq x 1))"),
        "41"
    );
    assert_eq!(eval_print(&mut m, "x"), "1");
}

#[test]
fn test_cleanup_token_replaces_propagating_token() {
    let mut m = machine();
    // The cleanup's throw to OUTER replaces the throw to INNER in flight.
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'outer
               (catch 'inner
                 (unwind-protect (throw 'inner 1)
                   (throw 'outer 'replaced))))"
        ),
        "REPLACED"
    );
}

#[test]
fn test_dynamic_stack_balanced_after_tokens() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(catch 'foo (dynamic-let ((d 1)) (dynamic-let ((d 2)) (throw 'foo 1))))",
    )
    .unwrap();
    assert_eq!(m.dynamic_stack.len(), 0);

    eval_string(
        &mut m,
        "(block b (dynamic-let ((d 1)) (return-from b 1)))",
    )
    .unwrap();
    assert_eq!(m.dynamic_stack.len(), 0);

    eval_string(
        &mut m,
        "(catch 'esc (with-handler (lambda (c) (throw 'esc 1))
           (dynamic-let ((d 1)) (error \"x\"))))",
    )
    .unwrap();
    assert_eq!(m.dynamic_stack.len(), 0);
    assert_eq!(m.conditions.handler_depth(), 0);
}

#[test]
fn test_catch_tags_compared_by_eql() {
    let mut m = machine();
    // Integer tags match by value, not identity.
    assert_eq!(eval_print(&mut m, "(catch 17 (throw 17 'got))"), "GOT");
    // Mismatched tags propagate past the inner catch.
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'a (catch 'b (throw 'a 'escaped) 'inner))"
        ),
        "ESCAPED"
    );
}

#[test]
fn test_nested_blocks_same_name() {
    let mut m = machine();
    // return-from targets the innermost block named B.
    assert_eq!(
        eval_print(&mut m, "(block b (list 'outer (block b (return-from b 'inner) 'dead)))"),
        "(OUTER INNER)"
    );
}

#[test]
fn test_while_loop_with_state() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(let ((i 0) (acc nil))
               (while (< i 3)
                 (setq acc (cons i acc))
                 (setq i (+ i 1)))
               acc)"
        ),
        "(2 1 0)"
    );
}

#[test]
fn test_and_or_cond() {
    let mut m = machine();
    assert_eq!(eval_print(&mut m, "(and 1 2 3)"), "3");
    assert_eq!(eval_print(&mut m, "(and 1 nil 3)"), "NIL");
    assert_eq!(eval_print(&mut m, "(and)"), "T");
    assert_eq!(eval_print(&mut m, "(or nil 2 3)"), "2");
    assert_eq!(eval_print(&mut m, "(or nil nil)"), "NIL");
    assert_eq!(eval_print(&mut m, "(cond (nil 1) (t 2))"), "2");
    assert_eq!(eval_print(&mut m, "(cond (7))"), "7");
    assert_eq!(eval_print(&mut m, "(cond)"), "NIL");
}
