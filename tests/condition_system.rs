// Condition signaling, handler search, continuable resumption, and the
// control-error rules around misbehaving handlers.

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

fn expect_condition(m: &mut Machine, input: &str, class: islet::classes::ClassId) {
    match eval_string(m, input) {
        Err(Control::Condition { condition }) => {
            assert!(
                m.instance_of(condition, class),
                "wrong condition class for {}",
                input
            );
        }
        other => panic!("expected condition from {}, got {:?}", input, other),
    }
}

#[test]
fn test_unhandled_condition_reaches_boundary() {
    let mut m = machine();
    let class = m.classes.simple_error;
    expect_condition(&mut m, "(error \"boom\")", class);
}

#[test]
fn test_handler_can_exit_nonlocally() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'esc (with-handler (lambda (c) (throw 'esc 'handled)) (error \"x\") 'unreached))"
        ),
        "HANDLED"
    );
}

#[test]
fn test_handler_sees_condition_slots() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'e (with-handler (lambda (c) (throw 'e (domain-error-object c))) (car 5)))"
        ),
        "5"
    );
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'e (with-handler (lambda (c) (throw 'e (simple-error-format-string c)))
                (error \"fmt ~A\" 1)))"
        ),
        "\"fmt ~A\""
    );
}

#[test]
fn test_continuable_signal_resumes_with_value() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(with-handler (lambda (c) (continue-condition c 42))
               (signal-condition (create (class <simple-error>)
                                         'format-string \"s\"
                                         'format-arguments nil)
                                 t))"
        ),
        "42"
    );
}

#[test]
fn test_unbound_variable_is_continuable() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(with-handler (lambda (c) (continue-condition c 7)) no-such-variable)"
        ),
        "7"
    );
}

#[test]
fn test_continue_on_non_continuable_is_control_error() {
    let mut m = machine();
    let class = m.classes.control_error;
    expect_condition(
        &mut m,
        "(with-handler (lambda (c) (continue-condition c 42))
           (signal-condition (create (class <simple-error>)
                                     'format-string \"s\"
                                     'format-arguments nil)
                             nil))",
        class,
    );
}

#[test]
fn test_handler_returning_normally_is_control_error() {
    let mut m = machine();
    // The inner handler declines by returning; that raises control-error
    // to the outer handler.
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'esc
               (with-handler (lambda (c) (throw 'esc 'outer-saw-it))
                 (with-handler (lambda (c) nil)
                   (error \"inner\"))))"
        ),
        "OUTER-SAW-IT"
    );
}

#[test]
fn test_inner_handlers_are_masked_while_handling() {
    let mut m = machine();
    // A condition signaled inside a handler must not re-enter that same
    // handler; it goes to the outer one.
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'esc
               (with-handler (lambda (c) (throw 'esc 'outer))
                 (with-handler (lambda (c) (error \"again\"))
                   (error \"first\"))))"
        ),
        "OUTER"
    );
}

#[test]
fn test_handler_search_is_innermost_first() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'esc
               (with-handler (lambda (c) (throw 'esc 'outer))
                 (with-handler (lambda (c) (throw 'esc 'inner))
                   (error \"x\"))))"
        ),
        "INNER"
    );
}

#[test]
fn test_handler_stack_balanced_after_nonlocal_exit() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(catch 'foo (with-handler (lambda (c) nil) (throw 'foo 1)))",
    )
    .unwrap();
    assert_eq!(m.conditions.handler_depth(), 0);
    assert_eq!(m.conditions.active_count(), 0);
}

#[test]
fn test_signal_condition_rejects_non_condition() {
    let mut m = machine();
    let class = m.classes.domain_error;
    expect_condition(&mut m, "(signal-condition 42 nil)", class);
}

#[test]
fn test_throw_without_catch_is_control_error() {
    let mut m = machine();
    let class = m.classes.control_error;
    expect_condition(&mut m, "(throw 'nowhere 1)", class);
    expect_condition(&mut m, "(return-from nowhere 1)", class);
    expect_condition(&mut m, "(go nowhere)", class);
}

#[test]
fn test_undefined_function_condition() {
    let mut m = machine();
    let class = m.classes.undefined_function;
    expect_condition(&mut m, "(no-such-function 1 2)", class);
    // The condition carries name and namespace.
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'e (with-handler (lambda (c) (throw 'e (undefined-entity-name c)))
                (no-such-function)))"
        ),
        "NO-SUCH-FUNCTION"
    );
}

#[test]
fn test_domain_error_expected_class() {
    let mut m = machine();
    assert_eq!(
        eval_print(
            &mut m,
            "(catch 'e (with-handler (lambda (c) (throw 'e (domain-error-expected-class c)))
                (car 5)))"
        ),
        "#<class <CONS>>"
    );
}
