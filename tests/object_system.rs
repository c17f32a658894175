// defclass / defgeneric / defmethod: slot options, instance creation,
// CPL-ordered dispatch and standard method combination.

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

fn define_point(m: &mut Machine) {
    eval_string(
        m,
        "(defclass <point> ()
           ((x :initarg x :accessor point-x :initform 0)
            (y :initarg y :accessor point-y :initform 0)))",
    )
    .unwrap();
}

#[test]
fn test_create_with_initargs_and_initforms() {
    let mut m = machine();
    define_point(&mut m);
    eval_string(&mut m, "(defglobal p (create (class <point>) 'x 3))").unwrap();
    assert_eq!(eval_print(&mut m, "(point-x p)"), "3");
    assert_eq!(eval_print(&mut m, "(point-y p)"), "0");
}

#[test]
fn test_accessor_setf_place() {
    let mut m = machine();
    define_point(&mut m);
    eval_string(&mut m, "(defglobal p (create (class <point>)))").unwrap();
    assert_eq!(eval_print(&mut m, "(setf (point-x p) 10)"), "10");
    assert_eq!(eval_print(&mut m, "(point-x p)"), "10");
}

#[test]
fn test_class_of_and_instancep() {
    let mut m = machine();
    define_point(&mut m);
    eval_string(&mut m, "(defglobal p (create (class <point>)))").unwrap();
    assert_eq!(eval_print(&mut m, "(class-of p)"), "#<class <POINT>>");
    assert_eq!(eval_print(&mut m, "(instancep p (class <point>))"), "T");
    assert_eq!(eval_print(&mut m, "(instancep p (class <object>))"), "T");
    assert_eq!(eval_print(&mut m, "(instancep 1 (class <point>))"), "NIL");
    assert_eq!(eval_print(&mut m, "(class-of 1)"), "#<class <INTEGER>>");
    assert_eq!(eval_print(&mut m, "(class-of nil)"), "#<class <NULL>>");
    assert_eq!(eval_print(&mut m, "(subclassp (class <cons>) (class <list>))"), "T");
}

#[test]
fn test_abstract_class_refuses_create() {
    let mut m = machine();
    eval_string(&mut m, "(defclass <shape> () () (:abstractp t))").unwrap();
    match eval_string(&mut m, "(create (class <shape>))") {
        Err(Control::Condition { condition }) => {
            assert!(m.instance_of(condition, m.classes.simple_error));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_dispatch_prefers_most_specific() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defgeneric speak (x))
         (defmethod speak ((x <a>)) 'general)
         (defmethod speak ((x <b>)) 'specific)",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "(speak (create (class <b>)))"), "SPECIFIC");
    assert_eq!(eval_print(&mut m, "(speak (create (class <a>)))"), "GENERAL");
}

#[test]
fn test_call_next_method_chains_primaries() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defgeneric chain (x))
         (defmethod chain ((x <a>)) (list 'a))
         (defmethod chain ((x <b>)) (cons 'b (call-next-method)))",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "(chain (create (class <b>)))"), "(B A)");
}

#[test]
fn test_next_method_p() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defgeneric probe (x))
         (defmethod probe ((x <a>)) (next-method-p))
         (defmethod probe ((x <b>)) (next-method-p))",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "(probe (create (class <b>)))"), "T");
    assert_eq!(eval_print(&mut m, "(probe (create (class <a>)))"), "NIL");
}

#[test]
fn test_standard_method_combination_order() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defglobal trace nil)
         (defun note (tag) (setq trace (cons tag trace)))
         (defgeneric run (x))
         (defmethod run :around ((x <b>)) (note 'around-b) (call-next-method))
         (defmethod run :before ((x <b>)) (note 'before-b))
         (defmethod run :before ((x <a>)) (note 'before-a))
         (defmethod run ((x <b>)) (note 'primary-b) 'result)
         (defmethod run :after ((x <b>)) (note 'after-b))
         (defmethod run :after ((x <a>)) (note 'after-a))",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "(run (create (class <b>)))"), "RESULT");
    // around, then befores most-specific first, primary, afters
    // least-specific first; trace is built in reverse.
    assert_eq!(
        eval_print(&mut m, "(reverse trace)"),
        "(AROUND-B BEFORE-B BEFORE-A PRIMARY-B AFTER-A AFTER-B)"
    );
}

#[test]
fn test_adding_unrelated_method_is_monotonic() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defgeneric speak (x))
         (defmethod speak ((x <a>)) 'general)
         (defmethod speak ((x <b>)) 'specific)
         (defglobal b-inst (create (class <b>)))",
    )
    .unwrap();
    let before = eval_print(&mut m, "(speak b-inst)");
    // An unrelated class and method must not change the existing call.
    eval_string(
        &mut m,
        "(defclass <c> () ())
         (defmethod speak ((x <c>)) 'c-speak)",
    )
    .unwrap();
    let after = eval_print(&mut m, "(speak b-inst)");
    assert_eq!(before, after);
}

#[test]
fn test_argument_precedence_order() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())
         (defgeneric left-first (x y))
         (defmethod left-first ((x <b>) (y <a>)) 'by-x)
         (defmethod left-first ((x <a>) (y <b>)) 'by-y)
         (defgeneric right-first (x y) (:argument-precedence-order y x))
         (defmethod right-first ((x <b>) (y <a>)) 'by-x)
         (defmethod right-first ((x <a>) (y <b>)) 'by-y)",
    )
    .unwrap();
    eval_string(&mut m, "(defglobal bb (create (class <b>)))").unwrap();
    // Leftmost parameter is most significant by default; the option
    // reverses that.
    assert_eq!(eval_print(&mut m, "(left-first bb bb)"), "BY-X");
    assert_eq!(eval_print(&mut m, "(right-first bb bb)"), "BY-Y");
}

#[test]
fn test_diamond_dispatch_uses_c3_order() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <base> () ())
         (defclass <left> (<base>) ())
         (defclass <right> (<base>) ())
         (defclass <both> (<left> <right>) ())
         (defgeneric pick (x))
         (defmethod pick ((x <left>)) 'left)
         (defmethod pick ((x <right>)) 'right)",
    )
    .unwrap();
    // C3 puts <left> before <right> for <both>.
    assert_eq!(eval_print(&mut m, "(pick (create (class <both>)))"), "LEFT");
}

#[test]
fn test_inconsistent_hierarchy_signals_class_error() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <a> () ())
         (defclass <b> (<a>) ())",
    )
    .unwrap();
    match eval_string(&mut m, "(defclass <bad> (<a> <b>) ())") {
        Err(Control::Condition { condition }) => {
            assert!(m.instance_of(condition, m.classes.class_error));
        }
        other => panic!("expected class-error, got {:?}", other),
    }
}

#[test]
fn test_undefined_superclass_signals() {
    let mut m = machine();
    match eval_string(&mut m, "(defclass <orphan> (<missing>) ())") {
        Err(Control::Condition { condition }) => {
            assert!(m.instance_of(condition, m.classes.undefined_entity));
        }
        other => panic!("expected undefined-entity, got {:?}", other),
    }
}

#[test]
fn test_slot_value_funnel_on_builtins() {
    let mut m = machine();
    assert_eq!(eval_print(&mut m, "(slot-value (vector 1 2 3) 'length)"), "3");
    assert_eq!(eval_print(&mut m, "(slot-value (vector 1 2 3) 1)"), "2");
    assert_eq!(eval_print(&mut m, "(slot-value \"abc\" 'length)"), "3");
    assert_eq!(eval_print(&mut m, "(slot-value \"abc\" 0)"), "#\\a");
    assert_eq!(
        eval_print(&mut m, "(slot-value (create-array '(2 3) 0) 'length)"),
        "(2 3)"
    );
}

#[test]
fn test_reader_and_boundp_slot_options() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <box> ()
           ((content :initarg content :reader box-content :boundp box-filled-p)))",
    )
    .unwrap();
    eval_string(&mut m, "(defglobal full (create (class <box>) 'content 5))").unwrap();
    eval_string(&mut m, "(defglobal empty (create (class <box>)))").unwrap();
    assert_eq!(eval_print(&mut m, "(box-content full)"), "5");
    assert_eq!(eval_print(&mut m, "(box-filled-p full)"), "T");
    assert_eq!(eval_print(&mut m, "(box-filled-p empty)"), "NIL");
    // Reading an unbound slot signals.
    match eval_string(&mut m, "(box-content empty)") {
        Err(Control::Condition { condition }) => {
            assert!(m.instance_of(condition, m.classes.simple_error));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_slot_inheritance_in_subclass() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <named> () ((name :initarg name :accessor name-of)))
         (defclass <dog> (<named>) ((breed :initarg breed :accessor breed-of)))",
    )
    .unwrap();
    eval_string(
        &mut m,
        "(defglobal rex (create (class <dog>) 'name \"Rex\" 'breed \"Lab\"))",
    )
    .unwrap();
    assert_eq!(eval_print(&mut m, "(name-of rex)"), "\"Rex\"");
    assert_eq!(eval_print(&mut m, "(breed-of rex)"), "\"Lab\"");
}

#[test]
fn test_initialize_object_hook_runs() {
    let mut m = machine();
    eval_string(
        &mut m,
        "(defclass <counter> () ((n :initform 0 :accessor counter-n)))
         (defgeneric initialize-object (obj :rest initargs))
         (defmethod initialize-object ((obj <counter>) :rest initargs)
           (setf (counter-n obj) 100)
           obj)",
    )
    .unwrap();
    eval_string(&mut m, "(defglobal c (create (class <counter>)))").unwrap();
    assert_eq!(eval_print(&mut m, "(counter-n c)"), "100");
}
