//! Fatal-error paths under the halt-on-error option: the interpreter
//! prints its unwound trace, raises the halt flag, and returns instead of
//! terminating the process.

use once_cell::sync::Lazy;
use opal_engine::stack::OP_STACK_SIZE;
use opal_engine::{
    configure, Class, Instruction, Interpreter, MemRef, Method, Opcode, Program, ValueKind,
    VmOptions,
};

const LOCAL: i64 = MemRef::Local as i64;

const DIV_ZERO: i64 = 0;
const OUT_OF_BOUNDS: i64 = 1;
const NIL_TYPE_OF: i64 = 2;
const RECURSE: i64 = 3;
const NIL_FIELD: i64 = 4;

fn fixture() -> &'static Program {
    static PROGRAM: Lazy<&'static Program> = Lazy::new(|| {
        configure(VmOptions {
            jit: false,
            halt_on_error: true,
        });

        let mut main = Class::new(0, "App.Fatal", 1, 0);
        main.add_method(Method::new(
            DIV_ZERO,
            0,
            "App.Fatal:div0:,",
            0,
            1,
            ValueKind::Int,
            vec![
                Instruction::new(Opcode::LoadIntLit, 0).at_line(3),
                Instruction::new(Opcode::LoadIntLit, 5).at_line(3),
                Instruction::of(Opcode::DivInt).at_line(4),
                Instruction::of(Opcode::Rtrn).at_line(5),
            ],
        ));
        main.add_method(Method::new(
            OUT_OF_BOUNDS,
            0,
            "App.Fatal:oob:,",
            0,
            2,
            ValueKind::Int,
            vec![
                Instruction::new(Opcode::LoadIntLit, 3),
                Instruction::new(Opcode::NewIntAry, 1),
                Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
                Instruction::new(Opcode::LoadIntLit, 5),
                Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
                Instruction::new(Opcode::LoadIntAryElm, 1),
                Instruction::of(Opcode::Rtrn),
            ],
        ));
        main.add_method(Method::new(
            NIL_TYPE_OF,
            0,
            "App.Fatal:niltypeof:,",
            0,
            1,
            ValueKind::Int,
            vec![
                Instruction::new(Opcode::LoadIntLit, 0),
                Instruction::new(Opcode::ObjTypeOf, 0),
                Instruction::of(Opcode::Rtrn),
            ],
        ));
        main.add_method(Method::new(
            RECURSE,
            0,
            "App.Fatal:recurse:,",
            0,
            1,
            ValueKind::Nil,
            vec![
                Instruction::of(Opcode::LoadInstMem).at_line(8),
                Instruction::with2(Opcode::MthdCall, 0, RECURSE).at_line(9),
                Instruction::of(Opcode::Rtrn).at_line(10),
            ],
        ));
        main.add_method(Method::new(
            NIL_FIELD,
            0,
            "App.Fatal:nilfield:,",
            0,
            1,
            ValueKind::Int,
            vec![
                Instruction::new(Opcode::LoadIntLit, 0),
                Instruction::with2(Opcode::LoadIntVar, 0, MemRef::Inst as i64),
                Instruction::of(Opcode::Rtrn),
            ],
        ));
        Program::new(vec![main]).install()
    });
    *PROGRAM
}

/// Run a fixture method; report whether the interpreter halted.
fn runs_fatally(method_id: i64) -> bool {
    let program = fixture();
    let method = program
        .class(0)
        .and_then(|c| c.method(method_id))
        .expect("fixture method");

    let mut op_stack = vec![0usize; OP_STACK_SIZE];
    let mut pos: i64 = 0;
    let mut intpr = Interpreter::new();
    let halted = intpr.halt_flag();
    intpr.execute(
        op_stack.as_mut_ptr(),
        &mut pos,
        0,
        method,
        std::ptr::null_mut(),
        false,
    );
    halted.load(std::sync::atomic::Ordering::SeqCst)
}

#[test]
fn test_division_by_zero_is_fatal() {
    assert!(runs_fatally(DIV_ZERO));
}

#[test]
fn test_out_of_bounds_access_is_fatal() {
    assert!(runs_fatally(OUT_OF_BOUNDS));
}

#[test]
fn test_type_of_nil_is_fatal() {
    assert!(runs_fatally(NIL_TYPE_OF));
}

#[test]
fn test_unbounded_recursion_overflows_the_call_stack() {
    assert!(runs_fatally(RECURSE));
}

#[test]
fn test_nil_field_access_is_fatal() {
    assert!(runs_fatally(NIL_FIELD));
}
