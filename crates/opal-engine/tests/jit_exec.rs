//! JIT/interpreter equivalence: the same method body run natively through
//! the call boundary and directly under the dispatch loop must agree.

#![cfg(all(target_arch = "x86_64", unix))]

use once_cell::sync::Lazy;
use opal_engine::stack::OP_STACK_SIZE;
use opal_engine::{
    configure, Class, Instruction, Interpreter, MemRef, Method, Opcode, Program, ValueKind,
    VmOptions,
};

const LOCAL: i64 = MemRef::Local as i64;
const CLS: i64 = MemRef::Cls as i64;

const MAIN_DRIVER: i64 = 0;
const SUM: i64 = 1;
const FIB: i64 = 2;
const FIB_DRIVER: i64 = 3;
const ARRAY_FILL: i64 = 4;
const ARRAY_DRIVER: i64 = 5;
const FSUM: i64 = 6;
const FSUM_DRIVER: i64 = 7;
const NOW: i64 = 8;
const NOW_DRIVER: i64 = 9;
const MKOBJ: i64 = 10;
const MKOBJ_DRIVER: i64 = 11;

fn sum_method() -> Method {
    // sum(n): acc = 0; i = 1; while i <= n { acc += i; i += 1 }; acc
    Method::new(
        SUM,
        0,
        "App.Jit:sum:i,",
        1,
        4,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::new(Opcode::Lbl, 0),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::LesEqlInt),
            Instruction::with2(Opcode::Jmp, 1, 0),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::with2(Opcode::Jmp, 0, -1),
            Instruction::new(Opcode::Lbl, 1),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn fib_method() -> Method {
    Method::new(
        FIB,
        0,
        "App.Jit:fib:i,",
        1,
        6,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::with2(Opcode::StorIntVar, 3, LOCAL),
            Instruction::new(Opcode::Lbl, 0),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 3, LOCAL),
            Instruction::of(Opcode::LesInt),
            Instruction::with2(Opcode::Jmp, 1, 0),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 4, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 4, LOCAL),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 3, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 3, LOCAL),
            Instruction::with2(Opcode::Jmp, 0, -1),
            Instruction::new(Opcode::Lbl, 1),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn driver_method(
    id: i64,
    name: &str,
    callee: i64,
    arg: Option<i64>,
    cls_slot: i64,
    float_result: bool,
) -> Method {
    // call the callee through the boundary, store the result in class
    // memory, leave the stack empty
    let mut code = Vec::new();
    if let Some(arg) = arg {
        code.push(Instruction::new(Opcode::LoadIntLit, arg));
    }
    code.push(Instruction::of(Opcode::LoadInstMem));
    code.push(Instruction::with2(Opcode::MthdCall, 0, callee));
    code.push(Instruction::of(Opcode::LoadClsMem));
    if float_result {
        code.push(Instruction::with2(Opcode::StorFloatVar, cls_slot, CLS));
    } else {
        code.push(Instruction::with2(Opcode::StorIntVar, cls_slot, CLS));
    }
    code.push(Instruction::of(Opcode::Rtrn));
    Method::new(id, 0, name, 0, 1, ValueKind::Nil, code)
}

fn array_fill_method() -> Method {
    // arr = new int[n]; for i in 0..n { arr[i] = i }; sum of reloads
    Method::new(
        ARRAY_FILL,
        0,
        "App.Jit:fillsum:i,",
        1,
        6,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::new(Opcode::NewIntAry, 1),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::with2(Opcode::StorIntVar, 3, LOCAL),
            Instruction::new(Opcode::Lbl, 0),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::LesInt),
            Instruction::with2(Opcode::Jmp, 1, 0),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::new(Opcode::StorIntAryElm, 1),
            Instruction::with2(Opcode::LoadIntVar, 3, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntAryElm, 1),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 3, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::with2(Opcode::Jmp, 0, -1),
            Instruction::new(Opcode::Lbl, 1),
            Instruction::with2(Opcode::LoadIntVar, 3, LOCAL),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn fsum_method() -> Method {
    // acc = 0.0; for i in 1..=n { acc += i2f(i) * 0.5 }; acc
    Method::new(
        FSUM,
        0,
        "App.Jit:fsum:i,",
        1,
        4,
        ValueKind::Float,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::float(0.0),
            Instruction::with2(Opcode::StorFloatVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::new(Opcode::Lbl, 0),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::LesEqlInt),
            Instruction::with2(Opcode::Jmp, 1, 0),
            Instruction::with2(Opcode::LoadFloatVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::I2F),
            Instruction::float(0.5),
            Instruction::of(Opcode::MulFloat),
            Instruction::of(Opcode::AddFloat),
            Instruction::with2(Opcode::StorFloatVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL),
            Instruction::with2(Opcode::Jmp, 0, -1),
            Instruction::new(Opcode::Lbl, 1),
            Instruction::with2(Opcode::LoadFloatVar, 1, LOCAL),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn now_method() -> Method {
    Method::new(
        NOW,
        0,
        "App.Jit:now:,",
        0,
        1,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::TrapRtrn, 266, 0),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn mkobj_method() -> Method {
    // allocate an instance and test its conformance, all through the bridge
    Method::new(
        MKOBJ,
        0,
        "App.Jit:mkobj:,",
        0,
        1,
        ValueKind::Int,
        vec![
            Instruction::new(Opcode::NewObjInst, 0),
            Instruction::new(Opcode::ObjTypeOf, 0),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn fixture() -> &'static Program {
    static PROGRAM: Lazy<&'static Program> = Lazy::new(|| {
        configure(VmOptions {
            jit: true,
            halt_on_error: false,
        });

        let mut jit_cls = Class::new(0, "App.Jit", 1, 8);
        jit_cls.add_method(driver_method(
            MAIN_DRIVER,
            "App.Jit:main:,",
            SUM,
            Some(1000),
            0,
            false,
        ));
        jit_cls.add_method(sum_method());
        jit_cls.add_method(fib_method());
        jit_cls.add_method(driver_method(
            FIB_DRIVER,
            "App.Jit:fibmain:,",
            FIB,
            Some(10),
            1,
            false,
        ));
        jit_cls.add_method(array_fill_method());
        jit_cls.add_method(driver_method(
            ARRAY_DRIVER,
            "App.Jit:arymain:,",
            ARRAY_FILL,
            Some(10),
            2,
            false,
        ));
        jit_cls.add_method(fsum_method());
        jit_cls.add_method(driver_method(
            FSUM_DRIVER,
            "App.Jit:fsummain:,",
            FSUM,
            Some(10),
            3,
            true,
        ));
        jit_cls.add_method(now_method());
        jit_cls.add_method(driver_method(
            NOW_DRIVER,
            "App.Jit:nowmain:,",
            NOW,
            None,
            4,
            false,
        ));
        jit_cls.add_method(mkobj_method());
        jit_cls.add_method(driver_method(
            MKOBJ_DRIVER,
            "App.Jit:objmain:,",
            MKOBJ,
            None,
            5,
            false,
        ));
        Program::new(vec![jit_cls]).install()
    });
    *PROGRAM
}

fn run(method_id: i64, args: &[usize]) -> (Vec<usize>, i64) {
    let program = fixture();
    let method = program
        .class(0)
        .and_then(|c| c.method(method_id))
        .expect("fixture method");

    let mut op_stack = vec![0usize; OP_STACK_SIZE];
    let mut pos: i64 = 0;
    for &arg in args {
        op_stack[pos as usize] = arg;
        pos += 1;
    }

    let mut intpr = Interpreter::new();
    intpr.execute(
        op_stack.as_mut_ptr(),
        &mut pos,
        0,
        method,
        std::ptr::null_mut(),
        false,
    );
    (op_stack, pos)
}

fn class_memory_slot(slot: usize) -> i64 {
    let cls = fixture().class(0).expect("fixture class");
    unsafe { *cls.class_memory().add(slot) as i64 }
}

#[test]
fn test_sum_equivalent_under_both_execution_modes() {
    // entry methods always interpret; calls through the boundary compile
    let (stack, pos) = run(SUM, &[1000]);
    assert_eq!(pos, 1);
    let interpreted = stack[0] as i64;
    assert_eq!(interpreted, 500500);

    let (_, pos) = run(MAIN_DRIVER, &[]);
    assert_eq!(pos, 0, "driver leaves the operand stack empty");

    let sum = fixture().class(0).and_then(|c| c.method(SUM)).unwrap();
    assert!(
        sum.native_code().is_some(),
        "the callee was compiled on first call"
    );
    assert_eq!(class_memory_slot(0), interpreted);
}

#[test]
fn test_fib_equivalent_under_both_execution_modes() {
    let (stack, _) = run(FIB, &[10]);
    assert_eq!(stack[0] as i64, 55);

    let (_, pos) = run(FIB_DRIVER, &[]);
    assert_eq!(pos, 0);
    assert_eq!(class_memory_slot(1), 55);
}

#[test]
fn test_array_fill_equivalent_under_both_execution_modes() {
    let (stack, _) = run(ARRAY_FILL, &[10]);
    assert_eq!(stack[0] as i64, 45, "interpreted");

    let (_, pos) = run(ARRAY_DRIVER, &[]);
    assert_eq!(pos, 0);
    assert_eq!(class_memory_slot(2), 45, "compiled through the bridge");
}

#[test]
fn test_float_loop_equivalent_under_both_execution_modes() {
    let (stack, _) = run(FSUM, &[10]);
    assert_eq!(f64::from_bits(stack[0] as u64), 27.5, "interpreted");

    let (_, pos) = run(FSUM_DRIVER, &[]);
    assert_eq!(pos, 0);
    let cls = fixture().class(0).expect("fixture class");
    let compiled = f64::from_bits(unsafe { *cls.class_memory().add(3) } as u64);
    assert_eq!(compiled, 27.5);
}

#[test]
fn test_trap_return_through_native_bridge() {
    let (_, pos) = run(NOW_DRIVER, &[]);
    assert_eq!(pos, 0);
    assert!(class_memory_slot(4) > 1_577_000_000_000, "epoch millis");
}

#[test]
fn test_allocation_and_type_test_through_native_bridge() {
    let (_, pos) = run(MKOBJ_DRIVER, &[]);
    assert_eq!(pos, 0);
    assert_eq!(class_memory_slot(5), 1);
}

#[test]
fn test_compiled_code_reused_across_calls() {
    run(MAIN_DRIVER, &[]);
    let sum = fixture().class(0).and_then(|c| c.method(SUM)).unwrap();
    let first = sum.native_code().map(|c| c.ptr());

    run(MAIN_DRIVER, &[]);
    let second = sum.native_code().map(|c| c.ptr());
    assert_eq!(first, second, "native code is attached once and reused");
    assert_eq!(class_memory_slot(0), 500500);
}
