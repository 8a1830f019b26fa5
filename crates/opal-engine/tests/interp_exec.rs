//! Interpreter execution scenarios against an in-memory program image.

use once_cell::sync::Lazy;
use opal_engine::{
    configure, dispatch_cache_stats, AllocKind, Class, Instruction, Interpreter, MemRef,
    MemoryManager, Method, Opcode, Program, ValueKind, VmOptions,
};
use opal_engine::stack::OP_STACK_SIZE;

const LOCAL: i64 = MemRef::Local as i64;

// method ids within App.Main
const FIB: i64 = 0;
const FILL_SUM: i64 = 1;
const COPY_INTS: i64 = 2;
const INT_ROUND_TRIP: i64 = 3;
const FLOAT_ROUND_TRIP: i64 = 4;
const CALL_TAG: i64 = 5;
const CAST_NIL: i64 = 6;
const TYPE_OF: i64 = 7;
const FLOAT_LESS: i64 = 8;
const ARY_SIZE: i64 = 9;
const MATRIX: i64 = 10;
const BITS: i64 = 11;
const SWAP_POP: i64 = 12;
const NOW: i64 = 13;

fn fib_method() -> Method {
    // a = 0; b = 1; i = 0; while i < n { t = a + b; a = b; b = t; i += 1 }; a
    Method::new(
        FIB,
        0,
        "App.Main:fib:i,",
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

fn fill_sum_method() -> Method {
    // arr = new int[n]; for i in 0..n { arr[i] = i }; sum of reloads
    Method::new(
        FILL_SUM,
        0,
        "App.Main:fillsum:i,",
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
            // arr[i] = i
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::new(Opcode::StorIntAryElm, 1),
            // acc += arr[i]
            Instruction::with2(Opcode::LoadIntVar, 3, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntAryElm, 1),
            Instruction::of(Opcode::AddInt),
            Instruction::with2(Opcode::StorIntVar, 3, LOCAL),
            // i += 1
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

fn copy_ints_method() -> Method {
    // args (bottom..top): src, dst, length; copies with both offsets at 3
    Method::new(
        COPY_INTS,
        0,
        "App.Main:cpyints:i,i,i,",
        3,
        5,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL), // length
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL), // dst
            Instruction::with2(Opcode::StorIntVar, 2, LOCAL), // src
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 3),
            Instruction::with2(Opcode::LoadIntVar, 2, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 3),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::of(Opcode::CpyIntAry),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn int_round_trip_method() -> Method {
    // value -> chars (base 10) -> value
    Method::new(
        INT_ROUND_TRIP,
        0,
        "App.Main:i2s2i:i,",
        1,
        3,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 17),
            Instruction::new(Opcode::NewCharAry, 1),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 10),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::I2S),
            Instruction::new(Opcode::LoadIntLit, 10),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::S2I),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn float_round_trip_method() -> Method {
    Method::new(
        FLOAT_ROUND_TRIP,
        0,
        "App.Main:f2s2f:f,",
        1,
        3,
        ValueKind::Float,
        vec![
            Instruction::with2(Opcode::StorFloatVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 17),
            Instruction::new(Opcode::NewCharAry, 1),
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL),
            Instruction::with2(Opcode::LoadFloatVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::F2S),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::S2F),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn call_tag_method() -> Method {
    // invoke the virtual tag method on the receiver argument
    Method::new(
        CALL_TAG,
        0,
        "App.Main:calltag:i,",
        1,
        2,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::with2(Opcode::MthdCall, 1, 0),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn cast_nil_method() -> Method {
    Method::new(
        CAST_NIL,
        0,
        "App.Main:castnil:,",
        0,
        1,
        ValueKind::Int,
        vec![
            Instruction::new(Opcode::LoadIntLit, 0),
            Instruction::new(Opcode::ObjInstCast, 1),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn type_of_method() -> Method {
    Method::new(
        TYPE_OF,
        0,
        "App.Main:typeof:i,",
        1,
        2,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::new(Opcode::ObjTypeOf, 1),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn float_less_method() -> Method {
    // args (bottom..top): a, b; returns a < b
    Method::new(
        FLOAT_LESS,
        0,
        "App.Main:fles:f,f,",
        2,
        3,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorFloatVar, 0, LOCAL), // b
            Instruction::with2(Opcode::StorFloatVar, 1, LOCAL), // a
            Instruction::with2(Opcode::LoadFloatVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadFloatVar, 1, LOCAL),
            Instruction::of(Opcode::LesFloat),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn ary_size_method() -> Method {
    Method::new(
        ARY_SIZE,
        0,
        "App.Main:arysize:i,",
        1,
        2,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::of(Opcode::LoadArySize),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn matrix_method() -> Method {
    // a [2][3] array: store 77 at [1][2], read it back
    Method::new(
        MATRIX,
        0,
        "App.Main:mat:,",
        0,
        2,
        ValueKind::Int,
        vec![
            Instruction::new(Opcode::LoadIntLit, 3),
            Instruction::new(Opcode::LoadIntLit, 2),
            Instruction::new(Opcode::NewIntAry, 2),
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntLit, 77),
            Instruction::new(Opcode::LoadIntLit, 2),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::new(Opcode::StorIntAryElm, 2),
            Instruction::new(Opcode::LoadIntLit, 2),
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::new(Opcode::LoadIntAryElm, 2),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn bits_method() -> Method {
    // args (bottom..top): a, b; returns (a << 2) | b
    Method::new(
        BITS,
        0,
        "App.Main:bits:i,i,",
        2,
        3,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::StorIntVar, 0, LOCAL), // b
            Instruction::with2(Opcode::StorIntVar, 1, LOCAL), // a
            Instruction::new(Opcode::LoadIntLit, 2),
            Instruction::with2(Opcode::LoadIntVar, 1, LOCAL),
            Instruction::of(Opcode::ShlInt),
            Instruction::with2(Opcode::LoadIntVar, 0, LOCAL),
            Instruction::of(Opcode::BitOrInt),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn swap_pop_method() -> Method {
    Method::new(
        SWAP_POP,
        0,
        "App.Main:swappop:,",
        0,
        1,
        ValueKind::Int,
        vec![
            Instruction::new(Opcode::LoadIntLit, 1),
            Instruction::new(Opcode::LoadIntLit, 2),
            Instruction::of(Opcode::SwapInt),
            Instruction::of(Opcode::PopInt),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn now_method() -> Method {
    Method::new(
        NOW,
        0,
        "App.Main:now:,",
        0,
        1,
        ValueKind::Int,
        vec![
            Instruction::with2(Opcode::TrapRtrn, 266, 0),
            Instruction::of(Opcode::Rtrn),
        ],
    )
}

fn fixture() -> &'static Program {
    static PROGRAM: Lazy<&'static Program> = Lazy::new(|| {
        configure(VmOptions {
            jit: false,
            halt_on_error: false,
        });

        let mut main = Class::new(0, "App.Main", 1, 4);
        main.add_method(fib_method());
        main.add_method(fill_sum_method());
        main.add_method(copy_ints_method());
        main.add_method(int_round_trip_method());
        main.add_method(float_round_trip_method());
        main.add_method(call_tag_method());
        main.add_method(cast_nil_method());
        main.add_method(type_of_method());
        main.add_method(float_less_method());
        main.add_method(ary_size_method());
        main.add_method(matrix_method());
        main.add_method(bits_method());
        main.add_method(swap_pop_method());
        main.add_method(now_method());

        let mut base = Class::new(1, "App.B", 1, 0);
        base.add_method(
            Method::new(
                0,
                1,
                "App.B:tag:,",
                0,
                1,
                ValueKind::Int,
                vec![
                    Instruction::new(Opcode::LoadIntLit, 1),
                    Instruction::of(Opcode::Rtrn),
                ],
            )
            .virtual_(),
        );

        let mut derived = Class::new(2, "App.D", 1, 0).with_parent(1);
        derived.add_method(Method::new(
            0,
            2,
            "App.D:tag:,",
            0,
            1,
            ValueKind::Int,
            vec![
                Instruction::new(Opcode::LoadIntLit, 2),
                Instruction::of(Opcode::Rtrn),
            ],
        ));

        Program::new(vec![main, base, derived]).install()
    });
    *PROGRAM
}

/// Run a method with the given argument slots; returns the final operand
/// stack and cursor.
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

#[test]
fn test_fib_10_is_55() {
    let (stack, pos) = run(FIB, &[10]);
    assert_eq!(pos, 1, "only the return value remains");
    assert_eq!(stack[0] as i64, 55);
}

#[test]
fn test_fib_edge_values() {
    assert_eq!(run(FIB, &[0]).0[0] as i64, 0);
    assert_eq!(run(FIB, &[1]).0[0] as i64, 1);
    assert_eq!(run(FIB, &[20]).0[0] as i64, 6765);
}

#[test]
fn test_array_store_load_identity() {
    // store i at index i, reload, sum: 0..10 sums to 45
    let (stack, pos) = run(FILL_SUM, &[10]);
    assert_eq!(pos, 1);
    assert_eq!(stack[0] as i64, 45);
}

fn make_int_array(size: usize) -> *mut usize {
    fixture();
    let arr = MemoryManager::allocate_array(3 + size, AllocKind::IntArray, std::ptr::null_mut(), 0);
    unsafe {
        *arr = size;
        *arr.add(1) = 1;
        *arr.add(2) = size;
    }
    arr
}

#[test]
fn test_array_copy_boundaries() {
    let src = make_int_array(8);
    let dst = make_int_array(8);
    unsafe {
        for i in 0..8 {
            *src.add(3 + i) = 100 + i;
        }
    }

    // in-range copy of 5 elements from offset 3 to offset 3
    let (stack, _) = run(COPY_INTS, &[src as usize, dst as usize, 5]);
    assert_eq!(stack[0], 1);
    unsafe {
        for i in 3..8 {
            assert_eq!(*dst.add(3 + i), 100 + i);
        }
        assert_eq!(*dst.add(3), 0, "elements before the offset untouched");
        // reset the destination
        for i in 0..8 {
            *dst.add(3 + i) = 0;
        }
    }

    // one element too many: rejected, destination unchanged
    let (stack, _) = run(COPY_INTS, &[src as usize, dst as usize, 6]);
    assert_eq!(stack[0], 0);
    unsafe {
        for i in 0..8 {
            assert_eq!(*dst.add(3 + i), 0);
        }
    }

    // zero length succeeds as a no-op; negative length is rejected
    let (stack, _) = run(COPY_INTS, &[src as usize, dst as usize, 0]);
    assert_eq!(stack[0], 1);
    let (stack, _) = run(COPY_INTS, &[src as usize, dst as usize, -1i64 as usize]);
    assert_eq!(stack[0], 0);
}

#[test]
fn test_int_string_round_trip() {
    for value in [0i64, 7, -7, 12345, -987654321, 4000000000] {
        let (stack, _) = run(INT_ROUND_TRIP, &[value as usize]);
        assert_eq!(stack[0] as i64, value, "round trip of {value}");
    }
}

#[test]
fn test_float_string_round_trip() {
    for value in [0.5f64, -2.25, 3.125, 100.0, -0.875] {
        let (stack, _) = run(FLOAT_ROUND_TRIP, &[value.to_bits() as usize]);
        assert_eq!(f64::from_bits(stack[0] as u64), value, "round trip of {value}");
    }
}

#[test]
fn test_virtual_dispatch_uses_cache_after_first_walk() {
    fixture();
    let receiver = MemoryManager::allocate_object(2, std::ptr::null_mut(), 0);
    assert!(!receiver.is_null());

    let (hits_before, walks_before) = dispatch_cache_stats();
    for _ in 0..5 {
        let (stack, _) = run(CALL_TAG, &[receiver as usize]);
        assert_eq!(stack[0] as i64, 2, "binds the derived override");
    }
    let (hits_after, walks_after) = dispatch_cache_stats();
    assert_eq!(walks_after - walks_before, 1, "one hierarchy walk");
    assert_eq!(hits_after - hits_before, 4, "remaining calls hit the cache");
}

#[test]
fn test_cast_of_nil_is_permitted() {
    let (stack, pos) = run(CAST_NIL, &[]);
    assert_eq!(pos, 1);
    assert_eq!(stack[0], 0, "nil casts to nil");
}

#[test]
fn test_type_of_derived_conforms_to_base() {
    fixture();
    let derived = MemoryManager::allocate_object(2, std::ptr::null_mut(), 0);
    let (stack, _) = run(TYPE_OF, &[derived as usize]);
    assert_eq!(stack[0], 1);

    let main_obj = MemoryManager::allocate_object(0, std::ptr::null_mut(), 0);
    let (stack, _) = run(TYPE_OF, &[main_obj as usize]);
    assert_eq!(stack[0], 0);
}

#[test]
fn test_float_compare_unordered_false() {
    let less = |a: f64, b: f64| run(FLOAT_LESS, &[a.to_bits() as usize, b.to_bits() as usize]).0[0];
    assert_eq!(less(1.0, 2.0), 1);
    assert_eq!(less(2.0, 1.0), 0);
    assert_eq!(less(f64::NAN, 1.0), 0);
    assert_eq!(less(1.0, f64::NAN), 0);
}

#[test]
fn test_load_ary_size() {
    let arr = make_int_array(12);
    let (stack, _) = run(ARY_SIZE, &[arr as usize]);
    assert_eq!(stack[0], 12);
}

#[test]
fn test_two_dimensional_row_major_indexing() {
    let (stack, pos) = run(MATRIX, &[]);
    assert_eq!(pos, 1);
    assert_eq!(stack[0], 77);
}

#[test]
fn test_shift_and_bitwise() {
    let (stack, _) = run(BITS, &[5, 2]);
    assert_eq!(stack[0] as i64, (5 << 2) | 2);
    let (stack, _) = run(BITS, &[-1i64 as usize, 0]);
    assert_eq!(stack[0] as i64, -1i64 << 2);
}

#[test]
fn test_swap_then_pop_leaves_old_top() {
    let (stack, pos) = run(SWAP_POP, &[]);
    assert_eq!(pos, 1);
    assert_eq!(stack[0], 2);
}

#[test]
fn test_timer_trap_pushes_epoch_millis() {
    let (stack, pos) = run(NOW, &[]);
    assert_eq!(pos, 1);
    // sometime after 2020
    assert!(stack[0] as i64 > 1_577_000_000_000);
}

struct CountingHook(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl opal_engine::InstructionHook for CountingHook {
    fn on_instruction(&mut self, _instr: &Instruction, _ip: i64, _call_depth: i64) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn test_instruction_hook_sees_every_dispatch() {
    let program = fixture();
    let method = program
        .class(0)
        .and_then(|c| c.method(CAST_NIL))
        .expect("fixture method");

    let count = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let mut op_stack = vec![0usize; OP_STACK_SIZE];
    let mut pos: i64 = 0;
    let mut intpr = Interpreter::new();
    intpr.set_hook(Box::new(CountingHook(count.clone())));
    intpr.execute(
        op_stack.as_mut_ptr(),
        &mut pos,
        0,
        method,
        std::ptr::null_mut(),
        false,
    );

    // the cast-nil body is exactly three instructions
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 3);
}
