//! Program image: classes, methods, and instructions
//!
//! Bytecode parsing and class loading happen outside the execution core; the
//! loader hands over a fully formed [`Program`] which is installed
//! process-wide once and never mutated afterwards. The same types double as
//! the builder API the test suites use to assemble images in memory.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use once_cell::sync::OnceCell;
use opal_sdk::ValueKind;
use rustc_hash::FxHashMap;

use crate::jit::NativeCode;

/// Bytecode operation codes.
///
/// The discriminants are frozen: JIT-emitted callback bridges embed them as
/// immediates, so interpreter and native code must agree on the values for
/// the life of the process.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Push the integer operand.
    LoadIntLit = 0,
    /// Push the character operand (an integer slot).
    LoadCharLit = 1,
    /// Push the float operand.
    LoadFloatLit = 2,
    /// Push the current receiver.
    LoadInstMem = 3,
    /// Push the current method's class memory.
    LoadClsMem = 4,

    /// Load an integer variable (local, instance, or class per operand2).
    LoadIntVar = 5,
    /// Load a float variable.
    LoadFloatVar = 6,
    /// Load a two-slot function variable.
    LoadFuncVar = 7,
    /// Store an integer variable.
    StorIntVar = 8,
    /// Store a float variable.
    StorFloatVar = 9,
    /// Store a two-slot function variable.
    StorFuncVar = 10,
    /// Store an integer variable, leaving the value on the stack.
    CopyIntVar = 11,
    /// Store a float variable, leaving the value on the stack.
    CopyFloatVar = 12,

    /// Logical and of two integers.
    AndInt = 13,
    /// Logical or of two integers.
    OrInt = 14,
    /// Two's-complement add.
    AddInt = 15,
    /// Two's-complement subtract (top minus next).
    SubInt = 16,
    /// Two's-complement multiply.
    MulInt = 17,
    /// Signed divide; zero divisor is fatal.
    DivInt = 18,
    /// Signed remainder; zero divisor is fatal.
    ModInt = 19,
    /// Bitwise and.
    BitAndInt = 20,
    /// Bitwise or.
    BitOrInt = 21,
    /// Bitwise xor.
    BitXorInt = 22,
    /// Shift left (top shifted by next).
    ShlInt = 23,
    /// Arithmetic shift right.
    ShrInt = 24,

    /// Float add.
    AddFloat = 25,
    /// Float subtract (top minus next).
    SubFloat = 26,
    /// Float multiply.
    MulFloat = 27,
    /// Float divide.
    DivFloat = 28,

    /// Integer less-than.
    LesInt = 29,
    /// Integer greater-than.
    GtrInt = 30,
    /// Integer equality.
    EqlInt = 31,
    /// Integer inequality.
    NeqlInt = 32,
    /// Integer less-or-equal.
    LesEqlInt = 33,
    /// Integer greater-or-equal.
    GtrEqlInt = 34,
    /// Float less-than (unordered false).
    LesFloat = 35,
    /// Float greater-than (unordered false).
    GtrFloat = 36,
    /// Float equality (unordered false).
    EqlFloat = 37,
    /// Float inequality (unordered true).
    NeqlFloat = 38,
    /// Float less-or-equal (unordered false).
    LesEqlFloat = 39,
    /// Float greater-or-equal (unordered false).
    GtrEqlFloat = 40,

    /// Round toward positive infinity.
    CeilFloat = 41,
    /// Round toward negative infinity.
    FlorFloat = 42,
    /// Sine.
    SinFloat = 43,
    /// Cosine.
    CosFloat = 44,
    /// Tangent.
    TanFloat = 45,
    /// Arcsine.
    AsinFloat = 46,
    /// Arccosine.
    AcosFloat = 47,
    /// Arctangent.
    AtanFloat = 48,
    /// Two-argument arctangent; the top operand is x, the next is y.
    Atan2Float = 49,
    /// Natural logarithm.
    LogFloat = 50,
    /// Power; the top operand is the exponent.
    PowFloat = 51,
    /// Square root.
    SqrtFloat = 52,
    /// Uniform random double in `[0, 1)`.
    RandFloat = 53,

    /// Widen the top integer to a double.
    I2F = 54,
    /// Truncate the top double toward zero.
    F2I = 55,
    /// Parse a string object into an integer (with `0b`/`0o`/`0x` prefixes).
    S2I = 56,
    /// Parse a string object into a double.
    S2F = 57,
    /// Format an integer into a caller-supplied char array.
    I2S = 58,
    /// Format a double into a caller-supplied char array.
    F2S = 59,

    /// Exchange the two top slots.
    SwapInt = 60,
    /// Discard the top slot.
    PopInt = 61,
    /// Discard the top float.
    PopFloat = 62,

    /// Allocate a byte array; operand is the dimension count.
    NewByteAry = 63,
    /// Allocate a char array; operand is the dimension count.
    NewCharAry = 64,
    /// Allocate an int array; operand is the dimension count.
    NewIntAry = 65,
    /// Allocate a float array; operand is the dimension count.
    NewFloatAry = 66,
    /// Allocate an object instance; operand is the class id.
    NewObjInst = 67,
    /// Allocate a code-carrying byte array; operand is the declared size.
    NewFuncInst = 68,

    /// Load a byte element.
    LoadByteAryElm = 69,
    /// Load a char element.
    LoadCharAryElm = 70,
    /// Load an int element.
    LoadIntAryElm = 71,
    /// Load a float element.
    LoadFloatAryElm = 72,
    /// Store a byte element.
    StorByteAryElm = 73,
    /// Store a char element.
    StorCharAryElm = 74,
    /// Store an int element.
    StorIntAryElm = 75,
    /// Store a float element.
    StorFloatAryElm = 76,

    /// Push the element count of the array on top of the stack.
    LoadArySize = 77,
    /// Block-copy between byte arrays.
    CpyByteAry = 78,
    /// Block-copy between char arrays.
    CpyCharAry = 79,
    /// Block-copy between int arrays.
    CpyIntAry = 80,
    /// Block-copy between float arrays.
    CpyFloatAry = 81,

    /// Conformance test; operand is the target class or interface id.
    ObjTypeOf = 82,
    /// Checked cast; operand is the target class id. Nil passes through.
    ObjInstCast = 83,

    /// Jump to the label in the operand; operand2 is −1 for unconditional,
    /// 0 or 1 to pop and compare.
    Jmp = 84,
    /// Label marker; operand is the label id. No effect when executed.
    Lbl = 85,
    /// Return from the current method.
    Rtrn = 86,
    /// Call the method `operand2` of class `operand`.
    MthdCall = 87,
    /// Call through a packed `(class_id, method_id)` value; operand2 is the
    /// callee return kind.
    DynMthdCall = 88,
    /// Spawn a thread running the receiver's `Run:o.System.Base,` method.
    AsyncMthdCall = 89,
    /// Wait for the receiver's thread.
    ThreadJoin = 90,
    /// Sleep for the popped number of milliseconds.
    ThreadSleep = 91,
    /// Install a mutex in the receiver's second slot.
    ThreadMutex = 92,
    /// Lock the mutex of the popped receiver.
    CriticalStart = 93,
    /// Unlock the mutex of the popped receiver.
    CriticalEnd = 94,

    /// Bind the receiver's shared library.
    DllLoad = 95,
    /// Release the receiver's shared library.
    DllUnload = 96,
    /// Call a named function in the receiver's shared library.
    DllFuncCall = 97,

    /// Platform trap; operand is the trap id, operand2 the argument count.
    Trap = 98,
    /// Platform trap that pushes a scalar result.
    TrapRtrn = 99,

    /// Statement boundary for the debugger; no effect.
    EndStmts = 100,
}

/// Addressing mode of a variable instruction, carried in operand2.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRef {
    /// Frame-local slot; the operand indexes past the receiver slot.
    Local = 0,
    /// Instance slot; the object address is popped from the stack.
    Inst = 1,
    /// Class slot; the class-memory address is popped from the stack.
    Cls = 2,
}

impl MemRef {
    /// Decode an operand2 value.
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => MemRef::Inst,
            2 => MemRef::Cls,
            _ => MemRef::Local,
        }
    }
}

/// One bytecode instruction.
///
/// `operand3` caches the resolved instruction index of a jump target after
/// its first execution, so later hits cost one comparison. The cache is
/// shared across threads; both sides compute the same value, so racing
/// writers are benign.
#[derive(Debug)]
pub struct Instruction {
    opcode: Opcode,
    operand: i64,
    operand2: i64,
    operand3: AtomicI64,
    float_operand: f64,
    line: i32,
}

impl Instruction {
    /// An instruction with one integer operand.
    pub fn new(opcode: Opcode, operand: i64) -> Self {
        Self::with2(opcode, operand, 0)
    }

    /// An instruction with two integer operands.
    pub fn with2(opcode: Opcode, operand: i64, operand2: i64) -> Self {
        Self {
            opcode,
            operand,
            operand2,
            operand3: AtomicI64::new(0),
            float_operand: 0.0,
            line: 0,
        }
    }

    /// An instruction with no operands.
    pub fn of(opcode: Opcode) -> Self {
        Self::with2(opcode, 0, 0)
    }

    /// A float-literal instruction.
    pub fn float(value: f64) -> Self {
        Self {
            opcode: Opcode::LoadFloatLit,
            operand: 0,
            operand2: 0,
            operand3: AtomicI64::new(0),
            float_operand: value,
            line: 0,
        }
    }

    /// Attach a source line for diagnostics.
    pub fn at_line(mut self, line: i32) -> Self {
        self.line = line;
        self
    }

    /// The operation code.
    #[inline(always)]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// First integer operand.
    #[inline(always)]
    pub fn operand(&self) -> i64 {
        self.operand
    }

    /// Second integer operand.
    #[inline(always)]
    pub fn operand2(&self) -> i64 {
        self.operand2
    }

    /// Cached third operand; zero until resolved.
    #[inline(always)]
    pub fn operand3(&self) -> i64 {
        self.operand3.load(Ordering::Relaxed)
    }

    /// Cache a resolved third operand.
    #[inline(always)]
    pub fn set_operand3(&self, value: i64) {
        self.operand3.store(value, Ordering::Relaxed);
    }

    /// Float operand of a float literal.
    #[inline(always)]
    pub fn float_operand(&self) -> f64 {
        self.float_operand
    }

    /// Source line, zero when unknown.
    pub fn line(&self) -> i32 {
        self.line
    }
}

/// A bytecode method: instructions plus a label-to-index map.
pub struct Method {
    id: i64,
    cls_id: i64,
    name: String,
    is_virtual: bool,
    param_count: usize,
    mem_size: usize,
    rtrn_type: ValueKind,
    instructions: Vec<Instruction>,
    labels: FxHashMap<i64, usize>,
    native: OnceCell<NativeCode>,
    jit_failed: AtomicBool,
}

impl Method {
    /// Assemble a method. The label map is derived from `Lbl` markers in the
    /// instruction stream. `mem_size` counts local words including the
    /// receiver slot at index 0.
    pub fn new(
        id: i64,
        cls_id: i64,
        name: impl Into<String>,
        param_count: usize,
        mem_size: usize,
        rtrn_type: ValueKind,
        instructions: Vec<Instruction>,
    ) -> Self {
        assert!(
            mem_size <= crate::frame::LOCAL_SIZE,
            "method local memory exceeds the frame size"
        );
        let mut labels = FxHashMap::default();
        for (index, instr) in instructions.iter().enumerate() {
            if instr.opcode() == Opcode::Lbl {
                labels.insert(instr.operand(), index);
            }
        }
        Self {
            id,
            cls_id,
            name: name.into(),
            is_virtual: false,
            param_count,
            mem_size,
            rtrn_type,
            instructions,
            labels,
            native: OnceCell::new(),
            jit_failed: AtomicBool::new(false),
        }
    }

    /// Mark the method virtual (resolved against the receiver's class).
    pub fn virtual_(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    /// Method id within its class.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Owning class id.
    pub fn cls_id(&self) -> i64 {
        self.cls_id
    }

    /// Qualified name, `Class:method:signature,`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `:method:signature,` ending used for virtual binding.
    pub fn name_ending(&self) -> &str {
        match self.name.find(':') {
            Some(at) => &self.name[at..],
            None => &self.name,
        }
    }

    /// Whether calls bind against the receiver's runtime class.
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Declared parameter count (excluding the receiver).
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Local-memory size in words, including the receiver slot.
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// Return kind, used by the call boundary's result protocol.
    pub fn rtrn_type(&self) -> ValueKind {
        self.rtrn_type
    }

    /// The instruction stream.
    #[inline(always)]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Instruction index of a label marker.
    pub fn label_index(&self, label: i64) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Attached native code, if the method has been compiled.
    #[inline(always)]
    pub fn native_code(&self) -> Option<&NativeCode> {
        self.native.get()
    }

    /// Attach compiled code. The first writer wins; the image is immutable
    /// afterwards.
    pub fn set_native_code(&self, code: NativeCode) {
        let _ = self.native.set(code);
    }

    /// Whether a previous compilation attempt failed.
    pub fn jit_failed(&self) -> bool {
        self.jit_failed.load(Ordering::Relaxed)
    }

    /// Record a failed compilation so later calls go straight to the
    /// interpreter.
    pub fn mark_jit_failed(&self) {
        self.jit_failed.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instructions", &self.instructions.len())
            .finish()
    }
}

/// Class memory: the static slots shared by all instances.
///
/// Bytecode mutates these words from any thread; synchronization is the
/// program's business (`critical` regions), not the image's.
pub struct ClassMemory(std::cell::UnsafeCell<Box<[usize]>>);

// Shared mutable VM memory, same discipline as the heap.
unsafe impl Sync for ClassMemory {}
unsafe impl Send for ClassMemory {}

impl ClassMemory {
    fn new(words: usize) -> Self {
        Self(std::cell::UnsafeCell::new(vec![0usize; words].into_boxed_slice()))
    }

    /// Base address of the class slots; null when the class declares none.
    pub fn ptr(&self) -> *mut usize {
        let slots = unsafe { &mut *self.0.get() };
        if slots.is_empty() {
            std::ptr::null_mut()
        } else {
            slots.as_mut_ptr()
        }
    }
}

/// A class: identity, shape, hierarchy edges, and methods.
pub struct Class {
    id: i64,
    name: String,
    parent_id: i64,
    interface_ids: Vec<i64>,
    inst_space: usize,
    class_mem: ClassMemory,
    methods: Vec<Method>,
    method_names: FxHashMap<String, usize>,
}

impl Class {
    /// A root class with `inst_space` instance words and `cls_space` class
    /// words.
    pub fn new(id: i64, name: impl Into<String>, inst_space: usize, cls_space: usize) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id: -1,
            interface_ids: Vec::new(),
            inst_space,
            class_mem: ClassMemory::new(cls_space),
            methods: Vec::new(),
            method_names: FxHashMap::default(),
        }
    }

    /// Set the parent class id.
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Declare implemented interface ids.
    pub fn with_interfaces(mut self, ids: Vec<i64>) -> Self {
        self.interface_ids = ids;
        self
    }

    /// Append a method; its id must equal its index.
    pub fn add_method(&mut self, method: Method) {
        debug_assert_eq!(method.id() as usize, self.methods.len());
        self.method_names.insert(method.name().to_string(), self.methods.len());
        self.methods.push(method);
    }

    /// Class id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class id, −1 for roots.
    pub fn parent_id(&self) -> i64 {
        self.parent_id
    }

    /// Implemented interface ids.
    pub fn interface_ids(&self) -> &[i64] {
        &self.interface_ids
    }

    /// Instance slots an object of this class owns.
    pub fn inst_space(&self) -> usize {
        self.inst_space
    }

    /// Base address of the class memory.
    pub fn class_memory(&self) -> *mut usize {
        self.class_mem.ptr()
    }

    /// Method by id.
    pub fn method(&self, id: i64) -> Option<&Method> {
        self.methods.get(id as usize)
    }

    /// Method by qualified name.
    pub fn method_by_name(&self, name: &str) -> Option<&Method> {
        self.method_names.get(name).map(|&i| &self.methods[i])
    }

    /// All methods.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// The installed program image.
pub struct Program {
    classes: Vec<Class>,
    class_names: FxHashMap<String, usize>,
    string_cls_id: i64,
}

static PROGRAM: OnceCell<Program> = OnceCell::new();

impl Program {
    /// Assemble an image from classes ordered by id.
    pub fn new(classes: Vec<Class>) -> Self {
        let mut class_names = FxHashMap::default();
        for (index, cls) in classes.iter().enumerate() {
            debug_assert_eq!(cls.id() as usize, index);
            class_names.insert(cls.name().to_string(), index);
        }
        Self {
            classes,
            class_names,
            string_cls_id: -1,
        }
    }

    /// Declare which class id is `System.String`.
    pub fn with_string_class(mut self, id: i64) -> Self {
        self.string_cls_id = id;
        self
    }

    /// Class by id.
    pub fn class(&self, id: i64) -> Option<&Class> {
        if id < 0 {
            return None;
        }
        self.classes.get(id as usize)
    }

    /// Class by name.
    pub fn class_by_name(&self, name: &str) -> Option<&Class> {
        self.class_names.get(name).map(|&i| &self.classes[i])
    }

    /// The `System.String` class id, −1 when the image has none.
    pub fn string_cls_id(&self) -> i64 {
        self.string_cls_id
    }

    /// Whether `cls_id` conforms to `target_id` through the class hierarchy
    /// or an implemented interface.
    pub fn conforms_to(&self, cls_id: i64, target_id: i64) -> bool {
        let mut current = cls_id;
        while current >= 0 {
            if current == target_id {
                return true;
            }
            let Some(cls) = self.class(current) else {
                return false;
            };
            if cls.interface_ids().contains(&target_id) {
                return true;
            }
            current = cls.parent_id();
        }
        false
    }

    /// Install the image process-wide. Only the first installation takes
    /// effect; the image is immutable for the program's lifetime.
    pub fn install(self) -> &'static Program {
        let _ = PROGRAM.set(self);
        PROGRAM.get().expect("program installed")
    }

    /// The installed image.
    ///
    /// # Panics
    /// If no image has been installed.
    pub fn global() -> &'static Program {
        PROGRAM.get().expect("no program image installed")
    }

    /// The installed image, if any.
    pub fn try_global() -> Option<&'static Program> {
        PROGRAM.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_map_built_from_markers() {
        let m = Method::new(
            0,
            0,
            "T:loop:i,",
            0,
            2,
            ValueKind::Nil,
            vec![
                Instruction::new(Opcode::Lbl, 7),
                Instruction::of(Opcode::EndStmts),
                Instruction::new(Opcode::Lbl, 3),
                Instruction::of(Opcode::Rtrn),
            ],
        );
        assert_eq!(m.label_index(7), Some(0));
        assert_eq!(m.label_index(3), Some(2));
        assert_eq!(m.label_index(11), None);
    }

    #[test]
    fn test_name_ending() {
        let m = Method::new(0, 0, "System.Thread:Run:o.System.Base,", 1, 3, ValueKind::Nil, vec![]);
        assert_eq!(m.name_ending(), ":Run:o.System.Base,");
    }

    #[test]
    fn test_operand3_cache() {
        let i = Instruction::with2(Opcode::Jmp, 5, -1);
        assert_eq!(i.operand3(), 0);
        i.set_operand3(12);
        assert_eq!(i.operand3(), 12);
    }

    #[test]
    fn test_conformance_walks_parents_and_interfaces() {
        let base = Class::new(0, "System.Base", 0, 0);
        let iface = Class::new(1, "System.Compare", 0, 0);
        let derived = Class::new(2, "App.Derived", 1, 0)
            .with_parent(0)
            .with_interfaces(vec![1]);
        let other = Class::new(3, "App.Other", 0, 0);
        let program = Program::new(vec![base, iface, derived, other]);

        assert!(program.conforms_to(2, 2));
        assert!(program.conforms_to(2, 0));
        assert!(program.conforms_to(2, 1));
        assert!(!program.conforms_to(2, 3));
        assert!(!program.conforms_to(0, 2));
    }
}
