//! Variable loads, stores, and copies
//!
//! A variable instruction names either a frame-local slot (the operand
//! indexes past the receiver at `mem[0]`) or an instance/class slot, in
//! which case the target address is popped from the operand stack and the
//! operand is the word offset. Copies behave as stores but leave the value
//! on the stack.

use super::Interpreter;
use crate::program::{Instruction, MemRef};
use crate::stack::{pop_float, pop_int, push_float, push_int, top_float, top_int};
use crate::value::{float_to_slot, slot_to_float};
use crate::{VmError, VmResult};

impl Interpreter {
    unsafe fn pop_target(
        &mut self,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<*mut usize> {
        let addr = pop_int(op_stack, stack_pos) as *mut usize;
        if addr.is_null() {
            return Err(VmError::NilDeref);
        }
        Ok(addr)
    }

    pub(super) unsafe fn load_int_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let value = (*self.cur()).mem[operand + 1];
                push_int(value, op_stack, stack_pos);
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                push_int(*addr.add(operand), op_stack, stack_pos);
            }
        }
        Ok(())
    }

    pub(super) unsafe fn stor_int_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let value = pop_int(op_stack, stack_pos);
                (*self.cur()).mem[operand + 1] = value;
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                *addr.add(operand) = pop_int(op_stack, stack_pos);
            }
        }
        Ok(())
    }

    pub(super) unsafe fn copy_int_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                (*self.cur()).mem[operand + 1] = top_int(op_stack, stack_pos);
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                *addr.add(operand) = top_int(op_stack, stack_pos);
            }
        }
        Ok(())
    }

    pub(super) unsafe fn load_float_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        let value = match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => slot_to_float((*self.cur()).mem[operand + 1]),
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                slot_to_float(*addr.add(operand))
            }
        };
        push_float(value, op_stack, stack_pos);
        Ok(())
    }

    pub(super) unsafe fn stor_float_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let value = pop_float(op_stack, stack_pos);
                (*self.cur()).mem[operand + 1] = float_to_slot(value);
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                let value = pop_float(op_stack, stack_pos);
                *addr.add(operand) = float_to_slot(value);
            }
        }
        Ok(())
    }

    pub(super) unsafe fn copy_float_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let value = top_float(op_stack, stack_pos);
                (*self.cur()).mem[operand + 1] = float_to_slot(value);
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                let value = top_float(op_stack, stack_pos);
                *addr.add(operand) = float_to_slot(value);
            }
        }
        Ok(())
    }

    /// Function values occupy two operand-stack slots regardless of how
    /// memory packs them; the load leaves the first word on top.
    pub(super) unsafe fn load_func_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let mem = &(*self.cur()).mem;
                push_int(mem[operand + 2], op_stack, stack_pos);
                push_int(mem[operand + 1], op_stack, stack_pos);
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                push_int(*addr.add(operand + 1), op_stack, stack_pos);
                push_int(*addr.add(operand), op_stack, stack_pos);
            }
        }
        Ok(())
    }

    pub(super) unsafe fn stor_func_var(
        &mut self,
        instr: &Instruction,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let operand = instr.operand() as usize;
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let first = pop_int(op_stack, stack_pos);
                let second = pop_int(op_stack, stack_pos);
                let mem = &mut (*self.cur()).mem;
                mem[operand + 1] = first;
                mem[operand + 2] = second;
            }
            MemRef::Inst | MemRef::Cls => {
                let addr = self.pop_target(op_stack, stack_pos)?;
                *addr.add(operand) = pop_int(op_stack, stack_pos);
                *addr.add(operand + 1) = pop_int(op_stack, stack_pos);
            }
        }
        Ok(())
    }
}
