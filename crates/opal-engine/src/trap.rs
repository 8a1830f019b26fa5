//! Platform trap table
//!
//! The `trap` opcodes delegate to native handlers selected by a numeric id
//! carried in the instruction. Handlers follow the stack protocol: they pop
//! their arguments from the operand stack and push any scalar result back.
//! The ids are frozen: JIT callback bridges embed the dispatching
//! instruction by address, so interpreter and native code always agree.

use std::io::Write;

use crate::memory::MemoryManager;
use crate::program::Instruction;
use crate::stack::{pop_float, pop_int, push_int};
use crate::{VmError, VmResult};

/// Recognized platform trap ids.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformTrap {
    /// Pop an exit code and terminate the process.
    Exit = 256,
    /// Pop an integer and write it to stdout.
    StdOutInt = 257,
    /// Pop a double and write it to stdout.
    StdOutFloat = 258,
    /// Pop a character and write it to stdout.
    StdOutChar = 259,
    /// Pop a string object and write it to stdout.
    StdOutString = 260,
    /// Pop an integer and write it to stderr.
    StdErrInt = 261,
    /// Pop a double and write it to stderr.
    StdErrFloat = 262,
    /// Pop a character and write it to stderr.
    StdErrChar = 263,
    /// Pop a string object and write it to stderr.
    StdErrString = 264,
    /// Flush stdout.
    StdFlush = 265,
    /// Push milliseconds since the Unix epoch (`trap-return`).
    TimerMillis = 266,
    /// Read a line from stdin and push it as a new string object
    /// (`trap-return`).
    StdInString = 267,
}

impl PlatformTrap {
    /// Decode a trap id.
    pub fn from_i64(id: i64) -> Option<Self> {
        Some(match id {
            256 => PlatformTrap::Exit,
            257 => PlatformTrap::StdOutInt,
            258 => PlatformTrap::StdOutFloat,
            259 => PlatformTrap::StdOutChar,
            260 => PlatformTrap::StdOutString,
            261 => PlatformTrap::StdErrInt,
            262 => PlatformTrap::StdErrFloat,
            263 => PlatformTrap::StdErrChar,
            264 => PlatformTrap::StdErrString,
            265 => PlatformTrap::StdFlush,
            266 => PlatformTrap::TimerMillis,
            267 => PlatformTrap::StdInString,
            _ => return None,
        })
    }
}

/// Dispatches trap instructions to their native handlers.
pub struct TrapProcessor;

impl TrapProcessor {
    /// Execute the trap selected by the instruction's first operand.
    ///
    /// # Safety
    /// `op_stack`/`stack_pos` must be a live operand stack holding the
    /// trap's declared arguments; `_inst` is the current receiver.
    pub(crate) unsafe fn process(
        instr: &Instruction,
        _inst: *mut usize,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let id = instr.operand();
        let trap = PlatformTrap::from_i64(id).ok_or(VmError::UnknownTrap(id))?;

        match trap {
            PlatformTrap::Exit => {
                let status = pop_int(op_stack, stack_pos) as i64;
                std::process::exit(status as i32);
            }
            PlatformTrap::StdOutInt => {
                print!("{}", pop_int(op_stack, stack_pos) as i64);
            }
            PlatformTrap::StdOutFloat => {
                print!("{}", pop_float(op_stack, stack_pos));
            }
            PlatformTrap::StdOutChar => {
                let value = pop_int(op_stack, stack_pos) as u32;
                print!("{}", char::from_u32(value).unwrap_or('\u{FFFD}'));
            }
            PlatformTrap::StdOutString => {
                let obj = pop_int(op_stack, stack_pos) as *const usize;
                let text = MemoryManager::read_string_object(obj).ok_or(VmError::NilDeref)?;
                print!("{text}");
            }
            PlatformTrap::StdErrInt => {
                eprint!("{}", pop_int(op_stack, stack_pos) as i64);
            }
            PlatformTrap::StdErrFloat => {
                eprint!("{}", pop_float(op_stack, stack_pos));
            }
            PlatformTrap::StdErrChar => {
                let value = pop_int(op_stack, stack_pos) as u32;
                eprint!("{}", char::from_u32(value).unwrap_or('\u{FFFD}'));
            }
            PlatformTrap::StdErrString => {
                let obj = pop_int(op_stack, stack_pos) as *const usize;
                let text = MemoryManager::read_string_object(obj).ok_or(VmError::NilDeref)?;
                eprint!("{text}");
            }
            PlatformTrap::StdFlush => {
                let _ = std::io::stdout().flush();
            }
            PlatformTrap::TimerMillis => {
                let millis = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                push_int(millis as usize, op_stack, stack_pos);
            }
            PlatformTrap::StdInString => {
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                let obj = MemoryManager::create_string_object(&line, op_stack, *stack_pos);
                push_int(obj as usize, op_stack, stack_pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_id_round_trip() {
        for id in 256..=267 {
            let trap = PlatformTrap::from_i64(id).expect("known id");
            assert_eq!(trap as i64, id);
        }
        assert!(PlatformTrap::from_i64(0).is_none());
        assert!(PlatformTrap::from_i64(999).is_none());
    }
}
