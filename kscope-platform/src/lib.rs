/// Platform-specific register layout for kscope eBPF code generation
///
/// This crate maps the probe context (a `pt_regs` snapshot) to the u64-slot
/// offsets the code generator loads from: function arguments, return value,
/// program counter, stack pointer, and named registers for `reg()`.
pub mod registers;

pub use registers::{
    arg_offset, arg_stack_offset, pc_offset, pt_regs_indices, register_offset, ret_offset,
    sp_offset, MAX_REG_ARGS,
};
