/// Register offsets within pt_regs for x86_64
///
/// The code generator reads the probe context as an array of u64 slots, so
/// every offset here is an index into that array (field byte offset divided
/// by the size of u64).
use tracing::warn;

/// pt_regs indices for x86_64, computed from the kernel structure layout.
pub mod pt_regs_indices {
    use aya_ebpf_bindings::bindings::pt_regs;

    const U64_SIZE: usize = core::mem::size_of::<u64>();

    pub const R15: usize = core::mem::offset_of!(pt_regs, r15) / U64_SIZE;
    pub const R14: usize = core::mem::offset_of!(pt_regs, r14) / U64_SIZE;
    pub const R13: usize = core::mem::offset_of!(pt_regs, r13) / U64_SIZE;
    pub const R12: usize = core::mem::offset_of!(pt_regs, r12) / U64_SIZE;
    pub const RBP: usize = core::mem::offset_of!(pt_regs, rbp) / U64_SIZE;
    pub const RBX: usize = core::mem::offset_of!(pt_regs, rbx) / U64_SIZE;
    pub const R11: usize = core::mem::offset_of!(pt_regs, r11) / U64_SIZE;
    pub const R10: usize = core::mem::offset_of!(pt_regs, r10) / U64_SIZE;
    pub const R9: usize = core::mem::offset_of!(pt_regs, r9) / U64_SIZE;
    pub const R8: usize = core::mem::offset_of!(pt_regs, r8) / U64_SIZE;
    pub const RAX: usize = core::mem::offset_of!(pt_regs, rax) / U64_SIZE;
    pub const RCX: usize = core::mem::offset_of!(pt_regs, rcx) / U64_SIZE;
    pub const RDX: usize = core::mem::offset_of!(pt_regs, rdx) / U64_SIZE;
    pub const RSI: usize = core::mem::offset_of!(pt_regs, rsi) / U64_SIZE;
    pub const RDI: usize = core::mem::offset_of!(pt_regs, rdi) / U64_SIZE;

    pub const ORIG_RAX: usize = core::mem::offset_of!(pt_regs, orig_rax) / U64_SIZE;
    pub const RIP: usize = core::mem::offset_of!(pt_regs, rip) / U64_SIZE;
    pub const CS: usize = core::mem::offset_of!(pt_regs, cs) / U64_SIZE;
    pub const EFLAGS: usize = core::mem::offset_of!(pt_regs, eflags) / U64_SIZE;
    pub const RSP: usize = core::mem::offset_of!(pt_regs, rsp) / U64_SIZE;
    pub const SS: usize = core::mem::offset_of!(pt_regs, ss) / U64_SIZE;
}

/// Number of function arguments passed in registers on x86_64.
pub const MAX_REG_ARGS: usize = 6;

/// u64-slot offset of the Nth function argument register (System V:
/// rdi, rsi, rdx, rcx, r8, r9). `None` for arguments beyond the register
/// set; those live on the stack and are read via `sargN`.
pub fn arg_offset(arg_num: usize) -> Option<usize> {
    use pt_regs_indices::*;
    const ARG_REGS: [usize; MAX_REG_ARGS] = [RDI, RSI, RDX, RCX, R8, R9];
    ARG_REGS.get(arg_num).copied()
}

/// u64-slot offset of the return-value register (rax).
pub fn ret_offset() -> usize {
    pt_regs_indices::RAX
}

/// u64-slot offset of the program counter (rip).
pub fn pc_offset() -> usize {
    pt_regs_indices::RIP
}

/// u64-slot offset of the stack pointer (rsp).
pub fn sp_offset() -> usize {
    pt_regs_indices::RSP
}

/// Number of u64 slots between the stack pointer and the first
/// stack-passed argument (the return address slot on x86_64).
pub fn arg_stack_offset() -> usize {
    1
}

/// u64-slot offset of a register by its kernel pt_regs field name, for the
/// `reg()` builtin.
pub fn register_offset(name: &str) -> Option<usize> {
    use pt_regs_indices::*;
    let index = match name {
        "r15" => R15,
        "r14" => R14,
        "r13" => R13,
        "r12" => R12,
        "bp" => RBP,
        "bx" => RBX,
        "r11" => R11,
        "r10" => R10,
        "r9" => R9,
        "r8" => R8,
        "ax" => RAX,
        "cx" => RCX,
        "dx" => RDX,
        "si" => RSI,
        "di" => RDI,
        "orig_ax" => ORIG_RAX,
        "ip" => RIP,
        "cs" => CS,
        "flags" => EFLAGS,
        "sp" => RSP,
        "ss" => SS,
        _ => {
            warn!("Unknown register name: {}", name);
            return None;
        }
    };
    Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pt_regs_layout() {
        // pt_regs on x86_64 starts with r15 and lays registers out in
        // consecutive u64 slots up to ss at index 20.
        assert_eq!(pt_regs_indices::R15, 0);
        assert_eq!(pt_regs_indices::RBP, 4);
        assert_eq!(pt_regs_indices::RAX, 10);
        assert_eq!(pt_regs_indices::RDI, 14);
        assert_eq!(pt_regs_indices::RIP, 16);
        assert_eq!(pt_regs_indices::RSP, 19);
        assert_eq!(pt_regs_indices::SS, 20);
    }

    #[test]
    fn test_arg_offsets_follow_sysv_order() {
        assert_eq!(arg_offset(0), Some(pt_regs_indices::RDI));
        assert_eq!(arg_offset(1), Some(pt_regs_indices::RSI));
        assert_eq!(arg_offset(2), Some(pt_regs_indices::RDX));
        assert_eq!(arg_offset(3), Some(pt_regs_indices::RCX));
        assert_eq!(arg_offset(4), Some(pt_regs_indices::R8));
        assert_eq!(arg_offset(5), Some(pt_regs_indices::R9));
        assert_eq!(arg_offset(6), None);
    }

    #[test]
    fn test_special_offsets() {
        assert_eq!(ret_offset(), pt_regs_indices::RAX);
        assert_eq!(pc_offset(), pt_regs_indices::RIP);
        assert_eq!(sp_offset(), pt_regs_indices::RSP);
        assert_eq!(arg_stack_offset(), 1);
    }

    #[test]
    fn test_register_lookup_by_name() {
        assert_eq!(register_offset("ax"), Some(pt_regs_indices::RAX));
        assert_eq!(register_offset("sp"), Some(pt_regs_indices::RSP));
        assert_eq!(register_offset("orig_ax"), Some(pt_regs_indices::ORIG_RAX));
        assert_eq!(register_offset("xmm0"), None);
    }
}
