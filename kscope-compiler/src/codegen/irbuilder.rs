//! Typed IR builder façade
//!
//! Thin wrappers over inkwell that give the lowerers single-effect
//! operations: entry-block stack allocation with lifetime markers, foreign
//! memory reads through the probe-read helpers, map access through
//! pseudo-fd handles, perf-event output, context register loads (always
//! volatile), and the inlined string comparison chains.

use super::context::{map_value_type, CodeGen, CodeGenError, ExprResult, ExprValue, Result};
use crate::metadata::MapInfo;
use crate::types::{AddrSpace, SizedType, StackType, TypeKind};
use aya_ebpf_bindings::bindings::bpf_func_id::{
    BPF_FUNC_get_current_cgroup_id, BPF_FUNC_get_current_comm, BPF_FUNC_get_current_pid_tgid,
    BPF_FUNC_get_current_task, BPF_FUNC_get_current_uid_gid, BPF_FUNC_get_prandom_u32,
    BPF_FUNC_get_smp_processor_id, BPF_FUNC_get_stackid, BPF_FUNC_ktime_get_boot_ns,
    BPF_FUNC_ktime_get_ns, BPF_FUNC_map_delete_elem, BPF_FUNC_map_lookup_elem,
    BPF_FUNC_map_update_elem, BPF_FUNC_override_return, BPF_FUNC_perf_event_output,
    BPF_FUNC_probe_read, BPF_FUNC_probe_read_kernel, BPF_FUNC_probe_read_kernel_str,
    BPF_FUNC_probe_read_str, BPF_FUNC_probe_read_user, BPF_FUNC_probe_read_user_str,
    BPF_FUNC_send_signal,
};
use inkwell::types::{BasicType, BasicTypeEnum, StructType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, FunctionValue, IntValue, PointerValue,
};
use inkwell::{AddressSpace, IntPredicate};
use kscope_protocol::AsyncAction;
use tracing::debug;

/// Pseudo map-fd source operand the loader relocates.
const BPF_PSEUDO_MAP_FD: u64 = 1;
/// Flag selecting the current CPU's perf event ring.
const BPF_F_CURRENT_CPU: u64 = 0xffff_ffff;
/// bpf_get_stackid flag selecting the user stack.
const BPF_F_USER_STACK: u64 = 1 << 8;

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    /// LLVM representation of a sized type. External pointers live in the
    /// integer domain; only stack buffers are LLVM pointers.
    pub(crate) fn llvm_type(&self, ty: &SizedType) -> BasicTypeEnum<'ctx> {
        match &ty.kind {
            TypeKind::Integer { bits, .. } => {
                self.context.custom_width_int_type(*bits).into()
            }
            TypeKind::Pointer { .. } | TypeKind::None => self.context.i64_type().into(),
            TypeKind::String | TypeKind::Buffer | TypeKind::Record { .. }
            | TypeKind::Array { .. } => self
                .context
                .i8_type()
                .array_type(ty.size as u32)
                .into(),
            TypeKind::UserSym => {
                let i64t = self.context.i64_type();
                self.context
                    .struct_type(&[i64t.into(), i64t.into()], false)
                    .into()
            }
            TypeKind::Tuple { elems } => {
                let fields: Vec<BasicTypeEnum> =
                    elems.iter().map(|e| self.llvm_type(e)).collect();
                self.context.struct_type(&fields, false).into()
            }
        }
    }

    pub(crate) fn struct_size(&self, ty: StructType<'ctx>) -> u64 {
        self.target_machine.get_target_data().get_abi_size(&ty)
    }

    pub(crate) fn struct_offset(&self, ty: StructType<'ctx>, index: u32) -> Result<u64> {
        self.target_machine
            .get_target_data()
            .offset_of_element(&ty, index)
            .ok_or_else(|| CodeGenError::InternalBug(format!("no element {index} in struct")))
    }

    // === Stack allocation and lifetimes ===

    /// Reserve a stack cell in the function's entry block and mark its
    /// live range as starting at the current insertion point.
    pub(crate) fn create_alloca(
        &mut self,
        ty: BasicTypeEnum<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let current = self
            .builder
            .get_insert_block()
            .ok_or_else(|| CodeGenError::Builder("no current basic block".to_string()))?;
        let function = current
            .get_parent()
            .ok_or_else(|| CodeGenError::Builder("no parent function".to_string()))?;
        let entry = function
            .get_first_basic_block()
            .ok_or_else(|| CodeGenError::Builder("function has no entry block".to_string()))?;

        match entry.get_first_instruction() {
            Some(first) => self.builder.position_before(&first),
            None => self.builder.position_at_end(entry),
        }
        let slot = self
            .builder
            .build_alloca(ty, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder.position_at_end(current);

        self.create_lifetime_start(slot)?;
        Ok(slot)
    }

    pub(crate) fn create_alloca_for(
        &mut self,
        ty: &SizedType,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        self.create_alloca(self.llvm_type(ty), name)
    }

    /// Zero-initialized stack cell for a sized type.
    pub(crate) fn create_alloca_init(
        &mut self,
        ty: &SizedType,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let slot = self.create_alloca_for(ty, name)?;
        self.create_memset(slot, 0, ty.size)?;
        Ok(slot)
    }

    pub(crate) fn create_alloca_bytes(
        &mut self,
        size: u64,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let ty = self.context.i8_type().array_type(size as u32);
        self.create_alloca(ty.into(), name)
    }

    fn lifetime_intrinsic(&mut self, start: bool) -> FunctionValue<'ctx> {
        let name = if start {
            "llvm.lifetime.start.p0"
        } else {
            "llvm.lifetime.end.p0"
        };
        if let Some(f) = self.module.get_function(name) {
            return f;
        }
        let fn_ty = self.context.void_type().fn_type(
            &[
                self.context.i64_type().into(),
                self.context.ptr_type(AddressSpace::default()).into(),
            ],
            false,
        );
        self.module.add_function(name, fn_ty, None)
    }

    pub(crate) fn create_lifetime_start(&mut self, slot: PointerValue<'ctx>) -> Result<()> {
        let intrinsic = self.lifetime_intrinsic(true);
        // -1 size: live range covers the whole object
        let size = self.context.i64_type().const_all_ones();
        self.builder
            .build_call(intrinsic, &[size.into(), slot.into()], "")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn create_lifetime_end(&mut self, slot: PointerValue<'ctx>) -> Result<()> {
        let intrinsic = self.lifetime_intrinsic(false);
        let size = self.context.i64_type().const_all_ones();
        self.builder
            .build_call(intrinsic, &[size.into(), slot.into()], "")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    // === Memory primitives ===

    pub(crate) fn create_memset(
        &mut self,
        dst: PointerValue<'ctx>,
        byte: u8,
        len: u64,
    ) -> Result<()> {
        let val = self.context.i8_type().const_int(u64::from(byte), false);
        let size = self.context.i64_type().const_int(len, false);
        self.builder
            .build_memset(dst, 1, val, size)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn create_memcpy(
        &mut self,
        dst: PointerValue<'ctx>,
        src: PointerValue<'ctx>,
        len: u64,
    ) -> Result<()> {
        let size = self.context.i64_type().const_int(len, false);
        self.builder
            .build_memcpy(dst, 1, src, 1, size)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    /// Byte-wise volatile copy out of the probe context. Unrolled so every
    /// context access stays a volatile load the optimizer cannot widen or
    /// narrow.
    pub(crate) fn create_memcpy_volatile(
        &mut self,
        dst: PointerValue<'ctx>,
        src_addr: IntValue<'ctx>,
        len: u64,
    ) -> Result<()> {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let src = self
            .builder
            .build_int_to_ptr(src_addr, ptr_ty, "ctx_src")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let i8t = self.context.i8_type();
        for i in 0..len {
            let sp = self.create_byte_gep(src, i, "ctx_src_b")?;
            let loaded = self
                .builder
                .build_load(i8t, sp, "ctx_b")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.set_volatile(&loaded)?;
            let dp = self.create_byte_gep(dst, i, "ctx_dst_b")?;
            self.builder
                .build_store(dp, loaded)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        Ok(())
    }

    pub(crate) fn create_byte_gep(
        &mut self,
        ptr: PointerValue<'ctx>,
        offset: u64,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let idx = self.context.i64_type().const_int(offset, false);
        self.create_byte_gep_dyn(ptr, idx, name)
    }

    pub(crate) fn create_byte_gep_dyn(
        &mut self,
        ptr: PointerValue<'ctx>,
        offset: IntValue<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        unsafe {
            self.builder
                .build_gep(self.context.i8_type(), ptr, &[offset], name)
                .map_err(|e| CodeGenError::Builder(e.to_string()))
        }
    }

    pub(crate) fn create_struct_gep(
        &mut self,
        ty: StructType<'ctx>,
        ptr: PointerValue<'ctx>,
        index: u32,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        self.builder
            .build_struct_gep(ty, ptr, index, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))
    }

    pub(crate) fn cast_int(
        &mut self,
        value: IntValue<'ctx>,
        bits: u32,
        signed: bool,
        name: &str,
    ) -> Result<IntValue<'ctx>> {
        let ty = self.context.custom_width_int_type(bits);
        if value.get_type().get_bit_width() == bits {
            return Ok(value);
        }
        self.builder
            .build_int_cast_sign_flag(value, ty, signed, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))
    }

    pub(crate) fn set_volatile(&self, value: &BasicValueEnum<'ctx>) -> Result<()> {
        let instr = value
            .as_instruction_value()
            .ok_or_else(|| CodeGenError::InternalBug("volatile on non-instruction".to_string()))?;
        instr
            .set_volatile(true)
            .map_err(|e| CodeGenError::Llvm(e.to_string()))
    }

    // === Helper calls ===

    /// eBPF helper call through the BPF calling convention: the helper id
    /// becomes a function pointer for an indirect call the backend turns
    /// into a `call` instruction.
    pub(crate) fn create_helper_call(
        &mut self,
        helper_id: u32,
        args: &[BasicValueEnum<'ctx>],
        return_type: BasicTypeEnum<'ctx>,
        call_name: &str,
    ) -> Result<BasicValueEnum<'ctx>> {
        use inkwell::types::BasicMetadataTypeEnum;

        let arg_types: Vec<BasicMetadataTypeEnum> =
            args.iter().map(|arg| arg.get_type().into()).collect();
        let fn_type = return_type.fn_type(&arg_types, false);

        let i64_type = self.context.i64_type();
        let ptr_type = self.context.ptr_type(AddressSpace::default());
        let helper_id_val = i64_type.const_int(u64::from(helper_id), false);
        let helper_fn_ptr = self
            .builder
            .build_int_to_ptr(helper_id_val, ptr_type, "helper_fn")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let metadata_args: Vec<BasicMetadataValueEnum> =
            args.iter().map(|arg| (*arg).into()).collect();
        let call = self
            .builder
            .build_indirect_call(fn_type, helper_fn_ptr, &metadata_args, call_name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        Ok(call
            .try_as_basic_value()
            .left()
            .unwrap_or_else(|| return_type.const_zero()))
    }

    /// Kernel-side failure handling: negative helper returns emit a
    /// helper-error event carrying this call site's id, then execution
    /// continues with whatever zeroed output the helper left behind.
    pub(crate) fn create_helper_error_cond(
        &mut self,
        ret: IntValue<'ctx>,
        helper_id: u32,
    ) -> Result<()> {
        let error_id = self.helper_error_id;
        self.helper_error_id += 1;
        debug!("helper error check {} for helper {}", error_id, helper_id);

        let parent = self.current_function()?;
        let error_block = self.context.append_basic_block(parent, "helper_failed");
        let merge_block = self.context.append_basic_block(parent, "helper_merge");

        let i64t = self.context.i64_type();
        let ret64 = self.cast_int(ret, 64, true, "helper_ret")?;
        let is_err = self
            .builder
            .build_int_compare(IntPredicate::SLT, ret64, i64t.const_zero(), "helper_err_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(is_err, error_block, merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(error_block);
        let event_ty = self
            .context
            .struct_type(&[i64t.into(), i64t.into(), i64t.into()], false);
        let buf = self.create_alloca(event_ty.into(), "helper_error_t")?;
        let action = i64t.const_int(AsyncAction::HelperError.id(), false);
        let dst = self.create_struct_gep(event_ty, buf, 0, "action")?;
        self.builder
            .build_store(dst, action)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(event_ty, buf, 1, "error_id")?;
        self.builder
            .build_store(dst, i64t.const_int(error_id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(event_ty, buf, 2, "retcode")?;
        self.builder
            .build_store(dst, ret64)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let size = self.struct_size(event_ty);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        Ok(())
    }

    // === Foreign memory ===

    fn probe_read_helper(&self, addr_space: AddrSpace, str_variant: bool) -> u32 {
        if !self.options.has_probe_read_kernel {
            return if str_variant {
                BPF_FUNC_probe_read_str
            } else {
                BPF_FUNC_probe_read
            };
        }
        match (addr_space, str_variant) {
            (AddrSpace::User, false) => BPF_FUNC_probe_read_user,
            (AddrSpace::User, true) => BPF_FUNC_probe_read_user_str,
            (AddrSpace::Kernel, false) => BPF_FUNC_probe_read_kernel,
            (AddrSpace::Kernel, true) => BPF_FUNC_probe_read_kernel_str,
            (AddrSpace::None, false) => BPF_FUNC_probe_read,
            (AddrSpace::None, true) => BPF_FUNC_probe_read_str,
        }
    }

    pub(crate) fn create_probe_read(
        &mut self,
        dst: PointerValue<'ctx>,
        size: IntValue<'ctx>,
        src: IntValue<'ctx>,
        addr_space: AddrSpace,
    ) -> Result<()> {
        let helper = self.probe_read_helper(addr_space, false);
        self.probe_read_call(helper, dst, size, src, "probe_read")
    }

    pub(crate) fn create_probe_read_const(
        &mut self,
        dst: PointerValue<'ctx>,
        size: u64,
        src: IntValue<'ctx>,
        addr_space: AddrSpace,
    ) -> Result<()> {
        let size = self.context.i32_type().const_int(size, false);
        self.create_probe_read(dst, size, src, addr_space)
    }

    pub(crate) fn create_probe_read_str(
        &mut self,
        dst: PointerValue<'ctx>,
        size: IntValue<'ctx>,
        src: IntValue<'ctx>,
        addr_space: AddrSpace,
    ) -> Result<()> {
        let helper = self.probe_read_helper(addr_space, true);
        self.probe_read_call(helper, dst, size, src, "probe_read_str")
    }

    fn probe_read_call(
        &mut self,
        helper: u32,
        dst: PointerValue<'ctx>,
        size: IntValue<'ctx>,
        src: IntValue<'ctx>,
        name: &str,
    ) -> Result<()> {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let src_ptr = self
            .builder
            .build_int_to_ptr(src, ptr_ty, "probe_read_src")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let size32 = self.cast_int(size, 32, false, "probe_read_len")?;
        let ret = self
            .create_helper_call(
                helper,
                &[dst.into(), size32.into(), src_ptr.into()],
                self.context.i64_type().into(),
                name,
            )?
            .into_int_value();
        self.create_helper_error_cond(ret, helper)
    }

    // === Maps ===

    /// Map handle: the pseudo-fd instruction the loader rewrites to the
    /// real map address.
    pub(crate) fn create_map_ptr(&mut self, fd: i32) -> Result<PointerValue<'ctx>> {
        let i64t = self.context.i64_type();
        let pseudo_fn = match self.module.get_function("llvm.bpf.pseudo") {
            Some(f) => f,
            None => {
                let fn_ty = i64t.fn_type(&[i64t.into(), i64t.into()], false);
                self.module.add_function("llvm.bpf.pseudo", fn_ty, None)
            }
        };
        let call = self
            .builder
            .build_call(
                pseudo_fn,
                &[
                    i64t.const_int(BPF_PSEUDO_MAP_FD, false).into(),
                    i64t.const_int(fd as u64, false).into(),
                ],
                "pseudo",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let handle = call
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::InternalBug("pseudo call has no value".to_string()))?
            .into_int_value();
        self.builder
            .build_int_to_ptr(handle, self.context.ptr_type(AddressSpace::default()), "map_ptr")
            .map_err(|e| CodeGenError::Builder(e.to_string()))
    }

    /// Raw lookup returning the kernel's value pointer (null on miss).
    pub(crate) fn create_map_lookup_raw(
        &mut self,
        fd: i32,
        key: PointerValue<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let map_ptr = self.create_map_ptr(fd)?;
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        Ok(self
            .create_helper_call(
                BPF_FUNC_map_lookup_elem,
                &[map_ptr.into(), key.into()],
                ptr_ty.into(),
                name,
            )?
            .into_pointer_value())
    }

    /// Lookup with uninitialized-slot semantics: a miss reads as zero.
    /// Integers come back as a 64-bit register value, composites as a
    /// stack buffer the caller owns.
    pub(crate) fn create_map_lookup(
        &mut self,
        map: &MapInfo,
        key: PointerValue<'ctx>,
        name: &str,
    ) -> Result<ExprResult<'ctx>> {
        let value_type = map_value_type(&map.value_type);
        let lookup = self.create_map_lookup_raw(map.fd, key, "lookup_elem")?;

        let parent = self.current_function()?;
        let hit_block = self.context.append_basic_block(parent, "lookup_success");
        let miss_block = self.context.append_basic_block(parent, "lookup_failure");
        let merge_block = self.context.append_basic_block(parent, "lookup_merge");

        let value_buf = self.create_alloca_for(&value_type, name)?;
        let found = self
            .builder
            .build_is_not_null(lookup, "lookup_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(found, hit_block, miss_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let i64t = self.context.i64_type();
        if value_type.needs_memcpy() {
            self.builder.position_at_end(hit_block);
            self.create_memcpy(value_buf, lookup, value_type.size)?;
            self.builder
                .build_unconditional_branch(merge_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(miss_block);
            self.create_memset(value_buf, 0, value_type.size)?;
            self.builder
                .build_unconditional_branch(merge_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(merge_block);
            Ok(ExprResult::owned(value_buf))
        } else {
            self.builder.position_at_end(hit_block);
            let loaded = self
                .builder
                .build_load(i64t, lookup, "map_value")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(value_buf, loaded)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_unconditional_branch(merge_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(miss_block);
            self.builder
                .build_store(value_buf, i64t.const_zero())
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_unconditional_branch(merge_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(merge_block);
            let value = self
                .builder
                .build_load(i64t, value_buf, name)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.create_lifetime_end(value_buf)?;
            Ok(ExprResult::int(value))
        }
    }

    pub(crate) fn create_map_update(
        &mut self,
        map: &MapInfo,
        key: PointerValue<'ctx>,
        value: PointerValue<'ctx>,
    ) -> Result<()> {
        let map_ptr = self.create_map_ptr(map.fd)?;
        let i64t = self.context.i64_type();
        // BPF_ANY: create or overwrite
        let flags = i64t.const_zero();
        let ret = self
            .create_helper_call(
                BPF_FUNC_map_update_elem,
                &[map_ptr.into(), key.into(), value.into(), flags.into()],
                i64t.into(),
                "update_elem",
            )?
            .into_int_value();
        self.create_helper_error_cond(ret, BPF_FUNC_map_update_elem)
    }

    pub(crate) fn create_map_delete(
        &mut self,
        map: &MapInfo,
        key: PointerValue<'ctx>,
    ) -> Result<()> {
        let map_ptr = self.create_map_ptr(map.fd)?;
        let i64t = self.context.i64_type();
        let ret = self
            .create_helper_call(
                BPF_FUNC_map_delete_elem,
                &[map_ptr.into(), key.into()],
                i64t.into(),
                "delete_elem",
            )?
            .into_int_value();
        self.create_helper_error_cond(ret, BPF_FUNC_map_delete_elem)
    }

    // === Async event output ===

    pub(crate) fn create_perf_event_output(
        &mut self,
        data: PointerValue<'ctx>,
        size: u64,
    ) -> Result<()> {
        let map_fd = self
            .metadata
            .perf_event_map
            .as_ref()
            .map(|m| m.fd)
            .ok_or_else(|| CodeGenError::InternalBug("no perf event map".to_string()))?;
        let map_ptr = self.create_map_ptr(map_fd)?;
        let ctx = self.ctx_ptr()?;
        let i64t = self.context.i64_type();
        self.create_helper_call(
            BPF_FUNC_perf_event_output,
            &[
                ctx.into(),
                map_ptr.into(),
                i64t.const_int(BPF_F_CURRENT_CPU, false).into(),
                data.into(),
                i64t.const_int(size, false).into(),
            ],
            i64t.into(),
            "perf_event_output",
        )?;
        Ok(())
    }

    // === Context helpers ===

    /// Volatile 64-bit load of a register slot from the probe context.
    /// Volatility keeps later passes from re-typing context accesses.
    pub(crate) fn create_ctx_load(&mut self, slot: u64, name: &str) -> Result<IntValue<'ctx>> {
        let ctx = self.ctx_ptr()?;
        let i64t = self.context.i64_type();
        let idx = i64t.const_int(slot, false);
        let reg_ptr = unsafe {
            self.builder
                .build_gep(i64t, ctx, &[idx], &format!("{name}_ptr"))
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
        };
        let loaded = self
            .builder
            .build_load(i64t, reg_ptr, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.set_volatile(&loaded)?;
        Ok(loaded.into_int_value())
    }

    /// Volatile load of a typed field at an absolute context address.
    pub(crate) fn create_ctx_load_at(
        &mut self,
        ty: BasicTypeEnum<'ctx>,
        addr: IntValue<'ctx>,
        name: &str,
    ) -> Result<BasicValueEnum<'ctx>> {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let ptr = self
            .builder
            .build_int_to_ptr(addr, ptr_ty, &format!("{name}_ptr"))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let loaded = self
            .builder
            .build_load(ty, ptr, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.set_volatile(&loaded)?;
        Ok(loaded)
    }

    fn simple_helper(&mut self, helper: u32, name: &str) -> Result<IntValue<'ctx>> {
        let i64t = self.context.i64_type();
        Ok(self
            .create_helper_call(helper, &[], i64t.into(), name)?
            .into_int_value())
    }

    pub(crate) fn create_get_ns(&mut self) -> Result<IntValue<'ctx>> {
        if self.options.has_boot_ns {
            self.simple_helper(BPF_FUNC_ktime_get_boot_ns, "get_ns")
        } else {
            self.simple_helper(BPF_FUNC_ktime_get_ns, "get_ns")
        }
    }

    pub(crate) fn create_get_pid_tgid(&mut self) -> Result<IntValue<'ctx>> {
        self.simple_helper(BPF_FUNC_get_current_pid_tgid, "get_pid_tgid")
    }

    pub(crate) fn create_get_uid_gid(&mut self) -> Result<IntValue<'ctx>> {
        self.simple_helper(BPF_FUNC_get_current_uid_gid, "get_uid_gid")
    }

    pub(crate) fn create_get_cpu_id(&mut self) -> Result<IntValue<'ctx>> {
        let i32t = self.context.i32_type();
        let cpu = self
            .create_helper_call(BPF_FUNC_get_smp_processor_id, &[], i32t.into(), "get_cpu_id")?
            .into_int_value();
        self.cast_int(cpu, 64, false, "cpu")
    }

    pub(crate) fn create_get_cgroup_id(&mut self) -> Result<IntValue<'ctx>> {
        self.simple_helper(BPF_FUNC_get_current_cgroup_id, "get_cgroup_id")
    }

    pub(crate) fn create_get_current_task(&mut self) -> Result<IntValue<'ctx>> {
        self.simple_helper(BPF_FUNC_get_current_task, "get_current_task")
    }

    pub(crate) fn create_get_random(&mut self) -> Result<IntValue<'ctx>> {
        let i32t = self.context.i32_type();
        let rand = self
            .create_helper_call(BPF_FUNC_get_prandom_u32, &[], i32t.into(), "get_random")?
            .into_int_value();
        self.cast_int(rand, 64, false, "rand")
    }

    pub(crate) fn create_get_current_comm(
        &mut self,
        buf: PointerValue<'ctx>,
        size: u64,
    ) -> Result<()> {
        let i64t = self.context.i64_type();
        let size_val = self.context.i32_type().const_int(size, false);
        let ret = self
            .create_helper_call(
                BPF_FUNC_get_current_comm,
                &[buf.into(), size_val.into()],
                i64t.into(),
                "get_comm",
            )?
            .into_int_value();
        self.create_helper_error_cond(ret, BPF_FUNC_get_current_comm)
    }

    pub(crate) fn create_get_stack_id(
        &mut self,
        user: bool,
        stack_type: StackType,
    ) -> Result<IntValue<'ctx>> {
        let map_fd = self
            .metadata
            .stack_maps
            .get(&stack_type)
            .map(|m| m.fd)
            .ok_or_else(|| {
                CodeGenError::InternalBug(format!("no stack map for {stack_type:?}"))
            })?;
        let map_ptr = self.create_map_ptr(map_fd)?;
        let ctx = self.ctx_ptr()?;
        let i64t = self.context.i64_type();
        let flags = if user { BPF_F_USER_STACK } else { 0 };
        let stackid = self
            .create_helper_call(
                BPF_FUNC_get_stackid,
                &[ctx.into(), map_ptr.into(), i64t.const_int(flags, false).into()],
                i64t.into(),
                "get_stackid",
            )?
            .into_int_value();
        self.create_helper_error_cond(stackid, BPF_FUNC_get_stackid)?;
        Ok(stackid)
    }

    pub(crate) fn create_signal(&mut self, sig: IntValue<'ctx>) -> Result<()> {
        let i64t = self.context.i64_type();
        let sig32 = self.cast_int(sig, 32, false, "sig")?;
        let ret = self
            .create_helper_call(BPF_FUNC_send_signal, &[sig32.into()], i64t.into(), "signal")?
            .into_int_value();
        self.create_helper_error_cond(ret, BPF_FUNC_send_signal)
    }

    pub(crate) fn create_override_return(&mut self, rc: IntValue<'ctx>) -> Result<()> {
        let ctx = self.ctx_ptr()?;
        let i64t = self.context.i64_type();
        self.create_helper_call(
            BPF_FUNC_override_return,
            &[ctx.into(), rc.into()],
            i64t.into(),
            "override",
        )?;
        Ok(())
    }

    /// Pack a user-space address with the current pid for runtime
    /// symbolication: `{addr: u64, pid: u64}` on the stack.
    pub(crate) fn create_usym(&mut self, addr: IntValue<'ctx>) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let usym_ty = self
            .context
            .struct_type(&[i64t.into(), i64t.into()], false);
        let buf = self.create_alloca(usym_ty.into(), "usym")?;

        let pid_tgid = self.create_get_pid_tgid()?;
        let shift = i64t.const_int(32, false);
        let pid = self
            .builder
            .build_right_shift(pid_tgid, shift, false, "pid")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let addr_ptr = self.create_struct_gep(usym_ty, buf, 0, "usym_addr")?;
        self.builder
            .build_store(addr_ptr, addr)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let pid_ptr = self.create_struct_gep(usym_ty, buf, 1, "usym_pid")?;
        self.builder
            .build_store(pid_ptr, pid)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(ExprResult::owned(buf))
    }

    // === String comparison ===

    fn string_byte(
        &mut self,
        value: &ExprValue<'ctx>,
        index: u64,
        name: &str,
    ) -> Result<IntValue<'ctx>> {
        let ptr = match value {
            ExprValue::Stack(p) => *p,
            _ => {
                return Err(CodeGenError::InternalBug(
                    "string compare operand not on stack".to_string(),
                ))
            }
        };
        let gep = self.create_byte_gep(ptr, index, &format!("{name}_ptr"))?;
        Ok(self
            .builder
            .build_load(self.context.i8_type(), gep, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value())
    }

    /// Inlined comparison of up to `n` bytes against a string literal; the
    /// literal never touches the stack. The chain ends early once the
    /// literal's NUL has matched. With `inverse` the result is 1 on
    /// equality (the `==` shape), without it 1 on difference (the
    /// `strncmp()` shape).
    pub(crate) fn create_strcmp(
        &mut self,
        value: &ExprValue<'ctx>,
        literal: &str,
        n: u64,
        inverse: bool,
    ) -> Result<IntValue<'ctx>> {
        let bytes = literal.as_bytes();
        let i64t = self.context.i64_type();
        let i8t = self.context.i8_type();

        let parent = self.current_function()?;
        let differ_block = self.context.append_basic_block(parent, "strcmp.false");
        let done_block = self.context.append_basic_block(parent, "strcmp.done");

        let result = self.create_alloca(i64t.into(), "strcmp.result")?;
        let equal_val = i64t.const_int(u64::from(inverse), false);
        let differ_val = i64t.const_int(u64::from(!inverse), false);
        self.builder
            .build_store(result, equal_val)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        for i in 0..n {
            let lit_byte = *bytes.get(i as usize).unwrap_or(&0);
            let byte = self.string_byte(value, i, "strcmp.char")?;
            let lit = i8t.const_int(u64::from(lit_byte), false);
            let ne = self
                .builder
                .build_int_compare(IntPredicate::NE, byte, lit, "strcmp.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            // a matched NUL ends the comparison as equal
            let last = i + 1 == n || lit_byte == 0;
            let next = if last {
                done_block
            } else {
                self.context
                    .append_basic_block(parent, &format!("strcmp.char{}", i + 1))
            };
            self.builder
                .build_conditional_branch(ne, differ_block, next)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            if last {
                break;
            }
            self.builder.position_at_end(next);
        }

        self.builder.position_at_end(differ_block);
        self.builder
            .build_store(result, differ_val)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(done_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(done_block);
        let loaded = self
            .builder
            .build_load(i64t, result, "strcmp.result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(loaded)
    }

    /// Inlined byte-wise comparison of two stack strings, bounded by `n`.
    /// A NUL matched on both sides ends the comparison as equal.
    pub(crate) fn create_strncmp(
        &mut self,
        left: &ExprValue<'ctx>,
        right: &ExprValue<'ctx>,
        n: u64,
        inverse: bool,
    ) -> Result<IntValue<'ctx>> {
        let i64t = self.context.i64_type();
        let i8t = self.context.i8_type();

        let parent = self.current_function()?;
        let differ_block = self.context.append_basic_block(parent, "strncmp.false");
        let done_block = self.context.append_basic_block(parent, "strncmp.done");

        let result = self.create_alloca(i64t.into(), "strncmp.result")?;
        let equal_val = i64t.const_int(u64::from(inverse), false);
        let differ_val = i64t.const_int(u64::from(!inverse), false);
        self.builder
            .build_store(result, equal_val)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        for i in 0..n {
            let l = self.string_byte(left, i, "strncmp.l")?;
            let r = self.string_byte(right, i, "strncmp.r")?;
            let ne = self
                .builder
                .build_int_compare(IntPredicate::NE, l, r, "strncmp.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let nul_check = self
                .context
                .append_basic_block(parent, &format!("strncmp.nul{i}"));
            self.builder
                .build_conditional_branch(ne, differ_block, nul_check)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(nul_check);
            let next = if i + 1 == n {
                done_block
            } else {
                self.context
                    .append_basic_block(parent, &format!("strncmp.char{}", i + 1))
            };
            let is_nul = self
                .builder
                .build_int_compare(IntPredicate::EQ, l, i8t.const_zero(), "strncmp.nulcmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_conditional_branch(is_nul, done_block, next)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            if next != done_block {
                self.builder.position_at_end(next);
            }
        }

        self.builder.position_at_end(differ_block);
        self.builder
            .build_store(result, differ_val)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(done_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(done_block);
        let loaded = self
            .builder
            .build_load(i64t, result, "strncmp.result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(loaded)
    }
}
