//! Call lowering
//!
//! Aggregations become read-modify-write sequences against per-key map
//! slots; async actions serialize a record and hand it to the perf ring;
//! the remaining builtin calls are thin wrappers over the façade.

use super::context::{CodeGen, CodeGenError, ExprResult, Result};
use crate::ast::{Call, Expression, MapAccess};
use inkwell::types::BasicTypeEnum;
use inkwell::values::{IntValue, PointerValue};
use inkwell::IntPredicate;
use kscope_protocol::{AsyncAction, ACTION_BASE_CAT, ACTION_BASE_PRINTF, ACTION_BASE_SYSTEM};
use tracing::debug;

const AF_INET: u64 = 2;
const AF_INET6: u64 = 10;

#[derive(Clone, Copy)]
enum FormatKind {
    Printf,
    System,
    Cat,
}

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    pub(crate) fn compile_call(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        debug!("lowering call {}", call.func);
        match call.func.as_str() {
            "count" => self.compile_count(call),
            "sum" => self.compile_sum(call),
            "min" => self.compile_min_max(call, true),
            "max" => self.compile_min_max(call, false),
            "avg" | "stats" => self.compile_avg(call),
            "hist" => self.compile_hist(call),
            "lhist" => self.compile_lhist(call),
            "delete" => self.compile_delete(call),
            "str" => self.compile_str(call),
            "buf" => self.compile_buf(call),
            "kaddr" => {
                let name = literal_string(call, 0)?;
                let addr = self.resolver.resolve_kname(&name);
                Ok(ExprResult::int(self.context.i64_type().const_int(addr, false)))
            }
            "uaddr" => {
                let name = literal_string(call, 0)?;
                let target = self
                    .current_attach_point
                    .as_ref()
                    .map(|ap| ap.target.clone())
                    .unwrap_or_default();
                let addr = self
                    .resolver
                    .resolve_uname(&name, &target)
                    .filter(|a| *a != 0)
                    .ok_or_else(|| {
                        CodeGenError::SymbolResolutionFailed(format!("{target}:{name}"))
                    })?;
                Ok(ExprResult::int(self.context.i64_type().const_int(addr, false)))
            }
            "cgroupid" => {
                let path = literal_string(call, 0)?;
                let id = self.resolver.resolve_cgroupid(&path);
                Ok(ExprResult::int(self.context.i64_type().const_int(id, false)))
            }
            "reg" => {
                let name = literal_string(call, 0)?;
                let offset = kscope_platform::register_offset(&name).ok_or_else(|| {
                    CodeGenError::InternalBug(format!("unknown register {name}"))
                })?;
                let value = self.create_ctx_load(offset as u64, &format!("reg_{name}"))?;
                Ok(ExprResult::int(value))
            }
            "printf" => self.compile_format_string_call(call, FormatKind::Printf),
            "system" => self.compile_format_string_call(call, FormatKind::System),
            "cat" => self.compile_format_string_call(call, FormatKind::Cat),
            "exit" => self.compile_exit(),
            "print" => {
                if call.args.first().map(Expression::is_map).unwrap_or(false) {
                    self.compile_print_map(call)
                } else {
                    self.compile_print_non_map(call)
                }
            }
            "clear" => self.compile_map_event(call, AsyncAction::Clear),
            "zero" => self.compile_map_event(call, AsyncAction::Zero),
            "time" => self.compile_time(),
            "strftime" => self.compile_strftime(call),
            "join" => self.compile_join(call),
            "ksym" => self.compile_expr(&call.args[0]),
            "usym" => {
                let operand = self.compile_expr(&call.args[0])?;
                let addr = self.as_int(&operand)?;
                self.release(operand)?;
                self.create_usym(addr)
            }
            "ntop" => self.compile_ntop(call),
            "kstack" | "ustack" => {
                let user = call.func == "ustack";
                let stack_type = call.ty.stack_type.unwrap_or_default();
                let mut stackid = self.create_get_stack_id(user, stack_type)?;
                if user {
                    let i64t = self.context.i64_type();
                    let pid_tgid = self.create_get_pid_tgid()?;
                    let pid_high = self
                        .builder
                        .build_and(
                            pid_tgid,
                            i64t.const_int(0xffff_ffff_0000_0000, false),
                            "pid_high",
                        )
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    stackid = self
                        .builder
                        .build_or(stackid, pid_high, "ustack_packed")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                }
                Ok(ExprResult::int(stackid))
            }
            "signal" => self.compile_signal(call),
            "sizeof" => Ok(ExprResult::int(
                self.context
                    .i64_type()
                    .const_int(call.args[0].ty().size, false),
            )),
            "strncmp" => self.compile_strncmp_call(call),
            "override" => {
                let operand = self.compile_expr(&call.args[0])?;
                let value = self.as_int(&operand)?;
                self.release(operand)?;
                let value = self.cast_int(value, 64, call.args[0].ty().is_signed(), "rc")?;
                self.create_override_return(value)?;
                Ok(ExprResult::none())
            }
            "kptr" | "uptr" => self.compile_expr(&call.args[0]),
            other => Err(CodeGenError::UnknownCall(other.to_string())),
        }
    }

    // === Map keys ===

    /// Materialize a map key on the stack. The caller owns the returned
    /// slot and must lifetime-end it after the map operation.
    pub(crate) fn compile_map_key(&mut self, map: &MapAccess) -> Result<PointerValue<'ctx>> {
        let i64t = self.context.i64_type();
        if map.keys.is_empty() {
            // keyless map: fixed zero key
            let key = self.create_alloca(i64t.into(), &format!("{}_key", map.ident))?;
            self.builder
                .build_store(key, i64t.const_zero())
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            return Ok(key);
        }
        if map.keys.len() == 1 {
            let expr = &map.keys[0];
            let mut result = self.compile_expr(expr)?;
            if expr.ty().should_be_on_stack() {
                // the value's own buffer becomes the key; ownership moves
                // to the caller
                let ptr = self.as_stack(&result)?;
                result.disarm();
                return Ok(ptr);
            }
            let key = self.create_alloca(i64t.into(), &format!("{}_key", map.ident))?;
            let value = self.as_int(&result)?;
            let value = self.cast_int(value, 64, expr.ty().is_signed(), "key")?;
            self.builder
                .build_store(key, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.release(result)?;
            return Ok(key);
        }
        self.compile_compound_key(map, None)
    }

    /// The aggregation key shape: the plain key with a trailing 8-byte
    /// bucket cell.
    pub(crate) fn compile_hist_map_key(
        &mut self,
        map: &MapAccess,
        bucket: IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        if map.keys.is_empty() {
            let i64t = self.context.i64_type();
            let key = self.create_alloca(i64t.into(), &format!("{}_key", map.ident))?;
            self.builder
                .build_store(key, bucket)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            return Ok(key);
        }
        self.compile_compound_key(map, Some(bucket))
    }

    fn compile_compound_key(
        &mut self,
        map: &MapAccess,
        bucket: Option<IntValue<'ctx>>,
    ) -> Result<PointerValue<'ctx>> {
        // scalar key fields are stored 64-bit-promoted
        let field_size = |e: &Expression| -> u64 {
            if e.ty().should_be_on_stack() {
                e.ty().size
            } else {
                8
            }
        };
        let mut size: u64 = map.keys.iter().map(field_size).sum();
        if bucket.is_some() {
            size += 8;
        }
        let key = self.create_alloca_bytes(size, &format!("{}_key", map.ident))?;

        let mut offset = 0u64;
        for expr in &map.keys {
            let result = self.compile_expr(expr)?;
            let dst = self.create_byte_gep(key, offset, "key_field")?;
            if expr.ty().should_be_on_stack() {
                let src = self.as_stack(&result)?;
                self.create_memcpy(dst, src, expr.ty().size)?;
            } else {
                let value = self.as_int(&result)?;
                let value = self.cast_int(value, 64, expr.ty().is_signed(), "key_field")?;
                self.builder
                    .build_store(dst, value)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            offset += field_size(expr);
            self.release(result)?;
        }
        if let Some(bucket) = bucket {
            let dst = self.create_byte_gep(key, offset, "bucket")?;
            self.builder
                .build_store(dst, bucket)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        Ok(key)
    }

    // === Aggregations ===

    fn agg_map(&self, call: &Call) -> Result<MapAccess> {
        call.map
            .clone()
            .ok_or_else(|| CodeGenError::InternalBug(format!("{} without target map", call.func)))
    }

    /// Store `value` into `map[key]` and release both slots.
    fn store_agg_value(
        &mut self,
        map: &MapAccess,
        key: PointerValue<'ctx>,
        value: IntValue<'ctx>,
    ) -> Result<()> {
        let info = self.map_info(&map.ident)?;
        let i64t = self.context.i64_type();
        let newval = self.create_alloca(i64t.into(), &format!("{}_val", map.ident))?;
        self.builder
            .build_store(newval, value)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_map_update(&info, key, newval)?;
        self.create_lifetime_end(key)?;
        self.create_lifetime_end(newval)?;
        Ok(())
    }

    fn compile_count(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let map = self.agg_map(call)?;
        let info = self.map_info(&map.ident)?;
        let key = self.compile_map_key(&map)?;
        let old_result = self.create_map_lookup(&info, key, &map.ident)?;
        let oldval = self.as_int(&old_result)?;
        let one = self.context.i64_type().const_int(1, false);
        let newval = self
            .builder
            .build_int_add(oldval, one, "count")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_agg_value(&map, key, newval)?;
        Ok(ExprResult::none())
    }

    fn compile_sum(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let map = self.agg_map(call)?;
        let info = self.map_info(&map.ident)?;
        let key = self.compile_map_key(&map)?;
        let old_result = self.create_map_lookup(&info, key, &map.ident)?;
        let oldval = self.as_int(&old_result)?;

        let arg = &call.args[0];
        let value_result = self.compile_expr(arg)?;
        let value = self.as_int(&value_result)?;
        // 64-bit promotion uses the source operand's signedness
        let value = self.cast_int(value, 64, arg.ty().is_signed(), "sum")?;
        self.release(value_result)?;
        let newval = self
            .builder
            .build_int_add(value, oldval, "sum")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_agg_value(&map, key, newval)?;
        Ok(ExprResult::none())
    }

    /// min stores `0xffffffff - v` so an uninitialized zero slot always
    /// loses the signed-ge comparison on first occurrence; the runtime
    /// inverts it again when printing. max stores the value directly.
    fn compile_min_max(&mut self, call: &Call, is_min: bool) -> Result<ExprResult<'ctx>> {
        let map = self.agg_map(call)?;
        let info = self.map_info(&map.ident)?;
        let i64t = self.context.i64_type();
        let key = self.compile_map_key(&map)?;
        let old_result = self.create_map_lookup(&info, key, &map.ident)?;
        let oldval = self.as_int(&old_result)?;
        let newval = self.create_alloca(i64t.into(), &format!("{}_val", map.ident))?;

        let arg = &call.args[0];
        let value_result = self.compile_expr(arg)?;
        let value = self.as_int(&value_result)?;
        let value = self.cast_int(value, 64, arg.ty().is_signed(), "val")?;
        self.release(value_result)?;

        let candidate = if is_min {
            self.builder
                .build_int_sub(i64t.const_int(0xffff_ffff, false), value, "inverted")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
        } else {
            value
        };

        let parent = self.current_function()?;
        let update_block = self.context.append_basic_block(parent, "min.ge");
        let merge_block = self.context.append_basic_block(parent, "min.merge");
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::SGE, candidate, oldval, "min_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, update_block, merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(update_block);
        self.builder
            .build_store(newval, candidate)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_map_update(&info, key, newval)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // lifetime ends live in the merge block both paths reach
        self.builder.position_at_end(merge_block);
        self.create_lifetime_end(key)?;
        self.create_lifetime_end(newval)?;
        Ok(ExprResult::none())
    }

    /// avg and stats share a layout: slot `(key, 0)` counts, slot
    /// `(key, 1)` totals; the division happens at print time.
    fn compile_avg(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let map = self.agg_map(call)?;
        let info = self.map_info(&map.ident)?;
        let i64t = self.context.i64_type();

        let count_key = self.compile_hist_map_key(&map, i64t.const_zero())?;
        let count_old_result = self.create_map_lookup(&info, count_key, &map.ident)?;
        let count_old = self.as_int(&count_old_result)?;
        let count_new = self
            .builder
            .build_int_add(count_old, i64t.const_int(1, false), "avg_count")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_agg_value(&map, count_key, count_new)?;

        let total_key = self.compile_hist_map_key(&map, i64t.const_int(1, false))?;
        let total_old_result = self.create_map_lookup(&info, total_key, &map.ident)?;
        let total_old = self.as_int(&total_old_result)?;
        let arg = &call.args[0];
        let value_result = self.compile_expr(arg)?;
        let value = self.as_int(&value_result)?;
        let value = self.cast_int(value, 64, arg.ty().is_signed(), "avg_val")?;
        self.release(value_result)?;
        let total_new = self
            .builder
            .build_int_add(value, total_old, "avg_total")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_agg_value(&map, total_key, total_new)?;
        Ok(ExprResult::none())
    }

    fn bump_bucket(&mut self, map: &MapAccess, bucket: IntValue<'ctx>) -> Result<()> {
        let info = self.map_info(&map.ident)?;
        let key = self.compile_hist_map_key(map, bucket)?;
        let old_result = self.create_map_lookup(&info, key, &map.ident)?;
        let oldval = self.as_int(&old_result)?;
        let newval = self
            .builder
            .build_int_add(oldval, self.context.i64_type().const_int(1, false), "bucket_count")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_agg_value(map, key, newval)
    }

    fn compile_hist(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let log2 = self.log2_function()?;
        let map = self.agg_map(call)?;
        let arg = &call.args[0];
        let value_result = self.compile_expr(arg)?;
        let value = self.as_int(&value_result)?;
        let value = self.cast_int(value, 64, arg.ty().is_signed(), "hist_val")?;
        self.release(value_result)?;
        let bucket = self
            .builder
            .build_call(log2, &[value.into()], "log2")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::InternalBug("log2 returned void".to_string()))?
            .into_int_value();
        self.bump_bucket(&map, bucket)?;
        Ok(ExprResult::none())
    }

    fn compile_lhist(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let linear = self.linear_function()?;
        let map = self.agg_map(call)?;

        let value_arg = &call.args[0];
        let value_result = self.compile_expr(value_arg)?;
        let value = self.as_int(&value_result)?;
        let value = self.cast_int(value, 64, value_arg.ty().is_signed(), "lhist_val")?;
        self.release(value_result)?;

        // bounds are literals, enforced by the analyzer
        let mut bounds = Vec::with_capacity(3);
        for arg in &call.args[1..4] {
            let result = self.compile_expr(arg)?;
            let bound = self.as_int(&result)?;
            let bound = self.cast_int(bound, 64, false, "lhist_bound")?;
            self.release(result)?;
            bounds.push(bound);
        }

        let bucket = self
            .builder
            .build_call(
                linear,
                &[value.into(), bounds[0].into(), bounds[1].into(), bounds[2].into()],
                "linear",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::InternalBug("linear returned void".to_string()))?
            .into_int_value();
        self.bump_bucket(&map, bucket)?;
        Ok(ExprResult::none())
    }

    fn compile_delete(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let map = match &call.args[0] {
            Expression::Map(map) => map.clone(),
            _ => {
                return Err(CodeGenError::InternalBug(
                    "delete expects a map argument".to_string(),
                ))
            }
        };
        let info = self.map_info(&map.ident)?;
        let key = self.compile_map_key(&map)?;
        self.create_map_delete(&info, key)?;
        self.create_lifetime_end(key)?;
        Ok(ExprResult::none())
    }

    // === Strings and buffers ===

    fn compile_str(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let cap = self.metadata.strlen;

        let strlen = self.create_alloca(i64t.into(), "strlen")?;
        self.create_memset(strlen, 0, 8)?;
        if call.args.len() > 1 {
            let len_result = self.compile_expr(&call.args[1])?;
            let len = self.as_int(&len_result)?;
            self.release(len_result)?;
            // one past the requested length for the terminating NUL
            let proposed = self
                .builder
                .build_int_add(len, i64t.const_int(1, false), "proposed_strlen")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let max = i64t.const_int(cap, false);
            let fits = self
                .builder
                .build_int_compare(IntPredicate::ULE, proposed, max, "str.min.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let clamped = self
                .builder
                .build_select(fits, proposed, max, "str.min.select")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(strlen, clamped)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        } else {
            self.builder
                .build_store(strlen, i64t.const_int(cap, false))
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }

        let buf = self.create_alloca_bytes(cap, "str")?;
        self.create_memset(buf, 0, cap)?;
        let arg0 = &call.args[0];
        let src_result = self.compile_expr(arg0)?;
        let src = self.value_addr(&src_result)?;
        let read_len = self
            .builder
            .build_load(i64t, strlen, "strlen")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_probe_read_str(buf, read_len, src, arg0.ty().addr_space)?;
        self.release(src_result)?;
        self.create_lifetime_end(strlen)?;
        Ok(ExprResult::owned(buf))
    }

    fn compile_buf(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let i8t = self.context.i8_type();
        let cap = self.metadata.strlen;

        let (length, fixed_length): (IntValue<'ctx>, u64) = if call.args.len() > 1 {
            let len_arg = &call.args[1];
            let fixed = match len_arg {
                Expression::Integer(n) => n.value as u64,
                _ => cap,
            };
            let len_result = self.compile_expr(len_arg)?;
            let proposed = self.as_int(&len_result)?;
            self.release(len_result)?;
            let max = self.cast_int(i64t.const_int(cap, false), 64, false, "max")?;
            let proposed = self.cast_int(proposed, 64, false, "length")?;
            let fits = self
                .builder
                .build_int_compare(IntPredicate::ULE, proposed, max, "length.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let clamped = self
                .builder
                .build_select(fits, proposed, max, "length.select")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            (clamped, fixed)
        } else {
            let fixed = call.args[0].ty().size;
            (i64t.const_int(fixed, false), fixed)
        };

        // length-prefixed buffer record: {u8 length, u8 content[fixed]}
        let buf_struct = self.context.struct_type(
            &[i8t.into(), i8t.array_type(fixed_length as u32).into()],
            false,
        );
        let buf = self.create_alloca(buf_struct.into(), "buffer")?;

        let len_ptr = self.create_struct_gep(buf_struct, buf, 0, "buffer_len")?;
        let len_byte = self.cast_int(length, 8, false, "len_byte")?;
        self.builder
            .build_store(len_ptr, len_byte)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let data_ptr = self.create_struct_gep(buf_struct, buf, 1, "buffer_data")?;
        self.create_memset(data_ptr, 0, fixed_length)?;

        let arg0 = &call.args[0];
        let src_result = self.compile_expr(arg0)?;
        let src = self.value_addr(&src_result)?;
        self.create_probe_read(data_ptr, length, src, arg0.ty().addr_space)?;
        self.release(src_result)?;
        Ok(ExprResult::owned(buf))
    }

    fn compile_strncmp_call(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let n = match &call.args[2] {
            Expression::Integer(lit) => lit.value as u64,
            _ => {
                return Err(CodeGenError::InternalBug(
                    "strncmp length must be a literal".to_string(),
                ))
            }
        };
        let left = &call.args[0];
        let right = &call.args[1];

        // literal on either side avoids materializing it on the stack
        let value = if let Expression::String(lit) = right {
            let operand = self.compile_expr(left)?;
            let value = self.create_strcmp(&operand.value, &lit.value, n, false)?;
            self.release(operand)?;
            value
        } else if let Expression::String(lit) = left {
            let operand = self.compile_expr(right)?;
            let value = self.create_strcmp(&operand.value, &lit.value, n, false)?;
            self.release(operand)?;
            value
        } else {
            let right_result = self.compile_expr(right)?;
            let left_result = self.compile_expr(left)?;
            let value =
                self.create_strncmp(&left_result.value, &right_result.value, n, false)?;
            self.release(left_result)?;
            self.release(right_result)?;
            value
        };
        Ok(ExprResult::int(value))
    }

    // === Async emitters ===

    fn compile_format_string_call(
        &mut self,
        call: &Call,
        kind: FormatKind,
    ) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let (id, base, name) = match kind {
            FormatKind::Printf => (self.printf_id, ACTION_BASE_PRINTF, "printf"),
            FormatKind::System => (self.system_id, ACTION_BASE_SYSTEM, "system"),
            FormatKind::Cat => (self.cat_id, ACTION_BASE_CAT, "cat"),
        };

        let fields = {
            let table = match kind {
                FormatKind::Printf => &self.metadata.printf_args,
                FormatKind::System => &self.metadata.system_args,
                FormatKind::Cat => &self.metadata.cat_args,
            };
            table
                .get(id as usize)
                .map(|(_, fields)| fields.clone())
                .ok_or_else(|| {
                    CodeGenError::InternalBug(format!("{name} id {id} has no argument table"))
                })?
        };

        let mut elements: Vec<BasicTypeEnum> = vec![i64t.into()];
        for field in &fields {
            elements.push(self.llvm_type(&field.ty));
        }
        let fmt_struct = self.context.struct_type(&elements, false);
        let struct_size = self.struct_size(fmt_struct);

        // publish the record offsets so the runtime can decode the args
        for i in 0..fields.len() {
            let offset = self.struct_offset(fmt_struct, (i + 1) as u32)?;
            let table = match kind {
                FormatKind::Printf => &mut self.metadata.printf_args,
                FormatKind::System => &mut self.metadata.system_args,
                FormatKind::Cat => &mut self.metadata.cat_args,
            };
            table[id as usize].1[i].offset = offset;
        }

        let fmt_args = self.create_alloca(fmt_struct.into(), &format!("{name}_args"))?;
        // unpacked struct: clear padding before filling fields
        self.create_memset(fmt_args, 0, struct_size)?;

        let id_ptr = self.create_struct_gep(fmt_struct, fmt_args, 0, "action_id")?;
        self.builder
            .build_store(id_ptr, i64t.const_int(base + id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        for (i, arg) in call.args.iter().enumerate().skip(1) {
            let result = self.compile_expr(arg)?;
            let dst = self.create_struct_gep(fmt_struct, fmt_args, i as u32, "arg")?;
            if arg.ty().needs_memcpy() {
                let src = self.as_stack(&result)?;
                self.create_memcpy(dst, src, arg.ty().size)?;
            } else {
                let value = self.as_int(&result)?;
                self.builder
                    .build_store(dst, value)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            self.release(result)?;
        }

        match kind {
            FormatKind::Printf => self.printf_id += 1,
            FormatKind::System => self.system_id += 1,
            FormatKind::Cat => self.cat_id += 1,
        }
        self.create_perf_event_output(fmt_args, struct_size)?;
        self.create_lifetime_end(fmt_args)?;
        Ok(ExprResult::none())
    }

    /// exit() emits its record, returns immediately, and parks any
    /// trailing instructions in a dead block so the module stays
    /// well-formed.
    fn compile_exit(&mut self) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let perfdata = self.create_alloca(i64t.into(), "perfdata")?;
        self.builder
            .build_store(perfdata, i64t.const_int(AsyncAction::Exit.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_perf_event_output(perfdata, 8)?;
        self.create_lifetime_end(perfdata)?;
        self.builder
            .build_return(Some(&i64t.const_zero()))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let parent = self.current_function()?;
        let deadcode = self.context.append_basic_block(parent, "deadcode");
        self.builder.position_at_end(deadcode);
        Ok(ExprResult::none())
    }

    fn compile_print_map(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let map = match &call.args[0] {
            Expression::Map(map) => map.clone(),
            _ => return Err(CodeGenError::InternalBug("print without map".to_string())),
        };
        let info = self.map_info(&map.ident)?;
        let i64t = self.context.i64_type();
        let print_struct = self.context.struct_type(
            &[i64t.into(), i64t.into(), i64t.into(), i64t.into()],
            false,
        );
        let buf = self.create_alloca(print_struct.into(), &format!("print_{}", map.ident))?;

        let dst = self.create_struct_gep(print_struct, buf, 0, "action")?;
        self.builder
            .build_store(dst, i64t.const_int(AsyncAction::Print.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(print_struct, buf, 1, "map_id")?;
        self.builder
            .build_store(dst, i64t.const_int(info.id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // top and div as given, the rest zero-filled
        let mut arg_idx = 1;
        while arg_idx < call.args.len() {
            let result = self.compile_expr(&call.args[arg_idx])?;
            let value = self.as_int(&result)?;
            let value = self.cast_int(value, 64, false, "print_arg")?;
            self.release(result)?;
            let dst =
                self.create_struct_gep(print_struct, buf, (arg_idx + 1) as u32, "print_arg")?;
            self.builder
                .build_store(dst, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            arg_idx += 1;
        }
        while arg_idx < 3 {
            let dst =
                self.create_struct_gep(print_struct, buf, (arg_idx + 1) as u32, "print_zero")?;
            self.builder
                .build_store(dst, i64t.const_zero())
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            arg_idx += 1;
        }

        let size = self.struct_size(print_struct);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(ExprResult::none())
    }

    fn compile_print_non_map(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let arg = &call.args[0];
        let result = self.compile_expr(arg)?;

        let i64t = self.context.i64_type();
        let content_ty = self.context.i8_type().array_type(arg.ty().size as u32);
        let print_struct = self
            .context
            .struct_type(&[i64t.into(), i64t.into(), content_ty.into()], false);
        let buf = self.create_alloca(print_struct.into(), "print_non_map")?;
        let struct_size = self.struct_size(print_struct);

        let dst = self.create_struct_gep(print_struct, buf, 0, "action")?;
        self.builder
            .build_store(dst, i64t.const_int(AsyncAction::PrintNonMap.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(print_struct, buf, 1, "print_id")?;
        self.builder
            .build_store(dst, i64t.const_int(self.non_map_print_id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let content = self.create_struct_gep(print_struct, buf, 2, "content")?;
        self.create_memset(content, 0, arg.ty().size)?;
        if arg.ty().needs_memcpy() {
            let src = self.as_stack(&result)?;
            self.create_memcpy(content, src, arg.ty().size)?;
        } else {
            let value = self.as_int(&result)?;
            self.builder
                .build_store(content, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        self.release(result)?;

        self.non_map_print_id += 1;
        self.create_perf_event_output(buf, struct_size)?;
        self.create_lifetime_end(buf)?;
        Ok(ExprResult::none())
    }

    fn compile_map_event(&mut self, call: &Call, action: AsyncAction) -> Result<ExprResult<'ctx>> {
        let map = match &call.args[0] {
            Expression::Map(map) => map.clone(),
            _ => {
                return Err(CodeGenError::InternalBug(
                    "map event without map argument".to_string(),
                ))
            }
        };
        let info = self.map_info(&map.ident)?;
        let i64t = self.context.i64_type();
        let event_struct = self.context.struct_type(&[i64t.into(), i64t.into()], false);
        let buf = self.create_alloca(event_struct.into(), &format!("{}_{}", call.func, map.ident))?;

        let dst = self.create_struct_gep(event_struct, buf, 0, "action")?;
        self.builder
            .build_store(dst, i64t.const_int(action.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(event_struct, buf, 1, "map_id")?;
        self.builder
            .build_store(dst, i64t.const_int(info.id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let size = self.struct_size(event_struct);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(ExprResult::none())
    }

    fn compile_time(&mut self) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let time_struct = self.context.struct_type(&[i64t.into(), i64t.into()], false);
        let buf = self.create_alloca(time_struct.into(), "time_t")?;

        let dst = self.create_struct_gep(time_struct, buf, 0, "action")?;
        self.builder
            .build_store(dst, i64t.const_int(AsyncAction::Time.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(time_struct, buf, 1, "fmt_id")?;
        self.builder
            .build_store(dst, i64t.const_int(self.time_id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.time_id += 1;

        let size = self.struct_size(time_struct);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(ExprResult::none())
    }

    fn compile_strftime(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let strftime_struct = self
            .context
            .struct_type(&[i64t.into(), i64t.into(), i64t.into()], false);
        let buf = self.create_alloca(strftime_struct.into(), "strftime_args")?;

        let dst = self.create_struct_gep(strftime_struct, buf, 0, "action")?;
        self.builder
            .build_store(dst, i64t.const_int(AsyncAction::Strftime.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_struct_gep(strftime_struct, buf, 1, "fmt_id")?;
        self.builder
            .build_store(dst, i64t.const_int(self.strftime_id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.strftime_id += 1;

        let ts_arg = &call.args[1];
        let ts_result = self.compile_expr(ts_arg)?;
        let ts = self.as_int(&ts_result)?;
        let ts = self.cast_int(ts, 64, ts_arg.ty().is_signed(), "ts")?;
        self.release(ts_result)?;
        let dst = self.create_struct_gep(strftime_struct, buf, 2, "ts")?;
        self.builder
            .build_store(dst, ts)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let size = self.struct_size(strftime_struct);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(ExprResult::none())
    }

    /// join() fills the runtime's per-CPU scratch buffer with up to
    /// `join_argnum` NUL-terminated strings read from the argv-style
    /// pointer array, then emits the whole record.
    fn compile_join(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let i32t = self.context.i32_type();
        let argnum = u64::from(self.metadata.join_argnum);
        let argsize = u64::from(self.metadata.join_argsize);

        let arg0 = &call.args[0];
        let argv_result = self.compile_expr(arg0)?;
        let argv = self.as_int(&argv_result)?;
        let addr_space = arg0.ty().addr_space;

        let first = self.create_alloca(i64t.into(), "join_first")?;
        let second = self.create_alloca(i64t.into(), "join_second")?;

        let join_map = self
            .metadata
            .join_map
            .clone()
            .ok_or_else(|| CodeGenError::InternalBug("no join map".to_string()))?;
        let key = self.create_alloca(i32t.into(), "join_key")?;
        self.builder
            .build_store(key, i32t.const_zero())
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let perfdata = self.create_map_lookup_raw(join_map.fd, key, "join_scratch")?;
        self.create_lifetime_end(key)?;

        let parent = self.current_function()?;
        let notzero_block = self.context.append_basic_block(parent, "joinnotzero");
        let zero_block = self.context.append_basic_block(parent, "joinzero");
        let have_buf = self
            .builder
            .build_is_not_null(perfdata, "joinzerocond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(have_buf, notzero_block, zero_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(notzero_block);
        self.builder
            .build_store(perfdata, i64t.const_int(AsyncAction::Join.id(), false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let id_ptr = self.create_byte_gep(perfdata, 8, "join_id")?;
        self.builder
            .build_store(id_ptr, i64t.const_int(self.join_id, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.join_id += 1;

        // argv[0]
        let arr = self.create_alloca(i64t.into(), "join_r0")?;
        self.create_probe_read_const(arr, 8, argv, addr_space)?;
        let elem = self
            .builder
            .build_load(i64t, arr, "join_elem0")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let dst = self.create_byte_gep(perfdata, 16, "join_arg0")?;
        let argsize_val = i64t.const_int(argsize, false);
        self.create_probe_read_str(dst, argsize_val, elem, addr_space)?;
        self.create_lifetime_end(arr)?;

        for i in 1..argnum {
            let elem_addr = self
                .builder
                .build_int_add(argv, i64t.const_int(8 * i, false), "join_argp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(first, elem_addr)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let ptr = self
                .builder
                .build_load(i64t, first, "join_argp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.create_probe_read_const(second, 8, ptr, addr_space)?;
            let elem = self
                .builder
                .build_load(i64t, second, "join_elem")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let dst = self.create_byte_gep(perfdata, 16 + i * argsize, "join_arg")?;
            self.create_probe_read_str(dst, argsize_val, elem, addr_space)?;
        }

        self.create_perf_event_output(perfdata, 16 + argnum * argsize)?;
        self.builder
            .build_unconditional_branch(zero_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(zero_block);
        self.create_lifetime_end(first)?;
        self.create_lifetime_end(second)?;
        self.release(argv_result)?;
        Ok(ExprResult::none())
    }

    fn compile_ntop(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let inet_struct = self.context.struct_type(
            &[i64t.into(), self.context.i8_type().array_type(16).into()],
            false,
        );
        let buf = self.create_alloca(inet_struct.into(), "inet")?;

        let (af_type, addr_arg): (IntValue<'ctx>, &Expression) = if call.args.len() == 1 {
            let arg = &call.args[0];
            let af = if arg.ty().is_integer() || arg.ty().size == 4 {
                AF_INET
            } else {
                AF_INET6
            };
            (i64t.const_int(af, false), arg)
        } else {
            let af_result = self.compile_expr(&call.args[0])?;
            let af = self.as_int(&af_result)?;
            let af = self.cast_int(af, 64, true, "af_type")?;
            self.release(af_result)?;
            (af, &call.args[1])
        };

        let af_ptr = self.create_struct_gep(inet_struct, buf, 0, "af_type")?;
        self.builder
            .build_store(af_ptr, af_type)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let data_ptr = self.create_struct_gep(inet_struct, buf, 1, "inet_addr")?;
        self.create_memset(data_ptr, 0, 16)?;

        let addr_result = self.compile_expr(addr_arg)?;
        if addr_arg.ty().is_array() {
            let src = self.value_addr(&addr_result)?;
            self.create_probe_read_const(data_ptr, addr_arg.ty().size, src, addr_arg.ty().addr_space)?;
        } else {
            let value = self.as_int(&addr_result)?;
            let value = self.cast_int(value, 32, false, "inet4")?;
            self.builder
                .build_store(data_ptr, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        self.release(addr_result)?;
        Ok(ExprResult::owned(buf))
    }

    fn compile_signal(&mut self, call: &Call) -> Result<ExprResult<'ctx>> {
        let arg = &call.args[0];
        if let Expression::String(lit) = arg {
            let signum = signal_name_to_num(&lit.value).ok_or_else(|| {
                CodeGenError::InternalBug(format!("invalid signal \"{}\"", lit.value))
            })?;
            let value = self.context.i32_type().const_int(u64::from(signum), false);
            self.create_signal(value)?;
            return Ok(ExprResult::none());
        }
        let result = self.compile_expr(arg)?;
        let value = self.as_int(&result)?;
        self.release(result)?;
        let value = self.cast_int(value, 32, arg.ty().is_signed(), "sig")?;
        self.create_signal(value)?;
        Ok(ExprResult::none())
    }

}

fn literal_string(call: &Call, index: usize) -> Result<String> {
    match call.args.get(index) {
        Some(Expression::String(lit)) => Ok(lit.value.clone()),
        _ => Err(CodeGenError::InternalBug(format!(
            "{} expects a string literal argument",
            call.func
        ))),
    }
}

/// Signal names with or without the SIG prefix, plus plain numbers.
fn signal_name_to_num(name: &str) -> Option<u8> {
    let bare = name.strip_prefix("SIG").unwrap_or(name);
    let num = match bare {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "STKFLT" => 16,
        "CHLD" => 17,
        "CONT" => 18,
        "STOP" => 19,
        "TSTP" => 20,
        "TTIN" => 21,
        "TTOU" => 22,
        "URG" => 23,
        "XCPU" => 24,
        "XFSZ" => 25,
        "VTALRM" => 26,
        "PROF" => 27,
        "WINCH" => 28,
        "IO" => 29,
        "PWR" => 30,
        "SYS" => 31,
        other => return other.parse().ok().filter(|n| (1..=64).contains(n)),
    };
    Some(num)
}

#[cfg(test)]
mod tests {
    use super::signal_name_to_num;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name_to_num("KILL"), Some(9));
        assert_eq!(signal_name_to_num("SIGKILL"), Some(9));
        assert_eq!(signal_name_to_num("SIGUSR1"), Some(10));
        assert_eq!(signal_name_to_num("9"), Some(9));
        assert_eq!(signal_name_to_num("NOPE"), None);
        assert_eq!(signal_name_to_num("0"), None);
    }
}
