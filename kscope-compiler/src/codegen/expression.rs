//! Expression lowering
//!
//! Recursive descent over the typed AST. Every arm returns an
//! [`ExprResult`]: integers (and external pointers) travel as 64-bit
//! register values, composites as stack pointers with a deferred-release
//! slot the consumer must settle.

use super::context::{CodeGen, CodeGenError, ExprResult, ExprValue, Result};
use crate::ast::{
    Accessor, ArrayAccess, BinaryOp, Binop, Builtin, Cast, Expression, FieldAccess,
    PositionalKind, PositionalParameter, ProbeType, Ternary, TupleExpr, UnaryOp, Unop,
};
use crate::types::{AddrSpace, SizedType};
use inkwell::values::IntValue;
use inkwell::IntPredicate;
use tracing::debug;

/// Numeric positional parameters lower to integer constants.
fn parse_numeric(s: &str) -> Option<i64> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    i64::from_str_radix(digits, radix).ok()
}

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    pub(crate) fn compile_expr(&mut self, expr: &Expression) -> Result<ExprResult<'ctx>> {
        match expr {
            Expression::Integer(n) => {
                let value = self.context.i64_type().const_int(n.value as u64, false);
                Ok(ExprResult::int(value))
            }
            Expression::String(s) => {
                // NUL-extend the literal to the declared string size
                let mut bytes = s.value.clone().into_bytes();
                bytes.truncate(s.ty.size.saturating_sub(1) as usize);
                bytes.resize(s.ty.size as usize, 0);
                let const_str = self.context.const_string(&bytes, false);
                let buf = self.create_alloca_for(&s.ty, "str")?;
                self.builder
                    .build_store(buf, const_str)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::owned(buf))
            }
            Expression::PositionalParameter(param) => self.compile_positional(param),
            Expression::Identifier(ident) => match self.metadata.enums.get(&ident.name) {
                Some(value) => Ok(ExprResult::int(
                    self.context.i64_type().const_int(*value as u64, false),
                )),
                None => Err(CodeGenError::UnknownIdentifier(ident.name.clone())),
            },
            Expression::Builtin(builtin) => self.compile_builtin(builtin),
            Expression::Call(call) => self.compile_call(call),
            Expression::Map(map) => {
                let key = self.compile_map_key(map)?;
                let info = self.map_info(&map.ident)?;
                let result = self.create_map_lookup(&info, key, &map.ident)?;
                self.create_lifetime_end(key)?;
                Ok(result)
            }
            Expression::Variable(var) => {
                let slot = *self.variables.get(&var.ident).ok_or_else(|| {
                    CodeGenError::InternalBug(format!("undeclared variable ${}", var.ident))
                })?;
                if var.ty.needs_memcpy() {
                    Ok(ExprResult::stack(slot))
                } else {
                    let value = self
                        .builder
                        .build_load(self.llvm_type(&var.ty), slot, &var.ident)
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?
                        .into_int_value();
                    Ok(ExprResult::int(value))
                }
            }
            Expression::Binop(binop) => self.compile_binop(binop),
            Expression::Unop(unop) => self.compile_unop(unop),
            Expression::Ternary(ternary) => self.compile_ternary(ternary),
            Expression::FieldAccess(acc) => self.compile_field_access(acc),
            Expression::ArrayAccess(arr) => self.compile_array_access(arr),
            Expression::Cast(cast) => self.compile_cast(cast),
            Expression::Tuple(tuple) => self.compile_tuple(tuple),
        }
    }

    fn compile_positional(&mut self, param: &PositionalParameter) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        match param.kind {
            PositionalKind::Positional(n) => {
                let text = self.metadata.get_param(n, param.is_in_str);
                if let Some(value) = parse_numeric(&text) {
                    return Ok(ExprResult::int(i64t.const_int(value as u64, false)));
                }
                let len = text.len() as u64 + 1;
                let buf = self.create_alloca_bytes(len, "str")?;
                self.create_memset(buf, 0, len)?;
                let const_str = self.context.const_string(text.as_bytes(), true);
                self.builder
                    .build_store(buf, const_str)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::owned(buf))
            }
            PositionalKind::Count => Ok(ExprResult::int(
                i64t.const_int(self.metadata.num_params() as u64, false),
            )),
        }
    }

    fn compile_builtin(&mut self, builtin: &Builtin) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        debug!("lowering builtin {}", builtin.ident);
        match builtin.ident.as_str() {
            "nsecs" => Ok(ExprResult::int(self.create_get_ns()?)),
            "elapsed" => {
                let key = self.create_alloca(i64t.into(), "elapsed_key")?;
                self.builder
                    .build_store(key, i64t.const_zero())
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let map = self
                    .metadata
                    .elapsed_map
                    .clone()
                    .ok_or_else(|| CodeGenError::InternalBug("no elapsed map".to_string()))?;
                let start_result = self.create_map_lookup(&map, key, "elapsed_start")?;
                let start = self.as_int(&start_result)?;
                let now = self.create_get_ns()?;
                let elapsed = self
                    .builder
                    .build_int_sub(now, start, "elapsed")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.create_lifetime_end(key)?;
                Ok(ExprResult::int(elapsed))
            }
            "kstack" | "ustack" => {
                let user = builtin.ident == "ustack";
                let stack_type = builtin.ty.stack_type.unwrap_or_default();
                let mut stackid = self.create_get_stack_id(user, stack_type)?;
                if user {
                    // user stacks are pid-qualified because of ASLR
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
            "pid" => {
                let pid_tgid = self.create_get_pid_tgid()?;
                let pid = self
                    .builder
                    .build_right_shift(pid_tgid, i64t.const_int(32, false), false, "pid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(pid))
            }
            "tid" => {
                let pid_tgid = self.create_get_pid_tgid()?;
                let tid = self
                    .builder
                    .build_and(pid_tgid, i64t.const_int(0xffff_ffff, false), "tid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(tid))
            }
            "cgroup" => Ok(ExprResult::int(self.create_get_cgroup_id()?)),
            "uid" | "username" => {
                let uid_gid = self.create_get_uid_gid()?;
                let uid = self
                    .builder
                    .build_and(uid_gid, i64t.const_int(0xffff_ffff, false), "uid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(uid))
            }
            "gid" => {
                let uid_gid = self.create_get_uid_gid()?;
                let gid = self
                    .builder
                    .build_right_shift(uid_gid, i64t.const_int(32, false), false, "gid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(gid))
            }
            "cpu" => Ok(ExprResult::int(self.create_get_cpu_id()?)),
            "curtask" => Ok(ExprResult::int(self.create_get_current_task()?)),
            "rand" => Ok(ExprResult::int(self.create_get_random()?)),
            "comm" => {
                let buf = self.create_alloca_for(&builtin.ty, "comm")?;
                // zero so short names stay NUL-padded on older kernels
                self.create_memset(buf, 0, builtin.ty.size)?;
                self.create_get_current_comm(buf, builtin.ty.size)?;
                Ok(ExprResult::owned(buf))
            }
            ident if is_arg_builtin(ident) || ident == "retval" || ident == "func" => {
                if builtin.ty.is_kfarg {
                    let slot = builtin.kfarg_index.ok_or_else(|| {
                        CodeGenError::InternalBug(format!("no kfunc slot for {ident}"))
                    })?;
                    return Ok(ExprResult::int(self.create_ctx_load(slot, ident)?));
                }
                let offset = if ident == "retval" {
                    kscope_platform::ret_offset()
                } else if ident == "func" {
                    kscope_platform::pc_offset()
                } else {
                    let arg_num: usize = ident[3..]
                        .parse()
                        .map_err(|_| CodeGenError::UnknownBuiltin(ident.to_string()))?;
                    let is_usdt = self
                        .current_attach_point
                        .as_ref()
                        .map(|ap| ap.probe_type() == ProbeType::Usdt)
                        .unwrap_or(false);
                    if is_usdt {
                        return self.compile_usdt_arg(arg_num, ident);
                    }
                    kscope_platform::arg_offset(arg_num).ok_or_else(|| {
                        CodeGenError::InternalBug(format!("{ident} beyond register arguments"))
                    })?
                };
                let value = self.create_ctx_load(offset as u64, ident)?;
                if builtin.ty.is_usym() {
                    self.create_usym(value)
                } else {
                    Ok(ExprResult::int(value))
                }
            }
            ident if is_sarg_builtin(ident) => {
                let arg_num: usize = ident[4..]
                    .parse()
                    .map_err(|_| CodeGenError::UnknownBuiltin(ident.to_string()))?;
                let sp = self.create_ctx_load(kscope_platform::sp_offset() as u64, "reg_sp")?;
                let dst = self.create_alloca_for(&builtin.ty, ident)?;
                let slot_offset =
                    ((arg_num + kscope_platform::arg_stack_offset()) * 8) as u64;
                let src = self
                    .builder
                    .build_int_add(sp, i64t.const_int(slot_offset, false), "sarg_addr")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.create_probe_read_const(dst, 8, src, builtin.ty.addr_space)?;
                let value = self
                    .builder
                    .build_load(i64t, dst, ident)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                Ok(ExprResult::int(value))
            }
            "probe" => {
                let name = self.probefull.clone();
                let id = self.metadata.probe_id(&name);
                Ok(ExprResult::int(i64t.const_int(id, false)))
            }
            "args" | "ctx" => {
                let ctx = self.ctx_ptr()?;
                let as_int = self
                    .builder
                    .build_ptr_to_int(ctx, i64t, "ctx")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(as_int))
            }
            "cpid" => {
                let cpid = self.metadata.child_pid.ok_or_else(|| {
                    CodeGenError::InternalBug("no child process for cpid".to_string())
                })?;
                Ok(ExprResult::int(i64t.const_int(u64::from(cpid), false)))
            }
            other => Err(CodeGenError::UnknownBuiltin(other.to_string())),
        }
    }

    /// USDT arguments go through the per-location argument encodings the
    /// resolver attached to the probe.
    fn compile_usdt_arg(&mut self, arg_num: usize, name: &str) -> Result<ExprResult<'ctx>> {
        use crate::metadata::UsdtArg;

        let ap = self
            .current_attach_point
            .clone()
            .ok_or_else(|| CodeGenError::InternalBug("no current attach point".to_string()))?;
        let usdt = ap
            .usdt
            .as_ref()
            .ok_or_else(|| CodeGenError::InternalBug("missing usdt metadata".to_string()))?;
        let location = usdt
            .locations
            .get(self.current_usdt_location_index)
            .ok_or_else(|| {
                CodeGenError::InternalBug(format!(
                    "usdt location {} out of range",
                    self.current_usdt_location_index
                ))
            })?;
        let arg = location.args.get(arg_num).ok_or_else(|| {
            CodeGenError::InternalBug(format!("usdt probe has no argument {arg_num}"))
        })?;

        let i64t = self.context.i64_type();
        match arg.clone() {
            UsdtArg::Constant(value) => {
                Ok(ExprResult::int(i64t.const_int(value as u64, false)))
            }
            UsdtArg::Register(reg) => {
                let offset = kscope_platform::register_offset(&reg).ok_or_else(|| {
                    CodeGenError::InternalBug(format!("unknown usdt register {reg}"))
                })?;
                Ok(ExprResult::int(self.create_ctx_load(offset as u64, name)?))
            }
            UsdtArg::Memory { register, offset } => {
                let reg_offset = kscope_platform::register_offset(&register).ok_or_else(|| {
                    CodeGenError::InternalBug(format!("unknown usdt register {register}"))
                })?;
                let base = self.create_ctx_load(reg_offset as u64, name)?;
                let addr = self
                    .builder
                    .build_int_add(base, i64t.const_int(offset as u64, false), "usdt_addr")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let dst = self.create_alloca(i64t.into(), name)?;
                self.create_probe_read_const(dst, 8, addr, AddrSpace::User)?;
                let value = self
                    .builder
                    .build_load(i64t, dst, name)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                Ok(ExprResult::int(value))
            }
        }
    }

    fn compile_binop(&mut self, binop: &Binop) -> Result<ExprResult<'ctx>> {
        if binop.op == BinaryOp::Land {
            return self.compile_logical_and(binop);
        }
        if binop.op == BinaryOp::Lor {
            return self.compile_logical_or(binop);
        }

        let left_ty = binop.left.ty().clone();
        let value = if left_ty.is_string() {
            self.compile_string_binop(binop)?
        } else if left_ty.is_buffer() {
            self.compile_buffer_binop(binop)?
        } else {
            self.compile_integer_binop(binop)?
        };
        // zero-extend so comparison bits don't read back as -1
        let value = self.cast_int(value, 64, false, "binop")?;
        Ok(ExprResult::int(value))
    }

    fn compile_string_binop(&mut self, binop: &Binop) -> Result<IntValue<'ctx>> {
        if binop.op != BinaryOp::Eq && binop.op != BinaryOp::Ne {
            return Err(CodeGenError::UnsupportedBinop(
                format!("{:?}", binop.op),
                "string".to_string(),
            ));
        }
        // strcmp-style: equality inverts the "differs" result
        let inverse = binop.op == BinaryOp::Eq;

        // A literal on either side is inlined into the comparison chain
        // instead of being materialized on the stack.
        if let Expression::String(lit) = &*binop.right {
            let operand = self.compile_expr(&binop.left)?;
            let n = lit.value.len() as u64 + 1;
            let result = self.create_strcmp(&operand.value, &lit.value, n, inverse)?;
            self.release(operand)?;
            return Ok(result);
        }
        if let Expression::String(lit) = &*binop.left {
            let operand = self.compile_expr(&binop.right)?;
            let n = lit.value.len() as u64 + 1;
            let result = self.create_strcmp(&operand.value, &lit.value, n, inverse)?;
            self.release(operand)?;
            return Ok(result);
        }

        let right = self.compile_expr(&binop.right)?;
        let left = self.compile_expr(&binop.left)?;
        let n = std::cmp::min(binop.left.ty().size, binop.right.ty().size) + 1;
        let result = self.create_strncmp(&left.value, &right.value, n, inverse)?;
        self.release(left)?;
        self.release(right)?;
        Ok(result)
    }

    fn compile_buffer_binop(&mut self, binop: &Binop) -> Result<IntValue<'ctx>> {
        if binop.op != BinaryOp::Eq && binop.op != BinaryOp::Ne {
            return Err(CodeGenError::UnsupportedBinop(
                format!("{:?}", binop.op),
                "buffer".to_string(),
            ));
        }
        let inverse = binop.op == BinaryOp::Eq;
        let right = self.compile_expr(&binop.right)?;
        let left = self.compile_expr(&binop.left)?;
        let n = std::cmp::min(binop.left.ty().size, binop.right.ty().size);
        let result = self.create_strncmp(&left.value, &right.value, n, inverse)?;
        self.release(left)?;
        self.release(right)?;
        Ok(result)
    }

    fn compile_integer_binop(&mut self, binop: &Binop) -> Result<IntValue<'ctx>> {
        let left_result = self.compile_expr(&binop.left)?;
        let lhs_raw = self.as_int(&left_result)?;
        let right_result = self.compile_expr(&binop.right)?;
        let rhs_raw = self.as_int(&right_result)?;

        let lsign = binop.left.ty().is_signed();
        let rsign = binop.right.ty().is_signed();
        let signed = lsign && rsign;
        let lhs = self.cast_int(lhs_raw, 64, lsign, "lhs")?;
        let rhs = self.cast_int(rhs_raw, 64, rsign, "rhs")?;

        let b = &self.builder;
        let map = |e: inkwell::builder::BuilderError| CodeGenError::Builder(e.to_string());
        let value = match binop.op {
            BinaryOp::Eq => b.build_int_compare(IntPredicate::EQ, lhs, rhs, "eq").map_err(map)?,
            BinaryOp::Ne => b.build_int_compare(IntPredicate::NE, lhs, rhs, "ne").map_err(map)?,
            BinaryOp::Le => {
                let p = if signed { IntPredicate::SLE } else { IntPredicate::ULE };
                b.build_int_compare(p, lhs, rhs, "le").map_err(map)?
            }
            BinaryOp::Ge => {
                let p = if signed { IntPredicate::SGE } else { IntPredicate::UGE };
                b.build_int_compare(p, lhs, rhs, "ge").map_err(map)?
            }
            BinaryOp::Lt => {
                let p = if signed { IntPredicate::SLT } else { IntPredicate::ULT };
                b.build_int_compare(p, lhs, rhs, "lt").map_err(map)?
            }
            BinaryOp::Gt => {
                let p = if signed { IntPredicate::SGT } else { IntPredicate::UGT };
                b.build_int_compare(p, lhs, rhs, "gt").map_err(map)?
            }
            BinaryOp::Shl => b.build_left_shift(lhs, rhs, "shl").map_err(map)?,
            BinaryOp::Shr => b.build_right_shift(lhs, rhs, false, "shr").map_err(map)?,
            BinaryOp::Add => b.build_int_add(lhs, rhs, "add").map_err(map)?,
            BinaryOp::Sub => b.build_int_sub(lhs, rhs, "sub").map_err(map)?,
            BinaryOp::Mul => b.build_int_mul(lhs, rhs, "mul").map_err(map)?,
            BinaryOp::Div => b.build_int_unsigned_div(lhs, rhs, "div").map_err(map)?,
            // the instruction set has no signed division; modulo is always
            // performed unsigned
            BinaryOp::Mod => b.build_int_unsigned_rem(lhs, rhs, "mod").map_err(map)?,
            BinaryOp::Band => b.build_and(lhs, rhs, "band").map_err(map)?,
            BinaryOp::Bor => b.build_or(lhs, rhs, "bor").map_err(map)?,
            BinaryOp::Bxor => b.build_xor(lhs, rhs, "bxor").map_err(map)?,
            BinaryOp::Land | BinaryOp::Lor => {
                return Err(CodeGenError::InternalBug(
                    "logical operators handled before dispatch".to_string(),
                ))
            }
        };
        self.release(left_result)?;
        self.release(right_result)?;
        Ok(value)
    }

    fn compile_logical_and(&mut self, binop: &Binop) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let parent = self.current_function()?;
        let lhs_true = self.context.append_basic_block(parent, "&&_lhs_true");
        let true_block = self.context.append_basic_block(parent, "&&_true");
        let false_block = self.context.append_basic_block(parent, "&&_false");
        let merge_block = self.context.append_basic_block(parent, "&&_merge");

        let result = self.create_alloca(i64t.into(), "&&_result")?;

        let left = self.compile_expr(&binop.left)?;
        let lhs = self.as_int(&left)?;
        self.release(left)?;
        let cond = self
            .builder
            .build_int_compare(IntPredicate::NE, lhs, lhs.get_type().const_zero(), "lhs_true_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cond, lhs_true, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lhs_true);
        let right = self.compile_expr(&binop.right)?;
        let rhs = self.as_int(&right)?;
        self.release(right)?;
        let cond = self
            .builder
            .build_int_compare(IntPredicate::NE, rhs, rhs.get_type().const_zero(), "rhs_true_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cond, true_block, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(true_block);
        self.builder
            .build_store(result, i64t.const_int(1, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(false_block);
        self.builder
            .build_store(result, i64t.const_zero())
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        let value = self
            .builder
            .build_load(i64t, result, "&&_result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(ExprResult::int(value))
    }

    fn compile_logical_or(&mut self, binop: &Binop) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        let parent = self.current_function()?;
        let lhs_false = self.context.append_basic_block(parent, "||_lhs_false");
        let false_block = self.context.append_basic_block(parent, "||_false");
        let true_block = self.context.append_basic_block(parent, "||_true");
        let merge_block = self.context.append_basic_block(parent, "||_merge");

        let result = self.create_alloca(i64t.into(), "||_result")?;

        let left = self.compile_expr(&binop.left)?;
        let lhs = self.as_int(&left)?;
        self.release(left)?;
        let cond = self
            .builder
            .build_int_compare(IntPredicate::NE, lhs, lhs.get_type().const_zero(), "lhs_true_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cond, true_block, lhs_false)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lhs_false);
        let right = self.compile_expr(&binop.right)?;
        let rhs = self.as_int(&right)?;
        self.release(right)?;
        let cond = self
            .builder
            .build_int_compare(IntPredicate::NE, rhs, rhs.get_type().const_zero(), "rhs_true_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cond, true_block, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(false_block);
        self.builder
            .build_store(result, i64t.const_zero())
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(true_block);
        self.builder
            .build_store(result, i64t.const_int(1, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        let value = self
            .builder
            .build_load(i64t, result, "||_result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(ExprResult::int(value))
    }

    fn compile_unop(&mut self, unop: &Unop) -> Result<ExprResult<'ctx>> {
        let operand_ty = unop.expr.ty().clone();
        let i64t = self.context.i64_type();

        if operand_ty.is_integer() {
            match unop.op {
                UnaryOp::LogicalNot => {
                    let operand = self.compile_expr(&unop.expr)?;
                    let value = self.as_int(&operand)?;
                    self.release(operand)?;
                    let is_zero = self
                        .builder
                        .build_int_compare(
                            IntPredicate::EQ,
                            value,
                            value.get_type().const_zero(),
                            "lnot",
                        )
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    // zero-extend: !0 must read as 1, not -1
                    let widened = self
                        .builder
                        .build_int_z_extend(is_zero, value.get_type(), "lnot_ext")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    Ok(ExprResult::int(widened))
                }
                UnaryOp::BitwiseNot => {
                    let operand = self.compile_expr(&unop.expr)?;
                    let value = self.as_int(&operand)?;
                    self.release(operand)?;
                    let flipped = self
                        .builder
                        .build_not(value, "bnot")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    Ok(ExprResult::int(flipped))
                }
                UnaryOp::Neg => {
                    let operand = self.compile_expr(&unop.expr)?;
                    let value = self.as_int(&operand)?;
                    self.release(operand)?;
                    let negated = self
                        .builder
                        .build_int_neg(value, "neg")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    Ok(ExprResult::int(negated))
                }
                UnaryOp::Increment | UnaryOp::Decrement => {
                    self.compile_step_op(unop, unop.op == UnaryOp::Increment)
                }
                UnaryOp::Deref => {
                    let operand = self.compile_expr(&unop.expr)?;
                    let addr = self.as_int(&operand)?;
                    self.release(operand)?;
                    self.compile_deref(addr, &operand_ty, operand_ty.size, operand_ty.is_signed())
                }
            }
        } else if operand_ty.is_pointer() {
            match unop.op {
                UnaryOp::Deref if unop.ty.is_integer() => {
                    let pointee = operand_ty
                        .pointee()
                        .cloned()
                        .ok_or_else(|| CodeGenError::InternalBug("pointer without pointee".to_string()))?;
                    let operand = self.compile_expr(&unop.expr)?;
                    let addr = self.as_int(&operand)?;
                    self.release(operand)?;
                    self.compile_deref(addr, &operand_ty, pointee.size, unop.ty.is_signed())
                }
                // address-taking casts pass straight through
                _ => self.compile_expr(&unop.expr),
            }
        } else {
            Err(CodeGenError::InternalBug(format!(
                "invalid type for unary operator {:?}",
                unop.op
            )))
        }
    }

    fn compile_deref(
        &mut self,
        addr: IntValue<'ctx>,
        src_ty: &SizedType,
        size: u64,
        signed: bool,
    ) -> Result<ExprResult<'ctx>> {
        let value_ty = self.context.custom_width_int_type(size as u32 * 8);
        let dst = self.create_alloca(value_ty.into(), "deref")?;
        self.create_probe_read_const(dst, size, addr, src_ty.addr_space)?;
        let loaded = self
            .builder
            .build_load(value_ty, dst, "deref")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let widened = self.cast_int(loaded, 64, signed, "deref_ext")?;
        self.create_lifetime_end(dst)?;
        Ok(ExprResult::int(widened))
    }

    /// `++`/`--` on map slots and variables: read-modify-write, with the
    /// pre/post distinction picking which value the expression yields.
    fn compile_step_op(&mut self, unop: &Unop, is_increment: bool) -> Result<ExprResult<'ctx>> {
        let i64t = self.context.i64_type();
        match &*unop.expr {
            Expression::Map(map) => {
                let info = self.map_info(&map.ident)?;
                let key = self.compile_map_key(map)?;
                let old_result = self.create_map_lookup(&info, key, &map.ident)?;
                let oldval = self.as_int(&old_result)?;
                let newval_slot = self.create_alloca(i64t.into(), &format!("{}_newval", map.ident))?;
                let one = i64t.const_int(1, false);
                let newval = if is_increment {
                    self.builder.build_int_add(oldval, one, "inc")
                } else {
                    self.builder.build_int_sub(oldval, one, "dec")
                }
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.builder
                    .build_store(newval_slot, newval)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.create_map_update(&info, key, newval_slot)?;
                self.create_lifetime_end(key)?;
                self.create_lifetime_end(newval_slot)?;
                Ok(ExprResult::int(if unop.is_post_op { oldval } else { newval }))
            }
            Expression::Variable(var) => {
                let slot = *self.variables.get(&var.ident).ok_or_else(|| {
                    CodeGenError::InternalBug(format!("undeclared variable ${}", var.ident))
                })?;
                let oldval = self
                    .builder
                    .build_load(i64t, slot, &var.ident)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                let one = i64t.const_int(1, false);
                let newval = if is_increment {
                    self.builder.build_int_add(oldval, one, "inc")
                } else {
                    self.builder.build_int_sub(oldval, one, "dec")
                }
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.builder
                    .build_store(slot, newval)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(ExprResult::int(if unop.is_post_op { oldval } else { newval }))
            }
            _ => Err(CodeGenError::InternalBug(
                "invalid expression passed to ++/--".to_string(),
            )),
        }
    }

    fn compile_ternary(&mut self, ternary: &Ternary) -> Result<ExprResult<'ctx>> {
        let parent = self.current_function()?;
        let left_block = self.context.append_basic_block(parent, "left");
        let right_block = self.context.append_basic_block(parent, "right");
        let done_block = self.context.append_basic_block(parent, "done");

        let cond_result = self.compile_expr(&ternary.cond)?;
        let cond = self.as_int(&cond_result)?;
        self.release(cond_result)?;
        let nonzero = self
            .builder
            .build_int_compare(IntPredicate::NE, cond, cond.get_type().const_zero(), "true_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(nonzero, left_block, right_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if ternary.ty.is_integer() {
            let value_ty = self.llvm_type(&ternary.ty);
            let result = self.create_alloca(value_ty, "result")?;
            let bits = ternary.ty.size as u32 * 8;

            self.builder.position_at_end(left_block);
            let left = self.compile_expr(&ternary.left)?;
            let v = self.as_int(&left)?;
            let v = self.cast_int(v, bits, ternary.ty.is_signed(), "ternary_l")?;
            self.builder
                .build_store(result, v)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.release(left)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(right_block);
            let right = self.compile_expr(&ternary.right)?;
            let v = self.as_int(&right)?;
            let v = self.cast_int(v, bits, ternary.ty.is_signed(), "ternary_r")?;
            self.builder
                .build_store(result, v)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.release(right)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(done_block);
            let value = self
                .builder
                .build_load(value_ty, result, "result")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.create_lifetime_end(result)?;
            Ok(ExprResult::int(value))
        } else if ternary.ty.is_string() {
            let buf = self.create_alloca_for(&ternary.ty, "buf")?;

            self.builder.position_at_end(left_block);
            let left = self.compile_expr(&ternary.left)?;
            let src = self.as_stack(&left)?;
            self.create_memcpy(buf, src, ternary.ty.size)?;
            self.release(left)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(right_block);
            let right = self.compile_expr(&ternary.right)?;
            let src = self.as_stack(&right)?;
            self.create_memcpy(buf, src, ternary.ty.size)?;
            self.release(right)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(done_block);
            Ok(ExprResult::owned(buf))
        } else {
            // value-less ternary: evaluate for effect only
            self.builder.position_at_end(left_block);
            let left = self.compile_expr(&ternary.left)?;
            self.release(left)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(right_block);
            let right = self.compile_expr(&ternary.right)?;
            self.release(right)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            self.builder.position_at_end(done_block);
            Ok(ExprResult::none())
        }
    }

    fn compile_field_access(&mut self, acc: &FieldAccess) -> Result<ExprResult<'ctx>> {
        let base_ty = acc.expr.ty().clone();

        if base_ty.is_kfarg {
            let slot = match &acc.accessor {
                Accessor::Index(i) => *i as u64,
                Accessor::Field(name) => {
                    let struct_name = base_ty
                        .record_name()
                        .ok_or_else(|| CodeGenError::InternalBug("kfunc args without record".to_string()))?;
                    let sdef = self
                        .metadata
                        .structs
                        .get(struct_name)
                        .ok_or_else(|| CodeGenError::InternalBug(format!("unknown struct {struct_name}")))?;
                    let field = sdef.field(name).ok_or_else(|| {
                        CodeGenError::InternalBug(format!("no field {name} in {struct_name}"))
                    })?;
                    field.offset / 8
                }
            };
            return Ok(ExprResult::int(self.create_ctx_load(slot, "kfarg")?));
        }

        if base_ty.is_tuple() {
            let index = match &acc.accessor {
                Accessor::Index(i) => *i,
                Accessor::Field(_) => {
                    return Err(CodeGenError::InternalBug(
                        "named access on tuple".to_string(),
                    ))
                }
            };
            let elems = base_ty
                .tuple_elems()
                .ok_or_else(|| CodeGenError::InternalBug("tuple without elements".to_string()))?
                .to_vec();
            let elem_ty = elems
                .get(index)
                .cloned()
                .ok_or_else(|| CodeGenError::InternalBug(format!("tuple index {index} out of range")))?;

            let mut base = self.compile_expr(&acc.expr)?;
            let struct_ty = self.llvm_type(&base_ty).into_struct_type();
            let base_ptr = self.as_stack(&base)?;
            let src = self.create_struct_gep(struct_ty, base_ptr, index as u32, "tuple_elem")?;
            if elem_ty.should_be_on_stack() {
                // keep the backing tuple alive while the element is used
                let temp = base.disarm();
                return Ok(ExprResult::stack(src).with_temp(temp));
            }
            let value = self
                .builder
                .build_load(self.llvm_type(&elem_ty), src, "tuple_elem")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.release(base)?;
            return Ok(ExprResult::int(value));
        }

        let field_name = match &acc.accessor {
            Accessor::Field(name) => name.clone(),
            Accessor::Index(_) => {
                return Err(CodeGenError::InternalBug(
                    "indexed access on record".to_string(),
                ))
            }
        };
        let struct_name = if base_ty.is_tparg {
            self.tracepoint_struct.clone()
        } else {
            base_ty
                .record_name()
                .ok_or_else(|| CodeGenError::InternalBug("field access on non-record".to_string()))?
                .to_string()
        };
        let field = self
            .metadata
            .structs
            .get(&struct_name)
            .and_then(|s| s.field(&field_name))
            .cloned()
            .ok_or_else(|| {
                CodeGenError::InternalBug(format!("no field {field_name} in {struct_name}"))
            })?;

        let mut base = self.compile_expr(&acc.expr)?;

        if base_ty.is_internal {
            // already in BPF memory (map value, tuple slot): plain offsets
            let base_ptr = self.as_stack(&base)?;
            let src = self.create_byte_gep(base_ptr, field.offset, "field")?;
            if field.ty.is_record() {
                let dst = self.create_alloca_for(
                    &field.ty,
                    &format!("internal_{struct_name}.{field_name}"),
                )?;
                self.create_memcpy(dst, src, field.ty.size)?;
                self.release(base)?;
                Ok(ExprResult::owned(dst))
            } else if field.ty.is_string() || field.ty.is_buffer() {
                let temp = base.disarm();
                Ok(ExprResult::stack(src).with_temp(temp))
            } else {
                let value = self
                    .builder
                    .build_load(self.llvm_type(&field.ty), src, &field_name)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.release(base)?;
                Ok(ExprResult::int(value))
            }
        } else {
            // base is an external (or context) pointer carried as an integer
            let base_addr = self.as_int(&base)?;
            let src = self
                .builder
                .build_int_add(
                    base_addr,
                    self.context.i64_type().const_int(field.offset, false),
                    "field_addr",
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;

            if field.ty.is_record() || field.ty.is_array() {
                // embedded aggregate: propagate the pointer, dereference
                // lazily at the next access
                let temp = base.disarm();
                return Ok(ExprResult::int(src).with_temp(temp));
            }

            if field.ty.is_string() || field.ty.is_buffer() {
                let dst =
                    self.create_alloca_for(&field.ty, &format!("{struct_name}.{field_name}"))?;
                if base_ty.is_ctx {
                    self.create_memcpy_volatile(dst, src, field.ty.size)?;
                } else {
                    self.create_probe_read_const(dst, field.ty.size, src, base_ty.addr_space)?;
                }
                self.release(base)?;
                return Ok(ExprResult::owned(dst));
            }

            if let (true, Some(bitfield)) = (field.ty.is_integer(), field.bitfield.clone()) {
                let raw = if base_ty.is_ctx {
                    self.create_ctx_load_at(self.llvm_type(&field.ty), src, &field_name)?
                        .into_int_value()
                } else {
                    let dst = self
                        .create_alloca_for(&field.ty, &format!("{struct_name}.{field_name}"))?;
                    // zeroed so the partial read leaves no uninitialized bits
                    self.create_memset(dst, 0, field.ty.size)?;
                    self.create_probe_read_const(dst, bitfield.read_bytes, src, base_ty.addr_space)?;
                    let raw = self
                        .builder
                        .build_load(self.llvm_type(&field.ty), dst, &field_name)
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?
                        .into_int_value();
                    self.create_lifetime_end(dst)?;
                    raw
                };
                let width = raw.get_type();
                let shifted = self
                    .builder
                    .build_right_shift(
                        raw,
                        width.const_int(bitfield.access_rshift, false),
                        false,
                        "bf_shift",
                    )
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let masked = self
                    .builder
                    .build_and(shifted, width.const_int(bitfield.mask, false), "bf_mask")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.release(base)?;
                return Ok(ExprResult::int(masked));
            }

            if (field.ty.is_integer() || field.ty.is_pointer()) && base_ty.is_ctx {
                let value = self
                    .create_ctx_load_at(self.llvm_type(&field.ty), src, &field_name)?
                    .into_int_value();
                let value = self.cast_int(value, 64, field.ty.is_signed(), &field_name)?;
                self.release(base)?;
                return Ok(ExprResult::int(value));
            }

            let dst = self.create_alloca_for(&field.ty, &format!("{struct_name}.{field_name}"))?;
            self.create_probe_read_const(dst, field.ty.size, src, base_ty.addr_space)?;
            let value = self
                .builder
                .build_load(self.llvm_type(&field.ty), dst, &field_name)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let value = self.cast_int(value, 64, field.ty.is_signed(), &field_name)?;
            self.create_lifetime_end(dst)?;
            self.release(base)?;
            Ok(ExprResult::int(value))
        }
    }

    fn compile_array_access(&mut self, arr: &ArrayAccess) -> Result<ExprResult<'ctx>> {
        let base_ty = arr.expr.ty().clone();
        let elem_ty = base_ty
            .element()
            .cloned()
            .ok_or_else(|| CodeGenError::InternalBug("indexing a non-array".to_string()))?;

        let base = self.compile_expr(&arr.expr)?;
        let array_addr = self.value_addr(&base)?;
        let index_result = self.compile_expr(&arr.index)?;
        let index = self.as_int(&index_result)?;

        let i64t = self.context.i64_type();
        let index = self.cast_int(index, 64, arr.index.ty().is_signed(), "index")?;
        let offset = self
            .builder
            .build_int_mul(index, i64t.const_int(elem_ty.size, false), "elem_offset")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let src = self
            .builder
            .build_int_add(array_addr, offset, "elem_addr")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.release(index_result)?;

        if elem_ty.is_integer() || elem_ty.is_pointer() {
            let value = if base_ty.is_ctx {
                self.create_ctx_load_at(self.llvm_type(&elem_ty), src, "array_access")?
                    .into_int_value()
            } else {
                let dst = self.create_alloca_for(&elem_ty, "array_access")?;
                self.create_probe_read_const(dst, elem_ty.size, src, base_ty.addr_space)?;
                let loaded = self
                    .builder
                    .build_load(self.llvm_type(&elem_ty), dst, "array_access")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                loaded
            };
            let value = self.cast_int(value, 64, elem_ty.is_signed(), "array_elem")?;
            self.release(base)?;
            Ok(ExprResult::int(value))
        } else {
            let dst = self.create_alloca_for(&elem_ty, "array_access")?;
            self.create_probe_read_const(dst, elem_ty.size, src, base_ty.addr_space)?;
            self.release(base)?;
            Ok(ExprResult::owned(dst))
        }
    }

    fn compile_cast(&mut self, cast: &Cast) -> Result<ExprResult<'ctx>> {
        let mut result = self.compile_expr(&cast.expr)?;
        if cast.ty.is_integer() {
            let value = self.as_int(&result)?;
            let bits = cast.ty.size as u32 * 8;
            let value = self.cast_int(value, bits, cast.ty.is_signed(), "cast")?;
            let temp = result.disarm();
            return Ok(ExprResult::int(value).with_temp(temp));
        }
        // pointer and record casts only re-type; no IR is emitted
        Ok(result)
    }

    fn compile_tuple(&mut self, tuple: &TupleExpr) -> Result<ExprResult<'ctx>> {
        let struct_ty = self.llvm_type(&tuple.ty).into_struct_type();
        let buf = self.create_alloca(struct_ty.into(), "tuple")?;
        for (i, elem) in tuple.elems.iter().enumerate() {
            let result = self.compile_expr(elem)?;
            let dst = self.create_struct_gep(struct_ty, buf, i as u32, "tuple_elem")?;
            if elem.ty().should_be_on_stack() {
                let src = self.as_stack(&result)?;
                self.create_memcpy(dst, src, elem.ty().size)?;
            } else {
                let value = self.as_int(&result)?;
                self.builder
                    .build_store(dst, value)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            self.release(result)?;
        }
        Ok(ExprResult::owned(buf))
    }

    pub(crate) fn map_info(&self, ident: &str) -> Result<crate::metadata::MapInfo> {
        self.metadata
            .maps
            .get(ident)
            .cloned()
            .ok_or_else(|| CodeGenError::InternalBug(format!("unregistered map @{ident}")))
    }
}

fn is_arg_builtin(ident: &str) -> bool {
    ident.len() == 4
        && ident.starts_with("arg")
        && ident.as_bytes()[3].is_ascii_digit()
}

fn is_sarg_builtin(ident: &str) -> bool {
    ident.len() == 5
        && ident.starts_with("sarg")
        && ident.as_bytes()[4].is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::parse_numeric;

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("42"), Some(42));
        assert_eq!(parse_numeric("-7"), Some(-7));
        assert_eq!(parse_numeric("0x10"), Some(16));
        assert_eq!(parse_numeric("/bin/sh"), None);
        assert_eq!(parse_numeric(""), None);
    }
}
