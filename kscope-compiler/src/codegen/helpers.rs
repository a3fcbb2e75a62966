//! Embedded histogram bucket functions
//!
//! `log2` and `linear` are synthesized into the module the first time a
//! hist/lhist call references them. Both are always-inline with fully
//! unrolled control flow so the verifier only ever sees straight-line code
//! after optimization.

use super::context::{CodeGen, CodeGenError, Result};
use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::module::Linkage;
use inkwell::values::FunctionValue;
use inkwell::IntPredicate;
use tracing::debug;

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    fn mark_helper(&self, func: FunctionValue<'ctx>) {
        let kind = Attribute::get_named_enum_kind_id("alwaysinline");
        func.add_attribute(AttributeLoc::Function, self.context.create_enum_attribute(kind, 0));
        func.set_section(Some("helpers"));
    }

    /// Bucket index for the power-of-two histogram. Index 0 holds values
    /// below zero, index 1 holds zero, and indexes from 2 up are the
    /// power-of-two buckets, found with an unrolled five-step binary
    /// search over bits 31..1.
    pub(crate) fn log2_function(&mut self) -> Result<FunctionValue<'ctx>> {
        if let Some(func) = self.log2_func {
            return Ok(func);
        }
        debug!("synthesizing log2 bucket function");
        let saved_block = self.builder.get_insert_block();

        let i64t = self.context.i64_type();
        let fn_type = i64t.fn_type(&[i64t.into()], false);
        let func = self
            .module
            .add_function("log2", fn_type, Some(Linkage::Internal));
        self.mark_helper(func);

        let entry = self.context.append_basic_block(func, "entry");
        self.builder.position_at_end(entry);

        let arg = func
            .get_first_param()
            .ok_or_else(|| CodeGenError::InternalBug("log2 has no parameter".to_string()))?
            .into_int_value();
        let n_alloc = self.create_alloca(i64t.into(), "n")?;
        self.builder
            .build_store(n_alloc, arg)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let result = self.create_alloca(i64t.into(), "result")?;
        self.builder
            .build_store(result, i64t.const_zero())
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // n < 0 lands in bucket 0
        let is_neg = self.context.append_basic_block(func, "hist.is_less_than_zero");
        let not_neg = self
            .context
            .append_basic_block(func, "hist.is_not_less_than_zero");
        let n = self
            .builder
            .build_load(i64t, n_alloc, "n")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::SLT, n, i64t.const_zero(), "cmp_neg")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, is_neg, not_neg)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder.position_at_end(is_neg);
        let r = self
            .builder
            .build_load(i64t, result, "result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // n == 0 lands in bucket 1
        self.builder.position_at_end(not_neg);
        let is_zero = self.context.append_basic_block(func, "hist.is_zero");
        let not_zero = self.context.append_basic_block(func, "hist.is_not_zero");
        let n = self
            .builder
            .build_load(i64t, n_alloc, "n")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::EQ, n, i64t.const_zero(), "cmp_zero")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, is_zero, not_zero)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder.position_at_end(is_zero);
        self.builder
            .build_store(result, i64t.const_int(1, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let r = self
            .builder
            .build_load(i64t, result, "result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // power-of-two index, offset by +2
        self.builder.position_at_end(not_zero);
        self.builder
            .build_store(result, i64t.const_int(2, false))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        for i in (0..5u32).rev() {
            let threshold = 1u64 << (1u32 << i);
            let n = self
                .builder
                .build_load(i64t, n_alloc, "n")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let ge = self
                .builder
                .build_int_compare(
                    IntPredicate::SGE,
                    n,
                    i64t.const_int(threshold, false),
                    "shift_cmp",
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let ge64 = self
                .builder
                .build_int_z_extend(ge, i64t, "shift_bit")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let shift = self
                .builder
                .build_left_shift(ge64, i64t.const_int(u64::from(i), false), "shift")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let shifted = self
                .builder
                .build_right_shift(n, shift, false, "n_shifted")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(n_alloc, shifted)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let r = self
                .builder
                .build_load(i64t, result, "result")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let r = self
                .builder
                .build_int_add(r, shift, "result_next")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(result, r)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        let r = self
            .builder
            .build_load(i64t, result, "result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let Some(block) = saved_block {
            self.builder.position_at_end(block);
        }
        self.log2_func = Some(func);
        Ok(func)
    }

    /// Bucket index for the linear histogram: 0 below the range,
    /// `1 + (max - min) / step` above it, `1 + (value - min) / step`
    /// inside. All arithmetic is unsigned.
    pub(crate) fn linear_function(&mut self) -> Result<FunctionValue<'ctx>> {
        if let Some(func) = self.linear_func {
            return Ok(func);
        }
        debug!("synthesizing linear bucket function");
        let saved_block = self.builder.get_insert_block();

        let i64t = self.context.i64_type();
        let fn_type = i64t.fn_type(
            &[i64t.into(), i64t.into(), i64t.into(), i64t.into()],
            false,
        );
        let func = self
            .module
            .add_function("linear", fn_type, Some(Linkage::Internal));
        self.mark_helper(func);

        let entry = self.context.append_basic_block(func, "entry");
        self.builder.position_at_end(entry);

        let params: Vec<_> = func.get_param_iter().map(|p| p.into_int_value()).collect();
        if params.len() != 4 {
            return Err(CodeGenError::InternalBug(
                "linear expects four parameters".to_string(),
            ));
        }
        let (value, min, max, step) = (params[0], params[1], params[2], params[3]);

        let lt_min = self.context.append_basic_block(func, "lhist.lt_min");
        let ge_min = self.context.append_basic_block(func, "lhist.ge_min");
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::ULT, value, min, "lt_min_cmp")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, lt_min, ge_min)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lt_min);
        self.builder
            .build_return(Some(&i64t.const_zero()))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(ge_min);
        let gt_max = self.context.append_basic_block(func, "lhist.gt_max");
        let le_max = self.context.append_basic_block(func, "lhist.le_max");
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::UGT, value, max, "gt_max_cmp")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, gt_max, le_max)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(gt_max);
        let range = self
            .builder
            .build_int_sub(max, min, "range")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let div = self
            .builder
            .build_int_unsigned_div(range, step, "range_div")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let bucket = self
            .builder
            .build_int_add(div, i64t.const_int(1, false), "overflow_bucket")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&bucket))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(le_max);
        let offset = self
            .builder
            .build_int_sub(value, min, "offset")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let div = self
            .builder
            .build_int_unsigned_div(offset, step, "offset_div")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let bucket = self
            .builder
            .build_int_add(div, i64t.const_int(1, false), "bucket")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&bucket))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let Some(block) = saved_block {
            self.builder.position_at_end(block);
        }
        self.linear_func = Some(func);
        Ok(func)
    }
}
