//! Statement lowering
//!
//! Control flow follows the shapes the verifier tolerates: explicit block
//! diamonds for if/else, a cond/body/end triple for while, lexical
//! replication for unroll, and an unreachable continuation block after any
//! unconditional jump so trailing siblings keep a legal insertion point.

use super::context::{CodeGen, CodeGenError, Result};
use crate::ast::{Expression, JumpKind, MapAccess, Statement, Variable};
use inkwell::IntPredicate;
use tracing::debug;

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    pub(crate) fn compile_statement(&mut self, stmt: &Statement) -> Result<()> {
        match stmt {
            Statement::Expr(expr) => {
                let result = self.compile_expr(expr)?;
                self.release(result)
            }
            Statement::AssignVar { var, expr } => self.compile_assign_var(var, expr),
            Statement::AssignMap { map, expr } => self.compile_assign_map(map, expr),
            Statement::If {
                cond,
                stmts,
                else_stmts,
            } => self.compile_if(cond, stmts, else_stmts.as_deref()),
            Statement::While { cond, stmts } => self.compile_while(cond, stmts),
            Statement::Unroll { count, stmts } => {
                for _ in 0..*count {
                    for stmt in stmts {
                        self.compile_statement(stmt)?;
                    }
                }
                Ok(())
            }
            Statement::Jump(kind) => self.compile_jump(*kind),
        }
    }

    fn compile_assign_var(&mut self, var: &Variable, expr: &Expression) -> Result<()> {
        debug!("assigning ${}", var.ident);
        let result = self.compile_expr(expr)?;

        // first write declares the slot, sized to the variable's type
        if !self.variables.contains_key(&var.ident) {
            let slot = self.create_alloca_init(&var.ty, &var.ident)?;
            self.variables.insert(var.ident.clone(), slot);
        }
        let slot = self.variables[&var.ident];

        if var.ty.needs_memcpy() {
            let src = self.as_stack(&result)?;
            self.create_memcpy(slot, src, var.ty.size)?;
        } else {
            let value = self.as_int(&result)?;
            let bits = var.ty.size as u32 * 8;
            let value = self.cast_int(value, bits, var.ty.is_signed(), &var.ident)?;
            self.builder
                .build_store(slot, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        self.release(result)
    }

    fn compile_assign_map(&mut self, map: &MapAccess, expr: &Expression) -> Result<()> {
        let result = self.compile_expr(expr)?;
        // aggregation calls write the map themselves
        if result.is_none() {
            return Ok(());
        }

        let info = self.map_info(&map.ident)?;
        let key = self.compile_map_key(map)?;
        let expr_ty = expr.ty();

        let (value_ptr, self_alloca) = if expr_ty.should_be_on_stack() {
            (self.as_stack(&result)?, false)
        } else if map.ty.is_record() {
            if expr_ty.is_internal {
                (self.as_stack(&result)?, false)
            } else {
                // the RHS is an external pointer: pull the record in before
                // handing it to the map
                let dst = self.create_alloca_for(&map.ty, &format!("{}_val", map.ident))?;
                let src = self.as_int(&result)?;
                self.create_probe_read_const(dst, map.ty.size, src, expr_ty.addr_space)?;
                (dst, true)
            }
        } else if map.ty.is_pointer() {
            let dst = self.create_alloca_for(&map.ty, &format!("{}_ptr", map.ident))?;
            let value = self.as_int(&result)?;
            self.builder
                .build_store(dst, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            (dst, true)
        } else {
            // integer values are widened to the fixed 64-bit map cell
            let value = self.as_int(&result)?;
            let value = self.cast_int(value, 64, map.ty.is_signed(), "map_val")?;
            let dst = self
                .create_alloca(self.context.i64_type().into(), &format!("{}_val", map.ident))?;
            self.builder
                .build_store(dst, value)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            (dst, true)
        };

        self.create_map_update(&info, key, value_ptr)?;
        self.create_lifetime_end(key)?;
        if self_alloca {
            self.create_lifetime_end(value_ptr)?;
        }
        self.release(result)
    }

    fn compile_if(
        &mut self,
        cond: &Expression,
        stmts: &[Statement],
        else_stmts: Option<&[Statement]>,
    ) -> Result<()> {
        let parent = self.current_function()?;
        let if_true = self.context.append_basic_block(parent, "if_body");
        let if_end = self.context.append_basic_block(parent, "if_end");
        // empty blocks are not allowed, so the else block only exists when
        // there is an else body
        let if_else = else_stmts.map(|_| self.context.append_basic_block(parent, "else_body"));

        let cond_result = self.compile_expr(cond)?;
        let cond_value = self.as_int(&cond_result)?;
        self.release(cond_result)?;
        let nonzero = self
            .builder
            .build_int_compare(
                IntPredicate::NE,
                cond_value,
                cond_value.get_type().const_zero(),
                "true_cond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder
            .build_conditional_branch(nonzero, if_true, if_else.unwrap_or(if_end))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(if_true);
        for stmt in stmts {
            self.compile_statement(stmt)?;
        }
        self.builder
            .build_unconditional_branch(if_end)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let (Some(block), Some(body)) = (if_else, else_stmts) {
            self.builder.position_at_end(block);
            for stmt in body {
                self.compile_statement(stmt)?;
            }
            self.builder
                .build_unconditional_branch(if_end)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }

        self.builder.position_at_end(if_end);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expression, stmts: &[Statement]) -> Result<()> {
        let parent = self.current_function()?;
        let while_cond = self.context.append_basic_block(parent, "while_cond");
        let while_body = self.context.append_basic_block(parent, "while_body");
        let while_end = self.context.append_basic_block(parent, "while_end");

        self.loops.push((while_cond, while_end));

        self.builder
            .build_unconditional_branch(while_cond)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_cond);
        let cond_result = self.compile_expr(cond)?;
        let cond_value = self.as_int(&cond_result)?;
        self.release(cond_result)?;
        let nonzero = self
            .builder
            .build_int_compare(
                IntPredicate::NE,
                cond_value,
                cond_value.get_type().const_zero(),
                "true_cond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(nonzero, while_body, while_end)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_body);
        for stmt in stmts {
            self.compile_statement(stmt)?;
        }
        self.builder
            .build_unconditional_branch(while_cond)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_end);
        self.loops.pop();
        Ok(())
    }

    fn compile_jump(&mut self, kind: JumpKind) -> Result<()> {
        match kind {
            JumpKind::Return => {
                self.builder
                    .build_return(Some(&self.context.i64_type().const_zero()))
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            JumpKind::Break => {
                let (_, break_target) = *self.loops.last().ok_or_else(|| {
                    CodeGenError::InternalBug("break outside of a loop".to_string())
                })?;
                self.builder
                    .build_unconditional_branch(break_target)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            JumpKind::Continue => {
                let (continue_target, _) = *self.loops.last().ok_or_else(|| {
                    CodeGenError::InternalBug("continue outside of a loop".to_string())
                })?;
                self.builder
                    .build_unconditional_branch(continue_target)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
        }

        // trailing sibling statements land in a block the optimizer drops
        let parent = self.current_function()?;
        let unreach = self.context.append_basic_block(parent, "unreach");
        self.builder.position_at_end(unreach);
        Ok(())
    }

    /// Probe predicate: a zero result returns before the body runs.
    pub(crate) fn compile_predicate(&mut self, pred: &Expression) -> Result<()> {
        let parent = self.current_function()?;
        let pred_false = self.context.append_basic_block(parent, "pred_false");
        let pred_true = self.context.append_basic_block(parent, "pred_true");

        let result = self.compile_expr(pred)?;
        let value = self.as_int(&result)?;
        self.release(result)?;
        // unop casts are allowed in predicates; widen without sign
        let value = self.cast_int(value, 64, false, "pred")?;
        let is_zero = self
            .builder
            .build_int_compare(
                IntPredicate::EQ,
                value,
                self.context.i64_type().const_zero(),
                "predcond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(is_zero, pred_false, pred_true)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(pred_false);
        self.builder
            .build_return(Some(&self.context.i64_type().const_zero()))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(pred_true);
        Ok(())
    }
}
