//! Code generation context and core infrastructure
//!
//! One `CodeGen` instance owns the LLVM module and all state the recursive
//! lowerers thread through: the insertion cursor, the current probe context
//! pointer, variable slots, the loop-target stack, and the per-probe async
//! action counters that get snapshotted around wildcard expansion.

use crate::ast::AttachPoint;
use crate::metadata::{ProbeResolver, TraceMetadata};
use crate::types::SizedType;
use crate::CompileOptions;
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::targets::{CodeModel, FileType, RelocMode, Target, TargetMachine, TargetTriple};
use inkwell::values::{FunctionValue, IntValue, PointerValue};
use inkwell::OptimizationLevel;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CodeGenError {
    #[error("BUG: unknown identifier \"{0}\"")]
    UnknownIdentifier(String),

    #[error("BUG: unknown builtin \"{0}\"")]
    UnknownBuiltin(String),

    #[error("BUG: missing codegen for function \"{0}\"")]
    UnknownCall(String),

    #[error("could not resolve symbol: {0}")]
    SymbolResolutionFailed(String),

    #[error("unsupported operator \"{0}\" for {1} operands")]
    UnsupportedBinop(String, String),

    #[error("BUG: {0}")]
    InternalBug(String),

    #[error("builder error: {0}")]
    Builder(String),

    #[error("LLVM error: {0}")]
    Llvm(String),
}

pub type Result<T> = std::result::Result<T, CodeGenError>;

/// A lowered expression: either a value in a (virtual) register or a
/// pointer into the program's stack.
#[derive(Debug, Clone, Copy)]
pub enum ExprValue<'ctx> {
    Int(IntValue<'ctx>),
    Stack(PointerValue<'ctx>),
    /// Calls that perform their own effect (aggregations, emitters)
    /// produce no value.
    None,
}

/// The result of lowering one expression. `temp` is the deferred-release
/// slot: a stack allocation the consumer must end (via
/// [`CodeGen::release`]) once the value has been copied out, or transfer
/// into its own result (via [`ExprResult::disarm`]) to extend the
/// lifetime.
#[derive(Debug)]
pub struct ExprResult<'ctx> {
    pub value: ExprValue<'ctx>,
    temp: Option<PointerValue<'ctx>>,
}

impl<'ctx> ExprResult<'ctx> {
    pub fn int(value: IntValue<'ctx>) -> Self {
        ExprResult {
            value: ExprValue::Int(value),
            temp: None,
        }
    }

    /// A stack value whose slot outlives this expression (variable slot,
    /// map value buffer owned elsewhere).
    pub fn stack(ptr: PointerValue<'ctx>) -> Self {
        ExprResult {
            value: ExprValue::Stack(ptr),
            temp: None,
        }
    }

    /// A freshly allocated stack value the consumer must release.
    pub fn owned(ptr: PointerValue<'ctx>) -> Self {
        ExprResult {
            value: ExprValue::Stack(ptr),
            temp: Some(ptr),
        }
    }

    pub fn none() -> Self {
        ExprResult {
            value: ExprValue::None,
            temp: None,
        }
    }

    pub fn with_temp(mut self, temp: Option<PointerValue<'ctx>>) -> Self {
        self.temp = temp;
        self
    }

    /// Take over the deferred release, extending the value's lifetime into
    /// the caller's scope.
    pub fn disarm(&mut self) -> Option<PointerValue<'ctx>> {
        self.temp.take()
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, ExprValue::None)
    }
}

/// eBPF LLVM code generation context.
pub struct CodeGen<'a, 'ctx> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub builder: Builder<'ctx>,
    pub target_machine: TargetMachine,

    pub metadata: &'a mut TraceMetadata,
    pub resolver: &'a dyn ProbeResolver,
    pub options: CompileOptions,

    // Per-program state, reset between emitted programs
    pub(crate) ctx_param: Option<PointerValue<'ctx>>,
    pub(crate) variables: HashMap<String, PointerValue<'ctx>>,
    pub(crate) loops: Vec<(BasicBlock<'ctx>, BasicBlock<'ctx>)>,

    // Probe driver state
    pub(crate) probefull: String,
    pub(crate) current_attach_point: Option<AttachPoint>,
    pub(crate) current_usdt_location_index: usize,
    pub(crate) tracepoint_struct: String,
    pub(crate) next_probe_index: HashMap<String, u32>,

    // Async action counters, snapshotted around wildcard matches
    pub(crate) printf_id: u64,
    pub(crate) system_id: u64,
    pub(crate) cat_id: u64,
    pub(crate) time_id: u64,
    pub(crate) strftime_id: u64,
    pub(crate) join_id: u64,
    pub(crate) non_map_print_id: u64,
    pub(crate) helper_error_id: u64,

    // Lazily synthesized helper functions
    pub(crate) log2_func: Option<FunctionValue<'ctx>>,
    pub(crate) linear_func: Option<FunctionValue<'ctx>>,
}

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    pub fn new(
        context: &'ctx Context,
        module_name: &str,
        metadata: &'a mut TraceMetadata,
        resolver: &'a dyn ProbeResolver,
        options: CompileOptions,
    ) -> Result<Self> {
        let module = context.create_module(module_name);
        let builder = context.create_builder();

        Target::initialize_bpf(&Default::default());

        let triple = TargetTriple::create("bpf-pc-linux");
        let target = Target::from_triple(&triple)
            .map_err(|e| CodeGenError::Llvm(format!("Failed to get target from triple: {e}")))?;
        let target_machine = target
            .create_target_machine(
                &triple,
                "generic",
                "+alu32",
                OptimizationLevel::Default,
                RelocMode::PIC,
                CodeModel::Small,
            )
            .ok_or_else(|| CodeGenError::Llvm("Failed to create target machine".to_string()))?;

        let data_layout = target_machine.get_target_data().get_data_layout();
        module.set_data_layout(&data_layout);
        module.set_triple(&triple);

        Ok(CodeGen {
            context,
            module,
            builder,
            target_machine,
            metadata,
            resolver,
            options,
            ctx_param: None,
            variables: HashMap::new(),
            loops: Vec::new(),
            probefull: String::new(),
            current_attach_point: None,
            current_usdt_location_index: 0,
            tracepoint_struct: String::new(),
            next_probe_index: HashMap::new(),
            printf_id: 0,
            system_id: 0,
            cat_id: 0,
            time_id: 0,
            strftime_id: 0,
            join_id: 0,
            non_map_print_id: 0,
            helper_error_id: 0,
            log2_func: None,
            linear_func: None,
        })
    }

    /// The opaque probe context argument of the current program.
    pub(crate) fn ctx_ptr(&self) -> Result<PointerValue<'ctx>> {
        self.ctx_param
            .ok_or_else(|| CodeGenError::InternalBug("no current probe context".to_string()))
    }

    pub(crate) fn current_function(&self) -> Result<FunctionValue<'ctx>> {
        self.builder
            .get_insert_block()
            .and_then(|b| b.get_parent())
            .ok_or_else(|| CodeGenError::Builder("no current function".to_string()))
    }

    /// End the deferred release of a consumed expression result.
    pub(crate) fn release(&mut self, mut result: ExprResult<'ctx>) -> Result<()> {
        if let Some(slot) = result.disarm() {
            self.create_lifetime_end(slot)?;
        }
        Ok(())
    }

    pub(crate) fn as_int(&self, result: &ExprResult<'ctx>) -> Result<IntValue<'ctx>> {
        match result.value {
            ExprValue::Int(v) => Ok(v),
            _ => Err(CodeGenError::InternalBug(
                "expected integer expression".to_string(),
            )),
        }
    }

    pub(crate) fn as_stack(&self, result: &ExprResult<'ctx>) -> Result<PointerValue<'ctx>> {
        match result.value {
            ExprValue::Stack(p) => Ok(p),
            _ => Err(CodeGenError::InternalBug(
                "expected stack expression".to_string(),
            )),
        }
    }

    /// Address of a value, for probe-read sources and byte comparisons:
    /// stack slots decay to their address, integers are already addresses.
    pub(crate) fn value_addr(&mut self, result: &ExprResult<'ctx>) -> Result<IntValue<'ctx>> {
        match result.value {
            ExprValue::Int(v) => Ok(v),
            ExprValue::Stack(p) => self
                .builder
                .build_ptr_to_int(p, self.context.i64_type(), "addr")
                .map_err(|e| CodeGenError::Builder(e.to_string())),
            ExprValue::None => Err(CodeGenError::InternalBug(
                "expected value expression".to_string(),
            )),
        }
    }

    /// Printed IR of the module, for tests and `save_llvm_ir`.
    pub fn print_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// Verify the module and emit a relocatable eBPF object.
    pub fn emit(&self) -> Result<Vec<u8>> {
        self.module.verify().map_err(|e| {
            CodeGenError::Llvm(format!("module validation failed: {e}"))
        })?;

        let buffer = self
            .target_machine
            .write_to_memory_buffer(&self.module, FileType::Object)
            .map_err(|e| CodeGenError::Llvm(format!("object emission failed: {e}")))?;
        info!("emitted eBPF object, {} bytes", buffer.get_size());
        Ok(buffer.as_slice().to_vec())
    }

    /// Run the stock optimization pipeline so always-inline helpers fold
    /// into their callers before emission.
    pub fn optimize(&self) -> Result<()> {
        let options = inkwell::passes::PassBuilderOptions::create();
        self.module
            .run_passes("default<O2>", &self.target_machine, options)
            .map_err(|e| CodeGenError::Llvm(format!("optimization failed: {e}")))
    }
}

/// Bookkeeping for map value access: integers are stored as 64-bit cells
/// regardless of the script-level width.
pub(crate) fn map_value_type(value_type: &SizedType) -> SizedType {
    if value_type.is_integer() {
        let mut ty = SizedType::integer(value_type.is_signed(), 64);
        ty.is_internal = true;
        ty
    } else {
        let mut ty = value_type.clone();
        ty.is_internal = true;
        ty
    }
}
