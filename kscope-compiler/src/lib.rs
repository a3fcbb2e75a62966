//! kscope code generator
//!
//! Compiles a type-checked tracing-script AST into a relocatable eBPF
//! object: one sandbox program per (probe × wildcard match × USDT
//! location), plus the embedded histogram helpers, with async actions
//! serialized through the perf event ring in the kscope-protocol format.
//!
//! The semantic analyzer runs first and supplies [`metadata::TraceMetadata`]
//! (dictionaries, map fds, argument tables) and a
//! [`metadata::ProbeResolver`] for symbol and wildcard resolution; this
//! crate owns everything from the typed AST down to the object bytes.

pub mod ast;
pub mod codegen;
pub mod metadata;
pub mod types;

use codegen::{CodeGen, CodeGenError};
use inkwell::context::Context;
use metadata::{ProbeResolver, TraceMetadata};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("code generation error: {0}")]
    CodeGen(#[from] CodeGenError),

    #[error("LLVM error: {0}")]
    Llvm(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Kernel-feature switches and emission toggles.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Use the boot-time clock for `nsecs` when the kernel has it.
    pub has_boot_ns: bool,
    /// Use the split kernel/user probe-read helpers (kernel >= 5.5).
    pub has_probe_read_kernel: bool,
    /// Write the textual IR next to the object for inspection.
    pub save_llvm_ir: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            has_boot_ns: false,
            has_probe_read_kernel: true,
            save_llvm_ir: false,
        }
    }
}

/// Compile a program to eBPF object bytes.
pub fn compile(
    program: &ast::Program,
    metadata: &mut TraceMetadata,
    resolver: &dyn ProbeResolver,
    options: &CompileOptions,
) -> Result<Vec<u8>> {
    let context = Context::create();
    let mut codegen = CodeGen::new(&context, "kscope", metadata, resolver, options.clone())?;
    codegen.generate(program)?;

    if options.save_llvm_ir {
        std::fs::write("kscope.ll", codegen.print_ir())?;
        info!("saved LLVM IR to kscope.ll");
    }

    codegen.optimize()?;
    Ok(codegen.emit()?)
}

/// Compile and write the object file (truncating any existing one).
pub fn write_object(
    path: &std::path::Path,
    program: &ast::Program,
    metadata: &mut TraceMetadata,
    resolver: &dyn ProbeResolver,
    options: &CompileOptions,
) -> Result<()> {
    let bytes = compile(program, metadata, resolver, options)?;
    std::fs::write(path, &bytes)?;
    info!("wrote eBPF object to {}", path.display());
    Ok(())
}
