//! JIT compilation of scalar expressions with Cranelift.
//!
//! [`build_combined_function`] compiles a list of expressions into one native function that
//! reads its inputs from one array and writes every result into another. Transcendental
//! functions are linked against the host's `f64` implementations.

use std::collections::HashMap;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::{ir::immediates::Offset32, Context};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use log::debug;

use crate::errors::BuilderError;
use crate::expr::{CodegenContext, Expr, MathImports};
use crate::types::CombinedJITFunction;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

impl ThreadSafeFunction {
    fn as_ptr(&self) -> *const u8 {
        self.0
    }
}

extern "C" fn host_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn host_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn host_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn host_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn host_powf(x: f64, p: f64) -> f64 {
    x.powf(p)
}

fn set_flag(builder: &mut settings::Builder, name: &str, value: &str) -> Result<(), BuilderError> {
    builder
        .set(name, value)
        .map_err(|e| BuilderError::SettingError(format!("{name}={value}: {e}")))
}

/// Creates the instruction set for the host machine.
///
/// # Errors
/// Returns `BuilderError::HostMachineNotSupported` if Cranelift has no backend for the host,
/// and `BuilderError::SettingError` or `BuilderError::CodegenError` if the flags are rejected.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    // cranelift-jit rejects position independent code
    set_flag(&mut flag_builder, "use_colocated_libcalls", "false")?;
    set_flag(&mut flag_builder, "is_pic", "false")?;
    set_flag(&mut flag_builder, "opt_level", "speed")?;
    set_flag(
        &mut flag_builder,
        "enable_verifier",
        if cfg!(debug_assertions) { "true" } else { "false" },
    )?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| {
            BuilderError::HostMachineNotSupported(format!(
                "{}: {msg}",
                target_lexicon::Triple::host()
            ))
        })?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with the host math functions registered.
pub(crate) fn create_module(isa: Arc<dyn TargetIsa>) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    builder.symbol("extop_exp", host_exp as *const u8);
    builder.symbol("extop_ln", host_ln as *const u8);
    builder.symbol("extop_sin", host_sin as *const u8);
    builder.symbol("extop_cos", host_cos as *const u8);
    builder.symbol("extop_powf", host_powf as *const u8);
    JITModule::new(builder)
}

/// Declares the host math functions in `module` and imports them into the function under
/// construction.
fn import_math(
    module: &mut JITModule,
    builder: &mut FunctionBuilder,
) -> Result<MathImports, BuilderError> {
    let mut unary = module.make_signature();
    unary.params.push(AbiParam::new(types::F64));
    unary.returns.push(AbiParam::new(types::F64));
    let mut binary = unary.clone();
    binary.params.push(AbiParam::new(types::F64));

    let mut import = |name: &str, sig: &Signature| {
        module
            .declare_function(name, Linkage::Import, sig)
            .map(|id| module.declare_func_in_func(id, builder.func))
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))
    };
    Ok(MathImports {
        exp: import("extop_exp", &unary)?,
        ln: import("extop_ln", &unary)?,
        sin: import("extop_sin", &unary)?,
        cos: import("extop_cos", &unary)?,
        powf: import("extop_powf", &binary)?,
    })
}

/// Builds a JIT-compiled function evaluating several expressions in one call.
///
/// The compiled function reads variable `i` from `inputs[i]` and writes the value of
/// `exprs[j]` into `results[j]`. Variables loaded once are shared by all expressions.
///
/// # Arguments
/// * `exprs` - Expressions to compile, in output order
/// * `num_inputs` - Number of input values every call provides
///
/// # Errors
/// Returns a `BuilderError` if the host is unsupported or Cranelift rejects the function.
///
/// # Panics
/// The returned function panics if `inputs` is shorter than `num_inputs` or `results` is
/// shorter than `exprs.len()`.
pub fn build_combined_function(
    exprs: &[Expr],
    num_inputs: usize,
) -> Result<CombinedJITFunction, BuilderError> {
    let isa = create_isa()?;
    let mut module = create_module(isa);
    let mut codegen_context = Context::new();
    let mut builder_context = FunctionBuilderContext::new();

    // fn(input_ptr: *const f64, output_ptr: *mut f64)
    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer));
    sig.params.push(AbiParam::new(pointer));

    let func_id = module
        .declare_function("combined", Linkage::Export, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
    codegen_context.func.signature = sig;

    {
        let mut builder = FunctionBuilder::new(&mut codegen_context.func, &mut builder_context);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let input_ptr = builder.block_params(entry_block)[0];
        let output_ptr = builder.block_params(entry_block)[1];
        let mut ctx = CodegenContext {
            input_ptr,
            imports: import_math(&mut module, &mut builder)?,
            loaded: HashMap::new(),
        };

        for (i, expr) in exprs.iter().enumerate() {
            let value = expr.codegen(&mut builder, &mut ctx);
            builder.ins().store(
                MemFlags::trusted(),
                value,
                output_ptr,
                Offset32::new(i as i32 * 8),
            );
        }
        builder.ins().return_(&[]);
        builder.finalize();
    }

    module
        .define_function(func_id, &mut codegen_context)
        .map_err(|e| BuilderError::FunctionError(e.to_string()))?;
    module.clear_context(&mut codegen_context);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;
    debug!("compiled {} expressions over {} inputs", exprs.len(), num_inputs);

    // Finalized code stays mapped after the module is dropped; only
    // `JITModule::free_memory` releases it.
    let code = ThreadSafeFunction(module.get_finalized_function(func_id));
    let num_outputs = exprs.len();
    Ok(Arc::new(move |inputs: &[f64], results: &mut [f64]| {
        assert!(inputs.len() >= num_inputs, "input buffer too short");
        assert!(results.len() >= num_outputs, "results buffer too short");
        // SAFETY: the function was compiled with signature fn(*const f64, *mut f64), reads
        // at most `num_inputs` values and writes exactly `num_outputs` values.
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(code.as_ptr());
            f(inputs.as_ptr(), results.as_mut_ptr());
        }
    }))
}

/// Wraps expressions into an interpreted function with the same calling convention as
/// [`build_combined_function`].
pub fn interpret_combined_function(exprs: &[Expr]) -> CombinedJITFunction {
    let exprs = exprs.to_vec();
    Arc::new(move |inputs: &[f64], results: &mut [f64]| {
        for (result, expr) in results.iter_mut().zip(&exprs) {
            *result = expr.eval(inputs);
        }
    })
}
