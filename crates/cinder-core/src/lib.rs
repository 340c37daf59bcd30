pub mod ast;
pub mod collections;
pub mod compiler;
pub mod core_protocols;
pub mod dynamic_vars;
pub mod error;
pub mod interop;
pub mod logging;
pub mod namespaces;
pub mod options;
pub mod protocol;
pub mod reference;
pub mod rt;
pub mod symbols;
pub mod types;
pub mod value_format;
pub mod vm;

pub use ast::Value;
pub use compiler::Compiler;
pub use error::{CinderError, CompileError};
pub use options::CompileOptions;

/// Evaluates `forms` in order with a fresh compiler, returning the value of
/// the last one.
pub fn eval_forms(forms: &[Value], options: Option<CompileOptions>) -> Result<Value, CinderError> {
    let mut compiler = Compiler::with_options(options.unwrap_or_default());
    let mut last = Value::Nil;
    for form in forms {
        last = compiler.eval(form)?;
    }
    Ok(last)
}
