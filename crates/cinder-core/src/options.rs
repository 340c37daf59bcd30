use std::env;
use std::path::PathBuf;

use crate::vm::PtrMode;

fn env_flag(name: &str) -> bool {
    let Ok(value) = env::var(name) else {
        return false;
    };
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn no_lines_from_env() -> bool {
    env_flag("CINDER_NO_LINES")
}

pub fn strict_deref_from_env() -> bool {
    env_flag("CINDER_STRICT_DEREF")
}

pub fn module_dir_from_env() -> Option<PathBuf> {
    env::var_os("CINDER_MODULE_DIR").map(PathBuf::from)
}

pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

/// Closure frames allowed on one thread before a call fails.
pub fn max_call_depth_from_env() -> usize {
    env::var("CINDER_MAX_CALL_DEPTH")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|depth| *depth > 0)
        .unwrap_or(DEFAULT_MAX_CALL_DEPTH)
}

#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Emit line markers from the `:line` metadata of forms.
    pub track_lines: bool,
    /// Lowering used for global references.
    pub deref_mode: PtrMode,
    pub default_ns: String,
    pub filename: String,
    /// Directory that receives `output.cnc` from `compile_module`.
    pub module_dir: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            track_lines: !no_lines_from_env(),
            deref_mode: if strict_deref_from_env() {
                PtrMode::Deref
            } else {
                PtrMode::Direct
            },
            default_ns: "user".to_string(),
            filename: "<cinder>".to_string(),
            module_dir: module_dir_from_env(),
        }
    }
}
