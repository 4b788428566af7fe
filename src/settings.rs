use crate::CompileOpts;
use std::{env, str::FromStr};
use stackasm_compiler_core::{BytecodeVersion, OpcodeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("STACKASM_PEEPHOLE_PASSES must be a non-negative integer, got {0:?}")]
    PeepholePasses(String),
    #[error("STACKASM_BYTECODE: {0}")]
    Bytecode(#[from] OpcodeError),
}

/// Default options with the `STACKASM_*` environment variables applied.
///
/// * `STACKASM_OPTIMIZE`: optimization level, a non-numeric value means 1
/// * `STACKASM_NO_PEEPHOLE`: set to disable both peephole optimizers
/// * `STACKASM_PEEPHOLE_PASSES`: cap on byte-level passes
/// * `STACKASM_BYTECODE`: `legacy` or `standard`
/// * `STACKASM_STRICT_STACK`: set to reject unbalanced stack depths
pub fn opts_from_env() -> Result<CompileOpts, SettingsError> {
    opts_from_vars(|name| env::var(name).ok())
}

/// [`opts_from_env`] over an arbitrary variable lookup.
pub fn opts_from_vars(
    var: impl Fn(&str) -> Option<String>,
) -> Result<CompileOpts, SettingsError> {
    let mut opts = CompileOpts::default();

    if let Some(value) = var("STACKASM_OPTIMIZE") {
        opts.optimize = get_level(&value);
    }
    if var("STACKASM_NO_PEEPHOLE").is_some() {
        opts.peephole = false;
        opts.byte_peephole = false;
    }
    if let Some(value) = var("STACKASM_PEEPHOLE_PASSES") {
        opts.peephole_max_passes = value
            .trim()
            .parse()
            .map_err(|_| SettingsError::PeepholePasses(value.clone()))?;
    }
    if let Some(value) = var("STACKASM_BYTECODE") {
        opts.version = BytecodeVersion::from_str(&value)?;
    }
    if var("STACKASM_STRICT_STACK").is_some() {
        opts.verify_stack_balance = true;
    }

    debug!("compile options: {opts:?}");
    Ok(opts)
}

fn get_level(value: &str) -> u8 {
    u8::from_str(value.trim()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn opts(vars: &[(&str, &str)]) -> Result<CompileOpts, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        opts_from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(opts(&[]).unwrap(), CompileOpts::default());
    }

    #[test]
    fn test_overrides() {
        let opts = opts(&[
            ("STACKASM_OPTIMIZE", "2"),
            ("STACKASM_NO_PEEPHOLE", ""),
            ("STACKASM_PEEPHOLE_PASSES", "9"),
            ("STACKASM_BYTECODE", "Legacy"),
            ("STACKASM_STRICT_STACK", "1"),
        ])
        .unwrap();
        assert_eq!(opts.optimize, 2);
        assert!(!opts.peephole && !opts.byte_peephole);
        assert_eq!(opts.peephole_max_passes, 9);
        assert_eq!(opts.version, BytecodeVersion::Legacy);
        assert!(opts.verify_stack_balance);
    }

    #[test]
    fn test_optimize_level_falls_back_to_one() {
        assert_eq!(opts(&[("STACKASM_OPTIMIZE", "yes")]).unwrap().optimize, 1);
    }

    #[test]
    fn test_bad_values() {
        assert!(matches!(
            opts(&[("STACKASM_PEEPHOLE_PASSES", "-1")]),
            Err(SettingsError::PeepholePasses(_))
        ));
        assert!(matches!(
            opts(&[("STACKASM_BYTECODE", "future")]),
            Err(SettingsError::Bytecode(_))
        ));
    }
}
