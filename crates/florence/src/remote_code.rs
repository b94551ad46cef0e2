//! Import listing for the python modeling files shipped with remote-code
//! checkpoints, so a caller can tell which packages the model code pulls in.

use anyhow::Context;
use regex::Regex;
use std::path::Path;
use tracing::debug;

pub const FLORENCE2_MODELING_FILE: &str = "modeling_florence2.py";
pub const FLASH_ATTN_MODULE: &str = "flash_attn";

/// Top level modules imported by a python source file, sorted and deduplicated.
///
/// Imports guarded by `try/except` and by the `is_flash_attn_*_available()`
/// check are optional and left out.
pub fn get_imports(source: &str) -> anyhow::Result<Vec<String>> {
    let try_block = Regex::new(r"(?s)\s*try\s*:\s*.*?\s*except\s*.*?:")?;
    let flash_attn_block =
        Regex::new(r"if is_flash_attn[a-zA-Z0-9_]+available\(\):\s*(from flash_attn\s*.*\s*)+")?;
    let plain_import = Regex::new(r"(?m)^\s*import\s+(\S+)\s*$")?;
    let from_import = Regex::new(r"(?m)^\s*from\s+(\S+)\s+import")?;

    let source = try_block.replace_all(source, "");
    let source = flash_attn_block.replace_all(&source, "");

    let mut imports: Vec<String> = plain_import
        .captures_iter(&source)
        .chain(from_import.captures_iter(&source))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|module| !module.starts_with('.'))
        .filter_map(|module| module.split('.').next())
        .map(|module| module.to_string())
        .collect();

    imports.sort();
    imports.dedup();

    Ok(imports)
}

/// Drop `flash_attn` from the imports of the Florence-2 modeling file.
/// Other files pass through untouched.
pub fn patch_imports(filename: &str, mut imports: Vec<String>) -> Vec<String> {
    if !filename.ends_with(FLORENCE2_MODELING_FILE) {
        return imports;
    }

    match imports.iter().position(|module| module == FLASH_ATTN_MODULE) {
        Some(idx) => {
            imports.remove(idx);
        }
        None => {
            debug!("{} does not import {}", filename, FLASH_ATTN_MODULE);
        }
    }

    imports
}

pub fn fixed_get_imports(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let imports = get_imports(&source)?;
    Ok(patch_imports(&path.to_string_lossy(), imports))
}
