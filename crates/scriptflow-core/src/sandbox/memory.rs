//! Memory sampling for the script runtime.
//!
//! Rhai does not expose an allocator counter, so usage is estimated from the
//! values a script leaves behind: growth of its scope past the injected
//! globals plus its return value. Sampling happens once, after execution.
//! Single strings, arrays and maps are capped while the script runs by the
//! engine's data-size limits, which the sandbox derives from the same ceiling.

use rhai::{Array, Blob, Dynamic, ImmutableString, Map, Scope};

use super::SandboxError;

/// Nesting depth beyond which containers are counted shallowly.
const MAX_DEPTH: usize = 32;

/// Estimated bytes held by a single value, including nested containers.
pub fn estimate_dynamic(value: &Dynamic) -> usize {
    estimate_at_depth(value, 0)
}

fn estimate_at_depth(value: &Dynamic, depth: usize) -> usize {
    let base = std::mem::size_of::<Dynamic>();

    if let Some(s) = value.read_lock::<ImmutableString>() {
        return base + s.len();
    }
    if let Some(blob) = value.read_lock::<Blob>() {
        return base + blob.len();
    }
    if depth >= MAX_DEPTH {
        return base;
    }
    if let Some(array) = value.read_lock::<Array>() {
        return base
            + array
                .iter()
                .map(|item| estimate_at_depth(item, depth + 1))
                .sum::<usize>();
    }
    if let Some(map) = value.read_lock::<Map>() {
        return base
            + map
                .iter()
                .map(|(key, item)| key.len() + estimate_at_depth(item, depth + 1))
                .sum::<usize>();
    }

    base
}

/// Estimated bytes held by every variable in a scope.
pub fn estimate_scope(scope: &Scope<'_>) -> usize {
    scope
        .iter_raw()
        .map(|(name, _, value)| name.len() + estimate_dynamic(value))
        .sum()
}

/// Check a sampled usage against a ceiling.
///
/// A ceiling of zero or below disables enforcement.
pub fn check_memory_ceiling(used: u64, ceiling: i64) -> Result<(), SandboxError> {
    if ceiling <= 0 {
        return Ok(());
    }
    let max = ceiling as u64;
    if used > max {
        return Err(SandboxError::MemoryLimit { used, max });
    }
    Ok(())
}
