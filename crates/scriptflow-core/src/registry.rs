//! Script lookup for `script` steps.

use scriptflow_types::execution::{ExecutionContext, ScriptRecord};

/// Resolves a script ID to its registered record.
pub trait ScriptRegistry {
    fn get_script(&self, id: &str) -> Option<&ScriptRecord>;
}

/// Scripts supplied with the run; the first record with a matching ID wins.
impl ScriptRegistry for ExecutionContext {
    fn get_script(&self, id: &str) -> Option<&ScriptRecord> {
        self.scripts.iter().find(|s| s.id == id)
    }
}
