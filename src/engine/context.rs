//! Builds and evolves the workflow variable map into the template
//! context a step's `when`/render calls see (§4.7 "Context variables
//! always available").

use serde_json::{Value, json};

use crate::domain::Task;

/// `task`, `previous` (a neutral placeholder before any step has run),
/// and `secrets`, merged with whatever the persisted `Workflow.variables`
/// map already holds (prior steps' outputs, loop counters).
pub fn build(task: &Task, secrets: &Value, variables: &std::collections::HashMap<String, Value>) -> Value {
    let mut ctx = serde_json::Map::new();
    ctx.insert("task".to_string(), serde_json::to_value(task).unwrap_or(Value::Null));
    ctx.insert(
        "previous".to_string(),
        json!({"success": true, "failed": false, "output": {}}),
    );
    ctx.insert("secrets".to_string(), secrets.clone());
    for (k, v) in variables {
        ctx.insert(k.clone(), v.clone());
    }
    Value::Object(ctx)
}

/// Merge a completed step's outputs into the context: `previous.*` is
/// overwritten, and the step's own name becomes a new top-level key
/// (§4.7: "each prior step's name mapped to that step's outputs").
pub fn apply_step_result(ctx: &mut Value, step_name: &str, success: bool, output: Value) {
    let obj = ctx.as_object_mut().expect("context is always an object");
    obj.insert(
        "previous".to_string(),
        json!({"success": success, "failed": !success, "output": output.clone()}),
    );
    obj.insert(step_name.to_string(), output);
}

pub fn set_loop_index(ctx: &mut Value, index: u32) {
    let obj = ctx.as_object_mut().expect("context is always an object");
    obj.insert("loop".to_string(), json!({"index": index}));
}

/// Extract `ctx.<name>` back out as the persisted variables map, dropping
/// the always-present `task`/`secrets` keys (those are rebuilt fresh on
/// every resume rather than round-tripped through `state.json`).
pub fn extract_variables(ctx: &Value) -> std::collections::HashMap<String, Value> {
    ctx.as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| k.as_str() != "task" && k.as_str() != "secrets")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}
