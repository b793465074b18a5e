use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const SESSION_SCHEMA: &str = "session_v1.json";
pub const SCENARIO_SCHEMA: &str = "scenario_v1.json";

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS_DIR
        .get_file(name)
        .ok_or_else(|| anyhow!("schema not found: {}", name))?;
    let data = std::str::from_utf8(file.contents())?;
    Ok(serde_json::from_str(data)?)
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

/// Validates `value` against the named schema, joining every violation into
/// one error message.
pub fn validate_value(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    let result = compiled.validate(value);
    if let Err(errors) = result {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(anyhow!(
            "{} validation failed: {}",
            name,
            msgs.join("; ")
        ));
    }
    Ok(())
}
