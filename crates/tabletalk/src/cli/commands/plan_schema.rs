use anyhow::Result;
use serde_json::json;

use super::emit;
use crate::cli::envelope::CommandEnvelope;
use crate::models::{QUERY_PLAN_SCHEMA_VERSION, json_schema};

pub fn run() -> Result<()> {
    emit(
        &CommandEnvelope::ok("plan-schema", json_schema())
            .with_meta("plan_schema_version", json!(QUERY_PLAN_SCHEMA_VERSION)),
    )
}
