use anyhow::Result;
use serde_json::json;

use super::{CommandContext, emit};
use crate::cli::envelope::CommandEnvelope;

pub fn run(context: &CommandContext) -> Result<()> {
    let platforms = context
        .config
        .platforms
        .iter()
        .map(|spec| {
            json!({
                "id": spec.id,
                "display_name": spec.display_name,
                "ddl_path": spec.ddl_path.display().to_string(),
                "store_path": spec.store_path.display().to_string(),
                "ddl_present": spec.ddl_path.is_file(),
                "store_present": spec.store_path.is_file(),
            })
        })
        .collect::<Vec<_>>();

    emit(
        &CommandEnvelope::ok("platforms", json!({ "platforms": platforms }))
            .with_meta("count", json!(platforms.len()))
            .with_meta(
                "data_dir",
                json!(context.paths.data_dir.display().to_string()),
            ),
    )
}
