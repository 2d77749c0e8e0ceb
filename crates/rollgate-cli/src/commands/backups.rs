use std::path::Path;

use anyhow::Context;

use rollgate_backup::BackupIndex;
use rollgate_core::BackupRecord;

use super::load_config;
use crate::OutputFormat;

pub fn list(config_path: &Path, env: Option<&str>, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let index_path = config.defaults.backup_dir.join("index.redb");

    let records = if index_path.exists() {
        let index = BackupIndex::open(&index_path)
            .with_context(|| format!("opening backup index {}", index_path.display()))?;
        match env {
            Some(name) => index.list_for_namespace(&config.environment(name)?.namespace)?,
            None => index.list()?,
        }
    } else {
        Vec::new()
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print!("{}", format_records(&records)),
    }
    Ok(())
}

fn format_records(records: &[BackupRecord]) -> String {
    if records.is_empty() {
        return "No backups recorded.\n".to_string();
    }
    let mut out = String::new();
    for r in records {
        let scope: Vec<&str> = r.scope.iter().map(String::as_str).collect();
        out.push_str(&format!(
            "{}  {:<20} {:>10}  {}\n",
            r.id,
            r.namespace,
            r.timestamp,
            scope.join(",")
        ));
        out.push_str(&format!("    local:  {}\n", r.storage_location));
        if let Some(remote) = &r.remote_location {
            out.push_str(&format!("    remote: {remote}\n"));
        }
    }
    out
}
