//! JSON run reports written under `reports/<run_id>/` for operator
//! review.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use paybridge_core::SyncRunReport;
use tokio::fs;

pub async fn write_run_report(reports_root: &Path, report: &SyncRunReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("sync_run.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
