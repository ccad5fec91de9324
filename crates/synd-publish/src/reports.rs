//! Per-run publish reports under `<reports_dir>/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::orchestrator::{PublishStatus, PublishSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `publish_run.json`, `publish_brief.md`, `attempts.parquet` and a
/// `manifest.json` of their hashes. Returns the run directory.
pub async fn write_run_report(reports_dir: &Path, summary: &PublishSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let run_path = run_dir.join("publish_run.json");
    let json = serde_json::to_vec_pretty(summary).context("serializing publish summary")?;
    fs::write(&run_path, json)
        .await
        .with_context(|| format!("writing {}", run_path.display()))?;

    let brief_path = run_dir.join("publish_brief.md");
    fs::write(&brief_path, render_brief(summary))
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;

    let attempts_path = run_dir.join("attempts.parquet");
    write_attempts_parquet(&attempts_path, summary)?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("publish_run", &run_dir, &run_path)?,
            manifest_entry("publish_brief", &run_dir, &brief_path)?,
            manifest_entry("attempts", &run_dir, &attempts_path)?,
        ],
    };
    let manifest_path = run_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(run_id = %summary.run_id, dir = %run_dir.display(), "publish report written");
    Ok(run_dir)
}

fn render_brief(summary: &PublishSummary) -> String {
    let rows = summary
        .attempts
        .iter()
        .map(|a| {
            format!(
                "| {} | {} | {} |",
                a.target_id,
                a.status.as_str(),
                a.message.as_deref().unwrap_or("").replace('|', "\\|")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Publish Brief\n\n- Run ID: `{}`\n- Record: `{}`\n- Started: {}\n- Finished: {}\n- Succeeded: {}\n- Failed: {}\n- Cancelled: {}\n\n## Targets\n\n| Target | Status | Message |\n|---|---|---|\n{}\n",
        summary.run_id,
        summary.record_id,
        summary.started_at,
        summary.finished_at,
        summary.succeeded,
        summary.failed,
        summary.cancelled,
        rows
    )
}

fn write_attempts_parquet(path: &Path, summary: &PublishSummary) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("position", DataType::UInt32, false),
        ArrowField::new("target_id", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("message", DataType::Utf8, true),
    ]));

    let attempts = &summary.attempts;
    let run_ids = StringArray::from(vec![summary.run_id.to_string(); attempts.len()]);
    let record_ids = StringArray::from(vec![summary.record_id.to_string(); attempts.len()]);
    let positions = UInt32Array::from((0..attempts.len() as u32).collect::<Vec<_>>());
    let target_ids = StringArray::from(
        attempts
            .iter()
            .map(|a| Some(a.target_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        attempts
            .iter()
            .map(|a| Some(a.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let messages = StringArray::from(
        attempts
            .iter()
            .map(|a| a.message.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(run_ids),
            Arc::new(record_ids),
            Arc::new(positions),
            Arc::new(target_ids),
            Arc::new(statuses),
            Arc::new(messages),
        ],
    )
    .context("building attempts record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the newest `runs` reports, newest first.
pub fn report_recent_runs_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut summaries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| {
            let path = entry.path().join("publish_run.json");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let summary: PublishSummary = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((summary, entry.path()))
        })
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Recent Publish Runs".to_string(), String::new()];
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- record: `{}`", summary.record_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- succeeded: {}, failed: {}, cancelled: {}",
            summary.succeeded, summary.failed, summary.cancelled
        ));
        let failed = summary
            .attempts
            .iter()
            .filter(|a| a.status == PublishStatus::Error)
            .map(|a| a.target_id.as_str())
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            lines.push(format!("- retry candidates: {}", failed.join(", ")));
        }
        let manifest = dir.join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PublishAttempt;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn summary(hour: u32, statuses: &[(&str, PublishStatus)]) -> PublishSummary {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap();
        let attempts = statuses
            .iter()
            .map(|(id, status)| PublishAttempt {
                target_id: id.to_string(),
                status: *status,
                message: (*status == PublishStatus::Error).then(|| "timeout | 504".to_string()),
            })
            .collect::<Vec<_>>();
        let count = |s: PublishStatus| attempts.iter().filter(|a| a.status == s).count();
        PublishSummary {
            run_id: Uuid::new_v4(),
            record_id: Uuid::nil(),
            started_at,
            finished_at: started_at,
            succeeded: count(PublishStatus::Success),
            failed: count(PublishStatus::Error),
            cancelled: count(PublishStatus::Cancelled),
            attempts,
        }
    }

    #[tokio::test]
    async fn run_report_writes_all_artifacts_with_manifest() {
        let dir = tempdir().expect("tempdir");
        let s = summary(
            9,
            &[("a", PublishStatus::Success), ("b", PublishStatus::Error)],
        );
        let run_dir = write_run_report(dir.path(), &s).await.unwrap();

        for name in ["publish_run.json", "publish_brief.md", "attempts.parquet", "manifest.json"] {
            assert!(run_dir.join(name).exists(), "{name} missing");
        }
        let manifest: ReportManifest =
            serde_json::from_slice(&std::fs::read(run_dir.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64));

        let brief = std::fs::read_to_string(run_dir.join("publish_brief.md")).unwrap();
        assert!(brief.contains("| b | error | timeout \\| 504 |"));
    }

    #[tokio::test]
    async fn recent_runs_are_listed_newest_first() {
        let dir = tempdir().expect("tempdir");
        let older = summary(8, &[("a", PublishStatus::Success)]);
        let newer = summary(
            17,
            &[("a", PublishStatus::Success), ("c", PublishStatus::Error)],
        );
        write_run_report(dir.path(), &older).await.unwrap();
        write_run_report(dir.path(), &newer).await.unwrap();

        let md = report_recent_runs_markdown(dir.path(), 5).unwrap();
        let newer_at = md.find(&newer.run_id.to_string()).unwrap();
        let older_at = md.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);
        assert!(md.contains("- retry candidates: c"));

        let only_one = report_recent_runs_markdown(dir.path(), 1).unwrap();
        assert!(!only_one.contains(&older.run_id.to_string()));
    }
}
