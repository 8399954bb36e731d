//! Rendering command results as text or JSON

use anyhow::Result;
use lodestone_cas::GcReport;
use lodestone_content::{
    ContentManifest, ContentSearchResult, ProgressEvent, ValidationReport,
};
use lodestone_workspace::WorkspaceResult;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cli::OutputFormat;

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print search hits
pub fn search_results(results: &[ContentSearchResult], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(results);
    }
    if results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for result in results {
        println!("{}  {} {}", result.id, result.name, result.version);
        let mut detail = format!("    by {} via {}", result.author, result.provider_id);
        if !result.tags.is_empty() {
            detail.push_str(&format!(" [{}]", result.tags.join(", ")));
        }
        println!("{detail}");
        if !result.description.is_empty() {
            println!("    {}", result.description);
        }
    }
    Ok(())
}

/// Print one manifest
pub fn manifest(manifest: &ContentManifest, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(manifest);
    }
    println!(
        "{} {} ({} files, {})",
        manifest.id,
        manifest.version,
        manifest.files.len(),
        format_size(manifest.total_size())
    );
    Ok(())
}

/// Print a manifest table
pub fn manifests(manifests: &[Arc<ContentManifest>], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(manifests);
    }
    if manifests.is_empty() {
        println!("Nothing acquired");
        return Ok(());
    }
    for m in manifests {
        println!(
            "{:<48} {:<12} {:>4} files {:>10}  {}",
            m.id.to_string(),
            m.version,
            m.files.len(),
            format_size(m.total_size()),
            m.name
        );
    }
    Ok(())
}

/// Print a validation report
pub fn validation(id: &str, report: &ValidationReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(report);
    }
    for issue in report.errors().chain(report.warnings()) {
        println!("{issue}");
    }
    if report.is_valid() {
        println!("{id}: ok");
    } else {
        println!("{id}: {} problem(s)", report.errors().count());
    }
    Ok(())
}

/// Print provider ids and whether each is enabled
pub fn providers(providers: &[(String, bool)], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        let rows: Vec<_> = providers
            .iter()
            .map(|(id, enabled)| serde_json::json!({ "id": id, "enabled": enabled }))
            .collect();
        return json(&rows);
    }
    if providers.is_empty() {
        println!("No providers configured");
    }
    for (id, enabled) in providers {
        println!("{id:<32} {}", if *enabled { "enabled" } else { "disabled" });
    }
    Ok(())
}

/// Print a prepared workspace
pub fn workspace(result: &WorkspaceResult, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(result);
    }
    for warning in &result.warnings {
        println!("warning: {warning}");
    }
    if result.skipped {
        println!(
            "{} is up to date at {}",
            result.profile,
            result.root.display()
        );
    } else {
        println!(
            "{} ready at {} ({} files, {})",
            result.profile,
            result.root.display(),
            result.files.len(),
            result.strategy
        );
    }
    Ok(())
}

/// Print profile names
pub fn profiles(profiles: &[String], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(profiles);
    }
    if profiles.is_empty() {
        println!("No workspaces");
    }
    for profile in profiles {
        println!("{profile}");
    }
    Ok(())
}

/// Print a garbage collection summary
pub fn gc_report(report: &GcReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return json(report);
    }
    println!(
        "Scanned {} objects, deleted {} ({}), kept {} referenced and {} in grace period",
        report.scanned,
        report.deleted,
        format_size(report.bytes_freed),
        report.retained_referenced,
        report.retained_in_grace
    );
    for error in &report.errors {
        println!("error: {error}");
    }
    Ok(())
}

/// Draw progress events on stderr until the sender side closes
pub fn spawn_progress_printer(mut events: mpsc::Receiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut drew = false;
        while let Some(event) = events.recv().await {
            let item = event.current_item.as_deref().unwrap_or("");
            let mut stderr = std::io::stderr().lock();
            let _ = write!(
                stderr,
                "\r\x1b[2K{} {:>5.1}% {}",
                event.operation, event.percentage, item
            );
            let _ = stderr.flush();
            drew = true;
        }
        if drew {
            eprintln!();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
