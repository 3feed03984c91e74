//! Data-quality insights over the processed corpus.
//!
//! Produces highlights (most active members, average length, top locations)
//! and anomalies (duplicate ids, future timestamps, outlier lengths, empty
//! messages), and renders them as Markdown into `reports_dir/insights.md`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::Corpus;
use crate::normalize::load_or_build_corpus;

const LOCATION_LABELS: [&str; 2] = ["GPE", "LOC"];

#[derive(Debug, Clone, Serialize)]
pub struct InsightsReport {
    pub highlights: Vec<String>,
    pub anomalies: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub total_messages: usize,
}

/// Count occurrences, ordered by count descending then first appearance.
fn ranked_counts<'a>(items: impl Iterator<Item = &'a str>) -> Vec<(&'a str, usize)> {
    let mut order: Vec<(&str, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for item in items {
        match index.get(item) {
            Some(&i) => order[i].1 += 1,
            None => {
                index.insert(item, order.len());
                order.push((item, 1));
            }
        }
    }
    order.sort_by(|a, b| b.1.cmp(&a.1));
    order
}

/// Quantile with linear interpolation between closest ranks.
fn quantile(values: &[usize], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

fn highlights(corpus: &Corpus) -> Vec<String> {
    let mut out = Vec::new();
    if corpus.is_empty() {
        return out;
    }

    let members = ranked_counts(corpus.records.iter().map(|r| r.author_name.as_str()));
    let formatted = members
        .iter()
        .take(3)
        .map(|(name, count)| format!("{} ({} messages)", name, count))
        .collect::<Vec<_>>()
        .join(", ");
    out.push(format!("Most active members: {}.", formatted));

    let avg = corpus.records.iter().map(|r| r.token_count).sum::<usize>() as f64
        / corpus.len() as f64;
    out.push(format!("Average message length: {:.1} tokens.", avg));

    let locations = ranked_counts(
        corpus
            .records
            .iter()
            .flat_map(|r| r.entities.iter())
            .filter(|e| LOCATION_LABELS.contains(&e.label.to_uppercase().as_str()))
            .map(|e| e.text.as_str()),
    );
    if !locations.is_empty() {
        let formatted = locations
            .iter()
            .take(5)
            .map(|(name, count)| format!("{} ({})", name, count))
            .collect::<Vec<_>>()
            .join(", ");
        out.push(format!("Top mentioned locations: {}.", formatted));
    }
    out
}

fn anomalies(corpus: &Corpus, now: DateTime<Utc>) -> Vec<String> {
    if corpus.is_empty() {
        return vec!["No messages available to analyse.".to_string()];
    }
    let mut out = Vec::new();

    let duplicates: Vec<&str> = ranked_counts(corpus.records.iter().map(|r| r.id.as_str()))
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id)
        .take(5)
        .collect();
    if !duplicates.is_empty() {
        out.push(format!(
            "Duplicate message IDs detected: {}.",
            duplicates.join(", ")
        ));
    }

    let future: Vec<DateTime<Utc>> = corpus
        .records
        .iter()
        .map(|r| r.timestamp)
        .filter(|ts| *ts > now)
        .collect();
    if let Some(latest) = future.iter().max() {
        out.push(format!(
            "{} messages are timestamped in the future; latest is {}",
            future.len(),
            latest.to_rfc3339_opts(SecondsFormat::Secs, false)
        ));
    }

    let lengths: Vec<usize> = corpus.records.iter().map(|r| r.token_count).collect();
    let p99 = quantile(&lengths, 0.99);
    if let Some(long) = corpus.records.iter().find(|r| r.token_count as f64 > p99) {
        out.push(format!(
            "Unusually long message detected for {} ({} tokens).",
            long.author_name, long.token_count
        ));
    }

    let empty = corpus
        .records
        .iter()
        .filter(|r| r.text_clean.is_empty())
        .count();
    if empty > 0 {
        out.push(format!("{} messages are empty after cleaning.", empty));
    }
    out
}

pub fn generate_insights(corpus: &Corpus, now: DateTime<Utc>) -> InsightsReport {
    InsightsReport {
        highlights: highlights(corpus),
        anomalies: anomalies(corpus, now),
        generated_at: now,
        total_messages: corpus.len(),
    }
}

pub fn render_markdown(report: &InsightsReport) -> String {
    let bullet = |lines: &[String], empty: &str| -> Vec<String> {
        if lines.is_empty() {
            vec![format!("- {}", empty)]
        } else {
            lines.iter().map(|l| format!("- {}", l)).collect()
        }
    };

    let mut md = vec![
        "# Data Insights".to_string(),
        format!("Generated: {}", report.generated_at.to_rfc3339()),
        String::new(),
        "## Highlights".to_string(),
    ];
    md.extend(bullet(&report.highlights, "No highlights derived."));
    md.push(String::new());
    md.push("## Anomalies".to_string());
    md.extend(bullet(&report.anomalies, "No anomalies detected."));
    md.push(String::new());
    md.push(format!("Total messages analysed: {}", report.total_messages));
    md.join("\n")
}

pub fn write_report(report: &InsightsReport, reports_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("Failed to create {}", reports_dir.display()))?;
    let path = reports_dir.join("insights.md");
    std::fs::write(&path, render_markdown(report))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "insights.report_written");
    Ok(path)
}

/// Load (or build) the corpus, compute insights and write the report.
pub async fn build_insights(config: &Config, force_refresh: bool) -> Result<InsightsReport> {
    let corpus = load_or_build_corpus(config, force_refresh).await?;
    let report = generate_insights(&corpus, Utc::now());
    write_report(&report, &config.storage.reports_dir)?;
    Ok(report)
}

pub async fn run_insights(config: &Config) -> Result<()> {
    let report = build_insights(config, false).await?;
    println!("Highlights:");
    for line in &report.highlights {
        println!("  - {}", line);
    }
    println!("Anomalies:");
    for line in &report.anomalies {
        println!("  - {}", line);
    }
    println!(
        "Report written to {}",
        config.storage.reports_dir.join("insights.md").display()
    );
    println!("ok");
    Ok(())
}
