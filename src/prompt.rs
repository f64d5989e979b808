//! Prompt construction from retrieved and assembled context.

use std::fmt::Write as _;

use opsight_core::models::{ContextDocument, RetrievalContext, RetrievalSummary, RetrievedItem};

const ANALYSIS_INSTRUCTIONS: &str = "Provide a comprehensive analysis focusing on:
1. Key insights from the logs and metrics
2. Potential issues or anomalies
3. Relevant patterns or trends
4. Specific recommendations";

/// Number of event clusters listed by [`render_analysis_context`].
const TOP_CLUSTERS: usize = 5;

/// Wrap `base_prompt` with the retrieved evidence and analysis instructions.
pub fn enhance_prompt(query: &str, base_prompt: &str, context: &RetrievalContext) -> String {
    let mut sections = Vec::new();
    if !context.logs.is_empty() {
        sections.push(format_logs(&context.logs));
    }
    if !context.metrics.is_empty() {
        sections.push(format_metrics(&context.metrics));
    }
    if context.summary.total_items > 0 {
        sections.push(format_summary(&context.summary));
    }

    if sections.is_empty() {
        return format!("{}\n\nQuery: {}\n\n{}\n\nAnalysis:", base_prompt, query, ANALYSIS_INSTRUCTIONS);
    }

    format!(
        "Based on the following context:\n\n{}\n\nOriginal Query: {}\n\n{}\n\n{}\n\nAnalysis:",
        sections.join("\n\n"),
        query,
        base_prompt,
        ANALYSIS_INSTRUCTIONS
    )
}

fn format_logs(logs: &[RetrievedItem]) -> String {
    let mut out = String::from("Log Context:");
    for log in logs {
        let timestamp = log
            .metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown_time");
        let _ = write!(
            out,
            "\n- [{}] (Relevance: {:.2})\n  {}",
            timestamp,
            log.relevance_score,
            log.content.as_text()
        );
    }
    out
}

fn format_metrics(metrics: &[RetrievedItem]) -> String {
    let mut out = String::from("Metric Context:");
    for metric in metrics {
        let (name, value, unit) = match &metric.metric {
            Some(r) => (
                r.name.as_str(),
                r.value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string()),
                r.unit.as_str(),
            ),
            None => ("unknown", "N/A".to_string(), ""),
        };
        let _ = write!(
            out,
            "\n- {}: {}{} (Relevance: {:.2})",
            name, value, unit, metric.relevance_score
        );
    }
    out
}

fn format_summary(summary: &RetrievalSummary) -> String {
    let fmt_ts = |ts: Option<chrono::DateTime<chrono::Utc>>| {
        ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".to_string())
    };
    format!(
        "Context Summary:\n- Time Range: {} to {}\n- Total Items: {}\n- Logs: {}\n- Metrics: {}\n- Average Relevance: {:.2}",
        fmt_ts(summary.timestamp_range.start),
        fmt_ts(summary.timestamp_range.end),
        summary.total_items,
        summary.log_count,
        summary.metric_count,
        summary.avg_relevance
    )
}

/// Plain-text digest of an assembled context document.
pub fn render_analysis_context(doc: &ContextDocument) -> String {
    let mut out = String::new();

    if let Some(meta) = &doc.metadata {
        let _ = writeln!(out, "Query: {} ({})", meta.query, meta.time_range_label);
    }
    if let Some(err) = &doc.error {
        let _ = writeln!(out, "Context unavailable: {}", err);
        return out;
    }

    let _ = writeln!(
        out,
        "Logs: {} | Metrics: {} | Events: {}",
        doc.logs.len(),
        doc.metrics.len(),
        doc.events.len()
    );

    for (name, s) in &doc.metric_stats {
        let _ = writeln!(
            out,
            "- {}: min {:.2}, max {:.2}, avg {:.2} over {} samples",
            name, s.min, s.max, s.avg, s.count
        );
    }

    let Some(correlations) = &doc.correlations else {
        return out;
    };

    if !correlations.log_patterns.error_patterns.is_empty() {
        let patterns: Vec<String> = correlations
            .log_patterns
            .error_patterns
            .iter()
            .map(|(category, count)| format!("{:?}={}", category, count).to_lowercase())
            .collect();
        let _ = writeln!(out, "Error patterns: {}", patterns.join(", "));
    }

    for (pair, r) in &correlations.metric_correlations {
        let _ = writeln!(
            out,
            "Correlation {}: r={:.2} over {} samples",
            pair, r.coefficient, r.sample_size
        );
    }

    let mut clusters: Vec<_> = correlations.event_correlations.event_clusters.iter().collect();
    clusters.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));
    for (key, cluster) in clusters.into_iter().take(TOP_CLUSTERS) {
        let _ = writeln!(
            out,
            "Event cluster {}: {} events between {} and {}",
            key,
            cluster.count,
            cluster.first_seen.to_rfc3339(),
            cluster.last_seen.to_rfc3339()
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsight_core::models::{ItemSource, LogMessage, MetricReading};
    use serde_json::{json, Map};

    fn retrieved(source: ItemSource, score: f64) -> RetrievedItem {
        let mut metadata = Map::new();
        metadata.insert("timestamp".into(), json!("2024-03-01T10:00:00Z"));
        RetrievedItem {
            id: "x".into(),
            content: LogMessage::RawText("error: upstream timeout".into()),
            metadata,
            relevance_score: score,
            source,
            retrieved_at: Utc::now(),
            metric: (source == ItemSource::Metric).then(|| MetricReading {
                name: "cpu_usage".into(),
                value: Some(97.5),
                unit: "%".into(),
            }),
        }
    }

    #[test]
    fn test_enhance_prompt_sections() {
        let ctx = RetrievalContext {
            logs: vec![retrieved(ItemSource::Log, 0.912)],
            metrics: vec![retrieved(ItemSource::Metric, 0.8)],
            summary: RetrievalSummary {
                total_items: 2,
                log_count: 1,
                metric_count: 1,
                avg_relevance: 0.856,
                ..Default::default()
            },
        };
        let prompt = enhance_prompt("why is cpu high", "You are an SRE.", &ctx);
        assert!(prompt.starts_with("Based on the following context:"));
        assert!(prompt.contains("- [2024-03-01T10:00:00Z] (Relevance: 0.91)\n  error: upstream timeout"));
        assert!(prompt.contains("- cpu_usage: 97.5% (Relevance: 0.80)"));
        assert!(prompt.contains("- Average Relevance: 0.86"));
        assert!(prompt.contains("Original Query: why is cpu high"));
        assert!(prompt.contains("4. Specific recommendations"));
        assert!(prompt.ends_with("Analysis:"));
    }

    #[test]
    fn test_enhance_prompt_without_context() {
        let prompt = enhance_prompt("q", "base", &RetrievalContext::default());
        assert!(prompt.starts_with("base\n\nQuery: q"));
    }

    #[test]
    fn test_render_failed_document() {
        let text = render_analysis_context(&ContextDocument::failed("invalid time range"));
        assert!(text.contains("Context unavailable: invalid time range"));
    }
}
