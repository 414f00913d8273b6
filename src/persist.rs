use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::branch::{BranchOutcome, BranchReport};
use crate::error::DriftError;
use crate::metrics::MetricRecord;
use crate::types::ChatMessage;

/// Writes one JSON line per finished branch under `<out>/transcripts/`.
pub struct TranscriptWriter {
    dir: PathBuf,
}

#[derive(Serialize)]
struct TranscriptRow<'a> {
    run_id: &'a str,
    scenario: &'a str,
    branch: &'a str,
    model: &'a str,
    outcome: BranchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    messages: &'a [ChatMessage],
    total_tokens: u32,
    total_cost_usd: f64,
    timestamp: String,
}

impl TranscriptWriter {
    pub fn new(out_dir: &Path) -> Result<Self, DriftError> {
        let dir = out_dir.join("transcripts");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn write(&self, run_id: &str, report: &BranchReport) -> Result<PathBuf, DriftError> {
        let filename = format!("{}_{}_{}.jsonl", report.scenario, report.branch, run_id);
        let path = self.dir.join(filename);

        let row = TranscriptRow {
            run_id,
            scenario: &report.scenario,
            branch: &report.branch,
            model: &report.model,
            outcome: report.outcome,
            error: report.error.as_deref(),
            messages: report.state.messages(),
            total_tokens: report.state.total_tokens(),
            total_cost_usd: report.state.cost_usd(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let file = File::options().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &row)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(path)
    }
}

/// Flattens metric records into one CSV: fixed provenance columns followed
/// by the union of evaluator keys in first-seen order.
pub fn write_metrics_csv(path: &Path, records: &[MetricRecord]) -> Result<(), DriftError> {
    let mut keys: Vec<&str> = Vec::new();
    for record in records {
        for key in record.values.keys() {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec![
        "run_id",
        "scenario",
        "model",
        "branch",
        "turn",
        "recorded_at",
        "tokens_primary",
        "tokens_probes",
        "cost_usd",
        "error",
    ];
    header.extend(&keys);
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.run_id.clone(),
            record.scenario.clone(),
            record.model.clone(),
            record.branch.clone(),
            record.turn.to_string(),
            record.recorded_at.to_rfc3339(),
            record.tokens_primary.to_string(),
            record.tokens_probes.to_string(),
            record.cost_usd.to_string(),
            record.error.clone().unwrap_or_default(),
        ];
        for key in &keys {
            row.push(
                record
                    .values
                    .get(*key)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::history::ConversationState;
    use crate::metrics::MetricValue;

    fn record(branch: &str, turn: usize, keys: &[(&str, MetricValue)]) -> MetricRecord {
        MetricRecord {
            run_id: "r1".to_string(),
            scenario: "s".to_string(),
            model: "m".to_string(),
            branch: branch.to_string(),
            turn,
            recorded_at: Utc::now(),
            tokens_primary: 10,
            tokens_probes: 0,
            cost_usd: 0.0,
            error: None,
            values: keys
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn csv_takes_union_of_metric_keys() {
        let dir = std::env::temp_dir().join("driftwerk-csv-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metrics.csv");

        let records = vec![
            record("baseline", 0, &[("pushback", MetricValue::Int(1))]),
            record(
                "anchor_guard",
                0,
                &[
                    ("polarity", MetricValue::Float(0.5)),
                    ("pushback", MetricValue::Int(0)),
                ],
            ),
        ];
        write_metrics_csv(&path, &records).expect("write");

        let content = fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.ends_with("pushback,polarity"));
        assert_eq!(content.lines().count(), 3);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn transcript_rows_are_json_lines() {
        let dir = std::env::temp_dir().join("driftwerk-transcript-test");
        fs::create_dir_all(&dir).unwrap();

        let writer = TranscriptWriter::new(&dir).expect("mkdir");
        let mut state = ConversationState::new("baseline", "m");
        state.push_user("hi");
        state.push_assistant("hello");

        let report = BranchReport {
            scenario: "s".to_string(),
            model: "m".to_string(),
            branch: "baseline".to_string(),
            outcome: BranchOutcome::Completed,
            error: None,
            state,
        };
        let path = writer.write("r1", &report).expect("write");

        let content = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["branch"], "baseline");
        assert_eq!(parsed["outcome"], "completed");
        assert_eq!(parsed["messages"].as_array().unwrap().len(), 2);
        fs::remove_dir_all(&dir).ok();
    }
}
