//! Report generation for test results

use crate::config::RunConfig;
use crate::metrics::EpochSummary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Results of one test phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Algorithm under test
    pub algorithm: String,
    /// Whether the run used one slot per role
    pub multi_slot: bool,
    /// Number of slots tested
    pub slots: usize,
    /// Per-epoch cumulative averages
    pub epochs: Vec<EpochSummary>,
    /// Timestamp of the test run
    pub timestamp: String,
}

impl TestReport {
    /// Generate a report from the epoch summaries of a test phase
    pub fn generate(config: &RunConfig, slots: usize, epochs: &[EpochSummary]) -> Self {
        Self {
            algorithm: config.run.algorithm.to_string(),
            multi_slot: config.run.multi_slot,
            slots,
            epochs: epochs.to_vec(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Format report as markdown
    pub fn to_markdown(&self) -> String {
        let bifurcated = self.epochs.iter().any(|e| e.secondary_accuracy.is_some());

        let mut md = String::new();
        md.push_str("# Test Report\n\n");
        md.push_str(&format!("**Timestamp**: {}\n\n", self.timestamp));
        md.push_str(&format!("**Algorithm**: {}\n\n", self.algorithm));
        md.push_str(&format!(
            "**Slots**: {}{}\n\n",
            self.slots,
            if self.multi_slot { " (multi-slot)" } else { "" }
        ));
        md.push_str("## Epochs\n\n");
        if bifurcated {
            md.push_str("| Epoch | Batches | Counted | Loss | Accuracy (slot 0) | Accuracy (other slots) |\n");
            md.push_str("|-------|---------|---------|------|-------------------|------------------------|\n");
        } else {
            md.push_str("| Epoch | Batches | Counted | Loss | Accuracy |\n");
            md.push_str("|-------|---------|---------|------|----------|\n");
        }

        for epoch in &self.epochs {
            md.push_str(&format!(
                "| {} | {} | {} | {:.4} | {:.2}% |",
                epoch.epoch,
                epoch.batches,
                epoch.counted,
                epoch.loss,
                epoch.accuracy * 100.0
            ));
            if let Some(secondary) = epoch.secondary_accuracy {
                md.push_str(&format!(" {:.2}% |", secondary * 100.0));
            }
            md.push('\n');
        }

        md
    }

    /// Write `test_report.json` and `test_report.md` into `dir`
    ///
    /// # Returns
    /// Path of the JSON report
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;

        let json_path = dir.join("test_report.json");
        let json = serde_json::to_string_pretty(self).context("Failed to serialize test report")?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("Failed to write report: {}", json_path.display()))?;

        let md_path = dir.join("test_report.md");
        std::fs::write(&md_path, self.to_markdown())
            .with_context(|| format!("Failed to write report: {}", md_path.display()))?;

        Ok(json_path)
    }
}
