//! Verdict computation and failure-artifact persistence.
//!
//! On a FAIL outcome three files land in the output directory for the
//! external tooling to pick up: the original frame, the annotated frame, and
//! a JSON record of the status and per-component outcomes.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::types::{ComponentResults, InspectionResult, PipelineStatus};

/// Overall outcome of one inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Error,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Serialize)]
struct FailureRecord<'a> {
    timestamp: &'a str,
    result: &'a str,
    status: &'a PipelineStatus,
    results: &'a ComponentResults,
}

/// Assembles verdicts and persists failure artifacts.
pub struct ResultPackager {
    output_dir: PathBuf,
}

impl ResultPackager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// PASS iff the pipeline executed and every component passed; FAIL iff
    /// it executed and any component failed; ERROR iff it did not execute.
    pub fn verdict(result: &InspectionResult) -> Verdict {
        if !result.status.is_executed() {
            Verdict::Error
        } else if result.results.values().all(|&v| v == 1) {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// Compute the verdict and, on FAIL, write the three failure artifacts.
    pub fn package(&self, result: &InspectionResult) -> Result<Verdict> {
        let verdict = Self::verdict(result);
        if verdict == Verdict::Fail {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            self.write_failure_artifacts(result, verdict, &stamp)?;
        }
        Ok(verdict)
    }

    fn write_failure_artifacts(
        &self,
        result: &InspectionResult,
        verdict: Verdict,
        stamp: &str,
    ) -> Result<()> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output directory {}", self.output_dir.display())
        })?;

        let original_path = self.output_dir.join(format!("fail_{stamp}_original.jpg"));
        let annotated_path = self.output_dir.join(format!("fail_{stamp}_annotated.jpg"));
        let record_path = self.output_dir.join(format!("fail_{stamp}_results.json"));

        result
            .original
            .save(&original_path)
            .with_context(|| format!("failed to write {}", original_path.display()))?;
        result
            .annotated
            .save(&annotated_path)
            .with_context(|| format!("failed to write {}", annotated_path.display()))?;

        let record = FailureRecord {
            timestamp: stamp,
            result: verdict.label(),
            status: &result.status,
            results: &result.results,
        };
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(&record_path, json)
            .with_context(|| format!("failed to write {}", record_path.display()))?;

        info!(
            original = %original_path.display(),
            annotated = %annotated_path.display(),
            record = %record_path.display(),
            "failure artifacts written"
        );
        Ok(())
    }
}
