use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{broker::SceneOutcome, target_quality::SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeEntry {
    pub crf:   i32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    pub index:           usize,
    pub start_frame:     usize,
    pub end_frame:       usize,
    pub crf:             i32,
    pub score:           f64,
    pub frame_scores:    Vec<f64>,
    /// Sorted by CRF.
    pub probes:          Vec<ProbeEntry>,
    pub elapsed_seconds: f64,
}

/// Per-scene results of a finished run, written as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub scenes:                Vec<SceneReport>,
    /// Mean of every per-frame score across the whole clip.
    pub mean_score:            Option<f64>,
    pub total_elapsed_seconds: f64,
}

impl SceneReport {
    #[inline]
    pub fn new(outcome: &SceneOutcome, result: &SearchResult) -> Self {
        Self {
            index:           outcome.index,
            start_frame:     outcome.scene.start_frame,
            end_frame:       outcome.scene.end_frame,
            crf:             result.crf,
            score:           result.score,
            frame_scores:    result.frame_scores.clone(),
            probes:          result
                .probes
                .iter()
                .map(|(crf, score)| ProbeEntry {
                    crf,
                    score,
                })
                .collect(),
            elapsed_seconds: outcome.elapsed.as_secs_f64(),
        }
    }
}

impl RunReport {
    /// Builds the report from successful outcomes, in chronological order.
    #[inline]
    pub fn new(outcomes: &[SceneOutcome], total_elapsed: Duration) -> Self {
        let scenes: Vec<SceneReport> = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.result.as_ref().ok().map(|result| SceneReport::new(outcome, result))
            })
            .collect();

        let (sum, count) = scenes
            .iter()
            .flat_map(|scene| &scene.frame_scores)
            .fold((0.0, 0_usize), |(sum, count), score| (sum + score, count + 1));
        let mean_score = (count > 0).then(|| sum / count as f64);

        Self {
            scenes,
            mean_score,
            total_elapsed_seconds: total_elapsed.as_secs_f64(),
        }
    }

    #[inline]
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let file =
            File::create(path).with_context(|| format!("Failed to create report {path:?}"))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write report {path:?}"))?;
        writer.flush().with_context(|| format!("Failed to write report {path:?}"))
    }
}
