use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::{scenes::Scene, Verbosity};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} scenes ({eta}) {msg}";

/// Scene-level progress of a run, drawn on stderr.
#[derive(Debug, Clone)]
pub struct SceneProgress {
    bar: ProgressBar,
}

impl SceneProgress {
    #[inline]
    pub fn new(total_scenes: usize, verbosity: Verbosity) -> Self {
        let bar = if verbosity == Verbosity::Quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::with_draw_target(
                Some(total_scenes as u64),
                ProgressDrawTarget::stderr(),
            );
            bar.set_style(
                ProgressStyle::with_template(PROGRESS_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            bar
        };
        Self {
            bar,
        }
    }

    #[inline]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    #[inline]
    pub fn scene_done(&self, scene: Scene, crf: i32) {
        self.bar.set_message(format!("{scene} CRF {crf}"));
        self.bar.inc(1);
    }

    #[inline]
    pub fn scene_failed(&self, scene: Scene) {
        self.bar.set_message(format!("{scene} failed"));
        self.bar.inc(1);
    }

    /// Runs `f` with the bar cleared so log lines don't tear it.
    #[inline]
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.bar.suspend(f)
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    #[inline]
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
