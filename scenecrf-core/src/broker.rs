use std::{
    cmp::Reverse,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use rand::{prelude::SliceRandom, rng};
use tracing::{debug, error};

use crate::{
    progress_bar::SceneProgress,
    scenes::Scene,
    target_quality::{SearchError, SearchResult, Searcher, TargetQuality},
    ChunkOrdering,
};

/// One scene waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneTask {
    /// Chronological position of the scene.
    pub index:  usize,
    pub scene:  Scene,
    /// Where the final encode goes, `None` when nothing is rendered.
    pub output: Option<PathBuf>,
}

impl SceneTask {
    #[inline]
    pub fn frames(&self) -> usize {
        self.scene.frames()
    }
}

#[derive(Debug)]
pub struct SceneOutcome {
    pub index:   usize,
    pub scene:   Scene,
    pub result:  Result<SearchResult, SearchError>,
    pub elapsed: Duration,
}

/// Hands scenes to a fixed pool of workers, each running one scene search at
/// a time.
pub struct Broker<'a> {
    pub searcher: Searcher<'a>,
    pub target:   TargetQuality,
    pub progress: &'a SceneProgress,
}

/// Formats a file name for a scene index, e.g. `00042`.
#[inline]
pub fn scene_id(index: usize) -> String {
    format!("{index:05}")
}

/// Reorders the queue; results are reassembled by index afterwards.
#[inline]
pub fn order_tasks(tasks: &mut [SceneTask], ordering: ChunkOrdering) {
    match ordering {
        ChunkOrdering::LongestFirst => {
            tasks.sort_by_key(|task| Reverse(task.frames()));
        },
        ChunkOrdering::ShortestFirst => {
            tasks.sort_by_key(SceneTask::frames);
        },
        ChunkOrdering::Sequential => {
            tasks.sort_by_key(|task| task.index);
        },
        ChunkOrdering::Random => {
            tasks.shuffle(&mut rng());
        },
    }
}

impl Broker<'_> {
    /// Runs every task on `workers` threads and returns one outcome per
    /// task, sorted by scene index. A failing scene does not stop the others.
    #[tracing::instrument(level = "debug", skip(self, tasks), fields(tasks = tasks.len()))]
    #[inline]
    pub fn run(&self, tasks: Vec<SceneTask>, workers: usize) -> anyhow::Result<Vec<SceneOutcome>> {
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let total = tasks.len();
        for task in tasks {
            task_tx.send(task)?;
        }
        drop(task_tx);

        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
        crossbeam_utils::thread::scope(|s| {
            for worker in 0..workers.clamp(1, total.max(1)) {
                let task_rx = task_rx.clone();
                let outcome_tx = outcome_tx.clone();
                s.spawn(move |_| {
                    for task in task_rx {
                        debug!("worker {worker} takes scene {index}", index = task.index);
                        let outcome = self.run_task(task);
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
        })
        .map_err(|_| anyhow!("A scene worker panicked"))?;
        drop(outcome_tx);

        let mut outcomes: Vec<SceneOutcome> = outcome_rx.into_iter().collect();
        outcomes.sort_by_key(|outcome| outcome.index);
        Ok(outcomes)
    }

    fn run_task(&self, task: SceneTask) -> SceneOutcome {
        let started = Instant::now();
        let result = self.target.search(&self.searcher, task.scene, task.output.as_deref());

        match &result {
            Ok(result) => self.progress.scene_done(task.scene, result.crf),
            Err(e) => {
                if !matches!(e, SearchError::Cancelled { .. }) {
                    self.progress.suspend(|| error!("[scene {index}] {e}", index = task.index));
                }
                self.progress.scene_failed(task.scene);
            },
        }

        SceneOutcome {
            index: task.index,
            scene: task.scene,
            result,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::atomic::Ordering};

    use super::*;
    use crate::{
        cache::ProbeCache,
        control::SearchControl,
        encoder::{CodecConfig, EncodeClip, EncodeRequest},
        input::Input,
        process::{ProcessChain, ToolError},
        target_quality::tests::{svt_config, Harness},
    };

    fn tasks(lengths: &[usize]) -> Vec<SceneTask> {
        let mut start = 0;
        lengths
            .iter()
            .enumerate()
            .map(|(index, len)| {
                let scene = Scene::new(start, start + len);
                start += len;
                SceneTask {
                    index,
                    scene,
                    output: None,
                }
            })
            .collect()
    }

    fn indices(tasks: &[SceneTask]) -> Vec<usize> {
        tasks.iter().map(|task| task.index).collect()
    }

    #[test]
    fn ordering_sorts_by_length() {
        let mut queue = tasks(&[10, 30, 20]);
        order_tasks(&mut queue, ChunkOrdering::LongestFirst);
        assert_eq!(indices(&queue), vec![1, 2, 0]);

        order_tasks(&mut queue, ChunkOrdering::ShortestFirst);
        assert_eq!(indices(&queue), vec![0, 2, 1]);

        order_tasks(&mut queue, ChunkOrdering::Random);
        order_tasks(&mut queue, ChunkOrdering::Sequential);
        assert_eq!(indices(&queue), vec![0, 1, 2]);
    }

    #[test]
    fn scene_ids_are_zero_padded() {
        assert_eq!(scene_id(7), "00007");
        assert_eq!(scene_id(123_456), "123456");
    }

    struct Fixture {
        _dir:    tempfile::TempDir,
        input:   Input,
        config:  CodecConfig,
        cache:   ProbeCache,
        control: SearchControl,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = ProbeCache::open(dir.path()).unwrap();
            Self {
                _dir: dir,
                input: Input::Video {
                    path: "source.mkv".into(),
                },
                config: svt_config(),
                cache,
                control: SearchControl::default(),
            }
        }

        fn searcher<'a>(
            &'a self,
            encoder: &'a dyn EncodeClip,
            harness: &'a Harness,
        ) -> Searcher<'a> {
            Searcher {
                input: &self.input,
                total_frames: 300,
                source_hash: "feedface",
                pipeline: "yuv420p10le",
                config: &self.config,
                encoder,
                prober: harness,
                cache: &self.cache,
                control: &self.control,
            }
        }
    }

    fn vmaf_90() -> TargetQuality {
        TargetQuality {
            target: 90.0,
            ..TargetQuality::default()
        }
    }

    #[test]
    fn every_scene_converges_and_results_are_chronological() {
        let fixture = Fixture::new();
        let harness = Harness::new(|crf| 100.0 - f64::from(crf));
        let progress = SceneProgress::hidden();
        let broker = Broker {
            searcher: fixture.searcher(&harness, &harness),
            target:   vmaf_90(),
            progress: &progress,
        };

        let mut queue = tasks(&[100, 100, 100]);
        order_tasks(&mut queue, ChunkOrdering::Random);
        let outcomes = broker.run(queue, 2).unwrap();

        assert_eq!(outcomes.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        for outcome in &outcomes {
            let result = outcome.result.as_ref().unwrap();
            assert_eq!(result.crf, 10);
            assert!(result.probes.len() <= 6);
        }
        assert!(harness.aggregates.load(Ordering::SeqCst) <= 18);
        assert_eq!(progress.position(), 3);
    }

    /// Delegates to the harness but refuses to encode one scene.
    struct BrokenScene<'a> {
        harness: &'a Harness,
        start:   usize,
    }

    impl EncodeClip for BrokenScene<'_> {
        fn encode_to_file(
            &self,
            request: &EncodeRequest<'_>,
            output: &Path,
        ) -> Result<(), ToolError> {
            self.harness.encode_to_file(request, output)
        }

        fn encode_to_stream(&self, request: &EncodeRequest<'_>) -> Result<ProcessChain, ToolError> {
            if request.scene.start_frame == self.start {
                return Err(ToolError::Missing {
                    tool: "ffmpeg".to_owned(),
                });
            }
            self.harness.encode_to_stream(request)
        }
    }

    #[test]
    fn failing_scene_does_not_stop_the_others() {
        let fixture = Fixture::new();
        let harness = Harness::new(|crf| 100.0 - f64::from(crf));
        let encoder = BrokenScene {
            harness: &harness,
            start:   100,
        };
        let progress = SceneProgress::hidden();
        let broker = Broker {
            searcher: fixture.searcher(&encoder, &harness),
            target:   vmaf_90(),
            progress: &progress,
        };

        let outcomes = broker.run(tasks(&[100, 100, 100]), 3).unwrap();

        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(SearchError::Encode { crf: 31, .. })
        ));
        assert!(outcomes[2].result.is_ok());
    }

    #[test]
    fn cancelled_runs_drain_the_queue() {
        let fixture = Fixture::new();
        fixture.control.cancel();
        let harness = Harness::new(|crf| 100.0 - f64::from(crf));
        let progress = SceneProgress::hidden();
        let broker = Broker {
            searcher: fixture.searcher(&harness, &harness),
            target:   vmaf_90(),
            progress: &progress,
        };

        let outcomes = broker.run(tasks(&[50, 50]), 4).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.result, Err(SearchError::Cancelled { .. }))));
        assert_eq!(harness.invocations(), 0);
    }
}
