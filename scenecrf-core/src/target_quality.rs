use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    cache::{CacheError, CacheKey, ProbeCache, ProbeRecord},
    control::SearchControl,
    encoder::{CodecConfig, CrfRange, EncodeClip, EncodeRequest, QualityDirection},
    input::{hash_file, Input},
    metrics::{Candidate, MeasureQuality, MeasureRequest},
    process::{ProcessChain, ToolError},
    scenes::Scene,
};

const fn default_target() -> f64 {
    94.0
}

const fn default_true() -> bool {
    true
}

const fn default_probing_rate() -> usize {
    2
}

const fn default_crf_step() -> u32 {
    1
}

/// Target quality settings shared by every scene search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetQuality {
    /// Score the search converges on.
    #[serde(default = "default_target")]
    pub target:           f64,
    /// Whether a larger metric value means better quality (true for VMAF).
    #[serde(default = "default_true")]
    pub higher_is_better: bool,
    /// Only every Nth frame is measured while probing.
    #[serde(default = "default_probing_rate")]
    pub probing_rate:     usize,
    /// Candidates are rounded down to multiples of this step.
    #[serde(default = "default_crf_step")]
    pub crf_step:         u32,
}

impl Default for TargetQuality {
    #[inline]
    fn default() -> Self {
        Self {
            target:           default_target(),
            higher_is_better: default_true(),
            probing_rate:     default_probing_rate(),
            crf_step:         default_crf_step(),
        }
    }
}

/// Terminal artifact of one scene search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Selected rate-control value.
    pub crf:          i32,
    /// Subsampled score measured for `crf` during the search.
    pub score:        f64,
    /// Per-frame scores of the final encode, every frame measured.
    pub frame_scores: Vec<f64>,
    /// Encoded scene, when the search was asked to keep one.
    pub output:       Option<PathBuf>,
    /// SHA-256 of `output` as it was written for `crf`.
    #[serde(default)]
    pub output_hash:  Option<String>,
    /// All probes the search made, for reporting.
    pub probes:       ProbeRecord,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("scene {scene}: {reason}")]
    Precondition { scene: Scene, reason: String },
    #[error("scene {scene}: encoding at CRF {crf} failed: {source}")]
    Encode {
        scene:  Scene,
        crf:    i32,
        #[source]
        source: ToolError,
    },
    #[error("scene {scene}: measuring quality at CRF {crf} failed: {source}")]
    Probe {
        scene:  Scene,
        crf:    i32,
        #[source]
        source: ToolError,
    },
    #[error("scene {scene}: search cancelled")]
    Cancelled { scene: Scene },
    #[error("scene {scene}: {source}")]
    Cache {
        scene:  Scene,
        #[source]
        source: CacheError,
    },
}

impl SearchError {
    #[inline]
    pub const fn scene(&self) -> Scene {
        match self {
            Self::Precondition {
                scene, ..
            }
            | Self::Encode {
                scene, ..
            }
            | Self::Probe {
                scene, ..
            }
            | Self::Cancelled {
                scene,
            }
            | Self::Cache {
                scene, ..
            } => *scene,
        }
    }
}

/// Everything a scene search needs besides its own settings. Shared by all
/// workers of a run.
#[derive(Clone, Copy)]
pub struct Searcher<'a> {
    pub input:        &'a Input,
    pub total_frames: usize,
    /// SHA-256 of the source bytes.
    pub source_hash:  &'a str,
    /// Encoder and metric options that change scores without being part of
    /// the codec config (pixel format, crop, model).
    pub pipeline:     &'a str,
    pub config:       &'a CodecConfig,
    pub encoder:      &'a dyn EncodeClip,
    pub prober:       &'a dyn MeasureQuality,
    pub cache:        &'a ProbeCache,
    pub control:      &'a SearchControl,
}

#[derive(Serialize)]
struct SearchKey<'a> {
    scene:            Scene,
    codec:            &'a CodecConfig,
    target:           f64,
    higher_is_better: bool,
    probing_rate:     usize,
    crf_step:         u32,
    source_hash:      &'a str,
    pipeline:         &'a str,
    output:           Option<&'a Path>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    ExactMatch,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tighten {
    Low,
    High,
}

impl TargetQuality {
    /// Bisects the CRF range of `searcher.config` for the value whose score
    /// is closest to the target.
    ///
    /// Every successful probe is persisted before the next one starts, so an
    /// interrupted search resumes from its recorded probes. A finished search
    /// is cached as a whole and returned without touching any external tool.
    /// When `output` is given the selected encode is left there.
    #[tracing::instrument(level = "debug", skip(self, searcher, scene), fields(scene = %scene))]
    #[inline]
    pub fn search(
        &self,
        searcher: &Searcher<'_>,
        scene: Scene,
        output: Option<&Path>,
    ) -> Result<SearchResult, SearchError> {
        // Ctrl-C also reaches the tools, so their failures after a cancel are
        // part of the cancel.
        self.search_scene(searcher, scene, output).map_err(|e| match e {
            SearchError::Encode { .. } | SearchError::Probe { .. }
                if searcher.control.is_cancelled() =>
            {
                debug!("scene {scene}: interrupted: {e}");
                SearchError::Cancelled {
                    scene,
                }
            },
            e => e,
        })
    }

    fn search_scene(
        &self,
        searcher: &Searcher<'_>,
        scene: Scene,
        output: Option<&Path>,
    ) -> Result<SearchResult, SearchError> {
        self.check_preconditions(searcher, scene)?;

        let cache_error = |source| SearchError::Cache {
            scene,
            source,
        };
        let probes_key =
            CacheKey::new("probes", &self.search_key(searcher, scene, None)).map_err(cache_error)?;
        let result_key = CacheKey::new("results", &self.search_key(searcher, scene, output))
            .map_err(cache_error)?;

        if let Some(mut result) = searcher.cache.load_result(&result_key) {
            debug!("scene {scene}: cached result, CRF {crf}", crf = result.crf);
            if let Some(path) = result.output.clone() {
                if !output_matches(&path, result.output_hash.as_deref()) {
                    info!(
                        "scene {scene}: output {path:?} is missing or was overwritten, encoding \
                         it again at CRF {crf}",
                        crf = result.crf
                    );
                    self.checkpoint(searcher, scene)?;
                    encode_to_file(searcher, scene, result.crf, &path)?;
                    result.output_hash = Some(output_hash(scene, &path)?);
                    searcher.cache.store_result(&result_key, &result).map_err(cache_error)?;
                }
            }
            return Ok(result);
        }

        let mut record = searcher.cache.load_probes(&probes_key).unwrap_or_default();
        if !record.is_empty() {
            info!(
                "scene {scene}: resuming search with {n} recorded probes",
                n = record.len()
            );
        }

        let range = searcher.config.crf_range;
        let direction = searcher.config.direction();
        let (mut low, mut high) = (range.min, range.max);
        let mut visited = BTreeSet::new();
        // CRF of the encode currently sitting at `output`
        let mut encoded = None;

        let stop = loop {
            let candidate = next_candidate(low, high, self.crf_step, range);
            if !visited.insert(candidate) {
                break StopReason::Repeated;
            }

            let score = if let Some(score) = record.get(candidate) {
                score
            } else {
                self.checkpoint(searcher, scene)?;
                let score = self.probe(searcher, scene, candidate, output)?;
                if output.is_some() {
                    encoded = Some(candidate);
                }
                record.insert(candidate, score);
                searcher.cache.store_probes(&probes_key, &record).map_err(cache_error)?;
                score
            };

            if (score.round() - self.target).abs() < f64::EPSILON {
                break StopReason::ExactMatch;
            }
            match self.tighten(score, direction) {
                Tighten::Low => low = candidate,
                Tighten::High => high = candidate,
            }
        };

        let Some((crf, score)) = record.closest(self.target) else {
            return Err(SearchError::Precondition {
                scene,
                reason: "no probe was recorded".to_owned(),
            });
        };
        self.log_probes(scene, &record, stop, crf, score);

        self.checkpoint(searcher, scene)?;
        let candidate = match output {
            Some(path) => {
                if encoded != Some(crf) || !path.exists() {
                    encode_to_file(searcher, scene, crf, path)?;
                }
                Candidate::File(path.to_path_buf())
            },
            None => Candidate::Stream(encode_to_stream(searcher, scene, crf)?),
        };
        let frame_scores = searcher
            .prober
            .per_frame(&MeasureRequest {
                input: searcher.input,
                scene,
                candidate: &candidate,
                subsample: 1,
            })
            .map_err(|source| SearchError::Probe {
                scene,
                crf,
                source,
            })?;

        let hash = output.map(|path| output_hash(scene, path)).transpose()?;
        let result = SearchResult {
            crf,
            score,
            frame_scores,
            output: output.map(Path::to_path_buf),
            output_hash: hash,
            probes: record,
        };
        searcher.cache.store_result(&result_key, &result).map_err(cache_error)?;
        searcher.cache.mark_ephemeral(&probes_key);

        Ok(result)
    }

    fn check_preconditions(&self, searcher: &Searcher<'_>, scene: Scene) -> Result<(), SearchError> {
        let fail = |reason: String| {
            Err(SearchError::Precondition {
                scene,
                reason,
            })
        };

        if scene.end_frame <= scene.start_frame {
            return fail("scene has no frames".to_owned());
        }
        if scene.end_frame > searcher.total_frames {
            return fail(format!(
                "scene ends past the last frame ({total})",
                total = searcher.total_frames
            ));
        }
        if searcher.config.crf_range.is_empty() {
            return fail(format!(
                "CRF range {range} is empty",
                range = searcher.config.crf_range
            ));
        }
        if self.probing_rate == 0 || self.crf_step == 0 {
            return fail("probing rate and CRF step must be at least 1".to_owned());
        }
        Ok(())
    }

    fn search_key<'a>(
        &self,
        searcher: &Searcher<'a>,
        scene: Scene,
        output: Option<&'a Path>,
    ) -> SearchKey<'a> {
        SearchKey {
            scene,
            codec: searcher.config,
            target: self.target,
            higher_is_better: self.higher_is_better,
            probing_rate: self.probing_rate,
            crf_step: self.crf_step,
            source_hash: searcher.source_hash,
            pipeline: searcher.pipeline,
            output,
        }
    }

    fn checkpoint(&self, searcher: &Searcher<'_>, scene: Scene) -> Result<(), SearchError> {
        searcher.control.checkpoint().map_err(|_| SearchError::Cancelled {
            scene,
        })
    }

    /// One encode-then-measure cycle at the probing rate.
    fn probe(
        &self,
        searcher: &Searcher<'_>,
        scene: Scene,
        crf: i32,
        output: Option<&Path>,
    ) -> Result<f64, SearchError> {
        let candidate = match output {
            Some(path) => {
                encode_to_file(searcher, scene, crf, path)?;
                Candidate::File(path.to_path_buf())
            },
            None => Candidate::Stream(encode_to_stream(searcher, scene, crf)?),
        };

        searcher
            .prober
            .aggregate(&MeasureRequest {
                input: searcher.input,
                scene,
                candidate: &candidate,
                subsample: self.probing_rate,
            })
            .map_err(|source| SearchError::Probe {
                scene,
                crf,
                source,
            })
    }

    /// Which bound moves after observing `score`.
    fn tighten(&self, score: f64, direction: QualityDirection) -> Tighten {
        let too_good = if self.higher_is_better {
            score > self.target
        } else {
            score < self.target
        };

        match (too_good, direction) {
            (true, QualityDirection::LowerIsBetter) | (false, QualityDirection::HigherIsBetter) => {
                Tighten::Low
            },
            (true, QualityDirection::HigherIsBetter) | (false, QualityDirection::LowerIsBetter) => {
                Tighten::High
            },
        }
    }

    fn log_probes(
        &self,
        scene: Scene,
        record: &ProbeRecord,
        stop: StopReason,
        crf: i32,
        score: f64,
    ) {
        debug!(
            "scene {scene}: Target={target}, P-Rate={rate}, Step={step}, {frames} frames
       TQ-Probes: {history:.2?}{suffix}
       Final CRF={crf}, Final Score={score:.2}",
            target = self.target,
            rate = self.probing_rate,
            step = self.crf_step,
            frames = scene.frames(),
            history = record.iter().collect::<Vec<_>>(),
            suffix = match stop {
                StopReason::ExactMatch => " Early Skip Exact Match",
                StopReason::Repeated => "",
            },
        );
    }
}

/// Midpoint of the bounds, floored to a multiple of `step` and kept inside
/// `range`.
fn next_candidate(low: i32, high: i32, step: u32, range: CrfRange) -> i32 {
    let step = i32::try_from(step.max(1)).unwrap_or(i32::MAX / 2);
    let midpoint = (low + high).div_euclid(2 * step) * step;
    midpoint.clamp(range.min, range.max)
}

/// Whether the file at `path` is still the encode whose hash was recorded.
/// Other runs over the same scene may write the same path.
fn output_matches(path: &Path, expected: Option<&str>) -> bool {
    match (expected, hash_file(path)) {
        (Some(expected), Ok(actual)) => expected == actual,
        _ => false,
    }
}

fn output_hash(scene: Scene, path: &Path) -> Result<String, SearchError> {
    hash_file(path).map_err(|source| SearchError::Cache {
        scene,
        source: CacheError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn request<'a>(searcher: &Searcher<'a>, scene: Scene, crf: i32) -> EncodeRequest<'a> {
    EncodeRequest {
        input: searcher.input,
        scene,
        config: searcher.config,
        crf,
    }
}

fn encode_to_file(
    searcher: &Searcher<'_>,
    scene: Scene,
    crf: i32,
    path: &Path,
) -> Result<(), SearchError> {
    searcher.encoder.encode_to_file(&request(searcher, scene, crf), path).map_err(|source| {
        SearchError::Encode {
            scene,
            crf,
            source,
        }
    })
}

fn encode_to_stream(
    searcher: &Searcher<'_>,
    scene: Scene,
    crf: i32,
) -> Result<ProcessChain, SearchError> {
    searcher.encoder.encode_to_stream(&request(searcher, scene, crf)).map_err(|source| {
        SearchError::Encode {
            scene,
            crf,
            source,
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::{
        encoder::{Codec, SvtAv1Tune},
        into_vec,
    };

    /// Fake encoder and prober. Encodes carry their CRF so the prober can
    /// score them with `score`.
    pub(crate) struct Harness {
        pub score:      fn(i32) -> f64,
        pub encodes:    AtomicUsize,
        pub aggregates: AtomicUsize,
        pub traces:     AtomicUsize,
        pub probed:     Mutex<Vec<i32>>,
        pub fail_at:    Option<i32>,
    }

    impl Harness {
        pub(crate) fn new(score: fn(i32) -> f64) -> Self {
            Self {
                score,
                encodes: AtomicUsize::new(0),
                aggregates: AtomicUsize::new(0),
                traces: AtomicUsize::new(0),
                probed: Mutex::new(Vec::new()),
                fail_at: None,
            }
        }

        pub(crate) fn invocations(&self) -> usize {
            self.encodes.load(Ordering::SeqCst)
                + self.aggregates.load(Ordering::SeqCst)
                + self.traces.load(Ordering::SeqCst)
        }

        fn crf_of(candidate: &Candidate) -> i32 {
            match candidate {
                Candidate::File(path) => fs::read_to_string(path).unwrap().parse().unwrap(),
                Candidate::Stream(chain) => {
                    chain.stages()[0][1].to_str().unwrap().parse().unwrap()
                },
            }
        }

        fn check(&self, crf: i32) -> Result<(), ToolError> {
            if self.fail_at == Some(crf) {
                return Err(ToolError::Missing {
                    tool: "fake-encoder".to_owned(),
                });
            }
            Ok(())
        }
    }

    impl EncodeClip for Harness {
        fn encode_to_file(
            &self,
            request: &EncodeRequest<'_>,
            output: &Path,
        ) -> Result<(), ToolError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            self.check(request.crf)?;
            fs::write(output, request.crf.to_string())?;
            Ok(())
        }

        fn encode_to_stream(&self, request: &EncodeRequest<'_>) -> Result<ProcessChain, ToolError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            self.check(request.crf)?;
            Ok(ProcessChain::new(into_vec!["fake-encoder", request.crf.to_string()]))
        }
    }

    impl MeasureQuality for Harness {
        fn aggregate(&self, request: &MeasureRequest<'_>) -> Result<f64, ToolError> {
            self.aggregates.fetch_add(1, Ordering::SeqCst);
            let crf = Self::crf_of(request.candidate);
            self.probed.lock().unwrap().push(crf);
            Ok((self.score)(crf))
        }

        fn per_frame(&self, request: &MeasureRequest<'_>) -> Result<Vec<f64>, ToolError> {
            self.traces.fetch_add(1, Ordering::SeqCst);
            let score = (self.score)(Self::crf_of(request.candidate));
            Ok(vec![score; request.scene.frames()])
        }
    }

    pub(crate) fn svt_config() -> CodecConfig {
        CodecConfig::new(
            Codec::SvtAv1 {
                preset:     8,
                tune:       SvtAv1Tune::Subjective,
                film_grain: None,
            },
            None,
        )
        .unwrap()
    }

    fn input() -> Input {
        Input::Video {
            path: PathBuf::from("source.mkv"),
        }
    }

    fn vmaf(target: f64) -> TargetQuality {
        TargetQuality {
            target,
            ..TargetQuality::default()
        }
    }

    fn searcher<'a>(
        input: &'a Input,
        config: &'a CodecConfig,
        harness: &'a Harness,
        cache: &'a ProbeCache,
        control: &'a SearchControl,
    ) -> Searcher<'a> {
        Searcher {
            input,
            total_frames: 1000,
            source_hash: "0123abcd",
            pipeline: "yuv420p10le",
            config,
            encoder: harness,
            prober: harness,
            cache,
            control,
        }
    }

    #[test]
    fn candidates_floor_to_step() {
        let range = CrfRange::new(0, 63);
        assert_eq!(next_candidate(0, 63, 1, range), 31);
        assert_eq!(next_candidate(0, 63, 4, range), 28);
        assert_eq!(next_candidate(-10, -3, 1, CrfRange::new(-10, -3)), -7);
        assert_eq!(next_candidate(62, 63, 5, range), 60);
    }

    #[test]
    fn converges_on_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|crf| 100.0 - f64::from(crf));

        let result = vmaf(90.0)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 100),
                None,
            )
            .unwrap();

        assert_eq!(result.crf, 10);
        assert_eq!(result.score, 90.0);
        assert_eq!(*harness.probed.lock().unwrap(), vec![31, 15, 7, 11, 9, 10]);
        assert_eq!(result.frame_scores, vec![90.0; 100]);
        assert_eq!(harness.traces.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_count_is_logarithmic() {
        let scorers: [fn(i32) -> f64; 4] = [
            |_| 100.0,
            |_| 0.0,
            |crf| 100.0 - f64::from(crf) * 0.37,
            |crf| 50.0 + f64::from(crf % 7),
        ];

        for max in [1, 2, 7, 40, 63, 100, 255] {
            for score in scorers {
                let dir = tempfile::tempdir().unwrap();
                let cache = ProbeCache::open(dir.path()).unwrap();
                let control = SearchControl::default();
                let input = input();
                let config = CodecConfig {
                    crf_range: CrfRange::new(0, max),
                    ..svt_config()
                };
                let harness = Harness::new(score);

                vmaf(77.7)
                    .search(
                        &searcher(&input, &config, &harness, &cache, &control),
                        Scene::new(0, 10),
                        None,
                    )
                    .unwrap();

                let bound = f64::from(max + 1).log2().ceil() as usize + 1;
                let probes = harness.aggregates.load(Ordering::SeqCst);
                assert!(probes <= bound, "{probes} probes over [0, {max}], bound {bound}");
            }
        }
    }

    #[test]
    fn second_search_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let scene = Scene::new(100, 200);

        let cache = ProbeCache::open(dir.path()).unwrap();
        let first = Harness::new(|crf| 100.0 - f64::from(crf));
        let expected = vmaf(90.0)
            .search(&searcher(&input, &config, &first, &cache, &control), scene, None)
            .unwrap();
        assert!(first.invocations() > 0);
        cache.close().unwrap();

        let cache = ProbeCache::open(dir.path()).unwrap();
        let second = Harness::new(|crf| 100.0 - f64::from(crf));
        let again = vmaf(90.0)
            .search(&searcher(&input, &config, &second, &cache, &control), scene, None)
            .unwrap();

        assert_eq!(again, expected);
        assert_eq!(second.invocations(), 0);
    }

    #[test]
    fn interrupted_search_resumes_from_recorded_probes() {
        let dir = tempfile::tempdir().unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let scene = Scene::new(0, 100);
        let cache = ProbeCache::open(dir.path()).unwrap();

        // the first run dies while encoding its fourth probe
        let crashing = Harness {
            fail_at: Some(11),
            ..Harness::new(|crf| 100.0 - f64::from(crf))
        };
        let err = vmaf(90.0)
            .search(&searcher(&input, &config, &crashing, &cache, &control), scene, None)
            .unwrap_err();
        assert!(matches!(err, SearchError::Encode { crf: 11, .. }));
        assert_eq!(*crashing.probed.lock().unwrap(), vec![31, 15, 7]);

        let resumed = Harness::new(|crf| 100.0 - f64::from(crf));
        let result = vmaf(90.0)
            .search(&searcher(&input, &config, &resumed, &cache, &control), scene, None)
            .unwrap();

        assert_eq!(result.crf, 10);
        assert_eq!(*resumed.probed.lock().unwrap(), vec![11, 9, 10]);
        assert_eq!(result.probes.len(), 6);
    }

    #[test]
    fn inverted_codec_still_converges() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, control) = (input(), SearchControl::default());
        let config = CodecConfig::new(Codec::HevcVideoToolbox, None).unwrap();
        let harness = Harness::new(f64::from);

        let result = vmaf(90.0)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 24),
                None,
            )
            .unwrap();

        assert_eq!(result.crf, 90);
        assert_eq!(*harness.probed.lock().unwrap(), vec![50, 75, 87, 93, 90]);
    }

    #[test]
    fn lower_is_better_metrics_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(f64::from);
        let target = TargetQuality {
            target: 20.0,
            higher_is_better: false,
            ..TargetQuality::default()
        };

        let result = target
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 24),
                None,
            )
            .unwrap();

        assert_eq!(result.crf, 20);
    }

    #[test]
    fn selected_crf_is_materialized_when_not_last_tried() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(&dir.path().join("cache")).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|crf| 100.6 - f64::from(crf));
        let output = dir.path().join("00000.mkv");

        let result = vmaf(91.4)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 48),
                Some(&output),
            )
            .unwrap();

        assert_eq!(*harness.probed.lock().unwrap(), vec![31, 15, 7, 11, 9, 10]);
        assert_eq!(result.crf, 9);
        assert_eq!(harness.encodes.load(Ordering::SeqCst), 7);
        assert_eq!(fs::read_to_string(&output).unwrap(), "9");
        assert_eq!(result.output.as_deref(), Some(output.as_path()));
    }

    #[test]
    fn missing_output_is_encoded_again_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(&dir.path().join("cache")).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let output = dir.path().join("00000.mkv");
        let scene = Scene::new(0, 48);

        let first = Harness::new(|crf| 100.0 - f64::from(crf));
        vmaf(90.0)
            .search(&searcher(&input, &config, &first, &cache, &control), scene, Some(&output))
            .unwrap();
        fs::remove_file(&output).unwrap();

        let second = Harness::new(|crf| 100.0 - f64::from(crf));
        let result = vmaf(90.0)
            .search(&searcher(&input, &config, &second, &cache, &control), scene, Some(&output))
            .unwrap();

        assert_eq!(result.crf, 10);
        assert_eq!(second.encodes.load(Ordering::SeqCst), 1);
        assert_eq!(second.aggregates.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read_to_string(&output).unwrap(), "10");
    }

    #[test]
    fn overwritten_output_is_encoded_again_at_cached_crf() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(&dir.path().join("cache")).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let output = dir.path().join("00000.mkv");
        let scene = Scene::new(0, 48);
        let score: fn(i32) -> f64 = |crf| 100.0 - f64::from(crf);

        let first = Harness::new(score);
        let expected = vmaf(90.0)
            .search(&searcher(&input, &config, &first, &cache, &control), scene, Some(&output))
            .unwrap();
        assert_eq!(expected.crf, 10);

        // a run with other settings writes the same scene file
        let other = Harness::new(score);
        let stricter = vmaf(95.0)
            .search(&searcher(&input, &config, &other, &cache, &control), scene, Some(&output))
            .unwrap();
        assert_eq!(stricter.crf, 5);
        assert_eq!(fs::read_to_string(&output).unwrap(), "5");

        let third = Harness::new(score);
        let again = vmaf(90.0)
            .search(&searcher(&input, &config, &third, &cache, &control), scene, Some(&output))
            .unwrap();

        assert_eq!(again.crf, 10);
        assert_eq!(again.output_hash, expected.output_hash);
        assert_eq!(fs::read_to_string(&output).unwrap(), "10");
        assert_eq!(third.encodes.load(Ordering::SeqCst), 1);
        assert_eq!(third.aggregates.load(Ordering::SeqCst), 0);

        let fourth = Harness::new(score);
        vmaf(90.0)
            .search(&searcher(&input, &config, &fourth, &cache, &control), scene, Some(&output))
            .unwrap();
        assert_eq!(fourth.invocations(), 0);
    }

    #[test]
    fn prober_failure_is_fatal_and_not_cached() {
        struct BrokenProber;
        impl MeasureQuality for BrokenProber {
            fn aggregate(&self, _: &MeasureRequest<'_>) -> Result<f64, ToolError> {
                Err(ToolError::Parse {
                    tool:     "ffmpeg libvmaf".to_owned(),
                    expected: "a VMAF score",
                })
            }

            fn per_frame(&self, _: &MeasureRequest<'_>) -> Result<Vec<f64>, ToolError> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|_| 0.0);
        let searcher = Searcher {
            prober: &BrokenProber,
            ..searcher(&input, &config, &harness, &cache, &control)
        };

        let err = vmaf(90.0).search(&searcher, Scene::new(0, 10), None).unwrap_err();
        assert!(matches!(err, SearchError::Probe { crf: 31, .. }));
        assert!(!dir.path().join("probes").exists());
    }

    #[test]
    fn cancelled_search_stops_before_probing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|crf| 100.0 - f64::from(crf));
        control.cancel();

        let err = vmaf(90.0)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 10),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SearchError::Cancelled { .. }));
        assert_eq!(harness.invocations(), 0);
    }

    #[test]
    fn tool_failures_after_cancel_count_as_cancelled() {
        /// Stands in for an encoder killed by the same Ctrl-C that cancels the run.
        struct Interrupted<'a> {
            control: &'a SearchControl,
        }

        impl EncodeClip for Interrupted<'_> {
            fn encode_to_file(&self, _: &EncodeRequest<'_>, _: &Path) -> Result<(), ToolError> {
                unreachable!()
            }

            fn encode_to_stream(&self, _: &EncodeRequest<'_>) -> Result<ProcessChain, ToolError> {
                self.control.cancel();
                Err(ToolError::Missing {
                    tool: "ffmpeg".to_owned(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|_| 0.0);
        let encoder = Interrupted {
            control: &control,
        };
        let searcher = Searcher {
            encoder: &encoder,
            ..searcher(&input, &config, &harness, &cache, &control)
        };

        let err = vmaf(90.0).search(&searcher, Scene::new(0, 10), None).unwrap_err();
        assert!(matches!(err, SearchError::Cancelled { .. }));
        assert!(!dir.path().join("probes").exists());
    }

    #[test]
    fn tool_failures_without_cancel_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness {
            fail_at: Some(31),
            ..Harness::new(|_| 0.0)
        };

        let err = vmaf(90.0)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(0, 10),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SearchError::Encode { crf: 31, .. }));
    }

    #[test]
    fn scenes_past_the_clip_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let (input, config, control) = (input(), svt_config(), SearchControl::default());
        let harness = Harness::new(|_| 0.0);

        let err = vmaf(90.0)
            .search(
                &searcher(&input, &config, &harness, &cache, &control),
                Scene::new(990, 1010),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SearchError::Precondition { .. }));
        assert_eq!(harness.invocations(), 0);
    }
}
