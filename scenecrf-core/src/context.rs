use std::{
    borrow::Cow,
    fmt::Write as _,
    path::{Path, PathBuf},
    thread::available_parallelism,
    time::Instant,
};

use anyhow::{bail, ensure, Context, Result};
use colored::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    broker::{order_tasks, scene_id, Broker, SceneOutcome, SceneTask},
    cache::ProbeCache,
    concat,
    control::SearchControl,
    create_dir,
    encoder::{Codec, CodecConfig, FfmpegEncoder},
    ffmpeg::{self, ClipInfo, FFPixelFormat},
    metrics::vmaf::VmafProber,
    process::ensure_tool,
    progress_bar::SceneProgress,
    report::RunReport,
    scene_detect::{self, SplitMethod},
    scenes::{read_scenes_file, validate_partition, write_scenes_file, Scene},
    settings::{SceneSettings, Settings},
    target_quality::{SearchError, Searcher},
    Input,
};

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub report:      RunReport,
    pub report_path: PathBuf,
    /// The joined encode, when rendering.
    pub output:      Option<PathBuf>,
}

/// A validated run: settings, probed source and the codec config every
/// scene search shares.
#[derive(Debug)]
pub struct SceneCrfContext {
    pub settings:  Settings,
    pub input:     Input,
    pub clip_info: ClipInfo,
    pub config:    CodecConfig,
    pub crop:      Option<String>,
    pub control:   SearchControl,
}

#[derive(Serialize)]
struct PipelineFingerprint<'a> {
    pix_format: FFPixelFormat,
    keyint:     Option<u32>,
    crop:       Option<&'a str>,
    vmaf_model: Option<&'a Path>,
}

impl SceneCrfContext {
    /// Validates `settings` and probes the source. Nothing is encoded yet.
    #[tracing::instrument(level = "debug", skip_all)]
    #[inline]
    pub fn new(settings: Settings, control: SearchControl) -> Result<Self> {
        validate_settings(&settings)?;

        let input = settings.input();
        let clip_info = input
            .clip_info()
            .with_context(|| format!("Failed to read clip info of {:?}", input.as_path()))?;
        ensure!(clip_info.num_frames > 0, "Input {:?} has no frames", input.as_path());
        ensure!(
            clip_info.frame_rate.is_finite() && clip_info.frame_rate > 0.0,
            "Input {:?} has an invalid frame rate",
            input.as_path()
        );
        info!(
            "Input: {frames} frames @ {fps:.3} fps",
            frames = clip_info.num_frames,
            fps = clip_info.frame_rate
        );

        let config = CodecConfig::new(settings.encoder.codec.clone(), settings.encoder.crf_range)?;
        let crop = Self::resolve_crop(&settings, &input)?;

        let this = Self {
            settings,
            input,
            clip_info,
            config,
            crop,
            control,
        };
        this.initialize()?;
        Ok(this)
    }

    fn resolve_crop(settings: &Settings, input: &Input) -> Result<Option<String>> {
        if let Some(crop) = &settings.encoder.crop {
            return Ok(Some(crop.clone()));
        }
        if !settings.encoder.detect_crop {
            return Ok(None);
        }
        if input.is_vapoursynth() {
            warn!("crop detection is skipped for VapourSynth input, crop in the script instead");
            return Ok(None);
        }

        let crop = ffmpeg::detect_crop(input.as_path(), settings.encoder.crop_sample_seconds)
            .context("Crop detection failed")?;
        match &crop {
            Some(crop) => info!("detected {crop}"),
            None => debug!("no black bars detected"),
        }
        Ok(crop)
    }

    /// Creates the temporary and cache directories
    fn initialize(&self) -> Result<()> {
        let temp = &self.settings.io.temp;
        create_dir!(temp).with_context(|| format!("Failed to create {temp:?}"))?;
        create_dir!(temp.join("encode"))?;
        create_dir!(self.settings.cache_dir())?;
        debug!("temporary directory: {temp:?}");
        Ok(())
    }

    fn pipeline_fingerprint(&self) -> Result<String> {
        Ok(serde_json::to_string(&PipelineFingerprint {
            pix_format: self.settings.encoder.pix_format,
            keyint:     self.settings.encoder.keyint,
            crop:       self.crop.as_deref(),
            vmaf_model: self.settings.target_quality.vmaf_model.as_deref(),
        })?)
    }

    fn encoder(&self) -> FfmpegEncoder {
        FfmpegEncoder {
            pix_format: self.settings.encoder.pix_format,
            keyint:     self.settings.encoder.keyint,
            crop:       self.crop.clone(),
            timeout:    self.settings.process_timeout(),
        }
    }

    fn prober(&self) -> VmafProber {
        VmafProber {
            frame_rate: self.clip_info.frame_rate,
            threads:    self.settings.target_quality.vmaf_threads(),
            model:      self.settings.target_quality.vmaf_model.clone(),
            pix_format: self.settings.encoder.pix_format,
            crop:       self.crop.clone(),
            log_dir:    self.settings.io.temp.join("vmaf"),
            timeout:    self.settings.process_timeout(),
        }
    }

    /// Splits the source, searches every scene and, when rendering, joins the
    /// selected encodes into the output.
    #[tracing::instrument(skip(self))]
    #[inline]
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let settings = &self.settings;

        let scenes = resolve_scenes(
            &settings.scenes,
            &settings.io.temp,
            &self.input,
            &self.clip_info,
        )?;

        info!("hashing source");
        let source_hash = self
            .input
            .content_hash()
            .with_context(|| format!("Failed to hash {:?}", self.input.as_path()))?;
        let pipeline = self.pipeline_fingerprint()?;

        let encode_dir = settings.io.temp.join("encode");
        let mut tasks: Vec<SceneTask> = scenes
            .iter()
            .enumerate()
            .map(|(index, &scene)| SceneTask {
                index,
                scene,
                output: settings
                    .run
                    .render
                    .then(|| encode_dir.join(format!("{id}.mkv", id = scene_id(index)))),
            })
            .collect();
        order_tasks(&mut tasks, settings.run.chunk_order);

        let workers = match settings.run.workers {
            0 => determine_workers(&self.config.codec),
            workers => workers,
        }
        .min(tasks.len());

        info!(
            "\n{}{} {} {}{} {} {}{} {} {}{} {}\n{}: {}",
            "S".green().bold(),
            "cenes".green(),
            format!("{len}", len = tasks.len()).green().bold(),
            "W".blue().bold(),
            "orkers".blue(),
            format!("{workers}").blue().bold(),
            "E".purple().bold(),
            "ncoder".purple(),
            format!("{codec}", codec = self.config.codec).purple().bold(),
            "T".purple().bold(),
            "arget".purple(),
            format!("{target}", target = settings.target_quality.search.target).purple().bold(),
            "CRF range".bold(),
            format!("{range}", range = self.config.crf_range).dimmed()
        );

        let cache = ProbeCache::open(&settings.cache_dir())?;
        let encoder = self.encoder();
        let prober = self.prober();
        let progress = SceneProgress::new(tasks.len(), settings.run.verbosity);
        let broker = Broker {
            searcher: Searcher {
                input:        &self.input,
                total_frames: self.clip_info.num_frames,
                source_hash:  &source_hash,
                pipeline:     &pipeline,
                config:       &self.config,
                encoder:      &encoder,
                prober:       &prober,
                cache:        &cache,
                control:      &self.control,
            },
            target:   settings.target_quality.search,
            progress: &progress,
        };

        let outcomes = broker.run(tasks, workers);
        progress.finish();
        let removed = cache.close()?;
        debug!("removed {removed} finished probe records");
        let outcomes = outcomes?;

        let report = RunReport::new(&outcomes, started.elapsed());
        let report_path = settings.report_path();
        report.write(&report_path)?;
        info!("report written to {report_path:?}");

        if let Some(failures) = failure_summary(&outcomes) {
            bail!("{failures}");
        }

        let output = if settings.run.render {
            let scene_paths: Vec<PathBuf> = outcomes
                .iter()
                .filter_map(|outcome| outcome.result.as_ref().ok())
                .filter_map(|result| result.output.clone())
                .collect();
            concat::ffmpeg(&settings.io.temp, &settings.io.output, &scene_paths)?;
            info!("output written to {output:?}", output = settings.io.output);
            Some(settings.io.output.clone())
        } else {
            None
        };

        if let Some(mean) = report.mean_score {
            info!(
                "mean score {mean:.3} over {n} scenes in {elapsed:.1}s",
                n = report.scenes.len(),
                elapsed = report.total_elapsed_seconds
            );
        }

        Ok(RunSummary {
            report,
            report_path,
            output,
        })
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let input = settings.input();
    ensure!(
        input.as_path().exists(),
        "Input file {:?} does not exist!",
        input.as_path()
    );
    for tool in input.required_tools() {
        ensure_tool(tool)?;
    }

    let tq = &settings.target_quality;
    ensure!(
        tq.search.target.is_finite() && tq.search.target > 0.0,
        "Target score must be a positive number, got {}",
        tq.search.target
    );
    ensure!(tq.search.probing_rate >= 1, "Probing rate must be at least 1");
    ensure!(tq.search.crf_step >= 1, "CRF step must be at least 1");
    ensure!(tq.vmaf_threads != Some(0), "VMAF threads must be at least 1");
    if let Some(model) = &tq.vmaf_model {
        ensure!(model.exists(), "VMAF model {model:?} does not exist!");
    }

    let scenes = &settings.scenes;
    ensure!(
        scenes.min_scene_seconds.is_finite() && scenes.min_scene_seconds >= 0.0,
        "Minimum scene length must not be negative"
    );
    match scenes.split_method {
        SplitMethod::SceneDetect {
            threshold,
        } => ensure!(
            threshold > 0.0 && threshold <= 1.0,
            "Scene detection threshold must be in (0, 1], got {threshold}"
        ),
        SplitMethod::FixedLength {
            seconds,
        } => ensure!(seconds > 0.0, "Fixed scene length must be positive"),
        SplitMethod::Whole => {},
    }

    if let Some(pause_file) = &settings.run.pause_file {
        if pause_file.exists() {
            warn!("pause file {pause_file:?} exists, workers will wait until it is removed");
        }
    }

    // checks the codec against its accepted range before any process runs
    CodecConfig::new(settings.encoder.codec.clone(), settings.encoder.crf_range)?;
    Ok(())
}

/// Loads the scene list from the user's scenes file or the one saved by a
/// previous run, otherwise splits the source and saves the result.
fn resolve_scenes(
    scene_settings: &SceneSettings,
    temp: &Path,
    input: &Input,
    info: &ClipInfo,
) -> Result<Vec<Scene>> {
    let scene_file = scene_settings.scenes_file.as_ref().map_or_else(
        || Cow::Owned(temp.join("scenes.json")),
        |path| Cow::Borrowed(path.as_path()),
    );
    let user_supplied = scene_settings.scenes_file.is_some();

    if scene_file.exists() {
        let (scenes, frames) = read_scenes_file(&scene_file)?;
        if frames == info.num_frames {
            validate_partition(&scenes, info.num_frames)
                .with_context(|| format!("Invalid scene list in {scene_file:?}"))?;
            info!("loaded {n} scenes from {scene_file:?}", n = scenes.len());
            return Ok(scenes);
        }
        ensure!(
            !user_supplied,
            "Scenes file {scene_file:?} was made for {frames} frames, the input has {}",
            info.num_frames
        );
        warn!("saved scenes were computed for a different source, splitting again");
    } else {
        ensure!(!user_supplied, "Scenes file {scene_file:?} does not exist!");
    }

    let scenes = scene_detect::detect(
        input,
        info,
        scene_settings.split_method,
        scene_settings.min_scene_seconds,
    )?;
    validate_partition(&scenes, info.num_frames)?;
    write_scenes_file(&scene_file, &scenes, info.num_frames)?;
    Ok(scenes)
}

/// Determine the number of workers for a codec from CPU threads and memory
fn determine_workers(codec: &Codec) -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let cpu = available_parallelism().map_or(1, std::num::NonZero::get);
    // sysinfo returns Bytes, convert to GB
    let ram_gb = system.total_memory() as f64 / 1e9;
    workers_for(codec, cpu, ram_gb)
}

fn workers_for(codec: &Codec, cpu: usize, ram_gb: f64) -> usize {
    // rough per-worker load at 1080p, a probe runs the encoder and libvmaf
    // back to back
    let (cpu_threads, ram_per_worker) = match codec {
        Codec::SvtAv1 {
            ..
        } => (6, 1.7),
        Codec::X264 {
            ..
        } => (8, 1.2),
        Codec::X265 {
            ..
        } => (8, 1.1),
        Codec::HevcVideoToolbox => (2, 0.8),
    };
    let by_ram = (ram_gb / ram_per_worker).floor() as usize;
    (cpu / cpu_threads).min(by_ram).max(1)
}

/// Lists every failed scene, or `None` when all scenes succeeded.
fn failure_summary(outcomes: &[SceneOutcome]) -> Option<String> {
    let failed: Vec<(&SceneOutcome, &SearchError)> = outcomes
        .iter()
        .filter_map(|outcome| outcome.result.as_ref().err().map(|e| (outcome, e)))
        .collect();
    if failed.is_empty() {
        return None;
    }

    let cancelled = failed.iter().filter(|(_, e)| matches!(e, SearchError::Cancelled { .. }));
    let mut summary = format!(
        "{n} of {total} scenes failed",
        n = failed.len(),
        total = outcomes.len()
    );
    if cancelled.count() == failed.len() {
        summary.push_str(" (cancelled, finished probes are kept for the next run)");
        return Some(summary);
    }
    for (outcome, e) in failed {
        let _ = write!(summary, "\n  scene {id} {e}", id = scene_id(outcome.index));
    }
    Some(summary)
}
