use std::{
    fs::File,
    io::BufReader,
    num::NonZero,
    path::{Path, PathBuf},
    thread::available_parallelism,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    encoder::{Codec, CrfRange, SvtAv1Tune},
    ffmpeg::FFPixelFormat,
    scene_detect::SplitMethod,
    target_quality::TargetQuality,
    ChunkOrdering,
    Input,
    Verbosity,
};

fn default_temp() -> PathBuf {
    PathBuf::from(".scenecrf")
}

const fn default_codec() -> Codec {
    Codec::SvtAv1 {
        preset:     8,
        tune:       SvtAv1Tune::Subjective,
        film_grain: None,
    }
}

const fn default_min_scene_seconds() -> f64 {
    1.0
}

const fn default_true() -> bool {
    true
}

const fn default_crop_sample_seconds() -> u32 {
    10
}

/// Everything a run is configured with, read from one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub io:             InputOutputSettings,
    #[serde(default)]
    pub encoder:        EncoderSettings,
    #[serde(default)]
    pub target_quality: TargetQualitySettings,
    #[serde(default)]
    pub scenes:         SceneSettings,
    #[serde(default)]
    pub run:            RunSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutputSettings {
    /// Source video, or a VapourSynth script (`.vpy`).
    pub input:  PathBuf,
    pub output: PathBuf,
    /// Scene list, caches and per-scene encodes. Kept between runs.
    #[serde(default = "default_temp")]
    pub temp:   PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(default = "default_codec")]
    pub codec:               Codec,
    /// Narrows the codec's accepted CRF range.
    #[serde(default)]
    pub crf_range:           Option<CrfRange>,
    #[serde(default)]
    pub pix_format:          FFPixelFormat,
    #[serde(default)]
    pub keyint:              Option<u32>,
    /// Explicit crop filter, e.g. `crop=1920:800:0:140`.
    #[serde(default)]
    pub crop:                Option<String>,
    /// Detect black bars with `cropdetect` when no explicit crop is set.
    #[serde(default)]
    pub detect_crop:         bool,
    #[serde(default = "default_crop_sample_seconds")]
    pub crop_sample_seconds: u32,
}

impl Default for EncoderSettings {
    #[inline]
    fn default() -> Self {
        Self {
            codec:               default_codec(),
            crf_range:           None,
            pix_format:          FFPixelFormat::default(),
            keyint:              None,
            crop:                None,
            detect_crop:         false,
            crop_sample_seconds: default_crop_sample_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetQualitySettings {
    #[serde(flatten)]
    pub search:       TargetQuality,
    /// Defaults to the number of available threads.
    #[serde(default)]
    pub vmaf_threads: Option<usize>,
    #[serde(default)]
    pub vmaf_model:   Option<PathBuf>,
}

impl TargetQualitySettings {
    #[inline]
    pub fn vmaf_threads(&self) -> usize {
        self.vmaf_threads
            .unwrap_or_else(|| available_parallelism().map_or(1, NonZero::get))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSettings {
    #[serde(default)]
    pub split_method:      SplitMethod,
    #[serde(default = "default_min_scene_seconds")]
    pub min_scene_seconds: f64,
    /// User supplied scene list, used instead of splitting.
    #[serde(default)]
    pub scenes_file:       Option<PathBuf>,
}

impl Default for SceneSettings {
    #[inline]
    fn default() -> Self {
        Self {
            split_method:      SplitMethod::default(),
            min_scene_seconds: default_min_scene_seconds(),
            scenes_file:       None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// `0` picks a count from available threads and memory.
    #[serde(default)]
    pub workers:                 usize,
    #[serde(default)]
    pub chunk_order:             ChunkOrdering,
    /// Keep per-scene encodes and join them into the output. Otherwise only
    /// CRFs and scores are computed and encodes are streamed.
    #[serde(default = "default_true")]
    pub render:                  bool,
    /// Defaults to `<temp>/cache`.
    #[serde(default)]
    pub cache_dir:               Option<PathBuf>,
    /// While this file exists, workers pause before their next probe.
    #[serde(default)]
    pub pause_file:              Option<PathBuf>,
    /// Defaults to `<temp>/report.json`.
    #[serde(default)]
    pub report:                  Option<PathBuf>,
    #[serde(default)]
    pub verbosity:               Verbosity,
    /// Kills any encoder or metric process running longer than this.
    #[serde(default)]
    pub process_timeout_seconds: Option<u64>,
}

impl Default for RunSettings {
    #[inline]
    fn default() -> Self {
        Self {
            workers:                 0,
            chunk_order:             ChunkOrdering::default(),
            render:                  true,
            cache_dir:               None,
            pause_file:              None,
            report:                  None,
            verbosity:               Verbosity::default(),
            process_timeout_seconds: None,
        }
    }
}

impl Settings {
    #[inline]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open settings file {path:?}"))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse settings file {path:?}"))
    }

    #[inline]
    pub fn input(&self) -> Input {
        Input::from_path(&self.io.input)
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.run.cache_dir.clone().unwrap_or_else(|| self.io.temp.join("cache"))
    }

    #[inline]
    pub fn report_path(&self) -> PathBuf {
        self.run.report.clone().unwrap_or_else(|| self.io.temp.join("report.json"))
    }

    #[inline]
    pub fn process_timeout(&self) -> Option<Duration> {
        self.run.process_timeout_seconds.map(Duration::from_secs)
    }
}
