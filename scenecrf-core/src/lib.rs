use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

pub use crate::{
    broker::{SceneOutcome, SceneTask},
    cache::{CacheKey, ProbeCache, ProbeRecord},
    context::{RunSummary, SceneCrfContext},
    control::SearchControl,
    encoder::{Codec, CodecConfig, CrfRange, EncodeClip, FfmpegEncoder, QualityDirection},
    input::Input,
    metrics::{vmaf::VmafProber, Candidate, MeasureQuality},
    scene_detect::SplitMethod,
    scenes::Scene,
    settings::Settings,
    target_quality::{SearchError, SearchResult, TargetQuality},
};

pub mod broker;
pub mod cache;
pub mod concat;
pub mod context;
pub mod control;
pub mod encoder;
pub mod ffmpeg;
pub mod input;
pub mod metrics;
pub mod process;
pub mod progress_bar;
pub mod report;
pub mod scene_detect;
pub mod scenes;
pub mod settings;
pub mod string_or_bytes;
pub mod target_quality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Order in which scenes are handed to the worker pool.
///
/// Results are always reassembled chronologically, this only affects worker
/// utilization.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ChunkOrdering {
    #[default]
    LongestFirst,
    ShortestFirst,
    Sequential,
    Random,
}

#[macro_export]
macro_rules! into_vec {
    ($($x:expr),* $(,)?) => {
        vec![
            $(
                $x.into(),
            )*
        ]
    };
}

/// Creates a directory and its parents, treating "already exists" as
/// success so concurrent first use from several workers is harmless.
#[macro_export]
macro_rules! create_dir {
    ($loc:expr) => {
        match std::fs::create_dir_all(&$loc) {
            Ok(()) => Ok(()),
            Err(e) => match e.kind() {
                std::io::ErrorKind::AlreadyExists => Ok(()),
                _ => {
                    tracing::error!("Error while creating directory {:?}: {}", &$loc, e);
                    Err(e)
                },
            },
        }
    };
}
