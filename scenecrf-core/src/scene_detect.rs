use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    ffmpeg::ClipInfo,
    input::Input,
    into_vec,
    process::{run_command, CommandLine, ToolError},
    scenes::Scene,
};

const fn default_threshold() -> f64 {
    0.3
}

/// How the clip is cut into scenes before short scenes are merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum SplitMethod {
    /// Cuts where ffmpeg's scene change score exceeds `threshold` (0 to 1).
    SceneDetect {
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    FixedLength { seconds: f64 },
    Whole,
}

impl Default for SplitMethod {
    #[inline]
    fn default() -> Self {
        Self::SceneDetect {
            threshold: default_threshold(),
        }
    }
}

static PTS_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pts_time:\s*(\d+(?:\.\d+)?)").expect("pts_time regex is valid")
});

/// Splits the clip into scenes that partition `[0, info.num_frames)`, none
/// shorter than `min_scene_seconds` unless the clip itself is.
#[tracing::instrument(level = "debug", skip(input, info))]
#[inline]
pub fn detect(
    input: &Input,
    info: &ClipInfo,
    method: SplitMethod,
    min_scene_seconds: f64,
) -> Result<Vec<Scene>, ToolError> {
    let cuts = match method {
        SplitMethod::SceneDetect {
            threshold,
        } => detect_cuts(input, info, threshold)?,
        SplitMethod::FixedLength {
            seconds,
        } => fixed_length_cuts(info, seconds),
        SplitMethod::Whole => Vec::new(),
    };
    debug!("{n} raw cuts", n = cuts.len());

    let scenes = merge_short_scenes(
        scenes_from_cuts(&cuts, info.num_frames),
        info.frame_rate,
        min_scene_seconds,
    );
    info!(
        "split {frames} frames into {n} scenes",
        frames = info.num_frames,
        n = scenes.len()
    );
    Ok(scenes)
}

fn scene_detect_cmd(input: &Input, threshold: f64) -> CommandLine {
    let mut cmd: CommandLine = into_vec!["ffmpeg", "-hide_banner", "-nostats"];
    cmd.extend(input.ffmpeg_input_args());
    cmd.extend(into_vec![
        "-an",
        "-vf",
        format!("select='gt(scene,{threshold})',showinfo"),
        "-f",
        "null",
        "-",
    ]);
    cmd
}

fn detect_cuts(input: &Input, info: &ClipInfo, threshold: f64) -> Result<Vec<usize>, ToolError> {
    let out = run_command(scene_detect_cmd(input, threshold))?;
    Ok(parse_showinfo_cuts(
        &out.stderr.to_string(),
        info.frame_rate,
        info.num_frames,
    ))
}

/// Frame numbers of the frames `showinfo` reported, dropping anything at or
/// outside the clip bounds.
fn parse_showinfo_cuts(stderr: &str, frame_rate: f64, total_frames: usize) -> Vec<usize> {
    stderr
        .lines()
        .filter(|line| line.contains("showinfo"))
        .filter_map(|line| PTS_TIME_RE.captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .map(|seconds| (seconds * frame_rate).round() as usize)
        .filter(|&frame| frame > 0 && frame < total_frames)
        .sorted_unstable()
        .dedup()
        .collect()
}

fn fixed_length_cuts(info: &ClipInfo, seconds: f64) -> Vec<usize> {
    let step = ((seconds * info.frame_rate).round() as usize).max(1);
    (step..info.num_frames).step_by(step).collect()
}

/// Turns sorted cut points into consecutive scenes covering `[0, total_frames)`.
#[inline]
pub fn scenes_from_cuts(cuts: &[usize], total_frames: usize) -> Vec<Scene> {
    std::iter::once(0)
        .chain(cuts.iter().copied().filter(|&cut| cut > 0 && cut < total_frames))
        .chain(std::iter::once(total_frames))
        .tuple_windows()
        .filter(|(start, end)| start < end)
        .map(|(start, end)| Scene::new(start, end))
        .collect()
}

/// Repeatedly folds the first scene shorter than `min_scene_seconds` into a
/// neighbour until none is left or a single scene remains.
///
/// A scene merges into the shorter of its two neighbours, forward on a tie.
/// The first and last scene only have one neighbour to choose from.
#[inline]
pub fn merge_short_scenes(
    mut scenes: Vec<Scene>,
    frame_rate: f64,
    min_scene_seconds: f64,
) -> Vec<Scene> {
    while scenes.len() > 1 {
        let Some(index) =
            scenes.iter().position(|scene| scene.seconds(frame_rate) < min_scene_seconds)
        else {
            break;
        };

        let last = scenes.len() - 1;
        let merge_forward = index == 0
            || (index != last && scenes[index - 1].frames() >= scenes[index + 1].frames());

        if merge_forward {
            scenes[index].end_frame = scenes[index + 1].end_frame;
            scenes.remove(index + 1);
        } else {
            scenes[index - 1].end_frame = scenes[index].end_frame;
            scenes.remove(index);
        }
    }
    scenes
}
