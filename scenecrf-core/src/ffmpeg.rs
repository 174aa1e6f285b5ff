use std::{path::Path, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::debug;

use crate::{
    into_vec,
    process::{run_command, ToolError},
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FFPixelFormat {
    YUV420P,
    #[default]
    YUV420P10LE,
    YUV420P12LE,
    YUV422P,
    YUV422P10LE,
    YUV444P,
    YUV444P10LE,
}

impl FFPixelFormat {
    #[inline]
    pub fn to_pix_fmt_string(self) -> &'static str {
        self.into()
    }
}

/// Frame count and rate of a source clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipInfo {
    pub num_frames: usize,
    pub frame_rate: f64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    r_frame_rate:    Option<String>,
    nb_frames:       Option<String>,
    nb_read_packets: Option<String>,
}

#[inline]
pub fn probe_video(path: &Path) -> Result<ClipInfo, ToolError> {
    let out = run_command(into_vec![
        "ffprobe",
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-count_packets",
        "-show_entries",
        "stream=r_frame_rate,nb_frames,nb_read_packets",
        "-of",
        "json",
        path,
    ])?;
    parse_ffprobe_json(&out.stdout)
}

fn parse_ffprobe_json(stdout: &[u8]) -> Result<ClipInfo, ToolError> {
    let missing = |expected| ToolError::Parse {
        tool: "ffprobe".to_owned(),
        expected,
    };
    let parsed: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|_| missing("a JSON document"))?;
    let stream = parsed.streams.into_iter().next().ok_or_else(|| missing("a video stream"))?;

    let num_frames = stream
        .nb_read_packets
        .as_deref()
        .or(stream.nb_frames.as_deref())
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| missing("a frame count"))?;
    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .ok_or_else(|| missing("a frame rate"))?;

    Ok(ClipInfo {
        num_frames,
        frame_rate,
    })
}

#[inline]
pub fn probe_vapoursynth(path: &Path) -> Result<ClipInfo, ToolError> {
    let out = run_command(into_vec!["vspipe", "--info", path, "-"])?;
    let text = String::from_utf8_lossy(&out.stdout);
    parse_vspipe_info(&text)
}

fn parse_vspipe_info(text: &str) -> Result<ClipInfo, ToolError> {
    let missing = |expected| ToolError::Parse {
        tool: "vspipe".to_owned(),
        expected,
    };
    let field = |name: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
    };

    let num_frames = field("Frames:")
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| missing("Frames:"))?;
    let frame_rate = field("FPS:").and_then(parse_frame_rate).ok_or_else(|| missing("FPS:"))?;

    Ok(ClipInfo {
        num_frames,
        frame_rate,
    })
}

/// Parses `24000/1001` or `23.976` style rates.
#[inline]
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        },
        None => s.trim().parse::<f64>().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

static CROP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"crop=(\d+:\d+:\d+:\d+)").expect("crop regex is valid"));

/// Samples the start of `path` with `cropdetect` and returns a `crop=` filter
/// removing black bars, or `None` when nothing needs cropping.
#[inline]
pub fn detect_crop(path: &Path, sample_seconds: u32) -> Result<Option<String>, ToolError> {
    let out = run_command(into_vec![
        "ffmpeg",
        "-hide_banner",
        "-t",
        sample_seconds.to_string(),
        "-i",
        path,
        "-vf",
        "cropdetect",
        "-an",
        "-f",
        "null",
        "-",
    ])?;
    let crop = parse_cropdetect(&out.stderr.to_string());
    debug!("cropdetect for {path:?}: {crop:?}");
    Ok(crop)
}

fn parse_cropdetect(stderr: &str) -> Option<String> {
    let last = CROP_RE.captures_iter(stderr).last()?;
    let filter = last.get(1)?.as_str();
    let mut parts = filter.split(':');
    let (_, _, x, y) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    (x != "0" || y != "0").then(|| format!("crop={filter}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffprobe_prefers_counted_packets() {
        let json = br#"{"streams":[{"r_frame_rate":"24000/1001","nb_frames":"250","nb_read_packets":"240"}]}"#;
        let info = parse_ffprobe_json(json).unwrap();
        assert_eq!(info.num_frames, 240);
        assert!((info.frame_rate - 23.976).abs() < 0.001);
    }

    #[test]
    fn ffprobe_without_stream_is_a_parse_failure() {
        let err = parse_ffprobe_json(br#"{"streams":[]}"#).unwrap_err();
        assert!(matches!(err, ToolError::Parse { expected: "a video stream", .. }));
    }

    #[test]
    fn vspipe_info_is_parsed() {
        let text = "Width: 1920\nHeight: 1080\nFrames: 1440\nFPS: 24/1 (24.000 fps)\nFormat Name: \
                    YUV420P10\n";
        let info = parse_vspipe_info(text).unwrap();
        assert_eq!(info.num_frames, 1440);
        assert!((info.frame_rate - 24.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frame_rate_rejects_zero_denominator() {
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
    }

    #[test]
    fn cropdetect_uses_last_suggestion() {
        let stderr = "[Parsed_cropdetect_0 @ 0x1] x1:0 crop=1920:1072:0:4\n[Parsed_cropdetect_0 @ \
                      0x1] x1:0 crop=1920:800:0:140\n";
        assert_eq!(parse_cropdetect(stderr), Some("crop=1920:800:0:140".to_owned()));
        assert_eq!(parse_cropdetect("crop=1920:1080:0:0"), None);
    }
}
