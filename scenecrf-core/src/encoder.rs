use std::{
    ffi::OsString,
    fmt::{self, Display},
    path::Path,
    time::Duration,
};

use anyhow::ensure;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    ffmpeg::FFPixelFormat,
    input::Input,
    into_vec,
    process::{CommandLine, ProcessChain, ToolError},
    scenes::Scene,
};

/// Closed integer interval of rate-control values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrfRange {
    pub min: i32,
    pub max: i32,
}

impl CrfRange {
    #[inline]
    pub const fn new(min: i32, max: i32) -> Self {
        Self {
            min,
            max,
        }
    }

    #[inline]
    pub const fn contains_range(self, other: Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.min > self.max
    }
}

impl Display for CrfRange {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Which way the rate-control value moves for better quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityDirection {
    /// Classic CRF, lower value is higher quality.
    LowerIsBetter,
    /// Quality-scaled parameters such as VideoToolbox `-q:v`.
    HigherIsBetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvtAv1Tune {
    #[default]
    Subjective,
    Psnr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilmGrain {
    pub strength: u8,
    #[serde(default)]
    pub denoise:  bool,
}

const fn default_svt_preset() -> u8 {
    8
}

fn default_x264_preset() -> String {
    "slower".to_owned()
}

fn default_x265_preset() -> String {
    "slow".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "encoder", rename_all = "kebab-case")]
pub enum Codec {
    SvtAv1 {
        #[serde(default = "default_svt_preset")]
        preset:     u8,
        #[serde(default)]
        tune:       SvtAv1Tune,
        #[serde(default)]
        film_grain: Option<FilmGrain>,
    },
    X264 {
        #[serde(default = "default_x264_preset")]
        preset: String,
        #[serde(default)]
        tune:   Option<String>,
    },
    X265 {
        #[serde(default = "default_x265_preset")]
        preset: String,
    },
    HevcVideoToolbox,
}

impl Display for Codec {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Codec {
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SvtAv1 {
                ..
            } => "svt-av1",
            Self::X264 {
                ..
            } => "x264",
            Self::X265 {
                ..
            } => "x265",
            Self::HevcVideoToolbox => "hevc_videotoolbox",
        }
    }

    #[inline]
    pub const fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            Self::SvtAv1 {
                ..
            } => "libsvtav1",
            Self::X264 {
                ..
            } => "libx264",
            Self::X265 {
                ..
            } => "libx265",
            Self::HevcVideoToolbox => "hevc_videotoolbox",
        }
    }

    /// Full range of rate-control values the encoder accepts.
    #[inline]
    pub const fn accepted_range(&self) -> CrfRange {
        match self {
            Self::SvtAv1 {
                ..
            } => CrfRange::new(0, 63),
            Self::X264 {
                ..
            }
            | Self::X265 {
                ..
            } => CrfRange::new(0, 39),
            Self::HevcVideoToolbox => CrfRange::new(1, 100),
        }
    }

    #[inline]
    pub const fn quality_direction(&self) -> QualityDirection {
        match self {
            Self::HevcVideoToolbox => QualityDirection::HigherIsBetter,
            _ => QualityDirection::LowerIsBetter,
        }
    }

    /// Rate-control arguments for a single probe.
    #[inline]
    pub fn rate_args(&self, crf: i32) -> Vec<OsString> {
        match self {
            Self::HevcVideoToolbox => into_vec!["-q:v", crf.to_string()],
            _ => into_vec!["-crf", crf.to_string()],
        }
    }

    #[inline]
    pub fn codec_args(&self) -> Vec<OsString> {
        match self {
            Self::SvtAv1 {
                preset,
                tune,
                film_grain,
            } => {
                let tune = match tune {
                    SvtAv1Tune::Subjective => 0,
                    SvtAv1Tune::Psnr => 1,
                };
                let grain = film_grain
                    .map(|grain| {
                        format!(
                            ":film-grain={}:film-grain-denoise={}",
                            grain.strength,
                            u8::from(grain.denoise)
                        )
                    })
                    .unwrap_or_default();
                let params = format!("tune={tune}{grain}");
                into_vec![
                    "-c:v",
                    self.ffmpeg_encoder(),
                    "-preset",
                    preset.to_string(),
                    "-svtav1-params",
                    params,
                ]
            },
            Self::X264 {
                preset,
                tune,
            } => {
                let mut args: Vec<OsString> =
                    into_vec!["-c:v", self.ffmpeg_encoder(), "-preset", preset];
                if let Some(tune) = tune {
                    args.extend(into_vec!["-tune", tune]);
                }
                args
            },
            Self::X265 {
                preset,
            } => into_vec![
                "-c:v",
                self.ffmpeg_encoder(),
                "-preset",
                preset,
                "-x265-params",
                "log-level=error",
            ],
            Self::HevcVideoToolbox => into_vec!["-c:v", self.ffmpeg_encoder(), "-tag:v", "hvc1"],
        }
    }
}

/// A codec together with the CRF interval the search may explore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecConfig {
    pub codec:     Codec,
    pub crf_range: CrfRange,
}

impl CodecConfig {
    /// Uses the codec's accepted range unless `crf_range` narrows it.
    #[inline]
    pub fn new(codec: Codec, crf_range: Option<CrfRange>) -> anyhow::Result<Self> {
        let accepted = codec.accepted_range();
        let crf_range = crf_range.unwrap_or(accepted);
        ensure!(
            !crf_range.is_empty(),
            "CRF range {crf_range} does not contain any value"
        );
        ensure!(
            accepted.contains_range(crf_range),
            "CRF range {crf_range} is outside of what {codec} accepts ({accepted})"
        );

        Ok(Self {
            codec,
            crf_range,
        })
    }

    #[inline]
    pub const fn direction(&self) -> QualityDirection {
        self.codec.quality_direction()
    }
}

/// One encoder invocation: a frame range of the source at a given CRF.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input:  &'a Input,
    pub scene:  Scene,
    pub config: &'a CodecConfig,
    pub crf:    i32,
}

/// Encoder Invoker. Identical requests must produce identical output, the
/// probe cache relies on it.
pub trait EncodeClip: Sync {
    /// Encodes the request to `output`.
    fn encode_to_file(&self, request: &EncodeRequest<'_>, output: &Path) -> Result<(), ToolError>;

    /// Builds a process chain whose last stage writes the encoded stream to
    /// stdout. Nothing runs until the chain is consumed.
    fn encode_to_stream(&self, request: &EncodeRequest<'_>) -> Result<ProcessChain, ToolError>;
}

enum OutputTarget<'a> {
    File(&'a Path),
    Stdout,
}

/// Encodes through ffmpeg, fed by the input's frame-accurate y4m pipe.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    pub pix_format: FFPixelFormat,
    pub keyint:     Option<u32>,
    pub crop:       Option<String>,
    /// Kills encodes running longer than this.
    pub timeout:    Option<Duration>,
}

impl FfmpegEncoder {
    fn encoder_cmd(&self, request: &EncodeRequest<'_>, output: &OutputTarget<'_>) -> CommandLine {
        let mut cmd: CommandLine = into_vec![
            "ffmpeg",
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "yuv4mpegpipe",
            "-i",
            "-",
            "-an",
        ];
        if let Some(crop) = &self.crop {
            cmd.extend(into_vec!["-vf", crop]);
        }
        cmd.extend(into_vec!["-pix_fmt", self.pix_format.to_pix_fmt_string()]);
        if let Some(keyint) = self.keyint {
            cmd.extend(into_vec!["-g", keyint.to_string()]);
        }
        cmd.extend(request.config.codec.codec_args());
        cmd.extend(request.config.codec.rate_args(request.crf));
        match output {
            OutputTarget::File(path) => cmd.push(path.into()),
            OutputTarget::Stdout => cmd.extend(into_vec!["-f", "matroska", "-"]),
        }
        cmd
    }

    fn chain(&self, request: &EncodeRequest<'_>, output: &OutputTarget<'_>) -> ProcessChain {
        let source = request.input.source_cmd(request.scene, self.pix_format);
        let encoder = self.encoder_cmd(request, output);
        trace!("encode {scene} at {crf}: {encoder:?}", scene = request.scene, crf = request.crf);
        ProcessChain::new(source).pipe(encoder).with_timeout(self.timeout)
    }
}

impl EncodeClip for FfmpegEncoder {
    #[inline]
    fn encode_to_file(&self, request: &EncodeRequest<'_>, output: &Path) -> Result<(), ToolError> {
        self.chain(request, &OutputTarget::File(output)).run()?;
        if output.exists() {
            Ok(())
        } else {
            Err(ToolError::Parse {
                tool:     "ffmpeg".to_owned(),
                expected: "an encoded output file",
            })
        }
    }

    #[inline]
    fn encode_to_stream(&self, request: &EncodeRequest<'_>) -> Result<ProcessChain, ToolError> {
        Ok(self.chain(request, &OutputTarget::Stdout))
    }
}
