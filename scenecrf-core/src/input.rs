use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    ffmpeg::{self, ClipInfo, FFPixelFormat},
    into_vec,
    process::{CommandLine, ToolError},
    scenes::Scene,
};

/// Source of frames. Video files are decoded by ffmpeg, VapourSynth scripts
/// are served by `vspipe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Input {
    Video { path: PathBuf },
    VapourSynth { path: PathBuf },
}

impl Input {
    #[inline]
    pub fn from_path(path: &Path) -> Self {
        let is_script = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("vpy") || ext.eq_ignore_ascii_case("py"));
        if is_script {
            Self::VapourSynth {
                path: path.to_path_buf(),
            }
        } else {
            Self::Video {
                path: path.to_path_buf(),
            }
        }
    }

    #[inline]
    pub fn as_path(&self) -> &Path {
        match self {
            Self::Video {
                path,
            }
            | Self::VapourSynth {
                path,
            } => path,
        }
    }

    #[inline]
    pub const fn is_vapoursynth(&self) -> bool {
        matches!(self, Self::VapourSynth { .. })
    }

    /// Tools needed to read frames from this input.
    #[inline]
    pub fn required_tools(&self) -> &'static [&'static str] {
        match self {
            Self::Video {
                ..
            } => &["ffmpeg", "ffprobe"],
            Self::VapourSynth {
                ..
            } => &["ffmpeg", "vspipe"],
        }
    }

    #[inline]
    pub fn clip_info(&self) -> Result<ClipInfo, ToolError> {
        match self {
            Self::Video {
                path,
            } => ffmpeg::probe_video(path),
            Self::VapourSynth {
                path,
            } => ffmpeg::probe_vapoursynth(path),
        }
    }

    /// Frame-accurate y4m stream of `scene`.
    #[inline]
    pub fn source_cmd(&self, scene: Scene, pix_format: FFPixelFormat) -> CommandLine {
        // the end boundary is the first frame of the next scene
        let last_frame = scene.end_frame - 1;
        match self {
            Self::Video {
                path,
            } => {
                let filter = format!(
                    r"select=between(n\,{start}\,{end}),setpts=N/FRAME_RATE/TB",
                    start = scene.start_frame,
                    end = last_frame
                );
                into_vec![
                    "ffmpeg",
                    "-y",
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-i",
                    path,
                    "-vf",
                    filter,
                    "-pix_fmt",
                    pix_format.to_pix_fmt_string(),
                    "-strict",
                    "-1",
                    "-f",
                    "yuv4mpegpipe",
                    "-",
                ]
            },
            Self::VapourSynth {
                path,
            } => into_vec![
                "vspipe",
                path,
                "-c",
                "y4m",
                "-",
                "-s",
                scene.start_frame.to_string(),
                "-e",
                last_frame.to_string(),
            ],
        }
    }

    /// ffmpeg input arguments reading the whole source, used as the
    /// reference side of a quality comparison.
    #[inline]
    pub fn ffmpeg_input_args(&self) -> Vec<OsString> {
        match self {
            Self::Video {
                path,
            } => into_vec!["-i", path],
            Self::VapourSynth {
                path,
            } => into_vec!["-f", "vapoursynth", "-i", path],
        }
    }

    /// SHA-256 of the input file's bytes, streamed.
    #[inline]
    pub fn content_hash(&self) -> io::Result<String> {
        hash_file(self.as_path())
    }
}

#[inline]
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
