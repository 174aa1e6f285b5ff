use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::{
    ffmpeg::FFPixelFormat,
    into_vec,
    metrics::{Candidate, MeasureQuality, MeasureRequest},
    process::{ChainOutput, CommandLine, ProcessChain, ToolError},
    scenes::Scene,
};

const TOOL: &str = "ffmpeg libvmaf";

/// VMAF through ffmpeg's `libvmaf` filter.
#[derive(Debug, Clone)]
pub struct VmafProber {
    pub frame_rate: f64,
    pub threads:    usize,
    pub model:      Option<PathBuf>,
    pub pix_format: FFPixelFormat,
    /// Applied to the reference so it lines up with a cropped encode.
    pub crop:       Option<String>,
    /// Where per-frame JSON logs are written.
    pub log_dir:    PathBuf,
    pub timeout:    Option<Duration>,
}

impl VmafProber {
    fn vmaf_cmd(
        &self,
        request: &MeasureRequest<'_>,
        subsample: usize,
        log_path: Option<&Path>,
    ) -> CommandLine {
        let frame_rate = self.frame_rate.to_string();
        let mut cmd: CommandLine = into_vec!["ffmpeg", "-hide_banner", "-nostats", "-y"];

        match request.candidate {
            Candidate::File(path) => cmd.extend(into_vec!["-r", &frame_rate, "-i", path]),
            Candidate::Stream(_) => {
                cmd.extend(into_vec!["-r", &frame_rate, "-f", "matroska", "-i", "pipe:0"]);
            },
        }
        cmd.extend(into_vec!["-r", &frame_rate]);
        cmd.extend(request.input.ffmpeg_input_args());

        cmd.push("-lavfi".into());
        cmd.push(self.filtergraph(request.scene, subsample, log_path).into());
        cmd.extend(into_vec!["-f", "null", "-"]);
        cmd
    }

    fn filtergraph(&self, scene: Scene, subsample: usize, log_path: Option<&Path>) -> String {
        let format = self.pix_format.to_pix_fmt_string();
        let crop = self.crop.as_deref().map(|crop| format!(",{crop}")).unwrap_or_default();

        let mut vmaf = format!(
            "libvmaf=n_threads={threads}:n_subsample={subsample}",
            threads = self.threads
        );
        if let Some(model) = &self.model {
            vmaf.push_str(":model=path=");
            vmaf.push_str(&escape_filter_path(model));
        }
        if let Some(log_path) = log_path {
            vmaf.push_str(":log_fmt=json:log_path=");
            vmaf.push_str(&escape_filter_path(log_path));
        }

        format!(
            "[0:v]setpts=PTS-STARTPTS,format={format}[distorted];[1:v]select=between(n\\,{start}\\,\
             {end}),setpts=N/FRAME_RATE/TB{crop},format={format}[reference];[distorted][reference]\
             {vmaf}",
            start = scene.start_frame,
            end = scene.end_frame - 1,
        )
    }

    fn run(&self, request: &MeasureRequest<'_>, cmd: CommandLine) -> Result<ChainOutput, ToolError> {
        trace!("vmaf {scene}: {cmd:?}", scene = request.scene);
        match request.candidate {
            Candidate::File(_) => ProcessChain::new(cmd).with_timeout(self.timeout).run(),
            Candidate::Stream(chain) => chain.clone().pipe(cmd).with_timeout(self.timeout).run(),
        }
    }
}

impl MeasureQuality for VmafProber {
    #[inline]
    fn aggregate(&self, request: &MeasureRequest<'_>) -> Result<f64, ToolError> {
        let cmd = self.vmaf_cmd(request, request.subsample.max(1), None);
        let out = self.run(request, cmd)?;
        let score = parse_vmaf_score(&out.stderr.to_string()).ok_or_else(|| ToolError::Parse {
            tool:     TOOL.to_owned(),
            expected: "a VMAF score",
        })?;
        debug!("vmaf {scene}: {score:.3}", scene = request.scene);
        Ok(score)
    }

    #[inline]
    fn per_frame(&self, request: &MeasureRequest<'_>) -> Result<Vec<f64>, ToolError> {
        crate::create_dir!(self.log_dir)?;
        let log_path = self.log_dir.join(format!(
            "{start}-{end}.json",
            start = request.scene.start_frame,
            end = request.scene.end_frame
        ));
        let cmd = self.vmaf_cmd(request, request.subsample.max(1), Some(&log_path));
        self.run(request, cmd)?;

        let scores = read_vmaf_file(&log_path)?;
        if let Err(e) = fs::remove_file(&log_path) {
            debug!("could not remove vmaf log {log_path:?}: {e}");
        }
        Ok(scores)
    }
}

/// Pooled score from libvmaf's stderr summary line, e.g.
/// `[Parsed_libvmaf_4 @ 0x55d] VMAF score: 93.402517`.
#[inline]
pub fn parse_vmaf_score(stderr: &str) -> Option<f64> {
    stderr
        .lines()
        .rev()
        .find(|line| line.contains("VMAF score"))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|token| token.parse::<f64>().ok())
}

#[derive(Deserialize)]
struct VmafLog {
    frames: Vec<VmafFrame>,
}

#[derive(Deserialize)]
struct VmafFrame {
    metrics: VmafFrameMetrics,
}

#[derive(Deserialize)]
struct VmafFrameMetrics {
    vmaf: f64,
}

/// Per-frame scores from a libvmaf JSON log.
#[inline]
pub fn read_vmaf_file(path: &Path) -> Result<Vec<f64>, ToolError> {
    let file = File::open(path)?;
    let log: VmafLog =
        serde_json::from_reader(BufReader::new(file)).map_err(|_| ToolError::Parse {
            tool:     TOOL.to_owned(),
            expected: "per-frame scores in the JSON log",
        })?;
    Ok(log.frames.into_iter().map(|frame| frame.metrics.vmaf).collect())
}

fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace(' ', "\\ ")
        .replace('[', "\\[")
        .replace(']', "\\]")
}
