use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context};
use path_abs::PathAbs;
use tracing::debug;

use crate::{into_vec, process::run_command};

/// Writes an ffmpeg concat demuxer list. Paths are made absolute since the
/// demuxer resolves relative entries against the list's own directory.
#[inline]
pub fn write_concat_list(list_path: &Path, scene_paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut contents = String::with_capacity(64 * scene_paths.len());
    for scene_path in scene_paths {
        let absolute = PathAbs::new(scene_path)
            .with_context(|| format!("Failed to resolve scene path {scene_path:?}"))?;
        let fixed_path = absolute
            .as_path()
            .display()
            .to_string()
            .replace('\\', r"\\")
            .replace(' ', r"\ ")
            .replace('\'', r"\'");
        contents.push_str("file ");
        contents.push_str(&fixed_path);
        contents.push('\n');
    }

    File::create(list_path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .with_context(|| format!("Failed to write concat list {list_path:?}"))
}

/// Joins the per-scene encodes, in the order given, into `output` without
/// re-encoding.
#[tracing::instrument(level = "debug", skip(scene_paths))]
#[inline]
pub fn ffmpeg(temp: &Path, output: &Path, scene_paths: &[PathBuf]) -> anyhow::Result<()> {
    ensure!(!scene_paths.is_empty(), "No scenes to concatenate");

    let list_path = temp.join("concat.txt");
    write_concat_list(&list_path, scene_paths)?;
    debug!(
        "concatenating {n} scenes into {output:?}",
        n = scene_paths.len()
    );

    run_command(into_vec![
        "ffmpeg",
        "-y",
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        list_path,
        "-map",
        "0",
        "-c",
        "copy",
        output,
    ])
    .context("Failed to concatenate with ffmpeg")?;

    ensure!(
        output.exists(),
        "Concatenation finished but {output:?} was not written"
    );
    Ok(())
}
