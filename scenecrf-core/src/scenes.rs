use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A contiguous frame range encoded as an independent unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scene {
    pub start_frame: usize, // Inclusive
    pub end_frame:   usize, // Exclusive
}

impl Scene {
    #[inline]
    pub fn new(start_frame: usize, end_frame: usize) -> Self {
        Self {
            start_frame,
            end_frame,
        }
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.end_frame.saturating_sub(self.start_frame)
    }

    #[inline]
    pub fn seconds(&self, frame_rate: f64) -> f64 {
        self.frames() as f64 / frame_rate
    }
}

impl fmt::Display for Scene {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_frame, self.end_frame)
    }
}

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("failed to read scenes file {path:?}: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenes file {path:?}: {source}")]
    Parse {
        path:   PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write scenes file {path:?}: {source}")]
    Write {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scene list is empty")]
    Empty,
    #[error("scene {scene} is empty or reversed")]
    EmptyScene { scene: Scene },
    #[error("scene {scene} does not start where the previous one ended (frame {expected})")]
    Gap { scene: Scene, expected: usize },
    #[error("scenes end at frame {end} but the clip has {frames} frames")]
    Length { end: usize, frames: usize },
}

#[derive(Debug, Serialize, Deserialize)]
struct ScenesFile {
    frames: usize,
    scenes: Vec<Scene>,
}

/// Loads a scene list previously written by [`write_scenes_file`] and
/// returns it together with the frame count it was computed for.
#[inline]
pub fn read_scenes_file(path: &Path) -> Result<(Vec<Scene>, usize), SceneError> {
    let file = File::open(path).map_err(|source| SceneError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let data: ScenesFile =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| SceneError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((data.scenes, data.frames))
}

#[inline]
pub fn write_scenes_file(path: &Path, scenes: &[Scene], frames: usize) -> Result<(), SceneError> {
    let write_error = |source| SceneError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(write_error)?);
    serde_json::to_writer_pretty(
        &mut writer,
        &ScenesFile {
            frames,
            scenes: scenes.to_vec(),
        },
    )
    .map_err(|e| write_error(e.into()))?;
    writer.flush().map_err(write_error)
}

/// Checks that `scenes` partition `[0, frames)` with no gaps or overlaps.
#[inline]
pub fn validate_partition(scenes: &[Scene], frames: usize) -> Result<(), SceneError> {
    if scenes.is_empty() {
        return Err(SceneError::Empty);
    }

    let mut expected = 0;
    for scene in scenes {
        if scene.end_frame <= scene.start_frame {
            return Err(SceneError::EmptyScene {
                scene: *scene,
            });
        }
        if scene.start_frame != expected {
            return Err(SceneError::Gap {
                scene: *scene,
                expected,
            });
        }
        expected = scene.end_frame;
    }

    if expected != frames {
        return Err(SceneError::Length {
            end: expected,
            frames,
        });
    }

    Ok(())
}
