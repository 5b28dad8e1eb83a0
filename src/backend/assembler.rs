//! Video assembly through ffmpeg.
//!
//! Clips are normalized to a common frame rate and pixel format, then
//! folded left to right: a cut appends with `concat`, any other transition
//! overlaps the running output with `xfade`. The output is always written
//! with `-y` so a re-run replaces the previous artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::storage::Transition;

/// One input to an assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub path: String,
    pub duration_seconds: f64,
    /// Transition from the previous clip into this one. Ignored on the
    /// first clip.
    pub transition: Transition,
}

impl Clip {
    pub fn new(path: impl Into<String>, duration_seconds: f64, transition: Transition) -> Self {
        Self {
            path: path.into(),
            duration_seconds,
            transition,
        }
    }
}

/// A finished assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledVideo {
    pub path: String,
    pub duration_seconds: f64,
}

/// Joins clips into one video file.
#[async_trait]
pub trait VideoAssembler: Send + Sync {
    async fn assemble(&self, clips: &[Clip], output: &Path) -> Result<AssembledVideo, BackendError>;
}

/// A built filter graph and the duration it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPlan {
    pub filter: String,
    pub duration_seconds: f64,
}

const OUTPUT_LABEL: &str = "vout";

/// Builds the `-filter_complex` graph for `clips`.
///
/// Transition lengths are clamped to the shorter of the two sides; a
/// transition that clamps to zero degrades to a cut.
pub fn build_filter(clips: &[Clip], frame_rate: u32) -> Option<FilterPlan> {
    let first = clips.first()?;
    let mut steps: Vec<String> = clips
        .iter()
        .enumerate()
        .map(|(i, _)| {
            format!(
                "[{i}:v]settb=AVTB,setpts=PTS-STARTPTS,fps={frame_rate},format=yuv420p[v{i}]"
            )
        })
        .collect();

    let mut current = "v0".to_string();
    let mut total = first.duration_seconds.max(0.0);

    for (i, clip) in clips.iter().enumerate().skip(1) {
        let next = if i == clips.len() - 1 {
            OUTPUT_LABEL.to_string()
        } else {
            format!("x{}", i)
        };
        let duration = clip.duration_seconds.max(0.0);
        let overlap = clip.transition.overlap().min(total).min(duration).max(0.0);

        if overlap > 0.0 {
            let offset = total - overlap;
            steps.push(format!(
                "[{current}][v{i}]xfade=transition={kind}:duration={overlap:.3}:offset={offset:.3}[{next}]",
                kind = clip.transition.kind
            ));
            total += duration - overlap;
        } else {
            steps.push(format!("[{current}][v{i}]concat=n=2:v=1:a=0[{next}]"));
            total += duration;
        }
        current = next;
    }

    if clips.len() == 1 {
        steps.push(format!("[v0]null[{}]", OUTPUT_LABEL));
    }

    Some(FilterPlan {
        filter: steps.join(";"),
        duration_seconds: total,
    })
}

/// Assembler shelling out to an `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    binary: PathBuf,
    frame_rate: u32,
}

impl FfmpegAssembler {
    pub fn new(binary: impl Into<PathBuf>, frame_rate: u32) -> Self {
        Self {
            binary: binary.into(),
            frame_rate: frame_rate.max(1),
        }
    }

    /// Builds the ffmpeg invocation for `clips`.
    pub fn command(&self, clips: &[Clip], output: &Path) -> Result<(Command, FilterPlan), BackendError> {
        let plan = build_filter(clips, self.frame_rate).ok_or(BackendError::NoInputs)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
        for clip in clips {
            cmd.arg("-i").arg(&clip.path);
        }
        cmd.arg("-filter_complex").arg(&plan.filter);
        cmd.arg("-map").arg(format!("[{}]", OUTPUT_LABEL));
        cmd.arg("-an")
            .arg("-c:v")
            .arg("libx264")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-movflags")
            .arg("+faststart");
        cmd.arg(output);

        Ok((cmd, plan))
    }
}

impl Default for FfmpegAssembler {
    fn default() -> Self {
        Self::new("ffmpeg", 24)
    }
}

#[async_trait]
impl VideoAssembler for FfmpegAssembler {
    async fn assemble(&self, clips: &[Clip], output: &Path) -> Result<AssembledVideo, BackendError> {
        let (mut cmd, plan) = self.command(clips, output)?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(clips = clips.len(), filter = %plan.filter, "Running ffmpeg");
        let result = cmd.output().await?;
        if !result.status.success() {
            return Err(BackendError::Ffmpeg {
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        info!(
            output = %output.display(),
            clips = clips.len(),
            duration = plan.duration_seconds,
            "Assembled video"
        );
        Ok(AssembledVideo {
            path: output.display().to_string(),
            duration_seconds: plan.duration_seconds,
        })
    }
}
