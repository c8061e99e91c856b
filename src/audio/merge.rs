//! Ordered, lossless concatenation of captured segments.
//!
//! Segments are picked up by lexical order of their zero-padded names, which
//! equals capture order. The originals are removed only once the final
//! artifact has been written, so a failed merge leaves everything in place
//! for a retry by hand.

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

use super::CaptureError;

pub const SEGMENT_PREFIX: &str = "chunk_";
pub const SEGMENT_EXTENSION: &str = "wav";
pub const MANIFEST_FILE: &str = "list.txt";
pub const ARTIFACT_FILE: &str = "final.wav";

/// Result of merging a job's segment directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged {
        artifact: PathBuf,
        segment_count: usize,
    },
    /// Nothing was captured; no artifact was produced.
    NoSegments,
}

/// Concatenates segment files into one artifact without re-encoding.
#[async_trait]
pub trait SegmentMerger: Send + Sync {
    fn name(&self) -> &'static str;

    /// `manifest` lists `segments` in order, in ffmpeg concat-demuxer syntax.
    async fn concat(
        &self,
        manifest: &Path,
        segments: &[PathBuf],
        output: &Path,
    ) -> Result<(), CaptureError>;
}

/// Segment files in `dir`, sorted so lexical order equals capture order.
pub fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_segment(path))
        .collect();
    segments.sort();
    Ok(segments)
}

fn is_segment(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.starts_with(SEGMENT_PREFIX)
        && path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
}

/// Index the next segment should start at so new files sort after any left
/// behind by an earlier attempt.
pub fn next_segment_number(dir: &Path) -> u32 {
    list_segments(dir)
        .unwrap_or_default()
        .iter()
        .filter_map(|path| {
            path.file_stem()?
                .to_str()?
                .strip_prefix(SEGMENT_PREFIX)?
                .parse::<u32>()
                .ok()
        })
        .max()
        .map(|n| n + 1)
        .unwrap_or(0)
}

/// Concat-demuxer manifest: one `file '<path>'` line per segment.
pub fn manifest_contents(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge every segment in `dir` into `dir/final.wav`.
pub async fn merge_segments(
    dir: &Path,
    merger: &dyn SegmentMerger,
) -> Result<MergeOutcome, CaptureError> {
    let segments = list_segments(dir)?;
    if segments.is_empty() {
        warn!("No segments found in {:?}", dir);
        return Ok(MergeOutcome::NoSegments);
    }

    let manifest = dir.join(MANIFEST_FILE);
    let artifact = dir.join(ARTIFACT_FILE);
    {
        let mut file = std::fs::File::create(&manifest)?;
        file.write_all(manifest_contents(&segments).as_bytes())?;
        file.write_all(b"\n")?;
    }

    info!(
        "Merging {} segment(s) in {:?} with {}",
        segments.len(),
        dir,
        merger.name()
    );
    let result = merger.concat(&manifest, &segments, &artifact).await;

    if let Err(e) = std::fs::remove_file(&manifest) {
        warn!("Failed to remove manifest {:?}: {}", manifest, e);
    }

    if let Err(e) = result {
        warn!("Merge failed, keeping {} segment(s): {}", segments.len(), e);
        return Err(e);
    }

    for segment in &segments {
        if let Err(e) = std::fs::remove_file(segment) {
            warn!("Failed to remove merged segment {:?}: {}", segment, e);
        }
    }
    debug!("Removed {} merged segment(s)", segments.len());

    Ok(MergeOutcome::Merged {
        artifact,
        segment_count: segments.len(),
    })
}

/// Check if FFmpeg is available on the system.
pub fn check_ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// `ffmpeg -f concat -c copy`.
#[derive(Debug, Default, Clone)]
pub struct FfmpegConcatMerger;

#[async_trait]
impl SegmentMerger for FfmpegConcatMerger {
    fn name(&self) -> &'static str {
        "ffmpeg-concat"
    }

    async fn concat(
        &self,
        manifest: &Path,
        _segments: &[PathBuf],
        output: &Path,
    ) -> Result<(), CaptureError> {
        // -f concat -safe 0: read the manifest, allow absolute paths
        // -c copy: stream copy, no re-encoding
        let result = tokio::process::Command::new("ffmpeg")
            .args(["-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(manifest)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(CaptureError::Spawn)?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CaptureError::Merge(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        if !output.exists() {
            return Err(CaptureError::Merge(
                "ffmpeg did not produce output file".to_string(),
            ));
        }

        Ok(())
    }
}

/// Pure-Rust PCM concatenation for hosts without ffmpeg. Samples are copied
/// as-is; every segment must share the first segment's format.
#[derive(Debug, Default, Clone)]
pub struct WavConcatMerger;

#[async_trait]
impl SegmentMerger for WavConcatMerger {
    fn name(&self) -> &'static str {
        "wav-concat"
    }

    async fn concat(
        &self,
        _manifest: &Path,
        segments: &[PathBuf],
        output: &Path,
    ) -> Result<(), CaptureError> {
        let segments = segments.to_vec();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || concat_wav(&segments, &output))
            .await
            .map_err(|e| CaptureError::Merge(format!("merge task panicked: {e}")))?
    }
}

fn concat_wav(segments: &[PathBuf], output: &Path) -> Result<(), CaptureError> {
    let first = segments
        .first()
        .ok_or_else(|| CaptureError::Merge("no segments to merge".to_string()))?;
    let spec = open_wav(first)?.spec();

    let mut writer = WavWriter::create(output, spec).map_err(wav_error)?;
    for segment in segments {
        let reader = open_wav(segment)?;
        if reader.spec() != spec {
            return Err(CaptureError::Merge(format!(
                "segment {:?} format {:?} differs from {:?}",
                segment,
                reader.spec(),
                spec
            )));
        }
        copy_samples(reader, &mut writer, spec)?;
    }
    writer.finalize().map_err(wav_error)?;
    Ok(())
}

fn open_wav(path: &Path) -> Result<WavReader<std::io::BufReader<std::fs::File>>, CaptureError> {
    WavReader::open(path)
        .map_err(|e| CaptureError::Merge(format!("cannot read segment {path:?}: {e}")))
}

fn copy_samples<R, W>(
    mut reader: WavReader<R>,
    writer: &mut WavWriter<W>,
    spec: WavSpec,
) -> Result<(), CaptureError>
where
    R: std::io::Read,
    W: std::io::Write + std::io::Seek,
{
    match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => {
            for sample in reader.samples::<f32>() {
                writer.write_sample(sample.map_err(wav_error)?).map_err(wav_error)?;
            }
        }
        (SampleFormat::Int, bits) if bits <= 16 => {
            for sample in reader.samples::<i16>() {
                writer.write_sample(sample.map_err(wav_error)?).map_err(wav_error)?;
            }
        }
        (SampleFormat::Int, _) => {
            for sample in reader.samples::<i32>() {
                writer.write_sample(sample.map_err(wav_error)?).map_err(wav_error)?;
            }
        }
    }
    Ok(())
}

fn wav_error(e: hound::Error) -> CaptureError {
    CaptureError::Merge(e.to_string())
}
