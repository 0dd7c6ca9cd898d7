//! Video stream handling using OpenCV backend
//!
//! This module wraps OpenCV's VideoCapture for frame reading. On top of the
//! plain stream it provides a reader bounded to one segment, a [`ClipSource`]
//! that opens such readers, and a [`MediaProbe`] that measures files by frame
//! count.

use std::path::{Path, PathBuf};

use opencv::{core::Mat, prelude::*, videoio};
use tracing::{debug, info, instrument, warn};

use crate::common::{Result, SamplerError};
use crate::segment::{ClipSource, Segment};
use crate::source::MediaProbe;

/// Wrapper around OpenCV VideoCapture for consistent video reading
pub struct VideoStream {
    cap: videoio::VideoCapture,
    fps: f64,
    frame_count: i32,
    current_frame: i32,
    width: i32,
    height: i32,
    path: PathBuf,
}

impl VideoStream {
    /// Open a video file for reading
    ///
    /// # Arguments
    /// * `path` - Path to the video file
    ///
    /// # Errors
    /// * `FileNotFound` - If the file doesn't exist
    /// * `ProbeFailed` - If OpenCV can't open the file or reports unusable properties
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening video stream: {}", path.display());

        if !path.is_file() {
            return Err(SamplerError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| SamplerError::probe_error(path, "Path is not valid UTF-8"))?;

        let cap = videoio::VideoCapture::from_file(path_str, videoio::CAP_ANY).map_err(|e| {
            warn!("Failed to create VideoCapture: {}", e);
            SamplerError::probe_error(path, format!("VideoCapture failed: {}", e))
        })?;

        if !cap.is_opened()? {
            return Err(SamplerError::probe_error(path, "OpenCV could not open the file"));
        }

        let property = |id: i32, label: &str| {
            cap.get(id).map_err(|e| {
                warn!("Failed to get video {}: {}", label, e);
                SamplerError::probe_error(path, format!("Failed to read {}: {}", label, e))
            })
        };

        let fps = property(videoio::CAP_PROP_FPS, "fps")?;
        let frame_count = property(videoio::CAP_PROP_FRAME_COUNT, "frame count")? as i32;
        let width = property(videoio::CAP_PROP_FRAME_WIDTH, "frame width")? as i32;
        let height = property(videoio::CAP_PROP_FRAME_HEIGHT, "frame height")? as i32;

        if fps <= 0.0 {
            return Err(SamplerError::probe_error(path, format!("Invalid fps: {}", fps)));
        }
        if frame_count <= 0 {
            return Err(SamplerError::probe_error(path, "Video has no frames"));
        }
        if width <= 0 || height <= 0 {
            return Err(SamplerError::probe_error(
                path,
                format!("Invalid frame size {}x{}", width, height),
            ));
        }

        info!(
            "Video opened successfully - FPS: {}, Frames: {}, Size: {}x{}",
            fps, frame_count, width, height
        );

        Ok(Self {
            cap,
            fps,
            frame_count,
            current_frame: 0,
            width,
            height,
            path: path.to_path_buf(),
        })
    }

    /// Read the next frame from the video
    ///
    /// # Returns
    /// * `Result<Option<Mat>>` - The next frame if available, None if end of video
    pub fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();

        let success = self.cap.read(&mut frame).map_err(|e| {
            SamplerError::probe_error(
                &self.path,
                format!("Read failed at frame {}: {}", self.current_frame, e),
            )
        })?;

        if !success || frame.empty() {
            debug!("Reached end of video at frame {}", self.current_frame);
            return Ok(None);
        }

        self.current_frame += 1;
        if frame.rows() != self.height || frame.cols() != self.width {
            return Err(SamplerError::probe_error(
                &self.path,
                format!(
                    "Frame size changed to {}x{} (expected {}x{})",
                    frame.cols(),
                    frame.rows(),
                    self.width,
                    self.height
                ),
            ));
        }

        Ok(Some(frame))
    }

    /// Position the stream at `seconds`; the next read returns that frame
    #[instrument(skip(self))]
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let frame = (seconds * self.fps).round() as i32;
        if !self.cap.set(videoio::CAP_PROP_POS_FRAMES, frame as f64)? {
            return Err(SamplerError::probe_error(
                &self.path,
                format!("Seek to {:.3}s rejected by backend", seconds),
            ));
        }
        self.current_frame = frame;
        Ok(())
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    /// Index of the next frame to be read
    pub fn current_frame(&self) -> i32 {
        self.current_frame
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usable length in seconds: the last frame's start time
    pub fn duration_seconds(&self) -> f64 {
        (self.frame_count as f64 - 1.0).max(0.0) / self.fps
    }
}

// Implement Debug manually to avoid showing internal OpenCV state
impl std::fmt::Debug for VideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStream")
            .field("path", &self.path)
            .field("fps", &self.fps)
            .field("frame_count", &self.frame_count)
            .field("current_frame", &self.current_frame)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Frames of one segment, read in order
#[derive(Debug)]
pub struct SegmentReader {
    stream: VideoStream,
    end_frame: i32,
}

impl SegmentReader {
    /// Open `segment.file()` and seek to the segment start
    pub fn open(segment: &Segment) -> Result<Self> {
        let mut stream = VideoStream::open(segment.file())?;
        stream.seek(segment.start())?;
        let end_frame = ((segment.end() * stream.fps()).round() as i32).min(stream.frame_count());
        debug!(
            "Reading {} as frames [{}, {})",
            segment,
            stream.current_frame(),
            end_frame
        );
        Ok(Self { stream, end_frame })
    }

    /// Number of frames inside the segment
    pub fn frame_total(&self) -> usize {
        (self.end_frame - self.stream.current_frame()).max(0) as usize
    }

    pub fn stream(&self) -> &VideoStream {
        &self.stream
    }

    /// Next frame within the segment, or `None` past its end
    pub fn next_frame(&mut self) -> Result<Option<Mat>> {
        if self.stream.current_frame() >= self.end_frame {
            return Ok(None);
        }
        self.stream.read_frame()
    }

    /// Read every remaining frame of the segment
    pub fn frames(mut self) -> Result<Vec<Mat>> {
        let mut frames = Vec::with_capacity(self.frame_total());
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Opens segments as in-process frame readers
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvClips;

impl ClipSource for OpenCvClips {
    type Clip = SegmentReader;

    fn open_clip(&self, segment: &Segment) -> Result<SegmentReader> {
        SegmentReader::open(segment)
    }
}

/// Measures media length from OpenCV's frame count and frame rate
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvProbe;

impl MediaProbe for OpenCvProbe {
    fn duration(&self, path: &Path) -> Result<f64> {
        Ok(VideoStream::open(path)?.duration_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_video_stream_nonexistent_file() {
        let result = VideoStream::open(Path::new("nonexistent_video.mp4"));
        match result.unwrap_err() {
            SamplerError::FileNotFound { path } => {
                assert_eq!(path, PathBuf::from("nonexistent_video.mp4"));
            }
            other => panic!("Expected FileNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_video_stream_directory_instead_of_file() {
        let dir = TempDir::new().unwrap();
        let result = VideoStream::open(dir.path());
        assert!(matches!(result.unwrap_err(), SamplerError::FileNotFound { .. }));
    }

    #[test]
    fn test_probe_rejects_non_video() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.mp4");
        std::fs::write(&path, b"definitely not a video").unwrap();

        let error = OpenCvProbe.duration(&path).unwrap_err();
        assert!(error.is_source_local(), "unexpected error: {:?}", error);
    }

    #[test]
    fn test_clip_source_propagates_missing_file() {
        let segment = Segment::new("missing.mp4", 0.0, 1.0);
        assert!(segment.materialize(&OpenCvClips).is_err());
    }
}
