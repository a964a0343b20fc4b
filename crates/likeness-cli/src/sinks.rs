//! Reporting sink for the realtime loop.

use likeness_core::realtime::{Annotation, Flow, FrameSink, SinkError};
use likeness_core::Frame;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

/// Logs each decision, prints one JSON line per presented frame and
/// optionally saves every frame, annotated or raw, as PNG.
pub struct ReportSink<W: Write> {
    out: W,
    output_dir: Option<PathBuf>,
    max_frames: Option<u64>,
    presented: u64,
}

#[derive(Serialize)]
struct Report<'a> {
    sequence: u64,
    /// `null` for a frame presented raw.
    face: Option<&'a Annotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<&'a PathBuf>,
}

impl<W: Write> ReportSink<W> {
    pub fn new(out: W, output_dir: Option<PathBuf>, max_frames: Option<u64>) -> Result<Self, SinkError> {
        if let Some(dir) = &output_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| SinkError(format!("creating {}: {e}", dir.display())))?;
        }
        Ok(Self {
            out,
            output_dir,
            max_frames,
            presented: 0,
        })
    }
}

impl<W: Write> FrameSink for ReportSink<W> {
    fn present(&mut self, frame: &Frame, annotation: Option<&Annotation>) -> Result<Flow, SinkError> {
        self.presented += 1;

        match annotation {
            Some(annotation) => tracing::info!(
                seq = frame.sequence,
                label = %annotation.label,
                candidate = ?annotation.result.candidate,
                score = annotation.result.score,
                "face"
            ),
            None => tracing::debug!(seq = frame.sequence, "raw frame"),
        }

        let saved_to = match &self.output_dir {
            Some(dir) => {
                let path = dir.join(format!("frame_{:06}.png", frame.sequence));
                frame
                    .image
                    .save(&path)
                    .map_err(|e| SinkError(format!("writing {}: {e}", path.display())))?;
                Some(path)
            }
            None => None,
        };

        let report = Report {
            sequence: frame.sequence,
            face: annotation,
            saved_to: saved_to.as_ref(),
        };
        let line = serde_json::to_string(&report).map_err(|e| SinkError(e.to_string()))?;
        writeln!(self.out, "{line}").map_err(|e| SinkError(e.to_string()))?;

        match self.max_frames {
            Some(max) if self.presented >= max => Ok(Flow::Stop),
            _ => Ok(Flow::Continue),
        }
    }
}
