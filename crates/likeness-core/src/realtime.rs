//! Frame-at-a-time identification loop.
//!
//! Each iteration checks the cancel token, blocks on the source for the next
//! frame, then runs detect → extract → classify → annotate on it and hands
//! the result to the sink. A frame without a usable face is presented raw.
//! A bad frame from the source is counted and skipped; a device error ends
//! the run. The source is released on every exit path.

use crate::classifier::ClassifyError;
use crate::engine::Engine;
use crate::types::{FaceRegion, Frame, MatchResult};
use ab_glyph::FontRef;
use image::{DynamicImage, Rgb};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

const ACCEPTED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const LABEL_SCALE: f32 = 16.0;
const LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("end of stream")]
    EndOfStream,
    /// One unusable frame; the device is still streaming.
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("capture device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

#[derive(Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Capture(CaptureError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Blocking supplier of frames.
pub trait FrameSource {
    /// Block until the next frame, the end of the stream or a device error.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Give the underlying device back. Called exactly once by the loop.
    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Whether the loop should keep going after a frame was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receiver of every processed frame, annotated or raw.
pub trait FrameSink {
    fn present(&mut self, frame: &Frame, annotation: Option<&Annotation>) -> Result<Flow, SinkError>;
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn present(&mut self, frame: &Frame, annotation: Option<&Annotation>) -> Result<Flow, SinkError> {
        (**self).present(frame, annotation)
    }
}

/// Cooperative cancellation flag, checked once per iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Capture,
    Detect,
    Extract,
    Classify,
    Annotate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Capture => "capture",
            Stage::Detect => "detect",
            Stage::Extract => "extract",
            Stage::Classify => "classify",
            Stage::Annotate => "annotate",
        })
    }
}

/// The decision drawn onto one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub sequence: u64,
    pub region: FaceRegion,
    /// `name (score)` for an accepted match, `UNKNOWN` otherwise.
    pub label: String,
    pub result: MatchResult,
}

impl Annotation {
    fn new(sequence: u64, region: FaceRegion, result: MatchResult) -> Self {
        let label = match &result.identity {
            Some(name) => format!("{name} ({:.2})", result.score),
            None => "UNKNOWN".to_string(),
        };
        Self {
            sequence,
            region,
            label,
            result,
        }
    }
}

/// What happened to a single frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    NoFace,
    /// A face was found but no descriptor could be computed for it.
    Undescribed,
    /// A contained per-frame failure in the given stage.
    Failed(Stage),
    Annotated(Annotation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    SinkStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub frames: u64,
    pub no_face: u64,
    pub undescribed: u64,
    pub failed: u64,
    pub classified: u64,
    pub matched: u64,
    pub stop: StopReason,
}

impl LoopSummary {
    fn new() -> Self {
        Self {
            frames: 0,
            no_face: 0,
            undescribed: 0,
            failed: 0,
            classified: 0,
            matched: 0,
            stop: StopReason::EndOfStream,
        }
    }
}

/// Owns the source for the duration of a run and releases it when dropped.
struct CaptureGuard<S: FrameSource>(S);

impl<S: FrameSource> Deref for CaptureGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.0
    }
}

impl<S: FrameSource> DerefMut for CaptureGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.0
    }
}

impl<S: FrameSource> Drop for CaptureGuard<S> {
    fn drop(&mut self) {
        self.0.release();
        tracing::debug!("capture released");
    }
}

pub struct RealtimeLoop<'e> {
    engine: &'e mut Engine,
    cancel: CancelToken,
}

impl<'e> RealtimeLoop<'e> {
    pub fn new(engine: &'e mut Engine, cancel: CancelToken) -> Self {
        Self { engine, cancel }
    }

    /// Run until cancelled, the stream ends or the sink asks to stop.
    ///
    /// A device error or a classification fault ends the run with an error,
    /// after the source has been released.
    pub fn run<S, K>(&mut self, source: S, sink: &mut K) -> Result<LoopSummary, LoopError>
    where
        S: FrameSource,
        K: FrameSink + ?Sized,
    {
        let mut source = CaptureGuard(source);
        let mut summary = LoopSummary::new();

        loop {
            if self.cancel.is_cancelled() {
                summary.stop = StopReason::Cancelled;
                break;
            }

            let mut frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(CaptureError::EndOfStream) => {
                    summary.stop = StopReason::EndOfStream;
                    break;
                }
                Err(CaptureError::BadFrame(reason)) => {
                    summary.frames += 1;
                    summary.failed += 1;
                    tracing::warn!(stage = %Stage::Capture, %reason, "frame dropped");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, frames = summary.frames, "capture failed");
                    return Err(LoopError::Capture(e));
                }
            };
            summary.frames += 1;

            let outcome = self.process(&mut frame)?;
            let annotation = match outcome {
                FrameOutcome::NoFace => {
                    summary.no_face += 1;
                    None
                }
                FrameOutcome::Undescribed => {
                    summary.undescribed += 1;
                    None
                }
                FrameOutcome::Failed(_) => {
                    summary.failed += 1;
                    None
                }
                FrameOutcome::Annotated(annotation) => {
                    summary.classified += 1;
                    if annotation.result.is_match() {
                        summary.matched += 1;
                    }
                    Some(annotation)
                }
            };

            if sink.present(&frame, annotation.as_ref())? == Flow::Stop {
                summary.stop = StopReason::SinkStopped;
                break;
            }
        }

        tracing::info!(
            frames = summary.frames,
            classified = summary.classified,
            matched = summary.matched,
            stop = ?summary.stop,
            "realtime loop finished"
        );
        Ok(summary)
    }

    /// Detect, extract, classify and annotate one frame in place.
    fn process(&mut self, frame: &mut Frame) -> Result<FrameOutcome, LoopError> {
        let seq = frame.sequence;

        let region = match self.engine.detect_primary(&frame.image) {
            Ok(Some(region)) => region,
            Ok(None) => {
                tracing::debug!(seq, "no face");
                return Ok(FrameOutcome::NoFace);
            }
            Err(e) => {
                tracing::warn!(seq, stage = %Stage::Detect, error = %e, "frame skipped");
                return Ok(FrameOutcome::Failed(Stage::Detect));
            }
        };

        let descriptor = match self.engine.describe(&frame.image, &region) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                tracing::debug!(seq, "face could not be described");
                return Ok(FrameOutcome::Undescribed);
            }
            Err(e) => {
                tracing::warn!(seq, stage = %Stage::Extract, error = %e, "frame skipped");
                return Ok(FrameOutcome::Failed(Stage::Extract));
            }
        };

        let result = self.engine.classify(&descriptor)?;
        let annotation = Annotation::new(seq, region, result);
        tracing::debug!(seq, label = %annotation.label, "frame annotated");

        draw_annotation(&mut frame.image, &annotation);
        Ok(FrameOutcome::Annotated(annotation))
    }
}

fn draw_annotation(image: &mut DynamicImage, annotation: &Annotation) {
    let Some(rect) = annotation.region.clip(image.width(), image.height()) else {
        return;
    };
    let color = if annotation.result.is_match() {
        ACCEPTED_COLOR
    } else {
        UNKNOWN_COLOR
    };

    let mut canvas = image.to_rgb8();
    draw_hollow_rect_mut(
        &mut canvas,
        Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
        color,
    );
    if rect.width > 2 && rect.height > 2 {
        draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(rect.x as i32 + 1, rect.y as i32 + 1).of_size(rect.width - 2, rect.height - 2),
            color,
        );
    }

    if let Some(font) = label_font() {
        let (_, text_height) = text_size(LABEL_SCALE, font, &annotation.label);
        // Above the box when it fits, else inside it clear of the border.
        let (x, y) = if rect.y >= text_height + 2 {
            (rect.x, rect.y - text_height - 2)
        } else {
            (rect.x + 3, rect.y + 3)
        };
        draw_text_mut(
            &mut canvas,
            color,
            x as i32,
            y as i32,
            LABEL_SCALE,
            font,
            &annotation.label,
        );
    }
    *image = DynamicImage::ImageRgb8(canvas);
}

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unusable, drawing boxes only");
            None
        }
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, Metric, Strategy, Threshold};
    use crate::detector::{DetectorError, FaceDetector};
    use crate::extractor::FeatureExtractor;
    use crate::gallery::Gallery;
    use crate::histogram::LbphParams;
    use image::{GenericImageView, GrayImage, Luma};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const FACE_MARKER: u8 = 255;
    const ERROR_MARKER: u8 = 1;
    const OUTSIDE_MARKER: u8 = 2;

    /// Reports a face only on frames whose top-left pixel is the marker.
    struct MarkerDetector;

    impl FaceDetector for MarkerDetector {
        fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, DetectorError> {
            match image.get_pixel(0, 0)[0] {
                FACE_MARKER => Ok(vec![face_region()]),
                ERROR_MARKER => Err(DetectorError::InferenceFailed("bad frame".into())),
                OUTSIDE_MARKER => Ok(vec![FaceRegion::new(100.0, 100.0, 10.0, 10.0)]),
                _ => Ok(vec![]),
            }
        }
    }

    fn face_region() -> FaceRegion {
        FaceRegion::new(4.0, 4.0, 24.0, 24.0)
    }

    fn frame_image(marker: Option<u8>) -> DynamicImage {
        let mut gray = GrayImage::from_fn(32, 32, |x, y| Luma([((x * 5 + y * 7 + 3) % 251) as u8]));
        if let Some(m) = marker {
            gray.put_pixel(0, 0, Luma([m]));
        }
        DynamicImage::ImageLuma8(gray)
    }

    fn params() -> LbphParams {
        LbphParams {
            radius: 1,
            grid_x: 2,
            grid_y: 2,
            input_size: 16,
        }
    }

    fn engine(enrolled: bool) -> Engine {
        engine_with(FeatureExtractor::histogram(params()), enrolled)
    }

    fn engine_with(mut extractor: FeatureExtractor, enrolled: bool) -> Engine {
        let mut gallery = Gallery::new(extractor.id(), extractor.dimension());
        if enrolled {
            let d = extractor
                .extract_region(&frame_image(Some(FACE_MARKER)), &face_region())
                .unwrap()
                .unwrap();
            gallery.insert("alice", vec![d]).unwrap();
        }
        let classifier =
            Classifier::new(Strategy::Prototype, Metric::ChiSquare, Threshold::MaxDistance(0.5)).unwrap();
        Engine::new(Box::new(MarkerDetector), extractor, classifier, Arc::new(gallery)).unwrap()
    }

    struct ScriptedSource {
        script: VecDeque<Result<DynamicImage, CaptureError>>,
        sequence: u64,
        released: Rc<Cell<usize>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<DynamicImage, CaptureError>>) -> (Self, Rc<Cell<usize>>) {
            let released = Rc::new(Cell::new(0));
            let source = Self {
                script: script.into(),
                sequence: 0,
                released: Rc::clone(&released),
            };
            (source, released)
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            let image = self.script.pop_front().unwrap_or(Err(CaptureError::EndOfStream))?;
            self.sequence += 1;
            Ok(Frame::new(image, self.sequence))
        }

        fn release(&mut self) {
            self.released.set(self.released.get() + 1);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        presented: Vec<u64>,
        annotations: Vec<Annotation>,
        stop_after: Option<usize>,
        last_image: Option<DynamicImage>,
    }

    impl FrameSink for RecordingSink {
        fn present(&mut self, frame: &Frame, annotation: Option<&Annotation>) -> Result<Flow, SinkError> {
            self.presented.push(frame.sequence);
            self.annotations.extend(annotation.cloned());
            self.last_image = Some(frame.image.clone());
            match self.stop_after {
                Some(n) if self.presented.len() >= n => Ok(Flow::Stop),
                _ => Ok(Flow::Continue),
            }
        }
    }

    /// Keeps every presented frame with its annotation.
    #[derive(Default)]
    struct CapturingSink {
        frames: Vec<(DynamicImage, Option<Annotation>)>,
    }

    impl FrameSink for CapturingSink {
        fn present(&mut self, frame: &Frame, annotation: Option<&Annotation>) -> Result<Flow, SinkError> {
            self.frames.push((frame.image.clone(), annotation.cloned()));
            Ok(Flow::Continue)
        }
    }

    #[test]
    fn test_only_face_frame_is_classified() {
        let mut engine = engine(true);
        let script = [None, None, Some(FACE_MARKER), None, None]
            .into_iter()
            .map(|m| Ok(frame_image(m)))
            .collect();
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink::default();

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();

        assert_eq!(summary.frames, 5);
        assert_eq!(summary.classified, 1);
        assert_eq!(summary.no_face, 4);
        assert_eq!(summary.stop, StopReason::EndOfStream);
        assert_eq!(sink.presented, [1, 2, 3, 4, 5]);
        assert_eq!(sink.annotations.len(), 1);
        let annotation = &sink.annotations[0];
        assert_eq!(annotation.sequence, 3);
        assert_eq!(annotation.region, face_region());
        assert_eq!(annotation.result.identity.as_deref(), Some("alice"));
        assert_eq!(annotation.label, "alice (0.00)");
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_annotated_frame_has_rectangle() {
        let mut engine = engine(true);
        let (source, _) = ScriptedSource::new(vec![Ok(frame_image(Some(FACE_MARKER)))]);
        let mut sink = RecordingSink::default();
        RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();

        let image = sink.last_image.unwrap().to_rgb8();
        assert_eq!(*image.get_pixel(4, 10), ACCEPTED_COLOR);
        assert_eq!(*image.get_pixel(27, 27), ACCEPTED_COLOR);
    }

    #[test]
    fn test_unknown_face_labelled_unknown() {
        let mut engine = engine(false);
        let (source, _) = ScriptedSource::new(vec![Ok(frame_image(Some(FACE_MARKER)))]);
        let mut sink = RecordingSink::default();
        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();

        assert_eq!(summary.classified, 1);
        assert_eq!(summary.matched, 0);
        assert_eq!(sink.annotations[0].label, "UNKNOWN");
        let image = sink.last_image.unwrap().to_rgb8();
        assert_eq!(*image.get_pixel(4, 10), UNKNOWN_COLOR);
    }

    #[test]
    fn test_detector_failure_is_contained() {
        let mut engine = engine(true);
        let script = vec![Ok(frame_image(Some(ERROR_MARKER))), Ok(frame_image(Some(FACE_MARKER)))];
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink::default();

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.classified, 1);
        assert_eq!(sink.presented, [1, 2]);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_undescribed_face_presented_raw() {
        // Landmark descriptors need landmarks; the detector reports none.
        let mut engine = engine_with(FeatureExtractor::landmarks(), false);
        let script = vec![Ok(frame_image(Some(FACE_MARKER))), Ok(frame_image(None))];
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink::default();

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.undescribed, 1);
        assert_eq!(summary.no_face, 1);
        assert_eq!(summary.classified, 0);
        assert_eq!(sink.presented, [1, 2]);
        assert!(sink.annotations.is_empty());
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_extraction_failure_is_contained() {
        let mut engine = engine(true);
        let script = vec![Ok(frame_image(Some(OUTSIDE_MARKER))), Ok(frame_image(Some(FACE_MARKER)))];
        let (source, _) = ScriptedSource::new(script);
        let mut sink = CapturingSink::default();

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.classified, 1);
        assert_eq!(sink.frames.len(), 2);
        let (raw, annotation) = &sink.frames[0];
        assert!(annotation.is_none());
        assert_eq!(*raw, frame_image(Some(OUTSIDE_MARKER)));
    }

    #[test]
    fn test_bad_frame_is_skipped() {
        let mut engine = engine(true);
        let script = vec![
            Ok(frame_image(None)),
            Err(CaptureError::BadFrame("short buffer".into())),
            Ok(frame_image(Some(FACE_MARKER))),
        ];
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink::default();

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.classified, 1);
        assert_eq!(summary.stop, StopReason::EndOfStream);
        assert_eq!(sink.presented, [1, 2]);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_label_drawn_above_box() {
        let mut image = DynamicImage::ImageRgb8(image::RgbImage::new(120, 80));
        let result = MatchResult {
            identity: Some("alice".to_string()),
            candidate: Some("alice".to_string()),
            score: 0.91,
            polarity: crate::types::Polarity::HigherIsBetter,
        };
        let annotation = Annotation::new(1, FaceRegion::new(20.0, 40.0, 60.0, 30.0), result);
        draw_annotation(&mut image, &annotation);

        let rgb = image.to_rgb8();
        let label_pixels = (0..38)
            .flat_map(|y| (0..120).map(move |x| (x, y)))
            .filter(|&(x, y)| rgb.get_pixel(x, y)[1] > 0)
            .count();
        assert!(label_pixels > 0);
        assert_eq!(*rgb.get_pixel(20, 55), ACCEPTED_COLOR);
    }

    #[test]
    fn test_label_drawn_inside_box_at_top_edge() {
        let mut engine = engine(false);
        let (source, _) = ScriptedSource::new(vec![Ok(frame_image(Some(FACE_MARKER)))]);
        let mut sink = RecordingSink::default();
        RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();

        // "UNKNOWN" sits inside the 4..28 box, clear of its double border.
        let original = frame_image(Some(FACE_MARKER)).to_rgb8();
        let image = sink.last_image.unwrap().to_rgb8();
        let changed = (6..26)
            .flat_map(|y| (6..26).map(move |x| (x, y)))
            .filter(|&(x, y)| image.get_pixel(x, y) != original.get_pixel(x, y))
            .count();
        assert!(changed > 0);
    }

    #[test]
    fn test_cancel_before_first_frame() {
        let mut engine = engine(true);
        let (source, released) = ScriptedSource::new(vec![Ok(frame_image(None))]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = RecordingSink::default();

        let summary = RealtimeLoop::new(&mut engine, cancel).run(source, &mut sink).unwrap();
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.frames, 0);
        assert!(sink.presented.is_empty());
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_sink_stop() {
        let mut engine = engine(true);
        let script = (0..4).map(|_| Ok(frame_image(None))).collect();
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink {
            stop_after: Some(2),
            ..Default::default()
        };

        let summary = RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(source, &mut sink)
            .unwrap();
        assert_eq!(summary.stop, StopReason::SinkStopped);
        assert_eq!(summary.frames, 2);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_device_error_releases_and_surfaces() {
        let mut engine = engine(true);
        let script = vec![
            Ok(frame_image(None)),
            Err(CaptureError::Device("unplugged".into())),
            Ok(frame_image(None)),
        ];
        let (source, released) = ScriptedSource::new(script);
        let mut sink = RecordingSink::default();

        let result = RealtimeLoop::new(&mut engine, CancelToken::new()).run(source, &mut sink);
        assert!(matches!(result, Err(LoopError::Capture(CaptureError::Device(_)))));
        assert_eq!(sink.presented, [1]);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_boxed_source_releases() {
        let mut engine = engine(true);
        let (source, released) = ScriptedSource::new(vec![]);
        let boxed: Box<dyn FrameSource> = Box::new(source);
        let mut sink: Box<dyn FrameSink> = Box::new(RecordingSink::default());

        RealtimeLoop::new(&mut engine, CancelToken::new())
            .run(boxed, &mut sink)
            .unwrap();
        assert_eq!(released.get(), 1);
    }
}
