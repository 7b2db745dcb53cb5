//! The frame capture state machine.
//!
//! A `FrameCapturer` decides when a capture starts and what happens when it
//! ends. It knows nothing about resources or contexts: `Device` asks it
//! whether to begin at each frame boundary, does the work of starting the
//! capture, and at the next boundary reports whether anything uncapturable
//! happened. The capturer answers with a `FrameEnd` saying whether to write
//! the frame out, throw it away and try the next frame instead, or give up.
//!
//! Frames are counted by presents. A capture queued for frame `N` starts at
//! the present that brings the counter to `N`, so the frame it captures is
//! numbered `N + 1`.

use crate::error::CaptureError;
use crate::id::ResourceId;
use crate::options::CaptureOptions;

use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// How many times in a row a failed capture is retried on the next frame
/// before we give up.
pub const MAX_RETRIES: u32 = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    CapturingFrame,
}

/// Why a frame couldn't be captured.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureFailReason {
    /// A command list recorded outside the capture was executed in it.
    UncappedCommandList,
    /// An `Unmap` whose `Map` happened before the capture started.
    UncappedUnmap,
    /// The frame was captured, but writing the file failed.
    WriteFailed,
}

impl fmt::Display for CaptureFailReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CaptureFailReason::UncappedCommandList => "Uncapped command list",
            CaptureFailReason::UncappedUnmap => "Uncapped Map()/Unmap()",
            CaptureFailReason::WriteFailed => "Couldn't write capture file",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Pending,
    Succeeded,
    Failed(CaptureFailReason),
}

/// One capture attempt.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub frame_number: u32,
    pub capture_time: DateTime<Local>,
    pub outcome: FrameOutcome,
    /// The file the capture was written to, once it has been.
    pub path: Option<PathBuf>,
    /// Resources the frame referenced, filled in when it's flushed.
    pub referenced: Vec<ResourceId>,
}

impl CapturedFrame {
    fn new(frame_number: u32) -> CapturedFrame {
        CapturedFrame {
            frame_number,
            capture_time: Local::now(),
            outcome: FrameOutcome::Pending,
            path: None,
            referenced: Vec::new(),
        }
    }
}

/// What to do with the frame that just ended.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameEnd {
    /// Write it out.
    Flush { frame_number: u32 },
    /// Discard it, and capture the next frame instead. The capturer is
    /// still in `CapturingFrame`.
    Retry {
        failed_frame: u32,
        next_frame: u32,
        reason: CaptureFailReason,
    },
    /// Discard it and go idle.
    Abort { frame_number: u32, reason: CaptureFailReason },
}

#[derive(Debug)]
pub struct FrameCapturer {
    state: CaptureState,
    frame_counter: u32,
    queued: BTreeSet<u32>,
    app_controlled: bool,
    failures: u32,
    current: Option<CapturedFrame>,
    last_failure: Option<(u32, CaptureFailReason)>,
    captures: Vec<CapturedFrame>,
}

impl FrameCapturer {
    pub fn new(options: &CaptureOptions) -> FrameCapturer {
        let mut queued: BTreeSet<u32> = options.capture_frames.iter().copied().collect();
        if options.capture_first_frame {
            queued.insert(0);
        }
        FrameCapturer {
            state: CaptureState::Idle,
            frame_counter: 0,
            queued,
            app_controlled: false,
            failures: 0,
            current: None,
            last_failure: None,
            captures: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::CapturingFrame
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn is_app_controlled(&self) -> bool {
        self.app_controlled
    }

    pub fn current(&self) -> Option<&CapturedFrame> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut CapturedFrame> {
        self.current.as_mut()
    }

    /// Arrange to capture after the present that brings the frame counter
    /// to `frame`.
    pub fn queue_capture(&mut self, frame: u32) {
        self.queued.insert(frame);
    }

    /// Capture the next frame, whatever its number.
    pub fn trigger_capture(&mut self) {
        self.queued.insert(self.frame_counter + 1);
    }

    /// Count a present.
    pub fn advance_frame(&mut self) -> u32 {
        self.frame_counter += 1;
        self.frame_counter
    }

    /// True if a capture is queued for the current frame counter. Consumes
    /// the request.
    pub fn take_trigger(&mut self) -> bool {
        self.queued.remove(&self.frame_counter)
    }

    /// Start capturing the frame after the current counter.
    pub fn begin(&mut self, app_controlled: bool) -> Result<u32, CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let frame_number = self.frame_counter + 1;
        self.state = CaptureState::CapturingFrame;
        self.app_controlled = app_controlled;
        self.current = Some(CapturedFrame::new(frame_number));
        tracing::info!(frame = frame_number, app_controlled, "starting frame capture");
        Ok(frame_number)
    }

    /// End the frame being captured. `failure` is the first uncapturable
    /// thing the frame did, if any.
    pub fn end(&mut self, failure: Option<CaptureFailReason>) -> Result<FrameEnd, CaptureError> {
        let frame_number = match (&self.current, self.state) {
            (Some(frame), CaptureState::CapturingFrame) => frame.frame_number,
            _ => return Err(CaptureError::NotCapturing),
        };

        let reason = match failure {
            None => {
                self.failures = 0;
                self.state = CaptureState::Idle;
                tracing::info!(frame = frame_number, "frame capture succeeded");
                return Ok(FrameEnd::Flush { frame_number });
            }
            Some(reason) => reason,
        };

        self.failures += 1;
        if let Some(frame) = self.current.as_mut() {
            frame.outcome = FrameOutcome::Failed(reason);
        }

        if self.app_controlled || self.failures > MAX_RETRIES {
            tracing::error!(
                frame = frame_number,
                failures = self.failures,
                "frame capture failed, giving up: {}",
                reason
            );
            self.abandon(frame_number, reason);
            return Ok(FrameEnd::Abort { frame_number, reason });
        }

        let next_frame = self.frame_counter + 1;
        tracing::warn!(
            frame = frame_number,
            failures = self.failures,
            "frame capture failed, retrying on frame {}: {}",
            next_frame,
            reason
        );
        self.current = Some(CapturedFrame::new(next_frame));
        Ok(FrameEnd::Retry {
            failed_frame: frame_number,
            next_frame,
            reason,
        })
    }

    fn abandon(&mut self, frame_number: u32, reason: CaptureFailReason) {
        self.failures = 0;
        self.state = CaptureState::Idle;
        self.last_failure = Some((frame_number, reason));
        if let Some(mut frame) = self.current.take() {
            frame.outcome = FrameOutcome::Failed(reason);
            self.captures.push(frame);
        }
    }

    /// The frame was written to `path`.
    pub fn flushed(&mut self, path: PathBuf, referenced: Vec<ResourceId>) {
        if let Some(mut frame) = self.current.take() {
            frame.outcome = FrameOutcome::Succeeded;
            frame.path = Some(path);
            frame.referenced = referenced;
            self.captures.push(frame);
        }
    }

    /// Writing the frame failed.
    pub fn flush_failed(&mut self, frame_number: u32) {
        self.abandon(frame_number, CaptureFailReason::WriteFailed);
    }

    /// Every finished attempt, oldest first.
    pub fn captures(&self) -> &[CapturedFrame] {
        &self.captures
    }

    pub fn last_failure(&self) -> Option<(u32, CaptureFailReason)> {
        self.last_failure
    }

    /// The diagnostic text an overlay should show, if the last attempt
    /// failed.
    pub fn overlay_text(&self) -> Option<String> {
        self.last_failure
            .map(|(frame, reason)| format!("Failed capture at frame {}:\n    {}", frame, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capturer() -> FrameCapturer {
        FrameCapturer::new(&CaptureOptions::default())
    }

    #[test]
    fn queued_capture_numbers_next_frame() {
        let mut frames = capturer();
        frames.queue_capture(5);
        for _ in 0..4 {
            frames.advance_frame();
            assert!(!frames.take_trigger());
        }
        frames.advance_frame();
        assert!(frames.take_trigger());
        assert_eq!(frames.begin(false).unwrap(), 6);
        assert!(frames.is_capturing());
        assert!(matches!(frames.begin(false), Err(CaptureError::AlreadyCapturing)));

        frames.advance_frame();
        assert_eq!(frames.end(None).unwrap(), FrameEnd::Flush { frame_number: 6 });
        frames.flushed(PathBuf::from("frame6.cap"), vec![]);
        assert_eq!(frames.captures()[0].outcome, FrameOutcome::Succeeded);
        assert!(!frames.is_capturing());
    }

    #[test]
    fn retries_are_bounded() {
        let mut frames = capturer();
        frames.begin(false).unwrap();
        let mut retries = 0;
        loop {
            frames.advance_frame();
            match frames.end(Some(CaptureFailReason::UncappedUnmap)).unwrap() {
                FrameEnd::Retry { next_frame, .. } => {
                    retries += 1;
                    assert_eq!(next_frame, frames.frame_counter() + 1);
                    assert!(frames.is_capturing());
                }
                FrameEnd::Abort { .. } => break,
                FrameEnd::Flush { .. } => panic!("failed frame flushed"),
            }
        }
        assert_eq!(retries, MAX_RETRIES);
        assert_eq!(frames.state(), CaptureState::Idle);
        assert_eq!(frames.captures().len(), 1);
    }

    #[test]
    fn app_controlled_failure_aborts_immediately() {
        let mut frames = capturer();
        frames.advance_frame();
        frames.begin(true).unwrap();
        assert_eq!(
            frames.end(Some(CaptureFailReason::UncappedCommandList)).unwrap(),
            FrameEnd::Abort {
                frame_number: 2,
                reason: CaptureFailReason::UncappedCommandList
            }
        );
        assert_eq!(
            frames.overlay_text().unwrap(),
            "Failed capture at frame 2:\n    Uncapped command list"
        );
    }

    #[test]
    fn success_resets_failure_count() {
        let mut frames = capturer();
        frames.begin(false).unwrap();
        for _ in 0..MAX_RETRIES {
            frames.end(Some(CaptureFailReason::UncappedUnmap)).unwrap();
        }
        assert!(matches!(frames.end(None).unwrap(), FrameEnd::Flush { .. }));

        frames.begin(false).unwrap();
        assert!(matches!(
            frames.end(Some(CaptureFailReason::UncappedUnmap)).unwrap(),
            FrameEnd::Retry { .. }
        ));
    }

    #[test]
    fn trigger_starts_at_next_present() {
        let mut frames = capturer();
        frames.advance_frame();
        frames.trigger_capture();
        assert!(!frames.take_trigger());
        frames.advance_frame();
        assert!(frames.take_trigger());
        assert_eq!(frames.begin(false).unwrap(), 3);
    }

    #[test]
    fn end_without_begin() {
        let mut frames = capturer();
        assert!(matches!(frames.end(None), Err(CaptureError::NotCapturing)));
    }

    #[test]
    fn first_frame_option_queues_frame_zero() {
        let options = CaptureOptions {
            capture_first_frame: true,
            ..CaptureOptions::default()
        };
        let mut frames = FrameCapturer::new(&options);
        assert!(frames.take_trigger());
        assert!(!frames.take_trigger());
    }
}
