//! Capture options.
//!
//! Options are read from a TOML file. Every field has a default, so a file
//! only needs to mention what it changes:
//!
//! ```toml
//! save_all_initials = true
//! capture_frames = [5, 100]
//! capture_dir = "/tmp/captures"
//!
//! [big_target]
//! min_width = 128
//! ```

use crate::error::CaptureError;
use crate::resource::{BindFlags, TextureDesc};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Don't pass the driver's validation messages on to the log.
    pub debug_output_mute: bool,

    /// Let the application go fullscreen. If false, swap chains are always
    /// created windowed.
    pub allow_fullscreen: bool,

    /// Honor the application's sync interval. If false, presents don't wait
    /// for vertical blank.
    pub allow_vsync: bool,

    /// Always copy initial contents, never substituting a clear marker.
    pub save_all_initials: bool,

    /// Create contexts with the driver's validation layer enabled.
    pub debug_device_mode: bool,

    /// Include every live resource in every capture, not just those the
    /// frame uses.
    pub ref_all_resources: bool,

    /// Record deferred contexts all the time, so that command lists built
    /// before a capture starts can still be executed in it.
    pub capture_all_cmd_lists: bool,

    /// Capture the frame before the first present.
    pub capture_first_frame: bool,

    /// Frame numbers at which to start a capture.
    pub capture_frames: Vec<u32>,

    pub capture_dir: PathBuf,
    pub capture_name: String,

    pub big_target: BigTargetHeuristic,
}

impl Default for CaptureOptions {
    fn default() -> CaptureOptions {
        CaptureOptions {
            debug_output_mute: true,
            allow_fullscreen: true,
            allow_vsync: true,
            save_all_initials: false,
            debug_device_mode: false,
            ref_all_resources: false,
            capture_all_cmd_lists: false,
            capture_first_frame: false,
            capture_frames: Vec::new(),
            capture_dir: std::env::temp_dir().join("gpu-capture"),
            capture_name: "capture".to_string(),
            big_target: BigTargetHeuristic::default(),
        }
    }
}

impl CaptureOptions {
    pub fn from_toml(text: &str) -> Result<CaptureOptions, CaptureError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<CaptureOptions, CaptureError> {
        let text = std::fs::read_to_string(path)?;
        CaptureOptions::from_toml(&text)
    }

    /// Where the capture of frame `frame_number` goes.
    pub fn capture_path(&self, frame_number: u32) -> PathBuf {
        self.capture_dir
            .join(format!("{}_frame{}.cap", self.capture_name, frame_number))
    }
}

/// Which render targets are big enough that capture replaces their initial
/// contents with a clear marker, when the frame writes them before reading
/// them.
///
/// This trades capture size and speed against nothing but the contents of
/// targets the frame overwrites anyway. The thresholds are tuning, not
/// correctness: `save_all_initials` turns the whole thing off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BigTargetHeuristic {
    pub min_width: u32,
    pub min_height: u32,
    pub require_non_square: bool,
}

impl Default for BigTargetHeuristic {
    fn default() -> BigTargetHeuristic {
        BigTargetHeuristic {
            min_width: 64,
            min_height: 64,
            require_non_square: true,
        }
    }
}

impl BigTargetHeuristic {
    pub fn matches(&self, desc: &TextureDesc) -> bool {
        let target = BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL | BindFlags::UNORDERED_ACCESS;
        desc.bind.intersects(target)
            && desc.width > self.min_width
            && desc.height > self.min_height
            && (!self.require_non_square || desc.width != desc.height)
    }
}

#[test]
fn test_partial_toml() {
    let options = CaptureOptions::from_toml(
        r#"
        save_all_initials = true
        capture_frames = [5]

        [big_target]
        min_width = 128
        "#,
    )
    .unwrap();
    assert!(options.save_all_initials);
    assert_eq!(options.capture_frames, vec![5]);
    assert_eq!(options.big_target.min_width, 128);
    assert_eq!(options.big_target.min_height, 64);
    assert!(options.allow_vsync);
}

#[test]
fn test_bad_toml() {
    match CaptureOptions::from_toml("save_all_initials = 3") {
        Err(CaptureError::Options(_)) => (),
        other => panic!("expected an options error, got {:?}", other),
    }
}

#[test]
fn test_capture_path() {
    let options = CaptureOptions {
        capture_dir: PathBuf::from("/captures"),
        capture_name: "game".to_string(),
        ..CaptureOptions::default()
    };
    assert_eq!(options.capture_path(6), PathBuf::from("/captures/game_frame6.cap"));
}
