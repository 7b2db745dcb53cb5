//! Capture format versions.
//!
//! The init-params chunk at the start of every capture carries the format
//! version its writer used. We can read the current version, and a short
//! list of older ones whose differences we know; anything else is refused
//! before we try to parse a single resource chunk.

use crate::error::ReplayError;

pub const CURRENT_VERSION: u32 = 0x0B;

/// Older versions we can still replay, and what changed since each.
pub const SUPPORTED_OLD_VERSIONS: &[(u32, &str)] = &[
    (0x0A, "Unmap chunks carry the whole subresource, not just the changed range"),
    (0x09, "as 0x0A, and the begin-frame chunk has no stream-out counters"),
];

/// Accept `version` if we know how to read it.
pub fn check_version(version: u32) -> Result<(), ReplayError> {
    if version == CURRENT_VERSION {
        return Ok(());
    }
    match SUPPORTED_OLD_VERSIONS.iter().find(|&&(v, _)| v == version) {
        Some((_, delta)) => {
            tracing::info!("reading old capture format version {:#04x}: {}", version, delta);
            Ok(())
        }
        None => Err(ReplayError::IncompatibleVersion {
            found: version,
            current: CURRENT_VERSION,
        }),
    }
}

/// Version 0x0A added hidden stream-out counters to the begin-frame chunk.
pub fn has_stream_out_counters(version: u32) -> bool {
    version >= 0x0A
}

/// Version 0x0B started recording only the changed range of an unmapped
/// subresource.
pub fn has_unmap_ranges(version: u32) -> bool {
    version >= 0x0B
}

#[test]
fn test_version_gate() {
    assert!(check_version(CURRENT_VERSION).is_ok());
    assert!(check_version(0x0A).is_ok());
    assert!(check_version(0x09).is_ok());
    for &bad in &[0, 0x08, 0x0C, 0xFFFF_FFFF] {
        match check_version(bad) {
            Err(ReplayError::IncompatibleVersion { found, current }) => {
                assert_eq!(found, bad);
                assert_eq!(current, CURRENT_VERSION);
            }
            other => panic!("version {:#x} gave {:?}", bad, other),
        }
    }
}

#[test]
fn test_version_deltas() {
    assert!(!has_stream_out_counters(0x09));
    assert!(has_stream_out_counters(0x0A));
    assert!(!has_unmap_ranges(0x0A));
    assert!(has_unmap_ranges(CURRENT_VERSION));
}
