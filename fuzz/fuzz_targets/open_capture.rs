#![no_main]
use libfuzzer_sys::fuzz_target;

use gpu_capture::{CaptureFile, ChunkType};

// Header parsing, chunk framing and the version gate must reject any input
// cleanly.
fuzz_target!(|data: &[u8]| {
    let mut file = match CaptureFile::from_bytes(data.to_vec()) {
        Ok(file) => file,
        Err(_) => return,
    };
    while !file.chunks.at_end() {
        let header = match file.chunks.push_context() {
            Ok(header) => header,
            Err(_) => return,
        };
        if header.chunk_type() == Some(ChunkType::InitParams) {
            if let Ok(version) = file.chunks.payload().field::<u32>("version") {
                let _ = gpu_capture::version::check_version(version);
            }
        }
        file.chunks.skip_current_chunk();
    }
});
