#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len() & !3];

    let mut buf = vec![];
    gpu_capture::rle::write_u32(&mut buf, data).expect("encoding failed");

    let mut encoded = &buf[..];
    match gpu_capture::rle::read_u32(&mut encoded, data.len()) {
        Ok(vec) => assert_eq!(vec, data),
        Err(e) => panic!("Error: {}", e),
    }

    // Arbitrary input must be rejected cleanly, never expanded past the limit.
    let mut garbage = data;
    if let Ok(vec) = gpu_capture::rle::read_u32(&mut garbage, 4096) {
        assert!(vec.len() <= 4096);
    }
});
