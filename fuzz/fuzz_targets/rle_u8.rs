#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = vec![];
    gpu_capture::rle::write_u8(&mut buf, data).expect("encoding failed");
    let mut encoded = &buf[..];
    match gpu_capture::rle::read_u8(&mut encoded, data.len()) {
        Ok(vec) => assert_eq!(vec, data),
        Err(e) => panic!("Error: {}", e),
    }
});
