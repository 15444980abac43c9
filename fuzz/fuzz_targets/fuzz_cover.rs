#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let config = m4a_parse::DecodeConfig::default().with_peak_memory_limit(16_000_000);
    let _ = m4a_parse::read_itunes_cover_with_config(&mut Cursor::new(data), &config);
});
