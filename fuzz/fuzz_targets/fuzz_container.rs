#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let config = m4a_parse::DecodeConfig::default()
        .with_peak_memory_limit(16_000_000)
        .with_max_samples(100_000)
        .with_max_tracks(8);
    let mut src = Cursor::new(data);
    let Ok(context) = m4a_parse::MediaContext::read(&mut src, &config, &enough::Unstoppable) else {
        return;
    };
    if let Some(track) = context.aac_track() {
        let count = context.tracks[track].sample_count().min(64);
        for index in 1..=count {
            let _ = context.read_sample(&mut src, track, index);
        }
    }
});
