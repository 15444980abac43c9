// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use m4a_parse::{
    AacDecoder, AudioParams, DecodeConfig, DecodedFrame, DecoderError, Error, MediaContext, PlaybackHost, StopReason,
    Tuple, Unstoppable,
};

const ASC_LC_44100_STEREO: [u8; 2] = [0x12, 0x10];
const TITLE: &[u8; 4] = b"\xa9nam";
const ARTIST: &[u8; 4] = b"\xa9ART";
const ALBUM: &[u8; 4] = b"\xa9alb";
const GENRE: &[u8; 4] = b"\xa9gen";
const DATE: &[u8; 4] = b"\xa9day";

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::max())
        .try_init();
}

// ============================================================================
// Synthetic file builders
// ============================================================================

fn atom(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = u32::try_from(payload.len() + 8).unwrap().to_be_bytes().to_vec();
    v.extend_from_slice(name);
    v.extend_from_slice(payload);
    v
}

fn full_atom(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version];
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    atom(name, &body)
}

fn ftyp() -> Vec<u8> {
    atom(b"ftyp", b"M4A \0\0\0\0isomM4A ")
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn esds(object_type: u8, asc: &[u8], avg_bitrate: u32) -> Vec<u8> {
    let mut config = vec![object_type, 0x15, 0, 0, 0];
    config.extend_from_slice(&avg_bitrate.to_be_bytes()); // max
    config.extend_from_slice(&avg_bitrate.to_be_bytes());
    config.extend_from_slice(&[0x05, asc.len() as u8]);
    config.extend_from_slice(asc);

    let mut es = vec![0x00, 0x01, 0x00, 0x04, config.len() as u8];
    es.extend_from_slice(&config);
    es.extend_from_slice(&[0x06, 0x01, 0x02]);

    let mut descriptor = vec![0x03, es.len() as u8];
    descriptor.extend_from_slice(&es);
    full_atom(b"esds", 0, 0, &descriptor)
}

fn mp4a(channels: u16, rate: u32, esds: &[u8]) -> Vec<u8> {
    let mut entry = vec![0; 6];
    entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    entry.extend_from_slice(&[0; 8]); // version, revision, vendor
    entry.extend_from_slice(&channels.to_be_bytes());
    entry.extend_from_slice(&16u16.to_be_bytes());
    entry.extend_from_slice(&[0; 4]);
    entry.extend_from_slice(&(rate << 16).to_be_bytes());
    entry.extend_from_slice(esds);
    atom(b"mp4a", &entry)
}

struct TrackLayout<'a> {
    id: u32,
    handler: &'a [u8; 4],
    sample_entry: Vec<u8>,
    sizes: Vec<u32>,
    samples_per_chunk: u32,
    chunk_offsets: Vec<u32>,
    timescale: u32,
    duration: u32,
}

fn trak(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut tkhd = be32(&[0, 0, track.id, 0, 0]);
    tkhd.resize(80, 0);
    let tkhd = full_atom(b"tkhd", 0, 7, &tkhd);

    let mut mdhd = be32(&[0, 0, track.timescale, track.duration]);
    mdhd.extend_from_slice(&[0x55, 0xc4, 0, 0]);
    let mdhd = full_atom(b"mdhd", 0, 0, &mdhd);

    let mut hdlr = vec![0; 4];
    hdlr.extend_from_slice(track.handler);
    hdlr.extend_from_slice(&[0; 13]);
    let hdlr = full_atom(b"hdlr", 0, 0, &hdlr);

    let stsd = full_atom(b"stsd", 0, 0, &[be32(&[1]), track.sample_entry.clone()].concat());
    let stsc = full_atom(b"stsc", 0, 0, &be32(&[1, 1, track.samples_per_chunk, 1]));
    let mut stsz = be32(&[0, track.sizes.len() as u32]);
    stsz.extend_from_slice(&be32(&track.sizes));
    let stsz = full_atom(b"stsz", 0, 0, &stsz);
    let mut stco = be32(&[track.chunk_offsets.len() as u32]);
    stco.extend_from_slice(&be32(&track.chunk_offsets));
    let stco = full_atom(b"stco", 0, 0, &stco);

    let stbl = atom(b"stbl", &[stsd, stsc, stsz, stco].concat());
    let minf = atom(b"minf", &stbl);
    let mdia = atom(b"mdia", &[mdhd, hdlr, minf].concat());
    atom(b"trak", &[tkhd, mdia].concat())
}

fn ilst_item(name: &[u8; 4], type_code: u8, value: &[u8]) -> Vec<u8> {
    let data = atom(b"data", &[&[0, 0, 0, type_code, 0, 0, 0, 0][..], value].concat());
    atom(name, &data)
}

/// `hdlr` and `ilst` children of an iTunes `meta` box.
fn meta_children(items: &[Vec<u8>]) -> Vec<u8> {
    let mut hdlr = vec![0; 4];
    hdlr.extend_from_slice(b"mdirappl");
    hdlr.extend_from_slice(&[0; 9]);
    let hdlr = full_atom(b"hdlr", 0, 0, &hdlr);
    let ilst = atom(b"ilst", &items.concat());
    [hdlr, ilst].concat()
}

fn udta(items: &[Vec<u8>]) -> Vec<u8> {
    atom(b"udta", &full_atom(b"meta", 0, 0, &meta_children(items)))
}

/// Encoded sample understood by `MockDecoder`: `[id, kind, ..]`.
const NORMAL: u8 = 0;
const EMPTY: u8 = 1;
const LONG: u8 = 2;
const CORRUPT: u8 = 0xee;

fn sample(id: u8, kind: u8) -> Vec<u8> {
    vec![id, kind, 0xaa, 0xbb]
}

fn normal_samples(count: u8) -> Vec<Vec<u8>> {
    (0..count).map(|i| sample(i, NORMAL)).collect()
}

/// ftyp, optional leading boxes, moov (optional video track, audio track, udta), mdat.
struct Fixture {
    samples: Vec<Vec<u8>>,
    samples_per_chunk: usize,
    object_type: u8,
    video_track: bool,
    leading: Vec<u8>,
    tags: Vec<Vec<u8>>,
    /// Replaces the udta built from `tags`.
    udta: Option<Vec<u8>>,
    /// Place mdat ahead of moov.
    mdat_first: bool,
}

impl Fixture {
    fn new(samples: Vec<Vec<u8>>) -> Self {
        Self {
            samples,
            samples_per_chunk: 2,
            object_type: 0x40,
            video_track: false,
            leading: Vec::new(),
            tags: Vec::new(),
            udta: None,
            mdat_first: false,
        }
    }

    fn build(&self) -> Vec<u8> {
        let prefix = ftyp().len() + self.leading.len();
        let mdat = atom(b"mdat", &self.samples.concat());
        if self.mdat_first {
            let moov = self.moov(u32::try_from(prefix + 8).unwrap());
            return [ftyp(), self.leading.clone(), mdat, moov].concat();
        }
        let moov_len = self.moov(0).len();
        let data_offset = u32::try_from(prefix + moov_len + 8).unwrap();
        [ftyp(), self.leading.clone(), self.moov(data_offset), mdat].concat()
    }

    fn moov(&self, data_offset: u32) -> Vec<u8> {
        let mut chunk_offsets = Vec::new();
        let mut pos = data_offset;
        for chunk in self.samples.chunks(self.samples_per_chunk) {
            chunk_offsets.push(pos);
            pos += chunk.iter().map(|s| s.len() as u32).sum::<u32>();
        }

        let mut children = Vec::new();
        if self.video_track {
            children.push(trak(&TrackLayout {
                id: 1,
                handler: b"vide",
                sample_entry: atom(b"avc1", &[0; 16]),
                sizes: vec![4],
                samples_per_chunk: 1,
                chunk_offsets: vec![data_offset],
                timescale: 600,
                duration: 6000,
            }));
        }
        children.push(trak(&TrackLayout {
            id: 2,
            handler: b"soun",
            sample_entry: mp4a(2, 44100, &esds(self.object_type, &ASC_LC_44100_STEREO, 128_000)),
            sizes: self.samples.iter().map(|s| s.len() as u32).collect(),
            samples_per_chunk: self.samples_per_chunk as u32,
            chunk_offsets,
            timescale: 44100,
            duration: 441_000,
        }));
        if let Some(raw) = &self.udta {
            children.push(raw.clone());
        } else if !self.tags.is_empty() {
            children.push(udta(&self.tags));
        }
        atom(b"moov", &children.concat())
    }
}

// ============================================================================
// Playback doubles
// ============================================================================

struct MockDecoder {
    params: AudioParams,
    frame_len: usize,
    reject_config: bool,
    buffer: Vec<f32>,
    drops: Rc<Cell<u32>>,
}

impl MockDecoder {
    fn new(drops: &Rc<Cell<u32>>) -> Self {
        Self {
            params: AudioParams { sample_rate: 44100, channels: 2 },
            frame_len: 1024,
            reject_config: false,
            buffer: Vec::new(),
            drops: Rc::clone(drops),
        }
    }
}

impl AacDecoder for MockDecoder {
    fn init(&mut self, config: &[u8]) -> Result<AudioParams, DecoderError> {
        assert_eq!(config, &ASC_LC_44100_STEREO);
        if self.reject_config {
            return Err(DecoderError::new("unsupported profile"));
        }
        Ok(self.params)
    }

    fn decode(&mut self, sample: &[u8]) -> Result<DecodedFrame<'_>, DecoderError> {
        let channels = usize::from(self.params.channels);
        let value = f32::from(sample[0]);
        self.buffer = match sample[1] {
            EMPTY => Vec::new(),
            LONG => vec![value; 2 * self.frame_len * channels],
            CORRUPT => return Err(DecoderError::new("corrupt frame")),
            _ => vec![value; self.frame_len * channels],
        };
        Ok(DecodedFrame { samples: &self.buffer, channels: self.params.channels })
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Default)]
struct MockHost {
    refuse_output: bool,
    opened: Option<AudioParams>,
    tuple: Option<Tuple>,
    bitrate: Option<u32>,
    seeks: VecDeque<Option<u32>>,
    seek_polls: usize,
    /// First value of every written buffer, which is the id of the sample it came from.
    written: Vec<f32>,
}

impl PlaybackHost for MockHost {
    fn open_audio(&mut self, params: AudioParams) -> bool {
        self.opened = Some(params);
        !self.refuse_output
    }

    fn set_tuple(&mut self, tuple: Tuple) {
        self.tuple = Some(tuple);
    }

    fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = Some(bitrate);
    }

    fn check_seek(&mut self) -> Option<u32> {
        self.seek_polls += 1;
        self.seeks.pop_front().flatten()
    }

    fn write_audio(&mut self, samples: &[f32]) {
        self.written.push(samples.first().copied().unwrap_or(-1.0));
    }
}

/// Lets `n` checks pass, then reports cancellation.
struct StopAfter(AtomicUsize);

impl m4a_parse::Stop for StopAfter {
    fn check(&self) -> std::result::Result<(), StopReason> {
        let left = self.0.load(Ordering::Relaxed);
        if left == 0 {
            return Err(StopReason::Cancelled);
        }
        self.0.store(left - 1, Ordering::Relaxed);
        Ok(())
    }
}

/// Counts the bytes actually read from the inner source.
struct CountingReader {
    inner: Cursor<Vec<u8>>,
    read: usize,
}

impl CountingReader {
    fn new(file: Vec<u8>) -> Self {
        Self { inner: Cursor::new(file), read: 0 }
    }
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n;
        Ok(n)
    }
}

impl Seek for CountingReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn play(file: &[u8], decoder: MockDecoder, host: &mut MockHost) -> m4a_parse::Result<()> {
    m4a_parse::play(&mut Cursor::new(file), decoder, host, &Unstoppable)
}

// ============================================================================
// Cover art
// ============================================================================

#[test]
fn cover_minimal_path() {
    init_logging();
    let image: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let file = [ftyp(), atom(b"moov", &udta(&[ilst_item(b"covr", 13, &image)]))].concat();

    let cover = m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).expect("cover");
    assert_eq!(cover.len(), 1000);
    assert_eq!(&cover[..], &image[..]);
}

#[test]
fn cover_after_short_ftyp() {
    let ftyp = atom(b"ftyp", b"M4A \0\0\0\0");
    assert_eq!(ftyp.len(), 16);
    let image: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let file = [ftyp, atom(b"moov", &udta(&[ilst_item(b"covr", 13, &image)]))].concat();

    let cover = m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).expect("cover");
    assert_eq!(cover.len(), 1024);
    assert_eq!(&cover[..], &image[..]);
}

#[test]
fn cover_covr_size_smaller_than_header() {
    let mut file = [ftyp(), atom(b"moov", &udta(&[ilst_item(b"covr", 13, b"\xff\xd8\xff\xe0")]))].concat();
    let covr = file.windows(4).position(|w| w == b"covr").unwrap();
    file[covr - 4..covr].copy_from_slice(&4u32.to_be_bytes());

    match m4a_parse::read_itunes_cover(&mut Cursor::new(&file)) {
        Err(Error::InvalidData(msg)) => assert_eq!(msg, "malformed size"),
        Ok(cover) => panic!("Expected malformed size error, got {} bytes", cover.len()),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn cover_behind_tracks_and_free_space() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(4));
    fixture.leading = atom(b"free", &[0; 32]);
    fixture.tags = vec![ilst_item(TITLE, 1, b"Song"), ilst_item(b"covr", 14, b"\x89PNG\r\n\x1a\n")];
    let file = fixture.build();

    let cover = m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).expect("cover");
    assert_eq!(&cover[..], b"\x89PNG\r\n\x1a\n");

    // Same source, same answer.
    let again = m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).expect("cover");
    assert_eq!(&cover[..], &again[..]);
}

#[test]
fn cover_requires_ftyp_first() {
    let file = [atom(b"free", &[]), ftyp(), atom(b"moov", &udta(&[ilst_item(b"covr", 13, b"x")]))].concat();
    match m4a_parse::read_itunes_cover(&mut Cursor::new(&file)) {
        Err(Error::InvalidData(msg)) => assert_eq!(msg, "'ftyp' box must occur first"),
        Ok(_) => panic!("Expected missing ftyp error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn cover_missing_covr() {
    let file = [ftyp(), atom(b"moov", &udta(&[ilst_item(TITLE, 1, b"Song")]))].concat();
    assert!(m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).is_err());
}

#[test]
fn cover_without_moov() {
    let file = [ftyp(), atom(b"mdat", &[0; 16])].concat();
    assert!(m4a_parse::read_itunes_cover(&mut Cursor::new(&file)).is_err());
}

#[test]
fn cover_truncated_payload() {
    let mut file = [ftyp(), atom(b"moov", &udta(&[ilst_item(b"covr", 13, &[9; 100])]))].concat();
    file.truncate(file.len() - 10);
    match m4a_parse::read_itunes_cover(&mut Cursor::new(&file)) {
        Err(Error::UnexpectedEOF) => {},
        Ok(_) => panic!("Expected truncation error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

// ============================================================================
// Container reader
// ============================================================================

#[test]
fn container_selects_audio_after_video() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(5));
    fixture.video_track = true;
    let file = fixture.build();

    let context = m4a_parse::read_mp4(&mut Cursor::new(&file)).expect("read_mp4");
    assert_eq!(context.major_brand, b"M4A ");
    assert_eq!(context.tracks.len(), 2);
    assert!(!context.tracks[0].is_aac());
    assert_eq!(context.aac_track(), Some(1));

    let track = &context.tracks[1];
    assert_eq!(track.id, Some(2));
    assert_eq!(track.codec.unwrap(), b"mp4a");
    assert_eq!(track.sample_rate(), 44100);
    assert_eq!(track.channels(), 2);
    assert_eq!(track.sample_count(), 5);
    assert_eq!(track.avg_bitrate(), 128_000);
    assert_eq!(track.duration_ms(), Some(10_000));
    assert_eq!(track.decoder_config(), Some(&ASC_LC_44100_STEREO[..]));
}

#[test]
fn container_reads_samples_by_one_based_index() {
    let fixture = Fixture::new(normal_samples(5));
    let file = fixture.build();
    let mut src = Cursor::new(&file);
    let context = m4a_parse::read_mp4(&mut src).expect("read_mp4");
    let track = context.aac_track().unwrap();

    for i in 1..=5u32 {
        let data = context.read_sample(&mut src, track, i).expect("sample");
        assert_eq!(&data[..], &sample(i as u8 - 1, NORMAL)[..]);
    }
    assert!(matches!(context.read_sample(&mut src, track, 0), Err(Error::InvalidData(_))));
    assert!(matches!(context.read_sample(&mut src, track, 6), Err(Error::InvalidData(_))));
    assert!(matches!(context.read_sample(&mut src, 7, 1), Err(Error::InvalidData(_))));
}

#[test]
fn container_large_size_box() {
    let mut leading = vec![0, 0, 0, 1];
    leading.extend_from_slice(b"free");
    leading.extend_from_slice(&24u64.to_be_bytes());
    leading.extend_from_slice(&[0; 8]);
    let mut fixture = Fixture::new(normal_samples(3));
    fixture.leading = leading;
    let file = fixture.build();

    let mut src = Cursor::new(&file);
    let context = m4a_parse::read_mp4(&mut src).expect("read_mp4");
    let data = context.read_sample(&mut src, 0, 3).expect("sample");
    assert_eq!(&data[..], &sample(2, NORMAL)[..]);
}

#[test]
fn container_without_moov() {
    let file = [ftyp(), atom(b"free", &[0; 8])].concat();
    assert!(matches!(m4a_parse::read_mp4(&mut Cursor::new(&file)), Err(Error::NoMoov)));
}

#[test]
fn container_rejects_truncated_moov() {
    let mut file = Fixture::new(normal_samples(3)).build();
    let moov_end = ftyp().len() + 40;
    file.truncate(moov_end);
    assert!(m4a_parse::read_mp4(&mut Cursor::new(&file)).is_err());
}

#[test]
fn container_seeks_over_leading_boxes() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(3));
    fixture.leading = atom(b"free", &vec![0; 1 << 20]);
    fixture.mdat_first = true;
    let file = fixture.build();

    let mut src = CountingReader::new(file.clone());
    let context = MediaContext::read_seekable(&mut src, &DecodeConfig::default(), &Unstoppable).expect("read_seekable");
    assert!(src.read < 4096, "read {} bytes", src.read);
    let data = context.read_sample(&mut src, 0, 2).expect("sample");
    assert_eq!(&data[..], &sample(1, NORMAL)[..]);

    // Without Seek every skipped byte is read.
    let mut src = CountingReader::new(file.clone());
    MediaContext::read(&mut src, &DecodeConfig::default(), &Unstoppable).expect("read");
    assert!(src.read > 1 << 20);

    let mut src = CountingReader::new(file);
    assert!(m4a_parse::probe(&mut src));
    assert!(src.read < 4096, "read {} bytes", src.read);
}

#[test]
fn container_box_running_to_end_of_file() {
    let mut file = Fixture::new(normal_samples(2)).build();
    file.extend_from_slice(&0u32.to_be_bytes());
    file.extend_from_slice(b"skip");
    file.extend_from_slice(&[0xff; 40]);

    assert!(m4a_parse::read_mp4(&mut Cursor::new(&file)).is_ok());
    assert!(MediaContext::read_seekable(&mut Cursor::new(&file), &DecodeConfig::default(), &Unstoppable).is_ok());
}

#[test]
fn container_sample_count_limit() {
    let file = Fixture::new(normal_samples(4)).build();
    let config = DecodeConfig::default().with_max_samples(3);
    match MediaContext::read(&mut Cursor::new(&file), &config, &Unstoppable) {
        Err(Error::ResourceLimitExceeded(msg)) => assert_eq!(msg, "sample count limit exceeded"),
        Ok(_) => panic!("Expected sample count limit error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn container_track_count_limit() {
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.video_track = true;
    let file = fixture.build();
    let config = DecodeConfig::default().with_max_tracks(1);
    match MediaContext::read(&mut Cursor::new(&file), &config, &Unstoppable) {
        Err(Error::ResourceLimitExceeded(msg)) => assert_eq!(msg, "track count limit exceeded"),
        Ok(_) => panic!("Expected track count limit error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn container_cancellation() {
    let file = Fixture::new(normal_samples(2)).build();
    let stop = StopAfter(AtomicUsize::new(0));
    match MediaContext::read(&mut Cursor::new(&file), &DecodeConfig::default(), &stop) {
        Err(Error::Stopped(reason)) => assert_eq!(reason, StopReason::Cancelled),
        Ok(_) => panic!("Expected cancellation"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn unlimited_config_reads() {
    let file = Fixture::new(normal_samples(2)).build();
    let result = MediaContext::read(&mut Cursor::new(&file), &DecodeConfig::unlimited(), &Unstoppable);
    assert!(result.is_ok());
}

// ============================================================================
// Probe and metadata
// ============================================================================

#[test]
fn probe_accepts_aac() {
    let file = Fixture::new(normal_samples(2)).build();
    assert!(m4a_parse::probe(&mut Cursor::new(&file)));
}

#[test]
fn probe_rejects_other_audio_and_garbage() {
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.object_type = 0x6b; // MPEG-1 audio
    assert!(!m4a_parse::probe(&mut Cursor::new(&fixture.build())));
    assert!(!m4a_parse::probe(&mut Cursor::new(b"ID3\x04\0\0\0\0\0\0not an mp4 file")));
    assert!(!m4a_parse::probe(&mut Cursor::new(b"")));
}

#[test]
fn metadata_tuple() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.tags = vec![
        ilst_item(TITLE, 1, b"Song"),
        ilst_item(ARTIST, 1, b"Band"),
        ilst_item(ALBUM, 1, b"Record"),
        ilst_item(DATE, 1, b"2010-05-01"),
        ilst_item(b"trkn", 0, &[0, 0, 0, 7, 0, 12, 0, 0]),
        ilst_item(b"gnre", 0, &[0, 18]),
    ];
    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&fixture.build())).expect("metadata");

    assert_eq!(tuple.title.as_deref(), Some("Song"));
    assert_eq!(tuple.artist.as_deref(), Some("Band"));
    assert_eq!(tuple.album.as_deref(), Some("Record"));
    assert_eq!(tuple.comment, None);
    assert_eq!(tuple.genre.as_deref(), Some("Rock"));
    assert_eq!(tuple.year, Some(2010));
    assert_eq!(tuple.track_number, Some(7));
    assert_eq!(tuple.codec.as_deref(), Some("MPEG-2/4 AAC"));
    assert_eq!(tuple.bitrate, Some(128));
    assert_eq!(tuple.quality.as_deref(), Some("44 kHz, stereo"));
    assert_eq!(tuple.length_ms, Some(10_000));
}

#[test]
fn metadata_text_genre_wins() {
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.tags = vec![ilst_item(b"gnre", 0, &[0, 18]), ilst_item(GENRE, 1, b"Shoegaze")];
    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&fixture.build())).expect("metadata");
    assert_eq!(tuple.genre.as_deref(), Some("Shoegaze"));
}

#[test]
fn metadata_without_tags() {
    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&Fixture::new(normal_samples(2)).build())).expect("metadata");
    assert_eq!(tuple.title, None);
    assert_eq!(tuple.year, None);
    assert_eq!(tuple.track_number, None);
    assert!(tuple.quality.is_some());
}

#[test]
fn metadata_short_data_box_keeps_track_playable() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(3));
    fixture.tags = vec![atom(TITLE, &atom(b"data", &[0, 0, 0, 1]))];
    let file = fixture.build();

    assert!(m4a_parse::probe(&mut Cursor::new(&file)));

    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&file)).expect("metadata");
    assert_eq!(tuple.title, None);
    assert_eq!(tuple.quality.as_deref(), Some("44 kHz, stereo"));

    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    play(&file, MockDecoder::new(&drops), &mut host).expect("play");
    assert_eq!(host.written, [0.0, 1.0, 2.0]);
    assert_eq!(host.tuple.unwrap().title, None);
}

#[test]
fn metadata_meta_with_flags() {
    let mut fixture = Fixture::new(normal_samples(2));
    let meta = full_atom(b"meta", 0, 1, &meta_children(&[ilst_item(TITLE, 1, b"Song")]));
    fixture.udta = Some(atom(b"udta", &meta));
    let file = fixture.build();

    assert!(m4a_parse::probe(&mut Cursor::new(&file)));
    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&file)).expect("metadata");
    assert_eq!(tuple.title, None);

    let config = DecodeConfig::default().lenient(true);
    let tuple = m4a_parse::read_metadata_with_config(&mut Cursor::new(&file), &config, &Unstoppable).expect("metadata");
    assert_eq!(tuple.title.as_deref(), Some("Song"));
}

#[test]
fn metadata_quicktime_meta_without_version() {
    init_logging();
    let mut fixture = Fixture::new(normal_samples(2));
    let meta = atom(b"meta", &meta_children(&[ilst_item(TITLE, 1, b"Song"), ilst_item(ARTIST, 1, b"Band")]));
    fixture.udta = Some(atom(b"udta", &meta));
    let file = fixture.build();

    assert!(m4a_parse::probe(&mut Cursor::new(&file)));
    let tuple = m4a_parse::read_metadata(&mut Cursor::new(&file)).expect("metadata");
    assert_eq!(tuple.title.as_deref(), Some("Song"));
    assert_eq!(tuple.artist.as_deref(), Some("Band"));
}

#[test]
fn metadata_needs_aac_track() {
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.object_type = 0x6b;
    assert!(matches!(
        m4a_parse::read_metadata(&mut Cursor::new(&fixture.build())),
        Err(Error::NoPlayableTrack)
    ));
}

// ============================================================================
// Playback
// ============================================================================

#[test]
fn play_all_samples() {
    init_logging();
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut fixture = Fixture::new(normal_samples(6));
    fixture.video_track = true;

    play(&fixture.build(), MockDecoder::new(&drops), &mut host).expect("play");

    assert_eq!(host.written, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(host.opened, Some(AudioParams { sample_rate: 44100, channels: 2 }));
    assert_eq!(host.bitrate, Some(128_000));
    assert_eq!(host.tuple.unwrap().codec.as_deref(), Some("MPEG-2/4 AAC"));
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_with_mdat_before_moov() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut fixture = Fixture::new(normal_samples(5));
    fixture.mdat_first = true;

    play(&fixture.build(), MockDecoder::new(&drops), &mut host).expect("play");

    assert_eq!(host.written, [0.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_empty_track() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    play(&Fixture::new(Vec::new()).build(), MockDecoder::new(&drops), &mut host).expect("play");
    assert!(host.written.is_empty());
    assert!(host.opened.is_some());
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_skips_priming_frames() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let samples = vec![sample(0, EMPTY), sample(1, EMPTY), sample(2, NORMAL), sample(3, NORMAL)];

    play(&Fixture::new(samples).build(), MockDecoder::new(&drops), &mut host).expect("play");

    assert_eq!(host.written, [2.0, 3.0]);
    // Seeks are not polled until the frame size is known.
    assert_eq!(host.seek_polls, 2);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_seek_moves_position() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    // 117 ms * 44100 / 1000 / 1024 = 5
    host.seeks = VecDeque::from([None, Some(117)]);

    play(&Fixture::new(normal_samples(10)).build(), MockDecoder::new(&drops), &mut host).expect("play");

    assert_eq!(host.written, [0.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_seek_uses_first_frame_size() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut decoder = MockDecoder::new(&drops);
    decoder.params = AudioParams { sample_rate: 48000, channels: 2 };
    decoder.frame_len = 1000;
    let mut samples = normal_samples(8);
    samples[1] = sample(1, LONG);
    // 105 ms * 48000 / 1000 / 1000 = 5; a frame size of 2000 would give 2
    host.seeks = VecDeque::from([None, Some(105)]);

    play(&Fixture::new(samples).build(), decoder, &mut host).expect("play");

    assert_eq!(host.written, [0.0, 5.0, 6.0, 7.0]);
}

#[test]
fn play_seek_past_end() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    host.seeks = VecDeque::from([None, Some(3_600_000)]);

    play(&Fixture::new(normal_samples(4)).build(), MockDecoder::new(&drops), &mut host).expect("play");

    assert_eq!(host.written, [0.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_stops_on_request() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    // Two checks while reading the container (moov, mdat), then three loop iterations.
    let stop = StopAfter(AtomicUsize::new(5));
    let file = Fixture::new(normal_samples(6)).build();

    m4a_parse::play(&mut Cursor::new(&file), MockDecoder::new(&drops), &mut host, &stop).expect("play");

    assert_eq!(host.written, [0.0, 1.0, 2.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_decode_error_is_fatal() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut samples = normal_samples(5);
    samples[2] = sample(2, CORRUPT);

    match play(&Fixture::new(samples).build(), MockDecoder::new(&drops), &mut host) {
        Err(Error::Decode(err)) => assert_eq!(err.message(), "corrupt frame"),
        Ok(_) => panic!("Expected decode error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
    assert_eq!(host.written, [0.0, 1.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_empty_sample_is_fatal() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let samples = vec![sample(0, NORMAL), Vec::new(), sample(2, NORMAL)];

    match play(&Fixture::new(samples).build(), MockDecoder::new(&drops), &mut host) {
        Err(Error::InvalidData(msg)) => assert_eq!(msg, "empty sample"),
        Ok(_) => panic!("Expected empty sample error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
    assert_eq!(host.written, [0.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_oversized_sample_is_fatal() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut big = sample(1, NORMAL);
    big.resize(m4a_parse::DEFAULT_MAX_SAMPLE_SIZE as usize + 1, 0);
    let samples = vec![sample(0, NORMAL), big];

    match play(&Fixture::new(samples).build(), MockDecoder::new(&drops), &mut host) {
        Err(Error::ResourceLimitExceeded(msg)) => assert_eq!(msg, "sample larger than pull size limit"),
        Ok(_) => panic!("Expected sample size error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
    assert_eq!(host.written, [0.0]);
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_rejected_config() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut decoder = MockDecoder::new(&drops);
    decoder.reject_config = true;

    match play(&Fixture::new(normal_samples(2)).build(), decoder, &mut host) {
        Err(Error::DecoderConfig(err)) => assert_eq!(err.message(), "unsupported profile"),
        Ok(_) => panic!("Expected decoder config error"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
    assert!(host.opened.is_none());
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_zero_channels() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut decoder = MockDecoder::new(&drops);
    decoder.params.channels = 0;

    assert!(matches!(
        play(&Fixture::new(normal_samples(2)).build(), decoder, &mut host),
        Err(Error::DecoderConfig(_))
    ));
    assert!(host.opened.is_none());
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_output_rejected() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost { refuse_output: true, ..MockHost::default() };

    assert!(matches!(
        play(&Fixture::new(normal_samples(2)).build(), MockDecoder::new(&drops), &mut host),
        Err(Error::OutputRejected)
    ));
    assert!(host.written.is_empty());
    assert!(host.tuple.is_none());
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_without_aac_track() {
    let drops = Rc::new(Cell::new(0));
    let mut host = MockHost::default();
    let mut fixture = Fixture::new(normal_samples(2));
    fixture.object_type = 0x6b;

    assert!(matches!(
        play(&fixture.build(), MockDecoder::new(&drops), &mut host),
        Err(Error::NoPlayableTrack)
    ));
    assert!(host.opened.is_none());
    assert_eq!(drops.get(), 1);
}

#[test]
fn play_from_shared_log() {
    // Host state shared with another owner, as a player UI would hold it.
    struct SharedHost(Rc<RefCell<Vec<f32>>>);
    impl PlaybackHost for SharedHost {
        fn open_audio(&mut self, _params: AudioParams) -> bool {
            true
        }
        fn check_seek(&mut self) -> Option<u32> {
            None
        }
        fn write_audio(&mut self, samples: &[f32]) {
            self.0.borrow_mut().push(samples[0]);
        }
    }

    let drops = Rc::new(Cell::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut host = SharedHost(Rc::clone(&log));
    let file = Fixture::new(normal_samples(3)).build();
    m4a_parse::play(&mut Cursor::new(&file), MockDecoder::new(&drops), &mut host, &Unstoppable).expect("play");
    assert_eq!(*log.borrow(), [0.0, 1.0, 2.0]);
    assert_eq!(drops.get(), 1);
}
