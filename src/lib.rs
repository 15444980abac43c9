#![deny(unsafe_code)]
//! Module for parsing MPEG-4 audio aka audio/mp4 (`.m4a`) streams.
//!
//! Three entry points share one box reader:
//!
//! * [`read_itunes_cover`] walks straight down to the iTunes cover-art payload.
//! * [`MediaContext::read`] reads the header/track tree and the iTunes text tags.
//! * [`play`] drives an external [`AacDecoder`] over the samples of the AAC track.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use std::convert::{TryFrom, TryInto as _};

use std::io::{Read, Seek, SeekFrom, Take};

mod aac;
mod cover;
mod playback;
mod tuple;

mod boxes;
use crate::boxes::BoxType;
pub use crate::boxes::FourCC;

pub use crate::aac::{AudioSpecificConfig, EsDescriptor};
pub use crate::cover::{read_itunes_cover, read_itunes_cover_with_config};
pub use crate::playback::{
    play, play_with_config, probe, read_metadata, read_metadata_with_config, AacDecoder, AudioParams,
    DecodedFrame, DecoderError, PlaybackHost,
};
pub use crate::tuple::Tuple;

pub use enough::{Stop, StopReason, Unstoppable};

/// Largest encoded sample the decode loop will pull in one read.
///
/// 16 times the 768-byte minimum stream buffer an AAC decoder needs per channel.
pub const DEFAULT_MAX_SAMPLE_SIZE: u32 = 768 * 16;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser and playback failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser error states and those reported by the decoder.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// The container was read to the end without finding a moov box.
    NoMoov,
    /// The container is well-formed but carries no decodable AAC track.
    NoPlayableTrack,
    /// The decoder rejected the track's configuration.
    DecoderConfig(DecoderError),
    /// The decoder reported an error for one frame.
    Decode(DecoderError),
    /// The host refused to open audio output in the negotiated format.
    OutputRejected,
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return std::fmt::Display::fmt(err, f),
            Self::NoMoov => "Missing Moov box",
            Self::NoPlayableTrack => "No playable AAC track",
            Self::DecoderConfig(err) => return write!(f, "Decoder configuration rejected: {}", err),
            Self::Decode(err) => return write!(f, "Decode error: {}", err),
            Self::OutputRejected => "Audio output rejected",
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// Box type.
    name: BoxType,
    /// Size of the box in bytes.
    size: u64,
    /// Offset to the start of the contained data (or header size).
    offset: u64,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 16-byte size
    const MIN_LARGE_SIZE: u64 = 16;
}

#[derive(Debug, Clone, Copy, Default)]
struct ParseOptions {
    /// Ignore non-zero flags in full boxes that expect zero flags.
    lenient: bool,
}

/// Configuration for parsing containers with resource limits and validation options
///
/// Resource limits are checked **before** allocations occur, so a file that
/// claims absurd sample counts or payload sizes fails instead of exhausting memory.
///
/// # Examples
///
/// ```rust
/// use m4a_parse::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_peak_memory_limit(16_000_000)
///     .with_max_samples(100_000)
///     .with_max_tracks(4);
///
/// // No limits at all
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum peak heap memory for file-sized allocations (tables, cover art).
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Maximum size of one encoded sample pulled by the decode loop.
    /// Default: [`DEFAULT_MAX_SAMPLE_SIZE`]
    pub max_sample_size: Option<u32>,

    /// Maximum number of samples in one track.
    /// Default: 10,000,000 samples
    pub max_samples: Option<u32>,

    /// Maximum number of tracks in one movie.
    /// Default: 64 tracks
    pub max_tracks: Option<u32>,

    /// Enable lenient parsing mode.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            max_sample_size: Some(DEFAULT_MAX_SAMPLE_SIZE),
            max_samples: Some(10_000_000),
            max_tracks: Some(64),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            max_sample_size: None,
            max_samples: None,
            max_tracks: None,
            lenient: false,
        }
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Set the largest encoded sample the decode loop accepts
    pub fn with_max_sample_size(mut self, bytes: u32) -> Self {
        self.max_sample_size = Some(bytes);
        self
    }

    /// Set the maximum sample count per track
    pub fn with_max_samples(mut self, samples: u32) -> Self {
        self.max_samples = Some(samples);
        self
    }

    /// Set the maximum track count
    pub fn with_max_tracks(mut self, tracks: u32) -> Self {
        self.max_tracks = Some(tracks);
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }
}

struct ResourceTracker<'a> {
    config: &'a DecodeConfig,
    options: ParseOptions,
    current_memory: u64,
    peak_memory: u64,
}

impl<'a> ResourceTracker<'a> {
    fn new(config: &'a DecodeConfig) -> Self {
        Self {
            config,
            options: config.parse_options(),
            current_memory: 0,
            peak_memory: 0,
        }
    }

    fn reserve(&mut self, bytes: u64) -> Result<()> {
        self.current_memory = self.current_memory.saturating_add(bytes);
        self.peak_memory = self.peak_memory.max(self.current_memory);

        if let Some(limit) = self.config.peak_memory_limit {
            if self.peak_memory > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        Ok(())
    }

    fn validate_sample_count(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_samples {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("sample count limit exceeded"));
            }
        }

        Ok(())
    }

    fn validate_track_count(&self, count: usize) -> Result<()> {
        if let Some(limit) = self.config.max_tracks {
            if count > limit.to_usize() {
                return Err(Error::ResourceLimitExceeded("track count limit exceeded"));
            }
        }

        Ok(())
    }
}

/// iTunes-style text tags from `moov/udta/meta/ilst`.
///
/// Each field is read independently; an absent or unreadable item is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTags {
    pub title: Option<std::string::String>,
    pub artist: Option<std::string::String>,
    pub album: Option<std::string::String>,
    pub comment: Option<std::string::String>,
    pub genre: Option<std::string::String>,
    /// Release date as written, usually `YYYY` or `YYYY-MM-DD`.
    pub date: Option<std::string::String>,
    /// Track number rendered as decimal text.
    pub track: Option<std::string::String>,
}

/// Fields of an `mp4a` sample entry.
/// See ISO 14496-12:2015 § 12.2.3
#[derive(Debug)]
pub struct AudioSampleEntry {
    pub channels: u16,
    pub sample_size: u16,
    /// Integer part of the 16.16 fixed-point rate (or the QuickTime v2 float rate).
    pub sample_rate: u32,
    pub esds: Option<EsDescriptor>,
}

#[derive(Debug)]
struct SampleToChunkEntry {
    first_chunk: u32,
    samples_per_chunk: u32,
    _sample_description_index: u32,
}

#[derive(Debug)]
struct SampleTable {
    sample_to_chunk: TryVec<SampleToChunkEntry>,
    sample_sizes: TryVec<u32>,
    chunk_offsets: TryVec<u64>,
}

impl SampleTable {
    /// Byte range of the sample with the given 1-based index.
    fn sample_range(&self, index: u32) -> Result<(u64, u32)> {
        let target = index
            .checked_sub(1)
            .ok_or(Error::InvalidData("sample indices start at 1"))?;
        let size = *self
            .sample_sizes
            .get(target.to_usize())
            .ok_or(Error::InvalidData("sample index out of range"))?;

        let target = u64::from(target);
        let chunk_count = self.chunk_offsets.len().to_u64();
        let mut first_sample = 0u64;

        for (i, run) in self.sample_to_chunk.iter().enumerate() {
            let next_first_chunk = match self.sample_to_chunk.get(i + 1) {
                Some(next) => u64::from(next.first_chunk),
                None => chunk_count + 1,
            };
            let chunks = next_first_chunk
                .checked_sub(u64::from(run.first_chunk))
                .ok_or(Error::InvalidData("stsc entries out of order"))?;
            let per_chunk = u64::from(run.samples_per_chunk);
            let run_samples = chunks
                .checked_mul(per_chunk)
                .ok_or(Error::InvalidData("stsc run too large"))?;

            let run_end = first_sample
                .checked_add(run_samples)
                .ok_or(Error::InvalidData("stsc run too large"))?;

            if target < run_end {
                let chunk_in_run = (target - first_sample) / per_chunk;
                let chunk = u64::from(run.first_chunk) + chunk_in_run;
                let chunk_first_sample = first_sample + chunk_in_run * per_chunk;
                let chunk_offset = *chunk
                    .checked_sub(1)
                    .and_then(|c| usize::try_from(c).ok())
                    .and_then(|c| self.chunk_offsets.get(c))
                    .ok_or(Error::InvalidData("chunk index out of range"))?;

                let mut offset = chunk_offset;
                for s in chunk_first_sample..target {
                    let preceding = self
                        .sample_sizes
                        .get(usize::try_from(s)?)
                        .ok_or(Error::InvalidData("sample index out of range"))?;
                    offset = offset
                        .checked_add(u64::from(*preceding))
                        .ok_or(Error::InvalidData("sample offset overflow"))?;
                }
                return Ok((offset, size));
            }
            first_sample = run_end;
        }

        Err(Error::InvalidData("sample not covered by stsc"))
    }
}

/// One `trak` of the movie.
///
/// Populated once by [`MediaContext::read`] and never modified afterwards.
#[derive(Debug)]
pub struct Track {
    /// `tkhd` track id.
    pub id: Option<u32>,
    /// `hdlr` handler type, e.g. `soun` or `vide`.
    pub handler: Option<FourCC>,
    /// `mdhd` time scale (units per second).
    pub timescale: Option<u32>,
    /// `mdhd` duration in `timescale` units.
    pub duration: Option<u64>,
    /// Four-cc of the first sample entry in `stsd`.
    pub codec: Option<FourCC>,
    /// Present when the first sample entry is `mp4a`.
    pub audio: Option<AudioSampleEntry>,
    sample_table: Option<SampleTable>,
}

/// MPEG-4 object type indications that carry AAC.
/// 0x40 is MPEG-4 audio, 0x66..=0x68 are the MPEG-2 AAC Main/LC/SSR profiles.
const AAC_OBJECT_TYPE_INDICATIONS: [u8; 4] = [0x40, 0x66, 0x67, 0x68];

impl Track {
    pub fn is_audio(&self) -> bool {
        matches!(self.handler, Some(h) if h == b"soun")
    }

    /// Number of samples in the sample table (0 if the track has none).
    pub fn sample_count(&self) -> u32 {
        self.sample_table
            .as_ref()
            .map_or(0, |t| u32::try_from(t.sample_sizes.len()).unwrap_or(u32::MAX))
    }

    /// Sample rate from the sample entry, falling back to the decoder configuration.
    pub fn sample_rate(&self) -> u32 {
        let entry_rate = self.audio.as_ref().map_or(0, |a| a.sample_rate);
        if entry_rate > 0 {
            return entry_rate;
        }
        self.audio_specific_config().map_or(0, |asc| asc.sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.audio.as_ref().map_or(0, |a| a.channels)
    }

    /// Average bitrate in bits per second from the `esds` decoder config descriptor.
    pub fn avg_bitrate(&self) -> u32 {
        self.esds().map_or(0, |e| e.avg_bitrate)
    }

    /// Decoder-specific configuration blob, passed to the decoder unmodified.
    pub fn decoder_config(&self) -> Option<&[u8]> {
        self.esds()
            .map(|e| &e.decoder_specific_info[..])
            .filter(|c| !c.is_empty())
    }

    pub fn audio_specific_config(&self) -> Option<AudioSpecificConfig> {
        self.decoder_config().and_then(|c| AudioSpecificConfig::parse(c).ok())
    }

    /// Whether the track is AAC audio with a configuration an AAC decoder can accept.
    pub fn is_aac(&self) -> bool {
        if !self.is_audio() {
            return false;
        }
        let Some(esds) = self.esds() else {
            return false;
        };
        if !AAC_OBJECT_TYPE_INDICATIONS.contains(&esds.object_type_indication) {
            debug!("object type indication {:#x} is not AAC", esds.object_type_indication);
            return false;
        }
        self.audio_specific_config().is_some_and(|asc| asc.is_decodable())
    }

    /// Duration in milliseconds, when both duration and time scale are known.
    pub fn duration_ms(&self) -> Option<u64> {
        let duration = self.duration.filter(|&d| d > 0)?;
        let timescale = self.timescale.filter(|&t| t > 0)?;
        u64::try_from(u128::from(duration) * 1000 / u128::from(timescale)).ok()
    }

    fn esds(&self) -> Option<&EsDescriptor> {
        self.audio.as_ref().and_then(|a| a.esds.as_ref())
    }
}

/// Header/track tree and tags of one MPEG-4 file.
#[derive(Debug)]
pub struct MediaContext {
    /// `ftyp` major brand, e.g. `M4A `.
    pub major_brand: FourCC,
    pub tracks: TryVec<Track>,
    pub tags: MetadataTags,
    max_sample_size: Option<u32>,
}

impl MediaContext {
    /// Read the container structure from a source positioned at the start of the file.
    ///
    /// Sample data is not copied; use [`MediaContext::read_sample`] afterwards.
    /// Top-level boxes other than `moov` are read and discarded, so an `mdat`
    /// ahead of `moov` is read in full. Prefer [`MediaContext::read_seekable`]
    /// when the source can seek.
    ///
    /// A malformed iTunes tag tree is logged and leaves [`MediaContext::tags`] empty.
    pub fn read<T: Read>(f: &mut T, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        Self::read_with(f, config, stop, skip::<T>)
    }

    /// Like [`MediaContext::read`], but seeks over top-level boxes other than `moov`.
    ///
    /// A large `mdat` ahead of `moov` costs one seek instead of a full read.
    pub fn read_seekable<T: Read + Seek>(f: &mut T, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        Self::read_with(f, config, stop, seek_forward::<T>)
    }

    fn read_with<T: Read>(f: &mut T, config: &DecodeConfig, stop: &dyn Stop, skip_top: fn(&mut T, u64) -> Result<()>) -> Result<Self> {
        let mut tracker = ResourceTracker::new(config);
        let mut iter = BoxIter::new(f);

        // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
        let mut major_brand = FourCC::default();
        if let Some(mut b) = iter.next_box()? {
            if b.head.name == BoxType::FileTypeBox {
                major_brand = read_ftyp(&mut b)?;
            } else {
                return Err(Error::InvalidData("'ftyp' box must occur first"));
            }
        }

        let mut moov = None;

        while let Some(mut b) = iter.next_box()? {
            stop.check()?;

            match b.head.name {
                BoxType::MovieBox => {
                    if moov.is_some() {
                        return Err(Error::InvalidData("There should be exactly one moov box"));
                    }
                    moov = Some(read_moov(&mut b, &mut tracker)?);
                },
                // runs to the end of the file
                _ if b.head.size == u64::MAX => break,
                _ => {
                    let len = b.bytes_left();
                    skip_top(b.content.get_mut(), len)?;
                    b.content.set_limit(0);
                },
            }

            check_parser_state(&b.head, &b.content)?;
        }

        let (tracks, tags) = moov.ok_or(Error::NoMoov)?;

        Ok(Self {
            major_brand,
            tracks,
            tags,
            max_sample_size: config.max_sample_size,
        })
    }

    /// Index of the first track an AAC decoder can play.
    pub fn aac_track(&self) -> Option<usize> {
        let found = self.tracks.iter().position(Track::is_aac);
        if found.is_none() {
            warn!("no AAC track among {} tracks", self.tracks.len());
        }
        found
    }

    /// Read one encoded sample (1-based `index`) of `track` from `src`.
    ///
    /// Empty samples and samples larger than the configured pull size are errors.
    pub fn read_sample<R: Read + Seek>(&self, src: &mut R, track: usize, index: u32) -> Result<TryVec<u8>> {
        let table = self
            .tracks
            .get(track)
            .ok_or(Error::InvalidData("track index out of range"))?
            .sample_table
            .as_ref()
            .ok_or(Error::InvalidData("track has no sample table"))?;
        let (offset, size) = table.sample_range(index)?;

        if size == 0 {
            return Err(Error::InvalidData("empty sample"));
        }
        if let Some(limit) = self.max_sample_size {
            if size > limit {
                return Err(Error::ResourceLimitExceeded("sample larger than pull size limit"));
            }
        }

        src.seek(SeekFrom::Start(offset))?;
        read_exact_try_vec(src, u64::from(size))
    }
}

/// Read the container with default limits and no cancellation.
pub fn read_mp4<T: Read>(f: &mut T) -> Result<MediaContext> {
    MediaContext::read(f, &DecodeConfig::default(), &Unstoppable)
}

/// See ISO 14496-12:2015 § 4.2
struct BMFFBox<'a, T> {
    head: BoxHeader,
    content: Take<&'a mut T>,
}

impl<T: Read> BMFFBox<'_, T> {
    fn read_into_try_vec(&mut self) -> std::io::Result<TryVec<u8>> {
        let limit = self.content.limit();
        // For size=0 boxes, size is set to u64::MAX, but after subtracting offset
        // (8 or 16 bytes), the limit will be slightly less. Check for values very
        // close to u64::MAX to detect these cases.
        let mut vec = if limit >= u64::MAX - BoxHeader::MIN_LARGE_SIZE {
            // Unknown size (size=0 box), read without pre-allocation
            std::vec::Vec::new()
        } else {
            let mut v = std::vec::Vec::new();
            v.try_reserve_exact(usize::try_from(limit).map_err(|_| std::io::ErrorKind::OutOfMemory)?)
                .map_err(|_| std::io::ErrorKind::OutOfMemory)?;
            v
        };
        self.content.read_to_end(&mut vec)?; // The default impl
        Ok(vec.into())
    }
}

#[test]
fn box_read_to_end() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 5, offset: 0 },
        content: <_ as Read>::take(tmp, 5),
    };
    let buf = src.read_into_try_vec().unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf, b"12345".as_ref());
}

#[test]
fn box_read_to_end_oom() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 5, offset: 0 },
        // Use a very large value to trigger OOM, but not near u64::MAX (which indicates size=0 boxes)
        content: <_ as Read>::take(tmp, u64::MAX / 2),
    };
    assert!(src.read_into_try_vec().is_err());
}

struct BoxIter<'a, T> {
    src: &'a mut T,
}

impl<T: Read> BoxIter<'_, T> {
    fn new(src: &mut T) -> BoxIter<'_, T> {
        BoxIter { src }
    }

    fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        let r = read_box_header(self.src);
        match r {
            Ok(h) => Ok(Some(BMFFBox {
                head: h,
                content: self.src.take(h.size - h.offset),
            })),
            Err(Error::UnexpectedEOF) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Read> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T: Read> BMFFBox<'_, T> {
    fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    const fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    fn box_iter(&mut self) -> BoxIter<'_, Self> {
        BoxIter::new(self)
    }
}

impl<T> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular mp4 box
/// and its length. Used internally for dispatching to specific
/// parsers for the internal content, or to get the length to
/// skip unknown or uninteresting boxes.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // valid only for top-level box and indicates it's the last box in the file.  usually mdat.
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            u64::from(size32)
        },
    };
    let offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    assert!(offset <= size);
    Ok(BoxHeader { name, size, offset })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

// Parse the extra fields for a full box whose flag fields must be zero.
fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

/// Skip over the entire contents of a box.
fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    // Skip the contents of unknown chunks.
    let to_skip = {
        let header = src.get_header();
        debug!("{header:?} (skipped)");
        header
            .size
            .checked_sub(header.offset)
            .ok_or(Error::InvalidData("header offset > size"))?
    };
    assert_eq!(to_skip, src.bytes_left());
    skip(src, to_skip)
}

/// Skip over the remain data of a box.
fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = {
        let header = src.get_header();
        let len = src.bytes_left();
        debug!("remain {len} (skipped) in {header:?}");
        len
    };
    skip(src, remain)
}

/// Parse a Movie box (moov): every track plus the iTunes tags.
/// See ISO 14496-12:2015 § 8.2.1
fn read_moov<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<(TryVec<Track>, MetadataTags)> {
    let mut tracks = TryVec::new();
    let mut tags = MetadataTags::default();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::TrackBox => {
                tracker.validate_track_count(tracks.len() + 1)?;
                tracks.push(read_trak(&mut b, tracker)?)?;
            },
            BoxType::UserdataBox => match read_udta(&mut b, tracker) {
                Ok(Some(found)) => tags = found,
                Ok(None) => {},
                Err(e @ (Error::Io(_) | Error::OutOfMemory | Error::ResourceLimitExceeded(_))) => return Err(e),
                Err(e) => {
                    // tags are best-effort
                    warn!("ignoring iTunes tags: {e}");
                    tags = MetadataTags::default();
                    skip_box_remain(&mut b)?;
                },
            },
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    debug!("moov: {} tracks", tracks.len());
    Ok((tracks, tags))
}

/// Parse a Track box (trak)
/// See ISO 14496-12:2015 § 8.3.1
fn read_trak<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<Track> {
    let mut track = Track {
        id: None,
        handler: None,
        timescale: None,
        duration: None,
        codec: None,
        audio: None,
        sample_table: None,
    };

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::TrackHeaderBox => {
                track.id = Some(read_tkhd(&mut b)?);
            },
            BoxType::MediaBox => read_mdia(&mut b, &mut track, tracker)?,
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    debug!("track {:?}: handler {:?}, codec {:?}", track.id, track.handler, track.codec);
    Ok(track)
}

/// Parse a Track Header box (tkhd), returning the track id.
/// See ISO 14496-12:2015 § 8.3.2
fn read_tkhd<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<u32> {
    let (version, _flags) = read_fullbox_extra(src)?;
    let track_id = match version {
        1 => {
            skip(src, 16)?; // creation_time, modification_time
            be_u32(src)?
        },
        0 => {
            skip(src, 8)?;
            be_u32(src)?
        },
        _ => return Err(Error::Unsupported("unhandled tkhd version")),
    };
    skip_box_remain(src)?;
    Ok(track_id)
}

/// Parse a Media box (mdia)
/// See ISO 14496-12:2015 § 8.4.1
fn read_mdia<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track, tracker: &mut ResourceTracker<'_>) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::MediaHeaderBox => {
                let (timescale, duration) = read_mdhd(&mut b, &tracker.options)?;
                track.timescale = Some(timescale);
                track.duration = Some(duration);
            },
            BoxType::HandlerBox => {
                track.handler = Some(read_hdlr(&mut b, &tracker.options)?);
            },
            BoxType::MediaInformationBox => read_minf(&mut b, track, tracker)?,
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

/// Parse a Media Header box (mdhd), returning (timescale, duration)
/// See ISO/IEC 14496-12:2015 § 8.4.2
fn read_mdhd<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<(u32, u64)> {
    let version = read_fullbox_version_no_flags(src, options)?;

    let (timescale, duration) = match version {
        1 => {
            let _creation_time = be_u64(src)?;
            let _modification_time = be_u64(src)?;
            let timescale = be_u32(src)?;
            let duration = be_u64(src)?;
            (timescale, duration)
        },
        0 => {
            let _creation_time = be_u32(src)?;
            let _modification_time = be_u32(src)?;
            let timescale = be_u32(src)?;
            let duration = be_u32(src)?;
            // All ones means the duration is unknown.
            let duration = if duration == u32::MAX { 0 } else { u64::from(duration) };
            (timescale, duration)
        },
        _ => return Err(Error::Unsupported("unhandled mdhd version")),
    };

    // Skip language and pre_defined
    skip_box_remain(src)?;

    Ok((timescale, duration))
}

/// Parse a Handler Reference box (hdlr), returning the handler type
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<FourCC> {
    if read_fullbox_version_no_flags(src, options)? != 0 {
        return Err(Error::Unsupported("hdlr version"));
    }
    let _pre_defined = be_u32(src)?;
    let handler_type = FourCC::from(be_u32(src)?);
    // reserved and the name
    skip_box_remain(src)?;
    Ok(handler_type)
}

/// Parse a Media Information box (minf)
fn read_minf<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track, tracker: &mut ResourceTracker<'_>) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::SampleTableBox => read_stbl(&mut b, track, tracker)?,
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

/// Parse Sample Table box (stbl)
/// See ISO/IEC 14496-12:2015 § 8.5
fn read_stbl<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track, tracker: &mut ResourceTracker<'_>) -> Result<()> {
    let mut sample_to_chunk = TryVec::new();
    let mut sample_sizes = TryVec::new();
    let mut chunk_offsets = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::SampleDescriptionBox => {
                let (codec, audio) = read_stsd(&mut b, tracker)?;
                track.codec = codec;
                track.audio = audio;
            },
            BoxType::SampleToChunkBox => {
                sample_to_chunk = read_stsc(&mut b, tracker)?;
            },
            BoxType::SampleSizeBox => {
                sample_sizes = read_stsz(&mut b, tracker)?;
            },
            BoxType::ChunkOffsetBox => {
                chunk_offsets = read_chunk_offsets(&mut b, false, tracker)?;
            },
            BoxType::ChunkLargeOffsetBox => {
                chunk_offsets = read_chunk_offsets(&mut b, true, tracker)?;
            },
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    track.sample_table = Some(SampleTable {
        sample_to_chunk,
        sample_sizes,
        chunk_offsets,
    });
    Ok(())
}

/// Parse Sample Description box (stsd). Only the first entry is described.
/// See ISO/IEC 14496-12:2015 § 8.5.2
fn read_stsd<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<(Option<FourCC>, Option<AudioSampleEntry>)> {
    let _version = read_fullbox_version_no_flags(src, &tracker.options)?;
    let _entry_count = be_u32(src)?;

    let mut codec = None;
    let mut audio = None;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if codec.is_none() {
            codec = Some(FourCC::from(b.head.name));
            if b.head.name == BoxType::MP4AudioSampleEntry {
                audio = Some(read_audio_sample_entry(&mut b, tracker)?);
            } else {
                skip_box_content(&mut b)?;
            }
        } else {
            skip_box_content(&mut b)?;
        }

        check_parser_state(&b.head, &b.content)?;
    }

    Ok((codec, audio))
}

/// Parse an `mp4a` sample entry and its `esds`.
/// See ISO 14496-12:2015 § 12.2.3 and QuickTime File Format "Sound Sample Description"
fn read_audio_sample_entry<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<AudioSampleEntry> {
    skip(src, 6)?; // reserved
    let _data_reference_index = be_u16(src)?;
    let version = be_u16(src)?;
    skip(src, 6)?; // revision level, vendor

    let mut channels = be_u16(src)?;
    let sample_size = be_u16(src)?;
    skip(src, 4)?; // compression id, packet size
    let mut sample_rate = be_u32(src)? >> 16;

    match version {
        0 => (),
        1 => skip(src, 16)?, // samples per packet, bytes per packet/frame/sample
        2 => {
            skip(src, 4)?; // size of struct only
            let rate = f64::from_bits(be_u64(src)?);
            if !(rate.is_finite() && rate >= 0.0 && rate <= f64::from(u32::MAX)) {
                return Err(Error::InvalidData("invalid audio sample rate"));
            }
            sample_rate = rate as u32;
            channels = u16::try_from(be_u32(src)?)?;
            skip(src, 20)?;
        },
        _ => return Err(Error::Unsupported("unknown mp4a sample entry version")),
    }

    let mut esds = None;
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ESDBox => {
                esds = Some(read_esds(&mut b, tracker)?);
            },
            BoxType::QTWaveAtom => {
                if let Some(found) = read_wave(&mut b, tracker)? {
                    esds = Some(found);
                }
            },
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    Ok(AudioSampleEntry {
        channels,
        sample_size,
        sample_rate,
        esds,
    })
}

/// QuickTime `wave` atom; its `esds` child describes the stream.
fn read_wave<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<Option<EsDescriptor>> {
    let mut esds = None;
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ESDBox => esds = Some(read_esds(&mut b, tracker)?),
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(esds)
}

/// Parse an Elementary Stream Descriptor box (esds)
/// See ISO 14496-14:2003 § 5.6
fn read_esds<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<EsDescriptor> {
    if read_fullbox_version_no_flags(src, &tracker.options)? != 0 {
        return Err(Error::Unsupported("unknown esds version"));
    }
    tracker.reserve(src.bytes_left())?;
    let descriptors = src.read_into_try_vec()?;
    aac::read_es_descriptor(&descriptors)
}

/// Parse Sample To Chunk box (stsc)
/// See ISO/IEC 14496-12:2015 § 8.7.4
fn read_stsc<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<TryVec<SampleToChunkEntry>> {
    let _version = read_fullbox_version_no_flags(src, &tracker.options)?;
    let entry_count = be_u32(src)?;
    if u64::from(entry_count) * 12 > src.bytes_left() {
        return Err(Error::InvalidData("stsc entry count exceeds box size"));
    }
    tracker.reserve(u64::from(entry_count) * 12)?;

    let mut entries = TryVec::with_capacity(entry_count.to_usize())?;
    for _ in 0..entry_count {
        let entry = SampleToChunkEntry {
            first_chunk: be_u32(src)?,
            samples_per_chunk: be_u32(src)?,
            _sample_description_index: be_u32(src)?,
        };
        if entry.first_chunk == 0 {
            return Err(Error::InvalidData("stsc chunk indices start at 1"));
        }
        entries.push(entry)?;
    }

    skip_box_remain(src)?;
    Ok(entries)
}

/// Parse Sample Size box (stsz)
/// See ISO/IEC 14496-12:2015 § 8.7.3
fn read_stsz<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<TryVec<u32>> {
    let _version = read_fullbox_version_no_flags(src, &tracker.options)?;
    let sample_size = be_u32(src)?;
    let sample_count = be_u32(src)?;

    tracker.validate_sample_count(sample_count)?;
    if sample_size == 0 && u64::from(sample_count) * 4 > src.bytes_left() {
        return Err(Error::InvalidData("stsz sample count exceeds box size"));
    }
    tracker.reserve(u64::from(sample_count) * 4)?;

    let mut sizes = TryVec::with_capacity(sample_count.to_usize())?;
    if sample_size == 0 {
        // Variable sizes - read each one
        for _ in 0..sample_count {
            sizes.push(be_u32(src)?)?;
        }
    } else {
        // Constant size for all samples
        for _ in 0..sample_count {
            sizes.push(sample_size)?;
        }
    }

    skip_box_remain(src)?;
    Ok(sizes)
}

/// Parse Chunk Offset box (stco or co64)
/// See ISO/IEC 14496-12:2015 § 8.7.5
fn read_chunk_offsets<T: Read>(src: &mut BMFFBox<'_, T>, is_64bit: bool, tracker: &mut ResourceTracker<'_>) -> Result<TryVec<u64>> {
    let _version = read_fullbox_version_no_flags(src, &tracker.options)?;
    let entry_count = be_u32(src)?;
    let entry_size = if is_64bit { 8 } else { 4 };
    if u64::from(entry_count) * entry_size > src.bytes_left() {
        return Err(Error::InvalidData("chunk offset count exceeds box size"));
    }
    tracker.reserve(u64::from(entry_count) * 8)?;

    let mut offsets = TryVec::with_capacity(entry_count.to_usize())?;
    for _ in 0..entry_count {
        let offset = if is_64bit {
            be_u64(src)?
        } else {
            u64::from(be_u32(src)?)
        };
        offsets.push(offset)?;
    }

    skip_box_remain(src)?;
    Ok(offsets)
}

/// Parse a User Data box (udta), looking for iTunes metadata.
fn read_udta<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<Option<MetadataTags>> {
    let mut tags = None;
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::MetadataBox => tags = Some(read_meta(&mut b, tracker)?),
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(tags)
}

/// Parse a Meta box (meta) holding an iTunes item list.
/// See ISO 14496-12:2015 § 8.11.1
///
/// QuickTime writes `meta` without version and flags; its `hdlr` child
/// then starts right after the box header.
fn read_meta<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<MetadataTags> {
    let mut head = [0u8; 8];
    src.read_exact(&mut head)?;

    let children = if head[4..] == *b"hdlr" {
        debug!("meta box without version and flags");
        &head[..]
    } else {
        if head[0] != 0 {
            return Err(Error::Unsupported("unsupported meta version"));
        }
        if head[1..4] != [0u8; 3] && !tracker.options.lenient {
            return Err(Error::Unsupported("expected flags to be 0"));
        }
        &head[4..]
    };

    let mut rest = children.chain(&mut *src);
    read_meta_children(&mut rest, tracker)
}

fn read_meta_children<T: Read>(src: &mut T, tracker: &mut ResourceTracker<'_>) -> Result<MetadataTags> {
    let mut tags = MetadataTags::default();
    let mut iter = BoxIter::new(src);
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::MetadataItemListEntry => read_ilst(&mut b, &mut tags, tracker)?,
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(tags)
}

/// Parse an iTunes item list (ilst)
fn read_ilst<T: Read>(src: &mut BMFFBox<'_, T>, tags: &mut MetadataTags, tracker: &mut ResourceTracker<'_>) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::StandardGenreItem => {
                let data = read_ilst_item_data(&mut b, tracker)?;
                // A free-form ©gen takes precedence over the numeric genre.
                if tags.genre.is_none() {
                    tags.genre = data
                        .filter(|d| d.len() >= 2)
                        .and_then(|d| genre_name(u16::from_be_bytes([d[0], d[1]])))
                        .map(std::string::String::from);
                }
            },
            BoxType::TrackNumberItem => {
                let data = read_ilst_item_data(&mut b, tracker)?;
                tags.track = data
                    .filter(|d| d.len() >= 4)
                    .map(|d| u16::from_be_bytes([d[2], d[3]]))
                    .filter(|&n| n > 0)
                    .map(|n| n.to_string());
            },
            name => match text_item(tags, name) {
                Some(field) => {
                    if let Some(data) = read_ilst_item_data(&mut b, tracker)? {
                        *field = Some(std::string::String::from_utf8_lossy(&data).into_owned());
                    }
                },
                None => skip_box_content(&mut b)?,
            },
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

fn text_item(tags: &mut MetadataTags, name: BoxType) -> Option<&mut Option<std::string::String>> {
    Some(match name {
        BoxType::TitleItem => &mut tags.title,
        BoxType::ArtistItem => &mut tags.artist,
        BoxType::AlbumItem => &mut tags.album,
        BoxType::CommentItem => &mut tags.comment,
        BoxType::CustomGenreItem => &mut tags.genre,
        BoxType::YearItem => &mut tags.date,
        _ => return None,
    })
}

/// Read the value of the first `data` child of an ilst item, without its
/// 4-byte type indicator and 4-byte locale.
fn read_ilst_item_data<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &mut ResourceTracker<'_>) -> Result<Option<TryVec<u8>>> {
    let mut value = None;
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if b.head.name == BoxType::MetadataItemDataEntry && value.is_none() {
            if b.bytes_left() < 8 {
                return Err(Error::InvalidData("ilst data box too small"));
            }
            skip(&mut b, 8)?;
            tracker.reserve(b.bytes_left())?;
            value = Some(b.read_into_try_vec()?);
        } else {
            skip_box_content(&mut b)?;
        }

        check_parser_state(&b.head, &b.content)?;
    }
    Ok(value)
}

/// Parse an ftyp box, returning the major brand.
/// See ISO 14496-12:2015 § 4.3
fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FourCC> {
    let major = be_u32(src)?;
    let _minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    // compatible brands
    skip(src, bytes_left)?;
    Ok(From::from(major))
}

#[cfg_attr(debug_assertions, track_caller)]
fn check_parser_state<T>(header: &BoxHeader, left: &Take<T>) -> Result<(), Error> {
    let limit = left.limit();
    // Allow fully consumed boxes, or size=0 boxes (where original size was u64::MAX)
    if limit == 0 || header.size == u64::MAX {
        Ok(())
    } else {
        debug!("{header:?}: {limit} bytes left unread");
        Err(Error::InvalidData("unread box content or bad parser sync"))
    }
}

/// Read exactly `len` bytes into a freshly allocated buffer.
///
/// On a short read the partial buffer is dropped and `UnexpectedEOF` returned.
fn read_exact_try_vec<T: Read>(src: &mut T, len: u64) -> Result<TryVec<u8>> {
    let mut buf = std::vec::Vec::new();
    buf.try_reserve_exact(usize::try_from(len)?)
        .map_err(|_| Error::OutOfMemory)?;
    let read = src.by_ref().take(len).read_to_end(&mut buf)?;
    if read.to_u64() != len {
        return Err(Error::UnexpectedEOF);
    }
    Ok(buf.into())
}

/// Skip a number of bytes that we don't care to parse.
fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    Ok(())
}

fn seek_forward<R: Seek>(src: &mut R, bytes: u64) -> Result<()> {
    src.seek(SeekFrom::Current(i64::try_from(bytes)?))?;
    Ok(())
}

fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

/// ID3v1 genre for an iTunes `gnre` value (1-based).
fn genre_name(index: u16) -> Option<&'static str> {
    let index = usize::from(index.checked_sub(1)?);
    ID3_GENRES.get(index).copied()
}

const ID3_GENRES: [&str; 80] = [
    "Blues", "Classic Rock", "Country", "Dance", "Disco", "Funk", "Grunge", "Hip-Hop",
    "Jazz", "Metal", "New Age", "Oldies", "Other", "Pop", "R&B", "Rap",
    "Reggae", "Rock", "Techno", "Industrial", "Alternative", "Ska", "Death Metal", "Pranks",
    "Soundtrack", "Euro-Techno", "Ambient", "Trip-Hop", "Vocal", "Jazz+Funk", "Fusion", "Trance",
    "Classical", "Instrumental", "Acid", "House", "Game", "Sound Clip", "Gospel", "Noise",
    "AlternRock", "Bass", "Soul", "Punk", "Space", "Meditative", "Instrumental Pop", "Instrumental Rock",
    "Ethnic", "Gothic", "Darkwave", "Techno-Industrial", "Electronic", "Pop-Folk", "Eurodance", "Dream",
    "Southern Rock", "Comedy", "Cult", "Gangsta", "Top 40", "Christian Rap", "Pop/Funk", "Jungle",
    "Native American", "Cabaret", "New Wave", "Psychadelic", "Rave", "Showtunes", "Trailer", "Lo-Fi",
    "Tribal", "Acid Punk", "Acid Jazz", "Polka", "Retro", "Musical", "Rock & Roll", "Hard Rock",
];

#[test]
fn genre_index_is_one_based() {
    assert_eq!(genre_name(0), None);
    assert_eq!(genre_name(1), Some("Blues"));
    assert_eq!(genre_name(18), Some("Rock"));
    assert_eq!(genre_name(80), Some("Hard Rock"));
    assert_eq!(genre_name(81), None);
}

#[test]
fn large_size_box_header() {
    let mut data: &[u8] = &[0, 0, 0, 1, b'f', b'r', b'e', b'e', 0, 0, 0, 0, 0, 0, 0, 20, 1, 2, 3, 4];
    let header = read_box_header(&mut data).unwrap();
    assert!(header.name == BoxType::FreeSpaceBox);
    assert_eq!(header.size, 20);
    assert_eq!(header.offset, 16);
    assert_eq!(data, &[1, 2, 3, 4]);
}

#[test]
fn box_header_rejects_small_sizes() {
    let mut data: &[u8] = &[0, 0, 0, 7, b'm', b'o', b'o', b'v'];
    assert!(matches!(read_box_header(&mut data), Err(Error::InvalidData("malformed size"))));
    let mut data: &[u8] = &[0, 0, 0, 1, b'm', b'o', b'o', b'v', 0, 0, 0, 0, 0, 0, 0, 15];
    assert!(matches!(read_box_header(&mut data), Err(Error::InvalidData("malformed wide size"))));
}

#[cfg(test)]
fn sample_table(sizes: &[u32], runs: &[(u32, u32)], offsets: &[u64]) -> SampleTable {
    let mut table = SampleTable {
        sample_to_chunk: TryVec::new(),
        sample_sizes: TryVec::new(),
        chunk_offsets: TryVec::new(),
    };
    for &s in sizes {
        table.sample_sizes.push(s).unwrap();
    }
    for &(first_chunk, samples_per_chunk) in runs {
        table
            .sample_to_chunk
            .push(SampleToChunkEntry { first_chunk, samples_per_chunk, _sample_description_index: 1 })
            .unwrap();
    }
    for &o in offsets {
        table.chunk_offsets.push(o).unwrap();
    }
    table
}

#[test]
fn sample_range_walks_chunk_runs() {
    // chunks 1-2 hold 2 samples each, chunk 3 holds 1
    let table = sample_table(&[10, 20, 30, 40, 50], &[(1, 2), (3, 1)], &[100, 200, 300]);
    assert_eq!(table.sample_range(1).unwrap(), (100, 10));
    assert_eq!(table.sample_range(2).unwrap(), (110, 20));
    assert_eq!(table.sample_range(3).unwrap(), (200, 30));
    assert_eq!(table.sample_range(4).unwrap(), (230, 40));
    assert_eq!(table.sample_range(5).unwrap(), (300, 50));
    assert!(table.sample_range(0).is_err());
    assert!(table.sample_range(6).is_err());
}

#[test]
fn sample_range_missing_chunk_offset() {
    let table = sample_table(&[10, 20, 30], &[(1, 1)], &[100, 200]);
    assert!(table.sample_range(2).is_ok());
    assert!(matches!(table.sample_range(3), Err(Error::InvalidData(_))));
}
