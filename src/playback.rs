// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming AAC playback over an external decoder.
//!
//! [`play`] runs a small state machine: the container is opened and the AAC
//! track configured, then samples are pulled, decoded, and written to the
//! host one at a time until the track ends, the host asks to stop, or
//! something fails. The decoder is owned by the playback session and dropped
//! exactly once, whichever way playback ends.

use crate::tuple::Tuple;
use crate::{DecodeConfig, Error, MediaContext, Result, Unstoppable};
use enough::Stop;
use log::{debug, warn};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Seek};

/// Output format negotiated by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
}

/// One decoded frame: interleaved `f32` samples, `channels` per sample instant.
///
/// An empty frame is normal while the decoder primes.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub samples: &'a [f32],
    pub channels: u8,
}

/// Error reported by an [`AacDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderError(Cow<'static, str>);

impl DecoderError {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DecoderError {}

/// An AAC decoder. Dropping it releases its resources.
pub trait AacDecoder {
    /// Configure from the track's AudioSpecificConfig blob.
    fn init(&mut self, config: &[u8]) -> Result<AudioParams, DecoderError>;

    /// Decode one encoded sample unit.
    fn decode(&mut self, sample: &[u8]) -> Result<DecodedFrame<'_>, DecoderError>;
}

/// The player side: audio output plus the seek requests coming from the user.
pub trait PlaybackHost {
    /// Open float output at the given format. Returning `false` aborts playback.
    fn open_audio(&mut self, params: AudioParams) -> bool;

    fn set_tuple(&mut self, _tuple: Tuple) {}

    /// Average bitrate in bits per second.
    fn set_bitrate(&mut self, _bitrate: u32) {}

    /// A pending seek target in milliseconds, consumed by this call.
    fn check_seek(&mut self) -> Option<u32>;

    fn write_audio(&mut self, samples: &[f32]);
}

/// Whether the source is an MPEG-4 file with a playable AAC track.
///
/// Never fails; any read or parse error means "no". Top-level boxes other
/// than `moov` are seeked over, not read.
pub fn probe<R: Read + Seek>(src: &mut R) -> bool {
    match MediaContext::read_seekable(src, &DecodeConfig::default(), &Unstoppable) {
        Ok(context) => context.aac_track().is_some(),
        Err(e) => {
            debug!("probe: {e}");
            false
        },
    }
}

/// Metadata of the AAC track and the file's tags.
pub fn read_metadata<R: Read + Seek>(src: &mut R) -> Result<Tuple> {
    read_metadata_with_config(src, &DecodeConfig::default(), &Unstoppable)
}

pub fn read_metadata_with_config<R: Read + Seek>(src: &mut R, config: &DecodeConfig, stop: &dyn Stop) -> Result<Tuple> {
    let context = MediaContext::read_seekable(src, config, stop)?;
    let track = context.aac_track().ok_or(Error::NoPlayableTrack)?;
    Ok(Tuple::from_track(&context, &context.tracks[track]))
}

/// Decode the AAC track of `src` into `host` until it ends or `stop` fires.
///
/// A stop request ends playback successfully. `decoder` is dropped before this returns.
pub fn play<R, D, H>(src: &mut R, decoder: D, host: &mut H, stop: &dyn Stop) -> Result<()>
where
    R: Read + Seek,
    D: AacDecoder,
    H: PlaybackHost,
{
    play_with_config(src, decoder, host, stop, &DecodeConfig::default())
}

pub fn play_with_config<R, D, H>(src: &mut R, decoder: D, host: &mut H, stop: &dyn Stop, config: &DecodeConfig) -> Result<()>
where
    R: Read + Seek,
    D: AacDecoder,
    H: PlaybackHost,
{
    let mut state = State::Opening(decoder);
    loop {
        state = match state {
            State::Opening(decoder) => match open(src, decoder, host, config, stop) {
                Ok(session) => State::Streaming(session),
                Err(e) => State::Done(Err(e)),
            },
            State::Streaming(session) => session.step(src, host, stop),
            State::Closing(session, result) => {
                debug!("closing after {} of {} samples", session.position, session.sample_count);
                drop(session);
                State::Done(result)
            },
            State::Done(result) => return result,
        };
    }
}

enum State<D> {
    Opening(D),
    Streaming(Session<D>),
    Closing(Session<D>, Result<()>),
    Done(Result<()>),
}

struct Session<D> {
    decoder: D,
    context: MediaContext,
    track: usize,
    sample_count: u32,
    /// 0-based; the container addresses sample `position + 1`.
    position: u32,
    /// Samples per channel, latched from the first non-empty frame.
    frame_size: Option<u32>,
    sample_rate: u32,
}

fn open<R, D, H>(src: &mut R, mut decoder: D, host: &mut H, config: &DecodeConfig, stop: &dyn Stop) -> Result<Session<D>>
where
    R: Read + Seek,
    D: AacDecoder,
    H: PlaybackHost,
{
    let context = MediaContext::read_seekable(src, config, stop)?;
    let track = context.aac_track().ok_or_else(|| {
        warn!("Unsupported Audio track type");
        Error::NoPlayableTrack
    })?;
    let trak = &context.tracks[track];

    let params = {
        let asc = trak.decoder_config().ok_or(Error::NoPlayableTrack)?;
        decoder.init(asc).map_err(Error::DecoderConfig)?
    };
    if params.channels == 0 {
        return Err(Error::DecoderConfig(DecoderError::new("decoder reported zero channels")));
    }

    if !host.open_audio(params) {
        return Err(Error::OutputRejected);
    }
    host.set_tuple(Tuple::from_track(&context, trak));
    host.set_bitrate(trak.avg_bitrate());

    let sample_count = trak.sample_count();
    debug!("playing track {track}: {sample_count} samples, {params:?}");

    Ok(Session {
        decoder,
        context,
        track,
        sample_count,
        position: 0,
        frame_size: None,
        sample_rate: params.sample_rate,
    })
}

impl<D: AacDecoder> Session<D> {
    fn step<R: Read + Seek, H: PlaybackHost>(mut self, src: &mut R, host: &mut H, stop: &dyn Stop) -> State<D> {
        if let Err(reason) = stop.check() {
            debug!("stop requested: {reason}");
            return State::Closing(self, Ok(()));
        }
        if self.position >= self.sample_count {
            return State::Closing(self, Ok(()));
        }
        match self.advance(src, host) {
            Ok(()) => State::Streaming(self),
            Err(e) => {
                warn!("playback failed at sample {}: {e}", self.position);
                State::Closing(self, Err(e))
            },
        }
    }

    /// Pull, decode, and emit (or seek past) one sample.
    fn advance<R: Read + Seek, H: PlaybackHost>(&mut self, src: &mut R, host: &mut H) -> Result<()> {
        let index = self.position + 1;
        self.position = index;
        let sample = self.context.read_sample(src, self.track, index)?;

        let frame = self.decoder.decode(&sample).map_err(Error::Decode)?;

        let frame_size = match self.frame_size {
            Some(n) => n,
            None => {
                let per_channel = match frame.channels {
                    0 => 0,
                    c => frame.samples.len() / usize::from(c),
                };
                let n = u32::try_from(per_channel)?;
                if n == 0 {
                    return Ok(());
                }
                self.frame_size = Some(n);
                n
            },
        };

        if let Some(ms) = host.check_seek() {
            self.position = seek_position(ms, self.sample_rate, frame_size);
            debug!("seek to {ms} ms: sample {}", self.position);
            return Ok(());
        }

        host.write_audio(frame.samples);
        Ok(())
    }
}

/// First sample unit of a seek target: `ms * rate / 1000 / frame_size`, rounded down.
fn seek_position(ms: u32, sample_rate: u32, frame_size: u32) -> u32 {
    let units = u64::from(ms) * u64::from(sample_rate) / 1000 / u64::from(frame_size.max(1));
    u32::try_from(units).unwrap_or(u32::MAX)
}

#[test]
fn seek_position_rounds_down() {
    assert_eq!(seek_position(0, 44100, 1024), 0);
    assert_eq!(seek_position(1000, 44100, 1024), 43);
    assert_eq!(seek_position(117, 44100, 1024), 5);
    assert_eq!(seek_position(u32::MAX, u32::MAX, 1), u32::MAX);
}
