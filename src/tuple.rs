// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{MediaContext, Track};

/// Codec name reported for every playable track.
pub const AAC_CODEC_NAME: &str = "MPEG-2/4 AAC";

/// Flat metadata record handed to the host for one opened file.
///
/// Absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub comment: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub track_number: Option<i32>,
    pub codec: Option<String>,
    /// Average bitrate in kbit/s.
    pub bitrate: Option<u32>,
    /// Human-readable rate and layout, e.g. `44 kHz, stereo`.
    pub quality: Option<String>,
    pub length_ms: Option<u64>,
}

impl Tuple {
    pub(crate) fn from_track(context: &MediaContext, track: &Track) -> Self {
        let tags = &context.tags;

        let rate = track.sample_rate();
        let channels = track.channels();
        let quality = (rate > 0 && channels > 0).then(|| {
            let layout = match channels {
                1 => "mono",
                2 => "stereo",
                _ => "surround",
            };
            format!("{} kHz, {layout}", rate / 1000)
        });

        let bitrate = track.avg_bitrate();

        Self {
            title: tags.title.clone(),
            artist: tags.artist.clone(),
            album: tags.album.clone(),
            comment: tags.comment.clone(),
            genre: tags.genre.clone(),
            year: tags.date.as_deref().map(atoi),
            track_number: tags.track.as_deref().map(atoi),
            codec: Some(AAC_CODEC_NAME.to_owned()),
            bitrate: (bitrate > 0).then_some(bitrate / 1000),
            quality,
            length_ms: track.duration_ms(),
        }
    }
}

/// C-style `atoi`: optional whitespace and sign, then the leading digits.
/// Anything unparsable yields 0; overflow saturates.
pub(crate) fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i32 = 0;
    for d in digits.bytes().take_while(u8::is_ascii_digit) {
        let d = i32::from(d - b'0');
        value = value.saturating_mul(10);
        value = if negative { value.saturating_sub(d) } else { value.saturating_add(d) };
    }
    value
}

#[test]
fn atoi_leading_integer() {
    assert_eq!(atoi("2010"), 2010);
    assert_eq!(atoi("2010-05-01T00:00:00Z"), 2010);
    assert_eq!(atoi("  7/12"), 7);
    assert_eq!(atoi("-3"), -3);
    assert_eq!(atoi("abc"), 0);
    assert_eq!(atoi(""), 0);
    assert_eq!(atoi("99999999999"), i32::MAX);
}
