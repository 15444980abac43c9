// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MPEG-4 Systems descriptors and the AAC AudioSpecificConfig.
//!
//! See ISO 14496-1:2010 § 7.2.6 and ISO 14496-3:2009 § 1.6.2.1

use crate::{Error, Result, TryVec};
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::debug;

const ES_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCRIPTOR_TAG: u8 = 0x04;
const DECODER_SPECIFIC_DESCRIPTOR_TAG: u8 = 0x05;

/// Contents of an `esds` box that matter for decoding.
#[derive(Debug)]
pub struct EsDescriptor {
    /// 0x40 for MPEG-4 audio, 0x66..=0x68 for MPEG-2 AAC.
    pub object_type_indication: u8,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
    /// DecoderSpecificInfo, normally an AudioSpecificConfig.
    pub decoder_specific_info: TryVec<u8>,
}

/// Parse the descriptor stream that follows the `esds` full box header.
pub(crate) fn read_es_descriptor(data: &[u8]) -> Result<EsDescriptor> {
    let mut src = data;
    let (tag, mut es) = read_descriptor(&mut src)?;
    if tag != ES_DESCRIPTOR_TAG {
        return Err(Error::InvalidData("expected ES_Descriptor"));
    }

    let _es_id = es.read_u16::<byteorder::BigEndian>()?;
    let flags = es.read_u8()?;
    if flags & 0x80 != 0 {
        skip_bytes(&mut es, 2)?; // dependsOn_ES_ID
    }
    if flags & 0x40 != 0 {
        let url_len = es.read_u8()?;
        skip_bytes(&mut es, usize::from(url_len))?;
    }
    if flags & 0x20 != 0 {
        skip_bytes(&mut es, 2)?; // OCR_ES_Id
    }

    while !es.is_empty() {
        let (tag, body) = read_descriptor(&mut es)?;
        if tag == DECODER_CONFIG_DESCRIPTOR_TAG {
            return read_decoder_config(body);
        }
        debug!("skipping descriptor tag {tag:#x} in ES_Descriptor");
    }

    Err(Error::InvalidData("ES_Descriptor without DecoderConfigDescriptor"))
}

fn read_decoder_config(mut src: &[u8]) -> Result<EsDescriptor> {
    let object_type_indication = src.read_u8()?;
    let _stream_type = src.read_u8()?;
    let _buffer_size = src.read_u24::<byteorder::BigEndian>()?;
    let max_bitrate = src.read_u32::<byteorder::BigEndian>()?;
    let avg_bitrate = src.read_u32::<byteorder::BigEndian>()?;

    let mut decoder_specific_info = TryVec::new();
    while !src.is_empty() {
        let (tag, body) = read_descriptor(&mut src)?;
        if tag == DECODER_SPECIFIC_DESCRIPTOR_TAG {
            decoder_specific_info = TryVec::with_capacity(body.len())?;
            decoder_specific_info.extend_from_slice(body)?;
            break;
        }
    }

    Ok(EsDescriptor {
        object_type_indication,
        max_bitrate,
        avg_bitrate,
        decoder_specific_info,
    })
}

/// Split one tag/length/body descriptor off the front of `src`.
fn read_descriptor<'a>(src: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    let tag = src.read_u8()?;
    let len = read_descriptor_length(src)?;
    let len = usize::try_from(len)?;
    if len > src.len() {
        return Err(Error::InvalidData("descriptor length exceeds parent"));
    }
    let (body, rest) = src.split_at(len);
    *src = rest;
    Ok((tag, body))
}

/// Expandable size field: up to four bytes, seven bits each, high bit set on all but the last.
fn read_descriptor_length(src: &mut &[u8]) -> Result<u32> {
    let mut len = 0u32;
    for _ in 0..4 {
        let byte = src.read_u8()?;
        len = len << 7 | u32::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(Error::InvalidData("descriptor length uses more than four bytes"))
}

fn skip_bytes(src: &mut &[u8], n: usize) -> Result<()> {
    if n > src.len() {
        return Err(Error::UnexpectedEOF);
    }
    *src = &src[n..];
    Ok(())
}

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Audio object types an AAC decoder handles:
/// Main, LC, SSR, LTP, SBR, ER LC, ER LTP, LD, PS.
const DECODABLE_OBJECT_TYPES: [u8; 9] = [1, 2, 3, 4, 5, 17, 19, 23, 29];

/// Leading fields of an MPEG-4 AudioSpecificConfig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Audio object type of the core coder (after any explicit SBR/PS signalling).
    pub audio_object_type: u8,
    /// Core sampling frequency in Hz.
    pub sample_rate: u32,
    /// Output frequency signalled by explicit SBR/PS, if any.
    pub extension_sample_rate: Option<u32>,
    /// 0 means the layout is defined in-band, 1..=7 are the standard layouts.
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut bits = BitReader::new(data);

        let mut audio_object_type = read_object_type(&mut bits)?;
        let sample_rate = read_sample_rate(&mut bits)?;
        let channel_configuration = bits.read_u8(4)?;

        let mut extension_sample_rate = None;
        if audio_object_type == 5 || audio_object_type == 29 {
            extension_sample_rate = Some(read_sample_rate(&mut bits)?);
            audio_object_type = read_object_type(&mut bits)?;
        }

        Ok(Self {
            audio_object_type,
            sample_rate,
            extension_sample_rate,
            channel_configuration,
        })
    }

    /// Whether an AAC decoder supports this object type.
    pub fn is_decodable(&self) -> bool {
        DECODABLE_OBJECT_TYPES.contains(&self.audio_object_type)
    }
}

fn read_object_type(bits: &mut BitReader<'_>) -> Result<u8> {
    let object_type = bits.read_u8(5)?;
    if object_type == 31 {
        return Ok(32 + bits.read_u8(6)?);
    }
    Ok(object_type)
}

fn read_sample_rate(bits: &mut BitReader<'_>) -> Result<u32> {
    match bits.read_u8(4)? {
        0x0f => Ok(bits.read_u32(24)?),
        index => SAMPLE_RATES
            .get(usize::from(index))
            .copied()
            .ok_or(Error::InvalidData("reserved sampling frequency index")),
    }
}

#[test]
fn aac_lc_stereo_44100() {
    let asc = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
    assert_eq!(asc.audio_object_type, 2);
    assert_eq!(asc.sample_rate, 44100);
    assert_eq!(asc.channel_configuration, 2);
    assert_eq!(asc.extension_sample_rate, None);
    assert!(asc.is_decodable());
}

#[test]
fn explicit_rate_and_escaped_object_type() {
    // AOT 31 escape + 6 bits (value 0 -> 32), freq index 15 + 24-bit 22050, 1 channel
    // 11111 000000 1111 000000000101011000100010 0001 + padding
    let asc = AudioSpecificConfig::parse(&[0xf8, 0x1e, 0x00, 0xac, 0x44, 0x20]).unwrap();
    assert_eq!(asc.audio_object_type, 32);
    assert_eq!(asc.sample_rate, 22050);
    assert_eq!(asc.channel_configuration, 1);
    assert!(!asc.is_decodable());
}

#[test]
fn explicit_sbr_signalling() {
    // AOT 5, 24000 Hz core, stereo, extension 48000 Hz, core AOT 2
    // 00101 0110 0010 0011 00010
    let asc = AudioSpecificConfig::parse(&[0x2b, 0x11, 0x88]).unwrap();
    assert_eq!(asc.audio_object_type, 2);
    assert_eq!(asc.sample_rate, 24000);
    assert_eq!(asc.extension_sample_rate, Some(48000));
    assert_eq!(asc.channel_configuration, 2);
}

#[test]
fn truncated_audio_specific_config() {
    assert!(matches!(AudioSpecificConfig::parse(&[0x12]), Err(Error::InvalidData(_))));
    // index 13 is reserved
    assert!(AudioSpecificConfig::parse(&[0x16, 0x90]).is_err());
}

#[test]
fn descriptor_lengths_in_expanded_form() {
    let mut one: &[u8] = &[0x05];
    assert_eq!(read_descriptor_length(&mut one).unwrap(), 5);
    let mut four: &[u8] = &[0x80, 0x80, 0x80, 0x22];
    assert_eq!(read_descriptor_length(&mut four).unwrap(), 0x22);
    let mut two: &[u8] = &[0x81, 0x00];
    assert_eq!(read_descriptor_length(&mut two).unwrap(), 128);
    let mut five: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x01];
    assert!(read_descriptor_length(&mut five).is_err());
}

#[test]
fn es_descriptor_with_padded_lengths() {
    let data = [
        0x03, 0x80, 0x80, 0x80, 0x1c, // ES_Descriptor, 28 bytes
        0x00, 0x01, 0x00, // ES_ID, flags
        0x04, 0x80, 0x80, 0x80, 0x11, // DecoderConfigDescriptor, 17 bytes
        0x40, 0x15, 0x00, 0x00, 0x00, // OTI, stream type, buffer size
        0x00, 0x01, 0xf4, 0x00, // max bitrate 128000
        0x00, 0x01, 0xf4, 0x00, // avg bitrate 128000
        0x05, 0x02, 0x12, 0x10, // DecoderSpecificInfo
        0x06, 0x01, 0x02, // SLConfigDescriptor
    ];
    let esds = read_es_descriptor(&data).unwrap();
    assert_eq!(esds.object_type_indication, 0x40);
    assert_eq!(esds.avg_bitrate, 128_000);
    assert_eq!(esds.max_bitrate, 128_000);
    assert_eq!(&esds.decoder_specific_info[..], &[0x12, 0x10]);
}

#[test]
fn es_descriptor_length_overflow() {
    let data = [0x03, 0x40, 0x00, 0x01, 0x00];
    assert!(matches!(
        read_es_descriptor(&data),
        Err(Error::InvalidData("descriptor length exceeds parent"))
    ));
}
