// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct descent to the iTunes cover art, without reading the track tree.

use crate::boxes::BoxType;
use crate::{be_u32, read_exact_try_vec, seek_forward, BoxHeader, DecodeConfig, Error, ResourceTracker, Result, TryVec};
use log::debug;
use std::io::{Read, Seek};

/// One level of the descent: the box to enter and the bytes to skip at its start.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    name: BoxType,
    skip: u8,
}

/// `meta` is a full box (version and flags); `data` starts with its type
/// indicator and locale.
const COVER_PATH: [PathStep; 6] = [
    PathStep { name: BoxType::MovieBox, skip: 0 },
    PathStep { name: BoxType::UserdataBox, skip: 0 },
    PathStep { name: BoxType::MetadataBox, skip: 4 },
    PathStep { name: BoxType::MetadataItemListEntry, skip: 0 },
    PathStep { name: BoxType::CoverArtItem, skip: 0 },
    PathStep { name: BoxType::MetadataItemDataEntry, skip: 8 },
];

/// Extract the first iTunes cover image (`moov/udta/meta/ilst/covr/data`).
///
/// The source must be positioned at the start of the file. The returned bytes
/// are the image exactly as stored, usually JPEG or PNG.
pub fn read_itunes_cover<R: Read + Seek>(src: &mut R) -> Result<TryVec<u8>> {
    read_itunes_cover_with_config(src, &DecodeConfig::default())
}

/// Like [`read_itunes_cover`], with the payload allocation checked against
/// `config.peak_memory_limit` before it happens.
pub fn read_itunes_cover_with_config<R: Read + Seek>(src: &mut R, config: &DecodeConfig) -> Result<TryVec<u8>> {
    let mut tracker = ResourceTracker::new(config);

    let (size, name) = read_atom_header(src)?;
    if name != BoxType::FileTypeBox {
        return Err(Error::InvalidData("'ftyp' box must occur first"));
    }
    seek_forward(src, size - BoxHeader::MIN_SIZE)?;

    let mut stop = u64::MAX;
    let mut at = size;

    for step in &COVER_PATH {
        let size = loop {
            if at >= stop {
                return Err(Error::InvalidData("box not found in parent scope"));
            }
            let (size, name) = read_atom_header(src)?;
            let end = at
                .checked_add(size)
                .ok_or(Error::InvalidData("box size overflow"))?;
            if end > stop {
                return Err(Error::InvalidData("box exceeds parent scope"));
            }
            if name == step.name {
                break size;
            }
            debug!("{name:?} (skipped) looking for {:?}", step.name);
            seek_forward(src, size - BoxHeader::MIN_SIZE)?;
            at = end;
        };

        stop = at + size;
        at = at
            .checked_add(BoxHeader::MIN_SIZE + u64::from(step.skip))
            .ok_or(Error::InvalidData("box size overflow"))?;
        if step.skip > 0 {
            seek_forward(src, u64::from(step.skip))?;
        }
    }

    let len = stop
        .checked_sub(at)
        .ok_or(Error::InvalidData("cover data box too small"))?;
    tracker.reserve(len)?;
    debug!("cover payload: {len} bytes");
    read_exact_try_vec(src, len)
}

/// Compact 32-bit box header; `size` includes the header itself.
fn read_atom_header<R: Read>(src: &mut R) -> Result<(u64, BoxType)> {
    let size = u64::from(be_u32(src)?);
    let name = BoxType::from(be_u32(src)?);
    if size < BoxHeader::MIN_SIZE {
        return Err(Error::InvalidData("malformed size"));
    }
    Ok((size, name))
}

#[cfg(test)]
fn atom(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut v = u32::try_from(payload.len() + 8).unwrap().to_be_bytes().to_vec();
    v.extend_from_slice(name);
    v.extend_from_slice(payload);
    v
}

#[cfg(test)]
fn cover_file(image: &[u8]) -> std::vec::Vec<u8> {
    let data = atom(b"data", &[&[0, 0, 0, 13, 0, 0, 0, 0][..], image].concat());
    let covr = atom(b"covr", &data);
    let ilst = atom(b"ilst", &covr);
    let meta = atom(b"meta", &[&[0, 0, 0, 0][..], &atom(b"hdlr", &[0; 25]), &ilst].concat());
    let udta = atom(b"udta", &meta);
    let moov = atom(b"moov", &udta);
    [atom(b"ftyp", b"M4A \0\0\0\0"), moov].concat()
}

#[test]
fn walks_to_cover_payload() {
    let file = cover_file(b"\xff\xd8\xff\xe0jpeg");
    let cover = read_itunes_cover(&mut std::io::Cursor::new(&file)).unwrap();
    assert_eq!(&cover[..], b"\xff\xd8\xff\xe0jpeg");
}

#[test]
fn empty_cover_payload() {
    let file = cover_file(b"");
    let cover = read_itunes_cover(&mut std::io::Cursor::new(&file)).unwrap();
    assert!(cover.is_empty());
}

#[test]
fn short_box_is_rejected() {
    let mut file = atom(b"ftyp", b"M4A \0\0\0\0");
    file.extend_from_slice(&[0, 0, 0, 4, b'm', b'o', b'o', b'v']);
    let err = read_itunes_cover(&mut std::io::Cursor::new(&file)).unwrap_err();
    assert!(matches!(err, Error::InvalidData("malformed size")));
}

#[test]
fn child_overflowing_parent_is_rejected() {
    // moov claims 16 bytes but its udta child claims 40
    let mut file = atom(b"ftyp", b"M4A \0\0\0\0");
    file.extend_from_slice(&[0, 0, 0, 16, b'm', b'o', b'o', b'v']);
    file.extend_from_slice(&[0, 0, 0, 40, b'u', b'd', b't', b'a']);
    file.resize(file.len() + 32, 0);
    let err = read_itunes_cover(&mut std::io::Cursor::new(&file)).unwrap_err();
    assert!(matches!(err, Error::InvalidData("box exceeds parent scope")));
}

#[test]
fn missing_child_within_parent() {
    let udta = atom(b"udta", &atom(b"free", &[0; 4]));
    let file = [atom(b"ftyp", b"M4A \0\0\0\0"), atom(b"moov", &udta)].concat();
    let err = read_itunes_cover(&mut std::io::Cursor::new(&file)).unwrap_err();
    assert!(matches!(err, Error::InvalidData("box not found in parent scope")));
}

#[test]
fn cover_respects_memory_limit() {
    let file = cover_file(&[7; 64]);
    let config = DecodeConfig::default().with_peak_memory_limit(63);
    let err = read_itunes_cover_with_config(&mut std::io::Cursor::new(&file), &config).unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(_)));
    let config = DecodeConfig::default().with_peak_memory_limit(64);
    assert_eq!(read_itunes_cover_with_config(&mut std::io::Cursor::new(&file), &config).unwrap().len(), 64);
}
