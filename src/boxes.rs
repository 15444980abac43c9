// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    }
}

/// A four-character code, stored as the raw bytes read from the file.
///
/// Not required to be printable; comparisons are case-sensitive.
#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(v: [u8; 4]) -> Self {
        Self { value: v }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => fmt::Debug::fmt(&self.value, f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.value))
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    FreeSpaceBox                      0x6672_6565, // "free"
    MovieBox                          0x6d6f_6f76, // "moov"
    MovieHeaderBox                    0x6d76_6864, // "mvhd"
    TrackBox                          0x7472_616b, // "trak"
    TrackHeaderBox                    0x746b_6864, // "tkhd"
    MediaBox                          0x6d64_6961, // "mdia"
    MediaHeaderBox                    0x6d64_6864, // "mdhd"
    HandlerBox                        0x6864_6c72, // "hdlr"
    MediaInformationBox               0x6d69_6e66, // "minf"
    SampleTableBox                    0x7374_626c, // "stbl"
    SampleDescriptionBox              0x7374_7364, // "stsd"
    SampleToChunkBox                  0x7374_7363, // "stsc"
    SampleSizeBox                     0x7374_737a, // "stsz"
    ChunkOffsetBox                    0x7374_636f, // "stco"
    ChunkLargeOffsetBox               0x636f_3634, // "co64"
    MP4AudioSampleEntry               0x6d70_3461, // "mp4a"
    ESDBox                            0x6573_6473, // "esds"
    QTWaveAtom                        0x7761_7665, // "wave"
    UserdataBox                       0x7564_7461, // "udta"
    MetadataBox                       0x6d65_7461, // "meta"
    MetadataItemListEntry             0x696c_7374, // "ilst"
    MetadataItemDataEntry             0x6461_7461, // "data"
    CoverArtItem                      0x636f_7672, // "covr"
    TitleItem                         0xa96e_616d, // "©nam"
    ArtistItem                        0xa941_5254, // "©ART"
    AlbumItem                         0xa961_6c62, // "©alb"
    CommentItem                       0xa963_6d74, // "©cmt"
    CustomGenreItem                   0xa967_656e, // "©gen"
    StandardGenreItem                 0x676e_7265, // "gnre"
    YearItem                          0xa964_6179, // "©day"
    TrackNumberItem                   0x7472_6b6e, // "trkn"
    UuidBox                           0x7575_6964, // "uuid"
);

#[test]
fn fourcc_roundtrips_through_box_type() {
    let t = BoxType::from(0x6d6f_6f76);
    assert!(t == BoxType::MovieBox);
    let cc: FourCC = t.into();
    assert_eq!(cc, b"moov");
    assert_eq!(format!("{:?}", BoxType::UnknownBox(0x6162_6364)), "abcd");
}

#[test]
fn fourcc_non_ascii_display() {
    let cc = FourCC::from(BoxType::TitleItem);
    assert_eq!(cc.value, [0xa9, b'n', b'a', b'm']);
    assert_eq!(cc.to_string(), "\u{fffd}nam");
}
