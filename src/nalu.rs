// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit framing: the two-byte NAL unit header and the Annex B start-code
//! scanner that delimits units inside a packet.

use std::io::Cursor;

use anyhow::anyhow;
use bitreader::BitReader;
use bytes::Buf;
use enumn::N;

/// Length of the 0x000001 start code pattern.
pub const START_CODE_LEN: usize = 3;

/// Length of nal_unit_header() (7.3.1.2).
pub const NALU_HEADER_LEN: usize = 2;

/// Table 7-1 – NAL unit type codes and NAL unit type classes.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::RsvIrapVcl23 as u32
    }

    /// Whether this is a coded slice segment the parser decodes: the trailing,
    /// TSA, STSA, RADL and RASL slices plus the BLA/IDR/CRA random-access
    /// pictures.
    pub fn is_slice(&self) -> bool {
        let type_ = *self as u32;
        type_ <= Self::RaslR as u32
            || (type_ >= Self::BlaWLp as u32 && type_ <= Self::CraNut as u32)
    }
}

/// The two-byte nal_unit_header() following every start code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub nuh_layer_id: u8,
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    /// Parses the header from the first bytes following a start code.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < NALU_HEADER_LEN {
            return Err(anyhow!("truncated NAL unit header"));
        }

        let mut r = BitReader::new(&data[0..NALU_HEADER_LEN]);

        // forbidden_zero_bit
        r.skip(1)?;

        Ok(Self {
            type_: NaluType::n(r.read_u32(6)?).ok_or(anyhow!("invalid NALU type"))?,
            nuh_layer_id: r.read_u8(6)?,
            nuh_temporal_id_plus1: r.read_u8(3)?,
        })
    }
}

/// Outcome of one scan step over a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum NalScan<'a> {
    /// No start code (left) in the packet.
    NotFound,
    /// A complete NAL unit delimited by two start codes. The slice starts at
    /// the start code.
    Unit(&'a [u8]),
    /// The final NAL unit, delimited by a start code and the end of the
    /// packet.
    Eof(&'a [u8]),
}

/// Scans a packet for 0x000001 start codes and hands out the NAL units they
/// delimit, in encounter order.
///
/// Only the three-byte start code is recognized; the zero_byte of a four-byte
/// start code is treated as trailing padding of the preceding unit.
pub struct NaluScanner<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> NaluScanner<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(packet),
        }
    }

    fn find_start_code(&self) -> Option<usize> {
        let pos = self.cursor.position() as usize;
        self.cursor
            .chunk()
            .windows(START_CODE_LEN)
            .position(|window| window == [0x00, 0x00, 0x01])
            .map(|offset| pos + offset)
    }

    /// Advances to the next NAL unit. The returned slice spans from the start
    /// code up to (not including) the next start code or the packet end.
    pub fn next_unit(&mut self) -> NalScan<'a> {
        let data = *self.cursor.get_ref();

        let curr_start = match self.find_start_code() {
            Some(offset) => offset,
            None => return NalScan::NotFound,
        };

        self.cursor.set_position((curr_start + START_CODE_LEN) as u64);

        match self.find_start_code() {
            Some(next_start) => {
                self.cursor.set_position(next_start as u64);
                NalScan::Unit(&data[curr_start..next_start])
            }
            None => {
                self.cursor.set_position(data.len() as u64);
                NalScan::Eof(&data[curr_start..])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        // VPS: type 32, layer 0, temporal_id_plus1 1.
        let header = NaluHeader::parse(&[0x40, 0x01]).unwrap();
        assert_eq!(header.type_, NaluType::VpsNut);
        assert_eq!(header.nuh_layer_id, 0);
        assert_eq!(header.nuh_temporal_id_plus1, 1);

        // IDR_W_RADL: type 19.
        let header = NaluHeader::parse(&[0x26, 0x01]).unwrap();
        assert_eq!(header.type_, NaluType::IdrWRadl);
        assert!(header.type_.is_idr());
        assert!(header.type_.is_irap());
        assert!(header.type_.is_slice());

        assert!(NaluHeader::parse(&[0x40]).is_err());
    }

    #[test]
    fn type_categories() {
        assert!(NaluType::BlaWLp.is_bla());
        assert!(NaluType::BlaNLp.is_bla());
        assert!(!NaluType::CraNut.is_bla());
        assert!(NaluType::CraNut.is_irap());
        assert!(NaluType::CraNut.is_slice());
        assert!(NaluType::TrailR.is_slice());
        assert!(!NaluType::RsvVclN10.is_slice());
        assert!(!NaluType::SpsNut.is_slice());
    }

    #[test]
    fn scan_two_units() {
        let packet = [
            0x00, 0x00, 0x01, 0x40, 0x01, 0xaa, // VPS
            0x00, 0x00, 0x01, 0x42, 0x01, 0xbb, 0xcc, // SPS
        ];
        let mut scanner = NaluScanner::new(&packet);

        assert_eq!(scanner.next_unit(), NalScan::Unit(&packet[0..6]));
        assert_eq!(scanner.next_unit(), NalScan::Eof(&packet[6..]));
        assert_eq!(scanner.next_unit(), NalScan::NotFound);
    }

    #[test]
    fn scan_no_start_code() {
        let mut scanner = NaluScanner::new(&[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(scanner.next_unit(), NalScan::NotFound);

        let mut scanner = NaluScanner::new(&[]);
        assert_eq!(scanner.next_unit(), NalScan::NotFound);
    }

    // A four-byte start code is a zero_byte followed by the three-byte
    // pattern; the unit slice starts at the pattern.
    #[test]
    fn scan_four_byte_start_code() {
        let packet = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xaa, 0x00, 0x00, 0x00, 0x01, 0x42, 0x01,
        ];
        let mut scanner = NaluScanner::new(&packet);

        assert_eq!(scanner.next_unit(), NalScan::Unit(&packet[1..8]));
        assert_eq!(scanner.next_unit(), NalScan::Eof(&packet[8..]));
    }
}
