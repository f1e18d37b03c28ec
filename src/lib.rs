// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Annex B h.265 bitstream syntax parser.
//!
//! This crate ingests raw HEVC byte streams, locates NAL units, strips
//! emulation-prevention bytes, and decodes VPS/SPS/PPS parameter sets and
//! slice segment headers, deriving the picture-order-count state needed to
//! configure a downstream hardware decoder. Entropy decoding of slice
//! payloads and pixel reconstruction are out of scope; the parser stops at
//! the syntax layer.
//!
//! The entry point is [`parser::Parser`], which consumes whole Annex B
//! packets and reports a [`format::VideoFormat`] summary through a sequence
//! callback whenever a new SPS becomes active.

pub mod bit_reader;
pub mod format;
pub mod nalu;
pub mod parser;
pub mod rbsp;

use thiserror::Error;

/// Errors surfaced by packet-level parsing.
#[derive(Debug, Error)]
pub enum ParserError {
    /// The packet contains no Annex B start code.
    #[error("no start code found in the packet data")]
    NotFound,
    /// Malformed syntax: a bad emulation-prevention sequence, an out-of-range
    /// id, or a truncated RBSP during a required read.
    #[error("malformed bitstream: {0:#}")]
    InvalidFormat(#[from] anyhow::Error),
    /// The stream uses a feature outside the implemented set.
    #[error("unsupported stream feature: {0}")]
    NotSupported(String),
}

pub type ParserResult<T> = std::result::Result<T, ParserError>;
