// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! EBSP to RBSP conversion.
//!
//! Inside a NAL unit the sequences 0x000000, 0x000001 and 0x000002 must not
//! occur at byte-aligned positions, so encoders insert an emulation-prevention
//! byte (0x03) after every pair of zero bytes. This module removes them again.

use anyhow::anyhow;

/// Strips emulation-prevention bytes from `buf[..len]` in place and returns
/// the RBSP length.
///
/// A trailing lone 0x03 (the cabac_zero_word escape) is discarded without
/// error. A 0x03 escape followed by a byte greater than 0x03 means the
/// encapsulation is broken and the packet is rejected.
pub fn ebsp_to_rbsp(buf: &mut [u8], len: usize) -> anyhow::Result<usize> {
    let mut out = 0;
    let mut num_zeros = 0;
    let mut i = 0;

    while i < len {
        let byte = buf[i];
        if num_zeros == 2 && byte == 0x03 {
            if i + 1 == len {
                // cabac_zero_word: the final 0x03 of the NAL unit is dropped
                // and the last two RBSP bytes must be 0x0000.
                return Ok(out);
            }
            if buf[i + 1] > 0x03 {
                return Err(anyhow!(
                    "invalid emulation prevention sequence: 0x000003 followed by {:#04x}",
                    buf[i + 1]
                ));
            }
            num_zeros = 0;
            i += 1;
            continue;
        }

        num_zeros = if byte == 0x00 { num_zeros + 1 } else { 0 };
        buf[out] = byte;
        out += 1;
        i += 1;
    }

    Ok(out)
}
