// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFB wire protocol constants, structures, and codecs.
//!
//! Covers only what this server implements: ProtocolVersion negotiation
//! across versions 3/7/8, the "None" security type, `ClientInit`/`ServerInit`,
//! the six client message types, and the Raw-encoded `FramebufferUpdate`.

use crate::error::{Result, VncError};
use bytes::{Buf, BufMut, BytesMut};

/// Length in bytes of a ProtocolVersion handshake line.
pub const PROTOCOL_VERSION_LEN: usize = 12;

/// RFB protocol minor version, restricted to the versions this server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// RFB 3.3 — security type sent unconditionally, no `SecurityResult`.
    V3,
    /// RFB 3.7 — client picks from an offered security type list.
    V7,
    /// RFB 3.8 — like v7, plus an explicit `SecurityResult`.
    V8,
}

impl ProtocolVersion {
    /// Encodes the 12-byte `RFB 003.00{3,7,8}\n` line this server offers.
    #[must_use]
    pub fn encode(self) -> [u8; PROTOCOL_VERSION_LEN] {
        let mut buf = *b"RFB 003.008\n";
        buf[10] = match self {
            ProtocolVersion::V3 => b'3',
            ProtocolVersion::V7 => b'7',
            ProtocolVersion::V8 => b'8',
        };
        buf
    }

    /// Decodes a 12-byte ProtocolVersion line from the client.
    ///
    /// A well-formed `RFB 003.0?\n` line with an unrecognized digit falls
    /// back to [`ProtocolVersion::V3`], matching how real VNC servers accept
    /// version strings they don't specifically know as a pre-3.x client.
    /// Anything not shaped like `RFB 003.00?\n` is a protocol error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != PROTOCOL_VERSION_LEN {
            return Err(VncError::protocol("invalid ProtocolVersion length"));
        }
        if &buf[0..10] != b"RFB 003.00" || buf[11] != b'\n' {
            return Err(VncError::protocol(format!(
                "invalid ProtocolVersion message: {:?}",
                String::from_utf8_lossy(buf)
            )));
        }
        Ok(match buf[10] {
            b'8' => ProtocolVersion::V8,
            b'7' => ProtocolVersion::V7,
            _ => ProtocolVersion::V3,
        })
    }
}

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Message type: Client specifies supported encodings.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Message type: Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Message type: Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Message type: Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

/// Encoding type: Raw pixel data. The only encoding this server emits.
pub const ENCODING_RAW: i32 = 0;

// Security Types

/// Security type: None (no authentication).
pub const SECURITY_TYPE_NONE: u8 = 1;

// Security Results

/// Security result: Authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// The pixel format negotiated between server and client for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel: 8, 16, or 32.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// True if pixel data is big-endian.
    pub big_endian_flag: u8,
    /// True if true-color (false means colormapped / indexed).
    pub true_colour_flag: u8,
    /// Maximum red color value (one less than a power of two).
    pub red_max: u16,
    /// Maximum green color value.
    pub green_max: u16,
    /// Maximum blue color value.
    pub blue_max: u16,
    /// Bit shift to the red component.
    pub red_shift: u8,
    /// Bit shift to the green component.
    pub green_shift: u8,
    /// Bit shift to the blue component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The fixed pixel format this server offers in `ServerInit`: 32bpp,
    /// depth 24, little-endian, true-color, RGB888 in the low 24 bits.
    #[must_use]
    pub fn server_default() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Validates a client-supplied `SetPixelFormat` body.
    ///
    /// Rejects anything that could not be represented by
    /// [`crate::framebuffer::Framebuffer`]: bpp outside {8,16,32}, a depth of
    /// zero or over 32, or channel masks that would overflow the depth.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.bits_per_pixel != 8 && self.bits_per_pixel != 16 && self.bits_per_pixel != 32 {
            return false;
        }
        if self.depth == 0 || self.depth > 32 {
            return false;
        }
        if self.true_colour_flag == 0 {
            return self.bits_per_pixel == 8;
        }

        let bits_needed = |max: u16| -> u32 {
            if max == 0 {
                0
            } else {
                16 - max.leading_zeros()
            }
        };
        let total = bits_needed(self.red_max) + bits_needed(self.green_max) + bits_needed(self.blue_max);
        total <= u32::from(self.depth)
    }

    /// Serializes into the 16-byte RFB pixel format record.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Parses a 16-byte RFB pixel format record.
    pub fn from_bytes(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 16 {
            return Err(VncError::protocol("truncated PixelFormat"));
        }
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// The `ServerInit` message sent once, right after the handshake completes.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's fixed pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name.
    pub name: String,
}

impl ServerInit {
    /// Serializes: width, height, pixel format, name length, name bytes.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// A decoded client-to-server message.
#[derive(Debug)]
pub enum ClientMessage {
    /// `SetPixelFormat`.
    SetPixelFormat(PixelFormat),
    /// `SetEncodings`; only [`ENCODING_RAW`] has any effect on this server.
    SetEncodings(Vec<i32>),
    /// `FramebufferUpdateRequest`. `incremental` is decoded but intentionally
    /// not honored — every request yields the full requested rectangle.
    FramebufferUpdateRequest {
        /// Incremental flag as sent by the client (not honored).
        incremental: bool,
        /// X coordinate of the requested region.
        x: u16,
        /// Y coordinate of the requested region.
        y: u16,
        /// Width of the requested region.
        width: u16,
        /// Height of the requested region.
        height: u16,
    },
    /// `KeyEvent`.
    KeyEvent {
        /// True if pressed.
        down: bool,
        /// X11 keysym.
        key: u32,
    },
    /// `PointerEvent`.
    PointerEvent {
        /// Button mask.
        button_mask: u8,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
    },
    /// `ClientCutText`.
    ClientCutText(String),
}

/// A `FramebufferUpdate` rectangle header (Raw encoding only).
#[derive(Debug)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header: x, y, w, h, encoding=Raw.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(ENCODING_RAW);
    }
}

/// Encodes a `ServerCutText` message: type byte, 3 pad, u32 length, text
/// bytes. Mirrors `ClientCutText`'s wire shape in the other direction.
pub fn encode_server_cut_text(text: &str) -> BytesMut {
    let bytes = text.as_bytes();
    let mut buf = BytesMut::with_capacity(8 + bytes.len());
    buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
    buf.put_bytes(0, 3);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_round_trips() {
        for v in [ProtocolVersion::V3, ProtocolVersion::V7, ProtocolVersion::V8] {
            let bytes = v.encode();
            assert_eq!(ProtocolVersion::decode(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn protocol_version_falls_back_to_v3() {
        let bytes = b"RFB 003.005\n";
        assert_eq!(ProtocolVersion::decode(bytes).unwrap(), ProtocolVersion::V3);
    }

    #[test]
    fn protocol_version_rejects_malformed() {
        assert!(ProtocolVersion::decode(b"garbage12345").is_err());
    }

    #[test]
    fn pixel_format_round_trips() {
        let pf = PixelFormat::server_default();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let decoded = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(decoded, pf);
    }

    #[test]
    fn pixel_format_validity() {
        assert!(PixelFormat::server_default().is_valid());
        let mut bad = PixelFormat::server_default();
        bad.bits_per_pixel = 24;
        assert!(!bad.is_valid());
    }

    #[test]
    fn server_cut_text_wire_shape() {
        let buf = encode_server_cut_text("hi");
        assert_eq!(
            &buf[..],
            &[SERVER_MSG_SERVER_CUT_TEXT, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']
        );
    }
}
