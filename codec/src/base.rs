// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{ByteArray, DecodeError, EncodeError};

/// Protocol name field present in every CONNECT packet, spelled exactly
/// "MQTT" in MQTT 3.1.1 and 5.0 [MQTT-3.1.2-1].
pub const PROTOCOL_NAME: &str = "MQTT";

pub trait EncodePacket {
    /// Encode this struct/enum into buffer and return the number of bytes written.
    ///
    /// # Errors
    /// Returns error if struct/enum is invalid.
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

pub trait DecodePacket: Sized {
    /// Decode struct/enum from bytes array.
    ///
    /// # Errors
    /// Returns error if bytes array is invalid, or contains invalid data.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}
