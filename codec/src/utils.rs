// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Generate random string, used as a default client id.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// No chars.
    IsEmpty,

    /// Larger than 23 chars.
    ///
    /// The Server MAY allow `ClientId`s that contain more than 23 encoded
    /// bytes, but this codec keeps to the conservative limit quoted in
    /// [MQTT-3.1.3-5] so identifiers stay interoperable across brokers.
    TooLong,

    /// Can only contain 0-9a-zA-Z.
    InvalidChars,
}

/// Maximum length of a `ClientId`, in bytes, accepted by this codec.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Validate a client identifier before it is placed into a CONNECT packet.
///
/// # Errors
///
/// Returns error if `client_id` is empty, too long, or contains characters
/// outside of `0-9a-zA-Z`.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ClientIdError::TooLong);
    }
    if !client_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Bytes are not valid UTF-8.
    InvalidUtf8,

    /// String contains the disallowed U+0000 null character [MQTT-1.5.4-2].
    ContainsNull,

    /// String is longer than 65535 bytes and cannot be length-prefixed.
    TooLong,
}

/// Convert a raw byte slice into an owned `String`, rejecting ill-formed UTF-8.
///
/// # Errors
///
/// Returns error if `bytes` is not valid UTF-8.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    String::from_utf8(bytes.to_vec()).map_err(|_err| StringError::InvalidUtf8)
}

/// Validate a string destined for a UTF-8 Encoded String field.
///
/// # Errors
///
/// Returns error if `s` contains a null character or is too long to be
/// length-prefixed on the wire.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.contains('\u{0000}') {
        return Err(StringError::ContainsNull);
    }
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooLong);
    }
    Ok(())
}

/// Validate a binary data field, whose length is sent as a two byte integer.
///
/// # Errors
///
/// Returns error if `data` is too long to be length-prefixed on the wire.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), crate::EncodeError> {
    if data.len() > usize::from(u16::MAX) {
        return Err(crate::EncodeError::TooManyData);
    }
    Ok(())
}
