//! The embedded round-trip payload: a self-describing copy of an
//! archive hidden inside a foreign container.
//!
//! Layout: [`MAGIC`], then the length of the body as a little-endian
//! `u64`, then the archive bytes as base64 text. The payload is found
//! again by scanning for the magic at every byte offset, so the
//! container never needs to record where it put it.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

/// Marks the start of an embedded payload.
pub const MAGIC: &[u8; 17] = b"MEDRECON-NPZ-V1:\0";

/// Size of the magic plus the length field.
const PREFIX_LEN: usize = MAGIC.len() + 8;

/// Decodes bodies with or without padding. Whitespace and anything from
/// the first `=` on are removed beforehand.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
  &alphabet::STANDARD,
  GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true),
);

/// Wrap archive bytes into a payload.
pub fn pack(archive: &[u8]) -> Vec<u8> {
  let body = STANDARD.encode(archive);

  let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
  out.extend_from_slice(MAGIC);
  out.extend_from_slice(&(body.len() as u64).to_le_bytes());
  out.extend_from_slice(body.as_bytes());
  out
}

/// Unwrap a payload that starts at the first byte of `stream`.
///
/// # Returns
///
/// The archive bytes, or `None` if the magic does not match, the
/// length runs past the end of `stream`, or the body is not base64.
pub fn unpack(stream: &[u8]) -> Option<Vec<u8>> {
  if stream.len() < PREFIX_LEN || !stream.starts_with(MAGIC) {
    return None;
  }

  let length = LittleEndian::read_u64(&stream[MAGIC.len()..PREFIX_LEN]);
  let remaining = (stream.len() - PREFIX_LEN) as u64;
  if length > remaining {
    debug!("Payload length {} exceeds the {} bytes remaining", length, remaining);
    return None;
  }

  decode_body(&stream[PREFIX_LEN..PREFIX_LEN + length as usize])
}

/// Decode base64 text, skipping ASCII whitespace and stopping at the
/// first `=`.
fn decode_body(body: &[u8]) -> Option<Vec<u8>> {
  let text: Vec<u8> = body
    .iter()
    .copied()
    .take_while(|&byte| byte != b'=')
    .filter(|byte| !byte.is_ascii_whitespace())
    .collect();

  match LENIENT.decode(&text) {
    Ok(archive) => Some(archive),
    Err(e) => {
      debug!("Payload body is not base64: {}", e);
      None
    }
  }
}

/// Find the first payload anywhere in `bytes` and unwrap it.
///
/// Only the first occurrence of the magic is tried.
pub fn scan_and_unpack(bytes: &[u8]) -> Option<Vec<u8>> {
  let offset = bytes.windows(MAGIC.len()).position(|window| window == MAGIC)?;
  debug!("Found payload magic at offset {}", offset);

  let archive = unpack(&bytes[offset..]);
  if archive.is_none() {
    warn!("Payload magic at offset {} does not hold a valid payload", offset);
  }

  archive
}

#[cfg(test)]
mod payload_tests {
  use super::*;

  #[test]
  fn pack_layout() {
    let packed = pack(b"abc");
    assert!(packed.starts_with(MAGIC));
    assert_eq!(LittleEndian::read_u64(&packed[17..25]), 4);
    assert_eq!(&packed[25..], b"YWJj");
    assert_eq!(unpack(&packed).unwrap(), b"abc");
  }

  #[test]
  fn unpack_needs_magic_at_start() {
    let mut packed = vec![0];
    packed.extend(pack(b"abc"));
    assert_eq!(unpack(&packed), None);
  }

  #[test]
  fn unpack_rejects_overlong_length() {
    let mut packed = pack(b"abcdef");
    packed.truncate(packed.len() - 1);
    assert_eq!(unpack(&packed), None);
  }

  #[test]
  fn scan_at_odd_offsets() {
    for prefix_len in [0, 1, 3, 7, 130] {
      let mut host = vec![0xAB; prefix_len];
      host.extend(pack(b"hello archive"));
      host.extend_from_slice(&[0, 0, 0]);
      assert_eq!(scan_and_unpack(&host).unwrap(), b"hello archive");
    }
  }

  #[test]
  fn rfc4648_vectors() {
    let vectors = [
      ("", ""),
      ("f", "Zg=="),
      ("fo", "Zm8="),
      ("foo", "Zm9v"),
      ("foob", "Zm9vYg=="),
      ("fooba", "Zm9vYmE="),
      ("foobar", "Zm9vYmFy"),
    ];

    for (plain, encoded) in vectors {
      let packed = pack(plain.as_bytes());
      assert_eq!(&packed[PREFIX_LEN..], encoded.as_bytes());
      assert_eq!(decode_body(encoded.as_bytes()).unwrap(), plain.as_bytes());
    }
  }

  #[test]
  fn body_skips_whitespace() {
    assert_eq!(decode_body(b"Zm9v\r\nYm Fy").unwrap(), b"foobar");
  }

  #[test]
  fn body_stops_at_padding() {
    assert_eq!(decode_body(b"Zg==trailing garbage!").unwrap(), b"f");
    assert_eq!(decode_body(b"Zm8").unwrap(), b"fo");
  }

  #[test]
  fn body_rejects_foreign_bytes() {
    assert_eq!(decode_body(b"Zm9v*mFy"), None);

    let mut packed = pack(b"foobar");
    let last = packed.len() - 1;
    packed[last] = b'*';
    assert_eq!(unpack(&packed), None);
  }

  #[test]
  fn binary_round_trip() {
    let input: Vec<u8> = (0..=255).collect();
    assert_eq!(unpack(&pack(&input)).unwrap(), input);
  }

  #[test]
  fn scan_without_payload() {
    assert_eq!(scan_and_unpack(b"nothing to see here"), None);
    assert_eq!(scan_and_unpack(&MAGIC[..10]), None);
  }

  #[test]
  fn scan_uses_first_match() {
    let mut host = MAGIC.to_vec();
    host.extend_from_slice(&u64::MAX.to_le_bytes());
    host.extend(pack(b"second"));
    assert_eq!(scan_and_unpack(&host), None);
  }
}
