//! A minimal DICOM codec for single-frame 16-bit grayscale images.
//!
//! Files are written as explicit VR little endian with a private tag
//! carrying an [embedded payload](crate::payload) of the source
//! archive. Decoding prefers that payload and only falls back to
//! Rows/Columns/PixelData when it is absent.

use crate::array::VoxelArray;
use crate::npz::LabeledArchive;
use crate::payload;
use crate::MedreconErr;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{debug, trace};
use uuid::Uuid;

/// Length of the preamble before the `DICM` marker.
const PREAMBLE_LEN: usize = 128;

/// Offset of the first element.
const BODY_START: usize = PREAMBLE_LEN + 4;

/// Explicit VR little endian.
const TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

/// Secondary Capture Image Storage.
const SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

const IMPLEMENTATION_VERSION: &str = "MEDRECON_010";

/// Owner of the private block holding the payload.
const PRIVATE_CREATOR: &str = "MEDRECON";

/// Archive key under which fallback decoding stores the pixels.
pub const FALLBACK_KEY: &str = "image";

/// A data element tag.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Tag(pub u16, pub u16);

/// Tags read or written by the codec.
#[allow(missing_docs)]
pub mod tags {
  use super::Tag;

  pub const FILE_META_GROUP_LENGTH: Tag = Tag(0x0002, 0x0000);
  pub const FILE_META_VERSION: Tag = Tag(0x0002, 0x0001);
  pub const MEDIA_STORAGE_SOP_CLASS_UID: Tag = Tag(0x0002, 0x0002);
  pub const MEDIA_STORAGE_SOP_INSTANCE_UID: Tag = Tag(0x0002, 0x0003);
  pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
  pub const IMPLEMENTATION_CLASS_UID: Tag = Tag(0x0002, 0x0012);
  pub const IMPLEMENTATION_VERSION_NAME: Tag = Tag(0x0002, 0x0013);
  pub const SOP_CLASS_UID: Tag = Tag(0x0008, 0x0016);
  pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
  pub const MODALITY: Tag = Tag(0x0008, 0x0060);
  pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
  pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
  pub const PRIVATE_CREATOR: Tag = Tag(0x0011, 0x0010);
  pub const PRIVATE_PAYLOAD: Tag = Tag(0x0011, 0x1010);
  pub const SAMPLES_PER_PIXEL: Tag = Tag(0x0028, 0x0002);
  pub const PHOTOMETRIC_INTERPRETATION: Tag = Tag(0x0028, 0x0004);
  pub const ROWS: Tag = Tag(0x0028, 0x0010);
  pub const COLUMNS: Tag = Tag(0x0028, 0x0011);
  pub const BITS_ALLOCATED: Tag = Tag(0x0028, 0x0100);
  pub const BITS_STORED: Tag = Tag(0x0028, 0x0101);
  pub const HIGH_BIT: Tag = Tag(0x0028, 0x0102);
  pub const PIXEL_REPRESENTATION: Tag = Tag(0x0028, 0x0103);
  pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);
}

/// Value representations whose length field is 4 bytes, preceded by
/// 2 reserved bytes.
fn has_long_length(vr: [u8; 2]) -> bool {
  matches!(&vr, b"OB" | b"OW" | b"OF" | b"SQ" | b"UT" | b"UN")
}

/// Value representations padded with a space rather than a zero byte.
fn is_text(vr: [u8; 2]) -> bool {
  matches!(
    &vr,
    b"AE" | b"AS" | b"CS" | b"DA" | b"DS" | b"DT" | b"IS" | b"LO" | b"LT" | b"PN" | b"SH" | b"ST"
      | b"TM" | b"UC" | b"UR" | b"UT"
  )
}

/// Append one explicit VR little endian element.
///
/// Odd-length values are padded to even length.
pub fn write_element(
  out: &mut Vec<u8>,
  tag: Tag,
  vr: [u8; 2],
  value: &[u8],
) -> Result<(), MedreconErr> {
  let padded_len = value.len() + value.len() % 2;

  out.write_u16::<LittleEndian>(tag.0)?;
  out.write_u16::<LittleEndian>(tag.1)?;
  out.extend_from_slice(&vr);

  if has_long_length(vr) {
    let len = u32::try_from(padded_len)
      .map_err(|_| MedreconErr::new_too_large("DICOM value", padded_len))?;
    out.write_u16::<LittleEndian>(0)?;
    out.write_u32::<LittleEndian>(len)?;
  } else {
    let len = u16::try_from(padded_len)
      .map_err(|_| MedreconErr::new_too_large("DICOM value", padded_len))?;
    out.write_u16::<LittleEndian>(len)?;
  }

  out.extend_from_slice(value);
  if value.len() % 2 == 1 {
    out.push(if is_text(vr) { b' ' } else { 0 });
  }

  Ok(())
}

fn write_u16_element(out: &mut Vec<u8>, tag: Tag, value: u16) -> Result<(), MedreconErr> {
  write_element(out, tag, *b"US", &value.to_le_bytes())
}

/// A fresh UUID-derived UID (`2.25.<decimal uuid>`).
fn generate_uid() -> String {
  format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Encode a 2D image as a DICOM file.
///
/// The image is clamped to `u16`. `archive` is embedded verbatim in a
/// private tag so that [`decode`] can recover it without loss.
///
/// # Arguments
///
/// * `image` - An array that reduces to 2D (see
///   [`VoxelArray::extract_2d`]).
///
/// * `archive` - Bytes of the source `.npz` archive.
pub fn encode(image: &VoxelArray, archive: &[u8]) -> Result<Vec<u8>, MedreconErr> {
  let (rows, cols, values) =
    image.extract_2d().ok_or_else(|| MedreconErr::new_unsupported_shape(image.shape().to_vec()))?;

  let too_large = |_| MedreconErr::new_unsupported_shape(vec![rows, cols]);
  let rows16 = u16::try_from(rows).map_err(too_large)?;
  let cols16 = u16::try_from(cols).map_err(too_large)?;

  let instance_uid = generate_uid();
  let implementation_uid = generate_uid();

  // File meta group, preceded by its own group length.
  let mut meta = Vec::new();
  write_element(&mut meta, tags::FILE_META_VERSION, *b"OB", &[0x00, 0x01])?;
  write_element(&mut meta, tags::MEDIA_STORAGE_SOP_CLASS_UID, *b"UI", SOP_CLASS.as_bytes())?;
  write_element(&mut meta, tags::MEDIA_STORAGE_SOP_INSTANCE_UID, *b"UI", instance_uid.as_bytes())?;
  write_element(&mut meta, tags::TRANSFER_SYNTAX_UID, *b"UI", TRANSFER_SYNTAX.as_bytes())?;
  write_element(&mut meta, tags::IMPLEMENTATION_CLASS_UID, *b"UI", implementation_uid.as_bytes())?;
  write_element(
    &mut meta,
    tags::IMPLEMENTATION_VERSION_NAME,
    *b"SH",
    IMPLEMENTATION_VERSION.as_bytes(),
  )?;

  let meta_len = u32::try_from(meta.len())
    .map_err(|_| MedreconErr::new_too_large("file meta", meta.len()))?;

  let mut pixels = vec![0; rows * cols * 2];
  for (chunk, value) in pixels.chunks_exact_mut(2).zip(&values) {
    // NaN casts to 0.
    LittleEndian::write_u16(chunk, value.round().clamp(0.0, f32::from(u16::MAX)) as u16);
  }

  let embedded = payload::pack(archive);

  let mut out = vec![0; PREAMBLE_LEN];
  out.extend_from_slice(b"DICM");
  write_element(&mut out, tags::FILE_META_GROUP_LENGTH, *b"UL", &meta_len.to_le_bytes())?;
  out.extend_from_slice(&meta);

  write_element(&mut out, tags::SOP_CLASS_UID, *b"UI", SOP_CLASS.as_bytes())?;
  write_element(&mut out, tags::SOP_INSTANCE_UID, *b"UI", instance_uid.as_bytes())?;
  write_element(&mut out, tags::MODALITY, *b"CS", b"OT")?;
  write_element(&mut out, tags::PATIENT_NAME, *b"PN", b"Anonymous")?;
  write_element(&mut out, tags::PATIENT_ID, *b"LO", b"000000")?;
  write_element(&mut out, tags::PRIVATE_CREATOR, *b"LO", PRIVATE_CREATOR.as_bytes())?;
  write_element(&mut out, tags::PRIVATE_PAYLOAD, *b"OB", &embedded)?;
  write_u16_element(&mut out, tags::SAMPLES_PER_PIXEL, 1)?;
  write_element(&mut out, tags::PHOTOMETRIC_INTERPRETATION, *b"CS", b"MONOCHROME2")?;
  write_u16_element(&mut out, tags::ROWS, rows16)?;
  write_u16_element(&mut out, tags::COLUMNS, cols16)?;
  write_u16_element(&mut out, tags::BITS_ALLOCATED, 16)?;
  write_u16_element(&mut out, tags::BITS_STORED, 16)?;
  write_u16_element(&mut out, tags::HIGH_BIT, 15)?;
  write_u16_element(&mut out, tags::PIXEL_REPRESENTATION, 0)?;
  write_element(&mut out, tags::PIXEL_DATA, *b"OW", &pixels)?;

  debug!(
    "Encoded {}x{} DICOM image ({} bytes, payload {} bytes)",
    rows,
    cols,
    out.len(),
    embedded.len()
  );
  Ok(out)
}

/// One element found while walking a data set.
#[derive(Debug)]
struct Element<'b> {
  tag: Tag,
  value: &'b [u8],
}

/// Walk elements from `offset` until the end of the buffer or the
/// first PixelData element, whichever comes first.
///
/// A PixelData value that runs past the end of the buffer is cut
/// short rather than rejected, so that the caller can report exactly
/// how much is missing.
fn walk(bytes: &[u8], mut offset: usize) -> Result<Vec<Element<'_>>, MedreconErr> {
  let mut elements = Vec::new();

  while offset < bytes.len() {
    if bytes.len() - offset < 8 {
      return Err(MedreconErr::new_truncated("DICOM element header", 8, bytes.len() - offset));
    }

    let tag =
      Tag(LittleEndian::read_u16(&bytes[offset..]), LittleEndian::read_u16(&bytes[offset + 2..]));
    let vr = [bytes[offset + 4], bytes[offset + 5]];
    if !vr.iter().all(u8::is_ascii_uppercase) {
      return Err(MedreconErr::new_invalid_vr(offset, vr));
    }

    let (len, header_len) = if has_long_length(vr) {
      if bytes.len() - offset < 12 {
        return Err(MedreconErr::new_truncated("DICOM element header", 12, bytes.len() - offset));
      }
      (LittleEndian::read_u32(&bytes[offset + 8..]), 12)
    } else {
      (u32::from(LittleEndian::read_u16(&bytes[offset + 6..])), 8)
    };

    if len == u32::MAX {
      return Err(MedreconErr::new_undefined_length(tag.0, tag.1));
    }

    let start = offset + header_len;
    let end = start + len as usize;
    let vr_text = String::from_utf8_lossy(&vr);
    trace!("DICOM element ({:04X},{:04X}) {} len {}", tag.0, tag.1, vr_text, len);

    if tag == tags::PIXEL_DATA {
      elements.push(Element { tag, value: &bytes[start..end.min(bytes.len())] });
      break;
    }

    if end > bytes.len() {
      let available = bytes.len() - start;
      return Err(MedreconErr::new_truncated("DICOM element value", end - start, available));
    }

    elements.push(Element { tag, value: &bytes[start..end] });
    offset = end;
  }

  Ok(elements)
}

/// Read the standard Rows/Columns/PixelData elements into a `u16`
/// array, ignoring any embedded payload.
pub fn decode_pixels(bytes: &[u8]) -> Result<VoxelArray, MedreconErr> {
  if bytes.len() < BODY_START {
    return Err(MedreconErr::new_truncated("DICOM preamble", BODY_START, bytes.len()));
  }

  if &bytes[PREAMBLE_LEN..BODY_START] != b"DICM" {
    return Err(MedreconErr::new_bad_magic("DICOM"));
  }

  let elements = walk(bytes, BODY_START)?;
  let find = |tag: Tag| {
    elements
      .iter()
      .find(|element| element.tag == tag)
      .map(|element| element.value)
      .ok_or(MedreconErr::MissingTag { group: tag.0, element: tag.1 })
  };

  let read_us = |tag: Tag| -> Result<usize, MedreconErr> {
    let value = find(tag)?;
    if value.len() < 2 {
      return Err(MedreconErr::new_truncated("DICOM US value", 2, value.len()));
    }
    Ok(usize::from(LittleEndian::read_u16(value)))
  };

  let rows = read_us(tags::ROWS)?;
  let cols = read_us(tags::COLUMNS)?;
  let pixel_data = find(tags::PIXEL_DATA)?;

  let expected = rows * cols * 2;
  if pixel_data.len() < expected {
    return Err(MedreconErr::new_truncated_pixel_data(pixel_data.len(), expected));
  }

  debug!("Decoded {}x{} DICOM pixels without payload", rows, cols);
  VoxelArray::new(
    vec![rows, cols],
    crate::array::ElementKind::U16,
    crate::array::Order::RowMajor,
    pixel_data[..expected].to_vec(),
  )
}

/// Decode a DICOM file back into an archive.
///
/// The embedded payload is returned unchanged when present. Otherwise
/// the pixels are read from the standard elements and returned as a
/// single `u16` entry named [`FALLBACK_KEY`].
pub fn decode(bytes: &[u8]) -> Result<LabeledArchive, MedreconErr> {
  if let Some(archive) = payload::scan_and_unpack(bytes) {
    match LabeledArchive::from_bytes(&archive) {
      Ok(archive) => return Ok(archive),
      Err(e) => debug!("Embedded payload is not a valid archive ({}), using pixel data", e),
    }
  }

  Ok(LabeledArchive::new().with(FALLBACK_KEY, decode_pixels(bytes)?))
}

#[cfg(test)]
mod dicom_tests {
  use super::*;

  /// A DICOM stream with only the elements the fallback path reads.
  fn bare(rows: u16, cols: u16, pixels: &[u8]) -> Vec<u8> {
    let mut out = vec![0; PREAMBLE_LEN];
    out.extend_from_slice(b"DICM");
    write_u16_element(&mut out, tags::ROWS, rows).unwrap();
    write_u16_element(&mut out, tags::COLUMNS, cols).unwrap();
    write_element(&mut out, tags::PIXEL_DATA, *b"OW", pixels).unwrap();
    out
  }

  #[test]
  fn element_padding() {
    let mut text = Vec::new();
    write_element(&mut text, tags::MODALITY, *b"CS", b"CTX").unwrap();
    assert_eq!(&text[6..8], &[4, 0]);
    assert_eq!(&text[8..], b"CTX ");

    let mut uid = Vec::new();
    write_element(&mut uid, tags::SOP_CLASS_UID, *b"UI", b"1.2.3").unwrap();
    assert_eq!(&uid[8..], b"1.2.3\0");
  }

  #[test]
  fn long_length_layout() {
    let mut out = Vec::new();
    write_element(&mut out, tags::PIXEL_DATA, *b"OW", &[1, 2, 3, 4]).unwrap();
    assert_eq!(&out[4..6], b"OW");
    assert_eq!(&out[6..8], &[0, 0]);
    assert_eq!(LittleEndian::read_u32(&out[8..12]), 4);
    assert_eq!(&out[12..], &[1, 2, 3, 4]);
  }

  #[test]
  fn fallback_decode() {
    let pixels: Vec<u8> = (0..32).collect();
    let array = decode_pixels(&bare(4, 4, &pixels)).unwrap();
    assert_eq!(array.shape(), &[4, 4]);
    assert_eq!(array.data(), pixels.as_slice());

    let archive = decode(&bare(4, 4, &pixels)).unwrap();
    assert_eq!(archive.get(FALLBACK_KEY), Some(&array));
  }

  #[test]
  fn truncated_pixel_data() {
    let err = decode_pixels(&bare(4, 4, &[0; 16])).unwrap_err();
    assert!(matches!(err, MedreconErr::TruncatedPixelData { actual: 16, expected: 32 }));
  }

  #[test]
  fn missing_rows() {
    let mut out = vec![0; PREAMBLE_LEN];
    out.extend_from_slice(b"DICM");
    write_u16_element(&mut out, tags::COLUMNS, 2).unwrap();
    write_element(&mut out, tags::PIXEL_DATA, *b"OW", &[0; 8]).unwrap();
    let err = decode_pixels(&out).unwrap_err();
    assert!(matches!(err, MedreconErr::MissingTag { group: 0x0028, element: 0x0010 }));
  }

  #[test]
  fn bad_marker() {
    let mut bytes = bare(1, 1, &[0, 0]);
    bytes[128] = b'X';
    assert!(matches!(decode_pixels(&bytes), Err(MedreconErr::BadMagic { .. })));
  }

  #[test]
  fn invalid_vr() {
    let mut bytes = bare(1, 1, &[0, 0]);
    bytes[BODY_START + 4] = b'u';
    assert!(matches!(decode_pixels(&bytes), Err(MedreconErr::InvalidVr { .. })));
  }

  #[test]
  fn encode_clamps_pixels() {
    let image = VoxelArray::from_f32(vec![2, 2], &[-5.0, 1.4, 70000.0, 3.0]).unwrap();
    let bytes = encode(&image, b"not an archive").unwrap();

    let pixels = decode_pixels(&bytes).unwrap();
    assert_eq!(pixels.to_f32_row_major(), vec![0.0, 1.0, 65535.0, 3.0]);

    // The payload is found, but it is not an archive, so decoding
    // falls back to the pixels.
    assert_eq!(payload::scan_and_unpack(&bytes).unwrap(), b"not an archive");
    assert_eq!(decode(&bytes).unwrap().get(FALLBACK_KEY), Some(&pixels));
  }

  #[test]
  fn encode_writes_even_lengths() {
    let image = VoxelArray::from_u16(vec![3, 3], &[7; 9]).unwrap();
    let bytes = encode(&image, &[1, 2, 3]).unwrap();
    assert_eq!(bytes.len() % 2, 0);
    assert!(walk(&bytes, BODY_START).is_ok());
  }
}
