//! PNG output: an 8-bit RGB encoder and the grayscale texture built
//! from a raw volume.

use crate::MedreconErr;
use byteorder::{BigEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use log::debug;
use std::io::Write;

/// The eight signature bytes every PNG file starts with.
pub const SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// IHDR color type for truecolor without alpha.
const COLOR_TYPE_RGB: u8 = 2;

/// Append a chunk: length, type, data, CRC over type and data.
fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) -> Result<(), MedreconErr> {
  let len =
    u32::try_from(data.len()).map_err(|_| MedreconErr::new_too_large("PNG chunk", data.len()))?;

  out.write_u32::<BigEndian>(len)?;
  out.extend_from_slice(kind);
  out.extend_from_slice(data);

  let mut crc = Crc::new();
  crc.update(kind);
  crc.update(data);
  out.write_u32::<BigEndian>(crc.sum())?;

  Ok(())
}

/// Encode an 8-bit RGB image as PNG.
///
/// Every row uses filter type 0 and all rows go into a single IDAT
/// chunk.
///
/// # Arguments
///
/// * `rgb` - `height` rows of `width * 3` bytes.
///
/// # Returns
///
/// The PNG file, or [an error](MedreconErr) if `rgb` does not hold
/// exactly `width * height * 3` bytes.
pub fn encode_rgb(width: usize, height: usize, rgb: &[u8]) -> Result<Vec<u8>, MedreconErr> {
  let expected = width.checked_mul(height).and_then(|n| n.checked_mul(3));
  if expected != Some(rgb.len()) {
    return Err(MedreconErr::new_data_size_mismatch(rgb.len(), expected.unwrap_or(usize::MAX)));
  }

  let too_large = || MedreconErr::new_too_large("PNG image", rgb.len());
  let w = u32::try_from(width).map_err(|_| too_large())?;
  let h = u32::try_from(height).map_err(|_| too_large())?;

  let mut scanlines = Vec::with_capacity(height * (width * 3 + 1));
  for row in rgb.chunks_exact((width * 3).max(1)).take(height) {
    scanlines.push(0);
    scanlines.extend_from_slice(row);
  }

  let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
  encoder.write_all(&scanlines)?;
  let compressed = encoder.finish()?;

  let mut ihdr = Vec::with_capacity(13);
  ihdr.write_u32::<BigEndian>(w)?;
  ihdr.write_u32::<BigEndian>(h)?;
  ihdr.extend_from_slice(&[8, COLOR_TYPE_RGB, 0, 0, 0]);

  let mut png = Vec::with_capacity(SIGNATURE.len() + 3 * 12 + ihdr.len() + compressed.len());
  png.extend_from_slice(&SIGNATURE);
  write_chunk(&mut png, b"IHDR", &ihdr)?;
  write_chunk(&mut png, b"IDAT", &compressed)?;
  write_chunk(&mut png, b"IEND", &[])?;

  debug!("Encoded {}x{} PNG ({} bytes)", width, height, png.len());
  Ok(png)
}

/// Average `z_count` planes of `height * width` values, then stretch
/// the result to `0..=255`.
///
/// A constant image maps to all zeros.
pub fn luminance(raw: &[f32], z_count: usize, height: usize, width: usize) -> Vec<u8> {
  let plane_size = height * width;
  let mut mean = vec![0.0f32; plane_size];

  for plane in raw.chunks_exact(plane_size.max(1)).take(z_count) {
    for (acc, v) in mean.iter_mut().zip(plane) {
      *acc += v;
    }
  }

  if z_count > 0 {
    for acc in &mut mean {
      *acc /= z_count as f32;
    }
  }

  let lo = mean.iter().copied().fold(f32::INFINITY, f32::min);
  let hi = mean.iter().copied().fold(f32::NEG_INFINITY, f32::max);

  mean
    .iter()
    .map(|&v| {
      let t = if hi > lo { (v - lo) / (hi - lo) } else { 0.0 };
      (t * 255.0).round() as u8
    })
    .collect()
}

/// Encode the z-averaged luminance of a volume as a gray RGB PNG.
pub fn texture(
  raw: &[f32],
  z_count: usize,
  height: usize,
  width: usize,
) -> Result<Vec<u8>, MedreconErr> {
  let gray = luminance(raw, z_count, height, width);
  let rgb: Vec<u8> = gray.iter().flat_map(|&g| [g, g, g]).collect();
  encode_rgb(width, height, &rgb)
}

#[cfg(test)]
mod png_tests {
  use super::*;
  use byteorder::ReadBytesExt;
  use flate2::read::ZlibDecoder;
  use std::io::Read;

  /// Split a PNG into `(type, data)` chunks, checking each CRC.
  fn chunks(png: &[u8]) -> Vec<([u8; 4], Vec<u8>)> {
    assert_eq!(&png[..8], &SIGNATURE);

    let mut out = Vec::new();
    let mut rest = &png[8..];
    while !rest.is_empty() {
      let len = (&rest[..4]).read_u32::<BigEndian>().unwrap() as usize;
      let kind: [u8; 4] = rest[4..8].try_into().unwrap();
      let data = rest[8..8 + len].to_vec();
      let stored = (&rest[8 + len..12 + len]).read_u32::<BigEndian>().unwrap();

      let mut crc = Crc::new();
      crc.update(&kind);
      crc.update(&data);
      assert_eq!(crc.sum(), stored);

      out.push((kind, data));
      rest = &rest[12 + len..];
    }
    out
  }

  #[test]
  fn chunk_layout() {
    let png = encode_rgb(2, 1, &[1, 2, 3, 4, 5, 6]).unwrap();
    let chunks = chunks(&png);
    let kinds: Vec<_> = chunks.iter().map(|(kind, _)| kind).collect();
    assert_eq!(kinds, vec![b"IHDR", b"IDAT", b"IEND"]);

    assert_eq!(chunks[0].1, vec![0, 0, 0, 2, 0, 0, 0, 1, 8, 2, 0, 0, 0]);
    assert!(chunks[2].1.is_empty());

    let mut scanlines = Vec::new();
    ZlibDecoder::new(&chunks[1].1[..]).read_to_end(&mut scanlines).unwrap();
    assert_eq!(scanlines, vec![0, 1, 2, 3, 4, 5, 6]);
  }

  #[test]
  fn luminance_averages_and_stretches() {
    // Two planes of two voxels: means are 1 and 3.
    assert_eq!(luminance(&[0.0, 2.0, 2.0, 4.0], 2, 1, 2), vec![0, 255]);
    assert_eq!(luminance(&[0.0, 1.0, 2.0], 1, 1, 3), vec![0, 128, 255]);
  }

  #[test]
  fn constant_image_is_black() {
    assert_eq!(luminance(&[7.0; 4], 1, 2, 2), vec![0; 4]);
  }

  #[test]
  fn texture_is_gray() {
    let png = texture(&[0.0, 10.0], 1, 1, 2).unwrap();
    let chunks = chunks(&png);

    let mut scanlines = Vec::new();
    ZlibDecoder::new(&chunks[1].1[..]).read_to_end(&mut scanlines).unwrap();
    assert_eq!(scanlines, vec![0, 0, 0, 0, 255, 255, 255]);
  }

  #[test]
  fn rgb_size_checked() {
    let err = encode_rgb(2, 2, &[0; 11]).unwrap_err();
    assert!(matches!(err, MedreconErr::DataSizeMismatch { actual: 11, expected: 12 }));
    assert!(encode_rgb(usize::MAX, 2, &[]).is_err());
  }
}
