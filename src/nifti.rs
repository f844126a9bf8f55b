//! A minimal NIfTI-1 codec for 2D and 3D float volumes.
//!
//! Files are single `.nii` streams (magic `n+1`) with an identity
//! sform and one private header extension (ecode 40) carrying an
//! [embedded payload](crate::payload) of the source archive.

use crate::array::{self, ElementKind, Order, VoxelArray};
use crate::npz::LabeledArchive;
use crate::payload;
use crate::MedreconErr;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// Size of the NIfTI-1 header.
pub const HEADER_SIZE: usize = 348;

/// Extension code reserved for private use.
pub const ECODE_PRIVATE: i32 = 40;

/// Archive key under which fallback decoding stores the voxels.
pub const FALLBACK_KEY: &str = "image";

const MAGIC: &[u8; 4] = b"n+1\0";

// Field offsets in the NIfTI-1 header.
const SIZEOF_HDR: usize = 0;
const REGULAR: usize = 38;
const DIM: usize = 40;
const DATATYPE: usize = 70;
const BITPIX: usize = 72;
const PIXDIM: usize = 76;
const VOX_OFFSET: usize = 108;
const SCL_SLOPE: usize = 112;
const XYZT_UNITS: usize = 123;
const DESCRIP: usize = 148;
const QFORM_CODE: usize = 252;
const SFORM_CODE: usize = 254;
const SROW_X: usize = 280;
const MAGIC_OFFSET: usize = 344;

const DT_UINT16: i16 = 512;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;

/// NIfTI-1 `NIFTI_XFORM_SCANNER_ANAT`.
const XFORM_SCANNER_ANAT: i16 = 1;

/// Millimetres, `NIFTI_UNITS_MM`.
const UNITS_MM: u8 = 2;

/// Round `n` up to a multiple of 16.
fn align16(n: usize) -> usize {
  (n + 15) & !15
}

/// Build the fixed 348-byte header for a float32 volume.
fn header(dims: [usize; 3], vox_offset: usize) -> Result<Vec<u8>, MedreconErr> {
  let mut hdr = vec![0u8; HEADER_SIZE];

  LittleEndian::write_i32(&mut hdr[SIZEOF_HDR..], HEADER_SIZE as i32);
  hdr[REGULAR] = b'r';

  LittleEndian::write_i16(&mut hdr[DIM..], 3);
  for (i, &dim) in dims.iter().enumerate() {
    let dim = i16::try_from(dim).map_err(|_| MedreconErr::new_unsupported_shape(dims.to_vec()))?;
    LittleEndian::write_i16(&mut hdr[DIM + 2 * (i + 1)..], dim);
  }
  for i in 4..8 {
    LittleEndian::write_i16(&mut hdr[DIM + 2 * i..], 1);
  }

  LittleEndian::write_i16(&mut hdr[DATATYPE..], DT_FLOAT32);
  LittleEndian::write_i16(&mut hdr[BITPIX..], 32);

  for i in 0..8 {
    LittleEndian::write_f32(&mut hdr[PIXDIM + 4 * i..], 1.0);
  }

  LittleEndian::write_f32(&mut hdr[VOX_OFFSET..], vox_offset as f32);
  LittleEndian::write_f32(&mut hdr[SCL_SLOPE..], 1.0);
  hdr[XYZT_UNITS] = UNITS_MM;

  let descrip = b"medrecon";
  hdr[DESCRIP..DESCRIP + descrip.len()].copy_from_slice(descrip);

  // Identity affine through the sform only.
  LittleEndian::write_i16(&mut hdr[QFORM_CODE..], 0);
  LittleEndian::write_i16(&mut hdr[SFORM_CODE..], XFORM_SCANNER_ANAT);
  for row in 0..3 {
    for col in 0..4 {
      let value = if row == col { 1.0 } else { 0.0 };
      LittleEndian::write_f32(&mut hdr[SROW_X + 16 * row + 4 * col..], value);
    }
  }

  hdr[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC);
  Ok(hdr)
}

/// Encode a 2D or 3D array as a NIfTI-1 file.
///
/// `dim[1..=3]` follow the array shape, a 2D array getting a trailing
/// dimension of 1, and voxels are written as float32 with the first
/// index varying fastest. `archive` is embedded in a private header
/// extension so that [`decode`] can recover it without loss.
pub fn encode(array: &VoxelArray, archive: &[u8]) -> Result<Vec<u8>, MedreconErr> {
  let dims = match *array.shape() {
    [rows, cols] => [rows, cols, 1],
    [z, rows, cols] => [z, rows, cols],
    _ => return Err(MedreconErr::new_unsupported_shape(array.shape().to_vec())),
  };

  let embedded = payload::pack(archive);

  // The extension size covers its own 8-byte header.
  let esize = align16(8 + embedded.len());
  let esize_i32 =
    i32::try_from(esize).map_err(|_| MedreconErr::new_too_large("NIfTI extension", esize))?;

  let vox_offset = align16(HEADER_SIZE + 4 + esize);
  let values = array.to_f32_col_major();

  let mut out = header(dims, vox_offset)?;
  out.extend_from_slice(&[1, 0, 0, 0]);

  let mut code = [0u8; 8];
  LittleEndian::write_i32(&mut code[..4], esize_i32);
  LittleEndian::write_i32(&mut code[4..], ECODE_PRIVATE);
  out.extend_from_slice(&code);
  out.extend_from_slice(&embedded);
  out.resize(vox_offset, 0);

  let start = out.len();
  out.resize(start + values.len() * 4, 0);
  LittleEndian::write_f32_into(&values, &mut out[start..]);

  debug!("Encoded {:?} NIfTI volume ({} bytes, vox_offset {})", dims, out.len(), vox_offset);
  Ok(out)
}

/// Read the standard header and voxel data, ignoring any embedded
/// payload.
///
/// # Returns
///
/// A column-major array of shape `[dim1, dim2, dim3]`, in the voxel
/// type stored in the file.
pub fn read_volume(bytes: &[u8]) -> Result<VoxelArray, MedreconErr> {
  if bytes.len() < HEADER_SIZE {
    return Err(MedreconErr::new_truncated("NIfTI header", HEADER_SIZE, bytes.len()));
  }

  let sizeof_hdr = LittleEndian::read_i32(&bytes[SIZEOF_HDR..]);
  if sizeof_hdr != HEADER_SIZE as i32 {
    return Err(MedreconErr::new_invalid_header("NIfTI", format!("sizeof_hdr is {}", sizeof_hdr)));
  }

  if &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4] != MAGIC {
    return Err(MedreconErr::new_bad_magic("NIfTI"));
  }

  let ndim = LittleEndian::read_i16(&bytes[DIM..]);
  if !(1..=7).contains(&ndim) {
    return Err(MedreconErr::new_invalid_header("NIfTI", format!("dim[0] is {}", ndim)));
  }

  let mut dims = Vec::with_capacity(ndim as usize);
  for i in 1..=ndim as usize {
    let dim = LittleEndian::read_i16(&bytes[DIM + 2 * i..]);
    if dim < 1 {
      return Err(MedreconErr::new_invalid_header("NIfTI", format!("dim[{}] is {}", i, dim)));
    }
    dims.push(dim as usize);
  }

  // Only up to three spatial dimensions; anything past that must be 1.
  if dims.iter().skip(3).any(|&dim| dim != 1) {
    return Err(MedreconErr::new_unsupported_shape(dims));
  }
  dims.resize(3, 1);

  let datatype = LittleEndian::read_i16(&bytes[DATATYPE..]);
  let bitpix = LittleEndian::read_i16(&bytes[BITPIX..]);
  let kind = match (datatype, bitpix) {
    (DT_FLOAT32, 32) => ElementKind::F32,
    (DT_FLOAT64, 64) => ElementKind::F64,
    (DT_UINT16, 16) => ElementKind::U16,
    _ => return Err(MedreconErr::new_unsupported_datatype(datatype, bitpix)),
  };

  let vox_offset = LittleEndian::read_f32(&bytes[VOX_OFFSET..]);
  if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 || vox_offset.fract() != 0.0 {
    return Err(MedreconErr::new_invalid_header("NIfTI", format!("vox_offset is {}", vox_offset)));
  }

  if f64::from(vox_offset) > bytes.len() as f64 {
    let reason = format!("vox_offset {} is past the end of {} bytes", vox_offset, bytes.len());
    return Err(MedreconErr::new_invalid_header("NIfTI", reason));
  }

  let start = vox_offset as usize;
  let end = array::byte_len(&dims, kind)
    .and_then(|len| len.checked_add(start))
    .ok_or_else(|| MedreconErr::new_invalid_header("NIfTI", format!("dims {:?} too large", dims)))?;
  if bytes.len() < end {
    return Err(MedreconErr::new_truncated("NIfTI voxel data", end, bytes.len()));
  }

  VoxelArray::new(dims, kind, Order::ColMajor, bytes[start..end].to_vec())
}

/// Pick one 2D slice out of a decoded volume.
///
/// Slices are taken along the last axis, `dim[3]`, which is the `z`
/// axis of files following the usual `(x, y, z)` layout. [`encode`]
/// writes `dim` in array order, so for a 3D array of shape
/// `(a, b, c)` the slices are `(a, b)` planes indexed along `c`.
///
/// Without an explicit `index`, the middle slice `z_count / 2` is
/// used. A volume with a single slice is returned as 2D directly.
pub fn select_slice(volume: &VoxelArray, index: Option<usize>) -> Result<VoxelArray, MedreconErr> {
  let z_count = volume.shape().get(2).copied().unwrap_or(1);

  let index = match index {
    Some(index) if index >= z_count => {
      return Err(MedreconErr::new_slice_index_out_of_range(index, z_count));
    }
    Some(index) => index,
    None => z_count / 2,
  };

  debug!("Selecting NIfTI slice {} of {}", index, z_count);
  volume.last_axis_plane(index)
}

/// Decode a NIfTI file back into an archive.
///
/// The embedded payload is returned unchanged when present. Otherwise
/// one representative slice (see [`select_slice`]) is returned as an
/// entry named [`FALLBACK_KEY`].
pub fn decode(bytes: &[u8], slice: Option<usize>) -> Result<LabeledArchive, MedreconErr> {
  if let Some(archive) = payload::scan_and_unpack(bytes) {
    match LabeledArchive::from_bytes(&archive) {
      Ok(archive) => return Ok(archive),
      Err(e) => debug!("Embedded payload is not a valid archive ({}), using voxel data", e),
    }
  }

  let volume = read_volume(bytes)?;
  Ok(LabeledArchive::new().with(FALLBACK_KEY, select_slice(&volume, slice)?))
}

#[cfg(test)]
mod nifti_tests {
  use super::*;

  fn volume() -> VoxelArray {
    let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
    VoxelArray::from_f32(vec![2, 3, 4], &values).unwrap()
  }

  #[test]
  fn header_layout() {
    let bytes = encode(&volume(), b"archive").unwrap();
    assert_eq!(LittleEndian::read_i32(&bytes[0..4]), 348);
    assert_eq!(&bytes[344..348], b"n+1\0");
    assert_eq!(LittleEndian::read_i16(&bytes[40..42]), 3);
    assert_eq!(LittleEndian::read_i16(&bytes[42..44]), 2);
    assert_eq!(LittleEndian::read_i16(&bytes[44..46]), 3);
    assert_eq!(LittleEndian::read_i16(&bytes[46..48]), 4);
    assert_eq!(LittleEndian::read_i16(&bytes[70..72]), 16);
    assert_eq!(LittleEndian::read_i16(&bytes[72..74]), 32);
    assert_eq!(&bytes[348..352], &[1, 0, 0, 0]);
  }

  #[test]
  fn extension_layout() {
    let bytes = encode(&volume(), b"archive").unwrap();
    let esize = LittleEndian::read_i32(&bytes[352..356]) as usize;
    assert_eq!(esize % 16, 0);
    assert_eq!(LittleEndian::read_i32(&bytes[356..360]), ECODE_PRIVATE);
    assert_eq!(payload::unpack(&bytes[360..352 + esize]).unwrap(), b"archive");

    let vox_offset = LittleEndian::read_f32(&bytes[108..112]) as usize;
    assert_eq!(vox_offset % 16, 0);
    assert_eq!(vox_offset, 352 + esize);
    assert_eq!(bytes.len(), vox_offset + 24 * 4);
  }

  #[test]
  fn voxels_round_trip() {
    let bytes = encode(&volume(), b"").unwrap();
    let decoded = read_volume(&bytes).unwrap();
    assert_eq!(decoded.shape(), &[2, 3, 4]);
    assert_eq!(decoded.order(), Order::ColMajor);
    assert_eq!(decoded.to_f32_row_major(), volume().to_f32_row_major());
  }

  #[test]
  fn two_dimensional_gets_trailing_dim() {
    let image = VoxelArray::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let bytes = encode(&image, b"").unwrap();
    assert_eq!(LittleEndian::read_i16(&bytes[46..48]), 1);

    let slice = select_slice(&read_volume(&bytes).unwrap(), None).unwrap();
    assert_eq!(slice.shape(), &[2, 2]);
    assert_eq!(slice.to_f32_row_major(), vec![1.0, 2.0, 3.0, 4.0]);
  }

  #[test]
  fn middle_slice_by_default() {
    let decoded = read_volume(&encode(&volume(), b"").unwrap()).unwrap();
    let slice = select_slice(&decoded, None).unwrap();
    assert_eq!(slice.shape(), &[2, 3]);
    // Index 4 / 2 = 2 along the last axis.
    assert_eq!(slice.get_f32(&[1, 2]), volume().get_f32(&[1, 2, 2]));
  }

  #[test]
  fn explicit_slice_out_of_range() {
    let decoded = read_volume(&encode(&volume(), b"").unwrap()).unwrap();
    assert!(select_slice(&decoded, Some(3)).is_ok());
    let err = select_slice(&decoded, Some(4)).unwrap_err();
    assert!(matches!(err, MedreconErr::SliceIndexOutOfRange { index: 4, count: 4 }));
  }

  #[test]
  fn unsupported_datatype() {
    let mut bytes = encode(&volume(), b"").unwrap();
    LittleEndian::write_i16(&mut bytes[70..72], 4);
    LittleEndian::write_i16(&mut bytes[72..74], 16);
    let err = read_volume(&bytes).unwrap_err();
    assert!(matches!(err, MedreconErr::UnsupportedDatatype { code: 4, bitpix: 16 }));
  }

  #[test]
  fn bad_header_size() {
    let mut bytes = encode(&volume(), b"").unwrap();
    LittleEndian::write_i32(&mut bytes[0..4], 540);
    assert_eq!(read_volume(&bytes).unwrap_err().kind(), crate::ErrorKind::MalformedInput);
  }

  #[test]
  fn vox_offset_past_the_end() {
    for offset in [1.0e30f32, 4096.0] {
      let mut bytes = encode(&volume(), b"").unwrap();
      LittleEndian::write_f32(&mut bytes[108..112], offset);
      let err = decode(&bytes, None).unwrap_err();
      assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);
    }
  }

  #[test]
  fn u16_voxels() {
    let mut bytes = encode(&VoxelArray::from_f32(vec![2, 2], &[0.0; 4]).unwrap(), b"").unwrap();
    let vox_offset = LittleEndian::read_f32(&bytes[108..112]) as usize;
    LittleEndian::write_i16(&mut bytes[70..72], 512);
    LittleEndian::write_i16(&mut bytes[72..74], 16);
    bytes.truncate(vox_offset);
    bytes.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);

    let decoded = read_volume(&bytes).unwrap();
    assert_eq!(decoded.kind(), ElementKind::U16);
    // Column-major storage: the first index varies fastest.
    assert_eq!(decoded.to_f32_row_major(), vec![1.0, 3.0, 2.0, 4.0]);
  }
}
