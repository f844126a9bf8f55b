//! Transcoding between `.npz` archives, DICOM, NIfTI and PNG.
//!
//! Every conversion goes through the archive: other formats are decoded
//! into `.npz` bytes first and encoded from there. When a DICOM or
//! NIfTI file carries an embedded payload, the payload bytes are
//! returned exactly as they were embedded.

use crate::array::VoxelArray;
use crate::crop::CropRect;
use crate::npz::{LabeledArchive, SliceKeys};
use crate::{dicom, nifti, payload, png, utils};
use crate::MedreconErr;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// A file format taking part in a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
  /// `.npz` array archive.
  Npz,

  /// DICOM, explicit VR little endian.
  Dicom,

  /// Single-file NIfTI-1.
  Nifti,

  /// 8-bit RGB PNG. Output only.
  Png,
}

impl Format {
  /// The file extension written for this format, without the dot.
  pub fn extension(self) -> &'static str {
    match self {
      Format::Npz => "npz",
      Format::Dicom => "dcm",
      Format::Nifti => "nii",
      Format::Png => "png",
    }
  }

  /// Guess the format from a file extension, ignoring case.
  pub fn from_path(path: &Path) -> Result<Self, MedreconErr> {
    let ext = path.extension().map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
      Some("npz") => Ok(Format::Npz),
      Some("dcm") | Some("dicom") => Ok(Format::Dicom),
      Some("nii") => Ok(Format::Nifti),
      Some("png") => Ok(Format::Png),
      _ => Err(MedreconErr::new_unsupported_format(path.display().to_string())),
    }
  }
}

/// Options shared by every conversion.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConvertOptions {
  /// Explicit archive keys for the raw entry.
  pub keys: SliceKeys,

  /// Crop applied to 2D entries before encoding.
  pub crop: CropRect,

  /// NIfTI slice to decode when there is no embedded payload. The
  /// middle slice when `None`.
  pub slice: Option<usize>,
}

/// Bytes of the archive to embed, cropped if requested.
///
/// The original bytes are kept when nothing changes so that a decode
/// returns them unmodified.
fn embedded_archive(
  npz: &[u8],
  options: &ConvertOptions,
) -> Result<(LabeledArchive, Vec<u8>), MedreconErr> {
  let archive = LabeledArchive::from_bytes(npz)?;
  if options.crop.is_none() {
    return Ok((archive, npz.to_vec()));
  }

  let cropped = options.crop.apply(&archive);
  let bytes = cropped.to_bytes()?;
  Ok((cropped, bytes))
}

fn raw_entry<'a>(
  archive: &'a LabeledArchive,
  keys: &SliceKeys,
) -> Result<&'a VoxelArray, MedreconErr> {
  archive.raw_entry(keys).ok_or_else(|| MedreconErr::new_missing_entry(String::from("raw")))
}

/// Encode `.npz` bytes as DICOM, embedding the archive.
pub fn npz_to_dicom(npz: &[u8], options: &ConvertOptions) -> Result<Vec<u8>, MedreconErr> {
  let (archive, embedded) = embedded_archive(npz, options)?;
  dicom::encode(raw_entry(&archive, &options.keys)?, &embedded)
}

/// Encode `.npz` bytes as NIfTI, embedding the archive.
pub fn npz_to_nifti(npz: &[u8], options: &ConvertOptions) -> Result<Vec<u8>, MedreconErr> {
  let (archive, embedded) = embedded_archive(npz, options)?;
  nifti::encode(raw_entry(&archive, &options.keys)?, &embedded)
}

/// Render the raw entry of an archive as a grayscale PNG.
///
/// 2D entries are stretched to the full gray range. 3D entries are
/// averaged along their first axis first.
pub fn archive_to_png(
  archive: &LabeledArchive,
  keys: &SliceKeys,
) -> Result<Vec<u8>, MedreconErr> {
  let raw = raw_entry(archive, keys)?;
  let shape = raw.squeezed_shape();

  match *shape.as_slice() {
    [z_count, height, width] => {
      debug!("Averaging {} planes of {}x{} into a PNG", z_count, height, width);
      png::texture(&raw.to_f32_row_major(), z_count, height, width)
    }
    _ => {
      let (height, width, values) = raw
        .extract_2d()
        .ok_or_else(|| MedreconErr::new_unsupported_shape(raw.shape().to_vec()))?;
      png::texture(&values, 1, height, width)
    }
  }
}

/// Recover `.npz` bytes from a DICOM or NIfTI file.
///
/// A valid embedded payload is returned byte for byte. Otherwise the
/// pixel or voxel data is read through the format's fallback path and
/// serialized as a new archive.
fn decode_to_npz(
  bytes: &[u8],
  format: Format,
  options: &ConvertOptions,
) -> Result<Vec<u8>, MedreconErr> {
  if let Some(npz) = payload::scan_and_unpack(bytes) {
    if LabeledArchive::from_bytes(&npz).is_ok() {
      return Ok(npz);
    }
  }

  let archive = match format {
    Format::Dicom => dicom::decode(bytes)?,
    Format::Nifti => nifti::decode(bytes, options.slice)?,
    Format::Npz => LabeledArchive::from_bytes(bytes)?,
    Format::Png => return Err(MedreconErr::new_unsupported_format(String::from("PNG input"))),
  };

  archive.to_bytes()
}

/// Convert the contents of a file from one format to another.
pub fn convert_bytes(
  bytes: &[u8],
  from: Format,
  to: Format,
  options: &ConvertOptions,
) -> Result<Vec<u8>, MedreconErr> {
  let npz = match from {
    Format::Npz => bytes.to_vec(),
    _ => decode_to_npz(bytes, from, options)?,
  };

  match to {
    Format::Npz if options.crop.is_none() => Ok(npz),
    Format::Npz => options.crop.apply(&LabeledArchive::from_bytes(&npz)?).to_bytes(),
    Format::Dicom => npz_to_dicom(&npz, options),
    Format::Nifti => npz_to_nifti(&npz, options),
    Format::Png => {
      let archive = options.crop.apply(&LabeledArchive::from_bytes(&npz)?);
      archive_to_png(&archive, &options.keys)
    }
  }
}

/// Convert one file, guessing both formats from the extensions.
pub fn convert_file(
  input: &Path,
  output: &Path,
  options: &ConvertOptions,
) -> Result<(), MedreconErr> {
  let from = Format::from_path(input)?;
  let to = Format::from_path(output)?;

  let bytes = fs::read(input)?;
  let converted = convert_bytes(&bytes, from, to, options)?;
  fs::write(output, &converted)?;

  debug!("Converted {} to {} ({} bytes)", input.display(), output.display(), converted.len());
  Ok(())
}

/// Convert every `from` file in `input_dir` into `output_dir`.
///
/// Files are processed in natural name order and keep their stem. The
/// output directory is created if needed.
///
/// # Returns
///
/// The paths written, in processing order, or [an
/// error](MedreconErr) on the first file that fails.
pub fn convert_dir(
  input_dir: &Path,
  output_dir: &Path,
  from: Format,
  to: Format,
  options: &ConvertOptions,
) -> Result<Vec<PathBuf>, MedreconErr> {
  let files = utils::list_files(input_dir, from.extension())?;
  if files.is_empty() {
    return Err(MedreconErr::new_no_slices(input_dir.display().to_string()));
  }

  fs::create_dir_all(output_dir)?;

  let mut written = Vec::with_capacity(files.len());
  for input in &files {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(to.extension());
    let output = output_dir.join(name);

    let bytes = fs::read(input)?;
    fs::write(&output, convert_bytes(&bytes, from, to, options)?)?;
    written.push(output);
  }

  info!(
    "Converted {} {:?} files from {} into {}",
    written.len(),
    from,
    input_dir.display(),
    output_dir.display()
  );

  Ok(written)
}

#[cfg(test)]
mod convert_tests {
  use super::*;
  use crate::ErrorKind;

  fn archive() -> LabeledArchive {
    let values: Vec<f32> = (0..16).map(|v| v as f32 * 0.5).collect();
    LabeledArchive::new()
      .with("image", VoxelArray::from_f32(vec![4, 4], &values).unwrap())
      .with("label", VoxelArray::from_u8(vec![4, 4], vec![1; 16]).unwrap())
  }

  #[test]
  fn formats_from_paths() {
    assert_eq!(Format::from_path(Path::new("a/b.NPZ")).unwrap(), Format::Npz);
    assert_eq!(Format::from_path(Path::new("x.dicom")).unwrap(), Format::Dicom);
    let err = Format::from_path(Path::new("x.nii.gz")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedEncoding);
  }

  #[test]
  fn payload_bytes_are_preserved() {
    let npz = archive().to_bytes().unwrap();
    let options = ConvertOptions::default();

    let dcm = convert_bytes(&npz, Format::Npz, Format::Dicom, &options).unwrap();
    assert_eq!(convert_bytes(&dcm, Format::Dicom, Format::Npz, &options).unwrap(), npz);

    let nii = convert_bytes(&npz, Format::Npz, Format::Nifti, &options).unwrap();
    assert_eq!(convert_bytes(&nii, Format::Nifti, Format::Npz, &options).unwrap(), npz);
  }

  #[test]
  fn dicom_to_nifti_keeps_payload() {
    let npz = archive().to_bytes().unwrap();
    let options = ConvertOptions::default();

    let dcm = convert_bytes(&npz, Format::Npz, Format::Dicom, &options).unwrap();
    let nii = convert_bytes(&dcm, Format::Dicom, Format::Nifti, &options).unwrap();
    assert_eq!(payload::scan_and_unpack(&nii).unwrap(), npz);
  }

  #[test]
  fn crop_before_encoding() {
    let npz = archive().to_bytes().unwrap();
    let options = ConvertOptions { crop: CropRect::new(1, 3, 0, 2), ..Default::default() };

    let dcm = npz_to_dicom(&npz, &options).unwrap();
    let pixels = dicom::decode_pixels(&dcm).unwrap();
    assert_eq!(pixels.shape(), &[2, 2]);

    let decoded = dicom::decode(&dcm).unwrap();
    assert_eq!(decoded.get("label").unwrap().shape(), &[2, 2]);
  }

  #[test]
  fn png_from_archive() {
    let png = convert_bytes(
      &archive().to_bytes().unwrap(),
      Format::Npz,
      Format::Png,
      &ConvertOptions::default(),
    )
    .unwrap();
    assert_eq!(&png[..8], &png::SIGNATURE);
  }

  #[test]
  fn png_from_volume() {
    let volume = VoxelArray::from_f32(vec![2, 2, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    let archive = LabeledArchive::new().with("image", volume.unwrap());
    assert!(archive_to_png(&archive, &SliceKeys::default()).is_ok());
  }

  #[test]
  fn png_is_not_an_input() {
    let err = convert_bytes(b"\x89PNG", Format::Png, Format::Npz, &ConvertOptions::default());
    assert!(matches!(err, Err(MedreconErr::UnsupportedFormat { .. })));
  }

  #[test]
  fn directory_round_trip() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let back = tempfile::tempdir().unwrap();
    let options = ConvertOptions::default();

    for name in ["s2.npz", "s10.npz", "s1.npz"] {
      archive().save(&source.path().join(name)).unwrap();
    }

    let written =
      convert_dir(source.path(), target.path(), Format::Npz, Format::Dicom, &options).unwrap();
    let names: Vec<_> = written.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
    assert_eq!(names, vec!["s1.dcm", "s2.dcm", "s10.dcm"]);

    let restored =
      convert_dir(target.path(), back.path(), Format::Dicom, Format::Npz, &options).unwrap();
    for path in restored {
      assert_eq!(LabeledArchive::load(&path).unwrap(), archive());
    }
  }

  #[test]
  fn empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let err = convert_dir(dir.path(), dir.path(), Format::Npz, Format::Nifti, &Default::default());
    assert_eq!(err.unwrap_err().kind(), ErrorKind::EmptyResult);
  }
}
