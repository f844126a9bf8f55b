//! Handles stacks of 2D slices assembled into a 3D volume. The
//! primary structure is the [volume struct](Volume).

use crate::array::VoxelArray;
use crate::npz::{LabeledArchive, SliceKeys};
use crate::utils;
use crate::MedreconErr;
use log::{debug, info};
use std::path::Path;

/// Extension of the slice archives a directory is scanned for.
pub const SLICE_EXTENSION: &str = "npz";

/// Volume data.
///
/// Both buffers are laid out slice by slice, then row by row:
/// the value at `(z, y, x)` lives at `z * height * width + y * width + x`.
#[derive(Debug, PartialEq, Clone)]
pub struct Volume {
  z_count: usize,
  height: usize,
  width: usize,
  raw: Vec<f32>,
  annotation: Option<Vec<f32>>,
}

impl Volume {
  /// Create a volume from its dimensions and flat buffers.
  ///
  /// Fails if a buffer does not hold exactly `z_count * height * width`
  /// values.
  pub fn new(
    z_count: usize,
    height: usize,
    width: usize,
    raw: Vec<f32>,
    annotation: Option<Vec<f32>>,
  ) -> Result<Self, MedreconErr> {
    let expected = z_count * height * width;

    if raw.len() != expected {
      return Err(MedreconErr::new_data_size_mismatch(raw.len() * 4, expected * 4));
    }

    if let Some(annotation) = &annotation {
      if annotation.len() != expected {
        return Err(MedreconErr::new_data_size_mismatch(annotation.len() * 4, expected * 4));
      }
    }

    Ok(Self { z_count, height, width, raw, annotation })
  }

  /// Number of slices.
  pub fn z_count(&self) -> usize {
    self.z_count
  }

  /// Rows per slice.
  pub fn height(&self) -> usize {
    self.height
  }

  /// Columns per slice.
  pub fn width(&self) -> usize {
    self.width
  }

  /// Raw intensities.
  pub fn raw(&self) -> &[f32] {
    &self.raw
  }

  /// Annotation values, if any slice carried an annotation.
  ///
  /// Slices without an annotation contribute zeros. An annotation
  /// that is present but all zero is still `Some`.
  pub fn annotation(&self) -> Option<&[f32]> {
    self.annotation.as_deref()
  }

  /// Load every `.npz` archive in `dir`, in natural file name order,
  /// and stack them along z.
  ///
  /// # Arguments
  ///
  /// * `dir` - Directory holding one archive per slice.
  ///
  /// * `keys` - Explicit archive keys, tried before the preference
  /// lists.
  ///
  /// # Returns
  ///
  /// The assembled volume, or [an error](MedreconErr) if the directory
  /// holds no archives, an archive has no usable raw entry, or slices
  /// disagree in shape.
  pub fn load_dir(dir: &Path, keys: &SliceKeys) -> Result<Self, MedreconErr> {
    let files = utils::list_files(dir, SLICE_EXTENSION)?;
    if files.is_empty() {
      return Err(MedreconErr::new_no_slices(dir.display().to_string()));
    }

    info!("Loading {} slices from {}", files.len(), dir.display());

    let mut builder = StackBuilder::default();
    for file in &files {
      debug!("Loading slice {}", file.display());
      let archive = LabeledArchive::load(file)?;
      builder.push(&archive, keys, &file.display().to_string())?;
    }

    builder.finish()
  }

  /// Stack already loaded archives, in the given order.
  pub fn from_archives<'a>(
    archives: impl IntoIterator<Item = &'a LabeledArchive>,
    keys: &SliceKeys,
  ) -> Result<Self, MedreconErr> {
    let mut builder = StackBuilder::default();
    for (index, archive) in archives.into_iter().enumerate() {
      builder.push(archive, keys, &format!("slice {}", index))?;
    }

    if builder.z_count == 0 {
      return Err(MedreconErr::new_no_slices(String::from("(archives)")));
    }

    builder.finish()
  }
}

/// Accumulates slices while checking they agree in shape.
#[derive(Default)]
struct StackBuilder {
  z_count: usize,
  dims: Option<(usize, usize)>,
  raw: Vec<f32>,
  annotation: Vec<f32>,
  has_annotation: bool,
}

impl StackBuilder {
  fn push(
    &mut self,
    archive: &LabeledArchive,
    keys: &SliceKeys,
    context: &str,
  ) -> Result<(), MedreconErr> {
    let raw = archive
      .raw_entry(keys)
      .ok_or_else(|| MedreconErr::new_missing_entry(format!("raw ({})", context)))?;
    let (height, width, values) = plane(raw)?;

    let dims = *self.dims.get_or_insert((height, width));
    if dims != (height, width) {
      return Err(MedreconErr::new_shape_mismatch(
        format!("raw of {}", context),
        dims,
        (height, width),
      ));
    }
    self.raw.extend_from_slice(&values);

    match archive.annotation_entry(keys) {
      Some(annotation) => {
        let (ah, aw, values) = plane(annotation)?;
        if (ah, aw) != dims {
          return Err(MedreconErr::new_shape_mismatch(
            format!("annotation of {}", context),
            dims,
            (ah, aw),
          ));
        }
        self.annotation.extend_from_slice(&values);
        self.has_annotation = true;
      }
      None => self.annotation.resize(self.annotation.len() + dims.0 * dims.1, 0.0),
    }

    self.z_count += 1;
    Ok(())
  }

  fn finish(self) -> Result<Volume, MedreconErr> {
    let (height, width) = self.dims.unwrap_or((0, 0));
    let annotation = if self.has_annotation { Some(self.annotation) } else { None };

    debug!(
      "Stacked {} slices of {}x{} ({})",
      self.z_count,
      height,
      width,
      if annotation.is_some() { "annotated" } else { "no annotation" }
    );

    Volume::new(self.z_count, height, width, self.raw, annotation)
  }
}

/// Reduce an archive entry to a 2D row-major plane.
fn plane(array: &VoxelArray) -> Result<(usize, usize, Vec<f32>), MedreconErr> {
  array.extract_2d().ok_or_else(|| MedreconErr::new_unsupported_shape(array.shape().to_vec()))
}

#[cfg(test)]
mod volume_tests {
  use super::*;

  fn slice(h: usize, w: usize, raw: f32, label: Option<f32>) -> LabeledArchive {
    let archive = LabeledArchive::new()
      .with("image", VoxelArray::from_f32(vec![h, w], &vec![raw; h * w]).unwrap());
    match label {
      Some(label) => {
        archive.with("label", VoxelArray::from_f32(vec![h, w], &vec![label; h * w]).unwrap())
      }
      None => archive,
    }
  }

  #[test]
  fn stacks_in_order() {
    let archives = [slice(2, 3, 1.0, None), slice(2, 3, 2.0, None)];
    let volume = Volume::from_archives(&archives, &SliceKeys::default()).unwrap();
    assert_eq!((volume.z_count(), volume.height(), volume.width()), (2, 2, 3));
    assert_eq!(&volume.raw()[..6], &[1.0; 6]);
    assert_eq!(&volume.raw()[6..], &[2.0; 6]);
    assert!(volume.annotation().is_none());
  }

  #[test]
  fn partial_annotation_is_zero_filled() {
    let archives = [slice(2, 2, 0.0, None), slice(2, 2, 0.0, Some(3.0))];
    let volume = Volume::from_archives(&archives, &SliceKeys::default()).unwrap();
    let annotation = volume.annotation().unwrap();
    assert_eq!(&annotation[..4], &[0.0; 4]);
    assert_eq!(&annotation[4..], &[3.0; 4]);
  }

  #[test]
  fn all_zero_annotation_is_kept() {
    let archives = [slice(2, 2, 5.0, Some(0.0))];
    let volume = Volume::from_archives(&archives, &SliceKeys::default()).unwrap();
    assert_eq!(volume.annotation(), Some(&[0.0; 4][..]));
  }

  #[test]
  fn raw_shape_mismatch() {
    let archives = [slice(2, 2, 0.0, None), slice(2, 3, 0.0, None)];
    let err = Volume::from_archives(&archives, &SliceKeys::default()).unwrap_err();
    assert!(matches!(err, MedreconErr::ShapeMismatch { expected: (2, 2), actual: (2, 3), .. }));
  }

  #[test]
  fn annotation_shape_mismatch() {
    let archive = slice(2, 2, 0.0, None)
      .with("label", VoxelArray::from_f32(vec![3, 2], &[0.0; 6]).unwrap());
    let err = Volume::from_archives([&archive], &SliceKeys::default()).unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::ShapeMismatch);
  }

  #[test]
  fn channel_axis_is_dropped() {
    let mut values = vec![7.0; 4];
    values.extend_from_slice(&[9.0; 8]);
    let archive = LabeledArchive::new()
      .with("image", VoxelArray::from_f32(vec![3, 2, 2], &values).unwrap());
    let volume = Volume::from_archives([&archive], &SliceKeys::default()).unwrap();
    assert_eq!(volume.raw(), &[7.0; 4]);
  }

  #[test]
  fn empty_dir() {
    let dir = tempfile::tempdir().unwrap();
    let err = Volume::load_dir(dir.path(), &SliceKeys::default()).unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::EmptyResult);
  }

  #[test]
  fn load_dir_natural_order() {
    let dir = tempfile::tempdir().unwrap();
    for (name, value) in [("slice10.npz", 10.0), ("slice2.npz", 2.0), ("slice1.npz", 1.0)] {
      slice(2, 2, value, None).save(&dir.path().join(name)).unwrap();
    }

    let volume = Volume::load_dir(dir.path(), &SliceKeys::default()).unwrap();
    assert_eq!(&volume.raw()[..4], &[1.0; 4]);
    assert_eq!(&volume.raw()[4..8], &[2.0; 4]);
    assert_eq!(&volume.raw()[8..], &[10.0; 4]);
  }
}
