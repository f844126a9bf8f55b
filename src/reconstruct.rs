//! Slice directory to GLB reconstruction.
//!
//! A stack with an annotation yields up to two flat-colored meshes, one
//! per annotation class. A stack without one is thresholded at the
//! midpoint of its raw intensities and yields a single mesh textured
//! with the z-averaged raw image.

use crate::glb::{self, Primitive};
use crate::marching_cubes::{self, ISO_LEVEL, RED, YELLOW};
use crate::npz::SliceKeys;
use crate::png;
use crate::volume::Volume;
use crate::MedreconErr;
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Options for [`reconstruct`] and [`convert_directory_to_glb`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructOptions {
  /// Explicit archive keys for the raw and annotation entries.
  pub keys: SliceKeys,

  /// Annotation values above this and up to 1 form the red mask.
  pub annotation_threshold: f32,

  /// Fall back to thresholding raw intensities when no slice carries
  /// an annotation. When unset such a stack is an error.
  pub use_raw_threshold: bool,
}

impl Default for ReconstructOptions {
  fn default() -> Self {
    Self { keys: SliceKeys::default(), annotation_threshold: 0.0, use_raw_threshold: true }
  }
}

/// How a reconstruction was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// One flat-colored mesh per nonempty annotation class.
  Annotated,

  /// One textured mesh from the raw intensity midpoint.
  RawThreshold,
}

/// The meshes of a reconstruction, ready to be serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
  /// Which extraction mode ran.
  pub mode: Mode,

  /// Nonempty primitives, yellow before red in annotated mode.
  pub primitives: Vec<Primitive>,

  /// Encoded texture, present in raw-threshold mode.
  pub texture: Option<Vec<u8>>,
}

impl Reconstruction {
  /// Triangle count of each primitive, in order.
  pub fn triangle_counts(&self) -> Vec<usize> {
    self.primitives.iter().map(|p| p.mesh.triangle_count()).collect()
  }

  /// Serialize into a GLB container.
  pub fn to_glb(&self) -> Result<Vec<u8>, MedreconErr> {
    glb::write(&self.primitives, self.texture.as_deref())
  }
}

/// Extract meshes from a volume.
///
/// # Returns
///
/// The [reconstruction](Reconstruction), or [an error](MedreconErr)
/// if every mesh came out empty or the volume has no annotation and
/// raw thresholding is disabled.
pub fn reconstruct(
  volume: &Volume,
  options: &ReconstructOptions,
) -> Result<Reconstruction, MedreconErr> {
  let (z, h, w) = (volume.z_count(), volume.height(), volume.width());

  if z < 2 {
    warn!("A stack of {} slice(s) has no cubes to extract a surface from", z);
  }

  match volume.annotation() {
    Some(annotation) => {
      let (yellow, red) =
        marching_cubes::annotation_masks(annotation, options.annotation_threshold);

      let mut primitives = Vec::with_capacity(2);
      for (mask, color) in [(yellow, YELLOW), (red, RED)] {
        let mesh = marching_cubes::extract(&mask, z, h, w, ISO_LEVEL, false)?;
        if !mesh.is_empty() {
          primitives.push(Primitive::colored(mesh, color));
        }
      }

      if primitives.is_empty() {
        return Err(MedreconErr::new_empty_mesh());
      }

      Ok(Reconstruction { mode: Mode::Annotated, primitives, texture: None })
    }
    None if options.use_raw_threshold => {
      let mask = marching_cubes::raw_threshold_mask(volume.raw());
      let mesh = marching_cubes::extract(&mask, z, h, w, ISO_LEVEL, true)?;
      if mesh.is_empty() {
        return Err(MedreconErr::new_empty_mesh());
      }

      let texture = png::texture(volume.raw(), z, h, w)?;
      Ok(Reconstruction {
        mode: Mode::RawThreshold,
        primitives: vec![Primitive::textured(mesh)],
        texture: Some(texture),
      })
    }
    None => Err(MedreconErr::new_no_annotation()),
  }
}

/// Load the slices in `input_dir`, reconstruct them, and write the GLB
/// to `output`.
///
/// Nothing is written unless the whole reconstruction succeeds.
pub fn convert_directory_to_glb(
  input_dir: &Path,
  output: &Path,
  options: &ReconstructOptions,
) -> Result<Reconstruction, MedreconErr> {
  let volume = Volume::load_dir(input_dir, &options.keys)?;
  let reconstruction = reconstruct(&volume, options)?;
  let glb = reconstruction.to_glb()?;

  fs::write(output, &glb)?;

  info!(
    "Wrote {} ({} bytes, {:?} mode, triangles {:?})",
    output.display(),
    glb.len(),
    reconstruction.mode,
    reconstruction.triangle_counts()
  );

  Ok(reconstruction)
}

#[cfg(test)]
mod reconstruct_tests {
  use super::*;

  fn volume(raw: Vec<f32>, annotation: Option<Vec<f32>>) -> Volume {
    Volume::new(2, 4, 4, raw, annotation).unwrap()
  }

  /// A 2x2 block in the middle of both slices set to `value`.
  fn block(value: f32) -> Vec<f32> {
    let mut out = vec![0.0; 32];
    for z in 0..2 {
      for (y, x) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
        out[z * 16 + y * 4 + x] = value;
      }
    }
    out
  }

  #[test]
  fn yellow_only() {
    let recon = reconstruct(&volume(vec![0.0; 32], Some(block(2.0))), &Default::default()).unwrap();
    assert_eq!(recon.mode, Mode::Annotated);
    assert_eq!(recon.primitives.len(), 1);
    assert_eq!(recon.primitives[0].base_color, YELLOW);
    assert!(recon.texture.is_none());
  }

  #[test]
  fn red_floor() {
    let options = ReconstructOptions { annotation_threshold: 0.5, ..Default::default() };
    let err = reconstruct(&volume(vec![0.0; 32], Some(block(0.4))), &options).unwrap_err();
    assert!(matches!(err, MedreconErr::EmptyMesh));

    let recon = reconstruct(&volume(vec![0.0; 32], Some(block(0.4))), &Default::default()).unwrap();
    assert_eq!(recon.primitives[0].base_color, RED);
  }

  #[test]
  fn all_zero_annotation_stays_annotated() {
    let err = reconstruct(&volume(block(9.0), Some(vec![0.0; 32])), &Default::default());
    assert!(matches!(err, Err(MedreconErr::EmptyMesh)));
  }

  #[test]
  fn raw_threshold() {
    let recon = reconstruct(&volume(block(9.0), None), &Default::default()).unwrap();
    assert_eq!(recon.mode, Mode::RawThreshold);
    assert!(recon.primitives[0].use_texture);
    assert!(recon.primitives[0].mesh.uvs.is_some());
    assert!(recon.texture.is_some());
    assert!(recon.triangle_counts()[0] > 0);
    assert!(recon.to_glb().is_ok());
  }

  #[test]
  fn raw_threshold_disabled() {
    let options = ReconstructOptions { use_raw_threshold: false, ..Default::default() };
    let err = reconstruct(&volume(block(9.0), None), &options).unwrap_err();
    assert!(matches!(err, MedreconErr::NoAnnotation));
  }
}
