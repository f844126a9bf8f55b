//! Iso-surface extraction from scalar volumes.
//!
//! [`extract`] walks every cube of eight neighbouring voxels and emits
//! a flat triangle soup: each triangle owns its three vertices and
//! carries its face normal on all of them.

use crate::tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_TABLE, TRI_TABLE};
use crate::MedreconErr;
use log::debug;

/// Iso-value used for every binary mask.
pub const ISO_LEVEL: f32 = 0.5;

/// Base color of the mask built from annotation values above 1.
pub const YELLOW: [f32; 4] = [1.0, 0.831, 0.0, 1.0];

/// Base color of the mask built from annotation values up to 1.
pub const RED: [f32; 4] = [1.0, 0.231, 0.231, 1.0];

/// Below this difference the two corner values are treated as equal.
const FLAT_EDGE: f32 = 1e-6;

/// A triangle soup with per-vertex attributes.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Mesh {
  /// Vertex positions, centred on the volume's middle.
  pub positions: Vec<[f32; 3]>,

  /// Unit face normal of the triangle each vertex belongs to.
  pub normals: Vec<[f32; 3]>,

  /// Texture coordinates, only when extraction asked for them.
  pub uvs: Option<Vec<[f32; 2]>>,

  /// Vertex indices, three per triangle, never shared.
  pub indices: Vec<u32>,

  /// Component-wise minimum of `positions`.
  pub bbox_min: [f32; 3],

  /// Component-wise maximum of `positions`.
  pub bbox_max: [f32; 3],
}

impl Mesh {
  /// Whether the mesh has no triangles.
  pub fn is_empty(&self) -> bool {
    self.indices.is_empty()
  }

  /// Number of triangles.
  pub fn triangle_count(&self) -> usize {
    self.indices.len() / 3
  }

  fn push_vertex(&mut self, position: [f32; 3], normal: [f32; 3], uv: Option<[f32; 2]>) {
    if self.positions.is_empty() {
      self.bbox_min = position;
      self.bbox_max = position;
    } else {
      for axis in 0..3 {
        self.bbox_min[axis] = self.bbox_min[axis].min(position[axis]);
        self.bbox_max[axis] = self.bbox_max[axis].max(position[axis]);
      }
    }

    self.indices.push(self.positions.len() as u32);
    self.positions.push(position);
    self.normals.push(normal);

    if let (Some(uvs), Some(uv)) = (self.uvs.as_mut(), uv) {
      uvs.push(uv);
    }
  }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
  [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
  [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

/// Scale to unit length, leaving near-zero vectors alone.
fn normalize(v: [f32; 3]) -> [f32; 3] {
  let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
  if len > 1e-8 {
    [v[0] / len, v[1] / len, v[2] / len]
  } else {
    v
  }
}

/// Run marching cubes over a `(z, y, x)` row-major scalar field.
///
/// A corner is inside when its value is strictly greater than `iso`.
/// Positions are in voxel units, shifted so that the centre of the
/// volume lands on the origin.
///
/// # Arguments
///
/// * `field` - `z_count * height * width` values.
///
/// * `with_uvs` - Also produce texture coordinates, mapping `(x, y)`
/// onto `[0, 1]` with `v` flipped.
///
/// # Returns
///
/// The mesh, or [an error](MedreconErr) if `field` holds fewer than
/// `z_count * height * width` values.
pub fn extract(
  field: &[f32],
  z_count: usize,
  height: usize,
  width: usize,
  iso: f32,
  with_uvs: bool,
) -> Result<Mesh, MedreconErr> {
  let expected = z_count.checked_mul(height).and_then(|n| n.checked_mul(width));
  match expected {
    Some(expected) if field.len() >= expected => {}
    _ => {
      let expected = expected.unwrap_or(usize::MAX).saturating_mul(4);
      return Err(MedreconErr::new_data_size_mismatch(field.len() * 4, expected));
    }
  }

  let slice_size = height * width;
  let sample = |x: usize, y: usize, z: usize| field[z * slice_size + y * width + x];

  let centre = [
    width.saturating_sub(1) as f32 * 0.5,
    height.saturating_sub(1) as f32 * 0.5,
    z_count.saturating_sub(1) as f32 * 0.5,
  ];

  let uv_of = |p: [f32; 3]| {
    let u = if width > 1 { (p[0] + centre[0]) / (width - 1) as f32 } else { 0.0 };
    let v = if height > 1 { (p[1] + centre[1]) / (height - 1) as f32 } else { 0.0 };
    [u, 1.0 - v]
  };

  let mut mesh = Mesh { uvs: if with_uvs { Some(Vec::new()) } else { None }, ..Mesh::default() };

  for z in 0..z_count.saturating_sub(1) {
    for y in 0..height.saturating_sub(1) {
      for x in 0..width.saturating_sub(1) {
        let mut corners = [0.0; 8];
        let mut code = 0;
        for (i, [dx, dy, dz]) in CORNER_OFFSETS.iter().enumerate() {
          corners[i] = sample(x + dx, y + dy, z + dz);
          if corners[i] > iso {
            code |= 1 << i;
          }
        }

        let edges = EDGE_TABLE[code];
        if edges == 0 {
          continue;
        }

        let mut crossings = [[0.0; 3]; 12];
        for (e, &[c0, c1]) in EDGE_CORNERS.iter().enumerate() {
          if edges & (1 << e) == 0 {
            continue;
          }

          let (v0, v1) = (corners[c0], corners[c1]);
          let t = if (v1 - v0).abs() > FLAT_EDGE { (iso - v0) / (v1 - v0) } else { 0.5 };

          let origin = [x, y, z];
          for axis in 0..3 {
            let p0 = (origin[axis] + CORNER_OFFSETS[c0][axis]) as f32;
            let p1 = (origin[axis] + CORNER_OFFSETS[c1][axis]) as f32;
            crossings[e][axis] = p0 + t * (p1 - p0) - centre[axis];
          }
        }

        for triangle in TRI_TABLE[code].chunks_exact(3).take_while(|tri| tri[0] >= 0) {
          let a = crossings[triangle[0] as usize];
          let b = crossings[triangle[1] as usize];
          let c = crossings[triangle[2] as usize];
          let normal = normalize(cross(sub(b, a), sub(c, a)));

          for p in [a, b, c] {
            mesh.push_vertex(p, normal, with_uvs.then(|| uv_of(p)));
          }
        }
      }
    }
  }

  debug!(
    "Extracted {} triangles from {}x{}x{} volume at iso {}",
    mesh.triangle_count(),
    z_count,
    height,
    width,
    iso
  );

  Ok(mesh)
}

/// Split annotation values into the yellow (`v > 1`) and red
/// (`threshold < v <= 1`) binary masks.
pub fn annotation_masks(annotation: &[f32], threshold: f32) -> (Vec<f32>, Vec<f32>) {
  let mut yellow = vec![0.0; annotation.len()];
  let mut red = vec![0.0; annotation.len()];

  for (i, &v) in annotation.iter().enumerate() {
    if v > 1.0 {
      yellow[i] = 1.0;
    } else if v > threshold {
      red[i] = 1.0;
    }
  }

  (yellow, red)
}

/// Binary mask of raw values above the midpoint of their own range.
pub fn raw_threshold_mask(raw: &[f32]) -> Vec<f32> {
  let (lo, hi) = raw
    .iter()
    .fold(None, |acc: Option<(f32, f32)>, &v| match acc {
      None => Some((v, v)),
      Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
    .unwrap_or((0.0, 0.0));

  let threshold = (lo + hi) * 0.5;
  debug!("Raw threshold {} (range {} to {})", threshold, lo, hi);

  raw.iter().map(|&v| if v > threshold { 1.0 } else { 0.0 }).collect()
}

#[cfg(test)]
mod marching_cubes_tests {
  use super::*;

  #[test]
  fn empty_mask() {
    let mesh = extract(&[0.0; 27], 3, 3, 3, ISO_LEVEL, true).unwrap();
    assert!(mesh.is_empty());
    assert!(mesh.positions.is_empty());
    assert_eq!(mesh.uvs, Some(vec![]));
  }

  #[test]
  fn single_corner() {
    let mut field = [0.0; 8];
    field[0] = 1.0;

    let mesh = extract(&field, 2, 2, 2, ISO_LEVEL, false).unwrap();
    assert_eq!(mesh.triangle_count(), 1);
    assert_eq!(mesh.indices, vec![0, 1, 2]);
    assert_eq!(mesh.normals.len(), mesh.positions.len());
    assert!(mesh.uvs.is_none());

    for p in &mesh.positions {
      assert!(p.iter().all(|c| (-0.5..=0.5).contains(c)), "{:?} outside the cube", p);
    }

    for n in &mesh.normals {
      let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
      assert!((len - 1.0).abs() < 1e-5);
    }
  }

  #[test]
  fn flat_normals_per_triangle() {
    let mut field = [0.0; 8];
    field[0] = 1.0;
    field[1] = 1.0;

    let mesh = extract(&field, 2, 2, 2, ISO_LEVEL, false).unwrap();
    assert_eq!(mesh.triangle_count(), 2);
    for triangle in mesh.normals.chunks_exact(3) {
      assert_eq!(triangle[0], triangle[1]);
      assert_eq!(triangle[1], triangle[2]);
    }
  }

  #[test]
  fn interpolates_crossing() {
    let mut field = [0.0; 8];
    field[0] = 2.0;

    // Crossing on the x edge at t = (0.5 - 2) / (0 - 2) = 0.75.
    let mesh = extract(&field, 2, 2, 2, ISO_LEVEL, false).unwrap();
    assert!(mesh.positions.iter().any(|p| (p[0] - 0.25).abs() < 1e-6));
  }

  #[test]
  fn bounding_box() {
    let mut field = vec![0.0; 4 * 4 * 4];
    field[4 * 4 + 4 + 1] = 1.0;

    let mesh = extract(&field, 4, 4, 4, ISO_LEVEL, false).unwrap();
    for p in &mesh.positions {
      for axis in 0..3 {
        assert!(mesh.bbox_min[axis] <= p[axis] && p[axis] <= mesh.bbox_max[axis]);
      }
    }
    assert_eq!(mesh.bbox_min, [-1.0, -1.0, -1.0]);
    assert_eq!(mesh.bbox_max, [0.0, 0.0, 0.0]);
  }

  #[test]
  fn uvs_span_unit_square() {
    let mut field = vec![0.0; 2 * 3 * 3];
    field[4] = 1.0;
    field[9 + 4] = 1.0;

    let mesh = extract(&field, 2, 3, 3, ISO_LEVEL, true).unwrap();
    let uvs = mesh.uvs.as_ref().unwrap();
    assert_eq!(uvs.len(), mesh.positions.len());
    for (uv, p) in uvs.iter().zip(&mesh.positions) {
      assert!((0.0..=1.0).contains(&uv[0]) && (0.0..=1.0).contains(&uv[1]));
      assert!((uv[1] - (1.0 - (p[1] + 1.0) / 2.0)).abs() < 1e-6);
    }
  }

  #[test]
  fn single_slice_has_no_cubes() {
    assert!(extract(&[1.0; 9], 1, 3, 3, ISO_LEVEL, false).unwrap().is_empty());
  }

  #[test]
  fn masks() {
    let (yellow, red) = annotation_masks(&[0.0, 0.5, 1.0, 2.0, -1.0], 0.0);
    assert_eq!(yellow, vec![0.0, 0.0, 0.0, 1.0, 0.0]);
    assert_eq!(red, vec![0.0, 1.0, 1.0, 0.0, 0.0]);

    let (_, red) = annotation_masks(&[0.0, 0.5, 1.0, 2.0], 0.5);
    assert_eq!(red, vec![0.0, 0.0, 1.0, 0.0]);
  }

  #[test]
  fn raw_midpoint() {
    assert_eq!(raw_threshold_mask(&[0.0, 4.0, 6.0, 10.0]), vec![0.0, 0.0, 1.0, 1.0]);
    assert_eq!(raw_threshold_mask(&[3.0; 3]), vec![0.0; 3]);
    assert!(raw_threshold_mask(&[]).is_empty());
  }

  #[test]
  fn short_field() {
    let err = extract(&[0.0; 7], 2, 2, 2, ISO_LEVEL, false).unwrap_err();
    assert!(matches!(err, MedreconErr::DataSizeMismatch { actual: 28, expected: 32 }));
    assert!(extract(&[], usize::MAX, 2, 2, ISO_LEVEL, false).is_err());
  }
}
