//! Pre- and post-processing around a segmentation model.
//!
//! The model itself is a [`Segmenter`]: it receives a `(1, 3, E, E)`
//! tensor and returns `(1, C, H, W)` scores. This module prepares the
//! input from a grayscale image and turns the scores back into a class
//! map at the image's resolution.

use crate::array::VoxelArray;
use crate::MedreconErr;
use half::f16;
use log::debug;

/// Tensor element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  /// Single precision.
  F32(Vec<f32>),

  /// Half precision.
  F16(Vec<f16>),
}

impl TensorData {
  fn len(&self) -> usize {
    match self {
      TensorData::F32(values) => values.len(),
      TensorData::F16(values) => values.len(),
    }
  }

  fn get(&self, index: usize) -> f32 {
    match self {
      TensorData::F32(values) => values[index],
      TensorData::F16(values) => values[index].to_f32(),
    }
  }
}

/// A dense `(N, C, H, W)` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  shape: [usize; 4],
  data: TensorData,
}

impl Tensor {
  /// Create a tensor, checking that `data` fills `shape` exactly.
  pub fn new(shape: [usize; 4], data: TensorData) -> Result<Self, MedreconErr> {
    let width = match data {
      TensorData::F32(_) => 4,
      TensorData::F16(_) => 2,
    };
    let expected = shape.iter().try_fold(width, |acc: usize, &dim| acc.checked_mul(dim));
    if expected != Some(data.len() * width) {
      let expected = expected.unwrap_or(usize::MAX);
      return Err(MedreconErr::new_data_size_mismatch(data.len() * width, expected));
    }

    Ok(Self { shape, data })
  }

  /// The `(N, C, H, W)` shape.
  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  /// The elements.
  pub fn data(&self) -> &TensorData {
    &self.data
  }

  /// Value at `(n, c, y, x)` as `f32`.
  ///
  /// # Notes
  ///
  /// Panics if the index is out of bounds.
  pub fn get(&self, n: usize, c: usize, y: usize, x: usize) -> f32 {
    let [_, channels, height, width] = self.shape;
    self.data.get(((n * channels + c) * height + y) * width + x)
  }
}

/// A segmentation model.
pub trait Segmenter {
  /// Edge length of the square input the model expects.
  fn input_edge(&self) -> usize;

  /// Run the model on a `(1, 3, E, E)` tensor.
  fn infer(&self, input: &Tensor) -> Result<Tensor, MedreconErr>;
}

/// Sample a row-major image at a fractional position.
fn bilinear(image: &[f32], height: usize, width: usize, y: f32, x: f32) -> f32 {
  let y0 = y.floor() as usize;
  let x0 = x.floor() as usize;
  let y1 = (y0 + 1).min(height - 1);
  let x1 = (x0 + 1).min(width - 1);

  let dy = y - y0 as f32;
  let dx = x - x0 as f32;

  let top = image[y0 * width + x0].mul_add(1.0 - dx, image[y0 * width + x1] * dx);
  let bottom = image[y1 * width + x0].mul_add(1.0 - dx, image[y1 * width + x1] * dx);
  top.mul_add(1.0 - dy, bottom * dy)
}

/// Source coordinate of output pixel `i` when resizing `from` to `to`
/// samples, with pixel centres aligned.
fn source_coord(i: usize, from: usize, to: usize) -> f32 {
  let src = (i as f32 + 0.5) * from as f32 / to as f32 - 0.5;
  src.max(0.0).min((from - 1) as f32)
}

/// Bilinear resize of a row-major image.
fn resize_bilinear(image: &[f32], height: usize, width: usize, edge: usize) -> Vec<f32> {
  let mut out = Vec::with_capacity(edge * edge);
  for y in 0..edge {
    let sy = source_coord(y, height, edge);
    for x in 0..edge {
      out.push(bilinear(image, height, width, sy, source_coord(x, width, edge)));
    }
  }
  out
}

/// Prepare a grayscale image for a model with a square input of `edge`.
///
/// Values are divided by 255 when the image's maximum exceeds 1, the
/// image is resized to `edge` by `edge`, and the single channel is
/// repeated into three planar channels.
pub fn preprocess(image: &VoxelArray, edge: usize) -> Result<Tensor, MedreconErr> {
  let (height, width, mut values) =
    image.extract_2d().ok_or_else(|| MedreconErr::new_unsupported_shape(image.shape().to_vec()))?;

  if height == 0 || width == 0 || edge == 0 {
    return Err(MedreconErr::new_unsupported_shape(vec![height, width]));
  }

  let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  if max > 1.0 {
    for v in &mut values {
      *v /= 255.0;
    }
  }

  let plane = resize_bilinear(&values, height, width, edge);

  let mut data = Vec::with_capacity(3 * plane.len());
  for _ in 0..3 {
    data.extend_from_slice(&plane);
  }

  debug!("Preprocessed {}x{} image into a {}x{} tensor", height, width, edge, edge);
  Tensor::new([1, 3, edge, edge], TensorData::F32(data))
}

/// Turn model scores into a `u8` class map of `height` by `width`.
///
/// A single channel is passed through a sigmoid and thresholded at
/// 0.5, giving classes 0 and 1. Several channels take the per-pixel
/// argmax, the first channel winning ties. The class map is then
/// resized to the requested resolution by nearest neighbour.
pub fn postprocess(
  output: &Tensor,
  height: usize,
  width: usize,
) -> Result<VoxelArray, MedreconErr> {
  let [n, channels, out_h, out_w] = output.shape();
  if n != 1 || channels == 0 || channels > 256 || out_h == 0 || out_w == 0 {
    return Err(MedreconErr::new_unsupported_shape(output.shape().to_vec()));
  }

  let class_at = |y: usize, x: usize| -> u8 {
    if channels == 1 {
      let p = 1.0 / (1.0 + (-output.get(0, 0, y, x)).exp());
      return u8::from(p > 0.5);
    }

    let mut best = 0;
    for c in 1..channels {
      if output.get(0, c, y, x) > output.get(0, best, y, x) {
        best = c;
      }
    }
    best as u8
  };

  let mut classes = Vec::with_capacity(height * width);
  for y in 0..height {
    let sy = (y * out_h / height).min(out_h - 1);
    for x in 0..width {
      let sx = (x * out_w / width).min(out_w - 1);
      classes.push(class_at(sy, sx));
    }
  }

  VoxelArray::from_u8(vec![height, width], classes)
}

/// Segment a grayscale image with a model.
///
/// # Returns
///
/// A `u8` class map with the same height and width as `image`.
pub fn segment(segmenter: &dyn Segmenter, image: &VoxelArray) -> Result<VoxelArray, MedreconErr> {
  let (height, width, _) =
    image.extract_2d().ok_or_else(|| MedreconErr::new_unsupported_shape(image.shape().to_vec()))?;

  let input = preprocess(image, segmenter.input_edge())?;
  let output = segmenter.infer(&input)?;
  postprocess(&output, height, width)
}

#[cfg(test)]
mod segment_tests {
  use super::*;

  /// Predicts class 1 wherever the first input channel exceeds 0.5,
  /// returning half precision two-channel scores.
  struct Brightness;

  impl Segmenter for Brightness {
    fn input_edge(&self) -> usize {
      4
    }

    fn infer(&self, input: &Tensor) -> Result<Tensor, MedreconErr> {
      let [_, _, h, w] = input.shape();
      let mut scores = vec![f16::ZERO; 2 * h * w];
      for y in 0..h {
        for x in 0..w {
          let bright = input.get(0, 0, y, x) > 0.5;
          scores[y * w + x] = f16::from_f32(if bright { 0.0 } else { 1.0 });
          scores[h * w + y * w + x] = f16::from_f32(if bright { 1.0 } else { 0.0 });
        }
      }
      Tensor::new([1, 2, h, w], TensorData::F16(scores))
    }
  }

  #[test]
  fn preprocess_layout() {
    let image = VoxelArray::from_f32(vec![2, 2], &[0.0, 255.0, 255.0, 0.0]).unwrap();
    let tensor = preprocess(&image, 4).unwrap();
    assert_eq!(tensor.shape(), [1, 3, 4, 4]);

    // Corners sit on source pixels, channels are copies.
    assert_eq!(tensor.get(0, 0, 0, 0), 0.0);
    assert_eq!(tensor.get(0, 0, 0, 3), 1.0);
    assert_eq!(tensor.get(0, 2, 3, 0), 1.0);
    assert!((tensor.get(0, 1, 1, 1) - 0.375).abs() < 1e-6);
  }

  #[test]
  fn preprocess_keeps_unit_range() {
    let image = VoxelArray::from_f32(vec![2, 2], &[0.0, 0.5, 1.0, 0.25]).unwrap();
    let tensor = preprocess(&image, 2).unwrap();
    assert_eq!(tensor.get(0, 0, 1, 0), 1.0);
  }

  #[test]
  fn sigmoid_threshold() {
    let scores = Tensor::new([1, 1, 1, 3], TensorData::F32(vec![-2.0, 0.0, 3.0])).unwrap();
    let classes = postprocess(&scores, 1, 3).unwrap();
    assert_eq!(classes.data(), &[0, 0, 1]);
  }

  #[test]
  fn argmax_and_nearest_resize() {
    let scores =
      Tensor::new([1, 3, 1, 2], TensorData::F32(vec![0.0, 5.0, 1.0, 5.0, 2.0, 0.0])).unwrap();
    let classes = postprocess(&scores, 2, 4).unwrap();
    assert_eq!(classes.shape(), &[2, 4]);
    assert_eq!(classes.data(), &[2, 2, 0, 0, 2, 2, 0, 0]);
  }

  #[test]
  fn bad_output_shape() {
    let scores = Tensor::new([2, 1, 1, 1], TensorData::F32(vec![0.0, 0.0])).unwrap();
    assert!(postprocess(&scores, 1, 1).is_err());
    assert!(Tensor::new([1, 1, 2, 2], TensorData::F32(vec![0.0])).is_err());
    assert!(Tensor::new([usize::MAX, 2, 1, 1], TensorData::F16(Vec::new())).is_err());
  }

  #[test]
  fn end_to_end() {
    let mut values = vec![0.0; 64];
    for y in 0..8 {
      for x in 4..8 {
        values[y * 8 + x] = 200.0;
      }
    }
    let image = VoxelArray::from_f32(vec![8, 8], &values).unwrap();

    let classes = segment(&Brightness, &image).unwrap();
    assert_eq!(classes.shape(), &[8, 8]);
    assert_eq!(classes.get_f32(&[3, 1]), 0.0);
    assert_eq!(classes.get_f32(&[3, 6]), 1.0);
  }
}
