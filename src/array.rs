//! Typed N-dimensional arrays, the unit of exchange between every
//! codec. The primary structure is the [voxel array](VoxelArray).

use crate::MedreconErr;
use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;

/// Most dimensions an array may have.
pub const MAX_DIMS: usize = 3;

/// Element type of a [voxel array](VoxelArray).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ElementKind {
  /// Unsigned 8-bit.
  U8,

  /// Unsigned 16-bit.
  U16,

  /// Signed 16-bit.
  I16,

  /// Signed 32-bit.
  I32,

  /// 32-bit float.
  F32,

  /// 64-bit float.
  F64,
}

impl ElementKind {
  /// Width of one element in bytes.
  pub fn size(self) -> usize {
    match self {
      ElementKind::U8 => 1,
      ElementKind::U16 | ElementKind::I16 => 2,
      ElementKind::I32 | ElementKind::F32 => 4,
      ElementKind::F64 => 8,
    }
  }

  /// Parse a little-endian npy `descr` string such as `<f4`.
  pub fn from_descr(descr: &str) -> Option<Self> {
    match descr {
      "|u1" | "<u1" | "u1" => Some(ElementKind::U8),
      "<u2" => Some(ElementKind::U16),
      "<i2" => Some(ElementKind::I16),
      "<i4" => Some(ElementKind::I32),
      "<f4" => Some(ElementKind::F32),
      "<f8" => Some(ElementKind::F64),
      _ => None,
    }
  }

  /// The npy `descr` string for this element type.
  pub fn descr(self) -> &'static str {
    match self {
      ElementKind::U8 => "|u1",
      ElementKind::U16 => "<u2",
      ElementKind::I16 => "<i2",
      ElementKind::I32 => "<i4",
      ElementKind::F32 => "<f4",
      ElementKind::F64 => "<f8",
    }
  }

  /// Decode one little-endian element as `f32`.
  ///
  /// # Notes
  ///
  /// Panics if `bytes` is shorter than [the element size](Self::size).
  fn read_f32(self, bytes: &[u8]) -> f32 {
    match self {
      ElementKind::U8 => f32::from(bytes[0]),
      ElementKind::U16 => f32::from(LittleEndian::read_u16(bytes)),
      ElementKind::I16 => f32::from(LittleEndian::read_i16(bytes)),
      ElementKind::I32 => LittleEndian::read_i32(bytes) as f32,
      ElementKind::F32 => LittleEndian::read_f32(bytes),
      ElementKind::F64 => LittleEndian::read_f64(bytes) as f32,
    }
  }
}

/// Memory layout of a multi-dimensional array.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Order {
  /// Last index varies fastest (C order).
  RowMajor,

  /// First index varies fastest (Fortran order).
  ColMajor,
}

/// An immutable typed array with an owned little-endian byte buffer.
///
/// The buffer length always equals the product of the shape times the
/// element width. Transformations produce new arrays.
#[derive(Debug, PartialEq, Clone)]
pub struct VoxelArray {
  shape: Vec<usize>,
  kind: ElementKind,
  order: Order,
  data: Vec<u8>,
}

impl VoxelArray {
  /// Create an array from its raw parts.
  ///
  /// Fails if the shape has no dimensions or more than
  /// [`MAX_DIMS`], or if `data` does not hold exactly one element
  /// per position.
  pub fn new(
    shape: Vec<usize>,
    kind: ElementKind,
    order: Order,
    data: Vec<u8>,
  ) -> Result<Self, MedreconErr> {
    if shape.is_empty() || shape.len() > MAX_DIMS {
      return Err(MedreconErr::new_unsupported_shape(shape));
    }

    let expected = byte_len(&shape, kind).ok_or_else(|| {
      MedreconErr::new_invalid_header("array", format!("shape {:?} is too large", shape))
    })?;
    if data.len() != expected {
      return Err(MedreconErr::new_data_size_mismatch(data.len(), expected));
    }

    Ok(Self { shape, kind, order, data })
  }

  /// Create a row-major `f32` array.
  pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, MedreconErr> {
    let mut data = vec![0; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut data);
    Self::new(shape, ElementKind::F32, Order::RowMajor, data)
  }

  /// Create a row-major `u16` array.
  pub fn from_u16(shape: Vec<usize>, values: &[u16]) -> Result<Self, MedreconErr> {
    let mut data = vec![0; values.len() * 2];
    LittleEndian::write_u16_into(values, &mut data);
    Self::new(shape, ElementKind::U16, Order::RowMajor, data)
  }

  /// Create a row-major `u8` array.
  pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self, MedreconErr> {
    Self::new(shape, ElementKind::U8, Order::RowMajor, values)
  }

  /// The shape.
  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  /// The element type.
  pub fn kind(&self) -> ElementKind {
    self.kind
  }

  /// The memory layout.
  pub fn order(&self) -> Order {
    self.order
  }

  /// The raw little-endian bytes, in [memory order](Self::order).
  pub fn data(&self) -> &[u8] {
    &self.data
  }

  /// Number of elements.
  pub fn len(&self) -> usize {
    self.data.len() / self.kind.size()
  }

  /// Whether the array holds no elements.
  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Flat memory offset (in elements) of a multi-dimensional index.
  fn flat_index(&self, index: &[usize]) -> usize {
    let mut flat = 0;
    let mut stride = 1;

    match self.order {
      Order::ColMajor => {
        for (i, dim) in index.iter().zip(&self.shape) {
          flat += i * stride;
          stride *= dim;
        }
      }
      Order::RowMajor => {
        for (i, dim) in index.iter().zip(&self.shape).rev() {
          flat += i * stride;
          stride *= dim;
        }
      }
    }

    flat
  }

  /// Bytes of the element at a multi-dimensional index.
  fn element_bytes(&self, index: &[usize]) -> &[u8] {
    let size = self.kind.size();
    let start = self.flat_index(index) * size;
    &self.data[start..start + size]
  }

  /// Value of the element at a multi-dimensional index, as `f32`.
  ///
  /// # Notes
  ///
  /// Panics if `index` is out of bounds.
  pub fn get_f32(&self, index: &[usize]) -> f32 {
    self.kind.read_f32(self.element_bytes(index))
  }

  /// All values as `f32` in logical row-major order, whatever the
  /// memory layout.
  pub fn to_f32_row_major(&self) -> Vec<f32> {
    let size = self.kind.size();
    if self.order == Order::RowMajor || self.shape.len() == 1 {
      return self.data.chunks_exact(size).map(|bytes| self.kind.read_f32(bytes)).collect();
    }

    let mut out = Vec::with_capacity(self.len());
    for_each_index(&self.shape, Order::RowMajor, |index| out.push(self.get_f32(index)));
    out
  }

  /// All values as `f32` in logical column-major order, whatever the
  /// memory layout.
  pub fn to_f32_col_major(&self) -> Vec<f32> {
    let size = self.kind.size();
    if self.order == Order::ColMajor || self.shape.len() == 1 {
      return self.data.chunks_exact(size).map(|bytes| self.kind.read_f32(bytes)).collect();
    }

    let mut out = Vec::with_capacity(self.len());
    for_each_index(&self.shape, Order::ColMajor, |index| out.push(self.get_f32(index)));
    out
  }

  /// Smallest and largest value, or `None` for an empty array.
  pub fn min_max(&self) -> Option<(f32, f32)> {
    let size = self.kind.size();
    self.data.chunks_exact(size).map(|bytes| self.kind.read_f32(bytes)).fold(None, |acc, v| {
      match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
      }
    })
  }

  /// The shape with every dimension of size 1 removed.
  pub fn squeezed_shape(&self) -> Vec<usize> {
    self.shape.iter().copied().filter(|&dim| dim != 1).collect()
  }

  /// Reduce the array to a single 2D plane.
  ///
  /// Singleton dimensions are squeezed first. A 2D result is taken
  /// as is; a 3D result with a leading (checked first) or trailing
  /// channel axis of at most 4 keeps channel 0.
  ///
  /// # Returns
  ///
  /// `(height, width, values)` with values in row-major order, or
  /// `None` if the shape cannot be reduced.
  pub fn extract_2d(&self) -> Option<(usize, usize, Vec<f32>)> {
    let shape = self.squeezed_shape();
    let squeezed = Self {
      shape: shape.clone(),
      kind: self.kind,
      order: self.order,
      data: Vec::new(),
    };

    // Index into the squeezed layout, which shares the same memory
    // as the original since only size-1 dimensions were dropped.
    let read = |index: &[usize]| self.kind.read_f32(&self.data[squeezed.byte_range(index)]);

    match shape.as_slice() {
      [height, width] => {
        let (height, width) = (*height, *width);
        let mut out = Vec::with_capacity(height * width);
        for y in 0..height {
          for x in 0..width {
            out.push(read(&[y, x]));
          }
        }
        Some((height, width, out))
      }
      [channels, height, width] if *channels <= 4 => {
        let (height, width) = (*height, *width);
        let mut out = Vec::with_capacity(height * width);
        for y in 0..height {
          for x in 0..width {
            out.push(read(&[0, y, x]));
          }
        }
        Some((height, width, out))
      }
      [height, width, channels] if *channels <= 4 => {
        let (height, width) = (*height, *width);
        let mut out = Vec::with_capacity(height * width);
        for y in 0..height {
          for x in 0..width {
            out.push(read(&[y, x, 0]));
          }
        }
        Some((height, width, out))
      }
      _ => None,
    }
  }

  /// Byte range of the element at `index`, computed from this array's
  /// shape and order.
  fn byte_range(&self, index: &[usize]) -> Range<usize> {
    let size = self.kind.size();
    let start = self.flat_index(index) * size;
    start..start + size
  }

  /// Cut a rectangle out of a 2D array, keeping the element type.
  ///
  /// The result is always row-major.
  ///
  /// # Returns
  ///
  /// The cropped array, or [an error](MedreconErr) if the array is not
  /// 2D or the ranges do not lie inside it.
  pub fn crop_2d(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self, MedreconErr> {
    let fits = match *self.shape.as_slice() {
      [height, width] => rows.end <= height && cols.end <= width,
      _ => false,
    };
    if !fits {
      return Err(MedreconErr::new_unsupported_shape(self.shape.clone()));
    }

    let mut data = Vec::with_capacity(rows.len() * cols.len() * self.kind.size());
    for y in rows.clone() {
      for x in cols.clone() {
        data.extend_from_slice(self.element_bytes(&[y, x]));
      }
    }

    Ok(Self { shape: vec![rows.len(), cols.len()], kind: self.kind, order: Order::RowMajor, data })
  }

  /// A 2D plane of a 3D array along the last axis.
  ///
  /// # Returns
  ///
  /// The plane, or [an error](MedreconErr) if the array is not 3D or
  /// `index` is past the last plane.
  pub fn last_axis_plane(&self, index: usize) -> Result<Self, MedreconErr> {
    let (rows, cols, count) = match *self.shape.as_slice() {
      [rows, cols, count] => (rows, cols, count),
      _ => return Err(MedreconErr::new_unsupported_shape(self.shape.clone())),
    };
    if index >= count {
      return Err(MedreconErr::new_slice_index_out_of_range(index, count));
    }

    let mut data = Vec::with_capacity(rows * cols * self.kind.size());
    for y in 0..rows {
      for x in 0..cols {
        data.extend_from_slice(self.element_bytes(&[y, x, index]));
      }
    }

    Ok(Self { shape: vec![rows, cols], kind: self.kind, order: Order::RowMajor, data })
  }
}

/// Bytes needed for `shape` elements of `kind`, or `None` if that
/// overflows `usize`.
pub fn byte_len(shape: &[usize], kind: ElementKind) -> Option<usize> {
  shape.iter().try_fold(kind.size(), |acc, &dim| acc.checked_mul(dim))
}

/// Visit every index of `shape` in the given logical order.
fn for_each_index(shape: &[usize], order: Order, mut visit: impl FnMut(&[usize])) {
  if shape.iter().any(|&dim| dim == 0) {
    return;
  }

  // Axes from fastest to slowest.
  let axes: Vec<usize> = match order {
    Order::RowMajor => (0..shape.len()).rev().collect(),
    Order::ColMajor => (0..shape.len()).collect(),
  };

  let mut index = vec![0; shape.len()];
  loop {
    visit(&index);

    // Advance like an odometer.
    let mut carried = true;
    for &axis in &axes {
      index[axis] += 1;
      if index[axis] < shape[axis] {
        carried = false;
        break;
      }
      index[axis] = 0;
    }

    if carried {
      return;
    }
  }
}
