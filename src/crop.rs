//! Crop rectangles applied to archive entries before re-encoding. The
//! primary structure is the [crop rectangle](CropRect).

use crate::array::VoxelArray;
use crate::npz::LabeledArchive;
use crate::MedreconErr;
use atoi::FromRadix10SignedChecked;
use log::{debug, warn};
use std::ops::Range;
use std::str::FromStr;

/// A crop rectangle in pixel coordinates, half-open on the right and
/// bottom.
///
/// `x` runs along columns, `y` along rows. The all-`-1` rectangle is
/// the [no crop](CropRect::NONE) sentinel.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CropRect {
  /// First column kept.
  pub x_left: i64,

  /// One past the last column kept.
  pub x_right: i64,

  /// First row kept.
  pub y_top: i64,

  /// One past the last row kept.
  pub y_bottom: i64,
}

impl Default for CropRect {
  fn default() -> Self {
    Self::NONE
  }
}

impl CropRect {
  /// The "no crop" sentinel.
  pub const NONE: Self = Self { x_left: -1, x_right: -1, y_top: -1, y_bottom: -1 };

  /// Create a crop rectangle.
  pub fn new(x_left: i64, x_right: i64, y_top: i64, y_bottom: i64) -> Self {
    Self { x_left, x_right, y_top, y_bottom }
  }

  /// Whether this is the [no crop](CropRect::NONE) sentinel.
  pub fn is_none(&self) -> bool {
    *self == Self::NONE
  }

  /// Row and column ranges of the crop inside a `height` by `width`
  /// image.
  ///
  /// # Returns
  ///
  /// `None` for the sentinel, and for any rectangle not satisfying
  /// `0 <= x_left < x_right <= width` and
  /// `0 <= y_top < y_bottom <= height`.
  pub fn ranges(&self, height: usize, width: usize) -> Option<(Range<usize>, Range<usize>)> {
    if self.is_none() {
      return None;
    }

    let span = |lo: i64, hi: i64, limit: usize| {
      let lo = usize::try_from(lo).ok()?;
      let hi = usize::try_from(hi).ok()?;
      (lo < hi && hi <= limit).then_some(lo..hi)
    };

    Some((span(self.y_top, self.y_bottom, height)?, span(self.x_left, self.x_right, width)?))
  }

  /// Crop a 2D array.
  ///
  /// Arrays that are not 2D, or that the rectangle does not fit, are
  /// returned unchanged.
  pub fn apply_array(&self, array: &VoxelArray) -> VoxelArray {
    let (height, width) = match *array.shape() {
      [height, width] => (height, width),
      _ => return array.clone(),
    };

    let cropped =
      self.ranges(height, width).and_then(|(rows, cols)| array.crop_2d(rows, cols).ok());
    cropped.unwrap_or_else(|| {
      if !self.is_none() {
        debug!("Crop {} does not fit {}x{}, leaving entry as is", self, height, width);
      }
      array.clone()
    })
  }

  /// Crop every 2D entry of an archive, see
  /// [`apply_array`](Self::apply_array).
  pub fn apply(&self, archive: &LabeledArchive) -> LabeledArchive {
    if self.is_none() {
      return archive.clone();
    }

    archive.map(|_, array| self.apply_array(array))
  }
}

impl std::fmt::Display for CropRect {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "{},{},{},{}", self.x_left, self.x_right, self.y_top, self.y_bottom)
  }
}

impl FromStr for CropRect {
  type Err = MedreconErr;

  /// Parse `xL,xR,yL,yR`. Whitespace around each value is ignored.
  fn from_str(text: &str) -> Result<Self, Self::Err> {
    let invalid = || MedreconErr::new_invalid_crop(text.into());
    let mut values = text.split(',');

    /// Parse the next comma separated value.
    ///
    /// # Uses
    ///
    /// * `values` - The iterator over the comma separated values.
    ///
    /// # Returns
    ///
    /// The value parsed or exits the function with [an
    /// error](MedreconErr) in case of a missing, invalid or
    /// overflowing value.
    macro_rules! next_value {
      () => {{
        let value = values.next().ok_or_else(invalid)?.trim();
        let (parsed, used) = i64::from_radix_10_signed_checked(value.as_bytes());

        if used == 0 || used != value.len() {
          // Empty, or trailing junk after the digits.
          return Err(invalid());
        }

        parsed.ok_or_else(invalid)?
      }};
    }

    let x_left = next_value!();
    let x_right = next_value!();
    let y_top = next_value!();
    let y_bottom = next_value!();

    if values.next().is_some() {
      warn!("Crop {:?} has more than four values", text);
      return Err(invalid());
    }

    Ok(Self { x_left, x_right, y_top, y_bottom })
  }
}

#[cfg(test)]
mod crop_tests {
  use super::CropRect;
  use crate::array::VoxelArray;
  use crate::npz::LabeledArchive;
  use crate::ErrorKind;

  fn ramp(height: usize, width: usize) -> VoxelArray {
    let values: Vec<f32> = (0..height * width).map(|v| v as f32).collect();
    VoxelArray::from_f32(vec![height, width], &values).unwrap()
  }

  #[test]
  fn parse() {
    assert_eq!("10,20,5,15".parse::<CropRect>().unwrap(), CropRect::new(10, 20, 5, 15));
    assert_eq!(" -1, -1 ,-1,-1".parse::<CropRect>().unwrap(), CropRect::NONE);
  }

  #[test]
  fn parse_errors() {
    for text in ["", "1,2,3", "1,2,3,4,5", "1,2,x,4", "1,2,3,4a", "1,,3,4"] {
      let err = text.parse::<CropRect>().unwrap_err();
      assert_eq!(err.kind(), ErrorKind::MalformedInput, "{:?}", text);
    }
  }

  #[test]
  fn parse_overflow() {
    assert!("1,2,3,99999999999999999999".parse::<CropRect>().is_err());
  }

  #[test]
  fn display_round_trip() {
    let crop = CropRect::new(1, 2, 3, 4);
    assert_eq!(crop.to_string().parse::<CropRect>().unwrap(), crop);
  }

  #[test]
  fn ranges() {
    let crop = CropRect::new(10, 20, 5, 15);
    assert_eq!(crop.ranges(32, 32), Some((5..15, 10..20)));
    assert_eq!(crop.ranges(14, 32), None);
    assert_eq!(CropRect::new(3, 3, 0, 1).ranges(8, 8), None);
    assert_eq!(CropRect::new(-2, 3, 0, 1).ranges(8, 8), None);
    assert_eq!(CropRect::NONE.ranges(8, 8), None);
  }

  #[test]
  fn crops_fitting_entries_only() {
    let archive = LabeledArchive::new().with("image", ramp(32, 32)).with("small", ramp(8, 8));
    let cropped = CropRect::new(10, 20, 5, 15).apply(&archive);

    let image = cropped.get("image").unwrap();
    assert_eq!(image.shape(), &[10, 10]);
    assert_eq!(image.get_f32(&[0, 0]), (5 * 32 + 10) as f32);
    assert_eq!(cropped.get("small"), archive.get("small"));
  }

  #[test]
  fn sentinel_is_identity() {
    let archive = LabeledArchive::new().with("image", ramp(4, 4));
    assert_eq!(CropRect::NONE.apply(&archive), archive);
  }
}
