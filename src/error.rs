//! The primary error-type for the library.
//!
//! A single error type covers every codec and the reconstruction
//! pipeline. Each variant belongs to one broad [category](ErrorKind),
//! which is what callers at the service boundary usually care about.

use derive_more::{Display, From};
use derive_new::new;
use std::io;

/// Broad error categories shared by every operation in the library.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Bad magic, length, VR or header size.
  #[display(fmt = "malformed input")]
  MalformedInput,

  /// A required tag or archive key is absent.
  #[display(fmt = "missing required field")]
  MissingRequiredField,

  /// Inconsistent dimensions between slices or arrays.
  #[display(fmt = "shape mismatch")]
  ShapeMismatch,

  /// A data type or encoding outside the supported subset.
  #[display(fmt = "unsupported encoding")]
  UnsupportedEncoding,

  /// Nothing to produce: zero triangles, zero input files.
  #[display(fmt = "empty result")]
  EmptyResult,

  /// Underlying read/write failure.
  #[display(fmt = "I/O failure")]
  IoFailure,
}

/// Library error type.
#[derive(new, Display, From, Debug)]
pub enum Err {
  /// IO errors.
  #[display(fmt = "IO error: {}", _0)]
  Io(io::Error),

  /// Errors from the zip container underneath an npz archive.
  #[display(fmt = "Archive container error: {}", _0)]
  Archive(zip::result::ZipError),

  /// Errors while serializing the glTF scene description.
  #[display(fmt = "JSON error: {}", _0)]
  Json(serde_json::Error),

  /// A magic sequence did not match.
  #[from(ignore)]
  #[display(fmt = "{}: bad magic", format)]
  BadMagic {
    /// The format being parsed.
    format: &'static str,
  },

  /// Input ended before a complete structure could be read.
  #[from(ignore)]
  #[display(fmt = "{}: need {} bytes, only {} available", what, needed, available)]
  Truncated {
    /// What was being read.
    what: &'static str,

    /// Bytes required.
    needed: usize,

    /// Bytes present.
    available: usize,
  },

  /// A header field holds a value that makes no sense.
  #[from(ignore)]
  #[display(fmt = "{}: invalid header: {}", format, reason)]
  InvalidHeader {
    /// The format being parsed.
    format: &'static str,

    /// Human readable description of the problem.
    reason: String,
  },

  /// A DICOM element carries a VR that is not two uppercase letters.
  #[from(ignore)]
  #[display(fmt = "Invalid DICOM VR {:?} at offset {}", vr, offset)]
  InvalidVr {
    /// Byte offset of the element.
    offset: usize,

    /// The offending VR bytes.
    vr: [u8; 2],
  },

  /// A required DICOM tag is not present.
  #[from(ignore)]
  #[display(fmt = "Missing DICOM tag ({:04X},{:04X})", group, element)]
  MissingTag {
    /// Tag group.
    group: u16,

    /// Tag element.
    element: u16,
  },

  /// PixelData holds fewer bytes than `rows * cols * 2`.
  #[from(ignore)]
  #[display(fmt = "PixelData has {} bytes, expecting {}", actual, expected)]
  TruncatedPixelData {
    /// The size of PixelData in bytes.
    actual: usize,

    /// The expected size in bytes.
    expected: usize,
  },

  /// An archive has no entry usable for the requested role.
  #[from(ignore)]
  #[display(fmt = "Archive has no {} entry", role)]
  MissingEntry {
    /// Which entry was looked for (raw, annotation, explicit key).
    role: String,
  },

  /// The buffer size does not match the shape and element width.
  #[from(ignore)]
  #[display(fmt = "Data size of {} bytes does not match shape: expecting {} bytes", actual, expected)]
  DataSizeMismatch {
    /// The size of data in bytes.
    actual: usize,

    /// The expected size in bytes.
    expected: usize,
  },

  /// Slices or arrays that must agree in (height, width) do not.
  #[from(ignore)]
  #[display(fmt = "{}: expected (height, width) {:?}, found {:?}", context, expected, actual)]
  ShapeMismatch {
    /// Where the mismatch was found.
    context: String,

    /// The reference (height, width).
    expected: (usize, usize),

    /// The offending (height, width).
    actual: (usize, usize),
  },

  /// An array shape that cannot be reduced to what an operation needs.
  #[from(ignore)]
  #[display(fmt = "Unsupported array shape {:?}", shape)]
  UnsupportedShape {
    /// The shape as found.
    shape: Vec<usize>,
  },

  /// An npy dtype outside the supported subset.
  #[from(ignore)]
  #[display(fmt = "Unsupported array dtype {}", descr)]
  UnsupportedDtype {
    /// The npy descr string.
    descr: String,
  },

  /// A NIfTI datatype/bitpix pair outside the supported subset.
  #[from(ignore)]
  #[display(fmt = "Unsupported NIfTI datatype {} with bitpix {}", code, bitpix)]
  UnsupportedDatatype {
    /// NIfTI datatype code.
    code: i16,

    /// Bits per voxel.
    bitpix: i16,
  },

  /// A DICOM element with undefined length (sequences, encapsulated data).
  #[from(ignore)]
  #[display(fmt = "Undefined length element ({:04X},{:04X}) is not supported", group, element)]
  UndefinedLength {
    /// Tag group.
    group: u16,

    /// Tag element.
    element: u16,
  },

  /// A value too large for the field that has to describe it.
  #[from(ignore)]
  #[display(fmt = "{} of {} bytes does not fit its length field", what, size)]
  TooLarge {
    /// What was being written.
    what: &'static str,

    /// The size in bytes.
    size: usize,
  },

  /// A requested slice index is past the last z-slice.
  #[from(ignore)]
  #[display(fmt = "Slice index {} out of range for {} slices", index, count)]
  SliceIndexOutOfRange {
    /// The requested index.
    index: usize,

    /// The number of slices available.
    count: usize,
  },

  /// A directory held no input files of the expected kind.
  #[from(ignore)]
  #[display(fmt = "No input files found in {}", dir)]
  NoSlices {
    /// The directory that was scanned.
    dir: String,
  },

  /// A stack carried no annotation and raw thresholding is disabled.
  #[from(ignore)]
  #[display(fmt = "No annotation found and raw thresholding is disabled")]
  NoAnnotation,

  /// Mesh extraction produced nothing to serialize.
  #[from(ignore)]
  #[display(fmt = "Mesh is empty, check the annotation or threshold")]
  EmptyMesh,

  /// A textured primitive exists but no PNG texture was produced.
  #[from(ignore)]
  #[display(fmt = "A primitive requests a texture but no PNG texture was encoded")]
  TextureRequiredButMissing,

  /// A file format that cannot take part in the requested conversion.
  #[from(ignore)]
  #[display(fmt = "Unsupported format: {}", format)]
  UnsupportedFormat {
    /// The format or file extension.
    format: String,
  },

  /// Crop rectangle text could not be parsed.
  #[from(ignore)]
  #[display(fmt = "Invalid crop {:?}: expecting four integers xL,xR,yL,yR", text)]
  InvalidCrop {
    /// The text as given.
    text: String,
  },
}

impl std::error::Error for Err {}

impl Err {
  /// The broad category this error belongs to.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Err::Io(_) => ErrorKind::IoFailure,
      Err::Archive(zip::result::ZipError::Io(_)) => ErrorKind::IoFailure,
      Err::Archive(zip::result::ZipError::FileNotFound) => ErrorKind::MissingRequiredField,
      Err::Archive(zip::result::ZipError::UnsupportedArchive(_)) => {
        ErrorKind::UnsupportedEncoding
      }
      Err::Archive(_) => ErrorKind::MalformedInput,
      Err::Json(_) => ErrorKind::MalformedInput,
      Err::BadMagic { .. } => ErrorKind::MalformedInput,
      Err::Truncated { .. } => ErrorKind::MalformedInput,
      Err::InvalidHeader { .. } => ErrorKind::MalformedInput,
      Err::InvalidVr { .. } => ErrorKind::MalformedInput,
      Err::MissingTag { .. } => ErrorKind::MissingRequiredField,
      Err::TruncatedPixelData { .. } => ErrorKind::MalformedInput,
      Err::MissingEntry { .. } => ErrorKind::MissingRequiredField,
      Err::DataSizeMismatch { .. } => ErrorKind::MalformedInput,
      Err::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
      Err::UnsupportedShape { .. } => ErrorKind::ShapeMismatch,
      Err::UnsupportedDtype { .. } => ErrorKind::UnsupportedEncoding,
      Err::UnsupportedDatatype { .. } => ErrorKind::UnsupportedEncoding,
      Err::UndefinedLength { .. } => ErrorKind::UnsupportedEncoding,
      Err::TooLarge { .. } => ErrorKind::UnsupportedEncoding,
      Err::SliceIndexOutOfRange { .. } => ErrorKind::MalformedInput,
      Err::NoSlices { .. } => ErrorKind::EmptyResult,
      Err::NoAnnotation => ErrorKind::MissingRequiredField,
      Err::EmptyMesh => ErrorKind::EmptyResult,
      Err::TextureRequiredButMissing => ErrorKind::MissingRequiredField,
      Err::UnsupportedFormat { .. } => ErrorKind::UnsupportedEncoding,
      Err::InvalidCrop { .. } => ErrorKind::MalformedInput,
    }
  }
}
