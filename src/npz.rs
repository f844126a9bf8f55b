//! Labeled archives stored as `.npz` files: a zip container holding
//! one `.npy` member per named array.
//!
//! Entries are kept sorted by key so that "the first entry" is
//! deterministic.

use crate::array::{self, ElementKind, Order, VoxelArray};
use crate::MedreconErr;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Keys tried, in order, for the raw-intensity entry.
pub const RAW_KEYS: [&str; 7] = ["image", "img", "raw", "ct", "data", "slice", "input"];

/// Keys tried, in order, for the annotation entry.
pub const ANNOTATION_KEYS: [&str; 5] = ["label", "mask", "seg", "annotation", "gt"];

/// Magic prefix of every `.npy` member.
const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Header block alignment used when writing `.npy` members.
const NPY_ALIGN: usize = 64;

/// Explicit entry names that take precedence over the preference
/// lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SliceKeys {
  /// Name of the raw-intensity entry.
  pub raw: Option<String>,

  /// Name of the annotation entry.
  pub annotation: Option<String>,
}

/// A set of named arrays.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LabeledArchive {
  entries: BTreeMap<String, VoxelArray>,
}

impl LabeledArchive {
  /// An empty archive.
  pub fn new() -> Self {
    Self::default()
  }

  /// Add or replace an entry, builder style.
  pub fn with(mut self, key: impl Into<String>, array: VoxelArray) -> Self {
    self.insert(key, array);
    self
  }

  /// Add or replace an entry.
  pub fn insert(&mut self, key: impl Into<String>, array: VoxelArray) {
    self.entries.insert(key.into(), array);
  }

  /// Look up an entry by exact key.
  pub fn get(&self, key: &str) -> Option<&VoxelArray> {
    self.entries.get(key)
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the archive holds no entries.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Iterate over `(key, array)` pairs in key order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &VoxelArray)> {
    self.entries.iter().map(|(key, array)| (key.as_str(), array))
  }

  /// Apply a transformation to every entry, producing a new archive.
  pub fn map(&self, mut f: impl FnMut(&str, &VoxelArray) -> VoxelArray) -> Self {
    let entries = self.entries.iter().map(|(key, array)| (key.clone(), f(key, array))).collect();
    Self { entries }
  }

  /// Key of the raw-intensity entry.
  ///
  /// An explicit key wins if present, then the first match from
  /// [`RAW_KEYS`], then the first entry.
  pub fn raw_key(&self, keys: &SliceKeys) -> Option<&str> {
    if let Some(key) = keys.raw.as_deref().filter(|key| self.entries.contains_key(*key)) {
      return self.entries.get_key_value(key).map(|(key, _)| key.as_str());
    }

    RAW_KEYS
      .iter()
      .find_map(|key| self.entries.get_key_value(*key))
      .or_else(|| self.entries.iter().next())
      .map(|(key, _)| key.as_str())
  }

  /// Key of the annotation entry.
  ///
  /// An explicit key wins if present, then the first match from
  /// [`ANNOTATION_KEYS`]. Otherwise, an archive of exactly two
  /// entries uses the one that is not the raw entry.
  pub fn annotation_key(&self, keys: &SliceKeys) -> Option<&str> {
    if let Some(key) = keys.annotation.as_deref().filter(|key| self.entries.contains_key(*key)) {
      return self.entries.get_key_value(key).map(|(key, _)| key.as_str());
    }

    if let Some((key, _)) = ANNOTATION_KEYS.iter().find_map(|key| self.entries.get_key_value(*key))
    {
      return Some(key.as_str());
    }

    if self.entries.len() != 2 {
      return None;
    }

    let raw = self.raw_key(keys)?;
    self.entries.keys().map(String::as_str).find(|key| *key != raw)
  }

  /// The raw-intensity entry, see [`raw_key`](Self::raw_key).
  pub fn raw_entry(&self, keys: &SliceKeys) -> Option<&VoxelArray> {
    self.raw_key(keys).and_then(|key| self.entries.get(key))
  }

  /// The annotation entry, see [`annotation_key`](Self::annotation_key).
  pub fn annotation_entry(&self, keys: &SliceKeys) -> Option<&VoxelArray> {
    self.annotation_key(keys).and_then(|key| self.entries.get(key))
  }

  /// Parse an archive from the bytes of an `.npz` file.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, MedreconErr> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = BTreeMap::new();

    for i in 0..zip.len() {
      let mut member = zip.by_index(i)?;
      if member.is_dir() {
        continue;
      }

      let name = member.name().to_owned();
      let key = name.strip_suffix(".npy").unwrap_or(&name).to_owned();

      let mut contents = Vec::with_capacity(member.size() as usize);
      member.read_to_end(&mut contents)?;

      trace!("npz member {} ({} bytes)", name, contents.len());
      entries.insert(key, read_npy(&contents)?);
    }

    debug!("Loaded archive with {} entries", entries.len());
    Ok(Self { entries })
  }

  /// Read and parse an `.npz` file.
  pub fn load(path: &Path) -> Result<Self, MedreconErr> {
    Self::from_bytes(&std::fs::read(path)?)
  }

  /// Serialize to the bytes of an `.npz` file.
  pub fn to_bytes(&self) -> Result<Vec<u8>, MedreconErr> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (key, array) in &self.entries {
      zip.start_file(format!("{}.npy", key), options)?;
      zip.write_all(&write_npy(array))?;
    }

    Ok(zip.finish()?.into_inner())
  }

  /// Serialize and write to an `.npz` file.
  pub fn save(&self, path: &Path) -> Result<(), MedreconErr> {
    std::fs::write(path, self.to_bytes()?)?;
    Ok(())
  }
}

/// Parse a `.npy` member.
fn read_npy(bytes: &[u8]) -> Result<VoxelArray, MedreconErr> {
  if bytes.len() < 10 {
    return Err(MedreconErr::new_truncated("npy preamble", 10, bytes.len()));
  }

  if &bytes[..6] != NPY_MAGIC {
    return Err(MedreconErr::new_bad_magic("npy"));
  }

  // Version 1 stores the header length in 2 bytes, later versions in 4.
  let (header_len, header_start) = match bytes[6] {
    1 => (usize::from(LittleEndian::read_u16(&bytes[8..10])), 10),
    2 | 3 => {
      if bytes.len() < 12 {
        return Err(MedreconErr::new_truncated("npy preamble", 12, bytes.len()));
      }
      (LittleEndian::read_u32(&bytes[8..12]) as usize, 12)
    }
    version => {
      return Err(MedreconErr::new_invalid_header("npy", format!("version {}", version)));
    }
  };

  let data_start = header_start + header_len;
  if bytes.len() < data_start {
    return Err(MedreconErr::new_truncated("npy header", data_start, bytes.len()));
  }

  let header = std::str::from_utf8(&bytes[header_start..data_start])
    .map_err(|_| MedreconErr::new_invalid_header("npy", "header is not UTF-8".into()))?;

  let descr = header_field(header, "descr")
    .map(|value| value.trim_matches(|c: char| c == '\'' || c == '"').to_owned())
    .ok_or_else(|| MedreconErr::new_invalid_header("npy", "missing descr".into()))?;

  let kind = ElementKind::from_descr(&descr).ok_or(MedreconErr::UnsupportedDtype { descr })?;

  let order = match header_field(header, "fortran_order") {
    Some("True") => Order::ColMajor,
    Some("False") => Order::RowMajor,
    _ => return Err(MedreconErr::new_invalid_header("npy", "missing fortran_order".into())),
  };

  let shape = header_field(header, "shape")
    .and_then(parse_shape)
    .ok_or_else(|| MedreconErr::new_invalid_header("npy", "missing or bad shape".into()))?;

  let needed = array::byte_len(&shape, kind)
    .and_then(|len| len.checked_add(data_start))
    .ok_or_else(|| MedreconErr::new_invalid_header("npy", format!("shape {:?} too large", shape)))?;
  if bytes.len() < needed {
    return Err(MedreconErr::new_truncated("npy data", needed, bytes.len()));
  }

  let shape = fit_dims(shape)?;
  VoxelArray::new(shape, kind, order, bytes[data_start..needed].to_vec())
}

/// Extract the raw text of one value from an npy header dict.
///
/// # Notes
///
/// This is not a real Python literal parser. It relies on the fixed
/// layout numpy writes: `{'key': value, ...}` where only the shape
/// tuple contains commas.
fn header_field<'h>(header: &'h str, key: &str) -> Option<&'h str> {
  let quoted = [format!("'{}'", key), format!("\"{}\"", key)];
  let start = quoted.iter().find_map(|q| header.find(q.as_str()).map(|pos| pos + q.len()))?;
  let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();

  let end = if rest.starts_with('(') {
    rest.find(')')? + 1
  } else {
    rest.find(|c: char| c == ',' || c == '}').unwrap_or(rest.len())
  };

  Some(rest[..end].trim())
}

/// Parse a shape tuple such as `(3, 4)`, `(5,)` or `()`.
fn parse_shape(text: &str) -> Option<Vec<usize>> {
  let inner = text.strip_prefix('(')?.strip_suffix(')')?;
  inner
    .split(',')
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .map(|part| part.trim_end_matches('L').parse::<usize>().ok())
    .collect()
}

/// Bring a shape within the supported number of dimensions.
///
/// Scalars become a single element; shapes with too many dimensions
/// lose leading singleton axes, which does not change memory layout.
fn fit_dims(mut shape: Vec<usize>) -> Result<Vec<usize>, MedreconErr> {
  if shape.is_empty() {
    return Ok(vec![1]);
  }

  while shape.len() > crate::array::MAX_DIMS {
    match shape.iter().position(|&dim| dim == 1) {
      Some(pos) => {
        shape.remove(pos);
      }
      None => return Err(MedreconErr::new_unsupported_shape(shape)),
    }
  }

  Ok(shape)
}

/// Serialize an array as a version 1.0 `.npy` member.
fn write_npy(array: &VoxelArray) -> Vec<u8> {
  let shape = match array.shape() {
    [dim] => format!("({},)", dim),
    dims => format!("({})", dims.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")),
  };

  let fortran = if array.order() == Order::ColMajor { "True" } else { "False" };
  let mut header = format!(
    "{{'descr': '{}', 'fortran_order': {}, 'shape': {}, }}",
    array.kind().descr(),
    fortran,
    shape
  );

  // Pad with spaces so that the data starts on an aligned offset, the
  // header always ending with a newline.
  let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
  let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
  header.extend(std::iter::repeat(' ').take(padding));
  header.push('\n');

  let mut out = Vec::with_capacity(10 + header.len() + array.data().len());
  out.extend_from_slice(NPY_MAGIC);
  out.extend_from_slice(&[1, 0]);
  out.extend_from_slice(&(header.len() as u16).to_le_bytes());
  out.extend_from_slice(header.as_bytes());
  out.extend_from_slice(array.data());
  out
}
