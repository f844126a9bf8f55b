//! Utilities for working with directories of slice files.

use atoi::atoi;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Length of the run of ASCII digits at the start of `bytes`.
fn digit_run(bytes: &[u8]) -> usize {
  bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// Compare two runs of digits by their numeric value.
///
/// Runs too long for a `u64` are compared by their significant digits
/// instead, which gives the same answer without overflowing.
fn cmp_numeric(a: &[u8], b: &[u8]) -> Ordering {
  match (atoi::<u64>(a), atoi::<u64>(b)) {
    (Some(a), Some(b)) => a.cmp(&b),
    _ => {
      let a = &a[digit_run_zeros(a)..];
      let b = &b[digit_run_zeros(b)..];
      a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
  }
}

/// Number of leading zeros in a run of digits, keeping at least one
/// digit.
fn digit_run_zeros(digits: &[u8]) -> usize {
  let zeros = digits.iter().take_while(|&&b| b == b'0').count();
  zeros.min(digits.len().saturating_sub(1))
}

/// Compare two names in natural order.
///
/// Runs of digits compare by numeric value, everything else compares
/// byte by byte ignoring ASCII case. When one name runs out first
/// without a difference, the shorter name sorts first.
///
/// # Examples
///
/// ```
/// use medrecon::utils::natural_cmp;
/// use std::cmp::Ordering;
///
/// assert_eq!(natural_cmp("slice2.npz", "slice10.npz"), Ordering::Less);
/// assert_eq!(natural_cmp("Slice1.npz", "slice1.npz"), Ordering::Equal);
/// ```
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
  let (a, b) = (a.as_bytes(), b.as_bytes());
  let (mut i, mut j) = (0, 0);

  while i < a.len() && j < b.len() {
    if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
      let run_a = digit_run(&a[i..]);
      let run_b = digit_run(&b[j..]);

      match cmp_numeric(&a[i..i + run_a], &b[j..j + run_b]) {
        Ordering::Equal => {}
        ord => return ord,
      }

      i += run_a;
      j += run_b;
    } else {
      match a[i].to_ascii_lowercase().cmp(&b[j].to_ascii_lowercase()) {
        Ordering::Equal => {}
        ord => return ord,
      }

      i += 1;
      j += 1;
    }
  }

  a.len().cmp(&b.len())
}

/// Compare two paths by their file names in natural order.
pub fn natural_path_cmp(a: &Path, b: &Path) -> Ordering {
  let name = |path: &Path| path.file_name().map(|name| name.to_string_lossy().into_owned());
  natural_cmp(&name(a).unwrap_or_default(), &name(b).unwrap_or_default())
}

/// List the regular files in `dir` with the given extension, in
/// natural order of their file names.
///
/// # Arguments
///
/// * `dir` - The directory to scan (not recursively).
///
/// * `extension` - The extension without the leading dot, compared
/// exactly.
pub fn list_files(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();

  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    if !entry.file_type()?.is_file() {
      continue;
    }

    let path = entry.path();
    if path.extension().map_or(false, |ext| ext == extension) {
      files.push(path);
    }
  }

  files.sort_by(|a, b| natural_path_cmp(a, b));
  Ok(files)
}


#[cfg(test)]
mod test_list_files {
  use super::*;
  use std::fs::File;

  #[test]
  fn filters_and_sorts() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["slice10.npz", "slice2.npz", "notes.txt", "slice1.npz"] {
      File::create(dir.path().join(name)).unwrap();
    }
    fs::create_dir(dir.path().join("nested.npz")).unwrap();

    let files = list_files(dir.path(), "npz").unwrap();
    let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
    assert_eq!(names, vec!["slice1.npz", "slice2.npz", "slice10.npz"]);
  }
}
