#![warn(clippy::all)]

use clap::Parser;
use derive_more::{Display, From};
use derive_new::new;
use log::{debug, info, trace};
use medrecon::convert::{self, ConvertOptions, Format};
use medrecon::reconstruct::{self, ReconstructOptions};
use medrecon::{CropRect, MedreconErr, SliceKeys};
use memmap::{Mmap, MmapOptions};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// General top-level errors.
#[derive(new, From, Display)]
#[display(fmt = "{}")]
enum Err {
  /// IO Errors.
  #[display(fmt = "IO Error: {}", _0)]
  Io(io::Error),

  /// Errors from the medrecon library.
  #[display(fmt = "Library Error: {}", _0)]
  Medrecon(MedreconErr),
}

/// When returning an error from main(), this will print its Display
/// impl rather than its Debug impl.
impl fmt::Debug for Err {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    (self as &dyn fmt::Display).fmt(f)
  }
}

/// Transcode medical slices and rebuild meshes from slice stacks.
#[derive(Debug, clap::Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
  /// Verbose output (can be specified multiple times).
  #[clap(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[clap(subcommand)]
  command: Command,
}

/// Archive key overrides.
#[derive(Debug, clap::Args)]
struct KeyArgs {
  /// Archive entry holding the raw image.
  #[clap(long, name = "raw-key")]
  raw_key: Option<String>,

  /// Archive entry holding the annotation.
  #[clap(long, name = "annotation-key")]
  annotation_key: Option<String>,
}

impl From<KeyArgs> for SliceKeys {
  fn from(args: KeyArgs) -> Self {
    SliceKeys { raw: args.raw_key, annotation: args.annotation_key }
  }
}

#[derive(Debug, clap::Subcommand)]
enum Command {
  /// Rebuild a GLB mesh from a directory of .npz slices.
  Glb {
    /// Input: Directory of .npz slices.
    input: PathBuf,

    /// Output: GLB file.
    output: PathBuf,

    #[clap(flatten)]
    keys: KeyArgs,

    /// Annotation values above this and up to 1 form the red mesh.
    #[clap(long, default_value_t = 0.0)]
    annotation_threshold: f32,

    /// Fail instead of thresholding raw intensities when no slice has
    /// an annotation.
    #[clap(long)]
    no_raw_threshold: bool,
  },

  /// Encode a .npz archive as DICOM.
  ToDicom(FileArgs),

  /// Decode a DICOM file into a .npz archive.
  FromDicom(FileArgs),

  /// Encode a .npz archive as NIfTI.
  ToNifti(FileArgs),

  /// Decode a NIfTI file into a .npz archive.
  FromNifti(FileArgs),

  /// Render the raw image of a .npz, DICOM or NIfTI file as PNG.
  Png(FileArgs),

  /// Encode a directory of .npz archives as DICOM, or back with
  /// --decode.
  DicomDir(DirArgs),

  /// Encode a directory of .npz archives as NIfTI, or back with
  /// --decode.
  NiftiDir(DirArgs),
}

/// Single file conversion.
#[derive(Debug, clap::Args)]
struct FileArgs {
  /// Input file.
  input: PathBuf,

  /// Output file.
  output: PathBuf,

  #[clap(flatten)]
  convert: ConvertArgs,
}

/// Directory conversion.
#[derive(Debug, clap::Args)]
struct DirArgs {
  /// Input directory.
  input: PathBuf,

  /// Output directory, created if missing.
  output: PathBuf,

  /// Decode into .npz archives instead of encoding them.
  #[clap(short, long)]
  decode: bool,

  #[clap(flatten)]
  convert: ConvertArgs,
}

#[derive(Debug, clap::Args)]
struct ConvertArgs {
  #[clap(flatten)]
  keys: KeyArgs,

  /// Crop 2D entries to xLeft,xRight,yTop,yBottom before encoding.
  #[clap(long, allow_hyphen_values = true)]
  crop: Option<CropRect>,

  /// NIfTI slice to decode when the file has no embedded archive.
  #[clap(long)]
  slice: Option<usize>,
}

impl From<ConvertArgs> for ConvertOptions {
  fn from(args: ConvertArgs) -> Self {
    ConvertOptions {
      keys: args.keys.into(),
      crop: args.crop.unwrap_or_default(),
      slice: args.slice,
    }
  }
}

fn main() -> Result<(), Err> {
  let opt = Opt::parse();

  let log_level = match opt.verbose {
    0 => log::LevelFilter::Warn,
    1 => log::LevelFilter::Info,
    2 => log::LevelFilter::Debug,
    _ => log::LevelFilter::Trace,
  };

  env_logger::Builder::new().filter_level(log_level).try_init().unwrap_or_else(|e| {
    eprintln!("Error initializing logger: {}", e);
  });

  info!("Informational output enabled.");
  debug!("Debug output enabled.");
  trace!("Tracing output enabled.");

  match opt.command {
    Command::Glb { input, output, keys, annotation_threshold, no_raw_threshold } => {
      let options = ReconstructOptions {
        keys: keys.into(),
        annotation_threshold,
        use_raw_threshold: !no_raw_threshold,
      };

      let reconstruction = reconstruct::convert_directory_to_glb(&input, &output, &options)?;
      println!(
        "{}: {:?} mode, triangles {:?}",
        output.display(),
        reconstruction.mode,
        reconstruction.triangle_counts()
      );
    }
    Command::ToDicom(args) => convert_one(args, Some(Format::Npz), Format::Dicom)?,
    Command::FromDicom(args) => convert_one(args, Some(Format::Dicom), Format::Npz)?,
    Command::ToNifti(args) => convert_one(args, Some(Format::Npz), Format::Nifti)?,
    Command::FromNifti(args) => convert_one(args, Some(Format::Nifti), Format::Npz)?,
    Command::Png(args) => convert_one(args, None, Format::Png)?,
    Command::DicomDir(args) => convert_many(args, Format::Dicom)?,
    Command::NiftiDir(args) => convert_many(args, Format::Nifti)?,
  }

  Ok(())
}

/// Memory-map an input file.
fn map_input(path: &Path) -> Result<Mmap, Err> {
  let file = File::open(path)?;
  let map = unsafe { MmapOptions::new().map(&file)? };

  info!("Mapped {} bytes of data from {}", map.len(), path.display());
  Ok(map)
}

/// Convert a single file. The input format is guessed from its
/// extension when `from` is not given.
fn convert_one(args: FileArgs, from: Option<Format>, to: Format) -> Result<(), Err> {
  let from = match from {
    Some(from) => from,
    None => Format::from_path(&args.input)?,
  };

  let map = map_input(&args.input)?;
  let converted = convert::convert_bytes(&map, from, to, &args.convert.into())?;

  info!("Saving {:?} output to {}", to, args.output.display());
  fs::write(&args.output, &converted)?;

  Ok(())
}

/// Convert a directory between `.npz` and `format`.
fn convert_many(args: DirArgs, format: Format) -> Result<(), Err> {
  let (from, to) = if args.decode { (format, Format::Npz) } else { (Format::Npz, format) };

  let written = convert::convert_dir(&args.input, &args.output, from, to, &args.convert.into())?;
  for path in &written {
    println!("{}", path.display());
  }

  Ok(())
}
