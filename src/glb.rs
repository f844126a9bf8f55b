//! glTF-Binary output.
//!
//! All primitives share one node, one mesh and one binary buffer. Each
//! primitive gets its own material, either a flat base color or the
//! single embedded PNG texture.

use crate::marching_cubes::Mesh;
use crate::MedreconErr;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::debug;
use serde::Serialize;

/// `glTF` in little-endian.
pub const MAGIC: u32 = 0x4654_6C67;

/// Container version.
pub const VERSION: u32 = 2;

/// Chunk type of the JSON chunk.
pub const CHUNK_JSON: u32 = 0x4E4F_534A;

/// Chunk type of the binary chunk.
pub const CHUNK_BIN: u32 = 0x004E_4942;

const TARGET_ARRAY_BUFFER: u32 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;
const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UNSIGNED_INT: u32 = 5125;

const METALLIC: f32 = 0.0;
const ROUGHNESS: f32 = 0.9;

/// One mesh and how to shade it.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
  /// The geometry.
  pub mesh: Mesh,

  /// Shade with the embedded texture instead of `base_color`. The mesh
  /// must then carry texture coordinates.
  pub use_texture: bool,

  /// RGBA base color for untextured primitives.
  pub base_color: [f32; 4],
}

impl Primitive {
  /// An untextured primitive with a flat base color.
  pub fn colored(mesh: Mesh, base_color: [f32; 4]) -> Self {
    Self { mesh, use_texture: false, base_color }
  }

  /// A primitive shaded by the embedded texture.
  pub fn textured(mesh: Mesh) -> Self {
    Self { mesh, use_texture: true, base_color: [1.0; 4] }
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
  asset: Asset,
  scene: usize,
  scenes: Vec<Scene>,
  nodes: Vec<Node>,
  meshes: Vec<MeshJson>,
  materials: Vec<Material>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  textures: Vec<Texture>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  images: Vec<Image>,
  buffers: Vec<Buffer>,
  buffer_views: Vec<BufferView>,
  accessors: Vec<Accessor>,
}

#[derive(Serialize)]
struct Asset {
  version: &'static str,
  generator: &'static str,
}

#[derive(Serialize)]
struct Scene {
  nodes: Vec<usize>,
}

#[derive(Serialize)]
struct Node {
  mesh: usize,
}

#[derive(Serialize)]
struct MeshJson {
  primitives: Vec<PrimitiveJson>,
}

#[derive(Serialize)]
struct PrimitiveJson {
  attributes: Attributes,
  indices: usize,
  material: usize,
}

#[derive(Serialize)]
struct Attributes {
  #[serde(rename = "POSITION")]
  position: usize,
  #[serde(rename = "NORMAL")]
  normal: usize,
  #[serde(rename = "TEXCOORD_0", skip_serializing_if = "Option::is_none")]
  texcoord: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Material {
  pbr_metallic_roughness: Pbr,
  double_sided: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Pbr {
  #[serde(skip_serializing_if = "Option::is_none")]
  base_color_texture: Option<TextureRef>,
  #[serde(skip_serializing_if = "Option::is_none")]
  base_color_factor: Option<[f32; 4]>,
  metallic_factor: f32,
  roughness_factor: f32,
}

#[derive(Serialize)]
struct TextureRef {
  index: usize,
}

#[derive(Serialize)]
struct Texture {
  source: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Image {
  buffer_view: usize,
  mime_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Buffer {
  byte_length: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
  buffer: usize,
  byte_offset: usize,
  byte_length: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  target: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
  buffer_view: usize,
  component_type: u32,
  count: usize,
  #[serde(rename = "type")]
  kind: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  min: Option<[f32; 3]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max: Option<[f32; 3]>,
}

/// The binary chunk under construction, with its views and accessors.
#[derive(Default)]
struct BinBuilder {
  bin: Vec<u8>,
  views: Vec<BufferView>,
  accessors: Vec<Accessor>,
}

impl BinBuilder {
  /// Append `bytes` at the next 4-byte boundary as a new buffer view.
  fn view(&mut self, bytes: &[u8], target: Option<u32>) -> usize {
    let offset = (self.bin.len() + 3) & !3;
    self.bin.resize(offset, 0);
    self.bin.extend_from_slice(bytes);

    self.views.push(BufferView {
      buffer: 0,
      byte_offset: offset,
      byte_length: bytes.len(),
      target,
    });
    self.views.len() - 1
  }

  /// Append float vectors of `N` components plus their accessor.
  fn floats<const N: usize>(
    &mut self,
    values: &[[f32; N]],
    bounds: Option<([f32; 3], [f32; 3])>,
  ) -> usize {
    let flat: Vec<f32> = values.iter().flatten().copied().collect();
    let mut bytes = vec![0; flat.len() * 4];
    LittleEndian::write_f32_into(&flat, &mut bytes);

    let view = self.view(&bytes, Some(TARGET_ARRAY_BUFFER));
    let kind = if N == 2 { "VEC2" } else { "VEC3" };
    self.accessor(view, COMPONENT_FLOAT, values.len(), kind, bounds)
  }

  /// Append triangle indices plus their accessor.
  fn indices(&mut self, indices: &[u32]) -> usize {
    let mut bytes = vec![0; indices.len() * 4];
    LittleEndian::write_u32_into(indices, &mut bytes);

    let view = self.view(&bytes, Some(TARGET_ELEMENT_ARRAY_BUFFER));
    self.accessor(view, COMPONENT_UNSIGNED_INT, indices.len(), "SCALAR", None)
  }

  fn accessor(
    &mut self,
    buffer_view: usize,
    component_type: u32,
    count: usize,
    kind: &'static str,
    bounds: Option<([f32; 3], [f32; 3])>,
  ) -> usize {
    self.accessors.push(Accessor {
      buffer_view,
      component_type,
      count,
      kind,
      min: bounds.map(|(min, _)| min),
      max: bounds.map(|(_, max)| max),
    });
    self.accessors.len() - 1
  }
}

/// Serialize primitives into a GLB container.
///
/// # Arguments
///
/// * `primitives` - At least one primitive, none of them empty.
///
/// * `png` - The encoded texture. Required when any primitive has
/// `use_texture` set, ignored otherwise.
///
/// # Returns
///
/// The complete file contents, or [an error](MedreconErr):
/// [`EmptyMesh`](MedreconErr::EmptyMesh) when there is nothing to
/// serialize and
/// [`TextureRequiredButMissing`](MedreconErr::TextureRequiredButMissing)
/// when a texture is needed but `png` is absent or empty.
pub fn write(primitives: &[Primitive], png: Option<&[u8]>) -> Result<Vec<u8>, MedreconErr> {
  if primitives.is_empty() {
    return Err(MedreconErr::new_empty_mesh());
  }

  let textured = primitives.iter().any(|p| p.use_texture);
  let png = png.filter(|png| !png.is_empty());
  if textured && png.is_none() {
    return Err(MedreconErr::new_texture_required_but_missing());
  }

  let mut builder = BinBuilder::default();
  let mut primitives_json = Vec::with_capacity(primitives.len());
  let mut materials = Vec::with_capacity(primitives.len());

  for (index, primitive) in primitives.iter().enumerate() {
    let mesh = &primitive.mesh;
    if mesh.positions.is_empty() || mesh.indices.is_empty() {
      return Err(MedreconErr::new_empty_mesh());
    }

    let position = builder.floats(&mesh.positions, Some((mesh.bbox_min, mesh.bbox_max)));
    let normal = builder.floats(&mesh.normals, None);

    let texcoord = if primitive.use_texture {
      let uvs = mesh.uvs.as_ref().ok_or_else(|| {
        MedreconErr::new_missing_entry(format!("texture coordinates of primitive {}", index))
      })?;
      Some(builder.floats(uvs, None))
    } else {
      None
    };

    let indices = builder.indices(&mesh.indices);

    primitives_json.push(PrimitiveJson {
      attributes: Attributes { position, normal, texcoord },
      indices,
      material: index,
    });

    let (base_color_texture, base_color_factor) = if primitive.use_texture {
      (Some(TextureRef { index: 0 }), None)
    } else {
      (None, Some(primitive.base_color))
    };

    materials.push(Material {
      pbr_metallic_roughness: Pbr {
        base_color_texture,
        base_color_factor,
        metallic_factor: METALLIC,
        roughness_factor: ROUGHNESS,
      },
      double_sided: true,
    });
  }

  let (textures, images) = match png {
    Some(png) if textured => {
      let buffer_view = builder.view(png, None);
      (vec![Texture { source: 0 }], vec![Image { buffer_view, mime_type: "image/png" }])
    }
    _ => (Vec::new(), Vec::new()),
  };

  let BinBuilder { mut bin, views, accessors } = builder;

  let document = Document {
    asset: Asset { version: "2.0", generator: env!("CARGO_PKG_NAME") },
    scene: 0,
    scenes: vec![Scene { nodes: vec![0] }],
    nodes: vec![Node { mesh: 0 }],
    meshes: vec![MeshJson { primitives: primitives_json }],
    materials,
    textures,
    images,
    buffers: vec![Buffer { byte_length: bin.len() }],
    buffer_views: views,
    accessors,
  };

  let mut json = serde_json::to_vec(&document)?;
  json.resize((json.len() + 3) & !3, b' ');
  bin.resize((bin.len() + 3) & !3, 0);

  let total = 12 + 8 + json.len() + 8 + bin.len();
  let total_u32 =
    u32::try_from(total).map_err(|_| MedreconErr::new_too_large("GLB file", total))?;

  let mut out = Vec::with_capacity(total);
  out.write_u32::<LittleEndian>(MAGIC)?;
  out.write_u32::<LittleEndian>(VERSION)?;
  out.write_u32::<LittleEndian>(total_u32)?;

  out.write_u32::<LittleEndian>(json.len() as u32)?;
  out.write_u32::<LittleEndian>(CHUNK_JSON)?;
  out.extend_from_slice(&json);

  out.write_u32::<LittleEndian>(bin.len() as u32)?;
  out.write_u32::<LittleEndian>(CHUNK_BIN)?;
  out.extend_from_slice(&bin);

  debug!(
    "Wrote GLB with {} primitives ({} bytes JSON, {} bytes binary)",
    primitives.len(),
    json.len(),
    bin.len()
  );

  Ok(out)
}

/// Split a GLB container into its JSON and binary chunk contents.
///
/// Checks the header magic, version and total length, and the chunk
/// types.
pub fn chunks(glb: &[u8]) -> Result<(&[u8], &[u8]), MedreconErr> {
  let truncated = |needed| MedreconErr::new_truncated("GLB", needed, glb.len());

  if glb.len() < 20 {
    return Err(truncated(20));
  }

  if LittleEndian::read_u32(&glb[0..4]) != MAGIC {
    return Err(MedreconErr::new_bad_magic("GLB"));
  }

  let version = LittleEndian::read_u32(&glb[4..8]);
  if version != VERSION {
    return Err(MedreconErr::new_invalid_header("GLB", format!("version {}", version)));
  }

  let total = LittleEndian::read_u32(&glb[8..12]) as usize;
  if total != glb.len() {
    return Err(MedreconErr::new_invalid_header(
      "GLB",
      format!("total length {} for {} bytes", total, glb.len()),
    ));
  }

  let mut chunks = Vec::with_capacity(2);
  let mut offset = 12;
  for expected in [CHUNK_JSON, CHUNK_BIN] {
    if glb.len() < offset + 8 {
      return Err(truncated(offset + 8));
    }

    let len = LittleEndian::read_u32(&glb[offset..offset + 4]) as usize;
    let kind = LittleEndian::read_u32(&glb[offset + 4..offset + 8]);
    if kind != expected {
      return Err(MedreconErr::new_invalid_header("GLB", format!("chunk type {:#010X}", kind)));
    }

    let start = offset + 8;
    if glb.len() < start + len {
      return Err(truncated(start + len));
    }

    chunks.push(&glb[start..start + len]);
    offset = start + len;
  }

  Ok((chunks[0], chunks[1]))
}

#[cfg(test)]
mod glb_tests {
  use super::*;
  use crate::marching_cubes::{self, ISO_LEVEL};
  use serde_json::Value;

  fn blob(with_uvs: bool) -> Mesh {
    let mut field = vec![0.0; 27];
    field[13] = 1.0;
    marching_cubes::extract(&field, 3, 3, 3, ISO_LEVEL, with_uvs).unwrap()
  }

  fn document(glb: &[u8]) -> (Value, usize) {
    let (json, bin) = chunks(glb).unwrap();
    (serde_json::from_slice(json).unwrap(), bin.len())
  }

  #[test]
  fn header_and_lengths() {
    let glb = write(&[Primitive::colored(blob(false), marching_cubes::RED)], None).unwrap();
    assert_eq!(LittleEndian::read_u32(&glb[0..4]), 0x46546C67);
    assert_eq!(LittleEndian::read_u32(&glb[4..8]), 2);

    let (json, bin) = chunks(&glb).unwrap();
    assert_eq!(json.len() % 4, 0);
    assert_eq!(bin.len() % 4, 0);
    assert_eq!(LittleEndian::read_u32(&glb[8..12]) as usize, 12 + 8 + json.len() + 8 + bin.len());
  }

  #[test]
  fn views_and_accessors_in_range() {
    let primitives = [
      Primitive::colored(blob(false), marching_cubes::YELLOW),
      Primitive::colored(blob(false), marching_cubes::RED),
    ];
    let glb = write(&primitives, None).unwrap();
    let (doc, bin_len) = document(&glb);

    let byte_length = doc["buffers"][0]["byteLength"].as_u64().unwrap() as usize;
    assert!(byte_length <= bin_len);

    let views = doc["bufferViews"].as_array().unwrap();
    assert_eq!(views.len(), 6);
    for view in views {
      let end = view["byteOffset"].as_u64().unwrap() + view["byteLength"].as_u64().unwrap();
      assert!(end as usize <= byte_length);
      assert_eq!(view["byteOffset"].as_u64().unwrap() % 4, 0);
    }

    let accessors = doc["accessors"].as_array().unwrap();
    for accessor in accessors {
      assert!((accessor["bufferView"].as_u64().unwrap() as usize) < views.len());
    }

    // Only position accessors carry bounds.
    let bounded = accessors.iter().filter(|a| a.get("min").is_some()).count();
    assert_eq!(bounded, 2);
    assert_eq!(accessors[0]["type"], "VEC3");
    assert_eq!(accessors[2]["componentType"], 5125);
  }

  #[test]
  fn flat_materials() {
    let primitives = [
      Primitive::colored(blob(false), marching_cubes::YELLOW),
      Primitive::colored(blob(false), marching_cubes::RED),
    ];
    let (doc, _) = document(&write(&primitives, None).unwrap());

    let materials = doc["materials"].as_array().unwrap();
    assert_eq!(materials.len(), 2);
    for material in materials {
      assert_eq!(material["doubleSided"], true);
      assert_eq!(material["pbrMetallicRoughness"]["metallicFactor"], 0.0);
      assert!(material["pbrMetallicRoughness"].get("baseColorFactor").is_some());
    }

    assert!(doc.get("textures").is_none());
    assert!(doc.get("images").is_none());
    assert_eq!(doc["meshes"][0]["primitives"][1]["material"], 1);
  }

  #[test]
  fn textured_primitive() {
    let png = crate::png::texture(&[0.0, 1.0, 2.0, 3.0], 1, 2, 2).unwrap();
    let glb = write(&[Primitive::textured(blob(true))], Some(png.as_slice())).unwrap();
    let (doc, _) = document(&glb);

    let primitive = &doc["meshes"][0]["primitives"][0];
    assert_eq!(primitive["attributes"]["TEXCOORD_0"], 2);
    assert_eq!(primitive["indices"], 3);

    let material = &doc["materials"][0]["pbrMetallicRoughness"];
    assert_eq!(material["baseColorTexture"]["index"], 0);
    assert!(material.get("baseColorFactor").is_none());

    assert_eq!(doc["images"][0]["mimeType"], "image/png");
    let image_index = doc["images"][0]["bufferView"].as_u64().unwrap() as usize;
    let image_view = &doc["bufferViews"][image_index];
    assert!(image_view.get("target").is_none());
    assert_eq!(image_view["byteLength"].as_u64().unwrap() as usize, png.len());
  }

  #[test]
  fn nothing_to_write() {
    assert!(matches!(write(&[], None), Err(MedreconErr::EmptyMesh)));

    let empty = Primitive::colored(Mesh::default(), marching_cubes::RED);
    assert!(matches!(write(&[empty], None), Err(MedreconErr::EmptyMesh)));
  }

  #[test]
  fn texture_missing() {
    let primitive = Primitive::textured(blob(true));
    assert!(matches!(
      write(&[primitive.clone()], None),
      Err(MedreconErr::TextureRequiredButMissing)
    ));
    assert!(matches!(
      write(&[primitive], Some(&[][..])),
      Err(MedreconErr::TextureRequiredButMissing)
    ));
  }

  #[test]
  fn bad_container() {
    let mut glb = write(&[Primitive::colored(blob(false), marching_cubes::RED)], None).unwrap();
    glb[0] = b'x';
    assert_eq!(chunks(&glb).unwrap_err().kind(), crate::ErrorKind::MalformedInput);
    assert!(chunks(&glb[..10]).is_err());
  }
}
