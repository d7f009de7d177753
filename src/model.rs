use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Read};
use std::mem::size_of;
use std::path::Path;

use anyhow::Result;
use log::*;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;

use crate::error::LoadError;
use crate::resources::{Buffer, ResourceManager, Texture};

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Vertex {
    pub pos: glm::Vec3,
    pub color: glm::Vec3,
    pub tex_coord: glm::Vec2,
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos && self.color == other.color && self.tex_coord == other.tex_coord
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pos[0].to_bits().hash(state);
        self.pos[1].to_bits().hash(state);
        self.pos[2].to_bits().hash(state);
        self.color[0].to_bits().hash(state);
        self.color[1].to_bits().hash(state);
        self.color[2].to_bits().hash(state);
        self.tex_coord[0].to_bits().hash(state);
        self.tex_coord[1].to_bits().hash(state);
    }
}

impl Vertex {
    pub fn new(pos: glm::Vec3, color: glm::Vec3, tex_coord: glm::Vec2) -> Self {
        Self { pos, color, tex_coord }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let pos = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)
            .build();
        let color = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(1)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(size_of::<glm::Vec3>() as u32)
            .build();
        let tex_coord = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(2)
            .format(vk::Format::R32G32_SFLOAT)
            .offset((size_of::<glm::Vec3>() * 2) as u32)
            .build();
        [pos, color, tex_coord]
    }
}

/// Deduplicated triangle geometry.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Decoded RGBA8 pixels.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

fn check_extension(path: &Path, allowed: &[&str]) -> Result<(), LoadError> {
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false);
    if supported {
        Ok(())
    } else {
        Err(LoadError::UnsupportedExtension(path.to_path_buf()))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, LoadError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| LoadError::Unreadable { path: path.to_path_buf(), source })
}

pub fn load_mesh(path: &Path) -> Result<MeshData, LoadError> {
    check_extension(path, &["obj"])?;
    let mut reader = open(path)?;
    parse_obj(&mut reader, path)
}

fn parse_obj(reader: &mut impl BufRead, path: &Path) -> Result<MeshData, LoadError> {
    let malformed = |reason: String| LoadError::MalformedGeometry { path: path.to_path_buf(), reason };

    let (models, _) = tobj::load_obj_buf(
        reader,
        &tobj::LoadOptions { triangulate: true, single_index: true, ..Default::default() },
        |_| Ok(Default::default()),
    )
    .map_err(|e| malformed(e.to_string()))?;

    let mut mesh = MeshData::default();
    let mut unique_vertices = HashMap::new();
    for model in &models {
        let positions = &model.mesh.positions;
        let texcoords = &model.mesh.texcoords;
        for index in &model.mesh.indices {
            let pos_offset = (3 * index) as usize;
            let tex_coord_offset = (2 * index) as usize;
            if pos_offset + 2 >= positions.len() {
                return Err(malformed(format!("index {} has no position", index)));
            }
            let tex_coord = if tex_coord_offset + 1 < texcoords.len() {
                glm::vec2(texcoords[tex_coord_offset], 1.0 - texcoords[tex_coord_offset + 1])
            } else {
                glm::vec2(0.0, 0.0)
            };
            let vertex = Vertex::new(
                glm::vec3(positions[pos_offset], positions[pos_offset + 1], positions[pos_offset + 2]),
                glm::vec3(1.0, 1.0, 1.0),
                tex_coord,
            );

            if let Some(index) = unique_vertices.get(&vertex) {
                mesh.indices.push(*index as u32);
            } else {
                let index = mesh.vertices.len();
                unique_vertices.insert(vertex, index);
                mesh.vertices.push(vertex);
                mesh.indices.push(index as u32);
            }
        }
    }

    if mesh.indices.is_empty() {
        return Err(malformed("no triangles".to_string()));
    }
    Ok(mesh)
}

pub fn load_texture(path: &Path) -> Result<TextureData, LoadError> {
    check_extension(path, &["png"])?;
    let reader = open(path)?;
    decode_png(reader, path)
}

fn decode_png(reader: impl Read, path: &Path) -> Result<TextureData, LoadError> {
    let error = |reason: String| LoadError::Texture { path: path.to_path_buf(), reason };

    let mut decoder = png::Decoder::new(reader);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info().map_err(|e| error(e.to_string()))?;
    let mut buffer = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buffer).map_err(|e| error(e.to_string()))?;
    buffer.truncate(info.buffer_size());

    let pixels = match info.color_type {
        png::ColorType::Rgba => buffer,
        png::ColorType::Rgb => buffer
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], u8::MAX])
            .collect(),
        png::ColorType::GrayscaleAlpha => buffer
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect(),
        png::ColorType::Grayscale => buffer.iter().flat_map(|g| [*g, *g, *g, u8::MAX]).collect(),
        other => return Err(error(format!("unsupported color type {:?}", other))),
    };

    if info.width == 0 || info.height == 0 {
        return Err(error("empty image".to_string()));
    }
    Ok(TextureData { width: info.width, height: info.height, pixels })
}

/// Placement of a model in the world. Rotation is in degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transform {
    pub position: glm::Vec3,
    pub rotation: glm::Vec3,
    pub scale: glm::Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: glm::vec3(0.0, 0.0, 0.0),
            rotation: glm::vec3(0.0, 0.0, 0.0),
            scale: glm::vec3(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    pub fn at(position: glm::Vec3) -> Self {
        Self { position, ..Default::default() }
    }

    /// `translate * rotate_x * rotate_y * rotate_z * scale`.
    pub fn matrix(&self) -> glm::Mat4 {
        let radians = |degrees: f32| glm::radians(&glm::vec1(degrees))[0];
        let mut model = glm::translate(&glm::identity(), &self.position);
        model = glm::rotate(&model, radians(self.rotation.x), &glm::vec3(1.0, 0.0, 0.0));
        model = glm::rotate(&model, radians(self.rotation.y), &glm::vec3(0.0, 1.0, 0.0));
        model = glm::rotate(&model, radians(self.rotation.z), &glm::vec3(0.0, 0.0, 1.0));
        glm::scale(&model, &self.scale)
    }
}

/// GPU resources of one loaded model.
pub struct Model {
    pub name: String,
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub index_count: u32,
    pub texture: Texture,
    pub transform: Transform,
}

impl Model {
    pub unsafe fn load(
        resources: &ResourceManager,
        mesh_path: &Path,
        texture_path: &Path,
        transform: Transform,
    ) -> Result<Self> {
        let mesh = load_mesh(mesh_path)?;
        let texture = load_texture(texture_path)?;
        let name = display_name(mesh_path);

        let vertex_buffer = resources.create_device_local_buffer(
            &mesh.vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("{} Vertex Buffer", name),
        )?;
        let index_buffer = resources.create_device_local_buffer(
            &mesh.indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &format!("{} Index Buffer", name),
        )?;
        let texture = resources.create_texture(&texture, &format!("{} Texture", name))?;

        info!(
            "Loaded model `{}` ({} vertices, {} indices).",
            name,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(Self {
            name,
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            texture,
            transform,
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use approx::assert_relative_eq;

    use super::*;

    const QUAD: &str = "\
v -1.0 -1.0 0.0
v 1.0 -1.0 0.0
v 1.0 1.0 0.0
v -1.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn quad_is_triangulated_and_deduplicated() {
        let mesh = parse_obj(&mut Cursor::new(QUAD), Path::new("quad.obj")).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.indices.iter().all(|i| (*i as usize) < mesh.vertices.len()));
        // V is flipped for Vulkan's top-left texture origin.
        let first = mesh.vertices[0];
        assert_relative_eq!(first.tex_coord, glm::vec2(0.0, 1.0));
        assert_relative_eq!(first.color, glm::vec3(1.0, 1.0, 1.0));
    }

    #[test]
    fn texture_coordinates_pass_through_unvalidated() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 2.5 -3.0\nf 1/1 2/1 3/1\n";
        let mesh = parse_obj(&mut Cursor::new(obj), Path::new("odd.obj")).unwrap();
        assert_relative_eq!(mesh.vertices[0].tex_coord, glm::vec2(2.5, 4.0));
    }

    #[test]
    fn empty_geometry_is_malformed() {
        let error = parse_obj(&mut Cursor::new("# nothing\n"), Path::new("empty.obj")).unwrap_err();
        assert!(matches!(error, LoadError::MalformedGeometry { .. }));
    }

    #[test]
    fn unsupported_extensions_fail_fast() {
        assert!(matches!(
            load_mesh(Path::new("model.fbx")),
            Err(LoadError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            load_texture(Path::new("texture.jpg")),
            Err(LoadError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            load_mesh(Path::new("does/not/exist.OBJ")),
            Err(LoadError::Unreadable { .. })
        ));
    }

    #[test]
    fn rgb_png_is_expanded_to_rgba() {
        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, 2, 1);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[255, 0, 0, 0, 0, 255]).unwrap();
        }
        let texture = decode_png(Cursor::new(bytes), Path::new("pixels.png")).unwrap();
        assert_eq!((texture.width, texture.height), (2, 1));
        assert_eq!(texture.pixels, vec![255, 0, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn transform_order_is_translate_rotate_scale() {
        let transform = Transform {
            position: glm::vec3(1.0, 2.0, 3.0),
            rotation: glm::vec3(0.0, 0.0, 90.0),
            scale: glm::vec3(2.0, 2.0, 2.0),
        };
        let point = transform.matrix() * glm::vec4(1.0, 0.0, 0.0, 1.0);
        // Scaled to (2,0,0), rotated about Z to (0,2,0), then translated.
        assert_relative_eq!(point, glm::vec4(1.0, 4.0, 3.0, 1.0), epsilon = 1e-5);
        assert_relative_eq!(Transform::default().matrix(), glm::Mat4::identity());
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(Vertex::binding_description().stride, 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
    }
}
