use {
    super::{Vec2, Vec3, Vec4, decode, encode, strip_magic},
    anyhow::{Context, anyhow, bail},
    bitflags::bitflags,
    serde::{Deserialize, Serialize},
};

/// A named stream of a [`CodecMesh`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Attribute {
    Position,
    Normal,
    Tangent,
    Color,
    TexCoord0,
    TexCoord1,

    /// Index of each vertex in the source mesh, kept so skinning data can be matched up.
    OriginalIndex,

    /// Material slot of each triangle.
    FaceMaterial,
}

impl Attribute {
    pub fn flag(self) -> AttributeFlags {
        match self {
            Self::Position => AttributeFlags::POSITION,
            Self::Normal => AttributeFlags::NORMAL,
            Self::Tangent => AttributeFlags::TANGENT,
            Self::Color => AttributeFlags::COLOR,
            Self::TexCoord0 => AttributeFlags::TEX_COORD0,
            Self::TexCoord1 => AttributeFlags::TEX_COORD1,
            Self::OriginalIndex => AttributeFlags::ORIGINAL_INDEX,
            Self::FaceMaterial => AttributeFlags::FACE_MATERIAL,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct AttributeFlags: u8 {
        const POSITION = 1 << 0;
        const NORMAL = 1 << 1;
        const TANGENT = 1 << 2;
        const COLOR = 1 << 3;
        const TEX_COORD0 = 1 << 4;
        const TEX_COORD1 = 1 << 5;
        const ORIGINAL_INDEX = 1 << 6;
        const FACE_MATERIAL = 1 << 7;
    }
}

/// Bit depths used when quantizing floating point streams.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Quantization {
    pub position_bits: u8,
    pub tex_coord_bits: u8,
    pub normal_bits: u8,
    pub color_bits: u8,
}

impl Quantization {
    fn bits(&self, attribute: Attribute) -> u8 {
        match attribute {
            Attribute::Position => self.position_bits,
            Attribute::Normal | Attribute::Tangent => self.normal_bits,
            Attribute::Color => self.color_bits,
            Attribute::TexCoord0 | Attribute::TexCoord1 => self.tex_coord_bits,
            Attribute::OriginalIndex | Attribute::FaceMaterial => 0,
        }
    }
}

impl Default for Quantization {
    fn default() -> Self {
        Self {
            position_bits: 14,
            tex_coord_bits: 12,
            normal_bits: 10,
            color_bits: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct Stream {
    attribute: Attribute,
    components: u8,

    /// Zero for integer streams, which are stored exactly.
    bits: u8,

    min: Vec<f32>,
    range: f32,

    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl Stream {
    fn quantize(attribute: Attribute, components: usize, bits: u8, vals: &[f32]) -> Self {
        debug_assert!(bits > 0 && bits <= 30);
        debug_assert_eq!(vals.len() % components, 0);

        // Unit vectors use a fixed domain so neighbouring meshes quantize identically
        let (min, range) = if matches!(attribute, Attribute::Normal | Attribute::Tangent) {
            (vec![-1.0; components], 2.0)
        } else {
            let mut min = vec![f32::MAX; components];
            let mut max = vec![f32::MIN; components];
            for val in vals.chunks_exact(components) {
                for (idx, &val) in val.iter().enumerate() {
                    min[idx] = min[idx].min(val);
                    max[idx] = max[idx].max(val);
                }
            }

            let range = min
                .iter()
                .zip(&max)
                .map(|(min, max)| max - min)
                .fold(0.0f32, f32::max);

            (min, range)
        };

        let max_quantized = ((1u32 << bits) - 1) as f32;
        let quantized = vals
            .iter()
            .enumerate()
            .map(|(idx, &val)| {
                if range <= 0.0 {
                    0
                } else {
                    let val = (val - min[idx % components]) / range;
                    (val.clamp(0.0, 1.0) * max_quantized).round() as u32
                }
            })
            .collect::<Vec<_>>();

        Self {
            attribute,
            components: components as _,
            bits,
            min,
            range,
            data: quantized.into_iter().flat_map(u32::to_le_bytes).collect(),
        }
    }

    /// Checks the layout of a stream read from untrusted bytes.
    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=4).contains(&self.components) {
            bail!(
                "{:?} stream has {} components",
                self.attribute,
                self.components
            );
        }

        match self.attribute {
            Attribute::OriginalIndex | Attribute::FaceMaterial => {
                if self.bits != 0 {
                    bail!("{:?} stream must not be quantized", self.attribute);
                }
            }
            _ => {
                if self.bits == 0 || self.bits > 30 {
                    bail!(
                        "{:?} stream has an invalid quantization of {} bits",
                        self.attribute,
                        self.bits
                    );
                }

                if self.min.len() != self.components as usize {
                    bail!("{:?} stream has a malformed domain", self.attribute);
                }
            }
        }

        Ok(())
    }

    fn exact(attribute: Attribute, vals: &[u32]) -> Self {
        Self {
            attribute,
            components: 1,
            bits: 0,
            min: vec![],
            range: 0.0,
            data: vals.iter().copied().flat_map(u32::to_le_bytes).collect(),
        }
    }

    /// Replaces the little-endian lanes in `data` with their meshopt encoding.
    fn compress(mut self) -> anyhow::Result<Self> {
        let vals = self
            .data
            .chunks_exact(4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect::<Vec<_>>();

        self.data = match self.components {
            1 => encode_lanes::<1>(&vals),
            2 => encode_lanes::<2>(&vals),
            3 => encode_lanes::<3>(&vals),
            4 => encode_lanes::<4>(&vals),
            components => bail!("Unsupported component count {components}"),
        }
        .with_context(|| format!("Encoding {:?} stream", self.attribute))?;

        Ok(self)
    }

    fn decompress(&self, count: usize) -> anyhow::Result<Vec<u32>> {
        match self.components {
            1 => decode_lanes::<1>(&self.data, count),
            2 => decode_lanes::<2>(&self.data, count),
            3 => decode_lanes::<3>(&self.data, count),
            4 => decode_lanes::<4>(&self.data, count),
            components => bail!("Unsupported component count {components}"),
        }
        .with_context(|| format!("Decoding {:?} stream", self.attribute))
    }

    fn dequantize(&self, count: usize) -> anyhow::Result<Vec<f32>> {
        let components = self.components as usize;
        let max_quantized = ((1u32 << self.bits) - 1) as f32;

        Ok(self
            .decompress(count)?
            .into_iter()
            .enumerate()
            .map(|(idx, val)| self.min[idx % components] + val as f32 / max_quantized * self.range)
            .collect())
    }
}

fn encode_lanes<const N: usize>(vals: &[u32]) -> anyhow::Result<Vec<u8>> {
    let lanes = vals
        .chunks_exact(N)
        .map(|val| {
            let mut lane = [0u32; N];
            lane.copy_from_slice(val);
            lane
        })
        .collect::<Vec<_>>();

    meshopt::encode_vertex_buffer(&lanes).map_err(|err| anyhow!("{err:?}"))
}

fn decode_lanes<const N: usize>(data: &[u8], count: usize) -> anyhow::Result<Vec<u32>>
where
    [u32; N]: Default,
{
    let lanes = meshopt::decode_vertex_buffer::<[u32; N]>(data, count)
        .map_err(|err| anyhow!("{err:?}"))?;

    Ok(lanes.into_iter().flatten().collect())
}

/// Reorders triangles for the vertex cache; with face materials, only within each material run.
fn optimize_vertex_cache(
    indices: &[u32],
    face_materials: Option<&[u32]>,
    vertex_count: usize,
) -> Vec<u32> {
    let Some(face_materials) = face_materials else {
        return meshopt::optimize_vertex_cache(indices, vertex_count);
    };

    let mut res = Vec::with_capacity(indices.len());
    let mut start = 0;
    for run in face_materials.chunk_by(|a, b| a == b) {
        let end = start + run.len();
        res.extend(meshopt::optimize_vertex_cache(
            &indices[start * 3..end * 3],
            vertex_count,
        ));
        start = end;
    }

    res
}

fn flatten<const N: usize>(vals: &[[f32; N]]) -> Vec<f32> {
    vals.iter().flatten().copied().collect()
}

fn chunk<const N: usize>(vals: Vec<f32>) -> Vec<[f32; N]> {
    vals.chunks_exact(N)
        .map(|val| {
            let mut res = [0.0; N];
            res.copy_from_slice(val);
            res
        })
        .collect()
}

/// An indexed triangle mesh compressed into quantized, named attribute streams.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CodecMesh {
    attributes: AttributeFlags,

    #[serde(with = "serde_bytes")]
    indices: Vec<u8>,

    streams: Vec<Stream>,
    triangle_count: u32,
    vertex_count: u32,
}

impl CodecMesh {
    const MAGIC: &'static [u8; 20] = b"OVEN-CODEC-MESH-V1.0";

    pub fn attributes(&self) -> AttributeFlags {
        self.attributes
    }

    pub fn has_attribute(&self, attribute: Attribute) -> bool {
        self.attributes.contains(attribute.flag())
    }

    /// Quantization depth of a stored attribute; zero for exact integer streams.
    pub fn bits(&self, attribute: Attribute) -> Option<u8> {
        self.stream(attribute).map(|stream| stream.bits)
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count as _
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count as _
    }

    fn stream(&self, attribute: Attribute) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|stream| stream.attribute == attribute)
    }

    /// Expands every stream back into plain arrays.
    pub fn decode(&self) -> anyhow::Result<DecodedMesh> {
        let vertex_count = self.vertex_count();
        let floats = |attribute| -> anyhow::Result<Vec<f32>> {
            self.stream(attribute)
                .map(|stream| stream.dequantize(vertex_count))
                .transpose()
                .map(Option::unwrap_or_default)
        };

        let indices =
            meshopt::decode_index_buffer::<u32>(&self.indices, self.triangle_count() * 3)
                .map_err(|err| anyhow!("{err:?}"))
                .context("Decoding indices")?;

        Ok(DecodedMesh {
            indices,
            positions: chunk(floats(Attribute::Position)?),
            normals: chunk(floats(Attribute::Normal)?),
            tangents: chunk(floats(Attribute::Tangent)?),
            colors: chunk(floats(Attribute::Color)?),
            tex_coords0: chunk(floats(Attribute::TexCoord0)?),
            tex_coords1: chunk(floats(Attribute::TexCoord1)?),
            original_indices: self
                .stream(Attribute::OriginalIndex)
                .map(|stream| stream.decompress(vertex_count))
                .transpose()?
                .unwrap_or_default(),
            face_materials: self
                .stream(Attribute::FaceMaterial)
                .map(|stream| stream.decompress(self.triangle_count()))
                .transpose()?
                .unwrap_or_default(),
        })
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let mesh: Self = decode(strip_magic(buf, Self::MAGIC)?).context("Decoding codec mesh")?;

        for stream in &mesh.streams {
            stream.validate().context("Invalid codec mesh")?;
        }

        Ok(mesh)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Self::MAGIC.to_vec();
        buf.extend(encode(self)?);

        Ok(buf)
    }
}

/// Collects triangles and vertex streams for a single [`CodecMesh`].
#[derive(Debug)]
pub struct CodecMeshBuilder {
    face_materials: Option<Vec<u32>>,
    indices: Vec<u32>,
    original_index: bool,
    quantization: Quantization,
    streams: Vec<(Attribute, usize, Vec<f32>)>,
    vertex_count: usize,
}

impl CodecMeshBuilder {
    pub fn new(quantization: Quantization, positions: &[Vec3]) -> Self {
        Self {
            face_materials: None,
            indices: vec![],
            original_index: false,
            quantization,
            streams: vec![(Attribute::Position, 3, flatten(positions))],
            vertex_count: positions.len(),
        }
    }

    fn with_stream(mut self, attribute: Attribute, components: usize, vals: Vec<f32>) -> Self {
        if !vals.is_empty() {
            self.streams.push((attribute, components, vals));
        }

        self
    }

    pub fn with_colors(self, colors: &[Vec4]) -> Self {
        self.with_stream(Attribute::Color, 4, flatten(colors))
    }

    /// Stores a per-triangle material slot stream.
    pub fn with_face_materials(mut self) -> Self {
        self.face_materials = Some(vec![]);
        self
    }

    pub fn with_normals(self, normals: &[Vec3]) -> Self {
        self.with_stream(Attribute::Normal, 3, flatten(normals))
    }

    /// Stores the source vertex index of every vertex.
    pub fn with_original_index(mut self) -> Self {
        self.original_index = true;
        self
    }

    pub fn with_tangents(self, tangents: &[Vec3]) -> Self {
        self.with_stream(Attribute::Tangent, 3, flatten(tangents))
    }

    pub fn with_tex_coords0(self, tex_coords: &[Vec2]) -> Self {
        self.with_stream(Attribute::TexCoord0, 2, flatten(tex_coords))
    }

    pub fn with_tex_coords1(self, tex_coords: &[Vec2]) -> Self {
        self.with_stream(Attribute::TexCoord1, 2, flatten(tex_coords))
    }

    pub fn push_triangle(&mut self, triangle: [u32; 3], material_id: u32) {
        self.indices.extend_from_slice(&triangle);

        if let Some(face_materials) = &mut self.face_materials {
            face_materials.push(material_id);
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Encodes the collected data, or returns `None` when there is nothing to encode.
    pub fn finalize(self) -> anyhow::Result<Option<CodecMesh>> {
        if self.indices.is_empty() || self.vertex_count == 0 {
            return Ok(None);
        }

        if let Some(idx) = self
            .indices
            .iter()
            .find(|&&idx| idx as usize >= self.vertex_count)
        {
            bail!("Index {idx} is outside of {} vertices", self.vertex_count);
        }

        let mut attributes = AttributeFlags::empty();
        let mut streams = vec![];

        for (attribute, components, vals) in self.streams {
            if vals.len() != self.vertex_count * components {
                bail!(
                    "{attribute:?} has {} values for {} vertices",
                    vals.len() / components,
                    self.vertex_count
                );
            }

            let bits = self.quantization.bits(attribute);
            if bits == 0 || bits > 30 {
                bail!("Invalid quantization of {bits} bits for {attribute:?}");
            }

            attributes |= attribute.flag();
            streams.push(Stream::quantize(attribute, components, bits, &vals).compress()?);
        }

        if self.original_index {
            let identity = (0..self.vertex_count as u32).collect::<Vec<_>>();
            attributes |= AttributeFlags::ORIGINAL_INDEX;
            streams.push(Stream::exact(Attribute::OriginalIndex, &identity).compress()?);
        }

        if let Some(ref face_materials) = self.face_materials {
            attributes |= AttributeFlags::FACE_MATERIAL;
            streams.push(Stream::exact(Attribute::FaceMaterial, &face_materials).compress()?);
        }

        let indices = optimize_vertex_cache(
            &self.indices,
            self.face_materials.as_deref(),
            self.vertex_count,
        );
        let indices = meshopt::encode_index_buffer(&indices, self.vertex_count)
            .map_err(|err| anyhow!("{err:?}"))
            .context("Encoding indices")?;

        Ok(Some(CodecMesh {
            attributes,
            indices,
            streams,
            triangle_count: (self.indices.len() / 3) as _,
            vertex_count: self.vertex_count as _,
        }))
    }
}

/// The plain arrays recovered from a [`CodecMesh`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedMesh {
    pub indices: Vec<u32>,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub colors: Vec<Vec4>,
    pub tex_coords0: Vec<Vec2>,
    pub tex_coords1: Vec<Vec2>,
    pub original_indices: Vec<u32>,
    pub face_materials: Vec<u32>,
}

impl DecodedMesh {
    /// Triangles with each rotated so its smallest index comes first; winding is kept.
    pub fn canonical_triangles(&self) -> Vec<[u32; 3]> {
        self.indices
            .chunks_exact(3)
            .map(|tri| {
                let first = (0..3).min_by_key(|&idx| tri[idx]).unwrap_or_default();
                [tri[first], tri[(first + 1) % 3], tri[(first + 2) % 3]]
            })
            .collect()
    }
}
