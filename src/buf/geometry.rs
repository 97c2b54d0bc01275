//! The fixed sequence of geometry jobs run for every model.
//!
//! Each job works on all meshes of a model at once and skips work that is already done: meshes
//! which carry normals keep them, meshes which carry tangents keep them, and so on.

use {
    super::{
        engine::{BakeContext, Engine, Job, PassthroughConfig, Var},
        mapping::{MaterialMapEntry, Rotation},
        resolve_url,
        state::CancellationToken,
    },
    crate::{
        Blendshape, CodecMeshBuilder, Joint, MaterialRecord, MeshPart, MeshRecord, Quantization,
        Quat, Vec3,
    },
    glam::{Quat as GlamQuat, Vec2 as GlamVec2, Vec3 as GlamVec3},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

pub type PartsPerMesh = Vec<Vec<MeshPart>>;
pub type NormalsPerMesh = Vec<Vec<Vec3>>;
pub type TangentsPerMesh = Vec<Vec<Vec3>>;
pub type NormalsPerBlendshapePerMesh = Vec<Vec<Vec<Vec3>>>;
pub type TangentsPerBlendshapePerMesh = Vec<Vec<Vec<Vec3>>>;

/// Encoded codec mesh bytes per mesh; `None` where a mesh could not be encoded.
pub type CodecMeshes = Vec<Option<Vec<u8>>>;

/// Canonical joint data after mapping overrides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparedJoints {
    pub joints: Vec<Joint>,

    /// Joint index to the extra rotation requested by the mapping.
    pub rotation_offsets: BTreeMap<usize, Quat>,

    /// Canonical joint name to joint index.
    pub joint_indices: BTreeMap<String, usize>,
}

/// A material override with its URL made absolute.
#[derive(Clone, Debug, PartialEq)]
pub enum MaterialOverride {
    Url(String),
    Inline(serde_json::Value),
}

/// Joint related directives of a mapping file.
#[derive(Clone, Debug, Default)]
pub struct JointOverrides {
    pub renames: BTreeMap<String, String>,
    pub indices: BTreeMap<String, usize>,
    pub rotation_offsets: BTreeMap<String, Rotation>,
}

fn is_in_range(idx: u32, vertex_count: usize) -> bool {
    (idx as usize) < vertex_count
}

fn sanitize_indices(indices: &mut Vec<u32>, vertex_count: usize) -> usize {
    if vertex_count == 0 {
        let count = indices.len();
        indices.clear();

        return count;
    }

    let mut count = 0;
    for idx in indices.iter_mut() {
        if !is_in_range(*idx, vertex_count) {
            *idx = 0;
            count += 1;
        }
    }

    count
}

/// Adds the area-weighted face normal of every triangle to the slots `slot` maps its corners to.
fn accumulate_normals(
    parts: &[MeshPart],
    position: impl Fn(usize) -> GlamVec3,
    slot: impl Fn(usize) -> Option<usize>,
    normals: &mut [GlamVec3],
) {
    for part in parts {
        for [a, b, c] in part.triangles() {
            let [a, b, c] = [a as usize, b as usize, c as usize];
            let (pa, pb, pc) = (position(a), position(b), position(c));

            // The cross product length is twice the triangle area
            let normal = (pb - pa).cross(pc - pa);

            for idx in [a, b, c] {
                if let Some(slot) = slot(idx) {
                    normals[slot] += normal;
                }
            }
        }
    }

    for normal in normals.iter_mut() {
        *normal = normal.normalize_or_zero();
    }
}

/// Accumulates a tangent for the first vertex of every triangle edge, rotating the edge into
/// texture space around the vertex normal.
fn accumulate_tangents(
    parts: &[MeshPart],
    position: impl Fn(usize) -> GlamVec3,
    normal: impl Fn(usize) -> GlamVec3,
    tex_coord: impl Fn(usize) -> GlamVec2,
    slot: impl Fn(usize) -> Option<usize>,
    tangents: &mut [GlamVec3],
) {
    for part in parts {
        for [a, b, c] in part.triangles() {
            let [a, b, c] = [a as usize, b as usize, c as usize];
            for (first, second) in [(a, b), (b, c), (c, a)] {
                let Some(slot) = slot(first) else {
                    continue;
                };

                let normal = normal(first);
                let bitangent = normal.cross(position(second) - position(first));
                if bitangent.length() < f32::EPSILON {
                    continue;
                }

                let normal = normal.normalize_or_zero();
                let delta = tex_coord(second) - tex_coord(first);
                let angle = -delta.y.atan2(delta.x);
                let rotated = GlamQuat::from_axis_angle(normal, angle) * bitangent.normalize();

                tangents[slot] += rotated.cross(normal);
            }
        }
    }

    for tangent in tangents.iter_mut() {
        *tangent = tangent.normalize_or_zero();
    }
}

fn needs_tangents(parts: &[MeshPart], materials: &[MaterialRecord]) -> bool {
    parts.iter().any(|part| {
        materials
            .get(part.material_id as usize)
            .is_some_and(MaterialRecord::needs_tangent_space)
    })
}

fn to_glam(vals: &[Vec3]) -> Vec<GlamVec3> {
    vals.iter().copied().map(GlamVec3::from_array).collect()
}

fn from_glam(vals: Vec<GlamVec3>) -> Vec<Vec3> {
    vals.into_iter().map(|v| v.to_array()).collect()
}

/// Maps each base-mesh vertex to its position in a blendshape, if the blendshape moves it.
fn reverse_index(blendshape: &Blendshape, vertex_count: usize) -> Vec<Option<usize>> {
    let mut res = vec![None; vertex_count];
    for (local, &idx) in blendshape
        .indices
        .iter()
        .take(blendshape.vertices.len())
        .enumerate()
    {
        if let Some(slot) = res.get_mut(idx as usize) {
            *slot = Some(local);
        }
    }

    res
}

/// Empties `vals` when it is neither empty nor `expected` long, returning true if it did.
fn drop_mismatched<T>(vals: &mut Vec<T>, expected: usize) -> bool {
    if vals.is_empty() || vals.len() == expected {
        return false;
    }

    vals.clear();

    true
}

/// Drops per-vertex attributes which do not have one value per vertex, and blendshape data which
/// does not have one value per moved vertex.
#[derive(Default)]
pub struct SanitizeMeshAttributes;

impl Job for SanitizeMeshAttributes {
    type Config = ();
    type Input = Vec<MeshRecord>;
    type Output = Vec<MeshRecord>;

    fn run(&mut self, ctx: &BakeContext, meshes: &Vec<MeshRecord>) -> Vec<MeshRecord> {
        meshes
            .iter()
            .map(|mesh| {
                let mut mesh = mesh.clone();
                let vertex_count = mesh.vertex_count();
                let mut dropped = vec![];

                if drop_mismatched(&mut mesh.normals, vertex_count) {
                    dropped.push("normals");
                }

                if drop_mismatched(&mut mesh.tangents, vertex_count) {
                    dropped.push("tangents");
                }

                if drop_mismatched(&mut mesh.colors, vertex_count) {
                    dropped.push("colors");
                }

                if drop_mismatched(&mut mesh.tex_coords0, vertex_count) {
                    dropped.push("uv0");
                }

                if drop_mismatched(&mut mesh.tex_coords1, vertex_count) {
                    dropped.push("uv1");
                }

                if drop_mismatched(&mut mesh.skin_indices, vertex_count) {
                    dropped.push("skin indices");
                }

                if !dropped.is_empty() {
                    ctx.warn(format!(
                        "Mesh {} drops {} not matching its {vertex_count} vertices",
                        mesh.name,
                        dropped.join(", ")
                    ));
                }

                for blendshape in &mut mesh.blendshapes {
                    let len = blendshape.indices.len().min(blendshape.vertices.len());
                    let mut malformed = len != blendshape.indices.len()
                        || len != blendshape.vertices.len();
                    blendshape.indices.truncate(len);
                    blendshape.vertices.truncate(len);
                    malformed |= drop_mismatched(&mut blendshape.normals, len);
                    malformed |= drop_mismatched(&mut blendshape.tangents, len);

                    if malformed {
                        ctx.warn(format!(
                            "Blendshape {} of mesh {} has mismatched arrays",
                            blendshape.name, mesh.name
                        ));
                    }
                }

                mesh
            })
            .collect()
    }
}

/// Replaces out of range indices with zero; a mesh without vertices loses all of its indices.
#[derive(Default)]
pub struct SanitizeMeshIndices;

impl Job for SanitizeMeshIndices {
    type Config = ();
    type Input = Vec<MeshRecord>;
    type Output = PartsPerMesh;

    fn run(&mut self, ctx: &BakeContext, meshes: &Vec<MeshRecord>) -> PartsPerMesh {
        meshes
            .iter()
            .map(|mesh| {
                let vertex_count = mesh.vertex_count();
                let mut parts = mesh.parts.clone();
                let mut count = 0;
                for part in &mut parts {
                    count += sanitize_indices(&mut part.quad_indices, vertex_count);
                    count += sanitize_indices(&mut part.quad_triangle_indices, vertex_count);
                    count += sanitize_indices(&mut part.triangle_indices, vertex_count);
                }

                if count > 0 {
                    ctx.warn(format!(
                        "Mesh {} has {count} indices outside of its {vertex_count} vertices",
                        mesh.name
                    ));
                }

                parts
            })
            .collect()
    }
}

/// Synthesizes area-weighted vertex normals for meshes without normals.
#[derive(Default)]
pub struct CalculateMeshNormals;

impl Job for CalculateMeshNormals {
    type Config = ();
    type Input = (Vec<MeshRecord>, PartsPerMesh);
    type Output = NormalsPerMesh;

    fn run(&mut self, ctx: &BakeContext, (meshes, parts): &Self::Input) -> NormalsPerMesh {
        meshes
            .iter()
            .zip(parts)
            .map(|(mesh, parts)| {
                if mesh.normals.len() == mesh.vertex_count() && !mesh.normals.is_empty() {
                    return mesh.normals.clone();
                }

                if !mesh.normals.is_empty() {
                    ctx.warn(format!(
                        "Mesh {} has {} normals for {} vertices; recalculating",
                        mesh.name,
                        mesh.normals.len(),
                        mesh.vertex_count()
                    ));
                }

                let vertices = to_glam(&mesh.vertices);
                let mut normals = vec![GlamVec3::ZERO; vertices.len()];
                accumulate_normals(parts, |idx| vertices[idx], Some, &mut normals);

                from_glam(normals)
            })
            .collect()
    }
}

/// Synthesizes tangents for meshes drawn with a material that samples a normal or bump map.
#[derive(Default)]
pub struct CalculateMeshTangents {
    passthrough: bool,
}

impl Job for CalculateMeshTangents {
    type Config = PassthroughConfig;
    type Input = (Vec<MeshRecord>, PartsPerMesh, NormalsPerMesh, Vec<MaterialRecord>);
    type Output = TangentsPerMesh;

    fn configure(&mut self, config: &PassthroughConfig) {
        self.passthrough = config.passthrough;
    }

    fn run(&mut self, ctx: &BakeContext, input: &Self::Input) -> TangentsPerMesh {
        let (meshes, parts, normals, materials) = input;

        meshes
            .iter()
            .zip(parts)
            .zip(normals)
            .map(|((mesh, parts), normals)| {
                if !mesh.tangents.is_empty() || self.passthrough {
                    return mesh.tangents.clone();
                }

                if !needs_tangents(parts, materials) {
                    return vec![];
                }

                if normals.len() != mesh.vertex_count() {
                    if !normals.is_empty() {
                        ctx.warn(format!(
                            "Mesh {} has {} normals for {} vertices; skipping tangents",
                            mesh.name,
                            normals.len(),
                            mesh.vertex_count()
                        ));
                    }

                    return vec![];
                }

                if mesh.tex_coords0.len() != mesh.vertex_count() {
                    ctx.warn(format!(
                        "Mesh {} needs tangents but has no texture coordinates",
                        mesh.name
                    ));

                    return vec![];
                }

                let vertices = to_glam(&mesh.vertices);
                let normals = to_glam(normals);
                let mut tangents = vec![GlamVec3::ZERO; vertices.len()];
                accumulate_tangents(
                    parts,
                    |idx| vertices[idx],
                    |idx| normals[idx],
                    |idx| GlamVec2::from_array(mesh.tex_coords0[idx]),
                    Some,
                    &mut tangents,
                );

                from_glam(tangents)
            })
            .collect()
    }
}

/// Synthesizes normals for the vertices each blendshape moves.
///
/// Neighbouring vertices which the blendshape leaves alone contribute their base-mesh positions.
#[derive(Default)]
pub struct CalculateBlendshapeNormals {
    passthrough: bool,
}

impl Job for CalculateBlendshapeNormals {
    type Config = PassthroughConfig;
    type Input = (Vec<MeshRecord>, PartsPerMesh);
    type Output = NormalsPerBlendshapePerMesh;

    fn configure(&mut self, config: &PassthroughConfig) {
        self.passthrough = config.passthrough;
    }

    fn run(&mut self, _: &BakeContext, (meshes, parts): &Self::Input) -> Self::Output {
        meshes
            .iter()
            .zip(parts)
            .map(|(mesh, parts)| {
                mesh.blendshapes
                    .iter()
                    .map(|blendshape| {
                        if !blendshape.normals.is_empty() || self.passthrough {
                            return blendshape.normals.clone();
                        }

                        let reverse = reverse_index(blendshape, mesh.vertex_count());
                        let base = to_glam(&mesh.vertices);
                        let deltas = to_glam(&blendshape.vertices);
                        let mut normals = vec![GlamVec3::ZERO; blendshape.indices.len()];
                        accumulate_normals(
                            parts,
                            |idx| match reverse[idx] {
                                Some(local) => base[idx] + deltas[local],
                                None => base[idx],
                            },
                            |idx| reverse[idx],
                            &mut normals,
                        );

                        from_glam(normals)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Synthesizes tangents for the vertices each blendshape moves, when the mesh needs tangents.
#[derive(Default)]
pub struct CalculateBlendshapeTangents {
    passthrough: bool,
}

impl Job for CalculateBlendshapeTangents {
    type Config = PassthroughConfig;
    type Input = (
        NormalsPerBlendshapePerMesh,
        Vec<MeshRecord>,
        PartsPerMesh,
        NormalsPerMesh,
        Vec<MaterialRecord>,
    );
    type Output = TangentsPerBlendshapePerMesh;

    fn configure(&mut self, config: &PassthroughConfig) {
        self.passthrough = config.passthrough;
    }

    fn run(&mut self, _: &BakeContext, input: &Self::Input) -> Self::Output {
        let (blendshape_normals, meshes, parts, mesh_normals, materials) = input;

        meshes
            .iter()
            .zip(parts)
            .zip(mesh_normals)
            .zip(blendshape_normals)
            .map(|(((mesh, parts), mesh_normals), blendshape_normals)| {
                let can_compute = !self.passthrough
                    && mesh.tex_coords0.len() == mesh.vertex_count()
                    && mesh_normals.len() == mesh.vertex_count()
                    && needs_tangents(parts, materials);

                mesh.blendshapes
                    .iter()
                    .zip(blendshape_normals)
                    .map(|(blendshape, normals)| {
                        if !blendshape.tangents.is_empty()
                            || !can_compute
                            || normals.len() != blendshape.indices.len()
                        {
                            return blendshape.tangents.clone();
                        }

                        let reverse = reverse_index(blendshape, mesh.vertex_count());
                        let base = to_glam(&mesh.vertices);
                        let base_normals = to_glam(mesh_normals);
                        let deltas = to_glam(&blendshape.vertices);
                        let normals = to_glam(normals);
                        let mut tangents = vec![GlamVec3::ZERO; blendshape.indices.len()];
                        accumulate_tangents(
                            parts,
                            |idx| match reverse[idx] {
                                Some(local) => base[idx] + deltas[local],
                                None => base[idx],
                            },
                            |idx| match reverse[idx] {
                                Some(local) => normals[local],
                                None => base_normals[idx],
                            },
                            |idx| GlamVec2::from_array(mesh.tex_coords0[idx]),
                            |idx| reverse[idx],
                            &mut tangents,
                        );

                        from_glam(tangents)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Applies mapping joint renames, index overrides and rotation offsets.
#[derive(Default)]
pub struct PrepareJoints {
    passthrough: bool,
}

impl Job for PrepareJoints {
    type Config = PassthroughConfig;
    type Input = (Vec<Joint>, JointOverrides);
    type Output = PreparedJoints;

    fn configure(&mut self, config: &PassthroughConfig) {
        self.passthrough = config.passthrough;
    }

    fn run(&mut self, ctx: &BakeContext, (joints, overrides): &Self::Input) -> PreparedJoints {
        let mut joints = joints.clone();
        let mut rotation_offsets = BTreeMap::new();

        if !self.passthrough {
            for joint in &mut joints {
                if let Some(name) = overrides.renames.get(&joint.name) {
                    joint.name = name.clone();
                }
            }

            for (name, rotation) in &overrides.rotation_offsets {
                if let Some((idx, joint)) = joints
                    .iter_mut()
                    .enumerate()
                    .find(|(_, joint)| &joint.name == name)
                {
                    joint.rotation_offset = rotation.to_quat();
                    rotation_offsets.insert(idx, joint.rotation_offset);
                } else {
                    ctx.warn(format!("Rotation offset names unknown joint {name}"));
                }
            }
        }

        let mut joint_indices = joints
            .iter()
            .enumerate()
            .map(|(idx, joint)| (joint.name.clone(), idx))
            .collect::<BTreeMap<_, _>>();

        if !self.passthrough {
            for (name, &idx) in &overrides.indices {
                if idx >= joints.len() {
                    ctx.warn(format!(
                        "Joint index {idx} for {name} is outside of the {} joints",
                        joints.len()
                    ));
                } else {
                    joint_indices.insert(name.clone(), idx);
                }
            }
        }

        PreparedJoints {
            joints,
            rotation_offsets,
            joint_indices,
        }
    }
}

/// Resolves the `material_map` of a mapping against the directory of the mapping file.
#[derive(Default)]
pub struct ParseMaterialMapping;

impl Job for ParseMaterialMapping {
    type Config = ();
    type Input = (BTreeMap<String, MaterialMapEntry>, PathBuf);
    type Output = Vec<(String, MaterialOverride)>;

    fn run(&mut self, _: &BakeContext, (entries, base_dir): &Self::Input) -> Self::Output {
        entries
            .iter()
            .map(|(name, entry)| {
                let entry = match entry {
                    MaterialMapEntry::Url(url) => MaterialOverride::Url(resolve_url(base_dir, url)),
                    MaterialMapEntry::Inline(material) => {
                        MaterialOverride::Inline(material.clone())
                    }
                };

                (name.clone(), entry)
            })
            .collect()
    }
}

/// Settings of [`BuildCodecMeshes`]; encoding is off unless enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodecConfig {
    pub enabled: bool,
    pub quantization: Quantization,
}

/// Encodes every mesh into a codec mesh.
#[derive(Default)]
pub struct BuildCodecMeshes {
    config: CodecConfig,
}

impl BuildCodecMeshes {
    /// Pushes whole triangles of `indices`, dropping a trailing partial triangle.
    fn push_run(
        ctx: &BakeContext,
        builder: &mut CodecMeshBuilder,
        mesh: &MeshRecord,
        indices: &[u32],
        material_id: u32,
    ) {
        let remainder = indices.len() % 3;
        if remainder != 0 {
            ctx.warn(format!(
                "Mesh {} has an index run of {} indices; dropping the last {remainder}",
                mesh.name,
                indices.len()
            ));
        }

        for tri in indices.chunks_exact(3) {
            builder.push_triangle([tri[0], tri[1], tri[2]], material_id);
        }
    }
}

impl Job for BuildCodecMeshes {
    type Config = CodecConfig;
    type Input = (Vec<MeshRecord>, PartsPerMesh, NormalsPerMesh, TangentsPerMesh);
    type Output = CodecMeshes;

    fn configure(&mut self, config: &CodecConfig) {
        self.config = *config;
    }

    fn run(&mut self, ctx: &BakeContext, input: &Self::Input) -> CodecMeshes {
        if !self.config.enabled {
            return vec![];
        }

        let (meshes, parts, normals, tangents) = input;
        let mut res = Vec::with_capacity(meshes.len());

        for (idx, mesh) in meshes.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }

            let parts = parts.get(idx).map(Vec::as_slice).unwrap_or_default();
            let normals = normals.get(idx).map(Vec::as_slice).unwrap_or_default();
            let tangents = tangents.get(idx).map(Vec::as_slice).unwrap_or_default();

            let mut builder = CodecMeshBuilder::new(self.config.quantization, &mesh.vertices)
                .with_normals(normals)
                .with_tangents(tangents)
                .with_colors(&mesh.colors)
                .with_tex_coords0(&mesh.tex_coords0)
                .with_tex_coords1(&mesh.tex_coords1);

            if mesh.is_skinned() {
                builder = builder.with_original_index();
            }

            let has_face_materials =
                parts.len() > 1 || parts.first().is_some_and(|part| part.material_id != 0);
            if has_face_materials {
                builder = builder.with_face_materials();
            }

            for part in parts {
                Self::push_run(
                    ctx,
                    &mut builder,
                    mesh,
                    &part.quad_triangle_indices,
                    part.material_id,
                );
                Self::push_run(ctx, &mut builder, mesh, &part.triangle_indices, part.material_id);
            }

            let encoded = match builder.finalize() {
                Ok(Some(codec_mesh)) => match codec_mesh.to_bytes() {
                    Ok(buf) => Some(buf),
                    Err(err) => {
                        ctx.warn(format!("Unable to write codec mesh {}: {err:#}", mesh.name));
                        None
                    }
                },
                Ok(None) => {
                    ctx.warn(format!("Mesh {} has no triangles to encode", mesh.name));
                    None
                }
                Err(err) => {
                    ctx.warn(format!("Unable to encode mesh {}: {err:#}", mesh.name));
                    None
                }
            };

            res.push(encoded);
        }

        res
    }
}

/// Gathers the per-mesh outputs of earlier jobs back into mesh records.
#[derive(Default)]
pub struct BuildMeshes;

impl Job for BuildMeshes {
    type Config = ();
    type Input = (
        Vec<MeshRecord>,
        PartsPerMesh,
        NormalsPerMesh,
        TangentsPerMesh,
        NormalsPerBlendshapePerMesh,
        TangentsPerBlendshapePerMesh,
    );
    type Output = Vec<MeshRecord>;

    fn run(&mut self, _: &BakeContext, input: &Self::Input) -> Vec<MeshRecord> {
        let (meshes, parts, normals, tangents, blendshape_normals, blendshape_tangents) = input;
        let mut meshes = meshes.clone();

        for (idx, mesh) in meshes.iter_mut().enumerate() {
            if let Some(parts) = parts.get(idx) {
                mesh.parts = parts.clone();
            }

            if let Some(normals) = normals.get(idx) {
                mesh.normals = normals.clone();
            }

            if let Some(tangents) = tangents.get(idx) {
                mesh.tangents = tangents.clone();
            }

            for (shape_idx, blendshape) in mesh.blendshapes.iter_mut().enumerate() {
                if let Some(normals) = blendshape_normals
                    .get(idx)
                    .and_then(|normals| normals.get(shape_idx))
                {
                    blendshape.normals = normals.clone();
                }

                if let Some(tangents) = blendshape_tangents
                    .get(idx)
                    .and_then(|tangents| tangents.get(shape_idx))
                {
                    blendshape.tangents = tangents.clone();
                }
            }
        }

        meshes
    }
}

/// Everything the geometry graph hands back to the model baker.
#[derive(Debug, Default)]
pub struct GeometryOutput {
    pub codec_meshes: CodecMeshes,
    pub joints: PreparedJoints,
    pub material_mapping: Vec<(String, MaterialOverride)>,
    pub meshes: Vec<MeshRecord>,
    pub warnings: Vec<String>,
}

/// The geometry engine with its inputs and outputs wired up.
pub struct GeometryGraph {
    engine: Engine,

    // Inputs
    joints: Var<Vec<Joint>>,
    joint_overrides: Var<JointOverrides>,
    material_map: Var<BTreeMap<String, MaterialMapEntry>>,
    material_map_base: Var<PathBuf>,
    materials: Var<Vec<MaterialRecord>>,
    meshes: Var<Vec<MeshRecord>>,

    // Outputs
    codec_meshes: Var<CodecMeshes>,
    material_mapping: Var<Vec<(String, MaterialOverride)>>,
    meshes_out: Var<Vec<MeshRecord>>,
    prepared_joints: Var<PreparedJoints>,
}

impl GeometryGraph {
    pub const BUILD_CODEC_MESHES: &'static str = "BuildCodecMeshes";
    pub const CALCULATE_BLENDSHAPE_NORMALS: &'static str = "CalculateBlendshapeNormals";
    pub const CALCULATE_BLENDSHAPE_TANGENTS: &'static str = "CalculateBlendshapeTangents";
    pub const CALCULATE_MESH_TANGENTS: &'static str = "CalculateMeshTangents";
    pub const PREPARE_JOINTS: &'static str = "PrepareJoints";

    pub fn build(token: CancellationToken) -> Self {
        let mut engine = Engine::new("Geometry", token);

        let materials = engine.input();
        let joints = engine.input();
        let joint_overrides = engine.input();
        let material_map = engine.input();
        let material_map_base = engine.input();

        let raw_meshes = engine.input();
        let meshes = engine.add_job("SanitizeMeshAttributes", SanitizeMeshAttributes, raw_meshes);
        let parts = engine.add_job("SanitizeMeshIndices", SanitizeMeshIndices, meshes);
        let normals = engine.add_job("CalculateMeshNormals", CalculateMeshNormals, (meshes, parts));
        let tangents = engine.add_job(
            Self::CALCULATE_MESH_TANGENTS,
            CalculateMeshTangents::default(),
            (meshes, parts, normals, materials),
        );
        let blendshape_normals = engine.add_job(
            Self::CALCULATE_BLENDSHAPE_NORMALS,
            CalculateBlendshapeNormals::default(),
            (meshes, parts),
        );
        let blendshape_tangents = engine.add_job(
            Self::CALCULATE_BLENDSHAPE_TANGENTS,
            CalculateBlendshapeTangents::default(),
            (blendshape_normals, meshes, parts, normals, materials),
        );
        let prepared_joints = engine.add_job(
            Self::PREPARE_JOINTS,
            PrepareJoints::default(),
            (joints, joint_overrides),
        );
        let material_mapping = engine.add_job(
            "ParseMaterialMapping",
            ParseMaterialMapping,
            (material_map, material_map_base),
        );
        let codec_meshes = engine.add_job(
            Self::BUILD_CODEC_MESHES,
            BuildCodecMeshes::default(),
            (meshes, parts, normals, tangents),
        );
        let meshes_out = engine.add_job(
            "BuildMeshes",
            BuildMeshes,
            (
                meshes,
                parts,
                normals,
                tangents,
                blendshape_normals,
                blendshape_tangents,
            ),
        );

        Self {
            engine,
            joints,
            joint_overrides,
            material_map,
            material_map_base,
            materials,
            meshes: raw_meshes,
            codec_meshes,
            material_mapping,
            meshes_out,
            prepared_joints,
        }
    }

    pub fn configure<C: 'static>(&mut self, name: &str, config: &C) -> bool {
        self.engine.configure(name, config)
    }

    pub fn feed_meshes(&mut self, meshes: Vec<MeshRecord>, materials: Vec<MaterialRecord>) {
        self.engine.feed(self.meshes, meshes);
        self.engine.feed(self.materials, materials);
    }

    pub fn feed_joints(&mut self, joints: Vec<Joint>, overrides: JointOverrides) {
        self.engine.feed(self.joints, joints);
        self.engine.feed(self.joint_overrides, overrides);
    }

    pub fn feed_material_map(
        &mut self,
        material_map: BTreeMap<String, MaterialMapEntry>,
        base_dir: impl AsRef<Path>,
    ) {
        self.engine.feed(self.material_map, material_map);
        self.engine
            .feed(self.material_map_base, base_dir.as_ref().to_path_buf());
    }

    /// Runs every job; returns `None` if cancellation interrupted the run.
    pub fn run(mut self) -> Option<GeometryOutput> {
        if !self.engine.run() {
            return None;
        }

        Some(GeometryOutput {
            codec_meshes: self.engine.output(self.codec_meshes),
            joints: self.engine.output(self.prepared_joints),
            material_mapping: self.engine.output(self.material_mapping),
            meshes: self.engine.output(self.meshes_out),
            warnings: self.engine.context().take_warnings(),
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{CodecMesh, MapChannel, TextureSource},
        ordered_float::OrderedFloat,
    };

    fn ctx() -> BakeContext {
        BakeContext::new(CancellationToken::new())
    }

    /// Unit cube: 8 vertices, 12 triangles.
    fn cube() -> MeshRecord {
        let vertices = vec![
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ];
        let part = MeshPart {
            triangle_indices: vec![
                0, 2, 1, 0, 3, 2, // back
                4, 5, 6, 4, 6, 7, // front
                0, 1, 5, 0, 5, 4, // bottom
                3, 7, 6, 3, 6, 2, // top
                0, 4, 7, 0, 7, 3, // left
                1, 2, 6, 1, 6, 5, // right
            ],
            ..Default::default()
        };

        MeshRecord::new("cube", vertices).with_part(part)
    }

    fn triangle() -> MeshRecord {
        let mut mesh = MeshRecord::new(
            "tri",
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        )
        .with_part(MeshPart {
            triangle_indices: vec![0, 1, 2],
            ..Default::default()
        });
        mesh.tex_coords0 = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        mesh
    }

    fn normal_mapped() -> Vec<MaterialRecord> {
        vec![MaterialRecord::new("bumpy").with_map(
            MapChannel::Normal,
            TextureSource::Url("n.png".into()),
        )]
    }

    #[test]
    fn sanitize_replaces_out_of_range_indices() {
        let mut mesh = triangle();
        mesh.parts[0].triangle_indices = vec![0, 1, 7];
        mesh.parts[0].quad_indices = vec![9, 0, 1, 2];

        let ctx = ctx();
        let parts = SanitizeMeshIndices.run(&ctx, &vec![mesh.clone()]);

        assert_eq!(parts[0][0].triangle_indices, vec![0, 1, 0]);
        assert_eq!(parts[0][0].quad_indices, vec![0, 0, 1, 2]);
        assert_eq!(ctx.take_warnings().len(), 1);

        // Idempotent
        mesh.parts = parts[0].clone();
        let again = SanitizeMeshIndices.run(&ctx, &vec![mesh]);

        assert_eq!(again, parts);
        assert!(ctx.take_warnings().is_empty());
    }

    #[test]
    fn sanitize_clears_runs_of_empty_meshes() {
        let mut mesh = triangle();
        mesh.vertices.clear();

        let parts = SanitizeMeshIndices.run(&ctx(), &vec![mesh]);

        assert!(parts[0][0].triangle_indices.is_empty());
    }

    #[test]
    fn existing_normals_pass_through() {
        let mut mesh = triangle();
        mesh.normals = vec![[1.0, 0.0, 0.0]; 3];
        let parts = vec![mesh.parts.clone()];

        let normals = CalculateMeshNormals.run(&ctx(), &(vec![mesh.clone()], parts));

        assert_eq!(normals[0], mesh.normals);
    }

    #[test]
    fn synthesized_normals_are_unit_length() {
        let mesh = cube();
        let parts = vec![mesh.parts.clone()];

        let normals = CalculateMeshNormals.run(&ctx(), &(vec![mesh], parts));

        assert_eq!(normals[0].len(), 8);

        for normal in &normals[0] {
            let len = GlamVec3::from_array(*normal).length();
            assert!((len - 1.0).abs() < 1e-5);
        }

        // Corner normals of a cube point away from the center
        let corner = GlamVec3::from_array(normals[0][6]);
        assert!(corner.dot(GlamVec3::ONE.normalize()) > 0.99);
    }

    #[test]
    fn unreferenced_vertices_get_zero_normals() {
        let mut mesh = triangle();
        mesh.vertices.push([5.0, 5.0, 5.0]);
        let parts = vec![mesh.parts.clone()];

        let normals = CalculateMeshNormals.run(&ctx(), &(vec![mesh], parts));

        assert_eq!(normals[0][3], [0.0, 0.0, 0.0]);
        assert_eq!(normals[0][0], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn tangents_need_a_normal_mapped_material() {
        let mesh = triangle();
        let parts = vec![mesh.parts.clone()];
        let normals = vec![vec![[0.0, 0.0, 1.0]; 3]];
        let ctx = ctx();

        let plain = CalculateMeshTangents::default().run(
            &ctx,
            &(vec![mesh.clone()], parts.clone(), normals.clone(), vec![]),
        );

        assert!(plain[0].is_empty());

        let bumpy = CalculateMeshTangents::default().run(
            &ctx,
            &(vec![mesh], parts, normals, normal_mapped()),
        );

        assert_eq!(bumpy[0].len(), 3);

        // U runs along +x on this triangle
        let tangent = GlamVec3::from_array(bumpy[0][0]);
        assert!(tangent.dot(GlamVec3::X) > 0.99);
    }

    #[test]
    fn tangents_skip_meshes_without_normals() {
        let mesh = triangle();
        let parts = vec![mesh.parts.clone()];

        let tangents = CalculateMeshTangents::default().run(
            &ctx(),
            &(vec![mesh], parts, vec![vec![]], normal_mapped()),
        );

        assert!(tangents[0].is_empty());
    }

    #[test]
    fn blendshape_normals_only_cover_moved_vertices() {
        let mut mesh = triangle();
        mesh.vertices.push([1.0, 1.0, 0.0]);
        mesh.parts[0].triangle_indices.extend([1, 3, 2]);

        // Lift vertex 3 out of the plane
        mesh.blendshapes
            .push(Blendshape::new("lift", vec![3], vec![[0.0, 0.0, 1.0]]));
        let parts = vec![mesh.parts.clone()];

        let normals = CalculateBlendshapeNormals::default().run(&ctx(), &(vec![mesh], parts));

        assert_eq!(normals[0][0].len(), 1);

        let normal = GlamVec3::from_array(normals[0][0][0]);
        assert!((normal.length() - 1.0).abs() < 1e-5);
        assert!(normal.z < 1.0);
    }

    #[test]
    fn blendshape_tangents_follow_the_deformed_surface() {
        let mut mesh = triangle();
        mesh.vertices.push([1.0, 1.0, 0.0]);
        mesh.tex_coords0.push([1.0, 1.0]);
        mesh.parts[0].triangle_indices.extend([1, 3, 2]);

        // Lifts the whole quad, so the deformed surface keeps U along +x
        mesh.blendshapes.push(Blendshape::new(
            "lift",
            vec![0, 1, 2, 3],
            vec![[0.0, 0.0, 2.0]; 4],
        ));
        let parts = vec![mesh.parts.clone()];
        let mesh_normals = vec![vec![[0.0, 0.0, 1.0]; 4]];
        let blendshape_normals = vec![vec![vec![[0.0, 0.0, 1.0]; 4]]];
        let input = (
            blendshape_normals,
            vec![mesh],
            parts,
            mesh_normals,
            normal_mapped(),
        );

        let tangents = CalculateBlendshapeTangents::default().run(&ctx(), &input);

        assert_eq!(tangents[0][0].len(), 4);

        for tangent in &tangents[0][0] {
            let tangent = GlamVec3::from_array(*tangent);
            assert!((tangent.length() - 1.0).abs() < 1e-5);
            assert!(tangent.dot(GlamVec3::X) > 0.99);
        }

        // Without a normal mapped material there is nothing to compute
        let (blendshape_normals, meshes, parts, mesh_normals, _) = input;
        let plain = CalculateBlendshapeTangents::default()
            .run(&ctx(), &(blendshape_normals, meshes, parts, mesh_normals, vec![]));

        assert!(plain[0][0].is_empty());
    }

    #[test]
    fn sanitize_drops_mismatched_attributes() {
        let mut mesh = triangle();
        mesh.normals = vec![[0.0, 0.0, 1.0]];
        mesh.colors = vec![[1.0; 4]; 3];
        mesh.skin_indices = vec![[0; 4]; 5];
        mesh.blendshapes.push(Blendshape {
            name: "broken".into(),
            indices: vec![0, 1],
            vertices: vec![[0.0, 0.0, 1.0]],
            normals: vec![[0.0, 0.0, 1.0]; 2],
            tangents: vec![],
        });

        let ctx = ctx();
        let meshes = SanitizeMeshAttributes.run(&ctx, &vec![mesh]);

        assert!(meshes[0].normals.is_empty());
        assert!(meshes[0].skin_indices.is_empty());
        assert_eq!(meshes[0].colors.len(), 3);
        assert_eq!(meshes[0].tex_coords0.len(), 3);
        assert_eq!(meshes[0].blendshapes[0].indices, vec![0]);
        assert_eq!(meshes[0].blendshapes[0].vertices.len(), 1);
        assert!(meshes[0].blendshapes[0].normals.is_empty());
        assert_eq!(ctx.take_warnings().len(), 2);
    }

    #[test]
    fn short_normals_are_recalculated() {
        let mut mesh = triangle();
        mesh.normals = vec![[0.0, 0.0, 1.0]];
        let parts = vec![mesh.parts.clone()];
        let ctx = ctx();

        let normals = CalculateMeshNormals.run(&ctx, &(vec![mesh.clone()], parts.clone()));

        assert_eq!(normals[0], vec![[0.0, 0.0, 1.0]; 3]);
        assert_eq!(ctx.take_warnings().len(), 1);

        let tangents = CalculateMeshTangents::default().run(
            &ctx,
            &(vec![mesh], parts, vec![vec![[0.0, 0.0, 1.0]]], normal_mapped()),
        );

        assert!(tangents[0].is_empty());
        assert_eq!(ctx.take_warnings().len(), 1);
    }

    #[test]
    fn graph_survives_short_normals() {
        let mut mesh = triangle();
        mesh.normals = vec![[0.0, 0.0, 1.0]];

        let mut graph = GeometryGraph::build(CancellationToken::new());
        graph.configure(
            GeometryGraph::BUILD_CODEC_MESHES,
            &CodecConfig {
                enabled: true,
                ..Default::default()
            },
        );
        graph.feed_meshes(vec![mesh], normal_mapped());

        let output = graph.run().unwrap();

        assert_eq!(output.meshes[0].normals.len(), 3);
        assert_eq!(output.meshes[0].tangents.len(), 3);
        assert!(output.codec_meshes[0].is_some());
        assert!(!output.warnings.is_empty());
    }

    #[test]
    fn prepare_joints_applies_overrides() {
        let joints = vec![Joint::new("mixamorig:Hips"), Joint::new("Spine")];
        let mut overrides = JointOverrides::default();
        overrides
            .renames
            .insert("mixamorig:Hips".into(), "Hips".into());
        overrides.rotation_offsets.insert(
            "Spine".into(),
            Rotation::Euler([OrderedFloat(0.0), OrderedFloat(90.0), OrderedFloat(0.0)]),
        );
        overrides.indices.insert("Head".into(), 1);
        overrides.indices.insert("Tail".into(), 9);

        let ctx = ctx();
        let prepared = PrepareJoints::default().run(&ctx, &(joints.clone(), overrides.clone()));

        assert_eq!(prepared.joints[0].name, "Hips");
        assert_eq!(prepared.joint_indices["Hips"], 0);
        assert_eq!(prepared.joint_indices["Head"], 1);
        assert!(!prepared.joint_indices.contains_key("Tail"));
        assert!(prepared.rotation_offsets.contains_key(&1));
        assert_eq!(ctx.take_warnings().len(), 1);

        let mut passthrough = PrepareJoints::default();
        passthrough.configure(&PassthroughConfig { passthrough: true });
        let prepared = passthrough.run(&ctx, &(joints.clone(), overrides));

        assert_eq!(prepared.joints, joints);
        assert!(prepared.rotation_offsets.is_empty());
    }

    #[test]
    fn codec_encoding_is_disabled_by_default() {
        let mesh = cube();
        let parts = vec![mesh.parts.clone()];

        let encoded =
            BuildCodecMeshes::default().run(&ctx(), &(vec![mesh], parts, vec![], vec![]));

        assert!(encoded.is_empty());
    }

    #[test]
    fn codec_drops_partial_triangles() {
        let mut mesh = cube();
        mesh.parts[0].triangle_indices.extend([0, 1]);
        let parts = vec![mesh.parts.clone()];

        let mut job = BuildCodecMeshes::default();
        job.configure(&CodecConfig {
            enabled: true,
            ..Default::default()
        });

        let ctx = ctx();
        let encoded = job.run(&ctx, &(vec![mesh], parts, vec![], vec![]));
        let codec_mesh = CodecMesh::from_bytes(encoded[0].as_deref().unwrap()).unwrap();

        assert_eq!(codec_mesh.triangle_count(), 12);
        assert_eq!(ctx.take_warnings().len(), 1);
    }

    #[test]
    fn codec_face_materials_follow_parts() {
        let single = triangle();
        let mut offset = triangle();
        offset.parts[0].material_id = 2;

        let mut job = BuildCodecMeshes::default();
        job.configure(&CodecConfig {
            enabled: true,
            ..Default::default()
        });

        let parts = vec![single.parts.clone(), offset.parts.clone()];
        let encoded = job.run(&ctx(), &(vec![single, offset], parts, vec![], vec![]));
        let single = CodecMesh::from_bytes(encoded[0].as_deref().unwrap()).unwrap();
        let offset = CodecMesh::from_bytes(encoded[1].as_deref().unwrap()).unwrap();

        assert!(!single.has_attribute(crate::Attribute::FaceMaterial));
        assert!(offset.has_attribute(crate::Attribute::FaceMaterial));
    }

    #[test]
    fn codec_reports_empty_meshes() {
        let mut mesh = triangle();
        mesh.parts[0].triangle_indices.clear();
        let parts = vec![mesh.parts.clone()];

        let mut job = BuildCodecMeshes::default();
        job.configure(&CodecConfig {
            enabled: true,
            ..Default::default()
        });

        let ctx = ctx();
        let encoded = job.run(&ctx, &(vec![mesh], parts, vec![], vec![]));

        assert_eq!(encoded, vec![None]);
        assert_eq!(ctx.take_warnings().len(), 1);
    }

    #[test]
    fn graph_produces_normals_and_codec_meshes() {
        let mut graph = GeometryGraph::build(CancellationToken::new());
        graph.configure(
            GeometryGraph::BUILD_CODEC_MESHES,
            &CodecConfig {
                enabled: true,
                ..Default::default()
            },
        );
        graph.feed_meshes(vec![cube()], vec![MaterialRecord::new("plain")]);

        let output = graph.run().unwrap();

        assert_eq!(output.meshes[0].normals.len(), 8);
        assert!(output.meshes[0].tangents.is_empty());
        assert_eq!(output.codec_meshes.len(), 1);

        let codec_mesh = CodecMesh::from_bytes(output.codec_meshes[0].as_deref().unwrap()).unwrap();

        assert!(codec_mesh.has_attribute(crate::Attribute::Normal));
        assert!(!codec_mesh.has_attribute(crate::Attribute::Tangent));
        assert_eq!(codec_mesh.vertex_count(), 8);
    }

    #[test]
    fn cancelled_graph_returns_nothing() {
        let token = CancellationToken::new();
        let mut graph = GeometryGraph::build(token.clone());
        graph.feed_meshes(vec![cube()], vec![]);
        token.cancel();

        assert!(graph.run().is_none());
    }
}
