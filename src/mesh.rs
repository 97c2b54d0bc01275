use {
    super::{Quat, Vec2, Vec3, Vec4},
    serde::{Deserialize, Serialize},
};

/// A sparse deformation target: only the listed base-mesh vertices move.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Blendshape {
    pub name: String,

    /// Indices into the vertex array of the owning [`MeshRecord`].
    pub indices: Vec<u32>,

    /// Position deltas, one per entry of `indices`.
    pub vertices: Vec<Vec3>,

    /// Normals of the deformed vertices, one per entry of `indices` when present.
    pub normals: Vec<Vec3>,

    /// Tangents of the deformed vertices, one per entry of `indices` when present.
    pub tangents: Vec<Vec3>,
}

impl Blendshape {
    pub fn new(name: impl Into<String>, indices: Vec<u32>, vertices: Vec<Vec3>) -> Self {
        debug_assert_eq!(indices.len(), vertices.len());

        Self {
            name: name.into(),
            indices,
            vertices,
            normals: vec![],
            tangents: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Joint {
    /// Name of the joint/bone.
    pub name: String,

    /// Index into the joint list of the parent of this joint.
    pub parent_index: Option<usize>,

    /// Extra rotation applied after the authored rotation; identity unless a mapping overrides it.
    pub rotation_offset: Quat,
}

impl Joint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_index: None,
            rotation_offset: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Index runs of one material slot of a mesh.
///
/// `quad_indices` keeps four indices per authored quad; `quad_triangle_indices` holds the same
/// quads split into triangles. Only the triangle runs are ever rendered or encoded.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MeshPart {
    pub material_id: u32,
    pub quad_indices: Vec<u32>,
    pub quad_triangle_indices: Vec<u32>,
    pub triangle_indices: Vec<u32>,
}

impl MeshPart {
    pub fn new(material_id: u32) -> Self {
        Self {
            material_id,
            ..Default::default()
        }
    }

    /// Every triangle of this part: quad-triangles first, then authored triangles.
    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.quad_triangle_indices
            .chunks_exact(3)
            .chain(self.triangle_indices.chunks_exact(3))
            .map(|tri| [tri[0], tri[1], tri[2]])
    }
}

/// Geometry of one mesh as extracted from a scene.
///
/// Every per-vertex array is either empty or exactly `vertices.len()` long. A non-empty array
/// means the attribute is already known and must not be recomputed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MeshRecord {
    pub name: String,
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub colors: Vec<Vec4>,
    pub tex_coords0: Vec<Vec2>,
    pub tex_coords1: Vec<Vec2>,

    /// Non-empty for skinned meshes.
    pub skin_indices: Vec<[u16; 4]>,

    pub parts: Vec<MeshPart>,
    pub blendshapes: Vec<Blendshape>,
}

impl MeshRecord {
    pub fn new(name: impl Into<String>, vertices: Vec<Vec3>) -> Self {
        Self {
            name: name.into(),
            vertices,
            ..Default::default()
        }
    }

    pub fn with_part(mut self, part: MeshPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn is_skinned(&self) -> bool {
        !self.skin_indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.parts.iter().map(|part| part.triangles().count()).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangles_visit_quads_first() {
        let part = MeshPart {
            material_id: 0,
            quad_indices: vec![0, 1, 2, 3],
            quad_triangle_indices: vec![0, 1, 2, 0, 2, 3],
            triangle_indices: vec![4, 5, 6, 7],
        };

        assert_eq!(
            part.triangles().collect::<Vec<_>>(),
            vec![[0, 1, 2], [0, 2, 3], [4, 5, 6]]
        );
    }
}
