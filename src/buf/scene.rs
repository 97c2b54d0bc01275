//! Reading bakeable data out of a scene node tree and writing baked data back into it.
//!
//! ```text
//! Objects
//!   Geometry [id, name]      Vertices, PolygonVertexIndex, LayerElement*, Shape [name]
//!   Material [id, name]
//!   Texture [id, name]       RelativeFilename
//!   Video [id, name]         RelativeFilename, Content
//!   Model [id, name, kind]   kind "LimbNode" is a joint
//!   Deformer [id, name, kind] kind "Cluster" carries Indexes
//! Connections
//!   C ["OO", child, parent]
//!   C ["OP", child, parent, channel]
//! ```

use {
    super::{error::BakeError, geometry::GeometryOutput, resolve_url},
    crate::{
        Blendshape, Joint, MapChannel, MaterialRecord, MeshPart, MeshRecord, Property, SceneNode,
        TextureSource, Vec3,
    },
    std::{
        collections::{BTreeMap, HashMap},
        path::Path,
    },
};

/// Raw attribute nodes which a codec mesh replaces, plus attributes the codec does not carry.
const REPLACED_GEOMETRY_NODES: [&str; 11] = [
    "Edges",
    "LayerElementBinormal",
    "LayerElementColor",
    "LayerElementMaterial",
    "LayerElementNormal",
    "LayerElementSmoothing",
    "LayerElementTangent",
    "LayerElementTexture",
    "LayerElementUV",
    "PolygonVertexIndex",
    "Vertices",
];

const JOINT_KIND: &str = "LimbNode";
const SKIN_CLUSTER_KIND: &str = "Cluster";

/// One edge of the `Connections` list.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Connection<'a> {
    Object { child: i64, parent: i64 },
    Property { child: i64, parent: i64, channel: &'a str },
}

fn connections(root: &SceneNode) -> Vec<Connection<'_>> {
    root.child("Connections")
        .into_iter()
        .flat_map(|connections| connections.children_named("C"))
        .filter_map(|node| {
            let kind = node.property(0)?.as_str()?;
            let child = node.property(1)?.as_i64()?;
            let parent = node.property(2)?.as_i64()?;

            match kind {
                "OO" => Some(Connection::Object { child, parent }),
                "OP" => Some(Connection::Property {
                    child,
                    parent,
                    channel: node.property(3)?.as_str()?,
                }),
                _ => None,
            }
        })
        .collect()
}

fn node_id(node: &SceneNode) -> Option<i64> {
    node.property(0).and_then(Property::as_i64)
}

fn node_name(node: &SceneNode) -> &str {
    node.property(1)
        .and_then(Property::as_str)
        .unwrap_or_default()
}

fn node_kind(node: &SceneNode) -> &str {
    node.property(2)
        .and_then(Property::as_str)
        .unwrap_or_default()
}

fn objects<'a>(root: &'a SceneNode, name: &'a str) -> impl Iterator<Item = &'a SceneNode> {
    root.child("Objects")
        .into_iter()
        .flat_map(move |objects| objects.children_named(name))
}

/// Reads `components`-wide tuples from the first property of `node`.
fn read_tuples<const N: usize>(node: Option<&SceneNode>) -> Option<Vec<[f32; N]>> {
    let vals = node?.property(0)?.as_f32_array()?;
    if vals.len() % N != 0 {
        return None;
    }

    Some(
        vals.chunks_exact(N)
            .map(|chunk| {
                let mut res = [0.0; N];
                res.copy_from_slice(chunk);
                res
            })
            .collect(),
    )
}

fn flatten<const N: usize>(vals: &[[f32; N]]) -> Vec<f32> {
    vals.iter().flatten().copied().collect()
}

/// A texture node and every material channel it is bound to.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureBinding {
    pub id: i64,
    pub source: TextureSource,
    pub uses: Vec<(usize, MapChannel)>,
}

/// Everything a model bake needs from a scene tree. Meshes follow the order of the geometry nodes.
#[derive(Debug, Default)]
pub struct SceneContents {
    pub joints: Vec<Joint>,
    pub materials: Vec<MaterialRecord>,
    pub meshes: Vec<MeshRecord>,
    pub textures: Vec<TextureBinding>,
    pub warnings: Vec<String>,
}

impl SceneContents {
    /// Collects meshes, materials, textures and joints; texture paths resolve against `base_dir`.
    pub fn harvest(root: &SceneNode, base_dir: &Path) -> Result<Self, BakeError> {
        let connections = connections(root);
        let mut res = Self::default();

        res.harvest_materials(root, &connections, base_dir)?;
        res.harvest_joints(root, &connections);
        res.harvest_meshes(root, &connections);

        Ok(res)
    }

    fn harvest_materials(
        &mut self,
        root: &SceneNode,
        connections: &[Connection],
        base_dir: &Path,
    ) -> Result<(), BakeError> {
        let mut material_indices = HashMap::new();
        for material in objects(root, "Material") {
            if let Some(id) = node_id(material) {
                material_indices.insert(id, self.materials.len());
            }

            self.materials.push(MaterialRecord::new(node_name(material)));
        }

        // Embedded image bytes by the filename they were authored with
        let embedded = objects(root, "Video")
            .filter_map(|video| {
                let name = video.value("RelativeFilename")?.as_str()?;
                let content = video.value("Content")?.as_bytes()?;

                Some((name.to_owned(), content.to_vec()))
            })
            .collect::<HashMap<_, _>>();

        for texture in objects(root, "Texture") {
            let Some(id) = node_id(texture) else {
                continue;
            };

            let Some(filename) = texture
                .value("RelativeFilename")
                .and_then(Property::as_str)
                .filter(|filename| !filename.is_empty())
            else {
                self.warnings
                    .push(format!("Texture {} has no filename", node_name(texture)));
                continue;
            };

            let source = match embedded.get(filename) {
                Some(content) => TextureSource::Embedded {
                    name: resolve_url(base_dir, filename),
                    content: content.clone(),
                },
                None => TextureSource::Url(resolve_url(base_dir, filename)),
            };

            let mut uses = vec![];
            for connection in connections {
                let &Connection::Property {
                    child,
                    parent,
                    channel,
                } = connection
                else {
                    continue;
                };

                if child != id {
                    continue;
                }

                let Some(&material) = material_indices.get(&parent) else {
                    continue;
                };

                let map_channel = MapChannel::parse(channel)
                    .filter(|channel| channel.usage().is_some())
                    .ok_or_else(|| BakeError::UnknownMapChannel {
                        material: self.materials[material].name.clone(),
                        channel: channel.to_owned(),
                    })?;

                self.materials[material]
                    .maps
                    .insert(map_channel, source.clone());
                uses.push((material, map_channel));
            }

            if uses.is_empty() {
                self.warnings.push(format!(
                    "Texture {filename} is not bound to any material channel"
                ));
            } else {
                self.textures.push(TextureBinding { id, source, uses });
            }
        }

        Ok(())
    }

    fn harvest_joints(&mut self, root: &SceneNode, connections: &[Connection]) {
        let joint_nodes = objects(root, "Model")
            .filter(|model| node_kind(model) == JOINT_KIND)
            .collect::<Vec<_>>();
        let joint_indices = joint_nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, model)| node_id(model).map(|id| (id, idx)))
            .collect::<HashMap<_, _>>();

        self.joints = joint_nodes
            .iter()
            .map(|model| {
                let mut joint = Joint::new(node_name(model));
                joint.parent_index = node_id(model).and_then(|id| {
                    connections.iter().find_map(|connection| match *connection {
                        Connection::Object { child, parent } if child == id => {
                            joint_indices.get(&parent).copied()
                        }
                        _ => None,
                    })
                });

                joint
            })
            .collect();
    }

    fn harvest_meshes(&mut self, root: &SceneNode, connections: &[Connection]) {
        let material_ids = objects(root, "Material")
            .enumerate()
            .filter_map(|(idx, material)| node_id(material).map(|id| (id, idx)))
            .collect::<HashMap<_, _>>();
        let joint_ids = objects(root, "Model")
            .filter(|model| node_kind(model) == JOINT_KIND)
            .enumerate()
            .filter_map(|(idx, model)| node_id(model).map(|id| (id, idx)))
            .collect::<HashMap<_, _>>();
        let clusters = objects(root, "Deformer")
            .filter(|deformer| node_kind(deformer) == SKIN_CLUSTER_KIND)
            .filter_map(|deformer| Some((node_id(deformer)?, deformer)))
            .collect::<Vec<_>>();

        for geometry in objects(root, "Geometry") {
            let id = node_id(geometry);

            // Material slots are the material connections of this geometry, in connection order
            let slots = connections
                .iter()
                .filter_map(|connection| match *connection {
                    Connection::Object { child, parent } if Some(parent) == id => {
                        material_ids.get(&child).copied()
                    }
                    _ => None,
                })
                .collect::<Vec<_>>();

            let mut mesh = self.read_mesh(geometry, &slots);

            if let Some(id) = id {
                let skin = clusters
                    .iter()
                    .filter(|(cluster_id, _)| {
                        connections.contains(&Connection::Object {
                            child: *cluster_id,
                            parent: id,
                        })
                    })
                    .filter_map(|(cluster_id, cluster)| {
                        let joint = connections.iter().find_map(|connection| match *connection {
                            Connection::Object { child, parent } if parent == *cluster_id => {
                                joint_ids.get(&child).copied()
                            }
                            _ => None,
                        })?;

                        Some((joint, *cluster))
                    })
                    .collect::<Vec<_>>();

                if !skin.is_empty() {
                    mesh.skin_indices = self.skin_indices(&mesh.name, mesh.vertex_count(), &skin);
                }
            }

            self.meshes.push(mesh);
        }
    }

    /// Up to four joint indices per vertex, from the clusters bound to a mesh.
    fn skin_indices(
        &mut self,
        name: &str,
        vertex_count: usize,
        skin: &[(usize, &SceneNode)],
    ) -> Vec<[u16; 4]> {
        let mut indices = vec![[0u16; 4]; vertex_count];
        let mut counts = vec![0usize; vertex_count];

        for &(joint, cluster) in skin {
            let Ok(joint) = u16::try_from(joint) else {
                self.warnings.push(format!(
                    "Geometry {name} is bound to joint {joint} which does not fit a skin index"
                ));
                continue;
            };

            let vertices = cluster
                .value("Indexes")
                .and_then(Property::as_i32_array)
                .unwrap_or_default();
            for &vertex in vertices {
                let Ok(vertex) = usize::try_from(vertex) else {
                    continue;
                };

                if let Some(count) = counts.get_mut(vertex).filter(|count| **count < 4) {
                    indices[vertex][*count] = joint;
                    *count += 1;
                }
            }
        }

        indices
    }

    fn read_mesh(&mut self, geometry: &SceneNode, slots: &[usize]) -> MeshRecord {
        let name = node_name(geometry).to_owned();
        let vertices = read_tuples::<3>(geometry.child("Vertices")).unwrap_or_else(|| {
            self.warnings
                .push(format!("Geometry {name} has no readable vertices"));
            vec![]
        });
        let mut mesh = MeshRecord::new(&name, vertices);
        let vertex_count = mesh.vertex_count();

        let layer_leaf = |layer: &str, leaf: &str| {
            geometry
                .child(layer)
                .and_then(|layer| layer.child(leaf))
        };

        if let Some(normals) = layer_leaf("LayerElementNormal", "Normals") {
            mesh.normals =
                self.read_attribute(&name, "LayerElementNormal", Some(normals), vertex_count);
        }

        if let Some(tangents) = layer_leaf("LayerElementTangent", "Tangents") {
            mesh.tangents =
                self.read_attribute(&name, "LayerElementTangent", Some(tangents), vertex_count);
        }

        if let Some(colors) = layer_leaf("LayerElementColor", "Colors") {
            mesh.colors =
                self.read_attribute(&name, "LayerElementColor", Some(colors), vertex_count);
        }

        for layer in geometry.children_named("LayerElementUV") {
            let tex_coords =
                self.read_attribute(&name, "LayerElementUV", layer.child("UV"), vertex_count);
            match layer.property(0).and_then(Property::as_i64).unwrap_or_default() {
                0 => mesh.tex_coords0 = tex_coords,
                1 => mesh.tex_coords1 = tex_coords,
                layer => self
                    .warnings
                    .push(format!("Geometry {name} UV layer {layer} is not supported")),
            }
        }

        let polygon_slots = geometry
            .child("LayerElementMaterial")
            .and_then(|layer| layer.value("Materials"))
            .and_then(Property::as_i32_array)
            .unwrap_or_default();
        let indices = geometry
            .value("PolygonVertexIndex")
            .and_then(Property::as_i32_array)
            .unwrap_or_default();
        mesh.parts = self.read_polygons(&name, indices, polygon_slots, slots);

        for shape in geometry.children_named("Shape") {
            let indices = shape
                .value("Indexes")
                .and_then(Property::as_i32_array)
                .unwrap_or_default()
                .iter()
                .map(|&idx| idx.max(0) as u32)
                .collect::<Vec<_>>();
            let deltas = read_tuples::<3>(shape.child("Vertices")).unwrap_or_default();
            if deltas.len() != indices.len() {
                self.warnings.push(format!(
                    "Blendshape {} of {name} has {} indices for {} vertices",
                    node_name_or_first(shape),
                    indices.len(),
                    deltas.len()
                ));
            }

            let mut blendshape = Blendshape::new(node_name_or_first(shape), indices, deltas);
            if let Some(normals) = read_tuples::<3>(shape.child("Normals"))
                .filter(|normals| normals.len() == blendshape.indices.len())
            {
                blendshape.normals = normals;
            }

            mesh.blendshapes.push(blendshape);
        }

        mesh
    }

    /// Reads a per-vertex attribute; attributes of any other mapping are dropped with a warning.
    fn read_attribute<const N: usize>(
        &mut self,
        name: &str,
        layer: &str,
        node: Option<&SceneNode>,
        vertex_count: usize,
    ) -> Vec<[f32; N]> {
        match read_tuples::<N>(node) {
            Some(vals) if vals.len() == vertex_count => vals,
            _ => {
                self.warnings.push(format!(
                    "Geometry {name} {layer} is not one value per vertex; dropping it"
                ));
                vec![]
            }
        }
    }

    /// Splits polygon index lists into parts by material slot.
    ///
    /// A negative index `!i` closes a polygon. Triangles are kept, quads are kept along with their
    /// two triangles and larger polygons become triangle fans.
    fn read_polygons(
        &mut self,
        name: &str,
        indices: &[i32],
        polygon_slots: &[i32],
        slots: &[usize],
    ) -> Vec<MeshPart> {
        let mut parts = BTreeMap::<usize, MeshPart>::new();
        let mut polygon = vec![];
        let mut polygon_idx = 0;
        let mut degenerate = 0;

        for &idx in indices {
            if idx >= 0 {
                polygon.push(idx as u32);
                continue;
            }

            polygon.push(!idx as u32);

            let slot = match polygon_slots {
                [] => 0,
                [slot] => *slot,
                per_polygon => per_polygon.get(polygon_idx).copied().unwrap_or_default(),
            }
            .max(0) as usize;
            polygon_idx += 1;

            let part = parts.entry(slot).or_insert_with(|| {
                MeshPart::new(slots.get(slot).copied().unwrap_or(slot) as u32)
            });

            match *polygon.as_slice() {
                [a, b, c] => part.triangle_indices.extend([a, b, c]),
                [a, b, c, d] => {
                    part.quad_indices.extend([a, b, c, d]);
                    part.quad_triangle_indices.extend([a, b, c, a, c, d]);
                }
                [a, ref rest @ ..] if rest.len() > 3 => {
                    for pair in rest.windows(2) {
                        part.triangle_indices.extend([a, pair[0], pair[1]]);
                    }
                }
                _ => degenerate += 1,
            }

            polygon.clear();
        }

        if degenerate > 0 {
            self.warnings.push(format!(
                "Geometry {name} has {degenerate} polygons with fewer than three corners"
            ));
        }

        if !polygon.is_empty() {
            self.warnings.push(format!(
                "Geometry {name} ends with an unclosed polygon of {} indices",
                polygon.len()
            ));
        }

        parts.into_values().collect()
    }
}

fn node_name_or_first(node: &SceneNode) -> String {
    node.property(1)
        .or_else(|| node.property(0))
        .and_then(Property::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Swaps the raw attributes of every encoded geometry node for its codec payload. Returns the
/// number of geometry nodes which were replaced.
pub fn splice_geometry(root: &mut SceneNode, output: &GeometryOutput) -> usize {
    let Some(objects) = root.child_mut("Objects") else {
        return 0;
    };

    let mut replaced = 0;
    for (idx, geometry) in objects
        .children
        .iter_mut()
        .filter(|child| child.name == "Geometry")
        .enumerate()
    {
        if let Some(mesh) = output.meshes.get(idx) {
            write_blendshapes(geometry, &mesh.blendshapes);
        }

        let Some(Some(codec_mesh)) = output.codec_meshes.get(idx) else {
            continue;
        };

        geometry.retain_children(|child| !REPLACED_GEOMETRY_NODES.contains(&child.name.as_str()));
        geometry.retain_children(|child| child.name != "CodecMesh");
        geometry
            .children
            .push(SceneNode::new("CodecMesh").with_property(codec_mesh.clone()));
        replaced += 1;
    }

    replaced
}

/// Stores synthesized blendshape normals and tangents on the matching `Shape` nodes.
fn write_blendshapes(geometry: &mut SceneNode, blendshapes: &[Blendshape]) {
    fn replace_leaf(shape: &mut SceneNode, name: &str, vals: &[Vec3]) {
        shape.retain_children(|child| child.name != name);

        if !vals.is_empty() {
            shape
                .children
                .push(SceneNode::new(name).with_property(flatten(vals)));
        }
    }

    for (shape, blendshape) in geometry
        .children
        .iter_mut()
        .filter(|child| child.name == "Shape")
        .zip(blendshapes)
    {
        replace_leaf(shape, "Normals", &blendshape.normals);
        replace_leaf(shape, "Tangents", &blendshape.tangents);
    }
}

/// Points texture nodes at their baked files.
pub fn rewrite_textures(root: &mut SceneNode, filenames: &HashMap<i64, String>) {
    let Some(objects) = root.child_mut("Objects") else {
        return;
    };

    for texture in objects
        .children
        .iter_mut()
        .filter(|child| child.name == "Texture")
    {
        let Some(filename) = node_id(texture).and_then(|id| filenames.get(&id)) else {
            continue;
        };

        texture.retain_children(|child| child.name != "RelativeFilename");
        texture
            .children
            .push(SceneNode::new("RelativeFilename").with_property(filename.as_str()));
    }
}

/// Deletes embedded texture nodes; their content is baked into standalone files.
pub fn remove_embedded_textures(root: &mut SceneNode) -> usize {
    root.child_mut("Objects")
        .map(|objects| objects.retain_children(|child| child.name != "Video"))
        .unwrap_or_default()
}
