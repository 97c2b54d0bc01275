use {
    super::{
        Oven,
        error::BakeError,
        geometry::{CodecConfig, GeometryGraph, GeometryOutput, JointOverrides, MaterialOverride},
        mapping::{Mapping, MaterialMapEntry},
        material::{MaterialBaker, MaterialSource},
        parent, relative_url,
        scene::{
            SceneContents, TextureBinding, remove_embedded_textures, rewrite_textures,
            splice_geometry,
        },
        state::{Baker, BakerState, CancellationToken},
        textures::{TextureQueue, TextureReference},
    },
    crate::{SceneNode, TextureSource},
    anyhow::Context,
    log::{debug, info},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{create_dir_all, write},
        path::{Path, PathBuf},
    },
};

/// Returns `true` when the file name of `path` marks it as output of an earlier bake.
pub fn has_been_baked(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .file_name()
        .is_some_and(|name| name.to_string_lossy().contains(".baked."))
}

/// Removes the first `.baked` marker from a file name: `a.baked.tree` becomes `a.tree`.
pub fn strip_baked(name: &str) -> String {
    name.replacen(".baked.", ".", 1)
}

/// Copies a source file into `original_dir` unless it already lives there.
pub(super) fn preserve_source(
    original_dir: &Path,
    path: &Path,
    buf: &[u8],
) -> Result<(), BakeError> {
    let Some(file_name) = path.file_name() else {
        return Ok(());
    };

    let dst = original_dir.join(file_name);
    let same_file = dunce::canonicalize(&dst)
        .ok()
        .zip(dunce::canonicalize(path).ok())
        .is_some_and(|(dst, src)| dst == src);
    if same_file {
        return Ok(());
    }

    create_dir_all(original_dir)
        .and_then(|_| write(&dst, buf))
        .map_err(|err| BakeError::write(&dst, err))
}

/// Rewrites a scene file: geometry becomes codec meshes, textures become baked files and the
/// material map of an accompanying mapping is baked alongside.
pub struct ModelBaker {
    baked_material_map: BTreeMap<String, MaterialMapEntry>,
    baked_model: Option<PathBuf>,
    joint_indices: BTreeMap<String, usize>,
    mapping: Mapping,
    mapping_dir: Option<PathBuf>,
    original_dir: Option<PathBuf>,
    output_dir: PathBuf,
    oven: Oven,
    source: String,
    state: BakerState,
}

impl ModelBaker {
    pub fn new(
        oven: Oven,
        source: impl Into<String>,
        output_dir: impl AsRef<Path>,
        token: CancellationToken,
    ) -> Self {
        Self {
            baked_material_map: Default::default(),
            baked_model: None,
            joint_indices: Default::default(),
            mapping: Default::default(),
            mapping_dir: None,
            original_dir: None,
            output_dir: output_dir.as_ref().to_path_buf(),
            oven,
            source: source.into(),
            state: BakerState::new(token),
        }
    }

    /// Applies the joint and material directives of a mapping file located in `mapping_dir`.
    pub fn with_mapping(mut self, mapping: Mapping, mapping_dir: impl AsRef<Path>) -> Self {
        self.mapping = mapping;
        self.mapping_dir = Some(mapping_dir.as_ref().to_path_buf());
        self
    }

    /// Keeps a copy of the source scene in `original_dir`.
    pub fn with_original_dir(mut self, original_dir: impl AsRef<Path>) -> Self {
        self.original_dir = Some(original_dir.as_ref().to_path_buf());
        self
    }

    /// The baked material map, with file materials pointing at their baked files.
    pub fn baked_material_map(&self) -> &BTreeMap<String, MaterialMapEntry> {
        &self.baked_material_map
    }

    /// The written scene file.
    pub fn baked_model_path(&self) -> Option<&Path> {
        self.baked_model.as_deref()
    }

    /// Canonical joint name to joint index, after mapping overrides.
    pub fn joint_indices(&self) -> &BTreeMap<String, usize> {
        &self.joint_indices
    }

    /// Candidate locations of the source, in the order they are tried.
    fn source_candidates(&self) -> Vec<String> {
        let mut res = vec![self.source.clone()];

        if has_been_baked(&self.source) {
            let path = Path::new(&self.source);
            let dir = parent(path);
            let name = path
                .file_name()
                .map(|name| strip_baked(&name.to_string_lossy()))
                .unwrap_or_default();

            let original = dir.join("..").join("original").join(&name);

            res.push(original.to_string_lossy().into_owned());
            res.push(dir.join(&name).to_string_lossy().into_owned());
        }

        res
    }

    fn read_source(&self) -> Result<(PathBuf, Vec<u8>), BakeError> {
        let candidates = self.source_candidates();
        let mut last_err = None;

        for (idx, url) in candidates.iter().enumerate() {
            if idx > 0 {
                info!("Model {} not found, trying {url}", self.source);
            }

            match self.oven.services().fetcher.fetch(url) {
                Ok(buf) => return Ok((PathBuf::from(url), buf)),
                Err(err) => last_err = Some(err),
            }
        }

        match last_err {
            Some(err) if candidates.len() == 1 => {
                Err(BakeError::source_unreadable(&self.source, format!("{err:#}")))
            }
            _ => Err(BakeError::Unresolvable {
                path: PathBuf::from(&self.source),
            }),
        }
    }

    /// Queues every texture binding; returns the references made for each texture node.
    fn submit_textures(
        queue: &mut TextureQueue,
        textures: &[TextureBinding],
    ) -> Vec<(i64, Vec<TextureReference>)> {
        textures
            .iter()
            .map(|texture| {
                let refs = texture
                    .uses
                    .iter()
                    .filter_map(|(_, channel)| channel.usage())
                    .map(|usage| match &texture.source {
                        TextureSource::Url(url) => queue.submit(url, usage, None),
                        TextureSource::Embedded { name, content } => {
                            queue.submit(name, usage, Some(content.clone()))
                        }
                    })
                    .collect();

                (texture.id, refs)
            })
            .collect()
    }

    /// Baked filename of each texture node, from the first of its references which baked.
    fn texture_filenames(
        &self,
        queue: &TextureQueue,
        refs: &[(i64, Vec<TextureReference>)],
    ) -> HashMap<i64, String> {
        refs.iter()
            .filter_map(|(id, refs)| {
                let path = refs.iter().find_map(|reference| match reference {
                    TextureReference::Pending(key) => queue.rewritten(key),
                    _ => None,
                })?;

                Some((*id, relative_url(path, &self.output_dir)))
            })
            .collect()
    }

    fn run_geometry(&self, contents: &SceneContents, model_dir: &Path) -> Option<GeometryOutput> {
        let config = self.oven.config();
        let mut graph = GeometryGraph::build(self.state.token().clone());
        graph.configure(
            GeometryGraph::BUILD_CODEC_MESHES,
            &CodecConfig {
                enabled: config.mesh.encode,
                quantization: config.mesh.quantization(),
            },
        );
        graph.feed_meshes(contents.meshes.clone(), contents.materials.clone());
        graph.feed_joints(
            contents.joints.clone(),
            JointOverrides {
                renames: self.mapping.joint_rename.clone(),
                indices: self.mapping.joint_index.clone(),
                rotation_offsets: self.mapping.joint_rotation_offset.clone(),
            },
        );
        graph.feed_material_map(
            self.mapping.material_map.clone(),
            self.mapping_dir.as_deref().unwrap_or(model_dir),
        );

        graph.run()
    }

    /// Bakes each material map entry through a child material baker.
    fn bake_material_map(&mut self, overrides: Vec<(String, MaterialOverride)>, model_dir: &Path) {
        let base_dir = self
            .mapping_dir
            .clone()
            .unwrap_or_else(|| model_dir.to_path_buf());

        for (name, entry) in overrides {
            if self.state.token().is_cancelled() {
                return;
            }

            let source = match &entry {
                MaterialOverride::Url(url) => MaterialSource::Url(url.clone()),
                MaterialOverride::Inline(material) => MaterialSource::Inline {
                    base_dir: base_dir.clone(),
                    material: material.clone(),
                },
            };

            let mut child = MaterialBaker::new(
                source,
                &self.output_dir,
                self.oven.next_material_num(),
                self.oven.services().clone(),
                self.state.token().child(),
            );
            child.bake();

            self.state.result_mut().absorb_as_warnings(child.result());

            let baked = match (child.baked_path(), child.baked_material()) {
                (Some(path), _) => {
                    Some(MaterialMapEntry::Url(relative_url(path, &self.output_dir)))
                }
                (None, Some(material)) => Some(MaterialMapEntry::Inline(material.clone())),
                _ => None,
            };

            if baked.is_none() {
                debug!("Keeping unbaked material map entry {name}");
            }

            let entry = baked.or_else(|| self.mapping.material_map.get(&name).cloned());
            if let Some(entry) = entry {
                self.baked_material_map.insert(name, entry);
            }
        }
    }

    fn write_model(&mut self, source: &Path, root: &SceneNode) -> Result<(), BakeError> {
        let format = self.oven.format();
        let stem = source
            .file_name()
            .map(|name| strip_baked(&name.to_string_lossy()))
            .and_then(|name| {
                Path::new(&name)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "model".to_owned());
        let path = self
            .output_dir
            .join(format!("{stem}.baked.{}", format.extension()));
        let buf = format
            .serialize(root)
            .with_context(|| format!("Serializing {}", path.display()))?;

        create_dir_all(&self.output_dir)
            .and_then(|_| write(&path, buf))
            .map_err(|err| BakeError::write(&path, err))?;

        self.state.result_mut().add_output_file(&path);
        self.baked_model = Some(path);

        Ok(())
    }

    fn try_bake(&mut self) -> Result<(), BakeError> {
        let (source, buf) = self.read_source()?;

        if let Some(original_dir) = &self.original_dir {
            preserve_source(original_dir, &source, &buf)?;
        }

        let mut root = self
            .oven
            .format()
            .parse(&buf)
            .map_err(|err| BakeError::source_unreadable(&source, format!("{err:#}")))?;
        let model_dir = parent(&source);
        let contents = SceneContents::harvest(&root, &model_dir)?;

        for warning in &contents.warnings {
            self.state.result_mut().warn(warning);
        }

        // Textures bake on the workers while geometry is processed here
        let mut queue = TextureQueue::new(
            self.oven.services().clone(),
            &self.output_dir,
            self.state.token().clone(),
        );
        let texture_refs = Self::submit_textures(&mut queue, &contents.textures);
        let output = self.run_geometry(&contents, &model_dir);

        queue.wait();
        self.state.result_mut().absorb(queue.result());

        let Some(output) = output else {
            return Ok(());
        };

        if self.state.token().is_cancelled() {
            return Ok(());
        }

        for warning in &output.warnings {
            self.state.result_mut().warn(warning);
        }

        let encoded = splice_geometry(&mut root, &output);
        debug!("Encoded {encoded} of {} meshes", output.meshes.len());

        let encodable = output.meshes.iter().any(|mesh| mesh.vertex_count() > 0);
        if self.oven.config().mesh.encode && encodable && encoded == 0 {
            return Err(BakeError::NoEncodableMesh { path: source });
        }

        self.joint_indices = output.joints.joint_indices;

        let filenames = self.texture_filenames(&queue, &texture_refs);
        rewrite_textures(&mut root, &filenames);
        remove_embedded_textures(&mut root);

        self.bake_material_map(output.material_mapping, &model_dir);
        if self.state.token().is_cancelled() {
            return Ok(());
        }

        self.write_model(&source, &root)
    }
}

impl Baker for ModelBaker {
    fn state(&self) -> &BakerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BakerState {
        &mut self.state
    }

    fn bake(&mut self) {
        if !self.state.start() || self.state.check_aborted() {
            return;
        }

        info!("Baking model: {}", self.source);

        match self.try_bake() {
            Ok(()) => self.state.settle(),
            Err(err) => self.state.fail(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            Attribute, CodecMesh, NodeTreeFormat, SceneFormat,
            buf::{
                BakeStatus, OvenConfig,
                scene::tests::{cube_geometry, material, scene, texture, triangle_geometry},
            },
        },
        image::{ImageFormat, RgbImage},
        serde_json::json,
        std::io::Cursor,
        tempfile::tempdir,
    };

    fn write_scene(path: &Path, root: &SceneNode) {
        write(path, NodeTreeFormat::default().serialize(root).unwrap()).unwrap();
    }

    fn read_scene(path: &Path) -> SceneNode {
        NodeTreeFormat::default()
            .parse(&std::fs::read(path).unwrap())
            .unwrap()
    }

    fn write_png(path: &Path) {
        RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    fn oven() -> Oven {
        Oven::new(OvenConfig::default()).unwrap()
    }

    fn model_baker(src: &Path, out: &Path) -> ModelBaker {
        ModelBaker::new(oven(), src.to_string_lossy(), out, CancellationToken::new())
    }

    #[test]
    fn baked_names() {
        assert!(has_been_baked("a/b.baked.tree"));
        assert!(!has_been_baked("a.baked/b.tree"));
        assert_eq!(strip_baked("b.baked.tree"), "b.tree");
        assert_eq!(strip_baked("b.tree"), "b.tree");
    }

    #[test]
    fn cube_without_normals_gets_one_normal_per_vertex() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("cube.tree");
        write_scene(
            &src,
            &scene(
                vec![cube_geometry(1), material(10, "plain")],
                vec![("OO", 10, 1, None)],
            ),
        );

        let out = dir.path().join("baked");
        let mut baker = model_baker(&src, &out);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());

        let path = baker.baked_model_path().unwrap().to_path_buf();
        assert_eq!(path, out.join("cube.baked.tree"));

        let root = read_scene(&path);
        let geometry = root.child("Objects").unwrap().child("Geometry").unwrap();

        assert!(geometry.child("Vertices").is_none());
        assert!(geometry.child("Edges").is_none());

        let codec_mesh = geometry.value("CodecMesh").unwrap().as_bytes().unwrap();
        let codec_mesh = CodecMesh::from_bytes(codec_mesh).unwrap();

        assert!(codec_mesh.has_attribute(Attribute::Normal));
        assert!(!codec_mesh.has_attribute(Attribute::Tangent));
        assert_eq!(codec_mesh.triangle_count(), 12);

        let decoded = codec_mesh.decode().unwrap();

        assert_eq!(decoded.normals.len(), decoded.positions.len());
    }

    #[test]
    fn shared_texture_with_two_usages_bakes_twice() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("shared.png"));

        let src = dir.path().join("shared.tree");
        write_scene(
            &src,
            &scene(
                vec![
                    triangle_geometry(1),
                    material(10, "a"),
                    material(11, "b"),
                    texture(20, "shared.png"),
                ],
                vec![
                    ("OO", 10, 1, None),
                    ("OO", 11, 1, None),
                    ("OP", 20, 10, Some("DiffuseColor")),
                    ("OP", 20, 11, Some("NormalMap")),
                ],
            ),
        );

        let out = dir.path().join("baked");
        let mut baker = model_baker(&src, &out);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());

        let textures = baker
            .output_files()
            .iter()
            .filter(|path| path.to_string_lossy().ends_with(".baked.tex"))
            .count();

        assert_eq!(textures, 2);

        let root = read_scene(baker.baked_model_path().unwrap());
        let filename = root
            .child("Objects")
            .unwrap()
            .child("Texture")
            .unwrap()
            .value("RelativeFilename")
            .and_then(crate::Property::as_str)
            .unwrap()
            .to_owned();

        assert!(filename.ends_with(".baked.tex"));
        assert!(out.join(filename).exists());
    }

    #[test]
    fn embedded_textures_are_baked_and_removed() {
        let mut png = vec![];
        RgbImage::from_pixel(4, 4, image::Rgb([200, 100, 50]))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let dir = tempdir().unwrap();
        let src = dir.path().join("embedded.tree");
        write_scene(
            &src,
            &scene(
                vec![
                    triangle_geometry(1),
                    material(10, "skin"),
                    texture(20, "skin.png"),
                    SceneNode::new("Video")
                        .with_property(30)
                        .with_property("skin.png")
                        .with_child(SceneNode::new("RelativeFilename").with_property("skin.png"))
                        .with_child(SceneNode::new("Content").with_property(png)),
                ],
                vec![("OO", 10, 1, None), ("OP", 20, 10, Some("DiffuseColor"))],
            ),
        );

        let out = dir.path().join("baked");
        let mut baker = model_baker(&src, &out);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());
        assert!(!dir.path().join("skin.png").exists());

        let root = read_scene(baker.baked_model_path().unwrap());
        let objects = root.child("Objects").unwrap();

        assert!(objects.child("Video").is_none());

        let filename = objects
            .child("Texture")
            .unwrap()
            .value("RelativeFilename")
            .and_then(crate::Property::as_str)
            .unwrap();

        assert!(filename.ends_with(".baked.tex"));
        assert!(out.join(filename).exists());
    }

    #[test]
    fn geometry_without_triangles_fails_to_encode() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("points.tree");
        write_scene(
            &src,
            &scene(
                vec![
                    SceneNode::new("Geometry")
                        .with_property(1)
                        .with_property("points")
                        .with_child(
                            SceneNode::new("Vertices")
                                .with_property(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0f32]),
                        ),
                ],
                vec![],
            ),
        );

        let out = dir.path().join("baked");
        let mut baker = model_baker(&src, &out);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Failed);
        assert!(baker.errors()[0].contains("could be encoded"), "{:?}", baker.errors());
        assert!(baker.baked_model_path().is_none());
        assert!(!out.join("points.baked.tree").exists());
    }

    #[test]
    fn missing_source_fails() {
        let dir = tempdir().unwrap();
        let mut baker = ModelBaker::new(
            oven(),
            dir.path().join("nope.tree").to_string_lossy(),
            dir.path(),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Failed);
        assert!(baker.output_files().is_empty());
    }

    #[test]
    fn rebake_finds_the_original() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("original");
        create_dir_all(&original).unwrap();
        write_scene(
            &original.join("cube.tree"),
            &scene(vec![cube_geometry(1)], vec![]),
        );

        let baked = dir.path().join("baked");
        let mut baker = ModelBaker::new(
            oven(),
            baked.join("cube.baked.tree").to_string_lossy(),
            &baked,
            CancellationToken::new(),
        )
        .with_original_dir(&original);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());
        assert_eq!(baker.baked_model_path(), Some(baked.join("cube.baked.tree").as_path()));
    }

    #[test]
    fn material_map_bakes_inline_materials() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("skin.png"));

        let src = dir.path().join("cube.tree");
        write_scene(&src, &scene(vec![cube_geometry(1)], vec![]));

        let mut mapping = Mapping::default();
        mapping.material_map.insert(
            "skin".into(),
            MaterialMapEntry::Inline(json!({ "name": "skin", "albedoMap": "skin.png" })),
        );

        let out = dir.path().join("baked");
        let mut baker = model_baker(&src, &out).with_mapping(mapping, dir.path());
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());

        let Some(MaterialMapEntry::Inline(material)) = baker.baked_material_map().get("skin") else {
            panic!("expected an inline material");
        };
        let albedo = material["albedoMap"].as_str().unwrap();

        assert!(albedo.starts_with("materialTextures/"));
        assert!(out.join(albedo).exists());
    }

    #[test]
    fn aborted_before_start_writes_nothing() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("cube.tree");
        write_scene(&src, &scene(vec![cube_geometry(1)], vec![]));

        let token = CancellationToken::new();
        token.cancel();

        let mut baker =
            ModelBaker::new(oven(), src.to_string_lossy(), dir.path().join("baked"), token);
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Aborted);
        assert!(baker.output_files().is_empty());
    }
}
