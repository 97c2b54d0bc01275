use {
    super::{
        error::BakeError,
        parent, relative_url, resolve_url,
        state::{Baker, BakerState, CancellationToken},
        textures::{TextureQueue, TextureReference, TextureServices},
    },
    crate::MapChannel,
    anyhow::{Context, bail},
    log::{debug, info},
    serde_json::{Map, Value},
    std::{
        fs::{create_dir_all, write},
        path::{Path, PathBuf},
    },
};

/// Where a material description comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum MaterialSource {
    /// A `.json` file; the baked material is written next to the other output.
    Url(String),

    /// Material JSON supplied by the caller, resolved against `base_dir`. The baked material is
    /// returned instead of written.
    Inline { base_dir: PathBuf, material: Value },
}

/// A channel reference which may be rewritten once the texture queue drains.
struct ChannelRef {
    key: String,
    material: usize,
    reference: TextureReference,
}

/// Bakes a material file (or inline material) and every texture its channels reference.
///
/// ```json
/// { "materials": [{ "name": "skin", "albedoMap": "skin.png", "normalMap": "skin_n.png" }] }
/// ```
///
/// A document holding one material is written back as an object; several are written as an array.
pub struct MaterialBaker {
    baked_material: Option<Value>,
    baked_path: Option<PathBuf>,
    output_dir: PathBuf,
    services: TextureServices,
    source: MaterialSource,
    state: BakerState,
    texture_dir: PathBuf,
}

impl MaterialBaker {
    pub const BAKED_EXTENSION: &'static str = "baked.json";
    pub const EXTENSION: &'static str = "json";

    /// `material_num` keeps the texture directories of materials in one session apart.
    pub fn new(
        source: MaterialSource,
        output_dir: impl AsRef<Path>,
        material_num: usize,
        services: TextureServices,
        token: CancellationToken,
    ) -> Self {
        let output_dir = output_dir.as_ref().to_path_buf();
        let texture_dir = output_dir
            .join("materialTextures")
            .join(material_num.to_string());

        Self {
            baked_material: None,
            baked_path: None,
            output_dir,
            services,
            source,
            state: BakerState::new(token),
            texture_dir,
        }
    }

    /// The rewritten material document, once baked.
    pub fn baked_material(&self) -> Option<&Value> {
        self.baked_material.as_ref()
    }

    /// The written material file, for file sources.
    pub fn baked_path(&self) -> Option<&Path> {
        self.baked_path.as_deref()
    }

    /// Splits a material document into its materials.
    fn parse_materials(doc: Value) -> anyhow::Result<Vec<Map<String, Value>>> {
        let doc = match doc {
            Value::Object(mut obj) if obj.contains_key("materials") => obj
                .remove("materials")
                .unwrap_or_default(),
            doc => doc,
        };

        let materials = match doc {
            Value::Object(material) => vec![material],
            Value::Array(materials) => materials
                .into_iter()
                .map(|material| match material {
                    Value::Object(material) => Ok(material),
                    _ => bail!("Material entries must be objects"),
                })
                .collect::<anyhow::Result<_>>()?,
            _ => bail!("Expected a material object or array"),
        };

        if materials.is_empty() {
            bail!("Document holds no materials");
        }

        Ok(materials)
    }

    fn material_name(material: &Map<String, Value>, idx: usize) -> String {
        material
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("#{idx}"))
    }

    fn load(&self) -> Result<(PathBuf, Vec<Map<String, Value>>), BakeError> {
        let (base_dir, doc) = match &self.source {
            MaterialSource::Url(url) => {
                let buf = self
                    .services
                    .fetcher
                    .fetch(url)
                    .map_err(|err| BakeError::source_unreadable(url, format!("{err:#}")))?;
                let doc = serde_json::from_slice(&buf)
                    .with_context(|| format!("Parsing material {url}"))?;

                (parent(url), doc)
            }
            MaterialSource::Inline { base_dir, material } => (base_dir.clone(), material.clone()),
        };

        Ok((base_dir, Self::parse_materials(doc)?))
    }

    /// Queues a texture job for every channel of every material.
    ///
    /// References the codec cannot read are skipped before their channel is looked at.
    fn submit_textures(
        &self,
        queue: &mut TextureQueue,
        base_dir: &Path,
        materials: &[Map<String, Value>],
    ) -> Result<Vec<ChannelRef>, BakeError> {
        let mut refs = vec![];

        for (idx, material) in materials.iter().enumerate() {
            for (key, val) in material {
                if !key.ends_with("Map") {
                    continue;
                }

                let Some(url) = val.as_str().filter(|url| !url.is_empty()) else {
                    continue;
                };

                let url = resolve_url(base_dir, url);
                if !queue.accepts(&url) {
                    continue;
                }

                let unknown_channel = || BakeError::UnknownMapChannel {
                    material: Self::material_name(material, idx),
                    channel: key.clone(),
                };
                let usage = MapChannel::parse(key)
                    .and_then(MapChannel::usage)
                    .ok_or_else(unknown_channel)?;

                let reference = queue.submit(&url, usage, None);
                refs.push(ChannelRef {
                    key: key.clone(),
                    material: idx,
                    reference,
                });
            }
        }

        Ok(refs)
    }

    fn rewrite(
        &self,
        queue: &TextureQueue,
        refs: Vec<ChannelRef>,
        materials: &mut [Map<String, Value>],
    ) {
        for channel in refs {
            let TextureReference::Pending(key) = &channel.reference else {
                continue;
            };

            if let Some(path) = queue.rewritten(key) {
                let url = relative_url(path, &self.output_dir);
                debug!("Rewriting {} to {url}", channel.key);

                materials[channel.material].insert(channel.key, Value::String(url));
            }
        }
    }

    fn output(&mut self, mut materials: Vec<Map<String, Value>>) -> Result<(), BakeError> {
        let doc = if materials.len() == 1 {
            Value::Object(materials.remove(0))
        } else {
            Value::Array(materials.into_iter().map(Value::Object).collect())
        };

        if let MaterialSource::Url(url) = &self.source {
            let stem = Path::new(url)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "material".to_owned());
            let path = self
                .output_dir
                .join(format!("{stem}.{}", Self::BAKED_EXTENSION));
            let buf = serde_json::to_vec(&doc).context("Serializing material")?;

            create_dir_all(&self.output_dir)
                .and_then(|_| write(&path, buf))
                .map_err(|err| BakeError::write(&path, err))?;

            self.state.result_mut().add_output_file(&path);
            self.baked_path = Some(path);
        }

        self.baked_material = Some(doc);

        Ok(())
    }

    fn try_bake(&mut self) -> Result<(), BakeError> {
        let (base_dir, mut materials) = self.load()?;

        let mut queue = TextureQueue::new(
            self.services.clone(),
            &self.texture_dir,
            self.state.token().clone(),
        );
        let refs = self.submit_textures(&mut queue, &base_dir, &materials);

        // Every job that was started must finish before this baker does
        queue.wait();
        self.state.result_mut().absorb(queue.result());

        let refs = refs?;
        if self.state.token().is_cancelled() {
            return Ok(());
        }

        self.rewrite(&queue, refs, &mut materials);
        self.output(materials)
    }
}

impl Baker for MaterialBaker {
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

        match &self.source {
            MaterialSource::Url(url) => info!("Baking material: {url}"),
            MaterialSource::Inline { .. } => info!("Baking material: (inline)"),
        }

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
        crate::buf::{
            BakeStatus,
            texture::{FileFetcher, ImageCompressor},
        },
        image::{ImageFormat, RgbImage},
        serde_json::json,
        std::sync::Arc,
        tempfile::tempdir,
        tokio::runtime::Runtime,
    };

    fn services(runtime: &Runtime) -> TextureServices {
        let handle = runtime.handle().clone();

        TextureServices {
            codec: Arc::new(ImageCompressor::default()),
            fetcher: Arc::new(FileFetcher),
            namer: Default::default(),
            workers: Arc::new(move || handle.clone()),
        }
    }

    fn write_png(path: &Path) {
        RgbImage::from_pixel(2, 2, image::Rgb([200, 100, 50]))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    #[test]
    fn documents_keep_their_shape() {
        assert_eq!(
            MaterialBaker::parse_materials(json!({ "name": "a" })).unwrap().len(),
            1
        );
        let materials = json!({ "materials": [{ "name": "a" }, { "name": "b" }] });

        assert_eq!(MaterialBaker::parse_materials(materials).unwrap().len(), 2);
        assert!(MaterialBaker::parse_materials(json!([])).is_err());
        assert!(MaterialBaker::parse_materials(json!(3)).is_err());
    }

    #[test]
    fn single_material_file_bakes_to_an_object() {
        let runtime = Runtime::new().unwrap();
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_png(&src.path().join("skin.png"));

        let material = src.path().join("skin.json");
        write(
            &material,
            json!({ "materials": { "name": "skin", "albedoMap": "skin.png" } }).to_string(),
        )
        .unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Url(material.to_string_lossy().into_owned()),
            out.path(),
            0,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished);

        let baked = baker.baked_material().unwrap();

        assert!(baked.is_object());
        assert_eq!(baked["albedoMap"], "materialTextures/0/skin_2.baked.tex");
        assert_eq!(baker.baked_path(), Some(out.path().join("skin.baked.json").as_path()));
        assert_eq!(baker.output_files().len(), 2);
    }

    #[test]
    fn multiple_materials_bake_to_an_array() {
        let runtime = Runtime::new().unwrap();
        let out = tempdir().unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Inline {
                base_dir: out.path().to_path_buf(),
                material: json!([{ "name": "a" }, { "name": "b", "roughness": 0.5 }]),
            },
            out.path(),
            3,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished);
        assert_eq!(baker.baked_material().unwrap().as_array().unwrap().len(), 2);
        assert!(baker.output_files().is_empty());
    }

    #[test]
    fn unknown_channels_fail_the_bake() {
        let runtime = Runtime::new().unwrap();
        let out = tempdir().unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Inline {
                base_dir: out.path().to_path_buf(),
                material: json!({ "name": "glass", "opacityMap": "glass.png" }),
            },
            out.path(),
            0,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Failed);
        assert!(baker.errors()[0].contains("opacityMap"));
        assert!(baker.baked_material().is_none());
    }

    #[test]
    fn unsupported_textures_keep_their_reference() {
        let runtime = Runtime::new().unwrap();
        let out = tempdir().unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Inline {
                base_dir: out.path().to_path_buf(),
                material: json!({ "name": "paint", "albedoMap": "layers.psd" }),
            },
            out.path(),
            0,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished);
        assert_eq!(baker.warnings().len(), 1);
        assert_eq!(baker.baked_material().unwrap()["albedoMap"], "layers.psd");
    }

    #[test]
    fn unsupported_textures_are_skipped_before_their_channel() {
        let runtime = Runtime::new().unwrap();
        let out = tempdir().unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Inline {
                base_dir: out.path().to_path_buf(),
                material: json!({
                    "name": "glass",
                    "opacityMap": "glass.psd",
                    "sheenMap": "sheen.psd",
                }),
            },
            out.path(),
            0,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Finished, "{:?}", baker.errors());
        assert_eq!(baker.warnings().len(), 2);

        let baked = baker.baked_material().unwrap();

        assert_eq!(baked["opacityMap"], "glass.psd");
        assert_eq!(baked["sheenMap"], "sheen.psd");
    }

    #[test]
    fn missing_material_file_fails() {
        let runtime = Runtime::new().unwrap();
        let out = tempdir().unwrap();

        let mut baker = MaterialBaker::new(
            MaterialSource::Url("does/not/exist.json".into()),
            out.path(),
            0,
            services(&runtime),
            CancellationToken::new(),
        );
        baker.bake();

        assert_eq!(baker.status(), BakeStatus::Failed);
        assert!(baker.output_files().is_empty());
    }
}
