//! Contains the types used to bake scene, mapping, material and image files
//!
//! A bake is driven by an [`Oven`] session: it owns the configuration, the scene format and the
//! texture workers, and hands out the [`Baker`] for each source file.

mod content;
mod engine;
mod error;
mod fst;
mod geometry;
mod mapping;
mod material;
mod model;
mod scene;
mod state;
mod texture;
mod textures;

pub use self::{
    content::{Content, Group},
    engine::{BakeContext, Binding, Engine, Job, PassthroughConfig, Store, Var},
    error::BakeError,
    fst::FstBaker,
    geometry::{
        CodecConfig, GeometryGraph, GeometryOutput, JointOverrides, MaterialOverride,
        PreparedJoints,
    },
    mapping::{Mapping, MaterialMapEntry, Rotation},
    material::{MaterialBaker, MaterialSource},
    model::{ModelBaker, has_been_baked},
    scene::{SceneContents, TextureBinding},
    state::{BakeResult, BakeStatus, Baker, BakerState, CancellationToken},
    texture::{
        BAKED_TEXTURE_EXTENSION, FileFetcher, ImageCodec, ImageCompressor, ResourceFetcher,
        RuntimeWorkers, TextureBakeKey, TextureBaker, TextureFileNamer, WorkerPool,
        decode_data_uri,
    },
    textures::{TextureQueue, TextureReference, TextureServices},
};

use {
    crate::{Compression, NodeTreeFormat, Quantization, SceneFormat, UsageType},
    anyhow::{Context, bail},
    glob::glob,
    log::{info, warn},
    ordered_float::OrderedFloat,
    serde::{Deserialize, Serialize},
    std::{
        fs::read_to_string,
        num::NonZeroUsize,
        path::{Component, Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread::available_parallelism,
    },
    tokio::runtime::Runtime,
};

/// Returns either the parent directory of the given path or the project root if the path has no
/// parent.
fn parent(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref()
        .parent()
        .map(|path| path.to_owned())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolves a reference found inside a source file against the directory of that file.
///
/// URLs with a scheme, `data:` URIs and absolute paths are returned unchanged.
fn resolve_url(base_dir: &Path, url: &str) -> String {
    if url.starts_with("data:") || url.contains("://") || Path::new(url).is_absolute() {
        return url.to_owned();
    }

    let res = base_dir.join(url);

    dunce::canonicalize(&res)
        .unwrap_or(res)
        .to_string_lossy()
        .into_owned()
}

/// The `/` separated path of `path` below `dir`, or `path` itself when it is not inside `dir`.
fn relative_url(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let Ok(rel) = path.strip_prefix(dir) else {
        return path.to_string_lossy().into_owned();
    };

    rel.components()
        .filter_map(|part| match part {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Mesh encoding settings.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Replace raw geometry with codec meshes.
    pub encode: bool,
    pub position_bits: u8,
    pub tex_coord_bits: u8,
    pub normal_bits: u8,
    pub color_bits: u8,
}

impl MeshConfig {
    pub fn quantization(&self) -> Quantization {
        Quantization {
            position_bits: self.position_bits,
            tex_coord_bits: self.tex_coord_bits,
            normal_bits: self.normal_bits,
            color_bits: self.color_bits,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        let quantization = Quantization::default();

        Self {
            encode: true,
            position_bits: quantization.position_bits,
            tex_coord_bits: quantization.tex_coord_bits,
            normal_bits: quantization.normal_bits,
            color_bits: quantization.color_bits,
        }
    }
}

/// Settings of baked scene files.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct SceneConfig {
    pub compression: Option<Compression>,
}

/// Settings of baked texture files.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct TextureConfig {
    /// Height scale used when bump maps are converted to normal maps.
    pub bump_strength: OrderedFloat<f32>,
    pub compression: Option<Compression>,

    /// Longest edge of a baked texture; larger images are scaled down.
    pub max_size: Option<u32>,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            bump_strength: OrderedFloat(ImageCompressor::default().bump_strength),
            compression: None,
            max_size: None,
        }
    }
}

/// Session settings, read from a `.toml` file.
///
/// ```toml
/// [mesh]
/// encode = true
/// position_bits = 14
///
/// [texture]
/// compression = "brotli"
/// max_size = 2048
///
/// [scene]
/// compression = "snap"
/// ```
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct OvenConfig {
    pub mesh: MeshConfig,
    pub scene: SceneConfig,
    pub texture: TextureConfig,
}

impl OvenConfig {
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let str = read_to_string(&path).context("Reading oven config as a string")?;

        Self::parse(&str)
    }

    pub fn parse(str: &str) -> anyhow::Result<Self> {
        toml::from_str(str).context("Parsing oven config toml")
    }
}

/// A bake session.
///
/// Clones share the configuration, the texture workers, the texture file namer and the material
/// counter.
#[derive(Clone)]
pub struct Oven {
    config: Arc<OvenConfig>,
    format: Arc<dyn SceneFormat>,
    material_count: Arc<AtomicUsize>,
    services: TextureServices,
}

impl Oven {
    pub fn new(config: OvenConfig) -> anyhow::Result<Self> {
        let worker_count = available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let workers = RuntimeWorkers::new(worker_count).context("Creating texture workers")?;
        let codec = ImageCompressor {
            bump_strength: config.texture.bump_strength.0,
            compression: config.texture.compression,
            max_size: config.texture.max_size,
        };
        let format = NodeTreeFormat::default().with_compression(config.scene.compression);

        Ok(Self {
            config: Arc::new(config),
            format: Arc::new(format),
            material_count: Default::default(),
            services: TextureServices {
                codec: Arc::new(codec),
                fetcher: Arc::new(FileFetcher),
                namer: Default::default(),
                workers: Arc::new(workers),
            },
        })
    }

    pub fn with_codec(mut self, codec: impl ImageCodec + 'static) -> Self {
        self.services.codec = Arc::new(codec);
        self
    }

    pub fn with_fetcher(mut self, fetcher: impl ResourceFetcher + 'static) -> Self {
        self.services.fetcher = Arc::new(fetcher);
        self
    }

    pub fn with_format(mut self, format: impl SceneFormat + 'static) -> Self {
        self.format = Arc::new(format);
        self
    }

    pub fn with_workers(mut self, workers: impl WorkerPool + 'static) -> Self {
        self.services.workers = Arc::new(workers);
        self
    }

    pub fn config(&self) -> &OvenConfig {
        &self.config
    }

    pub fn format(&self) -> &dyn SceneFormat {
        self.format.as_ref()
    }

    /// Hands out the number which keeps the texture directory of a material unique.
    pub fn next_material_num(&self) -> usize {
        self.material_count.fetch_add(1, Ordering::Relaxed)
    }

    pub fn services(&self) -> &TextureServices {
        &self.services
    }

    /// Picks the baker for `url` by its extension.
    ///
    /// Output lands in `<output_root>/baked`; model and mapping sources are also copied to
    /// `<output_root>/original`, where a later re-bake finds them.
    pub fn baker_for(
        &self,
        url: &str,
        output_root: impl AsRef<Path>,
    ) -> anyhow::Result<Box<dyn Baker>> {
        let output_dir = output_root.as_ref().join("baked");
        let original_dir = output_root.as_ref().join("original");
        let ext = Path::new(url)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let token = CancellationToken::new();

        Ok(match ext.as_str() {
            Mapping::EXTENSION => Box::new(
                FstBaker::new(self.clone(), url, output_dir, token)
                    .with_original_dir(original_dir),
            ),
            MaterialBaker::EXTENSION => Box::new(MaterialBaker::new(
                MaterialSource::Url(url.to_owned()),
                output_dir,
                self.next_material_num(),
                self.services.clone(),
                token,
            )),
            ext if ext == self.format.extension() => Box::new(
                ModelBaker::new(self.clone(), url, output_dir, token)
                    .with_original_dir(original_dir),
            ),
            ext if self.services.codec.supports_extension(ext) => {
                let usage = UsageType::Albedo;

                Box::new(TextureBaker::new(
                    TextureBakeKey::new(url, usage),
                    output_dir,
                    self.services.namer.name(url, usage),
                    Arc::clone(&self.services.codec),
                    Arc::clone(&self.services.fetcher),
                    token,
                ))
            }
            _ => bail!("No baker handles {url}"),
        })
    }

    /// Bakes every asset matched by the enabled groups of a content file, concurrently.
    ///
    /// Assets no baker handles are skipped with a warning.
    pub fn bake_content(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> anyhow::Result<Vec<(PathBuf, BakeResult)>> {
        let rt = Runtime::new().context("Creating bake runtime")?;
        let mut tasks = vec![];

        let src_dir = parent(&src);
        let content = Content::read(&src).context("Unable to read content file")?;

        // Process each file we find as a separate runtime task
        for asset_glob in content
            .groups()
            .iter()
            .filter(|group| group.enabled())
            .flat_map(|group| group.asset_globs())
        {
            let asset_paths = glob(src_dir.join(asset_glob).to_string_lossy().as_ref())
                .context("Unable to glob source directory")?;
            for asset_path in asset_paths {
                let asset_path = asset_path.context("Unable to get asset path")?;

                info!("Processing {}", asset_path.display());

                let mut baker = match self.baker_for(&asset_path.to_string_lossy(), &dst) {
                    Ok(baker) => baker,
                    Err(err) => {
                        warn!("Skipping {}: {err}", asset_path.display());
                        continue;
                    }
                };

                tasks.push(rt.spawn_blocking(move || {
                    baker.bake();

                    (asset_path, baker.result().clone())
                }));
            }
        }

        rt.block_on(async move {
            let mut res = Vec::with_capacity(tasks.len());
            for task in tasks {
                res.push(task.await.context("Bake task panicked")?);
            }

            Ok::<_, anyhow::Error>(res)
        })
    }
}
