//! Baking of a single texture, plus the collaborators it is built from: naming, fetching, image
//! compression and the workers jobs run on.

use {
    super::{
        error::BakeError,
        state::{Baker, BakerState, CancellationToken},
    },
    crate::{Compression, Texture, TextureColor, TextureFormat, UsageType},
    anyhow::{Context, anyhow, bail},
    base64::{Engine as _, engine::general_purpose},
    glam::Vec3 as GlamVec3,
    image::{DynamicImage, GrayImage, ImageFormat, imageops::FilterType, load_from_memory},
    log::info,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fs::{create_dir_all, read, write},
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    },
    tokio::runtime::{Builder, Handle, Runtime},
};

/// Suffix of every file written by a [`TextureBaker`].
pub const BAKED_TEXTURE_EXTENSION: &str = "baked.tex";

/// Returns `true` for references to textures which were baked before.
pub fn is_baked_texture(url: &str) -> bool {
    strip_query(url).ends_with(&format!(".{BAKED_TEXTURE_EXTENSION}"))
}

/// The lowercase file extension of a texture reference; `data:` URIs report their image subtype.
pub fn source_extension(url: &str) -> Option<String> {
    if let Some(data) = url.strip_prefix("data:") {
        let mime = data.split([';', ',']).next()?;

        return mime
            .strip_prefix("image/")
            .filter(|ext| !ext.is_empty())
            .map(str::to_ascii_lowercase);
    }

    let name = file_name(strip_query(url));
    let (_, ext) = name.rsplit_once('.')?;

    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

fn file_name(url: &str) -> &str {
    url.rsplit(['/', '\\']).next().unwrap_or(url)
}

fn strip_query(url: &str) -> &str {
    if url.starts_with("data:") {
        return url;
    }

    url.find(['?', '#']).map(|idx| &url[..idx]).unwrap_or(url)
}

/// Identifies one texture bake within a session: two references with the same key share a job.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TextureBakeKey {
    pub url: String,
    pub usage: UsageType,
}

impl TextureBakeKey {
    /// Creates a key from an already resolved URL; query and fragment do not take part.
    pub fn new(url: &str, usage: UsageType) -> Self {
        Self {
            url: strip_query(url).to_owned(),
            usage,
        }
    }
}

/// Hands out unique output base names for baked textures.
///
/// A name is the source stem plus the usage id (`wood_2`); repeated names get a `-N` counter.
#[derive(Debug, Default)]
pub struct TextureFileNamer {
    counts: Mutex<HashMap<String, usize>>,
}

impl TextureFileNamer {
    pub fn name(&self, url: &str, usage: UsageType) -> String {
        let base = Self::base_name(url, usage);
        let name = format!("{base}_{usage}");

        let mut counts = self.counts.lock();
        let count = counts.entry(name.clone()).or_default();
        let res = if *count > 0 {
            format!("{name}-{count}")
        } else {
            name
        };
        *count += 1;

        res
    }

    fn base_name(url: &str, usage: UsageType) -> String {
        let name = if url.starts_with("data:") {
            ""
        } else {
            file_name(strip_query(url))
        };
        let mut base = name.split('.').next().unwrap_or_default();

        // Re-baking a baked texture must not stack usage suffixes
        let suffix = format!("_{usage}");
        if let Some(idx) = base.rfind(&suffix).filter(|&idx| idx > 0) {
            let rest = &base[idx + suffix.len()..];
            let is_counter = rest.is_empty()
                || rest
                    .strip_prefix('-')
                    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            if is_counter {
                base = &base[..idx];
            }
        }

        if base.is_empty() {
            "texture".to_owned()
        } else {
            base.to_owned()
        }
    }
}

/// Re-encodes source image bytes into the baked texture format.
pub trait ImageCodec: Send + Sync {
    /// Returns `true` when sources with this (lowercase) extension can be read.
    fn supports_extension(&self, ext: &str) -> bool;

    fn compress(&self, buf: &[u8], usage: UsageType) -> anyhow::Result<Vec<u8>>;
}

/// The default [`ImageCodec`]: anything the `image` crate reads, written as a [`Texture`].
#[derive(Clone, Copy, Debug)]
pub struct ImageCompressor {
    /// Height differences are scaled by this before building normals from a bump map.
    pub bump_strength: f32,

    pub compression: Option<Compression>,

    /// Longest edge of baked textures; larger images are scaled down.
    pub max_size: Option<u32>,
}

impl Default for ImageCompressor {
    fn default() -> Self {
        Self {
            bump_strength: 2.0,
            compression: None,
            max_size: None,
        }
    }
}

impl ImageCompressor {
    /// Fits `width` x `height` within `max_size`, keeping the aspect ratio.
    fn fit(width: u32, height: u32, max_size: u32) -> (u32, u32) {
        // Widened so `max_size * edge` cannot overflow
        let scale = |edge: u32, longest: u32| {
            (max_size as u64 * edge as u64 / longest as u64).max(1) as u32
        };

        if width > height {
            (max_size, scale(height, width))
        } else {
            (scale(width, height), max_size)
        }
    }

    fn resize(image: DynamicImage, max_size: u32) -> DynamicImage {
        if image.width() <= max_size && image.height() <= max_size {
            return image;
        }

        let (width, height) = Self::fit(image.width(), image.height(), max_size);

        image.resize_exact(width, height, FilterType::CatmullRom)
    }

    /// Converts a height map into a tangent space normal map.
    fn bump_to_normal(heights: &GrayImage, strength: f32) -> Vec<u8> {
        let (width, height) = heights.dimensions();
        let sample = |x: i64, y: i64| {
            let x = x.clamp(0, width as i64 - 1) as u32;
            let y = y.clamp(0, height as i64 - 1) as u32;

            heights.get_pixel(x, y)[0] as f32 / u8::MAX as f32
        };

        let mut buf = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                let dx = (sample(x + 1, y) - sample(x - 1, y)) * strength;
                let dy = (sample(x, y + 1) - sample(x, y - 1)) * strength;
                let normal = GlamVec3::new(-dx, -dy, 1.0).normalize();

                for val in normal.to_array() {
                    buf.push(((val * 0.5 + 0.5) * u8::MAX as f32).round() as u8);
                }
            }
        }

        buf
    }

    fn pixels(
        &self,
        image: &DynamicImage,
        usage: UsageType,
    ) -> (TextureColor, TextureFormat, Vec<u8>) {
        let color = if usage.is_srgb() {
            TextureColor::Srgb
        } else {
            TextureColor::Linear
        };

        if usage.is_scalar() {
            return (color, TextureFormat::R, image.to_luma8().into_raw());
        }

        match usage {
            UsageType::Bump => (
                color,
                TextureFormat::Rgb,
                Self::bump_to_normal(&image.to_luma8(), self.bump_strength),
            ),
            UsageType::Normal => (color, TextureFormat::Rgb, image.to_rgb8().into_raw()),
            _ => {
                let rgba = image.to_rgba8();
                if rgba.pixels().all(|pixel| pixel[3] == u8::MAX) {
                    // The source image has alpha but we're going to discard it
                    (color, TextureFormat::Rgb, image.to_rgb8().into_raw())
                } else {
                    (color, TextureFormat::Rgba, rgba.into_raw())
                }
            }
        }
    }
}

impl ImageCodec for ImageCompressor {
    fn supports_extension(&self, ext: &str) -> bool {
        ImageFormat::from_extension(ext).is_some_and(|format| format.reading_enabled())
    }

    fn compress(&self, buf: &[u8], usage: UsageType) -> anyhow::Result<Vec<u8>> {
        let mut image = load_from_memory(buf).context("Unable to decode image")?;
        if image.width() == 0 || image.height() == 0 {
            bail!("Image has no pixels");
        }

        if let Some(max_size) = self.max_size.filter(|&max_size| max_size > 0) {
            image = Self::resize(image, max_size);
        }

        let width = image.width();
        let (color, format, pixels) = self.pixels(&image, usage);

        Texture::new(color, format, usage, width, pixels).to_bytes(self.compression)
    }
}

/// Resolves a texture or model URL to its bytes.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetches local paths, `file://` URLs and `data:` URIs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileFetcher;

impl ResourceFetcher for FileFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if url.starts_with("data:") {
            return decode_data_uri(url);
        }

        let path = if let Some(path) = url.strip_prefix("file://") {
            path
        } else if let Some((scheme, _)) = url.split_once("://") {
            bail!("Unsupported URL scheme: {scheme}");
        } else {
            url
        };

        read(strip_query(path)).with_context(|| format!("Unable to read {path}"))
    }
}

/// Decodes the payload of a `data:` URI.
pub fn decode_data_uri(uri: &str) -> anyhow::Result<Vec<u8>> {
    let header = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("Not a data URI"))?;
    let (meta, data) = header
        .split_once(',')
        .ok_or_else(|| anyhow!("Data URI has no payload"))?;

    if data.is_empty() {
        bail!("Data URI has an empty payload");
    }

    if meta.split(';').any(|param| param == "base64") {
        let data = data.trim_end_matches('=');

        general_purpose::STANDARD_NO_PAD
            .decode(data)
            .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(data))
            .context("Decoding base64 data URI")
    } else {
        Ok(urlencoding::decode_binary(data.as_bytes()).into_owned())
    }
}

/// Supplies the runtime the next texture job is dispatched to.
pub trait WorkerPool: Send + Sync {
    fn next_worker(&self) -> Handle;
}

impl<F> WorkerPool for F
where
    F: Fn() -> Handle + Send + Sync,
{
    fn next_worker(&self) -> Handle {
        self()
    }
}

/// Owned runtimes handed out in turn.
pub struct RuntimeWorkers {
    next: AtomicUsize,
    runtimes: Vec<Runtime>,
}

impl RuntimeWorkers {
    pub fn new(count: usize) -> anyhow::Result<Self> {
        let runtimes = (0..count.max(1))
            .map(|idx| {
                Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(format!("oven-worker-{idx}"))
                    .build()
                    .context("Creating worker runtime")
            })
            .collect::<anyhow::Result<_>>()?;

        Ok(Self {
            next: AtomicUsize::new(0),
            runtimes,
        })
    }
}

impl WorkerPool for RuntimeWorkers {
    fn next_worker(&self) -> Handle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.runtimes.len();

        self.runtimes[idx].handle().clone()
    }
}

/// Bakes one texture into `<output_dir>/<base_name>.baked.tex`.
pub struct TextureBaker {
    base_name: String,
    codec: Arc<dyn ImageCodec>,
    content: Option<Vec<u8>>,
    fetcher: Arc<dyn ResourceFetcher>,
    key: TextureBakeKey,
    output_dir: PathBuf,
    state: BakerState,
}

impl TextureBaker {
    pub fn new(
        key: TextureBakeKey,
        output_dir: impl AsRef<Path>,
        base_name: impl Into<String>,
        codec: Arc<dyn ImageCodec>,
        fetcher: Arc<dyn ResourceFetcher>,
        token: CancellationToken,
    ) -> Self {
        Self {
            base_name: base_name.into(),
            codec,
            content: None,
            fetcher,
            key,
            output_dir: output_dir.as_ref().to_path_buf(),
            state: BakerState::new(token),
        }
    }

    /// Bakes from bytes already in memory instead of fetching the key URL.
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn key(&self) -> &TextureBakeKey {
        &self.key
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{BAKED_TEXTURE_EXTENSION}", self.base_name))
    }
}

impl Baker for TextureBaker {
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

        info!("Baking texture: {} (usage {})", self.key.url, self.key.usage);

        let buf = match self.content.take() {
            Some(content) => content,
            None => match self.fetcher.fetch(&self.key.url) {
                Ok(buf) => buf,
                Err(err) => {
                    self.state
                        .fail(BakeError::source_unreadable(&self.key.url, format!("{err:#}")));

                    return;
                }
            },
        };

        if self.state.check_aborted() {
            return;
        }

        let baked = match self.codec.compress(&buf, self.key.usage) {
            Ok(baked) => baked,
            Err(err) => {
                self.state.fail(format!(
                    "Unable to compress texture {}: {err:#}",
                    self.key.url
                ));

                return;
            }
        };

        if self.state.check_aborted() {
            return;
        }

        let path = self.output_path();
        if let Err(err) = create_dir_all(&self.output_dir).and_then(|_| write(&path, baked)) {
            self.state.fail(BakeError::write(&path, err));

            return;
        }

        self.state.result_mut().add_output_file(&path);
        self.state.settle();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, image::RgbaImage, std::io::Cursor, tempfile::tempdir};

    fn png(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 40) as u8, (y * 40) as u8, 128, alpha])
        });
        let mut buf = Cursor::new(vec![]);
        image.write_to(&mut buf, ImageFormat::Png).unwrap();

        buf.into_inner()
    }

    #[test]
    fn fit_handles_large_images() {
        assert_eq!(ImageCompressor::fit(100_000, 50_000, 100_000), (100_000, 50_000));
        assert_eq!(ImageCompressor::fit(60_000, 120_000, 4096), (2048, 4096));
        assert_eq!(ImageCompressor::fit(u32::MAX, 1, 1024), (1024, 1));
    }

    #[test]
    fn key_ignores_query_and_fragment() {
        assert_eq!(
            TextureBakeKey::new("a/wood.png?v=2#top", UsageType::Albedo),
            TextureBakeKey::new("a/wood.png", UsageType::Albedo)
        );
        assert_ne!(
            TextureBakeKey::new("a/wood.png", UsageType::Albedo),
            TextureBakeKey::new("a/wood.png", UsageType::Normal)
        );
    }

    #[test]
    fn namer_appends_usage_and_counter() {
        let namer = TextureFileNamer::default();

        assert_eq!(namer.name("a/wood.png", UsageType::Albedo), "wood_2");
        assert_eq!(namer.name("b/wood.jpg", UsageType::Albedo), "wood_2-1");
        assert_eq!(namer.name("b/wood.jpg", UsageType::Normal), "wood_3");
        assert_eq!(namer.name("wood_2.baked.tex", UsageType::Albedo), "wood_2-2");
        assert_eq!(namer.name("wood_2-7.baked.tex", UsageType::Albedo), "wood_2-3");
        assert_eq!(namer.name("data:image/png;base64,AAAA", UsageType::Albedo), "texture_2");
    }

    #[test]
    fn namer_keeps_leading_usage_like_names() {
        let namer = TextureFileNamer::default();

        assert_eq!(namer.name("_2.png", UsageType::Albedo), "_2_2");
    }

    #[test]
    fn extensions() {
        assert_eq!(source_extension("a/B.PNG?x=1").as_deref(), Some("png"));
        assert_eq!(source_extension("data:image/jpeg;base64,AA").as_deref(), Some("jpeg"));
        assert_eq!(source_extension("noext"), None);
        assert!(is_baked_texture("a/wood_2.baked.tex"));
        assert!(!is_baked_texture("a/wood.png"));
    }

    #[test]
    fn data_uris_decode() {
        assert_eq!(decode_data_uri("data:text/plain;base64,aGk=").unwrap(), b"hi");
        assert_eq!(decode_data_uri("data:text/plain;base64,aGk").unwrap(), b"hi");
        assert_eq!(decode_data_uri("data:,a%20b").unwrap(), b"a b");
        assert!(decode_data_uri("data:text/plain;base64,").is_err());
        assert!(decode_data_uri("data:text/plain").is_err());
    }

    #[test]
    fn file_fetcher_rejects_remote_schemes() {
        assert!(FileFetcher.fetch("https://example.com/a.png").is_err());
    }

    #[test]
    fn compressor_picks_layout_by_usage() {
        let codec = ImageCompressor::default();
        let opaque = png(4, 2, u8::MAX);
        let clear = png(4, 2, 7);

        let albedo = Texture::from_bytes(&codec.compress(&opaque, UsageType::Albedo).unwrap())
            .unwrap();
        assert_eq!(albedo.format(), TextureFormat::Rgb);
        assert_eq!(albedo.color(), TextureColor::Srgb);
        assert_eq!((albedo.width(), albedo.height()), (4, 2));

        let albedo = Texture::from_bytes(&codec.compress(&clear, UsageType::Albedo).unwrap())
            .unwrap();
        assert_eq!(albedo.format(), TextureFormat::Rgba);

        let rough = Texture::from_bytes(&codec.compress(&opaque, UsageType::Roughness).unwrap())
            .unwrap();
        assert_eq!(rough.format(), TextureFormat::R);
        assert_eq!(rough.color(), TextureColor::Linear);

        let bump = Texture::from_bytes(&codec.compress(&opaque, UsageType::Bump).unwrap())
            .unwrap();
        assert_eq!(bump.format(), TextureFormat::Rgb);
        assert_eq!(bump.pixels().len(), 4 * 2 * 3);
    }

    #[test]
    fn compressor_clamps_size() {
        let codec = ImageCompressor {
            max_size: Some(2),
            compression: Some(Compression::Snap),
            ..Default::default()
        };

        let baked = codec.compress(&png(8, 4, 255), UsageType::Normal).unwrap();
        let texture = Texture::from_bytes(&baked).unwrap();

        assert_eq!((texture.width(), texture.height()), (2, 1));
    }

    #[test]
    fn compressor_supports_common_formats() {
        let codec = ImageCompressor::default();

        assert!(codec.supports_extension("png"));
        assert!(!codec.supports_extension("psd"));
    }

    #[test]
    fn texture_baker_writes_baked_file() {
        let dir = tempdir().unwrap();
        let mut baker = TextureBaker::new(
            TextureBakeKey::new("embedded/wood.png", UsageType::Albedo),
            dir.path(),
            "wood_2",
            Arc::new(ImageCompressor::default()),
            Arc::new(FileFetcher),
            CancellationToken::new(),
        )
        .with_content(png(2, 2, u8::MAX));

        baker.bake();

        assert_eq!(baker.status(), crate::buf::BakeStatus::Finished);
        assert_eq!(baker.output_files(), [dir.path().join("wood_2.baked.tex")]);
        assert!(baker.output_path().exists());
    }

    #[test]
    fn texture_baker_fails_on_missing_source() {
        let dir = tempdir().unwrap();
        let mut baker = TextureBaker::new(
            TextureBakeKey::new("does/not/exist.png", UsageType::Albedo),
            dir.path(),
            "exist_2",
            Arc::new(ImageCompressor::default()),
            Arc::new(FileFetcher),
            CancellationToken::new(),
        );

        baker.bake();

        assert_eq!(baker.status(), crate::buf::BakeStatus::Failed);
        assert!(baker.output_files().is_empty());
        assert_eq!(baker.errors().len(), 1);
    }

    #[test]
    fn aborted_texture_baker_writes_nothing() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        let mut baker = TextureBaker::new(
            TextureBakeKey::new("wood.png", UsageType::Albedo),
            dir.path(),
            "wood_2",
            Arc::new(ImageCompressor::default()),
            Arc::new(FileFetcher),
            token.clone(),
        )
        .with_content(png(2, 2, u8::MAX));
        token.cancel();

        baker.bake();

        assert_eq!(baker.status(), crate::buf::BakeStatus::Aborted);
        assert!(baker.output_files().is_empty());
    }
}
