use {
    super::{Compression, UsageType, decode, encode, strip_magic},
    anyhow::Context,
    serde::{Deserialize, Serialize},
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TextureColor {
    Linear,
    Srgb,
}

/// Channel layout of the pixels of a [`Texture`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TextureFormat {
    R,
    Rg,
    Rgb,
    Rgba,
}

impl TextureFormat {
    pub fn byte_len(self) -> usize {
        match self {
            Self::R => 1,
            Self::Rg => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// A baked texture: tightly packed 8-bit pixels plus what they are used for.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Texture {
    color: TextureColor,
    format: TextureFormat,
    usage: UsageType,

    #[serde(with = "serde_bytes")]
    pixels: Vec<u8>,

    width: u32,
}

impl Texture {
    const MAGIC: &'static [u8; 20] = b"OVEN-TEXTURE-V1.0   ";

    pub fn new(
        color: TextureColor,
        format: TextureFormat,
        usage: UsageType,
        width: u32,
        pixels: impl Into<Vec<u8>>,
    ) -> Self {
        let pixels = pixels.into();

        debug_assert!(width > 0);
        debug_assert_eq!(pixels.len() % (format.byte_len() * width as usize), 0);

        Self {
            color,
            format,
            usage,
            pixels,
            width,
        }
    }

    pub fn color(&self) -> TextureColor {
        self.color
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn height(&self) -> u32 {
        (self.pixels.len() / (self.format.byte_len() * self.width as usize)) as u32
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn usage(&self) -> UsageType {
        self.usage
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Reads a baked texture file.
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let body = Compression::unpack(strip_magic(buf, Self::MAGIC)?)?;

        decode(&body).context("Decoding texture")
    }

    /// Produces the contents of a baked texture file.
    pub fn to_bytes(&self, compression: Option<Compression>) -> anyhow::Result<Vec<u8>> {
        let body = encode(self)?;
        let mut buf = Self::MAGIC.to_vec();
        Compression::pack(compression, &body, &mut buf).context("Compressing texture")?;

        Ok(buf)
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("color", &self.color)
            .field("format", &self.format)
            .field("usage", &self.usage)
            .field("width", &self.width)
            .field("height", &self.height())
            .finish()
    }
}
