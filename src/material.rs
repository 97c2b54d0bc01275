use {
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, fmt::Display},
};

/// The semantic role of a texture, which decides how it is compressed.
///
/// Discriminants are stable; they end up in baked texture filenames.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum UsageType {
    Default = 0,
    Albedo = 2,
    Normal = 3,
    Bump = 4,
    Specular = 5,
    Metallic = 6,
    Roughness = 7,
    Gloss = 8,
    Emissive = 9,
    Occlusion = 11,
    Scattering = 12,
    Lightmap = 13,
}

impl UsageType {
    pub const ALL: [Self; 12] = [
        Self::Default,
        Self::Albedo,
        Self::Normal,
        Self::Bump,
        Self::Specular,
        Self::Metallic,
        Self::Roughness,
        Self::Gloss,
        Self::Emissive,
        Self::Occlusion,
        Self::Scattering,
        Self::Lightmap,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|usage| usage.id() == id)
    }

    /// Scalar usages are stored as a single channel.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Self::Metallic
                | Self::Roughness
                | Self::Gloss
                | Self::Occlusion
                | Self::Scattering
                | Self::Specular
        )
    }

    /// Colors authored by artists are sRGB; everything else holds linear data.
    pub fn is_srgb(self) -> bool {
        matches!(self, Self::Default | Self::Albedo | Self::Emissive | Self::Lightmap)
    }
}

impl Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// A named texture slot of a material.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapChannel {
    Albedo,
    Normal,
    Bump,
    Metallic,
    Roughness,
    Specular,
    Gloss,
    Emissive,
    Occlusion,
    Lightmap,
    Scattering,
    Opacity,
}

impl MapChannel {
    pub const ALL: [Self; 12] = [
        Self::Albedo,
        Self::Normal,
        Self::Bump,
        Self::Metallic,
        Self::Roughness,
        Self::Specular,
        Self::Gloss,
        Self::Emissive,
        Self::Occlusion,
        Self::Lightmap,
        Self::Scattering,
        Self::Opacity,
    ];

    /// Parses either a material JSON key (`albedoMap`) or a scene connection channel name
    /// (`DiffuseColor`, `NormalMap`, ..).
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "albedoMap" | "DiffuseColor" | "Maya|baseColor" => Self::Albedo,
            "normalMap" | "NormalMap" | "Maya|normalCamera" => Self::Normal,
            "bumpMap" | "Bump" => Self::Bump,
            "metallicMap" | "ReflectionFactor" | "Maya|metalness" => Self::Metallic,
            "roughnessMap" | "Maya|specularRoughness" => Self::Roughness,
            "specularMap" | "SpecularColor" | "SpecularFactor" => Self::Specular,
            "glossMap" | "ShininessExponent" => Self::Gloss,
            "emissiveMap" | "EmissiveColor" | "Maya|emissionColor" => Self::Emissive,
            "occlusionMap" | "AmbientColor" => Self::Occlusion,
            "lightMap" | "lightmapMap" => Self::Lightmap,
            "scatteringMap" => Self::Scattering,
            "opacityMap" | "TransparentColor" | "TransparencyFactor" => Self::Opacity,
            _ => return None,
        })
    }

    /// The material JSON key of this channel.
    pub fn key(self) -> &'static str {
        match self {
            Self::Albedo => "albedoMap",
            Self::Normal => "normalMap",
            Self::Bump => "bumpMap",
            Self::Metallic => "metallicMap",
            Self::Roughness => "roughnessMap",
            Self::Specular => "specularMap",
            Self::Gloss => "glossMap",
            Self::Emissive => "emissiveMap",
            Self::Occlusion => "occlusionMap",
            Self::Lightmap => "lightMap",
            Self::Scattering => "scatteringMap",
            Self::Opacity => "opacityMap",
        }
    }

    /// The usage a texture bound to this channel is baked as, if the channel can be baked.
    pub fn usage(self) -> Option<UsageType> {
        Some(match self {
            Self::Albedo => UsageType::Albedo,
            Self::Normal => UsageType::Normal,
            Self::Bump => UsageType::Bump,
            Self::Metallic => UsageType::Metallic,
            Self::Roughness => UsageType::Roughness,
            Self::Specular => UsageType::Specular,
            Self::Gloss => UsageType::Gloss,
            Self::Emissive => UsageType::Emissive,
            Self::Occlusion => UsageType::Occlusion,
            Self::Lightmap => UsageType::Lightmap,
            Self::Scattering => UsageType::Scattering,
            Self::Opacity => return None,
        })
    }
}

impl Display for MapChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Where the pixels of a material channel come from.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TextureSource {
    /// A path or URL, resolved relative to the material that references it.
    Url(String),

    /// Image bytes carried inside the scene itself.
    Embedded {
        name: String,
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
    },
}

impl TextureSource {
    /// The name used to identify this source: the URL, or the embedded filename.
    pub fn name(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Embedded { name, .. } => name,
        }
    }
}

/// A named material and the texture bound to each of its channels.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MaterialRecord {
    pub name: String,
    pub maps: BTreeMap<MapChannel, TextureSource>,
}

impl MaterialRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            maps: Default::default(),
        }
    }

    pub fn with_map(mut self, channel: MapChannel, source: TextureSource) -> Self {
        self.maps.insert(channel, source);
        self
    }

    /// Meshes drawn with this material need tangents when it reads a normal or bump map.
    pub fn needs_tangent_space(&self) -> bool {
        self.maps.contains_key(&MapChannel::Normal) || self.maps.contains_key(&MapChannel::Bump)
    }
}
