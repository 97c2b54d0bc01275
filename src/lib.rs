//! Offline asset baking.
//!
//! The crate root holds the data types shared by bakers and by whatever loads baked output:
//! scene node trees, mesh and material records, the quantized codec mesh payload and the baked
//! texture container. The baking pipeline itself lives in [`buf`] behind the `bake` feature.

mod codec;
mod compression;
mod material;
mod mesh;
mod node;
mod texture;

#[cfg(feature = "bake")]
pub mod buf;

pub use self::{
    codec::{Attribute, AttributeFlags, CodecMesh, CodecMeshBuilder, DecodedMesh, Quantization},
    compression::Compression,
    material::{MapChannel, MaterialRecord, TextureSource, UsageType},
    mesh::{Blendshape, Joint, MeshPart, MeshRecord},
    node::{NodeTreeFormat, Property, SceneFormat, SceneNode},
    texture::{Texture, TextureColor, TextureFormat},
};

pub type Vec2 = [f32; 2];
pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];
pub type Quat = [f32; 4];

/// Serializes any value into the binary layout used by every baked file.
fn encode<T>(val: &T) -> anyhow::Result<Vec<u8>>
where
    T: serde::Serialize,
{
    Ok(bincode::serde::encode_to_vec(
        val,
        bincode::config::standard(),
    )?)
}

/// Inverse of [`encode`].
fn decode<T>(buf: &[u8]) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let (val, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())?;

    Ok(val)
}

/// Splits a file header of `magic` from `buf`, returning the remaining bytes.
fn strip_magic<'a>(buf: &'a [u8], magic: &[u8; 20]) -> anyhow::Result<&'a [u8]> {
    if buf.len() < magic.len() || &buf[..magic.len()] != magic {
        anyhow::bail!(
            "Unexpected file header (expected {})",
            String::from_utf8_lossy(magic).trim()
        );
    }

    Ok(&buf[magic.len()..])
}
