use {
    crate::Quat,
    anyhow::Context,
    glam::EulerRot,
    ordered_float::OrderedFloat,
    serde::{
        Deserialize, Deserializer, Serialize, Serializer,
        de::{SeqAccess, Visitor, value::SeqAccessDeserializer},
        ser::SerializeSeq,
    },
    std::{collections::BTreeMap, fmt::Formatter, num::FpCategory},
};

/// A mapping (`.fst`) file: names the model to bake plus joint and material overrides.
///
/// ```toml
/// filename = "avatar.tree"
///
/// [joint_rename]
/// "mixamorig:Hips" = "Hips"
///
/// [joint_index]
/// Hips = 0
///
/// [joint_rotation_offset]
/// Hips = [0.0, 90.0, 0.0]
///
/// [material_map]
/// skin = "materials/skin.json"
/// eyes = { albedoMap = "eyes.png" }
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Mapping {
    pub filename: Option<String>,

    /// Model joint name to canonical joint name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub joint_rename: BTreeMap<String, String>,

    /// Canonical joint name to joint index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub joint_index: BTreeMap<String, usize>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub joint_rotation_offset: BTreeMap<String, Rotation>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub material_map: BTreeMap<String, MaterialMapEntry>,
}

impl Mapping {
    pub const EXTENSION: &'static str = "fst";

    pub fn parse(str: &str) -> anyhow::Result<Self> {
        toml::from_str(str).context("Parsing mapping toml")
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Serializing mapping toml")
    }
}

/// A material override: either a path to a material file or an inline material.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MaterialMapEntry {
    Url(String),
    Inline(serde_json::Value),
}

/// A rotation stored as either a euler (degrees, XYZ) or quaternion.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rotation {
    /// A three component euler rotation.
    Euler([OrderedFloat<f32>; 3]),

    /// A four component quaternion rotation.
    Quaternion([OrderedFloat<f32>; 4]),
}

impl Rotation {
    pub fn to_quat(self) -> Quat {
        match self {
            Self::Euler([x, y, z]) => glam::Quat::from_euler(
                EulerRot::XYZ,
                x.0.to_radians(),
                y.0.to_radians(),
                z.0.to_radians(),
            )
            .to_array(),
            Self::Quaternion([x, y, z, w]) => glam::Quat::from_xyzw(x.0, y.0, z.0, w.0)
                .normalize()
                .to_array(),
        }
    }
}

impl<'de> Deserialize<'de> for Rotation {
    /// Deserialize from either:
    ///
    /// euler xyz:
    /// .. = [1.0, 2.0, 3.0]
    ///
    /// quaternion xyzw:
    /// .. = [1.0, 2.0, 3.0, 0.0]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RotationVisitor;

        impl<'de> Visitor<'de> for RotationVisitor {
            type Value = Rotation;

            fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
                formatter.write_str("floating point sequence of length 3 or 4")
            }

            fn visit_seq<A>(self, seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                use serde::de::Error;

                let val: Vec<f32> = Deserialize::deserialize(SeqAccessDeserializer::new(seq))?;

                for val in &val {
                    match val.classify() {
                        FpCategory::Zero | FpCategory::Normal => (),
                        _ => return Err(A::Error::custom("unexpected sequence value")),
                    }
                }

                match *val.as_slice() {
                    [x, y, z] => Ok(Rotation::Euler([
                        OrderedFloat(x),
                        OrderedFloat(y),
                        OrderedFloat(z),
                    ])),
                    [x, y, z, w] => Ok(Rotation::Quaternion([
                        OrderedFloat(x),
                        OrderedFloat(y),
                        OrderedFloat(z),
                        OrderedFloat(w),
                    ])),
                    _ => Err(A::Error::invalid_length(val.len(), &self)),
                }
            }
        }

        deserializer.deserialize_seq(RotationVisitor)
    }
}

impl Serialize for Rotation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let vals = match self {
            Self::Euler(vals) => vals.as_slice(),
            Self::Quaternion(vals) => vals.as_slice(),
        };

        let mut seq = serializer.serialize_seq(Some(vals.len()))?;
        for val in vals {
            seq.serialize_element(&val.0)?;
        }

        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_reads_overrides() {
        let mapping = Mapping::parse(
            r#"
            filename = "avatar.tree"

            [joint_index]
            Hips = 3

            [joint_rotation_offset]
            Hips = [0.0, 90.0, 0.0]
            Spine = [0.0, 0.0, 0.0, 1.0]

            [material_map]
            skin = "skin.json"
            eyes = { albedoMap = "eyes.png" }
            "#,
        )
        .unwrap();

        assert_eq!(mapping.filename.as_deref(), Some("avatar.tree"));
        assert_eq!(mapping.joint_index["Hips"], 3);
        assert!(matches!(
            mapping.joint_rotation_offset["Hips"],
            Rotation::Euler(_)
        ));
        assert!(matches!(
            mapping.joint_rotation_offset["Spine"],
            Rotation::Quaternion(_)
        ));
        assert_eq!(
            mapping.material_map["skin"],
            MaterialMapEntry::Url("skin.json".into())
        );
        assert!(matches!(
            mapping.material_map["eyes"],
            MaterialMapEntry::Inline(_)
        ));
    }

    #[test]
    fn mapping_writes_back() {
        let mut mapping = Mapping {
            filename: Some("a.baked.tree".into()),
            ..Default::default()
        };
        mapping.joint_rotation_offset.insert(
            "Hips".into(),
            Rotation::Euler([OrderedFloat(0.0), OrderedFloat(90.0), OrderedFloat(0.0)]),
        );

        let read = Mapping::parse(&mapping.to_toml().unwrap()).unwrap();

        assert_eq!(read, mapping);
    }

    #[test]
    fn rotation_rejects_bad_lengths() {
        assert!(Mapping::parse("[joint_rotation_offset]\nHips = [1.0, 2.0]").is_err());
        assert!(
            Mapping::parse("[joint_rotation_offset]\nHips = [1.0, 2.0, 3.0, 4.0, 5.0]").is_err()
        );
    }

    #[test]
    fn euler_rotation_is_degrees() {
        let quat = Rotation::Euler([OrderedFloat(0.0), OrderedFloat(180.0), OrderedFloat(0.0)])
            .to_quat();

        assert!(quat[1].abs() > 0.99);
    }
}
