use {
    anyhow::Context,
    serde::Deserialize,
    std::{fs::read_to_string, path::Path},
};

/// A top-level content file which groups the assets of one batch bake.
///
/// ```toml
/// [[group]]
/// assets = ["models/*.fst", "materials/*.json"]
///
/// [[group]]
/// enabled = false
/// assets = ["wip/**/*.tree"]
/// ```
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
pub struct Content {
    #[serde(default, rename = "group")]
    groups: Vec<Group>,
}

impl Content {
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let str = read_to_string(&path).context("Reading content file as a string")?;

        Self::parse(&str)
    }

    pub fn parse(str: &str) -> anyhow::Result<Self> {
        toml::from_str(str).context("Parsing content toml")
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }
}

/// A set of asset globs, relative to the content file, which may be switched off as a whole.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub struct Group {
    #[serde(default = "Group::default_enabled")]
    enabled: bool,

    #[serde(default)]
    assets: Vec<String>,
}

impl Group {
    fn default_enabled() -> bool {
        true
    }

    pub fn asset_globs(&self) -> &[String] {
        &self.assets
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}
