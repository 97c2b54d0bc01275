use {
    super::{
        Oven,
        error::BakeError,
        mapping::Mapping,
        model::{ModelBaker, has_been_baked, preserve_source, strip_baked},
        parent, relative_url, resolve_url,
        state::{BakeStatus, Baker, BakerState, CancellationToken},
    },
    anyhow::Context,
    log::{debug, info},
    std::{
        fs::{create_dir_all, write},
        path::{Path, PathBuf},
    },
};

fn is_mapping(url: &str) -> bool {
    Path::new(url)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(Mapping::EXTENSION))
}

/// Bakes the model a mapping (`.fst`) file names, then writes a baked mapping pointing at it.
pub struct FstBaker {
    baked_mapping: Option<PathBuf>,
    original_dir: Option<PathBuf>,
    output_dir: PathBuf,
    oven: Oven,
    source: String,
    state: BakerState,
}

impl FstBaker {
    pub fn new(
        oven: Oven,
        source: impl Into<String>,
        output_dir: impl AsRef<Path>,
        token: CancellationToken,
    ) -> Self {
        Self {
            baked_mapping: None,
            original_dir: None,
            output_dir: output_dir.as_ref().to_path_buf(),
            oven,
            source: source.into(),
            state: BakerState::new(token),
        }
    }

    /// Keeps copies of the mapping and model sources in `original_dir`.
    pub fn with_original_dir(mut self, original_dir: impl AsRef<Path>) -> Self {
        self.original_dir = Some(original_dir.as_ref().to_path_buf());
        self
    }

    /// The written mapping file.
    pub fn baked_mapping_path(&self) -> Option<&Path> {
        self.baked_mapping.as_deref()
    }

    /// Mapping files to try, in order.
    ///
    /// Re-baking `baked/a.baked.fst` prefers the preserved `original/a.fst`, then `baked/a.fst`,
    /// and finally the baked mapping itself, whose `filename` leads back to the original model.
    fn mapping_candidates(&self) -> Vec<String> {
        if !has_been_baked(&self.source) {
            return vec![self.source.clone()];
        }

        let path = Path::new(&self.source);
        let dir = parent(path);
        let name = path
            .file_name()
            .map(|name| strip_baked(&name.to_string_lossy()))
            .unwrap_or_default();
        let original = dir.join("..").join("original").join(&name);

        vec![
            original.to_string_lossy().into_owned(),
            dir.join(&name).to_string_lossy().into_owned(),
            self.source.clone(),
        ]
    }

    fn read_mapping(&self) -> Result<(PathBuf, Vec<u8>), BakeError> {
        let candidates = self.mapping_candidates();
        let mut last_err = None;

        for url in &candidates {
            if url != &self.source {
                info!("Looking for mapping {} at {url}", self.source);
            }

            match self.oven.services().fetcher.fetch(url) {
                Ok(buf) => return Ok((PathBuf::from(url), buf)),
                Err(err) => {
                    debug!("Unable to read {url}: {err:#}");
                    last_err = Some(err);
                }
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

    fn write_mapping(&mut self, path: &Path, mapping: &Mapping) -> Result<(), BakeError> {
        let stem = path
            .file_name()
            .map(|name| strip_baked(&name.to_string_lossy()))
            .and_then(|name| {
                Path::new(&name)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "mapping".to_owned());
        let dst = self
            .output_dir
            .join(format!("{stem}.baked.{}", Mapping::EXTENSION));
        let buf = mapping
            .to_toml()
            .with_context(|| format!("Writing {}", dst.display()))?;

        create_dir_all(&self.output_dir)
            .and_then(|_| write(&dst, buf))
            .map_err(|err| BakeError::write(&dst, err))?;

        self.state.result_mut().add_output_file(&dst);
        self.baked_mapping = Some(dst);

        Ok(())
    }

    fn try_bake(&mut self) -> Result<(), BakeError> {
        let (path, buf) = self.read_mapping()?;
        let mapping = String::from_utf8(buf.clone())
            .context("Mapping is not UTF-8")
            .and_then(|str| Mapping::parse(&str))
            .map_err(|err| BakeError::source_unreadable(&path, format!("{err:#}")))?;
        let mapping_dir = parent(&path);

        let filename = mapping
            .filename
            .as_deref()
            .filter(|filename| !filename.is_empty())
            .ok_or_else(|| BakeError::MissingField {
                path: path.clone(),
                field: "filename",
            })?;
        let model_url = resolve_url(&mapping_dir, filename);
        if is_mapping(&model_url) {
            return Err(BakeError::MappingChain { path });
        }

        if let Some(original_dir) = &self.original_dir {
            preserve_source(original_dir, &path, &buf)?;
        }

        let mut model = ModelBaker::new(
            self.oven.clone(),
            &model_url,
            &self.output_dir,
            self.state.token().child(),
        )
        .with_mapping(mapping.clone(), &mapping_dir);
        if let Some(original_dir) = &self.original_dir {
            model = model.with_original_dir(original_dir);
        }

        model.bake();
        self.state.result_mut().absorb(model.result());

        if model.status() != BakeStatus::Finished {
            return Ok(());
        }

        let Some(baked_model) = model.baked_model_path() else {
            return Ok(());
        };

        let joint_index = if model.joint_indices().is_empty() {
            mapping.joint_index.clone()
        } else {
            model.joint_indices().clone()
        };
        let baked = Mapping {
            filename: Some(relative_url(baked_model, &self.output_dir)),
            joint_rename: mapping.joint_rename.clone(),
            joint_index,
            joint_rotation_offset: mapping.joint_rotation_offset.clone(),
            material_map: model.baked_material_map().clone(),
        };

        self.write_mapping(&path, &baked)
    }
}

impl Baker for FstBaker {
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

        info!("Baking mapping: {}", self.source);

        match self.try_bake() {
            Ok(()) => self.state.settle(),
            Err(err) => self.state.fail(err),
        }
    }
}
