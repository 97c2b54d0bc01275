use std::path::PathBuf;

/// Conditions that end a bake with no meaningful output.
///
/// Anything not listed here is recorded as a warning and baking continues.
#[derive(thiserror::Error, Debug)]
pub enum BakeError {
    #[error("unable to read source {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("mapping {path} is missing the required `{field}` field")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("mapping {path} references another mapping: FST chaining is not supported")]
    MappingChain { path: PathBuf },

    #[error("material {material} uses unknown map channel `{channel}`")]
    UnknownMapChannel { material: String, channel: String },

    #[error("no mesh of {path} could be encoded")]
    NoEncodableMesh { path: PathBuf },

    #[error("unable to locate {path} or any fallback")]
    Unresolvable { path: PathBuf },

    #[error("unable to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BakeError {
    pub fn source_unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_message_names_the_problem() {
        let err = BakeError::MappingChain {
            path: PathBuf::from("a.fst"),
        };

        assert!(err.to_string().contains("FST chaining is not supported"));
    }

    #[test]
    fn unknown_channel_names_material_and_channel() {
        let err = BakeError::UnknownMapChannel {
            material: "skin".into(),
            channel: "opacityMap".into(),
        };
        let msg = err.to_string();

        assert!(msg.contains("skin"));
        assert!(msg.contains("opacityMap"));
    }
}
