//! Pipeline stages and the topics that connect them.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// One phase of the pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// Tag and metadata extraction.
    Metadata,
    /// Stem separation.
    Splitter,
    /// Packaging of stems into deliverables.
    Packager,
    /// Moving deliverables into the organized library.
    Organizer,
}

impl Stage {
    /// All stages in pipeline order.
    pub fn all() -> impl Iterator<Item = Stage> {
        Stage::iter()
    }

    /// Topic this stage consumes.
    pub fn input_topic(self) -> Topic {
        match self {
            Stage::Metadata => Topic::Queued,
            Stage::Splitter => Topic::MetadataDone,
            Stage::Packager => Topic::SplitDone,
            Stage::Organizer => Topic::Packaged,
        }
    }

    /// Topic this stage publishes to on success.
    pub fn output_topic(self) -> Topic {
        match self {
            Stage::Metadata => Topic::MetadataDone,
            Stage::Splitter => Topic::SplitDone,
            Stage::Packager => Topic::Packaged,
            Stage::Organizer => Topic::Organized,
        }
    }

    /// The stage fed by this stage's output, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Metadata => Some(Stage::Splitter),
            Stage::Splitter => Some(Stage::Packager),
            Stage::Packager => Some(Stage::Organizer),
            Stage::Organizer => None,
        }
    }

    /// Whether a success here completes the pipeline for the file.
    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    /// Capitalized name for human-facing text.
    pub fn title(self) -> &'static str {
        match self {
            Stage::Metadata => "Metadata",
            Stage::Splitter => "Splitter",
            Stage::Packager => "Packager",
            Stage::Organizer => "Organizer",
        }
    }
}

/// A durable topic marking one stage transition.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Topic {
    Queued,
    MetadataDone,
    SplitDone,
    Packaged,
    Organized,
}

impl Topic {
    /// Stream key on the backend.
    pub fn stream_key(self) -> String {
        format!("pipeline:{}", self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Metadata.to_string(), "metadata");
        assert_eq!(Stage::from_str("splitter").unwrap(), Stage::Splitter);
        assert_eq!(Stage::Organizer.title(), "Organizer");
        assert_eq!(Stage::all().count(), 4);
    }

    #[test]
    fn test_topic_keys() {
        assert_eq!(Topic::Queued.stream_key(), "pipeline:queued");
        assert_eq!(Topic::MetadataDone.stream_key(), "pipeline:metadata-done");
        assert_eq!(Topic::from_str("split-done").unwrap(), Topic::SplitDone);
    }

    #[test]
    fn test_stages_chain_through_topics() {
        for stage in Stage::all() {
            if let Some(next) = stage.next() {
                assert_eq!(stage.output_topic(), next.input_topic());
            } else {
                assert!(stage.is_final());
                assert_eq!(stage.output_topic(), Topic::Organized);
            }
        }
    }
}
