//! Stage identifiers and their fixed attributes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the nine stages of the deck generation workflow.
///
/// Declaration order is the scheduler's priority order, so the derived
/// `Ord` matches [`StageId::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    /// 0A: copy the template and probe its layout metadata.
    #[serde(rename = "stage0a_template_intake", alias = "0A")]
    TemplateIntake,
    /// 0B: copy the source document and convert it to markdown.
    #[serde(rename = "stage0b_source_intake", alias = "0B")]
    SourceIntake,
    /// 1: extract the template's slide inventory.
    #[serde(rename = "stage1_extract", alias = "1")]
    Extract,
    /// 2: analyze the template with the generative service.
    #[serde(rename = "stage2_analyze", alias = "2")]
    Analyze,
    /// 3: draft the deck outline from the source content.
    #[serde(rename = "stage3_outline", alias = "3")]
    Outline,
    /// 4: rearrange template slides to follow the outline.
    #[serde(rename = "stage4_rearrange", alias = "4")]
    Rearrange,
    /// 5: extract the text inventory of the rearranged deck.
    #[serde(rename = "stage5_inventory", alias = "5")]
    Inventory,
    /// 6: generate replacement text for every shape.
    #[serde(rename = "stage6_replacements", alias = "6")]
    Replacements,
    /// 7: apply replacements and assemble the final artifact.
    #[serde(rename = "stage7_finalize", alias = "7")]
    Finalize,
}

/// Whether a stage runs locally or calls an external generative service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Deterministic local computation.
    Script,
    /// Call to an external generative model.
    Generative,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::Generative => write!(f, "generative"),
        }
    }
}

impl StageId {
    /// Number of stages in the workflow.
    pub const COUNT: usize = 9;

    /// All stages in priority order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::TemplateIntake,
        Self::SourceIntake,
        Self::Extract,
        Self::Analyze,
        Self::Outline,
        Self::Rearrange,
        Self::Inventory,
        Self::Replacements,
        Self::Finalize,
    ];

    /// Returns the stable wire name used in checkpoints and error records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TemplateIntake => "stage0a_template_intake",
            Self::SourceIntake => "stage0b_source_intake",
            Self::Extract => "stage1_extract",
            Self::Analyze => "stage2_analyze",
            Self::Outline => "stage3_outline",
            Self::Rearrange => "stage4_rearrange",
            Self::Inventory => "stage5_inventory",
            Self::Replacements => "stage6_replacements",
            Self::Finalize => "stage7_finalize",
        }
    }

    /// Returns the short code (`0A`, `0B`, `1` … `7`).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TemplateIntake => "0A",
            Self::SourceIntake => "0B",
            Self::Extract => "1",
            Self::Analyze => "2",
            Self::Outline => "3",
            Self::Rearrange => "4",
            Self::Inventory => "5",
            Self::Replacements => "6",
            Self::Finalize => "7",
        }
    }

    /// Returns a human readable label for progress messages.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::TemplateIntake => "Template Intake",
            Self::SourceIntake => "Source Intake",
            Self::Extract => "Extract",
            Self::Analyze => "Analyze",
            Self::Outline => "Outline",
            Self::Rearrange => "Rearrange",
            Self::Inventory => "Inventory",
            Self::Replacements => "Replacements",
            Self::Finalize => "Finalize",
        }
    }

    /// Returns the workspace subdirectory the stage writes into.
    #[must_use]
    pub const fn workspace_dir(&self) -> &'static str {
        match self {
            Self::TemplateIntake => "stage0-template-intake",
            Self::SourceIntake => "stage0-source-intake",
            Self::Extract => "stage1-extract",
            Self::Analyze => "stage2-analyze",
            Self::Outline => "stage3-outline",
            Self::Rearrange => "stage4-rearrange",
            Self::Inventory => "stage5-inventory",
            Self::Replacements => "stage6-replacement",
            Self::Finalize => "stage7-final",
        }
    }

    /// Returns the stage kind.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        match self {
            Self::Analyze | Self::Outline | Self::Replacements => StageKind::Generative,
            _ => StageKind::Script,
        }
    }

    /// Returns the declared prerequisites of the stage.
    #[must_use]
    pub const fn prerequisites(&self) -> &'static [Self] {
        match self {
            Self::TemplateIntake | Self::SourceIntake => &[],
            Self::Extract => &[Self::TemplateIntake],
            Self::Analyze => &[Self::Extract],
            Self::Outline => &[Self::SourceIntake, Self::Analyze],
            Self::Rearrange => &[Self::Outline],
            Self::Inventory => &[Self::Rearrange],
            Self::Replacements => &[Self::Outline, Self::Inventory],
            Self::Finalize => &[Self::Rearrange, Self::Replacements],
        }
    }

    /// Returns the position of the stage in priority order.
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Returns the stages that call an external generative service.
    #[must_use]
    pub fn generative() -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(|s| s.kind() == StageKind::Generative)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stage: '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageId {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|stage| {
                stage.as_str() == trimmed || stage.code().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_matches_ord() {
        let mut sorted = StageId::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, StageId::ALL.to_vec());
        assert_eq!(StageId::Finalize.index(), 8);
    }

    #[test]
    fn test_prerequisites_precede_in_order() {
        for stage in StageId::ALL {
            for dep in stage.prerequisites() {
                assert!(dep < &stage, "{dep} must precede {stage}");
            }
        }
    }

    #[test]
    fn test_diamond_prerequisites() {
        assert_eq!(
            StageId::Outline.prerequisites(),
            &[StageId::SourceIntake, StageId::Analyze]
        );
        assert_eq!(
            StageId::Finalize.prerequisites(),
            &[StageId::Rearrange, StageId::Replacements]
        );
        assert!(StageId::SourceIntake.prerequisites().is_empty());
    }

    #[test]
    fn test_parse_wire_name_and_code() {
        assert_eq!("stage2_analyze".parse::<StageId>(), Ok(StageId::Analyze));
        assert_eq!("0b".parse::<StageId>(), Ok(StageId::SourceIntake));
        assert_eq!(" 7 ".parse::<StageId>(), Ok(StageId::Finalize));
        assert!("stage9".parse::<StageId>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&StageId::TemplateIntake).unwrap();
        assert_eq!(json, r#""stage0a_template_intake""#);

        let parsed: StageId = serde_json::from_str(r#""0A""#).unwrap();
        assert_eq!(parsed, StageId::TemplateIntake);
    }

    #[test]
    fn test_generative_stages() {
        let llm: Vec<_> = StageId::generative().collect();
        assert_eq!(llm, vec![StageId::Analyze, StageId::Outline, StageId::Replacements]);
        assert_eq!(StageId::Finalize.kind().to_string(), "script");
    }
}
