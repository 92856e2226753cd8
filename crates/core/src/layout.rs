//! Output layouts and their pixel dimensions.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Aspect of the generated image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Square,
    Portrait,
    Landscape,
}

impl Layout {
    /// Parse from the database `layout` column or a request field.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "square" => Ok(Self::Square),
            "portrait" => Ok(Self::Portrait),
            "landscape" => Ok(Self::Landscape),
            other => Err(CoreError::Validation(format!(
                "Unknown layout '{other}'. Must be one of: square, portrait, landscape"
            ))),
        }
    }

    /// Database name value.
    pub fn name(self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Portrait => "portrait",
            Self::Landscape => "landscape",
        }
    }

    /// `(width, height)` of the latent image, in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Square => (1024, 1024),
            Self::Portrait => (832, 1216),
            Self::Landscape => (1216, 832),
        }
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
