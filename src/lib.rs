use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod diagram;
pub mod error;
pub mod graph;
pub mod layout;
pub mod registry;
pub mod svg;
pub mod template;
pub mod utils;
pub mod workspace;

#[cfg(feature = "server")]
pub mod database;
#[cfg(feature = "server")]
pub mod serve;
#[cfg(feature = "server")]
pub mod store;

pub use diagram::*;
pub use error::{Error, Result};
pub use graph::*;
pub use layout::*;
pub use registry::*;
pub use svg::render_svg;
pub use template::*;
pub use workspace::*;

pub const NODE_WIDTH: f32 = 172.0;
pub const NODE_HEIGHT: f32 = 56.0;
pub const RANK_GAP: f32 = 64.0;
pub const NODE_GAP: f32 = 40.0;
pub const LAYOUT_MARGIN: f32 = 40.0;
pub const GRID_COLUMNS: usize = 4;
pub const DEFAULT_BARYCENTER_PASSES: usize = 6;

pub const UNBOUND_LABEL: &str = "None";
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CanvasSize {
    pub width: f32,
    pub height: f32,
}

/// Direction used when laying out a template or diagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutDirection {
    #[default]
    #[serde(alias = "TB", alias = "TD", alias = "top-bottom")]
    TopDown,
    #[serde(alias = "LR")]
    LeftRight,
    Grid,
}

impl LayoutDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutDirection::TopDown => "top-down",
            LayoutDirection::LeftRight => "left-right",
            LayoutDirection::Grid => "grid",
        }
    }
}

impl fmt::Display for LayoutDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutDirection {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "top-down" | "topdown" | "tb" | "td" | "top-bottom" => Ok(LayoutDirection::TopDown),
            "left-right" | "leftright" | "lr" => Ok(LayoutDirection::LeftRight),
            "grid" => Ok(LayoutDirection::Grid),
            other => Err(Error::Validation(format!(
                "unsupported layout direction '{other}'; expected top-down, left-right or grid"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_accepts_short_and_long_forms() {
        assert_eq!("TB".parse::<LayoutDirection>().unwrap(), LayoutDirection::TopDown);
        assert_eq!("left-right".parse::<LayoutDirection>().unwrap(), LayoutDirection::LeftRight);
        assert_eq!("Grid".parse::<LayoutDirection>().unwrap(), LayoutDirection::Grid);
        assert!("diagonal".parse::<LayoutDirection>().is_err());
    }

    #[test]
    fn direction_serde_uses_kebab_case_and_aliases() {
        let encoded = serde_json::to_string(&LayoutDirection::LeftRight).unwrap();
        assert_eq!(encoded, "\"left-right\"");
        let decoded: LayoutDirection = serde_json::from_str("\"LR\"").unwrap();
        assert_eq!(decoded, LayoutDirection::LeftRight);
    }
}
