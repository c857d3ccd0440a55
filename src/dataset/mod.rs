//! Dataset module for MVTec AD
//!
//! This module provides:
//! - The fixed set of MVTec AD categories and category-list validation
//! - Sample discovery for the `train` and `test` splits with ground-truth masks
//! - Burn `Dataset`/`Batcher` integration used by the exporter
//!
//! ## Layout
//!
//! ```text
//! <root>/<category>/
//! ├── train/good/*.png
//! ├── test/<defect>/*.png
//! └── ground_truth/<defect>/<stem>_mask.png
//! ```

pub mod burn_dataset;
pub mod mvtec;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::{AnomalyError, Result};

pub use burn_dataset::{MvtecBatch, MvtecBatcher, MvtecBurnDataset, MvtecItem};
pub use mvtec::{DatasetSample, Label, MvtecDataset, Split};

/// The 15 MVTec AD object and texture categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bottle,
    Cable,
    Capsule,
    Carpet,
    Grid,
    Hazelnut,
    Leather,
    MetalNut,
    Pill,
    Screw,
    Tile,
    Toothbrush,
    Transistor,
    Wood,
    Zipper,
}

impl Category {
    /// All categories in menu order
    pub const ALL: [Category; 15] = [
        Category::Bottle,
        Category::Cable,
        Category::Capsule,
        Category::Carpet,
        Category::Grid,
        Category::Hazelnut,
        Category::Leather,
        Category::MetalNut,
        Category::Pill,
        Category::Screw,
        Category::Tile,
        Category::Toothbrush,
        Category::Transistor,
        Category::Wood,
        Category::Zipper,
    ];

    /// Directory name under the dataset root
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bottle => "bottle",
            Category::Cable => "cable",
            Category::Capsule => "capsule",
            Category::Carpet => "carpet",
            Category::Grid => "grid",
            Category::Hazelnut => "hazelnut",
            Category::Leather => "leather",
            Category::MetalNut => "metal_nut",
            Category::Pill => "pill",
            Category::Screw => "screw",
            Category::Tile => "tile",
            Category::Toothbrush => "toothbrush",
            Category::Transistor => "transistor",
            Category::Wood => "wood",
            Category::Zipper => "zipper",
        }
    }

    /// 1-based position in the demo menu
    pub fn menu_index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|c| c == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Category for a 1-based menu number
    pub fn from_menu_index(index: usize) -> Option<Category> {
        index.checked_sub(1).and_then(|i| Self::ALL.get(i).copied())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = AnomalyError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .find(|c| c.as_str() == name)
            .copied()
            .ok_or_else(|| AnomalyError::UnknownCategories(vec![s.to_string()]))
    }
}

/// Validate a list of category names.
///
/// Valid names keep their order and duplicates collapse to the first
/// occurrence. Any unknown name fails the whole call, listing every
/// rejected name.
pub fn parse_categories<S: AsRef<str>>(names: &[S]) -> Result<Vec<Category>> {
    let mut categories = Vec::with_capacity(names.len());
    let mut unknown = Vec::new();

    for name in names {
        match name.as_ref().parse::<Category>() {
            Ok(category) => {
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
            Err(_) => unknown.push(name.as_ref().to_string()),
        }
    }

    if !unknown.is_empty() {
        return Err(AnomalyError::UnknownCategories(unknown));
    }
    Ok(categories)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert_eq!("Metal_Nut".parse::<Category>().unwrap(), Category::MetalNut);
    }

    #[test]
    fn test_menu_index() {
        assert_eq!(Category::Bottle.menu_index(), 1);
        assert_eq!(Category::Zipper.menu_index(), 15);
        assert_eq!(Category::from_menu_index(8), Some(Category::MetalNut));
        assert_eq!(Category::from_menu_index(0), None);
        assert_eq!(Category::from_menu_index(16), None);
    }

    #[test]
    fn test_parse_categories_keeps_order() {
        let parsed = parse_categories(&["wood", "bottle", "wood", "pill"]).unwrap();
        assert_eq!(parsed, vec![Category::Wood, Category::Bottle, Category::Pill]);
    }

    #[test]
    fn test_parse_categories_rejects_unknown() {
        let err = parse_categories(&["bottle", "bottel", "wod"]).unwrap_err();
        match err {
            AnomalyError::UnknownCategories(names) => {
                assert_eq!(names, vec!["bottel".to_string(), "wod".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_serde_names_match_directories() {
        let json = serde_json::to_string(&Category::MetalNut).unwrap();
        assert_eq!(json, "\"metal_nut\"");
    }
}
