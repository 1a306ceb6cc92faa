//! Static theme keyword table.
//!
//! Case-insensitive substring match of raw theme tokens against a closed
//! keyword list per category. The first matching keyword settles a
//! category; an event may land in several categories.

use pipeline_core::{ThemeCategory, THEME_COUNT};
use std::collections::BTreeSet;

const ENERGY: &[&str] = &[
    "OIL", "GAS", "ENERGY", "PETROL", "FUEL", "OPEC", "PIPELINE", "REFINER", "CRUDE",
];
const CONFLICT: &[&str] = &[
    "WAR", "CONFLICT", "MILITARY", "TERROR", "ARMED", "VIOLEN", "ATTACK", "INSURGEN",
];
const SANCTIONS: &[&str] = &["SANCTION", "EMBARGO", "BLOCKADE"];
const TRADE: &[&str] = &["TRADE", "TARIFF", "EXPORT", "IMPORT", "SHIPPING", "FREIGHT"];
const ECONOMY: &[&str] = &[
    "ECON", "INFLATION", "GDP", "RECESSION", "MARKET", "CURRENCY", "UNEMPLOY",
];
const POLICY: &[&str] = &[
    "POLICY", "GOVERN", "REGULAT", "LEGISLAT", "ELECTION", "TAX", "SUBSID",
];

pub fn keywords(category: ThemeCategory) -> &'static [&'static str] {
    match category {
        ThemeCategory::Energy => ENERGY,
        ThemeCategory::Conflict => CONFLICT,
        ThemeCategory::Sanctions => SANCTIONS,
        ThemeCategory::Trade => TRADE,
        ThemeCategory::Economy => ECONOMY,
        ThemeCategory::Policy => POLICY,
    }
}

/// Which categories an event's theme tokens touch. Tokens are already
/// upper-cased by the fetcher.
pub fn categorize(themes: &BTreeSet<String>) -> [bool; THEME_COUNT] {
    let mut hits = [false; THEME_COUNT];
    for category in ThemeCategory::ALL {
        'category: for keyword in keywords(category) {
            for token in themes {
                if token.contains(keyword) {
                    hits[category.index()] = true;
                    break 'category;
                }
            }
        }
    }
    hits
}
