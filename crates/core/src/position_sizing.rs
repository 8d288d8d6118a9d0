use serde::{Deserialize, Serialize};

use crate::config::{BandMultiplier, SizingConfig};
use crate::kelly::KellySizer;
use crate::position::Band;

/// How a position size was derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeBreakdown {
    /// Clamped Kelly fraction
    pub kelly: f64,
    /// `1 + 2 * edge`, clamped; 1.0 without an oracle edge
    pub edge_multiplier: f64,
    pub band_multiplier: f64,
    /// `kelly * edge_multiplier * band_multiplier`
    pub size: f64,
}

/// Maps a scoring edge to a size multiplier: `clamp(1 + edge * 2, min, max)`.
#[must_use]
pub fn edge_multiplier(edge: f64, min: f64, max: f64) -> f64 {
    (1.0 + edge * 2.0).clamp(min, max)
}

/// Looks up the size multiplier for a band.
///
/// Bands missing from the table take the multiplier of the nearest listed
/// band, so the table stays monotonic for any configured band set.
#[must_use]
pub fn band_multiplier(table: &[BandMultiplier], band: Band) -> f64 {
    table
        .iter()
        .min_by_key(|entry| (entry.band.abs_diff(band), entry.band))
        .map_or(1.0, |entry| entry.multiplier)
}

/// Nearest configured band to a DTE; ties resolve to the smaller band.
#[must_use]
pub fn nearest_band(bands: &[Band], days_to_expiry: u32) -> Option<Band> {
    bands
        .iter()
        .copied()
        .min_by_key(|&band| (band.abs_diff(days_to_expiry), band))
}

/// Sizes a position from confidence, optional oracle edge and band.
///
/// # Arguments
/// * `max_risk` - Upper clamp for the Kelly fraction
/// * `confidence` - Win probability, already validated to (0, 1]
/// * `edge` - Oracle edge, when one is available
/// * `band` - Band the position is sized for
#[must_use]
pub fn compute_size(
    sizing: &SizingConfig,
    max_risk: f64,
    confidence: f64,
    edge: Option<f64>,
    band: Band,
) -> SizeBreakdown {
    let sizer = KellySizer::new(sizing.avg_win, sizing.avg_loss, sizing.min_size, max_risk);
    let kelly = sizer.fraction(confidence);
    let edge_mult = edge.map_or(1.0, |e| {
        edge_multiplier(e, sizing.edge_multiplier_min, sizing.edge_multiplier_max)
    });
    let band_mult = band_multiplier(&sizing.band_multipliers, band);

    SizeBreakdown {
        kelly,
        edge_multiplier: edge_mult,
        band_multiplier: band_mult,
        size: kelly * edge_mult * band_mult,
    }
}
