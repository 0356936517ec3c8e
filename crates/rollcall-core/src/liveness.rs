//! Single-frame anti-spoofing gate.
//!
//! Texture analysis: a flat photo or screen replay presents an unusually
//! smooth face crop, while a printed photo adds halftone noise. Both shift
//! the Canny edge-pixel density of the crop out of the band a live face
//! occupies. The verdict is advisory-but-blocking: matching still runs for
//! non-live faces, and the attendance layer is responsible for refusing to
//! auto-mark them.
//!
//! Blink and motion detection need state across frames and are declared
//! extension points only; in single-frame operation they always pass.

use crate::config::EngineConfig;
use image::GrayImage;
use imageproc::edges::canny;

const CANNY_LOW_THRESHOLD: f32 = 100.0;
const CANNY_HIGH_THRESHOLD: f32 = 200.0;

/// Texture-heuristic liveness gate. Cheap to construct; holds only the
/// configured thresholds.
#[derive(Debug, Clone)]
pub struct LivenessGate {
    enabled: bool,
    texture_analysis_enabled: bool,
    min_edge_density: f32,
    max_edge_density: f32,
}

impl LivenessGate {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            enabled: config.liveness_enabled,
            texture_analysis_enabled: config.texture_analysis_enabled,
            min_edge_density: config.min_edge_density,
            max_edge_density: config.max_edge_density,
        }
    }

    /// Decide whether a face crop looks live. A disabled gate always passes.
    pub fn check(&self, crop: &GrayImage) -> bool {
        if !self.enabled {
            return true;
        }

        if self.texture_analysis_enabled && !self.classify_density(edge_density(crop)) {
            return false;
        }

        // Blink and motion checks would go here once multi-frame state
        // exists; single-frame operation passes them unconditionally.
        true
    }

    /// Density band check. Boundaries are inclusive-live: a density exactly
    /// equal to either bound passes.
    fn classify_density(&self, density: f32) -> bool {
        density >= self.min_edge_density && density <= self.max_edge_density
    }
}

/// Fraction of edge pixels in the crop, in [0, 1]. Empty crops count as
/// zero density (maximally smooth).
pub fn edge_density(crop: &GrayImage) -> f32 {
    let (width, height) = crop.dimensions();
    let area = (width as usize) * (height as usize);
    if area == 0 {
        return 0.0;
    }

    let edges = canny(crop, CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD);
    let edge_pixels = edges.pixels().filter(|p| p[0] > 0).count();
    edge_pixels as f32 / area as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gate(min: f32, max: f32) -> LivenessGate {
        LivenessGate {
            enabled: true,
            texture_analysis_enabled: true,
            min_edge_density: min,
            max_edge_density: max,
        }
    }

    /// Vertical stripes alternating between two intensities, `period` pixels
    /// per stripe. Sharp transitions give a predictable mid-band density.
    fn striped_crop(size: u32, period: u32, low: u8, high: u8) -> GrayImage {
        GrayImage::from_fn(size, size, |x, _| {
            if (x / period) % 2 == 0 { Luma([low]) } else { Luma([high]) }
        })
    }

    #[test]
    fn test_boundary_inclusive_both_sides() {
        let gate = gate(0.05, 0.30);
        assert!(gate.classify_density(0.05), "lower bound is live");
        assert!(gate.classify_density(0.30), "upper bound is live");
        assert!(!gate.classify_density(0.049999));
        assert!(!gate.classify_density(0.300001));
        assert!(gate.classify_density(0.15));
    }

    #[test]
    fn test_flat_crop_rejected() {
        // A uniform crop has zero edges — the flat-photo signature.
        let crop = GrayImage::from_pixel(64, 64, Luma([120u8]));
        assert_eq!(edge_density(&crop), 0.0);
        assert!(!gate(0.05, 0.30).check(&crop));
    }

    #[test]
    fn test_textured_crop_passes() {
        let crop = striped_crop(64, 8, 100, 255);
        let density = edge_density(&crop);
        assert!(
            density > 0.05 && density < 0.30,
            "stripe density out of band: {density}"
        );
        assert!(gate(0.05, 0.30).check(&crop));
    }

    #[test]
    fn test_over_textured_crop_rejected() {
        let crop = striped_crop(64, 8, 100, 255);
        // Same texture under a tighter band reads as print noise.
        assert!(!gate(0.001, 0.01).check(&crop));
    }

    #[test]
    fn test_disabled_gate_always_passes() {
        let mut disabled = gate(0.05, 0.30);
        disabled.enabled = false;
        let flat = GrayImage::from_pixel(32, 32, Luma([0u8]));
        assert!(disabled.check(&flat));
    }

    #[test]
    fn test_texture_analysis_off_passes() {
        let mut no_texture = gate(0.05, 0.30);
        no_texture.texture_analysis_enabled = false;
        let flat = GrayImage::from_pixel(32, 32, Luma([0u8]));
        assert!(no_texture.check(&flat));
    }

    #[test]
    fn test_empty_crop_counts_as_smooth() {
        let crop = GrayImage::new(0, 0);
        assert_eq!(edge_density(&crop), 0.0);
    }
}
