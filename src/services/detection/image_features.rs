// Image Feature Extraction
// Pixel statistics over a sampled raster. Every statistic is normalized to [0, 1],
// higher reads as more machine-like, and falls back to a neutral value on rasters
// too small to analyze.

use crate::models::{FeatureVector, ImagePayload, PixelSource, RasterSample};
use image::{imageops::FilterType, DynamicImage};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::error::DetectionError;
use super::stats::{clamp01, mean, shannon_entropy, variance};

/// Rasters are decoded no larger than this on either side.
pub const MAX_DECODE_DIM: u32 = 512;
/// Below this on either side pixel statistics return neutral values.
pub const MIN_ANALYZABLE_DIM: u32 = 16;

const NEUTRAL: f64 = 0.5;

pub const COLOR_VARIANCE: &str = "color_variance";
pub const COLOR_UNIFORMITY: &str = "color_uniformity";
pub const EDGE_SOFTNESS: &str = "edge_softness";
pub const LOW_FREQUENCY_RATIO: &str = "low_frequency_ratio";
pub const TEXTURE_UNIFORMITY: &str = "texture_uniformity";
pub const FREQUENCY_UNIFORMITY: &str = "frequency_uniformity";
pub const EDGE_CONSISTENCY: &str = "edge_consistency";
pub const LBP_TEXTURE: &str = "lbp_texture";
pub const LAB_COLOR_UNIFORMITY: &str = "lab_color_uniformity";
pub const BLOCK_UNIFORMITY: &str = "block_uniformity";
pub const HISTOGRAM_ENTROPY: &str = "histogram_entropy";
pub const GRADIENT_SMOOTHNESS: &str = "gradient_smoothness";
pub const ARTIFACTS: &str = "artifacts";
pub const MULTI_SCALE: &str = "multi_scale";
pub const TEXTURE_SMOOTHNESS: &str = "texture_smoothness";
pub const NOISE_LEVEL: &str = "noise_level";

/// Decode an encoded image and downscale it for analysis
pub fn decode_raster(bytes: &[u8]) -> Result<RasterSample, DetectionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| DetectionError::ExtractionUnavailable(format!("decode failed: {}", e)))?;
    raster_from_image(&img)
}

pub fn raster_from_image(img: &DynamicImage) -> Result<RasterSample, DetectionError> {
    let resized = if img.width() > MAX_DECODE_DIM || img.height() > MAX_DECODE_DIM {
        img.resize(MAX_DECODE_DIM, MAX_DECODE_DIM, FilterType::Triangle)
    } else {
        img.clone()
    };
    let rgba = resized.to_rgba8();
    let (width, height) = rgba.dimensions();
    RasterSample::new(width, height, rgba.into_raw())
        .ok_or_else(|| DetectionError::ExtractionUnavailable("raster size mismatch".to_string()))
}

/// Borrow the raster of an image payload, or explain why pixel analysis is unavailable.
pub fn require_pixels(payload: &ImagePayload) -> Result<&RasterSample, DetectionError> {
    match &payload.pixels {
        PixelSource::Available(sample) if sample.is_well_formed() => Ok(sample),
        PixelSource::Available(sample) => Err(DetectionError::MalformedInput(format!(
            "raster {}x{} carries {} bytes",
            sample.width,
            sample.height,
            sample.rgba.len()
        ))),
        PixelSource::Denied => Err(DetectionError::PixelAccessDenied),
        PixelSource::NotLoaded => Err(DetectionError::ExtractionUnavailable(
            "pixels not loaded".to_string(),
        )),
    }
}

pub fn is_analyzable(sample: &RasterSample) -> bool {
    sample.width >= MIN_ANALYZABLE_DIM && sample.height >= MIN_ANALYZABLE_DIM
}

/// Sampling stride that keeps roughly `target` samples regardless of raster area.
pub fn adaptive_stride(sample: &RasterSample, target: usize) -> u32 {
    let area = sample.pixel_count().max(1);
    let target = target.max(1);
    let step = ((area as f64 / target as f64).sqrt()).floor() as u32;
    step.max(1)
}

// ============ Quick statistics ============

pub fn extract_quick(sample: &RasterSample) -> FeatureVector {
    let mut fv = FeatureVector::new();
    fv.insert(COLOR_VARIANCE, color_variance(sample));
    fv.insert(COLOR_UNIFORMITY, color_uniformity(sample));
    fv.insert(EDGE_SOFTNESS, edge_softness(sample));
    fv.insert(LOW_FREQUENCY_RATIO, low_frequency_ratio(sample));
    fv.insert(TEXTURE_UNIFORMITY, texture_uniformity(sample));
    fv
}

/// Mean per-channel variance, inverted against 10000.
pub fn color_variance(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let stride = adaptive_stride(sample, 20_000);
    let mut channels: [Vec<f64>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for y in (0..sample.height).step_by(stride as usize) {
        for x in (0..sample.width).step_by(stride as usize) {
            let px = sample.rgb(x, y);
            for (c, values) in channels.iter_mut().enumerate() {
                values.push(px[c] as f64);
            }
        }
    }
    let avg = channels.iter().map(|c| variance(c)).sum::<f64>() / 3.0;
    clamp01(1.0 - (avg / 10_000.0).min(1.0))
}

/// Distinct colors after quantizing to 8 levels per channel, relative to sample count.
pub fn color_uniformity(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let stride = adaptive_stride(sample, 10_000);
    let mut colors: HashSet<(u8, u8, u8)> = HashSet::new();
    let mut samples = 0usize;
    for y in (0..sample.height).step_by(stride as usize) {
        for x in (0..sample.width).step_by(stride as usize) {
            let [r, g, b] = sample.rgb(x, y);
            colors.insert((r / 32, g / 32, b / 32));
            samples += 1;
        }
    }
    if samples == 0 {
        return NEUTRAL;
    }
    clamp01(1.0 - colors.len() as f64 / samples as f64)
}

/// Mean gradient strength on a coarse grid, inverted so soft edges score high.
pub fn edge_softness(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let mut strengths = Vec::new();
    for y in (1..sample.height - 1).step_by(4) {
        for x in (1..sample.width - 1).step_by(4) {
            let gx = (sample.gray(x - 1, y) - sample.gray(x + 1, y)).abs();
            let gy = (sample.gray(x, y - 1) - sample.gray(x, y + 1)).abs();
            strengths.push((gx * gx + gy * gy).sqrt());
        }
    }
    if strengths.is_empty() {
        return NEUTRAL;
    }
    clamp01(1.0 - (mean(&strengths) / 50.0).min(1.0))
}

/// Energy split inside 8x8 blocks between the center and the periphery.
pub fn low_frequency_ratio(sample: &RasterSample) -> f64 {
    const BLOCK: u32 = 8;
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let mut high = 0.0;
    let mut low = 0.0;
    let mut by = 0;
    while by + BLOCK < sample.height {
        let mut bx = 0;
        while bx + BLOCK < sample.width {
            for y in 0..BLOCK {
                for x in 0..BLOCK {
                    let brightness = sample.gray(bx + x, by + y);
                    let dist = (x as i32 - (BLOCK / 2) as i32).abs() + (y as i32 - (BLOCK / 2) as i32).abs();
                    if dist > (BLOCK / 2) as i32 {
                        high += brightness;
                    } else {
                        low += brightness;
                    }
                }
            }
            bx += BLOCK;
        }
        by += BLOCK;
    }
    if high + low == 0.0 {
        return NEUTRAL;
    }
    clamp01(1.0 - high / (high + low))
}

/// Variance of 3x3 local variances, inverted against 1000.
pub fn texture_uniformity(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let locals = local_variances(sample, 1_000);
    if locals.is_empty() {
        return NEUTRAL;
    }
    clamp01(1.0 - variance(&locals) / 1_000.0)
}

fn local_variances(sample: &RasterSample, target: usize) -> Vec<f64> {
    let stride = adaptive_stride(sample, target);
    let mut out = Vec::new();
    for y in (1..sample.height - 1).step_by(stride as usize) {
        for x in (1..sample.width - 1).step_by(stride as usize) {
            let mut neighborhood = [0.0f64; 9];
            let mut i = 0;
            for dy in 0..3 {
                for dx in 0..3 {
                    neighborhood[i] = sample.gray(x + dx - 1, y + dy - 1);
                    i += 1;
                }
            }
            out.push(variance(&neighborhood));
        }
    }
    out
}

// ============ Refined statistics ============

pub fn extract_refined(sample: &RasterSample) -> FeatureVector {
    let mut fv = extract_quick(sample);
    for group in REFINED_GROUPS {
        for (name, value) in group(sample) {
            fv.insert(name, value);
        }
    }
    fv
}

/// Same result as [`extract_refined`], yielding to the scheduler between feature groups
/// so a large batch of images does not starve the host.
pub async fn extract_refined_chunked(sample: &RasterSample) -> FeatureVector {
    let mut fv = extract_quick(sample);
    tokio::task::yield_now().await;
    for group in REFINED_GROUPS {
        for (name, value) in group(sample) {
            fv.insert(name, value);
        }
        tokio::task::yield_now().await;
    }
    debug!(
        width = sample.width,
        height = sample.height,
        features = fv.len(),
        "[IMAGE] refined features extracted"
    );
    fv
}

type FeatureGroup = fn(&RasterSample) -> Vec<(&'static str, f64)>;

const REFINED_GROUPS: &[FeatureGroup] = &[
    |s| vec![(FREQUENCY_UNIFORMITY, frequency_uniformity(s)), (MULTI_SCALE, multi_scale(s))],
    |s| vec![(EDGE_CONSISTENCY, edge_consistency(s)), (GRADIENT_SMOOTHNESS, gradient_smoothness(s))],
    |s| vec![(LBP_TEXTURE, lbp_texture(s)), (TEXTURE_SMOOTHNESS, texture_smoothness(s)), (NOISE_LEVEL, noise_level(s))],
    |s| vec![(LAB_COLOR_UNIFORMITY, lab_color_uniformity(s)), (HISTOGRAM_ENTROPY, histogram_entropy(s))],
    |s| vec![(BLOCK_UNIFORMITY, block_uniformity(s)), (ARTIFACTS, artifacts(s))],
];

/// Frequency-domain proxy: brightness variance over a coarse grid, inverted.
pub fn frequency_uniformity(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let grid = ((sample.pixel_count() as f64).sqrt() / 8.0).floor().clamp(1.0, 64.0) as u32;
    let step_x = (sample.width / grid).max(1);
    let step_y = (sample.height / grid).max(1);
    let mut values = Vec::new();
    for y in (0..sample.height).step_by(step_y as usize) {
        for x in (0..sample.width).step_by(step_x as usize) {
            values.push(sample.gray(x, y));
        }
    }
    clamp01(1.0 - (variance(&values) / 1_000.0).min(1.0))
}

fn sobel(sample: &RasterSample, x: u32, y: u32) -> f64 {
    let g = |dx: i32, dy: i32| sample.gray((x as i32 + dx) as u32, (y as i32 + dy) as u32);
    let gx = -g(-1, -1) + g(1, -1) - 2.0 * g(-1, 0) + 2.0 * g(1, 0) - g(-1, 1) + g(1, 1);
    let gy = -g(-1, -1) - 2.0 * g(0, -1) - g(1, -1) + g(-1, 1) + 2.0 * g(0, 1) + g(1, 1);
    (gx * gx + gy * gy).sqrt()
}

fn interior_grid(sample: &RasterSample, divisor: u32) -> Vec<(u32, u32)> {
    let step = (sample.width.min(sample.height) / divisor).max(2);
    let mut out = Vec::new();
    let mut y = step;
    while y + step < sample.height {
        let mut x = step;
        while x + step < sample.width {
            out.push((x, y));
            x += step;
        }
        y += step;
    }
    out
}

/// Sobel magnitudes above a floor; consistent strength scores high.
pub fn edge_consistency(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let edges: Vec<f64> = interior_grid(sample, 50)
        .into_iter()
        .map(|(x, y)| sobel(sample, x, y))
        .filter(|m| *m > 20.0)
        .collect();
    if edges.is_empty() {
        return NEUTRAL;
    }
    let m = mean(&edges);
    clamp01(1.0 - (variance(&edges) / (m * m + 1.0)).min(1.0))
}

/// Entropy of the local binary pattern histogram, inverted.
pub fn lbp_texture(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    const RING: [(i32, i32); 8] = [(-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0)];
    let mut histogram = [0usize; 256];
    let mut total = 0usize;
    for (x, y) in interior_grid(sample, 24) {
        let center = sample.gray(x, y);
        let mut code = 0u8;
        for (bit, (dx, dy)) in RING.iter().enumerate() {
            let n = sample.gray((x as i32 + dx) as u32, (y as i32 + dy) as u32);
            if n >= center {
                code |= 1 << bit;
            }
        }
        histogram[code as usize] += 1;
        total += 1;
    }
    if total == 0 {
        return NEUTRAL;
    }
    clamp01(1.0 - shannon_entropy(histogram) / 8.0)
}

fn rgb_to_lab(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let x = 0.4124564 * r + 0.3575761 * g + 0.1804375 * b;
    let y = 0.2126729 * r + 0.7151522 * g + 0.0721750 * b;
    let z = 0.0193339 * r + 0.1191920 * g + 0.9503041 * b;
    let f = |t: f64| if t > 0.008856 { t.cbrt() } else { 7.787 * t + 16.0 / 116.0 };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

/// Chroma spread in LAB space, inverted.
pub fn lab_color_uniformity(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let step = (sample.width.min(sample.height) / 40).max(2);
    let mut a_values = Vec::new();
    let mut b_values = Vec::new();
    for y in (0..sample.height).step_by(step as usize) {
        for x in (0..sample.width).step_by(step as usize) {
            let [r, g, b] = sample.rgb(x, y);
            let (_, a, bb) = rgb_to_lab(r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
            a_values.push(a);
            b_values.push(bb);
        }
    }
    if a_values.is_empty() {
        return NEUTRAL;
    }
    clamp01(1.0 - ((variance(&a_values) + variance(&b_values)) / 200.0).min(1.0))
}

/// Variance of block mean brightness, inverted.
pub fn block_uniformity(sample: &RasterSample) -> f64 {
    let block = (sample.width.min(sample.height) / 8).clamp(16, 32);
    let blocks_x = sample.width / block;
    let blocks_y = sample.height / block;
    if blocks_x < 2 || blocks_y < 2 {
        return NEUTRAL;
    }
    let mut means = Vec::with_capacity((blocks_x * blocks_y) as usize);
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let mut sum = 0.0;
            let mut count = 0usize;
            for y in by * block..(by + 1) * block {
                for x in bx * block..(bx + 1) * block {
                    sum += sample.gray(x, y);
                    count += 1;
                }
            }
            means.push(sum / count.max(1) as f64);
        }
    }
    clamp01(1.0 - variance(&means) / 1_000.0)
}

/// Mean per-channel histogram entropy, inverted against 8 bits.
pub fn histogram_entropy(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let step = (sample.width.min(sample.height) / 80).max(1);
    let mut hist = [[0usize; 256]; 3];
    for y in (0..sample.height).step_by(step as usize) {
        for x in (0..sample.width).step_by(step as usize) {
            let px = sample.rgb(x, y);
            for c in 0..3 {
                hist[c][px[c] as usize] += 1;
            }
        }
    }
    let avg = hist.iter().map(|h| shannon_entropy(h.iter().copied())).sum::<f64>() / 3.0;
    clamp01(1.0 - avg / 8.0)
}

/// Central-difference gradient magnitude spread, inverted.
pub fn gradient_smoothness(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let gradients: Vec<f64> = interior_grid(sample, 40)
        .into_iter()
        .map(|(x, y)| {
            let gx = sample.gray(x + 1, y) - sample.gray(x - 1, y);
            let gy = sample.gray(x, y + 1) - sample.gray(x, y - 1);
            (gx * gx + gy * gy).sqrt()
        })
        .collect();
    if gradients.is_empty() {
        return NEUTRAL;
    }
    let m = mean(&gradients);
    clamp01(1.0 - variance(&gradients) / (m * m + 100.0))
}

/// Checkerboard coincidences plus repeated 16px tiles.
pub fn artifacts(sample: &RasterSample) -> f64 {
    const CHECK: u32 = 8;
    const MAX_CHECKS: usize = 100;
    const TILE: u32 = 16;
    if !is_analyzable(sample) {
        return NEUTRAL;
    }

    let mut hits = 0usize;
    let mut checks = 0usize;
    let mut y = 0;
    'outer: while y + CHECK < sample.height {
        let mut x = 0;
        while x + CHECK < sample.width {
            if checks >= MAX_CHECKS {
                break 'outer;
            }
            if (sample.gray(x, y) - sample.gray(x + CHECK, y + CHECK)).abs() < 5.0 {
                hits += 1;
            }
            checks += 1;
            x += CHECK * 2;
        }
        y += CHECK * 2;
    }
    let checkerboard = if checks > 0 {
        (hits as f64 * 0.5 / checks as f64) * 0.5
    } else {
        0.0
    };

    // Coarse tile signature: 4x4 grid of quantized brightness.
    let mut tiles: HashMap<[u8; 16], usize> = HashMap::new();
    let mut tile_count = 0usize;
    let mut ty = 0;
    while ty + TILE <= sample.height {
        let mut tx = 0;
        while tx + TILE <= sample.width {
            let mut sig = [0u8; 16];
            for (i, cell) in sig.iter_mut().enumerate() {
                let cx = tx + (i as u32 % 4) * 4 + 2;
                let cy = ty + (i as u32 / 4) * 4 + 2;
                *cell = (sample.gray(cx, cy) / 16.0) as u8;
            }
            *tiles.entry(sig).or_insert(0) += 1;
            tile_count += 1;
            tx += TILE;
        }
        ty += TILE;
    }
    let repeated = tiles.values().filter(|&&c| c > 1).map(|&c| c - 1).sum::<usize>();
    let repetition = if tile_count > 1 {
        repeated as f64 / (tile_count - 1) as f64
    } else {
        0.0
    };

    clamp01(checkerboard + repetition * 0.5)
}

/// Brightness variance at full and half resolution, inverted and averaged.
pub fn multi_scale(sample: &RasterSample) -> f64 {
    let mut scores = Vec::new();
    for step in [1u32, 2] {
        if sample.width / step < 10 || sample.height / step < 10 {
            continue;
        }
        let stride = step.max(adaptive_stride(sample, 20_000));
        let mut values = Vec::new();
        for y in (0..sample.height).step_by(stride as usize) {
            for x in (0..sample.width).step_by(stride as usize) {
                values.push(sample.gray(x, y));
            }
        }
        scores.push(1.0 - (variance(&values) / 1_000.0).min(1.0));
    }
    if scores.is_empty() {
        return NEUTRAL;
    }
    clamp01(mean(&scores))
}

/// Mean absolute difference between horizontal neighbours, inverted.
pub fn texture_smoothness(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let stride = adaptive_stride(sample, 10_000);
    let mut diffs = Vec::new();
    for y in (0..sample.height).step_by(stride as usize) {
        for x in (0..sample.width - 1).step_by(stride as usize) {
            diffs.push((sample.gray(x, y) - sample.gray(x + 1, y)).abs());
        }
    }
    clamp01(1.0 - (mean(&diffs) / 32.0).min(1.0))
}

/// Mean 3x3 local variance, inverted. Clean, noise-free renders score high.
pub fn noise_level(sample: &RasterSample) -> f64 {
    if !is_analyzable(sample) {
        return NEUTRAL;
    }
    let locals = local_variances(sample, 2_000);
    if locals.is_empty() {
        return NEUTRAL;
    }
    clamp01(1.0 - (mean(&locals) / 200.0).min(1.0))
}


#[cfg(test)]
mod tests {
    use super::fixtures::{flat, noisy};
    use super::*;
    use crate::models::ImagePayload;

    #[test]
    fn test_tiny_raster_is_neutral() {
        let tiny = flat(4, 4, [10, 20, 30]);
        let fv = extract_refined(&tiny);
        for (name, value) in fv.iter() {
            assert_eq!(value, NEUTRAL, "{} should be neutral on tiny input", name);
        }
    }

    #[test]
    fn test_flat_image_reads_more_synthetic_than_noise() {
        let smooth = flat(64, 64, [120, 140, 160]);
        let rough = noisy(64, 64, 7);
        assert!(color_uniformity(&smooth) > color_uniformity(&rough));
        assert!(edge_softness(&smooth) > edge_softness(&rough));
        assert!(texture_smoothness(&smooth) > texture_smoothness(&rough));
        assert!(noise_level(&smooth) > noise_level(&rough));
    }

    #[test]
    fn test_all_refined_features_in_range() {
        let fv = extract_refined(&noisy(96, 80, 3));
        assert_eq!(fv.len(), 16);
        for (name, value) in fv.iter() {
            assert!((0.0..=1.0).contains(&value), "{} out of range: {}", name, value);
        }
    }

    #[tokio::test]
    async fn test_chunked_matches_blocking() {
        let sample = noisy(64, 48, 11);
        assert_eq!(extract_refined_chunked(&sample).await, extract_refined(&sample));
    }

    #[test]
    fn test_require_pixels_signals_denied() {
        let mut payload = ImagePayload::new("https://cdn.example.com/a.png");
        payload.pixels = PixelSource::Denied;
        assert!(matches!(require_pixels(&payload), Err(DetectionError::PixelAccessDenied)));
        payload.pixels = PixelSource::NotLoaded;
        assert!(matches!(
            require_pixels(&payload),
            Err(DetectionError::ExtractionUnavailable(_))
        ));
    }

    #[test]
    fn test_require_pixels_rejects_truncated_raster() {
        let mut sample = noisy(32, 32, 3);
        sample.rgba.truncate(100);
        let mut payload = ImagePayload::new("https://cdn.example.com/a.png");
        payload.pixels = PixelSource::Available(sample);
        assert!(matches!(require_pixels(&payload), Err(DetectionError::MalformedInput(_))));
    }

    #[test]
    fn test_raster_from_image_downscales() {
        let img = DynamicImage::new_rgba8(1024, 256);
        let sample = raster_from_image(&img).unwrap();
        assert_eq!(sample.width, 512);
        assert_eq!(sample.height, 128);
    }
}
