//! Random coverage mask table used by the stochastic coverage pass.
//!
//! Each cell maps a (dither column, quantized alpha) pair to a bitmask with
//! one bit per multisample slot. The number of set bits averages
//! `alpha * sample_count` over a row, so rasterizing a fragment with the mask
//! as its sample coverage keeps roughly `alpha` of the pixel's samples.

use std::time::Instant;

use rand::prelude::*;

/// Cells are `u32`, one bit per sample.
pub const MAX_SAMPLES: u32 = 32;

/// Upper bound on `dither_table_size * (alpha_levels + 1)`.
pub const MAX_TABLE_CELLS: u64 = 1 << 26;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("sample count {0} is outside the supported range 1..={MAX_SAMPLES}")]
    SampleCount(u32),
    #[error("dither table size {0} is not a power of two")]
    TableSize(u32),
    #[error("alpha levels must be at least 1")]
    AlphaLevels,
    #[error("table of {width} x {rows} cells exceeds the limit of {MAX_TABLE_CELLS} cells")]
    TooLarge { width: u32, rows: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableParams {
    pub sample_count: u32,
    pub dither_table_size: u32,
    pub alpha_levels: u32,
    pub seed: u64,
}

impl Default for TableParams {
    fn default() -> Self {
        Self {
            sample_count: 8,
            dither_table_size: 2048,
            alpha_levels: 256,
            seed: 0,
        }
    }
}

impl TableParams {
    pub fn validate(&self) -> Result<(), TableError> {
        if self.sample_count == 0 || self.sample_count > MAX_SAMPLES {
            return Err(TableError::SampleCount(self.sample_count));
        }
        if !self.dither_table_size.is_power_of_two() {
            return Err(TableError::TableSize(self.dither_table_size));
        }
        if self.alpha_levels == 0 {
            return Err(TableError::AlphaLevels);
        }
        let rows = u64::from(self.alpha_levels) + 1;
        if u64::from(self.dither_table_size) * rows > MAX_TABLE_CELLS {
            return Err(TableError::TooLarge {
                width: self.dither_table_size,
                rows,
            });
        }
        Ok(())
    }
}

/// Mask with the low `sample_count` bits set.
pub fn full_mask(sample_count: u32) -> u32 {
    if sample_count >= 32 {
        u32::MAX
    } else {
        (1u32 << sample_count) - 1
    }
}

/// Immutable row-major table: `alpha_levels + 1` rows of
/// `dither_table_size` masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageMaskTable {
    params: TableParams,
    cells: Vec<u32>,
}

impl CoverageMaskTable {
    /// Builds the table from a generator seeded with `params.seed`.
    pub fn build(params: TableParams) -> Result<Self, TableError> {
        let mut rng = StdRng::seed_from_u64(params.seed);
        Self::build_with_rng(params, &mut rng)
    }

    /// Builds the table drawing from a caller-owned generator. `params.seed`
    /// is recorded but not used.
    pub fn build_with_rng<R>(params: TableParams, rng: &mut R) -> Result<Self, TableError>
    where
        R: Rng + ?Sized,
    {
        params.validate()?;
        let started = Instant::now();

        let width = params.dither_table_size as usize;
        let rows = params.alpha_levels as usize + 1;
        let mut cells = Vec::with_capacity(width * rows);
        let mut order = [0usize; MAX_SAMPLES as usize];
        let order = &mut order[..params.sample_count as usize];

        for level in 0..=params.alpha_levels {
            let expected = expected_bits(level, params.alpha_levels, params.sample_count);
            for _ in 0..width {
                cells.push(random_mask(expected, order, rng));
            }
        }

        tracing::debug!(
            sample_count = params.sample_count,
            width,
            rows,
            seed = params.seed,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "built coverage mask table"
        );

        Ok(Self { params, cells })
    }

    pub fn params(&self) -> &TableParams {
        &self.params
    }

    pub fn sample_count(&self) -> u32 {
        self.params.sample_count
    }

    pub fn width(&self) -> u32 {
        self.params.dither_table_size
    }

    pub fn height(&self) -> u32 {
        self.params.alpha_levels + 1
    }

    pub fn alpha_levels(&self) -> u32 {
        self.params.alpha_levels
    }

    /// Row-major cells, ready for upload as a `width x height` R32 texture.
    pub fn as_slice(&self) -> &[u32] {
        &self.cells
    }

    pub fn get(&self, column: u32, level: u32) -> Option<u32> {
        if column >= self.width() || level > self.params.alpha_levels {
            return None;
        }
        let index = level as usize * self.width() as usize + column as usize;
        self.cells.get(index).copied()
    }

    pub fn row(&self, level: u32) -> Option<&[u32]> {
        if level > self.params.alpha_levels {
            return None;
        }
        let width = self.width() as usize;
        let start = level as usize * width;
        self.cells.get(start..start + width)
    }

    /// Maps `alpha` in `[0, 1]` to the nearest row.
    pub fn quantize_alpha(&self, alpha: f32) -> u32 {
        quantize_alpha(alpha, self.params.alpha_levels)
    }

    /// Mask for an arbitrary dither index; the index wraps with the table
    /// width.
    pub fn lookup(&self, dither: u32, alpha: f32) -> u32 {
        let column = dither & (self.width() - 1);
        let level = self.quantize_alpha(alpha);
        self.cells[level as usize * self.width() as usize + column as usize]
    }
}

pub fn quantize_alpha(alpha: f32, alpha_levels: u32) -> u32 {
    let scaled = (alpha.clamp(0.0, 1.0) * alpha_levels as f32 + 0.5).floor();
    if scaled.is_nan() {
        return 0;
    }
    (scaled as u32).min(alpha_levels)
}

fn expected_bits(level: u32, alpha_levels: u32, sample_count: u32) -> f64 {
    f64::from(level) / f64::from(alpha_levels) * f64::from(sample_count)
}

fn random_mask<R>(expected: f64, order: &mut [usize], rng: &mut R) -> u32
where
    R: Rng + ?Sized,
{
    let samples = order.len();
    for (index, slot) in order.iter_mut().enumerate() {
        *slot = index;
    }

    // Two random positions per swap over the full range. Not a Fisher-Yates
    // shuffle; uniformity is measured by `CoverageStats`.
    for _ in 0..samples * 2 {
        let a = rng.gen_range(0..samples);
        let b = rng.gen_range(0..samples);
        order.swap(a, b);
    }

    let whole = expected.floor();
    let whole_bits = whole as usize;
    let mut mask = 0u32;
    for &sample in &order[..whole_bits.min(samples)] {
        mask |= 1u32 << sample;
    }

    let draw: f64 = rng.gen();
    if draw < expected - whole && whole_bits < samples {
        mask |= 1u32 << order[whole_bits];
    }
    mask
}

/// Wang's 32-bit integer hash.
pub fn wang_hash(mut seed: u32) -> u32 {
    seed = (seed ^ 61) ^ (seed >> 16);
    seed = seed.wrapping_mul(9);
    seed ^= seed >> 4;
    seed = seed.wrapping_mul(0x27d4_eb2d);
    seed ^= seed >> 15;
    seed
}

/// Dither index for a fragment. Mixing the surface and primitive keeps
/// overlapping surfaces at one pixel on different columns, so their masks are
/// drawn independently. The table lookup masks the result to its width.
pub fn dither_index(pixel_x: u32, pixel_y: u32, surface: u32, primitive: u32, offset: u32) -> u32 {
    let mut hash = wang_hash(surface.wrapping_mul(0x9e37_79b9) ^ primitive);
    hash = wang_hash(hash ^ pixel_x);
    hash = wang_hash(hash ^ pixel_y.wrapping_mul(0x85eb_ca6b));
    hash.wrapping_add(offset)
}

/// Per-row statistics of a built table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowStats {
    pub level: u32,
    pub expected_bits: f64,
    pub mean_bits: f64,
    /// Fraction of columns with each sample bit set.
    pub bit_frequency: Vec<f64>,
}

impl RowStats {
    /// Largest deviation of a single bit's frequency from the row average.
    pub fn bit_bias(&self) -> f64 {
        let samples = self.bit_frequency.len() as f64;
        let ideal = self.mean_bits / samples;
        self.bit_frequency
            .iter()
            .map(|freq| (freq - ideal).abs())
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageStats {
    pub rows: Vec<RowStats>,
}

impl CoverageStats {
    pub fn measure(table: &CoverageMaskTable) -> Self {
        let samples = table.sample_count();
        let width = f64::from(table.width());
        let rows = (0..=table.alpha_levels())
            .map(|level| {
                let row = table.row(level).unwrap_or(&[]);
                let mut counts = vec![0u64; samples as usize];
                let mut total_bits = 0u64;
                for &mask in row {
                    total_bits += u64::from(mask.count_ones());
                    for (bit, count) in counts.iter_mut().enumerate() {
                        if mask & (1u32 << bit) != 0 {
                            *count += 1;
                        }
                    }
                }
                RowStats {
                    level,
                    expected_bits: expected_bits(level, table.alpha_levels(), samples),
                    mean_bits: total_bits as f64 / width,
                    bit_frequency: counts.iter().map(|&c| c as f64 / width).collect(),
                }
            })
            .collect();
        Self { rows }
    }

    /// Largest |mean popcount - expected popcount| over all rows.
    pub fn max_mean_error(&self) -> f64 {
        self.rows
            .iter()
            .map(|row| (row.mean_bits - row.expected_bits).abs())
            .fold(0.0, f64::max)
    }

    pub fn max_bit_bias(&self) -> f64 {
        self.rows.iter().map(RowStats::bit_bias).fold(0.0, f64::max)
    }
}
