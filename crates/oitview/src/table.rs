use std::fmt::Write as _;
use std::time::Instant;

use anyhow::{Context, Result};
use maskgen::{CoverageMaskTable, CoverageStats, RowStats, TableParams};

/// Builds the table for `params` and renders its statistics as text.
pub fn report(params: TableParams, all_rows: bool) -> Result<String> {
    let started = Instant::now();
    let table = CoverageMaskTable::build(params).context("failed to build coverage mask table")?;
    let elapsed = started.elapsed();
    let stats = CoverageStats::measure(&table);

    let mut out = String::new();
    writeln!(
        out,
        "coverage mask table: {} columns x {} rows, {} samples, seed {}",
        table.width(),
        table.height(),
        table.sample_count(),
        params.seed
    )?;
    writeln!(out, "built in {:.2} ms", elapsed.as_secs_f64() * 1000.0)?;
    writeln!(out, "max mean error: {:.4} bits", stats.max_mean_error())?;
    writeln!(out, "max bit bias:   {:.4}", stats.max_bit_bias())?;
    writeln!(out, "{:>7} {:>9} {:>9} {:>9}", "level", "expected", "mean", "bias")?;

    let levels = table.alpha_levels();
    let summary = [0, levels / 4, levels / 2, levels * 3 / 4, levels];
    for row in &stats.rows {
        if all_rows || summary.contains(&row.level) {
            write_row(&mut out, row)?;
        }
    }
    Ok(out)
}

fn write_row(out: &mut String, row: &RowStats) -> std::fmt::Result {
    writeln!(
        out,
        "{:>7} {:>9.3} {:>9.3} {:>9.4}",
        row.level,
        row.expected_bits,
        row.mean_bits,
        row.bit_bias()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_boundary_levels() {
        let params = TableParams {
            sample_count: 4,
            dither_table_size: 64,
            alpha_levels: 8,
            seed: 3,
        };
        let text = report(params, false).unwrap();
        assert!(text.contains("64 columns x 9 rows"), "{text}");
        let rows = text.lines().skip(5).count();
        assert_eq!(rows, 5);

        let all = report(params, true).unwrap();
        assert_eq!(all.lines().skip(5).count(), 9);
    }

    #[test]
    fn invalid_parameters_fail() {
        let params = TableParams {
            dither_table_size: 100,
            ..TableParams::default()
        };
        assert!(report(params, false).is_err());
    }
}
