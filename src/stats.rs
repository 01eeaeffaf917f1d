//! Operator statistics
//!
//! Reports come in six categories. Histograms group regions (or paging
//! events) by average deref count into 64 buckets of width 4 and render as
//! a 20-row bar chart; the summary lists chunk and storage totals together
//! with the activity of the current aging period.

use crate::error::{ChunkError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Chunks shorter than this are "short"
pub const SHORT_CHUNK_LIMIT: usize = 64;

/// Chunks shorter than this (and not short) are "medium"
pub const MEDIUM_CHUNK_LIMIT: usize = 8192;

const HISTOGRAM_BUCKETS: usize = 64;
const BUCKET_WIDTH: usize = 4;
const CHART_ROWS: usize = 20;

/// Which report to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsCategory {
    Summary,
    RegionHistogram,
    PagingHistogram,
    #[serde(rename = "freespace-histogram")]
    FreeSpaceHistogram,
    Regions,
    Paging,
}

impl StatsCategory {
    pub const ALL: [StatsCategory; 6] = [
        StatsCategory::Summary,
        StatsCategory::RegionHistogram,
        StatsCategory::PagingHistogram,
        StatsCategory::FreeSpaceHistogram,
        StatsCategory::Regions,
        StatsCategory::Paging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsCategory::Summary => "summary",
            StatsCategory::RegionHistogram => "region-histogram",
            StatsCategory::PagingHistogram => "paging-histogram",
            StatsCategory::FreeSpaceHistogram => "freespace-histogram",
            StatsCategory::Regions => "regions",
            StatsCategory::Paging => "paging",
        }
    }
}

impl fmt::Display for StatsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsCategory {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        StatsCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ChunkError::InvalidConfig(format!("unknown stats category '{}'", s)))
    }
}

/// Running counters kept by an engine
///
/// Per-period counters are cleared by [`Counters::start_period`].
#[derive(Debug, Clone)]
pub struct Counters {
    pub period: u64,
    pub derefs: u64,
    pub creates: u64,
    pub deletes: u64,
    pub migrate_slide: u64,
    pub migrate_fill: u64,
    pub migrate_away: u64,
    pub page_out: u64,
    pub page_in: u64,
    pub swap_failures: u64,
    /// Paging events by deref count of the chunk that moved
    pub paging_histogram: [u64; 256],
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            period: 0,
            derefs: 0,
            creates: 0,
            deletes: 0,
            migrate_slide: 0,
            migrate_fill: 0,
            migrate_away: 0,
            page_out: 0,
            page_in: 0,
            swap_failures: 0,
            paging_histogram: [0; 256],
        }
    }
}

impl Counters {
    pub fn start_period(&mut self) {
        self.period += 1;
        self.derefs = 0;
        self.creates = 0;
        self.deletes = 0;
        self.migrate_slide = 0;
        self.migrate_fill = 0;
        self.migrate_away = 0;
    }

    pub fn record_page_out(&mut self, derefs: u8) {
        self.page_out += 1;
        self.paging_histogram[derefs as usize] += 1;
    }

    pub fn record_page_in(&mut self, derefs: u8) {
        self.page_in += 1;
        self.paging_histogram[derefs as usize] += 1;
    }
}

/// Count and byte total for one class of chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeClass {
    pub count: u64,
    pub bytes: u64,
}

impl SizeClass {
    pub fn add(&mut self, len: usize) {
        self.count += 1;
        self.bytes += len as u64;
    }
}

/// Chunk totals split into short, medium and long
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeBreakdown {
    pub short: SizeClass,
    pub medium: SizeClass,
    pub long: SizeClass,
}

impl SizeBreakdown {
    pub fn add(&mut self, len: usize) {
        if len < SHORT_CHUNK_LIMIT {
            self.short.add(len);
        } else if len < MEDIUM_CHUNK_LIMIT {
            self.medium.add(len);
        } else {
            self.long.add(len);
        }
    }

    pub fn total(&self) -> SizeClass {
        SizeClass {
            count: self.short.count + self.medium.count + self.long.count,
            bytes: self.short.bytes + self.medium.bytes + self.long.bytes,
        }
    }
}

/// The `summary` report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub engine: &'static str,
    pub chunks: SizeBreakdown,
    /// Bytes taken by per-chunk headers and alignment
    pub overhead_bytes: u64,
    pub free_extents: u64,
    pub free_bytes: u64,
    pub fragmented_bytes: u64,
    pub storage_bytes: u64,
    pub used_bytes: u64,
    pub regions: u64,
    pub swapped_chunks: u64,
    pub swap_bytes: u64,
    pub page_out: u64,
    pub page_in: u64,
    pub swap_failures: u64,
    pub period: u64,
    pub period_derefs: u64,
    pub maxed_chunks: u64,
    pub creates: u64,
    pub deletes: u64,
    pub migrate_slide: u64,
    pub migrate_fill: u64,
    pub migrate_away: u64,
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        part * 100 / whole
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.chunks.total();
        writeln!(
            f,
            "Chunks:    {:10} allocated ({:10} bytes, {:10} ({:2}%) overhead)",
            total.count,
            total.bytes,
            self.overhead_bytes,
            percent(self.overhead_bytes, self.used_bytes)
        )?;
        for (name, class) in [
            ("short ", self.chunks.short),
            ("medium", self.chunks.medium),
            ("long  ", self.chunks.long),
        ] {
            writeln!(
                f,
                "             {:10} {}    ({:10} bytes)",
                class.count, name, class.bytes
            )?;
        }
        writeln!(
            f,
            "           {:10} free      ({:10} bytes, {:10} ({:2}%) fragmented)",
            self.free_extents,
            self.free_bytes,
            self.fragmented_bytes,
            percent(self.fragmented_bytes, self.free_bytes)
        )?;
        writeln!(
            f,
            "Storage:   {:10} total ({:2}% saturation)",
            self.storage_bytes,
            percent(self.used_bytes, self.storage_bytes)
        )?;
        writeln!(f, "Regions:   {:10} total ({})", self.regions, self.engine)?;
        writeln!(
            f,
            "Swap:      {:10} chunks  ({:10} bytes, {:10} write failures)",
            self.swapped_chunks, self.swap_bytes, self.swap_failures
        )?;
        writeln!(
            f,
            "Paging:    {:10} out, {:10} in",
            self.page_out, self.page_in
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "Period:    {:10} ({:10} accesses so far, {:10} chunks at max)",
            self.period, self.period_derefs, self.maxed_chunks
        )?;
        writeln!(
            f,
            "Activity:  {:10} creates, {:10} deletes this period",
            self.creates, self.deletes
        )?;
        let moves = self.migrate_slide + self.migrate_fill + self.migrate_away;
        writeln!(f, "Migration: {:10} moves this period", moves)?;
        writeln!(
            f,
            "             {:10} slide    {:10} move",
            self.migrate_slide,
            self.migrate_fill + self.migrate_away
        )?;
        write!(
            f,
            "             {:10} in region{:10} out of region",
            self.migrate_slide + self.migrate_fill,
            self.migrate_away
        )
    }
}

/// Per-region line of the `regions` report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub region: u32,
    pub used: u32,
    pub free_extents: u64,
    pub free_bytes: u64,
    pub largest_free: u64,
    pub average_derefs: u8,
}

impl fmt::Display for RegionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region:{:4}  #used:{:5}  #free:{:5}  fbytes:{:06x}  largest:{:06x}  deref:{:3}",
            self.region,
            self.used,
            self.free_extents,
            self.free_bytes,
            self.largest_free,
            self.average_derefs
        )
    }
}

/// Values grouped by deref count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub legend: String,
    /// One total per bucket of [`BUCKET_WIDTH`] deref values
    pub buckets: Vec<u64>,
}

impl Histogram {
    /// Group a per-deref-value table into buckets
    pub fn from_values(legend: &str, values: &[u64; 256]) -> Self {
        let buckets = values
            .chunks(BUCKET_WIDTH)
            .map(|bucket| bucket.iter().sum())
            .collect();
        Histogram {
            legend: legend.to_string(),
            buckets,
        }
    }

    /// Height that maps to a full column
    ///
    /// A single outlier would flatten every other column, so the scale
    /// drops to the second or third tallest column when the tallest is
    /// more than twice their height.
    fn scale(&self) -> u64 {
        let (mut max, mut pen, mut ante) = (0u64, 0u64, 0u64);
        for &k in &self.buckets {
            if max < k {
                ante = pen;
                pen = max;
                max = k;
            } else if pen < k {
                ante = pen;
                pen = k;
            } else if ante < k {
                ante = k;
            }
        }
        if ante < max / 2 {
            max = if pen < max / 2 && ante >= pen / 2 {
                pen
            } else {
                ante
            };
        }
        max.max(1)
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = self.scale();
        let mut rows = vec![vec![b' '; HISTOGRAM_BUCKETS]; CHART_ROWS];

        for (column, &k) in self.buckets.iter().enumerate() {
            let height = ((k * CHART_ROWS as u64) / scale).min(CHART_ROWS as u64) as usize;
            for row in rows.iter_mut().take(height) {
                row[column] = b'*';
            }
        }

        // Label clipped columns with their real value near the top
        let mut pen = 0usize;
        for (column, &k) in self.buckets.iter().enumerate() {
            if k <= scale {
                continue;
            }
            let label = format!("({})", k);
            if column < HISTOGRAM_BUCKETS / 2 {
                let row = if column < pen { 18 } else { 19 };
                let start = column + 1;
                let end = (start + label.len()).min(HISTOGRAM_BUCKETS);
                rows[row][start..end].copy_from_slice(&label.as_bytes()[..end - start]);
                pen = column + label.len() + 1;
            } else {
                let start = column.saturating_sub(label.len());
                let row = if start < pen { 18 } else { 19 };
                rows[row][start..column].copy_from_slice(&label.as_bytes()[..column - start]);
                pen = column;
            }
        }

        writeln!(f, "{}", self.legend)?;
        for (index, row) in rows.iter().enumerate().rev() {
            let axis = if index == CHART_ROWS - 1 {
                format!("{:5}", scale)
            } else {
                "     ".to_string()
            };
            writeln!(f, "{}|{}", axis, String::from_utf8_lossy(row).trim_end())?;
        }
        writeln!(f, "     +{}", "-".repeat(HISTOGRAM_BUCKETS))?;
        write!(f, "      0{:>31}{:>32}", 128, 255)
    }
}

/// A rendered report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "category", rename_all = "kebab-case")]
pub enum StatsReport {
    Summary(Summary),
    RegionHistogram(Histogram),
    PagingHistogram(Histogram),
    #[serde(rename = "freespace-histogram")]
    FreeSpaceHistogram(Histogram),
    Regions { regions: Vec<RegionStats> },
    Paging { page_out: u64, page_in: u64 },
}

impl StatsReport {
    pub fn category(&self) -> StatsCategory {
        match self {
            StatsReport::Summary(_) => StatsCategory::Summary,
            StatsReport::RegionHistogram(_) => StatsCategory::RegionHistogram,
            StatsReport::PagingHistogram(_) => StatsCategory::PagingHistogram,
            StatsReport::FreeSpaceHistogram(_) => StatsCategory::FreeSpaceHistogram,
            StatsReport::Regions { .. } => StatsCategory::Regions,
            StatsReport::Paging { .. } => StatsCategory::Paging,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsReport::Summary(summary) => summary.fmt(f),
            StatsReport::RegionHistogram(h)
            | StatsReport::PagingHistogram(h)
            | StatsReport::FreeSpaceHistogram(h) => h.fmt(f),
            StatsReport::Regions { regions } => {
                for (i, region) in regions.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    region.fmt(f)?;
                }
                Ok(())
            }
            StatsReport::Paging { page_out, page_in } => {
                write!(f, "Paging:    {:10} out, {:10} in", page_out, page_in)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names_round_trip() {
        for category in StatsCategory::ALL {
            assert_eq!(category.as_str().parse::<StatsCategory>().unwrap(), category);
        }
        assert!("bogus".parse::<StatsCategory>().is_err());
    }

    #[test]
    fn test_size_breakdown_boundaries() {
        let mut sizes = SizeBreakdown::default();
        for len in [0, 63, 64, 8191, 8192, 65535] {
            sizes.add(len);
        }
        assert_eq!(sizes.short, SizeClass { count: 2, bytes: 63 });
        assert_eq!(sizes.medium, SizeClass { count: 2, bytes: 64 + 8191 });
        assert_eq!(sizes.long, SizeClass { count: 2, bytes: 8192 + 65535 });
        assert_eq!(sizes.total().count, 6);
    }

    #[test]
    fn test_period_reset_keeps_paging_totals() {
        let mut counters = Counters::default();
        counters.creates = 5;
        counters.derefs = 10;
        counters.record_page_out(7);
        counters.start_period();
        assert_eq!(counters.period, 1);
        assert_eq!(counters.creates, 0);
        assert_eq!(counters.derefs, 0);
        assert_eq!(counters.page_out, 1);
        assert_eq!(counters.paging_histogram[7], 1);
    }

    #[test]
    fn test_histogram_buckets_and_render() {
        let mut values = [0u64; 256];
        values[0] = 3;
        values[3] = 1;
        values[255] = 2;
        let histogram = Histogram::from_values("Chart", &values);
        assert_eq!(histogram.buckets.len(), 64);
        assert_eq!(histogram.buckets[0], 4);
        assert_eq!(histogram.buckets[63], 2);

        let text = histogram.to_string();
        assert!(text.starts_with("Chart\n"));
        // legend, 20 rows, axis, labels
        assert_eq!(text.lines().count(), 23);
    }

    #[test]
    fn test_histogram_scale_ignores_single_outlier() {
        let mut values = [0u64; 256];
        values[0] = 1000;
        values[4] = 10;
        values[8] = 8;
        let histogram = Histogram::from_values("Chart", &values);
        assert_eq!(histogram.scale(), 10);
        assert!(histogram.to_string().contains("(1000)"));
    }

    #[test]
    fn test_report_json_is_tagged() {
        let report = StatsReport::Paging {
            page_out: 3,
            page_in: 1,
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"category\": \"paging\""));
        assert_eq!(report.category(), StatsCategory::Paging);
        let text = report.to_string();
        assert!(text.starts_with("Paging:"));
        assert!(text.contains(" 3 out,"));
        assert!(text.ends_with(" 1 in"));
    }
}
