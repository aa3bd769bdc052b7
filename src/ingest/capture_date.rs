//! Capture dates recovered from camera file names.

use chrono::NaiveDate;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // YYYYMMDD, YYYY-MM-DD, YYYY_MM_DD or YYYY.MM.DD, not preceded by another digit.
        Regex::new(r"(?:^|[^0-9])((?:19|20)[0-9]{2})[-_.]?(0[1-9]|1[0-2])[-_.]?(0[1-9]|[12][0-9]|3[01])")
            .expect("date pattern is a valid regex")
    })
}

/// First valid calendar date embedded in `filename`, if any.
///
/// `IMG_20240615_103000.jpg` and `2024-06-15 10.30.00.jpg` both give
/// 2024-06-15; `DSCF1949.RAF` gives nothing.
pub fn date_from_filename(filename: &str) -> Option<NaiveDate> {
    date_pattern().captures_iter(filename).find_map(|caps| {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// `root/YYYY/MM/DD`.
pub fn dated_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(date.format("%d").to_string())
}
