// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsers for the ad-hoc text that guest tools and scripts produce.

use crate::SIZE_1_GB;
use crate::SIZE_1_KB;
use crate::SIZE_1_MB;
use crate::SIZE_1_TB;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors from the parsers in this module.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// a size string could not be parsed
    #[error("invalid size {0:?}")]
    Size(String),
    /// a CPU list could not be parsed
    #[error("invalid cpu list {0:?}")]
    CpuList(String),
    /// the CSV text has no header row
    #[error("csv input is empty")]
    EmptyCsv,
    /// a CSV row has the wrong number of fields
    #[error("csv row {row} has {found} fields, expected {expected}")]
    CsvRow {
        /// 1-based data row number.
        row: usize,
        /// Fields found.
        found: usize,
        /// Fields in the header.
        expected: usize,
    },
    /// the CSV text is malformed
    #[error("invalid csv: {0}")]
    Csv(String),
    /// a named CSV column does not exist
    #[error("csv has no column {0:?}")]
    MissingColumn(String),
    /// a CSV cell is not a number
    #[error("csv column {column:?} row {row} is not a number: {value:?}")]
    NotANumber {
        /// The column name.
        column: String,
        /// 1-based data row number.
        row: usize,
        /// The cell contents.
        value: String,
    },
}

/// Parses `Key<sep> value` lines into a map. Lines without `sep` are
/// skipped; keys and values are trimmed.
///
/// ```text
/// Architecture:        x86_64
/// CPU(s):              4
/// ```
pub fn parse_key_values(text: &str, sep: char) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(sep))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Parses `/proc/meminfo` into values in kB.
///
/// ```text
/// MemTotal:       65820456 kB
/// MemFree:        43453176 kB
/// HugePages_Total:       0
/// ```
pub fn parse_meminfo(text: &str) -> BTreeMap<String, u64> {
    parse_key_values(text, ':')
        .into_iter()
        .filter_map(|(k, v)| {
            let n = v.split_whitespace().next()?.parse().ok()?;
            Some((k, n))
        })
        .collect()
}

/// Parses a human-readable size into bytes.
///
/// Accepts a plain byte count or a number with a binary-multiple suffix
/// (`K`, `M`, `G`, `T`, optionally followed by `B` or `iB`), e.g. `512M`,
/// `1.5T`, `10GB`.
pub fn parse_size(s: &str) -> Result<u64, ParseError> {
    let err = || ParseError::Size(s.to_owned());
    let t = s.trim();
    let split = t
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(t.len());
    let (num, suffix) = t.split_at(split);
    let suffix = suffix.trim().to_ascii_uppercase();
    let unit = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(&suffix);
    let multiplier = match unit {
        "" => 1,
        "K" => SIZE_1_KB,
        "M" => SIZE_1_MB,
        "G" => SIZE_1_GB,
        "T" => SIZE_1_TB,
        _ => return Err(err()),
    };
    if let Ok(n) = num.parse::<u64>() {
        return n.checked_mul(multiplier).ok_or_else(err);
    }
    let n: f64 = num.parse().map_err(|_| err())?;
    if !n.is_finite() || n < 0.0 {
        return Err(err());
    }
    let bytes = (n * multiplier as f64).round();
    // `u64::MAX as f64` rounds up to 2^64, which is itself out of range.
    if bytes >= u64::MAX as f64 {
        return Err(err());
    }
    Ok(bytes as u64)
}

/// Parses the kernel CPU list format (`0-3,5,7-8`), as found in
/// `/sys/devices/system/cpu/online`.
pub fn parse_cpu_list(s: &str) -> Result<BTreeSet<u32>, ParseError> {
    let err = || ParseError::CpuList(s.to_owned());
    let mut cpus = BTreeSet::new();
    for part in s.trim().split(',').filter(|p| !p.trim().is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| err())?;
                let hi: u32 = hi.trim().parse().map_err(|_| err())?;
                if lo > hi {
                    return Err(err());
                }
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(part.trim().parse().map_err(|_| err())?);
            }
        }
    }
    Ok(cpus)
}

/// Returns the first number that follows `label` on any line of `text`.
pub fn find_number_after(text: &str, label: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let (_, rest) = line.split_once(label)?;
        let rest = rest.trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}

/// A parsed CSV document.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// The header row.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// The data rows.
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// The values of column `name`, one per row.
    pub fn column(&self, name: &str) -> Result<Vec<&str>, ParseError> {
        let index = self
            .headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ParseError::MissingColumn(name.to_owned()))?;
        Ok(self.rows.iter().map(|r| r[index].as_str()).collect())
    }

    /// The values of column `name` parsed as numbers.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, ParseError> {
        self.column(name)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.trim().parse().map_err(|_| ParseError::NotANumber {
                    column: name.to_owned(),
                    row: i + 1,
                    value: v.to_owned(),
                })
            })
            .collect()
    }
}

/// Parses comma-separated text with a header row. Fields may be quoted to
/// contain commas or line breaks; `""` inside quotes is a literal quote.
/// Blank lines are skipped and fields are trimmed.
pub fn parse_csv(text: &str) -> Result<CsvTable, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(str::to_owned)
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(ParseError::EmptyCsv);
    }
    let rows = reader
        .records()
        .map(|record| {
            let record = record.map_err(csv_error)?;
            Ok(record.iter().map(str::to_owned).collect())
        })
        .collect::<Result<_, ParseError>>()?;
    Ok(CsvTable { headers, rows })
}

fn csv_error(err: csv::Error) -> ParseError {
    match err.kind() {
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => ParseError::CsvRow {
            // Record 0 is the header.
            row: pos.as_ref().map_or(0, |p| p.record() as usize),
            found: *len as usize,
            expected: *expected_len as usize,
        },
        _ => ParseError::Csv(err.to_string()),
    }
}

/// A Linux distribution as identified from `/etc/os-release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distro {
    /// Lower-case distribution id (`ubuntu`, `rhel`, `oracle`, ...), or
    /// `unknown`.
    pub id: String,
    /// `VERSION_ID`, or `unknown`.
    pub version: String,
}

impl Distro {
    /// Returns true if the id matches any of `ids`, ignoring case.
    pub fn is_any(&self, ids: &[&str]) -> bool {
        ids.iter().any(|id| id.eq_ignore_ascii_case(&self.id))
    }
}

/// Identifies the distribution from the contents of `/etc/*-release`.
pub fn parse_os_release(text: &str) -> Distro {
    let values = parse_key_values(&text.replace('"', ""), '=');
    let version = values
        .get("VERSION_ID")
        .cloned()
        .unwrap_or_else(|| "unknown".into());
    let id = match values.get("ID").map(|s| s.to_ascii_lowercase()) {
        Some(id) if id == "ol" => "oracle".to_owned(),
        Some(id) if !id.is_empty() => id,
        _ => {
            // Older releases only ship a free-form banner.
            const BANNERS: [(&str, &str); 7] = [
                ("ubuntu", "ubuntu"),
                ("suse linux", "sles"),
                ("opensuse", "opensuse"),
                ("centos", "centos"),
                ("oracle", "oracle"),
                ("red hat", "rhel"),
                ("fedora", "fedora"),
            ];
            let lower = text.to_ascii_lowercase();
            BANNERS
                .iter()
                .find(|(needle, _)| lower.contains(needle))
                .map_or("unknown", |(_, id)| *id)
                .to_owned()
        }
    };
    Distro { id, version }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo() {
        let m = parse_meminfo(
            "MemTotal:       65820456 kB\nMemFree:        43453176 kB\nHugePages_Total:       0\nbogus line\n",
        );
        assert_eq!(m["MemTotal"], 65820456);
        assert_eq!(m["HugePages_Total"], 0);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("512M"), Ok(512 * SIZE_1_MB));
        assert_eq!(parse_size("10GB"), Ok(10 * SIZE_1_GB));
        assert_eq!(parse_size("1GiB"), Ok(SIZE_1_GB));
        assert_eq!(parse_size("1.5T"), Ok(SIZE_1_TB + SIZE_1_TB / 2));
        assert_eq!(parse_size(" 2 k "), Ok(2048));
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("").is_err());
        assert_eq!(
            parse_size("99999999999.5T"),
            Err(ParseError::Size("99999999999.5T".into()))
        );
        assert!(parse_size("18446744073709551615.0").is_err());
    }

    #[test]
    fn cpu_lists() {
        assert_eq!(
            parse_cpu_list("0-3,5,7-8\n").unwrap().into_iter().collect::<Vec<_>>(),
            [0, 1, 2, 3, 5, 7, 8]
        );
        assert_eq!(parse_cpu_list("0").unwrap().len(), 1);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a").is_err());
    }

    #[test]
    fn number_after_label() {
        let out = "Throughput(Gbps): 9.87\nCycles/Byte = 1.2\n";
        assert_eq!(find_number_after(out, "Throughput(Gbps)"), Some(9.87));
        assert_eq!(find_number_after(out, "Cycles/Byte"), Some(1.2));
        assert_eq!(find_number_after(out, "Latency"), None);
    }

    #[test]
    fn csv_with_quotes() {
        let t = parse_csv(
            "connections,throughput_gbps,note\n1,9.5,\"warm, steady\"\n\n64,\"10.1\",\"say \"\"hi\"\"\"\n",
        )
        .unwrap();
        assert_eq!(t.rows().len(), 2);
        assert_eq!(t.column("note").unwrap(), ["warm, steady", "say \"hi\""]);
        assert_eq!(t.numeric_column("throughput_gbps").unwrap(), [9.5, 10.1]);
        assert_eq!(
            t.column("latency"),
            Err(ParseError::MissingColumn("latency".into()))
        );
    }

    #[test]
    fn csv_quoted_line_breaks() {
        let t = parse_csv(
            "connections,throughput_gbps,note\n1,9.5,\"first line\nsecond line\"\n8,9.8,ok\n",
        )
        .unwrap();
        assert_eq!(t.rows().len(), 2);
        assert_eq!(
            t.column("note").unwrap(),
            ["first line\nsecond line", "ok"]
        );
        assert_eq!(t.numeric_column("connections").unwrap(), [1.0, 8.0]);
    }

    #[test]
    fn csv_errors() {
        assert_eq!(parse_csv("\n\n"), Err(ParseError::EmptyCsv));
        assert_eq!(
            parse_csv("a,b\n1\n"),
            Err(ParseError::CsvRow {
                row: 1,
                found: 1,
                expected: 2
            })
        );
        let t = parse_csv("a\nx\n").unwrap();
        assert!(matches!(
            t.numeric_column("a"),
            Err(ParseError::NotANumber { row: 1, .. })
        ));
    }

    #[test]
    fn os_release() {
        let d = parse_os_release("NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n");
        assert_eq!(
            d,
            Distro {
                id: "ubuntu".into(),
                version: "22.04".into()
            }
        );
        assert_eq!(parse_os_release("ID=\"ol\"\nVERSION_ID=\"8.6\"").id, "oracle");
        assert_eq!(
            parse_os_release("Red Hat Enterprise Linux Server release 6.10").id,
            "rhel"
        );
        assert_eq!(parse_os_release("").id, "unknown");
        assert!(d.is_any(&["rhel", "Ubuntu"]));
    }
}
