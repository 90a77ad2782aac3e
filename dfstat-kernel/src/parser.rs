/**
 * PARSER - POSIX `df -P` report reader
 *
 * ROLE : turn the data lines of a `df -P` report (header already removed)
 * into per-partition usage, keyed by mount point.
 *
 * A malformed line only loses that line. An empty result means the host
 * answered but exports none of the watched partitions.
 */

use crate::error::ParseError;
use crate::models::PartitionUsage;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const FIELDS: usize = 6;

/// Parse one data line into `(mount_point, usage)`.
pub fn parse_line(line: &str) -> Result<(String, PartitionUsage), ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != FIELDS {
        return Err(ParseError::FieldCount {
            found: fields.len(),
            line: line.to_string(),
        });
    }

    let usage = PartitionUsage {
        size: number("1024-blocks", fields[1])?,
        used: number("used", fields[2])?,
        available: number("available", fields[3])?,
    };
    Ok((fields[5].to_string(), usage))
}

/// Sizes must fit the store's signed 64-bit columns.
fn number(field: &'static str, value: &str) -> Result<u64, ParseError> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ParseError::Number {
            field,
            value: value.to_string(),
        })
}

/// Extract usage for the partitions in `known_partitions`, skipping bad lines.
pub fn parse<S: AsRef<str>>(
    lines: &[S],
    known_partitions: &BTreeSet<String>,
) -> BTreeMap<String, PartitionUsage> {
    let mut out = BTreeMap::new();

    for line in lines.iter().map(AsRef::as_ref) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok((mount, usage)) if known_partitions.contains(&mount) => {
                out.insert(mount, usage);
            }
            Ok((mount, _)) => debug!(%mount, "ignoring unwatched partition"),
            Err(e) => warn!(error = %e, "skipping df line"),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfstat_devkit::DfReportBuilder;

    fn known(parts: &[&str]) -> BTreeSet<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_fields_map_to_size_used_available() {
        let lines = DfReportBuilder::new()
            .partition("/home", 2000, 1600, 400)
            .row("spdrstor01:/export/scratch", "/scratch", 4096, 1024, 3072)
            .data_lines();

        let parsed = parse(&lines, &known(&["/home", "/scratch"]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed["/home"],
            PartitionUsage {
                size: 2000,
                used: 1600,
                available: 400
            }
        );
        assert_eq!(parsed["/scratch"].size, 4096);
        assert_eq!(parsed["/scratch"].available, 3072);
    }

    #[test]
    fn test_unknown_mounts_are_excluded() {
        let lines = DfReportBuilder::new()
            .partition("/", 100, 10, 90)
            .partition("/boot", 100, 10, 90)
            .partition("/home", 100, 10, 90)
            .data_lines();

        let parsed = parse(&lines, &known(&["/home"]));
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["/home"]);
    }

    #[test]
    fn test_malformed_line_skipped_batch_continues() {
        let lines = DfReportBuilder::new()
            .raw_line("/dev/sda1 100 10")
            .raw_line("/dev/sdb1 100 ten 90 10% /data")
            .partition("/home", 100, 10, 90)
            .data_lines();

        let parsed = parse(&lines, &known(&["/home", "/data"]));
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("/home"));
    }

    #[test]
    fn test_line_errors_are_typed() {
        assert_eq!(
            parse_line("a b c"),
            Err(ParseError::FieldCount {
                found: 3,
                line: "a b c".into()
            })
        );
        assert!(matches!(
            parse_line("/dev/x 1 2 -3 4% /m"),
            Err(ParseError::Number { field: "available", .. })
        ));
    }

    #[test]
    fn test_values_beyond_i64_are_rejected() {
        assert!(matches!(
            parse_line("/dev/x 18446744073709551615 10 20 1% /home"),
            Err(ParseError::Number { field: "1024-blocks", .. })
        ));
        assert!(parse_line("/dev/x 9223372036854775807 10 20 1% /home").is_ok());

        let lines = DfReportBuilder::new()
            .raw_line("/dev/x 100 9223372036854775808 20 1% /home")
            .partition("/data", 100, 10, 90)
            .data_lines();
        let parsed = parse(&lines, &known(&["/home", "/data"]));
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["/data"]);
    }

    #[test]
    fn test_no_known_partitions_gives_empty_map() {
        let lines = DfReportBuilder::new().partition("/var", 10, 1, 9).data_lines();
        assert!(parse(&lines, &known(&["/home"])).is_empty());

        let empty: Vec<String> = Vec::new();
        assert!(parse(&empty, &known(&["/home"])).is_empty());
    }
}
