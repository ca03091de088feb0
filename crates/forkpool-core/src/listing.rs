use crate::error::{ForkpoolError, Result};
use crate::naming::DatasetPath;
use crate::types::DatasetRow;

/// Columns requested from the engine, in order
pub const LIST_COLUMNS: [&str; 6] = ["name", "used", "avail", "refer", "mountpoint", "origin"];

/// Parse a whitespace-aligned listing with a header row
///
/// The header is always consumed here and checked against
/// [`LIST_COLUMNS`]; callers only ever see data rows. Output with no lines
/// at all (nothing matched) yields no rows.
pub fn parse_table(output: &str) -> Result<Vec<DatasetRow>> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = match lines.next() {
        Some(header) => header,
        None => return Ok(Vec::new()),
    };
    parse_header(header)?;

    lines.map(parse_row).collect()
}

fn parse_header(line: &str) -> Result<()> {
    let columns: Vec<String> = line.split_whitespace().map(str::to_lowercase).collect();
    if columns != LIST_COLUMNS {
        return Err(ForkpoolError::parse(
            line,
            format!("unexpected listing header, expected {}", LIST_COLUMNS.join(" ")),
        ));
    }
    Ok(())
}

/// Parse a single data row
///
/// Format: `NAME USED AVAIL REFER MOUNTPOINT ORIGIN`
/// Example: `P/branches/app/abc  12K  90M  24K  /P/branches/app/abc  P/caches/app@1`
pub fn parse_row(line: &str) -> Result<DatasetRow> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != LIST_COLUMNS.len() {
        return Err(ForkpoolError::parse(
            line,
            format!(
                "expected {} whitespace-delimited fields, got {}",
                LIST_COLUMNS.len(),
                parts.len()
            ),
        ));
    }

    let path = DatasetPath::parse(parts[0])?;
    let mountpoint = optional(parts[4]).map(str::to_string);
    let origin = optional(parts[5]).map(DatasetPath::parse).transpose()?;

    Ok(DatasetRow {
        path,
        used: parts[1].to_string(),
        avail: parts[2].to_string(),
        refer: parts[3].to_string(),
        mountpoint,
        origin,
    })
}

fn optional(field: &str) -> Option<&str> {
    match field {
        "-" | "none" => None,
        other => Some(other),
    }
}

/// Find the row for exactly `path`
pub fn find_row<'a>(rows: &'a [DatasetRow], path: &DatasetPath) -> Option<&'a DatasetRow> {
    rows.iter().find(|row| row.path == *path)
}
