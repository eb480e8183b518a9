//! Tabular parser: uploaded bytes into a format-independent grid.
//!
//! Row 0 is the header and is kept aside; data rows remember their 1-based
//! position in the source so every later error can cite it.

use super::error::ParseError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate};
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based source row/line number (the header is row 1).
    pub row: usize,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawGrid {
    pub header: Vec<Cell>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Spreadsheet,
}

impl SourceFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "text" => Some(Self::Csv),
            "xlsx" | "xls" | "xlsb" | "ods" | "spreadsheet" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let ext = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())?;
        Self::parse(ext)
    }
}

pub fn parse_grid(bytes: &[u8], format: SourceFormat) -> Result<RawGrid, ParseError> {
    let grid = match format {
        SourceFormat::Csv => parse_csv_bytes(bytes)?,
        SourceFormat::Spreadsheet => parse_spreadsheet_bytes(bytes)?,
    };
    if grid.rows.is_empty() {
        return Err(ParseError::new("file has no data rows below the header"));
    }
    Ok(grid)
}

fn parse_csv_bytes(bytes: &[u8]) -> Result<RawGrid, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ParseError::new("file is not valid UTF-8 text"))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    parse_csv_text(text)
}

pub fn parse_csv_text(text: &str) -> Result<RawGrid, ParseError> {
    let mut lines = text.lines().enumerate();
    let Some((_, header_line)) = lines.next() else {
        return Err(ParseError::new("file is empty"));
    };
    let header = split_csv_record(header_line)?
        .into_iter()
        .map(text_cell)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_csv_record(line)
            .map_err(|e| ParseError::new(format!("line {}: {}", idx + 1, e.message)))?
            .into_iter()
            .map(text_cell)
            .collect::<Vec<_>>();
        if cells.iter().all(Cell::is_blank) {
            continue;
        }
        rows.push(RawRow { row: idx + 1, cells });
    }
    Ok(RawGrid { header, rows })
}

fn text_cell(s: String) -> Cell {
    if s.is_empty() {
        Cell::Empty
    } else {
        Cell::Text(s)
    }
}

/// Splits one CSV line. Quoted fields may embed commas and `""` escapes;
/// every field is trimmed.
fn split_csv_record(line: &str) -> Result<Vec<String>, ParseError> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf.trim().to_string());
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    if in_quotes {
        return Err(ParseError::new("unterminated quoted field"));
    }
    out.push(buf.trim().to_string());
    Ok(out)
}

fn parse_spreadsheet_bytes(bytes: &[u8]) -> Result<RawGrid, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ParseError::new(format!("could not open spreadsheet: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ParseError::new("spreadsheet has no sheets"))?
        .map_err(|e| ParseError::new(format!("could not read first sheet: {e}")))?;

    // calamine ranges start at the first used cell; pad back to absolute rows.
    let (start_row, start_col) = range.start().unwrap_or((0, 0));
    let mut all_rows = Vec::new();
    for (offset, row) in range.rows().enumerate() {
        let mut cells = vec![Cell::Empty; start_col as usize];
        cells.extend(row.iter().map(spreadsheet_cell));
        all_rows.push((start_row as usize + offset, cells));
    }

    let mut iter = all_rows.into_iter();
    // Leading blank rows are skipped by calamine; the first used row is the header.
    let Some((_, header)) = iter.next() else {
        return Err(ParseError::new("spreadsheet is empty"));
    };
    let rows = iter
        .filter(|(_, cells)| !cells.iter().all(Cell::is_blank))
        .map(|(r, cells)| RawRow { row: r + 1, cells })
        .collect();
    Ok(RawGrid { header, rows })
}

fn spreadsheet_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => text_cell(s.trim().to_string()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => match excel_serial_to_date(dt.as_f64()) {
            Some(d) => Cell::Text(d),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => Cell::Text(s.chars().take(10).collect()),
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) => Cell::Empty,
    }
}

/// Converts a spreadsheet date serial (1900 date system) to `YYYY-MM-DD`.
pub fn excel_serial_to_date(serial: f64) -> Option<String> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let days = serial.floor() as i64;
    // Serials below 60 predate the phantom 1900-02-29.
    let base = if days < 60 {
        NaiveDate::from_ymd_opt(1899, 12, 31)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };
    let date = base.checked_add_signed(Duration::days(days))?;
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    #[test]
    fn quoted_fields_keep_commas_and_are_trimmed() {
        let grid = parse_csv_text("a,b,c\n \"Smith, Jo\" , x ,\"say \"\"hi\"\"\"\n").expect("parse");
        assert_eq!(grid.rows.len(), 1);
        assert_eq!(
            grid.rows[0].cells,
            vec![text("Smith, Jo"), text("x"), text("say \"hi\"")]
        );
    }

    #[test]
    fn row_numbers_follow_source_lines() {
        let grid = parse_csv_text("h1,h2\nA,1\n\nB,2\r\nC,3").expect("parse");
        let rows: Vec<usize> = grid.rows.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![2, 4, 5]);
        assert_eq!(grid.rows[1].cells, vec![text("B"), text("2")]);
    }

    #[test]
    fn empty_cells_map_to_empty() {
        let grid = parse_csv_text("a,b,c\nx,,z").expect("parse");
        assert_eq!(grid.rows[0].cells[1], Cell::Empty);
    }

    #[test]
    fn header_only_file_is_a_parse_error() {
        let err = parse_grid(b"Batch Name,Start Date\n", SourceFormat::Csv).unwrap_err();
        assert!(err.message.contains("no data rows"));
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        let err = parse_csv_text("a,b\n\"open,x").unwrap_err();
        assert!(err.message.starts_with("line 2"));
    }

    #[test]
    fn non_utf8_csv_is_rejected() {
        assert!(parse_grid(&[0xff, 0xfe, 0x00, 0x41], SourceFormat::Csv).is_err());
    }

    #[test]
    fn garbage_spreadsheet_is_rejected() {
        let err = parse_grid(b"not a workbook", SourceFormat::Spreadsheet).unwrap_err();
        assert!(err.message.contains("spreadsheet"));
    }

    #[test]
    fn spreadsheet_reads_first_sheet_with_dates_and_sheet_rows() {
        let bytes = include_bytes!("../../tests/fixtures/batches.xlsx");
        let grid = parse_grid(bytes, SourceFormat::Spreadsheet).expect("parse");
        assert_eq!(grid.header[0], text("Batch Name"));
        let rows: Vec<usize> = grid.rows.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![2, 4]);
        assert_eq!(
            grid.rows[0].cells,
            vec![text("B1"), text("2024-01-15"), Cell::Number(12.0), text("CS")]
        );
        assert_eq!(grid.rows[1].cells[1], text("2024-03-01"));
        assert!(grid
            .rows
            .iter()
            .flat_map(|r| r.cells.iter())
            .all(|c| *c != text("sheet two")));
    }

    #[test]
    fn serial_dates_convert_to_iso() {
        assert_eq!(excel_serial_to_date(45306.0).as_deref(), Some("2024-01-15"));
        assert_eq!(excel_serial_to_date(1.0).as_deref(), Some("1900-01-01"));
        assert_eq!(excel_serial_to_date(61.0).as_deref(), Some("1900-03-01"));
        assert_eq!(excel_serial_to_date(0.0), None);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(SourceFormat::from_path("/tmp/a.XLSX"), Some(SourceFormat::Spreadsheet));
        assert_eq!(SourceFormat::from_path("/tmp/a.csv"), Some(SourceFormat::Csv));
        assert_eq!(SourceFormat::from_path("/tmp/a"), None);
    }
}
