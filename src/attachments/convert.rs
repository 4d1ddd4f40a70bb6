//! Container-format conversion.
//!
//! Known container formats are flattened to plain text before entering the
//! bucket, so spreadsheets travel as ordinary text attachments.

use std::io::Cursor;

use calamine::{Reader, open_workbook_auto_from_rs};
use thiserror::Error;

pub const SPREADSHEET_MIMES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "application/vnd.oasis.opendocument.spreadsheet",
];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unreadable spreadsheet: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("workbook has no sheets")]
    NoSheets,
}

pub fn is_spreadsheet(mime: &str) -> bool {
    SPREADSHEET_MIMES.contains(&mime)
}

/// Flatten every sheet into tab-separated rows, one section per sheet.
pub fn spreadsheet_to_text(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let sheet_names = workbook.sheet_names().to_owned();
    if sheet_names.is_empty() {
        return Err(ConvertError::NoSheets);
    }

    let mut out = String::new();
    for name in &sheet_names {
        let range = workbook.worksheet_range(name)?;
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("# {name}\n"));
        for row in range.rows() {
            let line = row
                .iter()
                .map(|cell| cell.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            out.push_str(&line);
            out.push('\n');
        }
    }
    Ok(out)
}
