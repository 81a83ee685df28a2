//! CSV bulk upload and export.
//!
//! First row is the header; `date` and `time` columns are required, every
//! other column is a numeric field of the scope's canonical payload.
//! Blank cells parse as 0; unknown columns are dropped downstream by
//! payload normalisation.

use std::collections::{BTreeSet, HashMap};

use crate::entry::MeasurementEntry;

/// One parsed CSV data row (1-indexed, excluding the header).
#[derive(Debug, Clone)]
pub struct CsvRow {
    pub row: usize,
    pub date: Option<String>,
    pub time: Option<String>,
    pub values: HashMap<String, f64>,
}

/// Whole-file CSV failures. Per-row problems are reported in the parse
/// outcome instead, so one bad row never sinks the batch.
#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("required column {name:?} missing from header")]
    MissingColumn { name: &'static str },

    #[error("csv read failed: {0}")]
    Read(#[from] csv::Error),
}

/// Outcome of parsing a CSV batch.
#[derive(Debug, Default)]
pub struct CsvParse {
    pub rows: Vec<CsvRow>,
    /// `(row index, reason)` for rows that failed to parse
    pub failures: Vec<(usize, String)>,
}

/// Parse an uploaded CSV batch.
pub fn parse_csv(bytes: &[u8]) -> Result<CsvParse, CsvError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.to_string())
        .collect();

    for required in ["date", "time"] {
        if !headers.iter().any(|h| h == required) {
            return Err(CsvError::MissingColumn { name: required });
        }
    }

    let mut outcome = CsvParse::default();

    for (idx, record) in reader.records().enumerate() {
        let row = idx + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                outcome.failures.push((row, format!("unreadable row: {}", e)));
                continue;
            }
        };

        let mut date = None;
        let mut time = None;
        let mut values = HashMap::new();
        let mut bad_cell = None;

        for (header, cell) in headers.iter().zip(record.iter()) {
            match header.as_str() {
                "date" => {
                    if !cell.is_empty() {
                        date = Some(cell.to_string());
                    }
                }
                "time" => {
                    if !cell.is_empty() {
                        time = Some(cell.to_string());
                    }
                }
                field => {
                    // Blank cells parse as 0
                    let value = if cell.is_empty() {
                        0.0
                    } else {
                        match cell.parse::<f64>() {
                            Ok(v) => v,
                            Err(_) => {
                                bad_cell =
                                    Some(format!("column {:?}: not a number: {:?}", field, cell));
                                break;
                            }
                        }
                    };
                    values.insert(field.to_string(), value);
                }
            }
        }

        match bad_cell {
            Some(reason) => outcome.failures.push((row, reason)),
            None => outcome.rows.push(CsvRow {
                row,
                date,
                time,
                values,
            }),
        }
    }

    Ok(outcome)
}

/// Emit entries back out as CSV: `date,time` plus the sorted union of the
/// entries' payload fields. Inverse of `parse_csv` up to timestamp
/// normalisation.
pub fn emit_csv(entries: &[MeasurementEntry]) -> Result<Vec<u8>, CsvError> {
    let fields: BTreeSet<&str> = entries
        .iter()
        .flat_map(|e| e.data_values.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["date".to_string(), "time".to_string()];
    header.extend(fields.iter().map(|f| f.to_string()));
    writer.write_record(&header)?;

    for entry in entries {
        let mut record = vec![
            entry.date.format("%d/%m/%Y").to_string(),
            entry.time.format("%H:%M:%S").to_string(),
        ];
        for field in &fields {
            let value = entry.data_values.get(*field).copied();
            record.push(value.map(|v| v.to_string()).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    Ok(writer.into_inner().unwrap_or_default())
}
