//! Spreadsheet export of per-epoch results.
//!
//! One workbook per run, named after the curriculum flag and the run
//! timestamp. The sheet mirrors a data frame dump: an unnamed index column
//! followed by the `train loss` and `test acc` columns.

use std::io::Write;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Format, FormatBorder, Workbook};

use crate::error::{CurriculumError, Result};

/// Header of the loss column.
pub const TRAIN_LOSS_COLUMN: &str = "train loss";
/// Header of the accuracy column.
pub const TEST_ACC_COLUMN: &str = "test acc";

/// Local time formatted for file names, e.g. `20240131-235959`.
#[must_use]
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// File name of the report for a run.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::report::report_file_name;
///
/// assert_eq!(report_file_name(true, "run1"), "acc_curr_True_run1.xlsx");
/// ```
#[must_use]
pub fn report_file_name(curriculum: bool, time_now: &str) -> String {
    let flag = if curriculum { "True" } else { "False" };
    format!("acc_curr_{flag}_{time_now}.xlsx")
}

/// Full path of the report inside `output_dir`.
#[must_use]
pub fn report_path(output_dir: &Path, curriculum: bool, time_now: &str) -> PathBuf {
    output_dir.join(report_file_name(curriculum, time_now))
}

/// One data row of the report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportRow {
    /// Zero-based row index.
    pub index: usize,
    /// Mean training loss of the epoch.
    pub train_loss: f64,
    /// Held-out accuracy measured before the epoch.
    pub test_acc: f64,
}

/// Rows of a report, paired up from the two series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    rows: Vec<ReportRow>,
}

impl ReportTable {
    /// Pair `train_loss` with `test_acc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the series have different lengths.
    pub fn new(train_loss: &[f64], test_acc: &[f64]) -> Result<Self> {
        if train_loss.len() != test_acc.len() {
            return Err(CurriculumError::Report(format!(
                "{} train losses but {} test accuracies",
                train_loss.len(),
                test_acc.len()
            )));
        }
        let rows = train_loss
            .iter()
            .zip(test_acc)
            .enumerate()
            .map(|(index, (&train_loss, &test_acc))| ReportRow {
                index,
                train_loss,
                test_acc,
            })
            .collect();
        Ok(Self { rows })
    }

    /// Header row; the index column has no name.
    #[must_use]
    pub fn header() -> [&'static str; 3] {
        ["", TRAIN_LOSS_COLUMN, TEST_ACC_COLUMN]
    }

    /// Data rows in epoch order.
    #[must_use]
    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    /// Number of data rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table as a single-sheet workbook.
    ///
    /// # Errors
    ///
    /// Returns an error if a cell cannot be written or the file cannot be
    /// saved.
    pub fn write_xlsx(&self, path: &Path) -> Result<()> {
        let mut workbook = Workbook::new();
        let header_format = Format::new().set_bold().set_border(FormatBorder::Thin);
        let sheet = workbook.add_worksheet();

        for (col, title) in (0u16..).zip(Self::header()) {
            sheet.write_string_with_format(0, col, title, &header_format)?;
        }
        for (row, record) in (1u32..).zip(&self.rows) {
            sheet.write_number_with_format(row, 0, record.index as f64, &header_format)?;
            sheet.write_number(row, 1, record.train_loss)?;
            sheet.write_number(row, 2, record.test_acc)?;
        }

        workbook.save(path)?;
        Ok(())
    }
}

/// Write the per-epoch series to `<output_dir>/acc_curr_<flag>_<time_now>.xlsx`.
///
/// Prints `SAVE <path> successfully` to `out` and returns the path. The
/// output directory must already exist.
///
/// # Errors
///
/// Returns an error if the series lengths differ, the directory is missing
/// or the workbook cannot be written.
pub fn export_to_excel(
    train_loss: &[f64],
    test_acc: &[f64],
    output_dir: &Path,
    curriculum: bool,
    time_now: &str,
    out: &mut dyn Write,
) -> Result<PathBuf> {
    let table = ReportTable::new(train_loss, test_acc)?;
    if !output_dir.is_dir() {
        return Err(CurriculumError::Report(format!(
            "output directory {} does not exist",
            output_dir.display()
        )));
    }

    let path = report_path(output_dir, curriculum, time_now);
    table.write_xlsx(&path)?;
    tracing::debug!("Wrote {} report rows to {}", table.len(), path.display());
    writeln!(out, "SAVE {} successfully", path.display())?;
    Ok(path)
}
