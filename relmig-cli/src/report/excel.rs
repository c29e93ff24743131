//! Excel export of the reconciliation report
//!
//! Sheets:
//! - Summary: run overview and totals
//! - Tables: one row per table outcome
//! - Repairs: placeholders and dropped orphans
//! - Manual Review: flagged rows and renamed duplicate keys

use anyhow::{Context, Result};
use rust_xlsxwriter::*;
use std::path::Path;

use super::ReconciliationReport;
use crate::loader::LoadStatus;

/// Write the report as an Excel workbook
pub fn write_excel(report: &ReconciliationReport, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();

    create_summary_sheet(&mut workbook, report)?;
    create_tables_sheet(&mut workbook, report)?;
    create_repairs_sheet(&mut workbook, report)?;
    create_manual_review_sheet(&mut workbook, report)?;

    workbook
        .save(path)
        .with_context(|| format!("Failed to save Excel file: {}", path.display()))?;

    log::info!("Excel report written to: {}", path.display());
    Ok(())
}

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0x4472C4))
        .set_font_color(Color::White)
}

fn create_summary_sheet(workbook: &mut Workbook, report: &ReconciliationReport) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name("Summary")?;

    let section_format = header_format().set_font_size(14);
    let title_format = Format::new().set_bold().set_font_size(16);
    let bold_format = Format::new().set_bold();

    sheet.write_string_with_format(
        0,
        0,
        &format!("Reconciliation Report: {}", report.target),
        &title_format,
    )?;
    sheet.write_string(1, 0, &format!("Started: {}", report.run_started_at))?;
    sheet.write_string(2, 0, &format!("Status: {}", report.status.label()))?;

    let mut row = 4u32;
    if let Some(fatal) = &report.fatal_error {
        sheet.write_string_with_format(row, 0, "FATAL ERROR", &section_format)?;
        row += 1;
        sheet.write_string(row, 0, fatal)?;
        row += 2;
    }

    sheet.write_string_with_format(row, 0, "TOTALS", &section_format)?;
    row += 1;
    sheet.write_string_with_format(row, 0, "Metric", &bold_format)?;
    sheet.write_string_with_format(row, 1, "Value", &bold_format)?;
    row += 1;

    let totals = &report.totals;
    let metrics: [(&str, f64); 12] = [
        ("Tables", totals.tables as f64),
        ("Succeeded", totals.succeeded as f64),
        ("Succeeded With Warning", totals.warned as f64),
        ("Failed", totals.failed as f64),
        ("Skipped", totals.skipped as f64),
        ("Rows Moved", totals.rows_moved as f64),
        ("Columns Added", totals.columns_added as f64),
        ("Orphans Found", totals.orphans as f64),
        ("Placeholders", totals.placeholders as f64),
        ("Dropped Orphans", totals.dropped_orphans as f64),
        ("Rows Flagged For Review", totals.flagged_rows as f64),
        ("Keys Disambiguated", totals.disambiguated as f64),
    ];
    for (label, value) in metrics {
        sheet.write_string(row, 0, label)?;
        sheet.write_number(row, 1, value)?;
        row += 1;
    }

    sheet.autofit();
    Ok(())
}

fn create_tables_sheet(workbook: &mut Workbook, report: &ReconciliationReport) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name("Tables")?;

    let header_format = header_format();
    let warning_format = Format::new().set_background_color(Color::RGB(0xFFC000));
    let failed_format = Format::new().set_background_color(Color::RGB(0xFF6B6B));
    let plain_format = Format::new();

    let headers = [
        "#",
        "Table",
        "Status",
        "Reason",
        "Source Rows",
        "Rows Before",
        "Rows After",
        "Final Count",
        "Attempts",
        "Deferred",
        "Columns Added",
    ];
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &header_format)?;
    }

    let mut row = 1u32;
    for t in &report.tables {
        let format = match t.status {
            LoadStatus::Failed => &failed_format,
            LoadStatus::SucceededWithWarning | LoadStatus::Skipped => &warning_format,
            _ => &plain_format,
        };

        sheet.write_number_with_format(row, 0, t.position as f64, format)?;
        sheet.write_string_with_format(row, 1, &t.table, format)?;
        sheet.write_string_with_format(row, 2, t.status.label(), format)?;
        sheet.write_string_with_format(row, 3, t.reason.as_deref().unwrap_or(""), format)?;
        match t.source_rows {
            Some(n) => sheet.write_number_with_format(row, 4, n as f64, format)?,
            None => sheet.write_string_with_format(row, 4, "-", format)?,
        };
        sheet.write_number_with_format(row, 5, t.rows_before as f64, format)?;
        sheet.write_number_with_format(row, 6, t.rows_after as f64, format)?;
        match t.final_count {
            Some(n) => sheet.write_number_with_format(row, 7, n as f64, format)?,
            None => sheet.write_string_with_format(row, 7, "-", format)?,
        };
        sheet.write_number_with_format(row, 8, t.attempts as f64, format)?;
        sheet.write_string_with_format(row, 9, if t.deferred { "yes" } else { "no" }, format)?;
        let added = t
            .added_columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.column_type.label()))
            .collect::<Vec<_>>()
            .join(", ");
        sheet.write_string_with_format(row, 10, &added, format)?;
        row += 1;
    }

    sheet.autofit();
    Ok(())
}

fn create_repairs_sheet(workbook: &mut Workbook, report: &ReconciliationReport) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name("Repairs")?;

    let header_format = header_format();
    let placeholder_format = Format::new().set_background_color(Color::RGB(0xFFC000));

    sheet.write_string_with_format(0, 0, "Action", &header_format)?;
    sheet.write_string_with_format(0, 1, "Child Table", &header_format)?;
    sheet.write_string_with_format(0, 2, "Child Column", &header_format)?;
    sheet.write_string_with_format(0, 3, "Parent Table", &header_format)?;
    sheet.write_string_with_format(0, 4, "Missing Key", &header_format)?;
    sheet.write_string_with_format(0, 5, "Detail", &header_format)?;

    let mut row = 1u32;
    for p in report.placeholders() {
        sheet.write_string_with_format(row, 0, "placeholder", &placeholder_format)?;
        sheet.write_string(row, 1, &p.child)?;
        sheet.write_string(row, 2, &p.child_column)?;
        sheet.write_string(row, 3, &p.parent)?;
        sheet.write_string(row, 4, &p.key)?;
        sheet.write_string(row, 5, &format!("marker in {}.{}", p.parent, p.marker_column))?;
        row += 1;
    }
    for d in report.dropped() {
        sheet.write_string(row, 0, "dropped")?;
        sheet.write_string(row, 1, &d.table)?;
        sheet.write_string(row, 2, &d.column)?;
        sheet.write_string(row, 3, &d.parent)?;
        sheet.write_string(row, 4, &d.key)?;
        sheet.write_string(row, 5, &d.reason)?;
        row += 1;
    }

    if row == 1 {
        sheet.write_string(row, 0, "No orphans were repaired")?;
    }

    sheet.autofit();
    Ok(())
}

fn create_manual_review_sheet(workbook: &mut Workbook, report: &ReconciliationReport) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name("Manual Review")?;

    let header_format = header_format();
    let flagged_format = Format::new().set_background_color(Color::RGB(0xFF6B6B));

    sheet.write_string_with_format(0, 0, "Table", &header_format)?;
    sheet.write_string_with_format(0, 1, "Export Row", &header_format)?;
    sheet.write_string_with_format(0, 2, "Column", &header_format)?;
    sheet.write_string_with_format(0, 3, "Value", &header_format)?;
    sheet.write_string_with_format(0, 4, "Finding", &header_format)?;

    let mut row = 1u32;
    for t in &report.tables {
        for f in &t.flagged {
            sheet.write_string_with_format(row, 0, &t.table, &flagged_format)?;
            sheet.write_number_with_format(row, 1, f.row as f64, &flagged_format)?;
            sheet.write_string_with_format(row, 2, &f.column, &flagged_format)?;
            sheet.write_string_with_format(row, 3, &f.value, &flagged_format)?;
            sheet.write_string_with_format(
                row,
                4,
                &format!("withheld: {}", f.reason),
                &flagged_format,
            )?;
            row += 1;
        }
        for d in &t.disambiguated {
            sheet.write_string(row, 0, &t.table)?;
            sheet.write_number(row, 1, d.row as f64)?;
            sheet.write_string(row, 2, &d.column)?;
            sheet.write_string(row, 3, &d.original)?;
            sheet.write_string(row, 4, &format!("duplicate renamed to {}", d.assigned))?;
            row += 1;
        }
    }

    if row == 1 {
        sheet.write_string(row, 0, "No rows require manual review")?;
    }

    sheet.autofit();
    Ok(())
}
