use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Cell, Row, Table, cell, row};
use serde::Serialize;
use serde_json::Value;
use sizeinfo_service::caching::CacheStatus;
use sizeinfo_service::normalize::NormalizedRecord;

use crate::settings::{Garment, OutputFormat};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

/// Prints the records of the given garments, `None` for failed lookups.
pub fn print_records(
    records: &[(Garment, Option<Arc<NormalizedRecord>>)],
    format: OutputFormat,
) -> Result<()> {
    if format == OutputFormat::Json {
        let records: Vec<Option<&NormalizedRecord>> =
            records.iter().map(|(_, record)| record.as_deref()).collect();
        return print_json(&records);
    }

    for (garment, record) in records {
        match record {
            Some(record) => print_record(record, format)?,
            None => println!("{}/{}: not available\n", garment.brand, garment.garment_id),
        }
    }
    Ok(())
}

pub fn print_record(record: &NormalizedRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(record)?,
        OutputFormat::Pretty => {
            print_details(record);
            print_size_table(record);
        }
        OutputFormat::Compact => {
            println!("{}/{} ({})", record.brand, record.garment_id, record.unit);
            print_size_table(record);
        }
    }
    Ok(())
}

fn print_details(record: &NormalizedRecord) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);

    let title = format!("Garment {}/{}", record.brand, record.garment_id);
    table.add_row(Row::new(vec![cell!(lb->title).with_hspan(2)]));

    table.add_row(row![r->"  Diagram id:", record.gender_garment_id]);
    table.add_row(row![r->"  Unit:", record.unit]);
    table.add_row(row![r->"  Try-on reports:", yes_no(record.has_avatar)]);
    table.add_row(row![r->"  Chart:", yes_no(record.has_chart)]);
    table.add_row(row![r->"  Attributes:", yes_no(record.has_attributes)]);

    if let Some(note) = &record.text_note {
        table.add_row(row![r->"  Note:", note]);
    }

    table.add_empty_row();
    table.printstd();
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Prints the size table as rows and columns.
///
/// The columns are the keys of the first row, in the order of the payload.
fn print_size_table(record: &NormalizedRecord) {
    let Some(size_info) = &record.size_info else {
        println!("No size table available.\n");
        return;
    };
    let Some(rows) = record.size_rows().filter(|rows| !rows.is_empty()) else {
        println!("{size_info}\n");
        return;
    };

    let columns: Vec<&String> = rows[0].keys().collect();

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(Row::new(
        columns
            .iter()
            .map(|column| Cell::new(column).style_spec("b"))
            .collect(),
    ));

    for size_row in &rows {
        table.add_row(Row::new(
            columns
                .iter()
                .map(|&column| Cell::new(&format_value(size_row.get(column))))
                .collect(),
        ));
    }

    table.printstd();
    println!();
}

fn format_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn print_status(status: &CacheStatus, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(status);
    }

    println!(
        "{} cached, {} in flight",
        status.cache_size, status.in_flight
    );

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Key", "Attempts", "Successes", "Failures", "Success rate"]);

    for (key, stats) in &status.request_stats {
        table.add_row(row![
            key,
            r->stats.attempts,
            r->stats.successes,
            r->stats.failures,
            r->stats.success_rate,
        ]);
    }

    table.printstd();
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(None), "");
        assert_eq!(format_value(Some(&Value::Null)), "");
        assert_eq!(format_value(Some(&json!("S"))), "S");
        assert_eq!(format_value(Some(&json!(60.5))), "60.5");
    }
}
