use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fabex_session::{DemoReport, TransferReport};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_report(report: &DemoReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in report_rows(report) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "role={} mode={} peer={} sent={} received={} elements_sent={} elements_received={} sum={} elapsed_ms={:.2}",
                report.role,
                report.mode,
                report.peer.as_deref().unwrap_or("-"),
                value_or_dash(report.sent_value),
                value_or_dash(report.received_value),
                report.sent_elements,
                report.received_elements,
                report.received_sum,
                report.elapsed_ms
            );
        }
    }
}

fn report_rows(report: &DemoReport) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("role", report.role.to_string()),
        ("mode", report.mode.to_string()),
        ("peer", report.peer.clone().unwrap_or_else(|| "-".to_string())),
        ("sent value", value_or_dash(report.sent_value)),
        ("received value", value_or_dash(report.received_value)),
        ("elements sent", report.sent_elements.to_string()),
        ("elements received", report.received_elements.to_string()),
        ("received sum", report.received_sum.to_string()),
    ];
    rows.extend(report.transfers.iter().map(|t| ("transfer", transfer_summary(t))));
    rows.push(("elapsed", format!("{:.2} ms", report.elapsed_ms)));
    rows
}

fn transfer_summary(transfer: &TransferReport) -> String {
    format!(
        "{} {} bytes in {} chunk(s), {} busy retr{}",
        transfer.direction,
        transfer.bytes,
        transfer.chunks,
        transfer.busy_retries,
        if transfer.busy_retries == 1 { "y" } else { "ies" }
    )
}

fn value_or_dash(value: Option<f32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
