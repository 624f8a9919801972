use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

/// Outcome of one channel, as reported by `send` and `echo`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub channel: u16,
    pub bytes_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl ChannelReport {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            bytes_sent: 0,
            bytes_received: None,
            payload: None,
            error: None,
            raw: Vec::new(),
        }
    }

    /// Record received bytes, keeping a printable preview.
    pub fn with_received(mut self, data: Vec<u8>) -> Self {
        self.bytes_received = Some(data.len() as u64);
        self.payload = Some(payload_preview(&data));
        self.raw = data;
        self
    }
}

pub fn print_reports(reports: &[ChannelReport], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for report in reports {
                println!(
                    "{}",
                    serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "SENT", "RECEIVED", "PAYLOAD", "ERROR"]);
            for report in reports {
                table.add_row(vec![
                    report.channel.to_string(),
                    report.bytes_sent.to_string(),
                    optional(report.bytes_received.map(|n| n.to_string())),
                    optional(report.payload.clone()),
                    optional(report.error.clone()),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for report in reports {
                let mut line = format!("channel={} sent={}", report.channel, report.bytes_sent);
                if let Some(received) = report.bytes_received {
                    line.push_str(&format!(" received={received}"));
                }
                if let Some(payload) = &report.payload {
                    line.push_str(&format!(" payload={payload}"));
                }
                if let Some(error) = &report.error {
                    line.push_str(&format!(" error={error}"));
                }
                println!("{line}");
            }
        }
        OutputFormat::Raw => {
            for report in reports {
                print_raw(&report.raw);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn optional(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
