use chrono::Utc;
use serde_json::Value;

use crate::services::poll_service::{PollEvent, PollSample};

pub trait EventFormatter: Send + Sync {
    fn format_samples(&self, samples: &[PollSample]) -> String;
    fn format_failure(&self, message: &str) -> String;
    fn format_header(&self) -> String;

    fn format_event(&self, event: &PollEvent) -> String {
        match event {
            PollEvent::Samples(samples) => self.format_samples(samples),
            PollEvent::Failed(message) => self.format_failure(message),
        }
    }
}

pub struct ConsoleFormatter;

impl EventFormatter for ConsoleFormatter {
    fn format_samples(&self, samples: &[PollSample]) -> String {
        let mut output = match samples.first() {
            Some(first) => format!(
                "📊 {} ({} registers):\n",
                first.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                samples.len()
            ),
            None => return "📊 Empty poll result\n".to_string(),
        };

        for sample in samples {
            output.push_str(&format!("  {:>5} = {}\n", sample.address, sample.value));
        }
        output
    }

    fn format_failure(&self, message: &str) -> String {
        format!("❌ Poll failed: {}\n", message)
    }

    fn format_header(&self) -> String {
        format!(
            "🚀 Modbus register feed - {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        )
    }
}

pub struct JsonFormatter;

impl EventFormatter for JsonFormatter {
    fn format_samples(&self, samples: &[PollSample]) -> String {
        let rows: Vec<Value> = samples
            .iter()
            .map(|sample| {
                serde_json::json!({
                    "address": sample.address,
                    "value": sample.value,
                })
            })
            .collect();

        let result = serde_json::json!({
            "timestamp": samples.first().map(|s| s.timestamp.to_rfc3339()),
            "samples": rows,
        });

        serde_json::to_string(&result).unwrap_or_default()
    }

    fn format_failure(&self, message: &str) -> String {
        let result = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "error": message,
        });

        serde_json::to_string(&result).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }
}

pub struct CsvFormatter;

impl EventFormatter for CsvFormatter {
    fn format_samples(&self, samples: &[PollSample]) -> String {
        let mut csv = String::new();
        for sample in samples {
            csv.push_str(&format!(
                "{},{},{}\n",
                sample.timestamp.to_rfc3339(),
                sample.address,
                sample.value
            ));
        }
        csv
    }

    fn format_failure(&self, message: &str) -> String {
        format!("{},error,\"{}\"\n", Utc::now().to_rfc3339(), message)
    }

    fn format_header(&self) -> String {
        "Timestamp,Address,Value\n".to_string()
    }
}
