use async_trait::async_trait;
use log::error;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::utils::error::{ModbusError, ModbusResult};

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, data: &str) -> ModbusResult<()>;
    fn sink_type(&self) -> &str;
    fn destination(&self) -> &str;
}

pub struct ConsoleSink;

#[async_trait]
impl EventSink for ConsoleSink {
    async fn send(&self, data: &str) -> ModbusResult<()> {
        println!("{}", data);
        Ok(())
    }

    fn sink_type(&self) -> &str {
        "console"
    }

    fn destination(&self) -> &str {
        "stdout"
    }
}

pub struct FileSink {
    file_path: String,
    append: bool,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(file_path: P, append: bool) -> Self {
        Self {
            file_path: file_path.as_ref().to_string_lossy().to_string(),
            append,
        }
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn send(&self, data: &str) -> ModbusResult<()> {
        if self.append {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)
                .await
                .map_err(|e| {
                    error!("❌ Failed to open file {}: {}", self.file_path, e);
                    ModbusError::Io(e)
                })?;
            file.write_all(data.as_bytes()).await?;
            if !data.ends_with('\n') {
                file.write_all(b"\n").await?;
            }
        } else {
            fs::write(&self.file_path, format!("{}\n", data)).await?;
        }

        Ok(())
    }

    fn sink_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.file_path
    }
}
