use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use super::{OrbitTable, TablePublisher};

#[derive(Serialize)]
struct NdjsonRecord<'a> {
    pv: &'a str,
    orbit: &'a OrbitTable,
}

/// Publishes each orbit table as one newline-delimited JSON record on a
/// `Write` sink, stdout by default.
pub struct NdjsonPublisher {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl NdjsonPublisher {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl TablePublisher for NdjsonPublisher {
    fn publish(&self, name: &str, table: &OrbitTable) -> anyhow::Result<()> {
        let record = NdjsonRecord {
            pv: name,
            orbit: table,
        };
        let mut sink = self.sink.lock().unwrap();
        serde_json::to_writer(&mut *sink, &record)?;
        sink.write_all(b"\n")?;
        sink.flush()?;
        Ok(())
    }
}
