//! Exporters: where finished flow records go.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use flowtap_common::{FlowError, FlowResult};
use flowtap_engine::table::ExportedRecord;
use flowtap_features::Value;

/// Sink for completed flow records. Exporters own their underlying resource
/// (file handle, connection) and are flushed/closed via `finish`. `Send`
/// because the CLI runner drains the engine's record channel on its own
/// thread, separate from the producer.
pub trait Exporter: Send {
    /// Write one flow's exported record.
    fn export(&mut self, record: &ExportedRecord) -> FlowResult<()>;

    /// Flush and release any buffered state. Called once at end of stream.
    fn finish(&mut self) -> FlowResult<()> {
        Ok(())
    }
}

/// Discards every record. Useful for throughput benchmarking and dry runs.
pub struct NullExporter;

impl Exporter for NullExporter {
    fn export(&mut self, _record: &ExportedRecord) -> FlowResult<()> {
        Ok(())
    }
}

fn format_value(value: &Option<Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Int(v)) => v.to_string(),
        Some(Value::UInt(v)) => v.to_string(),
        Some(Value::Float(v)) => v.to_string(),
        Some(Value::Time(_, v)) => v.to_string(),
        Some(Value::Bytes(b)) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        Some(Value::Str(s)) => s.clone(),
        Some(Value::Ip(ip)) => ip.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::List(items)) => items
            .iter()
            .map(|v| format_value(&Some(v.clone())))
            .collect::<Vec<_>>()
            .join(";"),
    }
}

/// Writes one CSV row per flow: `endReason,when,<feature columns...>`.
pub struct CsvExporter {
    writer: csv::Writer<File>,
}

impl CsvExporter {
    /// Open `path` for writing and emit the header row with the given
    /// feature names, in declared field order.
    pub fn create(path: &Path, feature_names: &[String]) -> FlowResult<Self> {
        let file = File::create(path).map_err(FlowError::ExporterIo)?;
        let mut writer = csv::Writer::from_writer(file);
        let mut header = vec!["endReason".to_string(), "when".to_string()];
        header.extend(feature_names.iter().cloned());
        writer
            .write_record(&header)
            .map_err(|e| FlowError::ExporterIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self { writer })
    }
}

impl Exporter for CsvExporter {
    fn export(&mut self, record: &ExportedRecord) -> FlowResult<()> {
        let mut row = vec![format!("{:?}", record.reason), record.when.to_string()];
        row.extend(record.values.iter().map(format_value));
        self.writer
            .write_record(&row)
            .map_err(|e| FlowError::ExporterIo(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    fn finish(&mut self) -> FlowResult<()> {
        self.writer
            .flush()
            .map_err(FlowError::ExporterIo)
    }
}

/// Writes flow records into a SQLite table, one row per flow.
pub struct SqlExporter {
    conn: rusqlite::Connection,
    feature_names: Vec<String>,
}

impl SqlExporter {
    /// Open (or create) `path`'s `flows` table with one text column per
    /// feature name, plus `end_reason` and `when_ns`.
    pub fn create(path: &Path, feature_names: &[String]) -> FlowResult<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| FlowError::ExporterIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let mut columns = String::from("end_reason TEXT, when_ns INTEGER");
        for name in feature_names {
            columns.push_str(&format!(", {} TEXT", sanitize_column(name)));
        }
        conn.execute(&format!("CREATE TABLE IF NOT EXISTS flows ({columns})"), [])
            .map_err(|e| FlowError::ExporterIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self {
            conn,
            feature_names: feature_names.to_vec(),
        })
    }
}

fn sanitize_column(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl Exporter for SqlExporter {
    fn export(&mut self, record: &ExportedRecord) -> FlowResult<()> {
        let placeholders: Vec<String> = (0..self.feature_names.len() + 2)
            .map(|i| format!("?{}", i + 1))
            .collect();
        let columns: Vec<String> = std::iter::once("end_reason".to_string())
            .chain(std::iter::once("when_ns".to_string()))
            .chain(self.feature_names.iter().map(|n| sanitize_column(n)))
            .collect();
        let sql = format!(
            "INSERT INTO flows ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(format!("{:?}", record.reason)),
            Box::new(record.when),
        ];
        for value in &record.values {
            params.push(Box::new(format_value(value)));
        }
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        self.conn
            .execute(&sql, param_refs.as_slice())
            .map_err(|e| FlowError::ExporterIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }
}

/// A simplified binary record format loosely modeled on IPFIX data records:
/// a fixed header followed by length-prefixed fields, one flow per record.
/// Not an interoperable IPFIX collector target, just a compact binary
/// alternative to CSV for high-volume exports.
pub struct IpfixExporter {
    writer: std::io::BufWriter<File>,
}

impl IpfixExporter {
    /// Open `path` for writing.
    pub fn create(path: &Path) -> FlowResult<Self> {
        let file = File::create(path).map_err(FlowError::ExporterIo)?;
        Ok(Self {
            writer: std::io::BufWriter::new(file),
        })
    }
}

impl Exporter for IpfixExporter {
    fn export(&mut self, record: &ExportedRecord) -> FlowResult<()> {
        let reason = format!("{:?}", record.reason);
        self.writer
            .write_all(&(reason.len() as u16).to_be_bytes())
            .map_err(FlowError::ExporterIo)?;
        self.writer.write_all(reason.as_bytes()).map_err(FlowError::ExporterIo)?;
        self.writer
            .write_all(&record.when.to_be_bytes())
            .map_err(FlowError::ExporterIo)?;
        self.writer
            .write_all(&(record.values.len() as u16).to_be_bytes())
            .map_err(FlowError::ExporterIo)?;
        for value in &record.values {
            let text = format_value(value);
            self.writer
                .write_all(&(text.len() as u16).to_be_bytes())
                .map_err(FlowError::ExporterIo)?;
            self.writer.write_all(text.as_bytes()).map_err(FlowError::ExporterIo)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> FlowResult<()> {
        self.writer.flush().map_err(FlowError::ExporterIo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtap_features::EndReason;

    fn record() -> ExportedRecord {
        ExportedRecord {
            reason: EndReason::Idle,
            when: 42,
            values: vec![Some(Value::UInt(7)), None],
        }
    }

    #[test]
    fn null_exporter_accepts_every_record() {
        let mut exporter = NullExporter;
        assert!(exporter.export(&record()).is_ok());
    }

    #[test]
    fn csv_exporter_writes_header_and_row() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("flowtap-export-test-{}.csv", std::process::id()));
        {
            let mut exporter =
                CsvExporter::create(&path, &["packetTotalCount".to_string(), "octets".to_string()])
                    .unwrap();
            exporter.export(&record()).unwrap();
            exporter.finish().unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("endReason,when,packetTotalCount,octets"));
        assert!(contents.contains("Idle,42,7,"));
        std::fs::remove_file(&path).ok();
    }
}
