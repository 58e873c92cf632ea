//! flowtap - a network-flow exporter.
//!
//! ```bash
//! flowtap run pipeline.json --source pcap:capture.pcap --exporter csv:flows.csv
//! flowtap features
//! flowtap keys
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod config;

use config::PipelineConfig;
use flowtap_common::FlowError;
use flowtap_engine::buffer::PacketBatch;
use flowtap_engine::table::ExportedRecord;
use flowtap_engine::{Engine, EngineConfig};
use flowtap_io::{
    CsvExporter, Exporter, IpfixExporter, KeyField, NullExporter, PacketSource, PcapFileSource,
    SqlExporter, SyntheticSource,
};

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(version)]
#[command(about = "Group packets into flows and export per-flow features", long_about = None)]
struct Cli {
    /// Increase log verbosity; repeat for more detail (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline to completion against one packet source.
    Run {
        /// Path to a pipeline configuration JSON document.
        config: PathBuf,
        /// Packet source: `pcap:<path>` or `synthetic:<packet-count>`.
        #[arg(long)]
        source: String,
        /// Where exported flow records go: `csv:<path>`, `sql:<path>`,
        /// `ipfix:<path>`, or `null`.
        #[arg(long, default_value = "null")]
        exporter: String,
    },
    /// List every registered feature name.
    Features,
    /// List every supported flow-key field.
    Keys,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "flowtap=info",
        1 => "flowtap=debug",
        _ => "flowtap=trace,flowtap_engine=trace,flowtap_features=trace,flowtap_io=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Features => {
            for name in flowtap_features::registry::names() {
                println!("{name}");
            }
            ExitCode::from(0)
        }
        Commands::Keys => {
            for field in ["sourceIp", "destinationIp", "sourceTransportPort", "destinationTransportPort", "protocol"] {
                println!("{field}");
            }
            ExitCode::from(0)
        }
        Commands::Run { config, source, exporter } => exit_code_for(run(&config, &source, &exporter)),
    }
}

fn exit_code_for(result: Result<(), FlowError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::from(0),
        Err(err @ FlowError::Config(_)) => {
            error!(%err, "configuration error");
            ExitCode::from(1)
        }
        Err(err @ (FlowError::SourceIo(_) | FlowError::ExporterIo(_))) => {
            error!(%err, "I/O error");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(%err, "internal invariant violated");
            ExitCode::from(3)
        }
    }
}

fn open_source(spec: &str, fields: Vec<KeyField>, bidirectional: bool) -> Result<Box<dyn PacketSource>, FlowError> {
    if let Some(path) = spec.strip_prefix("pcap:") {
        return Ok(Box::new(PcapFileSource::open(std::path::Path::new(path), fields, bidirectional)?));
    }
    if let Some(count) = spec.strip_prefix("synthetic:") {
        let n: usize = count
            .parse()
            .map_err(|_| FlowError::Config(format!("invalid synthetic packet count '{count}'")))?;
        let frames = (0..n).map(|i| (i as i64 * 1_000_000, synthetic_frame(i))).collect();
        return Ok(Box::new(SyntheticSource::new(frames, fields, bidirectional)));
    }
    Err(FlowError::Config(format!("unrecognized --source '{spec}'")))
}

fn synthetic_frame(i: usize) -> Vec<u8> {
    let port = 1024 + (i as u16 % 4000);
    let mut frame = vec![
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x08, 0x00, 0x45, 0x00, 0x00, 0x28, 0, 0, 0, 0, 0x40,
        0x06, 0x00, 0x00, 10, 0, 0, 1, 10, 0, 0, 2,
    ];
    frame.extend(port.to_be_bytes());
    frame.extend(443u16.to_be_bytes());
    frame.extend([0, 0, 0, 0, 0, 0, 0, 0, 0x50, 0x02, 0, 0, 0, 0]);
    frame
}

fn open_exporter(spec: &str, feature_names: &[String]) -> Result<Box<dyn Exporter>, FlowError> {
    if spec == "null" {
        return Ok(Box::new(NullExporter));
    }
    if let Some(path) = spec.strip_prefix("csv:") {
        return Ok(Box::new(CsvExporter::create(std::path::Path::new(path), feature_names)?));
    }
    if let Some(path) = spec.strip_prefix("sql:") {
        return Ok(Box::new(SqlExporter::create(std::path::Path::new(path), feature_names)?));
    }
    if let Some(path) = spec.strip_prefix("ipfix:") {
        return Ok(Box::new(IpfixExporter::create(std::path::Path::new(path))?));
    }
    Err(FlowError::Config(format!("unrecognized --exporter '{spec}'")))
}

fn run(config_path: &std::path::Path, source_spec: &str, exporter_spec: &str) -> Result<(), FlowError> {
    let config = PipelineConfig::load(config_path)?;
    let graph_factory = config.graph_factory()?;
    let feature_names = config.feature_names();

    let mut source = open_source(source_spec, config.key.clone(), config.bidirectional)?;
    let exporter = open_exporter(exporter_spec, &feature_names)?;

    let engine_config = EngineConfig {
        workers: config.workers.max(1) as usize,
        batch_size: config.batch_size.max(1) as usize,
        ring_depth: config.ring_depth.max(1) as usize,
        table: config.table_config(),
    };

    let engine = Engine::start(engine_config, graph_factory);
    let records_rx = engine.records().clone();
    let exporter_thread = thread::spawn(move || drain_records(records_rx, exporter));

    let mut pending: Vec<Option<PacketBatch>> = (0..engine.shard_count()).map(|_| None).collect();
    let mut last_timestamp = 0i64;

    loop {
        let record = match source.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(FlowError::Decode(reason)) => {
                engine.stats().decode_errors.inc();
                tracing::debug!(%reason, "dropped unparsable packet");
                continue;
            }
            Err(FlowError::KeyReject(reason)) => {
                engine.stats().key_errors.inc();
                tracing::debug!(%reason, "dropped packet lacking a required key field");
                continue;
            }
            Err(err) => return Err(err),
        };
        last_timestamp = record.timestamp;
        let shard = engine.shard_for(&record.key);
        let batch = match pending[shard].take() {
            Some(batch) => batch,
            None => engine.ring(shard).acquire_empty().ok_or_else(|| {
                FlowError::Invariant(format!("shard {shard} ring closed while producing"))
            })?,
        };
        let mut batch = batch;
        batch.push(record);
        if batch.is_full() {
            batch.expire = true;
            batch.expire_when = last_timestamp;
            engine.submit(shard, batch);
        } else {
            pending[shard] = Some(batch);
        }
    }

    for (shard, batch) in pending.into_iter().enumerate() {
        if let Some(mut batch) = batch {
            batch.expire = true;
            batch.expire_when = last_timestamp;
            engine.submit(shard, batch);
        }
    }

    info!(packets_seen = engine.stats().packets_seen.get(), "source drained, flushing engine");
    engine.flush();
    exporter_thread
        .join()
        .map_err(|_| FlowError::Invariant("exporter thread panicked".into()))?
}

fn drain_records(
    records_rx: crossbeam::channel::Receiver<ExportedRecord>,
    mut exporter: Box<dyn Exporter>,
) -> Result<(), FlowError> {
    while let Ok(record) = records_rx.recv() {
        exporter.export(&record)?;
    }
    exporter.finish()
}
