use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use kaleido::config::Config;
use kaleido::db::{Database, ProcessingStatus};
use kaleido::embed::RemoteEmbedder;
use kaleido::logging;
use kaleido::pipeline::Coordinator;
use kaleido::retrieval::{SegmentRetrievalEngine, SequenceMode};
use kaleido::source::{discover_media, FfmpegOpener};

enum Command {
    Init,
    Scan,
    Process { paths: Vec<PathBuf> },
    Retry,
    Status,
    File { id: i64 },
    Reset { target: ResetTarget },
    Cleanup,
    Sequence { mode: SequenceMode, length: usize, seed: Option<i64> },
    Tags,
}

enum ResetTarget {
    File(i64),
    Failed,
    All,
}

struct CliOptions {
    command: Command,
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;
    let mut positionals: Vec<String> = Vec::new();
    let mut length = 20usize;
    let mut seed = None;
    let mut reset_target = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("kaleido {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--length" | "-n" => {
                if i + 1 < args.len() {
                    length = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: --length requires a number");
                        std::process::exit(1);
                    });
                    i += 1;
                }
            }
            "--seed" | "-s" => {
                if i + 1 < args.len() {
                    seed = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--file" => {
                if i + 1 < args.len() {
                    let id = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: --file requires a numeric id");
                        std::process::exit(1);
                    });
                    reset_target = Some(ResetTarget::File(id));
                    i += 1;
                }
            }
            "--failed" => reset_target = Some(ResetTarget::Failed),
            "--all" => reset_target = Some(ResetTarget::All),
            arg if command.is_none() => command = Some(arg.to_string()),
            arg => positionals.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("init") => Command::Init,
        Some("scan") => Command::Scan,
        Some("process") => Command::Process {
            paths: positionals.iter().map(PathBuf::from).collect(),
        },
        Some("retry") => Command::Retry,
        Some("status") | None => Command::Status,
        Some("file") => {
            let id = positionals.first().and_then(|p| p.parse().ok()).unwrap_or_else(|| {
                eprintln!("Error: file command requires a numeric id");
                std::process::exit(1);
            });
            Command::File { id }
        }
        Some("reset") => Command::Reset {
            target: reset_target.unwrap_or_else(|| {
                eprintln!("Error: reset requires --file ID, --failed or --all");
                std::process::exit(1);
            }),
        },
        Some("cleanup") => Command::Cleanup,
        Some("sequence") => {
            let mode = positionals
                .first()
                .and_then(|m| SequenceMode::from_str(m))
                .unwrap_or_else(|| {
                    eprintln!(
                        "Error: sequence requires a mode (similar, contrast, concept_chain, random, diverse)"
                    );
                    std::process::exit(1);
                });
            Command::Sequence { mode, length, seed }
        }
        Some("tags") => Command::Tags,
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    };

    CliOptions {
        command,
        config_path,
    }
}

fn print_help() {
    println!(
        r#"kaleido - media segmentation and retrieval pipeline

USAGE:
    kaleido [COMMAND] [OPTIONS]

COMMANDS:
    init                Write a default config and initialize the database
    scan                Discover media files and register them
    process [PATH...]   Process given files, or everything discoverable
    retry               Re-queue all failed files
    status              Show pipeline status (default)
    file ID             Show one file's pipeline state and segments
    reset               Reset state (--file ID, --failed or --all)
    cleanup             Remove stale records and prune checkpoints
    sequence MODE       Generate a segment sequence
    tags                List the most common segment tags

OPTIONS:
    --config, -c PATH   Path to config file
    --length, -n N      Sequence length (default: 20)
    --seed, -s ID       Seed segment id for sequences
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    KALEIDO_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/kaleido/config.toml"#
    );
}

fn main() -> Result<()> {
    let options = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &options.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    db.initialize()?;

    match options.command {
        Command::Init => {
            config.save()?;
            println!("Initialized database at {}", config.db_path.display());
        }
        Command::Scan => {
            let paths = discover_media(&config.media_dir, &config.pipeline.media_extensions);
            for path in &paths {
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                db.register_file(&path.display().to_string(), &filename)?;
            }
            println!("Registered {} media files", paths.len());
        }
        Command::Process { paths } => {
            let coordinator = build_coordinator(&config, Arc::clone(&db))?;
            let queued = if paths.is_empty() {
                coordinator.process_all()?
            } else {
                for path in &paths {
                    coordinator.enqueue(path)?;
                }
                paths.len()
            };
            println!("Processing {queued} files...");
            coordinator.wait_idle();
            print_status(&coordinator)?;
        }
        Command::Retry => {
            let coordinator = build_coordinator(&config, Arc::clone(&db))?;
            let retried = coordinator.retry_failed()?;
            println!("Retrying {retried} failed files...");
            coordinator.wait_idle();
            print_status(&coordinator)?;
        }
        Command::Status => {
            let counts = db.count_files_by_status()?;
            println!(
                "Pipeline status at {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            println!("Files: {} total", counts.total);
            println!("  pending:     {}", counts.pending);
            println!("  in progress: {}", counts.in_progress);
            println!("  completed:   {}", counts.completed);
            println!("  failed:      {}", counts.failed);
            println!("Segments: {}", db.count_segments()?);
            for row in db.list_files(Some(ProcessingStatus::InProgress), 5)? {
                println!(
                    "  working: {} ({:.1}%)",
                    row.filename,
                    row.overall_progress()
                );
            }
        }
        Command::File { id } => {
            let Some(row) = db.get_file(id)? else {
                eprintln!("No file with id {id}");
                std::process::exit(1);
            };
            println!("{} ({})", row.filename, row.path);
            println!("  status:   {}", row.status.as_str());
            println!("  progress: {:.1}%", row.overall_progress());
            if let (Some(duration), Some(fps)) = (row.duration, row.fps) {
                println!("  stream:   {duration:.1}s @ {fps:.2} fps");
            }
            if let Some(error) = &row.last_error {
                println!("  last error ({}x): {error}", row.error_count);
            }
            let segments = db.segments_for_file(id)?;
            println!("  segments: {}", segments.len());
            for segment in segments {
                println!(
                    "    #{} [{}, {}) {} {:.2}s",
                    segment.id,
                    segment.start_frame,
                    segment.end_frame,
                    segment.status.as_str(),
                    segment.duration
                );
            }
        }
        Command::Reset { target } => match target {
            ResetTarget::File(id) => {
                db.reset_file(id)?;
                println!("Reset file {id}");
            }
            ResetTarget::Failed => {
                let ids = db.retry_failed_files()?;
                println!("Reset {} failed files", ids.len());
            }
            ResetTarget::All => {
                let (files, segments) = db.reset_all_files()?;
                println!("Reset {files} files and {segments} segments");
            }
        },
        Command::Cleanup => {
            let report = db.cleanup()?;
            println!(
                "Removed {} missing files, {} orphaned features, {} orphaned tags; pruned {} checkpoints",
                report.missing_files,
                report.orphaned_features,
                report.orphaned_tags,
                report.pruned_checkpoints
            );
        }
        Command::Sequence { mode, length, seed } => {
            let engine =
                SegmentRetrievalEngine::new(Arc::clone(&db), config.retrieval.clone());
            let sequence = engine.generate_sequence(mode, length, seed)?;
            if sequence.is_empty() {
                println!("No completed segments available");
            }
            for id in sequence {
                if let Some(segment) = db.get_segment(id)? {
                    let file = db
                        .get_file(segment.media_file_id)?
                        .map(|f| f.filename)
                        .unwrap_or_default();
                    println!(
                        "#{} {} [{}, {}) {:.2}s",
                        segment.id,
                        file,
                        segment.start_frame,
                        segment.end_frame,
                        segment.duration
                    );
                }
            }
        }
        Command::Tags => {
            let engine =
                SegmentRetrievalEngine::new(Arc::clone(&db), config.retrieval.clone());
            for (tag, count) in engine.common_tags(20)? {
                println!("{count:6}  {tag}");
            }
        }
    }

    Ok(())
}

fn build_coordinator(config: &Config, db: Arc<Database>) -> Result<Coordinator> {
    let embedder = RemoteEmbedder::new(&config.embedder);
    Coordinator::new(
        config.clone(),
        db,
        Box::new(FfmpegOpener::default()),
        Box::new(embedder),
    )
}

fn print_status(coordinator: &Coordinator) -> Result<()> {
    let status = coordinator.status()?;
    println!(
        "Done: {}/{} completed, {} failed",
        status.processed_count, status.total_count, status.failed_count
    );
    Ok(())
}
