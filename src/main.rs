//! Purpose: `termlog` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All appends go through `api::Publication`; the CLI never writes frames itself.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use termlog::api::{
    AtomicCounter, Error, ErrorKind, FrameIter, FrameType, LogBuffers, LogConfig, LogMetadata,
    NoopConductor, OfferError, PARTITION_COUNT, Publication, TermStatus, scan_for_availability,
    to_exit_code,
};
use termlog::core::descriptor::{tail_term_id, tail_term_offset};
use termlog::core::position;

const ADMIN_ACTION_RETRIES: usize = 3;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `termlog --help`."));
            }
        },
    };

    let result = match cli.command {
        Command::Create(args) => cmd_create(args),
        Command::Info { path } => cmd_info(&path),
        Command::Offer {
            path,
            messages,
            window,
        } => cmd_offer(&path, &messages, window),
        Command::Scan { path, term } => cmd_scan(&path, term),
    };

    result
        .map(|value| {
            emit_json(value);
            RunOutcome::ok()
        })
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "termlog",
    version,
    about = "Create, inspect and publish into three-term shared-memory logs",
    long_about = None,
    after_help = r#"EXAMPLES
  $ termlog create /dev/shm/pub.log --term-length 65536
  $ termlog offer /dev/shm/pub.log hello world
  $ termlog scan /dev/shm/pub.log
  $ termlog info /dev/shm/pub.log"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and initialise a log file.
    Create(CreateArgs),
    /// Show log metadata, tail counters and the current position.
    Info {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    /// Append each message as one frame through a publication.
    Offer {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(required = true)]
        messages: Vec<String>,
        /// Flow-control window in bytes past the current position.
        #[arg(long, default_value_t = 1024 * 1024)]
        window: u64,
    },
    /// List committed frames of one partition.
    Scan {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        /// Partition index; defaults to the active one.
        #[arg(long)]
        term: Option<usize>,
    },
}

#[derive(clap::Args)]
struct CreateArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    path: PathBuf,
    /// JSON log config; flags given alongside override its fields.
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long)]
    term_length: Option<usize>,
    #[arg(long)]
    mtu: Option<usize>,
    #[arg(long)]
    stream_id: Option<i32>,
    #[arg(long)]
    session_id: Option<i32>,
    #[arg(long, allow_negative_numbers = true)]
    initial_term_id: Option<i32>,
    #[arg(long)]
    registration_id: Option<i64>,
}

fn cmd_create(args: CreateArgs) -> Result<Value, Error> {
    let mut config = match &args.config {
        Some(path) => LogConfig::from_json_file(path)?,
        None => LogConfig::default(),
    };
    if let Some(term_length) = args.term_length {
        config.term_length = term_length;
    }
    if let Some(mtu) = args.mtu {
        config.mtu_length = mtu;
    }
    if let Some(stream_id) = args.stream_id {
        config.stream_id = stream_id;
    }
    if let Some(session_id) = args.session_id {
        config.session_id = Some(session_id);
    }
    if let Some(initial_term_id) = args.initial_term_id {
        config.initial_term_id = Some(initial_term_id);
    }
    if let Some(registration_id) = args.registration_id {
        config.registration_id = registration_id;
    }

    let log = LogBuffers::create(&args.path, &config)?;
    log_info_json(&log)
}

fn cmd_info(path: &Path) -> Result<Value, Error> {
    let log = LogBuffers::map_existing(path)?;
    log_info_json(&log)
}

fn cmd_offer(path: &Path, messages: &[String], window: u64) -> Result<Value, Error> {
    let log = Arc::new(LogBuffers::map_existing(path)?);
    let metadata = log.log_metadata();
    let template = default_header(&metadata, path)?;
    let limit = AtomicCounter::new(0);
    let publication = Publication::new(
        Arc::new(NoopConductor),
        format!("file:{}", path.display()),
        metadata.registration_id(),
        template.stream_id,
        template.session_id,
        Arc::new(limit.clone()),
        log.clone(),
    )?;
    let start = publication.position().map_err(|err| offer_error(err, path))?;
    limit.set_ordered(start.saturating_add(window.min(i64::MAX as u64) as i64));

    let mut cleaned = clean_retired_partitions(&log)?;
    let mut results = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        let position = offer_with_retry(&publication, message.as_bytes())
            .map_err(|err| offer_error(err, path))?;
        results.push(json!({ "index": index, "length": message.len(), "position": position }));
        cleaned += clean_retired_partitions(&log)?;
    }
    publication.close();
    log.flush()?;

    Ok(json!({
        "path": path.display().to_string(),
        "start_position": start,
        "position_limit": publication.position_limit(),
        "cleaned_partitions": cleaned,
        "offers": results,
    }))
}

/// Driver duty run between offers: zero every partition a rotation has retired, so it is clean
/// before the log wraps back onto it.
fn clean_retired_partitions(log: &LogBuffers) -> Result<usize, Error> {
    let mut cleaned = 0;
    for index in 0..PARTITION_COUNT {
        if log.term_status(index)? == TermStatus::NeedsCleaning {
            log.clean_partition(index);
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

/// Caller-side idle strategy: rotation in progress is the only outcome worth retrying here.
fn offer_with_retry(publication: &Publication, payload: &[u8]) -> Result<i64, OfferError> {
    let mut attempts = 0;
    loop {
        match publication.offer(payload) {
            Err(OfferError::AdminAction) if attempts < ADMIN_ACTION_RETRIES => {
                attempts += 1;
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

fn offer_error(err: OfferError, path: &Path) -> Error {
    let kind = match err {
        OfferError::MaxPayloadExceeded { .. } => ErrorKind::Usage,
        OfferError::MaxPositionExceeded => ErrorKind::Corrupt,
        OfferError::Closed => ErrorKind::Internal,
        OfferError::NotConnected | OfferError::BackPressured | OfferError::AdminAction => {
            ErrorKind::Busy
        }
    };
    let err = Error::new(kind)
        .with_message(err.to_string())
        .with_path(path);
    match kind {
        ErrorKind::Busy => err.with_hint("Retry later or widen the window with --window."),
        _ => err,
    }
}

fn cmd_scan(path: &Path, term: Option<usize>) -> Result<Value, Error> {
    let log = LogBuffers::map_existing(path)?;
    let metadata = log.log_metadata();
    let active_partition =
        position::partition_index(metadata.active_term_id(), metadata.initial_term_id());
    let partition = term.unwrap_or(active_partition);
    if partition >= PARTITION_COUNT {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("term index {partition} out of range"))
            .with_hint(format!("Use a partition index below {PARTITION_COUNT}.")));
    }

    let buffer = log.term_buffer(partition);
    let term_id = tail_term_id(log.raw_tail_volatile(partition));
    let availability = scan_for_availability(&buffer, 0, log.term_length());
    let mut frames = Vec::new();
    for item in FrameIter::new(&buffer, 0).with_term_id(term_id) {
        let (offset, header) = item.map_err(|err| err.with_path(path))?;
        let mut frame = Map::new();
        frame.insert("offset".to_string(), json!(offset));
        frame.insert("frame_length".to_string(), json!(header.frame_length));
        frame.insert(
            "type".to_string(),
            json!(match header.frame_type {
                FrameType::Pad => "pad",
                FrameType::Data => "data",
            }),
        );
        frame.insert("term_id".to_string(), json!(header.term_id));
        frame.insert("session_id".to_string(), json!(header.session_id));
        frame.insert("stream_id".to_string(), json!(header.stream_id));
        frame.insert("reserved_value".to_string(), json!(header.reserved_value));
        if header.frame_type == FrameType::Data {
            let mut payload = vec![0u8; header.payload_length()];
            buffer.get_bytes(offset + termlog::api::HEADER_LENGTH, &mut payload);
            frame.insert(
                "payload".to_string(),
                json!(String::from_utf8_lossy(&payload)),
            );
        }
        frames.push(Value::Object(frame));
    }

    Ok(json!({
        "path": path.display().to_string(),
        "partition": partition,
        "term_id": term_id,
        "available": availability.available,
        "padding": availability.padding,
        "frames": frames,
    }))
}

fn log_info_json(log: &LogBuffers) -> Result<Value, Error> {
    let metadata = log.log_metadata();
    let path = log.path().unwrap_or_else(|| Path::new(""));
    let template = default_header(&metadata, path)?;
    let term_length = log.term_length();
    let initial_term_id = metadata.initial_term_id();
    let active_term_id = metadata.active_term_id();
    let active_partition = position::partition_index(active_term_id, initial_term_id);
    let shift = position::position_bits_to_shift(term_length);

    let mut partitions = Vec::with_capacity(PARTITION_COUNT);
    for index in 0..PARTITION_COUNT {
        let raw_tail = log.raw_tail_volatile(index);
        let status = log.term_status(index).map_err(|err| err.with_path(path))?;
        partitions.push(json!({
            "index": index,
            "term_id": tail_term_id(raw_tail),
            "term_offset": tail_term_offset(raw_tail, term_length),
            "status": format!("{status:?}"),
        }));
    }

    let active_tail = log.raw_tail_volatile(active_partition);
    let current_position = position::compute_position(
        tail_term_id(active_tail),
        tail_term_offset(active_tail, term_length),
        shift,
        initial_term_id,
    );
    let last_status_ms = metadata.time_of_last_status_message();

    Ok(json!({
        "path": path.display().to_string(),
        "log_length": log.log_length(),
        "term_length": term_length,
        "mtu_length": metadata.mtu_length(),
        "registration_id": metadata.registration_id(),
        "session_id": template.session_id,
        "stream_id": template.stream_id,
        "initial_term_id": initial_term_id,
        "active_term_id": active_term_id,
        "active_partition": active_partition,
        "position": current_position,
        "max_possible_position": position::compute_max_possible_position(term_length),
        "time_of_last_status_message": {
            "ms": last_status_ms,
            "time": format_epoch_ms(last_status_ms),
        },
        "partitions": partitions,
    }))
}

fn default_header(metadata: &LogMetadata, path: &Path) -> Result<termlog::api::FrameHeader, Error> {
    termlog::api::FrameHeader::decode(&metadata.default_frame_header()).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid default frame header")
            .with_path(path)
            .with_source(err)
    })
}

fn format_epoch_ms(ms: i64) -> Option<String> {
    if ms <= 0 {
        return None;
    }
    let ts = OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()?;
    ts.format(&Rfc3339).ok()
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file permissions on the log path.")
        }
        ErrorKind::AlreadyExists => {
            err.with_hint("A file already exists at this path. Remove it or choose another path.")
        }
        ErrorKind::NotFound => err.with_hint("Create the log first: termlog create <path>."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Log appears corrupt or was not created by termlog. Recreate it.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "log is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    use std::error::Error as _;
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
