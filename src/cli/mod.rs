//! MQ-070: CLI subcommands: init, validate, schema, compile, ask, replay.

use crate::core::compiler::Catalog;
use crate::core::parser;
use crate::core::types::MarketqlConfig;
use crate::engine::demo_bars;
use crate::engine::sqlite::{create_table, insert_bars, SqliteExecutor};
use crate::pipeline::{Outcome, Pipeline, Request};
use crate::provider::scripted::ScriptedProvider;
use crate::provider::template::TemplateNarrator;
use crate::stream::event::{encode_line, fold_steps, reconstruct_narration, Decoded, Envelope, Event};
use crate::stream::eventlog::{append_event, generate_request_id, read_events, request_events};
use crate::stream::Emitter;
use crate::understand::{clarifying_question, Clock, Turn, Understander};
use chrono::NaiveDate;
use clap::Subcommand;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Symbols seeded by `init`.
const DEMO_SYMBOLS: &[&str] = &["NQ", "ES"];

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project with a demo database
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate marketql.yaml without touching the database
    Validate {
        /// Path to marketql.yaml
        #[arg(short, long, default_value = "marketql.yaml")]
        file: PathBuf,
    },

    /// Print the tool schema handed to the completion provider
    Schema,

    /// Show the SQL a question compiles to, without running it
    Compile {
        /// Path to marketql.yaml
        #[arg(short, long, default_value = "marketql.yaml")]
        file: PathBuf,

        /// Reference date for relative periods (default: today)
        #[arg(long)]
        today: Option<NaiveDate>,

        /// The question
        question: String,
    },

    /// Answer questions, streaming events as JSON lines on stdout
    Ask {
        /// Path to marketql.yaml
        #[arg(short, long, default_value = "marketql.yaml")]
        file: PathBuf,

        /// JSONL script of provider proposals used as the understanding fallback
        #[arg(long)]
        script: Option<PathBuf>,

        /// Also append every event to this JSONL log
        #[arg(long)]
        log: Option<PathBuf>,

        /// Reference date for relative periods (default: today)
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Questions, asked in order as one conversation
        #[arg(required = true)]
        questions: Vec<String>,
    },

    /// Summarize requests recorded in an event log
    Replay {
        /// Event log written by `ask --log`
        log: PathBuf,

        /// Only this request
        #[arg(short, long)]
        request: Option<String>,
    },
}

/// Options for [`ask`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub script: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub today: Option<NaiveDate>,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Schema => cmd_schema(),
        Commands::Compile {
            file,
            today,
            question,
        } => cmd_compile(&file, today, &question),
        Commands::Ask {
            file,
            script,
            log,
            today,
            questions,
        } => cmd_ask(&file, &questions, AskOptions { script, log, today }),
        Commands::Replay { log, request } => cmd_replay(&log, request.as_deref()),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("marketql.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;

    let template = r#"version: "1.0"

data:
  database: market.db
  table: bars
  symbols: [NQ, ES]
  default_symbol: NQ

pipeline:
  max_rewrites: 2
  row_cap: 5000
  query_timeout_ms: 5000
  provider_timeout_ms: 30000
  event_buffer: 256
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    let db_path = path.join("market.db");
    let seeded = seed_demo(&db_path, "bars")?;

    println!("Initialized marketql project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {} ({} demo bars)", db_path.display(), seeded);
    Ok(())
}

/// Write deterministic demo bars for 2023 and 2024.
fn seed_demo(db_path: &Path, table: &str) -> Result<usize, String> {
    let symbols: Vec<String> = DEMO_SYMBOLS.iter().map(|s| s.to_string()).collect();
    let (start, end) = match (
        NaiveDate::from_ymd_opt(2023, 1, 1),
        NaiveDate::from_ymd_opt(2025, 1, 1),
    ) {
        (Some(start), Some(end)) => (start, end),
        _ => return Err("invalid demo date range".to_string()),
    };
    let conn = rusqlite::Connection::open(db_path)
        .map_err(|e| format!("cannot open {}: {}", db_path.display(), e))?;
    create_table(&conn, table).map_err(|e| e.to_string())?;
    insert_bars(&conn, table, &demo_bars(&symbols, start, end)).map_err(|e| e.to_string())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} (table {}, {} symbols, max {} rewrites)",
            config.data.database.display(),
            config.data.table,
            config.data.symbols.len(),
            config.pipeline.max_rewrites
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_schema() -> Result<(), String> {
    println!("{}", tool_schema()?);
    Ok(())
}

/// The derived tool schema, pretty-printed.
fn tool_schema() -> Result<String, String> {
    let catalog = Catalog::builtin("bars").map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&catalog.schema().derive())
        .map_err(|e| format!("JSON serialize error: {}", e))
}

fn cmd_compile(file: &Path, today: Option<NaiveDate>, question: &str) -> Result<(), String> {
    let config = parser::load_config(file)?;
    print!("{}", compile_question(&config, today, question)?);
    Ok(())
}

/// Render what a question compiles to, or the clarifying question it needs.
fn compile_question(
    config: &MarketqlConfig,
    today: Option<NaiveDate>,
    question: &str,
) -> Result<String, String> {
    let catalog = Catalog::builtin(&config.data.table).map_err(|e| e.to_string())?;
    let understander = understander(Arc::clone(&catalog), config, today);
    let spec = understander.rules(question, &[]);
    let unclear = spec.unclear();
    if !unclear.is_empty() {
        return Ok(format!("Unclear: {}\n", clarifying_question(&unclear)));
    }
    let query = catalog.compile(&spec, None).map_err(|e| e.to_string())?;
    let params = serde_json::to_string(&query.params)
        .map_err(|e| format!("JSON serialize error: {}", e))?;
    Ok(format!(
        "Operation: {}\nSQL: {}\nParams: {}\nFingerprint: {}\n",
        query.tag,
        query.sql,
        params,
        query.fingerprint()
    ))
}

fn understander(catalog: Arc<Catalog>, config: &MarketqlConfig, today: Option<NaiveDate>) -> Understander {
    let understander = Understander::new(catalog, &config.data);
    match today {
        Some(day) => understander.with_clock(Clock::Fixed(day)),
        None => understander,
    }
}

/// Relative database paths are taken from the config file's directory.
fn resolve_database(file: &Path, database: &Path) -> PathBuf {
    if database.is_absolute() {
        return database.to_path_buf();
    }
    match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(database),
        _ => database.to_path_buf(),
    }
}

fn build_pipeline(file: &Path, config: &MarketqlConfig, opts: &AskOptions) -> Result<Pipeline, String> {
    let catalog = Catalog::builtin(&config.data.table).map_err(|e| e.to_string())?;
    let understander = understander(Arc::clone(&catalog), config, opts.today);
    let executor = Arc::new(SqliteExecutor::new(resolve_database(file, &config.data.database)));
    let mut pipeline = Pipeline::new(
        catalog,
        understander,
        executor,
        Arc::new(TemplateNarrator),
        config.pipeline.clone(),
    );
    if let Some(script) = &opts.script {
        pipeline = pipeline.with_provider(Arc::new(ScriptedProvider::from_file(script)?));
    }
    Ok(pipeline)
}

fn cmd_ask(file: &Path, questions: &[String], opts: AskOptions) -> Result<(), String> {
    let config = parser::load_config(file)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let outcomes = ask(file, &config, questions, &opts, &mut out)?;
    let failed = questions.len() - outcomes.len();
    if failed > 0 {
        return Err(format!("{} request(s) failed", failed));
    }
    Ok(())
}

/// Ask `questions` in order as one conversation, writing every event to `out`.
///
/// Each turn sees the earlier turns' specifications. Returns the outcomes
/// of the requests that finished; failed requests are reported on the
/// stream and logged.
pub fn ask(
    file: &Path,
    config: &MarketqlConfig,
    questions: &[String],
    opts: &AskOptions,
    out: &mut dyn Write,
) -> Result<Vec<Outcome>, String> {
    let pipeline = build_pipeline(file, config, opts)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;

    runtime.block_on(async {
        let mut history: Vec<Turn> = Vec::new();
        let mut outcomes = Vec::new();
        for question in questions {
            let request_id = generate_request_id();
            let (tx, mut rx) = mpsc::channel(pipeline.policy().event_buffer.max(1));
            let emitter = Emitter::new(tx, request_id.clone());
            let request = Request {
                question: question.clone(),
                history: history.clone(),
                request_id: Some(request_id.clone()),
            };
            let log = opts.log.as_deref();
            let sink = &mut *out;
            let drain = async move {
                while let Some(envelope) = rx.recv().await {
                    write_envelope(sink, log, &envelope)?;
                }
                Ok::<(), String>(())
            };
            let (result, written) = tokio::join!(pipeline.run(request, emitter), drain);
            written?;
            match result {
                Ok(outcome) => {
                    if let Some(spec) = &outcome.spec {
                        history.push(Turn {
                            question: question.clone(),
                            spec: spec.clone(),
                        });
                    }
                    outcomes.push(outcome);
                }
                Err(e) if e.is_disconnect() => return Err("event stream closed".to_string()),
                Err(e) => tracing::warn!(request = %request_id, error = %e, "request failed"),
            }
        }
        Ok(outcomes)
    })
}

fn write_envelope(out: &mut dyn Write, log: Option<&Path>, envelope: &Envelope) -> Result<(), String> {
    let line = encode_line(envelope)?;
    writeln!(out, "{}", line).map_err(|e| format!("write error: {}", e))?;
    if let Some(path) = log {
        append_event(path, envelope)?;
    }
    Ok(())
}

fn cmd_replay(log: &Path, request: Option<&str>) -> Result<(), String> {
    let decoded = read_events(log)?;
    print!("{}", replay(&decoded, request)?);
    Ok(())
}

/// Summarize each recorded request: steps, SQL, narration and outcome.
fn replay(decoded: &[Decoded], only: Option<&str>) -> Result<String, String> {
    let mut ids: Vec<&str> = Vec::new();
    let mut unknown = 0;
    for d in decoded {
        match d {
            Decoded::Known(e) if !ids.contains(&e.request_id.as_str()) => ids.push(&e.request_id),
            Decoded::Known(_) => {}
            Decoded::Unknown { .. } => unknown += 1,
        }
    }
    if let Some(id) = only {
        if !ids.contains(&id) {
            return Err(format!("request {} not found in log", id));
        }
        ids.retain(|i| *i == id);
    }

    let mut text = String::new();
    for id in ids {
        let events = request_events(decoded, id);
        text.push_str(&format!("Request {}\n", id));
        for step in fold_steps(&events) {
            let duration = step
                .duration
                .map(|d| format!(" ({:.3}s)", d))
                .unwrap_or_default();
            let state = serde_json::to_value(step.state)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            text.push_str(&format!("  {}: {} [{}]{}\n", step.agent, step.message, state, duration));
            for tool in &step.tools {
                let status = if tool.error.is_some() { "error" } else { "ok" };
                text.push_str(&format!("    tool {} [{}]\n", tool.name, status));
            }
        }
        for envelope in &events {
            match &envelope.event {
                Event::SqlExecuted {
                    query, rows_found, ..
                } => text.push_str(&format!("  SQL: {} -> {} row(s)\n", query, rows_found)),
                Event::Done {
                    status, uncertain, ..
                } => {
                    let status = serde_json::to_value(status)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default();
                    let flag = if *uncertain { ", uncertain" } else { "" };
                    text.push_str(&format!("  Done: {}{}\n", status, flag));
                }
                Event::Error { message } => text.push_str(&format!("  Error: {}\n", message)),
                _ => {}
            }
        }
        let narration = reconstruct_narration(&events);
        if !narration.is_empty() {
            text.push_str(&format!("  Answer: {}\n", narration));
        }
        text.push('\n');
    }
    if unknown > 0 {
        text.push_str(&format!("Skipped {} unknown record(s)\n", unknown));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::{decode_line, DoneStatus};

    fn init_project() -> (tempfile::TempDir, PathBuf, MarketqlConfig) {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let file = dir.path().join("marketql.yaml");
        let config = parser::load_config(&file).unwrap();
        (dir, file, config)
    }

    fn day(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn test_mq070_init() {
        let (dir, file, config) = init_project();
        assert!(file.exists());
        assert!(dir.path().join("market.db").exists());
        assert_eq!(config.data.symbols, vec!["NQ".to_string(), "ES".to_string()]);
        cmd_validate(&file).unwrap();
    }

    #[test]
    fn test_mq070_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marketql.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_mq070_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("marketql.yaml");
        std::fs::write(
            &file,
            r#"
version: "2.0"
data:
  database: market.db
  table: "bars; DROP TABLE bars"
"#,
        )
        .unwrap();
        let err = cmd_validate(&file).unwrap_err();
        assert_eq!(err, "2 validation error(s)");
    }

    #[test]
    fn test_mq070_schema_names_tool() {
        let schema = tool_schema().unwrap();
        assert!(schema.contains(crate::core::schema::TOOL_NAME));
        assert!(schema.contains("hold_bars"));
    }

    #[test]
    fn test_mq070_compile_binds_values() {
        let (_dir, _file, config) = init_project();
        let text = compile_question(&config, day(2024, 5, 15), "average close for ES in March 2024").unwrap();
        assert!(text.starts_with("Operation: aggregate\n"));
        assert!(text.contains(r#""ES""#));
        assert!(text.contains(r#""2024-03-01""#));
        assert!(text.contains(r#""2024-04-01""#));
        assert!(!text.contains("'ES'"));
    }

    #[test]
    fn test_mq070_compile_unclear() {
        let (_dir, _file, config) = init_project();
        let text = compile_question(&config, day(2024, 5, 15), "average close in March").unwrap();
        assert_eq!(text, "Unclear: Could you tell me which year you mean?\n");
    }

    #[test]
    fn test_mq070_resolve_database() {
        let file = Path::new("/srv/project/marketql.yaml");
        assert_eq!(
            resolve_database(file, Path::new("market.db")),
            PathBuf::from("/srv/project/market.db")
        );
        assert_eq!(
            resolve_database(file, Path::new("/data/bars.db")),
            PathBuf::from("/data/bars.db")
        );
        assert_eq!(
            resolve_database(Path::new("marketql.yaml"), Path::new("market.db")),
            PathBuf::from("market.db")
        );
    }

    #[test]
    fn test_mq070_ask_streams_and_follows_up() {
        let (dir, file, config) = init_project();
        let log = dir.path().join("logs/events.jsonl");
        let opts = AskOptions {
            log: Some(log.clone()),
            today: day(2024, 5, 15),
            ..AskOptions::default()
        };
        let questions = vec![
            "average close in March".to_string(),
            "2024".to_string(),
        ];
        let mut out = Vec::new();
        let outcomes = ask(&file, &config, &questions, &opts, &mut out).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, DoneStatus::Clarification);
        assert_eq!(outcomes[1].status, DoneStatus::Answered);

        let stdout = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = stdout.lines().collect();
        assert!(lines
            .iter()
            .all(|l| matches!(decode_line(l), Ok(Decoded::Known(_)))));
        let logged = read_events(&log).unwrap();
        assert_eq!(logged.len(), lines.len());

        let summary = replay(&logged, Some(&outcomes[1].request_id)).unwrap();
        assert!(summary.contains("SQL: "));
        assert!(summary.contains("Done: answered"));
        assert!(summary.contains("Answer: "));
    }

    #[test]
    fn test_mq070_ask_with_script() {
        let (dir, file, config) = init_project();
        let script = dir.path().join("script.jsonl");
        std::fs::write(
            &script,
            r#"{"proposal": {"operation": "stats", "metric": "volume"}}"#,
        )
        .unwrap();
        let opts = AskOptions {
            script: Some(script),
            today: day(2024, 5, 15),
            ..AskOptions::default()
        };
        let mut out = Vec::new();
        let outcomes = ask(
            &file,
            &config,
            &["how did things go in 2024".to_string()],
            &opts,
            &mut out,
        )
        .unwrap();
        assert_eq!(outcomes[0].status, DoneStatus::Answered);
        let stdout = String::from_utf8(out).unwrap();
        assert!(stdout.contains(r#""event":"tool_end""#));
    }

    #[test]
    fn test_mq070_replay_unknown_request() {
        let decoded: Vec<Decoded> = Vec::new();
        assert!(replay(&decoded, Some("q-missing")).is_err());
    }

    #[test]
    fn test_mq070_replay_counts_unknown_records() {
        let decoded = vec![
            decode_line(r#"{"event":"heartbeat","seq":0}"#).unwrap(),
            decode_line(
                r#"{"seq":0,"ts":"t","request_id":"q-1","event":"error","message":"boom"}"#,
            )
            .unwrap(),
        ];
        let summary = replay(&decoded, None).unwrap();
        assert!(summary.contains("Request q-1"));
        assert!(summary.contains("Error: boom"));
        assert!(summary.ends_with("Skipped 1 unknown record(s)\n"));
    }
}
