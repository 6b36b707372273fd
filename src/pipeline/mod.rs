//! MQ-060: Pipeline orchestrator. One request from question to terminal event.
//!
//! Stages run strictly in sequence on the request's task:
//! router, understander, compiler, executor, then narrator and validator
//! in a loop bounded by `max_rewrites`. Every stage is bracketed by
//! `step_start` / `step_end`. A dropped receiver abandons the request at
//! the next emission or while waiting on an external call.

pub mod validator;

use crate::core::compiler::Catalog;
use crate::core::error::{ExecutionError, PipelineError, ProviderError};
use crate::core::schema::TOOL_NAME;
use crate::core::types::{PipelinePolicy, QuerySpecification, Usage};
use crate::engine::{DataExecutor, ExecutionLimits};
use crate::provider::{CompletionProvider, FragmentSink, NarrationRequest, Narrator, Subject};
use crate::stream::event::{Agent, DoneStatus, Envelope, Event, StepState, ValidationStatus};
use crate::stream::eventlog::generate_request_id;
use crate::stream::Emitter;
use crate::understand::router::Route;
use crate::understand::{clarifying_question, Turn, Understander};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::Instrument;
use validator::{GroundingValidator, Validator};

/// One question, with the conversation so far.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub question: String,
    pub history: Vec<Turn>,
    /// Generated when absent.
    pub request_id: Option<String>,
}

impl Request {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

/// What a finished request produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub request_id: String,
    pub status: DoneStatus,
    pub uncertain: bool,
    /// The specification, when the question reached the understander.
    pub spec: Option<QuerySpecification>,
    /// Final narration attempt (or the clarifying question).
    pub narration: String,
    pub narrator_attempts: u32,
    pub usage: Usage,
}

pub struct Pipeline {
    catalog: Arc<Catalog>,
    understander: Understander,
    executor: Arc<dyn DataExecutor>,
    provider: Option<Arc<dyn CompletionProvider>>,
    narrator: Arc<dyn Narrator>,
    validator: Arc<dyn Validator>,
    policy: PipelinePolicy,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        understander: Understander,
        executor: Arc<dyn DataExecutor>,
        narrator: Arc<dyn Narrator>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            catalog,
            understander,
            executor,
            provider: None,
            narrator,
            validator: Arc::new(GroundingValidator::default()),
            policy,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    /// Run `request` on its own task; events arrive on the returned receiver.
    ///
    /// Dropping the receiver abandons the request without touching others.
    pub fn spawn(self: &Arc<Self>, request: Request) -> (String, mpsc::Receiver<Envelope>) {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(generate_request_id);
        let (tx, rx) = mpsc::channel(self.policy.event_buffer.max(1));
        let emitter = Emitter::new(tx, request_id.clone());
        let pipeline = Arc::clone(self);
        let span = tracing::info_span!("request", id = %request_id);
        tokio::spawn(
            async move {
                // errors were already streamed; only the log needs them
                if let Err(e) = pipeline.run(request, emitter).await {
                    tracing::debug!(error = %e, "request ended early");
                }
            }
            .instrument(span),
        );
        (request_id, rx)
    }

    /// Drive one request to its terminal event.
    pub async fn run(&self, request: Request, emitter: Emitter) -> Result<Outcome, PipelineError> {
        let mut run = Run::new(emitter);
        let result = self.drive(&request, &mut run).await;
        match &result {
            Ok(outcome) => tracing::info!(
                status = ?outcome.status,
                uncertain = outcome.uncertain,
                attempts = outcome.narrator_attempts,
                "request finished"
            ),
            Err(PipelineError::Disconnected) => tracing::info!("client disconnected; request abandoned"),
            Err(e) => tracing::warn!(error = %e, "request failed"),
        }
        result
    }

    async fn drive(&self, request: &Request, run: &mut Run) -> Result<Outcome, PipelineError> {
        let question = request.question.as_str();

        let started = run.start(Agent::Router, "Routing the question").await?;
        let route = self.understander.route(question);
        run.end(Agent::Router, started, json!({ "route": route })).await?;

        if route == Route::Conversation {
            let narration = self
                .narrate(run, question, Subject::Conversation, &[], 0)
                .await?;
            return run.finish(DoneStatus::Conversation, false, None, narration, 1).await;
        }

        // understanding
        let started = run.start(Agent::Understander, "Understanding the question").await?;
        let mut spec = self.understander.rules(question, &request.history);
        if Understander::needs_fallback(&spec) {
            if let Some(provider) = &self.provider {
                spec = self.consult(run, provider.as_ref(), question, spec).await?;
            }
        }
        let unclear = spec.unclear();
        let spec_json = serde_json::to_value(&spec).unwrap_or(Value::Null);
        if !unclear.is_empty() {
            let text = clarifying_question(&unclear);
            run.emit(Event::TextDelta {
                agent: Agent::Understander,
                content: text.clone(),
            })
            .await?;
            run.end(
                Agent::Understander,
                started,
                json!({ "specification": spec_json, "unclear": unclear }),
            )
            .await?;
            return run
                .finish(DoneStatus::Clarification, false, Some(spec), text, 0)
                .await;
        }
        run.end(Agent::Understander, started, json!({ "specification": spec_json }))
            .await?;

        // compile
        let started = run.start(Agent::Compiler, "Compiling the query").await?;
        let query = match self.catalog.compile(&spec, None) {
            Ok(query) => query,
            Err(e) => return Err(run.fail(Agent::Compiler, started, e.into()).await),
        };
        run.end(
            Agent::Compiler,
            started,
            json!({
                "operation": query.tag,
                "sql": query.sql,
                "params": query.params,
                "fingerprint": query.fingerprint(),
            }),
        )
        .await?;

        // execute
        let started = run.start(Agent::Executor, "Running the query").await?;
        let limits = ExecutionLimits {
            row_cap: self.policy.row_cap,
            timeout: Duration::from_millis(self.policy.query_timeout_ms),
        };
        let executed = bounded(
            run.emitter.disconnected(),
            limits.timeout,
            self.executor.execute(&query, limits),
        )
        .await?
        .unwrap_or(Err(ExecutionError::Timeout(self.policy.query_timeout_ms)));
        run.emit(Event::SqlExecuted {
            query: query.sql.clone(),
            params: query.params.clone(),
            rows_found: executed.as_ref().map_or(0, |rows| rows.len()),
            error: executed.as_ref().err().map(|e| e.to_string()),
            duration: started.elapsed().as_secs_f64(),
        })
        .await?;
        let rows = match executed {
            Ok(rows) => rows,
            Err(e) => return Err(run.fail(Agent::Executor, started, e.into()).await),
        };
        run.end(
            Agent::Executor,
            started,
            json!({ "rows": rows.len(), "columns": rows.columns }),
        )
        .await?;

        // narrate, validate, rewrite
        let subject = Subject::Data {
            spec: &spec,
            query: &query,
            rows: &rows,
        };
        let mut feedback: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            let narration = self
                .narrate(run, question, subject, &feedback, attempt)
                .await?;

            let started = run.start(Agent::Validator, "Checking the answer").await?;
            let verdict = self.validator.validate(question, &subject, &narration);
            run.emit(Event::Validation {
                status: verdict.status,
                issues: verdict.issues.clone(),
                feedback: verdict.feedback.clone(),
            })
            .await?;
            run.end(
                Agent::Validator,
                started,
                json!({ "status": verdict.status, "attempt": attempt }),
            )
            .await?;

            let uncertain = match verdict.status {
                ValidationStatus::Ok => false,
                ValidationStatus::Failed => true,
                ValidationStatus::Rewrite if attempt < self.policy.max_rewrites => {
                    feedback.push(
                        verdict
                            .feedback
                            .unwrap_or_else(|| verdict.issues.join("; ")),
                    );
                    attempt += 1;
                    tracing::debug!(attempt, "narration sent back for rewrite");
                    continue;
                }
                ValidationStatus::Rewrite => true,
            };
            return run
                .finish(
                    DoneStatus::Answered,
                    uncertain,
                    Some(spec.clone()),
                    narration,
                    attempt + 1,
                )
                .await;
        }
    }

    /// Ask the completion provider for the facets the rules left open.
    ///
    /// Provider failures and rejected proposals leave `spec` as it was.
    async fn consult(
        &self,
        run: &mut Run,
        provider: &dyn CompletionProvider,
        question: &str,
        spec: QuerySpecification,
    ) -> Result<QuerySpecification, PipelineError> {
        let unresolved = spec.unclear();
        run.emit(Event::ToolStart {
            agent: Agent::Understander,
            name: TOOL_NAME.to_string(),
            input: json!({ "question": question, "unresolved": unresolved }),
        })
        .await?;
        let started = Instant::now();
        let request = self.understander.request(question, &unresolved);
        let limit = Duration::from_millis(self.policy.provider_timeout_ms);
        let answer = bounded(run.emitter.disconnected(), limit, provider.extract(&request))
            .await?
            .unwrap_or(Err(ProviderError::Timeout(self.policy.provider_timeout_ms)));

        let (spec, result, error) = match answer {
            Ok(completion) => {
                run.usage += completion.usage;
                match self.understander.fallback(spec.clone(), &completion.proposal) {
                    Ok(merged) => (merged, Some(completion.proposal), None),
                    Err(issues) => {
                        let reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                        tracing::info!(issues = %reasons.join("; "), "proposal rejected");
                        (spec, None, Some(format!("proposal rejected: {}", reasons.join("; "))))
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "completion provider failed; facets stay unclear");
                (spec, None, Some(e.to_string()))
            }
        };
        run.emit(Event::ToolEnd {
            agent: Agent::Understander,
            name: TOOL_NAME.to_string(),
            result,
            error,
            duration: started.elapsed().as_secs_f64(),
        })
        .await?;
        Ok(spec)
    }

    /// One narrator stage; fragments are streamed as `text_delta`.
    async fn narrate(
        &self,
        run: &mut Run,
        question: &str,
        subject: Subject<'_>,
        feedback: &[String],
        attempt: u32,
    ) -> Result<String, PipelineError> {
        let message = if attempt == 0 {
            "Writing the answer".to_string()
        } else {
            format!("Rewriting the answer (attempt {})", attempt + 1)
        };
        let started = run.start(Agent::Narrator, &message).await?;
        let request = NarrationRequest {
            question,
            subject,
            feedback,
            attempt,
        };
        let limit = Duration::from_millis(self.policy.provider_timeout_ms);
        let disconnected = run.emitter.disconnected();
        let mut sink = StreamSink {
            emitter: &mut run.emitter,
            text: String::new(),
        };
        let produced = bounded(disconnected, limit, self.narrator.narrate(&request, &mut sink))
            .await?
            .unwrap_or(Err(ProviderError::Timeout(self.policy.provider_timeout_ms)));
        let text = sink.text;
        match produced {
            Ok(usage) => {
                run.usage += usage;
                run.end(
                    Agent::Narrator,
                    started,
                    json!({ "attempt": attempt, "characters": text.len() }),
                )
                .await?;
                Ok(text)
            }
            Err(ProviderError::Disconnected) => Err(PipelineError::Disconnected),
            Err(e) => Err(run.fail(Agent::Narrator, started, e.into()).await),
        }
    }
}

/// Await `work` under a deadline, giving up early if the client leaves.
///
/// `Ok(None)` means the deadline passed. Dropping `work` cancels it.
async fn bounded<T>(
    disconnected: impl Future<Output = ()>,
    limit: Duration,
    work: impl Future<Output = T>,
) -> Result<Option<T>, PipelineError> {
    tokio::select! {
        _ = disconnected => Err(PipelineError::Disconnected),
        done = tokio::time::timeout(limit, work) => Ok(done.ok()),
    }
}

/// Streams narration fragments while keeping the full text.
struct StreamSink<'a> {
    emitter: &'a mut Emitter,
    text: String,
}

#[async_trait]
impl<'a> FragmentSink for StreamSink<'a> {
    async fn fragment(&mut self, text: &str) -> Result<(), ProviderError> {
        self.text.push_str(text);
        self.emitter
            .emit(Event::TextDelta {
                agent: Agent::Narrator,
                content: text.to_string(),
            })
            .await
            .map_err(|_| ProviderError::Disconnected)
    }
}

/// Per-request bookkeeping: emitter, clock and usage.
struct Run {
    emitter: Emitter,
    started: Instant,
    usage: Usage,
}

impl Run {
    fn new(emitter: Emitter) -> Self {
        Self {
            emitter,
            started: Instant::now(),
            usage: Usage::default(),
        }
    }

    async fn emit(&mut self, event: Event) -> Result<(), PipelineError> {
        self.emitter.emit(event).await
    }

    async fn start(&mut self, agent: Agent, message: &str) -> Result<Instant, PipelineError> {
        tracing::debug!(%agent, "stage started");
        self.emit(Event::StepStart {
            agent,
            message: message.to_string(),
        })
        .await?;
        Ok(Instant::now())
    }

    async fn end(&mut self, agent: Agent, started: Instant, result: Value) -> Result<(), PipelineError> {
        let duration = started.elapsed().as_secs_f64();
        tracing::debug!(%agent, duration, "stage completed");
        self.emit(Event::StepEnd {
            agent,
            state: StepState::Completed,
            result,
            duration,
        })
        .await
    }

    /// Close the stage as failed and emit the terminal error. Returns the
    /// error to propagate, or `Disconnected` if the client already left.
    async fn fail(&mut self, agent: Agent, started: Instant, error: PipelineError) -> PipelineError {
        let message = error.to_string();
        let ended = self
            .emit(Event::StepEnd {
                agent,
                state: StepState::Failed,
                result: json!({ "error": message }),
                duration: started.elapsed().as_secs_f64(),
            })
            .await;
        if let Err(e) = ended {
            return e;
        }
        match self.emit(Event::Error { message }).await {
            Ok(()) => error,
            Err(e) => e,
        }
    }

    async fn finish(
        &mut self,
        status: DoneStatus,
        uncertain: bool,
        spec: Option<QuerySpecification>,
        narration: String,
        narrator_attempts: u32,
    ) -> Result<Outcome, PipelineError> {
        let usage = self.usage;
        self.emit(Event::Usage(usage)).await?;
        let request_id = self.emitter.request_id().to_string();
        self.emit(Event::Done {
            request_id: request_id.clone(),
            status,
            total_duration: self.started.elapsed().as_secs_f64(),
            uncertain,
            usage,
        })
        .await?;
        Ok(Outcome {
            request_id,
            status,
            uncertain,
            spec,
            narration,
            narrator_attempts,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixture;
    use crate::core::compiler::SqlParam;
    use crate::core::types::{DataConfig, Facet, OperationTag};
    use crate::engine::sqlite::{create_table, insert_bars, SqliteExecutor};
    use crate::engine::RowSet;
    use crate::provider::scripted::{ScriptedNarrator, ScriptedProvider, SCRIPTED_USAGE};
    use crate::provider::template::TemplateNarrator;
    use crate::understand::Clock;
    use chrono::NaiveDate;
    use std::path::Path;
    use validator::Verdict;

    fn write_db(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("bars.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        create_table(&conn, "bars").unwrap();
        insert_bars(&conn, "bars", &fixture::bars()).unwrap();
        path
    }

    fn build(
        dir: &Path,
        executor: Option<Arc<dyn DataExecutor>>,
        narrator: Arc<dyn Narrator>,
        policy: PipelinePolicy,
    ) -> Pipeline {
        let path = write_db(dir);
        let data = DataConfig {
            database: path.clone(),
            table: "bars".to_string(),
            symbols: vec!["NQ".to_string(), "ES".to_string()],
            default_symbol: Some("NQ".to_string()),
        };
        let catalog = Catalog::builtin("bars").unwrap();
        let understander = Understander::new(Arc::clone(&catalog), &data)
            .with_clock(Clock::Fixed(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap()));
        let executor = executor
            .unwrap_or_else(|| Arc::new(SqliteExecutor::new(path)) as Arc<dyn DataExecutor>);
        Pipeline::new(catalog, understander, executor, narrator, policy)
    }

    async fn ask(pipeline: &Pipeline, question: &str) -> (Result<Outcome, PipelineError>, Vec<Event>) {
        let (tx, mut rx) = mpsc::channel(512);
        let emitter = Emitter::new(tx, "q-test");
        let result = pipeline.run(Request::new(question), emitter).await;
        let mut events = Vec::new();
        while let Some(envelope) = rx.recv().await {
            events.push(envelope.event);
        }
        (result, events)
    }

    fn started(events: &[Event]) -> Vec<Agent> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::StepStart { agent, .. } => Some(*agent),
                _ => None,
            })
            .collect()
    }

    fn streamed(events: &[Event], from: Agent) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Event::TextDelta { agent, content } if *agent == from => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    struct AlwaysRewrite;

    impl Validator for AlwaysRewrite {
        fn validate(&self, _question: &str, _subject: &Subject<'_>, narration: &str) -> Verdict {
            Verdict {
                status: ValidationStatus::Rewrite,
                issues: vec![format!("rejected '{}'", narration)],
                feedback: Some("try again".to_string()),
            }
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl DataExecutor for BrokenExecutor {
        async fn execute(
            &self,
            _query: &crate::core::compiler::CompiledQuery,
            _limits: ExecutionLimits,
        ) -> Result<RowSet, ExecutionError> {
            Err(ExecutionError::Engine("disk gone".to_string()))
        }
    }

    struct StalledExecutor;

    #[async_trait]
    impl DataExecutor for StalledExecutor {
        async fn execute(
            &self,
            _query: &crate::core::compiler::CompiledQuery,
            _limits: ExecutionLimits,
        ) -> Result<RowSet, ExecutionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RowSet::default())
        }
    }

    #[tokio::test]
    async fn test_mq060_answers_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default());
        let (result, events) = ask(&p, "volatility for 2024").await;
        let outcome = result.unwrap();

        assert_eq!(outcome.status, DoneStatus::Answered);
        assert!(!outcome.uncertain);
        assert_eq!(outcome.narrator_attempts, 1);
        assert_eq!(
            started(&events),
            vec![
                Agent::Router,
                Agent::Understander,
                Agent::Compiler,
                Agent::Executor,
                Agent::Narrator,
                Agent::Validator
            ]
        );
        let (params, rows_found) = events
            .iter()
            .find_map(|e| match e {
                Event::SqlExecuted {
                    params, rows_found, ..
                } => Some((params.clone(), *rows_found)),
                _ => None,
            })
            .unwrap();
        assert_eq!(rows_found, 1);
        assert!(params.contains(&SqlParam::Text("2024-01-01".to_string())));
        assert!(params.contains(&SqlParam::Text("2025-01-01".to_string())));
        assert!(params.contains(&SqlParam::Text("NQ".to_string())));

        assert_eq!(streamed(&events, Agent::Narrator), outcome.narration);
        assert!(outcome.narration.contains("over 7 bars"));
        assert!(outcome.usage.output_tokens > 0);

        let n = events.len();
        assert!(matches!(events[n - 2], Event::Usage(u) if u == outcome.usage));
        match &events[n - 1] {
            Event::Done {
                request_id,
                status,
                uncertain,
                ..
            } => {
                assert_eq!(request_id, "q-test");
                assert_eq!(*status, DoneStatus::Answered);
                assert!(!uncertain);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mq060_rewrites_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let narrator = Arc::new(ScriptedNarrator::repeat("NQ went up."));
        let p = build(
            dir.path(),
            None,
            Arc::clone(&narrator) as Arc<dyn Narrator>,
            PipelinePolicy::default(),
        )
        .with_validator(Arc::new(AlwaysRewrite));
        let (result, events) = ask(&p, "average close in January 2024").await;
        let outcome = result.unwrap();

        assert_eq!(narrator.calls(), 3);
        assert_eq!(outcome.narrator_attempts, 3);
        assert!(outcome.uncertain);
        assert_eq!(outcome.status, DoneStatus::Answered);
        let verdicts = events
            .iter()
            .filter(|e| matches!(e, Event::Validation { .. }))
            .count();
        assert_eq!(verdicts, 3);
        let lengths: Vec<usize> = narrator.feedback_seen().iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![0, 1, 2]);
        assert!(matches!(
            events.last(),
            Some(Event::Done { uncertain: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_mq060_zero_rewrites_narrates_once() {
        let dir = tempfile::tempdir().unwrap();
        let narrator = Arc::new(ScriptedNarrator::repeat("NQ went up."));
        let policy = PipelinePolicy {
            max_rewrites: 0,
            ..PipelinePolicy::default()
        };
        let p = build(dir.path(), None, Arc::clone(&narrator) as Arc<dyn Narrator>, policy)
            .with_validator(Arc::new(AlwaysRewrite));
        let (result, _) = ask(&p, "average close in January 2024").await;
        assert!(result.unwrap().uncertain);
        assert_eq!(narrator.calls(), 1);
    }

    #[tokio::test]
    async fn test_mq060_ungrounded_narration_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            "NQ averaged 999.5 in January 2024.".to_string(),
            "NQ averaged 104.2 in January 2024.".to_string(),
        ]));
        let p = build(
            dir.path(),
            None,
            Arc::clone(&narrator) as Arc<dyn Narrator>,
            PipelinePolicy::default(),
        );
        let (result, events) = ask(&p, "average close in January 2024").await;
        let outcome = result.unwrap();
        assert!(!outcome.uncertain);
        assert_eq!(outcome.narrator_attempts, 2);
        assert_eq!(outcome.narration, "NQ averaged 104.2 in January 2024.");
        let statuses: Vec<ValidationStatus> = events
            .iter()
            .filter_map(|e| match e {
                Event::Validation { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ValidationStatus::Rewrite, ValidationStatus::Ok]);
        assert!(narrator.feedback_seen()[1][0].contains("999.5"));
    }

    #[tokio::test]
    async fn test_mq060_unclear_year_asks() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default());
        let (result, events) = ask(&p, "average close in March").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.status, DoneStatus::Clarification);
        assert_eq!(outcome.narration, "Could you tell me which year you mean?");
        assert_eq!(started(&events), vec![Agent::Router, Agent::Understander]);
        assert_eq!(streamed(&events, Agent::Understander), outcome.narration);
        assert!(!events.iter().any(|e| matches!(e, Event::SqlExecuted { .. })));
        assert!(matches!(
            events.last(),
            Some(Event::Done {
                status: DoneStatus::Clarification,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_mq060_conversation_skips_data_stages() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default());
        let (result, events) = ask(&p, "hello there").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.status, DoneStatus::Conversation);
        assert!(outcome.spec.is_none());
        assert_eq!(started(&events), vec![Agent::Router, Agent::Narrator]);
        assert!(!outcome.narration.is_empty());
    }

    #[tokio::test]
    async fn test_mq060_execution_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(
            dir.path(),
            Some(Arc::new(BrokenExecutor)),
            Arc::new(TemplateNarrator),
            PipelinePolicy::default(),
        );
        let (result, events) = ask(&p, "average close in January 2024").await;
        assert!(matches!(
            result,
            Err(PipelineError::Execution(ExecutionError::Engine(_)))
        ));
        let sql_error = events.iter().find_map(|e| match e {
            Event::SqlExecuted { error, .. } => error.clone(),
            _ => None,
        });
        assert_eq!(sql_error.as_deref(), Some("data engine error: disk gone"));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StepEnd {
                agent: Agent::Executor,
                state: StepState::Failed,
                ..
            }
        )));
        assert!(matches!(events.last(), Some(Event::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::Done { .. })));
        assert!(!started(&events).contains(&Agent::Narrator));
    }

    #[tokio::test]
    async fn test_mq060_query_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PipelinePolicy {
            query_timeout_ms: 50,
            ..PipelinePolicy::default()
        };
        let p = build(
            dir.path(),
            Some(Arc::new(StalledExecutor)),
            Arc::new(TemplateNarrator),
            policy,
        );
        let (result, events) = ask(&p, "average close in January 2024").await;
        assert!(matches!(
            result,
            Err(PipelineError::Execution(ExecutionError::Timeout(50)))
        ));
        assert!(matches!(events.last(), Some(Event::Error { message }) if message.contains("50 ms")));
    }

    #[tokio::test]
    async fn test_mq060_disconnect_abandons_request() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(build(
            dir.path(),
            Some(Arc::new(StalledExecutor)),
            Arc::new(TemplateNarrator),
            PipelinePolicy::default(),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let emitter = Emitter::new(tx, "q-gone");
        let reader = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if matches!(
                    envelope.event,
                    Event::StepStart {
                        agent: Agent::Executor,
                        ..
                    }
                ) {
                    break;
                }
            }
        });
        let clock = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            p.run(Request::new("average close in January 2024"), emitter),
        )
        .await
        .unwrap();
        reader.await.unwrap();
        assert!(result.unwrap_err().is_disconnect());
        assert!(clock.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_mq060_spawned_requests_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(build(
            dir.path(),
            None,
            Arc::new(TemplateNarrator),
            PipelinePolicy::default(),
        ));
        let (first_id, first) = p.spawn(Request::new("average close in January 2024"));
        let (second_id, mut second) = p.spawn(Request::new("hello"));
        assert_ne!(first_id, second_id);
        drop(first);

        let mut last = None;
        while let Some(envelope) = second.recv().await {
            assert_eq!(envelope.request_id, second_id);
            last = Some(envelope.event);
        }
        assert!(matches!(
            last,
            Some(Event::Done {
                status: DoneStatus::Conversation,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_mq060_provider_fills_operation() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::always(json!({
            "operation": "aggregate",
            "metric": "close",
            "payload": {"func": "avg", "group_by": "none"}
        })));
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default())
            .with_provider(Arc::clone(&provider) as Arc<dyn CompletionProvider>);
        let (result, events) = ask(&p, "how did things go in 2024").await;
        let outcome = result.unwrap();

        assert_eq!(provider.calls(), 1);
        let spec = outcome.spec.unwrap();
        assert_eq!(spec.operation, Facet::Resolved(OperationTag::Aggregate));
        assert_eq!(outcome.status, DoneStatus::Answered);
        assert!(!outcome.uncertain);
        assert!(outcome.usage.input_tokens >= SCRIPTED_USAGE.input_tokens);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolStart { name, .. } if name == TOOL_NAME
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolEnd { result: Some(_), error: None, .. }
        )));
    }

    #[tokio::test]
    async fn test_mq060_provider_failure_degrades_to_clarification() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default())
            .with_provider(Arc::new(ScriptedProvider::failing("overloaded")));
        let (result, events) = ask(&p, "how did things go in 2024").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.status, DoneStatus::Clarification);
        let error = events.iter().find_map(|e| match e {
            Event::ToolEnd { error, .. } => error.clone(),
            _ => None,
        });
        assert!(error.unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_mq060_rejected_proposal_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = build(dir.path(), None, Arc::new(TemplateNarrator), PipelinePolicy::default())
            .with_provider(Arc::new(ScriptedProvider::always(json!({
                "operation": "stats",
                "metric": "close",
                "mood": "bullish"
            }))));
        let (result, events) = ask(&p, "how did things go in 2024").await;
        assert_eq!(result.unwrap().status, DoneStatus::Clarification);
        let error = events.iter().find_map(|e| match e {
            Event::ToolEnd { error, .. } => error.clone(),
            _ => None,
        });
        assert!(error.unwrap().starts_with("proposal rejected"));
    }
}
