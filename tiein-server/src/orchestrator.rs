//! Drives rounds of upstream streaming and tool execution for one request.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tiein_shared::{ChatRequest, OutputFrame, ToolCall};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::accumulator::{AccumulatedCall, ToolCallAccumulator};
use crate::aggregator::ContentAggregator;
use crate::catalog::{tool_id_from_function_name, ToolCatalog, ToolDescriptor, ToolExecutionResult};
use crate::composer::{compose_followup, inject_resources, prepare_request};
use crate::config::OrchestratorLimits;
use crate::delta::{decode_line, StreamEvent};
use crate::error::GatewayError;
use crate::upstream::UpstreamClient;

const OUTPUT_BUFFER: usize = 64;

/// State owned by a single request for its whole lifetime.
#[derive(Debug, Default)]
struct RequestContext {
    tools: Vec<ToolDescriptor>,
    round: u32,
    followups: u32,
}

enum RoundOutcome {
    Terminal,
    ToolCalls(Vec<AccumulatedCall>),
    Cancelled,
}

enum Flow {
    Completed,
    Cancelled,
}

pub struct GatewayOrchestrator {
    upstream: Arc<dyn UpstreamClient>,
    catalog: Arc<dyn ToolCatalog>,
    limits: OrchestratorLimits,
    default_model: String,
}

impl GatewayOrchestrator {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        catalog: Arc<dyn ToolCatalog>,
        limits: OrchestratorLimits,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            catalog,
            limits,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Spawn the request and hand back its output sequence. Dropping the
    /// receiver cancels the request.
    pub fn start(self: &Arc<Self>, request: ChatRequest) -> mpsc::Receiver<OutputFrame> {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(request, tx).await;
        });
        rx
    }

    /// Run every round of `request`, writing to `tx`. Unless the caller goes
    /// away, the last frame sent is always `OutputFrame::Done`.
    pub async fn run(&self, request: ChatRequest, tx: mpsc::Sender<OutputFrame>) {
        match self.drive(request, &tx).await {
            Ok(Flow::Completed) => {}
            Ok(Flow::Cancelled) => {
                info!("Caller disconnected; abandoning request");
                return;
            }
            Err(err) => {
                error!("Chat request failed: {}", err);
                let frame = OutputFrame::error(err.status_code(), err.to_string());
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
        let _ = tx.send(OutputFrame::Done).await;
    }

    async fn drive(
        &self,
        request: ChatRequest,
        tx: &mpsc::Sender<OutputFrame>,
    ) -> Result<Flow, GatewayError> {
        let mut request = prepare_request(request, &self.default_model);
        let mut context = RequestContext::default();

        if let Some(group_id) = request.tool_group_id.clone() {
            context.tools = self.catalog.tools(&group_id).await;
            let resources = self.catalog.resources(&group_id).await;
            inject_resources(&mut request.history, &resources);
            info!(
                "Tool group {}: {} tools, {} resources",
                group_id,
                context.tools.len(),
                resources.len()
            );
        }

        loop {
            context.round += 1;
            let calls = match self.stream_round(&request, &context, tx).await? {
                RoundOutcome::Terminal => return Ok(Flow::Completed),
                RoundOutcome::Cancelled => return Ok(Flow::Cancelled),
                RoundOutcome::ToolCalls(calls) => calls,
            };

            if context.followups >= self.limits.max_followup_rounds {
                return Err(GatewayError::RoundBudgetExceeded {
                    max_followup_rounds: self.limits.max_followup_rounds,
                });
            }

            let Some(results) = self.execute_tools(&calls, tx).await else {
                return Ok(Flow::Cancelled);
            };
            let tool_calls: Vec<ToolCall> = calls.into_iter().map(|c| c.call).collect();
            request = compose_followup(&request, &tool_calls, &results);
            context.followups += 1;
        }
    }

    async fn stream_round(
        &self,
        request: &ChatRequest,
        context: &RequestContext,
        tx: &mpsc::Sender<OutputFrame>,
    ) -> Result<RoundOutcome, GatewayError> {
        info!(
            round = context.round,
            messages = request.history.len(),
            tools = context.tools.len(),
            "Starting upstream round"
        );
        let wait = self.limits.upstream_timeout;

        let opened = tokio::select! {
            biased;
            _ = tx.closed() => return Ok(RoundOutcome::Cancelled),
            opened = timeout(wait, self.upstream.open_stream(request, &context.tools)) => opened,
        };
        let mut lines = opened.map_err(|_| GatewayError::UpstreamTimeout(wait))??;

        let mut accumulator = ToolCallAccumulator::new();
        let mut content = ContentAggregator::new(tx, self.limits.content_release);

        'lines: loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return Ok(RoundOutcome::Cancelled),
                next = timeout(wait, lines.next()) => next,
            };
            let line = match next {
                Err(_) => return Err(GatewayError::UpstreamTimeout(wait)),
                Ok(None) => {
                    return Err(GatewayError::UpstreamTransport(
                        "stream closed before [DONE]".to_string(),
                    ))
                }
                Ok(Some(line)) => line?,
            };

            let events = match decode_line(&line) {
                Ok(events) => events,
                Err(err @ GatewayError::MalformedLine { .. }) => {
                    warn!("Skipping upstream line: {}", err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            for event in events {
                match event {
                    StreamEvent::Content(text) => {
                        if content.forward(text).await.is_err() {
                            return Ok(RoundOutcome::Cancelled);
                        }
                    }
                    StreamEvent::ToolFragment(fragment) => {
                        content.suppress();
                        if let Err(err) = accumulator.apply(fragment) {
                            warn!("{}", err);
                        }
                    }
                    StreamEvent::End => break 'lines,
                }
            }
        }
        if content.finish().await.is_err() {
            return Ok(RoundOutcome::Cancelled);
        }

        let calls = accumulator.finish();
        if calls.is_empty() {
            Ok(RoundOutcome::Terminal)
        } else {
            info!(round = context.round, calls = calls.len(), "Round requested tool calls");
            Ok(RoundOutcome::ToolCalls(calls))
        }
    }

    /// Execute calls one after another in completion order. `None` means the
    /// caller left; any result produced after that is discarded.
    async fn execute_tools(
        &self,
        calls: &[AccumulatedCall],
        tx: &mpsc::Sender<OutputFrame>,
    ) -> Option<Vec<ToolExecutionResult>> {
        let mut results = Vec::with_capacity(calls.len());
        for AccumulatedCall { call, defect } in calls {
            if tx.is_closed() {
                return None;
            }
            let result = match defect {
                Some(defect) => {
                    warn!("Not executing malformed tool call {}: {}", call.id, defect);
                    ToolExecutionResult::failed(&call.id, format!("Malformed tool call: {defect}"))
                }
                None => self.execute_one(call).await,
            };
            if tx.is_closed() {
                info!("Discarding result of tool call {} after disconnect", call.id);
                return None;
            }
            results.push(result);
        }
        Some(results)
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolExecutionResult {
        let Some(tool_id) = tool_id_from_function_name(&call.name) else {
            warn!("Tool call {} names unknown tool {:?}", call.id, call.name);
            return ToolExecutionResult::failed(&call.id, format!("Unknown tool: {}", call.name));
        };
        let arguments = parse_arguments(call);

        info!(call_id = %call.id, tool_id, "Executing tool");
        let limit = self.limits.tool_execution_timeout;
        match timeout(limit, self.catalog.execute(tool_id, arguments)).await {
            Ok(outcome) => {
                if !outcome.success {
                    warn!(
                        call_id = %call.id,
                        tool_id,
                        "Tool failed: {}",
                        outcome.error_message.as_deref().unwrap_or("no message")
                    );
                }
                ToolExecutionResult::from_outcome(&call.id, outcome)
            }
            Err(_) => {
                warn!(call_id = %call.id, tool_id, "Tool timed out after {:?}", limit);
                ToolExecutionResult::failed(
                    &call.id,
                    format!("Tool execution timed out after {}s", limit.as_secs_f32()),
                )
            }
        }
    }
}

/// Arguments as a JSON object; anything else falls back to an empty map.
fn parse_arguments(call: &ToolCall) -> Map<String, Value> {
    if call.arguments.trim().is_empty() {
        return Map::new();
    }
    let reason = match serde_json::from_str::<Value>(&call.arguments) {
        Ok(Value::Object(map)) => return map,
        Ok(other) => format!("expected a JSON object, got {other}"),
        Err(e) => e.to_string(),
    };
    let err = GatewayError::ToolArgumentParse {
        call_id: call.id.clone(),
        reason,
    };
    warn!("{}; using empty arguments", err);
    Map::new()
}
