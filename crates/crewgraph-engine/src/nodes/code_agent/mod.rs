//! Interactive coding-agent node.
//!
//! Posts a prompt to a remote agent session, then polls the session on a
//! fast tick until the agent answers, goes idle, stalls or runs out of time.
//! Progress is streamed as `code_agent_stream` telemetry and fed to
//! user-authored callbacks.

mod callbacks;
mod extract;
mod tracker;

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::CodeAgentNodeSpec;
use crewgraph_core::traits::CodeAgentService;
use crewgraph_core::types::{AgentPrompt, AgentSession, MessageType, RunStatus};
use crewgraph_core::variables::ExecutionState;

use crate::context::RunContext;

pub use callbacks::CallbackChain;
pub use extract::{extract, Extraction};
pub use tracker::{AgentState, Exit, PollTimings, PollTracker, TickOutcome};

/// Prefixed to the first prompt of a freshly created session.
pub const RUNTIME_GUARDRAIL: &str = "You are running as an automated step inside a workflow. \
Nobody is watching this session interactively: do not ask clarifying questions, \
work with the information given, and finish with a final answer.";

/// Reply handed to `on_complete` when the run is stopped mid-loop.
pub const STOPPED_MESSAGE: &str = "Stopped: the run was cancelled before the agent finished.";

enum LoopEnd {
    Stopped,
    Failed(CrewGraphError),
}

pub struct CodeAgentNode {
    spec: CodeAgentNodeSpec,
}

impl CodeAgentNode {
    pub fn new(spec: CodeAgentNodeSpec) -> Self {
        Self { spec }
    }

    fn prompt(&self, name: &str, input: &Map<String, Value>) -> Result<String> {
        if let Some(Value::String(p)) = input.get("prompt") {
            if !p.trim().is_empty() {
                return Ok(p.clone());
            }
        }
        self.spec
            .prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                CrewGraphError::Config(format!(
                    "code-agent node '{name}' has no prompt (set `prompt` or map a `prompt` input)"
                ))
            })
    }

    fn conversation_id(&self, name: &str, input: &Map<String, Value>, ctx: &RunContext) -> String {
        match input.get("conversation_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => self
                .spec
                .session_title
                .clone()
                .unwrap_or_else(|| format!("{}-{}", ctx.run_id, name)),
        }
    }

    fn first_prompt(&self, prompt: &str) -> String {
        let mut text = String::from(RUNTIME_GUARDRAIL);
        if let Some(system) = self.spec.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            text.push_str("\n\n");
            text.push_str(system.trim());
        }
        text.push_str("\n\n");
        text.push_str(prompt);
        text
    }

    /// Drive one prompt to completion and return the reply, session and handler state.
    pub async fn execute(
        &self,
        name: &str,
        state: &ExecutionState,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        let agent = ctx.services.agent(name)?;
        let timings = PollTimings::resolve(
            &self.spec.timing,
            &ctx.services.code_agent,
            &ctx.services.engine,
        );
        let step = state.step();
        let prompt = self.prompt(name, input)?;
        let title = self.conversation_id(name, input, ctx);

        debug!(run_id = %ctx.run_id, node = %name, state = %AgentState::Starting, %title, "Resolving agent session");
        let (session, fresh) = resolve_session(agent.as_ref(), &title).await?;
        let baseline: HashSet<String> = if fresh {
            HashSet::new()
        } else {
            agent
                .messages(&session.id)
                .await?
                .into_iter()
                .map(|m| m.id)
                .collect()
        };

        let text = if fresh {
            self.first_prompt(&prompt)
        } else {
            prompt.clone()
        };
        let outbound = AgentPrompt {
            text,
            agent: self.spec.agent.clone(),
            model: self.spec.model.clone(),
            max_wait_s: Some(timings.max_wait.as_secs_f64()),
        };
        let mut post: Option<JoinHandle<Result<()>>> = Some({
            let agent = agent.clone();
            let session_id = session.id.clone();
            tokio::spawn(async move { agent.send_message(&session_id, outbound).await })
        });
        info!(
            run_id = %ctx.run_id,
            node = %name,
            session_id = %session.id,
            fresh,
            "Prompt dispatched to agent session"
        );

        let mut chain = CallbackChain::new(ctx.services.script.clone(), name, input);
        if let Some(cb) = &self.spec.callbacks.on_stream_start {
            chain.submit(
                cb,
                "stream_start",
                json!({"session_id": session.id, "prompt": prompt}),
            );
        }

        let mut tracker = PollTracker::new(timings.clone(), Instant::now());
        let outcome = self
            .poll(name, step, ctx, agent.as_ref(), &session, &baseline, &mut post, &mut tracker, &mut chain)
            .await;

        if let Some(handle) = post.take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        match outcome {
            Ok(exit) => {
                let final_state = exit.state();
                let reply = match &exit {
                    Exit::Answered(answer) => answer.clone(),
                    _ => tracker.reply(),
                };
                info!(
                    run_id = %ctx.run_id,
                    node = %name,
                    state = %final_state,
                    exit = ?exit,
                    reply_len = reply.len(),
                    "Code agent finished"
                );
                ctx.emit(
                    name,
                    MessageType::CodeAgentStream,
                    step,
                    json!({
                        "text": reply,
                        "state": final_state,
                        "session_id": session.id,
                        "final": true,
                    }),
                );
                if let Some(cb) = &self.spec.callbacks.on_complete {
                    chain.submit(
                        cb,
                        "complete",
                        json!({"reply": reply, "state": final_state, "session_id": session.id}),
                    );
                }
                chain.drain(timings.callback_drain).await;
                Ok(json!({
                    "reply": reply,
                    "session_id": session.id,
                    "state": final_state,
                    "handler_state": chain.state().await,
                }))
            }
            Err(LoopEnd::Failed(e)) => {
                tracker.set_state(AgentState::Failed);
                warn!(run_id = %ctx.run_id, node = %name, error = %e, "Code agent failed");
                chain.drain(timings.callback_grace).await;
                Err(e)
            }
            Err(LoopEnd::Stopped) => {
                tracker.set_state(AgentState::Stopped);
                let status = ctx.stop.status().unwrap_or(RunStatus::Stop);
                info!(run_id = %ctx.run_id, node = %name, %status, "Code agent stopped, cleaning up");
                if let Err(e) = agent.abort(&session.id).await {
                    warn!(node = %name, session_id = %session.id, error = %e, "Remote abort failed");
                }
                chain.drain(timings.callback_grace).await;
                if let Some(cb) = &self.spec.callbacks.on_complete {
                    chain
                        .run_now(
                            cb,
                            "complete",
                            json!({
                                "reply": STOPPED_MESSAGE,
                                "state": AgentState::Stopped,
                                "session_id": session.id,
                            }),
                            timings.callback_drain,
                        )
                        .await;
                }
                Err(CrewGraphError::Cancelled(status))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll(
        &self,
        name: &str,
        step: usize,
        ctx: &RunContext,
        agent: &dyn CodeAgentService,
        session: &AgentSession,
        baseline: &HashSet<String>,
        post: &mut Option<JoinHandle<Result<()>>>,
        tracker: &mut PollTracker,
        chain: &mut CallbackChain,
    ) -> std::result::Result<Exit, LoopEnd> {
        let tick = tracker.timings().tick;
        let max_failures = tracker.timings().max_poll_failures;
        let mut failures = 0u32;

        loop {
            if ctx.stop.is_set() {
                return Err(LoopEnd::Stopped);
            }
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => return Err(LoopEnd::Stopped),
                _ = tokio::time::sleep(tick) => {}
            }

            if post.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = post.take() {
                    match handle.await {
                        Ok(Ok(())) => debug!(node = %name, "Prompt post completed"),
                        Ok(Err(e)) => return Err(LoopEnd::Failed(e)),
                        Err(e) => {
                            return Err(LoopEnd::Failed(CrewGraphError::RemoteService(format!(
                                "prompt post task failed: {e}"
                            ))))
                        }
                    }
                }
            }

            let read = async {
                let status = agent.session_status().await?;
                let messages = agent.messages(&session.id).await?;
                Ok::<_, CrewGraphError>((status, messages))
            }
            .await;

            let outcome = match read {
                Ok((status, messages)) => {
                    failures = 0;
                    let busy = status
                        .get(&session.id)
                        .copied()
                        .unwrap_or_default()
                        .is_busy();
                    tracker.observe(Instant::now(), busy, extract(&messages, baseline))
                }
                Err(e) => {
                    failures += 1;
                    warn!(node = %name, failures, error = %e, "Agent poll failed");
                    if failures > max_failures {
                        return Err(LoopEnd::Failed(e));
                    }
                    tracker.idle_tick(Instant::now())
                }
            };

            if let Some(text) = outcome.stream {
                ctx.emit(
                    name,
                    MessageType::CodeAgentStream,
                    step,
                    json!({
                        "text": text,
                        "state": tracker.state(),
                        "session_id": session.id,
                        "indicator": false,
                    }),
                );
                if let Some(cb) = &self.spec.callbacks.on_chunk {
                    chain.submit(cb, "chunk", json!({"text": text, "session_id": session.id}));
                }
            }
            if let Some(text) = outcome.indicator {
                ctx.emit(
                    name,
                    MessageType::CodeAgentStream,
                    step,
                    json!({
                        "text": text,
                        "state": tracker.state(),
                        "session_id": session.id,
                        "indicator": true,
                    }),
                );
            }
            if let Some(exit) = outcome.exit {
                return Ok(exit);
            }
        }
    }
}

/// Last session whose title matches exactly, or a new one.
async fn resolve_session(agent: &dyn CodeAgentService, title: &str) -> Result<(AgentSession, bool)> {
    let existing = agent
        .list_sessions()
        .await?
        .into_iter()
        .filter(|s| s.title == title)
        .last();
    match existing {
        Some(session) => Ok((session, false)),
        None => Ok((agent.create_session(title).await?, true)),
    }
}
