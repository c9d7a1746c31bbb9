use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crewgraph_core::config::{CodeAgentConfig, EngineConfig};
use crewgraph_core::schema::CodeAgentTiming;

use super::extract::Extraction;

/// Lifecycle of one code-agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    AwaitingResponse,
    Streaming,
    Completed,
    TimedOut,
    Failed,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::AwaitingResponse => "awaiting_response",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved timing knobs for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTimings {
    pub tick: Duration,
    pub chunk_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub max_wait: Duration,
    pub silence_indicator: Duration,
    pub indicator_repeat: Duration,
    pub max_poll_failures: u32,
    pub callback_grace: Duration,
    pub callback_drain: Duration,
}

const MIN_TICK: Duration = Duration::from_millis(10);

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl PollTimings {
    /// Node overrides first, then the `[code_agent]` defaults.
    pub fn resolve(timing: &CodeAgentTiming, defaults: &CodeAgentConfig, engine: &EngineConfig) -> Self {
        let interval = timing.polling_interval_ms.unwrap_or(defaults.polling_interval_ms);
        Self {
            tick: Duration::from_millis(interval / 4).max(MIN_TICK),
            chunk_timeout: secs(timing.chunk_timeout_s.unwrap_or(defaults.chunk_timeout_s)),
            inactivity_timeout: secs(
                timing.inactivity_timeout_s.unwrap_or(defaults.inactivity_timeout_s),
            ),
            max_wait: secs(timing.max_wait_s.unwrap_or(defaults.max_wait_s)),
            silence_indicator: secs(
                timing.silence_indicator_s.unwrap_or(defaults.silence_indicator_s),
            ),
            indicator_repeat: secs(timing.indicator_repeat_s.unwrap_or(defaults.indicator_repeat_s)),
            max_poll_failures: defaults.max_poll_failures,
            callback_grace: Duration::from_millis(engine.callback_grace_ms),
            callback_drain: Duration::from_millis(engine.callback_drain_ms),
        }
    }
}

/// Why the loop exited.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    /// Final answer present.
    Answered(String),
    /// Session went idle after producing messages.
    Idle,
    /// Nothing arrived within the chunk timeout.
    NeverStarted,
    /// Streamed, then went quiet past the inactivity timeout.
    Stalled,
    /// Hard cap reached.
    MaxWait,
}

impl Exit {
    pub fn state(&self) -> AgentState {
        match self {
            Exit::Answered(_) | Exit::Idle => AgentState::Completed,
            _ => AgentState::TimedOut,
        }
    }
}

/// What the driver should do after one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// New content to stream; triggers the chunk callback.
    pub stream: Option<String>,
    /// Silence indicator update; streamed but not a chunk.
    pub indicator: Option<String>,
    pub exit: Option<Exit>,
}

/// Pure polling state machine, driven by observations and the clock.
pub struct PollTracker {
    timings: PollTimings,
    started: Instant,
    last_activity: Instant,
    last_indicator: Option<Instant>,
    dots: usize,
    seen_messages: usize,
    seen_tools: Vec<String>,
    last_streamed: String,
    streamed: bool,
    last: Extraction,
    state: AgentState,
}

impl PollTracker {
    pub fn new(timings: PollTimings, now: Instant) -> Self {
        Self {
            timings,
            started: now,
            last_activity: now,
            last_indicator: None,
            dots: 0,
            seen_messages: 0,
            seen_tools: Vec::new(),
            last_streamed: String::new(),
            streamed: false,
            last: Extraction::default(),
            state: AgentState::AwaitingResponse,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    pub fn timings(&self) -> &PollTimings {
        &self.timings
    }

    /// Best-effort reply: final answer, else latest text, else streamed reasoning.
    pub fn reply(&self) -> String {
        if let Some(answer) = &self.last.final_answer {
            return answer.clone();
        }
        if !self.last.latest_text.trim().is_empty() {
            return self.last.latest_text.clone();
        }
        self.last.reasoning.trim().to_string()
    }

    /// Only the clock moved (no successful read this tick).
    pub fn idle_tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if now.duration_since(self.started) > self.timings.max_wait {
            outcome.exit = Some(Exit::MaxWait);
        }
        outcome
    }

    pub fn observe(&mut self, now: Instant, busy: bool, extraction: Extraction) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if extraction.message_count > self.seen_messages || extraction.tool_lines != self.seen_tools {
            self.seen_messages = extraction.message_count;
            self.seen_tools = extraction.tool_lines.clone();
            self.touch(now);
        }

        let combined = extraction.combined();
        if !combined.is_empty() && combined != self.last_streamed {
            self.last_streamed = combined.clone();
            self.streamed = true;
            self.state = AgentState::Streaming;
            self.touch(now);
            outcome.stream = Some(combined);
        }

        let reasoning_active = extraction.reasoning_active;
        let answered = extraction.final_answer.clone();
        self.last = extraction;

        let silence = now.duration_since(self.last_activity);
        let elapsed = now.duration_since(self.started);

        outcome.exit = if let Some(answer) = answered {
            Some(Exit::Answered(answer))
        } else if !busy && self.seen_messages > 0 {
            Some(Exit::Idle)
        } else if !busy && !self.streamed && silence > self.timings.chunk_timeout {
            Some(Exit::NeverStarted)
        } else if !busy && self.streamed && !reasoning_active && silence > self.timings.inactivity_timeout {
            Some(Exit::Stalled)
        } else if elapsed > self.timings.max_wait {
            Some(Exit::MaxWait)
        } else {
            None
        };

        if outcome.exit.is_none() && outcome.stream.is_none() && silence > self.timings.silence_indicator {
            let due = match self.last_indicator {
                None => true,
                Some(at) => now.duration_since(at) >= self.timings.indicator_repeat,
            };
            if due {
                self.dots += 1;
                self.last_indicator = Some(now);
                outcome.indicator = Some(format!("{}{}", self.last_streamed, ".".repeat(self.dots)));
            }
        }

        if let Some(exit) = &outcome.exit {
            self.state = exit.state();
        }
        outcome
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_indicator = None;
        self.dots = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> PollTimings {
        PollTimings {
            tick: Duration::from_millis(250),
            chunk_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(20),
            max_wait: Duration::from_secs(60),
            silence_indicator: Duration::from_secs(3),
            indicator_repeat: Duration::from_secs(2),
            max_poll_failures: 5,
            callback_grace: Duration::from_secs(1),
            callback_drain: Duration::from_secs(1),
        }
    }

    fn streaming(text: &str, active: bool) -> Extraction {
        Extraction {
            message_count: 1,
            reasoning: text.into(),
            reasoning_active: active,
            ..Default::default()
        }
    }

    #[test]
    fn tick_is_quarter_interval_with_floor() {
        let mut timing = CodeAgentTiming::default();
        timing.polling_interval_ms = Some(1000);
        let t = PollTimings::resolve(&timing, &CodeAgentConfig::default(), &EngineConfig::default());
        assert_eq!(t.tick, Duration::from_millis(250));

        timing.polling_interval_ms = Some(8);
        let t = PollTimings::resolve(&timing, &CodeAgentConfig::default(), &EngineConfig::default());
        assert_eq!(t.tick, Duration::from_millis(10));
    }

    #[test]
    fn final_answer_completes_immediately() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        let ex = Extraction {
            message_count: 1,
            final_answer: Some("42".into()),
            ..Default::default()
        };
        let outcome = tracker.observe(t0 + Duration::from_millis(300), true, ex);
        assert_eq!(outcome.exit, Some(Exit::Answered("42".into())));
        assert_eq!(tracker.state(), AgentState::Completed);
        assert_eq!(tracker.reply(), "42");
    }

    #[test]
    fn idle_after_message_completes() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        let outcome = tracker.observe(t0, false, streaming("partial", false));
        assert_eq!(outcome.exit, Some(Exit::Idle));
        assert_eq!(tracker.reply(), "partial");
    }

    #[test]
    fn never_started_times_out_after_chunk_timeout() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        assert!(tracker
            .observe(t0 + Duration::from_secs(9), false, Extraction::default())
            .exit
            .is_none());
        let outcome = tracker.observe(t0 + Duration::from_secs(11), false, Extraction::default());
        assert_eq!(outcome.exit, Some(Exit::NeverStarted));
        assert_eq!(tracker.state(), AgentState::TimedOut);
        assert_eq!(tracker.reply(), "");
    }

    #[test]
    fn busy_session_is_only_bounded_by_max_wait() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        let outcome = tracker.observe(t0 + Duration::from_secs(30), true, Extraction::default());
        assert!(outcome.exit.is_none());
        let outcome = tracker.observe(t0 + Duration::from_secs(61), true, Extraction::default());
        assert_eq!(outcome.exit, Some(Exit::MaxWait));
    }

    #[test]
    fn streamed_then_stalled_times_out_unless_reasoning_active() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        let first = tracker.observe(t0, true, streaming("working", false));
        assert_eq!(first.stream.as_deref(), Some("working"));

        // Busy with active reasoning: no stall even after the timeout
        let outcome = tracker.observe(t0 + Duration::from_secs(25), true, streaming("working", true));
        assert!(outcome.exit.is_none());

        // Not busy, no messages beyond the first: idle completion wins
        let outcome = tracker.observe(t0 + Duration::from_secs(26), false, streaming("working", false));
        assert_eq!(outcome.exit, Some(Exit::Idle));
    }

    #[test]
    fn stall_applies_when_session_reports_not_busy_without_new_messages() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        let tools_only = Extraction {
            tool_lines: vec!["[tool] bash (running)".into()],
            ..Default::default()
        };
        tracker.observe(t0, true, tools_only.clone());
        let outcome = tracker.observe(t0 + Duration::from_secs(21), false, tools_only);
        assert_eq!(outcome.exit, Some(Exit::Stalled));
    }

    #[test]
    fn silence_indicator_adds_dots_without_touching_reasoning() {
        let t0 = Instant::now();
        let mut tracker = PollTracker::new(timings(), t0);
        tracker.observe(t0, true, streaming("thinking", true));

        let o = tracker.observe(t0 + Duration::from_secs(2), true, streaming("thinking", true));
        assert!(o.indicator.is_none());

        let o = tracker.observe(t0 + Duration::from_secs(4), true, streaming("thinking", true));
        assert_eq!(o.indicator.as_deref(), Some("thinking."));
        assert!(o.stream.is_none());

        let o = tracker.observe(t0 + Duration::from_secs(5), true, streaming("thinking", true));
        assert!(o.indicator.is_none());

        let o = tracker.observe(t0 + Duration::from_secs(6), true, streaming("thinking", true));
        assert_eq!(o.indicator.as_deref(), Some("thinking.."));
        assert_eq!(tracker.reply(), "thinking");

        // New content resets the indicator
        let o = tracker.observe(t0 + Duration::from_secs(7), true, streaming("thinking more", true));
        assert_eq!(o.stream.as_deref(), Some("thinking more"));
        let o = tracker.observe(t0 + Duration::from_secs(11), true, streaming("thinking more", true));
        assert_eq!(o.indicator.as_deref(), Some("thinking more."));
    }
}
