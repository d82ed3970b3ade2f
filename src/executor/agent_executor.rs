/// Sandboxed agent executor
///
/// Registers guest agents and runs each `bid`/`update` call in a fresh,
/// single-use process context. Every per-call failure is absorbed here into
/// a typed outcome; nothing a guest does reaches the caller as a panic or a
/// hard error.
use crate::config::types::{BidboxError, ExecutorConfig, ItemId, Result, TeamId};
use crate::core::supervisor::{run_context, ContextLaunch, ContextOutcome, ScratchDir};
use crate::core::types::{AgentInit, GuestCall, GuestOutcome, GuestReply, GuestRequest};
use crate::core::verdict::{classify, CallErrorKind, CallFailure};
use crate::executor::checkpoint::filter_state;
use crate::executor::code_source::{CodeSource, PreparedCode};
use crate::executor::contract::{check_init, check_shape};
use crate::kernel::preexec::{harden_host, PreExecPlan};
use crate::kernel::reaper;
use crate::observability::audit::{events, CorrelationIds, SecurityEventType};
use crate::utils::output::{OutputIntegrity, OutputLimits};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

type Checkpoint = Map<String, Value>;

/// Opaque reference to a registered team.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AgentHandle {
    team_id: TeamId,
}

impl AgentHandle {
    pub fn team_id(&self) -> &str {
        &self.team_id
    }
}

/// Result of one bid call. A failed call is a zero bid with its error kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BidOutcome {
    pub bid_amount: f64,
    pub wall_time: Duration,
    pub error: Option<CallErrorKind>,
}

impl BidOutcome {
    fn forfeited(wall_time: Duration, kind: CallErrorKind) -> Self {
        Self {
            bid_amount: 0.0,
            wall_time,
            error: Some(kind),
        }
    }
}

/// Successful update acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub wall_time: Duration,
    pub checkpoint_fields: usize,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("update failed for {team_id} ({kind}): {detail}")]
pub struct UpdateFailed {
    pub team_id: TeamId,
    pub kind: CallErrorKind,
    pub detail: String,
}

/// Metadata retained per team. No live guest object is ever kept.
#[derive(Debug)]
struct RegisteredAgent {
    init: AgentInit,
    code: PreparedCode,
    slot: u32,
    /// Held for the whole call, so a team never has two calls in flight.
    checkpoint: Mutex<Option<Checkpoint>>,
}

impl RegisteredAgent {
    fn lock_checkpoint(&self) -> MutexGuard<'_, Option<Checkpoint>> {
        self.checkpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Successful guest reply plus call timing.
struct CallSuccess {
    reply: GuestReply,
    wall_time: Duration,
}

struct CallError {
    failure: CallFailure,
    wall_time: Duration,
}

pub struct AgentExecutor {
    config: ExecutorConfig,
    agents: HashMap<TeamId, RegisteredAgent>,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        if let Err(e) = harden_host() {
            events::control_degraded(format!("host could not be made non-dumpable: {}", e));
        }
        if let Err(e) = reaper::become_subreaper() {
            events::control_degraded(format!(
                "host is not a child subreaper, detached guest processes can outlive their call: {}",
                e
            ));
        }
        let baseline = PreExecPlan::from_policy(&config.isolation, 0);
        if baseline.credentials.is_none() {
            events::control_degraded(
                "contexts run under the host uid; sibling contexts are not separated by credentials"
                    .to_string(),
            );
        }
        if config.isolation.restrict_signals && baseline.signal_filter.is_none() {
            events::control_degraded(
                "signal filter is not available on this architecture".to_string(),
            );
        }
        if !baseline.strict {
            log::warn!(
                "isolation is {}: controls that fail to apply are skipped",
                config.isolation.security_mode
            );
        }
        Self {
            config,
            agents: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Register a team: check its constructor arguments, run the `describe`
    /// call once in a throwaway context and keep only metadata.
    pub fn register(
        &mut self,
        team_id: &str,
        code: &CodeSource,
        valuation_vector: BTreeMap<ItemId, f64>,
        budget: f64,
        opponent_ids: Vec<TeamId>,
    ) -> Result<AgentHandle> {
        let invalid = |reason: String| {
            events::registration_rejected(team_id, reason.clone());
            BidboxError::InvalidAgent {
                team_id: team_id.to_string(),
                reason,
            }
        };

        if self.agents.contains_key(team_id) {
            return Err(invalid("team_id already registered".to_string()));
        }

        let init = AgentInit {
            team_id: team_id.to_string(),
            valuation_vector,
            budget,
            opponent_ids,
        };
        check_init(&init).map_err(invalid)?;
        let prepared = code.prepare().map_err(|e| invalid(e.to_string()))?;
        if !prepared.is_sealed() {
            events::control_degraded(format!(
                "code of {} runs from {} and is only checked by digest",
                team_id,
                prepared.origin().display()
            ));
        }

        let agent = RegisteredAgent {
            init,
            code: prepared,
            slot: self.agents.len() as u32,
            checkpoint: Mutex::new(None),
        };

        // Throwaway context: no checkpoint in, nothing written back.
        let described = self
            .run_call(&agent, None, GuestCall::Describe, self.config.call_timeout())
            .map_err(|e| invalid(e.failure.to_string()))?;
        check_shape(&described.reply.outcome).map_err(invalid)?;

        log::info!(
            "registered team {} (code {}, {} items)",
            team_id,
            &agent.code.fingerprint()[..12],
            agent.init.valuation_vector.len()
        );
        self.agents.insert(team_id.to_string(), agent);
        Ok(AgentHandle {
            team_id: team_id.to_string(),
        })
    }

    /// Ask a team for its bid on `item_id`. Never fails: any problem yields
    /// a zero bid tagged with the error kind and leaves the checkpoint as it was.
    pub fn bid(&self, handle: &AgentHandle, item_id: &str, timeout: Duration) -> BidOutcome {
        let Some(agent) = self.agents.get(&handle.team_id) else {
            return BidOutcome::forfeited(Duration::ZERO, CallErrorKind::ContextFailure);
        };

        let mut checkpoint = agent.lock_checkpoint();
        let call = GuestCall::Bid {
            item_id: item_id.to_string(),
        };
        let success = match self.run_call(agent, checkpoint.as_ref(), call, timeout) {
            Ok(success) => success,
            Err(e) => return BidOutcome::forfeited(e.wall_time, e.failure.kind),
        };

        let amount = match success.reply.outcome {
            GuestOutcome::Bid { amount } if amount.is_finite() => amount,
            ref other => {
                self.report_failure(
                    agent,
                    "bid",
                    &CallFailure::new(
                        CallErrorKind::MalformedReply,
                        format!("bid returned {:?}", other),
                    ),
                );
                return BidOutcome::forfeited(success.wall_time, CallErrorKind::MalformedReply);
            }
        };

        if let Err(failure) = self.commit(agent, &mut checkpoint, "bid", success.reply) {
            return BidOutcome::forfeited(success.wall_time, failure.kind);
        }

        BidOutcome {
            bid_amount: round_cents(amount.max(0.0)),
            wall_time: success.wall_time,
            error: None,
        }
    }

    /// Tell a team the public outcome of a round.
    pub fn update(
        &self,
        handle: &AgentHandle,
        item_id: &str,
        winner_id: Option<&str>,
        price_paid: f64,
        timeout: Duration,
    ) -> std::result::Result<Ack, UpdateFailed> {
        let fail = |kind: CallErrorKind, detail: String| UpdateFailed {
            team_id: handle.team_id.clone(),
            kind,
            detail,
        };
        let agent = self.agents.get(&handle.team_id).ok_or_else(|| {
            fail(CallErrorKind::ContextFailure, "team is not registered".to_string())
        })?;

        let mut checkpoint = agent.lock_checkpoint();
        let call = GuestCall::Update {
            item_id: item_id.to_string(),
            winner_id: winner_id.map(str::to_string),
            price_paid,
        };
        let success = self
            .run_call(agent, checkpoint.as_ref(), call, timeout)
            .map_err(|e| fail(e.failure.kind, e.failure.detail))?;

        match success.reply.outcome {
            GuestOutcome::Update { acknowledged: true } => {}
            GuestOutcome::Update { acknowledged: false } => {
                let failure =
                    CallFailure::new(CallErrorKind::Rejected, "guest declined the update");
                self.report_failure(agent, "update", &failure);
                return Err(fail(failure.kind, failure.detail));
            }
            ref other => {
                let failure = CallFailure::new(
                    CallErrorKind::MalformedReply,
                    format!("update returned {:?}", other),
                );
                self.report_failure(agent, "update", &failure);
                return Err(fail(failure.kind, failure.detail));
            }
        }

        let checkpoint_fields = self
            .commit(agent, &mut checkpoint, "update", success.reply)
            .map_err(|f| fail(f.kind, f.detail))?;
        Ok(Ack {
            wall_time: success.wall_time,
            checkpoint_fields,
        })
    }

    /// Current checkpoint of a team, if any call has succeeded yet.
    pub fn checkpoint(&self, team_id: &str) -> Option<Checkpoint> {
        self.agents
            .get(team_id)
            .and_then(|agent| agent.lock_checkpoint().clone())
    }

    pub fn handle(&self, team_id: &str) -> Option<AgentHandle> {
        self.agents.get(team_id).map(|_| AgentHandle {
            team_id: team_id.to_string(),
        })
    }

    pub fn team_ids(&self) -> Vec<TeamId> {
        let mut ids: Vec<TeamId> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Filter the reply state and store it as the team's new checkpoint.
    fn commit(
        &self,
        agent: &RegisteredAgent,
        checkpoint: &mut Option<Checkpoint>,
        operation: &str,
        reply: GuestReply,
    ) -> std::result::Result<usize, CallFailure> {
        let correlation = || CorrelationIds::new(&agent.init.team_id, operation);
        let filtered = filter_state(
            reply.state,
            &reply.dropped_fields,
            self.config.max_checkpoint_bytes,
        )
        .map_err(|reason| {
            events::checkpoint_rejected(correlation(), reason.clone());
            CallFailure::new(CallErrorKind::MalformedReply, reason)
        })?;

        for dropped in filtered.dropped {
            events::serialization_loss(correlation(), dropped.field, dropped.reason.as_str());
        }

        let fields = filtered.state.len();
        *checkpoint = Some(filtered.state);
        Ok(fields)
    }

    /// Run one call in a fresh context and classify the result.
    fn run_call(
        &self,
        agent: &RegisteredAgent,
        checkpoint: Option<&Checkpoint>,
        call: GuestCall,
        timeout: Duration,
    ) -> std::result::Result<CallSuccess, CallError> {
        let operation = call.name();
        let started = Instant::now();
        let err = |failure: CallFailure| {
            self.report_failure(agent, operation, &failure);
            CallError {
                failure,
                wall_time: started.elapsed(),
            }
        };

        if let Err(detail) = agent.code.verify() {
            events::code_tampered(
                CorrelationIds::new(&agent.init.team_id, operation),
                agent.code.origin(),
            );
            return Err(CallError {
                failure: CallFailure::new(CallErrorKind::CodeTampered, detail),
                wall_time: started.elapsed(),
            });
        }

        let request = GuestRequest {
            init: agent.init.clone(),
            checkpoint: checkpoint.cloned(),
            call,
        };

        let policy = &self.config.isolation;
        let plan = PreExecPlan::from_policy(policy, agent.slot).with_exec_fd(agent.code.exec_fd());
        let scratch = ScratchDir::create(&policy.scratch_root, &agent.init.team_id, plan.credentials)
            .map_err(|e| err(CallFailure::new(CallErrorKind::ContextFailure, e.to_string())))?;

        let launch = ContextLaunch {
            program: agent.code.program(),
            args: agent.code.args(),
            request: &request,
            plan: &plan,
            path_env: &policy.path_env,
            workdir: scratch.path(),
            timeout,
            grace: self.config.grace_window(),
            poll_interval: self.config.poll_interval(),
            limits: OutputLimits {
                stdout_limit: self.config.stdout_limit,
                stderr_limit: self.config.stderr_limit,
                collection_timeout: self.config.collection_timeout(),
            },
        };

        let outcome = run_context(&launch)
            .map_err(|e| err(CallFailure::new(CallErrorKind::ContextFailure, e.to_string())))?;
        drop(scratch);

        let correlation = CorrelationIds::new(&agent.init.team_id, operation).with_pid(outcome.pid);
        events::context_start(correlation.clone(), &plan.configured_controls());
        self.log_guest_output(agent, operation, &outcome, &correlation);

        let verdict = classify(&outcome);
        events::context_end(
            correlation,
            outcome.wall_time.as_millis(),
            match &verdict {
                Ok(_) => "ok".to_string(),
                Err(failure) => failure.kind.to_string(),
            }
            .as_str(),
        );

        match verdict {
            Ok(reply) => Ok(CallSuccess {
                reply,
                wall_time: outcome.wall_time,
            }),
            Err(failure) => Err(err(failure)),
        }
    }

    fn log_guest_output(
        &self,
        agent: &RegisteredAgent,
        operation: &str,
        outcome: &ContextOutcome,
        correlation: &CorrelationIds,
    ) {
        for line in String::from_utf8_lossy(&outcome.output.stderr).lines().take(20) {
            log::debug!("[{} {} stderr] {}", agent.init.team_id, operation, line);
        }
        if outcome.output.stdout_integrity == OutputIntegrity::TruncatedByLimit {
            events::output_truncated(correlation.clone(), "stdout");
        }
        if outcome.output.stderr_integrity == OutputIntegrity::TruncatedByLimit {
            events::output_truncated(correlation.clone(), "stderr");
        }
        if let Some(report) = &outcome.kill_report {
            events::signal_escalation(correlation.clone(), report.kill_sent, report.waited_ms);
        }
        if let Some(e) = &outcome.stdin_error {
            log::debug!("{} {}: request not fully written: {}", agent.init.team_id, operation, e);
        }
    }

    fn report_failure(&self, agent: &RegisteredAgent, operation: &str, failure: &CallFailure) {
        let event_type = match failure.kind {
            CallErrorKind::Timeout => SecurityEventType::CallTimeout,
            CallErrorKind::GuestRuntimeError | CallErrorKind::Rejected => {
                SecurityEventType::GuestRuntimeError
            }
            CallErrorKind::MalformedReply => SecurityEventType::MalformedReply,
            CallErrorKind::ContextFailure => SecurityEventType::ContextFailure,
            // Logged where it is detected.
            CallErrorKind::CodeTampered => return,
        };
        events::call_failed(
            CorrelationIds::new(&agent.init.team_id, operation),
            event_type,
            failure.to_string(),
        );
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
