//! Turns one persona action into action-layer calls
//!
//! The dispatcher owns every side effect of an action: budget admission,
//! payload construction, the remote call, stream consumption, charging and
//! metrics. It never returns an error; every outcome lands in metrics and
//! the worker moves on.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{
    self, Actions, AgentRequest, BoutRequest, ByokStash, ContactMessage, FeatureRequest,
    FeatureVoteRequest, NewsletterSignup, PaperSubmission, ReactionRequest, ShortLinkRequest,
    WinnerVoteRequest,
};
use crate::budget::{BudgetGate, INPUT_OUTPUT_RATIO, PRICE_TABLE};
use crate::metrics::MetricsCollector;
use crate::persona::{Action, PersonaSpec};
use crate::sse::{self, StreamResult};
use crate::traits::{ApiResponse, TransportError};

/// Characters per token when estimating real spend from streamed text
pub const CHARS_PER_TOKEN: u64 = 4;

/// Bout ids kept for reactions, votes and share links
const MAX_KNOWN_BOUTS: usize = 1024;

/// Prompt length used by the oversized-payload probe
const OVERSIZED_PROMPT_CHARS: usize = 100_000;

const AGENT_IDS: &[&str] = &["socrates", "nietzsche", "diogenes", "hypatia", "machiavelli"];

/// What happened to one dispatched action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response arrived with this status
    Responded(u16),
    /// The request failed without a usable response
    Failed,
    /// Nothing was sent (budget denial or missing prerequisite)
    Skipped,
    /// The run was cancelled mid-call
    Cancelled,
}

impl Outcome {
    /// Whether a 2xx/3xx status came back
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Responded(s) if *s < 400)
    }
}

/// Estimated (input, output) tokens for `chars` characters of generated text
pub fn tokens_for_chars(chars: u64) -> (u64, u64) {
    let output = chars.div_ceil(CHARS_PER_TOKEN);
    (output * INPUT_OUTPUT_RATIO, output)
}

/// Shared action executor
#[derive(Debug)]
pub struct Dispatcher {
    actions: Actions,
    budget: Arc<BudgetGate>,
    metrics: Arc<MetricsCollector>,
    bouts: Mutex<Vec<String>>,
    accounts: Vec<String>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        actions: Actions,
        budget: Arc<BudgetGate>,
        metrics: Arc<MetricsCollector>,
        accounts: Vec<String>,
    ) -> Self {
        Self {
            actions,
            budget,
            metrics,
            bouts: Mutex::new(Vec::new()),
            accounts,
        }
    }

    /// Budget gate shared with the engine
    pub fn budget(&self) -> &Arc<BudgetGate> {
        &self.budget
    }

    /// Metrics shared with the engine
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Copy of the bout ids seen so far
    pub fn known_bouts(&self) -> Vec<String> {
        self.bouts.lock().clone()
    }

    /// Account a worker uses for `spec`, if it needs one and any are configured
    pub fn account_for(&self, worker_id: usize, spec: &PersonaSpec) -> Option<&str> {
        if !spec.requires_auth || self.accounts.is_empty() {
            return None;
        }
        Some(self.accounts[worker_id % self.accounts.len()].as_str())
    }

    fn remember_bout(&self, id: String) {
        let mut bouts = self.bouts.lock();
        if bouts.len() >= MAX_KNOWN_BOUTS {
            let victim = rand::thread_rng().gen_range(0..bouts.len());
            bouts.swap_remove(victim);
        }
        bouts.push(id);
    }

    fn random_bout(&self) -> Option<String> {
        let bouts = self.bouts.lock();
        if bouts.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..bouts.len());
        Some(bouts[idx].clone())
    }

    fn bout_request(&self, spec: &PersonaSpec) -> BoutRequest {
        let mut rng = rand::thread_rng();
        let model = spec
            .preferred_model
            .unwrap_or_else(|| PRICE_TABLE[rng.gen_range(0..PRICE_TABLE.len())].model);
        let turns = spec.preferred_turns.unwrap_or_else(|| rng.gen_range(2..=12));
        BoutRequest {
            bout_id: api::new_bout_id(),
            preset_id: api::choose(api::VALID_PRESETS).to_string(),
            topic: spec.pick_topic().unwrap_or("Open debate").to_string(),
            model: model.to_string(),
            turns,
        }
    }

    /// Execute `action` for `spec` on behalf of `worker_id`
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        worker_id: usize,
        spec: &PersonaSpec,
        action: Action,
    ) -> Outcome {
        let account = self.account_for(worker_id, spec);
        debug!(worker_id, persona = spec.id, action = action.name(), "dispatching");

        match action {
            Action::Browse => {
                let page = api::choose(api::BROWSE_PAGES);
                let result = self.actions.browse(cancel, account, page).await;
                self.record(action, result)
            }
            Action::RunBout => self.run_bout(cancel, worker_id, spec, account).await,
            Action::ApiBout => self.api_bout(cancel, worker_id, spec, account).await,
            Action::CreateAgent => {
                let req = random_agent(None);
                let result = self.actions.create_agent(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::React => {
                let req = ReactionRequest {
                    bout_id: self
                        .random_bout()
                        .unwrap_or_else(|| api::PLACEHOLDER_BOUT_ID.to_string()),
                    turn_index: rand::thread_rng().gen_range(0..6),
                    reaction_type: api::choose(api::REACTION_KINDS).to_string(),
                };
                let result = self.actions.react(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::Vote => {
                let Some(bout_id) = self.random_bout() else {
                    debug!(worker_id, "no bouts to vote on yet");
                    return Outcome::Skipped;
                };
                let req = WinnerVoteRequest {
                    bout_id,
                    agent_id: api::choose(AGENT_IDS).to_string(),
                };
                let result = self.actions.vote(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::ShortLink => {
                let req = ShortLinkRequest {
                    bout_id: self
                        .random_bout()
                        .unwrap_or_else(|| api::PLACEHOLDER_BOUT_ID.to_string()),
                };
                let result = self.actions.short_link(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::ListFeatures => {
                let result = self.actions.list_features(cancel, account).await;
                self.record(action, result)
            }
            Action::SubmitFeature => {
                let n = rand::thread_rng().gen_range(1..10_000);
                let req = FeatureRequest {
                    title: format!("Simulated request #{n}"),
                    description: "Let agents cite sources mid-debate.".into(),
                    category: api::choose(&["agents", "arena", "ui", "other"]).to_string(),
                };
                let result = self.actions.submit_feature(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::VoteFeature => {
                let req = FeatureVoteRequest {
                    feature_request_id: rand::thread_rng().gen_range(1..=50),
                };
                let result = self.actions.vote_feature(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::SubmitPaper => {
                let (month, id) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(1..=12), rng.gen_range(1..99_999))
                };
                let req = PaperSubmission {
                    arxiv_url: format!("https://arxiv.org/abs/24{month:02}.{id:05}"),
                    justification: "Relevant to multi-agent persuasion.".into(),
                    relevance_area: "agent-interaction".into(),
                };
                let result = self.actions.submit_paper(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::Newsletter => {
                let req = NewsletterSignup {
                    email: sim_email(),
                };
                let result = self.actions.newsletter(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::Contact => {
                let req = ContactMessage {
                    name: "Sim User".into(),
                    email: sim_email(),
                    message: "Loving the arena. Any plans for team debates?".into(),
                };
                let result = self.actions.contact(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::ByokStash => {
                let req = ByokStash {
                    key: format!("sk-ant-sim-{}", api::new_bout_id()),
                };
                let result = self.actions.byok_stash(cancel, account, &req).await;
                self.record(action, result)
            }
            Action::ProbeNoAuth
            | Action::ProbeOversized
            | Action::ProbeInjection
            | Action::ProbeBadPreset => self.probe(cancel, worker_id, spec, action).await,
        }
    }

    fn record(&self, action: Action, result: Result<ApiResponse, TransportError>) -> Outcome {
        let endpoint = action.name();
        match result {
            Ok(resp) => {
                self.metrics
                    .record_response(endpoint, resp.status, resp.duration, resp.attempts);
                if resp.status == 429 {
                    debug!(action = endpoint, "rate limited");
                }
                Outcome::Responded(resp.status)
            }
            Err(TransportError::Cancelled) => Outcome::Cancelled,
            Err(e) => {
                debug!(action = endpoint, error = %e, "request failed");
                self.metrics.record_failure(endpoint);
                Outcome::Failed
            }
        }
    }

    /// Budget admission for cost-bearing actions; counts a skip on denial
    fn admit(&self, worker_id: usize, action: Action, req: &BoutRequest) -> bool {
        let (estimate, allowed) = self.budget.allow(&req.model, req.turns);
        if !allowed {
            self.metrics.record_budget_skip();
            debug!(
                worker_id,
                action = action.name(),
                model = %req.model,
                estimate,
                "budget gate denied bout"
            );
        }
        allowed
    }

    fn charge(&self, model: &str, chars: u64) -> f64 {
        let (input, output) = tokens_for_chars(chars);
        self.budget.charge_tokens(model, input, output)
    }

    async fn run_bout(
        &self,
        cancel: &CancellationToken,
        worker_id: usize,
        spec: &PersonaSpec,
        account: Option<&str>,
    ) -> Outcome {
        let endpoint = Action::RunBout.name();
        let req = self.bout_request(spec);
        if !self.admit(worker_id, Action::RunBout, &req) {
            return Outcome::Skipped;
        }

        self.metrics.record_bout_started();
        let started = Instant::now();
        let resp = match self.actions.run_bout(cancel, account, &req).await {
            Ok(resp) => resp,
            Err(TransportError::Cancelled) => return Outcome::Cancelled,
            Err(TransportError::Status { status, body }) => {
                self.metrics
                    .record_response(endpoint, status, started.elapsed(), 1);
                debug!(worker_id, status, body = %body, "bout rejected");
                return Outcome::Responded(status);
            }
            Err(e) => {
                warn!(worker_id, error = %e, "bout request failed");
                self.metrics.record_failure(endpoint);
                return Outcome::Failed;
            }
        };
        self.metrics
            .record_response(endpoint, resp.status, resp.duration, 1);

        self.metrics.stream_started();
        let body = std::pin::pin!(resp.body.take_until(cancel.cancelled()));
        let parsed = sse::parse_stream(body, started).await;
        self.metrics.stream_finished();

        // Whatever streamed before a cancel was still generated and billed
        if cancel.is_cancelled() {
            let partial = match parsed {
                Ok(result) => result,
                Err(failure) => failure.partial,
            };
            self.account_stream(&req, &partial);
            return Outcome::Cancelled;
        }

        match parsed {
            Ok(result) => {
                self.account_stream(&req, &result);
                if let Some(err) = &result.error {
                    warn!(worker_id, bout_id = %req.bout_id, error = %err, "bout stream carried an error");
                    self.metrics.record_stream_error();
                } else if result.completed {
                    self.metrics.record_bout_completed();
                } else {
                    debug!(worker_id, bout_id = %req.bout_id, "bout stream ended without [DONE]");
                }
            }
            Err(failure) => {
                warn!(worker_id, bout_id = %req.bout_id, error = %failure.error, "bout stream failed");
                self.account_stream(&req, &failure.partial);
                self.metrics.record_stream_failure(endpoint);
            }
        }
        self.remember_bout(req.bout_id);
        Outcome::Responded(resp.status)
    }

    fn account_stream(&self, req: &BoutRequest, result: &StreamResult) {
        self.metrics
            .record_stream_volume(result.delta_count, result.char_count);
        if let Some(ttfb) = result.ttfb {
            self.metrics.record_ttfb(Action::RunBout.name(), ttfb);
        }
        let cost = self.charge(&req.model, result.char_count);
        debug!(
            bout_id = %req.bout_id,
            turns = result.turns.len(),
            chars = result.char_count,
            completed = result.completed,
            cost,
            "bout finished"
        );
    }

    async fn api_bout(
        &self,
        cancel: &CancellationToken,
        worker_id: usize,
        spec: &PersonaSpec,
        account: Option<&str>,
    ) -> Outcome {
        let req = self.bout_request(spec);
        if !self.admit(worker_id, Action::ApiBout, &req) {
            return Outcome::Skipped;
        }

        self.metrics.record_bout_started();
        let result = self.actions.api_bout(cancel, account, &req).await;
        let body_len = result.as_ref().map(|r| r.body.len()).unwrap_or(0);
        let outcome = self.record(Action::ApiBout, result);

        if outcome.is_success() {
            self.metrics.record_bout_completed();
            self.charge(&req.model, body_len as u64);
            self.remember_bout(req.bout_id);
        }
        outcome
    }

    async fn probe(
        &self,
        cancel: &CancellationToken,
        worker_id: usize,
        spec: &PersonaSpec,
        action: Action,
    ) -> Outcome {
        let (path, body) = match action {
            Action::ProbeNoAuth => (api::API_BOUT, to_json(&self.bout_request(spec))),
            Action::ProbeOversized => (
                api::AGENTS,
                to_json(&random_agent(Some("A".repeat(OVERSIZED_PROMPT_CHARS)))),
            ),
            Action::ProbeInjection => (
                api::REACTIONS,
                to_json(&ReactionRequest {
                    bout_id: spec
                        .pick_topic()
                        .unwrap_or("' OR 1=1 --")
                        .to_string(),
                    turn_index: 0,
                    reaction_type: "heart".into(),
                }),
            ),
            _ => {
                let mut req = self.bout_request(spec);
                req.preset_id = format!("no-such-preset-{}", api::new_bout_id());
                (api::RUN_BOUT, to_json(&req))
            }
        };

        let result = self.actions.probe(cancel, path, &body).await;
        let outcome = self.record(action, result);
        if let Outcome::Responded(status) = outcome {
            if (200..300).contains(&status) {
                warn!(
                    worker_id,
                    action = action.name(),
                    status,
                    "security probe was accepted"
                );
                self.metrics
                    .record_endpoint_error(&format!("probe:{}", action.name()));
            }
        }
        outcome
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn sim_email() -> String {
    format!("sim+{}@example.com", api::new_bout_id().to_lowercase())
}

fn random_agent(prompt: Option<String>) -> AgentRequest {
    let n = rand::thread_rng().gen_range(1..10_000);
    AgentRequest {
        name: format!("SimAgent{n}"),
        system_prompt: prompt
            .unwrap_or_else(|| "You argue with calm confidence and cite history.".into()),
        archetype: api::choose(&["philosopher", "comedian", "scientist", "contrarian"])
            .to_string(),
        tone: api::choose(&["witty", "earnest", "acerbic"]).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona;
    use crate::testing::{MockTransport, Reply, BOUT_STREAM};

    fn dispatcher(mock: &Arc<MockTransport>, budget: BudgetGate, accounts: &[&str]) -> Dispatcher {
        Dispatcher::new(
            Actions::new(mock.clone()),
            Arc::new(budget),
            Arc::new(MetricsCollector::new()),
            accounts.iter().map(|a| a.to_string()).collect(),
        )
    }

    fn debater() -> &'static PersonaSpec {
        persona::find("casual-debater").unwrap()
    }

    #[tokio::test]
    async fn test_run_bout_parses_and_charges() {
        let mock = Arc::new(MockTransport::ok_with_stream(BOUT_STREAM.to_vec()));
        let d = dispatcher(&mock, BudgetGate::new(100.0), &[]);

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Responded(200));

        let snap = d.metrics().snapshot();
        assert_eq!(snap.bouts_started, 1);
        assert_eq!(snap.bouts_completed, 1);
        assert_eq!(snap.deltas, 4);
        assert_eq!(snap.active_streams, 0);
        assert_eq!(snap.peak_streams, 1);
        assert_eq!(snap.ttfb["run-bout"].count, 1);
        assert!(d.budget().spent() > 0.0);
        assert_eq!(d.budget().bouts(), 1);
        assert_eq!(d.known_bouts().len(), 1);

        let body = mock.calls()[0].body.clone().unwrap();
        assert_eq!(body["model"], "claude-haiku-4-5");
        assert_eq!(body["turns"], 6);
    }

    #[tokio::test]
    async fn test_budget_denial_skips_silently() {
        let mock = Arc::new(MockTransport::ok_with_stream(BOUT_STREAM.to_vec()));
        let d = dispatcher(&mock, BudgetGate::new(0.000_001), &[]);

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Skipped);
        assert!(mock.calls().is_empty());

        let snap = d.metrics().snapshot();
        assert_eq!(snap.budget_skips, 1);
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.bouts_started, 0);
    }

    #[tokio::test]
    async fn test_stream_error_event_counts_as_stream_error() {
        let mock = Arc::new(MockTransport::ok_with_stream(vec![
            "data: {\"type\":\"data-turn\",\"data\":{\"turn\":0,\"agentId\":\"a\",\"agentName\":\"A\"}}\n",
            "data: {\"type\":\"text-delta\",\"delta\":\"partial\"}\n",
            "data: {\"type\":\"error\",\"errorText\":\"upstream overloaded\"}\n",
            "data: [DONE]\n",
        ]));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);

        d.dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;

        let snap = d.metrics().snapshot();
        assert_eq!(snap.stream_errors, 1);
        assert_eq!(snap.bouts_completed, 0);
        assert_eq!(snap.errors, 0);
        assert!(d.budget().spent() > 0.0);
    }

    #[tokio::test]
    async fn test_malformed_stream_counts_as_stream_error() {
        let mock = Arc::new(MockTransport::ok_with_stream(vec!["data: {oops\n"]));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Responded(200));
        assert_eq!(d.metrics().snapshot().stream_errors, 1);
    }

    #[tokio::test]
    async fn test_stream_failures_are_kept_apart_from_error_events() {
        let error_event = Arc::new(MockTransport::ok_with_stream(vec![
            "data: {\"type\":\"error\",\"errorText\":\"upstream overloaded\"}\n",
            "data: [DONE]\n",
        ]));
        let d = dispatcher(&error_event, BudgetGate::unlimited(), &[]);
        d.dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        let snap = d.metrics().snapshot();
        assert_eq!(snap.stream_errors, 1);
        assert_eq!(snap.stream_failures, 0);
        assert!(snap.endpoint_errors.is_empty());

        let malformed = Arc::new(MockTransport::ok_with_stream(vec!["data: {oops\n"]));
        let d = dispatcher(&malformed, BudgetGate::unlimited(), &[]);
        d.dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        let snap = d.metrics().snapshot();
        assert_eq!(snap.stream_failures, 1);
        assert_eq!(snap.endpoint_errors["run-bout"], 1);

        let broken = Arc::new(MockTransport::new(|_| {
            Reply::Broken(BOUT_STREAM[..3].to_vec())
        }));
        let d = dispatcher(&broken, BudgetGate::unlimited(), &[]);
        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Responded(200));
        let snap = d.metrics().snapshot();
        assert_eq!(snap.stream_errors, 1);
        assert_eq!(snap.stream_failures, 1);
        assert_eq!(snap.bouts_completed, 0);
        assert_eq!(snap.endpoint_errors["run-bout"], 1);
        assert_eq!(snap.deltas, 2);
        assert!(d.budget().spent() > 0.0);
    }

    #[tokio::test]
    async fn test_stream_without_done_is_neither_completed_nor_error() {
        let mock = Arc::new(MockTransport::ok_with_stream(BOUT_STREAM[..4].to_vec()));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Responded(200));

        let snap = d.metrics().snapshot();
        assert_eq!(snap.bouts_completed, 0);
        assert_eq!(snap.stream_errors, 0);
        assert_eq!(snap.deltas, 2);
        assert!(d.budget().spent() > 0.0);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_still_charges_partial_output() {
        let mock = Arc::new(MockTransport::new(|_| {
            Reply::Stall(BOUT_STREAM[..3].to_vec())
        }));
        let d = Arc::new(dispatcher(&mock, BudgetGate::unlimited(), &[]));
        let cancel = CancellationToken::new();

        let task = {
            let d = d.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { d.dispatch(&cancel, 0, debater(), Action::RunBout).await })
        };
        while d.metrics().snapshot().active_streams == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Outcome::Cancelled);
        let snap = d.metrics().snapshot();
        assert_eq!(snap.active_streams, 0);
        assert_eq!(snap.stream_errors, 0);
        assert_eq!(snap.bouts_completed, 0);
        assert!(d.budget().spent() > 0.0);
        assert_eq!(d.budget().bouts(), 1);
    }

    #[tokio::test]
    async fn test_rejected_stream_records_status() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(429, "slow down")));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, debater(), Action::RunBout)
            .await;
        assert_eq!(outcome, Outcome::Responded(429));

        let snap = d.metrics().snapshot();
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.peak_streams, 0);
        assert_eq!(d.budget().spent(), 0.0);
    }

    #[tokio::test]
    async fn test_network_failure_is_recorded() {
        let mock = Arc::new(MockTransport::new(|_| {
            Reply::Fail(TransportError::Network("refused".into()))
        }));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);
        let lurker = persona::find("lurker").unwrap();

        let outcome = d
            .dispatch(&CancellationToken::new(), 0, lurker, Action::Browse)
            .await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(d.metrics().snapshot().endpoint_errors["browse"], 1);
    }

    #[tokio::test]
    async fn test_vote_skips_without_bouts_and_react_uses_placeholder() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(200, "{}")));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);
        let cancel = CancellationToken::new();

        assert_eq!(
            d.dispatch(&cancel, 0, debater(), Action::Vote).await,
            Outcome::Skipped
        );
        assert!(mock.calls().is_empty());

        d.dispatch(&cancel, 0, debater(), Action::React).await;
        d.dispatch(&cancel, 0, debater(), Action::ShortLink).await;
        let calls = mock.calls();
        assert_eq!(calls[0].body.as_ref().unwrap()["boutId"], api::PLACEHOLDER_BOUT_ID);
        assert_eq!(calls[1].body.as_ref().unwrap()["boutId"], api::PLACEHOLDER_BOUT_ID);
    }

    #[tokio::test]
    async fn test_vote_uses_known_bout() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(200, "{\"turns\":[]}")));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);
        let cancel = CancellationToken::new();
        let api_user = persona::find("api-consumer").unwrap();

        assert_eq!(
            d.dispatch(&cancel, 0, api_user, Action::ApiBout).await,
            Outcome::Responded(200)
        );
        let bout_id = d.known_bouts()[0].clone();

        d.dispatch(&cancel, 0, api_user, Action::Vote).await;
        let calls = mock.calls();
        assert_eq!(calls[1].path, api::WINNER_VOTE);
        assert_eq!(calls[1].body.as_ref().unwrap()["boutId"], bout_id.as_str());
    }

    #[tokio::test]
    async fn test_account_rotation() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(200, "{}")));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &["alice", "bob"]);

        assert_eq!(d.account_for(3, debater()), Some("bob"));
        assert_eq!(d.account_for(4, debater()), Some("alice"));
        assert_eq!(d.account_for(3, persona::find("lurker").unwrap()), None);

        d.dispatch(&CancellationToken::new(), 1, debater(), Action::Browse)
            .await;
        assert_eq!(mock.calls()[0].account.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_accepted_probe_is_flagged() {
        let mock = Arc::new(MockTransport::new(|call| {
            if call.path == api::API_BOUT {
                Reply::Status(200, "{}")
            } else {
                Reply::Status(400, "{}")
            }
        }));
        let d = dispatcher(&mock, BudgetGate::unlimited(), &["alice"]);
        let prober = persona::find("prober").unwrap();
        let cancel = CancellationToken::new();

        d.dispatch(&cancel, 0, prober, Action::ProbeNoAuth).await;
        d.dispatch(&cancel, 0, prober, Action::ProbeBadPreset).await;
        d.dispatch(&cancel, 0, prober, Action::ProbeOversized).await;

        let snap = d.metrics().snapshot();
        assert_eq!(snap.endpoint_errors.get("probe:probe-no-auth"), Some(&1));
        assert!(snap.endpoint_errors.get("probe:probe-bad-preset").is_none());

        let calls = mock.calls();
        assert!(calls.iter().all(|c| c.account.is_none() && !c.streaming));
        assert_eq!(calls[1].path, api::RUN_BOUT);
        let prompt = calls[2].body.as_ref().unwrap()["systemPrompt"]
            .as_str()
            .unwrap()
            .len();
        assert_eq!(prompt, OVERSIZED_PROMPT_CHARS);
    }

    #[tokio::test]
    async fn test_cancelled_call_reports_cancelled() {
        let mock = Arc::new(
            MockTransport::new(|_| Reply::Status(200, "{}"))
                .with_latency(std::time::Duration::from_secs(30)),
        );
        let d = dispatcher(&mock, BudgetGate::unlimited(), &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = d
            .dispatch(&cancel, 0, debater(), Action::ListFeatures)
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(d.metrics().snapshot().requests, 0);
    }

    #[test]
    fn test_tokens_for_chars() {
        assert_eq!(tokens_for_chars(0), (0, 0));
        assert_eq!(tokens_for_chars(4), (3, 1));
        assert_eq!(tokens_for_chars(5), (6, 2));
    }
}
