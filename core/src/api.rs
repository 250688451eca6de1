//! Action layer: one typed call per remote endpoint
//!
//! Payload schemas are a plausible rendition of the service's contract; the
//! server is treated as opaque. Every call goes through the [`Transport`]
//! seam so the layer is testable without a network.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::traits::{ApiResponse, Method, StreamResponse, Transport, TransportError};

/// Public pages visited by browsing users
pub const BROWSE_PAGES: &[&str] = &["/", "/arena", "/leaderboard", "/agents", "/feed"];

/// Streamed bout (web UI)
pub const RUN_BOUT: &str = "/api/run-bout";
/// Synchronous bout (API tier)
pub const API_BOUT: &str = "/api/v1/bout";
/// Agent creation
pub const AGENTS: &str = "/api/agents";
/// Turn reactions
pub const REACTIONS: &str = "/api/reactions";
/// Winner votes
pub const WINNER_VOTE: &str = "/api/winner-vote";
/// Share links
pub const SHORT_LINKS: &str = "/api/short-links";
/// Feature request board
pub const FEATURE_REQUESTS: &str = "/api/feature-requests";
/// Feature request upvotes
pub const FEATURE_VOTE: &str = "/api/feature-requests/vote";
/// Paper submissions
pub const PAPER_SUBMISSIONS: &str = "/api/paper-submissions";
/// Newsletter signup
pub const NEWSLETTER: &str = "/api/newsletter";
/// Contact form
pub const CONTACT: &str = "/api/contact";
/// Bring-your-own-key storage
pub const BYOK_STASH: &str = "/api/byok-stash";

/// Presets the service accepts
pub const VALID_PRESETS: &[&str] = &[
    "roast-battle",
    "shark-pit",
    "darwin-special",
    "first-contact",
    "writers-room",
    "on-the-couch",
];

/// Reaction kinds
pub const REACTION_KINDS: &[&str] = &["heart", "fire"];

/// Length of generated bout ids
pub const BOUT_ID_LEN: usize = 21;

/// Format-valid id used when no real bout id is known yet
pub const PLACEHOLDER_BOUT_ID: &str = "placeholder0000000000";

/// Random alphanumeric bout id
pub fn new_bout_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BOUT_ID_LEN)
        .map(char::from)
        .collect()
}

/// Uniformly random element of a non-empty slice
pub fn choose<'a>(items: &[&'a str]) -> &'a str {
    if items.is_empty() {
        return "";
    }
    items[rand::thread_rng().gen_range(0..items.len())]
}

/// Body of both bout endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoutRequest {
    /// Client-generated bout id
    pub bout_id: String,
    /// Preset to run
    pub preset_id: String,
    /// Debate topic
    pub topic: String,
    /// Model to run the agents on
    pub model: String,
    /// Requested number of turns
    pub turns: u32,
}

/// Body of agent creation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Display name
    pub name: String,
    /// Persona prompt
    pub system_prompt: String,
    /// Archetype label
    pub archetype: String,
    /// Tone label
    pub tone: String,
}

/// Body of a reaction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    /// Target bout
    pub bout_id: String,
    /// Turn being reacted to
    pub turn_index: u32,
    /// One of [`REACTION_KINDS`]
    pub reaction_type: String,
}

/// Body of a winner vote
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerVoteRequest {
    /// Target bout
    pub bout_id: String,
    /// Agent voted for
    pub agent_id: String,
}

/// Body of a share link request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortLinkRequest {
    /// Target bout
    pub bout_id: String,
}

/// Body of a feature request
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRequest {
    /// Short title
    pub title: String,
    /// Longer description
    pub description: String,
    /// Category label
    pub category: String,
}

/// Body of a feature request upvote
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVoteRequest {
    /// Feature request id
    pub feature_request_id: u64,
}

/// Body of a paper submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperSubmission {
    /// arXiv URL
    pub arxiv_url: String,
    /// Why it is relevant
    pub justification: String,
    /// Area label
    pub relevance_area: String,
}

/// Body of a newsletter signup
#[derive(Debug, Clone, Serialize)]
pub struct NewsletterSignup {
    /// Email address
    pub email: String,
}

/// Body of a contact form message
#[derive(Debug, Clone, Serialize)]
pub struct ContactMessage {
    /// Sender name
    pub name: String,
    /// Sender email
    pub email: String,
    /// Message text
    pub message: String,
}

/// Body of a key stash
#[derive(Debug, Clone, Serialize)]
pub struct ByokStash {
    /// Provider key
    pub key: String,
}

fn encode<T: Serialize>(payload: &T) -> Result<serde_json::Value, TransportError> {
    serde_json::to_value(payload).map_err(|e| TransportError::Encode(e.to_string()))
}

/// Typed wrapper over a [`Transport`]
#[derive(Clone)]
pub struct Actions {
    transport: Arc<dyn Transport>,
}

impl Actions {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        path: &str,
        account: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.transport
            .execute(cancel, Method::Get, path, account, None)
            .await
    }

    async fn post<T: Serialize>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        account: Option<&str>,
        payload: &T,
    ) -> Result<ApiResponse, TransportError> {
        let body = encode(payload)?;
        self.transport
            .execute(cancel, Method::Post, path, account, Some(&body))
            .await
    }

    /// Load a public page
    pub async fn browse(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        page: &str,
    ) -> Result<ApiResponse, TransportError> {
        self.get(cancel, page, account).await
    }

    /// Start a streamed bout; the caller consumes the body
    pub async fn run_bout(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &BoutRequest,
    ) -> Result<StreamResponse, TransportError> {
        let body = encode(req)?;
        self.transport
            .execute_stream(cancel, Method::Post, RUN_BOUT, account, Some(&body))
            .await
    }

    /// Run a bout synchronously through the API tier
    pub async fn api_bout(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &BoutRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, API_BOUT, account, req).await
    }

    /// Create a custom agent
    pub async fn create_agent(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &AgentRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, AGENTS, account, req).await
    }

    /// React to a turn
    pub async fn react(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &ReactionRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, REACTIONS, account, req).await
    }

    /// Vote for a bout winner
    pub async fn vote(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &WinnerVoteRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, WINNER_VOTE, account, req).await
    }

    /// Create a share link
    pub async fn short_link(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &ShortLinkRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, SHORT_LINKS, account, req).await
    }

    /// List feature requests
    pub async fn list_features(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.get(cancel, FEATURE_REQUESTS, account).await
    }

    /// Submit a feature request
    pub async fn submit_feature(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &FeatureRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, FEATURE_REQUESTS, account, req).await
    }

    /// Upvote a feature request
    pub async fn vote_feature(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &FeatureVoteRequest,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, FEATURE_VOTE, account, req).await
    }

    /// Submit a paper
    pub async fn submit_paper(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &PaperSubmission,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, PAPER_SUBMISSIONS, account, req).await
    }

    /// Sign up for the newsletter
    pub async fn newsletter(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &NewsletterSignup,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, NEWSLETTER, account, req).await
    }

    /// Send a contact message
    pub async fn contact(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &ContactMessage,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, CONTACT, account, req).await
    }

    /// Stash a provider key
    pub async fn byok_stash(
        &self,
        cancel: &CancellationToken,
        account: Option<&str>,
        req: &ByokStash,
    ) -> Result<ApiResponse, TransportError> {
        self.post(cancel, BYOK_STASH, account, req).await
    }

    /// Unauthenticated buffered POST of an arbitrary body, for security probes.
    ///
    /// Buffered even for streaming endpoints so the status comes back as data.
    pub async fn probe(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse, TransportError> {
        self.transport
            .execute(cancel, Method::Post, path, None, Some(body))
            .await
    }
}

impl std::fmt::Debug for Actions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actions").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, Reply};

    fn bout() -> BoutRequest {
        BoutRequest {
            bout_id: new_bout_id(),
            preset_id: VALID_PRESETS[0].into(),
            topic: "Is a hot dog a sandwich?".into(),
            model: "claude-haiku-4-5".into(),
            turns: 4,
        }
    }

    #[test]
    fn test_bout_id_format() {
        let id = new_bout_id();
        assert_eq!(id.len(), BOUT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, new_bout_id());
        assert_eq!(PLACEHOLDER_BOUT_ID.len(), BOUT_ID_LEN);
    }

    #[test]
    fn test_payloads_use_camel_case() {
        let json = serde_json::to_value(bout()).unwrap();
        assert!(json.get("boutId").is_some());
        assert!(json.get("presetId").is_some());

        let json = serde_json::to_value(ReactionRequest {
            bout_id: "x".into(),
            turn_index: 2,
            reaction_type: "fire".into(),
        })
        .unwrap();
        assert_eq!(json["turnIndex"], 2);
        assert_eq!(json["reactionType"], "fire");
    }

    #[tokio::test]
    async fn test_calls_hit_expected_paths() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(200, "{}")));
        let actions = Actions::new(mock.clone());
        let cancel = CancellationToken::new();

        actions.browse(&cancel, None, "/arena").await.unwrap();
        actions.api_bout(&cancel, Some("acct"), &bout()).await.unwrap();
        actions.list_features(&cancel, None).await.unwrap();
        actions
            .vote(
                &cancel,
                None,
                &WinnerVoteRequest {
                    bout_id: "b".into(),
                    agent_id: "a".into(),
                },
            )
            .await
            .unwrap();

        let calls = mock.calls();
        assert_eq!(
            mock.paths(),
            vec!["/arena", API_BOUT, FEATURE_REQUESTS, WINNER_VOTE]
        );
        assert_eq!(calls[0].method, Method::Get);
        assert!(calls[0].body.is_none());
        assert_eq!(calls[1].method, Method::Post);
        assert_eq!(calls[1].account.as_deref(), Some("acct"));
        assert_eq!(calls[1].body.as_ref().unwrap()["turns"], 4);
    }

    #[tokio::test]
    async fn test_run_bout_streams() {
        let mock = Arc::new(MockTransport::ok_with_stream(vec!["data: [DONE]\n"]));
        let actions = Actions::new(mock.clone());

        let resp = actions
            .run_bout(&CancellationToken::new(), None, &bout())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(mock.calls()[0].streaming);
        assert_eq!(mock.paths(), vec![RUN_BOUT]);
    }

    #[tokio::test]
    async fn test_statuses_are_returned_as_data() {
        let mock = Arc::new(MockTransport::new(|_| Reply::Status(401, "nope")));
        let actions = Actions::new(mock);
        let resp = actions
            .contact(
                &CancellationToken::new(),
                None,
                &ContactMessage {
                    name: "n".into(),
                    email: "e@example.com".into(),
                    message: "m".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert!(!resp.is_success());
    }
}
