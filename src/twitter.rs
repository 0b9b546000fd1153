use crate::error_utils::{get_optional_env_var, get_required_env_var};
use anyhow::{Context, Result};
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use reqwest::{Client, StatusCode};
use reqwest_oauth1::OAuthClientProvider;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Structured errors surfaced by the external API, mapped onto the closed
/// taxonomy the rest of the engine dispatches on. Every call site either
/// handles a variant or explicitly defaults it.
#[derive(Debug, Error)]
pub enum TwitterApiError {
    #[error("invalid application credentials")]
    BadAppCredentials,

    #[error("application suspended")]
    AppSuspended,

    #[error("access token revoked by user")]
    TokenRevoked,

    #[error("authenticating account is suspended")]
    AccountSuspended,

    #[error("requested user is suspended")]
    UserSuspended,

    #[error("requested user not found")]
    NotFound,

    #[error("account is temporarily locked")]
    Locked,

    #[error("recipient cannot receive direct messages")]
    DmsClosed,

    #[error("duplicate message content rejected")]
    DuplicateMessage,

    #[error("rate limit exceeded (remaining: {remaining:?}, reset at {reset_at_ms:?})")]
    RateLimited {
        remaining: Option<u64>,
        reset_at_ms: Option<i64>,
    },

    #[error("service overloaded: {message}")]
    Overloaded { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl TwitterApiError {
    /// Transient errors are skipped for one cycle and retried on the next;
    /// everything else drives a state transition or aborts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TwitterApiError::Overloaded { .. } | TwitterApiError::Network { .. }
        )
    }

    /// Errors that are fatal to the whole process, not one account.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TwitterApiError::BadAppCredentials | TwitterApiError::AppSuspended
        )
    }
}

const TWITTER_API_BASE: &str = "https://api.twitter.com/1.1";

// API error codes, as documented for the v1.1 endpoints.
const CODE_BAD_APP_CREDENTIALS: u64 = 32;
const CODE_NOT_FOUND_PAGE: u64 = 34;
const CODE_USER_NOT_FOUND: u64 = 50;
const CODE_USER_SUSPENDED: u64 = 63;
const CODE_ACCOUNT_SUSPENDED: u64 = 64;
const CODE_RATE_LIMITED: u64 = 88;
const CODE_TOKEN_REVOKED: u64 = 89;
const CODE_OVER_CAPACITY: u64 = 130;
const CODE_INTERNAL_ERROR: u64 = 131;
const CODE_DM_NOT_FOLLOWING: u64 = 150;
const CODE_DUPLICATE_MESSAGE: u64 = 187;
const CODE_ACCOUNT_LOCKED: u64 = 326;
const CODE_DM_NOT_ALLOWED: u64 = 349;
const CODE_APP_SUSPENDED: u64 = 416;

/// OAuth token/secret pair authorizing calls as one identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub token: String,
    pub secret: String,
}

/// Rate limit information extracted from response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStatus {
    /// Requests remaining in the current window.
    pub remaining: Option<u64>,
    /// Epoch milliseconds when the window resets.
    pub reset_at_ms: Option<i64>,
}

/// One page of the follower-ID list.
#[derive(Debug, Clone)]
pub struct FollowerIdsPage {
    pub ids: Vec<String>,
    /// Opaque pagination token; "0" signals the final page.
    pub next_cursor: String,
    pub rate_limit: RateLimitStatus,
}

/// Relationship between the monitored account (source) and a target user.
#[derive(Debug, Clone, Default)]
pub struct Relationship {
    pub blocking: bool,
    pub blocked_by: bool,
    pub following: bool,
    pub followed_by: bool,
    pub target_screen_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowerIdsResponse {
    ids: Vec<String>,
    next_cursor_str: String,
}

#[derive(Debug, Deserialize)]
struct FriendshipResponse {
    relationship: FriendshipRelationship,
}

#[derive(Debug, Deserialize)]
struct FriendshipRelationship {
    source: FriendshipSource,
    target: FriendshipTarget,
}

#[derive(Debug, Deserialize)]
struct FriendshipSource {
    #[serde(default)]
    blocking: Option<bool>,
    #[serde(default)]
    blocked_by: Option<bool>,
    #[serde(default)]
    following: bool,
    #[serde(default)]
    followed_by: bool,
}

#[derive(Debug, Deserialize)]
struct FriendshipTarget {
    #[serde(default)]
    screen_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEntry {
    code: u64,
    #[serde(default)]
    message: String,
}

/// Client for the follower-ID pagination, relationship-probe and
/// direct-message APIs. App-level consumer keys live here; per-account
/// token/secret pairs are passed per call.
pub struct TwitterClient {
    http: Client,
    consumer_key: String,
    consumer_secret: String,
    api_base: String,
}

impl TwitterClient {
    pub fn new(consumer_key: String, consumer_secret: String) -> Result<Self> {
        let api_base =
            get_optional_env_var("DEFOLLOW_API_BASE").unwrap_or_else(|| TWITTER_API_BASE.to_string());
        Self::with_api_base(consumer_key, consumer_secret, api_base)
    }

    /// Creates a client using the DEFOLLOW_CONSUMER_KEY / DEFOLLOW_CONSUMER_SECRET
    /// env variables.
    pub fn from_env() -> Result<Self> {
        let consumer_key = get_required_env_var("DEFOLLOW_CONSUMER_KEY")?;
        let consumer_secret = get_required_env_var("DEFOLLOW_CONSUMER_SECRET")?;
        Self::new(consumer_key, consumer_secret)
    }

    /// Constructor with an explicit API base URL, used by tests against a
    /// local mock server.
    pub fn with_api_base(
        consumer_key: String,
        consumer_secret: String,
        api_base: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            consumer_key,
            consumer_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch one page of follower IDs for `user_id`, starting from `cursor`
    /// ("-1" for the first page).
    pub async fn follower_ids_page(
        &self,
        creds: &Credentials,
        user_id: &str,
        cursor: &str,
        page_size: u32,
    ) -> Result<FollowerIdsPage, TwitterApiError> {
        let url = format!("{base}/followers/ids.json", base = self.api_base);
        let query = [
            ("user_id", user_id.to_string()),
            ("cursor", cursor.to_string()),
            ("stringify_ids", "true".to_string()),
            ("count", page_size.to_string()),
        ];

        let (response, rate_limit) = self
            .signed_get(creds, &url, &query, &format!("followers of {user_id}"))
            .await?;

        let body: FollowerIdsResponse = response.json().await.map_err(|e| {
            TwitterApiError::Api {
                status: 200,
                message: format!("Failed to parse follower ids response: {e}"),
            }
        })?;

        debug!(
            "Fetched follower page for {user_id}: {count} ids, next cursor {next_cursor}",
            count = body.ids.len(),
            next_cursor = body.next_cursor_str
        );

        Ok(FollowerIdsPage {
            ids: body.ids,
            next_cursor: body.next_cursor_str,
            rate_limit,
        })
    }

    /// Probe the relationship between the monitored account and one target
    /// user. Subject to its own, tighter rate limit than the follower list.
    pub async fn relationship(
        &self,
        creds: &Credentials,
        source_id: &str,
        target_id: &str,
    ) -> Result<Relationship, TwitterApiError> {
        let url = format!("{base}/friendships/show.json", base = self.api_base);
        let query = [
            ("source_id", source_id.to_string()),
            ("target_id", target_id.to_string()),
        ];

        let (response, _) = self
            .signed_get(
                creds,
                &url,
                &query,
                &format!("relationship {source_id} -> {target_id}"),
            )
            .await?;

        let body: FriendshipResponse = response.json().await.map_err(|e| {
            TwitterApiError::Api {
                status: 200,
                message: format!("Failed to parse relationship response: {e}"),
            }
        })?;

        Ok(Relationship {
            blocking: body.relationship.source.blocking.unwrap_or(false),
            blocked_by: body.relationship.source.blocked_by.unwrap_or(false),
            following: body.relationship.source.following,
            followed_by: body.relationship.source.followed_by,
            target_screen_name: body.relationship.target.screen_name,
        })
    }

    /// Send a direct message to `recipient_id` as the identity behind `creds`.
    pub async fn send_direct_message(
        &self,
        creds: &Credentials,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), TwitterApiError> {
        let url = format!(
            "{base}/direct_messages/events/new.json",
            base = self.api_base
        );
        let payload = serde_json::json!({
            "event": {
                "type": "message_create",
                "message_create": {
                    "target": { "recipient_id": recipient_id },
                    "message_data": { "text": text },
                }
            }
        });

        let secrets = reqwest_oauth1::Secrets::new(
            self.consumer_key.clone(),
            self.consumer_secret.clone(),
        )
        .token(creds.token.clone(), creds.secret.clone());

        let response = self
            .http
            .clone()
            .oauth1(secrets)
            .post(url.as_str())
            .header("content-type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| TwitterApiError::Network {
                message: format!("Failed to send direct message to {recipient_id}: {e}"),
            })?;

        let (_, _) = Self::check_response_status(response, "direct message send").await?;
        debug!("Direct message delivered to {recipient_id}");
        Ok(())
    }

    /// Cheap validity probe used by the recovery loop: succeeds iff the
    /// token pair still authenticates.
    pub async fn verify_credentials(&self, creds: &Credentials) -> Result<(), TwitterApiError> {
        let url = format!(
            "{base}/account/verify_credentials.json",
            base = self.api_base
        );
        let (_, _) = self
            .signed_get(creds, &url, &[], "credential verification")
            .await?;
        Ok(())
    }

    fn create_backoff_config(&self) -> impl Backoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(Duration::from_secs(90)))
            .build()
    }

    /// Sleep duration with 0-999ms of jitter to avoid thundering herds.
    fn sleep_duration_with_jitter(base: Duration) -> Duration {
        let jitter = rand::random::<u64>() % 1000;
        base + Duration::from_millis(jitter)
    }

    /// Makes a signed GET with automatic retries for network-level failures.
    /// Rate limiting is NOT retried here: quota handling belongs to the
    /// scheduler, so 429s surface as `RateLimited` immediately.
    async fn signed_get(
        &self,
        creds: &Credentials,
        url: &str,
        query: &[(&str, String)],
        resource_desc: &str,
    ) -> Result<(reqwest::Response, RateLimitStatus), TwitterApiError> {
        let mut backoff = self.create_backoff_config();
        let mut attempt = 0;
        let max_attempts = 4;

        loop {
            debug!(%url, "Requesting {resource_desc}");

            let secrets = reqwest_oauth1::Secrets::new(
                self.consumer_key.clone(),
                self.consumer_secret.clone(),
            )
            .token(creds.token.clone(), creds.secret.clone());

            let result = self
                .http
                .clone()
                .oauth1(secrets)
                .get(url)
                .query(query)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(TwitterApiError::Network {
                            message: format!(
                                "Request for {resource_desc} failed after {attempt} attempts: {err}"
                            ),
                        });
                    }

                    let backoff_time = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(5 * attempt as u64));
                    let sleep_duration = Self::sleep_duration_with_jitter(backoff_time);
                    warn!(
                        "Network failure requesting {resource_desc}, retrying in {sleep_duration:?} (attempt {attempt}/{max_attempts}): {err}"
                    );
                    tokio::time::sleep(sleep_duration).await;
                    continue;
                }
            };

            return Self::check_response_status(response, resource_desc).await;
        }
    }

    /// Parses rate limit headers and maps non-success statuses onto the
    /// error taxonomy.
    async fn check_response_status(
        response: reqwest::Response,
        resource_desc: &str,
    ) -> Result<(reqwest::Response, RateLimitStatus), TwitterApiError> {
        let rate_limit = parse_rate_limit_headers(&response);
        let status = response.status();

        if status.is_success() {
            return Ok((response, rate_limit));
        }

        let body_text = response.text().await.unwrap_or_default();
        let coded_error = serde_json::from_str::<ApiErrorBody>(&body_text)
            .ok()
            .and_then(|body| body.errors.into_iter().next());

        if let Some(entry) = coded_error {
            debug!(
                "Coded API error for {resource_desc}: code {code}, message {message}",
                code = entry.code,
                message = entry.message
            );
            if let Some(mapped) = map_error_code(entry.code, &entry.message, rate_limit) {
                return Err(mapped);
            }
        }

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => TwitterApiError::RateLimited {
                remaining: rate_limit.remaining,
                reset_at_ms: rate_limit.reset_at_ms,
            },
            StatusCode::NOT_FOUND => TwitterApiError::NotFound,
            s if s.is_server_error() => TwitterApiError::Overloaded {
                message: format!("{resource_desc}: HTTP {status}"),
            },
            _ => TwitterApiError::Api {
                status: status.as_u16(),
                message: format!("{resource_desc}: {body_text}"),
            },
        })
    }
}

/// Maps a coded error payload entry onto the taxonomy. Returns `None` for
/// unrecognized codes so the HTTP status fallback applies.
fn map_error_code(
    code: u64,
    message: &str,
    rate_limit: RateLimitStatus,
) -> Option<TwitterApiError> {
    let err = match code {
        CODE_BAD_APP_CREDENTIALS => TwitterApiError::BadAppCredentials,
        CODE_APP_SUSPENDED => TwitterApiError::AppSuspended,
        CODE_TOKEN_REVOKED => TwitterApiError::TokenRevoked,
        CODE_ACCOUNT_SUSPENDED => TwitterApiError::AccountSuspended,
        CODE_USER_SUSPENDED => TwitterApiError::UserSuspended,
        CODE_NOT_FOUND_PAGE | CODE_USER_NOT_FOUND => TwitterApiError::NotFound,
        CODE_ACCOUNT_LOCKED => TwitterApiError::Locked,
        CODE_DM_NOT_FOLLOWING | CODE_DM_NOT_ALLOWED => TwitterApiError::DmsClosed,
        CODE_DUPLICATE_MESSAGE => TwitterApiError::DuplicateMessage,
        CODE_RATE_LIMITED => TwitterApiError::RateLimited {
            remaining: rate_limit.remaining,
            reset_at_ms: rate_limit.reset_at_ms,
        },
        CODE_OVER_CAPACITY | CODE_INTERNAL_ERROR => TwitterApiError::Overloaded {
            message: message.to_string(),
        },
        _ => return None,
    };
    Some(err)
}

fn parse_rate_limit_headers(response: &reqwest::Response) -> RateLimitStatus {
    let remaining = response
        .headers()
        .get("x-rate-limit-remaining")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    // The reset header is epoch seconds; the engine works in milliseconds.
    let reset_at_ms = response
        .headers()
        .get("x-rate-limit-reset")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .map(|secs| secs * 1000);

    RateLimitStatus {
        remaining,
        reset_at_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_code_taxonomy() {
        let rl = RateLimitStatus::default();
        assert!(matches!(
            map_error_code(32, "", rl),
            Some(TwitterApiError::BadAppCredentials)
        ));
        assert!(matches!(
            map_error_code(89, "", rl),
            Some(TwitterApiError::TokenRevoked)
        ));
        assert!(matches!(
            map_error_code(64, "", rl),
            Some(TwitterApiError::AccountSuspended)
        ));
        assert!(matches!(
            map_error_code(63, "", rl),
            Some(TwitterApiError::UserSuspended)
        ));
        assert!(matches!(
            map_error_code(34, "", rl),
            Some(TwitterApiError::NotFound)
        ));
        assert!(matches!(
            map_error_code(50, "", rl),
            Some(TwitterApiError::NotFound)
        ));
        assert!(matches!(
            map_error_code(326, "", rl),
            Some(TwitterApiError::Locked)
        ));
        assert!(matches!(
            map_error_code(150, "", rl),
            Some(TwitterApiError::DmsClosed)
        ));
        assert!(matches!(
            map_error_code(187, "", rl),
            Some(TwitterApiError::DuplicateMessage)
        ));
        assert!(matches!(
            map_error_code(130, "over capacity", rl),
            Some(TwitterApiError::Overloaded { .. })
        ));
        assert!(map_error_code(9999, "", rl).is_none());
    }

    #[test]
    fn test_rate_limited_carries_reset() {
        let rl = RateLimitStatus {
            remaining: Some(0),
            reset_at_ms: Some(1_700_000_000_000),
        };
        match map_error_code(88, "Rate limit exceeded", rl) {
            Some(TwitterApiError::RateLimited {
                remaining,
                reset_at_ms,
            }) => {
                assert_eq!(remaining, Some(0));
                assert_eq!(reset_at_ms, Some(1_700_000_000_000));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_transient_and_fatal_classification() {
        assert!(TwitterApiError::Network {
            message: "timeout".into()
        }
        .is_transient());
        assert!(TwitterApiError::Overloaded {
            message: "over capacity".into()
        }
        .is_transient());
        assert!(!TwitterApiError::TokenRevoked.is_transient());

        assert!(TwitterApiError::BadAppCredentials.is_fatal());
        assert!(TwitterApiError::AppSuspended.is_fatal());
        assert!(!TwitterApiError::AccountSuspended.is_fatal());
    }

    #[test]
    fn test_parse_follower_ids_response() {
        let json = serde_json::json!({
            "ids": ["100", "200", "300"],
            "next_cursor": 0,
            "next_cursor_str": "0",
            "previous_cursor_str": "0"
        });
        let parsed: FollowerIdsResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.ids, vec!["100", "200", "300"]);
        assert_eq!(parsed.next_cursor_str, "0");
    }

    #[test]
    fn test_parse_relationship_response() {
        let json = serde_json::json!({
            "relationship": {
                "source": {
                    "blocking": false,
                    "blocked_by": null,
                    "following": true,
                    "followed_by": false
                },
                "target": { "screen_name": "somebody" }
            }
        });
        let parsed: FriendshipResponse = serde_json::from_value(json).unwrap();
        assert!(parsed.relationship.source.following);
        assert!(!parsed.relationship.source.followed_by);
        assert_eq!(
            parsed.relationship.target.screen_name.as_deref(),
            Some("somebody")
        );
    }
}
