//! HTTP API client and session management.
//!
//! `SimpliSafeClient` owns the credentials, the token quadruple, and the
//! cached user/subscription identifiers, and funnels every vendor call
//! through a single authenticated-request primitive with bounded
//! refresh/re-login recovery. Account operations are thin path builders on
//! top of that primitive.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::retry::{AuthRetry, RecoveryStep};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Production base endpoint for the vendor HTTP API.
pub const API_BASE_URL: &str = "https://api.simplisafe.com/v1";

// Fixed client identity used for both OAuth grants against the token
// endpoint. The password half of the identity is intentionally empty.
const CLIENT_USERNAME: &str = "4df55627-46b2-4e2c-866b-1521b395ded2.1-28-0.WebApp.simplisafe.com";
const CLIENT_PASSWORD: &str = "";

const VALID_ALARM_TARGETS: &[&str] = &["off", "home", "away"];

/// Panel state reported by (or requested of) the vendor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlarmState {
    Off,
    Home,
    Away,
    AwayCount,
    HomeCount,
    AlarmCount,
    Alarm,
}

impl AlarmState {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OFF" => Some(Self::Off),
            "HOME" => Some(Self::Home),
            "AWAY" => Some(Self::Away),
            "AWAY_COUNT" => Some(Self::AwayCount),
            "HOME_COUNT" => Some(Self::HomeCount),
            "ALARM_COUNT" => Some(Self::AlarmCount),
            "ALARM" => Some(Self::Alarm),
            _ => None,
        }
    }

    /// Vendor wire spelling of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Home => "HOME",
            Self::Away => "AWAY",
            Self::AwayCount => "AWAY_COUNT",
            Self::HomeCount => "HOME_COUNT",
            Self::AlarmCount => "ALARM_COUNT",
            Self::Alarm => "ALARM",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by session management and vendor API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Operation attempted without a usable session.
    #[error("user is not logged in")]
    NotAuthenticated,

    /// Login or refresh rejected by the vendor token endpoint.
    #[error("authentication rejected ({status}): {detail}")]
    AuthFailure { status: StatusCode, detail: String },

    /// Multiple subscriptions exist and none was specified or cached.
    #[error("subscription id is ambiguous")]
    AmbiguousSubscription,

    /// Caller-supplied argument rejected before any network call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Response is missing fields the operation requires.
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),

    /// Network-level failure with no structured vendor response.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Structured error payload returned by the vendor API.
    #[error("api error {status}: {body}")]
    Vendor { status: StatusCode, body: Value },
}

impl ApiError {
    /// True for a vendor 401 on an authenticated request.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Vendor { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }

    /// True when the token endpoint refused a grant on auth grounds.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// Request issued through the authenticated choke point.
///
/// `path` is relative to the API base endpoint and may carry a query string.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
        }
    }
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: SecretString,
}

/// Token quadruple; always replaced or cleared as a unit.
struct TokenSet {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_at: SystemTime,
}

#[derive(Default)]
struct Session {
    credentials: Option<Credentials>,
    tokens: Option<TokenSet>,
    user_id: Option<u64>,
    subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: u64,
}

/// Session-managing client for the vendor HTTP API.
///
/// Mutating operations take `&mut self`, so a single caller is serialized
/// structurally; concurrent deployments should wrap the client in a mutex
/// or actor so refresh/login never race.
pub struct SimpliSafeClient {
    http: Client,
    base_url: String,
    session: Session,
}

impl SimpliSafeClient {
    /// Creates a client against the production API endpoint.
    pub fn new() -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: API_BASE_URL.to_string(),
            session: Session::default(),
        })
    }

    /// Sets an explicit API base endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.base_url = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Exchanges username/password for a token pair.
    ///
    /// With `store_credentials`, the pair is retained for silent re-login
    /// when a later refresh is rejected. On failure the token state is
    /// cleared (credentials kept iff retention was requested) and the
    /// vendor or transport error surfaces.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
        store_credentials: bool,
    ) -> Result<(), ApiError> {
        if store_credentials {
            self.session.credentials = Some(Credentials {
                username: username.to_string(),
                password: SecretString::new(password.to_string()),
            });
        }

        let body = json!({
            "username": username,
            "password": password,
            "grant_type": "password",
        });

        match self.token_grant(body).await {
            Ok(()) => {
                debug!(event = "login_succeeded");
                Ok(())
            }
            Err(err) => {
                self.logout(store_credentials);
                Err(err)
            }
        }
    }

    /// Clears token state and the cached user id.
    pub fn logout(&mut self, keep_credentials: bool) {
        self.session.tokens = None;
        self.session.user_id = None;
        if !keep_credentials {
            self.session.credentials = None;
        }
    }

    /// True iff a refresh token is held, or an unexpired access token is.
    pub fn is_logged_in(&self) -> bool {
        self.session.tokens.as_ref().is_some_and(|tokens| {
            !tokens.refresh_token.is_empty() || SystemTime::now() < tokens.expires_at
        })
    }

    /// Exchanges the held refresh token for a new token pair.
    ///
    /// On rejection the session is logged out (credentials kept iff stored)
    /// and the error surfaces to the caller.
    pub async fn refresh_access_token(&mut self) -> Result<(), ApiError> {
        let Some(refresh_token) = self
            .session
            .tokens
            .as_ref()
            .map(|tokens| tokens.refresh_token.clone())
        else {
            return Err(ApiError::NotAuthenticated);
        };

        let body = json!({
            "refresh_token": refresh_token,
            "grant_type": "refresh_token",
        });

        match self.token_grant(body).await {
            Ok(()) => {
                debug!(event = "access_token_refreshed");
                Ok(())
            }
            Err(err) => {
                let keep_credentials = self.session.credentials.is_some();
                self.logout(keep_credentials);
                Err(err)
            }
        }
    }

    async fn token_grant(&mut self, body: Value) -> Result<(), ApiError> {
        let url = format!("{}/api/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(CLIENT_USERNAME, Some(CLIENT_PASSWORD))
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::AuthFailure {
                status,
                detail: summarize_error_body(&text),
            });
        }

        let token: TokenResponse = serde_json::from_str(&text).map_err(|err| {
            ApiError::UnexpectedShape(format!("token response was not understood: {err}"))
        })?;

        self.session.tokens = Some(TokenSet {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            expires_at: SystemTime::now() + Duration::from_secs(token.expires_in),
        });
        Ok(())
    }

    /// Issues an authenticated request with bounded recovery.
    ///
    /// A 401 on the first attempt triggers exactly one token refresh and one
    /// retry; a refresh rejected with 401/403 while credentials are stored
    /// triggers exactly one re-login and one further retry. Everything else
    /// propagates unchanged.
    pub async fn request(&mut self, request: ApiRequest) -> Result<Value, ApiError> {
        let mut recovery = AuthRetry::new();

        loop {
            let err = match self.send_authorized(&request).await {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };

            if !err.is_unauthorized() {
                return Err(err);
            }
            if recovery.on_unauthorized_response() != RecoveryStep::RefreshToken {
                return Err(err);
            }

            debug!(event = "refresh_after_unauthorized", path = %request.path);
            if let Err(refresh_err) = self.refresh_access_token().await {
                let credentials = self.session.credentials.clone();
                let step = recovery.on_refresh_rejected(
                    refresh_err.is_auth_rejection(),
                    credentials.is_some(),
                );
                match (step, credentials) {
                    (RecoveryStep::Relogin, Some(credentials)) => {
                        debug!(event = "relogin_after_refresh_rejection");
                        self.login(
                            &credentials.username,
                            credentials.password.expose_secret(),
                            true,
                        )
                        .await?;
                    }
                    _ => return Err(refresh_err),
                }
            }
        }
    }

    async fn send_authorized(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let Some(tokens) = self.session.tokens.as_ref() else {
            return Err(ApiError::NotAuthenticated);
        };

        let url = format!("{}{}", self.base_url, request.path);
        let response = self
            .http
            .request(request.method.clone(), &url)
            .header(
                AUTHORIZATION,
                format!("{} {}", tokens.token_type, tokens.access_token),
            )
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::Vendor {
                status,
                body: parse_body(&text),
            });
        }

        Ok(parse_body(&text))
    }

    pub(crate) fn access_token(&self) -> Option<&str> {
        self.session
            .tokens
            .as_ref()
            .map(|tokens| tokens.access_token.as_str())
    }

    /// Returns the account user id, resolving and caching it on first use.
    pub async fn user_id(&mut self) -> Result<u64, ApiError> {
        if let Some(user_id) = self.session.user_id {
            return Ok(user_id);
        }

        let data = self.request(ApiRequest::get("/api/authCheck")).await?;
        let user_id = data
            .get("userId")
            .and_then(Value::as_u64)
            .ok_or_else(|| ApiError::UnexpectedShape("authCheck response missing userId".into()))?;
        self.session.user_id = Some(user_id);
        Ok(user_id)
    }

    /// Fetches the account login info record.
    pub async fn get_user_info(&mut self) -> Result<Value, ApiError> {
        let user_id = self.user_id().await?;
        let data = self
            .request(ApiRequest::get(format!("/users/{user_id}/loginInfo")))
            .await?;
        data.get("loginInfo")
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedShape("response missing loginInfo".into()))
    }

    /// Lists all subscriptions on the account.
    ///
    /// When exactly one subscription exists its id becomes the cached
    /// default.
    pub async fn get_subscriptions(&mut self) -> Result<Vec<Value>, ApiError> {
        let user_id = self.user_id().await?;
        let data = self
            .request(ApiRequest::get(format!(
                "/users/{user_id}/subscriptions?activeOnly=false"
            )))
            .await?;

        let subscriptions = data
            .get("subscriptions")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedShape("response missing subscriptions".into()))?;

        if subscriptions.len() == 1 {
            if let Some(sid) = subscription_sid(&subscriptions[0]) {
                self.session.subscription_id = Some(sid);
            }
        }

        Ok(subscriptions)
    }

    /// Fetches one subscription record.
    ///
    /// Resolution order: explicit id, cached default, then the account list
    /// when it holds exactly one entry. Anything else is an unresolvable
    /// ambiguity and fails rather than guessing.
    pub async fn get_subscription(&mut self, sub_id: Option<&str>) -> Result<Value, ApiError> {
        let sid = match sub_id
            .map(str::to_string)
            .or_else(|| self.session.subscription_id.clone())
        {
            Some(sid) => sid,
            None => {
                let subscriptions = self.get_subscriptions().await?;
                if subscriptions.len() != 1 {
                    return Err(ApiError::AmbiguousSubscription);
                }
                subscription_sid(&subscriptions[0]).ok_or_else(|| {
                    ApiError::UnexpectedShape("subscription record missing sid".into())
                })?
            }
        };

        let data = self
            .request(ApiRequest::get(format!("/subscriptions/{sid}/")))
            .await?;
        data.get("subscription")
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedShape("response missing subscription".into()))
    }

    /// Overwrites the cached default subscription id.
    pub fn set_default_subscription(&mut self, sub_id: &str) -> Result<(), ApiError> {
        if sub_id.is_empty() {
            return Err(ApiError::InvalidArgument(
                "subscription id must not be empty".into(),
            ));
        }
        self.session.subscription_id = Some(sub_id.to_string());
        Ok(())
    }

    /// Reads the current panel state from the default subscription.
    ///
    /// An active alarm flag on the system record forces [`AlarmState::Alarm`]
    /// regardless of the reported state field.
    pub async fn get_alarm_state(&mut self) -> Result<AlarmState, ApiError> {
        let subscription = self.get_subscription(None).await?;
        alarm_state_from_subscription(&subscription)
    }

    /// Requests a panel state change.
    ///
    /// `target_state` is matched case-insensitively against `off`, `home`,
    /// and `away`; anything else fails before any network call.
    pub async fn set_alarm_state(&mut self, target_state: &str) -> Result<Value, ApiError> {
        let state = target_state.to_ascii_lowercase();
        if !VALID_ALARM_TARGETS.contains(&state.as_str()) {
            return Err(ApiError::InvalidArgument(format!(
                "invalid target state: {target_state}"
            )));
        }

        let sid = self.default_subscription_id().await?;
        self.request(ApiRequest::post(format!(
            "/ss3/subscriptions/{sid}/state/{state}"
        )))
        .await
    }

    /// Fetches the event log for the default subscription.
    ///
    /// `params` is serialized as `key=value` pairs joined by `&`; an empty
    /// map adds no query string.
    pub async fn get_events(
        &mut self,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, ApiError> {
        let sid = self.default_subscription_id().await?;

        let mut path = format!("/subscriptions/{sid}/events");
        if !params.is_empty() {
            let query: Vec<String> = params
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            path = format!("{path}?{}", query.join("&"));
        }

        let data = self.request(ApiRequest::get(path)).await?;
        data.get("events")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedShape("response missing events".into()))
    }

    /// Fetches the sensor list for the default subscription.
    pub async fn get_sensors(&mut self, force_update: bool) -> Result<Vec<Value>, ApiError> {
        let sid = self.default_subscription_id().await?;
        let data = self
            .request(ApiRequest::get(format!(
                "/ss3/subscriptions/{sid}/sensors?forceUpdate={force_update}"
            )))
            .await?;
        data.get("sensors")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedShape("response missing sensors".into()))
    }

    async fn default_subscription_id(&mut self) -> Result<String, ApiError> {
        if let Some(sid) = self.session.subscription_id.clone() {
            return Ok(sid);
        }
        self.get_subscription(None).await?;
        self.session
            .subscription_id
            .clone()
            .ok_or(ApiError::AmbiguousSubscription)
    }
}

fn subscription_sid(subscription: &Value) -> Option<String> {
    match subscription.get("sid") {
        Some(Value::Number(sid)) => Some(sid.to_string()),
        Some(Value::String(sid)) => Some(sid.clone()),
        _ => None,
    }
}

fn alarm_state_from_subscription(subscription: &Value) -> Result<AlarmState, ApiError> {
    let system = subscription
        .get("location")
        .and_then(|location| location.get("system"))
        .ok_or_else(|| {
            ApiError::UnexpectedShape("subscription missing location.system".into())
        })?;

    if system
        .get("isAlarming")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(AlarmState::Alarm);
    }

    let state = system
        .get("alarmState")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::UnexpectedShape("system record missing alarmState".into()))?;
    AlarmState::parse(state)
        .ok_or_else(|| ApiError::UnexpectedShape(format!("unknown alarm state: {state}")))
}

fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error_description.or(parsed.message).or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use secrecy::SecretString;
    use serde_json::json;

    use super::{
        alarm_state_from_subscription, summarize_error_body, AlarmState, ApiError, Credentials,
        SimpliSafeClient, TokenSet, API_BASE_URL,
    };

    fn client() -> SimpliSafeClient {
        SimpliSafeClient::new().expect("build client")
    }

    fn token_set(refresh_token: &str, expires_in: Duration) -> TokenSet {
        TokenSet {
            access_token: "access".to_string(),
            refresh_token: refresh_token.to_string(),
            token_type: "Bearer".to_string(),
            expires_at: SystemTime::now() + expires_in,
        }
    }

    #[test]
    fn client_uses_production_base_url() {
        assert_eq!(API_BASE_URL, "https://api.simplisafe.com/v1");
        let client = client().with_endpoint("http://localhost:9000/");
        assert_eq!(client.base_url, "http://localhost:9000");
    }

    #[test]
    fn logged_in_with_refresh_token_even_after_expiry() {
        let mut client = client();
        assert!(!client.is_logged_in());

        client.session.tokens = Some(token_set("refresh", Duration::ZERO));
        assert!(client.is_logged_in());
    }

    #[test]
    fn not_logged_in_when_access_token_expired_and_no_refresh_token() {
        let mut client = client();
        client.session.tokens = Some(token_set("", Duration::ZERO));
        assert!(!client.is_logged_in());

        client.session.tokens = Some(token_set("", Duration::from_secs(3600)));
        assert!(client.is_logged_in());
    }

    #[test]
    fn logout_clears_tokens_and_user_id_as_a_unit() {
        let mut client = client();
        client.session.tokens = Some(token_set("refresh", Duration::from_secs(3600)));
        client.session.user_id = Some(42);
        client.session.credentials = Some(Credentials {
            username: "user@example.com".to_string(),
            password: SecretString::new("hunter2".to_string()),
        });

        client.logout(true);
        assert!(client.session.tokens.is_none());
        assert!(client.session.user_id.is_none());
        assert!(client.session.credentials.is_some());

        client.logout(false);
        assert!(client.session.credentials.is_none());
    }

    #[test]
    fn set_default_subscription_rejects_empty_and_overwrites_otherwise() {
        let mut client = client();
        client.session.subscription_id = Some("1111".to_string());

        let err = client.set_default_subscription("").expect_err("empty id");
        assert!(matches!(err, ApiError::InvalidArgument(_)));
        assert_eq!(client.session.subscription_id.as_deref(), Some("1111"));

        client.set_default_subscription("2222").expect("overwrite");
        assert_eq!(client.session.subscription_id.as_deref(), Some("2222"));
    }

    #[test]
    fn set_alarm_state_rejects_invalid_target_before_any_network_call() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            // No session at all: validation must fire before auth or I/O.
            let mut client = client();
            let err = client
                .set_alarm_state("disarm")
                .await
                .expect_err("invalid target");
            assert!(matches!(err, ApiError::InvalidArgument(_)));
        });
    }

    #[test]
    fn alarming_flag_forces_alarm_state() {
        let subscription = json!({
            "location": {
                "system": { "isAlarming": true, "alarmState": "HOME" }
            }
        });
        let state = alarm_state_from_subscription(&subscription).expect("state");
        assert_eq!(state, AlarmState::Alarm);
    }

    #[test]
    fn alarm_state_read_from_system_record() {
        let subscription = json!({
            "location": {
                "system": { "isAlarming": false, "alarmState": "AWAY_COUNT" }
            }
        });
        let state = alarm_state_from_subscription(&subscription).expect("state");
        assert_eq!(state, AlarmState::AwayCount);
    }

    #[test]
    fn missing_system_record_is_an_unexpected_shape() {
        let subscription = json!({ "location": {} });
        let err = alarm_state_from_subscription(&subscription).expect_err("shape");
        assert!(matches!(err, ApiError::UnexpectedShape(_)));
    }

    #[test]
    fn unknown_alarm_state_string_is_an_unexpected_shape() {
        let subscription = json!({
            "location": { "system": { "alarmState": "PANIC" } }
        });
        let err = alarm_state_from_subscription(&subscription).expect_err("shape");
        assert!(matches!(err, ApiError::UnexpectedShape(_)));
    }

    #[test]
    fn error_body_summary_prefers_structured_description() {
        let detail = summarize_error_body(r#"{"error":"invalid_grant","error_description":"bad refresh token"}"#);
        assert_eq!(detail, "bad refresh token");

        let fallback = summarize_error_body("gateway timeout");
        assert_eq!(fallback, "gateway timeout");
    }
}
