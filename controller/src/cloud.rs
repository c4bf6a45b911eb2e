use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use growlight_common::{AccountConfig, CloudConfig, LampInfo, SessionState};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{
    AdjustLightRequest, ApiEnvelope, ApiOutcome, DeviceEntry, DeviceListData, DeviceListRequest,
    LampSwitchRequest, LoginRequest, LoginResponse, SystemData, ADJUST_LIGHT_PATH,
    CODE_TOKEN_EXPIRED, DEVICE_LIST_PATH, LAMP_SWITCH_PATH, LOGIN_PATH,
};

/// Re-logins allowed per command after the server reports an expired token.
const MAX_EXPIRY_RETRIES: u32 = 1;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("{endpoint} rejected with code {code}: {message}")]
    CommandRejected {
        endpoint: &'static str,
        code: String,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        CloudError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Transport(format!("malformed response: {err}"))
    }
}

/// One JSON request/response round-trip against the cloud API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, path: &str, system_data: &str, body: Value) -> Result<Value, CloudError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, path: &str, system_data: &str, body: Value) -> Result<Value, CloudError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("systemData", system_data)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.bytes().await?;
        serde_json::from_slice(&raw).map_err(|err| {
            CloudError::Transport(format!("{path} returned {status} with malformed body: {err}"))
        })
    }
}

/// Login token and discovered lamp for the single controlled device.
///
/// All operations take `&mut self`; callers sharing a session serialize through
/// one lock so login, discovery and commands never interleave.
pub struct DeviceSession<T = HttpTransport> {
    transport: T,
    account: AccountConfig,
    token: String,
    token_issued_at: Option<Instant>,
    token_ttl: Duration,
    device_id: String,
    group_id: Option<String>,
    lamp: Option<LampInfo>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, account: AccountConfig, token_ttl: Duration) -> Self {
        Self {
            transport,
            account,
            token: String::new(),
            token_issued_at: None,
            token_ttl,
            device_id: String::new(),
            group_id: None,
            lamp: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.token.is_empty() {
            SessionState::Unauthenticated
        } else if self.device_id.is_empty() {
            SessionState::Authenticated
        } else {
            SessionState::AuthenticatedWithDevice
        }
    }

    pub fn lamp(&self) -> Option<&LampInfo> {
        self.lamp.as_ref()
    }

    fn token_is_fresh(&self) -> bool {
        !self.token.is_empty()
            && self
                .token_issued_at
                .is_some_and(|issued| issued.elapsed() < self.token_ttl)
    }

    /// Logs in unless a token younger than the TTL is cached.
    pub async fn ensure_session(&mut self) -> Result<(), CloudError> {
        if self.token_is_fresh() {
            debug!("token still valid, skipping login");
            return Ok(());
        }
        self.login().await
    }

    /// Unconditional login. The cached token is only replaced on success.
    pub async fn login(&mut self) -> Result<(), CloudError> {
        let body = to_body(&LoginRequest::email(
            &self.account.email,
            &self.account.password,
        ))?;
        let raw = self
            .transport
            .post(LOGIN_PATH, &self.system_data()?, body)
            .await?;

        let response: LoginResponse = serde_json::from_value(raw).map_err(|err| {
            CloudError::AuthenticationFailed(format!("malformed login response: {err}"))
        })?;
        let token = response
            .into_token()
            .map_err(CloudError::AuthenticationFailed)?;

        self.token = token;
        self.token_issued_at = Some(Instant::now());
        info!("login successful, token received");
        Ok(())
    }

    pub async fn ensure_device(&mut self) -> Result<(), CloudError> {
        if self.device_id.is_empty() {
            self.discover().await?;
        }
        Ok(())
    }

    /// Lists the account's lights and adopts the first one.
    pub async fn discover(&mut self) -> Result<LampInfo, CloudError> {
        let body = to_body(&DeviceListRequest::lights())?;
        let data: Option<DeviceListData> = self.send_command(DEVICE_LIST_PATH, body).await?;

        let Some(first) = data.unwrap_or_default().list.into_iter().next() else {
            warn!("no light devices found");
            return Err(CloudError::DeviceNotFound(
                "no light devices available".to_string(),
            ));
        };
        let Some(entry) = DeviceEntry::from_json(first) else {
            warn!("first device entry is not an object");
            return Err(CloudError::DeviceNotFound("invalid device data".to_string()));
        };
        let Some(lamp) = entry.into_lamp_info() else {
            return Err(CloudError::DeviceNotFound(
                "device id not found in response".to_string(),
            ));
        };

        info!(
            device_id = %lamp.id,
            group_id = lamp.group_id.as_deref().unwrap_or("-"),
            name = lamp.device_name.as_deref().unwrap_or("-"),
            "discovered lamp"
        );
        self.device_id = lamp.id.clone();
        self.group_id = lamp.group_id.clone();
        self.lamp = Some(lamp.clone());
        Ok(lamp)
    }

    pub async fn apply_brightness(&mut self, level: u8) -> Result<(), CloudError> {
        self.ensure_device().await?;
        self.ensure_session().await?;

        let body = to_body(&AdjustLightRequest {
            light: level,
            device_id: &self.device_id,
            group_id: self.group_id.as_deref(),
        })?;
        self.send_command::<serde::de::IgnoredAny>(ADJUST_LIGHT_PATH, body)
            .await?;

        if let Some(lamp) = self.lamp.as_mut() {
            lamp.light_rate = Some(i64::from(level));
        }
        info!(level, "brightness set successfully");
        Ok(())
    }

    pub async fn toggle_switch(&mut self, on: bool) -> Result<(), CloudError> {
        self.ensure_device().await?;
        self.ensure_session().await?;

        let body = to_body(&LampSwitchRequest {
            is_close: !on,
            device_id: &self.device_id,
            group_id: self.group_id.as_deref(),
        })?;
        self.send_command::<serde::de::IgnoredAny>(LAMP_SWITCH_PATH, body)
            .await?;

        if let Some(lamp) = self.lamp.as_mut() {
            lamp.is_close = Some(!on);
        }
        info!(on, "lamp switch set");
        Ok(())
    }

    /// Sends `body` to `endpoint`, re-authenticating at most
    /// `MAX_EXPIRY_RETRIES` times when the server reports an expired token.
    async fn send_command<R: DeserializeOwned>(
        &mut self,
        endpoint: &'static str,
        body: Value,
    ) -> Result<Option<R>, CloudError> {
        let mut retries = 0;
        loop {
            self.ensure_session().await?;
            let raw = self
                .transport
                .post(endpoint, &self.system_data()?, body.clone())
                .await?;
            let envelope: ApiEnvelope<R> = serde_json::from_value(raw)?;

            match envelope.into_outcome() {
                ApiOutcome::Success(data) => return Ok(data),
                ApiOutcome::TokenExpired if retries < MAX_EXPIRY_RETRIES => {
                    retries += 1;
                    warn!(endpoint, "token expired, re-authenticating");
                    self.login().await?;
                }
                ApiOutcome::TokenExpired => {
                    return Err(CloudError::CommandRejected {
                        endpoint,
                        code: CODE_TOKEN_EXPIRED.to_string(),
                        message: "token still rejected after re-authentication".to_string(),
                    });
                }
                ApiOutcome::Rejected { code, message } => {
                    warn!(endpoint, %code, %message, "error in api response");
                    return Err(CloudError::CommandRejected {
                        endpoint,
                        code,
                        message,
                    });
                }
            }
        }
    }

    fn system_data(&self) -> Result<String, CloudError> {
        let data = SystemData::new(
            Utc::now(),
            &self.device_id,
            &self.account.wifi_name,
            &self.token,
            &self.account.timezone,
            &self.account.language,
        );
        serde_json::to_string(&data)
            .map_err(|err| CloudError::Transport(format!("failed to encode systemData: {err}")))
    }
}

fn to_body<S: Serialize>(request: &S) -> Result<Value, CloudError> {
    serde_json::to_value(request)
        .map_err(|err| CloudError::Transport(format!("failed to encode request: {err}")))
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{account, login_ok, success, ScriptedTransport};
    use super::*;

    fn session(transport: &ScriptedTransport) -> DeviceSession<ScriptedTransport> {
        DeviceSession::new(transport.clone(), account(), Duration::from_secs(300))
    }

    fn device_list() -> Value {
        json!({
            "code": "000",
            "msg": "success",
            "data": {"list": [
                {"id": 12345, "deviceName": "Tent", "deviceLightRate": 30, "isClose": false, "groupId": null, "deviceImg": "lamp.png"},
                {"id": 999, "deviceName": "Spare"}
            ]}
        })
    }

    fn expired() -> Value {
        json!({"code": "102", "msg": "token expired", "data": null})
    }

    #[tokio::test]
    async fn fresh_token_skips_login() {
        let transport = ScriptedTransport::default();
        transport.respond(login_ok("t-1"));
        let mut session = session(&transport);
        assert_eq!(session.state(), SessionState::Unauthenticated);

        session.ensure_session().await.unwrap();
        session.ensure_session().await.unwrap();

        assert_eq!(transport.paths(), vec![LOGIN_PATH]);
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(
            transport.requests()[0].body,
            json!({"email": "grower@example.com", "password": "hunter2", "loginMethod": "1"})
        );
    }

    #[tokio::test]
    async fn stale_token_triggers_login() {
        let transport = ScriptedTransport::default();
        transport.respond(login_ok("t-1")).respond(login_ok("t-2"));
        let mut session = session(&transport);

        session.ensure_session().await.unwrap();
        session.token_issued_at = Instant::now().checked_sub(Duration::from_secs(301));
        session.ensure_session().await.unwrap();

        assert_eq!(transport.paths(), vec![LOGIN_PATH, LOGIN_PATH]);
        assert_eq!(session.token, "t-2");
    }

    #[tokio::test]
    async fn login_without_token_keeps_previous_token() {
        let transport = ScriptedTransport::default();
        transport
            .respond(json!({"code": "000", "data": {}}))
            .respond(json!({"code": "103", "msg": "wrong password", "data": null}))
            .respond(json!({"data": "not an object"}));
        let mut session = session(&transport);
        session.token = "previous".to_string();

        for _ in 0..3 {
            let err = session.login().await.unwrap_err();
            assert!(matches!(err, CloudError::AuthenticationFailed(_)), "{err}");
            assert_eq!(session.token, "previous");
        }
    }

    #[tokio::test]
    async fn discovery_adopts_first_lamp() {
        let transport = ScriptedTransport::default();
        transport.respond(login_ok("t-1")).respond(device_list());
        let mut session = session(&transport);

        session.ensure_device().await.unwrap();
        session.ensure_device().await.unwrap();

        assert_eq!(transport.paths(), vec![LOGIN_PATH, DEVICE_LIST_PATH]);
        assert_eq!(session.device_id, "12345");
        assert_eq!(session.group_id, None);
        assert_eq!(session.state(), SessionState::AuthenticatedWithDevice);
        assert_eq!(
            session.lamp().and_then(|lamp| lamp.device_name.as_deref()),
            Some("Tent")
        );
        assert_eq!(
            transport.requests()[1].body,
            json!({"currentPage": 0, "type": null, "productType": "LIGHT"})
        );
    }

    #[tokio::test]
    async fn empty_device_list_is_device_not_found() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(json!({"code": "000", "data": {"list": []}}))
            .respond(json!({"code": "000", "data": {"list": [{"deviceName": "no id"}]}}));
        let mut session = session(&transport);

        let err = session.ensure_device().await.unwrap_err();
        assert!(matches!(err, CloudError::DeviceNotFound(_)), "{err}");
        assert!(session.device_id.is_empty());

        let err = session.ensure_device().await.unwrap_err();
        assert!(matches!(err, CloudError::DeviceNotFound(_)), "{err}");
        assert!(session.device_id.is_empty());
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn discovery_tolerates_mistyped_cosmetic_fields() {
        let transport = ScriptedTransport::default();
        transport.respond(login_ok("t-1")).respond(json!({
            "code": "000",
            "data": {"list": [{"id": 1, "isClose": 0, "deviceImg": 5, "deviceName": null}]}
        }));
        let mut session = session(&transport);

        let lamp = session.discover().await.unwrap();

        assert_eq!(lamp.id, "1");
        assert_eq!(lamp.is_close, None);
        assert_eq!(lamp.image, None);
        assert_eq!(session.state(), SessionState::AuthenticatedWithDevice);
    }

    #[tokio::test]
    async fn non_object_first_entry_is_device_not_found() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(json!({"code": "000", "data": {"list": [null, {"id": 2}]}}));
        let mut session = session(&transport);

        let err = session.ensure_device().await.unwrap_err();

        assert!(
            matches!(err, CloudError::DeviceNotFound(ref message) if message == "invalid device data"),
            "{err}"
        );
        assert!(session.device_id.is_empty());
    }

    #[test]
    fn system_data_header_carries_session_identity() {
        let mut session = session(&ScriptedTransport::default());
        session.token = "t-9".to_string();
        session.device_id = "lamp-3".to_string();

        let header: Value = serde_json::from_str(&session.system_data().unwrap()).unwrap();

        assert_eq!(header["token"], "t-9");
        assert_eq!(header["deviceId"], "lamp-3");
        assert_eq!(header["language"], "English");
        assert_eq!(header["osType"], "android");
    }

    #[tokio::test]
    async fn apply_brightness_targets_discovered_lamp() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(json!({"code": "000", "data": {"list": [{"deviceId": "lamp-7", "groupId": "g-1"}]}}))
            .respond(success());
        let mut session = session(&transport);

        session.apply_brightness(40).await.unwrap();

        let requests = transport.requests();
        assert_eq!(
            transport.paths(),
            vec![LOGIN_PATH, DEVICE_LIST_PATH, ADJUST_LIGHT_PATH]
        );
        assert_eq!(
            requests[2].body,
            json!({"light": 40, "deviceId": "lamp-7", "groupId": "g-1"})
        );
        assert_eq!(requests[2].system_data["token"], "t-1");
        assert_eq!(requests[2].system_data["deviceId"], "lamp-7");
        assert_eq!(requests[2].system_data["wifiName"], "shed");
        assert_eq!(requests[2].system_data["timezone"], "Europe/Berlin");
        assert_eq!(session.lamp().and_then(|lamp| lamp.light_rate), Some(40));
    }

    #[tokio::test]
    async fn expired_token_is_retried_once() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .respond(expired())
            .respond(login_ok("t-2"))
            .respond(success());
        let mut session = session(&transport);

        session.apply_brightness(70).await.unwrap();

        let requests = transport.requests();
        assert_eq!(
            transport.paths(),
            vec![
                LOGIN_PATH,
                DEVICE_LIST_PATH,
                ADJUST_LIGHT_PATH,
                LOGIN_PATH,
                ADJUST_LIGHT_PATH
            ]
        );
        assert_eq!(requests[4].system_data["token"], "t-2");
    }

    #[tokio::test]
    async fn second_expiry_gives_up() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .respond(expired())
            .respond(login_ok("t-2"))
            .respond(expired())
            .respond(success());
        let mut session = session(&transport);

        let err = session.apply_brightness(70).await.unwrap_err();

        assert!(
            matches!(
                err,
                CloudError::CommandRejected { ref code, endpoint: ADJUST_LIGHT_PATH, .. } if code == CODE_TOKEN_EXPIRED
            ),
            "{err}"
        );
        assert_eq!(transport.requests().len(), 5);
    }

    #[tokio::test]
    async fn other_codes_are_rejected_without_retry() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .respond(json!({"code": "301", "msg": "device offline"}));
        let mut session = session(&transport);

        let err = session.apply_brightness(50).await.unwrap_err();

        assert!(
            matches!(err, CloudError::CommandRejected { ref message, .. } if message == "device offline"),
            "{err}"
        );
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn transport_failures_are_not_retried() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .fail(CloudError::Transport("connection reset".to_string()))
            .respond(success());
        let mut session = session(&transport);

        let err = session.apply_brightness(50).await.unwrap_err();
        assert!(matches!(err, CloudError::Transport(_)), "{err}");
        assert_eq!(transport.requests().len(), 3);

        session.apply_brightness(50).await.unwrap();
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn malformed_command_response_is_transport_error() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .respond(json!("gateway timeout"));
        let mut session = session(&transport);

        let err = session.apply_brightness(50).await.unwrap_err();
        assert!(matches!(err, CloudError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn switch_sends_inverted_close_flag() {
        let transport = ScriptedTransport::default();
        transport
            .respond(login_ok("t-1"))
            .respond(device_list())
            .respond(expired())
            .respond(login_ok("t-2"))
            .respond(success());
        let mut session = session(&transport);

        session.toggle_switch(false).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[4].path, LAMP_SWITCH_PATH);
        assert_eq!(
            requests[4].body,
            json!({"isClose": true, "deviceId": "12345", "groupId": null})
        );
        assert_eq!(session.lamp().and_then(|lamp| lamp.is_close), Some(true));
    }
}
