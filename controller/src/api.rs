//! Wire schemas for the lamp vendor's cloud API.

use chrono::{DateTime, Utc};
use growlight_common::LampInfo;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const LOGIN_PATH: &str = "/ulogin/mailLogin/v1";
pub const DEVICE_LIST_PATH: &str = "/udm/getDeviceList/v1";
pub const ADJUST_LIGHT_PATH: &str = "/udm/adjustLight/v1";
pub const LAMP_SWITCH_PATH: &str = "/udm/lampSwitch/v1";

pub const CODE_SUCCESS: &str = "000";
pub const CODE_TOKEN_EXPIRED: &str = "102";

const APP_VERSION: &str = "1.2.0";
const OS_TYPE: &str = "android";
const OS_VERSION: &str = "14";
const DEVICE_TYPE: &str = "SM-S928C";
const NET_TYPE: &str = "wifi";

/// Client metadata sent as the `systemData` header on every request.
#[derive(Debug, Serialize)]
pub struct SystemData<'a> {
    #[serde(rename = "reqId")]
    pub req_id: i64,
    #[serde(rename = "appVersion")]
    pub app_version: &'static str,
    #[serde(rename = "osType")]
    pub os_type: &'static str,
    #[serde(rename = "osVersion")]
    pub os_version: &'static str,
    #[serde(rename = "deviceType")]
    pub device_type: &'static str,
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    #[serde(rename = "netType")]
    pub net_type: &'static str,
    #[serde(rename = "wifiName")]
    pub wifi_name: &'a str,
    pub timestamp: i64,
    pub token: &'a str,
    pub timezone: &'a str,
    pub language: &'a str,
}

impl<'a> SystemData<'a> {
    pub fn new(
        now: DateTime<Utc>,
        device_id: &'a str,
        wifi_name: &'a str,
        token: &'a str,
        timezone: &'a str,
        language: &'a str,
    ) -> Self {
        Self {
            req_id: now.timestamp_millis(),
            app_version: APP_VERSION,
            os_type: OS_TYPE,
            os_version: OS_VERSION,
            device_type: DEVICE_TYPE,
            device_id,
            net_type: NET_TYPE,
            wifi_name,
            timestamp: now.timestamp(),
            token,
            timezone,
            language,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    #[serde(rename = "loginMethod")]
    pub login_method: &'static str,
}

impl<'a> LoginRequest<'a> {
    pub fn email(email: &'a str, password: &'a str) -> Self {
        Self {
            email,
            password,
            login_method: "1",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceListRequest {
    #[serde(rename = "currentPage")]
    pub current_page: u32,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "productType")]
    pub product_type: &'static str,
}

impl DeviceListRequest {
    pub fn lights() -> Self {
        Self {
            current_page: 0,
            kind: None,
            product_type: "LIGHT",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdjustLightRequest<'a> {
    pub light: u8,
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    #[serde(rename = "groupId")]
    pub group_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct LampSwitchRequest<'a> {
    #[serde(rename = "isClose")]
    pub is_close: bool,
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    #[serde(rename = "groupId")]
    pub group_id: Option<&'a str>,
}

/// Identifiers and codes arrive as either JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl Scalar {
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text).filter(|text| !text.is_empty()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Float(value) if value.is_finite() => Some(format!("{value:.0}")),
            Self::Float(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Text(text) => text.trim().parse().ok(),
            Self::Integer(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.round() as i64),
            Self::Float(_) => None,
        }
    }

    pub fn is_code(&self, code: &str) -> bool {
        match self {
            Self::Text(text) => text == code,
            _ => match (self.as_i64(), code.parse::<i64>()) {
                (Some(value), Ok(expected)) => value == expected,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub code: Option<Scalar>,
    pub msg: Option<String>,
    pub data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub token: Option<String>,
}

impl LoginResponse {
    pub fn into_token(self) -> Result<String, String> {
        match self.data.and_then(|data| data.token) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(match (self.code.and_then(Scalar::into_text), self.msg) {
                (Some(code), Some(msg)) => format!("token not found in response ({code}: {msg})"),
                (_, Some(msg)) => format!("token not found in response: {msg}"),
                _ => "token not found in response".to_string(),
            }),
        }
    }
}

/// Common `{ code, msg, data }` envelope of the device endpoints.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: Option<Scalar>,
    pub msg: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, PartialEq)]
pub enum ApiOutcome<T> {
    Success(Option<T>),
    TokenExpired,
    Rejected { code: String, message: String },
}

impl<T> ApiEnvelope<T> {
    pub fn into_outcome(self) -> ApiOutcome<T> {
        match self.code {
            Some(code) if code.is_code(CODE_SUCCESS) => ApiOutcome::Success(self.data),
            Some(code) if code.is_code(CODE_TOKEN_EXPIRED) => ApiOutcome::TokenExpired,
            code => ApiOutcome::Rejected {
                code: code
                    .and_then(Scalar::into_text)
                    .unwrap_or_else(|| "<missing>".to_string()),
                message: self.msg.unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceListData {
    /// Raw entries; each one is checked on its own by [`DeviceEntry::from_json`].
    #[serde(default)]
    pub list: Vec<Value>,
}

/// One device-list entry. Fields with an unexpected JSON type read as absent.
#[derive(Debug, Default, Deserialize)]
pub struct DeviceEntry {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<Scalar>,
    #[serde(rename = "deviceId", default, deserialize_with = "lenient")]
    pub device_id: Option<Scalar>,
    #[serde(rename = "deviceName", default, deserialize_with = "lenient")]
    pub device_name: Option<String>,
    #[serde(rename = "deviceLightRate", default, deserialize_with = "lenient")]
    pub device_light_rate: Option<Scalar>,
    #[serde(rename = "isClose", default, deserialize_with = "lenient")]
    pub is_close: Option<bool>,
    #[serde(rename = "groupId", default, deserialize_with = "lenient")]
    pub group_id: Option<Scalar>,
    #[serde(rename = "deviceImg", default, deserialize_with = "lenient")]
    pub device_img: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

impl DeviceEntry {
    /// `None` unless `value` is a JSON object.
    pub fn from_json(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// `None` when neither `id` nor `deviceId` carries a usable identifier.
    pub fn into_lamp_info(self) -> Option<LampInfo> {
        let id = self
            .id
            .and_then(Scalar::into_text)
            .or_else(|| self.device_id.and_then(Scalar::into_text))?;

        Some(LampInfo {
            id,
            group_id: self.group_id.and_then(Scalar::into_text),
            device_name: self.device_name,
            light_rate: self.device_light_rate.as_ref().and_then(Scalar::as_i64),
            is_close: self.is_close,
            image: self.device_img,
        })
    }
}
