//! Request and response payloads of the job backend's REST surface.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::system::SystemDetails;

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    /// Some backends send the id as a number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub miner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMinerRequest {
    pub ethereum_address: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrainingRequest {
    pub system_details: SystemDetails,
    pub miner_id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_response_accepts_numeric_miner_id() {
        let resp: LoginResponse =
            serde_json::from_value(json!({"token": "t", "minerId": 17}))
                .unwrap();
        assert_eq!(resp.miner_id.as_deref(), Some("17"));
    }

    #[test]
    fn login_response_tolerates_missing_miner_id() {
        let resp: LoginResponse =
            serde_json::from_value(json!({"token": "t"})).unwrap();
        assert!(resp.miner_id.is_none());
    }

    #[test]
    fn start_training_request_is_camel_case() {
        let body = StartTrainingRequest {
            system_details: SystemDetails::default(),
            miner_id: "m1".into(),
        };
        let value = serde_json::to_value(body).unwrap();
        assert!(value.get("systemDetails").is_some());
        assert_eq!(value["minerId"], json!("m1"));
    }
}
