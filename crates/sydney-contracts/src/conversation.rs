use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResult {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub value: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub message: String,
}

impl ProvisionResult {
    pub fn is_success(&self) -> bool {
        self.value == "Success"
    }
}

/// Handle returned by the conversation-create endpoint. Immutable once built;
/// one per turn group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub conversation_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub client_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub conversation_signature: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sec_access_token: String,
    #[serde(default)]
    pub result: ProvisionResult,
}

impl Conversation {
    /// Prefer the encrypted signature header over the body field when present.
    pub fn with_access_token(mut self, token: Option<&str>) -> Self {
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            self.sec_access_token = token.to_string();
        }
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
