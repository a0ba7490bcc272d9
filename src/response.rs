//! Platform-facing response shape for `POST /verify`.

use serde::{Deserialize, Serialize};

use crate::error::SiwaErrorCode;
use crate::message::{AgentId, AgentRegistry};
use crate::receipt::IssuedReceipt;
use crate::verify::{SignerType, VerificationKind, VerificationResult};

const NOT_REGISTERED_MESSAGE: &str =
    "This address is not registered as an agent in the identity registry. Register the agent, then retry sign-in.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiwaStatus {
    Authenticated,
    NotRegistered,
    Rejected,
}

impl SiwaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::NotRegistered => "not_registered",
            Self::Rejected => "rejected",
        }
    }
}

/// What an unregistered agent should do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SiwaAction {
    #[serde(rename_all = "camelCase")]
    Register {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry_address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain_id: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiwaResponse {
    pub status: SiwaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<VerificationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_type: Option<SignerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SiwaErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SiwaAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_expires_at: Option<i64>,
}

impl SiwaResponse {
    pub fn from_result(result: &VerificationResult) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let parsed = !result.agent_registry.is_empty();
        let mut response = Self {
            status: SiwaStatus::Rejected,
            address: non_empty(&result.address),
            agent_id: parsed.then_some(result.agent_id),
            agent_registry: non_empty(&result.agent_registry),
            chain_id: parsed.then_some(result.chain_id),
            verified: Some(result.verified),
            signer_type: result.signer_type,
            code: result.code,
            error: result.error.clone(),
            action: None,
            receipt: None,
            receipt_expires_at: None,
        };

        if result.valid {
            response.status = SiwaStatus::Authenticated;
            return response;
        }

        if result.code == Some(SiwaErrorCode::NotRegistered) {
            let registry = AgentRegistry::parse(&result.agent_registry).ok();
            response.status = SiwaStatus::NotRegistered;
            response.action = Some(SiwaAction::Register {
                message: NOT_REGISTERED_MESSAGE.to_string(),
                registry_address: registry.as_ref().map(|r| r.address.clone()),
                chain_id: registry.map(|r| r.chain_id).or(response.chain_id),
            });
        }
        response
    }

    pub fn with_receipt(mut self, issued: IssuedReceipt) -> Self {
        self.receipt = Some(issued.receipt);
        self.receipt_expires_at = Some(issued.expires_at.timestamp_millis());
        self
    }

    /// Status code for the transport layer.
    pub fn http_status(&self) -> u16 {
        match (self.status, self.code) {
            (SiwaStatus::Authenticated, _) => 200,
            (_, Some(code)) => code.http_status(),
            (_, None) => 401,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;

    const REGISTRY: &str = "eip155:8453:0x8004A169FB4a3325136EB29fA0ceB6D2e539a432";

    fn result(valid: bool, code: Option<SiwaErrorCode>) -> VerificationResult {
        VerificationResult {
            valid,
            address: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            agent_id: AgentId::from(42u64),
            agent_registry: REGISTRY.to_string(),
            chain_id: 8453,
            verified: VerificationKind::Onchain,
            signer_type: valid.then_some(SignerType::Eoa),
            code,
            error: code.map(|c| format!("{c} detail")),
        }
    }

    #[test]
    fn authenticated_response_carries_identity() {
        let response = SiwaResponse::from_result(&result(true, None));
        assert_eq!(response.status, SiwaStatus::Authenticated);
        assert_eq!(response.http_status(), 200);
        assert_eq!(response.agent_id, Some(AgentId::from(42u64)));
        assert!(response.action.is_none());
    }

    #[test]
    fn not_registered_response_includes_register_action() {
        let response =
            SiwaResponse::from_result(&result(false, Some(SiwaErrorCode::NotRegistered)));
        assert_eq!(response.status, SiwaStatus::NotRegistered);
        assert_eq!(response.http_status(), 403);
        assert_eq!(
            response.action,
            Some(SiwaAction::Register {
                message: NOT_REGISTERED_MESSAGE.to_string(),
                registry_address: Some("0x8004A169FB4a3325136EB29fA0ceB6D2e539a432".to_string()),
                chain_id: Some(8453),
            })
        );

        let json = serde_json::to_value(&response).expect("json");
        assert_eq!(json["status"], "not_registered");
        assert_eq!(json["action"]["type"], "register");
        assert_eq!(json["action"]["chainId"], 8453);
        assert_eq!(json["code"], "NOT_REGISTERED");
    }

    #[test]
    fn other_failures_are_rejected() {
        let response = SiwaResponse::from_result(&result(false, Some(SiwaErrorCode::InvalidNonce)));
        assert_eq!(response.status, SiwaStatus::Rejected);
        assert_eq!(response.http_status(), 401);

        let parse = VerificationResult {
            address: String::new(),
            agent_registry: String::new(),
            agent_id: AgentId::default(),
            chain_id: 0,
            ..result(false, Some(SiwaErrorCode::ParseError))
        };
        let response = SiwaResponse::from_result(&parse);
        assert_eq!(response.http_status(), 400);
        assert!(response.address.is_none());
        assert!(response.agent_id.is_none());
    }

    #[test]
    fn receipt_is_attached() {
        let expires_at = Utc::now();
        let response = SiwaResponse::from_result(&result(true, None)).with_receipt(IssuedReceipt {
            receipt: "body.tag".to_string(),
            expires_at,
        });
        assert_eq!(response.receipt.as_deref(), Some("body.tag"));
        assert_eq!(
            response.receipt_expires_at,
            Some(expires_at.timestamp_millis())
        );
    }
}
