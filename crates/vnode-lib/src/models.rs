//! Core data models exchanged with the remote module runtime

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Environment variable on a container that carries the biz version
pub const BIZ_VERSION_ENV: &str = "BIZ_VERSION";

/// Descriptor of a deployable biz module.
///
/// Identity is `(name, version)`; `url` only says where the artifact lives, so
/// two descriptors that differ only in `url` compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BizModel {
    #[serde(rename = "bizName", alias = "name")]
    pub name: String,
    #[serde(rename = "bizVersion", alias = "version", default)]
    pub version: String,
    #[serde(rename = "bizUrl", alias = "url", default)]
    pub url: String,
}

impl BizModel {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            url: url.into(),
        }
    }
}

impl PartialEq for BizModel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for BizModel {}

impl Hash for BizModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

/// Lifecycle state reported by the remote runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BizState {
    /// Artifact fetched and parsed, not started
    Resolved,
    /// Running
    Activated,
    /// Stopped or unloaded
    Deactivated,
    /// Anything outside the known set, kept verbatim
    Other(String),
}

impl BizState {
    /// Parse a wire value; matching is case-insensitive
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RESOLVED" => BizState::Resolved,
            "ACTIVATED" => BizState::Activated,
            "DEACTIVATED" => BizState::Deactivated,
            _ => BizState::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BizState::Resolved => "RESOLVED",
            BizState::Activated => "ACTIVATED",
            BizState::Deactivated => "DEACTIVATED",
            BizState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for BizState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for BizState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BizState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(BizState::parse(&raw))
    }
}

/// Runtime information the remote side reports for an installed module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkBizInfo {
    #[serde(rename = "bizName", alias = "name")]
    pub name: String,
    #[serde(rename = "bizVersion", alias = "version", default)]
    pub version: String,
    #[serde(rename = "bizState", alias = "state")]
    pub state: BizState,
    #[serde(rename = "mainClass", default)]
    pub main_class: String,
    #[serde(rename = "webContextPath", default)]
    pub web_context_path: String,
}

impl ArkBizInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, state: BizState) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            state,
            main_class: String::new(),
            web_context_path: String::new(),
        }
    }
}

/// Body of a biz state message: one record or a batch
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BizInfoPayload {
    One(ArkBizInfo),
    Many(Vec<ArkBizInfo>),
}

impl BizInfoPayload {
    /// Decode a raw payload
    pub fn decode(payload: &[u8]) -> serde_json::Result<Vec<ArkBizInfo>> {
        let decoded: BizInfoPayload = serde_json::from_slice(payload)?;
        Ok(match decoded {
            BizInfoPayload::One(info) => vec![info],
            BizInfoPayload::Many(infos) => infos,
        })
    }
}

/// Liveness probe published by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    pub node_id: String,
    pub timestamp: i64,
}

/// Inputs for building the virtual node object
#[derive(Debug, Clone, Default)]
pub struct BuildVirtualNodeConfig {
    /// Identity used in topic names and the node name
    pub node_id: String,
    /// Address reported as the node's InternalIP
    pub node_ip: String,
    /// Module runtime (base) name
    pub biz_name: String,
    /// Tech stack tag, e.g. "java"
    pub tech_stack: String,
    /// Base version
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biz_state_parse_is_case_insensitive() {
        assert_eq!(BizState::parse("activated"), BizState::Activated);
        assert_eq!(BizState::parse("Resolved"), BizState::Resolved);
        assert_eq!(BizState::parse("DEACTIVATED"), BizState::Deactivated);
        assert_eq!(
            BizState::parse("BROKEN"),
            BizState::Other("BROKEN".to_string())
        );
    }

    #[test]
    fn test_biz_model_equality_ignores_url() {
        let a = BizModel::new("biz", "1.0.0", "file:///a.jar");
        let b = BizModel::new("biz", "1.0.0", "http://repo/b.jar");
        let c = BizModel::new("biz", "1.0.1", "file:///a.jar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_decode_single_biz_info() {
        let payload = br#"{"bizName":"test-biz","bizVersion":"1.1.1","bizState":"ACTIVATED","mainClass":"Main","webContextPath":"/test"}"#;
        let infos = BizInfoPayload::decode(payload).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "test-biz");
        assert_eq!(infos[0].state, BizState::Activated);
        assert_eq!(infos[0].web_context_path, "/test");
    }

    #[test]
    fn test_decode_batch_and_aliases() {
        let payload = br#"[{"name":"a","version":"1","state":"resolved"},{"bizName":"b","bizState":"UPGRADING"}]"#;
        let infos = BizInfoPayload::decode(payload).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].state, BizState::Resolved);
        assert_eq!(infos[1].version, "");
        assert_eq!(infos[1].state, BizState::Other("UPGRADING".to_string()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BizInfoPayload::decode(b"not json").is_err());
        assert!(BizInfoPayload::decode(br#"{"bizVersion":"1"}"#).is_err());
    }

    #[test]
    fn test_install_command_wire_names() {
        let model = BizModel::new("biz", "2.0.0", "file:///biz.jar");
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["bizName"], "biz");
        assert_eq!(json["bizVersion"], "2.0.0");
        assert_eq!(json["bizUrl"], "file:///biz.jar");
    }
}
