use chrono::Utc;
use hydra_capsule::CapabilityManifest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mesh opcodes, SCREAMING_SNAKE on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Ping,
    CapabilityAnnounce,
    CapabilityRequest,
    CapabilityResponse,
    JobSubmit,
}

/// Decrypted packet envelope. `data` is opcode-specific; the typed
/// payload structs below give it shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub src: String,
    pub op: Opcode,
    pub ts: i64,
    pub data: Value,
}

impl Packet {
    pub fn new(src: &str, op: Opcode, data: Value) -> Self {
        Self {
            src: src.to_string(),
            op,
            ts: Utc::now().timestamp(),
            data,
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self).expect("packet serializes") {
            Value::Object(map) => map,
            _ => unreachable!("packets serialize to objects"),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }
}

/// `PING` payload: the sender's hardware tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub hw: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `CAPABILITY_ANNOUNCE` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub capabilities: Vec<CapabilityManifest>,
}

/// `CAPABILITY_REQUEST` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub id: String,
}

/// `CAPABILITY_RESPONSE` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub capability: CapabilityManifest,
}

/// `JOB_SUBMIT` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitPayload {
    pub job: JobRequest,
}

/// A job as it travels the mesh: optional caller-chosen id, executor
/// type, and the opaque spec the executor interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub spec: Value,
}

pub fn payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("payloads serialize")
}

pub fn parse_payload<T: for<'de> Deserialize<'de>>(data: &Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_screaming_snake_on_the_wire() {
        assert_eq!(
            serde_json::to_value(Opcode::CapabilityAnnounce).unwrap(),
            "CAPABILITY_ANNOUNCE"
        );
        assert_eq!(serde_json::to_value(Opcode::Ping).unwrap(), "PING");
        assert_eq!(serde_json::to_value(Opcode::JobSubmit).unwrap(), "JOB_SUBMIT");
    }

    #[test]
    fn packet_map_roundtrip() {
        let packet = Packet::new(
            "node-a",
            Opcode::CapabilityRequest,
            payload(&RequestPayload {
                id: "plugin.x".to_string(),
            }),
        );
        let map = packet.to_map();
        assert_eq!(map["op"], "CAPABILITY_REQUEST");

        let parsed = Packet::from_map(map).unwrap();
        assert_eq!(parsed.src, "node-a");
        assert_eq!(parsed.op, Opcode::CapabilityRequest);
        let request: RequestPayload = parse_payload(&parsed.data).unwrap();
        assert_eq!(request.id, "plugin.x");
    }

    #[test]
    fn unknown_opcode_fails_parse() {
        let mut map = Map::new();
        map.insert("src".to_string(), Value::String("n".to_string()));
        map.insert("op".to_string(), Value::String("SELF_DESTRUCT".to_string()));
        map.insert("ts".to_string(), Value::from(0));
        map.insert("data".to_string(), Value::Null);
        assert!(Packet::from_map(map).is_err());
    }

    #[test]
    fn job_request_accepts_wire_shape() {
        let request: JobRequest =
            serde_json::from_value(serde_json::json!({"type": "python", "spec": {"code": "1"}}))
                .unwrap();
        assert_eq!(request.job_type, "python");
        assert!(request.id.is_none());
    }
}
