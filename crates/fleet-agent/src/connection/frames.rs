// JSON frames exchanged over the coordinator session. Payloads are base64
// encoded protobuf messages from `fleet-proto`.

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum AgentFrame {
    #[serde(rename = "hello")]
    Hello { node: String, agent_version: String },
    #[serde(rename = "req")]
    Req {
        id: String,
        method: String,
        payload_b64: String,
    },
    #[serde(rename = "stream_open")]
    StreamOpen { agent_id: String },
    #[serde(rename = "stream")]
    Stream { payload_b64: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorFrame {
    #[serde(rename = "resp")]
    Resp {
        id: String,
        ok: bool,
        payload_b64: Option<String>,
        status_code: Option<i32>,
        status_message: Option<String>,
    },
    #[serde(rename = "stream")]
    Stream { payload_b64: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone)]
pub(crate) struct RpcResponse {
    pub ok: bool,
    pub payload_b64: Option<String>,
    pub status_code: Option<i32>,
    pub status_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_coordinator_frames_are_tolerated() {
        let f: CoordinatorFrame = serde_json::from_str(r#"{"type":"ping","at":1}"#).unwrap();
        assert_eq!(f, CoordinatorFrame::Unknown);
    }

    #[test]
    fn agent_frames_are_tagged() {
        let f = AgentFrame::StreamOpen {
            agent_id: "a-1".to_string(),
        };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "stream_open");
        assert_eq!(v["agent_id"], "a-1");
    }
}
