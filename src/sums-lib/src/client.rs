use crate::wire::{read_json, write_json};
use crate::{ClientInfo, HexId, SumsError, SumsResult};
use log::debug;
use serde_json::{json, Value};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Minimal protocol client: one connection, one session, raw JSON in and out.
pub struct SumsClient {
    stream: TcpStream,
    session_id: Option<u64>,
}

impl SumsClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A, user: &str) -> SumsResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SumsError::BrokenConnection(format!("connect failed: {}", e)))?;
        let mut client = Self {
            stream,
            session_id: None,
        };
        let info = ClientInfo {
            pid: std::process::id() as i64,
            user: user.to_string(),
        };
        let info = serde_json::to_value(&info).map_err(|e| SumsError::Internal(e.to_string()))?;
        write_json(&mut client.stream, &info).await?;
        Ok(client)
    }

    /// Sends one request and waits for its response. The status field is
    /// not interpreted.
    pub async fn call(&mut self, request: &Value) -> SumsResult<Value> {
        debug!("SumsClient: send {}", request);
        write_json(&mut self.stream, request).await?;
        let response = read_json(&mut self.stream).await?;
        debug!("SumsClient: recv {}", response);
        Ok(response)
    }

    pub async fn open(&mut self) -> SumsResult<u64> {
        let response = self.call(&json!({ "reqtype": "open" })).await?;
        if response["status"] != "ok" {
            return Err(SumsError::Internal(format!("open failed: {}", response)));
        }
        let sessionid: HexId = serde_json::from_value(response["sessionid"].clone())
            .map_err(|e| SumsError::BadJson(e.to_string()))?;
        self.session_id = Some(sessionid.value());
        Ok(sessionid.value())
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Hex form of the open session id, ready to drop into a request.
    pub fn session_hex(&self) -> String {
        self.session_id
            .map(|id| HexId(id).to_string())
            .unwrap_or_default()
    }

    pub async fn close(&mut self) -> SumsResult<Value> {
        let request = json!({ "reqtype": "close", "sessionid": self.session_hex() });
        let response = self.call(&request).await?;
        self.session_id = None;
        Ok(response)
    }
}
