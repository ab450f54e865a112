//! Bridge to the external threshold-ECDSA backend.
//!
//! Every session opens its own connection to the backend's Unix socket and
//! speaks line-delimited JSON-RPC 2.0 over it:
//!
//! ```text
//! → {"jsonrpc":"2.0","id":1,"method":"start","params":{"params":StartParams,"share":hex?}}
//! ← {"jsonrpc":"2.0","id":1,"result":{"messages":[OutMsg..],"round":1,"output":null}}
//! → {"jsonrpc":"2.0","id":2,"method":"update","params":{"message":InMsg}}
//! ```
//!
//! The calls are blocking; the session driver only makes them on the
//! blocking pool.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tss_session::{
    InMsg, OutMsg, ProtocolError, ProtocolFactory, ProtocolOutput, ProtocolTask, StartParams,
    ThresholdProtocol,
};
use tss_types::SessionId;
use zeroize::Zeroizing;

/// Upper bound for one backend call; keygen rounds can be slow.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i32,
    message: String,
    /// Set when a peer's message was refused rather than the call failing.
    #[serde(default)]
    invalid_from: Option<tss_types::CoreAddress>,
}

#[derive(Debug, Deserialize)]
struct StepReply {
    #[serde(default)]
    messages: Vec<OutMsg>,
    round: u16,
    #[serde(default)]
    output: Option<ProtocolOutput>,
}

/// One JSON-RPC connection.
struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl Connection {
    fn open(socket: &Path) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(socket)
            .map_err(|e| ProtocolError::Backend(format!("{}: {e}", socket.display())))?;
        stream
            .set_read_timeout(Some(CALL_TIMEOUT))
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        let writer = stream
            .try_clone()
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 1,
        })
    }

    fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_string(&Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;

        let mut reply = String::new();
        let read = self
            .reader
            .read_line(&mut reply)
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        if read == 0 {
            return Err(ProtocolError::Backend("backend closed the connection".to_string()));
        }
        let response: Response =
            serde_json::from_str(&reply).map_err(|e| ProtocolError::Backend(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(match error.invalid_from {
                Some(from) => ProtocolError::InvalidMessage {
                    from,
                    reason: error.message,
                },
                None => ProtocolError::Crypto(format!("{} ({})", error.message, error.code)),
            });
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| ProtocolError::Backend(e.to_string()))
    }
}

/// A threshold protocol instance living in the backend process.
pub struct RemoteProtocol {
    connection: Connection,
    share: Option<Zeroizing<String>>,
    round: u16,
    output: Option<ProtocolOutput>,
}

impl RemoteProtocol {
    fn step(&mut self, reply: StepReply) -> Vec<OutMsg> {
        self.round = reply.round;
        if reply.output.is_some() {
            self.output = reply.output;
        }
        reply.messages
    }
}

impl ThresholdProtocol for RemoteProtocol {
    fn start(&mut self, params: &StartParams) -> Result<Vec<OutMsg>, ProtocolError> {
        let share = self.share.as_ref().map(|s| s.as_str());
        let reply: StepReply = self.connection.call(
            "start",
            serde_json::json!({ "params": params, "share": share }),
        )?;
        Ok(self.step(reply))
    }

    fn update(&mut self, msg: InMsg) -> Result<Vec<OutMsg>, ProtocolError> {
        let reply: StepReply = self
            .connection
            .call("update", serde_json::json!({ "message": msg }))?;
        Ok(self.step(reply))
    }

    fn round(&self) -> u16 {
        self.round
    }

    fn done(&mut self) -> Option<ProtocolOutput> {
        self.output.take()
    }
}

/// Opens a [`RemoteProtocol`] per session.
pub struct RemoteFactory {
    socket: PathBuf,
    /// Hex key share; absent before keygen.
    share: Option<Zeroizing<String>>,
}

impl RemoteFactory {
    pub fn new(socket: PathBuf, share: Option<&[u8]>) -> Self {
        Self {
            socket,
            share: share.map(|s| Zeroizing::new(hex::encode(s))),
        }
    }

    /// Ask the backend for fresh keygen preparameters.
    pub fn generate_preparams(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut connection = Connection::open(&self.socket)?;
        let encoded: String = connection.call("generate_preparams", serde_json::json!({}))?;
        hex::decode(encoded).map_err(|e| ProtocolError::Backend(format!("preparams: {e}")))
    }
}

impl ProtocolFactory for RemoteFactory {
    fn create(
        &self,
        session_id: &SessionId,
        task: &ProtocolTask,
    ) -> Result<Box<dyn ThresholdProtocol>, ProtocolError> {
        let share = match task {
            ProtocolTask::Keygen { .. } => None,
            ProtocolTask::Sign { .. } | ProtocolTask::Reshare { .. } => {
                Some(self.share.clone().ok_or_else(|| {
                    ProtocolError::Backend("no key share available".to_string())
                })?)
            }
        };
        tracing::debug!(session_id = %session_id, socket = %self.socket.display(), "opening backend session");
        Ok(Box::new(RemoteProtocol {
            connection: Connection::open(&self.socket)?,
            share,
            round: 1,
            output: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tss_session::Routing;
    use tss_types::CoreAddress;

    /// Answers `start` with one broadcast, `update` with the finished share.
    fn serve_once(listener: UnixListener) {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut writer = stream;
        let mut line = String::new();
        while reader.read_line(&mut line).expect("read") > 0 {
            let request: Value = serde_json::from_str(&line).expect("request");
            let id = request["id"].clone();
            let reply = match request["method"].as_str() {
                Some("start") => serde_json::json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {
                        "messages": [{"routing": "Broadcast", "round": 1, "index": 0, "payload": [7]}],
                        "round": 1,
                    }
                }),
                Some("update") if request["params"]["message"]["payload"] == serde_json::json!([0]) => {
                    serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32000, "message": "bad round", "invalid_from": "bridge1b"}
                    })
                }
                _ => serde_json::json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"round": 2, "output": {"Share": [9, 9]}}
                }),
            };
            writeln!(writer, "{reply}").expect("write");
            line.clear();
        }
    }

    #[test]
    fn test_remote_protocol_roundtrip() {
        let dir = std::env::temp_dir().join(format!("tss-backend-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let socket = dir.join("backend.sock");
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = std::thread::spawn(move || serve_once(listener));

        let factory = RemoteFactory::new(socket.clone(), None);
        let id: SessionId = "KEYGEN/1".parse().expect("id");
        let mut protocol = factory
            .create(&id, &ProtocolTask::Keygen { preparams: None })
            .expect("create");

        let params = StartParams {
            session_id: id.to_string(),
            parties: vec!["bridge1a".into(), "bridge1b".into()],
            local_index: 0,
            threshold: 1,
            task: ProtocolTask::Keygen { preparams: None },
        };
        let out = protocol.start(&params).expect("start");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].routing, Routing::Broadcast);
        assert!(protocol.done().is_none());

        let bad = InMsg {
            from: CoreAddress::from("bridge1b"),
            round: 1,
            index: 0,
            broadcast: true,
            payload: vec![0],
        };
        assert!(matches!(
            protocol.update(bad),
            Err(ProtocolError::InvalidMessage { .. })
        ));

        let good = InMsg {
            from: CoreAddress::from("bridge1b"),
            round: 1,
            index: 0,
            broadcast: true,
            payload: vec![7],
        };
        protocol.update(good).expect("update");
        assert_eq!(protocol.round(), 2);
        assert_eq!(protocol.done(), Some(ProtocolOutput::Share(vec![9, 9])));

        drop(protocol);
        server.join().expect("server");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_signing_requires_share() {
        let factory = RemoteFactory::new(PathBuf::from("/nonexistent.sock"), None);
        let id: SessionId = "SIGN:evm/1".parse().expect("id");
        let result = factory.create(
            &id,
            &ProtocolTask::Sign {
                message_hashes: vec![[0u8; 32]],
            },
        );
        assert!(matches!(result, Err(ProtocolError::Backend(_))));
    }
}
