//! cgminer/bmminer JSON API.
//!
//! The API is one request per TCP connection: the client writes a JSON object
//! such as `{"command":"summary"}`, the miner writes the reply and closes the
//! socket. Replies are usually NUL-terminated, and bmminer's `stats` reply is
//! not quite JSON: consecutive objects in the `STATS` array lack a separating
//! comma. Both are repaired before parsing.

use std::io;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{DeviceError, Telemetry};
use crate::tracing::prelude::*;
use crate::types::HashRate;

pub const DEFAULT_PORT: u16 = 4028;

/// Applies to the whole exchange: connect, write, and read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one miner's cgminer API.
#[derive(Debug, Clone)]
pub struct CgminerApi {
    addr: String,
    timeout: Duration,
}

impl CgminerApi {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run one API command and return the parsed, status-checked reply.
    pub async fn command(&self, command: &str) -> Result<Value, DeviceError> {
        let raw = self.exchange(command).await?;
        parse_reply(command, &raw)
    }

    /// Sample summary and stats and combine them into telemetry.
    pub async fn telemetry(&self) -> Result<Telemetry, DeviceError> {
        let summary = self.command("summary").await?;
        let stats = self.command("stats").await?;
        telemetry_from(&summary, &stats)
    }

    /// Ask the mining process to restart and pick up its configuration.
    ///
    /// The miner often drops or resets the connection while restarting, with
    /// or without a reply. Only failing to deliver the command counts as
    /// failure.
    pub async fn restart(&self) -> Result<(), DeviceError> {
        let raw = match self.exchange("restart").await {
            Ok(raw) => raw,
            Err(DeviceError::Io(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
                ) =>
            {
                debug!(addr = %self.addr, error = %e, "Connection dropped during restart");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = parse_reply("restart", &raw) {
            debug!(addr = %self.addr, error = %e, "Ignoring restart reply");
        }
        Ok(())
    }

    async fn exchange(&self, command: &str) -> Result<Vec<u8>, DeviceError> {
        let exchange = async {
            let mut stream =
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|source| DeviceError::Connect {
                        addr: self.addr.clone(),
                        source,
                    })?;

            let request = serde_json::json!({ "command": command }).to_string();
            stream.write_all(request.as_bytes()).await?;

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            trace!(addr = %self.addr, command, bytes = reply.len(), "API reply");
            Ok::<_, DeviceError>(reply)
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| DeviceError::Timeout(self.timeout))?
    }
}

/// Parse a raw API reply and check its status block.
pub fn parse_reply(command: &str, raw: &[u8]) -> Result<Value, DeviceError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| DeviceError::Malformed(format!("{command}: {e}")))?
        .trim_end_matches('\0')
        .trim();
    if text.is_empty() {
        return Err(DeviceError::Malformed(format!("{command}: empty reply")));
    }

    let repaired = text.replace("}{", "},{");
    let reply: Value = serde_json::from_str(&repaired)
        .map_err(|e| DeviceError::Malformed(format!("{command}: {e}")))?;

    let status = reply
        .get("STATUS")
        .and_then(|status| status.get(0))
        .ok_or_else(|| DeviceError::Malformed(format!("{command}: missing STATUS")))?;

    match status.get("STATUS").and_then(Value::as_str) {
        Some("S") | Some("I") | Some("W") => Ok(reply),
        _ => Err(DeviceError::Refused {
            command: command.to_string(),
            message: status
                .get("Msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
    }
}

/// Build telemetry from `summary` and `stats` replies.
pub fn telemetry_from(summary: &Value, stats: &Value) -> Result<Telemetry, DeviceError> {
    let summary = summary
        .get("SUMMARY")
        .and_then(|entries| entries.get(0))
        .ok_or_else(|| DeviceError::Malformed("summary: missing SUMMARY".into()))?;

    // STATS[0] describes the miner software; the device entry carries the
    // frequency and chain temperatures.
    let device = stats
        .get("STATS")
        .and_then(Value::as_array)
        .and_then(|entries| entries.iter().find(|entry| entry.get("frequency").is_some()))
        .ok_or_else(|| DeviceError::Malformed("stats: no device entry".into()))?;

    Ok(Telemetry {
        temperature: chain_temperature(device)?,
        elapsed: Duration::from_secs(number(summary, "Elapsed")? as u64),
        api_frequency: number(device, "frequency")?.round() as u32,
        hash_rate_avg: HashRate::from_gigahashes(number(summary, "GHS av")?),
        hash_rate_5s: HashRate::from_gigahashes(number(summary, "GHS 5s")?),
        hardware_error_rate: number(summary, "Device Hardware%").unwrap_or(0.0),
    })
}

/// Hottest chip temperature across chains.
///
/// Chip sensors are reported as `temp2_N`, one per chain slot, with 0 for
/// empty slots. Older firmware only reports `temp_max`.
fn chain_temperature(device: &Value) -> Result<f64, DeviceError> {
    let hottest = device
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| key.starts_with("temp2_"))
        .filter_map(|(_, value)| as_number(value))
        .filter(|temp| *temp > 0.0)
        .fold(None, |max: Option<f64>, temp| Some(max.map_or(temp, |m| m.max(temp))));

    match hottest {
        Some(temp) => Ok(temp),
        None => number(device, "temp_max"),
    }
}

/// Numeric field that may be encoded as a JSON number or a string.
fn number(object: &Value, key: &str) -> Result<f64, DeviceError> {
    object
        .get(key)
        .and_then(as_number)
        .ok_or_else(|| DeviceError::Malformed(format!("missing or non-numeric {key:?}")))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    pub(crate) const SUMMARY: &str = r#"{"STATUS":[{"STATUS":"S","When":1714557600,"Code":11,"Msg":"Summary","Description":"bmminer 1.0.0"}],"SUMMARY":[{"Elapsed":4521,"GHS 5s":"13612.37","GHS av":13540.12,"Found Blocks":0,"Getworks":301,"Accepted":1422,"Rejected":3,"Hardware Errors":87,"Utility":18.87,"Device Hardware%":0.0012}],"id":1}"#;

    // Verbatim shape of bmminer output, including the missing comma
    pub(crate) const STATS: &str = r#"{"STATUS":[{"STATUS":"S","When":1714557600,"Code":70,"Msg":"CGMiner stats","Description":"bmminer 1.0.0"}],"STATS":[{"BMMiner":"2.0.0","Miner":"16.8.1.3","CompileTime":"Fri Nov 17 20:37:12 CST 2017","Type":"Antminer S9"}{"STATS":0,"ID":"BC50","Elapsed":4521,"frequency":"600","fan_num":2,"fan3":5880,"fan6":5760,"temp_num":3,"temp1":0,"temp6":58,"temp7":61,"temp8":59,"temp2_1":0,"temp2_6":73,"temp2_7":78,"temp2_8":75,"temp_max":61}],"id":1}"#;

    #[test]
    fn test_parse_reply_repairs_missing_comma() {
        let reply = parse_reply("stats", STATS.as_bytes()).unwrap();
        assert_eq!(reply["STATS"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_reply_strips_nul_terminator() {
        let mut raw = SUMMARY.as_bytes().to_vec();
        raw.push(0);
        assert!(parse_reply("summary", &raw).is_ok());
    }

    #[test]
    fn test_parse_reply_reports_refusal() {
        let raw = br#"{"STATUS":[{"STATUS":"E","Code":45,"Msg":"Access denied to 'restart' command"}],"id":1}"#;
        match parse_reply("restart", raw) {
            Err(DeviceError::Refused { command, message }) => {
                assert_eq!(command, "restart");
                assert!(message.contains("Access denied"));
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        assert!(matches!(
            parse_reply("summary", b"<html>busy</html>"),
            Err(DeviceError::Malformed(_))
        ));
        assert!(matches!(
            parse_reply("summary", b"\0"),
            Err(DeviceError::Malformed(_))
        ));
    }

    #[test]
    fn test_telemetry_from_s9_replies() {
        let summary = parse_reply("summary", SUMMARY.as_bytes()).unwrap();
        let stats = parse_reply("stats", STATS.as_bytes()).unwrap();

        let telemetry = telemetry_from(&summary, &stats).unwrap();
        assert_eq!(telemetry.temperature, 78.0);
        assert_eq!(telemetry.api_frequency, 600);
        assert_eq!(telemetry.elapsed, Duration::from_secs(4521));
        assert_eq!(telemetry.hash_rate_5s, HashRate::from_gigahashes(13612.37));
        assert_eq!(telemetry.hash_rate_avg, HashRate::from_gigahashes(13540.12));
        assert_eq!(telemetry.hardware_error_rate, 0.0012);
    }

    #[test]
    fn test_temperature_falls_back_to_temp_max() {
        let device = serde_json::json!({ "frequency": "550", "temp_max": 70 });
        assert_eq!(chain_temperature(&device).unwrap(), 70.0);
    }

    #[tokio::test]
    async fn test_command_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 256];
            let n = socket.read(&mut request).await.unwrap();
            let request: Value = serde_json::from_slice(&request[..n]).unwrap();

            socket.write_all(SUMMARY.as_bytes()).await.unwrap();
            socket.write_all(b"\0").await.unwrap();
            request
        });

        let api = CgminerApi::new("127.0.0.1", port);
        let reply = api.command("summary").await.unwrap();

        assert_eq!(reply["SUMMARY"][0]["Elapsed"], 4521);
        assert_eq!(server.await.unwrap()["command"], "summary");
    }

    #[tokio::test]
    async fn test_restart_survives_connection_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 256];
            let n = socket.read(&mut request).await.unwrap();
            // Closing with a zero linger sends RST instead of FIN
            #[allow(deprecated)]
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            drop(socket);
            serde_json::from_slice::<Value>(&request[..n]).unwrap()
        });

        let api = CgminerApi::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        api.restart().await.unwrap();
        assert_eq!(server.await.unwrap()["command"], "restart");
    }

    #[tokio::test]
    async fn test_restart_accepts_empty_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 256];
            socket.read(&mut request).await.unwrap();
        });

        let api = CgminerApi::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        api.restart().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_to_unreachable_miner_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let api = CgminerApi::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        assert!(matches!(
            api.restart().await,
            Err(DeviceError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_miner_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let api = CgminerApi::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        assert!(matches!(
            api.command("summary").await,
            Err(DeviceError::Connect { .. })
        ));
    }
}
