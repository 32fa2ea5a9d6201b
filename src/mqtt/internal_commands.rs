use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

use crate::driver::{CommandResult, DriverRequest};
use crate::mqtt::{PublishData, SubscribeData, Transmission};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct CommandPayload {
    cmd: String,
    #[serde(default)]
    extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SetPayload {
    key: String,
    value: serde_json::Value,
}

/// A request received over MQTT, not yet handed to the driver
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRequest {
    Command { name: String, extra: Option<String> },
    SetVariable { key: String, value: String },
}

#[derive(Debug, Serialize)]
struct ResultPayload<'a> {
    request: &'a str,
    result: CommandResult,
}

/// `<cmd>` or `{"cmd": "<cmd>", "extra": "<arg>"}`
pub fn parse_command(payload: &str) -> Option<RemoteRequest> {
    let payload = payload.trim();
    if payload.starts_with('{') {
        let parsed: CommandPayload = serde_json::from_str(payload).ok()?;
        return Some(RemoteRequest::Command { name: parsed.cmd, extra: parsed.extra });
    }
    if payload.is_empty() || payload.contains(char::is_whitespace) {
        return None;
    }
    Some(RemoteRequest::Command { name: payload.to_string(), extra: None })
}

/// `{"key": "<variable>", "value": <value>}`, numbers are accepted as values
pub fn parse_set(payload: &str) -> Option<RemoteRequest> {
    let parsed: SetPayload = serde_json::from_str(payload.trim()).ok()?;
    let value = match parsed.value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => return None,
        other => other.to_string(),
    };
    Some(RemoteRequest::SetVariable { key: parsed.key, value })
}

impl RemoteRequest {
    fn label(&self) -> &str {
        match self {
            RemoteRequest::Command { name, .. } => name,
            RemoteRequest::SetVariable { key, .. } => key,
        }
    }
}

/// Hand `request` to the driver and wait for its answer
pub async fn execute(driver: &Sender<DriverRequest>, request: RemoteRequest) -> CommandResult {
    let (reply, answer) = oneshot::channel();
    let message = match request {
        RemoteRequest::Command { name, extra } => DriverRequest::Command { name, extra, reply },
        RemoteRequest::SetVariable { key, value } => DriverRequest::SetVariable { key, value, reply },
    };

    if driver.send(message).await.is_err() {
        warn!("Driver is not running, request dropped");
        return CommandResult::Failed;
    }
    answer.await.unwrap_or(CommandResult::Failed)
}

pub struct CommandHandler {
    sender: Sender<Transmission>,
    driver: Sender<DriverRequest>,
    name: String,
}

impl CommandHandler {
    pub fn new(sender: Sender<Transmission>, driver: Sender<DriverRequest>, name: &str) -> Self {
        CommandHandler {
            sender,
            driver,
            name: name.to_string(),
        }
    }

    async fn subscribe(&self, suffix: &str) -> tokio::sync::mpsc::Receiver<String> {
        let (sender, receiver) = tokio::sync::mpsc::channel(10);
        let register = Transmission::Subscribe(SubscribeData {
            topic: format!("{}/{suffix}", self.name),
            sender,
        });
        let _ = self.sender.send(register).await;
        receiver
    }

    async fn answer(&self, request: &RemoteRequest, result: CommandResult) {
        let payload = ResultPayload { request: request.label(), result };
        let Ok(payload) = serde_json::to_string(&payload) else {
            return;
        };
        let p = Transmission::Publish(PublishData {
            topic: format!("{}/cmd/result", self.name),
            payload,
            qos: 1,
            retain: false,
        });
        let _ = self.sender.send(p).await;
    }

    pub async fn start_thread(&self) {
        info!("Starting CommandHandler for {}", self.name);
        let mut commands = self.subscribe("cmd").await;
        let mut sets = self.subscribe("set").await;

        loop {
            let request = tokio::select! {
                Some(c) = commands.recv() => {
                    debug!("Received command {c}");
                    parse_command(&c)
                }
                Some(s) = sets.recv() => {
                    debug!("Received set request {s}");
                    parse_set(&s)
                }
                else => break,
            };

            let Some(request) = request else {
                warn!("Ignoring malformed request");
                continue;
            };
            let result = execute(&self.driver, request.clone()).await;
            info!("{} {}", request.label(), result.to_string());
            self.answer(&request, result).await;
        }

        info!("CommandHandler for {} exits", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("beeper.mute\n"),
            Some(RemoteRequest::Command { name: "beeper.mute".to_string(), extra: None })
        );
        assert_eq!(
            parse_command(r#"{"cmd": "shutdown.return", "extra": "30"}"#),
            Some(RemoteRequest::Command { name: "shutdown.return".to_string(), extra: Some("30".to_string()) })
        );
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("load off"), None);
        assert_eq!(parse_command("{\"extra\": 1}"), None);
    }

    #[test]
    fn test_parse_set() {
        assert_eq!(
            parse_set(r#"{"key": "input.transfer.low", "value": 180}"#),
            Some(RemoteRequest::SetVariable { key: "input.transfer.low".to_string(), value: "180".to_string() })
        );
        assert_eq!(
            parse_set(r#"{"key": "input.sensitivity", "value": "low"}"#),
            Some(RemoteRequest::SetVariable { key: "input.sensitivity".to_string(), value: "low".to_string() })
        );
        assert_eq!(parse_set(r#"{"key": "x", "value": null}"#), None);
        assert_eq!(parse_set("low"), None);
    }

    #[tokio::test]
    async fn test_execute_waits_for_driver() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    DriverRequest::Command { name, reply, .. } => {
                        let _ = reply.send(if name == "beeper.mute" { CommandResult::Handled } else { CommandResult::Unknown });
                    }
                    DriverRequest::SetVariable { reply, .. } => {
                        let _ = reply.send(CommandResult::Failed);
                    }
                    _ => {}
                }
            }
        });

        let mute = RemoteRequest::Command { name: "beeper.mute".to_string(), extra: None };
        assert_eq!(execute(&tx, mute).await, CommandResult::Handled);
        let other = RemoteRequest::Command { name: "load.off".to_string(), extra: None };
        assert_eq!(execute(&tx, other).await, CommandResult::Unknown);
        let set = RemoteRequest::SetVariable { key: "ups.id".to_string(), value: "x".to_string() };
        assert_eq!(execute(&tx, set).await, CommandResult::Failed);
    }

    #[tokio::test]
    async fn test_execute_without_driver() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let mute = RemoteRequest::Command { name: "beeper.mute".to_string(), extra: None };
        assert_eq!(execute(&tx, mute).await, CommandResult::Failed);
    }
}
