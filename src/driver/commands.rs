use std::ops::ControlFlow;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;

use super::{Driver, DriverState};
use crate::engine::status::STATUS_KEY;
use crate::engine::transform::{reverse_value, STRING_FORMAT};
use crate::engine::{DriverError, ItemFlag, ItemKind};
use crate::store::StateStore;
use crate::transport::DataSource;

/// Placeholder in a command value replaced by the caller's argument
pub const ARGUMENT_PLACEHOLDER: &str = "%s";
const ON_BATTERY_TOKEN: &str = "OB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Handled,
    Unknown,
    Failed,
}

impl CommandResult {
    pub fn to_string(&self) -> String {
        match self {
            CommandResult::Handled => "handled".to_string(),
            CommandResult::Unknown => "unknown".to_string(),
            CommandResult::Failed => "failed".to_string(),
        }
    }
}

/// Work handed to a running driver, answered between two passes
#[derive(Debug)]
pub enum DriverRequest {
    Command {
        name: String,
        extra: Option<String>,
        reply: oneshot::Sender<CommandResult>,
    },
    SetVariable {
        key: String,
        value: String,
        reply: oneshot::Sender<CommandResult>,
    },
    KillPower {
        reply: oneshot::Sender<CommandResult>,
    },
    Stop,
}

/// Integral values are written without a fraction
fn raw_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl<D: DataSource> Driver<D> {
    /// Serve one request. `Break` carries the outcome of a request that
    /// ends the driver.
    pub(super) async fn handle_request(&mut self, request: DriverRequest) -> ControlFlow<Result<(), DriverError>> {
        match request {
            DriverRequest::Command { name, extra, reply } => {
                let result = self.handle_command(&name, extra.as_deref()).await;
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            DriverRequest::SetVariable { key, value, reply } => {
                let result = self.set_variable(&key, &value).await;
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            DriverRequest::KillPower { reply } => {
                let result = self.shutdown().await;
                let _ = reply.send(if result.is_ok() { CommandResult::Handled } else { CommandResult::Failed });
                ControlFlow::Break(result)
            }
            DriverRequest::Stop => {
                info!("Stop requested");
                self.state = DriverState::Terminated;
                ControlFlow::Break(Ok(()))
            }
        }
    }

    /// Write the value of command item `name` to the device
    pub async fn handle_command(&mut self, name: &str, extra: Option<&str>) -> CommandResult {
        let Some(item) = self.table.find_command(name) else {
            warn!("{}", DriverError::UnknownCommand(name.to_string()));
            return CommandResult::Unknown;
        };

        let mut value = item.value.clone().unwrap_or_default();
        if value.contains(ARGUMENT_PLACEHOLDER) {
            match extra {
                Some(extra) => value = value.replace(ARGUMENT_PLACEHOLDER, extra),
                None => {
                    warn!("{name} needs an argument");
                    return CommandResult::Failed;
                }
            }
        }

        match self.source.send(&item.locator, &value).await {
            Ok(()) => {
                info!("{name} sent");
                CommandResult::Handled
            }
            Err(e) => {
                warn!("{name} failed: {e}");
                CommandResult::Failed
            }
        }
    }

    /// Translate a published value back to its raw form and write it
    pub async fn set_variable(&mut self, key: &str, value: &str) -> CommandResult {
        let Some(item) = self.table.find(key).filter(|i| i.kind != ItemKind::Command) else {
            warn!("{key} is not a variable of this device");
            return CommandResult::Unknown;
        };
        if !item.flags.contains(ItemFlag::Writable) {
            warn!("{key} is read only");
            return CommandResult::Failed;
        }

        let raw = match (self.table.lookup_for(&item), item.kind) {
            (Some(table), _) => match table.reverse(value) {
                Some(raw) => raw.to_raw_string(),
                None => {
                    warn!("{value:?} is not a valid value of {key}");
                    return CommandResult::Failed;
                }
            },
            (None, ItemKind::Numeric) if item.format.as_deref() != Some(STRING_FORMAT) => {
                match reverse_value(value, item.scale, item.offset) {
                    Ok(raw) => raw_number(raw),
                    Err(e) => {
                        warn!("{key}: {e}");
                        return CommandResult::Failed;
                    }
                }
            }
            (None, _) => {
                if item.max_len.is_some_and(|max| value.chars().count() > max) {
                    warn!("{value:?} is too long for {key}");
                    return CommandResult::Failed;
                }
                value.to_string()
            }
        };

        match self.source.send(&item.locator, &raw).await {
            Ok(()) => {
                debug!("{key} set to {value} ({raw})");
                self.store.set(key, value);
                CommandResult::Handled
            }
            Err(e) => {
                warn!("Setting {key} failed: {e}");
                CommandResult::Failed
            }
        }
    }

    /// Run the shutdown sequence matching the current power source and stop
    pub async fn shutdown(&mut self) -> Result<(), DriverError> {
        let Some(spec) = self.definition.shutdown.clone() else {
            error!("{} can not shut down its load", self.options.name);
            return Err(DriverError::UnknownCommand("shutdown".to_string()));
        };
        self.state = DriverState::Shutdown;

        /* the power source decides the sequence, so it has to be current */
        if let Err(e) = self.refresh_for_shutdown().await {
            warn!("Status refresh before shutdown failed: {e}");
        }
        let on_battery = self
            .store
            .get(STATUS_KEY)
            .is_some_and(|s| s.split_whitespace().any(|t| t == ON_BATTERY_TOKEN));

        let (first, second) = if on_battery {
            (&spec.on_battery, &spec.on_line)
        } else {
            (&spec.on_line, &spec.on_battery)
        };
        let steps = if first.is_empty() { second } else { first };
        info!("Shutting down {} ({} sequence)", self.options.name, if on_battery { "on battery" } else { "on line" });

        let mut result = Ok(());
        for step in steps.iter() {
            if self.handle_command(step, None).await != CommandResult::Handled {
                error!("Shutdown step {step} failed");
                result = Err(DriverError::UnknownCommand(step.clone()));
                break;
            }
        }

        self.state = DriverState::Terminated;
        result
    }

    async fn refresh_for_shutdown(&mut self) -> Result<(), DriverError> {
        let full_every = self.options.full_poll_every;
        self.options.full_poll_every = 1;
        let result = self.poll_once().await.map(|_| ());
        self.options.full_poll_every = full_every;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::parse_definition;
    use crate::driver::DriverOptions;
    use crate::transport::MemorySource;

    const DEF: &str = r#"
manufacturer: Generic
model: Q1
lookups:
  - name: utility
    entries: [ { raw: "0", token: OL }, { raw: "1", token: OB } ]
  - name: sensitivity
    entries: [ { raw: "0", token: high }, { raw: "1", token: low } ]
items:
  - { key: ups.status, locator: "util", kind: status, lookup: utility }
  - { key: input.sensitivity, locator: "sens", kind: string, lookup: sensitivity, flags: [writable] }
  - { key: ups.delay.shutdown, locator: "delay", scale: 0.1, format: "%.0f", flags: [writable] }
  - { key: ups.id, locator: "id", kind: string, max_len: 8, flags: [writable] }
  - { key: input.voltage, locator: "iv" }
  - { key: load.off, locator: "S", kind: command, value: "00" }
  - { key: shutdown.return, locator: "S", kind: command, value: "%sR0001" }
  - { key: beeper.toggle, locator: "Q", kind: command }
shutdown: { on_line: [load.off], on_battery: [beeper.toggle, load.off] }
"#;

    async fn driver() -> Driver<MemorySource> {
        let source = MemorySource::with_values([("util", "0"), ("sens", "0"), ("delay", "200"), ("id", "rack"), ("iv", "230")]);
        let mut driver = Driver::new(parse_definition(DEF).unwrap(), source, DriverOptions::default());
        driver.start().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_commands() {
        let mut driver = driver().await;
        assert_eq!(driver.handle_command("load.off", None).await, CommandResult::Handled);
        assert_eq!(driver.handle_command("shutdown.return", Some(".3")).await, CommandResult::Handled);
        assert_eq!(driver.handle_command("shutdown.return", None).await, CommandResult::Failed);
        assert_eq!(driver.handle_command("load.on", None).await, CommandResult::Unknown);
        assert_eq!(driver.handle_command("input.voltage", None).await, CommandResult::Unknown);
        assert_eq!(
            driver.source().sent,
            vec![("S".to_string(), "00".to_string()), ("S".to_string(), ".3R0001".to_string())]
        );

        driver.source_mut().fail("Q", DriverError::TransportTimeout("Q".to_string()));
        assert_eq!(driver.handle_command("beeper.toggle", None).await, CommandResult::Failed);
    }

    #[tokio::test]
    async fn test_set_variable() {
        let mut driver = driver().await;
        assert_eq!(driver.set_variable("input.sensitivity", "low").await, CommandResult::Handled);
        assert_eq!(driver.source().value("sens"), Some("1"));
        assert_eq!(driver.store().get("input.sensitivity"), Some("low"));
        assert_eq!(driver.set_variable("input.sensitivity", "medium").await, CommandResult::Failed);

        assert_eq!(driver.set_variable("ups.delay.shutdown", "30").await, CommandResult::Handled);
        assert_eq!(driver.source().value("delay"), Some("300"));

        assert_eq!(driver.set_variable("ups.id", "basement").await, CommandResult::Handled);
        assert_eq!(driver.set_variable("ups.id", "server-room").await, CommandResult::Failed);

        assert_eq!(driver.set_variable("input.voltage", "240").await, CommandResult::Failed);
        assert_eq!(driver.set_variable("output.voltage", "240").await, CommandResult::Unknown);
    }

    #[tokio::test]
    async fn test_shutdown_on_battery() {
        let mut driver = driver().await;
        driver.source_mut().set("util", "1");
        driver.shutdown().await.unwrap();
        assert_eq!(driver.state(), DriverState::Terminated);
        assert_eq!(driver.source().sent[0], ("Q".to_string(), String::new()));
        assert_eq!(driver.source().sent[1], ("S".to_string(), "00".to_string()));
    }

    #[tokio::test]
    async fn test_requests_that_end_the_driver() {
        let mut driver = driver().await;
        let (reply, answer) = oneshot::channel();
        let flow = driver.handle_request(DriverRequest::Command { name: "load.off".to_string(), extra: None, reply }).await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(answer.await.unwrap(), CommandResult::Handled);

        let (reply, answer) = oneshot::channel();
        let flow = driver.handle_request(DriverRequest::KillPower { reply }).await;
        assert_eq!(flow, ControlFlow::Break(Ok(())));
        assert_eq!(answer.await.unwrap(), CommandResult::Handled);

        let mut stopped = self::driver().await;
        assert_eq!(stopped.handle_request(DriverRequest::Stop).await, ControlFlow::Break(Ok(())));
        assert_eq!(stopped.state(), DriverState::Terminated);
        assert!(stopped.source().sent.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_without_sequence() {
        let yaml = DEF.replace("shutdown: { on_line: [load.off], on_battery: [beeper.toggle, load.off] }\n", "");
        let source = MemorySource::with_values([("util", "0")]);
        let mut driver = Driver::new(parse_definition(&yaml).unwrap(), source, DriverOptions::default());
        driver.start().await.unwrap();
        assert!(driver.shutdown().await.is_err());
        assert_eq!(driver.state(), DriverState::SteadyPoll);
    }
}
