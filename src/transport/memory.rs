use std::collections::HashMap;
use log::debug;

use super::DataSource;
use crate::engine::DriverError;

/// Values held in memory, used for the dummy device and to script device
/// behaviour in tests
#[derive(Debug, Default)]
pub struct MemorySource {
    values: HashMap<String, String>,
    failures: HashMap<String, DriverError>,
    /// Remaining transient failures per locator before it answers again
    flaky: HashMap<String, u32>,
    connect_failures: u32,
    offline: bool,
    pub sent: Vec<(String, String)>,
    pub fetched: Vec<String>,
    pub passes: u32,
}

impl MemorySource {
    pub fn new() -> Self {
        MemorySource::default()
    }

    pub fn with_values<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut source = MemorySource::new();
        for (locator, value) in values {
            source.set(locator, value);
        }
        source
    }

    pub fn set(&mut self, locator: &str, value: &str) {
        self.values.insert(locator.to_string(), value.to_string());
    }

    pub fn remove(&mut self, locator: &str) {
        self.values.remove(locator);
    }

    pub fn value(&self, locator: &str) -> Option<&str> {
        self.values.get(locator).map(|v| v.as_str())
    }

    /// Every access to `locator` fails with `error` until cleared
    pub fn fail(&mut self, locator: &str, error: DriverError) {
        self.failures.insert(locator.to_string(), error);
    }

    pub fn clear_failure(&mut self, locator: &str) {
        self.failures.remove(locator);
        self.flaky.remove(locator);
    }

    /// The next `times` fetches of `locator` time out
    pub fn fail_times(&mut self, locator: &str, times: u32) {
        self.flaky.insert(locator.to_string(), times);
    }

    pub fn fail_connect(&mut self, times: u32) {
        self.connect_failures = times;
    }

    /// Simulate a pulled cable, every fetch and send times out
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    fn check(&mut self, locator: &str) -> Result<(), DriverError> {
        if self.offline {
            return Err(DriverError::TransportTimeout(format!("no answer for {locator}")));
        }
        if let Some(e) = self.failures.get(locator) {
            return Err(e.clone());
        }
        if let Some(remaining) = self.flaky.get_mut(locator) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::TransportTimeout(format!("no answer for {locator}")));
            }
        }
        Ok(())
    }
}

impl DataSource for MemorySource {
    async fn connect(&mut self) -> Result<(), DriverError> {
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(DriverError::TransportIo("connection refused".to_string()));
        }
        Ok(())
    }

    async fn fetch(&mut self, locator: &str) -> Result<String, DriverError> {
        self.fetched.push(locator.to_string());
        self.check(locator)?;
        self.values
            .get(locator)
            .cloned()
            .ok_or_else(|| DriverError::TransportIo(format!("{locator} not available")))
    }

    async fn send(&mut self, locator: &str, value: &str) -> Result<(), DriverError> {
        self.check(locator)?;
        debug!("memory write {locator} = {value}");
        self.sent.push((locator.to_string(), value.to_string()));
        self.values.insert(locator.to_string(), value.to_string());
        Ok(())
    }

    fn begin_pass(&mut self) {
        self.passes += 1;
    }

    fn describe(&self) -> String {
        format!("memory ({} values)", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_locator_recovers() {
        let mut source = MemorySource::with_values([("I", "#APC Smart-UPS")]);
        source.fail_times("I", 2);
        assert!(source.fetch("I").await.is_err());
        assert!(source.fetch("I").await.is_err());
        assert_eq!(source.fetch("I").await.unwrap(), "#APC Smart-UPS");
        assert_eq!(source.fetched.len(), 3);
    }

    #[tokio::test]
    async fn test_send_is_recorded() {
        let mut source = MemorySource::new();
        source.send("T", "").await.unwrap();
        assert_eq!(source.sent, vec![("T".to_string(), "".to_string())]);

        source.fail("C", DriverError::TransportIo("broken".to_string()));
        assert!(source.send("C", "").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failures_and_offline() {
        let mut source = MemorySource::with_values([("Q1", "(230.0)")]);
        source.fail_connect(1);
        assert!(source.connect().await.is_err());
        assert!(source.connect().await.is_ok());

        source.set_offline(true);
        assert!(matches!(source.fetch("Q1").await, Err(DriverError::TransportTimeout(_))));
        source.set_offline(false);
        assert!(source.fetch("Q1").await.is_ok());
    }
}
