//! Command/response protocols on a serial line (Megatec Q1 and the
//! Voltronic variants with CRC), either on a local tty or behind a
//! serial-to-TCP converter.
//!
//! Locator syntax: `<command>[:<field>[:<char>]]`. Without a field the whole
//! response body is returned, with a field the n-th whitespace separated
//! field, with a char the n-th character of that field (status bit strings).

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::DataSource;
use crate::engine::DriverError;

/// First byte of every valid response
const START_BYTES: &[u8] = b"(#";
const TERMINATOR: u8 = b'\r';
const MAX_RESPONSE_LEN: usize = 512;
const NAK: &str = "NAK";
/// Commands are mostly not answered, wait only briefly for a refusal
const COMMAND_REPLY_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct LineLocator {
    pub command: String,
    pub field: Option<usize>,
    pub character: Option<usize>,
}

pub fn parse_locator(locator: &str) -> Result<LineLocator, DriverError> {
    let mut parts = locator.split(':');
    let command = parts.next().unwrap_or_default().to_string();
    if command.is_empty() {
        return Err(DriverError::Definition(format!("empty command in locator {locator:?}")));
    }

    let index = |part: Option<&str>| -> Result<Option<usize>, DriverError> {
        match part {
            None => Ok(None),
            Some(p) => p
                .parse()
                .map(Some)
                .map_err(|_| DriverError::Definition(format!("bad index {p:?} in locator {locator:?}"))),
        }
    };

    let field = index(parts.next())?;
    let character = index(parts.next())?;
    if parts.next().is_some() {
        return Err(DriverError::Definition(format!("too many parts in locator {locator:?}")));
    }

    Ok(LineLocator { command, field, character })
}

/// CRC-16/XMODEM as used by Voltronic devices, which never send the
/// reserved bytes `(`, CR and LF as part of the checksum.
pub fn line_crc(data: &[u8]) -> [u8; 2] {
    let crc = crc16::State::<crc16::XMODEM>::calculate(data);
    let mut bytes = crc.to_be_bytes();
    for b in bytes.iter_mut() {
        if *b == b'(' || *b == b'\r' || *b == b'\n' {
            *b += 1;
        }
    }
    bytes
}

pub fn encode_request(command: &str, crc: bool) -> Vec<u8> {
    let mut frame = command.as_bytes().to_vec();
    if crc {
        let sum = line_crc(&frame);
        frame.extend_from_slice(&sum);
    }
    frame.push(TERMINATOR);
    frame
}

/// Validate one response line and return its body without start byte,
/// checksum and terminator
pub fn parse_frame(frame: &[u8], crc: bool) -> Result<String, DriverError> {
    let frame = frame.strip_suffix(&[TERMINATOR]).unwrap_or(frame);

    match frame.first() {
        Some(b) if START_BYTES.contains(b) => {}
        Some(_) => {
            return Err(DriverError::ProtocolFraming(format!("bad start byte in {}", hex::encode(frame))));
        }
        None => return Err(DriverError::ProtocolFraming("empty response".to_string())),
    }

    let payload = if crc {
        if frame.len() < 3 {
            return Err(DriverError::ProtocolFraming(format!("response too short for a checksum: {}", hex::encode(frame))));
        }
        let (payload, sum) = frame.split_at(frame.len() - 2);
        if line_crc(payload)[..] != *sum {
            return Err(DriverError::ProtocolFraming(format!("checksum mismatch in {}", hex::encode(frame))));
        }
        payload
    } else {
        frame
    };

    let body = std::str::from_utf8(&payload[1..])
        .map_err(|_| DriverError::ProtocolFraming(format!("response is not text: {}", hex::encode(frame))))?;
    Ok(body.trim_end().to_string())
}

/// Apply the field and character selection of a locator to a response body
pub fn select(body: &str, locator: &LineLocator) -> Result<String, DriverError> {
    let Some(field) = locator.field else {
        return Ok(body.to_string());
    };

    let value = body.split_whitespace().nth(field).ok_or_else(|| {
        DriverError::BadValue(format!("response to {} has no field {field}: {body:?}", locator.command))
    })?;

    match locator.character {
        None => Ok(value.to_string()),
        Some(c) => value
            .chars()
            .nth(c)
            .map(|ch| ch.to_string())
            .ok_or_else(|| DriverError::BadValue(format!("field {field} of {} has no character {c}", locator.command))),
    }
}

enum LineConnection {
    Tcp(TcpStream),
    Serial(SerialStream),
}

impl LineConnection {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            LineConnection::Tcp(s) => s.write_all(data).await,
            LineConnection::Serial(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            LineConnection::Tcp(s) => s.read(buf).await,
            LineConnection::Serial(s) => s.read(buf).await,
        }
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    Serial { port: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

pub struct LineSource {
    endpoint: Endpoint,
    crc: bool,
    timeout: Duration,
    conn: Option<LineConnection>,
    /// Outcome of every command of the current pass, a dead line is only
    /// waited for once per command
    cache: HashMap<String, Result<String, DriverError>>,
}

impl LineSource {
    pub fn serial(port: &str, baud: u32, crc: bool, timeout: Duration) -> Self {
        LineSource::new(Endpoint::Serial { port: port.to_string(), baud }, crc, timeout)
    }

    pub fn tcp(host: &str, port: u16, crc: bool, timeout: Duration) -> Self {
        LineSource::new(Endpoint::Tcp { host: host.to_string(), port }, crc, timeout)
    }

    fn new(endpoint: Endpoint, crc: bool, timeout: Duration) -> Self {
        LineSource { endpoint, crc, timeout, conn: None, cache: HashMap::new() }
    }

    async fn open(&self) -> Result<LineConnection, DriverError> {
        match &self.endpoint {
            Endpoint::Serial { port, baud } => tokio_serial::new(port, *baud)
                .timeout(self.timeout)
                .open_native_async()
                .map(LineConnection::Serial)
                .map_err(|e| DriverError::TransportIo(format!("Failed to open {port}: {e}"))),
            Endpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                match timeout(self.timeout, TcpStream::connect(&addr)).await {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        Ok(LineConnection::Tcp(stream))
                    }
                    Ok(Err(e)) => Err(DriverError::TransportIo(format!("Failed to connect to {addr}: {e}"))),
                    Err(_) => Err(DriverError::TransportTimeout(format!("Connection to {addr} timed out"))),
                }
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut LineConnection, DriverError> {
        if self.conn.is_none() {
            debug!("Reconnecting to {}", self.describe());
            self.conn = Some(self.open().await?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::TransportIo("connection vanished".to_string()))
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Vec<u8>, DriverError> {
        let conn = self.connection().await?;
        let mut line = Vec::new();
        let mut buf = [0u8; 64];

        while !line.contains(&TERMINATOR) {
            let n = match timeout(wait, conn.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(DriverError::TransportIo("connection closed".to_string())),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(DriverError::TransportTimeout(format!("no complete response after {wait:?}"))),
            };
            line.extend_from_slice(&buf[..n]);
            if line.len() > MAX_RESPONSE_LEN {
                return Err(DriverError::ProtocolFraming(format!("response exceeds {MAX_RESPONSE_LEN} bytes")));
            }
        }

        /* anything after the terminator belongs to no request of ours */
        if let Some(pos) = line.iter().position(|b| *b == TERMINATOR) {
            line.truncate(pos + 1);
        }
        Ok(line)
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), DriverError> {
        debug!("line TX {}", hex::encode(frame));
        let conn = self.connection().await?;
        conn.write_all(frame).await.map_err(DriverError::from)
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<String, DriverError> {
        self.write(frame).await?;
        let response = self.read_line(self.timeout).await?;
        debug!("line RX {}", hex::encode(&response));
        parse_frame(&response, self.crc)
    }

    async fn query(&mut self, command: &str) -> Result<String, DriverError> {
        let frame = encode_request(command, self.crc);
        let result = self.exchange(&frame).await;

        if let Err(e) = &result {
            if e.is_transport() {
                /* the line may be out of sync, start over on the next request */
                self.conn = None;
            }
        }
        result
    }
}

impl DataSource for LineSource {
    async fn connect(&mut self) -> Result<(), DriverError> {
        let conn = self.open().await?;
        self.conn = Some(conn);
        info!("Connected to {}", self.describe());
        Ok(())
    }

    async fn fetch(&mut self, locator: &str) -> Result<String, DriverError> {
        let locator = parse_locator(locator)?;

        let body = match self.cache.get(&locator.command) {
            Some(outcome) => outcome.clone(),
            None => {
                let outcome = self.query(&locator.command).await;
                self.cache.insert(locator.command.clone(), outcome.clone());
                outcome
            }
        }?;

        select(&body, &locator)
    }

    async fn send(&mut self, locator: &str, value: &str) -> Result<(), DriverError> {
        let command = format!("{}{}", parse_locator(locator)?.command, value);
        self.write(&encode_request(&command, self.crc)).await?;

        match self.read_line(COMMAND_REPLY_WAIT).await {
            Ok(reply) => {
                let reply = String::from_utf8_lossy(&reply);
                if reply.contains(NAK) {
                    warn!("Device refused {command}");
                    return Err(DriverError::BadValue(format!("{command} refused by the device")));
                }
                Ok(())
            }
            /* most devices execute silently */
            Err(DriverError::TransportTimeout(_)) => Ok(()),
            Err(e) => {
                self.conn = None;
                Err(e)
            }
        }
    }

    fn begin_pass(&mut self) {
        self.cache.clear();
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Endpoint::Serial { port, baud } => format!("serial line {port}@{baud}"),
            Endpoint::Tcp { host, port } => format!("serial line over tcp {host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_locator() {
        assert_eq!(
            parse_locator("Q1:7:0").unwrap(),
            LineLocator { command: "Q1".to_string(), field: Some(7), character: Some(0) }
        );
        assert_eq!(parse_locator("I").unwrap().field, None);
        assert!(parse_locator("").is_err());
        assert!(parse_locator("Q1:x").is_err());
        assert!(parse_locator("Q1:1:2:3").is_err());
    }

    #[test]
    fn test_parse_q1_frame() {
        let body = parse_frame(b"(226.0 195.0 226.0 014 49.0 27.5 30.0 00001001\r", false).unwrap();
        assert_eq!(body, "226.0 195.0 226.0 014 49.0 27.5 30.0 00001001");

        let loc = parse_locator("Q1:7:0").unwrap();
        assert_eq!(select(&body, &loc).unwrap(), "0");
        let loc = parse_locator("Q1:7:4").unwrap();
        assert_eq!(select(&body, &loc).unwrap(), "1");
        let loc = parse_locator("Q1:3").unwrap();
        assert_eq!(select(&body, &loc).unwrap(), "014");
        let loc = parse_locator("Q1:9").unwrap();
        assert!(matches!(select(&body, &loc), Err(DriverError::BadValue(_))));
    }

    #[test]
    fn test_framing_errors() {
        assert!(matches!(parse_frame(b"Q1\r", false), Err(DriverError::ProtocolFraming(_))));
        assert!(matches!(parse_frame(b"\r", false), Err(DriverError::ProtocolFraming(_))));
        assert_eq!(parse_frame(b"#APC Smart-UPS 1.0\r", false).unwrap(), "APC Smart-UPS 1.0");
    }

    #[test]
    fn test_crc_frames() {
        let mut frame = b"(230.0 50.0".to_vec();
        let sum = line_crc(&frame);
        frame.extend_from_slice(&sum);
        frame.push(b'\r');
        assert_eq!(parse_frame(&frame, true).unwrap(), "230.0 50.0");

        let len = frame.len();
        frame[len - 2] ^= 0x01;
        assert!(matches!(parse_frame(&frame, true), Err(DriverError::ProtocolFraming(_))));

        let request = encode_request("QPIGS", true);
        assert_eq!(request.len(), "QPIGS".len() + 3);
        assert_eq!(*request.last().unwrap(), b'\r');
    }

    #[test]
    fn test_crc_avoids_reserved_bytes() {
        for data in [&b"QPI"[..], b"QMOD", b"QPIGS", b"(B"] {
            let sum = line_crc(data);
            assert!(!sum.contains(&b'('));
            assert!(!sum.contains(&b'\r'));
            assert!(!sum.contains(&b'\n'));
        }
    }

    #[tokio::test]
    async fn test_tcp_query_is_cached_per_pass() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut served = 0;
            loop {
                let mut request = Vec::new();
                if reader.read_until(b'\r', &mut request).await.unwrap() == 0 {
                    break;
                }
                served += 1;
                write.write_all(b"(230.0 190.0 229.0 020 50.0 13.6 25.0 00001000\r").await.unwrap();
            }
            served
        });

        let mut source = LineSource::tcp("127.0.0.1", port, false, Duration::from_secs(2));
        source.connect().await.unwrap();
        source.begin_pass();
        assert_eq!(source.fetch("Q1:0").await.unwrap(), "230.0");
        assert_eq!(source.fetch("Q1:5").await.unwrap(), "13.6");
        source.begin_pass();
        assert_eq!(source.fetch("Q1:7:4").await.unwrap(), "1");
        drop(source);

        assert_eq!(server.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_silent_line_is_waited_for_once_per_pass() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut request = Vec::new();
                    while reader.read_until(b'\r', &mut request).await.unwrap_or(0) > 0 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        request.clear();
                    }
                });
            }
        });

        let mut source = LineSource::tcp("127.0.0.1", port, false, Duration::from_millis(100));
        source.connect().await.unwrap();
        source.begin_pass();
        for field in 0..7 {
            let e = source.fetch(&format!("Q1:{field}")).await.unwrap_err();
            assert!(e.is_transport());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        source.begin_pass();
        assert!(source.fetch("Q1:0").await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }
}
