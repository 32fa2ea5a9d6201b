//! Modbus register access for UPS and PDU units with a network card.
//!
//! Locator syntax: `<holding|input|coil>:<address>[:<count>][:<type>]` with
//! type one of `u16` (default), `i16`, `u32`, `i32`, `string` or `hex`.
//! The address may be written as `<base>+<offset>`, which lets outlet
//! templates say `input:200+%i`.

use std::time::Duration;

use log::{debug, info};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::DataSource;
use crate::config::ModbusProtoConfig;
use crate::engine::DriverError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterFormat {
    U16,
    I16,
    U32,
    I32,
    Text,
    Hex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterLocator {
    pub register_type: RegisterType,
    pub address: u16,
    pub count: u16,
    pub format: RegisterFormat,
}

pub fn parse_locator(locator: &str) -> Result<RegisterLocator, DriverError> {
    let bad = |what: &str| DriverError::Definition(format!("{what} in modbus locator {locator:?}"));
    let parts: Vec<&str> = locator.split(':').collect();
    if parts.len() < 2 || parts.len() > 4 {
        return Err(bad("wrong number of parts"));
    }

    let register_type = match parts[0] {
        "holding" => RegisterType::Holding,
        "input" => RegisterType::Input,
        "coil" => RegisterType::Coil,
        _ => return Err(bad("unknown register type")),
    };
    let mut address: u16 = 0;
    for term in parts[1].split('+') {
        let term: u16 = term.trim().parse().map_err(|_| bad("bad address"))?;
        address = address.checked_add(term).ok_or_else(|| bad("address out of range"))?;
    }

    let mut count = None;
    let mut format = RegisterFormat::U16;
    for part in &parts[2..] {
        match *part {
            "u16" => format = RegisterFormat::U16,
            "i16" => format = RegisterFormat::I16,
            "u32" => format = RegisterFormat::U32,
            "i32" => format = RegisterFormat::I32,
            "string" => format = RegisterFormat::Text,
            "hex" => format = RegisterFormat::Hex,
            n => count = Some(n.parse::<u16>().map_err(|_| bad("bad count"))?),
        }
    }

    let count = match (count, format) {
        (Some(c), _) => c,
        (None, RegisterFormat::U32 | RegisterFormat::I32) => 2,
        (None, _) => 1,
    };
    if count == 0 || count > 125 {
        return Err(bad("count out of range"));
    }

    Ok(RegisterLocator { register_type, address, count, format })
}

/// Render the registers of one read the way the locator asks for
pub fn decode_registers(data: &[u16], format: RegisterFormat) -> Result<String, DriverError> {
    let first = |n: usize| -> Result<&[u16], DriverError> {
        data.get(..n)
            .ok_or_else(|| DriverError::ProtocolFraming(format!("expected {n} registers, got {}", data.len())))
    };

    Ok(match format {
        RegisterFormat::U16 => first(1)?[0].to_string(),
        RegisterFormat::I16 => (first(1)?[0] as i16).to_string(),
        RegisterFormat::U32 => {
            let d = first(2)?;
            (u32::from(d[0]) << 16 | u32::from(d[1])).to_string()
        }
        RegisterFormat::I32 => {
            let d = first(2)?;
            ((u32::from(d[0]) << 16 | u32::from(d[1])) as i32).to_string()
        }
        RegisterFormat::Text => {
            let bytes: Vec<u8> = data.iter().flat_map(|r| r.to_be_bytes()).collect();
            String::from_utf8_lossy(&bytes)
                .trim_end_matches(['\0', ' '])
                .trim_start()
                .to_string()
        }
        RegisterFormat::Hex => {
            let bytes: Vec<u8> = data.iter().flat_map(|r| r.to_be_bytes()).collect();
            hex::encode(bytes)
        }
    })
}

/// Register words for a value written back to the device
pub fn encode_registers(value: &str, locator: &RegisterLocator) -> Result<Vec<u16>, DriverError> {
    let bad = || DriverError::BadValue(format!("{value:?} does not fit {:?}", locator.format));
    let number = || -> Result<i64, DriverError> {
        value.trim().parse::<f64>().map(|v| v.round() as i64).map_err(|_| bad())
    };

    match locator.format {
        RegisterFormat::U16 => u16::try_from(number()?).map(|v| vec![v]).map_err(|_| bad()),
        RegisterFormat::I16 => i16::try_from(number()?).map(|v| vec![v as u16]).map_err(|_| bad()),
        RegisterFormat::U32 => u32::try_from(number()?)
            .map(|v| vec![(v >> 16) as u16, v as u16])
            .map_err(|_| bad()),
        RegisterFormat::I32 => i32::try_from(number()?)
            .map(|v| vec![((v as u32) >> 16) as u16, v as u16])
            .map_err(|_| bad()),
        RegisterFormat::Text => {
            let size = locator.count as usize * 2;
            if value.len() > size {
                return Err(bad());
            }
            let mut bytes = value.as_bytes().to_vec();
            bytes.resize(size, 0);
            Ok(bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
        }
        RegisterFormat::Hex => {
            let bytes = hex::decode(value.trim()).map_err(|_| bad())?;
            if bytes.len() != locator.count as usize * 2 {
                return Err(bad());
            }
            Ok(bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
        }
    }
}

/// An exception reply is a valid answer, only broken frames are framing errors
fn modbus_error(what: &str, e: rmodbus::ErrorKind) -> DriverError {
    if e.is_modbus_error() {
        DriverError::BadValue(format!("{what}: device answered {e:?}"))
    } else {
        DriverError::ProtocolFraming(format!("{what}: {e:?}"))
    }
}

pub struct ModbusSource {
    host: String,
    port: u16,
    slave_id: u8,
    proto: ModbusProto,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl ModbusSource {
    pub fn new(host: &str, port: u16, slave_id: u8, proto: ModbusProtoConfig, timeout: Duration) -> Self {
        /* RTU over TCP needs the RTU framing with all of its CRC stuff */
        let proto = match proto {
            ModbusProtoConfig::TCP => ModbusProto::TcpUdp,
            ModbusProtoConfig::RTUoverTCP => ModbusProto::Rtu,
        };

        ModbusSource {
            host: host.to_string(),
            port,
            slave_id,
            proto,
            timeout,
            stream: None,
        }
    }

    async fn open(&self) -> Result<TcpStream, DriverError> {
        let addr = format!("{}:{}", self.host, self.port);
        match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(DriverError::TransportIo(format!("Failed to connect to {addr}: {e}"))),
            Err(_) => Err(DriverError::TransportTimeout(format!("Connection to {addr} timed out"))),
        }
    }

    async fn transfer(&mut self, request: &[u8]) -> Result<Vec<u8>, DriverError> {
        if self.stream.is_none() {
            debug!("Reconnecting to {}", self.describe());
            self.stream = Some(self.open().await?);
        }
        let header_len = match self.proto {
            ModbusProto::TcpUdp => 6,
            _ => 3,
        };
        let proto = self.proto;
        let wait = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::TransportIo("connection vanished".to_string()))?;

        let result = async {
            stream.write_all(request).await?;

            let mut response = vec![0u8; header_len];
            stream.read_exact(&mut response).await?;

            let len = guess_response_frame_len(&response, proto)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}")))?
                as usize;
            if len > header_len {
                let mut rest = vec![0u8; len - header_len];
                stream.read_exact(&mut rest).await?;
                response.extend(rest);
            }
            Ok::<Vec<u8>, std::io::Error>(response)
        };

        let response = match timeout(wait, result).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(DriverError::ProtocolFraming(format!("Failed to determine response length: {e}")))
            }
            Ok(Err(e)) => Err(DriverError::from(e)),
            Err(_) => Err(DriverError::TransportTimeout(format!("no response within {wait:?}"))),
        };

        match response {
            Ok(r) => {
                debug!("modbus RX {}", hex::encode(&r));
                Ok(r)
            }
            Err(e) => {
                /* a late answer would be taken for the next one */
                self.stream = None;
                Err(e)
            }
        }
    }
}

impl DataSource for ModbusSource {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.stream = Some(self.open().await?);
        info!("Connected to {}", self.describe());
        Ok(())
    }

    async fn fetch(&mut self, locator: &str) -> Result<String, DriverError> {
        let reg = parse_locator(locator)?;
        let mut mreq = ModbusRequest::new(self.slave_id, self.proto);
        let mut request = Vec::new();

        match reg.register_type {
            RegisterType::Holding => mreq.generate_get_holdings(reg.address, reg.count, &mut request),
            RegisterType::Input => mreq.generate_get_inputs(reg.address, reg.count, &mut request),
            RegisterType::Coil => mreq.generate_get_coils(reg.address, reg.count, &mut request),
        }
        .map_err(|e| modbus_error("Failed to build request", e))?;

        let response = self.transfer(&request).await?;

        if reg.register_type == RegisterType::Coil {
            let mut bits = Vec::new();
            mreq.parse_bool(&response, &mut bits)
                .map_err(|e| modbus_error(&format!("Bad response for {locator}"), e))?;
            return Ok(bits.iter().take(reg.count as usize).map(|b| if *b { '1' } else { '0' }).collect());
        }

        let mut data = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| modbus_error(&format!("Bad response for {locator}"), e))?;
        decode_registers(&data, reg.format)
    }

    async fn send(&mut self, locator: &str, value: &str) -> Result<(), DriverError> {
        let reg = parse_locator(locator)?;
        let mut mreq = ModbusRequest::new(self.slave_id, self.proto);
        let mut request = Vec::new();

        match reg.register_type {
            RegisterType::Coil => {
                let on = !matches!(value.trim(), "0" | "off" | "false");
                mreq.generate_set_coil(reg.address, on, &mut request)
            }
            RegisterType::Holding => {
                let words = encode_registers(value, &reg)?;
                if words.len() == 1 {
                    mreq.generate_set_holding(reg.address, words[0], &mut request)
                } else {
                    mreq.generate_set_holdings_bulk(reg.address, &words, &mut request)
                }
            }
            RegisterType::Input => {
                return Err(DriverError::BadValue(format!("input register {locator} is read only")));
            }
        }
        .map_err(|e| modbus_error("Failed to build request", e))?;

        let response = self.transfer(&request).await?;
        mreq.parse_ok(&response)
            .map_err(|e| modbus_error(&format!("Write to {locator} rejected"), e))
    }

    fn describe(&self) -> String {
        let framing = match self.proto {
            ModbusProto::TcpUdp => "tcp",
            _ => "rtu over tcp",
        };
        format!("modbus {framing} {}:{} unit {}", self.host, self.port, self.slave_id)
    }
}
