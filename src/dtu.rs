use crate::config::DeviceAddress;
use crate::protocol::{
    self, FieldReader, FieldValue, FrameError, CMD_APP_INFO_DATA, CMD_REAL_DATA_NEW,
    FRAME_HEADER_LEN, REQUEST_TIME_OFFSET,
};
use async_trait::async_trait;
use chrono::Local;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

//bit in the DTU feature flags (dfs) telling that the device requires encryption
pub const DFS_ENCRYPTION_BIT: u32 = 25;

// protobuf field numbers of the messages we exchange with the DTU
mod field {
    //request (app info and real data share the layout)
    pub const REQ_TIME_YMD_HMS: u32 = 1;
    pub const REQ_OFFSET: u32 = 2;
    pub const REQ_TIME: u32 = 3;

    //app info response
    pub const APP_INFO_DTU_SERIAL: u32 = 1;
    pub const APP_INFO_DTU_INFO: u32 = 6;
    pub const DTU_INFO_DFS: u32 = 13;
    pub const DTU_INFO_ENC_RAND: u32 = 14;

    //real data response
    pub const REAL_DATA_SGS: u32 = 9;
    pub const REAL_DATA_PV: u32 = 11;

    //inverter (SGS) record
    pub const SGS_SERIAL_NUMBER: u32 = 1;
    pub const SGS_VOLTAGE: u32 = 3;
    pub const SGS_FREQUENCY: u32 = 4;
    pub const SGS_ACTIVE_POWER: u32 = 5;
    pub const SGS_CURRENT: u32 = 7;
    pub const SGS_POWER_FACTOR: u32 = 8;
    pub const SGS_TEMPERATURE: u32 = 9;

    //panel (PV) record
    pub const PV_SERIAL_NUMBER: u32 = 1;
    pub const PV_PORT_NUMBER: u32 = 2;
    pub const PV_VOLTAGE: u32 = 3;
    pub const PV_CURRENT: u32 = 4;
    pub const PV_POWER: u32 = 5;
    pub const PV_ENERGY_TOTAL: u32 = 6;
    pub const PV_ENERGY_DAILY: u32 = 7;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    #[error("encrypted DTU payloads are not supported")]
    EncryptionUnsupported,
}

/// Device information returned by the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial_number: Option<String>,
    pub dfs: Option<u64>,
    pub enc_rand: Option<Vec<u8>>,
}

impl DeviceInfo {
    pub fn is_encrypted(&self) -> bool {
        self.dfs
            .map(|dfs| (dfs >> DFS_ENCRYPTION_BIT) & 1 == 1)
            .unwrap_or(false)
    }
}

/// Inverter-level record, every field may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SgsRecord {
    pub serial_number: Option<String>,
    pub voltage: Option<i64>,
    pub frequency: Option<i64>,
    pub active_power: Option<i64>,
    pub current: Option<i64>,
    pub power_factor: Option<i64>,
    pub temperature: Option<i64>,
}

/// Per-panel (PV port) record, every field may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PvRecord {
    pub serial_number: Option<String>,
    pub port_number: Option<String>,
    pub voltage: Option<i64>,
    pub current: Option<i64>,
    pub power: Option<i64>,
    pub energy_total: Option<i64>,
    pub energy_daily: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawReading {
    pub sgs_data: Vec<SgsRecord>,
    pub pv_data: Vec<PvRecord>,
}

/// A connection to a single DTU. Implementations own the request sequence counter.
#[async_trait]
pub trait DtuClient: Send {
    /// Queries device information; `Ok(None)` when the device answered without a payload.
    async fn handshake(&mut self, limit: Duration) -> Result<Option<DeviceInfo>, TransportError>;

    /// Fetches current readings; `Ok(None)` when the device rejected the request silently.
    async fn fetch_real_data(&mut self, limit: Duration) -> Result<Option<RawReading>, TransportError>;

    fn set_encryption(&mut self, encrypted: bool, key: &[u8]);
}

/// Creates a fresh client (with a fresh sequence counter) for every new session.
pub trait DtuConnector: Send + Sync {
    type Client: DtuClient;

    fn connect(&self, address: &DeviceAddress) -> Self::Client;
}

pub struct TcpConnector;

impl DtuConnector for TcpConnector {
    type Client = TcpDtu;

    fn connect(&self, address: &DeviceAddress) -> TcpDtu {
        TcpDtu::new(address.host.clone(), address.dtu_port)
    }
}

pub struct TcpDtu {
    host: String,
    port: u16,
    sequence: u16,
    encrypted: bool,
}

impl TcpDtu {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            sequence: 0,
            encrypted: false,
        }
    }

    #[cfg(test)]
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    fn request_body() -> Vec<u8> {
        let now = Local::now();
        let mut body = vec![];
        protocol::put_bytes_field(
            &mut body,
            field::REQ_TIME_YMD_HMS,
            now.format("%Y-%m-%d %H:%M:%S").to_string().as_bytes(),
        );
        protocol::put_varint_field(&mut body, field::REQ_OFFSET, REQUEST_TIME_OFFSET);
        protocol::put_varint_field(&mut body, field::REQ_TIME, now.timestamp().max(0) as u64);
        body
    }

    async fn exchange(addr: &str, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request).await?;

        let mut frame = vec![0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut frame).await?;
        let total = protocol::frame_length(&frame)?;
        frame.resize(total, 0);
        stream.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
        Ok(frame)
    }

    async fn send_request(
        &mut self,
        command: [u8; 2],
        limit: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.sequence = self.sequence.wrapping_add(1);
        let request = protocol::encode_frame(command, self.sequence, &TcpDtu::request_body());
        let addr = format!("{}:{}", self.host, self.port);
        debug!(
            "dtu: sending cmd={:02X?} seq={} data={:02X?}",
            command, self.sequence, request
        );

        let data = match timeout(limit, TcpDtu::exchange(&addr, &request)).await {
            Ok(res) => res?,
            Err(_) => return Err(TransportError::Timeout(limit)),
        };
        let frame = protocol::decode_frame(&data)?;
        debug!("dtu: received {:?}", frame);
        if frame.payload.is_empty() {
            Ok(None)
        } else {
            Ok(Some(frame.payload))
        }
    }
}

#[async_trait]
impl DtuClient for TcpDtu {
    async fn handshake(&mut self, limit: Duration) -> Result<Option<DeviceInfo>, TransportError> {
        match self.send_request(CMD_APP_INFO_DATA, limit).await? {
            Some(body) => Ok(parse_app_info(&body)?),
            None => Ok(None),
        }
    }

    async fn fetch_real_data(&mut self, limit: Duration) -> Result<Option<RawReading>, TransportError> {
        if self.encrypted {
            return Err(TransportError::EncryptionUnsupported);
        }
        match self.send_request(CMD_REAL_DATA_NEW, limit).await? {
            Some(body) => Ok(Some(parse_real_data(&body)?)),
            None => Ok(None),
        }
    }

    fn set_encryption(&mut self, encrypted: bool, key: &[u8]) {
        debug!(
            "dtu: encryption: {}, key length: {}",
            encrypted,
            key.len()
        );
        self.encrypted = encrypted;
    }
}

// serial numbers travel as int64; zero is the protobuf default and means "absent"
fn serial_from(value: &FieldValue) -> Option<String> {
    match value.as_i64() {
        Some(0) | None => None,
        Some(sn) => Some(sn.to_string()),
    }
}

/// Decodes an app info response; `None` if it carries no DTU info block.
pub fn parse_app_info(body: &[u8]) -> Result<Option<DeviceInfo>, FrameError> {
    let mut serial_number = None;
    let mut dtu_info = None;
    for item in FieldReader::new(body) {
        let (number, value) = item?;
        match number {
            field::APP_INFO_DTU_SERIAL => {
                serial_number = value
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .filter(|s| !s.is_empty());
            }
            field::APP_INFO_DTU_INFO => dtu_info = value.as_bytes(),
            _ => {}
        }
    }

    let dtu_info = match dtu_info {
        Some(b) => b,
        None => return Ok(None),
    };
    let mut info = DeviceInfo {
        serial_number,
        ..DeviceInfo::default()
    };
    for item in FieldReader::new(dtu_info) {
        let (number, value) = item?;
        match (number, value) {
            (field::DTU_INFO_DFS, FieldValue::Varint(v)) => info.dfs = Some(v),
            (field::DTU_INFO_ENC_RAND, FieldValue::Bytes(b)) => info.enc_rand = Some(b.to_vec()),
            _ => {}
        }
    }
    Ok(Some(info))
}

fn parse_sgs(body: &[u8]) -> Result<SgsRecord, FrameError> {
    let mut rec = SgsRecord::default();
    for item in FieldReader::new(body) {
        let (number, value) = item?;
        match number {
            field::SGS_SERIAL_NUMBER => rec.serial_number = serial_from(&value),
            field::SGS_VOLTAGE => rec.voltage = value.as_i64(),
            field::SGS_FREQUENCY => rec.frequency = value.as_i64(),
            field::SGS_ACTIVE_POWER => rec.active_power = value.as_i64(),
            field::SGS_CURRENT => rec.current = value.as_i64(),
            field::SGS_POWER_FACTOR => rec.power_factor = value.as_i64(),
            field::SGS_TEMPERATURE => rec.temperature = value.as_i64(),
            _ => {}
        }
    }
    Ok(rec)
}

fn parse_pv(body: &[u8]) -> Result<PvRecord, FrameError> {
    let mut rec = PvRecord::default();
    for item in FieldReader::new(body) {
        let (number, value) = item?;
        match number {
            field::PV_SERIAL_NUMBER => rec.serial_number = serial_from(&value),
            field::PV_PORT_NUMBER => rec.port_number = value.as_i64().map(|p| p.to_string()),
            field::PV_VOLTAGE => rec.voltage = value.as_i64(),
            field::PV_CURRENT => rec.current = value.as_i64(),
            field::PV_POWER => rec.power = value.as_i64(),
            field::PV_ENERGY_TOTAL => rec.energy_total = value.as_i64(),
            field::PV_ENERGY_DAILY => rec.energy_daily = value.as_i64(),
            _ => {}
        }
    }
    Ok(rec)
}

pub fn parse_real_data(body: &[u8]) -> Result<RawReading, FrameError> {
    let mut reading = RawReading::default();
    for item in FieldReader::new(body) {
        let (number, value) = item?;
        match (number, value) {
            (field::REAL_DATA_SGS, FieldValue::Bytes(b)) => reading.sgs_data.push(parse_sgs(b)?),
            (field::REAL_DATA_PV, FieldValue::Bytes(b)) => reading.pv_data.push(parse_pv(b)?),
            _ => {}
        }
    }
    Ok(reading)
}
