//! Persisted on-device configuration record (§6): the NVS-backed
//! `struct config` layout, reproduced byte-for-byte. Grounded on
//! `examples/original_source/include/config.h`, which `static_assert`s the
//! whole record at 1095 bytes — reproduced here field-for-field with
//! explicit little-endian encode/decode rather than relying on any Rust
//! struct layout guarantee (spec §9 redesign flag on C structs-as-wire).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::ocpp::checkpoint::{ChargerCheckpoint, CheckpointError};

pub const DEVICE_ID_LEN: usize = 24;
pub const DEVICE_NAME_LEN: usize = 32;
pub const CHARGER_MODE_LEN: usize = 8;
pub const CHARGER_PARAM_LEN: usize = 16;
pub const CONNECTOR_METERING_LEN: usize = 16;
pub const CONNECTOR_PILOT_LEN: usize = 30;
pub const CONNECTOR_PLC_MAC_LEN: usize = 6;
pub const NET_MAC_LEN: usize = 6;
pub const NET_SERVER_URL_LEN: usize = 256;
pub const NET_SERVER_ID_LEN: usize = 32;
pub const NET_SERVER_PASS_LEN: usize = 40;
pub const OCPP_CONFIG_LEN: usize = 546;
pub const OCPP_VENDOR_LEN: usize = 21;
pub const OCPP_MODEL_LEN: usize = 21;

/// For a single-connector deployment: header(64) + charger(77) + net(342) +
/// ocpp(608) + crc(4) = 1095, matching the original firmware exactly.
pub const RECORD_LEN_SINGLE_CONNECTOR: usize = 1095;

#[derive(Debug, Error)]
pub enum DeviceConfigError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("string field exceeds its fixed-width slot")]
    StringTooLong,
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, len: usize) -> Result<(), DeviceConfigError> {
    let bytes = s.as_bytes();
    if bytes.len() >= len {
        return Err(DeviceConfigError::StringTooLong);
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (len - bytes.len()), 0);
    Ok(())
}

fn read_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfigRecord {
    pub metering: [u8; CONNECTOR_METERING_LEN],
    pub pilot: [u8; CONNECTOR_PILOT_LEN],
    pub plc_mac: [u8; CONNECTOR_PLC_MAC_LEN],
}

impl Default for ConnectorConfigRecord {
    fn default() -> Self {
        Self {
            metering: [0; CONNECTOR_METERING_LEN],
            pilot: [0; CONNECTOR_PILOT_LEN],
            plc_mac: [0; CONNECTOR_PLC_MAC_LEN],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargerConfigRecord {
    pub mode: String,
    pub param: [u8; CHARGER_PARAM_LEN],
    pub connectors: Vec<ConnectorConfigRecord>,
}

impl Default for ChargerConfigRecord {
    fn default() -> Self {
        Self { mode: String::new(), param: [0; CHARGER_PARAM_LEN], connectors: vec![ConnectorConfigRecord::default()] }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfigRecord {
    pub mac: [u8; NET_MAC_LEN],
    pub health_check_interval_ms: u32,
    pub ping_interval_ms: u32,
    pub server_url: String,
    pub server_id: String,
    pub server_pass: String,
}

impl Default for NetConfigRecord {
    fn default() -> Self {
        Self {
            mac: [0; NET_MAC_LEN],
            health_check_interval_ms: 30_000,
            ping_interval_ms: 10_000,
            server_url: String::new(),
            server_id: String::new(),
            server_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcppConfigRecord {
    pub version: u32,
    pub config: [u8; OCPP_CONFIG_LEN],
    pub checkpoint: ChargerCheckpoint,
    pub vendor: String,
    pub model: String,
}

impl OcppConfigRecord {
    pub fn new(connector_count: usize) -> Self {
        Self {
            version: 1,
            config: [0; OCPP_CONFIG_LEN],
            checkpoint: ChargerCheckpoint::new(connector_count),
            vendor: String::new(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub version: u32,
    pub device_id: String,
    pub device_name: String,
    pub device_mode: u8,
    pub log_mode: u8,
    pub log_level: u8,
    pub dfu_reboot_manually: bool,
    pub charger: ChargerConfigRecord,
    pub net: NetConfigRecord,
    pub ocpp: OcppConfigRecord,
}

impl DeviceConfig {
    pub fn new(connector_count: usize) -> Self {
        Self {
            version: 1,
            device_id: String::new(),
            device_name: String::new(),
            device_mode: 0,
            log_mode: 0,
            log_level: 0,
            dfu_reboot_manually: false,
            charger: ChargerConfigRecord { connectors: vec![ConnectorConfigRecord::default(); connector_count], ..ChargerConfigRecord::default() },
            net: NetConfigRecord::default(),
            ocpp: OcppConfigRecord::new(connector_count),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DeviceConfigError> {
        let mut out = Vec::with_capacity(RECORD_LEN_SINGLE_CONNECTOR);

        out.write_u32::<LittleEndian>(self.version).unwrap();
        write_fixed_str(&mut out, &self.device_id, DEVICE_ID_LEN)?;
        write_fixed_str(&mut out, &self.device_name, DEVICE_NAME_LEN)?;
        out.push(self.device_mode);
        out.push(self.log_mode);
        out.push(self.log_level);
        out.push(self.dfu_reboot_manually as u8);

        write_fixed_str(&mut out, &self.charger.mode, CHARGER_MODE_LEN)?;
        out.extend_from_slice(&self.charger.param);
        out.push(self.charger.connectors.len() as u8);
        for connector in &self.charger.connectors {
            out.extend_from_slice(&connector.metering);
            out.extend_from_slice(&connector.pilot);
            out.extend_from_slice(&connector.plc_mac);
        }

        out.extend_from_slice(&self.net.mac);
        out.write_u32::<LittleEndian>(self.net.health_check_interval_ms).unwrap();
        out.write_u32::<LittleEndian>(self.net.ping_interval_ms).unwrap();
        write_fixed_str(&mut out, &self.net.server_url, NET_SERVER_URL_LEN)?;
        write_fixed_str(&mut out, &self.net.server_id, NET_SERVER_ID_LEN)?;
        write_fixed_str(&mut out, &self.net.server_pass, NET_SERVER_PASS_LEN)?;

        out.write_u32::<LittleEndian>(self.ocpp.version).unwrap();
        out.extend_from_slice(&self.ocpp.config);
        out.extend_from_slice(&self.ocpp.checkpoint.encode());
        write_fixed_str(&mut out, &self.ocpp.vendor, OCPP_VENDOR_LEN)?;
        write_fixed_str(&mut out, &self.ocpp.model, OCPP_MODEL_LEN)?;

        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();

        Ok(out)
    }

    pub fn decode(buf: &[u8], connector_count: usize) -> Result<Self, DeviceConfigError> {
        let checkpoint_len = 8 + 8 * connector_count;
        let min_len = 4 + DEVICE_ID_LEN + DEVICE_NAME_LEN + 4
            + CHARGER_MODE_LEN + CHARGER_PARAM_LEN + 1 + connector_count * 52
            + NET_MAC_LEN + 8 + NET_SERVER_URL_LEN + NET_SERVER_ID_LEN + NET_SERVER_PASS_LEN
            + 4 + OCPP_CONFIG_LEN + checkpoint_len + OCPP_VENDOR_LEN + OCPP_MODEL_LEN
            + 4;
        if buf.len() < min_len {
            return Err(DeviceConfigError::TooShort { need: min_len, got: buf.len() });
        }

        let body = &buf[..buf.len() - 4];
        let stored_crc = (&buf[buf.len() - 4..]).read_u32::<LittleEndian>().unwrap();
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(DeviceConfigError::CrcMismatch { stored: stored_crc, computed: computed_crc });
        }

        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u32::<LittleEndian>().unwrap();
        let mut device_id_buf = [0u8; DEVICE_ID_LEN];
        cursor.read_exact(&mut device_id_buf).unwrap();
        let mut device_name_buf = [0u8; DEVICE_NAME_LEN];
        cursor.read_exact(&mut device_name_buf).unwrap();
        let device_mode = cursor.read_u8().unwrap();
        let log_mode = cursor.read_u8().unwrap();
        let log_level = cursor.read_u8().unwrap();
        let dfu_reboot_manually = cursor.read_u8().unwrap() != 0;

        let mut charger_mode_buf = [0u8; CHARGER_MODE_LEN];
        cursor.read_exact(&mut charger_mode_buf).unwrap();
        let mut charger_param = [0u8; CHARGER_PARAM_LEN];
        cursor.read_exact(&mut charger_param).unwrap();
        let declared_connector_count = cursor.read_u8().unwrap() as usize;

        let mut connectors = Vec::with_capacity(declared_connector_count);
        for _ in 0..declared_connector_count {
            let mut metering = [0u8; CONNECTOR_METERING_LEN];
            cursor.read_exact(&mut metering).unwrap();
            let mut pilot = [0u8; CONNECTOR_PILOT_LEN];
            cursor.read_exact(&mut pilot).unwrap();
            let mut plc_mac = [0u8; CONNECTOR_PLC_MAC_LEN];
            cursor.read_exact(&mut plc_mac).unwrap();
            connectors.push(ConnectorConfigRecord { metering, pilot, plc_mac });
        }

        let mut mac = [0u8; NET_MAC_LEN];
        cursor.read_exact(&mut mac).unwrap();
        let health_check_interval_ms = cursor.read_u32::<LittleEndian>().unwrap();
        let ping_interval_ms = cursor.read_u32::<LittleEndian>().unwrap();
        let mut server_url_buf = [0u8; NET_SERVER_URL_LEN];
        cursor.read_exact(&mut server_url_buf).unwrap();
        let mut server_id_buf = [0u8; NET_SERVER_ID_LEN];
        cursor.read_exact(&mut server_id_buf).unwrap();
        let mut server_pass_buf = [0u8; NET_SERVER_PASS_LEN];
        cursor.read_exact(&mut server_pass_buf).unwrap();

        let ocpp_version = cursor.read_u32::<LittleEndian>().unwrap();
        let mut ocpp_config = [0u8; OCPP_CONFIG_LEN];
        cursor.read_exact(&mut ocpp_config).unwrap();
        let mut checkpoint_buf = vec![0u8; checkpoint_len];
        cursor.read_exact(&mut checkpoint_buf).unwrap();
        let checkpoint = ChargerCheckpoint::decode(&checkpoint_buf)?;
        let mut vendor_buf = [0u8; OCPP_VENDOR_LEN];
        cursor.read_exact(&mut vendor_buf).unwrap();
        let mut model_buf = [0u8; OCPP_MODEL_LEN];
        cursor.read_exact(&mut model_buf).unwrap();

        Ok(Self {
            version,
            device_id: read_fixed_str(&device_id_buf),
            device_name: read_fixed_str(&device_name_buf),
            device_mode,
            log_mode,
            log_level,
            dfu_reboot_manually,
            charger: ChargerConfigRecord { mode: read_fixed_str(&charger_mode_buf), param: charger_param, connectors },
            net: NetConfigRecord {
                mac,
                health_check_interval_ms,
                ping_interval_ms,
                server_url: read_fixed_str(&server_url_buf),
                server_id: read_fixed_str(&server_id_buf),
                server_pass: read_fixed_str(&server_pass_buf),
            },
            ocpp: OcppConfigRecord {
                version: ocpp_version,
                config: ocpp_config,
                checkpoint,
                vendor: read_fixed_str(&vendor_buf),
                model: read_fixed_str(&model_buf),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_connector_record_is_1095_bytes() {
        let config = DeviceConfig::new(1);
        let bytes = config.encode().unwrap();
        assert_eq!(bytes.len(), RECORD_LEN_SINGLE_CONNECTOR);
    }

    #[test]
    fn round_trip_preserves_strings_and_checkpoint() {
        let mut config = DeviceConfig::new(1);
        config.device_id = "evse-0001".into();
        config.net.server_url = "wss://csms.example.com/ocpp".into();
        config.ocpp.checkpoint.connector_mut(0).unwrap().transaction_id = 99;

        let bytes = config.encode().unwrap();
        let decoded = DeviceConfig::decode(&bytes, 1).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn decode_rejects_corrupted_crc() {
        let config = DeviceConfig::new(1);
        let mut bytes = config.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(DeviceConfig::decode(&bytes, 1), Err(DeviceConfigError::CrcMismatch { .. })));
    }

    #[test]
    fn string_exceeding_slot_is_rejected() {
        let mut config = DeviceConfig::new(1);
        config.device_id = "x".repeat(DEVICE_ID_LEN);
        assert!(matches!(config.encode(), Err(DeviceConfigError::StringTooLong)));
    }
}
