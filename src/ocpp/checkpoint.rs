//! Persistent checkpoint (C7): survives power loss without leaking an open
//! transaction. Grounded on `examples/original_source/include/ocpp_checkpoint.h`
//! and `config.h`'s `ocpp.checkpoint: u8[16]` field; byte layout fixed
//! explicitly here rather than relying on compiler struct packing (spec §9
//! redesign flag on C structs-as-wire-format).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// One connector's durable state: 8 bytes, `transaction_id: u32 LE`,
/// `unavailable: u8`, 3 bytes padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorCheckpoint {
    pub transaction_id: u32,
    pub unavailable: bool,
}

pub const CONNECTOR_CHECKPOINT_LEN: usize = 8;
/// Charger-level header: `unavailable: u8`, `fw_updated: u8`, 6 bytes padding.
pub const CHARGER_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint buffer too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
}

impl ConnectorCheckpoint {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.transaction_id).expect("vec write never fails");
        out.write_u8(self.unavailable as u8).expect("vec write never fails");
        out.extend_from_slice(&[0u8; 3]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CheckpointError> {
        if buf.len() < CONNECTOR_CHECKPOINT_LEN {
            return Err(CheckpointError::TooShort { need: CONNECTOR_CHECKPOINT_LEN, got: buf.len() });
        }
        let mut cursor = Cursor::new(buf);
        let transaction_id = cursor.read_u32::<LittleEndian>().unwrap();
        let unavailable = cursor.read_u8().unwrap() != 0;
        Ok(Self { transaction_id, unavailable })
    }
}

/// Charger-level checkpoint, persisted as `8 + 8 * connector_count` bytes.
/// A single-connector deployment persists 16 bytes total, matching the
/// original firmware's `ocpp_checkpoint` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargerCheckpoint {
    pub unavailable: bool,
    pub fw_updated: bool,
    pub connectors: Vec<ConnectorCheckpoint>,
}

impl ChargerCheckpoint {
    pub fn new(connector_count: usize) -> Self {
        Self {
            unavailable: false,
            fw_updated: false,
            connectors: vec![ConnectorCheckpoint::default(); connector_count],
        }
    }

    pub fn encoded_len(&self) -> usize {
        CHARGER_HEADER_LEN + CONNECTOR_CHECKPOINT_LEN * self.connectors.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.unavailable as u8);
        out.push(self.fw_updated as u8);
        out.extend_from_slice(&[0u8; 6]);
        for connector in &self.connectors {
            connector.encode(&mut out);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CheckpointError> {
        if buf.len() < CHARGER_HEADER_LEN {
            return Err(CheckpointError::TooShort { need: CHARGER_HEADER_LEN, got: buf.len() });
        }
        let unavailable = buf[0] != 0;
        let fw_updated = buf[1] != 0;

        let remainder = &buf[CHARGER_HEADER_LEN..];
        if remainder.len() % CONNECTOR_CHECKPOINT_LEN != 0 {
            return Err(CheckpointError::TooShort {
                need: CHARGER_HEADER_LEN + CONNECTOR_CHECKPOINT_LEN,
                got: buf.len(),
            });
        }

        let mut connectors = Vec::with_capacity(remainder.len() / CONNECTOR_CHECKPOINT_LEN);
        for chunk in remainder.chunks_exact(CONNECTOR_CHECKPOINT_LEN) {
            connectors.push(ConnectorCheckpoint::decode(chunk)?);
        }

        Ok(Self { unavailable, fw_updated, connectors })
    }

    pub fn connector(&self, index: usize) -> Option<&ConnectorCheckpoint> {
        self.connectors.get(index)
    }

    pub fn connector_mut(&mut self, index: usize) -> Option<&mut ConnectorCheckpoint> {
        self.connectors.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_connector_round_trips_to_sixteen_bytes() {
        let mut cp = ChargerCheckpoint::new(1);
        cp.connector_mut(0).unwrap().transaction_id = 7;
        cp.connector_mut(0).unwrap().unavailable = true;

        let bytes = cp.encode();
        assert_eq!(bytes.len(), 16);

        let decoded = ChargerCheckpoint::decode(&bytes).unwrap();
        assert_eq!(decoded, cp);
    }

    #[test]
    fn default_checkpoint_has_no_open_transaction() {
        let cp = ChargerCheckpoint::new(2);
        assert_eq!(cp.encoded_len(), 8 + 16);
        assert!(cp.connectors.iter().all(|c| c.transaction_id == 0 && !c.unavailable));
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let err = ChargerCheckpoint::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, CheckpointError::TooShort { .. }));
    }

    proptest! {
        #[test]
        fn round_trip_preserves_all_fields(
            unavailable in any::<bool>(),
            fw_updated in any::<bool>(),
            tid in any::<u32>(),
            conn_unavailable in any::<bool>(),
        ) {
            let mut cp = ChargerCheckpoint::new(1);
            cp.unavailable = unavailable;
            cp.fw_updated = fw_updated;
            cp.connector_mut(0).unwrap().transaction_id = tid;
            cp.connector_mut(0).unwrap().unavailable = conn_unavailable;

            let decoded = ChargerCheckpoint::decode(&cp.encode()).unwrap();
            prop_assert_eq!(decoded, cp);
        }
    }
}
