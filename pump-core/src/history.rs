//! History-log records and the extractors that turn them into typed events.
//!
//! Only CGM readings, bolus deliveries and basal deliveries are interpreted; every other
//! event type is skipped. Zero-magnitude deliveries are not events.

use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::decoder::{pump_time_to_unix, DecodeError};

/// `eventTypeId(u16) pumpTime(u32) seq(u32) data(16)`.
pub const RECORD_LEN: usize = 26;
pub const RECORD_DATA_LEN: usize = 16;

pub mod event_id {
    pub const CGM_READING: u16 = 256;
    pub const BASAL_DELIVERY: u16 = 279;
    pub const BOLUS_DELIVERY: u16 = 280;
}

/// Basal sources driven by the closed-loop algorithm (algorithm, temp rate + algorithm).
const AUTOMATED_BASAL_SOURCES: [u16; 2] = [3, 4];

/// Bolus sources driven by the closed-loop algorithm.
const AUTOMATED_BOLUS_SOURCES: [u8; 2] = [7, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryLogRecord {
    pub event_type_id: u16,
    pub pump_time: u32,
    /// The event's own sequence number. Unrelated to the log index it was fetched from.
    pub sequence: u32,
    pub data: [u8; RECORD_DATA_LEN],
}

impl HistoryLogRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != RECORD_LEN {
            return Err(DecodeError::Length {
                message: "history record",
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let mut buf = bytes;
        let event_type_id = buf.get_u16_le();
        let pump_time = buf.get_u32_le();
        let sequence = buf.get_u32_le();
        let mut data = [0u8; RECORD_DATA_LEN];
        buf.copy_to_slice(&mut data);
        Ok(Self {
            event_type_id,
            pump_time,
            sequence,
            data,
        })
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.event_type_id);
        buf.put_u32_le(self.pump_time);
        buf.put_u32_le(self.sequence);
        buf.put_slice(&self.data);
        out
    }

    pub fn timestamp(&self) -> u64 {
        pump_time_to_unix(self.pump_time)
    }

    fn data_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.data[at], self.data[at + 1]])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgmHistoryReading {
    pub sequence: u32,
    pub timestamp: u64,
    pub glucose_mg_dl: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BolusEvent {
    pub sequence: u32,
    pub timestamp: u64,
    pub bolus_id: u16,
    pub delivered_units: f64,
    pub source: u8,
    pub is_automated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalEvent {
    pub sequence: u32,
    pub timestamp: u64,
    pub rate_units_per_hour: f64,
    pub profile_rate_units_per_hour: f64,
    pub source: u16,
    pub is_automated: bool,
}

/// Glucose at data offset 6; zero means the sensor had no reading.
pub fn cgm_reading(record: &HistoryLogRecord) -> Option<CgmHistoryReading> {
    if record.event_type_id != event_id::CGM_READING {
        return None;
    }
    let glucose = record.data_u16(6);
    if glucose == 0 {
        return None;
    }
    Some(CgmHistoryReading {
        sequence: record.sequence,
        timestamp: record.timestamp(),
        glucose_mg_dl: glucose,
    })
}

/// `bolusId(u16) @0`, `source(u8) @4`, `deliveredTotal(u16 mU) @14`.
pub fn bolus_event(record: &HistoryLogRecord) -> Option<BolusEvent> {
    if record.event_type_id != event_id::BOLUS_DELIVERY {
        return None;
    }
    let delivered = record.data_u16(14);
    if delivered == 0 {
        return None;
    }
    let source = record.data[4];
    Some(BolusEvent {
        sequence: record.sequence,
        timestamp: record.timestamp(),
        bolus_id: record.data_u16(0),
        delivered_units: delivered as f64 / 1000.0,
        source,
        is_automated: AUTOMATED_BOLUS_SOURCES.contains(&source),
    })
}

/// `source(u16) @0`, `profileRate(u16 mU/h) @4`, `commandedRate(u16 mU/h) @6`.
pub fn basal_event(record: &HistoryLogRecord) -> Option<BasalEvent> {
    if record.event_type_id != event_id::BASAL_DELIVERY {
        return None;
    }
    let commanded = record.data_u16(6);
    if commanded == 0 {
        return None;
    }
    let source = record.data_u16(0);
    Some(BasalEvent {
        sequence: record.sequence,
        timestamp: record.timestamp(),
        rate_units_per_hour: commanded as f64 / 1000.0,
        profile_rate_units_per_hour: record.data_u16(4) as f64 / 1000.0,
        source,
        is_automated: AUTOMATED_BASAL_SOURCES.contains(&source),
    })
}

/// Any interpreted event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    Cgm(CgmHistoryReading),
    Bolus(BolusEvent),
    Basal(BasalEvent),
}

impl HistoryEvent {
    pub fn from_record(record: &HistoryLogRecord) -> Option<Self> {
        match record.event_type_id {
            event_id::CGM_READING => cgm_reading(record).map(HistoryEvent::Cgm),
            event_id::BOLUS_DELIVERY => bolus_event(record).map(HistoryEvent::Bolus),
            event_id::BASAL_DELIVERY => basal_event(record).map(HistoryEvent::Basal),
            _ => None,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            HistoryEvent::Cgm(e) => e.sequence,
            HistoryEvent::Bolus(e) => e.sequence,
            HistoryEvent::Basal(e) => e.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_type_id: u16, data: [u8; 16]) -> HistoryLogRecord {
        HistoryLogRecord {
            event_type_id,
            pump_time: 100,
            sequence: 42,
            data,
        }
    }

    fn bolus_data(source: u8, delivered: u16) -> [u8; 16] {
        let mut d = [0u8; 16];
        d[0..2].copy_from_slice(&9u16.to_le_bytes());
        d[4] = source;
        d[14..16].copy_from_slice(&delivered.to_le_bytes());
        d
    }

    fn basal_data(source: u16, commanded: u16) -> [u8; 16] {
        let mut d = [0u8; 16];
        d[0..2].copy_from_slice(&source.to_le_bytes());
        d[4..6].copy_from_slice(&700u16.to_le_bytes());
        d[6..8].copy_from_slice(&commanded.to_le_bytes());
        d
    }

    #[test]
    fn record_layout() {
        let r = record(280, bolus_data(1, 2000));
        let bytes = r.to_bytes();
        assert_eq!(&bytes[..2], &280u16.to_le_bytes());
        assert_eq!(&bytes[6..10], &42u32.to_le_bytes());
        assert_eq!(HistoryLogRecord::parse(&bytes).unwrap(), r);
        assert!(HistoryLogRecord::parse(&bytes[..25]).is_err());
    }

    #[test]
    fn bolus_classification() {
        let manual = bolus_event(&record(280, bolus_data(1, 2500))).unwrap();
        assert_eq!(manual.delivered_units, 2.5);
        assert_eq!(manual.bolus_id, 9);
        assert!(!manual.is_automated);
        assert!(bolus_event(&record(280, bolus_data(7, 300))).unwrap().is_automated);
        assert!(bolus_event(&record(280, bolus_data(8, 300))).unwrap().is_automated);
    }

    #[test]
    fn zero_delivery_is_not_an_event() {
        assert_eq!(bolus_event(&record(280, bolus_data(1, 0))), None);
        assert_eq!(basal_event(&record(279, basal_data(3, 0))), None);
    }

    #[test]
    fn basal_classification() {
        let auto = basal_event(&record(279, basal_data(3, 1500))).unwrap();
        assert!(auto.is_automated);
        assert_eq!(auto.rate_units_per_hour, 1.5);
        assert_eq!(auto.profile_rate_units_per_hour, 0.7);
        assert!(basal_event(&record(279, basal_data(4, 1))).unwrap().is_automated);
        assert!(!basal_event(&record(279, basal_data(1, 1))).unwrap().is_automated);
    }

    #[test]
    fn cgm_reading_extracted() {
        let mut d = [0u8; 16];
        d[6..8].copy_from_slice(&118u16.to_le_bytes());
        let r = cgm_reading(&record(256, d)).unwrap();
        assert_eq!(r.glucose_mg_dl, 118);
        assert_eq!(r.timestamp, pump_time_to_unix(100));
        assert_eq!(cgm_reading(&record(256, [0; 16])), None);
    }

    #[test]
    fn unknown_type_yields_nothing() {
        let r = record(999, bolus_data(1, 2500));
        assert_eq!(cgm_reading(&r), None);
        assert_eq!(bolus_event(&r), None);
        assert_eq!(basal_event(&r), None);
        assert_eq!(HistoryEvent::from_record(&r), None);
        // Extractors check the type, not just the layout.
        assert_eq!(bolus_event(&record(279, bolus_data(1, 2500))), None);
    }
}
