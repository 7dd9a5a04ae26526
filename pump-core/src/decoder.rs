//! Status-response decoders: one pure function per response shape.
//!
//! All layouts are little-endian and fixed-length; a cargo of the wrong length or with an
//! out-of-range enum byte is rejected whole. Insulin amounts arrive in milliunits except the
//! reservoir, which reports whole units.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Buf;
use serde::Serialize;

use crate::history::{HistoryLogRecord, RECORD_LEN};
use crate::scheduler::HistoryRange;

/// Pump clocks count seconds from 2008-01-01T00:00:00Z.
pub const PUMP_EPOCH_UNIX_SECS: u64 = 1_199_145_600;

pub const IOB_LEN: usize = 17;
pub const BASAL_LEN: usize = 9;
pub const BATTERY_V1_LEN: usize = 2;
pub const BATTERY_V2_LEN: usize = 11;
pub const RESERVOIR_LEN: usize = 4;
pub const CGM_EGV_LEN: usize = 8;
pub const HOME_SCREEN_MIRROR_LEN: usize = 9;
pub const LAST_BOLUS_LEN: usize = 15;
pub const PUMP_SETTINGS_LEN: usize = 10;
pub const PUMP_VERSION_LEN: usize = 48;
pub const PUMP_FEATURES_LEN: usize = 8;
pub const HISTORY_LOG_STATUS_LEN: usize = 12;
pub const HISTORY_LOG_ACK_LEN: usize = 2;
const STREAM_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{message}: expected {expected} bytes, got {actual}")]
    Length {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{field}: invalid value {value}")]
    InvalidEnum { field: &'static str, value: u8 },
    #[error("inconsistent response: {0}")]
    Inconsistent(&'static str),
}

fn exact<'a>(message: &'static str, cargo: &'a [u8], expected: usize) -> Result<&'a [u8], DecodeError> {
    if cargo.len() != expected {
        return Err(DecodeError::Length {
            message,
            expected,
            actual: cargo.len(),
        });
    }
    Ok(cargo)
}

fn flag(field: &'static str, value: u8) -> Result<bool, DecodeError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(DecodeError::InvalidEnum { field, value }),
    }
}

fn milliunits(raw: i64) -> f64 {
    raw as f64 / 1000.0
}

pub fn pump_time_to_unix(pump_time: u32) -> u64 {
    PUMP_EPOCH_UNIX_SECS + pump_time as u64
}

pub fn pump_time_to_system(pump_time: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(pump_time_to_unix(pump_time))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IobType {
    Mudaliar,
    Swan,
}

/// Insulin on board, surfacing whichever model the pump says is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IobReading {
    pub iob_units: f64,
    pub time_remaining_secs: i32,
    pub total_iob_units: f64,
    pub iob_type: IobType,
    /// Unix seconds the response was received; the cargo has no pump time.
    pub timestamp: u64,
}

/// `mudaliarIoB(i32) timeRemaining(i32) totalIoB(i32) swan6hrIoB(i32) iobType(u8)`.
pub fn decode_iob(cargo: &[u8], received_at: u64) -> Result<IobReading, DecodeError> {
    let mut buf = exact("iob", cargo, IOB_LEN)?;
    let mudaliar = buf.get_i32_le();
    let time_remaining_secs = buf.get_i32_le();
    let total = buf.get_i32_le();
    let swan = buf.get_i32_le();
    let iob_type = match buf.get_u8() {
        0 => IobType::Mudaliar,
        1 => IobType::Swan,
        value => return Err(DecodeError::InvalidEnum { field: "iob type", value }),
    };
    let selected = match iob_type {
        IobType::Mudaliar => mudaliar,
        IobType::Swan => swan,
    };
    Ok(IobReading {
        iob_units: milliunits(selected as i64),
        time_remaining_secs,
        total_iob_units: milliunits(total as i64),
        iob_type,
        timestamp: received_at,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalRate {
    pub profile_rate_units_per_hour: f64,
    pub current_rate_units_per_hour: f64,
    pub is_automated: bool,
    pub timestamp: u64,
}

/// `profileRate(i32 mU/h) currentRate(i32 mU/h) modified(u8)`.
pub fn decode_basal(cargo: &[u8], received_at: u64) -> Result<BasalRate, DecodeError> {
    let mut buf = exact("basal", cargo, BASAL_LEN)?;
    let profile = buf.get_i32_le();
    let current = buf.get_i32_le();
    let is_automated = flag("basal modified", buf.get_u8())?;
    Ok(BasalRate {
        profile_rate_units_per_hour: milliunits(profile as i64),
        current_rate_units_per_hour: milliunits(current as i64),
        is_automated,
        timestamp: received_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryReport {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatteryStatus {
    pub percent: u8,
    /// Raw charge estimate alongside the displayed percentage.
    pub abc: u8,
    /// Only V2 reports charging.
    pub charging: Option<bool>,
    pub report: BatteryReport,
    pub timestamp: u64,
}

pub fn decode_battery_v1(cargo: &[u8], received_at: u64) -> Result<BatteryStatus, DecodeError> {
    let mut buf = exact("battery v1", cargo, BATTERY_V1_LEN)?;
    let abc = buf.get_u8();
    let ibc = buf.get_u8();
    Ok(BatteryStatus {
        percent: ibc.min(100),
        abc,
        charging: None,
        report: BatteryReport::V1,
        timestamp: received_at,
    })
}

/// `abc(u8) ibc(u8) charging(u8) reserved(8)`.
pub fn decode_battery_v2(cargo: &[u8], received_at: u64) -> Result<BatteryStatus, DecodeError> {
    let mut buf = exact("battery v2", cargo, BATTERY_V2_LEN)?;
    let abc = buf.get_u8();
    let ibc = buf.get_u8();
    let charging = flag("battery charging", buf.get_u8())?;
    Ok(BatteryStatus {
        percent: ibc.min(100),
        abc,
        charging: Some(charging),
        report: BatteryReport::V2,
        timestamp: received_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservoirLevel {
    /// Whole units as reported; never scaled.
    pub units_remaining: u16,
    pub is_estimate: bool,
    pub low_threshold_units: u8,
    pub timestamp: u64,
}

pub fn decode_reservoir(cargo: &[u8], received_at: u64) -> Result<ReservoirLevel, DecodeError> {
    let mut buf = exact("insulin status", cargo, RESERVOIR_LEN)?;
    let units_remaining = buf.get_u16_le();
    let is_estimate = flag("reservoir estimate", buf.get_u8())?;
    let low_threshold_units = buf.get_u8();
    Ok(ReservoirLevel {
        units_remaining,
        is_estimate,
        low_threshold_units,
        timestamp: received_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EgvStatus {
    Invalid,
    Valid,
    Low,
    High,
    Unavailable,
}

impl EgvStatus {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => EgvStatus::Invalid,
            1 => EgvStatus::Valid,
            2 => EgvStatus::Low,
            3 => EgvStatus::High,
            4 => EgvStatus::Unavailable,
            value => return Err(DecodeError::InvalidEnum { field: "egv status", value }),
        })
    }

    /// Whether the glucose field carries a usable value.
    pub fn has_value(self) -> bool {
        matches!(self, EgvStatus::Valid | EgvStatus::Low | EgvStatus::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendArrow {
    Unknown,
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgmEgv {
    pub pump_time: u32,
    pub glucose_mg_dl: u16,
    pub status: EgvStatus,
    pub trend_rate: i8,
}

/// `pumpTime(u32) glucose(u16) status(u8) trendRate(i8)`.
pub fn decode_cgm_egv(cargo: &[u8]) -> Result<CgmEgv, DecodeError> {
    let mut buf = exact("cgm egv", cargo, CGM_EGV_LEN)?;
    let pump_time = buf.get_u32_le();
    let glucose_mg_dl = buf.get_u16_le();
    let status = EgvStatus::from_u8(buf.get_u8())?;
    let trend_rate = buf.get_i8();
    Ok(CgmEgv {
        pump_time,
        glucose_mg_dl,
        status,
        trend_rate,
    })
}

/// Trend arrow from the home-screen mirror (byte 0 of 9).
pub fn decode_trend_icon(cargo: &[u8]) -> Result<TrendArrow, DecodeError> {
    let buf = exact("home screen mirror", cargo, HOME_SCREEN_MIRROR_LEN)?;
    Ok(match buf[0] {
        0 => TrendArrow::Unknown,
        1 => TrendArrow::DoubleUp,
        2 => TrendArrow::SingleUp,
        3 => TrendArrow::FortyFiveUp,
        4 => TrendArrow::Flat,
        5 => TrendArrow::FortyFiveDown,
        6 => TrendArrow::SingleDown,
        7 => TrendArrow::DoubleDown,
        value => return Err(DecodeError::InvalidEnum { field: "trend icon", value }),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgmReading {
    /// `None` unless the status says the value is usable.
    pub glucose_mg_dl: Option<u16>,
    pub status: EgvStatus,
    pub trend: TrendArrow,
    pub trend_rate: i8,
    pub pump_time: u32,
    pub timestamp: u64,
}

/// Merge the glucose response with the (optional) trend response. A failed trend read
/// degrades to `Unknown` instead of failing the reading.
pub fn merge_cgm(egv: CgmEgv, trend: Option<TrendArrow>) -> CgmReading {
    let glucose_mg_dl = (egv.status.has_value() && egv.glucose_mg_dl != 0).then_some(egv.glucose_mg_dl);
    CgmReading {
        glucose_mg_dl,
        status: egv.status,
        trend: trend.unwrap_or(TrendArrow::Unknown),
        trend_rate: egv.trend_rate,
        pump_time: egv.pump_time,
        timestamp: pump_time_to_unix(egv.pump_time),
    }
}

/// Bolus sources that count as automated (algorithm-initiated) in status responses.
const AUTOMATED_LAST_BOLUS_SOURCES: [u8; 2] = [7, 8];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastBolus {
    pub bolus_id: u32,
    pub pump_time: u32,
    pub timestamp: u64,
    pub delivered_units: f64,
    pub status: u8,
    pub source: u8,
    pub bolus_type: u8,
    pub is_automated: bool,
}

/// `id(u32) pumpTime(u32) delivered(u32 mU) status(u8) source(u8) type(u8)`. A zero volume
/// means no bolus on record.
pub fn decode_last_bolus(cargo: &[u8]) -> Result<Option<LastBolus>, DecodeError> {
    let mut buf = exact("last bolus", cargo, LAST_BOLUS_LEN)?;
    let bolus_id = buf.get_u32_le();
    let pump_time = buf.get_u32_le();
    let delivered = buf.get_u32_le();
    let status = buf.get_u8();
    let source = buf.get_u8();
    let bolus_type = buf.get_u8();
    if delivered == 0 {
        return Ok(None);
    }
    Ok(Some(LastBolus {
        bolus_id,
        pump_time,
        timestamp: pump_time_to_unix(pump_time),
        delivered_units: milliunits(delivered as i64),
        status,
        source,
        bolus_type,
        is_automated: AUTOMATED_LAST_BOLUS_SOURCES.contains(&source),
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpSettings {
    pub max_bolus_units: f64,
    pub basal_limit_units_per_hour: f64,
    pub insulin_duration_minutes: u16,
    pub low_insulin_threshold_units: u8,
    pub auto_off_enabled: bool,
    pub timestamp: u64,
}

pub fn decode_pump_settings(cargo: &[u8], received_at: u64) -> Result<PumpSettings, DecodeError> {
    let mut buf = exact("pump settings", cargo, PUMP_SETTINGS_LEN)?;
    let max_bolus = buf.get_u16_le();
    let basal_limit = buf.get_u32_le();
    let insulin_duration_minutes = buf.get_u16_le();
    let low_insulin_threshold_units = buf.get_u8();
    let auto_off_enabled = flag("auto off", buf.get_u8())?;
    Ok(PumpSettings {
        max_bolus_units: milliunits(max_bolus as i64),
        basal_limit_units_per_hour: milliunits(basal_limit as i64),
        insulin_duration_minutes,
        low_insulin_threshold_units,
        auto_off_enabled,
        timestamp: received_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpVersion {
    pub arm_sw_ver: u32,
    pub msp_sw_ver: u32,
    pub config_a_bits: u32,
    pub config_b_bits: u32,
    pub serial_number: u32,
    pub part_number: u32,
    pub pump_rev: String,
    pub pcba_serial: u32,
    pub pcba_rev: String,
    pub model_number: u32,
}

fn ascii_field(buf: &mut &[u8]) -> String {
    let mut raw = [0u8; 8];
    buf.copy_to_slice(&mut raw);
    String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

pub fn decode_pump_version(cargo: &[u8]) -> Result<PumpVersion, DecodeError> {
    let mut buf = exact("pump version", cargo, PUMP_VERSION_LEN)?;
    Ok(PumpVersion {
        arm_sw_ver: buf.get_u32_le(),
        msp_sw_ver: buf.get_u32_le(),
        config_a_bits: buf.get_u32_le(),
        config_b_bits: buf.get_u32_le(),
        serial_number: buf.get_u32_le(),
        part_number: buf.get_u32_le(),
        pump_rev: ascii_field(&mut buf),
        pcba_serial: buf.get_u32_le(),
        pcba_rev: ascii_field(&mut buf),
        model_number: buf.get_u32_le(),
    })
}

/// Feature bitmask (`u64`).
pub fn decode_pump_features(cargo: &[u8]) -> Result<u64, DecodeError> {
    let mut buf = exact("pump features", cargo, PUMP_FEATURES_LEN)?;
    Ok(buf.get_u64_le())
}

/// Version plus features; features are optional because older firmware does not answer them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpHardwareInfo {
    #[serde(flatten)]
    pub version: PumpVersion,
    pub features: Option<u64>,
}

/// `count(u32) first(u32) last(u32)`.
pub fn decode_history_log_status(cargo: &[u8]) -> Result<HistoryRange, DecodeError> {
    let mut buf = exact("history log status", cargo, HISTORY_LOG_STATUS_LEN)?;
    let range = HistoryRange {
        count: buf.get_u32_le(),
        first: buf.get_u32_le(),
        last: buf.get_u32_le(),
    };
    if range.count > 0 && range.first > range.last {
        return Err(DecodeError::Inconsistent("history first index after last"));
    }
    Ok(range)
}

/// Acknowledgement of a history-log request; records follow on the history channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLogAck {
    pub status: u8,
    pub stream_id: u8,
}

pub fn decode_history_log_ack(cargo: &[u8]) -> Result<HistoryLogAck, DecodeError> {
    let mut buf = exact("history log response", cargo, HISTORY_LOG_ACK_LEN)?;
    Ok(HistoryLogAck {
        status: buf.get_u8(),
        stream_id: buf.get_u8(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStreamPacket {
    pub stream_id: u8,
    pub records: Vec<HistoryLogRecord>,
}

/// `count(u8) streamId(u8)` followed by `count` 26-byte records.
pub fn decode_history_stream(cargo: &[u8]) -> Result<HistoryStreamPacket, DecodeError> {
    if cargo.len() < STREAM_HEADER_LEN {
        return Err(DecodeError::Length {
            message: "history stream",
            expected: STREAM_HEADER_LEN,
            actual: cargo.len(),
        });
    }
    let count = cargo[0] as usize;
    let stream_id = cargo[1];
    let body = exact("history stream", &cargo[STREAM_HEADER_LEN..], count * RECORD_LEN)?;
    let records = body
        .chunks_exact(RECORD_LEN)
        .map(HistoryLogRecord::parse)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HistoryStreamPacket { stream_id, records })
}
