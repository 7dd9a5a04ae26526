//! Caller-facing pump API: one typed method per reading, each returning a `Result`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use pump_core::decoder::{
    self, BasalRate, BatteryStatus, CgmReading, IobReading, LastBolus, PumpHardwareInfo,
    PumpSettings, ReservoirLevel,
};
use pump_core::history::{basal_event, bolus_event, cgm_reading, BasalEvent, BolusEvent, CgmHistoryReading};
use pump_core::protocol::status;
use pump_core::{ConnectionState, DecodeError, HistoryLogRecord};
use tokio::sync::{watch, Mutex};

use crate::error::LinkError;
use crate::manager::ConnectionManager;
use crate::transport::Transport;

/// History records kept in memory for the `get_*_history` queries.
const HISTORY_CACHE_LIMIT: usize = 2000;

pub struct PumpDriver<T: Transport> {
    link: ConnectionManager<T>,
    history: Mutex<BTreeMap<u32, HistoryLogRecord>>,
}

impl<T: Transport> PumpDriver<T> {
    pub fn new(link: ConnectionManager<T>) -> Self {
        Self {
            link,
            history: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn link(&self) -> &ConnectionManager<T> {
        &self.link
    }

    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        self.link.connect(address).await
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await
    }

    pub fn observe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.observe_connection_state()
    }

    async fn status<R>(
        &self,
        opcode: u8,
        decode: fn(&[u8]) -> Result<R, DecodeError>,
    ) -> Result<R, LinkError> {
        let cargo = self
            .link
            .send_status_request(opcode, &[], self.link.config().request_timeout)
            .await?;
        Ok(decode(&cargo)?)
    }

    /// For readings whose cargo has no pump time: stamped with the time the response arrived.
    async fn stamped<R>(
        &self,
        opcode: u8,
        decode: fn(&[u8], u64) -> Result<R, DecodeError>,
    ) -> Result<R, LinkError> {
        let cargo = self
            .link
            .send_status_request(opcode, &[], self.link.config().request_timeout)
            .await?;
        Ok(decode(&cargo, unix_secs(SystemTime::now()))?)
    }

    pub async fn get_iob(&self) -> Result<IobReading, LinkError> {
        self.stamped(status::CONTROL_IQ_IOB, decoder::decode_iob).await
    }

    pub async fn get_basal_rate(&self) -> Result<BasalRate, LinkError> {
        self.stamped(status::CURRENT_BASAL_STATUS, decoder::decode_basal).await
    }

    /// V1 first; V2 only when V1 fails. Asking V2 first destabilizes pumps without it.
    pub async fn get_battery_status(&self) -> Result<BatteryStatus, LinkError> {
        match self.stamped(status::CURRENT_BATTERY_V1, decoder::decode_battery_v1).await {
            Ok(b) => Ok(b),
            Err(e) if e.is_link_down() => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "battery v1 failed, trying v2");
                self.stamped(status::CURRENT_BATTERY_V2, decoder::decode_battery_v2)
                    .await
            }
        }
    }

    pub async fn get_reservoir_level(&self) -> Result<ReservoirLevel, LinkError> {
        self.stamped(status::INSULIN_STATUS, decoder::decode_reservoir).await
    }

    /// Glucose plus trend arrow. A failed trend read yields `TrendArrow::Unknown`.
    pub async fn get_cgm_status(&self) -> Result<CgmReading, LinkError> {
        let egv = self
            .status(status::CURRENT_EGV_GUI_DATA, decoder::decode_cgm_egv)
            .await?;
        let trend = match self
            .status(status::HOME_SCREEN_MIRROR, decoder::decode_trend_icon)
            .await
        {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!(error = %e, "trend unavailable");
                None
            }
        };
        Ok(decoder::merge_cgm(egv, trend))
    }

    pub async fn get_pump_settings(&self) -> Result<PumpSettings, LinkError> {
        self.stamped(status::PUMP_SETTINGS, decoder::decode_pump_settings).await
    }

    /// Version, plus the feature bitmask when the firmware answers it.
    pub async fn get_pump_hardware_info(&self) -> Result<PumpHardwareInfo, LinkError> {
        let version = self
            .status(status::PUMP_VERSION, decoder::decode_pump_version)
            .await?;
        let features = match self
            .status(status::PUMP_FEATURES_V1, decoder::decode_pump_features)
            .await
        {
            Ok(f) => Some(f),
            Err(e) if e.is_link_down() => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "pump features unavailable");
                None
            }
        };
        Ok(PumpHardwareInfo { version, features })
    }

    /// `None` when the pump has no bolus on record.
    pub async fn get_last_bolus(&self) -> Result<Option<LastBolus>, LinkError> {
        self.status(status::LAST_BOLUS_STATUS, decoder::decode_last_bolus).await
    }

    /// Pull whatever the pump logged since the last fetch into the cache.
    async fn refresh_history(&self) -> Result<(), LinkError> {
        let records = self.link.fetch_history().await?;
        let mut cache = self.history.lock().await;
        for r in records {
            cache.insert(r.sequence, r);
        }
        while cache.len() > HISTORY_CACHE_LIMIT {
            cache.pop_first();
        }
        Ok(())
    }

    async fn cached<R>(&self, pick: impl Fn(&HistoryLogRecord) -> Option<R>) -> Result<Vec<R>, LinkError> {
        self.refresh_history().await?;
        let cache = self.history.lock().await;
        Ok(cache.values().filter_map(pick).collect())
    }

    /// Raw history records with sequence number `since_sequence` or later, oldest first.
    pub async fn get_history_logs(&self, since_sequence: u32) -> Result<Vec<HistoryLogRecord>, LinkError> {
        self.cached(|r| (r.sequence >= since_sequence).then_some(*r))
            .await
    }

    /// Bolus deliveries at or after `since`. Zero-volume records are not deliveries.
    pub async fn get_bolus_history(&self, since: SystemTime) -> Result<Vec<BolusEvent>, LinkError> {
        let since = unix_secs(since);
        self.cached(|r| bolus_event(r).filter(|e| e.timestamp >= since))
            .await
    }

    pub async fn get_basal_history(&self, since: SystemTime) -> Result<Vec<BasalEvent>, LinkError> {
        let since = unix_secs(since);
        self.cached(|r| basal_event(r).filter(|e| e.timestamp >= since))
            .await
    }

    pub async fn get_cgm_history(&self, since: SystemTime) -> Result<Vec<CgmHistoryReading>, LinkError> {
        let since = unix_secs(since);
        self.cached(|r| cgm_reading(r).filter(|e| e.timestamp >= since))
            .await
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
