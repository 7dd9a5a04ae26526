//! BLE transport over btleplug: scan by address, connect, subscribe to the pump's
//! characteristics, write with response, report link loss.

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use pump_core::protocol::SERVICE_UUID;
use pump_core::Channel;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::{Transport, TransportError, TransportEvent};

const SCAN_TIMEOUT: Duration = Duration::from_secs(15);
const SCAN_POLL: Duration = Duration::from_millis(500);

pub struct BleTransport {
    adapter: Adapter,
    found: Mutex<Option<Peripheral>>,
    link: Mutex<Option<BleLink>>,
}

struct BleLink {
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleTransport {
    /// Use the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(classify)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(classify)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Ble("no Bluetooth adapter found".into()))?;
        Ok(Self {
            adapter,
            found: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    async fn scan(&self, address: &str) -> Result<Peripheral, TransportError> {
        let filter = ScanFilter {
            services: vec![parse_uuid(SERVICE_UUID)?],
        };
        self.adapter.start_scan(filter).await.map_err(classify)?;
        let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            let peripherals = self.adapter.peripherals().await.map_err(classify)?;
            if let Some(p) = peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            {
                break Some(p);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        let _ = self.adapter.stop_scan().await;
        found.ok_or_else(|| TransportError::NotFound(address.to_owned()))
    }

    async fn open(
        &self,
        peripheral: &Peripheral,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<BleLink, TransportError> {
        peripheral.connect().await.map_err(classify)?;
        peripheral.discover_services().await.map_err(classify)?;
        let available = peripheral.characteristics();
        let mut notifications = peripheral.notifications().await.map_err(classify)?;

        let mut characteristics = HashMap::new();
        for channel in Channel::ALL {
            let uuid = parse_uuid(channel.uuid())?;
            let c = available
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(TransportError::MissingCharacteristic(channel))?;
            // Subscribing is what triggers link-layer pairing on the pump.
            peripheral.subscribe(&c).await.map_err(classify)?;
            characteristics.insert(channel, c);
        }

        let tx = events.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let Some(channel) = Channel::from_uuid(&n.uuid.to_string()) else {
                    continue;
                };
                if tx
                    .send(TransportEvent::Notification {
                        channel,
                        data: n.value,
                    })
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(TransportEvent::Disconnected);
        });

        let mut central = self.adapter.events().await.map_err(classify)?;
        let id = peripheral.id();
        let watch_task = tokio::spawn(async move {
            while let Some(event) = central.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        let _ = events.send(TransportEvent::Disconnected);
                        return;
                    }
                }
            }
        });

        Ok(BleLink {
            peripheral: peripheral.clone(),
            characteristics,
            tasks: vec![notify_task, watch_task],
        })
    }
}

impl Transport for BleTransport {
    async fn find(&self, address: &str) -> Result<(), TransportError> {
        let peripheral = self.scan(address).await?;
        tracing::info!(address, "pump found");
        *self.found.lock().await = Some(peripheral);
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let cached = self
            .found
            .lock()
            .await
            .clone()
            .filter(|p| p.address().to_string().eq_ignore_ascii_case(address));
        let peripheral = match cached {
            Some(p) => p,
            None => self.scan(address).await?,
        };
        match self.open(&peripheral, events).await {
            Ok(link) => {
                tracing::debug!(address, "gatt link open");
                *self.link.lock().await = Some(link);
                Ok(())
            }
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn write(&self, channel: Channel, chunk: &[u8]) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        let c = link
            .characteristics
            .get(&channel)
            .ok_or(TransportError::MissingCharacteristic(channel))?;
        link.peripheral
            .write(c, chunk, WriteType::WithResponse)
            .await
            .map_err(classify)
    }

    async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            for task in &link.tasks {
                task.abort();
            }
            if let Err(e) = link.peripheral.disconnect().await {
                tracing::debug!(error = %e, "disconnect");
            }
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(s).map_err(|e| TransportError::Ble(e.to_string()))
}

fn classify(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        other => classify_message(other.to_string()),
    }
}

/// BlueZ reports refused pairing only through its error text.
fn classify_message(message: String) -> TransportError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("encrypt") || lower.contains("authenticat") {
        TransportError::Encryption(message)
    } else {
        TransportError::Ble(message)
    }
}
