//! Pump wire protocol: GATT channels and the opcode table.
//!
//! Opcode values are fixed by the pump firmware and must not change. A response
//! always carries the request opcode plus one.

use serde::Serialize;

/// Primary GATT service advertised by the pump.
pub const SERVICE_UUID: &str = "0000fdfb-0000-1000-8000-00805f9b34fb";

/// Current-status characteristic (write requests, notify responses).
pub const CURRENT_STATUS_UUID: &str = "7b83fff6-9f77-4e5c-8064-aae2c24838b9";

/// History-log stream characteristic (notify only).
pub const HISTORY_LOG_UUID: &str = "7b83fff8-9f77-4e5c-8064-aae2c24838b9";

/// Authorization characteristic (write requests, notify responses).
pub const AUTHORIZATION_UUID: &str = "7b83fff9-9f77-4e5c-8064-aae2c24838b9";

/// Logical channel, one per GATT characteristic the link uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    Authorization,
    CurrentStatus,
    HistoryLog,
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::Authorization,
        Channel::CurrentStatus,
        Channel::HistoryLog,
    ];

    pub fn uuid(self) -> &'static str {
        match self {
            Channel::Authorization => AUTHORIZATION_UUID,
            Channel::CurrentStatus => CURRENT_STATUS_UUID,
            Channel::HistoryLog => HISTORY_LOG_UUID,
        }
    }

    /// Reverse lookup, case-insensitive.
    pub fn from_uuid(uuid: &str) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }
}

/// Opcode of the response to `request`.
pub fn response_opcode(request: u8) -> u8 {
    request.wrapping_add(1)
}

/// Authorization-channel opcodes.
pub mod auth {
    pub const CENTRAL_CHALLENGE_REQUEST: u8 = 16;
    pub const CENTRAL_CHALLENGE_RESPONSE: u8 = 17;
    pub const PUMP_CHALLENGE_REQUEST: u8 = 18;
    pub const PUMP_CHALLENGE_RESPONSE: u8 = 19;

    pub const JPAKE_1A_REQUEST: u8 = 32;
    pub const JPAKE_1A_RESPONSE: u8 = 33;
    pub const JPAKE_1B_REQUEST: u8 = 34;
    pub const JPAKE_1B_RESPONSE: u8 = 35;
    pub const JPAKE_2_REQUEST: u8 = 36;
    pub const JPAKE_2_RESPONSE: u8 = 37;
    pub const JPAKE_SESSION_KEY_REQUEST: u8 = 38;
    pub const JPAKE_SESSION_KEY_RESPONSE: u8 = 39;
    pub const JPAKE_KEY_CONFIRMATION_REQUEST: u8 = 40;
    pub const JPAKE_KEY_CONFIRMATION_RESPONSE: u8 = 41;
}

/// Current-status-channel opcodes (requests; responses are +1).
pub mod status {
    pub const CURRENT_EGV_GUI_DATA: u8 = 34;
    pub const INSULIN_STATUS: u8 = 36;
    pub const CURRENT_BASAL_STATUS: u8 = 40;
    pub const LAST_BOLUS_STATUS: u8 = 48;
    pub const CURRENT_BATTERY_V1: u8 = 52;
    pub const HOME_SCREEN_MIRROR: u8 = 56;
    pub const HISTORY_LOG_STATUS: u8 = 58;
    pub const HISTORY_LOG_REQUEST: u8 = 60;
    pub const PUMP_FEATURES_V1: u8 = 78;
    pub const PUMP_VERSION: u8 = 84;
    pub const PUMP_SETTINGS: u8 = 86;
    pub const CONTROL_IQ_IOB: u8 = 108;
    pub const CURRENT_BATTERY_V2: u8 = 144;
}

/// History-log-channel opcodes.
pub mod history {
    pub const HISTORY_LOG_STREAM: u8 = 129;
}
