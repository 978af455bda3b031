use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    make_hm10_characteristic_uuid, make_hm10_service_uuid, CONNECT_TIMEOUT, SCAN_TIMEOUT, SEND_INTERVAL,
};
use crate::drive::mapper::MaxSpeed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub max_speed: MaxSpeed,
    pub send_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    // only report peripherals advertising `service_uuid` while scanning
    pub filter_by_service: bool,
}

impl Config {
    pub fn normalize(&mut self) {
        // MaxSpeed clamps itself when deserialized
        self.send_interval_ms = self.send_interval_ms.max(1);
        self.scan_timeout_ms = self.scan_timeout_ms.max(1);
        self.connect_timeout_ms = self.connect_timeout_ms.max(1);
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_speed: MaxSpeed::default(),
            send_interval_ms: SEND_INTERVAL,
            scan_timeout_ms: SCAN_TIMEOUT,
            connect_timeout_ms: CONNECT_TIMEOUT,
            service_uuid: make_hm10_service_uuid(),
            characteristic_uuid: make_hm10_characteristic_uuid(),
            filter_by_service: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mapper::MAX_MAX_SPEED;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{ "maxSpeed": 250, "filterByService": false }"#).unwrap();
        assert_eq!(config.max_speed.get(), 250);
        assert!(!config.filter_by_service);
        assert_eq!(config.send_interval_ms, 50);
        assert_eq!(config.service_uuid, make_hm10_service_uuid());
    }

    #[test]
    fn test_out_of_range_values_are_normalized() {
        let mut config: Config = serde_json::from_str(r#"{ "maxSpeed": 99999, "sendIntervalMs": 0 }"#).unwrap();
        config.normalize();
        assert_eq!(config.max_speed.get(), MAX_MAX_SPEED);
        assert_eq!(config.send_interval_ms, 1);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"maxSpeed\":500"));
        assert!(json.contains("\"characteristicUuid\":\"0000ffe1-0000-1000-8000-00805f9b34fb\""));
    }
}
