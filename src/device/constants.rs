use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * How long (milliseconds) a scan runs before it stops by itself.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) connecting, resolving the characteristic, or disconnecting may take.
 */
pub const CONNECT_TIMEOUT: u64 = 10_000;

/**
 * Minimum time (milliseconds) between two continuous drive commands.
 */
pub const SEND_INTERVAL: u64 = 50;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) the disconnect primitive may take before the link is considered gone.
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;

/**
 * Writes waiting for the radio. When full, further writes are skipped rather than queued.
 */
pub const WRITE_QUEUE_SIZE: usize = 16;

/**
 * The 16-bit UUID of the HM-10 serial bridge service.
 */
pub const HM10_SERVICE: u16 = 0xFFE0;

/**
 * The 16-bit UUID of the HM-10 characteristic that receives command writes and sends notifications.
 */
pub const HM10_CHARACTERISTIC: u16 = 0xFFE1;

pub fn make_hm10_service_uuid() -> Uuid {
    uuid_from_u16(HM10_SERVICE)
}

pub fn make_hm10_characteristic_uuid() -> Uuid {
    uuid_from_u16(HM10_CHARACTERISTIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_use_bluetooth_base() {
        assert_eq!(make_hm10_service_uuid().to_string(), "0000ffe0-0000-1000-8000-00805f9b34fb");
        assert_eq!(make_hm10_characteristic_uuid().to_string(), "0000ffe1-0000-1000-8000-00805f9b34fb");
    }
}
