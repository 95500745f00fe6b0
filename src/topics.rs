//! Building and gateway scoped topic namespace.

/// Topic strings for one gateway, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    status: String,
    ota_request: String,
}

impl Topics {
    pub fn new(building_id: &str, gateway_id: &str) -> Self {
        let base = format!("building/{building_id}/gateway/{gateway_id}");
        Self {
            status: format!("{base}/status"),
            ota_request: format!("{base}/ota/request"),
            base,
        }
    }

    /// Retained gateway status, QoS 1.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Inbound control topic for over-the-air update requests.
    pub fn ota_request(&self) -> &str {
        &self.ota_request
    }

    /// Per-device telemetry, QoS 1, not retained.
    pub fn telemetry(&self, device_id: &str) -> String {
        format!("{}/device/{device_id}/telemetry", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new("building-001", "gateway-12345678");
        assert_eq!(
            topics.status(),
            "building/building-001/gateway/gateway-12345678/status"
        );
        assert_eq!(
            topics.ota_request(),
            "building/building-001/gateway/gateway-12345678/ota/request"
        );
        assert_eq!(
            topics.telemetry("aabbccddeeff"),
            "building/building-001/gateway/gateway-12345678/device/aabbccddeeff/telemetry"
        );
    }
}
