pub const BOOST_DTC_SENSOR_INVALID: u8 = 0;
pub const BOOST_DTC_TORQUE_REQUEST_STALE: u8 = 1;
pub const BOOST_DTC_OVERBOOST_PREDICTED: u8 = 2;
pub const BOOST_DTC_OVERBOOST_MEASURED: u8 = 3;
pub const BOOST_DTC_TRIM_BOUND_VIOLATION: u8 = 4;
pub const BOOST_DTC_STORAGE_FLUSH_FAILURE: u8 = 5;
pub const BOOST_DTC_TELEMETRY_DROPPED: u8 = 6;

pub trait DtcBitfield {
    fn set(&mut self, dtc: u8);
    fn clear(&mut self, dtc: u8);
    fn check(&self, dtc: u8) -> bool;
}

impl DtcBitfield for u8 {
    fn set(&mut self, dtc: u8) {
        *self |= 1 << dtc;
    }

    fn clear(&mut self, dtc: u8) {
        *self &= !(1 << dtc);
    }

    fn check(&self, dtc: u8) -> bool {
        *self & (1 << dtc) != 0
    }
}

pub fn dtc_name(dtc: u8) -> &'static str {
    match dtc {
        BOOST_DTC_SENSOR_INVALID => "sensor-invalid",
        BOOST_DTC_TORQUE_REQUEST_STALE => "torque-request-stale",
        BOOST_DTC_OVERBOOST_PREDICTED => "overboost-predicted",
        BOOST_DTC_OVERBOOST_MEASURED => "overboost-measured",
        BOOST_DTC_TRIM_BOUND_VIOLATION => "trim-bound-violation",
        BOOST_DTC_STORAGE_FLUSH_FAILURE => "storage-flush-failure",
        BOOST_DTC_TELEMETRY_DROPPED => "telemetry-dropped",
        _ => "unknown",
    }
}

/// Names of every code set in `dtcs`, lowest bit first.
pub fn active_dtc_names(dtcs: u8) -> impl Iterator<Item = &'static str> {
    (0..8u8).filter(move |d| dtcs.check(*d)).map(dtc_name)
}
