//! Fixed role → TCP port assignments.
//!
//! Every daemon role owns one port in `[62000, 62099]`. Every peer on every
//! host honours this table; it is the only place ports are defined.

pub const PORT_BASE: u16 = 62000;
pub const PORT_LIMIT: u16 = 62099;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum RoboPort {
    Chillerd = 62000,
    Sensorsd = 62001,
    Shutterd = 62002,
    Filterd = 62003,
    Telescoped = 62004,
    Domed = 62005,
    Weatherd = 62006,
    Powerd = 62007,
    Cryod = 62008,
    Vacuumd = 62009,
    Focusd = 62010,
    Rotatord = 62011,
    Camerad = 62012,
    Imaged = 62013,
    Guiderd = 62014,
    Datad = 62015,
    Fitsd = 62016,
    Queued = 62017,
    Schedulerd = 62018,
    Loggerd = 62019,
    Messaged = 62020,
    TipTiltd = 62021,
    Labjackd = 62022,
    Daqd = 62023,
    Robod = 62024,
    Watchdogd = 62025,
    RobodStatus = 62026,
}

impl RoboPort {
    pub const ALL: [RoboPort; 27] = [
        RoboPort::Chillerd,
        RoboPort::Sensorsd,
        RoboPort::Shutterd,
        RoboPort::Filterd,
        RoboPort::Telescoped,
        RoboPort::Domed,
        RoboPort::Weatherd,
        RoboPort::Powerd,
        RoboPort::Cryod,
        RoboPort::Vacuumd,
        RoboPort::Focusd,
        RoboPort::Rotatord,
        RoboPort::Camerad,
        RoboPort::Imaged,
        RoboPort::Guiderd,
        RoboPort::Datad,
        RoboPort::Fitsd,
        RoboPort::Queued,
        RoboPort::Schedulerd,
        RoboPort::Loggerd,
        RoboPort::Messaged,
        RoboPort::TipTiltd,
        RoboPort::Labjackd,
        RoboPort::Daqd,
        RoboPort::Robod,
        RoboPort::Watchdogd,
        RoboPort::RobodStatus,
    ];

    pub fn port(self) -> u16 {
        self as u16
    }

    /// Executable that serves this role, used for restarts and PID lookups.
    pub fn executable(self) -> &'static str {
        match self {
            RoboPort::Chillerd => "chillerd",
            RoboPort::Sensorsd => "sensorsd",
            RoboPort::Shutterd => "shutterd",
            RoboPort::Filterd => "filterd",
            RoboPort::Telescoped => "telescoped",
            RoboPort::Domed => "domed",
            RoboPort::Weatherd => "weatherd",
            RoboPort::Powerd => "powerd",
            RoboPort::Cryod => "cryod",
            RoboPort::Vacuumd => "vacuumd",
            RoboPort::Focusd => "focusd",
            RoboPort::Rotatord => "rotatord",
            RoboPort::Camerad => "camerad",
            RoboPort::Imaged => "imaged",
            RoboPort::Guiderd => "guiderd",
            RoboPort::Datad => "datad",
            RoboPort::Fitsd => "fitsd",
            RoboPort::Queued => "queued",
            RoboPort::Schedulerd => "schedulerd",
            RoboPort::Loggerd => "loggerd",
            RoboPort::Messaged => "messaged",
            RoboPort::TipTiltd => "tiptiltd",
            RoboPort::Labjackd => "labjackd",
            RoboPort::Daqd => "daqd",
            RoboPort::Robod | RoboPort::RobodStatus => "robod",
            RoboPort::Watchdogd => "watchdogd",
        }
    }

    /// Status-only channels never restart their peer.
    pub fn is_telemetry_only(self) -> bool {
        matches!(self, RoboPort::RobodStatus)
    }

    pub fn from_port(port: u16) -> Option<RoboPort> {
        RoboPort::ALL.iter().copied().find(|r| r.port() == port)
    }

    pub fn from_executable(name: &str) -> Option<RoboPort> {
        RoboPort::ALL
            .iter()
            .copied()
            .find(|r| !r.is_telemetry_only() && r.executable() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ports_are_dense_unique_and_in_range() {
        let mut seen = HashSet::new();
        for (i, role) in RoboPort::ALL.iter().enumerate() {
            let p = role.port();
            assert!((PORT_BASE..=PORT_LIMIT).contains(&p));
            assert_eq!(p, PORT_BASE + i as u16);
            assert!(seen.insert(p));
        }
    }

    #[test]
    fn test_lookups_round_trip() {
        assert_eq!(RoboPort::from_port(62024), Some(RoboPort::Robod));
        assert_eq!(RoboPort::from_executable("watchdogd"), Some(RoboPort::Watchdogd));
        assert_eq!(RoboPort::from_executable("robod"), Some(RoboPort::Robod));
        assert_eq!(RoboPort::from_port(62099), None);
        assert!(RoboPort::RobodStatus.is_telemetry_only());
    }
}
