use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of wall-clock time for the scheduler.
///
/// Every time comparison in the control plane (claim leases, heartbeat
/// freshness, retry gates, reaper deadlines) reads through this trait so
/// tests can drive time explicitly instead of sleeping.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mints opaque string identifiers for tasks.
pub trait IdMinter: Send + Sync {
    /// Mint a fresh, unique identifier.
    fn mint(&self) -> String;
}

/// Default minter producing UUID v7 strings (time-ordered).
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidMinter;

impl IdMinter for UuidMinter {
    fn mint(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn uuid_minter_produces_v7_ids() {
        let minter = UuidMinter;
        let id = minter.mint();
        let parsed = Uuid::parse_str(&id).expect("minted id parses as uuid");
        assert_eq!(parsed.as_bytes()[6] >> 4, 7);
    }

    #[test]
    fn uuid_minter_ids_are_unique() {
        let minter = UuidMinter;
        let a = minter.mint();
        let b = minter.mint();
        assert_ne!(a, b);
    }
}
