// Run Stamp Port - identity and start time of a harness run

/// Source of the run id and start timestamp (fixed in tests)
pub trait RunStamp {
    fn run_id(&self) -> String;

    /// Milliseconds since the Unix epoch
    fn started_at(&self) -> i64;
}

/// Random v4 UUID and the wall clock
pub struct LiveStamp;

impl RunStamp for LiveStamp {
    fn run_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn started_at(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone)]
pub struct FixedStamp {
    pub run_id: String,
    pub started_at: i64,
}

impl RunStamp for FixedStamp {
    fn run_id(&self) -> String {
        self.run_id.clone()
    }

    fn started_at(&self) -> i64 {
        self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_ids_are_unique() {
        assert_ne!(LiveStamp.run_id(), LiveStamp.run_id());
        assert!(LiveStamp.started_at() > 1_600_000_000_000);
    }
}
