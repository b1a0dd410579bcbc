use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Fixed interval in milliseconds. Non-positive intervals never fire.
    Every {
        #[serde(rename = "everyMs")]
        every_ms: i64,
    },
    /// Standard 5-field cron expression.
    Cron { expr: String },
    /// One-shot epoch-milliseconds timestamp. Already-past timestamps are
    /// terminal and never fire.
    Once {
        #[serde(rename = "atMs")]
        at_ms: i64,
    },
}

/// What a fired job asks the agent to do, and where the result goes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Payload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,
    #[serde(default)]
    pub deliver: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub payload: Payload,
    pub enabled: bool,
    pub created_at_ms: i64,
}

impl Job {
    pub fn new(name: &str, schedule: Schedule, payload: Payload) -> Self {
        Self {
            id: generate_job_id(),
            name: name.to_string(),
            schedule,
            payload,
            enabled: true,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Whether this job can be placed on a timer at all.
    pub fn schedulable(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.schedule {
            Schedule::Every { every_ms } => *every_ms > 0,
            Schedule::Cron { expr } => !expr.is_empty(),
            Schedule::Once { at_ms } => *at_ms > now.timestamp_millis(),
        }
    }
}

fn generate_job_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("job_{nanos}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serializes_tagged() {
        let every = serde_json::to_value(Schedule::Every { every_ms: 1000 }).unwrap();
        assert_eq!(every["type"], "every");
        assert_eq!(every["everyMs"], 1000);

        let cron = serde_json::to_value(Schedule::Cron {
            expr: "0 9 * * *".into(),
        })
        .unwrap();
        assert_eq!(cron["type"], "cron");

        let once = serde_json::to_value(Schedule::Once { at_ms: 42 }).unwrap();
        assert_eq!(once["type"], "once");
        assert_eq!(once["atMs"], 42);
    }

    #[test]
    fn schedule_round_trips() {
        let schedule = Schedule::Once { at_ms: 1234 };
        let json = serde_json::to_string(&schedule).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn job_ids_are_monotonic() {
        let a = Job::new("a", Schedule::Every { every_ms: 1 }, Payload::default());
        let b = Job::new("b", Schedule::Every { every_ms: 1 }, Payload::default());
        assert!(b.id >= a.id);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn non_positive_interval_not_schedulable() {
        let mut job = Job::new("j", Schedule::Every { every_ms: 0 }, Payload::default());
        assert!(!job.schedulable(Utc::now()));
        job.schedule = Schedule::Every { every_ms: -5 };
        assert!(!job.schedulable(Utc::now()));
        job.schedule = Schedule::Every { every_ms: 5 };
        assert!(job.schedulable(Utc::now()));
    }

    #[test]
    fn past_once_not_schedulable() {
        let now = Utc::now();
        let past = Job::new(
            "p",
            Schedule::Once {
                at_ms: now.timestamp_millis() - 1000,
            },
            Payload::default(),
        );
        assert!(!past.schedulable(now));

        let future = Job::new(
            "f",
            Schedule::Once {
                at_ms: now.timestamp_millis() + 60_000,
            },
            Payload::default(),
        );
        assert!(future.schedulable(now));
    }

    #[test]
    fn disabled_job_not_schedulable() {
        let mut job = Job::new("j", Schedule::Every { every_ms: 100 }, Payload::default());
        job.enabled = false;
        assert!(!job.schedulable(Utc::now()));
    }
}
