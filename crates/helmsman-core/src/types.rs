//! Identity types shared across the Helmsman crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of workload a rollout drives.
///
/// `Service` workloads converge when the successor replica set is fully
/// ready and the predecessor has drained. `Job` and `AdHoc` workloads are
/// single-run units that converge when the unit reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Service,
    Job,
    #[serde(rename = "adhoc", alias = "ad_hoc")]
    AdHoc,
}

impl WorkloadKind {
    /// True for the single-run kinds (job and ad-hoc pod runs).
    pub fn is_run(self) -> bool {
        matches!(self, WorkloadKind::Job | WorkloadKind::AdHoc)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Service => "service",
            WorkloadKind::Job => "job",
            WorkloadKind::AdHoc => "adhoc",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(WorkloadKind::Service),
            "job" => Ok(WorkloadKind::Job),
            "adhoc" | "ad-hoc" | "run" => Ok(WorkloadKind::AdHoc),
            other => Err(format!("unknown workload kind: {other}")),
        }
    }
}

/// A workload within an environment. This pair is the unit of exclusion:
/// at most one record per `WorkloadRef` is supervised at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub env: String,
    pub workload: String,
}

impl WorkloadRef {
    pub fn new(env: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            workload: workload.into(),
        }
    }

    /// Composite key `{env}/{workload}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.env, self.workload)
    }

    /// Key of a specific record belonging to this workload.
    pub fn record(&self, id: impl Into<String>) -> RecordKey {
        RecordKey {
            env: self.env.clone(),
            workload: self.workload.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.env, self.workload)
    }
}

/// Address of a single rollout record: `(env, workload, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub env: String,
    pub workload: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(
        env: impl Into<String>,
        workload: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            env: env.into(),
            workload: workload.into(),
            id: id.into(),
        }
    }

    /// Composite key `{env}/{workload}/{id}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.env, self.workload, self.id)
    }

    /// The workload this record belongs to (and the lock it contends for).
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(self.env.clone(), self.workload.clone())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.env, self.workload, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compose() {
        let key = RecordKey::new("prod", "api", "ab12");
        assert_eq!(key.table_key(), "prod/api/ab12");
        assert_eq!(key.workload_ref().table_key(), "prod/api");
        assert_eq!(WorkloadRef::new("prod", "api").record("ab12"), key);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("service".parse::<WorkloadKind>().unwrap(), WorkloadKind::Service);
        assert_eq!("ad-hoc".parse::<WorkloadKind>().unwrap(), WorkloadKind::AdHoc);
        assert!("daemonset".parse::<WorkloadKind>().is_err());
        assert!(WorkloadKind::Job.is_run());
        assert!(!WorkloadKind::Service.is_run());
    }

    #[test]
    fn kind_serializes_like_display() {
        let json = serde_json::to_string(&WorkloadKind::AdHoc).unwrap();
        assert_eq!(json, "\"adhoc\"");
        let back: WorkloadKind = serde_json::from_str("\"ad_hoc\"").unwrap();
        assert_eq!(back, WorkloadKind::AdHoc);
    }
}
