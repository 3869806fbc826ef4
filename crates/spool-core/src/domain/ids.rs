//! Domain identifiers (strongly-typed IDs).
//!
//! All identifiers are ULIDs wrapped in a phantom-typed `Id<T>`, so a `JobId`
//! can never be passed where a `ProcessId` is expected.
//!
//! ULIDs sort by creation time. The stores rely on this: ordering ready rows
//! by `(priority, job_id)` is ordering by priority, then age. The database
//! column type is `uuid`; `to_uuid` / `from_uuid` convert losslessly and keep
//! the byte order, so the database ordering matches the in-memory ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;
use uuid::Uuid;

/// Marker trait for each ID type.
///
/// Provides the prefix used by `Display` ("job-", "process-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type.
///
/// `T` only exists at compile time (PhantomData); the runtime size is the ULID.
#[repr(transparent)]
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

// Manual impls: derive would add `T: Clone`/`T: Ord` bounds on the marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Column representation used by the PostgreSQL store.
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from(self.ulid)
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_ulid(Ulid::from(uuid))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Process {}

impl IdMarker for Process {
    fn prefix() -> &'static str {
        "process-"
    }
}

/// Identifier of a Job (the logical unit of work).
pub type JobId = Id<Job>;

/// Identifier of a registered dispatcher/worker process.
pub type ProcessId = Id<Process>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        let job = JobId::from_ulid(Ulid::new());
        let process = ProcessId::from_ulid(Ulid::new());

        assert!(job.to_string().starts_with("job-"));
        assert!(process.to_string().starts_with("process-"));

        // let _: JobId = process; // <- does not compile
    }

    #[test]
    fn uuid_conversion_preserves_order() {
        let mut generator = ulid::Generator::new();
        let first = JobId::from_ulid(generator.generate().unwrap());
        let second = JobId::from_ulid(generator.generate().unwrap());

        assert!(first < second);
        assert!(first.to_uuid() < second.to_uuid());
        assert_eq!(JobId::from_uuid(first.to_uuid()), first);
    }

    #[test]
    fn ids_serialize_as_plain_ulid_strings() {
        let ulid = Ulid::new();
        let job_id = JobId::from_ulid(ulid);

        let serialized = serde_json::to_string(&job_id).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));

        let deserialized: JobId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(job_id, deserialized);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<ProcessId>(), 16);
    }
}
