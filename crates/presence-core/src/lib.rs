//! presence-core: face-verified attendance.
//!
//! A subject claims a roll number and submits a photo. The photo's face
//! encoding is compared 1:1 against that subject's stored template and, on a
//! match, the first arrival of the local day is written to the ledger as
//! `on_time` or `late`. Face extraction itself is behind [`FaceExtractor`];
//! persistence is behind the traits in [`store`].

pub mod archiver;
pub mod clock;
pub mod error;
pub mod extractor;
pub mod ledger;
pub mod matcher;
pub mod response;
pub mod service;
pub mod session;
pub mod store;
pub mod template;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AttendanceError, ErrorClass};
pub use extractor::{ExtractorError, FaceExtractor, Faces};
pub use ledger::Cutoffs;
pub use service::{AttendanceService, ServiceSettings};
pub use session::GateMode;
pub use store::{
    InsertOutcome, LedgerStore, MemoryStore, Store, StoreError, SubjectStore, TokenStore,
};
pub use types::{AttendanceRecord, AttendanceStatus, DayStatus, FaceEncoding, Subject, SubjectTags};
