//! Attendance verification: admins scan member badges at the trailhead
//! and commit the list as `verified` enrollments in one apply.

pub mod capture;
mod reducer;
mod session;
pub mod token;
mod workflow;

pub use capture::{CaptureDevice, CaptureError, CaptureEvent, CaptureSupervisor, Frame, ManualCamera};
pub use reducer::{
    ApplyRejection, RestartReason, ScanLookup, VerificationAction, VerificationEnvironment,
    VerificationReducer, VerificationState,
};
pub use session::{
    PendingScan, ScanSession, ScanSignal, ScannedParticipant, SessionCounts, SessionPhase,
    SessionSummary,
};
pub use token::{read_badge, Badge};
pub use workflow::{ApplyReport, VerificationError, VerificationWorkflow};
