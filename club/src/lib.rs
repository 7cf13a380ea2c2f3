//! Trailhead club - hike enrollment and attendance verification
//!
//! Two workflows built on the Trailhead reducer runtime:
//!
//! - **Enrollment**: members join or leave a hike. A capacity policy turns
//!   each join into `enrolled` or `waitlisted`.
//! - **Verification**: on the day of the hike an admin scans member badges
//!   and commits the list, turning every scanned member into `verified`.
//!
//! # Architecture
//!
//! ```text
//!  EnrollmentEngine          VerificationWorkflow ◄── CaptureSupervisor ◄── camera
//!        │                          │
//!        ▼                          ▼
//!  Store<EnrollmentReducer>   Store<VerificationReducer>
//!        │                          │
//!        └────────────┬─────────────┘
//!                     ▼
//!      Enrollment / Profile / Hike / Role repositories
//!        (InMemoryClubStore, or Postgres via trailhead-postgres)
//! ```
//!
//! Status values as stored: `enrolled`, `waitlisted`, `verified`.
//!
//! # Capacity policy
//!
//! ```text
//! enrolled_count < max_participants  →  enrolled
//! otherwise                          →  waitlisted
//! ```
//!
//! Only `enrolled` rows count. Nobody is promoted from the waitlist when a
//! spot frees up.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod config;
pub mod enrollment;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod types;
pub mod verification;

pub use access::{AccessError, ActorContext};
pub use config::Config;
pub use enrollment::{EnrollmentEngine, EnrollmentEnvironment, EnrollmentError};
pub use gateway::{
    EnrollmentRepository, GatewayError, HikeRepository, ProfileRepository, RoleRepository,
};
pub use memory::InMemoryClubStore;
pub use policy::{EnrollmentControl, HikeOverview, MemberStats};
pub use types::*;
pub use verification::{
    VerificationEnvironment, VerificationError, VerificationWorkflow,
};
