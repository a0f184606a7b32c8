pub mod audit_event;
pub mod deletion;
pub mod device_code;
pub mod household;
pub mod refresh_token;
pub mod subject;

pub use audit_event::{AuditEvent, AuditEventType, RequestOrigin};
pub use deletion::{
    DeletionSchedule, OwnershipTransfer, PurgeOutcome, PurgePlan, PurgeStep, ScheduleOutcome,
};
pub use device_code::{DeviceCode, DeviceCodeStatus};
pub use household::{Household, HouseholdInvite, HouseholdMember, HouseholdRole, HouseholdSnapshot};
pub use refresh_token::{DeviceMetadata, RefreshToken};
pub use subject::{IdentityLink, Subject, SubjectStatus, VerifiedIdentity};
