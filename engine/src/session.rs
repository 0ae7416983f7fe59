//! Build sessions
//!
//! A session is created at the start of every build and names the
//! resources that build owns. Names are seeded with a random UUID so
//! concurrent sessions never collide.

use sdk::errors::ValidationError;
use sdk::manifest::{is_dns_label, MAX_LABEL_LENGTH};
use uuid::Uuid;

/// Prefix of build context object names
pub const CONTEXT_PREFIX: &str = "cm";

/// Prefix of build job names
pub const JOB_PREFIX: &str = "build";

/// Length of a hyphenated UUID
const UUID_LENGTH: usize = 36;

/// Longest caller id that still yields a valid job name
pub const MAX_CALLER_ID_LENGTH: usize = MAX_LABEL_LENGTH - JOB_PREFIX.len() - UUID_LENGTH - 2;

/// `<prefix>-[<caller>-]`
pub fn name_prefix(prefix: &str, caller_id: &str) -> String {
    if caller_id.is_empty() {
        format!("{}-", prefix)
    } else {
        format!("{}-{}-", prefix, caller_id)
    }
}

/// `<prefix>-[<caller>-]<suffix>`
pub fn scoped_name(prefix: &str, caller_id: &str, suffix: &str) -> String {
    format!("{}{}", name_prefix(prefix, caller_id), suffix)
}

/// Prefix shared by every job a caller submits
pub fn job_name_prefix(caller_id: &str) -> String {
    name_prefix(JOB_PREFIX, caller_id)
}

/// Check that a caller id can be embedded in resource names
///
/// The empty id is accepted and yields unscoped names.
pub fn validate_caller_id(caller_id: &str) -> Result<(), ValidationError> {
    if caller_id.is_empty() {
        return Ok(());
    }
    if caller_id.len() > MAX_CALLER_ID_LENGTH || !is_dns_label(caller_id) {
        return Err(ValidationError::InvalidCallerId(caller_id.to_string()));
    }
    Ok(())
}

/// Resources owned by one build invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSession {
    pub id: Uuid,
    pub caller_id: String,
    /// `cm-[caller-]<id>`
    pub context_name: String,
    /// `build-[caller-]<id>`
    pub job_name: String,
    /// Build without pushing
    pub demo_mode: bool,
}

impl BuildSession {
    /// Start a session with a fresh random id
    pub fn new(caller_id: &str, demo_mode: bool) -> Result<Self, ValidationError> {
        Self::with_id(caller_id, Uuid::new_v4(), demo_mode)
    }

    pub fn with_id(caller_id: &str, id: Uuid, demo_mode: bool) -> Result<Self, ValidationError> {
        validate_caller_id(caller_id)?;

        let suffix = id.to_string();
        Ok(Self {
            id,
            caller_id: caller_id.to_string(),
            context_name: scoped_name(CONTEXT_PREFIX, caller_id, &suffix),
            job_name: scoped_name(JOB_PREFIX, caller_id, &suffix),
            demo_mode,
        })
    }
}
