// Hard limits enforced by the engine and the tenant manager.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_FACILITIES_PER_TENANT: usize = 10_000;
pub const MAX_ITEMS_PER_FACILITY: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MIN_PURPOSE_LEN: usize = 5;
pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_PROPOSAL_REF_LEN: usize = 1024;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_ATTENDEES: u32 = 100_000;
