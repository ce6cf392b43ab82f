mod commands;
mod queries;
mod types;

pub(crate) use commands::{
    claim_batch, defer, insert_if_absent, mark_done, record_failure, recover_stale,
};
pub(crate) use queries::{count_by_status, find_by_id, ping};
pub(crate) use types::{ClaimRef, CompletionUpdate, CreateGradingJob};
