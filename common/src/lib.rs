pub mod protocol;
pub mod query;
pub mod task;

pub use protocol::{NewTask, ProtocolError, WorkerMessage};
pub use query::{GroupQueryV1Message, QueryV1Message, TaskResult, BLANK_PNG, ERROR_DB, ERROR_WORKER};
pub use task::{
    merge_groups, translation_mask_key, GroupKey, SubmitRequest, SubmitResponse, Task, TaskId,
    TaskState, MAX_GROUP_KEY_LEN,
};
