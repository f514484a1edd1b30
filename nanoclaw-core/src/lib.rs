pub mod config;
pub mod container;
pub mod ipc;
pub mod mount;
pub mod runtime;
pub mod store;

pub use config::{NanoclawConfig, OrchestratorConfig, SchedulerConfig, load_config};
pub use container::{
    ContainerInput, ContainerOutput, ContainerStatus, VolumeMount, OUTPUT_END_MARKER,
    OUTPUT_START_MARKER, container_image, extract_output_markers, runner_container_path,
    runner_dir_name, strip_internal_blocks,
};
pub use ipc::{IpcGroupContext, IpcMessage, IpcQuery, IpcQueryResponse, IpcTask};
pub use mount::{
    AdditionalMount, AllowedRoot, MountAllowlist, MountError, SandboxConfig, ValidatedMount,
    default_allowlist_path, load_allowlist, validate_additional_mounts, validate_mount,
};
pub use runtime::{RuntimeKind, SandboxKind};
pub use store::{
    ChatInfo, ConversationMessage, NewMessage, RegisteredGroup, ScheduledTask, Store, StoreError,
    TaskRunLog, TaskUpdate,
};
