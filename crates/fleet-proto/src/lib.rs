// Protobuf messages for the coordinator RPC surface.
//
// The messages are derived directly with `prost` so every crate depends on a
// single Rust type source without a protoc step at build time. Field tags are
// part of the wire contract with the coordinator: never renumber them.

pub mod fleet {
    pub mod coordinator {
        pub mod v1 {
            use std::collections::HashMap;

            /// Static facts about the host, sent once per registration.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct SystemInfo {
                #[prost(string, tag = "1")]
                pub hostname: String,
                #[prost(string, tag = "2")]
                pub os: String,
                #[prost(string, tag = "3")]
                pub arch: String,
                #[prost(string, tag = "4")]
                pub kernel_version: String,
                #[prost(uint32, tag = "5")]
                pub cpu_cores: u32,
                #[prost(uint64, tag = "6")]
                pub total_memory_bytes: u64,
                #[prost(uint64, tag = "7")]
                pub total_disk_bytes: u64,
            }

            /// Coordinator-issued runtime overrides. Zero means "leave unchanged".
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct RuntimeConfig {
                #[prost(uint32, tag = "1")]
                pub heartbeat_interval_secs: u32,
                #[prost(uint32, tag = "2")]
                pub monitor_interval_secs: u32,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct RegisterRequest {
                #[prost(string, tag = "1")]
                pub node_name: String,
                /// Previously assigned id, empty on first registration.
                #[prost(string, tag = "2")]
                pub agent_id: String,
                #[prost(string, tag = "3")]
                pub agent_version: String,
                #[prost(message, optional, tag = "4")]
                pub system_info: Option<SystemInfo>,
                #[prost(map = "string, string", tag = "5")]
                pub labels: HashMap<String, String>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct RegisterResponse {
                #[prost(bool, tag = "1")]
                pub accepted: bool,
                #[prost(string, tag = "2")]
                pub agent_id: String,
                #[prost(string, tag = "3")]
                pub message: String,
                #[prost(message, optional, tag = "4")]
                pub runtime_config: Option<RuntimeConfig>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ResourceUsage {
                #[prost(double, tag = "1")]
                pub cpu_percent: f64,
                #[prost(double, tag = "2")]
                pub memory_percent: f64,
                #[prost(double, tag = "3")]
                pub disk_percent: f64,
                #[prost(double, tag = "4")]
                pub load_average_1m: f64,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ProcessStatus {
                #[prost(string, tag = "1")]
                pub name: String,
                #[prost(uint32, tag = "2")]
                pub pid: u32,
                #[prost(string, tag = "3")]
                pub status: String,
                #[prost(double, tag = "4")]
                pub cpu_percent: f64,
                #[prost(uint64, tag = "5")]
                pub memory_bytes: u64,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct HeartbeatRequest {
                #[prost(string, tag = "1")]
                pub agent_id: String,
                #[prost(int64, tag = "2")]
                pub timestamp_unix_ms: i64,
                #[prost(message, optional, tag = "3")]
                pub usage: Option<ResourceUsage>,
                #[prost(message, repeated, tag = "4")]
                pub processes: Vec<ProcessStatus>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct HeartbeatResponse {
                #[prost(bool, tag = "1")]
                pub ok: bool,
            }

            /// Pushed by the coordinator over the command stream.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Command {
                #[prost(string, tag = "1")]
                pub command_id: String,
                #[prost(string, tag = "2")]
                pub command_type: String,
                #[prost(map = "string, string", tag = "3")]
                pub parameters: HashMap<String, String>,
            }

            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
            #[repr(i32)]
            pub enum CommandStatus {
                Unspecified = 0,
                InProgress = 1,
                Completed = 2,
                Failed = 3,
            }

            impl CommandStatus {
                pub fn as_str_name(&self) -> &'static str {
                    match self {
                        CommandStatus::Unspecified => "unspecified",
                        CommandStatus::InProgress => "in_progress",
                        CommandStatus::Completed => "completed",
                        CommandStatus::Failed => "failed",
                    }
                }

                pub fn is_terminal(&self) -> bool {
                    matches!(self, CommandStatus::Completed | CommandStatus::Failed)
                }
            }

            /// Sent by the agent over the command stream: zero or more
            /// `InProgress` updates, then exactly one terminal update.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct CommandUpdate {
                #[prost(string, tag = "1")]
                pub command_id: String,
                #[prost(enumeration = "CommandStatus", tag = "2")]
                pub status: i32,
                #[prost(uint32, tag = "3")]
                pub progress: u32,
                #[prost(string, tag = "4")]
                pub message: String,
                #[prost(string, tag = "5")]
                pub output: String,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ProcessEventReport {
                #[prost(string, tag = "1")]
                pub agent_id: String,
                #[prost(string, tag = "2")]
                pub event_id: String,
                #[prost(string, tag = "3")]
                pub event_type: String,
                #[prost(uint32, tag = "4")]
                pub pid: u32,
                #[prost(string, tag = "5")]
                pub process_name: String,
                #[prost(string, tag = "6")]
                pub install_dir: String,
                #[prost(string, tag = "7")]
                pub role: String,
                #[prost(int64, tag = "8")]
                pub timestamp_unix_ms: i64,
                #[prost(map = "string, string", tag = "9")]
                pub details: HashMap<String, String>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ReportProcessEventResponse {
                #[prost(bool, tag = "1")]
                pub ok: bool,
            }

            pub mod methods {
                pub const REGISTER: &str = "/fleet.coordinator.v1.Coordinator/Register";
                pub const HEARTBEAT: &str = "/fleet.coordinator.v1.Coordinator/Heartbeat";
                pub const REPORT_PROCESS_EVENT: &str =
                    "/fleet.coordinator.v1.Coordinator/ReportProcessEvent";
            }
        }
    }
}

pub use fleet::coordinator::v1 as coordinator_v1;

/// Maps a wire status code back to a `tonic::Code`.
pub fn code_from_i32(v: i32) -> tonic::Code {
    match v {
        0 => tonic::Code::Ok,
        1 => tonic::Code::Cancelled,
        2 => tonic::Code::Unknown,
        3 => tonic::Code::InvalidArgument,
        4 => tonic::Code::DeadlineExceeded,
        5 => tonic::Code::NotFound,
        6 => tonic::Code::AlreadyExists,
        7 => tonic::Code::PermissionDenied,
        8 => tonic::Code::ResourceExhausted,
        9 => tonic::Code::FailedPrecondition,
        10 => tonic::Code::Aborted,
        11 => tonic::Code::OutOfRange,
        12 => tonic::Code::Unimplemented,
        13 => tonic::Code::Internal,
        14 => tonic::Code::Unavailable,
        15 => tonic::Code::DataLoss,
        16 => tonic::Code::Unauthenticated,
        _ => tonic::Code::Unknown,
    }
}
