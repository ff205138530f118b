pub mod events;
pub mod frame_aligner;
pub mod frame_queue;
pub mod infrastructure;
pub mod pipeline_logger;
pub mod session_config;
pub mod session_result;
pub mod session_state;
pub mod streaming_controller;
pub mod vitals_pipeline;
