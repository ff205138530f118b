pub mod decode_options;
pub mod frame_source;
pub mod frame_transform;
pub mod video_decoder;
