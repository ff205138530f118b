pub mod channel_frame_source;
pub mod decoded_frame_source;
pub mod ffmpeg_decoder;
