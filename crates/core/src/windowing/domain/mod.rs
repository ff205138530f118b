pub mod region_cropper;
pub mod window;
pub mod window_buffer;
