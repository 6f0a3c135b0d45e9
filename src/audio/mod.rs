//! Audio frame handling for Samtale.

pub(crate) mod wav;

pub use wav::{merge_frames, rms_level, validate_frame, WavInfo};
