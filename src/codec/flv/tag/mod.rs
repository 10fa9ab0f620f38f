pub mod audio;
pub mod script;
pub mod video;

/// FLV tag type ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Audio = 8,
    Video = 9,
    ScriptData = 18,
}
