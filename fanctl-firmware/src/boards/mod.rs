//! Supported boards.

include!(concat!(env!("OUT_DIR"), "/board_mods.rs"));
