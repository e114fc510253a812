//! Host-side images: partition tables, rawprogram descriptions and the
//! sources payloads are streamed from.

pub mod gpt;
pub mod rawprogram;
pub mod source;

pub use {
    gpt::{Gpt, GptEntry, GptHeader},
    rawprogram::{ProgramEntry, ProgramFile, SectorStart},
    source::{FileSource, ImageSource, ReaderSource, SliceSource},
};
