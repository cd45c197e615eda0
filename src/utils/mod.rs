//! Shared utility functions for qa-forge.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_from_code_block, extract_json_array,
    extract_last_valid_array, find_matching_close, strip_reasoning, JsonExtractionError,
    JsonStructureAnalysis,
};
