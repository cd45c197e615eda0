//! Text filtering for raw input documents.
//!
//! The filter removes noise such as page numbers, running headers and
//! encoding residue, then splits the remaining text into segments sized for
//! the target model's context window.

mod filter;

pub use filter::{default_boilerplate_patterns, FilterConfig, NoiseFilter, TextFilter};
