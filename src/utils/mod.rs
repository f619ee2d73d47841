//! Cross-cutting helpers.

pub mod log;
pub mod test_utils;
pub mod time;
