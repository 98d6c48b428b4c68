//! Verdict parsing: heading-delimited sections into [`ComplianceResult`]s.
//!
//! [`ComplianceResult`]: crate::types::ComplianceResult

mod grade;
mod parser;

pub use grade::{parse_grade, GradeReport};
pub use parser::{ParserState, Section, VerdictParser};
