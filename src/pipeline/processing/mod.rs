// Pipeline processing: anonymization, parsing, extraction, evaluation and aggregation,
// plus reference range harvesting

pub mod aggregate;
pub mod anonymize;
pub mod extract;
pub mod harvest;
pub mod normalize;
pub mod patient;
pub mod reference;
