pub mod hints;
pub mod schema;
pub mod vocabulary;
pub mod xdf;
pub mod xml;

// Re-export for convenience
pub use hints::{parse_hints_csv, parse_hints_json, read_hints, HintKind, HintRecord, MapHint};
pub use schema::*;
pub use vocabulary::{Vocabulary, VocabularyEntry, VocabularyFile};
pub use xdf::XdfParser;
pub use xml::{write_document, Element, ParseError, XmlParser};
